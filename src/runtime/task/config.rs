use serde::{Deserialize, Serialize};

use super::error::{Result, TaskletError};

pub const STACK_SIZE_ENV: &str = "TASKLETS_STACK_SIZE";
pub const DIAGNOSTICS_ENV: &str = "TASKLETS_DIAGNOSTICS";

const DEFAULT_STACK_SIZE: usize = 1024 * 1024;
const MIN_STACK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Bytes reserved for each tasklet's coroutine stack.
    pub stack_size: usize,
    /// Print a metrics report when the process exits.
    pub diagnostics: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            diagnostics: false,
        }
    }
}

impl SchedulerConfig {
    /// Defaults overridden by `TASKLETS_STACK_SIZE` and `TASKLETS_DIAGNOSTICS`.
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(size) = std::env::var(STACK_SIZE_ENV)
            .ok()
            .and_then(|raw| raw.trim().parse::<usize>().ok())
        {
            config.stack_size = size;
        }
        if let Ok(raw) = std::env::var(DIAGNOSTICS_ENV) {
            config.diagnostics = parse_flag(&raw);
        }
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(TaskletError::argument(format!(
                "stack_size must be at least {MIN_STACK_SIZE} bytes, got {}",
                self.stack_size
            )));
        }
        Ok(())
    }

    #[cfg(feature = "toml-config")]
    pub fn from_toml_str(source: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "toml-config")]
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scheduler config {}", path.display()))?;
        Self::from_toml_str(&source)
            .with_context(|| format!("invalid scheduler config {}", path.display()))
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.diagnostics);
    }

    #[test]
    fn tiny_stacks_are_rejected() {
        let config = SchedulerConfig {
            stack_size: 512,
            ..SchedulerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stack_size"));
    }

    #[test]
    fn flags_accept_common_spellings() {
        assert!(parse_flag("1"));
        assert!(parse_flag(" TRUE "));
        assert!(parse_flag("on"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("nope"));
    }

    #[cfg(feature = "toml-config")]
    #[test]
    fn loads_partial_toml_files() -> anyhow::Result<()> {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "stack_size = 65536")?;
        let config = SchedulerConfig::load(file.path())?;
        assert_eq!(config.stack_size, 65536);
        assert!(!config.diagnostics);

        assert!(SchedulerConfig::from_toml_str("stack_size = 1").is_err());
        Ok(())
    }
}
