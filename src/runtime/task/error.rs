use std::borrow::Cow;
use std::fmt;

use thiserror::Error;

pub type Result<T, E = TaskletError> = std::result::Result<T, E>;

/// Cooperative shutdown requests delivered to a tasklet.
///
/// `TaskletExit` is the signal sent by [`Tasklet::kill`](super::Tasklet::kill).
/// Both variants count as system exits; only `TaskletExit` ends its tasklet
/// silently when it escapes the tasklet body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitSignal {
    TaskletExit,
    SystemExit(i32),
}

impl fmt::Display for ExitSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskletExit => f.write_str("tasklet exit"),
            Self::SystemExit(code) => write!(f, "system exit ({code})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The operation is invalid for the target's lifecycle state.
    State,
    /// A field or parameter was given a value it cannot hold.
    Argument,
    ChannelClosed,
    Exit,
    StopIteration,
    /// An application error raised by a tasklet body or injected by a caller.
    Application,
}

#[derive(Debug, Error)]
pub enum TaskletError {
    #[error("invalid operation: {0}")]
    InvalidState(Cow<'static, str>),
    #[error("invalid argument: {0}")]
    InvalidArgument(Cow<'static, str>),
    #[error("channel is closed")]
    ChannelClosed,
    #[error("deadlock: the last runnable tasklet cannot block")]
    Deadlock,
    #[error("{0}")]
    Exit(ExitSignal),
    #[error("stop iteration")]
    StopIteration,
    #[error(transparent)]
    Raised(#[from] anyhow::Error),
}

impl TaskletError {
    pub fn state(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn argument(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn tasklet_exit() -> Self {
        Self::Exit(ExitSignal::TaskletExit)
    }

    pub fn system_exit(code: i32) -> Self {
        Self::Exit(ExitSignal::SystemExit(code))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidState(_) | Self::Deadlock => ErrorKind::State,
            Self::InvalidArgument(_) => ErrorKind::Argument,
            Self::ChannelClosed => ErrorKind::ChannelClosed,
            Self::Exit(_) => ErrorKind::Exit,
            Self::StopIteration => ErrorKind::StopIteration,
            Self::Raised(_) => ErrorKind::Application,
        }
    }

    pub fn is_system_exit(&self) -> bool {
        matches!(self, Self::Exit(_))
    }

    pub fn is_tasklet_exit(&self) -> bool {
        matches!(self, Self::Exit(ExitSignal::TaskletExit))
    }

    /// Returns the application error if this is one of type `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        match self {
            Self::Raised(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn tasklet_exit_is_a_system_exit() {
        let exit = TaskletError::tasklet_exit();
        assert!(exit.is_system_exit());
        assert!(exit.is_tasklet_exit());

        let system = TaskletError::system_exit(3);
        assert!(system.is_system_exit());
        assert!(!system.is_tasklet_exit());
        assert_eq!(system.to_string(), "system exit (3)");
    }

    #[test]
    fn kinds_are_distinguishable() {
        assert_eq!(TaskletError::state("x").kind(), ErrorKind::State);
        assert_eq!(TaskletError::Deadlock.kind(), ErrorKind::State);
        assert_eq!(TaskletError::argument("x").kind(), ErrorKind::Argument);
        assert_eq!(TaskletError::ChannelClosed.kind(), ErrorKind::ChannelClosed);
        assert_eq!(
            TaskletError::from(anyhow::anyhow!("app")).kind(),
            ErrorKind::Application
        );
    }

    #[test]
    fn raised_errors_downcast_to_their_source() {
        let err = TaskletError::from(anyhow::Error::new(Boom));
        assert!(err.downcast_ref::<Boom>().is_some());
        assert_eq!(err.to_string(), "boom");
        assert!(TaskletError::StopIteration.downcast_ref::<Boom>().is_none());
    }
}
