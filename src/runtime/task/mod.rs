//! Cooperative tasklet runtime.
//!
//! Provides per-thread schedulers, tasklets running on their own coroutine
//! stacks, rendezvous channels, and process-wide metrics.

mod channel;
mod config;
mod error;
mod metrics;
mod queue;
mod registry;
mod scheduler;
mod tasklet;
mod value;

pub use channel::Channel;
pub use config::{DIAGNOSTICS_ENV, STACK_SIZE_ENV, SchedulerConfig};
pub use error::{ErrorKind, ExitSignal, Result, TaskletError};
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
pub use registry::{ThreadId, os_thread_id};
pub use scheduler::{
    RunOptions, current_thread_id, getcurrent, getcurrentid, getmain, getruncount, run, run_all,
    schedule, schedule_remove, schedule_remove_with, schedule_with,
};
pub use tasklet::{AtomicGuard, Tasklet, TaskletFn, TaskletId};
pub use value::{Args, Value};

use std::sync::{Arc, Once};

use parking_lot::RwLock;

#[derive(Debug)]
pub struct TaskletRuntime {
    config: RwLock<SchedulerConfig>,
    metrics: Arc<SchedulerMetrics>,
}

impl TaskletRuntime {
    fn new() -> Self {
        register_exit_hook();
        Self {
            config: RwLock::new(SchedulerConfig::from_env()),
            metrics: SchedulerMetrics::new(),
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        *self.config.read()
    }

    /// Replaces the configuration. Tasklets started afterwards use it.
    pub fn configure(&self, config: SchedulerConfig) -> Result<()> {
        config.validate()?;
        *self.config.write() = config;
        Ok(())
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        Arc::clone(&self.metrics)
    }
}

static RUNTIME: once_cell::sync::Lazy<TaskletRuntime> =
    once_cell::sync::Lazy::new(TaskletRuntime::new);

pub fn runtime() -> &'static TaskletRuntime {
    &RUNTIME
}

/// Installs `config` and returns the runtime.
pub fn init_runtime(config: SchedulerConfig) -> Result<&'static TaskletRuntime> {
    let runtime = runtime();
    runtime.configure(config)?;
    Ok(runtime)
}

/// Main and current tasklet of a thread together with its run count.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub main: Tasklet,
    pub current: Tasklet,
    pub runcount: usize,
}

/// Looks up a thread's scheduler. The calling thread is attached on demand;
/// any other thread is only known once it has touched the runtime itself.
pub fn get_thread_info(thread: ThreadId) -> Result<ThreadInfo> {
    if thread == os_thread_id() {
        current_thread_id();
    }
    let core = registry::registry()
        .lookup(thread)
        .ok_or_else(|| TaskletError::argument(format!("unknown thread id {thread}")))?;
    Ok(ThreadInfo {
        main: core.main().clone(),
        current: core.current(),
        runcount: core.runcount(),
    })
}

/// Threads known to the runtime. On Linux the process's initial thread is
/// always first.
pub fn threads() -> Vec<ThreadId> {
    registry::registry().threads()
}

/// Makes the current tasklet atomic until the guard is dropped.
pub fn atomic() -> AtomicGuard {
    AtomicGuard::new(getcurrent())
}

pub fn emit_metrics_report() {
    if !runtime().config().diagnostics {
        return;
    }
    let snapshot = runtime().metrics().snapshot();
    eprintln!(
        "[tasklets] created={}, finished={}, killed={}, failed={}, live={}, switches={}, channels={}, transfers={}, blocked={}",
        snapshot.tasklets_created,
        snapshot.tasklets_finished,
        snapshot.tasklets_killed,
        snapshot.tasklets_failed,
        snapshot.tasklets_live,
        snapshot.switches,
        snapshot.channels_created,
        snapshot.channel_transfers,
        snapshot.tasklets_blocked
    );
}

fn register_exit_hook() {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| {
        extern "C" fn at_exit() {
            emit_metrics_report();
        }

        // SAFETY: `at_exit` only reads process-wide statics that outlive main.
        unsafe {
            libc::atexit(at_exit);
        }
    });
}
