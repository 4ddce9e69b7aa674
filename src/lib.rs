//! Cooperative tasklets and rendezvous channels.
//!
//! Each OS thread gets its own scheduler with a main tasklet standing for the
//! thread's stack. Tasklets run on their own coroutine stacks and only switch
//! at explicit points: `schedule`, blocking channel operations, and
//! `run`/`switch`/`kill` aimed at another tasklet.
//!
//! ```no_run
//! use tasklets::{Channel, Tasklet};
//!
//! let channel = Channel::new();
//! let tx = channel.clone();
//! Tasklet::spawn(move |_| tx.send(42_i64))?;
//! let value = channel.receive()?;
//! assert_eq!(value.get::<i64>(), Some(42));
//! # Ok::<(), tasklets::TaskletError>(())
//! ```

pub mod cli;
pub mod runtime;
pub mod utils;
pub mod version;

pub use runtime::task::{
    Args, AtomicGuard, Channel, ErrorKind, ExitSignal, MetricsSnapshot, Result, RunOptions,
    SchedulerConfig, Tasklet, TaskletError, TaskletId, ThreadId, ThreadInfo, Value, atomic,
    current_thread_id, get_thread_info, getcurrent, getcurrentid, getmain, getruncount,
    init_runtime, os_thread_id, run, run_all, runtime as tasklet_runtime, schedule, schedule_remove,
    schedule_remove_with, schedule_with, threads,
};
