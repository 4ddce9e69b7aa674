//! Process-wide table of per-thread schedulers.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::Serialize;

use super::scheduler::SchedulerCore;

/// Operating-system identifier of a thread that owns a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ThreadId(u64);

impl ThreadId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Identifier of the calling OS thread.
#[cfg(target_os = "linux")]
pub fn os_thread_id() -> ThreadId {
    // SAFETY: gettid has no preconditions and cannot fail.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    ThreadId::new(tid as u64)
}

#[cfg(not(target_os = "linux"))]
pub fn os_thread_id() -> ThreadId {
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    }
    ThreadId::new(THREAD_ID.with(|id| *id))
}

/// On Linux the initial thread's tid equals the process id.
#[cfg(target_os = "linux")]
fn process_main_thread() -> Option<ThreadId> {
    // SAFETY: getpid has no preconditions and cannot fail.
    let pid = unsafe { libc::getpid() };
    Some(ThreadId::new(pid as u64))
}

#[cfg(not(target_os = "linux"))]
fn process_main_thread() -> Option<ThreadId> {
    None
}

struct Entry {
    core: Arc<SchedulerCore>,
    /// False for the pre-registered process main thread until it touches the runtime.
    attached: bool,
}

pub(crate) struct ThreadRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl ThreadRegistry {
    fn new() -> Self {
        let entries = process_main_thread()
            .map(|thread| Entry {
                core: SchedulerCore::new(thread),
                attached: false,
            })
            .into_iter()
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub(crate) fn attach(&self, thread: ThreadId) -> Arc<SchedulerCore> {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.iter_mut().find(|entry| entry.core.thread() == thread) {
            entry.attached = true;
            return Arc::clone(&entry.core);
        }
        let core = SchedulerCore::new(thread);
        entries.push(Entry {
            core: Arc::clone(&core),
            attached: true,
        });
        core
    }

    pub(crate) fn detach(&self, thread: ThreadId) {
        self.entries
            .write()
            .retain(|entry| entry.core.thread() != thread);
    }

    pub(crate) fn lookup(&self, thread: ThreadId) -> Option<Arc<SchedulerCore>> {
        self.entries
            .read()
            .iter()
            .find(|entry| entry.core.thread() == thread)
            .map(|entry| Arc::clone(&entry.core))
    }

    pub(crate) fn threads(&self) -> Vec<ThreadId> {
        self.entries
            .read()
            .iter()
            .map(|entry| entry.core.thread())
            .collect()
    }

    /// Threads that are actively running a scheduler.
    pub(crate) fn attached_count(&self) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|entry| entry.attached)
            .count()
    }
}

static REGISTRY: Lazy<ThreadRegistry> = Lazy::new(ThreadRegistry::new);

pub(crate) fn registry() -> &'static ThreadRegistry {
    &REGISTRY
}
