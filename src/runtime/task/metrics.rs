use std::cmp::max;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    created: AtomicU64,
    finished: AtomicU64,
    killed: AtomicU64,
    failed: AtomicU64,
    live: AtomicI64,
    switches: AtomicU64,
    channels: AtomicU64,
    transfers: AtomicU64,
    blocked: AtomicI64,
}

impl SchedulerMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_spawn(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self) {
        self.finished.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_kill(&self) {
        self.killed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_switch(&self) {
        self.switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn register_channel(&self) {
        self.channels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transfer(&self) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked_delta(&self, delta: i64) {
        if delta != 0 {
            self.blocked.fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasklets_created: self.created.load(Ordering::Relaxed),
            tasklets_finished: self.finished.load(Ordering::Relaxed),
            tasklets_killed: self.killed.load(Ordering::Relaxed),
            tasklets_failed: self.failed.load(Ordering::Relaxed),
            tasklets_live: max(self.live.load(Ordering::Relaxed), 0) as u64,
            switches: self.switches.load(Ordering::Relaxed),
            channels_created: self.channels.load(Ordering::Relaxed),
            channel_transfers: self.transfers.load(Ordering::Relaxed),
            tasklets_blocked: max(self.blocked.load(Ordering::Relaxed), 0) as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub tasklets_created: u64,
    pub tasklets_finished: u64,
    pub tasklets_killed: u64,
    pub tasklets_failed: u64,
    pub tasklets_live: u64,
    pub switches: u64,
    pub channels_created: u64,
    pub channel_transfers: u64,
    pub tasklets_blocked: u64,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| String::from("{}"))
    }
}
