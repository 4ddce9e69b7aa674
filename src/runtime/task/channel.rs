use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use super::error::{Result, TaskletError};
use super::queue::RingQueue;
use super::runtime;
use super::scheduler::{self, local_core};
use super::tasklet::{Slot, Tasklet, TaskletId};
use super::value::{Payload, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Send,
    Receive,
}

impl Direction {
    fn sign(self) -> i64 {
        match self {
            Self::Send => 1,
            Self::Receive => -1,
        }
    }
}

pub(crate) struct ChannelState {
    pub(crate) waiters: RingQueue<TaskletId, Tasklet>,
    direction: Direction,
    preference: i64,
    schedule_all: bool,
    closing: bool,
}

pub(crate) struct ChannelCore {
    state: Mutex<ChannelState>,
}

impl ChannelCore {
    pub(crate) fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock()
    }
}

/// Rendezvous point between a sending and a receiving tasklet.
///
/// A transfer only happens when both sides are present: whoever arrives first
/// blocks on the channel until a partner shows up. `preference` decides who
/// keeps running once the pair meets. The default, -1, lets the receiver run
/// first. 1 favours the sender and 0 lets the caller keep running.
#[derive(Clone)]
pub struct Channel {
    core: Arc<ChannelCore>,
}

impl Channel {
    pub fn new() -> Self {
        runtime().metrics().register_channel();
        Self {
            core: Arc::new(ChannelCore {
                state: Mutex::new(ChannelState {
                    waiters: RingQueue::new(),
                    direction: Direction::Send,
                    preference: -1,
                    schedule_all: false,
                    closing: false,
                }),
            }),
        }
    }

    /// Positive while senders wait, negative while receivers wait.
    pub fn balance(&self) -> i64 {
        let state = self.core.lock();
        state.waiters.len() as i64 * state.direction.sign()
    }

    /// First tasklet waiting on the channel.
    pub fn queue(&self) -> Option<Tasklet> {
        self.core.lock().waiters.head().cloned()
    }

    pub fn closing(&self) -> bool {
        self.core.lock().closing
    }

    /// Closing and drained.
    pub fn closed(&self) -> bool {
        let state = self.core.lock();
        state.closing && state.waiters.is_empty()
    }

    pub fn preference(&self) -> i64 {
        self.core.lock().preference
    }

    /// Accepts any integer (or bool) and clamps it to -1..=1.
    pub fn set_preference<V: TryInto<i64>>(&self, value: V) -> Result<()> {
        let value = value
            .try_into()
            .map_err(|_| TaskletError::argument("preference must be set to an integer"))?;
        self.core.lock().preference = value.clamp(-1, 1);
        Ok(())
    }

    pub fn schedule_all(&self) -> bool {
        self.core.lock().schedule_all
    }

    pub fn set_schedule_all<V: TryInto<i64>>(&self, value: V) -> Result<()> {
        let value = value.try_into().map_err(|_| {
            TaskletError::argument("schedule_all must be set to a bool or integer")
        })?;
        self.core.lock().schedule_all = value != 0;
        Ok(())
    }

    /// Refuse new blocking operations. Waiters already queued are untouched.
    pub fn close(&self) {
        self.core.lock().closing = true;
    }

    pub fn open(&self) {
        self.core.lock().closing = false;
    }

    pub fn send<T: Any + Send + Sync>(&self, value: T) -> Result<()> {
        self.send_value(Value::new(value))
    }

    pub fn send_value(&self, value: Value) -> Result<()> {
        self.action(Direction::Send, Some(Payload::Value(value)))
            .map(|_| ())
    }

    /// Sends an error that the receiver gets instead of a value.
    pub fn send_exception(&self, error: impl Into<TaskletError>) -> Result<()> {
        self.action(Direction::Send, Some(Payload::Error(error.into())))
            .map(|_| ())
    }

    pub fn send_throw(&self, error: anyhow::Error) -> Result<()> {
        self.send_exception(TaskletError::Raised(error))
    }

    /// Sends every item in order and returns how many were sent.
    pub fn send_sequence<I>(&self, values: I) -> Result<usize>
    where
        I: IntoIterator,
        I::Item: Any + Send + Sync,
    {
        let mut count = 0;
        for value in values {
            self.send(value)?;
            count += 1;
        }
        Ok(count)
    }

    pub fn receive(&self) -> Result<Value> {
        match self.action(Direction::Receive, None)? {
            Some(payload) => payload.into_result(),
            None => Ok(Value::unit()),
        }
    }

    /// One half of a rendezvous. Senders pass their payload in `outgoing`;
    /// receivers get the sender's payload back.
    fn action(
        &self,
        direction: Direction,
        outgoing: Option<Payload>,
    ) -> Result<Option<Payload>> {
        let core = local_core();
        let me = core.current();
        let mut state = self.core.lock();

        if state.direction != direction {
            if let Some(peer) = state.waiters.pop_front() {
                let incoming = peer.unpark(outgoing);
                let preference = state.preference;
                let schedule_all = state.schedule_all;
                drop(state);

                runtime().metrics().record_transfer();
                trace!(from = %me.id(), to = %peer.id(), ?direction, "channel hand-off");

                let local = peer
                    .owner()
                    .is_ok_and(|owner| Arc::ptr_eq(&owner, &core));
                if !local {
                    peer.reschedule(Slot::Tail)?;
                } else if schedule_all {
                    peer.reschedule(Slot::Tail)?;
                    let next = {
                        let mut sched = core.lock();
                        if sched.run_queue.head_key() == Some(me.id()) {
                            sched.run_queue.rotate();
                        }
                        sched.run_queue.head().cloned()
                    };
                    scheduler::switch_to(next)?;
                } else if preference == -direction.sign() {
                    peer.reschedule(Slot::Front)?;
                    scheduler::switch_to(Some(peer))?;
                } else {
                    peer.reschedule(Slot::Tail)?;
                }
                return Ok(incoming);
            }
        }

        if state.closing {
            return Err(TaskletError::ChannelClosed);
        }
        if me.is_main() && core.would_deadlock(&me) {
            return Err(TaskletError::Deadlock);
        }
        me.park(&self.core, outgoing)?;
        state.waiters.push_back(me.id(), me.clone());
        state.direction = direction;
        drop(state);

        trace!(tasklet = %me.id(), ?direction, "blocked on channel");
        let resumed = scheduler::switch_to(None)?;
        Ok(resumed.map(Payload::Value))
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.lock();
        f.debug_struct("Channel")
            .field("balance", &(state.waiters.len() as i64 * state.direction.sign()))
            .field("preference", &state.preference)
            .field("schedule_all", &state.schedule_all)
            .field("closing", &state.closing)
            .finish()
    }
}

/// Receives until the channel delivers `StopIteration` or is closed and
/// drained. Other errors are yielded as items.
impl Iterator for Channel {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed() {
            return None;
        }
        match self.receive() {
            Err(TaskletError::StopIteration | TaskletError::ChannelClosed) => None,
            other => Some(other),
        }
    }
}
