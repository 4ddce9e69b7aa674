use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use super::channel::ChannelCore;
use super::error::{Result, TaskletError};
use super::registry::{ThreadId, registry};
use super::runtime;
use super::scheduler::{self, SchedulerCore, SchedulerState};
use super::value::{Args, Payload, Value};

/// Unique identifier assigned to each tasklet at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskletId(u64);

impl TaskletId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

static NEXT_TASKLET_ID: AtomicU64 = AtomicU64::new(1);

fn next_tasklet_id() -> TaskletId {
    TaskletId::new(NEXT_TASKLET_ID.fetch_add(1, Ordering::Relaxed))
}

pub type TaskletFn = Box<dyn FnOnce(Args) -> Result<()> + Send + 'static>;

/// Where an alive tasklet currently sits.
pub(crate) enum Placement {
    Detached,
    Scheduled,
    Blocked(Arc<ChannelCore>),
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Slot {
    /// Just before the run-queue head, i.e. last in line.
    Tail,
    /// At the run-queue head, i.e. next to run.
    Front,
}

pub(crate) struct TaskletState {
    owner: Weak<SchedulerCore>,
    thread: ThreadId,
    func: Option<TaskletFn>,
    args: Option<Args>,
    alive: bool,
    /// Set once the body runs on a coroutine; from then on the tasklet is pinned.
    started: bool,
    placement: Placement,
    tempval: Option<Payload>,
    pending: Option<TaskletError>,
    atomic: bool,
    nesting_level: u32,
}

struct TaskletInner {
    id: TaskletId,
    is_main: bool,
    state: Mutex<TaskletState>,
}

/// Handle to a cooperatively scheduled unit of execution.
///
/// Handles are cheap to clone and compare by identity. All state lives behind
/// the handle, so a tasklet stays observable after it has finished.
#[derive(Clone)]
pub struct Tasklet {
    inner: Arc<TaskletInner>,
}

fn owner_of(state: &TaskletState) -> Result<Arc<SchedulerCore>> {
    state
        .owner
        .upgrade()
        .ok_or_else(|| TaskletError::state("owning thread has exited"))
}

impl Tasklet {
    /// Creates an unbound tasklet owned by the calling thread.
    pub fn new() -> Self {
        let core = scheduler::local_core();
        Self::with_state(false, TaskletState::new(&core))
    }

    /// Creates a tasklet bound to `func` but not yet set up.
    pub fn with_fn<F>(func: F) -> Self
    where
        F: FnOnce(Args) -> Result<()> + Send + 'static,
    {
        let tasklet = Self::new();
        tasklet.lock().func = Some(Box::new(func));
        tasklet
    }

    /// Binds `func` and schedules it with no arguments.
    pub fn spawn<F>(func: F) -> Result<Self>
    where
        F: FnOnce(Args) -> Result<()> + Send + 'static,
    {
        let tasklet = Self::with_fn(func);
        tasklet.setup(Args::new())?;
        Ok(tasklet)
    }

    pub(crate) fn main(thread: ThreadId, owner: Weak<SchedulerCore>) -> Self {
        let mut state = TaskletState {
            owner,
            thread,
            ..TaskletState::detached(thread)
        };
        state.alive = true;
        state.started = true;
        state.placement = Placement::Scheduled;
        Self::with_state(true, state)
    }

    fn with_state(is_main: bool, state: TaskletState) -> Self {
        Self {
            inner: Arc::new(TaskletInner {
                id: next_tasklet_id(),
                is_main,
                state: Mutex::new(state),
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TaskletState> {
        self.inner.state.lock()
    }

    pub fn id(&self) -> TaskletId {
        self.inner.id
    }

    pub fn is_main(&self) -> bool {
        self.inner.is_main
    }

    pub fn alive(&self) -> bool {
        self.lock().alive
    }

    pub fn scheduled(&self) -> bool {
        matches!(self.lock().placement, Placement::Scheduled)
    }

    pub fn blocked(&self) -> bool {
        matches!(self.lock().placement, Placement::Blocked(_))
    }

    /// Alive but neither scheduled nor blocked.
    pub fn paused(&self) -> bool {
        let state = self.lock();
        state.alive && matches!(state.placement, Placement::Detached)
    }

    pub fn restorable(&self) -> bool {
        self.lock().nesting_level == 0
    }

    pub fn atomic(&self) -> bool {
        self.lock().atomic
    }

    /// Sets the atomic flag and returns its previous value.
    pub fn set_atomic(&self, flag: bool) -> bool {
        std::mem::replace(&mut self.lock().atomic, flag)
    }

    pub fn nesting_level(&self) -> u32 {
        self.lock().nesting_level
    }

    pub fn thread_id(&self) -> ThreadId {
        self.lock().thread
    }

    pub fn is_current(&self) -> bool {
        let owner = self.lock().owner.upgrade();
        owner.is_some_and(|core| core.current() == *self)
    }

    pub fn tempval(&self) -> Option<Value> {
        match &self.lock().tempval {
            Some(Payload::Value(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn set_tempval(&self, value: Option<Value>) {
        self.lock().tempval = value.map(Payload::Value);
    }

    pub fn next(&self) -> Option<Tasklet> {
        self.neighbour(true)
    }

    pub fn prev(&self) -> Option<Tasklet> {
        self.neighbour(false)
    }

    fn neighbour(&self, forward: bool) -> Option<Tasklet> {
        enum Queue {
            Run(Arc<SchedulerCore>),
            Wait(Arc<ChannelCore>),
        }
        let queue = {
            let state = self.lock();
            match &state.placement {
                Placement::Scheduled => Queue::Run(state.owner.upgrade()?),
                Placement::Blocked(channel) => Queue::Wait(Arc::clone(channel)),
                Placement::Detached => return None,
            }
        };
        let id = self.id();
        match queue {
            Queue::Run(core) => {
                let sched = core.lock();
                let link = if forward {
                    sched.run_queue.next_of(id)
                } else {
                    sched.run_queue.prev_of(id)
                };
                link.cloned()
            }
            Queue::Wait(channel) => {
                let state = channel.lock();
                let link = if forward {
                    state.waiters.next_of(id)
                } else {
                    state.waiters.prev_of(id)
                };
                link.cloned()
            }
        }
    }

    // ==========================================================================
    // Binding
    // ==========================================================================

    /// Binds a callable. The tasklet is not alive until [`setup`](Self::setup).
    pub fn bind<F>(&self, func: F) -> Result<&Self>
    where
        F: FnOnce(Args) -> Result<()> + Send + 'static,
    {
        self.rebind(Some(Box::new(func)), None)
    }

    /// Binds a callable together with its arguments, leaving the tasklet paused.
    pub fn bind_with<F>(&self, func: F, args: Args) -> Result<&Self>
    where
        F: FnOnce(Args) -> Result<()> + Send + 'static,
    {
        self.rebind(Some(Box::new(func)), Some(args))
    }

    /// Drops the callable and arguments, returning to the not-alive state.
    pub fn unbind(&self) -> Result<&Self> {
        self.rebind(None, None)
    }

    fn rebind(&self, func: Option<TaskletFn>, args: Option<Args>) -> Result<&Self> {
        if self.is_main() {
            return Err(TaskletError::state("cannot rebind the main tasklet"));
        }
        let mut state = self.lock();
        match state.placement {
            Placement::Scheduled => return Err(TaskletError::state("tasklet is scheduled")),
            Placement::Blocked(_) => return Err(TaskletError::state("tasklet is blocked")),
            Placement::Detached => {}
        }
        if state.started {
            return Err(TaskletError::state(
                "tasklet has started and cannot be rebound",
            ));
        }
        let was_alive = state.alive;
        state.alive = func.is_some() && args.is_some();
        state.func = func;
        state.args = args;
        state.tempval = None;
        state.pending = None;
        let alive = state.alive;
        drop(state);

        let metrics = runtime().metrics();
        match (was_alive, alive) {
            (false, true) => metrics.record_spawn(),
            (true, false) => metrics.record_completion(),
            _ => {}
        }
        debug!(tasklet = %self.id(), alive, "tasklet rebound");
        Ok(self)
    }

    /// Supplies arguments to a bound tasklet and appends it to its run-queue.
    pub fn setup(&self, args: Args) -> Result<&Self> {
        let mut state = self.lock();
        if state.func.is_none() {
            return Err(TaskletError::state("tasklet is not bound to a callable"));
        }
        if state.alive {
            return Err(TaskletError::state("tasklet is already set up"));
        }
        state.args = Some(args);
        state.alive = true;
        self.place(&mut state, Slot::Tail)?;
        drop(state);

        runtime().metrics().record_spawn();
        debug!(tasklet = %self.id(), "tasklet set up");
        Ok(self)
    }

    /// Moves a not-yet-started tasklet to another thread's scheduler;
    /// `None` selects the calling thread.
    pub fn bind_thread(&self, thread: Option<ThreadId>) -> Result<()> {
        if self.is_main() {
            return Err(TaskletError::state("cannot move the main tasklet"));
        }
        let target = match thread {
            Some(id) => registry()
                .lookup(id)
                .ok_or_else(|| TaskletError::argument(format!("unknown thread id {id}")))?,
            None => scheduler::local_core(),
        };
        let mut state = self.lock();
        match state.placement {
            Placement::Scheduled => return Err(TaskletError::state("tasklet is scheduled")),
            Placement::Blocked(_) => return Err(TaskletError::state("tasklet is blocked")),
            Placement::Detached => {}
        }
        if state.started {
            return Err(TaskletError::state(
                "tasklet has started and is pinned to its thread",
            ));
        }
        state.owner = Arc::downgrade(&target);
        state.thread = target.thread();
        Ok(())
    }

    // ==========================================================================
    // Scheduling
    // ==========================================================================

    /// Appends a paused tasklet to its run-queue.
    pub fn insert(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.alive {
            return Err(TaskletError::state("tasklet is not alive"));
        }
        match state.placement {
            Placement::Scheduled => Err(TaskletError::state("tasklet is already scheduled")),
            Placement::Blocked(_) => Err(TaskletError::state("tasklet is blocked")),
            Placement::Detached => self.place(&mut state, Slot::Tail),
        }
    }

    /// Takes a scheduled tasklet off its run-queue without killing it.
    pub fn remove(&self) -> Result<()> {
        if self.is_main() {
            return Err(TaskletError::state("cannot remove the main tasklet"));
        }
        if self.is_current() {
            return Err(TaskletError::state("cannot remove the current tasklet"));
        }
        let mut state = self.lock();
        match state.placement {
            Placement::Blocked(_) => Err(TaskletError::state("tasklet is blocked")),
            Placement::Detached => Ok(()),
            Placement::Scheduled => self.displace(&mut state),
        }
    }

    /// Runs this tasklet right now. The caller stays scheduled and resumes
    /// once this tasklet yields, blocks or finishes.
    pub fn run(&self) -> Result<Option<Value>> {
        self.transfer(false)
    }

    /// Like [`run`](Self::run), but the caller is paused until something
    /// inserts it again.
    pub fn switch(&self) -> Result<Option<Value>> {
        self.transfer(true)
    }

    fn transfer(&self, pause_caller: bool) -> Result<Option<Value>> {
        let core = scheduler::local_core();
        let me = core.current();
        if *self == me {
            return Ok(None);
        }
        {
            let mut state = self.lock();
            if !state.alive {
                return Err(TaskletError::state("tasklet is not alive"));
            }
            if matches!(state.placement, Placement::Blocked(_)) {
                return Err(TaskletError::state("tasklet is blocked"));
            }
            if !Arc::ptr_eq(&owner_of(&state)?, &core) {
                return Err(TaskletError::state("tasklet belongs to another thread"));
            }
            self.place(&mut state, Slot::Front)?;
        }
        if pause_caller {
            let mut state = me.lock();
            me.displace(&mut state)?;
        }
        scheduler::switch_to(Some(self.clone()))
    }

    // ==========================================================================
    // Signals
    // ==========================================================================

    /// Delivers `TaskletExit`. With `pending` the tasklet is only scheduled and
    /// dies when it next runs; otherwise it is run immediately so its unwind
    /// completes before this call returns.
    pub fn kill(&self, pending: bool) -> Result<()> {
        self.throw(TaskletError::tasklet_exit(), pending)
    }

    pub fn raise_exception(&self, error: TaskletError) -> Result<()> {
        self.throw(error, false)
    }

    /// Delivers `error` at the tasklet's suspension point.
    pub fn throw(&self, error: TaskletError, pending: bool) -> Result<()> {
        let is_exit = error.is_tasklet_exit();
        let core = scheduler::local_core();
        if core.current() == *self {
            if pending {
                self.lock().pending = Some(error);
                return Ok(());
            }
            return Err(error);
        }

        let local = {
            let mut state = self.lock();
            if !state.alive {
                return if is_exit {
                    Ok(())
                } else {
                    Err(TaskletError::state("cannot throw to a dead tasklet"))
                };
            }
            if !state.started && is_exit && !pending {
                self.displace(&mut state)?;
                state.clear();
                drop(state);
                let metrics = runtime().metrics();
                metrics.record_kill();
                metrics.record_completion();
                debug!(tasklet = %self.id(), "tasklet killed before it started");
                return Ok(());
            }
            let local = Arc::ptr_eq(&owner_of(&state)?, &core);
            state.pending = Some(error);
            local
        };

        if pending || !local {
            if !self.leave_channel(Some(Slot::Tail)) {
                let mut state = self.lock();
                if !matches!(state.placement, Placement::Scheduled) {
                    self.place(&mut state, Slot::Tail)?;
                }
            }
            return Ok(());
        }
        self.detach_from_channel();
        let mut state = self.lock();
        self.place(&mut state, Slot::Front)?;
        drop(state);
        scheduler::switch_to(Some(self.clone())).map(|_| ())
    }

    // ==========================================================================
    // Runtime internals
    // ==========================================================================

    /// Puts the tasklet on its owner's run-queue. Must be called with the
    /// tasklet's own lock held.
    pub(crate) fn place(&self, state: &mut TaskletState, slot: Slot) -> Result<()> {
        let core = owner_of(state)?;
        self.enqueue(&mut core.lock(), slot);
        state.placement = Placement::Scheduled;
        core.notify();
        Ok(())
    }

    fn enqueue(&self, sched: &mut SchedulerState, slot: Slot) {
        sched.run_queue.remove(self.id());
        match slot {
            Slot::Tail => sched.run_queue.push_back(self.id(), self.clone()),
            Slot::Front => sched.run_queue.push_front(self.id(), self.clone()),
        }
    }

    pub(crate) fn displace(&self, state: &mut TaskletState) -> Result<()> {
        if let Some(core) = state.owner.upgrade() {
            core.lock().run_queue.remove(self.id());
        }
        state.placement = Placement::Detached;
        Ok(())
    }

    pub(crate) fn reschedule(&self, slot: Slot) -> Result<()> {
        let mut state = self.lock();
        self.place(&mut state, slot)
    }

    /// Parks the tasklet on `channel`, carrying `outgoing` for the peer.
    pub(crate) fn park(&self, channel: &Arc<ChannelCore>, outgoing: Option<Payload>) -> Result<()> {
        let mut state = self.lock();
        let core = owner_of(&state)?;
        {
            let mut sched = core.lock();
            sched.run_queue.remove(self.id());
            sched.blocked += 1;
        }
        state.tempval = outgoing;
        state.placement = Placement::Blocked(Arc::clone(channel));
        runtime().metrics().record_blocked_delta(1);
        Ok(())
    }

    /// Completes a rendezvous with this parked tasklet. A waiting receiver
    /// gets `outgoing`; a waiting sender hands back what it carried.
    /// The caller has already taken the tasklet off the channel queue.
    pub(crate) fn unpark(&self, outgoing: Option<Payload>) -> Option<Payload> {
        let mut state = self.lock();
        let incoming = match outgoing {
            Some(payload) => {
                state.tempval = Some(payload);
                None
            }
            None => state.tempval.take(),
        };
        state.placement = Placement::Detached;
        if let Some(core) = state.owner.upgrade() {
            let mut sched = core.lock();
            sched.blocked = sched.blocked.saturating_sub(1);
        }
        runtime().metrics().record_blocked_delta(-1);
        incoming
    }

    /// Pulls a blocked tasklet off its channel, discarding anything it was
    /// trying to send.
    pub(crate) fn detach_from_channel(&self) {
        self.leave_channel(None);
    }

    /// Like [`detach_from_channel`](Self::detach_from_channel). With `requeue`
    /// the tasklet lands on its run-queue under the same scheduler lock, so
    /// another thread waiting in `run` never sees it neither blocked nor
    /// scheduled. Returns false if the tasklet was not blocked.
    fn leave_channel(&self, requeue: Option<Slot>) -> bool {
        let channel = match &self.lock().placement {
            Placement::Blocked(channel) => Arc::clone(channel),
            _ => return false,
        };
        let mut channel_state = channel.lock();
        let mut state = self.lock();
        if !matches!(&state.placement, Placement::Blocked(c) if Arc::ptr_eq(c, &channel)) {
            return false;
        }
        channel_state.waiters.remove(self.id());
        state.placement = Placement::Detached;
        state.tempval = None;
        if let Some(core) = state.owner.upgrade() {
            let mut sched = core.lock();
            sched.blocked = sched.blocked.saturating_sub(1);
            if let Some(slot) = requeue {
                self.enqueue(&mut sched, slot);
                state.placement = Placement::Scheduled;
                drop(sched);
                core.notify();
            }
        }
        runtime().metrics().record_blocked_delta(-1);
        true
    }

    pub(crate) fn owner(&self) -> Result<Arc<SchedulerCore>> {
        owner_of(&self.lock())
    }

    pub(crate) fn set_payload(&self, payload: Payload) {
        self.lock().tempval = Some(payload);
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    pub(crate) fn take_pending(&self) -> Option<TaskletError> {
        self.lock().pending.take()
    }

    /// Hands an error that escaped another tasklet to this one. Keeps the
    /// first undelivered error.
    pub(crate) fn post_uncaught(&self, error: TaskletError) {
        {
            let mut state = self.lock();
            if state.pending.is_none() {
                state.pending = Some(error);
            }
        }
        self.detach_from_channel();
    }

    /// What the tasklet finds when it resumes: a pending signal first, then
    /// the transferred value.
    pub(crate) fn take_resume(&self) -> Result<Option<Value>> {
        let mut state = self.lock();
        if let Some(error) = state.pending.take() {
            return Err(error);
        }
        match state.tempval.take() {
            None => Ok(None),
            Some(Payload::Value(value)) => Ok(Some(value)),
            Some(Payload::Error(error)) => Err(error),
        }
    }

    pub(crate) fn start(&self) -> Result<(TaskletFn, Args)> {
        let mut state = self.lock();
        let func = state
            .func
            .take()
            .ok_or_else(|| TaskletError::state("tasklet is not bound to a callable"))?;
        let args = state.args.take().unwrap_or_default();
        state.started = true;
        Ok((func, args))
    }

    pub(crate) fn mark_dead(&self) {
        let mut state = self.lock();
        let _ = self.displace(&mut state);
        state.clear();
    }

    /// Makes the main tasklet the running head of its run-queue again.
    /// While `run()` is active main stays off the queue.
    pub(crate) fn restore_main(&self) -> Result<()> {
        let mut state = self.lock();
        match state.placement {
            Placement::Scheduled => {
                owner_of(&state)?.lock().run_queue.set_head(self.id());
                Ok(())
            }
            Placement::Detached if state.nesting_level == 0 => {
                self.place(&mut state, Slot::Front)
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn enter_nested(&self) -> Result<()> {
        let mut state = self.lock();
        state.nesting_level += 1;
        self.displace(&mut state)
    }

    pub(crate) fn leave_nested(&self) -> Result<()> {
        let mut state = self.lock();
        state.nesting_level = state.nesting_level.saturating_sub(1);
        self.place(&mut state, Slot::Front)
    }
}

impl TaskletState {
    fn detached(thread: ThreadId) -> Self {
        Self {
            owner: Weak::new(),
            thread,
            func: None,
            args: None,
            alive: false,
            started: false,
            placement: Placement::Detached,
            tempval: None,
            pending: None,
            atomic: false,
            nesting_level: 0,
        }
    }

    fn new(core: &Arc<SchedulerCore>) -> Self {
        Self {
            owner: Arc::downgrade(core),
            ..Self::detached(core.thread())
        }
    }

    fn clear(&mut self) {
        self.alive = false;
        self.started = false;
        self.func = None;
        self.args = None;
        self.tempval = None;
        self.pending = None;
        self.atomic = false;
        self.placement = Placement::Detached;
    }
}

impl Default for Tasklet {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Tasklet {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Tasklet {}

impl Hash for Tasklet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for Tasklet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tasklet")
            .field("id", &self.id())
            .field("main", &self.is_main())
            .finish()
    }
}

/// Marks the current tasklet atomic until dropped.
#[must_use = "the tasklet is only atomic while the guard is alive"]
pub struct AtomicGuard {
    tasklet: Tasklet,
    previous: bool,
}

impl AtomicGuard {
    pub(crate) fn new(tasklet: Tasklet) -> Self {
        let previous = tasklet.set_atomic(true);
        Self { tasklet, previous }
    }
}

impl Drop for AtomicGuard {
    fn drop(&mut self) {
        self.tasklet.set_atomic(self.previous);
    }
}
