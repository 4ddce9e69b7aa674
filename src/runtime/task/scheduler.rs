//! Per-thread cooperative scheduler.
//!
//! Every OS thread that touches the runtime gets a [`SchedulerCore`] holding
//! its run-queue and a main tasklet that stands for the thread's own stack.
//! All other tasklets run on corosensei coroutines. Only the main tasklet
//! resumes coroutines: a tasklet that wants to hand control elsewhere
//! suspends back to the main stack with a [`Switch`] request and the loop in
//! [`ThreadContext::drive`] carries it out. Coroutines are `!Send`, so they
//! live in a thread-local table next to the yielders they suspend through.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use super::error::{Result, TaskletError};
use super::queue::RingQueue;
use super::registry::{ThreadId, os_thread_id, registry};
use super::runtime;
use super::tasklet::{Tasklet, TaskletId};
use super::value::{Payload, Value};

const IDLE_POLL: Duration = Duration::from_millis(10);

/// Control request a suspended tasklet leaves for the main stack.
pub(crate) enum Switch {
    To(Tasklet),
    Idle,
}

type TaskletYielder = Yielder<(), Switch>;
type TaskletCoroutine = Coroutine<(), Switch, Result<()>, DefaultStack>;

pub(crate) struct SchedulerState {
    pub(crate) run_queue: RingQueue<TaskletId, Tasklet>,
    pub(crate) current: Tasklet,
    /// Tasklets of this thread parked on channels.
    pub(crate) blocked: usize,
}

pub(crate) struct SchedulerCore {
    thread: ThreadId,
    main: Tasklet,
    state: Mutex<SchedulerState>,
    wakeup: Condvar,
}

impl SchedulerCore {
    pub(crate) fn new(thread: ThreadId) -> Arc<Self> {
        Arc::new_cyclic(|core| {
            let main = Tasklet::main(thread, core.clone());
            let mut run_queue = RingQueue::new();
            run_queue.push_back(main.id(), main.clone());
            Self {
                thread,
                main: main.clone(),
                state: Mutex::new(SchedulerState {
                    run_queue,
                    current: main,
                    blocked: 0,
                }),
                wakeup: Condvar::new(),
            }
        })
    }

    pub(crate) fn thread(&self) -> ThreadId {
        self.thread
    }

    pub(crate) fn main(&self) -> &Tasklet {
        &self.main
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock()
    }

    pub(crate) fn current(&self) -> Tasklet {
        self.lock().current.clone()
    }

    fn set_current(&self, tasklet: &Tasklet) {
        self.lock().current = tasklet.clone();
    }

    pub(crate) fn notify(&self) {
        self.wakeup.notify_all();
    }

    /// Scheduled tasklets, blocked tasklets, and main when it is paused.
    pub(crate) fn runcount(&self) -> usize {
        let main_blocked = self.main.blocked();
        let state = self.lock();
        let main_paused = !main_blocked && !state.run_queue.contains(self.main.id());
        state.run_queue.len() + state.blocked + usize::from(main_paused)
    }

    /// True when the current tasklet is the only runnable one on this thread
    /// and no other thread could wake it.
    pub(crate) fn would_deadlock(&self, current: &Tasklet) -> bool {
        let alone = self.lock().run_queue.iter().all(|tasklet| tasklet == current);
        alone && registry().attached_count() <= 1
    }
}

// =============================================================================
// Thread context
// =============================================================================

/// A started tasklet together with the coroutine it is suspended in.
struct Suspended {
    tasklet: Tasklet,
    coroutine: TaskletCoroutine,
}

pub(crate) struct ThreadContext {
    core: Arc<SchedulerCore>,
    coroutines: RefCell<AHashMap<TaskletId, Suspended>>,
    yielders: RefCell<AHashMap<TaskletId, *const TaskletYielder>>,
}

thread_local! {
    static CONTEXT: ThreadContext = ThreadContext::attach();
}

pub(crate) fn local_core() -> Arc<SchedulerCore> {
    CONTEXT.with(|ctx| Arc::clone(&ctx.core))
}

/// Registers the running coroutine's yielder for as long as its body runs.
struct YielderSlot(TaskletId);

impl YielderSlot {
    fn install(id: TaskletId, yielder: &TaskletYielder) -> Self {
        CONTEXT.with(|ctx| {
            ctx.yielders
                .borrow_mut()
                .insert(id, yielder as *const TaskletYielder)
        });
        Self(id)
    }
}

impl Drop for YielderSlot {
    fn drop(&mut self) {
        let _ = CONTEXT.try_with(|ctx| {
            if let Ok(mut yielders) = ctx.yielders.try_borrow_mut() {
                yielders.remove(&self.0);
            }
        });
    }
}

/// Budget for `run(timeout)`, counted in resumptions.
struct RunBudget {
    limit: u64,
    total: bool,
    ignore_nesting: bool,
    spent_total: u64,
    spent: AHashMap<TaskletId, u64>,
}

impl RunBudget {
    fn new(options: &RunOptions) -> Self {
        Self {
            limit: options.timeout,
            total: options.totaltimeout,
            ignore_nesting: options.ignore_nesting,
            spent_total: 0,
            spent: AHashMap::new(),
        }
    }

    fn charge(&mut self, tasklet: &Tasklet) {
        self.spent_total += 1;
        *self.spent.entry(tasklet.id()).or_default() += 1;
    }

    fn exhausted_by(&self, tasklet: &Tasklet) -> bool {
        if self.total {
            self.spent_total >= self.limit
        } else {
            self.spent.get(&tasklet.id()).copied().unwrap_or(0) >= self.limit
        }
    }

    /// Only tasklets that yielded while still scheduled can be interrupted.
    fn interrupts(&self, tasklet: &Tasklet) -> bool {
        self.exhausted_by(tasklet)
            && tasklet.scheduled()
            && !tasklet.atomic()
            && (self.ignore_nesting || tasklet.nesting_level() == 0)
    }
}

impl ThreadContext {
    fn attach() -> Self {
        let thread = os_thread_id();
        let core = registry().attach(thread);
        debug!(%thread, "scheduler attached");
        Self {
            core,
            coroutines: RefCell::default(),
            yielders: RefCell::default(),
        }
    }

    /// Runs tasklets on behalf of the main tasklet until control comes back
    /// to main. Returns the tasklet interrupted by `budget`, if any.
    fn drive(&self, first: Option<Tasklet>, mut budget: Option<&mut RunBudget>) -> Option<Tasklet> {
        let mut next = first;
        let mut last: Option<Tasklet> = None;
        loop {
            let target = match next.take() {
                Some(tasklet) => tasklet,
                None => self.idle_target(),
            };
            if target.is_main() {
                if let Err(err) = target.restore_main() {
                    warn!(error = %err, "failed to reschedule the main tasklet");
                }
                self.core.set_current(&target);
                return None;
            }
            if let (Some(budget), Some(prev)) = (budget.as_deref(), last.take()) {
                if budget.interrupts(&prev) {
                    debug!(tasklet = %prev.id(), "run budget exhausted");
                    self.core.set_current(self.core.main());
                    return Some(prev);
                }
            }
            if !target.alive() {
                target.mark_dead();
                continue;
            }

            self.core.set_current(&target);
            runtime().metrics().record_switch();
            trace!(tasklet = %target.id(), "resume");
            let outcome = self.resume(&target);
            if let Some(budget) = budget.as_deref_mut() {
                budget.charge(&target);
            }
            next = match outcome {
                CoroutineResult::Yield(Switch::To(tasklet)) => Some(tasklet),
                CoroutineResult::Yield(Switch::Idle) => None,
                CoroutineResult::Return(result) => self.retire(&target, result),
            };
            last = Some(target);
        }
    }

    fn resume(&self, tasklet: &Tasklet) -> CoroutineResult<Switch, Result<()>> {
        let existing = self.coroutines.borrow_mut().remove(&tasklet.id());
        let mut coroutine = match existing {
            Some(suspended) => suspended.coroutine,
            None => match self.spawn_coroutine(tasklet) {
                Ok(coroutine) => coroutine,
                Err(err) => return CoroutineResult::Return(Err(err)),
            },
        };
        let outcome = coroutine.resume(());
        if !coroutine.done() {
            let suspended = Suspended {
                tasklet: tasklet.clone(),
                coroutine,
            };
            self.coroutines.borrow_mut().insert(tasklet.id(), suspended);
        }
        outcome
    }

    fn spawn_coroutine(&self, tasklet: &Tasklet) -> Result<TaskletCoroutine> {
        let (func, args) = tasklet.start()?;
        let stack = DefaultStack::new(runtime().config().stack_size).map_err(|err| {
            TaskletError::Raised(anyhow::Error::new(err).context("failed to allocate tasklet stack"))
        })?;
        let handle = tasklet.clone();
        Ok(Coroutine::with_stack(
            stack,
            move |yielder: &TaskletYielder, ()| {
                let _slot = YielderSlot::install(handle.id(), yielder);
                if let Some(signal) = handle.take_pending() {
                    return Err(signal);
                }
                match panic::catch_unwind(AssertUnwindSafe(|| func(args))) {
                    Ok(result) => result,
                    Err(payload) => Err(TaskletError::Raised(anyhow::anyhow!(
                        "tasklet panicked: {}",
                        panic_message(payload.as_ref())
                    ))),
                }
            },
        ))
    }

    /// Buries a finished tasklet and picks who runs next. Errors other than
    /// `TaskletExit` are handed to the main tasklet.
    fn retire(&self, tasklet: &Tasklet, result: Result<()>) -> Option<Tasklet> {
        tasklet.mark_dead();
        let metrics = runtime().metrics();
        metrics.record_completion();
        match result {
            Ok(()) => {
                debug!(tasklet = %tasklet.id(), "tasklet finished");
                None
            }
            Err(err) if err.is_tasklet_exit() => {
                metrics.record_kill();
                debug!(tasklet = %tasklet.id(), "tasklet exited");
                None
            }
            Err(err) => {
                metrics.record_failure();
                warn!(tasklet = %tasklet.id(), error = %err, "uncaught error in tasklet");
                let main = self.core.main().clone();
                main.post_uncaught(err);
                Some(main)
            }
        }
    }

    /// Chooses what runs when nobody was named: the run-queue head, else main.
    /// A blocked main with nothing left to run either waits for another thread
    /// or is woken with `Deadlock`.
    fn idle_target(&self) -> Tasklet {
        loop {
            if let Some(head) = self.core.lock().run_queue.head().cloned() {
                return head;
            }
            let main = self.core.main();
            if !main.blocked() {
                return main.clone();
            }
            if registry().attached_count() > 1 {
                let mut state = self.core.lock();
                if state.run_queue.is_empty() {
                    self.core.wakeup.wait_for(&mut state, IDLE_POLL);
                }
                continue;
            }
            warn!(thread = %self.core.thread(), "deadlock: main tasklet is blocked and nothing can run");
            main.post_uncaught(TaskletError::Deadlock);
            return main.clone();
        }
    }

    fn current(&self) -> Tasklet {
        self.core.current()
    }

    fn switch_to(&self, next: Option<Tasklet>) -> Result<Option<Value>> {
        let me = self.current();
        if me.is_main() {
            if next.as_ref() != Some(&me) {
                self.drive(next, None);
            }
        } else {
            let yielder = self
                .yielders
                .borrow()
                .get(&me.id())
                .copied()
                .ok_or_else(|| TaskletError::state("tasklet is not running on a coroutine"))?;
            let request = match next {
                Some(tasklet) => Switch::To(tasklet),
                None => Switch::Idle,
            };
            // SAFETY: the slot is registered by this tasklet's coroutine body and
            // removed before the body returns, and we are executing on that
            // coroutine's stack, so the yielder is alive.
            unsafe { (*yielder).suspend(request) };
        }
        me.take_resume()
    }

    fn run(&self, options: &RunOptions) -> Result<Option<Tasklet>> {
        let main = self.core.main().clone();
        if self.current() != main {
            return Err(TaskletError::state(
                "run() must be called from the main tasklet",
            ));
        }
        main.enter_nested()?;
        let mut budget = RunBudget::new(options);
        let interrupted = loop {
            let budget_ref = (options.timeout > 0).then_some(&mut budget);
            if let Some(victim) = self.drive(None, budget_ref) {
                break Some(victim);
            }
            if main.has_pending() || main.scheduled() {
                break None;
            }
            let mut state = self.core.lock();
            if !state.run_queue.is_empty() {
                continue;
            }
            if options.threadblock && state.blocked > 0 {
                self.core.wakeup.wait_for(&mut state, IDLE_POLL);
                continue;
            }
            break None;
        };
        main.leave_nested()?;

        let result = main.take_resume().map(|_| ());
        match interrupted {
            Some(victim) if !options.soft => {
                let mut state = victim.lock();
                victim.displace(&mut state)?;
                drop(state);
                result.map(|()| Some(victim))
            }
            _ => result.map(|()| None),
        }
    }

    fn schedule(&self, retval: Value, remove: bool) -> Result<Option<Value>> {
        let me = self.current();
        me.set_payload(Payload::Value(retval));
        let next = if remove {
            if me.is_main() && self.core.lock().run_queue.len() <= 1 {
                return me.take_resume();
            }
            let mut state = me.lock();
            me.displace(&mut state)?;
            drop(state);
            self.core.lock().run_queue.head().cloned()
        } else {
            let mut state = self.core.lock();
            if state.run_queue.head_key() == Some(me.id()) {
                state.run_queue.rotate();
            }
            state.run_queue.head().cloned()
        };
        self.switch_to(next)
    }
}

impl Drop for ThreadContext {
    /// Every tasklet this thread still owns dies with it. Blocked ones leave
    /// their channels first, so no peer can pair with a tasklet that will
    /// never run again.
    fn drop(&mut self) {
        registry().detach(self.core.thread());
        let suspended: Vec<Suspended> = self
            .coroutines
            .get_mut()
            .drain()
            .map(|(_, suspended)| suspended)
            .collect();
        let queued: Vec<Tasklet> = self
            .core
            .lock()
            .run_queue
            .iter()
            .filter(|tasklet| !tasklet.is_main())
            .cloned()
            .collect();

        let mut buried = 0_usize;
        for tasklet in suspended.iter().map(|entry| &entry.tasklet).chain(&queued) {
            buried += usize::from(bury(tasklet));
        }
        if buried > 0 {
            debug!(thread = %self.core.thread(), buried, "thread exited with live tasklets");
        }

        for Suspended { coroutine, .. } in suspended {
            if coroutine.started() && !coroutine.done() {
                // A suspended stack cannot be unwound from a TLS destructor.
                std::mem::forget(coroutine);
            }
        }
    }
}

fn bury(tasklet: &Tasklet) -> bool {
    if !tasklet.alive() {
        return false;
    }
    tasklet.detach_from_channel();
    tasklet.mark_dead();
    let metrics = runtime().metrics();
    metrics.record_kill();
    metrics.record_completion();
    true
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("unknown panic payload")
    }
}

/// Suspends the current tasklet and hands the thread to `next`, or to
/// whatever is runnable when `next` is `None`. Returns what the current
/// tasklet finds in its mailbox once it is resumed.
pub(crate) fn switch_to(next: Option<Tasklet>) -> Result<Option<Value>> {
    CONTEXT.with(|ctx| ctx.switch_to(next))
}

// =============================================================================
// Module-level API
// =============================================================================

/// Options for [`run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Resumptions allowed per tasklet (or in total) before an interrupt; 0 disables.
    pub timeout: u64,
    /// Park the thread while the queue is empty but tasklets are still blocked.
    pub threadblock: bool,
    /// Leave an interrupted tasklet scheduled instead of returning it.
    pub soft: bool,
    pub ignore_nesting: bool,
    /// Count `timeout` across all tasklets instead of per tasklet.
    pub totaltimeout: bool,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn threadblock(mut self, flag: bool) -> Self {
        self.threadblock = flag;
        self
    }

    pub fn soft(mut self, flag: bool) -> Self {
        self.soft = flag;
        self
    }

    pub fn ignore_nesting(mut self, flag: bool) -> Self {
        self.ignore_nesting = flag;
        self
    }

    pub fn totaltimeout(mut self, flag: bool) -> Self {
        self.totaltimeout = flag;
        self
    }
}

/// Runs the calling thread's tasklets until none is runnable.
///
/// Must be called from the main tasklet. Returns the tasklet interrupted by
/// the run budget, or the first error that escaped a tasklet.
pub fn run(options: RunOptions) -> Result<Option<Tasklet>> {
    CONTEXT.with(|ctx| ctx.run(&options))
}

/// Runs until nothing is runnable, with no budget.
pub fn run_all() -> Result<()> {
    run(RunOptions::default()).map(|_| ())
}

/// Yields to the next scheduled tasklet. Resumes with the current tasklet as
/// the value unless somebody replaced it.
pub fn schedule() -> Result<Option<Value>> {
    let me = getcurrent();
    schedule_with(Value::new(me))
}

pub fn schedule_with(retval: Value) -> Result<Option<Value>> {
    CONTEXT.with(|ctx| ctx.schedule(retval, false))
}

/// Yields and leaves the run-queue until reinserted.
///
/// A removed tasklet that nobody reinserts keeps its coroutine stack until
/// its thread exits, even when every handle to it has been dropped.
pub fn schedule_remove() -> Result<Option<Value>> {
    let me = getcurrent();
    schedule_remove_with(Value::new(me))
}

pub fn schedule_remove_with(retval: Value) -> Result<Option<Value>> {
    CONTEXT.with(|ctx| ctx.schedule(retval, true))
}

pub fn getcurrent() -> Tasklet {
    CONTEXT.with(ThreadContext::current)
}

pub fn getmain() -> Tasklet {
    CONTEXT.with(|ctx| ctx.core.main().clone())
}

pub fn getcurrentid() -> TaskletId {
    getcurrent().id()
}

pub fn getruncount() -> usize {
    CONTEXT.with(|ctx| ctx.core.runcount())
}

pub fn current_thread_id() -> ThreadId {
    CONTEXT.with(|ctx| ctx.core.thread())
}
