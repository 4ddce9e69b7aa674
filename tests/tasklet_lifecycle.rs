use std::sync::{Arc, mpsc};
use std::thread;

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use tasklets::{
    Args, ErrorKind, Tasklet, TaskletError, ThreadId, Value, atomic, current_thread_id, getcurrent,
    getmain, getruncount, run_all, schedule, schedule_remove,
};

/// Every test gets a thread of its own so it starts with a fresh scheduler.
fn isolated<F>(test: F)
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    thread::spawn(test)
        .join()
        .expect("test thread panicked")
        .expect("test failed");
}

fn nop(_: Args) -> tasklets::Result<()> {
    Ok(())
}

fn assert_not_alive(tasklet: &Tasklet) {
    assert!(!tasklet.alive());
    assert!(!tasklet.paused());
    assert!(!tasklet.blocked());
    assert!(!tasklet.scheduled());
    assert!(tasklet.restorable());
    assert!(!tasklet.atomic());
    assert!(!tasklet.is_current());
    assert!(!tasklet.is_main());
    assert!(tasklet.tempval().is_none());
}

fn assert_scheduled(tasklet: &Tasklet) {
    assert!(tasklet.alive());
    assert!(tasklet.scheduled());
    assert!(!tasklet.paused());
    assert!(!tasklet.blocked());
    assert!(tasklet.restorable());
}

fn assert_paused(tasklet: &Tasklet) {
    assert!(tasklet.alive());
    assert!(tasklet.paused());
    assert!(!tasklet.scheduled());
    assert!(!tasklet.blocked());
}

#[test]
fn fresh_tasklet_is_not_alive() {
    isolated(|| {
        assert_not_alive(&Tasklet::new());
        Ok(())
    });
}

#[test]
fn bind_and_unbind_return_to_fresh_state() {
    isolated(|| {
        let tasklet = Tasklet::new();
        tasklet.bind(nop)?;
        assert_not_alive(&tasklet);
        tasklet.unbind()?;
        assert_not_alive(&tasklet);
        Ok(())
    });
}

#[test]
fn setup_schedules_and_completion_retires() {
    isolated(|| {
        assert_eq!(getruncount(), 1);
        let tasklet = Tasklet::with_fn(nop);
        tasklet.setup(Args::new())?;
        assert_scheduled(&tasklet);
        assert_eq!(getruncount(), 2);

        run_all()?;
        assert_not_alive(&tasklet);
        assert_eq!(getruncount(), 1);
        Ok(())
    });
}

#[test]
fn bind_with_arguments_leaves_tasklet_paused() {
    isolated(|| {
        let received = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&received);
        let tasklet = Tasklet::new();
        tasklet.bind_with(
            move |args: Args| {
                let first = args.get(0).and_then(Value::get::<i32>);
                let named = args.keyword("name").and_then(Value::get::<&'static str>);
                *sink.lock() = Some((first, named));
                Ok(())
            },
            Args::new().arg(7_i32).kwarg("name", "seven"),
        )?;
        assert_paused(&tasklet);

        tasklet.insert()?;
        assert_scheduled(&tasklet);
        run_all()?;
        assert_eq!(*received.lock(), Some((Some(7), Some("seven"))));
        Ok(())
    });
}

#[test]
fn remove_pauses_and_insert_reschedules() {
    isolated(|| {
        let tasklet = Tasklet::spawn(nop)?;
        tasklet.remove()?;
        assert_paused(&tasklet);
        assert_eq!(getruncount(), 1);

        tasklet.insert()?;
        assert_scheduled(&tasklet);
        assert_eq!(getruncount(), 2);
        run_all()?;
        assert!(!tasklet.alive());
        Ok(())
    });
}

#[test]
fn kill_scheduled_tasklet() {
    isolated(|| {
        let tasklet = Tasklet::spawn(nop)?;
        assert_scheduled(&tasklet);
        tasklet.kill(false)?;
        assert_not_alive(&tasklet);
        assert_eq!(getruncount(), 1);
        Ok(())
    });
}

#[test]
fn pending_kill_schedules_a_paused_tasklet() {
    isolated(|| {
        let ran = Arc::new(Mutex::new(false));
        let sink = Arc::clone(&ran);
        let tasklet = Tasklet::new();
        tasklet.bind_with(
            move |_| {
                *sink.lock() = true;
                Ok(())
            },
            Args::new(),
        )?;
        assert_paused(&tasklet);

        tasklet.kill(true)?;
        assert!(tasklet.alive());
        assert!(tasklet.scheduled());

        run_all()?;
        assert!(!tasklet.alive());
        assert!(!*ran.lock(), "killed tasklet must not run its body");
        Ok(())
    });
}

#[test]
fn paused_tasklet_can_be_killed_directly() {
    isolated(|| {
        let tasklet = Tasklet::new();
        tasklet.bind_with(nop, Args::new())?;
        tasklet.kill(false)?;
        assert_not_alive(&tasklet);
        Ok(())
    });
}

#[test]
fn run_keeps_the_caller_scheduled() {
    isolated(|| {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let tasklet = Tasklet::new();
        let (sink, me, caller) = (Arc::clone(&seen), tasklet.clone(), getcurrent());
        tasklet.bind_with(
            move |_| {
                sink.lock().push((
                    me.is_current(),
                    me.scheduled(),
                    caller.is_main(),
                    caller.scheduled(),
                ));
                Ok(())
            },
            Args::new(),
        )?;

        tasklet.run()?;
        assert_eq!(*seen.lock(), vec![(true, true, true, true)]);
        assert_not_alive(&tasklet);
        assert!(getmain().is_current());
        Ok(())
    });
}

#[test]
fn switch_pauses_the_caller() {
    isolated(|| {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let tasklet = Tasklet::new();
        let (sink, caller) = (Arc::clone(&seen), getcurrent());
        tasklet.bind_with(
            move |_| {
                sink.lock().push((caller.paused(), caller.scheduled()));
                Ok(())
            },
            Args::new(),
        )?;

        tasklet.switch()?;
        assert_eq!(*seen.lock(), vec![(true, false)]);
        assert_not_alive(&tasklet);
        assert!(getmain().scheduled());
        Ok(())
    });
}

#[test]
fn main_inside_run_is_paused_and_not_restorable() {
    isolated(|| {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (sink, caller) = (Arc::clone(&seen), getcurrent());
        let tasklet = Tasklet::spawn(move |_| {
            sink.lock().push((
                caller.paused(),
                caller.restorable(),
                caller.nesting_level(),
            ));
            Ok(())
        })?;

        run_all()?;
        assert_eq!(*seen.lock(), vec![(true, false, 1)]);
        assert!(!tasklet.alive());
        assert!(getmain().restorable());
        assert_eq!(getmain().nesting_level(), 0);
        Ok(())
    });
}

#[test]
fn current_tasklet_can_kill_itself() {
    isolated(|| {
        let reached = Arc::new(Mutex::new(Vec::new()));
        let tasklet = Tasklet::new();
        let (sink, me) = (Arc::clone(&reached), tasklet.clone());
        tasklet.bind_with(
            move |_| {
                sink.lock().push("before");
                me.kill(false)?;
                sink.lock().push("after");
                Ok(())
            },
            Args::new(),
        )?;

        tasklet.run()?;
        assert_eq!(*reached.lock(), vec!["before"]);
        assert_not_alive(&tasklet);
        Ok(())
    });
}

#[test]
fn rebinding_a_scheduled_tasklet_is_rejected() {
    isolated(|| {
        let tasklet = Tasklet::spawn(nop)?;
        let err = tasklet.bind(nop).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert!(err.to_string().contains("tasklet is scheduled"));

        let err = tasklet.unbind().unwrap_err();
        assert!(err.to_string().contains("tasklet is scheduled"));
        assert_scheduled(&tasklet);
        run_all()?;
        Ok(())
    });
}

#[test]
fn invalid_insert_and_remove_are_state_errors() {
    isolated(|| {
        let dead = Tasklet::new();
        assert_eq!(dead.insert().unwrap_err().kind(), ErrorKind::State);

        let scheduled = Tasklet::spawn(nop)?;
        assert_eq!(scheduled.insert().unwrap_err().kind(), ErrorKind::State);
        assert_eq!(getmain().remove().unwrap_err().kind(), ErrorKind::State);

        let outcome = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&outcome);
        let current = Tasklet::new();
        let me = current.clone();
        current.bind_with(
            move |_| {
                *sink.lock() = Some(me.remove().map_err(|err| err.kind()));
                Ok(())
            },
            Args::new(),
        )?;
        current.run()?;
        assert_eq!(*outcome.lock(), Some(Err(ErrorKind::State)));

        run_all()?;
        Ok(())
    });
}

#[test]
fn setup_requires_a_bound_callable() {
    isolated(|| {
        let tasklet = Tasklet::new();
        assert_eq!(tasklet.setup(Args::new()).unwrap_err().kind(), ErrorKind::State);

        let tasklet = Tasklet::with_fn(nop);
        tasklet.setup(Args::new())?;
        assert_eq!(tasklet.setup(Args::new()).unwrap_err().kind(), ErrorKind::State);
        run_all()?;
        Ok(())
    });
}

#[test]
fn throw_raises_at_the_suspension_point() {
    isolated(|| {
        let caught = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&caught);
        let tasklet = Tasklet::new();
        tasklet.bind_with(
            move |_| {
                if let Err(err) = schedule() {
                    *sink.lock() = Some(err.to_string());
                }
                Ok(())
            },
            Args::new(),
        )?;

        tasklet.run()?;
        assert!(tasklet.alive());
        tasklet.throw(TaskletError::Raised(anyhow!("boom")), false)?;
        assert_eq!(caught.lock().as_deref(), Some("boom"));
        assert!(!tasklet.alive());
        Ok(())
    });
}

#[test]
fn pending_throw_is_delivered_on_the_next_run() {
    isolated(|| {
        let caught = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&caught);
        let tasklet = Tasklet::spawn(move |_| {
            if let Err(err) = schedule_remove() {
                *sink.lock() = Some(err.to_string());
            }
            Ok(())
        })?;
        run_all()?;
        assert_paused(&tasklet);

        tasklet.throw(TaskletError::Raised(anyhow!("later")), true)?;
        assert_scheduled(&tasklet);
        assert!(caught.lock().is_none());

        run_all()?;
        assert_eq!(caught.lock().as_deref(), Some("later"));
        assert!(!tasklet.alive());
        Ok(())
    });
}

#[test]
fn raise_exception_on_dead_tasklet_is_rejected() {
    isolated(|| {
        let tasklet = Tasklet::new();
        let err = tasklet
            .raise_exception(TaskletError::Raised(anyhow!("late")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        // Killing a dead tasklet is a no-op.
        tasklet.kill(false)?;
        Ok(())
    });
}

#[test]
fn tempval_is_readable_and_writable() {
    isolated(|| {
        let tasklet = Tasklet::new();
        tasklet.set_tempval(Some(Value::new(5_u8)));
        assert_eq!(tasklet.tempval().and_then(|v| v.get::<u8>()), Some(5));
        tasklet.set_tempval(None);
        assert!(tasklet.tempval().is_none());
        Ok(())
    });
}

#[test]
fn atomic_guard_restores_previous_flag() {
    isolated(|| {
        let main = getcurrent();
        assert!(!main.atomic());
        {
            let _guard = atomic();
            assert!(main.atomic());
            {
                let _inner = atomic();
                assert!(main.atomic());
            }
            assert!(main.atomic());
        }
        assert!(!main.atomic());

        assert!(!main.set_atomic(true));
        {
            let _guard = atomic();
        }
        assert!(main.atomic());
        main.set_atomic(false);
        Ok(())
    });
}

#[test]
fn neighbours_follow_run_queue_order() {
    isolated(|| {
        let main = getmain();
        let first = Tasklet::spawn(nop)?;
        let second = Tasklet::spawn(nop)?;

        assert_eq!(main.next().as_ref(), Some(&first));
        assert_eq!(first.next().as_ref(), Some(&second));
        assert_eq!(second.next().as_ref(), Some(&main));
        assert_eq!(main.prev().as_ref(), Some(&second));

        let idle = Tasklet::new();
        assert!(idle.next().is_none());
        assert!(idle.prev().is_none());
        run_all()?;
        Ok(())
    });
}

#[test]
fn bind_thread_moves_a_tasklet_to_another_scheduler() {
    isolated(|| {
        let (thread_tx, thread_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let worker = thread::spawn(move || -> tasklets::Result<()> {
            let _ = thread_tx.send(current_thread_id());
            let _ = go_rx.recv();
            run_all()
        });
        let worker_thread = thread_rx.recv()?;

        let ran_on = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&ran_on);
        let tasklet = Tasklet::with_fn(move |_| {
            *sink.lock() = Some(current_thread_id());
            Ok(())
        });
        tasklet.bind_thread(Some(worker_thread))?;
        assert_eq!(tasklet.thread_id(), worker_thread);
        tasklet.setup(Args::new())?;
        assert_eq!(getruncount(), 1);

        go_tx.send(())?;
        worker
            .join()
            .map_err(|_| anyhow!("worker panicked"))??;
        assert_eq!(*ran_on.lock(), Some(worker_thread));
        assert!(!tasklet.alive());
        Ok(())
    });
}

#[test]
fn bind_thread_rejects_unknown_threads_and_started_tasklets() {
    isolated(|| {
        let tasklet = Tasklet::with_fn(nop);
        let err = tasklet.bind_thread(Some(ThreadId::new(u64::MAX))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);
        tasklet.bind_thread(None)?;
        assert_eq!(tasklet.thread_id(), current_thread_id());

        tasklet.setup(Args::new())?;
        assert_eq!(tasklet.bind_thread(None).unwrap_err().kind(), ErrorKind::State);
        assert_eq!(getmain().bind_thread(None).unwrap_err().kind(), ErrorKind::State);
        run_all()?;
        Ok(())
    });
}
