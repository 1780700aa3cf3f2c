mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use spark_channel::{ChannelError, EventLoop, EventLoopConfig, EventLoopGroup, TaskPanic};

use common::{settle, shutdown};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn tasks_run_in_submission_order_on_the_loop_thread() {
    let event_loop = common::event_loop("order");
    let seen = Arc::new(Mutex::new(Vec::new()));
    for index in 0..64 {
        let seen = Arc::clone(&seen);
        event_loop
            .execute(move || seen.lock().push(index))
            .expect("execute");
    }
    let thread_name = event_loop
        .submit(|| std::thread::current().name().map(str::to_owned))
        .wait_timeout(WAIT)
        .expect("submit completes")
        .expect("submit");
    assert_eq!(*seen.lock(), (0..64).collect::<Vec<_>>());
    assert_eq!(thread_name.as_deref(), Some("order"));
    assert!(!event_loop.in_event_loop());
    shutdown(&event_loop);
}

#[test]
fn scheduled_tasks_follow_deadlines_then_submission_order() {
    let event_loop = common::event_loop("scheduled");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let deadline = Instant::now() + Duration::from_millis(40);
    for label in ["tie-1", "tie-2", "tie-3"] {
        let seen = Arc::clone(&seen);
        event_loop
            .schedule_at(deadline, move || seen.lock().push(label))
            .expect("schedule");
    }
    let early = Arc::clone(&seen);
    event_loop
        .schedule_at(deadline - Duration::from_millis(20), move || {
            early.lock().push("early")
        })
        .expect("schedule early");
    let done = event_loop
        .schedule_at(deadline + Duration::from_millis(10), || ())
        .expect("schedule marker");
    done.completion()
        .wait_timeout(WAIT)
        .expect("marker runs")
        .expect("marker");
    assert_eq!(*seen.lock(), vec!["early", "tie-1", "tie-2", "tie-3"]);
    shutdown(&event_loop);
}

#[test]
fn cancelled_scheduled_tasks_are_skipped() {
    let event_loop = common::event_loop("cancel");
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    let handle = event_loop
        .schedule(Duration::from_millis(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("schedule");
    assert!(handle.cancel());
    assert!(handle.is_cancelled());
    std::thread::sleep(Duration::from_millis(60));
    settle(&event_loop);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    shutdown(&event_loop);
}

#[test]
fn cancelled_scheduled_tasks_leave_the_heap() {
    let event_loop = common::event_loop("cancel-purge");
    let handles: Vec<_> = (0..1000)
        .map(|_| {
            event_loop
                .schedule(Duration::from_secs(30), || ())
                .expect("schedule")
        })
        .collect();
    assert_eq!(event_loop.pending_scheduled_tasks(), 1000);

    for handle in &handles[..501] {
        assert!(handle.cancel());
    }
    assert!(event_loop.pending_scheduled_tasks() < 1000);
    for handle in &handles[501..] {
        assert!(handle.cancel());
    }
    assert_eq!(event_loop.pending_scheduled_tasks(), 0);
    assert!(handles.iter().all(|handle| handle.completion().is_cancelled()));

    let survivor = event_loop
        .schedule(Duration::from_millis(10), || ())
        .expect("schedule after purge");
    assert!(survivor.completion().wait_timeout(WAIT).is_some_and(|outcome| outcome.is_ok()));
    shutdown(&event_loop);
}

#[test]
fn a_panicking_task_is_reported_and_the_loop_keeps_running() {
    let reports = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&reports);
    let config = EventLoopConfig::new("panics").with_panic_handler(Arc::new(move |panic: &TaskPanic| {
        sink.lock().push(format!("{}: {}", panic.event_loop(), panic.message()));
    }));
    let event_loop = EventLoop::new(config).expect("spawn event loop");
    event_loop
        .execute(|| panic!("task blew up"))
        .expect("execute");
    let value = event_loop
        .submit(|| 7)
        .wait_timeout(WAIT)
        .expect("loop survives")
        .expect("submit");
    assert_eq!(value, 7);
    assert_eq!(*reports.lock(), vec!["panics: task blew up".to_owned()]);

    let failed = event_loop
        .submit(|| -> u8 { panic!("submitted task blew up") })
        .wait_timeout(WAIT)
        .expect("submit completes");
    assert!(matches!(failed, Err(ChannelError::TaskPanicked { .. })));
    shutdown(&event_loop);
}

#[test]
fn waiting_on_a_loop_future_from_the_loop_thread_is_refused() {
    let event_loop = common::event_loop("deadlock");
    let inner_loop = event_loop.clone();
    let outcome = event_loop
        .submit(move || {
            let nested = inner_loop.submit(|| 1_u8);
            matches!(nested.wait(), Err(ChannelError::BlockingOperation))
        })
        .wait_timeout(WAIT)
        .expect("submit completes")
        .expect("submit");
    assert!(outcome);
    shutdown(&event_loop);
}

#[test]
fn awaiting_termination_from_the_loop_thread_is_refused() {
    let event_loop = common::event_loop("await-self");
    let inner_loop = event_loop.clone();
    let outcome = event_loop
        .submit(move || {
            matches!(
                inner_loop.await_termination(Duration::from_secs(60)),
                Err(ChannelError::BlockingOperation)
            )
        })
        .wait_timeout(WAIT)
        .expect("submit completes")
        .expect("submit");
    assert!(outcome);
    assert_eq!(event_loop.await_termination(Duration::ZERO).ok(), Some(false));
    shutdown(&event_loop);
}

#[test]
fn shutdown_rejects_new_work_and_terminates() {
    let event_loop = common::event_loop("shutdown");
    let terminated = event_loop.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
    assert!(event_loop.is_shutting_down());
    assert!(matches!(
        event_loop.execute(|| ()),
        Err(ChannelError::Rejected { .. })
    ));
    assert!(terminated.wait_timeout(WAIT).is_some());
    assert!(event_loop.is_terminated());
    assert_eq!(event_loop.await_termination(Duration::ZERO).ok(), Some(true));
    assert!(event_loop.submit(|| ()).wait().is_err());
}

#[test]
fn a_group_hands_out_loops_round_robin() {
    let group = EventLoopGroup::new(3, EventLoopConfig::new("group")).expect("spawn group");
    assert_eq!(group.len(), 3);
    let names: Vec<String> = (0..6).map(|_| group.next().name().to_owned()).collect();
    assert_eq!(
        names,
        vec!["group-0", "group-1", "group-2", "group-0", "group-1", "group-2"]
    );
    assert!(
        group
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(1))
            .wait_timeout(WAIT)
            .is_some()
    );
    assert!(group.is_terminated());
}
