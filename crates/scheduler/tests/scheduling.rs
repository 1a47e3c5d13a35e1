mod common;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use common::{dispatcher, Recorder, TIMEOUT};
use image_loader_scheduler::{
    Dispatcher, ExecutionContext, ExecutionError, ImageData, SchedulerConfig, TaskOutcome,
    TaskRequest, TaskState,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

struct View;

#[test]
fn urgent_task_overtakes_queued_work() {
    let dispatcher = dispatcher(1);
    let recorder = Recorder::new();
    let (blocker, gate) = recorder.gated("blocker", b"x");
    dispatcher.submit(blocker).expect("submit blocker");
    assert_eq!(recorder.next_start(), "blocker");

    let a = dispatcher
        .submit(recorder.quick("a", b"a").with_priority(5).with_raw_key("k1"))
        .expect("submit a");
    let b = dispatcher
        .submit(recorder.quick("b", b"b").with_priority(1).with_raw_key("k2"))
        .expect("submit b");
    assert_eq!(dispatcher.pending_count(), 2);

    gate.open();
    assert_eq!(recorder.next_start(), "b");
    assert_eq!(recorder.next_start(), "a");
    assert!(matches!(a.wait(), TaskOutcome::Completed { .. }));
    assert!(matches!(b.wait(), TaskOutcome::Completed { .. }));
}

#[test]
fn equal_priorities_run_in_submission_order() {
    let dispatcher = dispatcher(1);
    let recorder = Recorder::new();
    let (blocker, gate) = recorder.gated("blocker", b"x");
    dispatcher.submit(blocker).expect("submit blocker");
    assert_eq!(recorder.next_start(), "blocker");

    for label in ["first", "second", "third", "fourth"] {
        dispatcher
            .submit(recorder.quick(label, b"x").with_priority(3))
            .expect("submit");
    }

    gate.open();
    assert!(dispatcher.wait_idle(TIMEOUT));
    assert_eq!(
        recorder.drain_starts(),
        vec!["first", "second", "third", "fourth"]
    );
}

#[test]
fn target_replacement_scenario() {
    let dispatcher = dispatcher(1);
    let recorder = Recorder::new();
    let t1 = Arc::new(View);
    let t2 = Arc::new(View);

    let (blocker, gate) = recorder.gated("blocker", b"x");
    dispatcher.submit(blocker).expect("submit blocker");
    assert_eq!(recorder.next_start(), "blocker");

    let a = dispatcher
        .submit(
            recorder
                .quick("a", b"a")
                .with_priority(5)
                .with_target(&t1)
                .with_raw_key("k1"),
        )
        .expect("submit a");
    let b = dispatcher
        .submit(
            recorder
                .quick("b", b"b")
                .with_priority(1)
                .with_target(&t2)
                .with_raw_key("k2"),
        )
        .expect("submit b");

    let c = dispatcher
        .submit(recorder.quick("c", b"c").with_priority(9).with_target(&t1))
        .expect("submit c");

    // A was still pending, so it is cancelled before C's submit returns.
    assert_eq!(a.outcome(), Some(TaskOutcome::Cancelled));
    assert_eq!(a.state(), TaskState::Cancelled);
    assert!(!b.is_cancel_requested());
    assert_eq!(dispatcher.pending_count(), 2);

    gate.open();
    assert_eq!(recorder.next_start(), "b");
    assert_eq!(recorder.next_start(), "c");
    assert_eq!(b.wait_result().expect("b completes").bytes(), b"b");
    assert_eq!(c.wait_result().expect("c completes").bytes(), b"c");
    assert!(dispatcher.wait_idle(TIMEOUT));
    assert!(recorder.drain_starts().is_empty());
    assert_eq!(a.state(), TaskState::Cancelled);
}

#[test]
fn randomized_admission_order_is_min_first_then_fifo() {
    let mut rng = StdRng::seed_from_u64(0x1a6e_5eed);

    for _round in 0..5 {
        let dispatcher = dispatcher(1);
        let recorder = Recorder::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let (blocker, gate) = recorder.gated("blocker", b"x");
        dispatcher.submit(blocker).expect("submit blocker");
        assert_eq!(recorder.next_start(), "blocker");

        let mut expected = Vec::new();
        for index in 0..40usize {
            let priority: i32 = rng.gen_range(-5..=5);
            expected.push((priority, index));

            let order = order.clone();
            dispatcher
                .submit(
                    TaskRequest::new(
                        move |_ctx: &ExecutionContext<'_>| -> Result<ImageData, ExecutionError> {
                            order.lock().unwrap().push(index);
                            Ok(ImageData::new(vec![index as u8]))
                        },
                    )
                    .with_priority(priority),
                )
                .expect("submit");
        }

        gate.open();
        assert!(dispatcher.wait_idle(TIMEOUT));

        expected.sort();
        let expected: Vec<usize> = expected.into_iter().map(|(_, index)| index).collect();
        assert_eq!(*order.lock().unwrap(), expected);
    }
}

#[test]
fn active_slots_never_exceed_limit() {
    let dispatcher = dispatcher(3);
    let recorder = Recorder::new();

    let handles: Vec<_> = (0..24)
        .map(|i| {
            dispatcher
                .submit(
                    recorder
                        .sleeping(&format!("t{}", i), b"x", Duration::from_millis(5))
                        .with_priority(i % 4),
                )
                .expect("submit")
        })
        .collect();

    for handle in &handles {
        assert!(matches!(handle.wait(), TaskOutcome::Completed { .. }));
    }
    assert!(dispatcher.wait_idle(TIMEOUT));

    assert!(recorder.peak() <= 3, "peak concurrency was {}", recorder.peak());
    let stats = dispatcher.stats();
    assert!(stats.peak_active <= 3);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.tasks_completed, 24);
    assert_eq!(stats.tasks_admitted, 24);
}

/// Wait until every started worker is parked on the job channel
fn wait_for_idle_workers(dispatcher: &Dispatcher) {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let stats = dispatcher.stats();
        if stats.idle_workers == stats.worker_threads {
            return;
        }
        assert!(Instant::now() < deadline, "workers never went idle: {:?}", stats);
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn sequential_tasks_reuse_one_worker_thread() {
    let dispatcher = dispatcher(2);
    let recorder = Recorder::new();

    for i in 0..10 {
        let handle = dispatcher
            .submit(recorder.quick(&format!("t{}", i), b"x"))
            .expect("submit");
        assert!(matches!(handle.wait(), TaskOutcome::Completed { .. }));
        wait_for_idle_workers(&dispatcher);
    }

    let stats = dispatcher.stats();
    assert_eq!(stats.worker_threads, 1);
    assert_eq!(stats.idle_workers, 1);
    assert_eq!(stats.tasks_completed, 10);
}

#[test]
fn pool_grows_to_cover_parallel_slots() {
    let dispatcher = dispatcher(2);
    let recorder = Recorder::new();

    let (first, first_gate) = recorder.gated("first", b"x");
    let (second, second_gate) = recorder.gated("second", b"x");
    dispatcher.submit(first).expect("submit");
    dispatcher.submit(second).expect("submit");
    recorder.next_start();
    recorder.next_start();

    let stats = dispatcher.stats();
    assert_eq!(stats.worker_threads, 2);
    assert_eq!(stats.idle_workers, 0);

    first_gate.open();
    second_gate.open();
    assert!(dispatcher.wait_idle(Duration::MAX));
    wait_for_idle_workers(&dispatcher);
    assert_eq!(dispatcher.stats().worker_threads, 2);
}

#[test]
fn slot_factory_overrides_fixed_limit() {
    let limit = Arc::new(AtomicI64::new(2));
    let factory_limit = limit.clone();
    let config = SchedulerConfig::default()
        .with_max_parallel_tasks(1)
        .with_max_parallel_tasks_factory(move |_| Ok(factory_limit.load(Ordering::SeqCst)));
    let dispatcher = Dispatcher::new(config).expect("dispatcher should start");
    let recorder = Recorder::new();

    let (first, first_gate) = recorder.gated("first", b"x");
    let (second, second_gate) = recorder.gated("second", b"x");
    let (third, third_gate) = recorder.gated("third", b"x");
    dispatcher.submit(first).expect("submit");
    dispatcher.submit(second).expect("submit");
    dispatcher.submit(third).expect("submit");

    recorder.next_start();
    recorder.next_start();
    assert!(recorder.quiet_for(Duration::from_millis(50)));
    assert_eq!(dispatcher.active_count(), 2);

    // A non-positive factory result falls back to the fixed limit of 1.
    limit.store(-1, Ordering::SeqCst);
    first_gate.open();
    second_gate.open();
    assert_eq!(recorder.next_start(), "third");
    third_gate.open();
    assert!(dispatcher.wait_idle(TIMEOUT));
    assert!(recorder.peak() <= 2);
}

#[test]
fn reprioritize_pending_task() {
    let dispatcher = dispatcher(1);
    let recorder = Recorder::new();
    let (blocker, gate) = recorder.gated("blocker", b"x");
    dispatcher.submit(blocker).expect("submit blocker");
    recorder.next_start();

    dispatcher
        .submit(recorder.quick("slow-lane", b"x").with_priority(1))
        .expect("submit");
    let late = dispatcher
        .submit(recorder.quick("late", b"x").with_priority(8))
        .expect("submit");

    dispatcher
        .reprioritize(late.id(), -2)
        .expect("late is still pending");
    assert_eq!(late.priority(), -2);

    gate.open();
    assert!(dispatcher.wait_idle(TIMEOUT));
    assert_eq!(recorder.drain_starts(), vec!["late", "slow-lane"]);
}

fn run_workload(verbose: bool) -> (Vec<String>, Vec<(TaskState, Option<Vec<u8>>)>) {
    let config = SchedulerConfig::default()
        .with_max_parallel_tasks(1)
        .with_verbose_logging(verbose);
    let dispatcher = Dispatcher::new(config).expect("dispatcher should start");
    let recorder = Recorder::new();
    let view = Arc::new(View);

    let (blocker, gate) = recorder.gated("blocker", b"x");
    dispatcher.submit(blocker).expect("submit");
    recorder.next_start();

    let mut handles = Vec::new();
    handles.push(
        dispatcher
            .submit(recorder.quick("p4", b"4").with_priority(4).with_raw_key("k4"))
            .expect("submit"),
    );
    handles.push(
        dispatcher
            .submit(recorder.quick("p2", b"2").with_priority(2).with_target(&view))
            .expect("submit"),
    );
    handles.push(
        dispatcher
            .submit(recorder.failing("p3", "bad data").with_priority(3))
            .expect("submit"),
    );
    handles.push(
        dispatcher
            .submit(recorder.quick("p1", b"1").with_priority(1).with_target(&view))
            .expect("submit"),
    );
    handles.push(
        dispatcher
            .submit(recorder.quick("p4-dup", b"4").with_priority(0).with_raw_key("k4"))
            .expect("submit"),
    );

    gate.open();
    assert!(dispatcher.wait_idle(TIMEOUT));

    let outcomes = handles
        .iter()
        .map(|handle| {
            let outcome = handle.wait();
            (outcome.state(), outcome.image().map(|image| image.bytes().to_vec()))
        })
        .collect();
    (recorder.drain_starts(), outcomes)
}

#[test]
fn verbose_flags_do_not_change_outcomes() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();

    let quiet = run_workload(false);
    let verbose = run_workload(true);

    assert_eq!(quiet, verbose);
    assert_eq!(quiet.0, vec!["p4", "p1", "p3"]);
    assert_eq!(
        quiet.1,
        vec![
            (TaskState::Completed, Some(b"4".to_vec())),
            (TaskState::Cancelled, None),
            (TaskState::Failed, None),
            (TaskState::Completed, Some(b"1".to_vec())),
            (TaskState::Completed, Some(b"4".to_vec())),
        ]
    );
}
