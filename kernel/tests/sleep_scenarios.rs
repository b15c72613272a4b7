//! End-to-end sleep ordering: real threads block in `Timer::sleep` and
//! the wake service releases them in target-tick order.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use opal_kernel::sched::host::HostScheduler;
use opal_kernel::sched::{Scheduler, PRI_DEFAULT};
use opal_kernel::Timer;

/// S5: A sleeps 30 ticks, B sleeps 10, C sleeps 20, all from t=0.
/// Wake order must be B, C, A, each at or after its target tick.
#[test]
fn sleepers_wake_in_target_order() {
    let sched: Arc<dyn Scheduler> = HostScheduler::new();
    let timer = Arc::new(Timer::new(Arc::clone(&sched)));
    timer.start_wake_service();

    let log: Arc<Mutex<Vec<(char, i64)>>> = Arc::new(Mutex::new(Vec::new()));

    for (name, ticks) in [('A', 30i64), ('B', 10), ('C', 20)] {
        let timer2 = Arc::clone(&timer);
        let log2 = Arc::clone(&log);
        sched.spawn(
            "sleeper",
            PRI_DEFAULT,
            Box::new(move || {
                timer2.sleep(ticks);
                log2.lock().unwrap().push((name, timer2.ticks()));
            }),
        );
    }

    // Let all three threads enqueue their wake calls before any tick.
    let deadline = Instant::now() + Duration::from_secs(10);
    while timer.stats().pending_sleepers < 3 {
        assert!(Instant::now() < deadline, "sleepers never enqueued");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(timer.ticks(), 0);

    // Drive the "interrupt" until everyone has woken.
    while log.lock().unwrap().len() < 3 {
        assert!(Instant::now() < deadline, "sleepers never woke");
        timer.tick();
        std::thread::sleep(Duration::from_millis(1));
    }

    let woken = log.lock().unwrap().clone();
    let order: Vec<char> = woken.iter().map(|(name, _)| *name).collect();
    assert_eq!(order, vec!['B', 'C', 'A']);

    for (name, wake_tick) in woken {
        let target = match name {
            'A' => 30,
            'B' => 10,
            'C' => 20,
            _ => unreachable!(),
        };
        assert!(
            wake_tick >= target,
            "{name} woke at {wake_tick}, before its target {target}"
        );
    }

    timer.stop_wake_service();
}

/// The wake service itself sleeps between batches: a later sleeper
/// still wakes even after the service has gone idle.
#[test]
fn service_wakes_for_late_sleepers() {
    let sched: Arc<dyn Scheduler> = HostScheduler::new();
    let timer = Arc::new(Timer::new(Arc::clone(&sched)));
    timer.start_wake_service();

    // Let the service reach its idle block.
    std::thread::sleep(Duration::from_millis(20));

    let log: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let timer2 = Arc::clone(&timer);
    let log2 = Arc::clone(&log);
    sched.spawn(
        "late",
        PRI_DEFAULT,
        Box::new(move || {
            timer2.sleep(5);
            log2.lock().unwrap().push(timer2.ticks());
        }),
    );

    let deadline = Instant::now() + Duration::from_secs(10);
    while timer.stats().pending_sleepers < 1 {
        assert!(Instant::now() < deadline, "sleeper never enqueued");
        std::thread::sleep(Duration::from_millis(1));
    }

    let start = timer.ticks();
    while log.lock().unwrap().is_empty() {
        assert!(Instant::now() < deadline, "late sleeper never woke");
        timer.tick();
        std::thread::sleep(Duration::from_millis(1));
    }

    let woke_at = log.lock().unwrap()[0];
    assert!(woke_at >= start + 5);

    timer.stop_wake_service();
}
