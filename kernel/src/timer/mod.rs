//! Timer and sleep service.
//!
//! A monotonic tick counter driven by the platform timer interrupt and
//! a blocking sleep primitive with no busy waiting: `sleep` enqueues a
//! wake call sorted by target tick and blocks, and a dedicated service
//! thread drains due calls in target order. The interrupt entry point
//! ([`Timer::tick`]) pre-wakes the service when the next call is within
//! [`IDLE_MARGIN`] ticks, relying on `Scheduler::unblock` being a no-op
//! for a thread that is not blocked.
//!
//! All wake-queue state sits behind one mutex whose critical sections
//! are short and never block, the portable equivalent of the
//! interrupts-disabled sections the bare-metal handler would use.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use spin::Mutex;

use crate::sched::{Scheduler, ThreadId, PRI_DEFAULT};

/// Timer interrupts per second.
pub const TIMER_FREQ: i64 = 100;
const _: () = assert!(TIMER_FREQ >= 19 && TIMER_FREQ <= 1000);

/// If no wake call is due within this many ticks, the service thread
/// blocks itself until the interrupt handler pre-wakes it.
pub const IDLE_MARGIN: i64 = 2;

/// Tick counter and sleep bookkeeping snapshot.
#[derive(Debug, Clone, Copy)]
pub struct TimerStats {
    pub ticks: i64,
    pub pending_sleepers: usize,
}

/// A pending sleep: who to wake and when.
struct WakeCall {
    target: i64,
    thread: ThreadId,
}

/// Sorted wake calls plus the service thread's coordination state.
struct WakeQueue {
    /// Non-decreasing by target; ties keep insertion order.
    calls: VecDeque<WakeCall>,
    /// Target of the earliest pending call, `i64::MAX` when none.
    next_call: i64,
    /// The service thread, once it has started.
    service: Option<ThreadId>,
}

/// The timer.
pub struct Timer {
    ticks: AtomicI64,
    queue: Mutex<WakeQueue>,
    sched: Arc<dyn Scheduler>,
    service_running: AtomicBool,
}

impl Timer {
    pub fn new(sched: Arc<dyn Scheduler>) -> Self {
        Self {
            ticks: AtomicI64::new(0),
            queue: Mutex::new(WakeQueue {
                calls: VecDeque::new(),
                next_call: i64::MAX,
                service: None,
            }),
            sched,
            service_running: AtomicBool::new(false),
        }
    }

    /// Ticks since boot.
    pub fn ticks(&self) -> i64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Ticks elapsed since `then`, a value previously returned by
    /// [`Self::ticks`].
    pub fn elapsed(&self, then: i64) -> i64 {
        self.ticks() - then
    }

    pub fn stats(&self) -> TimerStats {
        TimerStats {
            ticks: self.ticks(),
            pending_sleepers: self.queue.lock().calls.len(),
        }
    }

    /// Timer interrupt entry point: advance the counter by one, run the
    /// scheduler's tick hook, and pre-wake the sleep service if the
    /// next wake call is imminent.
    pub fn tick(&self) {
        let now = self.ticks.fetch_add(1, Ordering::AcqRel) + 1;
        self.sched.tick_hook();

        let queue = self.queue.lock();
        if let Some(service) = queue.service {
            if queue.next_call.saturating_sub(now) <= IDLE_MARGIN {
                self.sched.unblock(service);
            }
        }
    }

    // -----------------------------------------------------------------
    // Sleeping
    // -----------------------------------------------------------------

    /// Block the calling thread for at least `duration` ticks. Returns
    /// immediately for zero or negative durations.
    pub fn sleep(&self, duration: i64) {
        if duration <= 0 {
            return;
        }
        let target = self.ticks() + duration;
        self.schedule_wake(target, self.sched.current());

        while self.ticks() < target {
            self.sched.block();
        }
    }

    /// Sleep for at least `ms` milliseconds.
    pub fn msleep(&self, ms: i64) {
        self.real_time_sleep(ms, 1000);
    }

    /// Sleep for at least `us` microseconds.
    pub fn usleep(&self, us: i64) {
        self.real_time_sleep(us, 1000 * 1000);
    }

    /// Sleep for at least `ns` nanoseconds.
    pub fn nsleep(&self, ns: i64) {
        self.real_time_sleep(ns, 1000 * 1000 * 1000);
    }

    /// Ticks covered by `num / denom` seconds, rounded down.
    const fn ticks_for(num: i64, denom: i64) -> i64 {
        num * TIMER_FREQ / denom
    }

    /// Sleep for approximately `num / denom` seconds. Requests shorter
    /// than one tick return immediately; sub-tick delays are the
    /// platform layer's busy-wait territory, not this module's.
    fn real_time_sleep(&self, num: i64, denom: i64) {
        let duration = Self::ticks_for(num, denom);
        if duration > 0 {
            self.sleep(duration);
        }
    }

    /// Insert a wake call, keeping the queue sorted by target with ties
    /// in insertion order.
    fn schedule_wake(&self, target: i64, thread: ThreadId) {
        let mut queue = self.queue.lock();
        let pos = queue
            .calls
            .iter()
            .position(|call| call.target > target)
            .unwrap_or(queue.calls.len());
        queue.calls.insert(pos, WakeCall { target, thread });
        if target < queue.next_call {
            queue.next_call = target;
        }
    }

    // -----------------------------------------------------------------
    // Wake service
    // -----------------------------------------------------------------

    /// Spawn the wake-service thread.
    pub fn start_wake_service(self: &Arc<Self>) -> ThreadId {
        self.service_running.store(true, Ordering::Release);
        let timer = Arc::clone(self);
        self.sched.spawn(
            "wake-service",
            PRI_DEFAULT,
            Box::new(move || timer.run_wake_service()),
        )
    }

    /// Ask the service thread to exit and nudge it awake so it notices.
    pub fn stop_wake_service(&self) {
        self.service_running.store(false, Ordering::Release);
        let service = self.queue.lock().service;
        if let Some(service) = service {
            self.sched.unblock(service);
        }
    }

    /// The service loop: drain due wake calls, then block until the
    /// interrupt handler pre-wakes us. Runs until
    /// [`Self::stop_wake_service`].
    pub fn run_wake_service(&self) {
        let me = self.sched.current();
        self.queue.lock().service = Some(me);
        log::info!("wake service running");

        while self.service_running.load(Ordering::Acquire) {
            let idle = self.service_sweep();
            if idle && self.service_running.load(Ordering::Acquire) {
                self.sched.block();
            }
        }

        self.queue.lock().service = None;
        log::info!("wake service stopped");
    }

    /// One service iteration: unblock every thread whose target has
    /// passed, in queue order, and recompute the next wake target.
    /// Returns whether the service may idle.
    fn service_sweep(&self) -> bool {
        let now = self.ticks();
        let mut queue = self.queue.lock();

        while queue.calls.front().is_some_and(|call| call.target <= now) {
            let call = queue.calls.pop_front().expect("checked non-empty");
            self.sched.unblock(call.thread);
        }

        queue.next_call = queue
            .calls
            .front()
            .map(|call| call.target)
            .unwrap_or(i64::MAX);
        queue.next_call.saturating_sub(now) > IDLE_MARGIN
    }
}
