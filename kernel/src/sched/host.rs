//! Hosted scheduler backed by OS threads.
//!
//! Implements [`Scheduler`] with `std::thread` so the core's blocking
//! paths run under the standard test harness. `block`/`unblock` map to
//! park/unpark: unpark of a running thread leaves a permit that the next
//! park consumes, which gives the idempotent, wakeup-loss-free unblock
//! the sleep service requires.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use super::{Scheduler, ThreadId};

std::thread_local! {
    static CURRENT: Cell<Option<ThreadId>> = const { Cell::new(None) };
}

/// Scheduler on OS threads.
pub struct HostScheduler {
    /// Park handles of every thread this scheduler has seen.
    handles: Mutex<BTreeMap<ThreadId, std::thread::Thread>>,
}

impl HostScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handles: Mutex::new(BTreeMap::new()),
        })
    }
}

impl Scheduler for HostScheduler {
    fn current(&self) -> ThreadId {
        CURRENT.with(|current| match current.get() {
            Some(id) => id,
            None => {
                // First sighting of this OS thread (e.g. the test main
                // thread); assign it an id and remember its handle.
                let id = ThreadId::next();
                self.handles.lock().insert(id, std::thread::current());
                current.set(Some(id));
                id
            }
        })
    }

    fn block(&self) {
        std::thread::park();
    }

    fn unblock(&self, thread: ThreadId) {
        let handle = self.handles.lock().get(&thread).cloned();
        if let Some(handle) = handle {
            handle.unpark();
        }
    }

    fn spawn(&self, name: &str, _priority: u8, entry: Box<dyn FnOnce() + Send>) -> ThreadId {
        let id = ThreadId::next();
        let registered = Arc::new(AtomicBool::new(false));
        let gate = Arc::clone(&registered);

        let handle = std::thread::Builder::new()
            .name(String::from(name))
            .spawn(move || {
                CURRENT.with(|current| current.set(Some(id)));
                // Entry must not run (and possibly block) before the
                // spawner has recorded our park handle, or an early
                // unblock would be lost.
                while !gate.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
                entry();
            })
            .expect("failed to spawn kernel thread");

        self.handles.lock().insert(id, handle.thread().clone());
        registered.store(true, Ordering::Release);
        id
    }
}
