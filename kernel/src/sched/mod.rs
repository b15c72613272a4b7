//! Kernel threads and the scheduler boundary.
//!
//! The scheduler proper (run queues, preemption, priorities) is an
//! external collaborator. This module defines [`Scheduler`], the
//! interface the core consumes from it, together with the per-thread
//! user context the VM layer owns: each [`Thread`] carries its page directory
//! and supplemental page table, and the [`ThreadTable`] resolves owners
//! during eviction.
//!
//! On hosted targets [`host::HostScheduler`] implements the trait on OS
//! threads; its `unblock` is a no-op for threads that are not blocked,
//! which the timer interrupt path relies on.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::mm::page_table::PageDirectory;
use crate::mm::spt::SuppPageTable;
use crate::mm::UserAddr;

#[cfg(not(target_os = "none"))]
pub mod host;

/// Default priority handed to service threads.
pub const PRI_DEFAULT: u8 = 31;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a kernel thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// Allocate the next unique thread id.
    pub fn next() -> Self {
        Self(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Scheduler operations the core consumes.
///
/// `unblock` MUST be idempotent: unblocking a thread that is not blocked
/// is a no-op. The timer interrupt pre-wakes the sleep service through
/// this path without knowing whether the service is currently blocked.
pub trait Scheduler: Send + Sync {
    /// Id of the calling thread.
    fn current(&self) -> ThreadId;

    /// Block the calling thread until some other thread unblocks it.
    /// May return spuriously; callers re-check their wake condition.
    fn block(&self);

    /// Make `thread` runnable. No-op if it is not blocked.
    fn unblock(&self, thread: ThreadId);

    /// Start a new kernel thread running `entry`.
    fn spawn(&self, name: &str, priority: u8, entry: Box<dyn FnOnce() + Send>) -> ThreadId;

    /// Called by the timer on every tick.
    fn tick_hook(&self) {}
}

/// Per-thread user context: the state the VM core keeps for each thread
/// that owns user pages.
pub struct Thread {
    id: ThreadId,
    name: String,
    /// Software image of the thread's hardware page table.
    pub pagedir: Mutex<PageDirectory>,
    /// Supplemental page table describing not-present pages.
    pub pages: Mutex<SuppPageTable>,
}

impl Thread {
    fn new(name: &str) -> Self {
        Self {
            id: ThreadId::next(),
            name: String::from(name),
            pagedir: Mutex::new(PageDirectory::new()),
            pages: Mutex::new(SuppPageTable::new()),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drop the supplemental entry for `upage` and clear its hardware
    /// mapping.
    pub fn free_page(&self, upage: UserAddr) {
        let mut pagedir = self.pagedir.lock();
        let mut pages = self.pages.lock();
        if pages.free(upage).is_some() {
            pagedir.clear(upage);
        }
    }
}

/// Registry of live threads, keyed by id.
///
/// The frame table records owners as [`ThreadId`]s; eviction resolves
/// them here to reach the owner's page directory without scanning.
pub struct ThreadTable {
    inner: Mutex<BTreeMap<ThreadId, Arc<Thread>>>,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    /// Create and register a thread context.
    pub fn create(&self, name: &str) -> Arc<Thread> {
        let thread = Arc::new(Thread::new(name));
        self.inner.lock().insert(thread.id, Arc::clone(&thread));
        thread
    }

    pub fn get(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.inner.lock().get(&id).cloned()
    }

    /// Unregister a thread context (process exit).
    pub fn remove(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.inner.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}
