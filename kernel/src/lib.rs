//! Opal Kernel Library
//!
//! Memory and storage management core of the Opal teaching kernel: the
//! virtual-memory manager (frame table, supplemental page tables, swap),
//! the write-back buffer cache, and the timer sleep service.
//!
//! The crate is a `no_std` library. On bare metal the embedder supplies
//! the boot glue, interrupt wiring, and heap region; on hosted targets the
//! crate links `std` so the subsystems run under the standard test
//! harness with RAM-backed block devices and an OS-thread scheduler.

#![no_std]

extern crate alloc;

// Bare-metal x86_64 builds use a linked-list heap; the embedding boot
// code initializes it before the first allocation.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

// Host target: use the system allocator so unit tests can allocate
// normally.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

pub mod block;
pub mod bootstrap;
pub mod error;
pub mod fs;
pub mod mm;
pub mod sched;
pub mod sync;
pub mod timer;
pub mod utils;

pub use block::{BlockDevice, BlockRole, DeviceRegistry, RamBlockDevice, SECTOR_SIZE};
pub use bootstrap::{BootConfig, Kernel};
pub use error::{KernelError, KernelResult};
pub use fs::cache::{BufferCache, CACHE_CAPACITY, WRITE_BEHIND_INTERVAL_MS};
pub use mm::{vm::Vm, KernelAddr, UserAddr, PAGE_SIZE};
pub use sched::{Scheduler, Thread, ThreadId};
pub use timer::{Timer, IDLE_MARGIN, TIMER_FREQ};
