//! The virtual-memory manager.
//!
//! [`Vm`] owns the user frame pool, the frame table, the swap table, and
//! the thread registry, and runs every operation that crosses between
//! them: frame acquisition with clock eviction, mapping setup and
//! teardown, swap-in, and process teardown. One mutex guards the frame
//! table; it is held across allocation and mapping so a fault handler's
//! freshly chosen frame can never be evicted out from under it.

use alloc::sync::Arc;

use spin::{Mutex, MutexGuard};

use crate::block::BlockDevice;
use crate::error::{KernelError, KernelResult};
use crate::mm::frame::FrameTable;
use crate::mm::pool::UserPool;
use crate::mm::spt::{PageOrigin, SuppPage};
use crate::mm::swap::SwapTable;
use crate::mm::{KernelAddr, UserAddr, PAGE_SIZE};
use crate::sched::{Thread, ThreadId, ThreadTable};

/// The virtual-memory core.
pub struct Vm {
    pool: UserPool,
    frames: Mutex<FrameTable>,
    swap: SwapTable,
    threads: ThreadTable,
}

impl Vm {
    /// Create a VM manager over `frame_count` user frames, optionally
    /// backed by a swap device.
    pub fn new(frame_count: usize, swap_device: Option<Arc<dyn BlockDevice>>) -> Self {
        log::info!(
            "vm: {} user frames, swap {}",
            frame_count,
            if swap_device.is_some() { "on" } else { "off" }
        );
        Self {
            pool: UserPool::new(frame_count),
            frames: Mutex::new(FrameTable::new()),
            swap: SwapTable::new(swap_device),
            threads: ThreadTable::new(),
        }
    }

    pub fn pool(&self) -> &UserPool {
        &self.pool
    }

    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    pub fn threads(&self) -> &ThreadTable {
        &self.threads
    }

    /// Frames currently registered in the frame table.
    pub fn frames_in_use(&self) -> usize {
        self.frames.lock().len()
    }

    // -----------------------------------------------------------------
    // Frame acquisition and release
    // -----------------------------------------------------------------

    /// Acquire `n` contiguous fresh user pages for `owner`, evicting
    /// other pages as needed. The returned pages are zeroed and each new
    /// frame starts with its reference bit set.
    ///
    /// # Panics
    /// Panics when eviction cannot make room: a dirty victim with no
    /// swap device, or an eviction loop that exceeds its retry bound.
    pub fn acquire_pages(&self, owner: ThreadId, n: usize) -> KernelResult<KernelAddr> {
        let mut frames = self.frames.lock();
        self.acquire_locked(&mut frames, owner, n)
    }

    fn acquire_locked(
        &self,
        frames: &mut MutexGuard<'_, FrameTable>,
        owner: ThreadId,
        n: usize,
    ) -> KernelResult<KernelAddr> {
        if n == 0 {
            return Err(KernelError::InvalidArgument {
                name: "n",
                value: "zero pages requested",
            });
        }

        // Multi-page requests may need several evictions before a
        // contiguous run opens up; bound the loop against livelock.
        let mut rounds = 0;
        let round_limit = self.pool.frame_count() + 1;
        loop {
            if let Some(addr) = self.pool.alloc_pages(n) {
                for i in 0..n {
                    frames.register(addr.page(i), owner);
                }
                return Ok(addr);
            }

            if frames.is_empty() {
                // Nothing to evict; the pool is simply too small.
                return Err(KernelError::OutOfMemory {
                    requested: n * PAGE_SIZE,
                });
            }
            if rounds >= round_limit {
                log::error!("eviction made no progress after {rounds} rounds");
                panic!("frame eviction livelock");
            }
            self.evict_one(frames);
            rounds += 1;
        }
    }

    /// Evict one frame chosen by the clock hand: write it to swap if its
    /// user mapping is dirty, tear down the owner's page-table entry,
    /// and return the frame to the pool.
    fn evict_one(&self, frames: &mut MutexGuard<'_, FrameTable>) {
        let victim = frames.clock_victim();

        if let Some(mapping) = frames.take_mapping(victim.kpage) {
            if let Some(thread) = self.threads.get(mapping.owner) {
                let mut pagedir = thread.pagedir.lock();
                if pagedir.is_dirty(mapping.upage) {
                    if !self.swap.available() {
                        log::error!(
                            "dirty page {:#x} under memory pressure with no swap device",
                            mapping.upage.as_usize()
                        );
                        panic!("out of frames and no swap device");
                    }
                    self.swap
                        .write_out(&self.pool, mapping.owner, mapping.upage, victim.kpage)
                        .expect("swap write failed during eviction");

                    // The page's backing is swap from now on; keep the
                    // recorded writability.
                    let writable = pagedir.is_writable(mapping.upage).unwrap_or(true);
                    thread
                        .pages
                        .lock()
                        .set(mapping.upage, SuppPage::anonymous(writable));
                }
                pagedir.clear(mapping.upage);
            }
        }

        log::debug!("vm: evicted frame {:#x}", victim.kpage.as_usize());
        self.pool.free_pages(victim.kpage, 1);
    }

    /// Unregister `n` pages starting at `addr` and return them to the
    /// pool. With `evict`, dirty pages are first written to swap exactly
    /// as the clock path would do.
    pub fn release_pages(&self, addr: KernelAddr, n: usize, evict: bool) {
        let mut frames = self.frames.lock();
        for i in 0..n {
            let kpage = addr.page(i);
            if frames.unregister(kpage).is_none() {
                continue;
            }
            if let Some(mapping) = frames.take_mapping(kpage) {
                if let Some(thread) = self.threads.get(mapping.owner) {
                    let mut pagedir = thread.pagedir.lock();
                    if evict && pagedir.is_dirty(mapping.upage) && self.swap.available() {
                        self.swap
                            .write_out(&self.pool, mapping.owner, mapping.upage, kpage)
                            .expect("swap write failed during release");
                        let writable = pagedir.is_writable(mapping.upage).unwrap_or(true);
                        thread
                            .pages
                            .lock()
                            .set(mapping.upage, SuppPage::anonymous(writable));
                    }
                    pagedir.clear(mapping.upage);
                }
            }
            self.pool.free_pages(kpage, 1);
        }
    }

    // -----------------------------------------------------------------
    // Mapping
    // -----------------------------------------------------------------

    /// Install a mapping from `upage` to `kpage` in `owner`'s page table
    /// and record it in the frame-mapping index. Fails if `owner`
    /// already maps `upage`.
    pub fn map(
        &self,
        upage: UserAddr,
        kpage: KernelAddr,
        owner: ThreadId,
        writable: bool,
    ) -> KernelResult<()> {
        let mut frames = self.frames.lock();
        self.map_locked(&mut frames, upage, kpage, owner, writable)
    }

    fn map_locked(
        &self,
        frames: &mut MutexGuard<'_, FrameTable>,
        upage: UserAddr,
        kpage: KernelAddr,
        owner: ThreadId,
        writable: bool,
    ) -> KernelResult<()> {
        let thread = self.threads.get(owner).ok_or(KernelError::NotFound {
            resource: "owning thread",
        })?;
        let mut pagedir = thread.pagedir.lock();
        pagedir.install(upage, kpage, writable)?;
        if let Err(err) = frames.record_mapping(upage, kpage, owner) {
            pagedir.clear(upage);
            return Err(err);
        }
        frames.mark_referenced(kpage);
        Ok(())
    }

    /// Remove any frame mapping referencing `kpage` and clear the
    /// owner's page-table entry.
    pub fn unmap(&self, kpage: KernelAddr) {
        let mut frames = self.frames.lock();
        if let Some(mapping) = frames.take_mapping(kpage) {
            if let Some(thread) = self.threads.get(mapping.owner) {
                thread.pagedir.lock().clear(mapping.upage);
            }
        }
    }

    // -----------------------------------------------------------------
    // Fault-side page materialization
    // -----------------------------------------------------------------

    /// Bring `(owner, upage)` back from its swap slot into a fresh
    /// frame and reinstall the mapping with the recorded writability.
    ///
    /// A page that was evicted clean (never written since its zeroed
    /// birth) has no slot; it is rematerialized as a zero page.
    pub fn swap_in(&self, thread: &Arc<Thread>, upage: UserAddr) -> KernelResult<()> {
        if !self.swap.available() {
            return Err(KernelError::NoSwap);
        }
        let upage = upage.page_base();
        let owner = thread.id();

        let mut frames = self.frames.lock();
        let kpage = self.acquire_locked(&mut frames, owner, 1)?;

        if self.swap.slot_of(owner, upage).is_some() {
            if let Err(err) = self.swap.read_back(&self.pool, owner, upage, kpage) {
                frames.unregister(kpage);
                self.pool.free_pages(kpage, 1);
                return Err(err);
            }
        }

        let writable = thread
            .pages
            .lock()
            .get(upage)
            .map(|p| p.writable)
            .unwrap_or(true);

        if let Err(err) = self.map_locked(&mut frames, upage, kpage, owner, writable) {
            frames.unregister(kpage);
            self.pool.free_pages(kpage, 1);
            return Err(err);
        }
        Ok(())
    }

    /// Allocate and map a zeroed anonymous page (stack growth). Declares
    /// the page in the SPT with origin swap.
    pub fn install_zero_page(
        &self,
        thread: &Arc<Thread>,
        upage: UserAddr,
        writable: bool,
    ) -> KernelResult<()> {
        let upage = upage.page_base();
        let owner = thread.id();

        let mut frames = self.frames.lock();
        let kpage = self.acquire_locked(&mut frames, owner, 1)?;
        if let Err(err) = self.map_locked(&mut frames, upage, kpage, owner, writable) {
            frames.unregister(kpage);
            self.pool.free_pages(kpage, 1);
            return Err(err);
        }
        thread.pages.lock().set(upage, SuppPage::anonymous(writable));
        Ok(())
    }

    /// Materialize a file- or executable-backed page described by its
    /// SPT entry: read `read_bytes` at `ofs`, leave the rest zeroed, and
    /// map with the recorded writability.
    pub fn install_backed_page(
        &self,
        thread: &Arc<Thread>,
        upage: UserAddr,
        entry: &SuppPage,
    ) -> KernelResult<()> {
        debug_assert!(matches!(
            entry.origin,
            PageOrigin::Executable | PageOrigin::File
        ));
        let source = entry.source.as_ref().ok_or(KernelError::NotFound {
            resource: "page source",
        })?;
        let upage = upage.page_base();
        let owner = thread.id();

        let mut frames = self.frames.lock();
        let kpage = self.acquire_locked(&mut frames, owner, 1)?;

        let read = self.pool.with_page(kpage, |page| {
            source.read_at(entry.ofs, &mut page[..entry.read_bytes as usize])
        });
        match read {
            // Short reads leave the tail zeroed, which is exactly the
            // zero_bytes contract.
            Ok(_) => {}
            Err(err) => {
                frames.unregister(kpage);
                self.pool.free_pages(kpage, 1);
                return Err(err);
            }
        }

        if let Err(err) = self.map_locked(&mut frames, upage, kpage, owner, entry.writable) {
            frames.unregister(kpage);
            self.pool.free_pages(kpage, 1);
            return Err(err);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // User memory access (hosted stand-in for user-mode loads/stores)
    // -----------------------------------------------------------------

    /// Store `src` at `addr` in `thread`'s address space, setting dirty
    /// bits as the MMU would. Fails with `InvalidUserPointer` on an
    /// unmapped or read-only page; the caller decides whether to fault.
    pub fn user_write(&self, thread: &Arc<Thread>, addr: UserAddr, src: &[u8]) -> KernelResult<()> {
        let mut done = 0;
        while done < src.len() {
            let cur = addr.offset(done);
            let upage = cur.page_base();
            let offset = cur.page_offset();
            let chunk = (PAGE_SIZE - offset).min(src.len() - done);

            let mut pagedir = thread.pagedir.lock();
            let kpage = pagedir.resolve(upage).ok_or(KernelError::InvalidUserPointer {
                addr: cur.as_usize(),
            })?;
            if pagedir.is_writable(upage) != Some(true) {
                return Err(KernelError::InvalidUserPointer {
                    addr: cur.as_usize(),
                });
            }
            self.pool
                .write_page(kpage, offset, &src[done..done + chunk]);
            pagedir.set_dirty(upage);
            done += chunk;
        }
        Ok(())
    }

    /// Load `dst.len()` bytes from `addr` in `thread`'s address space.
    pub fn user_read(
        &self,
        thread: &Arc<Thread>,
        addr: UserAddr,
        dst: &mut [u8],
    ) -> KernelResult<()> {
        let mut done = 0;
        while done < dst.len() {
            let cur = addr.offset(done);
            let upage = cur.page_base();
            let offset = cur.page_offset();
            let chunk = (PAGE_SIZE - offset).min(dst.len() - done);

            let mut pagedir = thread.pagedir.lock();
            let kpage = pagedir.resolve(upage).ok_or(KernelError::InvalidUserPointer {
                addr: cur.as_usize(),
            })?;
            self.pool.read_page(kpage, offset, &mut dst[done..done + chunk]);
            pagedir.set_accessed(upage);
            done += chunk;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------

    /// Tear down everything `thread` owns: frames, mappings, swap slots,
    /// and the SPT. Called at process exit.
    pub fn destroy_thread(&self, thread: &Arc<Thread>) {
        let owner = thread.id();

        // Frames first, so nothing can evict into the dying SPT.
        {
            let mut frames = self.frames.lock();
            let mut pagedir = thread.pagedir.lock();
            let owned: alloc::vec::Vec<KernelAddr> = pagedir.iter().map(|(_, e)| e.kpage).collect();
            for kpage in owned {
                if frames.unregister(kpage).is_some() {
                    if let Some(mapping) = frames.take_mapping(kpage) {
                        pagedir.clear(mapping.upage);
                    }
                    self.pool.free_pages(kpage, 1);
                }
            }
        }

        // Swap slots referenced by surviving SPT entries.
        let mut pages = thread.pages.lock();
        let swapped: alloc::vec::Vec<UserAddr> = pages
            .iter()
            .filter(|(_, p)| p.origin == PageOrigin::Swap)
            .map(|(upage, _)| *upage)
            .collect();
        for upage in swapped {
            self.swap.release(owner, upage);
        }
        pages.destroy();
        drop(pages);

        self.threads.remove(owner);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::string::ToString;
    use std::vec::Vec;

    use super::*;
    use crate::block::RamBlockDevice;
    use crate::mm::swap::SECTORS_PER_SLOT;

    fn vm_with_swap(frames: usize, slots: u64) -> Vm {
        let swap = Arc::new(RamBlockDevice::new(
            "swap".to_string(),
            slots * SECTORS_PER_SLOT as u64,
        ));
        Vm::new(frames, Some(swap))
    }

    fn upage(n: usize) -> UserAddr {
        UserAddr::new(n * PAGE_SIZE)
    }

    #[test]
    fn kernel_addresses_never_collide() {
        // Property: for any acquire/release interleaving, the frame
        // table never holds two frames with one kernel address.
        let vm = vm_with_swap(4, 8);
        let t = vm.threads().create("p");
        let owner = t.id();

        let mut live: Vec<KernelAddr> = Vec::new();
        let a = vm.acquire_pages(owner, 2).unwrap();
        live.push(a);
        live.push(a.page(1));
        let b = vm.acquire_pages(owner, 1).unwrap();
        live.push(b);

        live.sort();
        live.dedup();
        assert_eq!(live.len(), 3);
        assert_eq!(vm.frames_in_use(), 3);

        vm.release_pages(a, 2, false);
        let c = vm.acquire_pages(owner, 1).unwrap();
        assert_eq!(vm.frames_in_use(), 2);
        assert_ne!(c, b);
    }

    #[test]
    fn map_rejects_double_mapping() {
        let vm = vm_with_swap(4, 4);
        let t = vm.threads().create("p");
        let owner = t.id();

        let k1 = vm.acquire_pages(owner, 1).unwrap();
        let k2 = vm.acquire_pages(owner, 1).unwrap();

        vm.map(upage(1), k1, owner, true).unwrap();
        assert!(vm.map(upage(1), k2, owner, true).is_err());
        // The failed map leaves no stray page-table entry for k2's page.
        assert_eq!(t.pagedir.lock().resolve(upage(1)), Some(k1));
    }

    #[test]
    fn unmap_tears_down_the_pte() {
        let vm = vm_with_swap(2, 4);
        let t = vm.threads().create("p");
        let owner = t.id();

        let k = vm.acquire_pages(owner, 1).unwrap();
        vm.map(upage(3), k, owner, true).unwrap();
        assert!(t.pagedir.lock().resolve(upage(3)).is_some());

        vm.unmap(k);
        assert!(t.pagedir.lock().resolve(upage(3)).is_none());
    }

    #[test]
    fn pressure_evicts_dirty_pages_to_swap() {
        let vm = vm_with_swap(2, 8);
        let t = vm.threads().create("p");
        let owner = t.id();

        // Fill both frames with mapped, dirtied pages.
        for n in 0..2 {
            vm.install_zero_page(&t, upage(n), true).unwrap();
            vm.user_write(&t, upage(n), &[n as u8 + 1; 8]).unwrap();
        }

        // Third page forces one eviction; the victim must land in swap.
        vm.install_zero_page(&t, upage(2), true).unwrap();
        assert_eq!(vm.swap().stats().pages_swapped_out, 1);
        assert_eq!(vm.frames_in_use(), 2);

        // Exactly one of the first two pages lost its mapping.
        let present = (0..2)
            .filter(|&n| t.pagedir.lock().resolve(upage(n)).is_some())
            .count();
        assert_eq!(present, 1);
    }

    #[test]
    fn evicted_page_comes_back_with_its_bytes() {
        // Property: after eviction and refault, the load observes the
        // evicted bytes.
        let vm = vm_with_swap(2, 8);
        let t = vm.threads().create("p");

        vm.install_zero_page(&t, upage(0), true).unwrap();
        vm.user_write(&t, upage(0), b"canary-0").unwrap();

        // Evict page 0 by filling the pool.
        vm.install_zero_page(&t, upage(1), true).unwrap();
        vm.user_write(&t, upage(1), b"canary-1").unwrap();
        vm.install_zero_page(&t, upage(2), true).unwrap();

        // Some earlier page was evicted; refault whichever is gone.
        for n in 0..2 {
            if t.pagedir.lock().resolve(upage(n)).is_none() {
                vm.swap_in(&t, upage(n)).unwrap();
            }
        }

        let mut buf = [0u8; 8];
        vm.user_read(&t, upage(0), &mut buf).unwrap();
        assert_eq!(&buf, b"canary-0");
        vm.user_read(&t, upage(1), &mut buf).unwrap();
        assert_eq!(&buf, b"canary-1");
    }

    #[test]
    fn clean_anonymous_page_rematerializes_as_zeros() {
        let vm = vm_with_swap(1, 4);
        let t = vm.threads().create("p");

        // Never written: stays clean, so eviction drops it silently.
        vm.install_zero_page(&t, upage(0), true).unwrap();
        vm.install_zero_page(&t, upage(1), true).unwrap();
        assert!(t.pagedir.lock().resolve(upage(0)).is_none());
        assert_eq!(vm.swap().stats().pages_swapped_out, 0);

        vm.swap_in(&t, upage(0)).unwrap();
        let mut buf = [0xFFu8; 16];
        vm.user_read(&t, upage(0), &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn writes_to_read_only_pages_are_rejected() {
        let vm = vm_with_swap(2, 4);
        let t = vm.threads().create("p");
        vm.install_zero_page(&t, upage(0), false).unwrap();

        assert!(matches!(
            vm.user_write(&t, upage(0), &[1]),
            Err(KernelError::InvalidUserPointer { .. })
        ));
        let mut buf = [0u8; 1];
        vm.user_read(&t, upage(0), &mut buf).unwrap();
    }

    #[test]
    fn destroy_thread_frees_everything() {
        let vm = vm_with_swap(2, 8);
        let t = vm.threads().create("p");
        let owner = t.id();

        vm.install_zero_page(&t, upage(0), true).unwrap();
        vm.user_write(&t, upage(0), &[7; 4]).unwrap();
        // Force page 0 out to swap so a slot is held.
        vm.install_zero_page(&t, upage(1), true).unwrap();
        vm.user_write(&t, upage(1), &[8; 4]).unwrap();
        vm.install_zero_page(&t, upage(2), true).unwrap();
        assert!(vm.swap().stats().used_slots >= 1);

        vm.destroy_thread(&t);
        assert_eq!(vm.frames_in_use(), 0);
        assert_eq!(vm.pool().used_count(), 0);
        assert_eq!(vm.swap().stats().used_slots, 0);
        assert!(vm.threads().get(owner).is_none());
    }

    #[test]
    fn no_swap_means_panic_is_reserved_for_dirty_pressure() {
        // With no swap device and only clean pages, eviction still works.
        let vm = Vm::new(1, None);
        let t = vm.threads().create("p");
        vm.install_zero_page(&t, upage(0), true).unwrap();
        vm.install_zero_page(&t, upage(1), true).unwrap();
        assert_eq!(vm.frames_in_use(), 1);
    }

    #[test]
    #[should_panic(expected = "no swap device")]
    fn dirty_pressure_without_swap_panics() {
        let vm = Vm::new(1, None);
        let t = vm.threads().create("p");
        vm.install_zero_page(&t, upage(0), true).unwrap();
        vm.user_write(&t, upage(0), &[1; 4]).unwrap();
        // Dirty victim, no swap device: fatal.
        let _ = vm.install_zero_page(&t, upage(1), true);
    }
}
