//! Buffer cache.
//!
//! A fixed-capacity, write-back sector cache in front of the filesystem
//! block device. Lookup is a map keyed by sector index; replacement is
//! a clock sweep over a ring of blocks, skipping blocks that a thread
//! is currently copying in or out of. A dedicated write-behind thread
//! flushes dirty blocks every [`WRITE_BEHIND_INTERVAL_MS`].
//!
//! Locking discipline: the state lock (map + ring) is taken for lookups
//! and membership changes; each block's access lock serializes content
//! copies with the flusher; the create lock serializes creations and
//! evictions. Lock order is state lock before access lock. The create
//! lock may wrap both but is never acquired while holding either.
//!
//! A block's `in_use` flag is raised under the state lock when a lookup
//! hands the block out and lowered by the same operation once its copy
//! is done; eviction never selects a block whose flag is raised.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use crate::block::{BlockDevice, SECTOR_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::sched::{Scheduler, ThreadId, PRI_DEFAULT};
use crate::timer::Timer;

/// Number of sectors the cache holds.
pub const CACHE_CAPACITY: usize = 64;

/// Interval between write-behind sweeps, in milliseconds.
pub const WRITE_BEHIND_INTERVAL_MS: i64 = 2000;

/// Usage counters. `dirty` is informational; nothing may assume it is
/// exact while writers are active.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub blocks: usize,
    pub dirty: usize,
    pub hits: u64,
    pub misses: u64,
}

/// One cached sector.
struct CacheBlock {
    sector: u64,
    /// The sector bytes; this lock is the block's access lock.
    content: Mutex<Box<[u8; SECTOR_SIZE]>>,
    /// Content differs from the on-device sector.
    dirty: AtomicBool,
    /// Second-chance bit for the clock sweep.
    referenced: AtomicBool,
    /// Some thread is mid-copy; the block must not be evicted.
    in_use: AtomicBool,
}

impl CacheBlock {
    fn new(sector: u64) -> Self {
        Self {
            sector,
            content: Mutex::new(Box::new([0u8; SECTOR_SIZE])),
            dirty: AtomicBool::new(false),
            referenced: AtomicBool::new(true),
            in_use: AtomicBool::new(true),
        }
    }
}

/// Ring and map, behind the state (search) lock.
struct CacheState {
    /// Clock ring; the hand is the front element.
    ring: VecDeque<Arc<CacheBlock>>,
    map: BTreeMap<u64, Arc<CacheBlock>>,
}

/// The buffer cache.
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    capacity: usize,
    state: Mutex<CacheState>,
    create_lock: Mutex<()>,
    enabled: AtomicBool,
    num_dirty: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    run_write_behind: AtomicBool,
}

impl BufferCache {
    /// Cache over `device` with the default capacity.
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self::with_capacity(device, CACHE_CAPACITY)
    }

    /// Cache with an explicit capacity (tests shrink it to force
    /// eviction).
    pub fn with_capacity(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        log::info!("cache: {} blocks over {}", capacity, device.name());
        Self {
            device,
            capacity,
            state: Mutex::new(CacheState {
                ring: VecDeque::with_capacity(capacity),
                map: BTreeMap::new(),
            }),
            create_lock: Mutex::new(()),
            enabled: AtomicBool::new(true),
            num_dirty: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            run_write_behind: AtomicBool::new(false),
        }
    }

    /// Whether the cache is live (not torn down).
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Number of cached sectors.
    pub fn len(&self) -> usize {
        self.state.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            blocks: self.len(),
            dirty: self.num_dirty.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn ensure_enabled(&self) -> KernelResult<()> {
        if self.enabled() {
            Ok(())
        } else {
            Err(KernelError::NotInitialized { subsystem: "cache" })
        }
    }

    /// Look up `sector`. On a hit the block comes back with its
    /// reference bit and `in_use` flag raised; the caller owns clearing
    /// `in_use` once its copy completes.
    fn lookup(&self, sector: u64) -> Option<Arc<CacheBlock>> {
        let state = self.state.lock();
        match state.map.get(&sector) {
            Some(block) => {
                block.referenced.store(true, Ordering::Relaxed);
                block.in_use.store(true, Ordering::Release);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(block))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Create the block for `sector`, evicting if the cache is full.
    /// `init` fills the content before the block becomes visible, so a
    /// concurrent lookup can never observe half-loaded bytes. Returns
    /// the block with `in_use` raised.
    fn create(
        &self,
        sector: u64,
        init: impl FnOnce(&mut [u8; SECTOR_SIZE]) -> KernelResult<()>,
    ) -> KernelResult<Arc<CacheBlock>> {
        let _create = self.create_lock.lock();

        // Another thread may have created the block between our missed
        // lookup and here.
        {
            let state = self.state.lock();
            if let Some(block) = state.map.get(&sector) {
                block.referenced.store(true, Ordering::Relaxed);
                block.in_use.store(true, Ordering::Release);
                return Ok(Arc::clone(block));
            }
        }

        if self.len() == self.capacity {
            self.evict()?;
        }
        debug_assert!(self.len() < self.capacity);

        let block = Arc::new(CacheBlock::new(sector));
        init(&mut **block.content.lock())?;

        let mut state = self.state.lock();
        // New blocks enter behind the hand.
        state.ring.push_back(Arc::clone(&block));
        state.map.insert(sector, Arc::clone(&block));
        Ok(block)
    }

    /// Clock eviction: sweep the ring clearing reference bits, take the
    /// first block that is neither referenced nor in use, and write it
    /// back if dirty. The hand ends on the victim's successor.
    ///
    /// # Panics
    /// Panics if two full turns of the hand find nothing to evict; a
    /// correct caller population cannot pin every block at once.
    fn evict(&self) -> KernelResult<()> {
        let victim = {
            let mut state = self.state.lock();
            let limit = state.ring.len() * 2 + 1;
            let mut steps = 0;
            loop {
                let take = {
                    let front = state.ring.front().expect("eviction on empty cache");
                    !front.in_use.load(Ordering::Acquire)
                        && !front.referenced.swap(false, Ordering::Relaxed)
                };
                if take {
                    let victim = state.ring.pop_front().expect("ring emptied mid-sweep");
                    state.map.remove(&victim.sector);
                    break victim;
                }
                state.ring.rotate_left(1);
                steps += 1;
                if steps > limit {
                    log::error!("every cache block is pinned; cannot evict");
                    panic!("no evictable cache block after a full sweep");
                }
            }
        };

        self.flush_block(&victim)
    }

    /// Write `block` back if dirty and clear its dirty bit.
    fn flush_block(&self, block: &CacheBlock) -> KernelResult<()> {
        if !block.dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        let content = block.content.lock();
        if block.dirty.swap(false, Ordering::AcqRel) {
            if let Err(err) = self.device.write_sector(block.sector, &**content) {
                block.dirty.store(true, Ordering::Release);
                return Err(err);
            }
            self.num_dirty.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn mark_dirty(&self, block: &CacheBlock) {
        if !block.dirty.swap(true, Ordering::AcqRel) {
            self.num_dirty.fetch_add(1, Ordering::Relaxed);
        }
    }

    // -----------------------------------------------------------------
    // Public sector API
    // -----------------------------------------------------------------

    /// Copy `dst.len()` bytes starting at `ofs` within `sector` into
    /// `dst`, loading the sector on a miss.
    pub fn read_in(&self, sector: u64, dst: &mut [u8], ofs: usize) -> KernelResult<()> {
        self.ensure_enabled()?;
        assert!(ofs + dst.len() <= SECTOR_SIZE, "read beyond sector end");

        let block = match self.lookup(sector) {
            Some(block) => block,
            None => self.create(sector, |content| {
                self.device.read_sector(sector, content)
            })?,
        };

        {
            let content = block.content.lock();
            dst.copy_from_slice(&content[ofs..ofs + dst.len()]);
        }
        block.in_use.store(false, Ordering::Release);
        Ok(())
    }

    /// Copy `src` into `sector` at `ofs`, marking the block dirty. A
    /// missed sector gets a zero-initialized cache entry first.
    pub fn write_in(&self, sector: u64, src: &[u8], ofs: usize) -> KernelResult<()> {
        self.ensure_enabled()?;
        assert!(ofs + src.len() <= SECTOR_SIZE, "write beyond sector end");

        let block = match self.lookup(sector) {
            Some(block) => {
                {
                    let mut content = block.content.lock();
                    content[ofs..ofs + src.len()].copy_from_slice(src);
                }
                block
            }
            None => self.create(sector, |content| {
                content[ofs..ofs + src.len()].copy_from_slice(src);
                Ok(())
            })?,
        };

        self.mark_dirty(&block);
        block.in_use.store(false, Ordering::Release);
        Ok(())
    }

    /// Whole-sector read fast path. Returns false on a miss without
    /// loading anything.
    pub fn read(&self, sector: u64, dst: &mut [u8; SECTOR_SIZE]) -> bool {
        if !self.enabled() {
            return false;
        }
        let Some(block) = self.lookup(sector) else {
            return false;
        };
        {
            let content = block.content.lock();
            dst.copy_from_slice(&content[..]);
        }
        block.in_use.store(false, Ordering::Release);
        true
    }

    /// Whole-sector store.
    pub fn write(&self, sector: u64, src: &[u8; SECTOR_SIZE]) -> KernelResult<()> {
        self.write_in(sector, src, 0)
    }

    /// Write back every dirty block. Evicts nothing.
    pub fn flush(&self) -> KernelResult<()> {
        if !self.enabled() {
            return Ok(());
        }
        let blocks: Vec<Arc<CacheBlock>> = {
            let state = self.state.lock();
            state.ring.iter().cloned().collect()
        };
        for block in blocks {
            self.flush_block(&block)?;
        }
        Ok(())
    }

    /// Drop every block without flushing.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        for block in state.ring.drain(..) {
            if block.dirty.swap(false, Ordering::AcqRel) {
                self.num_dirty.fetch_sub(1, Ordering::Relaxed);
            }
        }
        state.map.clear();
    }

    /// Flush, then drop every block and disable the cache.
    pub fn teardown(&self) -> KernelResult<()> {
        self.flush()?;
        self.clear();
        self.enabled.store(false, Ordering::Release);
        log::info!("cache: torn down");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Write-behind
    // -----------------------------------------------------------------

    /// Start the write-behind thread: flush every
    /// [`WRITE_BEHIND_INTERVAL_MS`] until [`Self::stop_write_behind`],
    /// then flush one final time.
    pub fn start_write_behind(
        self: &Arc<Self>,
        sched: &Arc<dyn Scheduler>,
        timer: &Arc<Timer>,
    ) -> ThreadId {
        self.run_write_behind.store(true, Ordering::Release);
        let cache = Arc::clone(self);
        let timer = Arc::clone(timer);
        sched.spawn(
            "write-behind",
            PRI_DEFAULT,
            Box::new(move || {
                while cache.run_write_behind.load(Ordering::Acquire) {
                    if let Err(err) = cache.flush() {
                        log::warn!("write-behind flush failed: {err}");
                    }
                    timer.msleep(WRITE_BEHIND_INTERVAL_MS);
                }
                let _ = cache.flush();
                log::debug!("write-behind stopped");
            }),
        )
    }

    /// Ask the write-behind thread to exit after its current sweep.
    pub fn stop_write_behind(&self) {
        self.run_write_behind.store(false, Ordering::Release);
    }
}
