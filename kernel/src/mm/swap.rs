//! Swap table.
//!
//! Maps evicted user pages to slots on the swap block device. A slot is
//! one page worth of consecutive sectors; allocation is a single-bit
//! scan-and-flip in the slot bitmap, and the mapping is keyed by
//! `(owner, user page)` so distinct processes can swap the same page
//! number independently. Slot `k` occupies sectors
//! `[k * SECTORS_PER_SLOT, (k + 1) * SECTORS_PER_SLOT)` with no header.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::block::{BlockDevice, SECTOR_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::mm::pool::UserPool;
use crate::mm::{KernelAddr, UserAddr, PAGE_SIZE};
use crate::sched::ThreadId;
use crate::utils::Bitmap;

/// Sectors holding one swapped page.
pub const SECTORS_PER_SLOT: usize = PAGE_SIZE / SECTOR_SIZE;

/// Swap usage counters.
#[derive(Debug, Clone, Copy)]
pub struct SwapStats {
    pub total_slots: usize,
    pub used_slots: usize,
    pub pages_swapped_out: u64,
    pub pages_swapped_in: u64,
}

struct SwapInner {
    /// One bit per slot; set while a mapping references the slot.
    slots: Bitmap,
    /// `(owner, upage)` to slot index.
    map: BTreeMap<(ThreadId, UserAddr), usize>,
}

/// The swap table.
pub struct SwapTable {
    device: Option<Arc<dyn BlockDevice>>,
    inner: Mutex<SwapInner>,
    pages_swapped_out: AtomicU64,
    pages_swapped_in: AtomicU64,
}

impl SwapTable {
    /// Create a swap table over `device`. With `None`, the table reports
    /// unavailable and every swap operation fails.
    pub fn new(device: Option<Arc<dyn BlockDevice>>) -> Self {
        let slot_count = device
            .as_ref()
            .map(|dev| dev.sector_count() as usize * SECTOR_SIZE / PAGE_SIZE)
            .unwrap_or(0);
        if let Some(dev) = device.as_ref() {
            log::info!("swap: {} slots on {}", slot_count, dev.name());
        }
        Self {
            device,
            inner: Mutex::new(SwapInner {
                slots: Bitmap::new(slot_count),
                map: BTreeMap::new(),
            }),
            pages_swapped_out: AtomicU64::new(0),
            pages_swapped_in: AtomicU64::new(0),
        }
    }

    /// Whether a swap device is configured.
    pub fn available(&self) -> bool {
        self.device.is_some()
    }

    /// Slot currently holding `(owner, upage)`, if any.
    pub fn slot_of(&self, owner: ThreadId, upage: UserAddr) -> Option<usize> {
        self.inner.lock().map.get(&(owner, upage.page_base())).copied()
    }

    /// Write the frame at `kpage` out to a fresh swap slot and record
    /// the mapping for `(owner, upage)`.
    ///
    /// # Panics
    /// Panics when the swap device is full; the replacement policy has
    /// no fallback at that point.
    pub fn write_out(
        &self,
        pool: &UserPool,
        owner: ThreadId,
        upage: UserAddr,
        kpage: KernelAddr,
    ) -> KernelResult<()> {
        let device = self.device.as_ref().ok_or(KernelError::NoSwap)?;
        let upage = upage.page_base();

        let slot = {
            let mut inner = self.inner.lock();
            debug_assert!(
                !inner.map.contains_key(&(owner, upage)),
                "page already has a swap slot"
            );
            let Some(slot) = inner.slots.scan_and_flip(0, 1, false) else {
                log::error!("swap device full ({} slots)", inner.slots.len());
                panic!("swap device full");
            };
            inner.map.insert((owner, upage), slot);
            slot
        };

        let base = (slot * SECTORS_PER_SLOT) as u64;
        pool.with_page(kpage, |page| {
            let mut buf = [0u8; SECTOR_SIZE];
            for i in 0..SECTORS_PER_SLOT {
                buf.copy_from_slice(&page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
                device.write_sector(base + i as u64, &buf)?;
            }
            Ok(())
        })?;

        self.pages_swapped_out.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "swap: page {:#x} of thread {} -> slot {}",
            upage.as_usize(),
            owner.0,
            slot
        );
        Ok(())
    }

    /// Read the slot recorded for `(owner, upage)` into the frame at
    /// `kpage`, then free the slot and the mapping.
    pub fn read_back(
        &self,
        pool: &UserPool,
        owner: ThreadId,
        upage: UserAddr,
        kpage: KernelAddr,
    ) -> KernelResult<()> {
        let device = self.device.as_ref().ok_or(KernelError::NoSwap)?;
        let upage = upage.page_base();

        let slot = self
            .slot_of(owner, upage)
            .ok_or(KernelError::NotFound {
                resource: "swap mapping",
            })?;

        let base = (slot * SECTORS_PER_SLOT) as u64;
        pool.with_page(kpage, |page| {
            let mut buf = [0u8; SECTOR_SIZE];
            for i in 0..SECTORS_PER_SLOT {
                device.read_sector(base + i as u64, &mut buf)?;
                page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&buf);
            }
            Ok(())
        })?;

        let mut inner = self.inner.lock();
        inner.slots.set(slot, false);
        inner.map.remove(&(owner, upage));
        drop(inner);

        self.pages_swapped_in.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "swap: slot {} -> page {:#x} of thread {}",
            slot,
            upage.as_usize(),
            owner.0
        );
        Ok(())
    }

    /// Drop the slot held by `(owner, upage)` without reading it
    /// (process exit).
    pub fn release(&self, owner: ThreadId, upage: UserAddr) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.map.remove(&(owner, upage.page_base())) {
            inner.slots.set(slot, false);
        }
    }

    pub fn stats(&self) -> SwapStats {
        let inner = self.inner.lock();
        SwapStats {
            total_slots: inner.slots.len(),
            used_slots: inner.slots.count(true),
            pages_swapped_out: self.pages_swapped_out.load(Ordering::Relaxed),
            pages_swapped_in: self.pages_swapped_in.load(Ordering::Relaxed),
        }
    }
}
