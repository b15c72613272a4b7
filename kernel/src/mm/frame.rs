//! Frame table.
//!
//! Ownership registry for every user-pool frame plus the global clock
//! replacement policy. The ring is a `VecDeque` rotated in place: the
//! hand is the front element, advancing rotates by one, and new frames
//! are pushed at the back (immediately behind the hand), so iteration is
//! cyclic and allocation-free. A second index, keyed by kernel address,
//! records each frame's user mapping so eviction can tear down the
//! owner's page-table entry without scanning.
//!
//! Cross-subsystem eviction (dirty check, swap write, PTE teardown) is
//! driven by [`crate::mm::vm::Vm`], which holds this table behind the
//! single frame-table mutex.

use alloc::collections::BTreeMap;
use alloc::collections::VecDeque;

use crate::error::{KernelError, KernelResult};
use crate::mm::{KernelAddr, UserAddr};
use crate::sched::ThreadId;

/// One physical frame owned by a user page.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub kpage: KernelAddr,
    pub owner: ThreadId,
    /// Second-chance bit for the clock hand.
    pub referenced: bool,
}

/// User mapping recorded for a frame, keyed by kernel address.
#[derive(Debug, Clone, Copy)]
pub struct FrameMapping {
    pub upage: UserAddr,
    pub owner: ThreadId,
}

/// The frame ring and its mapping index.
pub struct FrameTable {
    ring: VecDeque<Frame>,
    mappings: BTreeMap<KernelAddr, FrameMapping>,
}

impl FrameTable {
    pub fn new() -> Self {
        Self {
            ring: VecDeque::new(),
            mappings: BTreeMap::new(),
        }
    }

    /// Number of frames in the ring.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Whether a frame with kernel address `kpage` is registered.
    pub fn contains(&self, kpage: KernelAddr) -> bool {
        self.ring.iter().any(|f| f.kpage == kpage)
    }

    /// Register a freshly allocated frame, reference bit set.
    ///
    /// # Panics
    /// Panics if a frame with the same kernel address already exists;
    /// the pool never hands out an address twice.
    pub fn register(&mut self, kpage: KernelAddr, owner: ThreadId) {
        assert!(
            !self.contains(kpage),
            "frame {:#x} registered twice",
            kpage.as_usize()
        );
        self.ring.push_back(Frame {
            kpage,
            owner,
            referenced: true,
        });
    }

    /// Remove the frame with kernel address `kpage` from the ring.
    pub fn unregister(&mut self, kpage: KernelAddr) -> Option<Frame> {
        let pos = self.ring.iter().position(|f| f.kpage == kpage)?;
        self.ring.remove(pos)
    }

    /// Give the frame a second chance on the next clock sweep.
    pub fn mark_referenced(&mut self, kpage: KernelAddr) {
        if let Some(frame) = self.ring.iter_mut().find(|f| f.kpage == kpage) {
            frame.referenced = true;
        }
    }

    /// Record the user mapping for `kpage`.
    ///
    /// Rejects a second mapping of the same user page by the same owner
    /// and a second mapping of the same frame.
    pub fn record_mapping(
        &mut self,
        upage: UserAddr,
        kpage: KernelAddr,
        owner: ThreadId,
    ) -> KernelResult<()> {
        if self.mappings.contains_key(&kpage) {
            return Err(KernelError::AlreadyExists {
                resource: "frame mapping",
            });
        }
        if self
            .mappings
            .values()
            .any(|m| m.owner == owner && m.upage == upage)
        {
            return Err(KernelError::AlreadyExists {
                resource: "frame mapping",
            });
        }
        self.mappings.insert(kpage, FrameMapping { upage, owner });
        Ok(())
    }

    /// The mapping recorded for `kpage`, if any.
    pub fn mapping(&self, kpage: KernelAddr) -> Option<FrameMapping> {
        self.mappings.get(&kpage).copied()
    }

    /// Remove and return the mapping recorded for `kpage`.
    pub fn take_mapping(&mut self, kpage: KernelAddr) -> Option<FrameMapping> {
        self.mappings.remove(&kpage)
    }

    /// Select and remove an eviction victim with the clock algorithm:
    /// advance the hand, clearing reference bits, and take the first
    /// frame whose bit is already clear. The hand ends up on the
    /// victim's successor.
    ///
    /// # Panics
    /// Panics if the ring is empty or the sweep finds no victim within
    /// two full turns; both indicate a caller bug.
    pub fn clock_victim(&mut self) -> Frame {
        assert!(!self.ring.is_empty(), "clock sweep over an empty ring");
        let mut steps = 0;
        let limit = self.ring.len() * 2;
        loop {
            let front = self.ring.front_mut().expect("ring shrank during sweep");
            if front.referenced {
                front.referenced = false;
                self.ring.rotate_left(1);
            } else {
                return self.ring.pop_front().expect("ring shrank during sweep");
            }
            steps += 1;
            if steps > limit {
                log::error!("clock sweep found no evictable frame");
                panic!("no evictable frame after a full clock sweep");
            }
        }
    }
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{KERNEL_BASE, PAGE_SIZE};

    fn kpage(n: usize) -> KernelAddr {
        KernelAddr::new(KERNEL_BASE + n * PAGE_SIZE)
    }

    fn upage(n: usize) -> UserAddr {
        UserAddr::new(n * PAGE_SIZE)
    }

    #[test]
    fn register_and_unregister() {
        let mut table = FrameTable::new();
        let owner = ThreadId::next();
        table.register(kpage(0), owner);
        table.register(kpage(1), owner);
        assert_eq!(table.len(), 2);

        let frame = table.unregister(kpage(0)).unwrap();
        assert_eq!(frame.kpage, kpage(0));
        assert!(table.unregister(kpage(0)).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_kernel_address_panics() {
        let mut table = FrameTable::new();
        let owner = ThreadId::next();
        table.register(kpage(0), owner);
        table.register(kpage(0), owner);
    }

    #[test]
    fn clock_gives_every_frame_a_second_chance() {
        let mut table = FrameTable::new();
        let owner = ThreadId::next();
        for n in 0..3 {
            table.register(kpage(n), owner);
        }

        // All bits start set, so the first sweep clears them all and
        // selects the frame the hand started on.
        let victim = table.clock_victim();
        assert_eq!(victim.kpage, kpage(0));
        assert_eq!(table.len(), 2);

        // Re-referencing frame 1 pushes the hand past it.
        table.mark_referenced(kpage(1));
        let victim = table.clock_victim();
        assert_eq!(victim.kpage, kpage(2));
    }

    #[test]
    fn hand_advances_past_victim() {
        let mut table = FrameTable::new();
        let owner = ThreadId::next();
        for n in 0..4 {
            table.register(kpage(n), owner);
        }
        let first = table.clock_victim();
        let second = table.clock_victim();
        assert_ne!(first.kpage, second.kpage);
        // Victims come out in ring order once bits are cleared.
        assert_eq!(first.kpage, kpage(0));
        assert_eq!(second.kpage, kpage(1));
    }

    #[test]
    fn double_map_rejected() {
        let mut table = FrameTable::new();
        let owner = ThreadId::next();
        table.register(kpage(0), owner);
        table.register(kpage(1), owner);

        table.record_mapping(upage(5), kpage(0), owner).unwrap();
        // Same user page, same owner, different frame: rejected.
        assert!(table.record_mapping(upage(5), kpage(1), owner).is_err());
        // Same frame mapped twice: rejected.
        assert!(table.record_mapping(upage(6), kpage(0), owner).is_err());

        // A different owner may map the same user page number.
        let other = ThreadId::next();
        table.record_mapping(upage(5), kpage(1), other).unwrap();
    }

    #[test]
    fn take_mapping_clears_the_index() {
        let mut table = FrameTable::new();
        let owner = ThreadId::next();
        table.register(kpage(0), owner);
        table.record_mapping(upage(1), kpage(0), owner).unwrap();

        let mapping = table.take_mapping(kpage(0)).unwrap();
        assert_eq!(mapping.upage, upage(1));
        assert!(table.mapping(kpage(0)).is_none());
    }
}
