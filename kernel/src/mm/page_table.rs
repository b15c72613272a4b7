//! Per-process page table model.
//!
//! The MMU itself is an external collaborator; this module keeps the
//! software image of each process's page table that the rest of the VM
//! layer consults: present mappings, writability, and the dirty and
//! accessed bits the eviction policy reads. On a hosted build the
//! user-memory helpers in [`crate::mm::vm`] maintain the dirty bits that
//! hardware would otherwise set.

use alloc::collections::BTreeMap;

use bitflags::bitflags;

use crate::error::{KernelError, KernelResult};
use crate::mm::{KernelAddr, UserAddr};

bitflags! {
    /// Per-entry flag bits, mirroring the hardware PTE bits the VM layer
    /// cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u8 {
        const WRITABLE = 1 << 0;
        const DIRTY    = 1 << 1;
        const ACCESSED = 1 << 2;
    }
}

/// One present user mapping.
#[derive(Debug, Clone, Copy)]
pub struct PageTableEntry {
    pub kpage: KernelAddr,
    pub flags: PteFlags,
}

/// Software image of one process's hardware page table.
pub struct PageDirectory {
    entries: BTreeMap<UserAddr, PageTableEntry>,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Install a mapping from `upage` to `kpage`.
    ///
    /// Fails if `upage` is already mapped; a double map is a caller bug
    /// the frame table turns into a rejected operation.
    pub fn install(
        &mut self,
        upage: UserAddr,
        kpage: KernelAddr,
        writable: bool,
    ) -> KernelResult<()> {
        debug_assert!(upage.is_page_aligned());
        if self.entries.contains_key(&upage) {
            return Err(KernelError::AlreadyExists {
                resource: "page mapping",
            });
        }
        let mut flags = PteFlags::empty();
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        self.entries.insert(upage, PageTableEntry { kpage, flags });
        Ok(())
    }

    /// Remove the mapping for `upage`, if present.
    pub fn clear(&mut self, upage: UserAddr) {
        self.entries.remove(&upage.page_base());
    }

    /// Kernel address backing `upage`, or `None` if not present.
    pub fn resolve(&self, upage: UserAddr) -> Option<KernelAddr> {
        self.entries.get(&upage.page_base()).map(|e| e.kpage)
    }

    /// Whether the mapping for `upage` allows stores.
    pub fn is_writable(&self, upage: UserAddr) -> Option<bool> {
        self.entries
            .get(&upage.page_base())
            .map(|e| e.flags.contains(PteFlags::WRITABLE))
    }

    /// Dirty bit of `upage` (false if not mapped).
    pub fn is_dirty(&self, upage: UserAddr) -> bool {
        self.entries
            .get(&upage.page_base())
            .is_some_and(|e| e.flags.contains(PteFlags::DIRTY))
    }

    /// Mark `upage` dirty, as the MMU would on a store.
    pub fn set_dirty(&mut self, upage: UserAddr) {
        if let Some(entry) = self.entries.get_mut(&upage.page_base()) {
            entry.flags |= PteFlags::DIRTY | PteFlags::ACCESSED;
        }
    }

    /// Mark `upage` accessed, as the MMU would on a load.
    pub fn set_accessed(&mut self, upage: UserAddr) {
        if let Some(entry) = self.entries.get_mut(&upage.page_base()) {
            entry.flags |= PteFlags::ACCESSED;
        }
    }

    /// Number of present mappings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over present mappings.
    pub fn iter(&self) -> impl Iterator<Item = (&UserAddr, &PageTableEntry)> {
        self.entries.iter()
    }
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{KERNEL_BASE, PAGE_SIZE};

    fn upage(n: usize) -> UserAddr {
        UserAddr::new(n * PAGE_SIZE)
    }

    fn kpage(n: usize) -> KernelAddr {
        KernelAddr::new(KERNEL_BASE + n * PAGE_SIZE)
    }

    #[test]
    fn install_resolve_clear() {
        let mut pd = PageDirectory::new();
        pd.install(upage(1), kpage(0), true).unwrap();

        assert_eq!(pd.resolve(upage(1)), Some(kpage(0)));
        // Any address within the page resolves.
        assert_eq!(
            pd.resolve(UserAddr::new(PAGE_SIZE + 0x123)),
            Some(kpage(0))
        );
        assert_eq!(pd.is_writable(upage(1)), Some(true));

        pd.clear(upage(1));
        assert_eq!(pd.resolve(upage(1)), None);
        assert!(pd.is_empty());
    }

    #[test]
    fn double_install_rejected() {
        let mut pd = PageDirectory::new();
        pd.install(upage(2), kpage(0), false).unwrap();
        assert_eq!(
            pd.install(upage(2), kpage(1), false),
            Err(KernelError::AlreadyExists {
                resource: "page mapping"
            })
        );
        // Original mapping untouched.
        assert_eq!(pd.resolve(upage(2)), Some(kpage(0)));
    }

    #[test]
    fn dirty_tracking() {
        let mut pd = PageDirectory::new();
        pd.install(upage(3), kpage(2), true).unwrap();
        assert!(!pd.is_dirty(upage(3)));

        pd.set_dirty(UserAddr::new(3 * PAGE_SIZE + 77));
        assert!(pd.is_dirty(upage(3)));

        // Reinstall after clear starts clean.
        pd.clear(upage(3));
        pd.install(upage(3), kpage(2), true).unwrap();
        assert!(!pd.is_dirty(upage(3)));
    }

    #[test]
    fn dirty_on_unmapped_page_is_false() {
        let mut pd = PageDirectory::new();
        assert!(!pd.is_dirty(upage(9)));
        pd.set_dirty(upage(9));
        assert!(!pd.is_dirty(upage(9)));
    }
}
