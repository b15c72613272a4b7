//! Supplemental page table.
//!
//! Per process, keyed by user page address. Each entry records the
//! provenance of a page whose hardware mapping is absent: where its
//! bytes come from and whether it may be written. The page-fault policy
//! is driven entirely by these entries.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::error::KernelResult;
use crate::mm::UserAddr;

/// Where a faulted-in page gets its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOrigin {
    /// Loaded from the program image at load time.
    Executable,
    /// Anonymous; lives in a swap slot while evicted.
    Swap,
    /// Backed by a file mapping.
    File,
}

/// Byte source for executable- and file-backed pages.
///
/// The filesystem proper is an external collaborator; the loader hands
/// the SPT an opaque reader (typically fronted by the buffer cache).
pub trait PageSource: Send + Sync {
    /// Read up to `buf.len()` bytes at byte offset `ofs`. Returns the
    /// number of bytes read; short reads past end-of-file are zero-fill
    /// territory for the caller.
    fn read_at(&self, ofs: u64, buf: &mut [u8]) -> KernelResult<usize>;
}

/// One supplemental page table entry.
#[derive(Clone)]
pub struct SuppPage {
    pub origin: PageOrigin,
    /// Backing reader for `Executable` / `File` pages.
    pub source: Option<Arc<dyn PageSource>>,
    /// Byte offset of this page's data within the source.
    pub ofs: u64,
    /// Bytes to read from the source.
    pub read_bytes: u32,
    /// Bytes to zero after the read portion.
    pub zero_bytes: u32,
    pub writable: bool,
}

impl SuppPage {
    /// Entry for an anonymous page (stack growth, evicted heap).
    pub fn anonymous(writable: bool) -> Self {
        Self {
            origin: PageOrigin::Swap,
            source: None,
            ofs: 0,
            read_bytes: 0,
            zero_bytes: crate::mm::PAGE_SIZE as u32,
            writable,
        }
    }

    /// Entry for a page backed by `source` at `ofs`.
    pub fn backed(
        origin: PageOrigin,
        source: Arc<dyn PageSource>,
        ofs: u64,
        read_bytes: u32,
        zero_bytes: u32,
        writable: bool,
    ) -> Self {
        debug_assert!(read_bytes as usize + zero_bytes as usize <= crate::mm::PAGE_SIZE);
        Self {
            origin,
            source: Some(source),
            ofs,
            read_bytes,
            zero_bytes,
            writable,
        }
    }
}

/// Supplemental page table of one process.
pub struct SuppPageTable {
    entries: BTreeMap<UserAddr, SuppPage>,
}

impl SuppPageTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Entry for `upage`, if the process has declared the page.
    pub fn get(&self, upage: UserAddr) -> Option<SuppPage> {
        self.entries.get(&upage.page_base()).cloned()
    }

    /// Install or overwrite the entry for `upage`.
    pub fn set(&mut self, upage: UserAddr, page: SuppPage) {
        self.entries.insert(upage.page_base(), page);
    }

    /// Remove the entry for `upage`. The caller clears the hardware
    /// mapping (see [`crate::sched::Thread::free_page`]).
    pub fn free(&mut self, upage: UserAddr) -> Option<SuppPage> {
        self.entries.remove(&upage.page_base())
    }

    /// Drop every entry (process exit).
    pub fn destroy(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over declared pages.
    pub fn iter(&self) -> impl Iterator<Item = (&UserAddr, &SuppPage)> {
        self.entries.iter()
    }
}

impl Default for SuppPageTable {
    fn default() -> Self {
        Self::new()
    }
}
