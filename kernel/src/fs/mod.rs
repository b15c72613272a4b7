//! Filesystem-side storage layer.
//!
//! The filesystem proper (directories, inodes, descriptors) is an
//! external collaborator; what lives here is the write-back buffer
//! cache it talks through. All filesystem sector traffic goes via
//! [`cache::BufferCache`]; only the cache itself and the swap table
//! touch the block device raw.

pub mod cache;

pub use cache::BufferCache;
