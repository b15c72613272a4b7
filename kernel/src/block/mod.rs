//! Block Device Facade
//!
//! Raw, uncached sector access plus the role registry that hands the
//! swap and filesystem devices to the subsystems that consume them. The
//! buffer cache and the swap table are the only callers of the raw
//! paths; everything else goes through the cache.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::{vec, vec::Vec};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Size of one device sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Block device trait.
///
/// Sector-granular and shareable: implementations use interior
/// mutability so a device can sit behind an `Arc` in both the cache and
/// the swap table.
pub trait BlockDevice: Send + Sync {
    /// Device name, for diagnostics.
    fn name(&self) -> &str;

    /// Total number of sectors.
    fn sector_count(&self) -> u64;

    /// Read one sector into `buf`.
    fn read_sector(&self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) -> KernelResult<()>;

    /// Write one sector from `buf`.
    fn write_sector(&self, sector: u64, buf: &[u8; SECTOR_SIZE]) -> KernelResult<()>;
}

/// RAM-backed block device (ramdisk / test double).
pub struct RamBlockDevice {
    name: String,
    data: Mutex<Vec<u8>>,
}

impl RamBlockDevice {
    /// Create a zero-filled RAM device with `sector_count` sectors.
    pub fn new(name: String, sector_count: u64) -> Self {
        Self {
            name,
            data: Mutex::new(vec![0u8; sector_count as usize * SECTOR_SIZE]),
        }
    }

    /// Total size in bytes.
    pub fn size(&self) -> usize {
        self.data.lock().len()
    }

    fn byte_range(&self, sector: u64) -> KernelResult<usize> {
        let err = KernelError::Io {
            device: "ram",
            sector,
        };
        let start = (sector as usize).checked_mul(SECTOR_SIZE).ok_or(err)?;
        let end = start.checked_add(SECTOR_SIZE).ok_or(err)?;
        if end > self.data.lock().len() {
            return Err(err);
        }
        Ok(start)
    }
}

impl BlockDevice for RamBlockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn sector_count(&self) -> u64 {
        (self.data.lock().len() / SECTOR_SIZE) as u64
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) -> KernelResult<()> {
        let start = self.byte_range(sector)?;
        let data = self.data.lock();
        buf.copy_from_slice(&data[start..start + SECTOR_SIZE]);
        Ok(())
    }

    fn write_sector(&self, sector: u64, buf: &[u8; SECTOR_SIZE]) -> KernelResult<()> {
        let start = self.byte_range(sector)?;
        let mut data = self.data.lock();
        data[start..start + SECTOR_SIZE].copy_from_slice(buf);
        Ok(())
    }
}

/// The role a registered device plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRole {
    /// Backs the swap table.
    Swap,
    /// Backs the filesystem (fronted by the buffer cache).
    FileSys,
}

/// Registry assigning devices to roles.
///
/// The swap role may stay empty; the VM layer then reports
/// `swap unavailable` and panics under memory pressure instead of
/// evicting dirty pages.
#[derive(Default)]
pub struct DeviceRegistry {
    swap: Option<Arc<dyn BlockDevice>>,
    filesys: Option<Arc<dyn BlockDevice>>,
}

impl DeviceRegistry {
    pub const fn new() -> Self {
        Self {
            swap: None,
            filesys: None,
        }
    }

    /// Assign `device` to `role`. Each role can be filled once.
    pub fn register(&mut self, role: BlockRole, device: Arc<dyn BlockDevice>) -> KernelResult<()> {
        let slot = match role {
            BlockRole::Swap => &mut self.swap,
            BlockRole::FileSys => &mut self.filesys,
        };
        if slot.is_some() {
            return Err(KernelError::AlreadyExists {
                resource: "block device role",
            });
        }
        log::info!(
            "block: {} registered as {:?} ({} sectors)",
            device.name(),
            role,
            device.sector_count()
        );
        *slot = Some(device);
        Ok(())
    }

    /// Device filling `role`, if any.
    pub fn get(&self, role: BlockRole) -> Option<Arc<dyn BlockDevice>> {
        match role {
            BlockRole::Swap => self.swap.clone(),
            BlockRole::FileSys => self.filesys.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::string::ToString;

    use super::*;

    #[test]
    fn ram_device_round_trip() {
        let dev = RamBlockDevice::new("test".to_string(), 100);
        assert_eq!(dev.sector_count(), 100);
        assert_eq!(dev.size(), 100 * SECTOR_SIZE);

        let pattern = [0x42u8; SECTOR_SIZE];
        dev.write_sector(0, &pattern).unwrap();
        dev.write_sector(99, &pattern).unwrap();

        let mut read = [0u8; SECTOR_SIZE];
        dev.read_sector(0, &mut read).unwrap();
        assert_eq!(read, pattern);

        // Unwritten sectors stay zero.
        dev.read_sector(50, &mut read).unwrap();
        assert_eq!(read, [0u8; SECTOR_SIZE]);
    }

    #[test]
    fn out_of_bounds_is_an_io_error() {
        let dev = RamBlockDevice::new("tiny".to_string(), 4);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(
            dev.read_sector(4, &mut buf),
            Err(KernelError::Io {
                device: "ram",
                sector: 4
            })
        );
        assert!(dev.write_sector(u64::MAX / SECTOR_SIZE as u64, &buf).is_err());
    }

    #[test]
    fn registry_roles_fill_once() {
        let mut registry = DeviceRegistry::new();
        assert!(registry.get(BlockRole::Swap).is_none());

        let fs: Arc<dyn BlockDevice> = Arc::new(RamBlockDevice::new("fs".to_string(), 8));
        registry.register(BlockRole::FileSys, fs).unwrap();
        assert_eq!(registry.get(BlockRole::FileSys).unwrap().name(), "fs");
        assert!(registry.get(BlockRole::Swap).is_none());

        let dup: Arc<dyn BlockDevice> = Arc::new(RamBlockDevice::new("fs2".to_string(), 8));
        assert!(registry.register(BlockRole::FileSys, dup).is_err());
    }
}
