//! Kernel lifecycle glue.
//!
//! [`Kernel::boot`] wires the subsystems together in dependency order:
//! block devices, then the VM manager, then the buffer cache and timer
//! with their service threads. [`Kernel::shutdown`] runs the reverse
//! path and guarantees every dirty cache block reaches the device
//! before the cache goes away.

use alloc::string::String;
use alloc::sync::Arc;

use crate::block::{BlockDevice, BlockRole, DeviceRegistry, RamBlockDevice};
use crate::error::KernelResult;
use crate::fs::cache::{BufferCache, CACHE_CAPACITY};
use crate::mm::vm::Vm;
use crate::sched::Scheduler;
use crate::sync::GlobalState;
use crate::timer::Timer;

/// Boot-time sizing knobs. The compile-time tunables (cache capacity,
/// write-behind interval, timer frequency) live in their modules; this
/// struct only carries what differs per machine.
#[derive(Debug, Clone, Copy)]
pub struct BootConfig {
    /// User frames handed to the VM manager.
    pub user_frames: usize,
    /// Sectors on the filesystem device.
    pub filesys_sectors: u64,
    /// Sectors on the swap device; `None` boots without swap.
    pub swap_sectors: Option<u64>,
    /// Buffer cache capacity in blocks.
    pub cache_capacity: usize,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            user_frames: 256,
            filesys_sectors: 4096,
            swap_sectors: Some(2048),
            cache_capacity: CACHE_CAPACITY,
        }
    }
}

/// The booted kernel core.
pub struct Kernel {
    pub devices: DeviceRegistry,
    pub vm: Vm,
    pub cache: Arc<BufferCache>,
    pub timer: Arc<Timer>,
    pub sched: Arc<dyn Scheduler>,
}

impl Kernel {
    /// Bring up the core over RAM-backed devices and start the service
    /// threads (wake service first; write-behind sleeps through it).
    pub fn boot(config: BootConfig, sched: Arc<dyn Scheduler>) -> KernelResult<Self> {
        let mut devices = DeviceRegistry::new();

        let filesys: Arc<dyn BlockDevice> = Arc::new(RamBlockDevice::new(
            String::from("fs"),
            config.filesys_sectors,
        ));
        devices.register(BlockRole::FileSys, Arc::clone(&filesys))?;

        let swap_device = config.swap_sectors.map(|sectors| {
            Arc::new(RamBlockDevice::new(String::from("swap"), sectors)) as Arc<dyn BlockDevice>
        });
        if let Some(swap) = &swap_device {
            devices.register(BlockRole::Swap, Arc::clone(swap))?;
        }

        let vm = Vm::new(config.user_frames, swap_device);
        let timer = Arc::new(Timer::new(Arc::clone(&sched)));
        let cache = Arc::new(BufferCache::with_capacity(filesys, config.cache_capacity));

        timer.start_wake_service();
        cache.start_write_behind(&sched, &timer);

        log::info!("kernel core up");
        Ok(Self {
            devices,
            vm,
            cache,
            timer,
            sched,
        })
    }

    /// Orderly shutdown: stop the flusher, flush and tear down the
    /// cache synchronously, then stop the wake service.
    pub fn shutdown(&self) -> KernelResult<()> {
        self.cache.stop_write_behind();
        self.cache.teardown()?;
        self.timer.stop_wake_service();
        log::info!("kernel core down");
        Ok(())
    }
}

static KERNEL: GlobalState<Kernel> = GlobalState::new();

/// Publish the booted kernel as the process-wide instance.
pub fn install(kernel: Kernel) -> Result<(), Kernel> {
    KERNEL.init(kernel)
}

/// Run `f` against the process-wide kernel, if one is installed.
pub fn with_kernel<R, F: FnOnce(&Kernel) -> R>(f: F) -> Option<R> {
    KERNEL.with(f)
}
