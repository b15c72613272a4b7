//! Page fault handling.
//!
//! The architecture trap handler is an external collaborator; it
//! packages the faulting address, the fault flags, and the saved user
//! stack pointer into a [`FaultInfo`] and delegates here. The policy
//! tries, in order: stack growth for undeclared pages near the stack
//! pointer, swap-in for pages whose backing is a swap slot, and a
//! file/executable read for declared file-backed pages. Anything else
//! terminates the offending process with exit code -1.

use alloc::sync::Arc;

use bitflags::bitflags;

use crate::mm::spt::PageOrigin;
use crate::mm::vm::Vm;
use crate::mm::{UserAddr, KERNEL_BASE};
use crate::sched::Thread;

/// Upper bound of the user stack region; the stack grows down from
/// here.
pub const STACK_TOP: usize = KERNEL_BASE;

/// Maximum size of the user stack region (8 MiB).
pub const STACK_LIMIT: usize = 8 * 1024 * 1024;

/// How far below the saved stack pointer a fault still counts as stack
/// growth. 32 bytes covers the x86 `push`-family instructions that probe
/// below `esp`.
pub const STACK_HEURISTIC: usize = 32;

bitflags! {
    /// Fault condition bits as delivered by the trap handler.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultFlags: u8 {
        /// The mapping was present; the fault is a rights violation.
        const PRESENT = 1 << 0;
        /// The access was a write.
        const WRITE = 1 << 1;
        /// The access came from user mode.
        const USER = 1 << 2;
    }
}

/// A fault as delivered to the handler.
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    /// The faulting virtual address.
    pub addr: UserAddr,
    pub flags: FaultFlags,
    /// Saved user stack pointer at fault time.
    pub esp: usize,
}

/// What the dispatcher should do after the handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The mapping is installed; retry the faulting access.
    Resolved,
    /// The process must die with this exit code.
    Terminated { exit_code: i32 },
}

const KILLED: FaultOutcome = FaultOutcome::Terminated { exit_code: -1 };

/// Resolve a fault in `thread`'s address space.
pub fn handle_fault(vm: &Vm, thread: &Arc<Thread>, info: FaultInfo) -> FaultOutcome {
    let upage = info.addr.page_base();

    if !info.addr.is_user() {
        return KILLED;
    }
    if info.flags.contains(FaultFlags::PRESENT) {
        // The page is mapped; the access itself was illegal (e.g. a
        // store to a read-only page).
        return KILLED;
    }

    let entry = thread.pages.lock().get(upage);
    let resolved = match entry {
        None => {
            if !is_stack_growth(&info) {
                log::debug!(
                    "fault at {:#x}: no declared page, not stack growth",
                    info.addr.as_usize()
                );
                return KILLED;
            }
            vm.install_zero_page(thread, upage, true)
        }
        Some(entry) => match entry.origin {
            PageOrigin::Swap => vm.swap_in(thread, upage),
            PageOrigin::Executable | PageOrigin::File => {
                vm.install_backed_page(thread, upage, &entry)
            }
        },
    };

    match resolved {
        Ok(()) => FaultOutcome::Resolved,
        Err(err) => {
            log::debug!("fault at {:#x} unresolved: {}", info.addr.as_usize(), err);
            KILLED
        }
    }
}

/// Whether an undeclared fault plausibly extends the user stack: at or
/// above `esp - STACK_HEURISTIC` and within the stack region.
fn is_stack_growth(info: &FaultInfo) -> bool {
    let fa = info.addr.as_usize();
    let floor = info.esp.saturating_sub(STACK_HEURISTIC);
    fa >= floor && fa >= STACK_TOP - STACK_LIMIT && fa < STACK_TOP
}
