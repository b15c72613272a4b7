//! Error types for the Opal kernel core.
//!
//! Recoverable conditions travel as [`KernelError`] values; caller bugs
//! and the fatal resource conditions (saturated frame table without swap,
//! unevictable cache) escalate to `panic!` at the site that detects them.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Frame or metadata allocation failure.
    OutOfMemory { requested: usize },
    /// Swap traffic requested but no swap device is configured.
    NoSwap,
    /// User address that no fault policy can resolve.
    InvalidUserPointer { addr: usize },
    /// Block device transfer outside the device bounds.
    Io { device: &'static str, sector: u64 },
    /// A caller broke a kernel-internal contract (double map, ...).
    PolicyViolation { rule: &'static str },
    /// Subsystem used before `init()` / after teardown.
    NotInitialized { subsystem: &'static str },
    InvalidArgument { name: &'static str, value: &'static str },
    AlreadyExists { resource: &'static str },
    NotFound { resource: &'static str },
}

/// Result type alias using KernelError
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory: requested {requested} bytes")
            }
            Self::NoSwap => write!(f, "no swap device configured"),
            Self::InvalidUserPointer { addr } => {
                write!(f, "invalid user pointer {addr:#x}")
            }
            Self::Io { device, sector } => {
                write!(f, "I/O error on {device} at sector {sector}")
            }
            Self::PolicyViolation { rule } => write!(f, "policy violation: {rule}"),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {subsystem}")
            }
            Self::InvalidArgument { name, value } => {
                write!(f, "invalid argument {name}: {value}")
            }
            Self::AlreadyExists { resource } => write!(f, "{resource} already exists"),
            Self::NotFound { resource } => write!(f, "{resource} not found"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        extern crate std;
        use std::string::ToString;

        let err = KernelError::InvalidUserPointer { addr: 0xdead_b000 };
        assert!(err.to_string().contains("0xdeadb000"));

        let err = KernelError::Io {
            device: "swap",
            sector: 17,
        };
        assert!(err.to_string().contains("swap"));
        assert!(err.to_string().contains("17"));
    }

    #[test]
    fn errors_compare_by_value() {
        assert_eq!(KernelError::NoSwap, KernelError::NoSwap);
        assert_ne!(
            KernelError::NoSwap,
            KernelError::OutOfMemory { requested: 4096 }
        );
    }
}
