//! Safe global initialization without `static mut`.
//!
//! Process-wide singletons (the booted [`crate::bootstrap::Kernel`]) are
//! stored in a [`GlobalState`], a mutex-protected optional slot that is
//! filled exactly once during boot and accessed through closures
//! afterwards.

use spin::Mutex;

/// Safe global state with mutex
pub struct GlobalState<T> {
    inner: Mutex<Option<T>>,
}

impl<T> GlobalState<T> {
    /// Create new uninitialized global state
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Initialize the global state.
    ///
    /// Returns the value back if the slot was already filled.
    pub fn init(&self, value: T) -> Result<(), T> {
        let mut lock = self.inner.lock();
        if lock.is_some() {
            Err(value)
        } else {
            *lock = Some(value);
            Ok(())
        }
    }

    /// Whether the slot has been initialized.
    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Run a closure against the value, if initialized.
    pub fn with<R, F: FnOnce(&T) -> R>(&self, f: F) -> Option<R> {
        let lock = self.inner.lock();
        lock.as_ref().map(f)
    }

    /// Run a closure against the value mutably, if initialized.
    pub fn with_mut<R, F: FnOnce(&mut T) -> R>(&self, f: F) -> Option<R> {
        let mut lock = self.inner.lock();
        lock.as_mut().map(f)
    }

    /// Take the value out, leaving the slot empty (teardown).
    pub fn take(&self) -> Option<T> {
        self.inner.lock().take()
    }
}

impl<T> Default for GlobalState<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::string::String;

    use super::*;

    #[test]
    fn init_once_then_access() {
        let state = GlobalState::new();
        assert!(!state.is_initialized());

        assert!(state.init(String::from("hello")).is_ok());
        assert!(state.is_initialized());

        // Second init hands the value back.
        assert_eq!(state.init(String::from("again")), Err(String::from("again")));

        state.with_mut(|s| s.push_str(" world"));
        assert_eq!(state.with(|s| s.len()), Some(11));
    }

    #[test]
    fn take_empties_the_slot() {
        let state = GlobalState::new();
        state.init(7u32).unwrap();
        assert_eq!(state.take(), Some(7));
        assert!(!state.is_initialized());
        assert_eq!(state.with(|v| *v), None);
    }
}
