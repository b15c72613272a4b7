//! Synchronization Primitives
//!
//! Safe global state management. Fine-grained locking is `spin::Mutex`
//! throughout the crate; this module only adds the once-initialized
//! global container used by the lifecycle glue.

pub mod once_lock;

pub use once_lock::GlobalState;
