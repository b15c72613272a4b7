//! Small shared utilities.

pub mod bitmap;

pub use bitmap::Bitmap;
