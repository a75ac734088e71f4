//! Atomic re-exports, swappable for loom under `--features loom`.

#[cfg(not(feature = "loom"))]
pub use core::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
#[cfg(feature = "loom")]
pub use loom::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

#[cfg(not(feature = "loom"))]
pub use core::hint::spin_loop;
#[cfg(feature = "loom")]
pub use loom::hint::spin_loop;

#[cfg(all(not(feature = "loom"), any(test, feature = "std")))]
pub use std::thread;
#[cfg(feature = "loom")]
pub use loom::thread;
