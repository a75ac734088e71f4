//! Lock-free primitives for shared memory transport.
//!
//! This crate provides `no_std`-compatible building blocks that operate on
//! raw pointers into memory-mapped regions:
//!
//! - [`TlvRing`]: single-producer single-consumer byte ring carrying
//!   16-byte-aligned TLV messages with free-running cursors
//! - [`TlvIter`]: bounds-checked walk over a contiguous TLV sequence
//! - [`Fnv1a64`]: the FNV-1a hash used for payload checksums and the
//!   directory content hash
//! - [`Region`]: an unowned view of a mapped byte range
//!
//! # Loom Testing
//!
//! Enable the `loom` feature for concurrency verification. The ring is
//! tested under loom to verify correctness across thread interleavings.
//!
//! ```text
//! cargo test -p shmx-primitives --features loom
//! ```

#![no_std]
#![forbid(unsafe_op_in_unsafe_fn)]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod hash;
pub mod region;
pub mod ring;
pub mod sync;
pub mod tlv;

#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::Region;
pub use ring::{PopError, PushError, TlvRing, TlvRingHeader, RING_HEADER_BYTES};
pub use tlv::{
    align16, align64, align8, framed_size, TlvIter, TLV_ALIGN, TLV_HEADER_BYTES,
};

pub use hash::{fold32, fnv1a64, Fnv1a64};

#[cfg(all(test, feature = "loom"))]
mod loom_tests;
