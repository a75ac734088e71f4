//! Shared-memory frame transport.
//!
//! One producer process streams time-ordered, self-describing frames to many
//! consumer processes through a single named shared-memory segment. All hot
//! paths — publishing, latest-frame reads, control messages — synchronize
//! through atomics on the segment; no kernel primitive is touched after the
//! initial mapping.
//!
//! The segment is a flat arena: a validated prelude ([`GlobalHeader`]), an
//! append-only typed schema (the static directory), a table of reader seats
//! with per-seat client→server control rings, and a ring of frame slots
//! published with a reserve/commit ticket protocol. See [`layout`] for the
//! exact plan.
//!
//! Three surfaces:
//!
//! - [`Server`] creates the segment, publishes frames, drains control rings,
//!   and reaps crashed readers.
//! - [`Client`] opens it, reads the latest frame best-effort, refreshes the
//!   schema, and sends control TLVs (claiming a reader seat on first send).
//! - [`Inspector`] maps read-only and snapshots everything without leaving
//!   a trace.
//!
//! Stale mappings are safe: every frame is stamped with the segment's
//! session id, and a destroyed or re-created segment surfaces as a
//! `session_mismatch` flag on the next read rather than as garbage data.

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod directory;
pub mod error;
pub mod frame;
pub mod layout;
pub mod mapping;
pub mod readers;

mod client;
mod inspector;
mod server;

pub use client::Client;
pub use directory::{StaticState, StaticStream};
pub use error::{Error, Result};
pub use frame::{DecodedFrame, DecodedStream, FrameMut, FrameView, SlotView};
pub use inspector::Inspector;
pub use layout::{
    Config, ElementType, GlobalHeader, LayoutPlan, StreamLayout, ENDIAN_TAG, MAGIC,
    TLV_FRAME_STREAM, VER_MAJOR, VER_MINOR,
};
pub use mapping::Mapping;
pub use readers::{ControlMsg, ReaderSnapshot};
pub use server::Server;
