//! Segment layout definitions.
//!
//! This module defines the `repr(C)` prelude of the shared segment and the
//! deterministic plan that places every region behind it. The plan is
//! computed once at create time, written into the header, and read back
//! verbatim by openers — it is never recomputed from configuration.
//!
//! # Memory Layout
//!
//! ```text
//! +--------------------------------------------------------------------+
//! | GlobalHeader (128 bytes, cache-line aligned)                       |
//! |   magic, endian tag, version, session, plan, publish counters      |
//! +--------------------------------------------------------------------+
//! | Static directory (static_cap bytes, append-only typed schema)      |
//! +--------------------------------------------------------------------+
//! | Reader table (reader_slots x 64 bytes)                             |
//! +--------------------------------------------------------------------+
//! | Control rings (reader_slots x control_stride bytes, optional)      |
//! |   Each: TlvRingHeader (16 B) + byte buffer                         |
//! +--------------------------------------------------------------------+
//! | Frame ring (slots x slot_stride bytes)                             |
//! |   Each: FrameHeader (64 B) + payload (align64(frame_bytes_cap))    |
//! +--------------------------------------------------------------------+
//! ```

use shmx_primitives::sync::{AtomicU32, AtomicU64, Ordering};
use shmx_primitives::{align16, align64, RING_HEADER_BYTES};

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Magic bytes identifying a segment (layout v2).
pub const MAGIC: [u8; 8] = *b"SHMX\0\0\0\x02";

/// Endianness sentinel, written native. A reader that sees the byte-swapped
/// value is on an incompatible host.
pub const ENDIAN_TAG: u32 = 0x0102_0304;

/// Protocol major version; openers require equality.
pub const VER_MAJOR: u32 = 2;

/// Protocol minor version; differences are accepted.
pub const VER_MINOR: u32 = 0;

/// TLV type carrying one stream's elements in a frame payload.
pub const TLV_FRAME_STREAM: u32 = 1;

/// Minimum frame ring depth. Below this a reader cannot consistently
/// observe a not-yet-overwritten latest slot while the producer advances.
pub const MIN_SLOTS: u32 = 3;

/// Minimum per-frame payload capacity.
pub const MIN_FRAME_BYTES: u32 = 64;

/// Element type codes for static directory entries.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    Bool = 1,
    I8 = 2,
    U8 = 3,
    I16 = 4,
    U16 = 5,
    I32 = 6,
    U32 = 7,
    I64 = 8,
    U64 = 9,
    F16 = 10,
    Bf16 = 11,
    F32 = 12,
    F64 = 13,
}

impl ElementType {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::Bool,
            2 => Self::I8,
            3 => Self::U8,
            4 => Self::I16,
            5 => Self::U16,
            6 => Self::I32,
            7 => Self::U32,
            8 => Self::I64,
            9 => Self::U64,
            10 => Self::F16,
            11 => Self::Bf16,
            12 => Self::F32,
            13 => Self::F64,
            _ => return None,
        })
    }
}

/// Element arrangement codes for static directory entries.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamLayout {
    SoaScalar = 1,
    AosVector = 2,
}

impl StreamLayout {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::SoaScalar),
            2 => Some(Self::AosVector),
            _ => None,
        }
    }
}

// =============================================================================
// Configuration & Plan
// =============================================================================

/// Creation-time configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Frame ring depth (>= 3).
    pub slots: u32,
    /// Reader seats (>= 1).
    pub reader_slots: u32,
    /// Static directory capacity in bytes (rounded up to 64).
    pub static_bytes_cap: u32,
    /// Per-frame payload capacity (>= 64).
    pub frame_bytes_cap: u32,
    /// Per-reader control ring size including its 16-byte header;
    /// 0 disables control rings.
    pub control_per_reader: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slots: 4,
            reader_slots: 16,
            static_bytes_cap: 4096,
            frame_bytes_cap: 65536,
            control_per_reader: 4096,
        }
    }
}

/// The computed segment plan: every offset and stride, plus the inputs.
///
/// Single source of truth for navigation; all cross-region "references" are
/// `(offset, length)` pairs validated against this plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutPlan {
    pub slots: u32,
    pub reader_slots: u32,
    pub frame_bytes_cap: u32,
    pub control_per_reader: u32,

    pub static_offset: u32,
    pub static_cap: u32,
    pub readers_offset: u32,
    pub reader_stride: u32,
    pub control_offset: u32,
    pub control_stride: u32,
    pub slots_offset: u32,
    pub slot_stride: u32,
    pub total: u64,
}

impl LayoutPlan {
    /// Compute the plan for `config`, validating its constraints.
    pub fn compute(config: &Config) -> Result<Self> {
        if config.slots < MIN_SLOTS {
            return Err(Error::InvalidArgument("slots must be >= 3"));
        }
        if config.reader_slots < 1 {
            return Err(Error::InvalidArgument("reader_slots must be >= 1"));
        }
        if config.frame_bytes_cap < MIN_FRAME_BYTES {
            return Err(Error::InvalidArgument("frame_bytes_cap must be >= 64"));
        }
        if config.control_per_reader != 0
            && config.control_per_reader < RING_HEADER_BYTES + 16
        {
            return Err(Error::InvalidArgument(
                "control_per_reader must fit the ring header plus one TLV",
            ));
        }

        let header_aligned = align64(core::mem::size_of::<GlobalHeader>() as u32);
        let static_offset = header_aligned;
        let static_cap = align64(config.static_bytes_cap);

        let readers_offset = static_offset
            .checked_add(static_cap)
            .ok_or(Error::InvalidArgument("layout overflow (readers)"))?;
        let reader_stride = align64(core::mem::size_of::<ReaderSlot>() as u32);

        let readers_total = reader_stride
            .checked_mul(config.reader_slots)
            .ok_or(Error::InvalidArgument("layout overflow (reader table)"))?;
        let control_offset = readers_offset
            .checked_add(readers_total)
            .ok_or(Error::InvalidArgument("layout overflow (control)"))?;
        let control_stride = if config.control_per_reader == 0 {
            0
        } else {
            align16(config.control_per_reader)
        };

        let control_total = control_stride
            .checked_mul(config.reader_slots)
            .ok_or(Error::InvalidArgument("layout overflow (control rings)"))?;
        // Control strides are only 16-aligned; round the slot area back up
        // to cache-line alignment for the frame headers.
        let slots_offset = align64(
            control_offset
                .checked_add(control_total)
                .ok_or(Error::InvalidArgument("layout overflow (slots)"))?,
        );
        let slot_stride = align64(core::mem::size_of::<FrameHeader>() as u32)
            .checked_add(align64(config.frame_bytes_cap))
            .ok_or(Error::InvalidArgument("layout overflow (slot stride)"))?;

        let total = slots_offset as u64 + slot_stride as u64 * config.slots as u64;

        Ok(Self {
            slots: config.slots,
            reader_slots: config.reader_slots,
            frame_bytes_cap: config.frame_bytes_cap,
            control_per_reader: config.control_per_reader,
            static_offset,
            static_cap,
            readers_offset,
            reader_stride,
            control_offset,
            control_stride,
            slots_offset,
            slot_stride,
            total,
        })
    }

    /// Byte offset of frame slot `i`.
    #[inline]
    pub fn slot_offset(&self, i: u32) -> usize {
        debug_assert!(i < self.slots);
        self.slots_offset as usize + i as usize * self.slot_stride as usize
    }

    /// Byte offset of reader slot `i`.
    #[inline]
    pub fn reader_offset(&self, i: u32) -> usize {
        debug_assert!(i < self.reader_slots);
        self.readers_offset as usize + i as usize * self.reader_stride as usize
    }

    /// Byte offset of reader `i`'s control ring header, if rings are enabled.
    #[inline]
    pub fn control_ring_offset(&self, i: u32) -> Option<usize> {
        if self.control_stride == 0 {
            return None;
        }
        debug_assert!(i < self.reader_slots);
        Some(self.control_offset as usize + i as usize * self.control_stride as usize)
    }

    /// Data capacity of each control ring.
    #[inline]
    pub fn control_capacity(&self) -> u32 {
        self.control_stride.saturating_sub(RING_HEADER_BYTES)
    }
}

// =============================================================================
// Global Header
// =============================================================================

/// Segment prelude (128 bytes, cache-line aligned).
///
/// Fields written once at create time are plain; everything visible to
/// concurrent writers or readers is atomic.
#[repr(C, align(64))]
pub struct GlobalHeader {
    /// Magic bytes: `"SHMX\0\0\0\x02"`.
    pub magic: [u8; 8],
    /// Endianness sentinel, written native.
    pub endian_tag: u32,
    /// Major version; openers require equality.
    pub ver_major: u32,
    /// Minor version; differences accepted.
    pub ver_minor: u32,
    _pad0: u32,

    /// Session id minted at create; 0 after destroy (poisoned).
    pub session_id: AtomicU64,
    /// Total segment size in bytes.
    pub total_size: u64,

    // The layout plan, stored so openers never recompute it.
    pub slots: u32,
    pub reader_slots: u32,
    pub static_offset: u32,
    pub static_cap: u32,
    pub readers_offset: u32,
    pub reader_stride: u32,
    pub control_offset: u32,
    pub control_stride: u32,
    pub control_per_reader: u32,
    pub slots_offset: u32,
    pub slot_stride: u32,
    pub frame_bytes_cap: u32,

    /// Readers currently holding a seat.
    pub readers_connected: AtomicU32,
    /// Bytes of the static directory currently published.
    pub static_used: AtomicU32,
    /// Directory generation; bumped after every publish.
    pub static_gen: AtomicU32,
    _pad1: u32,

    /// Count of committed frames; `(write_index - 1) % slots` is the latest.
    pub write_index: AtomicU64,
    /// Count of claimed publish tickets; always >= `write_index`.
    pub reserve_index: AtomicU64,
    /// FNV-1a64 of the published directory bytes.
    pub static_hash: AtomicU64,
}

const _: () = assert!(core::mem::size_of::<GlobalHeader>() == 128);

impl GlobalHeader {
    /// Initialize a fresh header from a plan and session id.
    ///
    /// Called exactly once, before any other process can open the segment.
    pub fn init(&mut self, plan: &LayoutPlan, session_id: u64) {
        self.magic = MAGIC;
        self.endian_tag = ENDIAN_TAG;
        self.ver_major = VER_MAJOR;
        self.ver_minor = VER_MINOR;
        self._pad0 = 0;
        self.session_id = AtomicU64::new(session_id);
        self.total_size = plan.total;
        self.slots = plan.slots;
        self.reader_slots = plan.reader_slots;
        self.static_offset = plan.static_offset;
        self.static_cap = plan.static_cap;
        self.readers_offset = plan.readers_offset;
        self.reader_stride = plan.reader_stride;
        self.control_offset = plan.control_offset;
        self.control_stride = plan.control_stride;
        self.control_per_reader = plan.control_per_reader;
        self.slots_offset = plan.slots_offset;
        self.slot_stride = plan.slot_stride;
        self.frame_bytes_cap = plan.frame_bytes_cap;
        self.readers_connected = AtomicU32::new(0);
        self.static_used = AtomicU32::new(0);
        self.static_gen = AtomicU32::new(0);
        self._pad1 = 0;
        self.write_index = AtomicU64::new(0);
        self.reserve_index = AtomicU64::new(0);
        self.static_hash = AtomicU64::new(0);
    }

    /// Validate the prelude against our protocol and the mapped size.
    pub fn validate(&self, mapped_len: usize) -> Result<()> {
        if self.magic != MAGIC || self.endian_tag != ENDIAN_TAG {
            return Err(Error::BadMagicOrEndian);
        }
        if self.ver_major != VER_MAJOR {
            return Err(Error::VersionMismatch {
                expected: VER_MAJOR,
                found: self.ver_major,
            });
        }
        let plan = self.plan();
        // The stored plan must be self-consistent and fit the mapping.
        if plan.slots < MIN_SLOTS
            || plan.reader_slots < 1
            || plan.frame_bytes_cap < MIN_FRAME_BYTES
            || plan.total as usize > mapped_len
        {
            return Err(Error::BadMagicOrEndian);
        }
        let recomputed = LayoutPlan::compute(&Config {
            slots: plan.slots,
            reader_slots: plan.reader_slots,
            // static_cap is stored already aligned; recompute accepts it.
            static_bytes_cap: plan.static_cap,
            frame_bytes_cap: plan.frame_bytes_cap,
            control_per_reader: plan.control_per_reader,
        })?;
        if recomputed != plan {
            return Err(Error::BadMagicOrEndian);
        }
        Ok(())
    }

    /// The layout plan as stored in the header.
    pub fn plan(&self) -> LayoutPlan {
        LayoutPlan {
            slots: self.slots,
            reader_slots: self.reader_slots,
            frame_bytes_cap: self.frame_bytes_cap,
            control_per_reader: self.control_per_reader,
            static_offset: self.static_offset,
            static_cap: self.static_cap,
            readers_offset: self.readers_offset,
            reader_stride: self.reader_stride,
            control_offset: self.control_offset,
            control_stride: self.control_stride,
            slots_offset: self.slots_offset,
            slot_stride: self.slot_stride,
            total: self.total_size,
        }
    }

    /// Current session id.
    #[inline]
    pub fn session(&self) -> u64 {
        self.session_id.load(Ordering::Acquire)
    }
}

// =============================================================================
// Frame & Reader slot preludes
// =============================================================================

/// Per-slot frame header (64 bytes).
///
/// `frame_id` is the commit word: 0 means empty or in progress, `n` means
/// the slot holds the fully written frame labelled by publish ticket `n - 1`.
#[repr(C, align(64))]
pub struct FrameHeader {
    /// Commit word; pairs release (writer) with acquire (reader).
    pub frame_id: AtomicU64,
    /// Session stamp, copied from the header at publish time.
    pub session_id: u64,
    /// Application timestamp; opaque to the transport.
    pub sim_time: f64,
    /// Number of TLVs in the payload.
    pub tlv_count: u32,
    /// Bytes of payload in use (<= frame_bytes_cap).
    pub payload_bytes: u32,
    /// 32-bit fold of FNV-1a64 over the payload bytes.
    pub checksum: u32,
    /// Physical slot index, for introspection.
    pub slot_index: u32,
    _pad: [u8; 24],
}

const _: () = assert!(core::mem::size_of::<FrameHeader>() == 64);

/// One reader seat (64 bytes).
///
/// A seat with `in_use != 0` and a nonzero `reader_id` is owned by exactly
/// one client process. `last_frame_seen` and `heartbeat` are written by that
/// client only; the server reads them and may reclaim the seat.
#[repr(C, align(64))]
pub struct ReaderSlot {
    /// 0 = free, 1 = claimed. Claimed by CAS.
    pub in_use: AtomicU32,
    _pad0: u32,
    /// Client-chosen random nonzero id; 0 when unclaimed.
    pub reader_id: AtomicU64,
    /// Highest frame id the client has observed.
    pub last_frame_seen: AtomicU64,
    /// Client liveness tick; the tick source is the application's.
    pub heartbeat: AtomicU64,
    /// Segment session at claim time; never updated afterwards.
    pub session_id_copy: AtomicU64,
    _pad1: [u8; 24],
}

const _: () = assert!(core::mem::size_of::<ReaderSlot>() == 64);

// =============================================================================
// Session minting
// =============================================================================

/// Mint a session id: high-resolution wall clock mixed with a
/// process-unique nonce. Monotonic within a process; unique across creates
/// for all practical purposes.
pub fn mint_session_id() -> u64 {
    use std::sync::atomic::{AtomicU64 as StdAtomicU64, Ordering as StdOrdering};
    static NONCE: StdAtomicU64 = StdAtomicU64::new(0);

    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let nonce = NONCE.fetch_add(1, StdOrdering::Relaxed);
    let pid = std::process::id() as u64;
    let mixed = nanos ^ (pid << 48) ^ (nonce << 32);
    // 0 is the poison value stored by destroy.
    mixed.max(1)
}
