//! The reader table: seat claim/release, snapshots, and control rings.
//!
//! One [`ReaderSlot`] per seat, paired (when enabled) with one SPSC control
//! ring for client→server messages. A seat is claimed by CAS on `in_use`;
//! the claiming client is the only writer of the seat's liveness fields and
//! the only producer on its ring. The server is the only consumer.

use shmx_primitives::sync::Ordering;
use shmx_primitives::{Region, TlvRing};

use crate::error::{Error, Result};
use crate::layout::{GlobalHeader, LayoutPlan, ReaderSlot};

/// A point-in-time copy of one reader seat.
#[derive(Debug, Clone, Copy)]
pub struct ReaderSnapshot {
    pub in_use: bool,
    pub reader_id: u64,
    pub last_frame_seen: u64,
    pub heartbeat: u64,
    pub session_id_copy: u64,
}

/// One message drained from a control ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMsg {
    /// The claimed seat's reader id at drain time.
    pub reader_id: u64,
    /// Opaque 32-bit message tag.
    pub ty: u32,
    pub data: Vec<u8>,
}

/// Addressing for the reader table and control ring regions.
pub(crate) struct ReaderTable {
    region: Region,
    plan: LayoutPlan,
}

impl ReaderTable {
    pub(crate) fn new(region: Region, plan: LayoutPlan) -> Self {
        Self { region, plan }
    }

    /// Borrow seat `i`. All fields are atomic; sharing is safe.
    pub(crate) fn slot(&self, i: u32) -> &ReaderSlot {
        // SAFETY: reader_offset is in bounds per the plan; a zeroed seat is
        // a valid ReaderSlot value.
        unsafe { self.region.get::<ReaderSlot>(self.plan.reader_offset(i)) }
    }

    /// Attach seat `i`'s control ring, if rings are enabled.
    pub(crate) fn ring(&self, i: u32) -> Option<TlvRing> {
        let offset = self.plan.control_ring_offset(i)?;
        // SAFETY: the ring range is within the segment per the plan, and the
        // ring header was initialized at create time.
        Some(unsafe { TlvRing::attach(self.region, offset, self.plan.control_capacity()) })
    }

    /// Create-time initialization of every seat and ring header.
    ///
    /// # Safety
    ///
    /// Must run before the segment name is visible to any other process.
    pub(crate) unsafe fn init_all(&self) {
        for i in 0..self.plan.reader_slots {
            // SAFETY: exclusive access during creation.
            let slot = unsafe { self.region.get_mut::<ReaderSlot>(self.plan.reader_offset(i)) };
            *slot = unsafe { core::mem::zeroed() };
            if let Some(offset) = self.plan.control_ring_offset(i) {
                // SAFETY: as above; init writes the ring header.
                unsafe { TlvRing::init(self.region, offset, self.plan.control_capacity()) };
            }
        }
    }

    /// Claim the first free seat for `reader_id`.
    pub(crate) fn claim(&self, hdr: &GlobalHeader, reader_id: u64, session: u64) -> Result<u32> {
        debug_assert_ne!(reader_id, 0);
        for i in 0..self.plan.reader_slots {
            let slot = self.slot(i);
            if slot
                .in_use
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            slot.last_frame_seen.store(0, Ordering::Relaxed);
            slot.heartbeat.store(0, Ordering::Relaxed);
            slot.session_id_copy.store(session, Ordering::Relaxed);
            slot.reader_id.store(reader_id, Ordering::Release);
            hdr.readers_connected.fetch_add(1, Ordering::AcqRel);
            tracing::debug!(seat = i, reader_id, "reader seat claimed");
            return Ok(i);
        }
        Err(Error::NoReaderSlot)
    }

    /// Release seat `i` if it is still held by `reader_id`.
    ///
    /// Idempotent against a concurrent reap: only the winner of the
    /// `in_use` CAS decrements `readers_connected`.
    pub(crate) fn release(&self, hdr: &GlobalHeader, i: u32, reader_id: u64) {
        let slot = self.slot(i);
        if slot.reader_id.load(Ordering::Acquire) != reader_id {
            return;
        }
        slot.reader_id.store(0, Ordering::Release);
        if slot
            .in_use
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            hdr.readers_connected.fetch_sub(1, Ordering::AcqRel);
            tracing::debug!(seat = i, reader_id, "reader seat released");
        }
    }

    /// Reap seat `i` (server side). Returns true if this call freed it.
    pub(crate) fn reap(&self, hdr: &GlobalHeader, i: u32) -> bool {
        let slot = self.slot(i);
        let reader_id = slot.reader_id.load(Ordering::Acquire);
        if slot
            .in_use
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            slot.reader_id.store(0, Ordering::Release);
            hdr.readers_connected.fetch_sub(1, Ordering::AcqRel);
            tracing::info!(seat = i, reader_id, "reaped stale reader");
            return true;
        }
        false
    }

    /// Copy out every seat.
    pub(crate) fn snapshot(&self) -> Vec<ReaderSnapshot> {
        (0..self.plan.reader_slots)
            .map(|i| {
                let slot = self.slot(i);
                ReaderSnapshot {
                    in_use: slot.in_use.load(Ordering::Acquire) != 0,
                    reader_id: slot.reader_id.load(Ordering::Acquire),
                    last_frame_seen: slot.last_frame_seen.load(Ordering::Acquire),
                    heartbeat: slot.heartbeat.load(Ordering::Acquire),
                    session_id_copy: slot.session_id_copy.load(Ordering::Acquire),
                }
            })
            .collect()
    }

    pub(crate) fn reader_slots(&self) -> u32 {
        self.plan.reader_slots
    }
}
