//! The frame ring: lock-free publish and best-effort latest-frame reads.
//!
//! Writers claim a monotonic ticket from `reserve_index`, write the slot
//! payload, release-store the slot's `frame_id`, then commit in ticket order
//! by advancing `write_index`. Readers validate the commit word, the session
//! stamp, the capacity bound and the checksum, and re-check `write_index` to
//! detect being lapped. Readers never block writers and writers never block
//! readers; a slow reader simply skips frames.

use std::ptr;

use shmx_primitives::sync::{fence, spin_loop, Ordering};
use shmx_primitives::{fold32, framed_size, Fnv1a64, Region, TlvIter, TLV_HEADER_BYTES};

use crate::error::{Error, Result};
use crate::layout::{FrameHeader, GlobalHeader, LayoutPlan, TLV_FRAME_STREAM};

/// Spins at the commit gate before yielding the thread.
const COMMIT_SPINS_BEFORE_YIELD: u32 = 1 << 10;

/// Fixed prefix of a `FRAME_STREAM` TLV payload: `{stream_id, elem_count}`.
const STREAM_TLV_PREFIX: u32 = 8;

/// Addressing for the frame ring region of a segment.
pub(crate) struct FrameRing {
    region: Region,
    plan: LayoutPlan,
}

impl FrameRing {
    pub(crate) fn new(region: Region, plan: LayoutPlan) -> Self {
        Self { region, plan }
    }

    #[inline]
    fn frame_header(&self, slot: u32) -> *mut FrameHeader {
        self.region.offset(self.plan.slot_offset(slot)) as *mut FrameHeader
    }

    #[inline]
    fn payload_base(&self, slot: u32) -> *mut u8 {
        self.region
            .offset(self.plan.slot_offset(slot) + core::mem::size_of::<FrameHeader>())
    }

    /// The slot's commit word.
    ///
    /// Only this field of a shared slot header is ever accessed through a
    /// reference; the plain fields are read and written through raw
    /// pointers because a writer may be racing (the protocol validates
    /// against that after the fact).
    #[inline]
    fn frame_id(&self, slot: u32) -> &shmx_primitives::sync::AtomicU64 {
        // SAFETY: frame_id is the first field of the 64-aligned FrameHeader;
        // the pointer is in bounds per the plan and the atomic is always a
        // valid value (zero-initialized segment).
        unsafe { &(*self.frame_header(slot)).frame_id }
    }

    /// Claim a ticket and return the writable frame cursor.
    pub(crate) fn begin<'a>(&'a self, hdr: &'a GlobalHeader) -> FrameMut<'a> {
        let ticket = hdr.reserve_index.fetch_add(1, Ordering::Relaxed);
        let slot = (ticket % self.plan.slots as u64) as u32;
        // Mark the slot in-progress so readers stop trusting its old frame.
        self.frame_id(slot).store(0, Ordering::Relaxed);
        FrameMut {
            ring: self,
            hdr,
            ticket,
            slot,
            used: 0,
            tlv_count: 0,
            committed: false,
        }
    }

    /// Validated snapshot of the most recently committed frame.
    ///
    /// `expect_session` is the session the caller cached at open time; a
    /// stamp that disagrees with it or with the live header session yields a
    /// view flagged `session_mismatch` with the payload withheld. Failures
    /// are reported precisely ([`Error::ChecksumInvalid`],
    /// [`Error::Overwritten`], [`Error::NoFrame`]); the client surface
    /// collapses all three to "no frame".
    pub(crate) fn latest<'a>(
        &'a self,
        hdr: &GlobalHeader,
        expect_session: u64,
    ) -> Result<FrameView<'a>> {
        let w = hdr.write_index.load(Ordering::Acquire);
        if w == 0 {
            return Err(Error::NoFrame);
        }
        let slot = ((w - 1) % self.plan.slots as u64) as u32;

        let fid = self.frame_id(slot).load(Ordering::Acquire);
        if fid == 0 || fid != w {
            // Overwritten or not yet finalized; freshness is best-effort.
            return Err(Error::NoFrame);
        }

        let fh = self.frame_header(slot);
        // SAFETY: in-bounds slot header; plain fields may race with a lapping
        // writer, which the re-check below detects.
        let (session, sim_time, tlv_count, payload_bytes, checksum) = unsafe {
            (
                (*fh).session_id,
                (*fh).sim_time,
                (*fh).tlv_count,
                (*fh).payload_bytes,
                (*fh).checksum,
            )
        };

        let live_session = hdr.session();
        if session != live_session || session != expect_session {
            tracing::debug!(
                frame = fid,
                stamped = session,
                live = live_session,
                cached = expect_session,
                "session mismatch"
            );
            return Ok(FrameView {
                frame_id: fid,
                session_id: session,
                sim_time,
                tlv_count,
                payload_bytes,
                session_mismatch: true,
                payload: &[],
            });
        }

        if payload_bytes > self.plan.frame_bytes_cap {
            return Err(Error::ChecksumInvalid);
        }
        // SAFETY: payload_bytes <= frame_bytes_cap keeps the slice inside the
        // slot; concurrent overwrites are detected by the re-check below.
        let payload =
            unsafe { std::slice::from_raw_parts(self.payload_base(slot), payload_bytes as usize) };
        if fold32(shmx_primitives::fnv1a64(payload)) != checksum {
            return Err(Error::ChecksumInvalid);
        }

        // The writer may have lapped us while we were validating.
        let w2 = hdr.write_index.load(Ordering::Acquire);
        if w2 > fid + self.plan.slots as u64 - 1 {
            return Err(Error::Overwritten);
        }

        Ok(FrameView {
            frame_id: fid,
            session_id: session,
            sim_time,
            tlv_count,
            payload_bytes,
            session_mismatch: false,
            payload,
        })
    }

    /// Unvalidated-but-checksummed view of one physical slot (introspection).
    pub(crate) fn slot_view<'a>(&'a self, i: u32) -> Result<SlotView<'a>> {
        if i >= self.plan.slots {
            return Err(Error::InvalidArgument("slot index out of range"));
        }
        let fid = self.frame_id(i).load(Ordering::Acquire);
        if fid == 0 {
            return Err(Error::NoFrame);
        }
        let fh = self.frame_header(i);
        // SAFETY: as in latest(); introspection tolerates races.
        let (session_id, sim_time, tlv_count, payload_bytes, checksum) = unsafe {
            (
                (*fh).session_id,
                (*fh).sim_time,
                (*fh).tlv_count,
                (*fh).payload_bytes,
                (*fh).checksum,
            )
        };
        let bytes = payload_bytes.min(self.plan.frame_bytes_cap);
        // SAFETY: clamped to the slot's payload range.
        let payload = unsafe { std::slice::from_raw_parts(self.payload_base(i), bytes as usize) };
        let checksum_ok =
            payload_bytes <= self.plan.frame_bytes_cap && fold32(shmx_primitives::fnv1a64(payload)) == checksum;
        Ok(SlotView {
            frame_id: fid,
            session_id,
            sim_time,
            tlv_count,
            payload_bytes,
            checksum_ok,
            payload,
        })
    }
}

/// A reserved, writable frame.
///
/// Dropping the cursor without publishing still commits the ticket as an
/// empty frame: the in-order commit gate cannot tolerate a hole in the
/// ticket sequence.
pub struct FrameMut<'a> {
    ring: &'a FrameRing,
    hdr: &'a GlobalHeader,
    ticket: u64,
    slot: u32,
    used: u32,
    tlv_count: u32,
    committed: bool,
}

impl<'a> FrameMut<'a> {
    /// The frame id this cursor will publish as.
    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.ticket + 1
    }

    /// Payload bytes appended so far.
    #[inline]
    pub fn payload_bytes(&self) -> u32 {
        self.used
    }

    /// Append one stream's elements as a `FRAME_STREAM` TLV.
    ///
    /// Fails with [`Error::CapacityExceeded`] if the framed TLV would not
    /// fit in `frame_bytes_cap`; the frame is left unchanged.
    pub fn append_stream(&mut self, stream_id: u32, elem_count: u32, bytes: &[u8]) -> Result<()> {
        if bytes.len() > u32::MAX as usize - STREAM_TLV_PREFIX as usize {
            return Err(Error::CapacityExceeded);
        }
        let length = STREAM_TLV_PREFIX + bytes.len() as u32;
        let framed = framed_size(length);
        if framed < length
            || self
                .used
                .checked_add(framed)
                .is_none_or(|total| total > self.ring.plan.frame_bytes_cap)
        {
            return Err(Error::CapacityExceeded);
        }

        let base = self.ring.payload_base(self.slot);
        // SAFETY: [used, used + framed) is within the slot payload (checked
        // above), and this cursor exclusively owns the slot until commit.
        unsafe {
            let dst = base.add(self.used as usize);
            ptr::copy_nonoverlapping(TLV_FRAME_STREAM.to_ne_bytes().as_ptr(), dst, 4);
            ptr::copy_nonoverlapping(length.to_ne_bytes().as_ptr(), dst.add(4), 4);
            ptr::copy_nonoverlapping(stream_id.to_ne_bytes().as_ptr(), dst.add(8), 4);
            ptr::copy_nonoverlapping(elem_count.to_ne_bytes().as_ptr(), dst.add(12), 4);
            ptr::copy_nonoverlapping(bytes.as_ptr(), dst.add(16), bytes.len());
            // Zero the tail padding: it is covered by the checksum and the
            // slot memory is recycled.
            let written = TLV_HEADER_BYTES + length;
            ptr::write_bytes(dst.add(written as usize), 0, (framed - written) as usize);
        }

        self.used += framed;
        self.tlv_count += 1;
        Ok(())
    }

    /// Commit this frame per the publish protocol.
    pub(crate) fn commit(mut self, sim_time: f64) {
        self.commit_inner(sim_time);
    }

    fn commit_inner(&mut self, sim_time: f64) {
        debug_assert!(!self.committed);
        let fh = self.ring.frame_header(self.slot);

        let mut hasher = Fnv1a64::new();
        // SAFETY: we own the slot; payload bytes [0, used) were written above.
        hasher.update(unsafe {
            std::slice::from_raw_parts(self.ring.payload_base(self.slot), self.used as usize)
        });

        // SAFETY: plain header fields, written before the release fence that
        // orders them ahead of the frame_id store.
        unsafe {
            (*fh).session_id = self.hdr.session();
            (*fh).sim_time = sim_time;
            (*fh).tlv_count = self.tlv_count;
            (*fh).payload_bytes = self.used;
            (*fh).checksum = fold32(hasher.finish());
            (*fh).slot_index = self.slot;
        }

        fence(Ordering::Release);
        self.ring
            .frame_id(self.slot)
            .store(self.ticket + 1, Ordering::Release);

        // Commit in ticket order: wait for the previous writer, then advance.
        let mut spins = 0u32;
        loop {
            match self.hdr.write_index.compare_exchange(
                self.ticket,
                self.ticket + 1,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(_) => {
                    spins += 1;
                    if spins > COMMIT_SPINS_BEFORE_YIELD {
                        std::thread::yield_now();
                    } else {
                        spin_loop();
                    }
                }
            }
        }
        self.committed = true;
    }
}

impl Drop for FrameMut<'_> {
    fn drop(&mut self) {
        if !self.committed {
            // Abandoned ticket: publish it empty so later tickets can land.
            self.used = 0;
            self.tlv_count = 0;
            self.commit_inner(0.0);
        }
    }
}

/// A validated view of the latest frame.
///
/// The payload borrows slot memory that the producer may recycle after
/// `slots` further publishes; validity at return time is guaranteed by the
/// overwrite re-check, continued freshness is best-effort by design.
pub struct FrameView<'a> {
    pub frame_id: u64,
    pub session_id: u64,
    pub sim_time: f64,
    pub tlv_count: u32,
    pub payload_bytes: u32,
    /// Set when the frame's session stamp disagrees with the session cached
    /// at open or the live header session. Advisory: the caller decides
    /// whether to re-open. The payload is withheld when set.
    pub session_mismatch: bool,
    pub payload: &'a [u8],
}

/// An introspection view of one physical ring slot.
pub struct SlotView<'a> {
    pub frame_id: u64,
    pub session_id: u64,
    pub sim_time: f64,
    pub tlv_count: u32,
    pub payload_bytes: u32,
    pub checksum_ok: bool,
    pub payload: &'a [u8],
}

/// One stream's bytes within a decoded frame.
#[derive(Debug, Clone, Copy)]
pub struct DecodedStream<'a> {
    pub elem_count: u32,
    pub data: &'a [u8],
}

/// A frame payload decoded into per-stream views.
#[derive(Debug, Default)]
pub struct DecodedFrame<'a> {
    pub streams: Vec<(u32, DecodedStream<'a>)>,
}

impl<'a> DecodedFrame<'a> {
    /// Look up one stream by id.
    pub fn get(&self, stream_id: u32) -> Option<&DecodedStream<'a>> {
        self.streams
            .iter()
            .find(|(id, _)| *id == stream_id)
            .map(|(_, s)| s)
    }
}

/// Walk a frame payload into per-stream views, skipping unknown TLV types.
pub(crate) fn decode_payload<'a>(payload: &'a [u8]) -> Result<DecodedFrame<'a>> {
    let mut decoded = DecodedFrame::default();
    let mut iter = TlvIter::new(payload);
    for (ty, body) in iter.by_ref() {
        if ty != TLV_FRAME_STREAM {
            continue;
        }
        if body.len() < STREAM_TLV_PREFIX as usize {
            return Err(Error::ChecksumInvalid);
        }
        let stream_id = u32::from_ne_bytes(body[..4].try_into().unwrap());
        let elem_count = u32::from_ne_bytes(body[4..8].try_into().unwrap());
        decoded.streams.push((
            stream_id,
            DecodedStream {
                elem_count,
                data: &body[8..],
            },
        ));
    }
    if iter.corrupt() {
        return Err(Error::ChecksumInvalid);
    }
    Ok(decoded)
}
