//! The consumer surface: open, read the latest frame, refresh the schema,
//! and talk back over the control ring.

use shmx_primitives::sync::Ordering;
use shmx_primitives::{PushError, Region};

use crate::directory::{self, StaticState};
use crate::error::{Error, Result};
use crate::frame::{decode_payload, DecodedFrame, FrameRing, FrameView};
use crate::layout::{GlobalHeader, LayoutPlan};
use crate::mapping::Mapping;
use crate::readers::ReaderTable;

/// A client attachment to an existing segment.
///
/// Reading (`latest`, `refresh_static`) never registers the client anywhere;
/// the first `control_send` lazily claims a reader seat, which is what makes
/// the client visible to the server's snapshots and reaper. Control sends
/// take `&mut self`: each ring has exactly one producer.
pub struct Client {
    region: Region,
    plan: LayoutPlan,
    frames: FrameRing,
    readers: ReaderTable,
    /// Session observed at open; every read is checked against it.
    session: u64,
    /// This process's random nonzero reader identity.
    reader_id: u64,
    /// Claimed seat, if any.
    seat: Option<u32>,
    /// Highest frame id already handed to the caller; `latest` reports each
    /// frame once.
    last_delivered: std::cell::Cell<u64>,
    _mapping: Mapping,
}

// SAFETY: shared segment access is atomic per the read protocols; the
// mutable seat state is plain Rust data.
unsafe impl Send for Client {}

impl Client {
    /// Open and validate the segment `name`.
    pub fn open(name: &str) -> Result<Self> {
        let mapping = Mapping::open(name)?;
        // SAFETY: mapping outlives region; stored in the struct together.
        let region = unsafe { Region::from_raw(mapping.base(), mapping.len()) };
        if mapping.len() < core::mem::size_of::<GlobalHeader>() {
            return Err(Error::BadMagicOrEndian);
        }
        // SAFETY: size checked; validation rejects garbage before any field
        // is trusted.
        let hdr = unsafe { region.get::<GlobalHeader>(0) };
        hdr.validate(mapping.len())?;

        let session = hdr.session();
        if session == 0 {
            // Destroyed segment lingering in the namespace.
            return Err(Error::SessionMismatch);
        }
        let plan = hdr.plan();

        let mut reader_id: u64 = rand::random();
        while reader_id == 0 {
            reader_id = rand::random();
        }

        tracing::debug!(name, session, reader_id, "client opened segment");
        Ok(Self {
            region,
            plan,
            frames: FrameRing::new(region, plan),
            readers: ReaderTable::new(region, plan),
            session,
            reader_id,
            seat: None,
            last_delivered: std::cell::Cell::new(0),
            _mapping: mapping,
        })
    }

    /// The segment prelude.
    pub fn header(&self) -> &GlobalHeader {
        // SAFETY: validated at open; mapped while self lives.
        unsafe { self.region.get::<GlobalHeader>(0) }
    }

    /// The layout plan stored in the segment.
    pub fn layout(&self) -> LayoutPlan {
        self.plan
    }

    /// The session this client attached to.
    pub fn session(&self) -> u64 {
        self.session
    }

    /// This client's reader identity.
    pub fn reader_id(&self) -> u64 {
        self.reader_id
    }

    /// The claimed seat index, if `control_send` has run.
    pub fn reader_index(&self) -> Option<u32> {
        self.seat
    }

    /// Validated view of the most recently published frame.
    ///
    /// Each committed frame is delivered at most once: a repeat call with no
    /// intervening publish returns [`Error::NoFrame`], as do checksum
    /// failures and overwrite races. A session change is not an error: the
    /// view comes back with `session_mismatch` set and the caller is
    /// expected to re-open.
    pub fn latest(&self) -> Result<FrameView<'_>> {
        let view = self
            .frames
            .latest(self.header(), self.session)
            .map_err(|e| match e {
                // Best-effort freshness: the next call observes the next
                // committed frame, so these are not distinct client errors.
                Error::ChecksumInvalid | Error::Overwritten => Error::NoFrame,
                other => other,
            })?;
        if !view.session_mismatch {
            if view.frame_id == self.last_delivered.get() {
                return Err(Error::NoFrame);
            }
            self.last_delivered.set(view.frame_id);
            if let Some(seat) = self.seat {
                self.readers
                    .slot(seat)
                    .last_frame_seen
                    .store(view.frame_id, Ordering::Release);
            }
        }
        Ok(view)
    }

    /// Parse a frame payload into per-stream views.
    pub fn decode<'a>(view: &FrameView<'a>) -> Result<DecodedFrame<'a>> {
        decode_payload(view.payload)
    }

    /// Refresh the cached directory; returns true if it changed.
    pub fn refresh_static(&self, state: &mut StaticState) -> Result<bool> {
        directory::refresh(self.header(), self.region, &self.plan, state)
    }

    /// Push one TLV to the server, claiming a reader seat on first use.
    pub fn control_send(&mut self, ty: u32, data: &[u8]) -> Result<()> {
        if self.plan.control_stride == 0 {
            return Err(Error::InvalidArgument("control rings are disabled"));
        }
        let seat = match self.seat {
            Some(seat) => seat,
            None => {
                let seat = self
                    .readers
                    .claim(self.header(), self.reader_id, self.session)?;
                self.seat = Some(seat);
                seat
            }
        };
        let ring = self
            .readers
            .ring(seat)
            .ok_or(Error::InvalidArgument("control rings are disabled"))?;
        ring.try_push(ty, data).map_err(|e| match e {
            PushError::Full | PushError::Oversize => Error::RingFull,
        })
    }

    /// Stamp this client's liveness tick. Returns false until a seat has
    /// been claimed (ticks are meaningless to the reaper before that).
    pub fn heartbeat(&self, tick: u64) -> bool {
        match self.seat {
            Some(seat) => {
                self.readers
                    .slot(seat)
                    .heartbeat
                    .store(tick, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Release the seat (if any) and unmap.
    pub fn close(self) {
        // Drop does the work; this is the explicit spelling.
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(seat) = self.seat.take() {
            self.readers.release(self.header(), seat, self.reader_id);
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session", &self.session)
            .field("reader_id", &self.reader_id)
            .field("seat", &self.seat)
            .finish_non_exhaustive()
    }
}
