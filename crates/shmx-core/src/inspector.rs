//! Read-only introspection of a live segment.
//!
//! An inspector maps the segment read-only and never mutates shared state:
//! it claims no reader seat, touches no control ring, and performs no atomic
//! read-modify-writes. It can see every ring slot, not just the latest.

use shmx_primitives::Region;

use crate::directory::{self, StaticState, StaticStream};
use crate::error::{Error, Result};
use crate::frame::{decode_payload, DecodedFrame, FrameRing, FrameView, SlotView};
use crate::layout::{GlobalHeader, LayoutPlan};
use crate::mapping::Mapping;
use crate::readers::{ReaderSnapshot, ReaderTable};

/// A passive, read-only attachment to a segment.
pub struct Inspector {
    region: Region,
    plan: LayoutPlan,
    frames: FrameRing,
    readers: ReaderTable,
    _mapping: Mapping,
}

// SAFETY: the inspector only ever loads from the shared segment.
unsafe impl Send for Inspector {}

impl Inspector {
    /// Open and validate the segment `name` read-only.
    pub fn open(name: &str) -> Result<Self> {
        let mapping = Mapping::open_readonly(name)?;
        // SAFETY: mapping outlives region; stored together.
        let region = unsafe { Region::from_raw(mapping.base(), mapping.len()) };
        if mapping.len() < core::mem::size_of::<GlobalHeader>() {
            return Err(Error::BadMagicOrEndian);
        }
        // SAFETY: size checked above.
        let hdr = unsafe { region.get::<GlobalHeader>(0) };
        hdr.validate(mapping.len())?;
        let plan = hdr.plan();

        Ok(Self {
            region,
            plan,
            frames: FrameRing::new(region, plan),
            readers: ReaderTable::new(region, plan),
            _mapping: mapping,
        })
    }

    /// The segment prelude.
    pub fn header(&self) -> &GlobalHeader {
        // SAFETY: validated at open; mapped while self lives.
        unsafe { self.region.get::<GlobalHeader>(0) }
    }

    /// Every offset and stride of the segment.
    pub fn layout(&self) -> LayoutPlan {
        self.plan
    }

    /// Validated view of the latest frame. The session check uses the live
    /// header session only — an inspector has no session of its own.
    pub fn latest(&self) -> Result<FrameView<'_>> {
        let session = self.header().session();
        self.frames.latest(self.header(), session)
    }

    /// Raw view of physical ring slot `i`, whatever its state.
    pub fn slot_view(&self, i: u32) -> Result<SlotView<'_>> {
        self.frames.slot_view(i)
    }

    /// Parse a frame payload into per-stream views.
    pub fn decode_frame<'a>(view: &FrameView<'a>) -> Result<DecodedFrame<'a>> {
        decode_payload(view.payload)
    }

    /// Parse the current static directory.
    pub fn decode_static_dir(&self) -> Result<Vec<StaticStream>> {
        let mut state = StaticState::default();
        directory::refresh(self.header(), self.region, &self.plan, &mut state)?;
        Ok(state.entries)
    }

    /// Copy out the reader table.
    pub fn snapshot_readers(&self) -> Vec<ReaderSnapshot> {
        self.readers.snapshot()
    }

    /// Unmap. Nothing in the segment records that we were here.
    pub fn close(self) {}
}
