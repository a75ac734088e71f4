//! The producer surface: owns the segment, publishes frames, drains control
//! rings, and reaps dead readers.

use parking_lot::Mutex;
use shmx_primitives::sync::Ordering;
use shmx_primitives::Region;

use crate::directory::{self, StaticStream};
use crate::error::Result;
use crate::frame::{FrameMut, FrameRing};
use crate::layout::{mint_session_id, Config, GlobalHeader, LayoutPlan};
use crate::mapping::Mapping;
use crate::readers::{ControlMsg, ReaderSnapshot, ReaderTable};

/// Server-local memory used by `poll_control` and `reap_stale_readers`.
///
/// `prior_heads` remembers each control ring's producer cursor from the
/// previous sweep; a seat whose cursor has not moved is considered stagnant
/// by the reaper. Guarding this with a mutex also enforces the
/// single-consumer discipline on the rings.
struct DrainState {
    scratch: Vec<u8>,
    prior_heads: Vec<u32>,
}

/// A created shared-memory segment and its producer-side operations.
///
/// `Server` is `Send + Sync`; multiple threads may publish concurrently
/// (`begin_frame`/`publish_frame`), and the maintenance calls serialize
/// themselves internally.
pub struct Server {
    // Field order: the mapping must outlive the region views derived from it.
    region: Region,
    plan: LayoutPlan,
    frames: FrameRing,
    readers: ReaderTable,
    drain: Mutex<DrainState>,
    append_lock: Mutex<()>,
    name: String,
    _mapping: Mapping,
}

// SAFETY: every shared access into the segment is atomic or protected by
// the publish/drain protocols; the mutexes serialize maintenance state.
unsafe impl Send for Server {}
unsafe impl Sync for Server {}

impl Server {
    /// Create the segment `name`, lay it out per `config`, and publish the
    /// initial static directory.
    pub fn create(name: &str, config: &Config, streams: &[StaticStream]) -> Result<Self> {
        let plan = LayoutPlan::compute(config)?;
        let mapping = Mapping::create(name, plan.total as usize)?;
        // SAFETY: the mapping owns base..base+len for its lifetime, and it is
        // stored alongside every view derived from it.
        let region = unsafe { Region::from_raw(mapping.base(), mapping.len()) };

        let session = mint_session_id();
        // SAFETY: fresh zero-filled segment, not yet visible to any opener.
        unsafe {
            region.get_mut::<GlobalHeader>(0).init(&plan, session);
        }
        let readers = ReaderTable::new(region, plan);
        // SAFETY: as above.
        unsafe { readers.init_all() };

        // SAFETY: header initialized just above.
        let hdr = unsafe { region.get::<GlobalHeader>(0) };
        if let Err(e) = directory::publish_initial(hdr, region, &plan, streams) {
            // Don't leave a half-initialized segment in the namespace.
            let _ = Mapping::unlink(name);
            return Err(e);
        }

        tracing::info!(
            name,
            session,
            total = plan.total,
            slots = plan.slots,
            reader_slots = plan.reader_slots,
            "segment created"
        );

        Ok(Self {
            region,
            plan,
            frames: FrameRing::new(region, plan),
            readers,
            drain: Mutex::new(DrainState {
                scratch: vec![0u8; plan.control_capacity() as usize],
                prior_heads: vec![0u32; plan.reader_slots as usize],
            }),
            append_lock: Mutex::new(()),
            name: name.to_owned(),
            _mapping: mapping,
        })
    }

    /// The segment prelude.
    pub fn header(&self) -> &GlobalHeader {
        // SAFETY: initialized at create and never unmapped while self lives.
        unsafe { self.region.get::<GlobalHeader>(0) }
    }

    /// The computed layout plan.
    pub fn layout(&self) -> LayoutPlan {
        self.plan
    }

    /// Current session id.
    pub fn session(&self) -> u64 {
        self.header().session()
    }

    /// Readers currently holding a seat.
    pub fn readers_connected(&self) -> u32 {
        self.header().readers_connected.load(Ordering::Acquire)
    }

    /// Reserve a publish ticket and return the writable frame cursor.
    pub fn begin_frame(&self) -> FrameMut<'_> {
        self.frames.begin(self.header())
    }

    /// Append one stream's elements to a reserved frame.
    ///
    /// Equivalent to [`FrameMut::append_stream`]; kept on the server surface
    /// so producer code can stay in one namespace.
    pub fn append_stream(
        frame: &mut FrameMut<'_>,
        stream_id: u32,
        elem_count: u32,
        bytes: &[u8],
    ) -> Result<()> {
        frame.append_stream(stream_id, elem_count, bytes)
    }

    /// Commit a frame per the publish protocol, stamping `sim_time`.
    pub fn publish_frame(&self, frame: FrameMut<'_>, sim_time: f64) {
        frame.commit(sim_time);
    }

    /// Append entries to the static directory.
    pub fn append_static(&self, streams: &[StaticStream]) -> Result<()> {
        let _guard = self.append_lock.lock();
        directory::publish_append(self.header(), self.region, &self.plan, streams)
    }

    /// Drain up to `max` control messages across all rings.
    ///
    /// Messages carry the sending seat's `reader_id`; interpreting their
    /// types (hello/heartbeat conventions and the like) is the caller's
    /// business — pair with [`Server::touch_reader`] to apply a heartbeat.
    pub fn poll_control(&self, max: usize) -> Vec<ControlMsg> {
        let mut state = self.drain.lock();
        let DrainState {
            scratch,
            prior_heads,
        } = &mut *state;

        let mut out = Vec::new();
        for i in 0..self.readers.reader_slots() {
            let Some(ring) = self.readers.ring(i) else {
                break;
            };
            let slot = self.readers.slot(i);
            if slot.in_use.load(Ordering::Acquire) == 0 {
                prior_heads[i as usize] = ring.head();
                continue;
            }
            let reader_id = slot.reader_id.load(Ordering::Acquire);
            while out.len() < max {
                match ring.try_pop_into(scratch) {
                    Ok(Some((ty, len))) => out.push(ControlMsg {
                        reader_id,
                        ty,
                        data: scratch[..len].to_vec(),
                    }),
                    Ok(None) => break,
                    Err(_) => {
                        tracing::warn!(seat = i, reader_id, "corrupt control ring, skipping");
                        break;
                    }
                }
            }
            prior_heads[i as usize] = ring.head();
            if out.len() >= max {
                break;
            }
        }
        out
    }

    /// Stamp the heartbeat of the seat currently held by `reader_id`.
    ///
    /// Returns false if no claimed seat carries that id. This is the hook
    /// for callers that apply a heartbeat convention to control payloads.
    pub fn touch_reader(&self, reader_id: u64, tick: u64) -> bool {
        for i in 0..self.readers.reader_slots() {
            let slot = self.readers.slot(i);
            if slot.in_use.load(Ordering::Acquire) != 0
                && slot.reader_id.load(Ordering::Acquire) == reader_id
            {
                slot.heartbeat.store(tick, Ordering::Release);
                return true;
            }
        }
        false
    }

    /// Copy out the reader table.
    pub fn snapshot_readers(&self) -> Vec<ReaderSnapshot> {
        self.readers.snapshot()
    }

    /// Reclaim seats of crashed clients. Returns the number reaped.
    ///
    /// A seat is reaped when its heartbeat is older than `timeout` ticks
    /// AND its control ring cursor has not moved since the previous sweep
    /// (by this method or by `poll_control`). With control rings disabled
    /// the policy degrades to pure timeout. Best-effort and idempotent.
    pub fn reap_stale_readers(&self, now: u64, timeout: u64) -> usize {
        let mut state = self.drain.lock();
        let prior_heads = &mut state.prior_heads;

        let mut reaped = 0;
        for i in 0..self.readers.reader_slots() {
            let slot = self.readers.slot(i);
            let ring_head = self.readers.ring(i).map(|r| r.head());
            if slot.in_use.load(Ordering::Acquire) == 0 {
                if let Some(head) = ring_head {
                    prior_heads[i as usize] = head;
                }
                continue;
            }

            let stagnant = match ring_head {
                Some(head) => {
                    let unchanged = head == prior_heads[i as usize];
                    prior_heads[i as usize] = head;
                    unchanged
                }
                None => true,
            };

            let heartbeat = slot.heartbeat.load(Ordering::Acquire);
            if stagnant
                && heartbeat.saturating_add(timeout) < now
                && self.readers.reap(self.header(), i)
            {
                reaped += 1;
            }
        }
        reaped
    }

    /// Tear the segment down: poison the session so live mappings observe
    /// the mismatch, then unlink the name. Existing mappings stay valid
    /// until their owners drop them.
    pub fn destroy(self) {
        self.header().session_id.store(0, Ordering::Release);
        if let Err(e) = Mapping::unlink(&self.name) {
            tracing::warn!(name = %self.name, error = %e, "segment unlink failed");
        }
        tracing::info!(name = %self.name, "segment destroyed");
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name)
            .field("session", &self.session())
            .field("write_index", &self.header().write_index.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}
