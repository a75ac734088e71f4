//! The static directory: an append-only typed stream schema.
//!
//! Entries are serialized into the static region and published by bumping
//! `static_gen` last, so a reader that observes a generation also observes
//! the bytes it describes. The directory only ever grows; entries never
//! move once written.
//!
//! Entry wire format (8-byte aligned):
//!
//! ```text
//! stream_id: u32, element_type: u32, components: u32,
//! layout: u32, bytes_per_elem: u32, name_len: u16, extra_len: u16,
//! name bytes, extra bytes, zero padding to 8
//! ```

use shmx_primitives::sync::Ordering;
use shmx_primitives::{align8, fnv1a64, Region};

use crate::error::{Error, Result};
use crate::layout::{ElementType, GlobalHeader, LayoutPlan, StreamLayout};

/// Fixed prefix bytes of an encoded entry.
const ENTRY_PREFIX: usize = 24;

/// Bounded retries for a torn refresh before reporting corruption.
const REFRESH_RETRIES: u32 = 3;

/// One typed stream declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticStream {
    /// Unique id within the directory.
    pub stream_id: u32,
    pub element_type: ElementType,
    /// Components per element (>= 1).
    pub components: u32,
    pub layout: StreamLayout,
    pub bytes_per_elem: u32,
    /// UTF-8 name, at most 255 bytes.
    pub name: String,
    /// Opaque per-stream bytes, at most 65535.
    pub extra: Vec<u8>,
}

/// A reader's cached view of the directory.
#[derive(Debug, Default)]
pub struct StaticState {
    gen: u32,
    pub entries: Vec<StaticStream>,
}

impl StaticState {
    /// The generation this state was last refreshed at (0 = never).
    pub fn generation(&self) -> u32 {
        self.gen
    }

    /// Look up an entry by stream id.
    pub fn get(&self, stream_id: u32) -> Option<&StaticStream> {
        self.entries.iter().find(|e| e.stream_id == stream_id)
    }
}

/// Serialize entries, validating per-entry constraints and intra-batch
/// stream-id uniqueness.
pub(crate) fn encode_entries(streams: &[StaticStream]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for (i, s) in streams.iter().enumerate() {
        if s.components == 0 {
            return Err(Error::InvalidArgument("stream components must be >= 1"));
        }
        if s.name.len() > 255 {
            return Err(Error::InvalidArgument("stream name exceeds 255 bytes"));
        }
        if s.extra.len() > 65535 {
            return Err(Error::InvalidArgument("stream extra exceeds 65535 bytes"));
        }
        if streams[..i].iter().any(|p| p.stream_id == s.stream_id) {
            return Err(Error::InvalidArgument("duplicate stream_id in batch"));
        }

        out.extend_from_slice(&s.stream_id.to_ne_bytes());
        out.extend_from_slice(&(s.element_type as u32).to_ne_bytes());
        out.extend_from_slice(&s.components.to_ne_bytes());
        out.extend_from_slice(&(s.layout as u32).to_ne_bytes());
        out.extend_from_slice(&s.bytes_per_elem.to_ne_bytes());
        out.extend_from_slice(&(s.name.len() as u16).to_ne_bytes());
        out.extend_from_slice(&(s.extra.len() as u16).to_ne_bytes());
        out.extend_from_slice(s.name.as_bytes());
        out.extend_from_slice(&s.extra);
        while !out.len().is_multiple_of(8) {
            out.push(0);
        }
    }
    Ok(out)
}

/// Parse a full directory image. Fails on truncation, unknown codes,
/// invalid UTF-8, or duplicate stream ids.
pub(crate) fn decode_entries(mut bytes: &[u8]) -> Result<Vec<StaticStream>> {
    let mut entries = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < ENTRY_PREFIX {
            return Err(Error::DirectoryCorrupt);
        }
        let u32_at = |off: usize| u32::from_ne_bytes(bytes[off..off + 4].try_into().unwrap());
        let stream_id = u32_at(0);
        let element_type =
            ElementType::from_u32(u32_at(4)).ok_or(Error::DirectoryCorrupt)?;
        let components = u32_at(8);
        let layout = StreamLayout::from_u32(u32_at(12)).ok_or(Error::DirectoryCorrupt)?;
        let bytes_per_elem = u32_at(16);
        let name_len = u16::from_ne_bytes(bytes[20..22].try_into().unwrap()) as usize;
        let extra_len = u16::from_ne_bytes(bytes[22..24].try_into().unwrap()) as usize;

        if components == 0 || name_len > 255 {
            return Err(Error::DirectoryCorrupt);
        }
        let entry_len = align8((ENTRY_PREFIX + name_len + extra_len) as u32) as usize;
        if bytes.len() < entry_len {
            return Err(Error::DirectoryCorrupt);
        }

        let name = std::str::from_utf8(&bytes[ENTRY_PREFIX..ENTRY_PREFIX + name_len])
            .map_err(|_| Error::DirectoryCorrupt)?
            .to_owned();
        let extra = bytes[ENTRY_PREFIX + name_len..ENTRY_PREFIX + name_len + extra_len].to_vec();

        if entries.iter().any(|e: &StaticStream| e.stream_id == stream_id) {
            return Err(Error::DirectoryCorrupt);
        }
        entries.push(StaticStream {
            stream_id,
            element_type,
            components,
            layout,
            bytes_per_elem,
            name,
            extra,
        });
        bytes = &bytes[entry_len..];
    }
    Ok(entries)
}

/// Copy the published directory image out of the segment.
fn copy_image(region: Region, plan: &LayoutPlan, used: usize) -> Vec<u8> {
    let mut image = vec![0u8; used];
    // SAFETY: used <= static_cap is checked by callers; the range is within
    // the mapped segment per the plan.
    unsafe {
        std::ptr::copy_nonoverlapping(
            region.offset(plan.static_offset as usize),
            image.as_mut_ptr(),
            used,
        );
    }
    image
}

/// Write the initial directory. Runs before the segment name is visible to
/// anyone, so plain ordering would do; release stores keep the publication
/// discipline uniform with [`publish_append`].
pub(crate) fn publish_initial(
    hdr: &GlobalHeader,
    region: Region,
    plan: &LayoutPlan,
    streams: &[StaticStream],
) -> Result<()> {
    let bytes = encode_entries(streams)?;
    if bytes.len() > plan.static_cap as usize {
        return Err(Error::CapacityExceeded);
    }
    // SAFETY: bounds checked against static_cap; exclusive at create time.
    unsafe {
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            region.offset(plan.static_offset as usize),
            bytes.len(),
        );
    }
    hdr.static_hash.store(fnv1a64(&bytes), Ordering::Release);
    hdr.static_used.store(bytes.len() as u32, Ordering::Release);
    hdr.static_gen.store(1, Ordering::Release);
    Ok(())
}

/// Append entries after the current image and republish.
///
/// Contract: one appender at a time (the server serializes callers).
pub(crate) fn publish_append(
    hdr: &GlobalHeader,
    region: Region,
    plan: &LayoutPlan,
    streams: &[StaticStream],
) -> Result<()> {
    let used = hdr.static_used.load(Ordering::Acquire) as usize;
    let existing = decode_entries(&copy_image(region, plan, used))?;
    for s in streams {
        if existing.iter().any(|e| e.stream_id == s.stream_id) {
            return Err(Error::InvalidArgument("duplicate stream_id in directory"));
        }
    }

    let bytes = encode_entries(streams)?;
    let new_used = used + bytes.len();
    if new_used > plan.static_cap as usize {
        return Err(Error::CapacityExceeded);
    }
    // SAFETY: [used, new_used) is within the static region; readers do not
    // look past static_used until the release store below publishes it.
    unsafe {
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            region.offset(plan.static_offset as usize + used),
            bytes.len(),
        );
    }

    let hash = fnv1a64(&copy_image(region, plan, new_used));
    hdr.static_hash.store(hash, Ordering::Release);
    hdr.static_used.store(new_used as u32, Ordering::Release);
    let gen = hdr.static_gen.fetch_add(1, Ordering::Release) + 1;
    tracing::debug!(gen, new_used, appended = streams.len(), "directory append");
    Ok(())
}

/// Refresh a reader's cached directory state.
///
/// Returns `Ok(false)` when the generation is unchanged. A torn observation
/// (generation moving while we copy) is retried a bounded number of times
/// before reporting [`Error::DirectoryCorrupt`].
pub fn refresh(
    hdr: &GlobalHeader,
    region: Region,
    plan: &LayoutPlan,
    state: &mut StaticState,
) -> Result<bool> {
    if hdr.static_gen.load(Ordering::Acquire) == state.gen {
        return Ok(false);
    }

    for _ in 0..REFRESH_RETRIES {
        let gen = hdr.static_gen.load(Ordering::Acquire);
        let used = hdr.static_used.load(Ordering::Acquire) as usize;
        if used > plan.static_cap as usize {
            return Err(Error::DirectoryCorrupt);
        }
        let image = copy_image(region, plan, used);
        if fnv1a64(&image) != hdr.static_hash.load(Ordering::Acquire)
            || hdr.static_gen.load(Ordering::Acquire) != gen
        {
            // An append landed mid-copy; take the new generation next pass.
            continue;
        }
        let entries = decode_entries(&image)?;
        state.gen = gen;
        state.entries = entries;
        return Ok(true);
    }
    Err(Error::DirectoryCorrupt)
}
