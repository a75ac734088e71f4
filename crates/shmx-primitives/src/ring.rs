//! Single-producer single-consumer TLV byte ring.
//!
//! The ring lives in shared memory: a 16-byte header holding two free-running
//! `u32` cursors, followed by a byte buffer whose capacity is a multiple of
//! 16. Messages are 16-byte-aligned TLVs, so cursor positions (`cursor %
//! capacity`) are always 16-aligned and a TLV header never straddles the
//! wrap point; payloads may, and are copied in two parts.
//!
//! Cursors are never masked. Free space is `capacity - (head - tail)` in
//! wrapping arithmetic, which makes full (`head - tail == capacity`) and
//! empty (`head == tail`) unambiguous.
//!
//! The producer owns `head`, the consumer owns `tail`. Exactly one producer
//! and one consumer may operate on a ring at a time; that discipline is the
//! caller's contract.

use core::mem::size_of;
use core::ptr;

use crate::region::Region;
use crate::sync::{AtomicU32, Ordering};
use crate::tlv::{framed_size, TLV_HEADER_BYTES};

/// Ring header: producer and consumer cursors (16 bytes on the wire).
#[repr(C)]
pub struct TlvRingHeader {
    /// Producer cursor; bytes `[tail, head)` are published.
    pub head: AtomicU32,
    /// Consumer cursor.
    pub tail: AtomicU32,
    _pad: [u8; 8],
}

/// On-wire size of [`TlvRingHeader`].
pub const RING_HEADER_BYTES: u32 = 16;

#[cfg(not(feature = "loom"))]
const _: () = assert!(size_of::<TlvRingHeader>() == RING_HEADER_BYTES as usize);

impl TlvRingHeader {
    /// Reset both cursors.
    pub fn init(&mut self) {
        self.head = AtomicU32::new(0);
        self.tail = AtomicU32::new(0);
        self._pad = [0; 8];
    }
}

/// Push failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// Not enough free space for the framed message right now.
    Full,
    /// The framed message exceeds the ring capacity and can never fit.
    Oversize,
}

/// Pop failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// A length field is inconsistent with the published byte count, or the
    /// caller's buffer is too small to hold a payload. The ring should be
    /// abandoned by the consumer.
    Corrupt,
}

/// A view of one SPSC TLV ring inside a [`Region`].
pub struct TlvRing {
    region: Region,
    header_offset: usize,
    data_offset: usize,
    capacity: u32,
}

// SAFETY: all shared cursor state is accessed through atomics; the byte
// buffer is handed off by the acquire/release pairing on the cursors.
unsafe impl Send for TlvRing {}
unsafe impl Sync for TlvRing {}

impl TlvRing {
    /// Initialize a fresh ring at `header_offset` with `capacity` data bytes.
    ///
    /// # Safety
    ///
    /// The region must be writable, the range
    /// `[header_offset, header_offset + size_of::<TlvRingHeader>() + capacity)`
    /// must be in bounds, and no other thread may access the ring during
    /// initialization.
    pub unsafe fn init(region: Region, header_offset: usize, capacity: u32) -> Self {
        assert!(
            capacity >= 16 && (capacity % 16) == 0,
            "ring capacity must be a non-zero multiple of 16"
        );
        // SAFETY: in bounds per the caller's contract; exclusive during init.
        let header = unsafe { region.get_mut::<TlvRingHeader>(header_offset) };
        header.init();
        // SAFETY: same contract.
        unsafe { Self::attach(region, header_offset, capacity) }
    }

    /// Attach to an existing ring.
    ///
    /// # Safety
    ///
    /// The range must hold an initialized ring of exactly `capacity` data
    /// bytes, and the memory must stay mapped for the ring's lifetime.
    pub unsafe fn attach(region: Region, header_offset: usize, capacity: u32) -> Self {
        assert!(capacity >= 16 && (capacity % 16) == 0);
        let data_offset = header_offset + size_of::<TlvRingHeader>();
        assert!(data_offset + capacity as usize <= region.len());
        Self {
            region,
            header_offset,
            data_offset,
            capacity,
        }
    }

    #[inline]
    fn header(&self) -> &TlvRingHeader {
        // SAFETY: bounds checked at attach; the header is initialized and
        // only ever accessed through atomics after init.
        unsafe { self.region.get::<TlvRingHeader>(self.header_offset) }
    }

    /// Ring data capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Current producer cursor, for staleness observation.
    #[inline]
    pub fn head(&self) -> u32 {
        self.header().head.load(Ordering::Acquire)
    }

    /// Bytes currently published and not yet consumed.
    #[inline]
    pub fn used(&self) -> u32 {
        let header = self.header();
        let tail = header.tail.load(Ordering::Acquire);
        header.head.load(Ordering::Acquire).wrapping_sub(tail)
    }

    #[inline]
    fn data_ptr(&self, pos: u32) -> *mut u8 {
        debug_assert!(pos < self.capacity);
        self.region.offset(self.data_offset + pos as usize)
    }

    /// Copy `src` into the ring starting at byte position `pos`, wrapping.
    fn write_wrapped(&self, pos: u32, src: &[u8]) {
        let first = (self.capacity - pos).min(src.len() as u32) as usize;
        // SAFETY: pos < capacity and both parts are bounds-limited to the
        // ring data range; the producer owns `[head, tail + capacity)`.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.data_ptr(pos), first);
            if first < src.len() {
                ptr::copy_nonoverlapping(src.as_ptr().add(first), self.data_ptr(0), src.len() - first);
            }
        }
    }

    /// Copy `len` bytes starting at position `pos` out of the ring, wrapping.
    fn read_wrapped(&self, pos: u32, dst: &mut [u8]) {
        let first = (self.capacity - pos).min(dst.len() as u32) as usize;
        // SAFETY: symmetric with write_wrapped; the consumer owns [tail, head).
        unsafe {
            ptr::copy_nonoverlapping(self.data_ptr(pos), dst.as_mut_ptr(), first);
            if first < dst.len() {
                ptr::copy_nonoverlapping(self.data_ptr(0), dst.as_mut_ptr().add(first), dst.len() - first);
            }
        }
    }

    /// Producer side: append one TLV.
    ///
    /// Contract: at most one thread may act as producer.
    pub fn try_push(&self, ty: u32, payload: &[u8]) -> Result<(), PushError> {
        let framed = u32::try_from(payload.len())
            .ok()
            .and_then(|len| len.checked_add(TLV_HEADER_BYTES + 15))
            .map(|v| v & !15)
            .filter(|framed| *framed <= self.capacity)
            .ok_or(PushError::Oversize)?;

        let header = self.header();
        // head is producer-owned; tail is the consumer's progress.
        let head = header.head.load(Ordering::Relaxed);
        let tail = header.tail.load(Ordering::Acquire);
        let free = self.capacity - head.wrapping_sub(tail);
        if framed > free {
            return Err(PushError::Full);
        }

        let pos = head % self.capacity;
        let mut prefix = [0u8; TLV_HEADER_BYTES as usize];
        prefix[..4].copy_from_slice(&ty.to_ne_bytes());
        prefix[4..].copy_from_slice(&(payload.len() as u32).to_ne_bytes());
        // pos is 16-aligned, so the 8-byte prefix never wraps.
        self.write_wrapped(pos, &prefix);
        self.write_wrapped((pos + TLV_HEADER_BYTES) % self.capacity, payload);

        header
            .head
            .store(head.wrapping_add(framed), Ordering::Release);
        Ok(())
    }

    /// Consumer side: pop one TLV into `out`, returning `(type, len)`.
    ///
    /// Returns `Ok(None)` when the ring is empty. `out` must be at least as
    /// large as the ring capacity to hold any possible payload.
    ///
    /// Contract: at most one thread may act as consumer.
    pub fn try_pop_into(&self, out: &mut [u8]) -> Result<Option<(u32, usize)>, PopError> {
        let header = self.header();
        let tail = header.tail.load(Ordering::Relaxed);
        let head = header.head.load(Ordering::Acquire);
        if tail == head {
            return Ok(None);
        }

        let used = head.wrapping_sub(tail);
        if used < framed_size(0) {
            return Err(PopError::Corrupt);
        }

        let pos = tail % self.capacity;
        let mut prefix = [0u8; TLV_HEADER_BYTES as usize];
        self.read_wrapped(pos, &mut prefix);
        let ty = u32::from_ne_bytes(prefix[..4].try_into().unwrap());
        let len = u32::from_ne_bytes(prefix[4..].try_into().unwrap());

        let framed = framed_size(len);
        if framed > used || len as usize > out.len() {
            return Err(PopError::Corrupt);
        }

        self.read_wrapped(
            (pos + TLV_HEADER_BYTES) % self.capacity,
            &mut out[..len as usize],
        );

        header
            .tail
            .store(tail.wrapping_add(framed), Ordering::Release);
        Ok(Some((ty, len as usize)))
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::region::HeapRegion;
    use alloc::vec;

    fn ring_with_capacity(cap: u32) -> (HeapRegion, TlvRing) {
        let owner = HeapRegion::new_zeroed(size_of::<TlvRingHeader>() + cap as usize);
        let ring = unsafe { TlvRing::init(owner.region(), 0, cap) };
        (owner, ring)
    }

    #[test]
    fn fifo_roundtrip() {
        let (_owner, ring) = ring_with_capacity(256);
        ring.try_push(1, b"alpha").unwrap();
        ring.try_push(2, b"").unwrap();
        ring.try_push(3, &[9u8; 40]).unwrap();

        let mut buf = vec![0u8; 256];
        assert_eq!(ring.try_pop_into(&mut buf).unwrap(), Some((1, 5)));
        assert_eq!(&buf[..5], b"alpha");
        assert_eq!(ring.try_pop_into(&mut buf).unwrap(), Some((2, 0)));
        assert_eq!(ring.try_pop_into(&mut buf).unwrap(), Some((3, 40)));
        assert_eq!(&buf[..40], &[9u8; 40]);
        assert_eq!(ring.try_pop_into(&mut buf).unwrap(), None);
    }

    #[test]
    fn fills_exactly_then_rejects() {
        // Four 16-byte frames fill a 64-byte ring exactly.
        let (_owner, ring) = ring_with_capacity(64);
        for i in 0..3 {
            ring.try_push(i, &[i as u8; 8]).unwrap();
        }
        // One more minimal frame fits...
        ring.try_push(3, &[3u8; 8]).unwrap();
        // ...and the next one does not.
        assert_eq!(ring.try_push(4, &[]), Err(PushError::Full));

        let mut buf = vec![0u8; 64];
        assert_eq!(ring.try_pop_into(&mut buf).unwrap(), Some((0, 8)));
        ring.try_push(4, &[]).unwrap();
    }

    #[test]
    fn oversize_is_permanent() {
        let (_owner, ring) = ring_with_capacity(64);
        assert_eq!(ring.try_push(1, &[0u8; 64]), Err(PushError::Oversize));
    }

    #[test]
    fn payload_wraps_across_end() {
        let (_owner, ring) = ring_with_capacity(64);
        // Advance the cursors so the next payload must wrap.
        let mut buf = vec![0u8; 64];
        ring.try_push(0, &[0u8; 24]).unwrap(); // framed 32
        ring.try_pop_into(&mut buf).unwrap();
        ring.try_push(0, &[0u8; 8]).unwrap(); // framed 16, head = 48
        ring.try_pop_into(&mut buf).unwrap();

        let payload: alloc::vec::Vec<u8> = (0u8..40).collect();
        ring.try_push(7, &payload).unwrap(); // framed 48, wraps at 64
        assert_eq!(ring.try_pop_into(&mut buf).unwrap(), Some((7, 40)));
        assert_eq!(&buf[..40], &payload[..]);
    }

    #[test]
    fn cursors_run_free() {
        let (_owner, ring) = ring_with_capacity(64);
        let mut buf = vec![0u8; 64];
        for round in 0..100u32 {
            ring.try_push(round, &[round as u8; 8]).unwrap();
            assert_eq!(ring.try_pop_into(&mut buf).unwrap(), Some((round, 8)));
        }
        // 100 frames of 16 bytes: cursors are well past capacity.
        assert_eq!(ring.head(), 1600);
        assert_eq!(ring.used(), 0);
    }

    #[test]
    fn corrupt_length_detected() {
        let (owner, ring) = ring_with_capacity(64);
        ring.try_push(1, &[0u8; 8]).unwrap();
        // Scribble an absurd length into the published frame.
        unsafe {
            let len_ptr = owner.region().offset(size_of::<TlvRingHeader>() + 4) as *mut u32;
            *len_ptr = 1 << 20;
        }
        let mut buf = vec![0u8; 64];
        assert_eq!(ring.try_pop_into(&mut buf), Err(PopError::Corrupt));
    }
}
