//! Error types for the transport.

use std::io;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the transport.
///
/// None of these unwind across the API; every fallible call returns them.
/// A session change is deliberately *not* here: it is reported as the
/// `session_mismatch` flag on a frame view so clients can re-open cleanly.
#[derive(Debug)]
pub enum Error {
    /// Creating, opening, or unmapping the shared region failed.
    MappingFailed(io::Error),
    /// The segment prelude does not carry our magic or endian tag.
    BadMagicOrEndian,
    /// Incompatible major version.
    VersionMismatch { expected: u32, found: u32 },
    /// An append or write would exceed a configured capacity.
    CapacityExceeded,
    /// No published frame is currently readable.
    NoFrame,
    /// The frame belongs to a different session than the segment header.
    SessionMismatch,
    /// Payload checksum does not match the frame header.
    ChecksumInvalid,
    /// The slot was recycled by the writer while it was being read.
    Overwritten,
    /// The control ring has no room for the framed message.
    RingFull,
    /// The control ring holds no message.
    RingEmpty,
    /// The static directory bytes failed to parse or verify.
    DirectoryCorrupt,
    /// Every reader seat is taken.
    NoReaderSlot,
    /// A configuration or argument constraint was violated.
    InvalidArgument(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MappingFailed(e) => write!(f, "mapping failed: {}", e),
            Self::BadMagicOrEndian => write!(f, "bad magic or endian tag"),
            Self::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "version mismatch: expected major {}, found {}",
                    expected, found
                )
            }
            Self::CapacityExceeded => write!(f, "capacity exceeded"),
            Self::NoFrame => write!(f, "no frame available"),
            Self::SessionMismatch => write!(f, "session mismatch"),
            Self::ChecksumInvalid => write!(f, "payload checksum invalid"),
            Self::Overwritten => write!(f, "frame overwritten during read"),
            Self::RingFull => write!(f, "control ring full"),
            Self::RingEmpty => write!(f, "control ring empty"),
            Self::DirectoryCorrupt => write!(f, "static directory corrupt"),
            Self::NoReaderSlot => write!(f, "no reader slot available"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::MappingFailed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::MappingFailed(e)
    }
}
