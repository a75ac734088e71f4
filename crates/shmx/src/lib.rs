//! Shared-memory frame streaming.
//!
//! A thin facade over [`shmx_core`]: one producer, many consumers, one named
//! segment, sub-microsecond hand-off.
//!
//! ```no_run
//! use shmx::prelude::*;
//!
//! let streams = [StaticStream {
//!     stream_id: 42,
//!     element_type: ElementType::U64,
//!     components: 1,
//!     layout: StreamLayout::SoaScalar,
//!     bytes_per_elem: 8,
//!     name: "tick_seq".into(),
//!     extra: Vec::new(),
//! }];
//! let server = Server::create("demo", &Config::default(), &streams)?;
//!
//! let mut frame = server.begin_frame();
//! frame.append_stream(42, 1, &7u64.to_ne_bytes())?;
//! server.publish_frame(frame, 0.0);
//!
//! let client = Client::open("demo")?;
//! let view = client.latest()?;
//! let decoded = Client::decode(&view)?;
//! assert_eq!(decoded.get(42).unwrap().data, 7u64.to_ne_bytes());
//! # Ok::<_, shmx::Error>(())
//! ```

pub use shmx_core::{
    Client, Config, ControlMsg, DecodedFrame, DecodedStream, ElementType, Error, FrameMut,
    FrameView, GlobalHeader, Inspector, LayoutPlan, Mapping, ReaderSnapshot, Result, SlotView,
    Server, StaticState, StaticStream, StreamLayout, ENDIAN_TAG, MAGIC, TLV_FRAME_STREAM,
    VER_MAJOR, VER_MINOR,
};

/// Convenient imports for typical producer and consumer code.
pub mod prelude {
    pub use crate::{
        Client, Config, ElementType, Inspector, Server, StaticState, StaticStream, StreamLayout,
    };
}
