//! End-to-end scenarios over real mapped segments.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use shmx_core::{
    Client, Config, ElementType, Error, Inspector, Server, StaticState, StaticStream, StreamLayout,
};

/// All test segments live in one tempdir, selected via SHMX_DIR before any
/// mapping is created.
fn segment_name(tag: &str) -> String {
    static DIR: OnceLock<tempfile::TempDir> = OnceLock::new();
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    DIR.get_or_init(|| {
        let dir = tempfile::tempdir().expect("tempdir");
        std::env::set_var("SHMX_DIR", dir.path());
        dir
    });
    format!(
        "shmx-{}-{}-{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn u64_stream(stream_id: u32, name: &str) -> StaticStream {
    StaticStream {
        stream_id,
        element_type: ElementType::U64,
        components: 1,
        layout: StreamLayout::SoaScalar,
        bytes_per_elem: 8,
        name: name.to_owned(),
        extra: Vec::new(),
    }
}

fn small_config() -> Config {
    Config {
        slots: 4,
        reader_slots: 2,
        static_bytes_cap: 256,
        frame_bytes_cap: 128,
        control_per_reader: 256,
    }
}

#[test]
fn s1_publish_and_decode_one_frame() {
    let name = segment_name("s1");
    let server = Server::create(&name, &small_config(), &[u64_stream(42, "tick_seq")]).unwrap();

    let mut frame = server.begin_frame();
    frame.append_stream(42, 1, &7u64.to_ne_bytes()).unwrap();
    server.publish_frame(frame, 0.125);

    let client = Client::open(&name).unwrap();

    let mut state = StaticState::default();
    assert!(client.refresh_static(&mut state).unwrap());
    assert_eq!(state.get(42).unwrap().name, "tick_seq");

    let view = client.latest().unwrap();
    assert!(!view.session_mismatch);
    assert_eq!(view.frame_id, 1);
    assert_eq!(view.tlv_count, 1);
    assert_eq!(view.sim_time, 0.125);

    let decoded = Client::decode(&view).unwrap();
    let s = decoded.get(42).unwrap();
    assert_eq!(s.elem_count, 1);
    assert_eq!(s.data.len(), 8);
    assert_eq!(u64::from_ne_bytes(s.data.try_into().unwrap()), 7);

    server.destroy();
}

#[test]
fn s2_unread_frames_collapse_to_newest_once() {
    let name = segment_name("s2");
    let mut config = small_config();
    config.slots = 3;
    let server = Server::create(&name, &config, &[u64_stream(1, "seq")]).unwrap();
    let client = Client::open(&name).unwrap();

    for i in 0..10u64 {
        let mut frame = server.begin_frame();
        frame.append_stream(1, 1, &i.to_ne_bytes()).unwrap();
        server.publish_frame(frame, i as f64);
    }

    let view = client.latest().unwrap();
    assert_eq!(view.frame_id, 10);

    // No publishes since: the same frame is not delivered twice.
    assert!(matches!(client.latest(), Err(Error::NoFrame)));

    server.destroy();
}

#[test]
fn s3_control_roundtrip_registers_reader() {
    let name = segment_name("s3");
    let server = Server::create(&name, &small_config(), &[]).unwrap();
    let mut client = Client::open(&name).unwrap();

    let payload = [0x02u8, 0, 0, 0, 0, 0, 0, 0];
    client.control_send(0x4845_4C4F, &payload).unwrap();

    let msgs = server.poll_control(16);
    assert_eq!(msgs.len(), 1);
    assert_ne!(msgs[0].reader_id, 0);
    assert_eq!(msgs[0].reader_id, client.reader_id());
    assert_eq!(msgs[0].ty, 0x4845_4C4F);
    assert_eq!(msgs[0].data, payload);

    let snapshot = server.snapshot_readers();
    assert_eq!(snapshot.iter().filter(|r| r.in_use).count(), 1);
    assert_eq!(server.readers_connected(), 1);

    // The claimed seat recorded the session current at claim time.
    let seat = client.reader_index().unwrap() as usize;
    assert_eq!(snapshot[seat].session_id_copy, client.session());

    server.destroy();
}

#[test]
fn s4_destroy_and_recreate_flags_session_mismatch() {
    let name = segment_name("s4");
    let server = Server::create(&name, &small_config(), &[u64_stream(1, "seq")]).unwrap();
    let client = Client::open(&name).unwrap();

    let mut frame = server.begin_frame();
    frame.append_stream(1, 1, &1u64.to_ne_bytes()).unwrap();
    server.publish_frame(frame, 0.0);
    assert_eq!(client.latest().unwrap().frame_id, 1);

    let old_session = client.session();
    server.destroy();
    let server2 = Server::create(&name, &small_config(), &[u64_stream(1, "seq")]).unwrap();
    assert_ne!(server2.session(), old_session);

    // The client still maps the poisoned old segment: flagged, not erred.
    let view = client.latest().unwrap();
    assert!(view.session_mismatch);

    // Re-opening attaches to the new session.
    let client2 = Client::open(&name).unwrap();
    assert_eq!(client2.session(), server2.session());

    server2.destroy();
}

#[test]
fn s5_two_writers_account_for_every_ticket() {
    let name = segment_name("s5");
    let mut config = small_config();
    config.slots = 8;
    let server = Arc::new(Server::create(&name, &config, &[]).unwrap());

    const TOTAL: u64 = 1_000_000;
    let writers: Vec<_> = (0..2)
        .map(|_| {
            let server = server.clone();
            std::thread::spawn(move || {
                for _ in 0..TOTAL / 2 {
                    let frame = server.begin_frame();
                    server.publish_frame(frame, 0.0);
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    let hdr = server.header();
    assert_eq!(hdr.write_index.load(Ordering::Acquire), TOTAL);
    assert_eq!(hdr.reserve_index.load(Ordering::Acquire), TOTAL);

    let inspector = Inspector::open(&name).unwrap();
    for i in 0..config.slots {
        let view = inspector.slot_view(i).unwrap();
        assert!(view.frame_id >= TOTAL - config.slots as u64);
        assert!(view.checksum_ok);
    }

    Arc::try_unwrap(server).unwrap().destroy();
}

#[test]
fn s6_reaper_frees_silent_readers() {
    let name = segment_name("s6");
    let server = Server::create(&name, &small_config(), &[]).unwrap();
    let mut client = Client::open(&name).unwrap();

    client.control_send(0x4842_5254, &0u64.to_ne_bytes()).unwrap();
    assert_eq!(server.poll_control(16).len(), 1);
    assert_eq!(server.readers_connected(), 1);

    // Ticks are opaque; pretend seconds. The client last heartbeat at 0 and
    // its ring has been quiet since the poll above.
    let reaped = server.reap_stale_readers(5, 3);
    assert_eq!(reaped, 1);
    assert_eq!(server.readers_connected(), 0);
    assert!(server.snapshot_readers().iter().all(|r| !r.in_use));

    // Reaping again finds nothing.
    assert_eq!(server.reap_stale_readers(6, 3), 0);

    server.destroy();
}

#[test]
fn heartbeats_defer_the_reaper() {
    let name = segment_name("hb");
    let server = Server::create(&name, &small_config(), &[]).unwrap();
    let mut client = Client::open(&name).unwrap();

    client.control_send(1, &[]).unwrap();
    server.poll_control(16);

    assert!(client.heartbeat(10));
    assert_eq!(server.reap_stale_readers(12, 3), 0);

    // A fresh control send counts as ring activity even without heartbeats.
    client.control_send(2, &[]).unwrap();
    assert_eq!(server.reap_stale_readers(30, 3), 0);
    // Quiet since the last sweep: now it goes.
    assert_eq!(server.reap_stale_readers(31, 3), 1);

    server.destroy();
}

#[test]
fn touch_reader_applies_caller_heartbeat_convention() {
    let name = segment_name("touch");
    let server = Server::create(&name, &small_config(), &[]).unwrap();
    let mut client = Client::open(&name).unwrap();

    client.control_send(0x4842_5254, &42u64.to_ne_bytes()).unwrap();
    for msg in server.poll_control(16) {
        if msg.ty == 0x4842_5254 {
            let tick = u64::from_ne_bytes(msg.data.as_slice().try_into().unwrap());
            assert!(server.touch_reader(msg.reader_id, tick));
        }
    }
    let seat = client.reader_index().unwrap() as usize;
    assert_eq!(server.snapshot_readers()[seat].heartbeat, 42);
    assert!(!server.touch_reader(0xDEAD, 1));

    server.destroy();
}

#[test]
fn client_close_releases_the_seat() {
    let name = segment_name("close");
    let server = Server::create(&name, &small_config(), &[]).unwrap();

    let mut client = Client::open(&name).unwrap();
    client.control_send(1, b"hi").unwrap();
    assert_eq!(server.readers_connected(), 1);

    client.close();
    assert_eq!(server.readers_connected(), 0);

    server.destroy();
}

#[test]
fn control_ring_backpressure_is_ring_full() {
    let name = segment_name("full");
    let server = Server::create(&name, &small_config(), &[]).unwrap();
    let mut client = Client::open(&name).unwrap();

    // Capacity is 256 - 16 = 240 bytes; 16-byte frames.
    let mut sent = 0;
    loop {
        match client.control_send(7, &[0u8; 8]) {
            Ok(()) => sent += 1,
            Err(Error::RingFull) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(sent, 15);

    // Draining makes room again.
    assert_eq!(server.poll_control(64).len(), 15);
    client.control_send(7, &[0u8; 8]).unwrap();

    server.destroy();
}

#[test]
fn append_static_propagates_to_live_clients() {
    let name = segment_name("append");
    let server = Server::create(&name, &small_config(), &[u64_stream(1, "a")]).unwrap();
    let client = Client::open(&name).unwrap();

    let mut state = StaticState::default();
    assert!(client.refresh_static(&mut state).unwrap());
    assert_eq!(state.entries.len(), 1);

    server.append_static(&[u64_stream(2, "b")]).unwrap();
    assert!(client.refresh_static(&mut state).unwrap());
    assert_eq!(state.entries.len(), 2);
    assert_eq!(state.generation(), 2);

    // Unchanged directory: no refresh.
    assert!(!client.refresh_static(&mut state).unwrap());

    server.destroy();
}

#[test]
fn inspector_sees_everything_and_touches_nothing() {
    let name = segment_name("inspect");
    let server = Server::create(&name, &small_config(), &[u64_stream(9, "pos")]).unwrap();
    let mut client = Client::open(&name).unwrap();
    client.control_send(1, b"hello").unwrap();

    let mut frame = server.begin_frame();
    frame.append_stream(9, 1, &3u64.to_ne_bytes()).unwrap();
    server.publish_frame(frame, 1.0);

    let inspector = Inspector::open(&name).unwrap();
    let layout = inspector.layout();
    assert_eq!(layout.slots, 4);
    assert_eq!(inspector.header().session(), client.session());

    let dir = inspector.decode_static_dir().unwrap();
    assert_eq!(dir.len(), 1);
    assert_eq!(dir[0].name, "pos");

    let view = inspector.latest().unwrap();
    assert_eq!(view.frame_id, 1);
    let decoded = Inspector::decode_frame(&view).unwrap();
    assert_eq!(decoded.get(9).unwrap().data, 3u64.to_ne_bytes());

    // An inspector is not a reader: it holds no seat and its latest is
    // stateless (repeat reads keep working).
    assert_eq!(server.readers_connected(), 1);
    assert_eq!(inspector.latest().unwrap().frame_id, 1);

    // The pending control message is still there for the server.
    assert_eq!(server.poll_control(16).len(), 1);

    server.destroy();
}

#[test]
fn open_rejects_garbage_and_short_segments() {
    let name = segment_name("garbage");
    // A file that is not a segment at all.
    {
        let server = Server::create(&name, &small_config(), &[]).unwrap();
        // Corrupt the magic in place through a second writable mapping.
        let mapping = shmx_core::Mapping::open(&name).unwrap();
        // SAFETY: test scribbling over its own segment.
        unsafe { *mapping.base() = b'X' };
        assert!(matches!(
            Client::open(&name),
            Err(Error::BadMagicOrEndian)
        ));
        server.destroy();
    }

    let missing = segment_name("missing");
    assert!(matches!(
        Client::open(&missing),
        Err(Error::MappingFailed(_))
    ));
}
