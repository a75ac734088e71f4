#![cfg(all(test, feature = "loom"))]

use crate::region::HeapRegion;
use crate::ring::{PushError, TlvRing, TlvRingHeader};
use crate::sync::thread;
use alloc::vec;
use alloc::vec::Vec;
use core::mem::size_of;
use loom::sync::Arc;

fn ring_storage(capacity: u32) -> Arc<HeapRegion> {
    Arc::new(HeapRegion::new_zeroed(
        size_of::<TlvRingHeader>() + capacity as usize,
    ))
}

#[test]
fn spsc_tlv_ring_concurrent() {
    loom::model(|| {
        let owner = ring_storage(64);
        let ring = Arc::new(unsafe { TlvRing::init(owner.region(), 0, 64) });

        let producer_ring = ring.clone();
        let producer_owner = owner.clone();
        let producer = thread::spawn(move || {
            let _keep = producer_owner;
            for i in 0..2u32 {
                loop {
                    match producer_ring.try_push(i, &[i as u8; 4]) {
                        Ok(()) => break,
                        Err(PushError::Full) => thread::yield_now(),
                        Err(PushError::Oversize) => unreachable!(),
                    }
                }
            }
        });

        let consumer_ring = ring.clone();
        let consumer_owner = owner.clone();
        let consumer = thread::spawn(move || {
            let _keep = consumer_owner;
            let mut buf = vec![0u8; 64];
            let mut received: Vec<(u32, Vec<u8>)> = Vec::new();
            while received.len() < 2 {
                match consumer_ring.try_pop_into(&mut buf).unwrap() {
                    Some((ty, len)) => received.push((ty, buf[..len].to_vec())),
                    None => thread::yield_now(),
                }
            }
            received
        });

        producer.join().unwrap();
        let received = consumer.join().unwrap();
        assert_eq!(received[0], (0, vec![0u8; 4]));
        assert_eq!(received[1], (1, vec![1u8; 4]));
    });
}

#[test]
fn full_ring_never_loses_messages() {
    loom::model(|| {
        let owner = ring_storage(32);
        let ring = Arc::new(unsafe { TlvRing::init(owner.region(), 0, 32) });

        // Producer fills the ring (two 16-byte frames) and tries a third.
        let producer_ring = ring.clone();
        let producer_owner = owner.clone();
        let producer = thread::spawn(move || {
            let _keep = producer_owner;
            let mut pushed = 0u32;
            for i in 0..3u32 {
                if ring_push(&producer_ring, i) {
                    pushed += 1;
                }
            }
            pushed
        });

        let consumer_ring = ring.clone();
        let consumer_owner = owner.clone();
        let consumer = thread::spawn(move || {
            let _keep = consumer_owner;
            let mut buf = vec![0u8; 32];
            let mut popped = Vec::new();
            for _ in 0..3 {
                if let Some((ty, _len)) = consumer_ring.try_pop_into(&mut buf).unwrap() {
                    popped.push(ty);
                }
            }
            popped
        });

        let pushed = producer.join().unwrap();
        let mut popped = consumer.join().unwrap();

        // Drain whatever is left; everything pushed comes out, in push order.
        let mut buf = vec![0u8; 32];
        while let Some((ty, _)) = ring.try_pop_into(&mut buf).unwrap() {
            popped.push(ty);
        }
        assert_eq!(popped.len() as u32, pushed);
        for pair in popped.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    });
}

fn ring_push(ring: &TlvRing, i: u32) -> bool {
    matches!(ring.try_push(i, &[i as u8; 4]), Ok(()))
}
