// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use nprpc::shm::ring::RingBuffer;
use serial_test::serial;

fn unique_name(tag: &str) -> String {
    format!("/nprpc_test_{}_{tag}", std::process::id())
}

#[test]
#[serial]
fn test_create_open_write_read() -> Result<()> {
    let name = unique_name("basic");
    RingBuffer::remove(&name);

    let producer = RingBuffer::create(&name, 16 * 1024)?;
    let consumer = RingBuffer::open(&name)?;

    assert!(producer.is_empty());
    assert!(producer.try_write(b"hello ring"));

    let mut buf = [0u8; 64];
    let n = consumer.try_read(&mut buf);
    assert_eq!(&buf[..n], b"hello ring");
    assert!(consumer.is_empty());
    Ok(())
}

#[test]
#[serial]
fn test_records_never_split_across_wrap() -> Result<()> {
    let name = unique_name("wrap");
    RingBuffer::remove(&name);

    // Smallest ring is one page; records of 1000 bytes force a wrap within
    // a few iterations. Every record must come back intact — the mirror
    // makes split reads impossible.
    let producer = RingBuffer::create(&name, 4096)?;
    let consumer = RingBuffer::open(&name)?;

    let mut scratch = vec![0u8; 2048];
    for round in 0u8..50 {
        let record = vec![round; 1000];
        assert!(producer.try_write(&record), "write failed at round {round}");

        let n = consumer.try_read(&mut scratch);
        assert_eq!(n, 1000, "short read at round {round}");
        assert!(
            scratch[..n].iter().all(|&b| b == round),
            "payload corrupted at round {round}"
        );
    }
    Ok(())
}

#[test]
#[serial]
fn test_full_ring_rejects_then_recovers() -> Result<()> {
    let name = unique_name("full");
    RingBuffer::remove(&name);

    let producer = RingBuffer::create(&name, 4096)?;
    let consumer = RingBuffer::open(&name)?;
    let window = producer.ring_window();

    // Fill the ring to its usable limit (window - 1 bytes including size
    // headers).
    let record = vec![0xEEu8; 507]; // 4 + 507 = 511 bytes per record
    let mut written = 0usize;
    while producer.try_write(&record) {
        written += 1;
        assert!(written < 100, "ring never filled");
    }
    assert!(producer.available_bytes() < record.len() + 4);
    assert_eq!(window - 1 - producer.available_bytes(), written * 511);

    // One record out makes room for exactly one more in.
    let mut scratch = vec![0u8; 1024];
    assert_eq!(consumer.try_read(&mut scratch), 507);
    assert!(producer.try_write(&record));
    assert!(!producer.try_write(&record));
    Ok(())
}

#[test]
#[serial]
fn test_zero_copy_reserve_commit_read_view() -> Result<()> {
    let name = unique_name("zerocopy");
    RingBuffer::remove(&name);

    let producer = RingBuffer::create(&name, 16 * 1024)?;
    let consumer = RingBuffer::open(&name)?;

    let reservation = producer.try_reserve_write(1024).expect("space available");
    assert!(reservation.max_size >= 1024);

    // Nothing is visible before commit.
    assert!(consumer.try_read_view().is_none());

    unsafe {
        std::ptr::write_bytes(reservation.data, 0x5A, 777);
    }
    producer.commit_write(&reservation, 777);

    let view = consumer.try_read_view().expect("record visible");
    assert_eq!(view.size, 777);
    let in_place = unsafe { std::slice::from_raw_parts(view.data, view.size) };
    assert!(in_place.iter().all(|&b| b == 0x5A));
    consumer.commit_read(&view);

    // Both sides drained: no bytes outstanding.
    assert_eq!(producer.used_bytes(), 0);
    assert_eq!(consumer.used_bytes(), 0);
    Ok(())
}

#[test]
#[serial]
fn test_commit_larger_than_reservation_is_dropped() -> Result<()> {
    let name = unique_name("overcommit");
    RingBuffer::remove(&name);

    let producer = RingBuffer::create(&name, 4096)?;
    let consumer = RingBuffer::open(&name)?;

    let reservation = producer.try_reserve_write(16).expect("space available");
    let max = reservation.max_size;

    // Oversized commit must not advance the write index.
    producer.commit_write(&reservation, max + 1);
    assert_eq!(producer.used_bytes(), 0);
    assert!(consumer.try_read_view().is_none());
    Ok(())
}

#[test]
#[serial]
fn test_abandoned_reservation_stays_free() -> Result<()> {
    let name = unique_name("abandon");
    RingBuffer::remove(&name);

    let producer = RingBuffer::create(&name, 4096)?;
    let consumer = RingBuffer::open(&name)?;

    let before = producer.available_bytes();
    {
        let _reservation = producer.try_reserve_write(512).expect("space available");
        // Dropped without commit.
    }
    assert_eq!(producer.available_bytes(), before);
    assert!(consumer.try_read_view().is_none());

    // The slot is immediately reusable.
    assert!(producer.try_write(b"after abandon"));
    let mut scratch = [0u8; 64];
    assert_eq!(consumer.try_read(&mut scratch), 13);
    Ok(())
}

#[test]
#[serial]
fn test_blocking_read_with_timeout() -> Result<()> {
    let name = unique_name("timedwait");
    RingBuffer::remove(&name);

    let producer = RingBuffer::create(&name, 4096)?;
    let consumer = RingBuffer::open(&name)?;

    // Timeout path: nothing arrives.
    let mut scratch = [0u8; 64];
    let start = std::time::Instant::now();
    let n = consumer.read_with_timeout(&mut scratch, Duration::from_millis(50));
    assert_eq!(n, 0);
    assert!(start.elapsed() >= Duration::from_millis(40));

    // Wakeup path: a writer on another thread signals the condvar.
    let writer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        assert!(producer.try_write(b"wake up"));
        producer
    });

    let n = consumer.read_with_timeout(&mut scratch, Duration::from_secs(2));
    assert_eq!(&scratch[..n], b"wake up");

    let _producer = writer.join().expect("writer thread");
    Ok(())
}
