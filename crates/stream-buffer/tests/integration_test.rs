//! Integration tests for stream-buffer.
//!
//! These drive appends and readers from several threads, each with its own
//! handle on the buffer, the way separate processes would share it.

#![cfg(unix)] // Only run on Unix platforms

use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use stream_buffer::{ReaderSet, StreamBuffer, StreamBufferConfig, StreamError, StreamResult};

fn unique_buffer_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn config(capacity: usize, max_wait: Option<Duration>) -> StreamBufferConfig {
    StreamBufferConfig {
        capacity,
        eviction_sleep: Duration::from_millis(1),
        max_eviction_wait: max_wait,
    }
}

fn readers(ids: &[usize]) -> ReaderSet {
    ids.iter().copied().collect()
}

/// Payload carrying its own index and a byte pattern derived from it.
fn payload(index: u64, len: usize) -> Vec<u8> {
    let mut bytes = index.to_le_bytes().to_vec();
    bytes.extend(std::iter::repeat((index % 251) as u8).take(len));
    bytes
}

fn check_payload(bytes: &[u8]) -> u64 {
    let index = u64::from_le_bytes(bytes[..8].try_into().unwrap());
    assert!(
        bytes[8..].iter().all(|b| *b == (index % 251) as u8),
        "payload of event {} was overwritten while pinned",
        index
    );
    index
}

#[test]
fn test_event_reclaimed_only_after_every_reader_unpins() -> StreamResult<()> {
    // Three 96-byte slots fill the region exactly; a fourth needs E1's space.
    let id = unique_buffer_id();
    let buffer = StreamBuffer::create(&id, config(288, Some(Duration::from_millis(30))))?;
    let mut r1 = buffer.open_reader(1)?;
    let mut r2 = buffer.open_reader(2)?;
    let both = readers(&[1, 2]);

    for name in [b"E1", b"E2", b"E3"] {
        let mut body = name.to_vec();
        body.resize(48, 0);
        assert_eq!(buffer.append("s", 0, &body, both)?.size, 96);
    }

    // R1 reads E1 and E2, then closes.
    for expected in [b"E1", b"E2"] {
        let event = r1.pin_next().expect("r1 should see an event");
        assert_eq!(&event.payload()[..2], expected);
        event.unpin();
    }
    r1.close();

    // R2 pins E1 but has not released it yet.
    let e1 = r2.pin_next().expect("r2 should see E1");
    assert_eq!(&e1.payload()[..2], b"E1");

    let mut e4 = b"E4".to_vec();
    e4.resize(48, 0);
    assert!(matches!(
        buffer.append("s", 0, &e4, both),
        Err(StreamError::EvictionTimeout { .. })
    ));

    let writer = StreamBuffer::open(&id, config(0, Some(Duration::from_secs(5))))?;
    thread::scope(|scope| -> StreamResult<()> {
        let append = scope.spawn(|| writer.append("s", 0, &e4, both));

        thread::sleep(Duration::from_millis(50));
        assert!(!append.is_finished(), "E4 must wait for R2 to release E1");

        e1.unpin();
        let info = append.join().unwrap()?;
        assert_eq!(info.sequence, 3);
        Ok(())
    })?;

    // R2 still sees the rest of the stream in order.
    let rest: Vec<_> = r2.drain().into_iter().map(|e| e.payload[..2].to_vec()).collect();
    assert_eq!(rest, vec![b"E2".to_vec(), b"E3".to_vec(), b"E4".to_vec()]);
    Ok(())
}

#[test]
fn test_each_reader_sees_its_events_in_order() -> StreamResult<()> {
    let id = unique_buffer_id();
    let buffer = StreamBuffer::create(&id, config(1024, Some(Duration::from_secs(10))))?;
    buffer.register_reader(0)?;
    buffer.register_reader(1)?;

    let total = 500u64;
    let collect = |reader_id: usize| {
        let id = id.clone();
        move || -> StreamResult<Vec<u64>> {
            let handle = StreamBuffer::open(&id, config(0, None))?;
            let mut reader = handle.open_reader(reader_id)?;
            let mut seen = Vec::new();
            while let Some(event) = reader.next_blocking(Some(Duration::from_secs(2)))? {
                seen.push(check_payload(event.payload()));
                event.unpin();
            }
            Ok(seen)
        }
    };
    let r0 = thread::spawn(collect(0));
    let r1 = thread::spawn(collect(1));

    let mut expected0 = Vec::new();
    let mut expected1 = Vec::new();
    for i in 0..total {
        // Every event for reader 0, every third also for reader 1.
        let set = if i % 3 == 0 { readers(&[0, 1]) } else { readers(&[0]) };
        buffer.append("s", 0, &payload(i, (i % 40) as usize), set)?;
        expected0.push(i);
        if i % 3 == 0 {
            expected1.push(i);
        }
    }

    assert_eq!(r0.join().unwrap()?, expected0);
    assert_eq!(r1.join().unwrap()?, expected1);
    assert_eq!(buffer.stats().appended, total);
    Ok(())
}

#[test]
fn test_pinned_events_are_never_overwritten() -> StreamResult<()> {
    let id = unique_buffer_id();
    let buffer = StreamBuffer::create(&id, config(512, Some(Duration::from_secs(10))))?;
    for reader in 0..3 {
        buffer.register_reader(reader)?;
    }

    let total = 300u64;
    let consumers: Vec<_> = (0..3)
        .map(|reader_id| {
            let id = id.clone();
            thread::spawn(move || -> StreamResult<u64> {
                let handle = StreamBuffer::open(&id, config(0, None))?;
                let mut reader = handle.open_reader(reader_id)?;
                let mut rng = rand::thread_rng();
                let mut count = 0;
                while let Some(event) = reader.next_blocking(Some(Duration::from_secs(2)))? {
                    let before = check_payload(event.payload());
                    thread::sleep(Duration::from_micros(rng.gen_range(0..300)));
                    assert_eq!(check_payload(event.payload()), before);
                    event.unpin();
                    count += 1;
                }
                Ok(count)
            })
        })
        .collect();

    let all = readers(&[0, 1, 2]);
    let mut rng = rand::thread_rng();
    for i in 0..total {
        buffer.append("s", 0, &payload(i, rng.gen_range(0..100)), all)?;
    }

    for consumer in consumers {
        assert_eq!(consumer.join().unwrap()?, total);
    }
    assert!(buffer.stats().eviction_waits > 0);
    Ok(())
}

#[test]
fn test_unregister_releases_blocked_append() -> StreamResult<()> {
    let id = unique_buffer_id();
    let buffer = StreamBuffer::create(&id, config(256, Some(Duration::from_secs(5))))?;
    buffer.register_reader(9)?;
    let stalled = readers(&[9]);

    buffer.append("s", 0, &[0u8; 63], stalled)?;
    buffer.append("s", 0, &[0u8; 63], stalled)?;

    thread::scope(|scope| -> StreamResult<()> {
        let append = scope.spawn(|| buffer.append("s", 0, &[0u8; 63], stalled));
        thread::sleep(Duration::from_millis(30));
        assert!(!append.is_finished());

        assert_eq!(buffer.unregister_reader(9)?, 2);
        append.join().unwrap()?;
        Ok(())
    })
}

#[test]
fn test_shutdown_fails_blocked_append() -> StreamResult<()> {
    let id = unique_buffer_id();
    let buffer = StreamBuffer::create(&id, config(256, None))?;
    let _reader = buffer.open_reader(0)?;
    let held = readers(&[0]);

    buffer.append("s", 0, &[0u8; 63], held)?;
    buffer.append("s", 0, &[0u8; 63], held)?;

    let start = Instant::now();
    thread::scope(|scope| {
        let append = scope.spawn(|| buffer.append("s", 0, &[0u8; 63], held));
        thread::sleep(Duration::from_millis(30));
        buffer.shutdown();
        assert!(matches!(append.join().unwrap(), Err(StreamError::Shutdown)));
    });
    assert!(start.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[test]
fn test_blocked_reader_wakes_on_append() -> StreamResult<()> {
    let id = unique_buffer_id();
    let buffer = StreamBuffer::create(&id, config(1024, None))?;
    let mut reader = buffer.open_reader(4)?;

    thread::scope(|scope| -> StreamResult<()> {
        let _writer = scope.spawn(|| {
            thread::sleep(Duration::from_millis(20));
            buffer.append("late", 1, b"wake", readers(&[4]))
        });

        let event = reader
            .next_blocking(Some(Duration::from_secs(5)))?
            .expect("append should wake the reader");
        assert_eq!(event.stream(), "late");
        assert_eq!(event.payload(), b"wake");
        Ok(())
    })
}
