//! Ring semantics and snapshot consistency of `HistoryBuffer`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thermocal_daq::data::history::HistoryBuffer;

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

#[test]
fn length_is_min_of_appends_and_capacity() {
    for capacity in [1usize, 3, 16] {
        for n in [1usize, 2, 3, 15, 16, 17, 50] {
            let buffer = HistoryBuffer::new("CH101", capacity);
            for i in 0..n {
                assert!(buffer.append(ms(i as u64), i as f64));
            }
            let snapshot = buffer.snapshot();
            let expected_len = n.min(capacity);
            assert_eq!(snapshot.len(), expected_len, "n={n} capacity={capacity}");

            let expected: Vec<f64> = ((n - expected_len)..n).map(|i| i as f64).collect();
            let values: Vec<f64> = snapshot.iter().map(|s| s.value).collect();
            assert_eq!(values, expected, "n={n} capacity={capacity}");
        }
    }
}

#[test]
fn clear_then_append_is_visible() {
    let buffer = HistoryBuffer::new("P1_temp[degC]", 4);
    for i in 0..6u64 {
        buffer.append(ms(i * 1000), 20.0 + i as f64);
    }
    buffer.clear();
    assert_eq!(buffer.len(), 0);
    assert!(buffer.snapshot().is_empty());

    // Clearing also forgets the newest timestamp, so an older one is accepted.
    assert!(buffer.append(ms(10), 21.5));
    let snapshot = buffer.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].timestamp, ms(10));
    assert_eq!(snapshot[0].value, 21.5);
}

#[test]
fn nan_samples_are_stored() {
    let buffer = HistoryBuffer::new("CH102", 4);
    assert!(buffer.append(ms(0), f64::NAN));
    assert!(buffer.latest().is_some_and(|s| s.value.is_nan()));
}

#[test]
fn concurrent_snapshots_are_never_torn() {
    const CAPACITY: usize = 64;
    let buffer = Arc::new(HistoryBuffer::new("CH101", CAPACITY));
    let done = Arc::new(AtomicBool::new(false));

    // value == timestamp in milliseconds, so any torn pair is detectable
    let writer = {
        let buffer = Arc::clone(&buffer);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for i in 0..20_000u64 {
                buffer.append(ms(i), i as f64);
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let mut snapshots = 0u64;
    while !done.load(Ordering::SeqCst) || snapshots == 0 {
        let snapshot = buffer.snapshot();
        assert!(snapshot.len() <= CAPACITY);
        for sample in &snapshot {
            assert_eq!(sample.value, sample.timestamp.as_millis() as f64);
        }
        assert!(snapshot.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        snapshots += 1;
    }
    writer.join().expect("writer thread");

    let last = buffer.snapshot();
    assert_eq!(last.len(), CAPACITY);
    assert_eq!(last[CAPACITY - 1].value, 19_999.0);
}
