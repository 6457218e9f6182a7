//! Single-producer/single-consumer bounded frame ring.
//!
//! Lock-free happy path over atomics, with a strict SPSC contract — exactly
//! one producer, exactly one consumer. Each slot carries a sequence counter
//! so a consumer mid-read can detect a producer overwrite and retry instead
//! of returning a torn frame.

use crate::frame::Frame;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

struct Slot {
    /// Odd while a write is in progress, even otherwise; bumped before and
    /// after each producer write (a seqlock, as prescribes for
    /// torn-read-tolerant fields).
    seq: AtomicU64,
    frame: Mutex<Option<Frame>>,
}

/// Bounded ring of pre-allocated frame slots between one producer and one
/// consumer. Overwrites the oldest unread slot on overflow — recency over
/// completeness.
pub struct Ring {
    slots: Vec<Slot>,
    capacity: u64,
    /// Monotonically increasing slot index the producer will write next.
    head: AtomicU64,
    /// Highest published sequence the consumer has not yet retired.
    tail: AtomicU64,
    /// Highest head value ever published; 0 means "nothing published yet".
    published: AtomicU64,
}

impl Ring {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be > 0");
        let slots = (0..capacity)
            .map(|_| Slot {
                seq: AtomicU64::new(0),
                frame: Mutex::new(None),
            })
            .collect();
        Self {
            slots,
            capacity: capacity as u64,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            published: AtomicU64::new(0),
        }
    }

    /// Claim the next slot for writing. The producer never blocks: if the
    /// ring is full the oldest unretired slot is reused and silently lost.
    pub fn producer_acquire(&self) -> u64 {
        let head = self.head.fetch_add(1, Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.saturating_sub(tail) >= self.capacity {
            // Consumer fell behind; drop its oldest outstanding slot.
            self.tail.store(head + 1 - self.capacity, Ordering::Release);
        }
        head
    }

    /// Publish a frame into the slot claimed by `producer_acquire`.
    pub fn producer_release(&self, index: u64, frame: Frame) {
        let slot = &self.slots[(index % self.capacity) as usize];
        let seq = index * 2 + 1;
        slot.seq.store(seq, Ordering::Release);
        *slot.frame.lock() = Some(frame);
        slot.seq.store(seq + 1, Ordering::Release);
        self.published.store(index + 1, Ordering::Release);
    }

    /// Convenience wrapper: acquire + release in one call.
    pub fn publish(&self, frame: Frame) {
        let idx = self.producer_acquire();
        self.producer_release(idx, frame);
    }

    /// Poll for the newest published-but-unread frame, retrying with a short
    /// back-off until `timeout` elapses. Returns `None` only when nothing has
    /// ever been published — otherwise always the most recent slot, never
    /// the oldest.
    pub fn consumer_acquire(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            let published = self.published.load(Ordering::Acquire);
            if published > 0 {
                let newest = published - 1;
                if let Some(frame) = self.try_read(newest) {
                    self.tail.store(published, Ordering::Release);
                    return Some(frame);
                }
                // Producer raced us on this slot; fall through to retry.
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn try_read(&self, index: u64) -> Option<Frame> {
        let slot = &self.slots[(index % self.capacity) as usize];
        let seq_before = slot.seq.load(Ordering::Acquire);
        if seq_before % 2 == 1 {
            return None; // write in progress
        }
        let frame = slot.frame.lock().clone();
        let seq_after = slot.seq.load(Ordering::Acquire);
        if seq_before != seq_after {
            return None; // producer overwrote mid-read; caller retries
        }
        frame
    }

    /// Non-blocking variant used by the HTTP refresher tick.
    pub fn try_consume(&self) -> Option<Frame> {
        self.consumer_acquire(Duration::from_secs(0))
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CodecFormat;

    fn jpeg(n: u64) -> Frame {
        Frame::compressed(4, 4, CodecFormat::Jpeg, n.to_le_bytes().to_vec(), true, 1)
    }

    fn frame_id(f: &Frame) -> u64 {
        u64::from_le_bytes(f.data.clone().try_into().unwrap())
    }

    #[test]
    fn empty_ring_yields_none() {
        let ring = Ring::new(4);
        assert!(ring.try_consume().is_none());
    }

    #[test]
    fn consumer_sees_latest_published_frame() {
        let ring = Ring::new(4);
        ring.publish(jpeg(1));
        ring.publish(jpeg(2));
        let got = ring.try_consume().unwrap();
        assert_eq!(frame_id(&got), 2);
    }

    #[test]
    fn overflow_drops_oldest_not_newest() {
        let ring = Ring::new(4);
        for i in 0..1000u64 {
            ring.publish(jpeg(i));
        }
        let got = ring.try_consume().unwrap();
        assert_eq!(frame_id(&got), 999);
    }

    #[test]
    fn monotonic_ids_across_reads() {
        let ring = Ring::new(4);
        let mut last = 0u64;
        for batch in 0..10 {
            for i in 0..4u64 {
                ring.publish(jpeg(batch * 4 + i));
            }
            let got = ring.try_consume().unwrap();
            let id = frame_id(&got);
            assert!(id >= last);
            last = id;
        }
    }

    #[test]
    fn consumer_timeout_on_truly_empty_ring() {
        let ring = Ring::new(4);
        let start = Instant::now();
        let got = ring.consumer_acquire(Duration::from_millis(20));
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}
