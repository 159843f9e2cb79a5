//! Bounded, key-ordered segment containers.
//!
//! `SegmentQueue` is the blocking multiset behind all four per-session
//! containers (sendQueue, sendBuf, recvBuf, recvQueue). Segments are keyed
//! by sequence number; equal keys may coexist and their relative order is
//! unspecified. A mutex plus two condvars provide the blocking discipline,
//! and a `closed` flag wakes every waiter when the container dies.

use crate::segment::Segment;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};

struct Shared {
    segments: BTreeMap<u32, VecDeque<Segment>>,
    len: usize,
    closed: bool,
}

impl Shared {
    fn pop_min(&mut self) -> Option<Segment> {
        let mut entry = self.segments.first_entry()?;
        let seg = entry.get_mut().pop_front()?;
        if entry.get().is_empty() {
            entry.remove();
        }
        self.len -= 1;
        Some(seg)
    }
}

pub struct SegmentQueue {
    capacity: usize,
    shared: Mutex<Shared>,
    readable: Condvar,
    writable: Condvar,
}

impl SegmentQueue {
    /// Create a container with a fixed capacity.
    pub fn new(capacity: usize) -> Self {
        SegmentQueue {
            capacity,
            shared: Mutex::new(Shared {
                segments: BTreeMap::new(),
                len: 0,
                closed: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.shared.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free capacity, used to compute the advertised receive window.
    pub fn remaining(&self) -> usize {
        let shared = self.shared.lock();
        self.capacity - shared.len
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Insert a segment, blocking while the container is full.
    /// Returns false if the container died before the segment was stored.
    pub fn insert_blocking(&self, segment: Segment) -> bool {
        let mut shared = self.shared.lock();
        while shared.len >= self.capacity && !shared.closed {
            self.writable.wait(&mut shared);
        }
        if shared.closed {
            return false;
        }
        shared
            .segments
            .entry(segment.seq())
            .or_default()
            .push_back(segment);
        shared.len += 1;
        self.readable.notify_one();
        true
    }

    /// Remove the lowest-keyed segment without blocking.
    pub fn delete_min(&self) -> Option<Segment> {
        let mut shared = self.shared.lock();
        let seg = shared.pop_min();
        if seg.is_some() {
            self.writable.notify_one();
        }
        seg
    }

    /// Remove the lowest-keyed segment, blocking while the container is
    /// empty. Returns `None` once the container is dead and drained.
    pub fn delete_min_blocking(&self) -> Option<Segment> {
        let mut shared = self.shared.lock();
        loop {
            if let Some(seg) = shared.pop_min() {
                self.writable.notify_one();
                return Some(seg);
            }
            if shared.closed {
                return None;
            }
            self.readable.wait(&mut shared);
        }
    }

    /// Remove the lowest-keyed segment iff `predicate` holds for it,
    /// atomically. Returns `None` when the container is empty or the
    /// predicate rejects the minimum.
    pub fn delete_min_if<F>(&self, predicate: F) -> Option<Segment>
    where
        F: FnOnce(&Segment) -> bool,
    {
        let mut shared = self.shared.lock();
        {
            let entry = shared.segments.first_entry()?;
            let min = entry.get().front()?;
            if !predicate(min) {
                return None;
            }
        }
        let seg = shared.pop_min();
        if seg.is_some() {
            self.writable.notify_one();
        }
        seg
    }

    /// Kill the container: every blocked producer and consumer wakes, and
    /// future insertions are refused. Remaining segments stay drainable.
    pub fn close(&self) {
        let mut shared = self.shared.lock();
        shared.closed = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::ProtocolKind;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn data_segment(seq: u32) -> Segment {
        Segment::new_data(
            ProtocolKind::DataClientToServer,
            1,
            seq,
            0,
            0,
            0,
            Bytes::from_static(b"x"),
        )
    }

    #[test]
    fn test_delete_min_orders_by_seq() {
        let queue = SegmentQueue::new(16);
        for seq in [5u32, 1, 3, 2, 4] {
            assert!(queue.insert_blocking(data_segment(seq)));
        }
        for expected in 1..=5u32 {
            assert_eq!(queue.delete_min().unwrap().seq(), expected);
        }
        assert!(queue.delete_min().is_none());
    }

    #[test]
    fn test_duplicate_keys_coexist() {
        let queue = SegmentQueue::new(16);
        assert!(queue.insert_blocking(data_segment(9)));
        assert!(queue.insert_blocking(data_segment(9)));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.delete_min().unwrap().seq(), 9);
        assert_eq!(queue.delete_min().unwrap().seq(), 9);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remaining_tracks_occupancy() {
        let queue = SegmentQueue::new(4);
        assert_eq!(queue.remaining(), 4);
        queue.insert_blocking(data_segment(1));
        queue.insert_blocking(data_segment(2));
        assert_eq!(queue.remaining(), 2);
        queue.delete_min();
        assert_eq!(queue.remaining(), 3);
    }

    #[test]
    fn test_delete_min_if_rejects_minimum() {
        let queue = SegmentQueue::new(16);
        queue.insert_blocking(data_segment(10));
        assert!(queue.delete_min_if(|seg| seg.seq() < 10).is_none());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.delete_min_if(|seg| seg.seq() <= 10).unwrap().seq(), 10);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_insert_blocks_until_capacity_frees() {
        let queue = Arc::new(SegmentQueue::new(1));
        assert!(queue.insert_blocking(data_segment(1)));

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.insert_blocking(data_segment(2)))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.delete_min().unwrap().seq(), 1);
        assert!(producer.join().unwrap());
        assert_eq!(queue.delete_min().unwrap().seq(), 2);
    }

    #[test]
    fn test_delete_min_blocking_waits_for_insert() {
        let queue = Arc::new(SegmentQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.delete_min_blocking())
        };
        thread::sleep(Duration::from_millis(20));
        queue.insert_blocking(data_segment(3));
        assert_eq!(consumer.join().unwrap().unwrap().seq(), 3);
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let queue = Arc::new(SegmentQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.delete_min_blocking())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn test_close_refuses_insert_but_drains() {
        let queue = SegmentQueue::new(4);
        queue.insert_blocking(data_segment(1));
        queue.close();
        assert!(queue.is_closed());
        assert!(!queue.insert_blocking(data_segment(2)));
        assert_eq!(queue.delete_min_blocking().unwrap().seq(), 1);
        assert!(queue.delete_min_blocking().is_none());
    }
}
