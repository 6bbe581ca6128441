//! Same-thread deadline queue
//!
//! Work scheduled here runs on whichever thread drains the queue, which is
//! always the thread that owns the registers. Nothing is spawned.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Entry<T: Ord> {
    deadline: Instant,
    seq: u64,
    item: T,
}

/// Items released once their deadline passes, earliest first, ties in
/// scheduling order.
#[derive(Debug)]
pub struct DeferredQueue<T: Ord> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    next_seq: u64,
}

impl<T: Ord> Default for DeferredQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord> DeferredQueue<T> {
    /// Empty queue.
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Release `item` once `delay` has passed from now.
    pub fn schedule(&mut self, delay: Duration, item: T) {
        self.schedule_at(Instant::now() + delay, item);
    }

    /// Release `item` at `deadline`.
    pub fn schedule_at(&mut self, deadline: Instant, item: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry { deadline, seq, item }));
    }

    /// Remove and return every item due at `now`.
    pub fn take_due(&mut self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        while self
            .heap
            .peek()
            .is_some_and(|Reverse(entry)| entry.deadline <= now)
        {
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry.item);
            }
        }
        due
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Pending item count.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releases_in_deadline_order() {
        let base = Instant::now();
        let mut q = DeferredQueue::new();
        q.schedule_at(base + Duration::from_millis(20), 'b');
        q.schedule_at(base + Duration::from_millis(10), 'a');
        q.schedule_at(base + Duration::from_millis(30), 'c');
        assert_eq!(q.next_deadline(), Some(base + Duration::from_millis(10)));

        assert!(q.take_due(base).is_empty());
        assert_eq!(q.take_due(base + Duration::from_millis(25)), vec!['a', 'b']);
        assert_eq!(q.len(), 1);
        assert_eq!(q.take_due(base + Duration::from_secs(1)), vec!['c']);
        assert!(q.is_empty());
    }

    #[test]
    fn equal_deadlines_keep_schedule_order() {
        let at = Instant::now();
        let mut q = DeferredQueue::new();
        q.schedule_at(at, 3);
        q.schedule_at(at, 1);
        q.schedule_at(at, 2);
        assert_eq!(q.take_due(at), vec![3, 1, 2]);
    }

    #[test]
    fn zero_delay_is_due_immediately() {
        let mut q = DeferredQueue::new();
        q.schedule(Duration::ZERO, ());
        assert_eq!(q.take_due(Instant::now()).len(), 1);
    }
}
