//! Timer heap.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use super::delayed_call::DelayedCall;

struct TimerEntry<S> {
    when: Instant,
    seq: u64,
    call: DelayedCall<S>,
}

impl<S> PartialEq for TimerEntry<S> {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl<S> Eq for TimerEntry<S> {}

impl<S> Ord for TimerEntry<S> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: earliest deadline first, then insertion order
        match other.when.cmp(&self.when) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ordering => ordering,
        }
    }
}

impl<S> PartialOrd for TimerEntry<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of one-shot calls keyed by absolute fire time
pub(crate) struct Scheduler<S> {
    heap: BinaryHeap<TimerEntry<S>>,
    next_seq: u64,
}

impl<S: 'static> Scheduler<S> {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn add_timeout_at(&mut self, when: Instant, call: DelayedCall<S>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry { when, seq, call });
    }

    /// Time until the earliest live timer, `None` when there is none
    pub(crate) fn next_timeout(&mut self, now: Instant) -> Option<Duration> {
        self.prune_canceled();
        self.heap
            .peek()
            .map(|entry| entry.when.saturating_duration_since(now))
    }

    pub(crate) fn has_pending_timeout(&mut self, now: Instant) -> bool {
        self.prune_canceled();
        self.heap.peek().is_some_and(|entry| entry.when <= now)
    }

    /// Pop the earliest timer if its deadline has passed
    pub(crate) fn pop_ready(&mut self, now: Instant) -> Option<DelayedCall<S>> {
        if self.has_pending_timeout(now) {
            self.heap.pop().map(|entry| entry.call)
        } else {
            None
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    fn prune_canceled(&mut self) {
        while self.heap.peek().is_some_and(|entry| entry.call.is_canceled()) {
            self.heap.pop();
        }
    }
}
