//! Thread-safe FIFO of deferred calls (the idle and urgent queues).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::delayed_call::DelayedCall;
use super::lock;

pub(crate) struct CallQueue<S> {
    name: &'static str,
    queue: Mutex<VecDeque<DelayedCall<S>>>,
    warn_size: usize,
    warn_limit: usize,
    warnings: AtomicUsize,
}

impl<S: 'static> CallQueue<S> {
    pub(crate) fn new(name: &'static str, warn_size: usize, warn_limit: usize) -> Self {
        Self {
            name,
            queue: Mutex::new(VecDeque::new()),
            warn_size,
            warn_limit,
            warnings: AtomicUsize::new(0),
        }
    }

    pub(crate) fn push(&self, call: DelayedCall<S>) {
        let len = {
            let mut queue = lock(&self.queue);
            queue.push_back(call);
            queue.len()
        };
        if len > self.warn_size && self.warnings.fetch_add(1, Ordering::Relaxed) < self.warn_limit
        {
            tracing::warn!(queue = self.name, len, "{} queue size too large", self.name);
        }
    }

    pub(crate) fn pop(&self) -> Option<DelayedCall<S>> {
        lock(&self.queue).pop_front()
    }

    pub(crate) fn has_pending(&self) -> bool {
        !lock(&self.queue).is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.queue).len()
    }
}
