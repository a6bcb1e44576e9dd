//! FIFO of requests parked until a connection is released.

use std::collections::VecDeque;
use std::time::Instant;

use thiserror::Error;
use tracing::debug;

use crate::reactor::{Reactor, RequestId};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("wait queue is full")]
pub(crate) struct QueueFull;

#[derive(Debug)]
struct WaitEntry {
    request: RequestId,
    queued_at: Instant,
}

/// Bounded FIFO of [`RequestId`]s waiting for a connection.
#[derive(Debug)]
pub(crate) struct WaitQueue {
    entries: VecDeque<WaitEntry>,
    capacity: usize,
}

impl WaitQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    /// Suspends `request` and appends it. A request that is already queued
    /// keeps its position.
    pub(crate) fn enqueue(
        &mut self,
        request: RequestId,
        reactor: &mut impl Reactor,
    ) -> Result<(), QueueFull> {
        if self.contains(request) {
            reactor.suspend(request);
            return Ok(());
        }
        if self.entries.len() >= self.capacity {
            return Err(QueueFull);
        }

        reactor.suspend(request);
        self.entries.push_back(WaitEntry {
            request,
            queued_at: Instant::now(),
        });
        debug!(request = %request, depth = self.entries.len(), "request queued for connection");
        Ok(())
    }

    /// Wakes and removes the first entry whose request is still live.
    /// Entries of torn-down requests met on the way are dropped.
    pub(crate) fn dispatch_one(&mut self, reactor: &mut impl Reactor) -> Option<RequestId> {
        while let Some(entry) = self.entries.pop_front() {
            if reactor.is_torn_down(entry.request) {
                debug!(request = %entry.request, "dropping wait entry of torn-down request");
                continue;
            }

            reactor.wake(entry.request);
            debug!(
                request = %entry.request,
                waited_ms = entry.queued_at.elapsed().as_millis() as u64,
                "queued request woken"
            );
            return Some(entry.request);
        }
        None
    }

    /// Removes the entry for `request`, wherever it sits.
    pub(crate) fn remove(&mut self, request: RequestId) -> bool {
        match self.entries.iter().position(|e| e.request == request) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Drops entries of torn-down requests and reports whether anyone is
    /// still waiting.
    pub(crate) fn has_live(&mut self, reactor: &impl Reactor) -> bool {
        self.entries.retain(|e| !reactor.is_torn_down(e.request));
        !self.entries.is_empty()
    }

    pub(crate) fn contains(&self, request: RequestId) -> bool {
        self.entries.iter().any(|e| e.request == request)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drops every entry without waking anyone.
    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::RunQueue;

    #[test]
    fn fifo_dispatch() {
        let mut rq = RunQueue::new();
        let mut queue = WaitQueue::new(10);
        for id in 1..=3 {
            queue.enqueue(RequestId(id), &mut rq).unwrap();
            assert!(rq.is_asleep(RequestId(id)));
        }

        assert_eq!(queue.dispatch_one(&mut rq), Some(RequestId(1)));
        assert_eq!(queue.dispatch_one(&mut rq), Some(RequestId(2)));
        assert_eq!(rq.pop_ready(), Some(RequestId(1)));
        assert_eq!(rq.pop_ready(), Some(RequestId(2)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn torn_down_entries_are_dropped() {
        let mut rq = RunQueue::new();
        let mut queue = WaitQueue::new(10);
        queue.enqueue(RequestId(1), &mut rq).unwrap();
        queue.enqueue(RequestId(2), &mut rq).unwrap();
        queue.enqueue(RequestId(3), &mut rq).unwrap();
        rq.tear_down(RequestId(1));

        assert_eq!(queue.dispatch_one(&mut rq), Some(RequestId(2)));
        assert!(!queue.contains(RequestId(1)));
        assert_eq!(queue.dispatch_one(&mut rq), Some(RequestId(3)));
        assert_eq!(queue.dispatch_one(&mut rq), None);
    }

    #[test]
    fn remove_any_position() {
        let mut rq = RunQueue::new();
        let mut queue = WaitQueue::new(10);
        for id in 1..=3 {
            queue.enqueue(RequestId(id), &mut rq).unwrap();
        }
        assert!(queue.remove(RequestId(2)));
        assert!(!queue.remove(RequestId(2)));
        assert_eq!(queue.dispatch_one(&mut rq), Some(RequestId(1)));
        assert_eq!(queue.dispatch_one(&mut rq), Some(RequestId(3)));
    }

    #[test]
    fn capacity_is_enforced() {
        let mut rq = RunQueue::new();
        let mut queue = WaitQueue::new(1);
        queue.enqueue(RequestId(1), &mut rq).unwrap();
        assert_eq!(queue.enqueue(RequestId(2), &mut rq), Err(QueueFull));
        assert!(!rq.is_asleep(RequestId(2)));
    }

    #[test]
    fn requeue_keeps_position() {
        let mut rq = RunQueue::new();
        let mut queue = WaitQueue::new(2);
        queue.enqueue(RequestId(1), &mut rq).unwrap();
        queue.enqueue(RequestId(2), &mut rq).unwrap();
        queue.enqueue(RequestId(1), &mut rq).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dispatch_one(&mut rq), Some(RequestId(1)));
    }

    #[test]
    fn has_live_ignores_torn_down() {
        let mut rq = RunQueue::new();
        let mut queue = WaitQueue::new(4);
        assert!(!queue.has_live(&rq));
        queue.enqueue(RequestId(1), &mut rq).unwrap();
        assert!(queue.has_live(&rq));
        rq.tear_down(RequestId(1));
        assert!(!queue.has_live(&rq));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn empty_dispatch_is_noop() {
        let mut rq = RunQueue::new();
        let mut queue = WaitQueue::new(1);
        assert_eq!(queue.dispatch_one(&mut rq), None);
        assert_eq!(rq.ready_len(), 0);
    }
}
