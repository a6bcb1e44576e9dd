//! Scheduling boundary between the query engine and the event loop.
//!
//! The engine never blocks and never calls request code directly. It asks a
//! [`Reactor`] to put a request to sleep, to wake it, and to watch a
//! connection's socket for readability. A woken request is a message on the
//! reactor's run queue; the event loop picks it up and resumes the request.
//!
//! [`RunQueue`] is the in-process implementation used by the
//! [`worker`](crate::worker) and by tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::os::fd::RawFd;

/// Stable identity of one in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Stable identity of one pooled database connection.
///
/// Identifiers are never reused, so a readiness event that arrives after its
/// connection was destroyed cannot be mistaken for another connection's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Cooperative scheduling and readiness primitives consumed by the engine.
///
/// All methods are called from the single worker context.
pub trait Reactor {
    /// Marks `request` as asleep; it will not run until [`wake`](Self::wake)d.
    fn suspend(&mut self, request: RequestId);

    /// Schedules `request` to run again. Waking an awake request is a no-op.
    fn wake(&mut self, request: RequestId);

    /// Returns `true` if `request` has been marked for teardown.
    fn is_torn_down(&self, request: RequestId) -> bool;

    /// Starts delivering readability events for `fd` tagged with `conn`.
    fn register_readable(&mut self, fd: RawFd, conn: ConnId);

    /// Stops delivering readability events for `fd`.
    fn unregister_readable(&mut self, fd: RawFd);
}

/// FIFO run queue with sleep/wake bookkeeping.
///
/// # Examples
///
/// ```
/// use rttp_pgsql::reactor::{Reactor, RequestId, RunQueue};
///
/// let mut reactor = RunQueue::new();
/// let req = RequestId(1);
///
/// reactor.suspend(req);
/// reactor.wake(req);
/// reactor.wake(req); // already awake, no second entry
///
/// assert_eq!(reactor.pop_ready(), Some(req));
/// assert_eq!(reactor.pop_ready(), None);
/// ```
#[derive(Debug, Default)]
pub struct RunQueue {
    asleep: HashSet<RequestId>,
    torn_down: HashSet<RequestId>,
    ready: VecDeque<RequestId>,
    readable: HashMap<RawFd, ConnId>,
}

impl RunQueue {
    /// Creates an empty run queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an awake request to the run queue, e.g. a freshly accepted one.
    pub fn schedule(&mut self, request: RequestId) {
        self.asleep.remove(&request);
        if !self.ready.contains(&request) {
            self.ready.push_back(request);
        }
    }

    /// Takes the next runnable request.
    pub fn pop_ready(&mut self) -> Option<RequestId> {
        self.ready.pop_front()
    }

    /// Number of requests waiting to run.
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Returns `true` if `request` is currently asleep.
    pub fn is_asleep(&self, request: RequestId) -> bool {
        self.asleep.contains(&request)
    }

    /// Marks `request` for teardown. It is dropped from the run queue and
    /// will be skipped by wait-queue dispatch.
    pub fn tear_down(&mut self, request: RequestId) {
        self.torn_down.insert(request);
        self.asleep.remove(&request);
        self.ready.retain(|r| *r != request);
    }

    /// Forgets every trace of a finished request.
    pub fn forget(&mut self, request: RequestId) {
        self.torn_down.remove(&request);
        self.asleep.remove(&request);
        self.ready.retain(|r| *r != request);
    }

    /// Returns the connection registered for `fd`, if any.
    pub fn registered(&self, fd: RawFd) -> Option<ConnId> {
        self.readable.get(&fd).copied()
    }

    /// Number of sockets currently registered for readability.
    pub fn registrations(&self) -> usize {
        self.readable.len()
    }
}

impl Reactor for RunQueue {
    fn suspend(&mut self, request: RequestId) {
        if self.torn_down.contains(&request) {
            return;
        }
        self.asleep.insert(request);
        self.ready.retain(|r| *r != request);
    }

    fn wake(&mut self, request: RequestId) {
        if self.asleep.remove(&request) {
            self.ready.push_back(request);
        }
    }

    fn is_torn_down(&self, request: RequestId) -> bool {
        self.torn_down.contains(&request)
    }

    fn register_readable(&mut self, fd: RawFd, conn: ConnId) {
        self.readable.insert(fd, conn);
    }

    fn unregister_readable(&mut self, fd: RawFd) {
        self.readable.remove(&fd);
    }
}
