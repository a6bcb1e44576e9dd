//! Asynchronous query engine and connection pool.
//!
//! A [`Database`] multiplexes a small, bounded set of PostgreSQL
//! connections across many suspended requests. It owns the pool, the wait
//! queue and every [`QueryId`] handle, and is passed explicitly to
//! request-handling code together with a [`Reactor`].
//!
//! The engine never blocks, except while opening a new connection below the
//! configured maximum. Everything else is driven from two places:
//!
//! - [`Database::submit`] binds a free connection and sends the query, or
//!   parks the request in the wait queue;
//! - [`Database::handle_readable`] consumes socket input when the reactor
//!   reports a connection readable, advances the handle's state and wakes
//!   the owning request.
//!
//! Handles follow this life cycle:
//!
//! ```text
//! Init ──submit──▶ Wait ──▶ Result | Done | Error ──continue──▶ … ──▶ Complete
//! ```
//!
//! A connection that finishes normally is drained and recycled; a connection
//! that fails is destroyed and never pooled again.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{ConfigError, PgConfig};
use crate::driver::{Connector, QueryResult, ResultStatus, Session};
use crate::reactor::{ConnId, Reactor, RequestId};

mod handle;
mod pool;
pub mod simple;
mod wait_queue;

pub use handle::{QueryId, QueryState};
pub use simple::{Flow, SimpleContext, SimpleHooks, SimpleQuery, SimpleState};

use handle::QueryHandle;
use pool::{Checkout, Destroyed, Pool, QueryJob};
use wait_queue::WaitQueue;

/// Outcome of [`Database::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    /// The query is on the wire; the request is suspended until readable.
    Sent,
    /// No connection was available; the request is suspended in the wait
    /// queue and the handle stays in [`QueryState::Init`]. Submit again once
    /// woken.
    Queued,
    /// The handle is in [`QueryState::Error`] with a message.
    Failed,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub live: usize,
    pub free: usize,
    pub busy: usize,
    pub queued: usize,
    pub max: usize,
}

/// Connection pool, wait queue and query handles of one worker.
pub struct Database<C: Connector> {
    config: PgConfig,
    connector: C,
    pool: Pool<C::Session>,
    queue: WaitQueue,
    // Woken waiters that have not submitted again yet, one slot each.
    reserved: Vec<RequestId>,
    handles: HashMap<QueryId, QueryHandle>,
    by_request: HashMap<RequestId, HashSet<QueryId>>,
    next_query: u64,
}

impl<C: Connector> Database<C> {
    /// Creates an empty context. No connection is opened until the first
    /// submit.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`] found by [`PgConfig::validate`].
    pub fn new(config: PgConfig, connector: C) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            pool: Pool::new(usize::from(config.max_connections)),
            queue: WaitQueue::new(config.wait_capacity),
            reserved: Vec::new(),
            config,
            connector,
            handles: HashMap::new(),
            by_request: HashMap::new(),
            next_query: 0,
        })
    }

    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    /// Creates a handle in [`QueryState::Init`] owned by `request`.
    pub fn create_query(&mut self, request: RequestId) -> QueryId {
        self.next_query += 1;
        let id = QueryId(self.next_query);
        self.handles.insert(id, QueryHandle::new(request));
        self.by_request.entry(request).or_default().insert(id);
        id
    }

    /// Cleans up `id` and forgets it. Unknown ids are ignored.
    pub fn release_query(&mut self, id: QueryId, reactor: &mut impl Reactor) {
        self.cleanup(id, reactor);
        self.handles.remove(&id);
    }

    /// Issues `query` on behalf of the handle's request.
    ///
    /// A request woken from the wait queue holds a reserved slot until it
    /// submits again. Newcomers queue behind live waiters and reservations.
    ///
    /// # Panics
    ///
    /// Panics if `id` is unknown or the handle is not in
    /// [`QueryState::Init`].
    pub fn submit(&mut self, id: QueryId, query: &str, reactor: &mut impl Reactor) -> Submit {
        let in_flight = self.jobs();
        let request = match self.handles.get_mut(&id) {
            None => panic!("submit on unknown query handle {id}"),
            Some(handle) if handle.state != QueryState::Init || handle.conn.is_some() => {
                panic!("submit on {id} in state {}", handle.state)
            }
            Some(handle) => {
                handle.clear_outcome();
                handle.request
            }
        };

        let reserved = self.revoke_reservation(request);
        if in_flight >= self.config.job_capacity {
            return self.reject(id, request, "too many query jobs in flight".to_owned(), reactor);
        }
        if !reserved && !self.may_skip_queue(reactor) {
            return self.park(id, request, reactor);
        }

        let conn = match self.pool.checkout(&self.connector, &self.config.conninfo) {
            Checkout::Bound(conn) => conn,
            Checkout::Exhausted => return self.park(id, request, reactor),
            Checkout::Failed(message) => return self.reject(id, request, message, reactor),
        };
        self.queue.remove(request);

        reactor.suspend(request);
        if let Some(handle) = self.handles.get_mut(&id) {
            handle.conn = Some(conn);
        }
        self.pool.attach(
            conn,
            QueryJob {
                query: query.to_owned(),
                request,
                handle: id,
            },
        );

        let sent = match self.pool.session_mut(conn) {
            Some(session) => session.send_query(query),
            None => return Submit::Failed,
        };
        if let Err(e) = sent {
            debug!(query = %id, conn = %conn, error = %e, "pgsql send failed");
            self.destroy_connection(conn, reactor);
            return Submit::Failed;
        }

        if let Some(fd) = self.pool.fd(conn) {
            reactor.register_readable(fd, conn);
        }
        if let Some(handle) = self.handles.get_mut(&id) {
            handle.state = QueryState::Wait;
        }
        debug!(query = %id, request = %request, conn = %conn, sql = %query, "pgsql query sent");
        Submit::Sent
    }

    /// Readiness callback for `conn`. A `failed` event (socket error or
    /// hang-up) destroys the connection.
    pub fn handle_readable(&mut self, conn: ConnId, failed: bool, reactor: &mut impl Reactor) {
        if !self.pool.contains(conn) {
            debug!(conn = %conn, "readiness for a connection that no longer exists");
            return;
        }
        if failed {
            self.destroy_connection(conn, reactor);
            return;
        }

        let waiting = self
            .pool
            .job(conn)
            .and_then(|job| self.handles.get(&job.handle))
            .is_some_and(|h| h.state == QueryState::Wait);

        if waiting {
            self.drive(conn, reactor);
        } else {
            // Input for an idle connection, or for a handle whose current
            // result has not been consumed yet: buffer it for later.
            let consumed = match self.pool.session_mut(conn) {
                Some(session) => session.consume_input(),
                None => return,
            };
            if let Err(e) = consumed {
                debug!(conn = %conn, error = %e, "pgsql consume failed");
                self.destroy_connection(conn, reactor);
            }
        }
    }

    /// Advances a handle past its current result or error.
    ///
    /// `Done` wakes the request and releases the connection; `Result` and
    /// `Error` read the next result; `Init`, `Wait` and `Complete` are
    /// left alone.
    pub fn continue_query(&mut self, id: QueryId, reactor: &mut impl Reactor) {
        let Some(handle) = self.handles.get_mut(&id) else {
            return;
        };
        handle.clear_outcome();

        match (handle.state, handle.conn) {
            (QueryState::Init | QueryState::Wait | QueryState::Complete, _) => {}
            (QueryState::Done, Some(conn)) => {
                reactor.wake(handle.request);
                self.release_connection(conn, reactor);
            }
            (QueryState::Result | QueryState::Error, Some(conn)) => self.drive(conn, reactor),
            (QueryState::Done | QueryState::Result | QueryState::Error, None) => {
                handle.state = QueryState::Complete;
            }
        }
    }

    /// Frees the handle's result and error, releases a bound connection and
    /// detaches the handle from its request. Safe to call repeatedly.
    pub fn cleanup(&mut self, id: QueryId, reactor: &mut impl Reactor) {
        let Some(handle) = self.handles.get_mut(&id) else {
            return;
        };
        handle.clear_outcome();
        let request = handle.request;
        let unsent = handle.state == QueryState::Init && handle.conn.is_none();

        if let Some(conn) = handle.conn {
            self.release_connection(conn, reactor);
        }

        if let Some(set) = self.by_request.get_mut(&request) {
            set.remove(&id);
            if set.is_empty() {
                self.by_request.remove(&request);
            }
        }

        // The request's place in line goes with its last unsent handle.
        if unsent && !self.has_unsent(request) {
            self.abandon_wait(request, reactor);
        }
    }

    pub fn state(&self, id: QueryId) -> Option<QueryState> {
        self.handles.get(&id).map(|h| h.state)
    }

    /// Error text of a handle in [`QueryState::Error`].
    pub fn error(&self, id: QueryId) -> Option<&str> {
        self.handles.get(&id)?.error.as_deref()
    }

    /// Current result set of a handle in [`QueryState::Result`].
    pub fn result(&self, id: QueryId) -> Option<&QueryResult> {
        self.handles.get(&id)?.result.as_ref()
    }

    /// Row count of the current result, 0 without one.
    pub fn ntuples(&self, id: QueryId) -> usize {
        self.result(id).map_or(0, QueryResult::ntuples)
    }

    /// Raw text of one cell of the current result.
    pub fn value(&self, id: QueryId, row: usize, col: usize) -> Option<&str> {
        self.result(id)?.value(row, col)
    }

    /// Logs the handle's error text.
    pub fn log_error(&self, id: QueryId) {
        let message = self.error(id).map_or("unknown", str::trim_end);
        warn!(query = %id, "pgsql error: {message}");
    }

    /// Handles currently owned by `request`.
    pub fn queries_of(&self, request: RequestId) -> Vec<QueryId> {
        let mut ids: Vec<QueryId> = self
            .by_request
            .get(&request)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Removes `request` from the wait queue. Returns `false` if it was not
    /// queued.
    pub fn queue_remove(&mut self, request: RequestId) -> bool {
        self.queue.remove(request)
    }

    /// Removes every trace of a request that is going away: its wait entry
    /// and all of its handles (releasing their connections).
    pub fn teardown_request(&mut self, request: RequestId, reactor: &mut impl Reactor) {
        let removed = self.abandon_wait(request, reactor);
        let ids = self.queries_of(request);
        for id in &ids {
            self.release_query(*id, reactor);
        }
        self.by_request.remove(&request);
        if removed || !ids.is_empty() {
            debug!(request = %request, queued = removed, handles = ids.len(), "pgsql request torn down");
        }
    }

    /// Destroys every connection and drops every wait entry. Handles that
    /// were busy end up in [`QueryState::Error`].
    pub fn shutdown(&mut self, reactor: &mut impl Reactor) {
        for destroyed in self.pool.shutdown(reactor) {
            self.fail_job(destroyed, reactor);
        }
        let dropped = self.queue.clear();
        self.reserved.clear();
        debug!(dropped, "pgsql pool shut down");
    }

    pub fn live_connections(&self) -> usize {
        self.pool.live()
    }

    pub fn free_connections(&self) -> usize {
        self.pool.free()
    }

    pub fn busy_connections(&self) -> usize {
        self.pool.busy()
    }

    pub fn queued_requests(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live: self.pool.live(),
            free: self.pool.free(),
            busy: self.pool.busy(),
            queued: self.queue.len(),
            max: usize::from(self.config.max_connections),
        }
    }

    fn jobs(&self) -> usize {
        self.handles.values().filter(|h| h.conn.is_some()).count()
    }

    // Connections a submit could bind right now: free ones plus room to grow.
    fn open_slots(&self) -> usize {
        let max = usize::from(self.config.max_connections);
        self.pool.free() + max.saturating_sub(self.pool.live())
    }

    fn may_skip_queue(&mut self, reactor: &mut impl Reactor) -> bool {
        self.reserved.retain(|r| !reactor.is_torn_down(*r));
        !self.queue.has_live(&*reactor) && self.open_slots() > self.reserved.len()
    }

    // Hands one open slot to the first live waiter, at most one per call.
    fn dispatch(&mut self, reactor: &mut impl Reactor) {
        self.reserved.retain(|r| !reactor.is_torn_down(*r));
        if self.open_slots() <= self.reserved.len() {
            return;
        }
        if let Some(request) = self.queue.dispatch_one(reactor) {
            self.reserved.push(request);
        }
    }

    fn revoke_reservation(&mut self, request: RequestId) -> bool {
        let before = self.reserved.len();
        self.reserved.retain(|r| *r != request);
        self.reserved.len() != before
    }

    // Drops the request's wait entry or reservation. A dropped reservation
    // passes its slot on to the next waiter.
    fn abandon_wait(&mut self, request: RequestId, reactor: &mut impl Reactor) -> bool {
        let queued = self.queue.remove(request);
        let reserved = self.revoke_reservation(request);
        if reserved {
            self.dispatch(reactor);
        }
        queued || reserved
    }

    fn has_unsent(&self, request: RequestId) -> bool {
        self.by_request.get(&request).is_some_and(|ids| {
            ids.iter()
                .filter_map(|id| self.handles.get(id))
                .any(|h| h.state == QueryState::Init && h.conn.is_none())
        })
    }

    fn park(&mut self, id: QueryId, request: RequestId, reactor: &mut impl Reactor) -> Submit {
        match self.queue.enqueue(request, reactor) {
            Ok(()) => Submit::Queued,
            Err(full) => {
                warn!(request = %request, capacity = self.config.wait_capacity, "pgsql wait queue is full");
                self.reject(id, request, full.to_string(), reactor)
            }
        }
    }

    // Fails a submit that never reached a connection. Any slot it leaves
    // open goes to the next waiter.
    fn reject(
        &mut self,
        id: QueryId,
        request: RequestId,
        message: String,
        reactor: &mut impl Reactor,
    ) -> Submit {
        if let Some(handle) = self.handles.get_mut(&id) {
            handle.fail(message);
        }
        self.queue.remove(request);
        self.dispatch(reactor);
        Submit::Failed
    }

    // Consumes input on `conn`, reads the next result into its handle, and
    // wakes or suspends the owning request.
    fn drive(&mut self, conn: ConnId, reactor: &mut impl Reactor) {
        let Some(job) = self.pool.job(conn) else {
            return;
        };
        let (request, id) = (job.request, job.handle);

        let consumed = match self.pool.session_mut(conn) {
            Some(session) => session.consume_input(),
            None => return,
        };
        if let Err(e) = consumed {
            debug!(conn = %conn, error = %e, "pgsql consume failed");
            self.destroy_connection(conn, reactor);
            return;
        }

        self.read_result(id, conn);

        match self.handles.get(&id).map(|h| h.state) {
            Some(QueryState::Wait) => reactor.suspend(request),
            _ => reactor.wake(request),
        }
    }

    fn read_result(&mut self, id: QueryId, conn: ConnId) {
        let (Some(handle), Some(session)) = (self.handles.get_mut(&id), self.pool.session_mut(conn))
        else {
            return;
        };

        if session.is_busy() {
            handle.state = QueryState::Wait;
            return;
        }

        let Some(result) = session.next_result() else {
            handle.state = QueryState::Done;
            return;
        };

        match result.status() {
            ResultStatus::CopyOut
            | ResultStatus::CopyIn
            | ResultStatus::CopyBoth
            | ResultStatus::NonfatalError => {
                handle.result = Some(result);
            }
            ResultStatus::CommandOk => {
                handle.state = QueryState::Done;
                handle.result = Some(result);
            }
            ResultStatus::TuplesOk => {
                handle.state = QueryState::Result;
                handle.result = Some(result);
            }
            ResultStatus::EmptyQuery | ResultStatus::BadResponse | ResultStatus::FatalError => {
                let message = match result.error_message() {
                    Some(text) if !text.is_empty() => text.to_owned(),
                    _ if result.status() == ResultStatus::EmptyQuery => {
                        "empty query string".to_owned()
                    }
                    _ => "unexpected response from server".to_owned(),
                };
                handle.fail(message);
            }
        }
    }

    // Normal completion: drain and recycle, then hand the slot to one waiter.
    fn release_connection(&mut self, conn: ConnId, reactor: &mut impl Reactor) {
        let Some(job) = self.pool.release(conn, reactor) else {
            return;
        };
        if let Some(handle) = self.handles.get_mut(&job.handle) {
            handle.conn = None;
            handle.state = QueryState::Complete;
        }
        self.dispatch(reactor);
    }

    // Failure: discard the connection, error its handle, and let one waiter
    // retry in the freed slot.
    fn destroy_connection(&mut self, conn: ConnId, reactor: &mut impl Reactor) {
        let Some(destroyed) = self.pool.destroy(conn, reactor) else {
            return;
        };
        self.fail_job(destroyed, reactor);
        self.dispatch(reactor);
    }

    fn fail_job(&mut self, destroyed: Destroyed, reactor: &mut impl Reactor) {
        let Some(job) = destroyed.job else {
            return;
        };
        if let Some(handle) = self.handles.get_mut(&job.handle) {
            handle.conn = None;
            handle.fail(destroyed.error);
        }
        reactor.wake(job.request);
    }
}

impl<C: Connector> std::fmt::Debug for Database<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("stats", &self.stats())
            .field("handles", &self.handles.len())
            .finish_non_exhaustive()
    }
}
