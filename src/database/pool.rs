//! Bounded set of live database sessions.
//!
//! Connections live in an arena keyed by [`ConnId`]. A connection is either
//! free (and listed in the ordered free set) or busy with exactly one
//! [`QueryJob`].

use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;

use tracing::{debug, info, warn};

use super::handle::QueryId;
use crate::driver::{Connector, Session};
use crate::reactor::{ConnId, Reactor, RequestId};

/// One in-flight query bound to the connection executing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueryJob {
    pub(crate) query: String,
    pub(crate) request: RequestId,
    pub(crate) handle: QueryId,
}

#[derive(Debug)]
struct Connection<S> {
    session: S,
    fd: RawFd,
    job: Option<QueryJob>,
    free: bool,
}

/// Outcome of [`Pool::checkout`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Checkout {
    /// A connection was taken off the free set or opened.
    Bound(ConnId),
    /// Every allowed connection is busy.
    Exhausted,
    /// Opening a new connection failed.
    Failed(String),
}

/// What was left of a destroyed connection.
#[derive(Debug)]
pub(crate) struct Destroyed {
    pub(crate) job: Option<QueryJob>,
    pub(crate) error: String,
}

#[derive(Debug)]
pub(crate) struct Pool<S> {
    slots: HashMap<ConnId, Connection<S>>,
    free: VecDeque<ConnId>,
    max: usize,
    next_id: u64,
}

impl<S: Session> Pool<S> {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            slots: HashMap::new(),
            free: VecDeque::new(),
            max,
            next_id: 0,
        }
    }

    /// Takes the oldest free connection, or opens a new one below the limit.
    ///
    /// Opening is the only blocking step of the engine.
    pub(crate) fn checkout<C>(&mut self, connector: &C, conninfo: &str) -> Checkout
    where
        C: Connector<Session = S>,
    {
        if let Some(id) = self.free.pop_front() {
            let Some(conn) = self.slots.get_mut(&id) else {
                panic!("{id} is in the free set but not in the pool");
            };
            if !conn.free {
                panic!("received a pgsql connection that was not free: {id}");
            }
            conn.free = false;
            return Checkout::Bound(id);
        }

        if self.slots.len() >= self.max {
            return Checkout::Exhausted;
        }

        match connector.connect(conninfo) {
            Ok(session) => {
                self.next_id += 1;
                let id = ConnId(self.next_id);
                let fd = session.socket();
                self.slots.insert(
                    id,
                    Connection {
                        session,
                        fd,
                        job: None,
                        free: false,
                    },
                );
                info!(conn = %id, fd, live = self.slots.len(), "pgsql connection opened");
                Checkout::Bound(id)
            }
            Err(e) => {
                warn!(error = %e, "pgsql connection failed");
                Checkout::Failed(e.to_string())
            }
        }
    }

    pub(crate) fn attach(&mut self, id: ConnId, job: QueryJob) {
        if let Some(conn) = self.slots.get_mut(&id) {
            conn.job = Some(job);
        }
    }

    pub(crate) fn contains(&self, id: ConnId) -> bool {
        self.slots.contains_key(&id)
    }

    pub(crate) fn job(&self, id: ConnId) -> Option<&QueryJob> {
        self.slots.get(&id)?.job.as_ref()
    }

    pub(crate) fn fd(&self, id: ConnId) -> Option<RawFd> {
        self.slots.get(&id).map(|c| c.fd)
    }

    pub(crate) fn session_mut(&mut self, id: ConnId) -> Option<&mut S> {
        self.slots.get_mut(&id).map(|c| &mut c.session)
    }

    /// Unbinds the job, drains the session, stops watching its socket and
    /// puts the connection at the back of the free set.
    ///
    /// Returns `None` (and does nothing) if no job is bound.
    pub(crate) fn release(&mut self, id: ConnId, reactor: &mut impl Reactor) -> Option<QueryJob> {
        let conn = self.slots.get_mut(&id)?;
        let job = conn.job.take()?;

        let mut drained = 0usize;
        while conn.session.next_result().is_some() {
            drained += 1;
        }

        conn.free = true;
        reactor.unregister_readable(conn.fd);
        self.free.push_back(id);

        debug!(conn = %id, request = %job.request, sql = %job.query, drained, "pgsql connection released");
        Some(job)
    }

    /// Closes and forgets a connection. Its bound job, if any, is handed
    /// back together with the driver's last error text.
    pub(crate) fn destroy(&mut self, id: ConnId, reactor: &mut impl Reactor) -> Option<Destroyed> {
        let mut conn = self.slots.remove(&id)?;
        if conn.free {
            self.free.retain(|f| *f != id);
        }

        reactor.unregister_readable(conn.fd);

        let mut error = conn.session.error_message();
        if error.trim().is_empty() {
            error = "connection to server was lost".to_owned();
        }
        conn.session.finish();

        let sql = conn.job.as_ref().map_or("", |job| job.query.as_str());
        warn!(conn = %id, live = self.slots.len(), sql, error = %error.trim_end(), "pgsql connection destroyed");
        Some(Destroyed {
            job: conn.job,
            error,
        })
    }

    /// Destroys every connection.
    pub(crate) fn shutdown(&mut self, reactor: &mut impl Reactor) -> Vec<Destroyed> {
        let mut ids: Vec<ConnId> = self.slots.keys().copied().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| self.destroy(id, reactor))
            .collect()
    }

    pub(crate) fn live(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn free(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn busy(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}
