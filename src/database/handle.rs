//! Query handles: the caller-facing side of one query's lifecycle.

use std::fmt;

use crate::driver::QueryResult;
use crate::reactor::{ConnId, RequestId};

/// Stable identity of one query handle inside a [`Database`](super::Database).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query#{}", self.0)
    }
}

/// Low-level state of a query handle.
///
/// ```text
/// Init ──submit──▶ Wait ──▶ Result | Done | Error ──▶ Complete
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryState {
    /// No connection bound yet (fresh, or parked in the wait queue).
    Init,
    /// Query sent; waiting for the server.
    Wait,
    /// A row set is available.
    Result,
    /// No further results; the connection can be released.
    Done,
    /// The query or its connection failed.
    Error,
    /// The connection went back to the pool.
    Complete,
}

impl QueryState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Wait => "wait",
            Self::Result => "result",
            Self::Done => "done",
            Self::Error => "error",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-query bookkeeping. The result is only present in `Result` (or a
/// transient status), the error only in `Error`.
#[derive(Debug)]
pub(crate) struct QueryHandle {
    pub(crate) request: RequestId,
    pub(crate) state: QueryState,
    pub(crate) result: Option<QueryResult>,
    pub(crate) error: Option<String>,
    pub(crate) conn: Option<ConnId>,
}

impl QueryHandle {
    pub(crate) fn new(request: RequestId) -> Self {
        Self {
            request,
            state: QueryState::Init,
            result: None,
            error: None,
            conn: None,
        }
    }

    pub(crate) fn clear_outcome(&mut self) {
        self.result = None;
        self.error = None;
    }

    pub(crate) fn fail(&mut self, message: impl Into<String>) {
        self.result = None;
        self.state = QueryState::Error;
        self.error = Some(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_handle_is_init() {
        let handle = QueryHandle::new(RequestId(1));
        assert_eq!(handle.state, QueryState::Init);
        assert!(handle.conn.is_none());
        assert!(handle.error.is_none());
    }

    #[test]
    fn fail_records_message() {
        let mut handle = QueryHandle::new(RequestId(1));
        handle.result = Some(QueryResult::command("SELECT 0"));
        handle.fail("boom");
        assert_eq!(handle.state, QueryState::Error);
        assert_eq!(handle.error.as_deref(), Some("boom"));
        assert!(handle.result.is_none());

        handle.clear_outcome();
        assert!(handle.error.is_none());
        assert_eq!(handle.state, QueryState::Error);
    }

    #[test]
    fn display() {
        assert_eq!(QueryId(4).to_string(), "query#4");
        assert_eq!(QueryState::Complete.to_string(), "complete");
    }
}
