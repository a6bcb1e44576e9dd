//! libpq-style asynchronous database driver boundary.
//!
//! The pool and the query engine talk to the database only through the
//! [`Connector`] and [`Session`] traits, which mirror libpq's asynchronous
//! command processing: send a query, feed socket input as it becomes
//! readable, poll for busy, then pull complete results one at a time.
//!
//! [`PgConnector`] implements the boundary over the PostgreSQL wire protocol.

use std::os::fd::RawFd;

use thiserror::Error;

pub mod conninfo;
pub mod protocol;
pub mod scram;
pub mod session;

#[cfg(test)]
pub(crate) mod mock;

pub use conninfo::ConnInfo;
pub use session::{PgConnector, PgSession};

/// Errors produced by the driver.
///
/// The `Display` text is what ends up on a query handle as its error message.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not connect to server at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid connection option: {0}")]
    Conninfo(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unsupported authentication method (code {0})")]
    UnsupportedAuth(i32),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Server(String),

    #[error("another command is already in progress")]
    Busy,

    #[error("server closed the connection unexpectedly")]
    Closed,
}

/// Status of one result produced by a query, as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// The query string was empty.
    EmptyQuery,
    /// A command that returns no rows completed.
    CommandOk,
    /// A row-returning statement completed.
    TuplesOk,
    /// The server started a COPY TO STDOUT.
    CopyOut,
    /// The server started a COPY FROM STDIN.
    CopyIn,
    /// The server started a bidirectional copy.
    CopyBoth,
    /// The server's response was not understood.
    BadResponse,
    /// A notice or warning.
    NonfatalError,
    /// The statement failed.
    FatalError,
}

/// One complete result set with raw text cells.
///
/// # Examples
///
/// ```
/// use rttp_pgsql::driver::{QueryResult, ResultStatus};
///
/// let mut result = QueryResult::tuples(vec!["id".into(), "name".into()]);
/// result.push_row(vec![Some("1".into()), None]);
///
/// assert_eq!(result.status(), ResultStatus::TuplesOk);
/// assert_eq!(result.ntuples(), 1);
/// assert_eq!(result.value(0, 0), Some("1"));
/// assert!(result.is_null(0, 1));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    status: ResultStatus,
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
    command_tag: Option<String>,
    error: Option<String>,
}

impl QueryResult {
    /// Creates a result with `status` and no columns or rows.
    pub fn new(status: ResultStatus) -> Self {
        Self {
            status,
            columns: Vec::new(),
            rows: Vec::new(),
            command_tag: None,
            error: None,
        }
    }

    /// Creates an empty row set with the given column names.
    pub fn tuples(columns: Vec<String>) -> Self {
        Self {
            columns,
            ..Self::new(ResultStatus::TuplesOk)
        }
    }

    /// Creates a completed command result with its tag, e.g. `INSERT 0 1`.
    pub fn command(tag: impl Into<String>) -> Self {
        Self {
            command_tag: Some(tag.into()),
            ..Self::new(ResultStatus::CommandOk)
        }
    }

    /// Creates a failed result carrying the server's error text.
    pub fn error(status: ResultStatus, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::new(status)
        }
    }

    /// Appends one row of raw cells.
    pub fn push_row(&mut self, row: Vec<Option<String>>) {
        self.rows.push(row);
    }

    /// Records the command tag that finished this result.
    pub fn set_command_tag(&mut self, tag: impl Into<String>) {
        self.command_tag = Some(tag.into());
    }

    pub fn status(&self) -> ResultStatus {
        self.status
    }

    /// Number of rows.
    pub fn ntuples(&self) -> usize {
        self.rows.len()
    }

    /// Number of columns.
    pub fn nfields(&self) -> usize {
        self.columns.len()
    }

    /// Name of column `col`.
    pub fn field_name(&self, col: usize) -> Option<&str> {
        self.columns.get(col).map(String::as_str)
    }

    /// Raw text of cell (`row`, `col`). `None` for NULL or out of range.
    pub fn value(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col)?.as_deref()
    }

    /// Returns `true` if cell (`row`, `col`) exists and is NULL.
    pub fn is_null(&self, row: usize, col: usize) -> bool {
        matches!(self.rows.get(row).and_then(|r| r.get(col)), Some(None))
    }

    pub fn command_tag(&self) -> Option<&str> {
        self.command_tag.as_deref()
    }

    /// Server error text for failed results.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// One asynchronous database session.
///
/// Mirrors libpq's asynchronous API: [`send_query`](Self::send_query) ≈
/// `PQsendQuery`, [`consume_input`](Self::consume_input) ≈
/// `PQconsumeInput`, [`is_busy`](Self::is_busy) ≈ `PQisBusy`,
/// [`next_result`](Self::next_result) ≈ `PQgetResult`.
pub trait Session {
    /// Socket to watch for readability.
    fn socket(&self) -> RawFd;

    /// Dispatches `query` without waiting for the reply.
    fn send_query(&mut self, query: &str) -> Result<(), DriverError>;

    /// Reads whatever input is available on the socket without blocking.
    fn consume_input(&mut self) -> Result<(), DriverError>;

    /// `true` while no complete result is buffered and the query is running.
    fn is_busy(&self) -> bool;

    /// Takes the next complete result, or `None` once the query is finished.
    ///
    /// Blocks when the query is still running and nothing is buffered.
    fn next_result(&mut self) -> Option<QueryResult>;

    /// Text of the most recent driver-level failure.
    fn error_message(&self) -> String;

    /// Closes the session.
    fn finish(&mut self);
}

/// Opens new sessions for the pool.
pub trait Connector {
    type Session: Session;

    /// Synchronously opens a session and returns it once it is ready for
    /// queries.
    fn connect(&self, conninfo: &str) -> Result<Self::Session, DriverError>;
}
