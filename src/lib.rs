//! # rttp-pgsql
//!
//! Asynchronous PostgreSQL connection pool and query state machine for the
//! rttp event-driven server.
//!
//! Request handlers issue SQL without blocking the worker: a small, bounded
//! set of connections is multiplexed across many suspended requests, queued
//! demand is served in FIFO order, and every connection handed back to the
//! pool is drained first.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rttp_pgsql::config::PgConfig;
//! use rttp_pgsql::database::{SimpleContext, SimpleHooks};
//! use rttp_pgsql::driver::{PgConnector, QueryResult};
//! use rttp_pgsql::worker::Worker;
//!
//! struct Version(Option<String>);
//!
//! impl SimpleHooks for Version {
//!     fn init(&mut self, cx: &mut SimpleContext) -> bool {
//!         cx.set_query("SELECT version()");
//!         true
//!     }
//!
//!     fn result(&mut self, _cx: &mut SimpleContext, rows: &QueryResult) {
//!         self.0 = rows.value(0, 0).map(str::to_owned);
//!     }
//!
//!     fn done(&mut self, _cx: &mut SimpleContext) {}
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PgConfig::new("host=localhost dbname=app user=app").max_connections(2);
//!     let (worker, handle) = Worker::new(config, PgConnector)?;
//!
//!     let client = async move { handle.run(Version(None)).await };
//!     let ((), done) = tokio::join!(worker.run(), client);
//!
//!     println!("{:?}", done?.hooks.0);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod database;
pub mod driver;
pub mod http;
pub mod reactor;
pub mod worker;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::{ConfigError, PgConfig};
pub use database::{Database, QueryId, QueryState, SimpleContext, SimpleHooks, SimpleQuery, Submit};
pub use driver::{Connector, DriverError, PgConnector, QueryResult, Session};
pub use http::StatusCode;
pub use reactor::{ConnId, Reactor, RequestId, RunQueue};
pub use worker::{Completion, Worker, WorkerError, WorkerHandle};
