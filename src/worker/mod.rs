//! Single-threaded worker that drives database workflows.
//!
//! A [`Worker`] owns one [`Database`] and runs every workflow submitted
//! through its [`WorkerHandle`]s on the current task. Woken requests are
//! taken off a run queue; connection sockets are watched with
//! [`AsyncFd`] and fed to [`Database::handle_readable`].
//!
//! ```text
//!  WorkerHandle ──Submit/Cancel──▶ Worker ──▶ SimpleQuery::run
//!                                    ▲              │
//!                 socket readable ───┘    suspend / wake / watch fd
//! ```

use std::collections::HashMap;
use std::future::poll_fn;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, PgConfig};
use crate::database::{Database, Flow, SimpleHooks, SimpleQuery};
use crate::driver::Connector;
use crate::http::StatusCode;
use crate::reactor::{ConnId, Reactor, RequestId, RunQueue};

/// Errors produced by the worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker has stopped")]
    Stopped,

    #[error("request was cancelled before completing")]
    Cancelled,
}

/// Final outcome of a workflow.
#[derive(Debug)]
pub struct Completion<H> {
    pub request: RequestId,
    pub status: StatusCode,
    /// Driver error text when the query failed.
    pub error: Option<String>,
    pub hooks: H,
}

enum Command<H> {
    Submit {
        request: RequestId,
        hooks: H,
        reply: oneshot::Sender<Completion<H>>,
    },
    Cancel(RequestId),
}

/// Cloneable submitter for a [`Worker`].
pub struct WorkerHandle<H> {
    commands: mpsc::UnboundedSender<Command<H>>,
    next_request: Arc<AtomicU64>,
}

impl<H> Clone for WorkerHandle<H> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            next_request: Arc::clone(&self.next_request),
        }
    }
}

impl<H> WorkerHandle<H> {
    /// Starts a workflow and returns without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stopped`] if the worker is gone.
    pub fn submit(&self, hooks: H) -> Result<Submitted<H>, WorkerError> {
        let request = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed) + 1);
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Submit {
                request,
                hooks,
                reply,
            })
            .map_err(|_| WorkerError::Stopped)?;
        Ok(Submitted { request, reply: rx })
    }

    /// Runs a workflow to completion.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stopped`] or [`WorkerError::Cancelled`].
    pub async fn run(&self, hooks: H) -> Result<Completion<H>, WorkerError> {
        self.submit(hooks)?.wait().await
    }

    /// Tears down a submitted workflow. Its `done` hook runs if it had
    /// started, and its waiter gets [`WorkerError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stopped`] if the worker is gone.
    pub fn cancel(&self, request: RequestId) -> Result<(), WorkerError> {
        self.commands
            .send(Command::Cancel(request))
            .map_err(|_| WorkerError::Stopped)
    }
}

/// A workflow that has been handed to the worker.
#[derive(Debug)]
pub struct Submitted<H> {
    request: RequestId,
    reply: oneshot::Receiver<Completion<H>>,
}

impl<H> Submitted<H> {
    pub fn request(&self) -> RequestId {
        self.request
    }

    /// Waits for the workflow to finish.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Cancelled`] if the request was torn down or
    /// the worker stopped first.
    pub async fn wait(self) -> Result<Completion<H>, WorkerError> {
        self.reply.await.map_err(|_| WorkerError::Cancelled)
    }
}

#[derive(Debug, Clone, Copy)]
struct Readiness {
    conn: ConnId,
    failed: bool,
}

struct Watch {
    io: AsyncFd<RawFd>,
    conn: ConnId,
}

// Run queue plus tokio-backed socket watches. Watches are owned here so that
// unregistering drops the AsyncFd before the connection's socket is closed.
struct EventReactor {
    queue: RunQueue,
    watches: HashMap<RawFd, Watch>,
    broken: Vec<ConnId>,
}

impl EventReactor {
    fn new() -> Self {
        Self {
            queue: RunQueue::new(),
            watches: HashMap::new(),
            broken: Vec::new(),
        }
    }

    fn poll_readiness(&mut self, cx: &mut Context<'_>) -> Poll<Readiness> {
        if let Some(conn) = self.broken.pop() {
            return Poll::Ready(Readiness { conn, failed: true });
        }

        for (fd, watch) in &self.watches {
            match watch.io.poll_read_ready(cx) {
                Poll::Ready(Ok(mut guard)) => {
                    guard.clear_ready();
                    return Poll::Ready(Readiness {
                        conn: watch.conn,
                        failed: false,
                    });
                }
                Poll::Ready(Err(e)) => {
                    warn!(fd, conn = %watch.conn, error = %e, "socket readiness failed");
                    return Poll::Ready(Readiness {
                        conn: watch.conn,
                        failed: true,
                    });
                }
                Poll::Pending => {}
            }
        }
        Poll::Pending
    }

    async fn readiness(&mut self) -> Readiness {
        poll_fn(|cx| self.poll_readiness(cx)).await
    }
}

impl Reactor for EventReactor {
    fn suspend(&mut self, request: RequestId) {
        self.queue.suspend(request);
    }

    fn wake(&mut self, request: RequestId) {
        self.queue.wake(request);
    }

    fn is_torn_down(&self, request: RequestId) -> bool {
        self.queue.is_torn_down(request)
    }

    fn register_readable(&mut self, fd: RawFd, conn: ConnId) {
        self.queue.register_readable(fd, conn);
        if let Some(watch) = self.watches.get_mut(&fd) {
            watch.conn = conn;
            return;
        }
        match AsyncFd::with_interest(fd, Interest::READABLE) {
            Ok(io) => {
                self.watches.insert(fd, Watch { io, conn });
            }
            Err(e) => {
                warn!(fd, conn = %conn, error = %e, "cannot watch connection socket");
                self.broken.push(conn);
            }
        }
    }

    fn unregister_readable(&mut self, fd: RawFd) {
        self.queue.unregister_readable(fd);
        self.watches.remove(&fd);
    }
}

struct Task<H> {
    workflow: SimpleQuery<H>,
    reply: oneshot::Sender<Completion<H>>,
}

enum Event<H> {
    Command(Option<Command<H>>),
    Readable(Readiness),
    Idle,
}

/// Hosts a [`Database`] and runs workflows against it.
///
/// # Examples
///
/// ```rust,no_run
/// use rttp_pgsql::config::PgConfig;
/// use rttp_pgsql::database::{SimpleContext, SimpleHooks};
/// use rttp_pgsql::driver::PgConnector;
/// use rttp_pgsql::worker::Worker;
///
/// struct Ping;
///
/// impl SimpleHooks for Ping {
///     fn init(&mut self, cx: &mut SimpleContext) -> bool {
///         cx.set_query("SELECT 1");
///         true
///     }
///     fn done(&mut self, _cx: &mut SimpleContext) {}
/// }
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = PgConfig::new("host=localhost user=postgres");
///     let (worker, handle) = Worker::new(config, PgConnector)?;
///     let client = async move { handle.run(Ping).await };
///     let ((), outcome) = tokio::join!(worker.run(), client);
///     println!("{}", outcome?.status);
///     Ok(())
/// }
/// ```
pub struct Worker<C: Connector, H> {
    db: Database<C>,
    reactor: EventReactor,
    commands: mpsc::UnboundedReceiver<Command<H>>,
    tasks: HashMap<RequestId, Task<H>>,
    accepting: bool,
}

impl<C: Connector, H: SimpleHooks> Worker<C, H> {
    /// Creates a worker and its first handle.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`] from validating `config`.
    pub fn new(config: PgConfig, connector: C) -> Result<(Self, WorkerHandle<H>), ConfigError> {
        let db = Database::new(config, connector)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Self {
            db,
            reactor: EventReactor::new(),
            commands: rx,
            tasks: HashMap::new(),
            accepting: true,
        };
        let handle = WorkerHandle {
            commands: tx,
            next_request: Arc::new(AtomicU64::new(0)),
        };
        Ok((worker, handle))
    }

    pub fn database(&self) -> &Database<C> {
        &self.db
    }

    /// Runs until every [`WorkerHandle`] is dropped and the last workflow
    /// has finished, then closes all connections.
    pub async fn run(mut self) {
        info!(
            max_connections = self.db.config().max_connections,
            "pgsql worker started"
        );

        loop {
            self.run_ready();

            if !self.accepting && self.tasks.is_empty() {
                break;
            }

            let has_ready = self.reactor.queue.ready_len() > 0;
            let event = tokio::select! {
                biased;
                cmd = self.commands.recv(), if self.accepting => Event::Command(cmd),
                ready = self.reactor.readiness() => Event::Readable(ready),
                () = std::future::ready(()), if has_ready => Event::Idle,
            };

            match event {
                Event::Command(Some(Command::Submit {
                    request,
                    hooks,
                    reply,
                })) => {
                    debug!(request = %request, "pgsql workflow submitted");
                    let workflow = SimpleQuery::new(request, hooks);
                    self.tasks.insert(request, Task { workflow, reply });
                    self.reactor.queue.schedule(request);
                }
                Event::Command(Some(Command::Cancel(request))) => self.cancel(request),
                Event::Command(None) => {
                    debug!(in_flight = self.tasks.len(), "all worker handles dropped");
                    self.accepting = false;
                }
                Event::Readable(ready) => {
                    self.db
                        .handle_readable(ready.conn, ready.failed, &mut self.reactor);
                }
                Event::Idle => {}
            }
        }

        self.db.shutdown(&mut self.reactor);
        info!("pgsql worker stopped");
    }

    // Runs the requests that are ready now; requests woken meanwhile wait
    // for the next turn so readiness events are not starved.
    fn run_ready(&mut self) {
        for _ in 0..self.reactor.queue.ready_len() {
            let Some(request) = self.reactor.queue.pop_ready() else {
                break;
            };
            let Some(task) = self.tasks.get_mut(&request) else {
                continue;
            };

            match task.workflow.run(&mut self.db, &mut self.reactor) {
                Flow::Complete => self.complete(request),
                Flow::Retry | Flow::Continue => {
                    if !self.reactor.queue.is_asleep(request) {
                        self.reactor.queue.schedule(request);
                    }
                }
            }
        }
    }

    fn complete(&mut self, request: RequestId) {
        self.reactor.queue.forget(request);
        let Some(task) = self.tasks.remove(&request) else {
            return;
        };
        let (hooks, cx) = task.workflow.into_parts();
        let completion = Completion {
            request,
            status: cx.status(),
            error: cx.error().map(str::to_owned),
            hooks,
        };
        if task.reply.send(completion).is_err() {
            debug!(request = %request, "workflow finished after its submitter left");
        }
    }

    fn cancel(&mut self, request: RequestId) {
        let Some(mut task) = self.tasks.remove(&request) else {
            debug!(request = %request, "cancel for unknown request");
            return;
        };
        self.reactor.queue.tear_down(request);
        self.db.queue_remove(request);
        task.workflow.abort(&mut self.db, &mut self.reactor);
        self.db.teardown_request(request, &mut self.reactor);
        self.reactor.queue.forget(request);
        debug!(request = %request, "pgsql workflow cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::database::SimpleContext;
    use crate::driver::QueryResult;
    use crate::driver::mock::{MockConnector, rows};

    struct Recorder {
        query: String,
        values: Vec<String>,
        done: Arc<AtomicUsize>,
    }

    impl Recorder {
        fn new(query: &str, done: &Arc<AtomicUsize>) -> Self {
            Self {
                query: query.to_owned(),
                values: Vec::new(),
                done: Arc::clone(done),
            }
        }
    }

    impl SimpleHooks for Recorder {
        fn init(&mut self, cx: &mut SimpleContext) -> bool {
            cx.set_query(self.query.clone());
            true
        }

        fn result(&mut self, _cx: &mut SimpleContext, rows: &QueryResult) {
            for row in 0..rows.ntuples() {
                self.values.extend(rows.value(row, 0).map(str::to_owned));
            }
        }

        fn done(&mut self, _cx: &mut SimpleContext) {
            self.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn worker(
        max: u16,
        connector: &MockConnector,
    ) -> (Worker<MockConnector, Recorder>, WorkerHandle<Recorder>) {
        let config = PgConfig::new("host=mock").max_connections(max);
        Worker::new(config, connector.clone()).unwrap()
    }

    #[tokio::test]
    async fn runs_queued_workflows_on_one_connection() {
        let connector = MockConnector::new();
        connector.script("SELECT 'a'", vec![rows(&["a"])]);
        connector.script("SELECT 'b'", vec![rows(&["b"])]);
        connector.set_busy_polls(2);
        let done = Arc::new(AtomicUsize::new(0));
        let (worker, handle) = worker(1, &connector);

        let client = async move {
            let a = handle.submit(Recorder::new("SELECT 'a'", &done)).unwrap();
            let b = handle.submit(Recorder::new("SELECT 'b'", &done)).unwrap();
            let a = a.wait().await.unwrap();
            let b = b.wait().await.unwrap();
            (a, b, done)
        };
        let ((), (a, b, done)) = tokio::join!(worker.run(), client);

        assert_eq!(a.hooks.values, vec!["a"]);
        assert_eq!(b.hooks.values, vec!["b"]);
        assert_eq!(a.status, StatusCode::Ok);
        assert_eq!(b.status, StatusCode::Ok);
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert_eq!(connector.connects(), 1);
        assert_eq!(connector.finished(), 1);
    }

    #[tokio::test]
    async fn query_error_completes_with_500() {
        let connector = MockConnector::new();
        let done = Arc::new(AtomicUsize::new(0));
        let (worker, handle) = worker(2, &connector);

        let client = async move { handle.run(Recorder::new("SELEC 1", &done)).await };
        let ((), outcome) = tokio::join!(worker.run(), client);

        let completion = outcome.unwrap();
        assert_eq!(completion.status, StatusCode::InternalServerError);
        assert!(
            completion
                .error
                .is_some_and(|e| e.contains("syntax error"))
        );
    }

    #[tokio::test]
    async fn cancelled_waiter_gets_no_completion() {
        let connector = MockConnector::new();
        connector.script("SELECT 1", vec![rows(&["1"])]);
        connector.set_busy_polls(3);
        let done = Arc::new(AtomicUsize::new(0));
        let (worker, handle) = worker(1, &connector);

        let client = async move {
            let holder = handle.submit(Recorder::new("SELECT 1", &done)).unwrap();
            let queued = handle.submit(Recorder::new("SELECT 1", &done)).unwrap();
            handle.cancel(queued.request()).unwrap();
            let cancelled = queued.wait().await;
            let finished = holder.wait().await;
            (cancelled, finished, done)
        };
        let ((), (cancelled, finished, done)) = tokio::join!(worker.run(), client);

        assert!(matches!(cancelled, Err(WorkerError::Cancelled)));
        assert_eq!(finished.unwrap().hooks.values, vec!["1"]);
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert_eq!(connector.sent().len(), 1);
    }

    #[test]
    fn submit_after_stop_fails() {
        let connector = MockConnector::new();
        let (worker, handle) = worker(1, &connector);
        drop(worker);

        let done = Arc::new(AtomicUsize::new(0));
        assert!(matches!(
            handle.submit(Recorder::new("SELECT 1", &done)),
            Err(WorkerError::Stopped)
        ));
    }
}
