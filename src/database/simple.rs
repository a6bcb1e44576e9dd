//! Five-step request workflow layered on the query engine.
//!
//! ```text
//! Init ──▶ Query ──▶ Wait ──▶ Result ──▶ Done
//!            ▲  │       │                 ▲
//!            └──┘       └─────────────────┘
//!          (queued)   (complete / error)
//! ```
//!
//! A [`SimpleQuery`] is driven by calling [`SimpleQuery::run`] each time its
//! request is scheduled. It returns [`Flow::Retry`] while the request is
//! waiting for a connection or for the server, and [`Flow::Complete`] once
//! the `done` hook has run.

use tracing::debug;

use super::{Database, QueryId, QueryState, Submit};
use crate::driver::{Connector, QueryResult};
use crate::http::StatusCode;
use crate::reactor::{Reactor, RequestId};

/// Workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimpleState {
    Init,
    Query,
    Wait,
    Result,
    Done,
}

/// What the scheduler should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Run the next step right away.
    Continue,
    /// Park the request; it is woken when there is progress.
    Retry,
    /// The workflow is finished.
    Complete,
}

/// Request-side state shared with the hooks.
#[derive(Debug, Clone)]
pub struct SimpleContext {
    request: RequestId,
    query: Option<String>,
    status: StatusCode,
    error: Option<String>,
}

impl SimpleContext {
    fn new(request: RequestId) -> Self {
        Self {
            request,
            query: None,
            status: StatusCode::Ok,
            error: None,
        }
    }

    pub fn request(&self) -> RequestId {
        self.request
    }

    /// Sets the SQL to run. Must be called from [`SimpleHooks::init`].
    pub fn set_query(&mut self, query: impl Into<String>) {
        self.query = Some(query.into());
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Response status; `500 Internal Server Error` after a query error.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Driver error text, if the query failed.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Request-handler callbacks.
///
/// # Examples
///
/// ```
/// use rttp_pgsql::database::{SimpleContext, SimpleHooks};
/// use rttp_pgsql::driver::QueryResult;
///
/// struct CountUsers {
///     count: Option<String>,
/// }
///
/// impl SimpleHooks for CountUsers {
///     fn init(&mut self, cx: &mut SimpleContext) -> bool {
///         cx.set_query("SELECT count(*) FROM users");
///         true
///     }
///
///     fn result(&mut self, _cx: &mut SimpleContext, rows: &QueryResult) {
///         self.count = rows.value(0, 0).map(str::to_owned);
///     }
///
///     fn done(&mut self, _cx: &mut SimpleContext) {}
/// }
/// ```
pub trait SimpleHooks {
    /// Prepares the query. Returning `false` ends the workflow immediately.
    fn init(&mut self, cx: &mut SimpleContext) -> bool;

    /// Called once when a row set is available.
    fn result(&mut self, cx: &mut SimpleContext, rows: &QueryResult) {
        let _ = (cx, rows);
    }

    /// Always called before the workflow's resources are released.
    fn done(&mut self, cx: &mut SimpleContext);
}

/// One request's run through the workflow.
#[derive(Debug)]
pub struct SimpleQuery<H> {
    hooks: H,
    cx: SimpleContext,
    state: SimpleState,
    sql: Option<QueryId>,
    finished: bool,
}

impl<H: SimpleHooks> SimpleQuery<H> {
    pub fn new(request: RequestId, hooks: H) -> Self {
        Self {
            hooks,
            cx: SimpleContext::new(request),
            state: SimpleState::Init,
            sql: None,
            finished: false,
        }
    }

    pub fn state(&self) -> SimpleState {
        self.state
    }

    pub fn context(&self) -> &SimpleContext {
        &self.cx
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn into_parts(self) -> (H, SimpleContext) {
        (self.hooks, self.cx)
    }

    /// Runs steps until the workflow must wait or is finished.
    pub fn run<C: Connector>(
        &mut self,
        db: &mut Database<C>,
        reactor: &mut impl Reactor,
    ) -> Flow {
        loop {
            match self.step(db, reactor) {
                Flow::Continue => continue,
                flow => return flow,
            }
        }
    }

    /// Runs the current step once.
    ///
    /// # Panics
    ///
    /// Panics if `init` succeeded without setting a query.
    pub fn step<C: Connector>(&mut self, db: &mut Database<C>, reactor: &mut impl Reactor) -> Flow {
        if self.finished {
            return Flow::Complete;
        }

        match self.state {
            SimpleState::Init => {
                self.cx.query = None;
                if !self.hooks.init(&mut self.cx) {
                    debug!(request = %self.cx.request, "pgsql workflow init declined");
                    self.finished = true;
                    return Flow::Complete;
                }
                self.state = SimpleState::Query;
                Flow::Continue
            }
            SimpleState::Query => {
                let Some(query) = self.cx.query.clone() else {
                    panic!("no query set after init for {}", self.cx.request);
                };
                let request = self.cx.request;
                let id = *self.sql.get_or_insert_with(|| db.create_query(request));

                self.state = SimpleState::Wait;
                match db.submit(id, &query, reactor) {
                    Submit::Queued => {
                        self.state = SimpleState::Query;
                        Flow::Retry
                    }
                    Submit::Sent | Submit::Failed => Flow::Continue,
                }
            }
            SimpleState::Wait => self.wait(db, reactor),
            SimpleState::Result => {
                if let Some(rows) = self.sql.and_then(|id| db.result(id)) {
                    self.hooks.result(&mut self.cx, rows);
                }
                self.state = SimpleState::Done;
                Flow::Continue
            }
            SimpleState::Done => {
                self.finish(db, reactor);
                Flow::Complete
            }
        }
    }

    /// Ends a workflow whose request is being torn down. The `done` hook
    /// runs if `init` had already succeeded.
    pub fn abort<C: Connector>(&mut self, db: &mut Database<C>, reactor: &mut impl Reactor) {
        if self.finished {
            return;
        }
        if self.state == SimpleState::Init {
            self.finished = true;
            return;
        }
        self.finish(db, reactor);
    }

    fn wait<C: Connector>(&mut self, db: &mut Database<C>, reactor: &mut impl Reactor) -> Flow {
        let Some(id) = self.sql else {
            self.state = SimpleState::Query;
            return Flow::Continue;
        };

        match db.state(id) {
            Some(QueryState::Init | QueryState::Wait) => Flow::Retry,
            Some(QueryState::Complete) | None => {
                self.state = SimpleState::Done;
                Flow::Continue
            }
            Some(QueryState::Error) => {
                self.cx.status = StatusCode::InternalServerError;
                self.cx.error = db.error(id).map(str::to_owned);
                db.log_error(id);
                self.state = SimpleState::Done;
                Flow::Continue
            }
            Some(QueryState::Result) => {
                self.state = SimpleState::Result;
                Flow::Continue
            }
            Some(QueryState::Done) => {
                db.continue_query(id, reactor);
                Flow::Continue
            }
        }
    }

    fn finish<C: Connector>(&mut self, db: &mut Database<C>, reactor: &mut impl Reactor) {
        self.finished = true;
        self.state = SimpleState::Done;
        self.hooks.done(&mut self.cx);
        if let Some(id) = self.sql.take() {
            db.release_query(id, reactor);
        }
        debug!(request = %self.cx.request, status = %self.cx.status, "pgsql workflow done");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PgConfig;
    use crate::driver::mock::{MockConnector, rows};
    use crate::reactor::RunQueue;

    #[derive(Debug, Default)]
    struct Recorder {
        query: Option<&'static str>,
        values: Vec<String>,
        results: usize,
        done: usize,
        status: Option<StatusCode>,
    }

    impl Recorder {
        fn new(query: &'static str) -> Self {
            Self {
                query: Some(query),
                ..Self::default()
            }
        }
    }

    impl SimpleHooks for Recorder {
        fn init(&mut self, cx: &mut SimpleContext) -> bool {
            match self.query {
                Some(query) => {
                    cx.set_query(query);
                    true
                }
                None => false,
            }
        }

        fn result(&mut self, _cx: &mut SimpleContext, rows: &QueryResult) {
            self.results += 1;
            for row in 0..rows.ntuples() {
                self.values.extend(rows.value(row, 0).map(str::to_owned));
            }
        }

        fn done(&mut self, cx: &mut SimpleContext) {
            self.done += 1;
            self.status = Some(cx.status());
        }
    }

    struct NoQuery;

    impl SimpleHooks for NoQuery {
        fn init(&mut self, _cx: &mut SimpleContext) -> bool {
            true
        }

        fn done(&mut self, _cx: &mut SimpleContext) {}
    }

    fn database(max: u16) -> (Database<MockConnector>, MockConnector) {
        let connector = MockConnector::new();
        let config = PgConfig::new("host=mock").max_connections(max);
        (Database::new(config, connector.clone()).unwrap(), connector)
    }

    // Delivers readiness for every busy connection until nothing changes.
    fn pump(db: &mut Database<MockConnector>, rq: &mut RunQueue) {
        let ids: Vec<_> = (1..=16).map(crate::reactor::ConnId).collect();
        for id in ids {
            db.handle_readable(id, false, rq);
        }
    }

    #[test]
    fn happy_path() {
        let (mut db, connector) = database(1);
        connector.script("SELECT 1", vec![rows(&["1"])]);
        let mut rq = RunQueue::new();
        let mut wf = SimpleQuery::new(RequestId(1), Recorder::new("SELECT 1"));

        assert_eq!(wf.run(&mut db, &mut rq), Flow::Retry);
        assert_eq!(wf.state(), SimpleState::Wait);

        pump(&mut db, &mut rq);
        assert_eq!(rq.pop_ready(), Some(RequestId(1)));
        assert_eq!(wf.run(&mut db, &mut rq), Flow::Complete);

        let (hooks, cx) = wf.into_parts();
        assert_eq!(hooks.values, vec!["1"]);
        assert_eq!(hooks.results, 1);
        assert_eq!(hooks.done, 1);
        assert_eq!(cx.status(), StatusCode::Ok);
        assert_eq!(db.free_connections(), 1);
        assert!(db.queries_of(RequestId(1)).is_empty());
    }

    #[test]
    fn command_without_rows_skips_result_hook() {
        let (mut db, connector) = database(1);
        connector.script("UPDATE t", vec![QueryResult::command("UPDATE 1")]);
        let mut rq = RunQueue::new();
        let mut wf = SimpleQuery::new(RequestId(1), Recorder::new("UPDATE t"));

        wf.run(&mut db, &mut rq);
        pump(&mut db, &mut rq);
        assert_eq!(wf.run(&mut db, &mut rq), Flow::Complete);
        assert_eq!(wf.hooks().results, 0);
        assert_eq!(wf.hooks().done, 1);
        assert_eq!(db.free_connections(), 1);
    }

    #[test]
    fn init_failure_ends_without_done() {
        let (mut db, _connector) = database(1);
        let mut rq = RunQueue::new();
        let mut wf = SimpleQuery::new(RequestId(1), Recorder::default());

        assert_eq!(wf.run(&mut db, &mut rq), Flow::Complete);
        assert_eq!(wf.hooks().done, 0);
        assert_eq!(db.live_connections(), 0);
    }

    #[test]
    #[should_panic(expected = "no query set")]
    fn missing_query_is_fatal() {
        let (mut db, _connector) = database(1);
        let mut rq = RunQueue::new();
        let mut wf = SimpleQuery::new(RequestId(1), NoQuery);
        wf.run(&mut db, &mut rq);
    }

    #[test]
    fn syntax_error_reports_500_once() {
        let (mut db, _connector) = database(1);
        let mut rq = RunQueue::new();
        let mut wf = SimpleQuery::new(RequestId(1), Recorder::new("SELEC 1"));

        wf.run(&mut db, &mut rq);
        pump(&mut db, &mut rq);
        assert_eq!(wf.run(&mut db, &mut rq), Flow::Complete);
        assert_eq!(wf.run(&mut db, &mut rq), Flow::Complete);

        assert_eq!(wf.hooks().done, 1);
        assert_eq!(
            wf.hooks().status,
            Some(StatusCode::InternalServerError)
        );
        assert!(wf.context().error().is_some_and(|e| e.contains("syntax error")));
        // Healthy connection after a query error is recycled.
        assert_eq!(db.live_connections(), 1);
        assert_eq!(db.free_connections(), 1);
    }

    #[test]
    fn connect_failure_reports_500() {
        let (mut db, connector) = database(1);
        connector.fail_next_connects(1);
        let mut rq = RunQueue::new();
        let mut wf = SimpleQuery::new(RequestId(1), Recorder::new("SELECT 1"));

        assert_eq!(wf.run(&mut db, &mut rq), Flow::Complete);
        assert_eq!(wf.hooks().status, Some(StatusCode::InternalServerError));
        assert_eq!(wf.hooks().done, 1);
    }

    #[test]
    fn two_requests_share_one_connection() {
        let (mut db, connector) = database(1);
        connector.script("SELECT 'a'", vec![rows(&["a"])]);
        connector.script("SELECT 'b'", vec![rows(&["b1", "b2"])]);
        let mut rq = RunQueue::new();

        let mut a = SimpleQuery::new(RequestId(1), Recorder::new("SELECT 'a'"));
        let mut b = SimpleQuery::new(RequestId(2), Recorder::new("SELECT 'b'"));

        assert_eq!(a.run(&mut db, &mut rq), Flow::Retry);
        assert_eq!(b.run(&mut db, &mut rq), Flow::Retry);
        assert_eq!(b.state(), SimpleState::Query);
        assert_eq!(db.queued_requests(), 1);

        pump(&mut db, &mut rq);
        assert_eq!(rq.pop_ready(), Some(RequestId(1)));
        assert_eq!(a.run(&mut db, &mut rq), Flow::Complete);

        // Releasing a's connection woke b.
        assert_eq!(rq.pop_ready(), Some(RequestId(2)));
        assert_eq!(b.run(&mut db, &mut rq), Flow::Retry);
        pump(&mut db, &mut rq);
        assert_eq!(rq.pop_ready(), Some(RequestId(2)));
        assert_eq!(b.run(&mut db, &mut rq), Flow::Complete);

        assert_eq!(a.hooks().values, vec!["a"]);
        assert_eq!(b.hooks().values, vec!["b1", "b2"]);
        assert_eq!(a.hooks().done, 1);
        assert_eq!(b.hooks().done, 1);
        assert_eq!(connector.connects(), 1);
        assert_eq!(
            connector.sent(),
            vec![(1, "SELECT 'a'".to_owned()), (1, "SELECT 'b'".to_owned())]
        );
    }

    #[test]
    fn abort_runs_done_for_started_workflow() {
        let (mut db, connector) = database(1);
        connector.script("SELECT 1", vec![rows(&["1"])]);
        let mut rq = RunQueue::new();

        let mut holder = SimpleQuery::new(RequestId(1), Recorder::new("SELECT 1"));
        let mut queued = SimpleQuery::new(RequestId(2), Recorder::new("SELECT 1"));
        let mut fresh = SimpleQuery::new(RequestId(3), Recorder::new("SELECT 1"));
        holder.run(&mut db, &mut rq);
        queued.run(&mut db, &mut rq);

        rq.tear_down(RequestId(2));
        db.queue_remove(RequestId(2));
        queued.abort(&mut db, &mut rq);
        queued.abort(&mut db, &mut rq);
        assert_eq!(queued.hooks().done, 1);
        assert!(queued.is_finished());

        fresh.abort(&mut db, &mut rq);
        assert_eq!(fresh.hooks().done, 0);

        holder.abort(&mut db, &mut rq);
        assert_eq!(holder.hooks().done, 1);
        assert_eq!(db.free_connections(), 1);
        assert_eq!(db.queued_requests(), 0);
        assert_eq!(rq.pop_ready(), None);
    }
}
