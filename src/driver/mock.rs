//! Scripted in-memory driver for tests.
//!
//! Every session owns a real Unix socket pair so that readiness can be
//! observed by the worker: sending a query writes a byte to the peer end,
//! making the session's socket readable.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use super::{Connector, DriverError, QueryResult, ResultStatus, Session};

#[derive(Debug, Default)]
struct MockState {
    scripts: HashMap<String, Vec<QueryResult>>,
    failing_connects: usize,
    failing_sends: HashSet<String>,
    failing_consumes: usize,
    busy_polls: usize,
    connects: usize,
    finished: usize,
    sent: Vec<(usize, String)>,
    stale_sends: usize,
}

/// Connector whose sessions answer from a script.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockConnector {
    state: Rc<RefCell<MockState>>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Results returned for `query`. Unscripted queries fail with a syntax error.
    pub(crate) fn script(&self, query: &str, results: Vec<QueryResult>) {
        self.state
            .borrow_mut()
            .scripts
            .insert(query.to_owned(), results);
    }

    pub(crate) fn fail_next_connects(&self, n: usize) {
        self.state.borrow_mut().failing_connects = n;
    }

    pub(crate) fn fail_send(&self, query: &str) {
        self.state.borrow_mut().failing_sends.insert(query.to_owned());
    }

    pub(crate) fn fail_next_consumes(&self, n: usize) {
        self.state.borrow_mut().failing_consumes = n;
    }

    /// Number of `consume_input` calls a session stays busy after a send.
    pub(crate) fn set_busy_polls(&self, n: usize) {
        self.state.borrow_mut().busy_polls = n;
    }

    pub(crate) fn connects(&self) -> usize {
        self.state.borrow().connects
    }

    pub(crate) fn finished(&self) -> usize {
        self.state.borrow().finished
    }

    /// `(session number, query)` for every successful send, in order.
    pub(crate) fn sent(&self) -> Vec<(usize, String)> {
        self.state.borrow().sent.clone()
    }

    /// Sends issued while the session still held undrained results.
    pub(crate) fn stale_sends(&self) -> usize {
        self.state.borrow().stale_sends
    }
}

impl Connector for MockConnector {
    type Session = MockSession;

    fn connect(&self, _conninfo: &str) -> Result<MockSession, DriverError> {
        let mut state = self.state.borrow_mut();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(DriverError::Connect {
                addr: "mock:5432".to_owned(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            });
        }
        state.connects += 1;

        let (local, peer) = UnixStream::pair()?;
        local.set_nonblocking(true)?;

        Ok(MockSession {
            number: state.connects,
            state: Rc::clone(&self.state),
            local,
            peer,
            pending: VecDeque::new(),
            busy_left: 0,
            in_query: false,
            error: String::new(),
            closed: false,
        })
    }
}

#[derive(Debug)]
pub(crate) struct MockSession {
    number: usize,
    state: Rc<RefCell<MockState>>,
    local: UnixStream,
    peer: UnixStream,
    pending: VecDeque<QueryResult>,
    busy_left: usize,
    in_query: bool,
    error: String,
    closed: bool,
}

impl MockSession {
    fn signal(&mut self) {
        let _ = self.peer.write_all(&[1]);
    }
}

impl Session for MockSession {
    fn socket(&self) -> RawFd {
        self.local.as_raw_fd()
    }

    fn send_query(&mut self, query: &str) -> Result<(), DriverError> {
        let mut state = self.state.borrow_mut();
        if state.failing_sends.contains(query) {
            self.error = "could not send data to server: Broken pipe".to_owned();
            return Err(DriverError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "broken pipe",
            )));
        }
        if !self.pending.is_empty() {
            state.stale_sends += 1;
        }

        self.pending = match state.scripts.get(query) {
            Some(results) => results.iter().cloned().collect(),
            None => VecDeque::from([QueryResult::error(
                ResultStatus::FatalError,
                format!("ERROR:  syntax error at or near \"{query}\"\n"),
            )]),
        };
        self.busy_left = state.busy_polls;
        self.in_query = true;
        self.error.clear();
        state.sent.push((self.number, query.to_owned()));
        drop(state);

        self.signal();
        Ok(())
    }

    fn consume_input(&mut self) -> Result<(), DriverError> {
        {
            let mut state = self.state.borrow_mut();
            if state.failing_consumes > 0 {
                state.failing_consumes -= 1;
                self.error = "server closed the connection unexpectedly".to_owned();
                return Err(DriverError::Closed);
            }
        }

        let mut buf = [0u8; 64];
        loop {
            match self.local.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(DriverError::Io(e)),
            }
        }

        if self.busy_left > 0 {
            self.busy_left -= 1;
            if self.busy_left > 0 {
                // more input is "on the way"
                self.signal();
            }
        }
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.in_query && self.busy_left > 0
    }

    fn next_result(&mut self) -> Option<QueryResult> {
        self.busy_left = 0;
        let next = self.pending.pop_front();
        match &next {
            Some(result) if result.status() == ResultStatus::FatalError => {
                self.error = result.error_message().unwrap_or_default().to_owned();
            }
            Some(_) => {}
            None => self.in_query = false,
        }
        next
    }

    fn error_message(&self) -> String {
        self.error.clone()
    }

    fn finish(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.borrow_mut().finished += 1;
        }
    }
}

/// One-column row set with the given cells.
pub(crate) fn rows(cells: &[&str]) -> QueryResult {
    let mut result = QueryResult::tuples(vec!["value".to_owned()]);
    for cell in cells {
        result.push_row(vec![Some((*cell).to_owned())]);
    }
    result.set_command_tag(format!("SELECT {}", cells.len()));
    result
}
