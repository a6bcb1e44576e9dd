//! PostgreSQL session over a plain TCP socket.
//!
//! Connection establishment and authentication are synchronous. Once the
//! server reports ReadyForQuery the socket is switched to non-blocking mode
//! and the session behaves like a libpq connection in asynchronous command
//! processing mode.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use super::protocol::{AuthRequest, BackendMessage, FrontendMessage, MessageReader};
use super::scram::{self, ScramClient};
use super::{ConnInfo, Connector, DriverError, QueryResult, ResultStatus, Session};

const READ_CHUNK: usize = 8192;

/// Opens [`PgSession`]s from a conninfo string.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

impl Connector for PgConnector {
    type Session = PgSession;

    fn connect(&self, conninfo: &str) -> Result<PgSession, DriverError> {
        PgSession::connect(conninfo)
    }
}

/// One PostgreSQL backend connection.
pub struct PgSession {
    stream: TcpStream,
    nonblocking: bool,
    reader: MessageReader,
    results: VecDeque<QueryResult>,
    current: Option<QueryResult>,
    in_query: bool,
    closed: bool,
    error: String,
    process_id: i32,
    secret_key: i32,
    parameters: HashMap<String, String>,
}

impl std::fmt::Debug for PgSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSession")
            .field("fd", &self.stream.as_raw_fd())
            .field("process_id", &self.process_id)
            .field("in_query", &self.in_query)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl PgSession {
    /// Connects, authenticates, and waits for ReadyForQuery.
    ///
    /// # Errors
    ///
    /// Returns a [`DriverError`] if the conninfo is invalid, the server is
    /// unreachable, authentication fails, or the server reports an error.
    pub fn connect(conninfo: &str) -> Result<Self, DriverError> {
        let info = ConnInfo::parse(conninfo)?;
        let addr = info.address();

        let resolved = addr
            .to_socket_addrs()
            .map_err(|source| DriverError::Connect {
                addr: addr.clone(),
                source,
            })?;

        let mut last_error = None;
        let mut stream = None;
        for candidate in resolved {
            match TcpStream::connect_timeout(&candidate, info.connect_timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }
        let stream = stream.ok_or_else(|| DriverError::Connect {
            addr: addr.clone(),
            source: last_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved")),
        })?;

        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(info.connect_timeout))?;
        stream.set_write_timeout(Some(info.connect_timeout))?;

        let mut session = Self {
            stream,
            nonblocking: false,
            reader: MessageReader::new(),
            results: VecDeque::new(),
            current: None,
            in_query: false,
            closed: false,
            error: String::new(),
            process_id: 0,
            secret_key: 0,
            parameters: HashMap::new(),
        };

        session.startup(&info)?;

        session.stream.set_read_timeout(None)?;
        session.stream.set_write_timeout(None)?;
        session.stream.set_nonblocking(true)?;
        session.nonblocking = true;

        debug!(
            addr = %addr,
            dbname = %info.dbname,
            backend_pid = session.process_id,
            "pgsql session established"
        );
        Ok(session)
    }

    /// Backend process id reported at startup.
    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    /// Cancellation key reported at startup.
    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }

    /// A server parameter such as `server_version`.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    fn startup(&mut self, info: &ConnInfo) -> Result<(), DriverError> {
        let params = info.startup_params();
        self.send(FrontendMessage::Startup { params: &params })?;

        loop {
            match self.receive()? {
                BackendMessage::Authentication(request) => self.authenticate(info, request)?,
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.process_id = process_id;
                    self.secret_key = secret_key;
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::ReadyForQuery(_) => return Ok(()),
                BackendMessage::ErrorResponse(fields) => {
                    return Err(DriverError::Server(fields.render()));
                }
                BackendMessage::NoticeResponse(fields) => {
                    debug!(notice = %fields.message, "pgsql startup notice");
                }
                other => {
                    return Err(DriverError::Protocol(format!(
                        "unexpected message during startup: {other:?}"
                    )));
                }
            }
        }
    }

    fn authenticate(&mut self, info: &ConnInfo, request: AuthRequest) -> Result<(), DriverError> {
        match request {
            AuthRequest::Ok => Ok(()),
            AuthRequest::CleartextPassword => {
                let password = require_password(info)?;
                self.send(FrontendMessage::Password(password))
            }
            AuthRequest::Md5Password(salt) => {
                let password = require_password(info)?;
                let hashed = md5_password(&info.user, password, salt);
                self.send(FrontendMessage::Password(&hashed))
            }
            AuthRequest::Sasl(mechanisms) => {
                if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
                    return Err(DriverError::Auth(format!(
                        "no supported SASL mechanism offered: {mechanisms:?}"
                    )));
                }
                self.scram(info)
            }
            AuthRequest::SaslContinue(_) | AuthRequest::SaslFinal(_) => Err(
                DriverError::Protocol("SASL message outside of an exchange".to_owned()),
            ),
            AuthRequest::Unsupported(code) => Err(DriverError::UnsupportedAuth(code)),
        }
    }

    fn scram(&mut self, info: &ConnInfo) -> Result<(), DriverError> {
        let password = require_password(info)?;
        let mut client = ScramClient::new(&info.user, password);

        self.send(FrontendMessage::SaslInitialResponse {
            mechanism: scram::MECHANISM,
            data: &client.client_first(),
        })?;

        let server_first = match self.receive()? {
            BackendMessage::Authentication(AuthRequest::SaslContinue(data)) => data,
            BackendMessage::ErrorResponse(fields) => {
                return Err(DriverError::Server(fields.render()));
            }
            other => {
                return Err(DriverError::Protocol(format!(
                    "expected SASL continue, got {other:?}"
                )));
            }
        };
        let client_final = client.client_final(&server_first)?;
        self.send(FrontendMessage::SaslResponse(&client_final))?;

        match self.receive()? {
            BackendMessage::Authentication(AuthRequest::SaslFinal(data)) => client.verify(&data),
            BackendMessage::ErrorResponse(fields) => Err(DriverError::Server(fields.render())),
            other => Err(DriverError::Protocol(format!(
                "expected SASL final, got {other:?}"
            ))),
        }
    }

    // Writes one message. The socket is put back in blocking mode for the
    // duration of the write.
    fn send(&mut self, msg: FrontendMessage<'_>) -> Result<(), DriverError> {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);

        if self.nonblocking {
            self.stream.set_nonblocking(false)?;
        }
        let written = self
            .stream
            .write_all(&buf)
            .and_then(|()| self.stream.flush());
        if self.nonblocking {
            self.stream.set_nonblocking(true)?;
        }
        written.map_err(DriverError::from)
    }

    // Blocks until one complete backend message is available.
    fn receive(&mut self) -> Result<BackendMessage, DriverError> {
        loop {
            if let Some(msg) = self.reader.next_message()? {
                return Ok(msg);
            }
            self.read_blocking()?;
        }
    }

    fn read_blocking(&mut self) -> Result<(), DriverError> {
        if self.nonblocking {
            self.stream.set_nonblocking(false)?;
        }
        let mut chunk = [0u8; READ_CHUNK];
        let read = loop {
            match self.stream.read(&mut chunk) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        if self.nonblocking {
            self.stream.set_nonblocking(true)?;
        }
        match read? {
            0 => Err(DriverError::Closed),
            n => {
                self.reader.feed(&chunk[..n]);
                Ok(())
            }
        }
    }

    fn process_messages(&mut self) -> Result<(), DriverError> {
        while let Some(msg) = self.reader.next_message()? {
            trace!(?msg, "pgsql backend message");
            self.apply(msg)?;
        }
        Ok(())
    }

    fn apply(&mut self, msg: BackendMessage) -> Result<(), DriverError> {
        match msg {
            BackendMessage::RowDescription(columns) => {
                self.current = Some(QueryResult::tuples(columns));
            }
            BackendMessage::DataRow(cells) => match self.current.as_mut() {
                Some(result) => result.push_row(cells),
                None => {
                    return Err(DriverError::Protocol(
                        "DataRow without RowDescription".to_owned(),
                    ));
                }
            },
            BackendMessage::CommandComplete(tag) => match self.current.take() {
                Some(mut result) => {
                    result.set_command_tag(tag);
                    self.results.push_back(result);
                }
                None => self.results.push_back(QueryResult::command(tag)),
            },
            BackendMessage::EmptyQueryResponse => {
                self.results
                    .push_back(QueryResult::new(ResultStatus::EmptyQuery));
            }
            BackendMessage::ErrorResponse(fields) => {
                self.current = None;
                let message = fields.render();
                self.error.clone_from(&message);
                self.results
                    .push_back(QueryResult::error(ResultStatus::FatalError, message));
            }
            BackendMessage::NoticeResponse(fields) => {
                debug!(severity = %fields.severity, notice = %fields.message, "pgsql notice");
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.parameters.insert(name, value);
            }
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                debug!(process_id, channel = %channel, payload = %payload, "pgsql notification");
            }
            BackendMessage::CopyInResponse => {
                self.results.push_back(QueryResult::new(ResultStatus::CopyIn));
            }
            BackendMessage::CopyOutResponse => {
                self.results.push_back(QueryResult::new(ResultStatus::CopyOut));
            }
            BackendMessage::CopyBothResponse => {
                self.results
                    .push_back(QueryResult::new(ResultStatus::CopyBoth));
            }
            BackendMessage::CopyData | BackendMessage::CopyDone => {}
            BackendMessage::ReadyForQuery(_) => {
                if let Some(result) = self.current.take() {
                    self.results.push_back(result);
                }
                self.in_query = false;
            }
            BackendMessage::Authentication(_)
            | BackendMessage::BackendKeyData { .. }
            | BackendMessage::Unknown(_) => {
                return Err(DriverError::Protocol(format!(
                    "unexpected response from server: {msg:?}"
                )));
            }
        }
        Ok(())
    }

    fn fail(&mut self, err: DriverError) -> DriverError {
        self.error = err.to_string();
        if matches!(err, DriverError::Closed | DriverError::Io(_)) {
            self.closed = true;
            self.in_query = false;
        }
        err
    }
}

impl Session for PgSession {
    fn socket(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn send_query(&mut self, query: &str) -> Result<(), DriverError> {
        if self.closed {
            return Err(self.fail(DriverError::Closed));
        }
        if self.in_query {
            return Err(self.fail(DriverError::Busy));
        }
        self.results.clear();
        self.current = None;
        self.error.clear();

        if let Err(e) = self.send(FrontendMessage::Query(query)) {
            return Err(self.fail(e));
        }
        self.in_query = true;
        Ok(())
    }

    fn consume_input(&mut self) -> Result<(), DriverError> {
        if self.closed {
            return Err(self.fail(DriverError::Closed));
        }

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(self.fail(DriverError::Closed)),
                Ok(n) => self.reader.feed(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fail(DriverError::Io(e))),
            }
        }

        if let Err(e) = self.process_messages() {
            return Err(self.fail(e));
        }
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.results.is_empty() && self.in_query
    }

    fn next_result(&mut self) -> Option<QueryResult> {
        loop {
            if let Some(result) = self.results.pop_front() {
                return Some(result);
            }
            if !self.in_query || self.closed {
                return None;
            }
            let step = self
                .read_blocking()
                .and_then(|()| self.process_messages());
            if let Err(e) = step {
                warn!(error = %e, "pgsql session failed while waiting for a result");
                let _ = self.fail(e);
                self.closed = true;
                self.in_query = false;
                return None;
            }
        }
    }

    fn error_message(&self) -> String {
        self.error.clone()
    }

    fn finish(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.in_query = false;
        let _ = self.send(FrontendMessage::Terminate);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        self.finish();
    }
}

fn require_password(info: &ConnInfo) -> Result<&str, DriverError> {
    info.password
        .as_deref()
        .ok_or_else(|| DriverError::Auth("server requested a password but none was configured".to_owned()))
}

// md5(md5(password || user) || salt), hex encoded and prefixed with "md5".
fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let inner = md5::compute(format!("{password}{user}"));
    let mut outer = format!("{inner:x}").into_bytes();
    outer.extend_from_slice(&salt);
    format!("md5{:x}", md5::compute(&outer))
}
