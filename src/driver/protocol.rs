//! PostgreSQL v3 frontend/backend message codec.
//!
//! Only the subset needed for the simple-query cycle is implemented:
//! startup, password authentication, `Query`, `Terminate`, and the backend
//! messages a simple query can produce.

#![allow(clippy::cast_possible_truncation)]

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::DriverError;

/// Protocol version 3.0.
pub const PROTOCOL_VERSION: i32 = 196_608;

/// Largest backend message we accept.
const MAX_MESSAGE_LEN: usize = 1 << 30;

/// A message sent by the client.
#[derive(Debug, Clone, Copy)]
pub enum FrontendMessage<'a> {
    Startup { params: &'a [(String, String)] },
    Password(&'a str),
    SaslInitialResponse { mechanism: &'a str, data: &'a [u8] },
    SaslResponse(&'a [u8]),
    Query(&'a str),
    Terminate,
}

impl FrontendMessage<'_> {
    /// Appends the wire encoding of this message to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Startup { params } => {
                let mut body = BytesMut::new();
                body.put_i32(PROTOCOL_VERSION);
                for (key, value) in params.iter() {
                    put_cstr(&mut body, key);
                    put_cstr(&mut body, value);
                }
                body.put_u8(0);
                buf.put_i32((body.len() + 4) as i32);
                buf.put(body);
            }
            Self::Password(password) => {
                let mut body = BytesMut::new();
                put_cstr(&mut body, password);
                frame(buf, b'p', &body);
            }
            Self::SaslInitialResponse { mechanism, data } => {
                let mut body = BytesMut::new();
                put_cstr(&mut body, mechanism);
                body.put_i32(data.len() as i32);
                body.put_slice(data);
                frame(buf, b'p', &body);
            }
            Self::SaslResponse(data) => frame(buf, b'p', data),
            Self::Query(query) => {
                let mut body = BytesMut::with_capacity(query.len() + 1);
                put_cstr(&mut body, query);
                frame(buf, b'Q', &body);
            }
            Self::Terminate => frame(buf, b'X', &[]),
        }
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn frame(buf: &mut BytesMut, tag: u8, body: &[u8]) {
    buf.put_u8(tag);
    buf.put_i32((body.len() + 4) as i32);
    buf.put_slice(body);
}

/// An authentication request from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    Ok,
    CleartextPassword,
    Md5Password([u8; 4]),
    Sasl(Vec<String>),
    SaslContinue(Vec<u8>),
    SaslFinal(Vec<u8>),
    Unsupported(i32),
}

/// Fields of an ErrorResponse or NoticeResponse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl ErrorFields {
    /// Formats the fields the way libpq renders an error message.
    ///
    /// ```
    /// use rttp_pgsql::driver::protocol::ErrorFields;
    ///
    /// let fields = ErrorFields {
    ///     severity: "ERROR".into(),
    ///     code: "42601".into(),
    ///     message: "syntax error at or near \"SELEC\"".into(),
    ///     ..Default::default()
    /// };
    /// assert_eq!(fields.render(), "ERROR:  syntax error at or near \"SELEC\"\n");
    /// ```
    pub fn render(&self) -> String {
        let mut out = format!("{}:  {}\n", self.severity, self.message);
        if let Some(detail) = &self.detail {
            out.push_str(&format!("DETAIL:  {detail}\n"));
        }
        if let Some(hint) = &self.hint {
            out.push_str(&format!("HINT:  {hint}\n"));
        }
        out
    }
}

/// A message received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    Authentication(AuthRequest),
    BackendKeyData { process_id: i32, secret_key: i32 },
    ParameterStatus { name: String, value: String },
    ReadyForQuery(u8),
    RowDescription(Vec<String>),
    DataRow(Vec<Option<String>>),
    CommandComplete(String),
    EmptyQueryResponse,
    ErrorResponse(ErrorFields),
    NoticeResponse(ErrorFields),
    NotificationResponse { process_id: i32, channel: String, payload: String },
    CopyInResponse,
    CopyOutResponse,
    CopyBothResponse,
    CopyData,
    CopyDone,
    /// Any message type the client does not interpret.
    Unknown(u8),
}

/// Incremental framer for backend messages.
///
/// Socket bytes are [`feed`](Self::feed)ed in as they arrive;
/// [`next_message`](Self::next_message) yields each complete message.
#[derive(Debug, Default)]
pub struct MessageReader {
    buf: BytesMut,
}

impl MessageReader {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
        }
    }

    /// Appends raw socket input.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet framed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decodes the next complete message, or `Ok(None)` if more input is
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Protocol`] for malformed frames.
    pub fn next_message(&mut self) -> Result<Option<BackendMessage>, DriverError> {
        if self.buf.len() < 5 {
            return Ok(None);
        }

        let tag = self.buf[0];
        let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        let len = usize::try_from(len)
            .ok()
            .filter(|len| (4..=MAX_MESSAGE_LEN).contains(len))
            .ok_or_else(|| {
                DriverError::Protocol(format!("invalid length {len} for message '{}'", tag as char))
            })?;

        if self.buf.len() < 1 + len {
            self.buf.reserve(1 + len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(5);
        let body = self.buf.split_to(len - 4).freeze();
        decode(tag, body).map(Some)
    }
}

fn decode(tag: u8, body: Bytes) -> Result<BackendMessage, DriverError> {
    let mut body = Body(body);
    let msg = match tag {
        b'R' => BackendMessage::Authentication(decode_auth(&mut body)?),
        b'K' => BackendMessage::BackendKeyData {
            process_id: body.i32()?,
            secret_key: body.i32()?,
        },
        b'S' => BackendMessage::ParameterStatus {
            name: body.cstr()?,
            value: body.cstr()?,
        },
        b'Z' => BackendMessage::ReadyForQuery(body.u8()?),
        b'T' => {
            let count = body.i16()?;
            let mut columns = Vec::with_capacity(count.max(0) as usize);
            for _ in 0..count {
                columns.push(body.cstr()?);
                // table oid, column attr, type oid, type size, type modifier, format
                body.skip(4 + 2 + 4 + 2 + 4 + 2)?;
            }
            BackendMessage::RowDescription(columns)
        }
        b'D' => {
            let count = body.i16()?;
            let mut cells = Vec::with_capacity(count.max(0) as usize);
            for _ in 0..count {
                let len = body.i32()?;
                if len < 0 {
                    cells.push(None);
                } else {
                    let raw = body.bytes(len as usize)?;
                    cells.push(Some(String::from_utf8_lossy(&raw).into_owned()));
                }
            }
            BackendMessage::DataRow(cells)
        }
        b'C' => BackendMessage::CommandComplete(body.cstr()?),
        b'I' => BackendMessage::EmptyQueryResponse,
        b'E' => BackendMessage::ErrorResponse(decode_fields(&mut body)?),
        b'N' => BackendMessage::NoticeResponse(decode_fields(&mut body)?),
        b'A' => BackendMessage::NotificationResponse {
            process_id: body.i32()?,
            channel: body.cstr()?,
            payload: body.cstr()?,
        },
        b'G' => BackendMessage::CopyInResponse,
        b'H' => BackendMessage::CopyOutResponse,
        b'W' => BackendMessage::CopyBothResponse,
        b'd' => BackendMessage::CopyData,
        b'c' => BackendMessage::CopyDone,
        other => BackendMessage::Unknown(other),
    };
    Ok(msg)
}

fn decode_auth(body: &mut Body) -> Result<AuthRequest, DriverError> {
    let code = body.i32()?;
    let request = match code {
        0 => AuthRequest::Ok,
        3 => AuthRequest::CleartextPassword,
        5 => {
            let salt = body.bytes(4)?;
            AuthRequest::Md5Password([salt[0], salt[1], salt[2], salt[3]])
        }
        10 => {
            let mut mechanisms = Vec::new();
            loop {
                let mechanism = body.cstr()?;
                if mechanism.is_empty() {
                    break;
                }
                mechanisms.push(mechanism);
            }
            AuthRequest::Sasl(mechanisms)
        }
        11 => AuthRequest::SaslContinue(body.rest()),
        12 => AuthRequest::SaslFinal(body.rest()),
        other => AuthRequest::Unsupported(other),
    };
    Ok(request)
}

fn decode_fields(body: &mut Body) -> Result<ErrorFields, DriverError> {
    let mut fields = ErrorFields::default();
    loop {
        let kind = body.u8()?;
        if kind == 0 {
            break;
        }
        let value = body.cstr()?;
        match kind {
            b'S' => fields.severity = value,
            b'C' => fields.code = value,
            b'M' => fields.message = value,
            b'D' => fields.detail = Some(value),
            b'H' => fields.hint = Some(value),
            _ => {}
        }
    }
    Ok(fields)
}

// Bounds-checked cursor over one message body.
struct Body(Bytes);

impl Body {
    fn need(&self, n: usize) -> Result<(), DriverError> {
        if self.0.remaining() < n {
            return Err(DriverError::Protocol("unexpected end of message".to_owned()));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, DriverError> {
        self.need(1)?;
        Ok(self.0.get_u8())
    }

    fn i16(&mut self) -> Result<i16, DriverError> {
        self.need(2)?;
        Ok(self.0.get_i16())
    }

    fn i32(&mut self) -> Result<i32, DriverError> {
        self.need(4)?;
        Ok(self.0.get_i32())
    }

    fn skip(&mut self, n: usize) -> Result<(), DriverError> {
        self.need(n)?;
        self.0.advance(n);
        Ok(())
    }

    fn bytes(&mut self, n: usize) -> Result<Bytes, DriverError> {
        self.need(n)?;
        Ok(self.0.split_to(n))
    }

    fn rest(&mut self) -> Vec<u8> {
        let rest = self.0.to_vec();
        self.0.clear();
        rest
    }

    fn cstr(&mut self) -> Result<String, DriverError> {
        let end = self
            .0
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| DriverError::Protocol("unterminated string".to_owned()))?;
        let raw = self.0.split_to(end);
        self.0.advance(1);
        String::from_utf8(raw.to_vec())
            .map_err(|e| DriverError::Protocol(format!("invalid UTF-8: {e}")))
    }
}
