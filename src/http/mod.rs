//! HTTP response status recorded by database workflows.
//!
//! Workflows run inside request handlers. A query error marks the response
//! [`StatusCode::InternalServerError`]; otherwise it stays [`StatusCode::Ok`].

use std::fmt;

/// An HTTP response status code.
///
/// # Examples
///
/// ```
/// use rttp_pgsql::http::StatusCode;
///
/// let status = StatusCode::InternalServerError;
/// assert_eq!(status.as_u16(), 500);
/// assert_eq!(status.canonical_reason(), "Internal Server Error");
/// assert!(!status.is_success());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusCode {
    Ok = 200,
    InternalServerError = 500,
}

impl StatusCode {
    /// Returns the numeric status code as a `u16`.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns `true` for 2xx codes.
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.as_u16())
    }

    /// Returns the canonical reason phrase for this status code.
    pub fn canonical_reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::InternalServerError => "Internal Server Error",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.canonical_reason())
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> u16 {
        code.as_u16()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(StatusCode::Ok.to_string(), "200 OK");
        assert_eq!(
            StatusCode::InternalServerError.to_string(),
            "500 Internal Server Error"
        );
    }

    #[test]
    fn success_range() {
        assert!(StatusCode::Ok.is_success());
        assert!(!StatusCode::InternalServerError.is_success());
        assert_eq!(u16::from(StatusCode::InternalServerError), 500);
    }
}
