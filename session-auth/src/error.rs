//! Error types for the `session-auth` crate.
//!
//! A root Error struct holding an error kind and an optional source for chaining.

use std::error::Error as StdError;
use std::fmt;

/// Top-level error type for the session layer.
/// Holds error kind and optional source for error chaining.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Major categories of errors in the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Session(SessionErrorKind),
    Http(HttpErrorKind),
    Transport(TransportErrorKind),
}

/// Errors tied to the authentication state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// No access token is held; the request was not sent.
    NotAuthenticated,
    /// The server rejected the access token as expired or invalid.
    AuthExpired,
    /// The refresh call failed; the session has been cleared.
    RefreshFailed,
    /// The session ended (logout or refresh failure) while the request waited.
    SessionEnded,
}

/// Errors from HTTP requests other than authorization expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorKind {
    BuilderFailed,
    /// The request never produced a response (DNS, connect, timeout, reset).
    Network,
    /// The server answered with a non-success status.
    Status(u16),
    /// The response body did not have the expected shape.
    InvalidResponse,
}

/// Errors from the realtime transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    InvalidUrl,
    ConnectFailed,
    ConnectTimeout,
    /// The server refused the connection handshake (e.g. bad token).
    Rejected,
    Protocol,
    Closed,
    /// Reconnection gave up after the configured number of attempts.
    RetriesExhausted,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.error_kind
    }

    pub fn is_auth_expired(&self) -> bool {
        self.error_kind == ErrorKind::Session(SessionErrorKind::AuthExpired)
    }

    /// True for failures that end the session and require a new login.
    pub fn is_terminal_auth(&self) -> bool {
        matches!(
            self.error_kind,
            ErrorKind::Session(SessionErrorKind::RefreshFailed)
                | ErrorKind::Session(SessionErrorKind::SessionEnded)
        )
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self.error_kind {
            ErrorKind::Http(HttpErrorKind::Status(status)) => Some(status),
            ErrorKind::Session(SessionErrorKind::AuthExpired) => Some(401),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::Session(kind) => write!(f, "Session error: {:?}", kind)?,
            ErrorKind::Http(kind) => write!(f, "HTTP error: {:?}", kind)?,
            ErrorKind::Transport(kind) => write!(f, "Transport error: {:?}", kind)?,
        }
        if let Some(source) = &self.source {
            write!(f, " ({source})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let error_kind = if err.is_builder() {
            ErrorKind::Http(HttpErrorKind::BuilderFailed)
        } else if err.is_decode() {
            ErrorKind::Http(HttpErrorKind::InvalidResponse)
        } else if let Some(status) = err.status() {
            ErrorKind::Http(HttpErrorKind::Status(status.as_u16()))
        } else {
            ErrorKind::Http(HttpErrorKind::Network)
        };

        Error {
            source: Some(Box::new(err)),
            error_kind,
        }
    }
}

impl From<reqwest_middleware::Error> for Error {
    fn from(err: reqwest_middleware::Error) -> Self {
        match err {
            reqwest_middleware::Error::Reqwest(err) => err.into(),
            other => Error {
                source: Some(Box::new(other)),
                error_kind: ErrorKind::Http(HttpErrorKind::Network),
            },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Http(HttpErrorKind::InvalidResponse),
        }
    }
}

/// Helper function to create session errors.
pub fn session_error(kind: SessionErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Session(kind),
    }
}

/// Helper function to create HTTP errors.
pub fn http_error(kind: HttpErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Http(kind),
    }
}

/// Helper function to create transport errors.
pub fn transport_error(kind: TransportErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Transport(kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_expired_reports_401() {
        let err = session_error(SessionErrorKind::AuthExpired, "token expired");
        assert!(err.is_auth_expired());
        assert!(!err.is_terminal_auth());
        assert_eq!(err.status(), Some(401));
    }

    #[test]
    fn test_terminal_auth_kinds() {
        assert!(session_error(SessionErrorKind::RefreshFailed, "x").is_terminal_auth());
        assert!(session_error(SessionErrorKind::SessionEnded, "x").is_terminal_auth());
        assert!(!http_error(HttpErrorKind::Status(403), "x").is_terminal_auth());
    }

    #[test]
    fn test_display_includes_source_message() {
        let err = http_error(HttpErrorKind::Status(404), "job not found");
        assert_eq!(err.to_string(), "HTTP error: Status(404) (job not found)");
        assert_eq!(err.status(), Some(404));
    }

    #[test]
    fn test_serde_error_is_invalid_response() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Http(HttpErrorKind::InvalidResponse));
    }
}
