//! Error taxonomy for the daemon.
//!
//! Startup failures split into two layers. Most are tolerated: a broken
//! endpoint config or an unbindable listener degrades the board and gets a
//! warning. `ServerError` is for what is left, the failures that end
//! startup and exit the process non-zero. Request-path failures never use
//! it; they become an [`HttpError`] and answer the one request that caused
//! them.

use thiserror::Error;
use trellis_core::ErrorBody;

use crate::tls::TlsError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// An HTTP-facing failure. Serializes on the wire as
/// `{code, type: "Exception", message}`; internal detail stays in the logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    pub code: u16,
    pub message: String,
}

impl HttpError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(403, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(408, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(503, message)
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody::new(self.code, self.message.clone())
    }
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

impl std::error::Error for HttpError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_maps_to_wire_body() {
        let err = HttpError::not_found("no endpoint named billing");
        let body = err.body();
        assert_eq!(body.code, 404);
        assert_eq!(body.kind, "Exception");
        assert_eq!(body.message, "no endpoint named billing");
    }

    #[test]
    fn constructors_use_expected_codes() {
        assert_eq!(HttpError::bad_request("x").code, 400);
        assert_eq!(HttpError::forbidden("x").code, 403);
        assert_eq!(HttpError::timeout("x").code, 408);
        assert_eq!(HttpError::internal("x").code, 500);
        assert_eq!(HttpError::unavailable("x").code, 503);
    }
}
