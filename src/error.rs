//! Error taxonomy
//!
//! Every fallible operation in the crate returns [`StorageError`]. The
//! variants follow the fault classes the retry engine distinguishes:
//! transport faults, status faults, integrity faults, protocol faults and
//! local invariant violations.

use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Transport-level fault classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Connect,
    Timeout,
    Tls,
    ChunkedEncoding,
    Decode,
    Proxy,
    /// The request could not be built; never retried
    Builder,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Tls => "tls",
            Self::ChunkedEncoding => "chunked-encoding",
            Self::Decode => "decode",
            Self::Proxy => "proxy",
            Self::Builder => "builder",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// Storage client errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {path}\n{message}")]
    PermissionDenied { path: String, message: String },

    #[error("Bad Request: {path}\n{message}")]
    BadRequest { path: String, message: String },

    #[error("Bucket is requester pays. Set `storage.requester_pays: true` and a project in the configuration: {0}")]
    RequesterPays(String),

    #[error("HTTP error {code}: {message}")]
    Http { code: u16, message: String },

    #[error("Checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("Checksum unsupported: {0}")]
    ChecksumUnsupported(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether this error means the addressed object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// Short label used for metrics and log fields
    pub fn label(&self) -> &'static str {
        match self {
            StorageError::NotFound(_) => "not_found",
            StorageError::PermissionDenied { .. } => "permission_denied",
            StorageError::BadRequest { .. } => "bad_request",
            StorageError::RequesterPays(_) => "requester_pays",
            StorageError::Http { .. } => "http",
            StorageError::ChecksumMismatch(_) => "checksum_mismatch",
            StorageError::ChecksumUnsupported(_) => "checksum_unsupported",
            StorageError::Protocol(_) => "protocol",
            StorageError::Transport { .. } => "transport",
            StorageError::Auth(_) => "auth",
            StorageError::InvalidArgument(_) => "invalid_argument",
            StorageError::Timeout(_) => "timeout",
            StorageError::Io(_) => "io",
        }
    }

    pub(crate) fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        StorageError::Transport {
            kind,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_builder() {
            TransportErrorKind::Builder
        } else if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            // rustls surfaces handshake failures as connect errors
            if format!("{:?}", err).contains("certificate") {
                TransportErrorKind::Tls
            } else {
                TransportErrorKind::Connect
            }
        } else if err.is_decode() {
            TransportErrorKind::Decode
        } else if err.is_body() {
            TransportErrorKind::ChunkedEncoding
        } else {
            TransportErrorKind::Other
        };
        StorageError::transport(kind, err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Extract the server message from an error body.
///
/// The JSON API answers with `{"error": {"code": .., "message": ..}}`; anything
/// else is passed through as text.
pub fn error_message(body: &[u8]) -> String {
    match serde_json::from_slice::<ErrorEnvelope>(body) {
        Ok(envelope) => envelope.error.message,
        Err(_) => String::from_utf8_lossy(body).trim().to_string(),
    }
}

/// Map a response status to an error, `Ok(())` for success.
///
/// 308 is the resumable-upload "incomplete" reply and is not an error.
pub fn validate_response(status: u16, body: &[u8], path: &str) -> Result<(), StorageError> {
    if status < 400 {
        return Ok(());
    }
    let message = error_message(body);
    Err(match status {
        404 => StorageError::NotFound(path.to_string()),
        403 => StorageError::PermissionDenied {
            path: path.to_string(),
            message,
        },
        400 => StorageError::BadRequest {
            path: path.to_string(),
            message,
        },
        502 => StorageError::transport(TransportErrorKind::Proxy, format!("502 from {}", path)),
        code => StorageError::Http { code, message },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_success() {
        assert!(validate_response(200, b"", "/path").is_ok());
        assert!(validate_response(308, b"", "/path").is_ok());
    }

    #[test]
    fn test_validate_http_error_without_json() {
        let err = validate_response(503, b"", "/path").unwrap_err();
        match err {
            StorageError::Http { code, message } => {
                assert_eq!(code, 503);
                assert_eq!(message, "");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_validate_http_error_with_json() {
        let body = br#"{"error": {"code": 503, "message": "Service Unavailable"}}"#;
        let err = validate_response(503, body, "/path").unwrap_err();
        assert!(matches!(err, StorageError::Http { code: 503, ref message } if message == "Service Unavailable"));
    }

    #[test]
    fn test_validate_forbidden() {
        let body = br#"{"error": {"message": "Not ok"}}"#;
        let err = validate_response(403, body, "/path").unwrap_err();
        assert_eq!(err.to_string(), "Forbidden: /path\nNot ok");
    }

    #[test]
    fn test_validate_not_found() {
        let err = validate_response(404, b"", "/path").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_validate_bad_gateway_is_proxy_fault() {
        let err = validate_response(502, b"", "/path").unwrap_err();
        assert!(matches!(
            err,
            StorageError::Transport {
                kind: TransportErrorKind::Proxy,
                ..
            }
        ));
    }
}
