//! Error types and HTTP response conversion

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the runtime error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification used for retry decisions and wire transfer.
///
/// Every [`Error`] variant maps onto exactly one kind; the gateway maps
/// kinds onto HTTP status codes and the invocation layer retries only
/// `Transient` failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Retryable: host unavailable, stale directory view, deadline exceeded,
    /// optimistic-concurrency conflict under a legitimate race.
    Transient,
    /// Business rule rejection; surfaced verbatim, never retried.
    Application,
    /// Invariant violation or infrastructure failure; aborts the activation
    /// (or the silo, on the startup path).
    System,
    /// Admission denied by the rate limiter.
    RateLimited,
    /// Unauthenticated or insufficient role; never retried.
    Auth,
}

/// Main error type for the runtime
///
/// Large error variants are boxed to reduce stack size
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// SQL store error
    #[error("Storage error: {0}")]
    Sql(Box<sqlx::Error>),

    /// Redis error
    #[error("Redis error: {0}")]
    Redis(Box<redis::RedisError>),

    /// State/wire decoding error
    #[error("Decode error: {0}")]
    Decode(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Optimistic concurrency violation on a versioned write.
    ///
    /// Under single-activation this indicates an out-of-band modification
    /// and is treated as a system error; during silo-failover races it is
    /// the expected last line of defense and the losing writer is discarded.
    #[error("version conflict: expected {expected:?}, stored {stored:?}")]
    VersionConflict {
        /// Version the writer believed was current
        expected: Option<u64>,
        /// Version actually present in the store
        stored: Option<u64>,
    },

    /// Retryable cluster-level failure (host unavailable, stale route,
    /// deadline exceeded, mailbox closed mid-delivery)
    #[error("transient: {0}")]
    Transient(String),

    /// Call deadline elapsed before a response arrived
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(std::time::Duration),

    /// Business rule rejection, surfaced verbatim to the caller
    #[error("{0}")]
    Application(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// Authorization error
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Rate limit denial with the policy that tripped and the time until
    /// the armed timeout clears
    #[error("rate limited by policy {policy}, retry after {retry_after_secs}s")]
    RateLimited {
        /// Name of the violated policy
        policy: String,
        /// Seconds until the timeout key expires
        retry_after_secs: u64,
    },

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error into its coarse kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transient(_) | Error::DeadlineExceeded(_) | Error::VersionConflict { .. } => {
                ErrorKind::Transient
            }
            Error::Application(_) | Error::NotFound(_) | Error::BadRequest(_) => {
                ErrorKind::Application
            }
            Error::Unauthorized(_) | Error::Forbidden(_) => ErrorKind::Auth,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::Config(_)
            | Error::Sql(_)
            | Error::Redis(_)
            | Error::Decode(_)
            | Error::Io(_)
            | Error::Internal(_) => ErrorKind::System,
        }
    }

    /// Whether the invocation layer may transparently retry this failure
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Shorthand for a transient failure with a formatted message
    pub fn transient(message: impl Into<String>) -> Self {
        Error::Transient(message.into())
    }
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Error::Config(Box::new(e))
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Sql(Box::new(e))
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Redis(Box::new(e))
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Decode(e.to_string())
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,

    /// HTTP status code
    pub status: u16,

    /// Seconds after which the client may retry, for rate-limit denials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            status: status.as_u16(),
            retry_after_secs: None,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match (&self, self.kind()) {
            (Error::NotFound(_), _) => StatusCode::NOT_FOUND,
            (Error::Forbidden(_), _) => StatusCode::FORBIDDEN,
            (_, ErrorKind::Application) => StatusCode::BAD_REQUEST,
            (_, ErrorKind::Auth) => StatusCode::UNAUTHORIZED,
            (_, ErrorKind::RateLimited) => StatusCode::TOO_MANY_REQUESTS,
            (_, ErrorKind::Transient) => StatusCode::SERVICE_UNAVAILABLE,
            (_, ErrorKind::System) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Do not leak internals to clients; the full error is logged server-side
        let message = match self.kind() {
            ErrorKind::System => {
                tracing::error!(error = %self, "internal error surfaced to gateway");
                "internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let mut body = ErrorResponse::new(status, message);
        let mut retry_after = None;
        if let Error::RateLimited {
            retry_after_secs, ..
        } = &self
        {
            body.retry_after_secs = Some(*retry_after_secs);
            retry_after = Some(*retry_after_secs);
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(Error::transient("host unavailable").is_retryable());
        assert!(Error::DeadlineExceeded(std::time::Duration::from_secs(5)).is_retryable());
        assert!(Error::VersionConflict {
            expected: Some(3),
            stored: Some(4)
        }
        .is_retryable());
        assert!(!Error::Application("cannot trade SSF character".into()).is_retryable());
        assert!(!Error::Internal("schema mismatch".into()).is_retryable());
    }

    #[test]
    fn kinds_map_to_expected_statuses() {
        let resp = Error::Unauthorized("missing ticket".into()).into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = Error::NotFound("item not found".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = Error::transient("directory stale").into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn rate_limited_response_carries_retry_after() {
        let resp = Error::RateLimited {
            policy: "Auth".into(),
            retry_after_secs: 120,
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            resp.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("120")
        );
    }
}
