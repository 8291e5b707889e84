// src/error.rs
use hyper::{Body, Response, StatusCode};
use std::time::Duration;

/// Why a single forwarding attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttemptError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend responded with {0}")]
    Status(StatusCode),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("attempt cancelled by caller")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("backend {0} is already registered")]
    Duplicate(String),

    #[error("backend {0} not found")]
    NotFound(String),

    #[error("no backend available")]
    NoBackendAvailable,

    #[error("all {attempts} attempts failed, last error: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: AttemptError,
    },

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProxyError {
    /// Status code surfaced at the framework boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NoBackendAvailable | ProxyError::PoolClosed | ProxyError::Cancelled => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::RetryExhausted {
                last: AttemptError::Timeout(_),
                ..
            } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::RetryExhausted { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Configuration(_) | ProxyError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::Duplicate(_) => StatusCode::CONFLICT,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

// Convert ProxyError to Hyper Response for error handling
impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let mut response = Response::new(Body::from(err.to_string()));
        *response.status_mut() = err.status_code();
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_status_codes() {
        assert_eq!(
            ProxyError::NoBackendAvailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        let exhausted = ProxyError::RetryExhausted {
            attempts: 4,
            last: AttemptError::Status(StatusCode::INTERNAL_SERVER_ERROR),
        };
        assert_eq!(exhausted.status_code(), StatusCode::BAD_GATEWAY);

        let timed_out = ProxyError::RetryExhausted {
            attempts: 1,
            last: AttemptError::Timeout(Duration::from_millis(5)),
        };
        assert_eq!(timed_out.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ProxyError::Duplicate("b1".into()).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_retry_exhausted_keeps_last_cause() {
        let err = ProxyError::RetryExhausted {
            attempts: 2,
            last: AttemptError::Transport("connection refused".into()),
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("transport error: connection refused"));

        let response: Response<Body> = err.into();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
