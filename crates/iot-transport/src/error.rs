//! Error handling for the transport layer.

use std::{string::FromUtf8Error, time::Duration};

use thiserror::Error;

/// The main result type used throughout the transport layer.
pub type TransportResult<T> = Result<T, TransportError>;

/// Error type for all transport operations.
///
/// Every variant is classifiable so callers can decide whether to retry,
/// surface the failure to an operator, or treat it as permanent.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Authentication was rejected or could not be negotiated.
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// The device does not know the requested method or path.
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    /// The device or the wire did not answer in time.
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// The caller's deadline elapsed.
    #[error("Deadline exceeded after {duration:?}")]
    DeadlineExceeded { duration: Duration },

    /// The transport was closed.
    #[error("Transport is closed")]
    Closed,

    /// The transport has no live connection.
    #[error("Not connected")]
    NotConnected,

    /// The connection dropped while the call was in flight.
    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    /// A notification handler is already registered.
    #[error("Notification handler already registered")]
    HandlerAlreadyRegistered,

    /// All retry attempts failed.
    #[error("Max retries exceeded after {attempts} attempts: {last}")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        last: Box<TransportError>,
    },

    /// HTTP status error not covered by a more specific variant.
    #[error("HTTP error: status={status}, body={body}")]
    Http { status: http::StatusCode, body: String },

    /// Error object returned inside an RPC response envelope.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Network-level failure (connect, DNS, reset).
    #[error("Network error: {message}")]
    Network { message: String },

    /// WebSocket protocol errors.
    #[error("WebSocket error: {message}")]
    WebSocket { message: String },

    /// MQTT client errors.
    #[error("MQTT error: {message}")]
    Mqtt { message: String },

    /// The operation is not available on this transport.
    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    /// Too many requests are waiting for a response.
    #[error("Capacity exceeded: {message}")]
    CapacityExceeded { message: String },

    /// A request with the same id is already in flight.
    #[error("Request id {id} is already pending")]
    DuplicateRequestId { id: u64 },

    /// Configuration errors.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Socket I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FromUtf8Error> for TransportError {
    fn from(e: FromUtf8Error) -> Self {
        Self::Serialization(serde_json::Error::io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            e.to_string(),
        )))
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            // reqwest does not report the configured duration
            Self::Timeout {
                duration: Duration::ZERO,
            }
        } else if e.is_builder() {
            Self::Config {
                message: e.to_string(),
            }
        } else {
            Self::Network {
                message: e.to_string(),
            }
        }
    }
}

#[cfg(feature = "websocket")]
impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::ConnectionLost {
                reason: e.to_string(),
            },
            WsError::Io(io) => Self::Network {
                message: io.to_string(),
            },
            WsError::Http(ref response) if response.status() == http::StatusCode::UNAUTHORIZED => {
                Self::Auth {
                    message: "WebSocket handshake rejected with 401".to_string(),
                }
            }
            other => Self::WebSocket {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(feature = "mqtt")]
impl From<rumqttc::ClientError> for TransportError {
    fn from(e: rumqttc::ClientError) -> Self {
        Self::Mqtt {
            message: e.to_string(),
        }
    }
}

impl TransportError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an authentication error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a WebSocket error.
    pub fn websocket(message: impl Into<String>) -> Self {
        Self::WebSocket {
            message: message.into(),
        }
    }

    /// Create an MQTT error.
    pub fn mqtt(message: impl Into<String>) -> Self {
        Self::Mqtt {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a connection-lost error.
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost {
            reason: reason.into(),
        }
    }

    /// Create an unsupported-operation error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create a capacity error.
    pub fn capacity_exceeded(message: impl Into<String>) -> Self {
        Self::CapacityExceeded {
            message: message.into(),
        }
    }

    /// Map an HTTP status code (>= 400) to a typed error.
    pub fn from_status(status: http::StatusCode, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            http::StatusCode::UNAUTHORIZED => Self::Auth {
                message: if body.is_empty() {
                    "unauthorized".to_string()
                } else {
                    body
                },
            },
            http::StatusCode::NOT_FOUND => Self::NotFound { resource: body },
            http::StatusCode::REQUEST_TIMEOUT => Self::Timeout {
                duration: Duration::ZERO,
            },
            status => Self::Http { status, body },
        }
    }

    /// Whether a fresh attempt of the same request could succeed.
    ///
    /// Authentication, not-found, deadline, closed and configuration
    /// failures are permanent for the current call.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Auth { .. }
            | Self::NotFound { .. }
            | Self::DeadlineExceeded { .. }
            | Self::Closed
            | Self::HandlerAlreadyRegistered
            | Self::MaxRetriesExceeded { .. }
            | Self::Unsupported { .. }
            | Self::DuplicateRequestId { .. }
            | Self::Config { .. }
            | Self::Serialization(_)
            | Self::Rpc { .. } => false,
            Self::Timeout { .. }
            | Self::NotConnected
            | Self::ConnectionLost { .. }
            | Self::Http { .. }
            | Self::Network { .. }
            | Self::WebSocket { .. }
            | Self::Mqtt { .. }
            | Self::CapacityExceeded { .. }
            | Self::Io(_) => true,
        }
    }

    /// Authentication failure.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    /// Unknown method or path.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Timed out on the wire or at the caller's deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::DeadlineExceeded { .. })
    }

    /// The transport was closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// HTTP status carried by this error, if any.
    pub fn status_code(&self) -> Option<http::StatusCode> {
        match self {
            Self::Auth { .. } => Some(http::StatusCode::UNAUTHORIZED),
            Self::NotFound { .. } => Some(http::StatusCode::NOT_FOUND),
            Self::Http { status, .. } => Some(*status),
            Self::MaxRetriesExceeded { last, .. } => last.status_code(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = TransportError::config("Invalid URL");
        assert!(matches!(err, TransportError::Config { .. }));

        let err = TransportError::timeout(Duration::from_secs(5));
        assert!(matches!(err, TransportError::Timeout { .. }));

        let err = TransportError::auth("bad password");
        assert!(err.is_auth());
    }

    #[test]
    fn test_status_mapping() {
        let err = TransportError::from_status(http::StatusCode::UNAUTHORIZED, "");
        assert!(err.is_auth());

        let err = TransportError::from_status(http::StatusCode::NOT_FOUND, "/nope");
        assert!(err.is_not_found());

        let err = TransportError::from_status(http::StatusCode::REQUEST_TIMEOUT, "");
        assert!(err.is_timeout());

        let err = TransportError::from_status(http::StatusCode::BAD_GATEWAY, "upstream");
        assert_eq!(err.status_code(), Some(http::StatusCode::BAD_GATEWAY));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retry_classification() {
        assert!(!TransportError::auth("x").is_retryable());
        assert!(!TransportError::not_found("x").is_retryable());
        assert!(!TransportError::Closed.is_retryable());
        assert!(!TransportError::unsupported("call").is_retryable());
        assert!(
            !TransportError::DeadlineExceeded {
                duration: Duration::from_secs(1)
            }
            .is_retryable()
        );
        assert!(TransportError::network("reset").is_retryable());
        assert!(TransportError::timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn test_max_retries_keeps_last_status() {
        let err = TransportError::MaxRetriesExceeded {
            attempts: 3,
            last: Box::new(TransportError::from_status(
                http::StatusCode::SERVICE_UNAVAILABLE,
                "busy",
            )),
        };
        assert_eq!(
            err.status_code(),
            Some(http::StatusCode::SERVICE_UNAVAILABLE)
        );
        assert!(err.to_string().contains("Max retries exceeded"));
    }
}
