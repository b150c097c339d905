//! Error types for webhook delivery.
//!
//! Every failure is local to one (event, endpoint) delivery. Transport
//! failures carry no status code; HTTP failures carry the received status
//! and the truncated response body.

use std::{fmt, time::Duration};

use hookline_core::{CoreError, EndpointId};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Failure of a delivery operation.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Payload could not be serialized. No attempt was made.
    #[error("payload encoding failed: {message}")]
    Encoding {
        /// Serializer message
        message: String,
    },

    /// Connection, DNS or TLS failure.
    #[error("network connection failed: {message}")]
    Network {
        /// Error message describing the network failure
        message: String,
    },

    /// Per-attempt deadline exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Configured timeout in seconds
        timeout_seconds: u64,
    },

    /// Receiver answered outside the 2xx range.
    #[error("endpoint responded with HTTP {status_code}")]
    Http {
        /// Received status code
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Every allowed attempt failed.
    #[error("delivery failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made, including the first
        attempts: u32,
        /// Failure of the final attempt
        last: Box<DeliveryError>,
    },

    /// Storage access failed.
    #[error("storage error: {message}")]
    Storage {
        /// Storage error message
        message: String,
    },

    /// Invalid delivery configuration.
    #[error("invalid delivery configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Delivery abandoned because shutdown was requested.
    #[error("delivery cancelled")]
    Cancelled,

    /// In-flight deliveries did not drain before the shutdown deadline.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Deadline that was exceeded
        timeout: Duration,
    },

    /// Endpoint does not exist.
    #[error("endpoint {endpoint_id} not found")]
    EndpointNotFound {
        /// Requested endpoint
        endpoint_id: EndpointId,
    },
}

impl DeliveryError {
    /// Creates an encoding error.
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding { message: message.into() }
    }

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates an HTTP status error.
    pub fn http(status_code: u16, body: impl Into<String>) -> Self {
        Self::Http { status_code, body: body.into() }
    }

    /// Creates a retries exhausted error.
    pub fn retries_exhausted(attempts: u32, last: DeliveryError) -> Self {
        Self::RetriesExhausted { attempts, last: Box::new(last) }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// HTTP status of the failure, if a response was received.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Http { status_code, .. } => Some(*status_code),
            Self::RetriesExhausted { last, .. } => last.status_code(),
            _ => None,
        }
    }

    /// True for failures where no HTTP response was obtained.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }

    /// True for failures a later attempt could plausibly fix: transport
    /// errors, 5xx, 408 and 429.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::Http { status_code, .. } => {
                matches!(status_code, 408 | 429) || (500..=599).contains(status_code)
            },
            _ => false,
        }
    }

    /// Coarse classification used in log fields.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Encoding { .. } => ErrorKind::Encoding,
            Self::Network { .. } | Self::Timeout { .. } => ErrorKind::Transport,
            Self::Http { .. } => ErrorKind::Http,
            Self::RetriesExhausted { .. } => ErrorKind::Exhausted,
            Self::Storage { .. } | Self::EndpointNotFound { .. } => ErrorKind::Storage,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Cancelled | Self::ShutdownTimeout { .. } => ErrorKind::Shutdown,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Encoding(message) => Self::Encoding { message },
            other => Self::storage(other.to_string()),
        }
    }
}

/// Category of delivery error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Payload serialization.
    Encoding,
    /// No response obtained.
    Transport,
    /// Non-2xx response.
    Http,
    /// Retry budget exhausted.
    Exhausted,
    /// Storage access.
    Storage,
    /// Configuration problems.
    Configuration,
    /// Cancellation or shutdown.
    Shutdown,
}

impl ErrorKind {
    /// Stable lowercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Encoding => "encoding",
            Self::Transport => "transport",
            Self::Http => "http",
            Self::Exhausted => "exhausted",
            Self::Storage => "storage",
            Self::Configuration => "configuration",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_have_no_status() {
        for err in [DeliveryError::network("refused"), DeliveryError::timeout(30)] {
            assert!(err.is_transport());
            assert_eq!(err.status_code(), None);
            assert_eq!(err.kind(), ErrorKind::Transport);
        }
    }

    #[test]
    fn exhausted_error_exposes_last_status() {
        let err = DeliveryError::retries_exhausted(6, DeliveryError::http(404, "missing"));
        assert_eq!(err.status_code(), Some(404));
        assert_eq!(err.to_string(), "delivery failed after 6 attempts: endpoint responded with HTTP 404");
    }

    #[test]
    fn transient_classification() {
        assert!(DeliveryError::http(503, "").is_transient());
        assert!(DeliveryError::http(429, "").is_transient());
        assert!(DeliveryError::timeout(30).is_transient());
        assert!(!DeliveryError::http(404, "").is_transient());
        assert!(!DeliveryError::encoding("nan").is_transient());
    }

    #[test]
    fn core_encoding_errors_stay_encoding() {
        let err = DeliveryError::from(CoreError::Encoding("bad".into()));
        assert_eq!(err.kind(), ErrorKind::Encoding);

        let err = DeliveryError::from(CoreError::Database("down".into()));
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(err.to_string(), DeliveryError::storage("Database error: down").to_string());
    }
}
