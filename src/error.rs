//! Error types for correlated calls and the top-level crate surface
//!
//! A correlated call fails in one of four distinguishable ways: no response
//! before the deadline, a response that does not decode, an explicit
//! rejection from the service, or a transport fault. None of them is retried
//! here.

use crate::protocol::{JobStatus, ValidationError};
use crate::transport::mqtt::MqttError;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single request/response exchange
#[derive(Debug, Error)]
pub enum CallError {
    #[error("No response on {topic} within {timeout:?}")]
    Timeout { topic: String, timeout: Duration },

    #[error("Malformed response on {topic}: {reason}")]
    Malformed { topic: String, reason: String },

    #[error("Request rejected on {topic}: {}", describe_rejection(.code, .message))]
    Rejected {
        topic: String,
        code: Option<String>,
        message: Option<String>,
    },

    #[error("Acknowledged status {reported} does not match requested {requested}")]
    StatusMismatch {
        requested: JobStatus,
        reported: String,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] MqttError),

    #[error("Failed to encode request: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CallError {
    /// True when the call gave up waiting, as opposed to receiving an answer
    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout { .. })
    }

    /// True when the service answered negatively
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CallError::Rejected { .. } | CallError::StatusMismatch { .. }
        )
    }

    pub fn malformed<T: Into<String>, R: Into<String>>(topic: T, reason: R) -> Self {
        Self::Malformed {
            topic: topic.into(),
            reason: reason.into(),
        }
    }
}

fn describe_rejection(code: &Option<String>, message: &Option<String>) -> String {
    match (code, message) {
        (Some(code), Some(message)) => format!("{code}: {message}"),
        (Some(code), None) => code.clone(),
        (None, Some(message)) => message.clone(),
        (None, None) => "no reason given".to_string(),
    }
}

/// Main error type for thingsync operations
#[derive(Debug, Error)]
pub enum ThingError {
    #[error("Call failed: {0}")]
    Call(#[from] CallError),

    #[error("Transport error: {0}")]
    Transport(#[from] MqttError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Invalid identifier: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Firmware update error: {0}")]
    Fota(#[from] crate::ota::FotaError),
}

impl ThingError {
    /// Create invalid input error
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

/// Result type for thingsync operations
pub type ThingResult<T> = Result<T, ThingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_distinct_from_rejection() {
        let timeout = CallError::Timeout {
            topic: "t/get/accepted".to_string(),
            timeout: Duration::from_millis(50),
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_rejection());

        let rejected = CallError::Rejected {
            topic: "t/get/rejected".to_string(),
            code: Some("VersionMismatch".to_string()),
            message: None,
        };
        assert!(!rejected.is_timeout());
        assert!(rejected.is_rejection());
        assert_eq!(
            rejected.to_string(),
            "Request rejected on t/get/rejected: VersionMismatch"
        );
    }

    #[test]
    fn test_status_mismatch_display() {
        let error = CallError::StatusMismatch {
            requested: JobStatus::Succeeded,
            reported: "REJECTED".to_string(),
        };
        assert!(error.is_rejection());
        assert_eq!(
            error.to_string(),
            "Acknowledged status REJECTED does not match requested SUCCEEDED"
        );
    }

    #[test]
    fn test_malformed_constructor() {
        let error = CallError::malformed("a/b", "missing field `execution`");
        assert!(matches!(error, CallError::Malformed { .. }));
        assert!(!error.is_timeout());
        assert!(error.to_string().contains("missing field"));
    }

    #[test]
    fn test_rejection_without_reason() {
        let error = CallError::Rejected {
            topic: "x".to_string(),
            code: None,
            message: None,
        };
        assert!(error.to_string().ends_with("no reason given"));
    }

    #[test]
    fn test_thing_error_constructors() {
        let error = ThingError::invalid_input("state must be an object");
        assert_eq!(error.to_string(), "Invalid input: state must be an object");

        let error: ThingError = crate::ota::FotaError::NotConfigured.into();
        assert!(matches!(error, ThingError::Fota(_)));
    }

    #[test]
    fn test_call_error_converts_into_thing_error() {
        let call = CallError::malformed("x", "y");
        let error: ThingError = call.into();
        assert!(matches!(error, ThingError::Call(CallError::Malformed { .. })));
    }
}
