//! Error types and result aliases for the crosstalk library.
//!
//! This module defines the core error type [`CrosstalkError`] and the [`Result`] type alias
//! used throughout the library. Adapters and the stream assembler return these directly;
//! nothing in this crate retries.

use crate::llm::models::Provider;
use thiserror::Error;

/// Longest wire fragment kept on a [`CrosstalkError::DecodeMalformed`].
const MAX_FRAGMENT_LEN: usize = 200;

#[derive(Error, Debug)]
pub enum CrosstalkError {
    #[error("{provider} wire format cannot represent {detail}")]
    FormatUnsupported { provider: Provider, detail: String },

    #[error("malformed {provider} payload: {reason} (at: {fragment})")]
    DecodeMalformed {
        provider: Provider,
        reason: String,
        fragment: String,
    },

    #[error("Stream protocol violation: {0}")]
    StreamProtocolViolation(String),

    #[error("Upstream error ({kind}): {message}")]
    UpstreamError { kind: String, message: String },

    #[error("Stream cancelled")]
    Cancelled,

    #[error("Invalid attachment: {0}")]
    InvalidAttachment(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl CrosstalkError {
    pub(crate) fn unsupported(provider: Provider, detail: impl Into<String>) -> Self {
        Self::FormatUnsupported {
            provider,
            detail: detail.into(),
        }
    }

    /// Build a decode error, keeping a bounded excerpt of the offending JSON.
    pub(crate) fn malformed(
        provider: Provider,
        reason: impl Into<String>,
        fragment: &serde_json::Value,
    ) -> Self {
        Self::malformed_text(provider, reason, &fragment.to_string())
    }

    pub(crate) fn malformed_text(provider: Provider, reason: impl Into<String>, fragment: &str) -> Self {
        let fragment = match fragment.char_indices().nth(MAX_FRAGMENT_LEN) {
            Some((cut, _)) => format!("{}...", &fragment[..cut]),
            None => fragment.to_string(),
        };
        Self::DecodeMalformed {
            provider,
            reason: reason.into(),
            fragment,
        }
    }

    pub(crate) fn violation(detail: impl Into<String>) -> Self {
        Self::StreamProtocolViolation(detail.into())
    }

    /// True for errors that abort a turn without any usable content.
    pub fn is_fatal_stream_error(&self) -> bool {
        matches!(
            self,
            Self::StreamProtocolViolation(_) | Self::UpstreamError { .. } | Self::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, CrosstalkError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_unsupported_display() {
        let err = CrosstalkError::unsupported(Provider::Ollama, "tool call blocks");
        assert_eq!(err.to_string(), "ollama wire format cannot represent tool call blocks");
    }

    #[test]
    fn test_decode_malformed_keeps_fragment() {
        let err = CrosstalkError::malformed(Provider::OpenAI, "missing role", &json!({"x": 1}));
        match err {
            CrosstalkError::DecodeMalformed {
                provider,
                reason,
                fragment,
            } => {
                assert_eq!(provider, Provider::OpenAI);
                assert_eq!(reason, "missing role");
                assert_eq!(fragment, r#"{"x":1}"#);
            }
            _ => panic!("Expected DecodeMalformed"),
        }
    }

    #[test]
    fn test_decode_malformed_truncates_long_fragment() {
        let long = "a".repeat(500);
        let err = CrosstalkError::malformed_text(Provider::Gemini, "bad", &long);
        match err {
            CrosstalkError::DecodeMalformed { fragment, .. } => {
                assert_eq!(fragment.len(), MAX_FRAGMENT_LEN + 3);
                assert!(fragment.ends_with("..."));
            }
            _ => panic!("Expected DecodeMalformed"),
        }
    }

    #[test]
    fn test_upstream_error_display() {
        let err = CrosstalkError::UpstreamError {
            kind: "overloaded_error".to_string(),
            message: "Overloaded".to_string(),
        };
        assert_eq!(err.to_string(), "Upstream error (overloaded_error): Overloaded");
    }

    #[test]
    fn test_serialization_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: CrosstalkError = json_err.into();

        match err {
            CrosstalkError::SerializationError(_) => {}
            _ => panic!("Expected SerializationError"),
        }
    }

    #[test]
    fn test_fatal_stream_errors() {
        assert!(CrosstalkError::Cancelled.is_fatal_stream_error());
        assert!(CrosstalkError::violation("index 3 is closed").is_fatal_stream_error());
        assert!(!CrosstalkError::ConfigError("x".to_string()).is_fatal_stream_error());
    }

    #[test]
    fn test_result_type() {
        let ok_result: Result<i32> = Ok(42);
        assert!(ok_result.is_ok());

        let err_result: Result<i32> = Err(CrosstalkError::Cancelled);
        assert!(err_result.is_err());
    }
}
