//! Typed error hierarchy shared by every nvpipe crate.
//!
//! # Error codes
//!
//! Each variant maps to a stable integer code via [`CodecError::error_code`]
//! so callers can branch on failures without string parsing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Downstream flow result, the value a consumer returns when it rejects a
/// finished frame.
///
/// Flow errors are latched by the element and returned from every later
/// submission until a state transition (stop/restart) clears them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowError {
    /// Element is flushing or stopping.
    Flushing,
    /// Consumer reached end-of-stream.
    Eos,
    /// Consumer is not linked.
    NotLinked,
    /// Consumer could not agree on a format.
    NotNegotiated,
    /// Fatal consumer-side error.
    Error,
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Flushing => "flushing",
            Self::Eos => "eos",
            Self::NotLinked => "not-linked",
            Self::NotNegotiated => "not-negotiated",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// All errors originating from the codec elements and their backends.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    // ── Context / session ────────────────────────────────────────────
    #[error("{call} failed with driver status {code}")]
    Driver { call: &'static str, code: i32 },

    #[error("failed to load {library}: {reason}")]
    LibraryLoad { library: String, reason: String },

    #[error("device context creation failed: {0}")]
    ContextCreate(String),

    #[error("codec session open failed: {0}")]
    SessionOpen(String),

    // ── Per-frame hardware ───────────────────────────────────────────
    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("texture interop error: {0}")]
    Interop(String),

    // ── Flow ─────────────────────────────────────────────────────────
    #[error("downstream flow error: {0}")]
    Flow(FlowError),

    // ── Negotiation ──────────────────────────────────────────────────
    #[error("not negotiated: {0}")]
    NotNegotiated(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    // ── Lifecycle / configuration ────────────────────────────────────
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid state: expected {expected}, element is {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("shutdown in progress")]
    Shutdown,

    // ── Invariants ───────────────────────────────────────────────────
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl CodecError {
    /// Stable integer error code.
    ///
    /// Codes are grouped by category:
    /// - 1xx: context/session
    /// - 2xx: per-frame hardware
    /// - 3xx: downstream flow
    /// - 4xx: negotiation
    /// - 5xx: lifecycle/configuration
    /// - 6xx: invariants
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Driver { .. } => 100,
            Self::LibraryLoad { .. } => 101,
            Self::ContextCreate(_) => 102,
            Self::SessionOpen(_) => 103,
            Self::Encode(_) => 200,
            Self::Decode(_) => 201,
            Self::Interop(_) => 202,
            Self::Flow(_) => 300,
            Self::NotNegotiated(_) => 400,
            Self::UnsupportedFormat(_) => 401,
            Self::Config(_) => 500,
            Self::InvalidState { .. } => 501,
            Self::Shutdown => 502,
            Self::BufferTooSmall { .. } => 600,
            Self::InvariantViolation(_) => 601,
        }
    }

    /// Whether the surrounding framework may keep the pipeline running.
    ///
    /// Per-frame hardware failures and downstream flow errors fail one frame;
    /// context and negotiation failures are fatal to the element.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Encode(_) | Self::Decode(_) | Self::Interop(_) | Self::Flow(_)
        )
    }

    /// Flow value reported to the framework for this error.
    pub fn as_flow(&self) -> FlowError {
        match self {
            Self::Flow(flow) => *flow,
            Self::NotNegotiated(_) | Self::UnsupportedFormat(_) => FlowError::NotNegotiated,
            Self::Shutdown => FlowError::Flushing,
            _ => FlowError::Error,
        }
    }
}

impl From<FlowError> for CodecError {
    fn from(flow: FlowError) -> Self {
        Self::Flow(flow)
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CodecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_grouped_by_category() {
        assert_eq!(
            CodecError::Driver {
                call: "cuInit",
                code: 100
            }
            .error_code()
                / 100,
            1
        );
        assert_eq!(CodecError::Encode("x".into()).error_code() / 100, 2);
        assert_eq!(CodecError::Flow(FlowError::Eos).error_code() / 100, 3);
        assert_eq!(CodecError::NotNegotiated("x".into()).error_code() / 100, 4);
        assert_eq!(CodecError::Shutdown.error_code() / 100, 5);
        assert_eq!(
            CodecError::InvariantViolation("x".into()).error_code() / 100,
            6
        );
    }

    #[test]
    fn per_frame_failures_are_recoverable() {
        assert!(CodecError::Encode("lock bitstream".into()).is_recoverable());
        assert!(CodecError::Flow(FlowError::NotLinked).is_recoverable());
        assert!(!CodecError::SessionOpen("no device".into()).is_recoverable());
        assert!(!CodecError::NotNegotiated("444 12-bit".into()).is_recoverable());
    }

    #[test]
    fn flow_mapping() {
        assert_eq!(
            CodecError::UnsupportedFormat("x".into()).as_flow(),
            FlowError::NotNegotiated
        );
        assert_eq!(CodecError::Flow(FlowError::Eos).as_flow(), FlowError::Eos);
        assert_eq!(CodecError::Decode("x".into()).as_flow(), FlowError::Error);
        assert_eq!(FlowError::NotLinked.to_string(), "not-linked");
    }
}
