//! Error taxonomy for the acquisition pipeline.
//!
//! Every failure the core can report falls into one of these categories, and
//! the category alone decides what happens next:
//!
//! - `SourceUnavailable`: fatal to `start()`, surfaced immediately.
//! - `StreamEnded` / `DecodeError`: fatal to the running session.
//! - `UnsupportedConversion`: fatal to the current frame only.
//! - `PacingInconsistency`: non-fatal, the frame is emitted without waiting.
//! - `AlreadyRunning` / `NotRunning`: caller misuse, no state change.
//!
//! The core never retries. Retry policy belongs to whoever drives the
//! lifecycle interface.

use thiserror::Error;

use crate::frame::ColorSpace;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum PipelineError {
    #[error("stream source {uri:?} unavailable: {reason}")]
    SourceUnavailable { uri: String, reason: String },

    #[error("stream ended")]
    StreamEnded,

    #[error("decode error: {0}")]
    DecodeError(String),

    #[error("unsupported color conversion {from:?} -> {to:?}")]
    UnsupportedConversion { from: ColorSpace, to: ColorSpace },

    #[error("source timestamp went backwards ({previous_us}us -> {current_us}us)")]
    PacingInconsistency { previous_us: u64, current_us: u64 },

    #[error("acquisition already running")]
    AlreadyRunning,

    #[error("acquisition not running")]
    NotRunning,
}

/// Error returned by the lifecycle `start()` call.
pub type StartError = PipelineError;

impl PipelineError {
    pub(crate) fn unavailable(uri: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::SourceUnavailable {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn decode(reason: impl std::fmt::Display) -> Self {
        Self::DecodeError(reason.to_string())
    }

    /// True when the error terminates the running session.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable { .. } | Self::StreamEnded | Self::DecodeError(_)
        )
    }

    /// True when only the frame being processed is lost.
    pub fn is_fatal_to_frame(&self) -> bool {
        matches!(self, Self::UnsupportedConversion { .. })
    }
}
