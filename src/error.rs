//! Error taxonomy for the frame pipeline.
//!
//! Transport timeouts and decode size mismatches are not errors here: they are
//! values (`Frame::Timeout`, `Decoded::SizeMismatch`) that flow through the
//! pipeline. Everything below is either fatal configuration trouble or a
//! per-tick condition the session loop logs and skips.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid runtime configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A normalization channel has a zero (or non-finite) standard deviation.
    #[error("zero standard deviation for feature `{feature}`")]
    ZeroStd { feature: String },

    /// The calibration mapping artifact could not be found.
    #[error("calibration mapping not found: {0}")]
    MissingMapping(String),

    /// The calibration mapping artifact is inconsistent.
    #[error("malformed calibration mapping: {0}")]
    MalformedMapping(String),

    /// The simulator sent a byte outside the handshake table.
    #[error("unknown handshake flag byte 0x{0:02x}")]
    UnknownFlag(u8),

    /// The control routine was asked to process a tick without any input sample.
    #[error("no data from input device")]
    NoInputData,

    /// A feature the mapping needs is absent from the current observation.
    #[error("feature `{0}` missing from observation")]
    MissingFeature(String),

    /// NaN or infinity reached the mapper.
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),
}

impl PipelineError {
    /// Per-tick conditions that skip one frame instead of ending the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PipelineError::UnknownFlag(_) | PipelineError::NonFinite(_))
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
