//! Error taxonomy for the synthesis streaming pipeline.
//!
//! Every stage (validation, registry lookup, synthesis, transcoding, relay) reports
//! failures through [`PipelineError`]. The variant decides the HTTP status used when
//! the failure is detected before any audio bytes were committed to the client.

use thiserror::Error;

/// A failure anywhere between request validation and the last relayed byte.
///
/// Cloneable so the same cause can be logged server-side and forwarded downstream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Bad or missing request fields, caught before any resource is acquired
    #[error("{0}")]
    Validation(String),

    /// The requested voice is not in the model registry
    #[error("voice '{0}' not found")]
    VoiceNotFound(String),

    /// The transcoder executable could not be resolved or launched
    #[error("transcoder unavailable: {0}")]
    Spawn(String),

    /// The speech engine failed while generating audio
    #[error("synthesis failed: {0}")]
    Synthesis(String),

    /// The transcoder exited unsuccessfully or one of its pipes failed
    #[error("transcoding failed: {0}")]
    Transcode(String),

    /// The consumer went away before the stream completed (not a server fault)
    #[error("client disconnected")]
    ClientDisconnect,

    /// The request deadline expired or the server is shutting down
    #[error("request cancelled: {0}")]
    Cancelled(String),
}

impl PipelineError {
    /// Whether this failure was caused by the server side of the pipeline.
    ///
    /// Client disconnects only trigger resource release and are never logged as errors.
    pub fn is_server_fault(&self) -> bool {
        !matches!(self, PipelineError::ClientDisconnect | PipelineError::Validation(_) | PipelineError::VoiceNotFound(_))
    }
}
