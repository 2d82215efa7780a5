//! Error types for the transcoder module.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while driving the transcoder.
#[derive(Debug, Error)]
pub enum TranscoderError {
    /// The process could not be spawned.
    #[error("Failed to spawn transcoder: {0}")]
    SpawnFailed(std::io::Error),

    /// No readiness signal within the start timeout.
    #[error("Transcoder did not report output within {0:?}")]
    StartTimeout(Duration),

    /// The process exited before reporting readiness.
    #[error("Transcoder exited before producing output (code {code:?}, signal {signal:?})")]
    ExitedBeforeStart {
        code: Option<i32>,
        signal: Option<i32>,
    },

    /// A start was requested without inputs.
    #[error("No inputs to transcode")]
    NoInputs,

    /// No process is running.
    #[error("Transcoder not running")]
    NotRunning,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
