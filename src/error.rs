use std::path::PathBuf;

use thiserror::Error;

/// Failures while reading an audio file for waveform extraction.
#[derive(Debug, Error)]
pub enum WaveformError {
    #[error("audio file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The container or codec cannot be decoded into float samples.
    #[error("invalid audio format: {0}")]
    InvalidFormat(String),

    /// A decoded packet carried no channel data.
    #[error("decoded audio contained no sample data")]
    NoAudioData,

    #[error("bar count must be greater than zero")]
    InvalidBarCount,
}

/// Failures while preparing a playback session.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("session setup failed: {0}")]
    SetupFailure(String),
}

impl From<WaveformError> for SessionError {
    fn from(err: WaveformError) -> Self {
        SessionError::SetupFailure(err.to_string())
    }
}
