//! Waveform extraction and scrub-friendly playback control.
//!
//! [`WaveformExtractor`] turns an audio file into a fixed number of normalized
//! peak bars, either in one call or as a cancellable progress stream.
//! [`PlaybackController`] owns one playback session at a time and keeps its
//! clock, state and waveform consistent across loads, seeks and resets.

pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
mod session;
pub mod waveform;

pub use audio::engine::{CpalBackend, CpalTransport};
pub use audio::transport::{PlaybackBackend, Transport};
pub use config::{ControllerConfig, ExtractorConfig};
pub use controller::{PlaybackController, PlayerEvent, PlayerState};
pub use error::{SessionError, WaveformError};
pub use waveform::{AmplitudeSeries, ExtractionProgress, ExtractionStream, WaveformExtractor};
