use std::path::Path;

use crate::error::SessionError;

/// A prepared playback pipeline for one resource.
///
/// Implementations apply commands without blocking; the controller reads
/// `position` and `is_playing` from its progress tick.
pub trait Transport: Send {
    /// Total length in seconds.
    fn duration(&self) -> f64;

    /// Current position in seconds.
    fn position(&self) -> f64;

    fn is_playing(&self) -> bool;

    fn play(&mut self);

    fn pause(&mut self);

    /// Move to an absolute position in seconds. Callers clamp beforehand.
    fn seek(&mut self, seconds: f64);

    /// Halt output and rewind. The transport is discarded afterwards.
    fn stop(&mut self);
}

/// Opens resources into transports.
///
/// `open` may block (decoding, device setup); the controller calls it from the
/// blocking pool.
pub trait PlaybackBackend: Send + Sync + 'static {
    fn open(&self, resource: &Path) -> Result<Box<dyn Transport>, SessionError>;
}
