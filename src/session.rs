use crate::audio::transport::Transport;

/// One loaded resource: its transport plus the derived clock.
///
/// `current_time` stays within `[0, duration]` and `progress` is always
/// `current_time / duration`, or zero for an empty resource.
pub(crate) struct PlaybackSession {
    /// Load generation this session belongs to.
    pub(crate) id: u64,
    transport: Box<dyn Transport>,
    duration: f64,
    current_time: f64,
    progress: f64,
}

impl PlaybackSession {
    pub(crate) fn new(id: u64, transport: Box<dyn Transport>) -> Self {
        let duration = transport.duration();
        let duration = if duration.is_finite() && duration > 0.0 {
            duration
        } else {
            0.0
        };
        Self {
            id,
            transport,
            duration,
            current_time: 0.0,
            progress: 0.0,
        }
    }

    pub(crate) fn duration(&self) -> f64 {
        self.duration
    }

    pub(crate) fn current_time(&self) -> f64 {
        self.current_time
    }

    pub(crate) fn progress(&self) -> f64 {
        self.progress
    }

    pub(crate) fn transport_playing(&self) -> bool {
        self.transport.is_playing()
    }

    fn set_time(&mut self, seconds: f64) {
        self.current_time = seconds.clamp(0.0, self.duration);
        self.progress = if self.duration > 0.0 {
            (self.current_time / self.duration).clamp(0.0, 1.0)
        } else {
            0.0
        };
    }

    /// Clamp `seconds` into the resource and move the transport there.
    /// Non-finite targets are ignored.
    pub(crate) fn seek_to_time(&mut self, seconds: f64) {
        if !seconds.is_finite() {
            return;
        }
        self.set_time(seconds);
        self.transport.seek(self.current_time);
    }

    pub(crate) fn seek_to_progress(&mut self, progress: f64) {
        if !progress.is_finite() {
            return;
        }
        self.seek_to_time(progress.clamp(0.0, 1.0) * self.duration);
    }

    /// Pull the elapsed time from the transport.
    pub(crate) fn sync_from_transport(&mut self) {
        let position = self.transport.position();
        if position.is_finite() {
            self.set_time(position);
        }
    }

    pub(crate) fn play(&mut self) {
        self.transport.play();
    }

    pub(crate) fn pause(&mut self) {
        self.transport.pause();
    }

    pub(crate) fn stop(&mut self) {
        self.transport.stop();
    }
}
