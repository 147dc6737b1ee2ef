use std::time::Duration;

/// Tuning parameters for [`crate::PlaybackController`].
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Number of waveform bars requested on every load.
    pub bar_count: usize,
    /// Period of the progress tick while playing.
    pub tick_interval: Duration,
    /// Offset used by the default skip commands, in seconds.
    pub skip_seconds: f64,
    /// Slack allowed when deciding that playback reached the end, in seconds.
    pub end_epsilon: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bar_count: 64,
            tick_interval: Duration::from_millis(40),
            skip_seconds: 15.0,
            end_epsilon: 0.1,
        }
    }
}

/// Tuning parameters for [`crate::WaveformExtractor`].
#[derive(Clone, Debug)]
pub struct ExtractorConfig {
    /// Length of each streamed chunk, in seconds of audio at the native rate.
    pub chunk_seconds: f64,
    /// Publish partial bars after every this many chunks. Zero disables them.
    pub snapshot_every: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            chunk_seconds: 1.0,
            snapshot_every: 2,
        }
    }
}

impl ExtractorConfig {
    /// Chunk length in frames for a given sample rate. Never zero.
    pub fn chunk_frames(&self, sample_rate: u32) -> usize {
        let frames = (sample_rate as f64 * self.chunk_seconds) as usize;
        frames.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_is_one_second_by_default() {
        let cfg = ExtractorConfig::default();
        assert_eq!(cfg.chunk_frames(44_100), 44_100);
        assert_eq!(cfg.chunk_frames(8_000), 8_000);
    }

    #[test]
    fn chunk_frames_never_zero() {
        let cfg = ExtractorConfig {
            chunk_seconds: 0.0,
            ..ExtractorConfig::default()
        };
        assert_eq!(cfg.chunk_frames(48_000), 1);
    }
}
