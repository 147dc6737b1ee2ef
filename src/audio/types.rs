/// Decoded audio data stored entirely in memory.
#[derive(Clone, Debug)]
pub struct AudioData {
    /// Interleaved samples normalized to [-1.0, 1.0].
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Duration in seconds.
    pub duration: f64,
}

impl AudioData {
    /// Total number of frames (samples per channel).
    pub fn num_frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }
}

/// Commands sent from a transport handle to its output stream thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AudioCommand {
    Play,
    Pause,
    Stop,
    /// Absolute position in seconds.
    Seek(f64),
}

/// Average each interleaved frame down to a single sample.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmix_averages_stereo_frames() {
        let mono = downmix(&[1.0, 0.0, -0.5, -0.5, 0.25, 0.75], 2);
        assert_eq!(mono, vec![0.5, -0.5, 0.5]);
    }

    #[test]
    fn num_frames_counts_per_channel() {
        let data = AudioData {
            samples: vec![0.0; 12],
            sample_rate: 8_000,
            channels: 3,
            duration: 4.0 / 8_000.0,
        };
        assert_eq!(data.num_frames(), 4);
    }
}
