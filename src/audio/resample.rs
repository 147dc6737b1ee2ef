//! Sample-rate conversion of decoded audio to the output device rate.
//!
//! Runs once per load with Rubato's sinc resampler, so the output callback
//! only ever copies frames.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use super::types::AudioData;
use crate::error::SessionError;

/// Input frames handed to the resampler per call.
const CHUNK_FRAMES: usize = 1024;

fn sinc_params() -> SincInterpolationParameters {
    SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    }
}

fn failure(stage: &str, e: impl std::fmt::Display) -> SessionError {
    SessionError::SetupFailure(format!("resampler {stage} failed: {e}"))
}

fn append(out: &mut [Vec<f32>], block: Vec<Vec<f32>>) {
    for (channel, samples) in out.iter_mut().zip(block) {
        channel.extend_from_slice(&samples);
    }
}

/// Convert `audio` to `target_rate`. Returns it unchanged when the rates
/// already match or there is nothing to convert.
pub fn resample(audio: AudioData, target_rate: u32) -> Result<AudioData, SessionError> {
    let channels = audio.channels as usize;
    let frames = audio.num_frames();
    if target_rate == 0 || audio.sample_rate == target_rate || channels == 0 || frames == 0 {
        return Ok(audio);
    }

    let ratio = target_rate as f64 / audio.sample_rate as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, sinc_params(), CHUNK_FRAMES, channels)
        .map_err(|e| failure("init", e))?;

    let mut planar: Vec<Vec<f32>> = vec![Vec::with_capacity(frames); channels];
    for frame in audio.samples.chunks_exact(channels) {
        for (ch, &sample) in frame.iter().enumerate() {
            planar[ch].push(sample);
        }
    }

    let expected = (frames as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();
    let mut out: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + delay); channels];

    let mut pos = 0;
    while frames - pos >= resampler.input_frames_next() {
        let n = resampler.input_frames_next();
        let input: Vec<&[f32]> = planar.iter().map(|c| &c[pos..pos + n]).collect();
        let block = resampler.process(&input, None).map_err(|e| failure("process", e))?;
        append(&mut out, block);
        pos += n;
    }
    if pos < frames {
        let input: Vec<&[f32]> = planar.iter().map(|c| &c[pos..]).collect();
        let block = resampler
            .process_partial(Some(input.as_slice()), None)
            .map_err(|e| failure("process", e))?;
        append(&mut out, block);
    }
    // flush the filter delay
    while out[0].len() < expected + delay {
        let block = resampler
            .process_partial(None::<&[Vec<f32>]>, None)
            .map_err(|e| failure("flush", e))?;
        if block.first().map_or(true, Vec::is_empty) {
            break;
        }
        append(&mut out, block);
    }

    let end = (delay + expected).min(out[0].len());
    let start = delay.min(end);
    let mut samples = Vec::with_capacity((end - start) * channels);
    for i in start..end {
        for channel in &out {
            samples.push(channel[i]);
        }
    }

    let out_frames = end - start;
    tracing::debug!(
        from = audio.sample_rate,
        to = target_rate,
        frames,
        out_frames,
        "resampled audio for output"
    );
    Ok(AudioData {
        samples,
        sample_rate: target_rate,
        channels: audio.channels,
        duration: out_frames as f64 / target_rate as f64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(rate: u32, seconds: f64, channels: u16) -> AudioData {
        let frames = (rate as f64 * seconds) as usize;
        let mut samples = Vec::with_capacity(frames * channels as usize);
        for i in 0..frames {
            let t = i as f64 / rate as f64;
            let s = (2.0 * std::f64::consts::PI * 220.0 * t).sin() as f32 * 0.5;
            for _ in 0..channels {
                samples.push(s);
            }
        }
        AudioData {
            samples,
            sample_rate: rate,
            channels,
            duration: seconds,
        }
    }

    #[test]
    fn matching_rate_is_untouched() {
        let audio = tone(8_000, 0.5, 1);
        let out = resample(audio.clone(), 8_000).unwrap();
        assert_eq!(out.samples, audio.samples);
        assert_eq!(out.sample_rate, 8_000);
    }

    #[test]
    fn upsampling_keeps_duration_and_layout() {
        let out = resample(tone(8_000, 1.0, 2), 16_000).unwrap();
        assert_eq!(out.sample_rate, 16_000);
        assert_eq!(out.channels, 2);
        assert_eq!(out.num_frames(), 16_000);
        assert!((out.duration - 1.0).abs() < 1e-9);
    }

    #[test]
    fn downsampling_preserves_a_low_tone() {
        let out = resample(tone(48_000, 1.0, 1), 44_100).unwrap();
        assert_eq!(out.num_frames(), 44_100);

        // skip the edges where the filter ramps in and out
        let middle = &out.samples[4_000..40_000];
        let peak = middle.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        assert!((peak - 0.5).abs() < 0.02, "peak was {peak}");
    }

    #[test]
    fn empty_audio_passes_through() {
        let audio = AudioData {
            samples: Vec::new(),
            sample_rate: 8_000,
            channels: 1,
            duration: 0.0,
        };
        let out = resample(audio, 48_000).unwrap();
        assert!(out.samples.is_empty());
        assert_eq!(out.sample_rate, 8_000);
    }
}
