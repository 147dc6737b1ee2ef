use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::types::{downmix, AudioData};
use crate::config::ExtractorConfig;
use crate::error::WaveformError;

/// A probed container with a decoder bound to its first audio track.
struct OpenTrack {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: Option<u16>,
    n_frames: Option<u64>,
}

impl OpenTrack {
    fn open(path: &Path) -> Result<Self, WaveformError> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => WaveformError::FileNotFound(path.to_path_buf()),
            _ => WaveformError::Io(e),
        })?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| WaveformError::InvalidFormat(format!("failed to probe format: {e}")))?;

        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| WaveformError::InvalidFormat("no audio track found".into()))?
            .clone();

        let sample_rate = track
            .codec_params
            .sample_rate
            .filter(|&sr| sr > 0)
            .ok_or_else(|| WaveformError::InvalidFormat("no sample rate in track".into()))?;

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| WaveformError::InvalidFormat(format!("failed to create decoder: {e}")))?;

        Ok(Self {
            format,
            decoder,
            track_id: track.id,
            sample_rate,
            channels: track.codec_params.channels.map(|c| c.count() as u16),
            n_frames: track.codec_params.n_frames,
        })
    }

    /// Decode the next packet of this track into interleaved samples.
    ///
    /// Returns `Ok(None)` at end of stream along with the channel count of the
    /// packet otherwise.
    fn next_interleaved(&mut self) -> Result<Option<(Vec<f32>, usize)>, WaveformError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(SymphoniaError::IoError(e)) => return Err(WaveformError::Io(e)),
                Err(e) => {
                    return Err(WaveformError::InvalidFormat(format!(
                        "error reading packet: {e}"
                    )))
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::warn!("skipping undecodable packet: {e}");
                    continue;
                }
                Err(e) => return Err(WaveformError::InvalidFormat(format!("decode error: {e}"))),
            };

            let spec = *decoded.spec();
            let channels = spec.channels.count();
            if channels == 0 {
                return Err(WaveformError::NoAudioData);
            }
            if decoded.frames() == 0 {
                continue;
            }

            let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            sample_buf.copy_interleaved_ref(decoded);
            self.channels.get_or_insert(channels as u16);
            return Ok(Some((sample_buf.samples().to_vec(), channels)));
        }
    }
}

/// Decode an audio file into an `AudioData` struct with all samples in memory.
///
/// Used to back playback; waveform extraction goes through [`ChunkedReader`].
pub fn decode_file(path: &Path) -> Result<AudioData, WaveformError> {
    let mut track = OpenTrack::open(path)?;
    let mut samples: Vec<f32> = Vec::new();
    let mut channels = track.channels.unwrap_or(0);

    while let Some((packet, packet_channels)) = track.next_interleaved()? {
        if channels == 0 {
            channels = packet_channels as u16;
        }
        samples.extend_from_slice(&packet);
    }

    if samples.is_empty() || channels == 0 {
        return Err(WaveformError::NoAudioData);
    }

    let sample_rate = track.sample_rate;
    let num_frames = samples.len() / channels as usize;
    let duration = num_frames as f64 / sample_rate as f64;

    Ok(AudioData {
        samples,
        sample_rate,
        channels,
        duration,
    })
}

/// Streams a file as mono chunks of a fixed frame count.
///
/// Only one chunk plus one decoded packet is held in memory at a time.
pub struct ChunkedReader {
    track: OpenTrack,
    chunk_frames: usize,
    pending: Vec<f32>,
    exhausted: bool,
}

impl ChunkedReader {
    pub fn open(path: &Path, config: &ExtractorConfig) -> Result<Self, WaveformError> {
        let track = OpenTrack::open(path)?;
        let chunk_frames = config.chunk_frames(track.sample_rate);
        Ok(Self {
            track,
            chunk_frames,
            pending: Vec::with_capacity(chunk_frames),
            exhausted: false,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.track.sample_rate
    }

    pub fn chunk_frames(&self) -> usize {
        self.chunk_frames
    }

    /// Frame count declared by the container, if any.
    pub fn declared_frames(&self) -> Option<u64> {
        self.track.n_frames
    }

    /// Next chunk of mono samples. The final chunk may be short.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<f32>>, WaveformError> {
        while !self.exhausted && self.pending.len() < self.chunk_frames {
            match self.track.next_interleaved()? {
                Some((samples, channels)) => {
                    if channels == 1 {
                        self.pending.extend_from_slice(&samples);
                    } else {
                        self.pending.extend(downmix(&samples, channels));
                    }
                }
                None => self.exhausted = true,
            }
        }

        if self.pending.is_empty() {
            return Ok(None);
        }

        let take = self.pending.len().min(self.chunk_frames);
        let rest = self.pending.split_off(take);
        Ok(Some(std::mem::replace(&mut self.pending, rest)))
    }
}

/// Count frames by decoding the whole file without keeping samples.
///
/// Fallback for containers that do not declare a length up front.
pub fn count_frames(path: &Path) -> Result<u64, WaveformError> {
    let mut track = OpenTrack::open(path)?;
    let mut frames = 0u64;
    while let Some((samples, channels)) = track.next_interleaved()? {
        frames += (samples.len() / channels) as u64;
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_wav(dir: &Path, name: &str, channels: u16, rate: u32, frames: &[Vec<i16>]) -> PathBuf {
        let path = dir.join(name);
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for frame in frames {
            for &s in frame {
                writer.write_sample(s).unwrap();
            }
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn decode_file_reads_all_frames() {
        let dir = tempfile::tempdir().unwrap();
        let frames: Vec<Vec<i16>> = (0..4000).map(|i| vec![(i % 100) as i16, 0]).collect();
        let path = write_wav(dir.path(), "stereo.wav", 2, 8_000, &frames);

        let audio = decode_file(&path).unwrap();
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.sample_rate, 8_000);
        assert_eq!(audio.num_frames(), 4000);
        assert!((audio.duration - 0.5).abs() < 1e-9);
    }

    #[test]
    fn chunks_are_one_second_with_short_tail() {
        let dir = tempfile::tempdir().unwrap();
        let frames: Vec<Vec<i16>> = (0..20_500).map(|_| vec![1000]).collect();
        let path = write_wav(dir.path(), "mono.wav", 1, 8_000, &frames);

        let mut reader = ChunkedReader::open(&path, &ExtractorConfig::default()).unwrap();
        assert_eq!(reader.declared_frames(), Some(20_500));
        assert_eq!(reader.sample_rate(), 8_000);
        assert_eq!(reader.chunk_frames(), 8_000);

        let mut sizes = Vec::new();
        while let Some(chunk) = reader.next_chunk().unwrap() {
            sizes.push(chunk.len());
        }
        assert_eq!(sizes, vec![8_000, 8_000, 4_500]);
    }

    #[test]
    fn stereo_chunks_are_downmixed() {
        let dir = tempfile::tempdir().unwrap();
        let frames: Vec<Vec<i16>> = (0..100).map(|_| vec![16384, 0]).collect();
        let path = write_wav(dir.path(), "stereo.wav", 2, 8_000, &frames);

        let mut reader = ChunkedReader::open(&path, &ExtractorConfig::default()).unwrap();
        let chunk = reader.next_chunk().unwrap().unwrap();
        assert_eq!(chunk.len(), 100);
        assert!(chunk.iter().all(|&s| (s - 0.25).abs() < 1e-6));
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn count_frames_matches_declared_length() {
        let dir = tempfile::tempdir().unwrap();
        let frames: Vec<Vec<i16>> = (0..1234).map(|_| vec![0]).collect();
        let path = write_wav(dir.path(), "count.wav", 1, 8_000, &frames);
        assert_eq!(count_frames(&path).unwrap(), 1234);
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = decode_file(&dir.path().join("nope.wav")).unwrap_err();
        assert!(matches!(err, WaveformError::FileNotFound(_)));
    }

    #[test]
    fn garbage_is_invalid_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.wav");
        std::fs::write(&path, b"definitely not a riff header, just text").unwrap();
        let err = ChunkedReader::open(&path, &ExtractorConfig::default()).err().unwrap();
        assert!(matches!(err, WaveformError::InvalidFormat(_)));
    }
}
