//! Peak-amplitude waveform extraction.
//!
//! Files are streamed one chunk at a time; each bar keeps the largest absolute
//! sample seen in its frame range, and the finished series is normalized
//! against the global peak.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::decoder::{count_frames, ChunkedReader};
use crate::config::ExtractorConfig;
use crate::error::WaveformError;

/// Normalized peak values in `[0.0, 1.0]`, one per bar.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AmplitudeSeries(Vec<f32>);

impl AmplitudeSeries {
    /// A series of `bar_count` zeros.
    pub fn zeros(bar_count: usize) -> Self {
        Self(vec![0.0; bar_count])
    }

    /// Deterministic pseudo-random bars used when extraction fails.
    ///
    /// Values fall in `[0.1, 1.0]`; the exact sequence is not part of the API.
    pub fn placeholder(bar_count: usize, seed: u64) -> Self {
        // xorshift64 needs a non-zero state
        let mut x = seed | 1;
        let bars = (0..bar_count)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                let unit = (x >> 40) as f32 / (1u64 << 24) as f32;
                0.1 + unit * 0.9
            })
            .collect();
        Self(bars)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.0
    }

    /// Bar under a playback fraction, tolerating an empty series.
    pub fn bar_at(&self, progress: f64) -> Option<usize> {
        if self.0.is_empty() || !progress.is_finite() {
            return None;
        }
        let last = self.0.len() - 1;
        let idx = (progress.clamp(0.0, 1.0) * self.0.len() as f64) as usize;
        Some(idx.min(last))
    }
}

/// One item of an asynchronous extraction.
#[derive(Clone, Debug, PartialEq)]
pub enum ExtractionProgress {
    /// Fraction of frames processed so far.
    InProgress(f64),
    /// Bars filled so far, normalized against the peak seen so far.
    Partial(AmplitudeSeries),
    Completed(AmplitudeSeries),
}

/// Running per-bar maxima.
struct PeakAccumulator {
    peaks: Vec<f32>,
    samples_per_bar: u64,
    frames_seen: u64,
}

impl PeakAccumulator {
    fn new(total_frames: u64, bar_count: usize) -> Self {
        Self {
            peaks: vec![0.0; bar_count],
            samples_per_bar: (total_frames / bar_count as u64).max(1),
            frames_seen: 0,
        }
    }

    fn push(&mut self, chunk: &[f32]) {
        let last_bar = self.peaks.len() - 1;
        let mut offset = 0usize;

        while offset < chunk.len() {
            let frame = self.frames_seen + offset as u64;
            let bar = ((frame / self.samples_per_bar) as usize).min(last_bar);
            let remaining = chunk.len() - offset;
            // the last bar absorbs everything past the even split
            let seg_len = if bar == last_bar {
                remaining
            } else {
                let bar_end = (bar as u64 + 1) * self.samples_per_bar;
                ((bar_end - frame) as usize).min(remaining)
            };

            let seg_peak = chunk[offset..offset + seg_len]
                .iter()
                .fold(0.0f32, |acc, s| acc.max(s.abs()));
            let peak = &mut self.peaks[bar];
            *peak = peak.max(seg_peak);

            offset += seg_len;
        }

        self.frames_seen += chunk.len() as u64;
    }

    fn snapshot(&self) -> AmplitudeSeries {
        normalize(self.peaks.clone())
    }

    fn finish(self) -> AmplitudeSeries {
        normalize(self.peaks)
    }
}

fn normalize(peaks: Vec<f32>) -> AmplitudeSeries {
    let max = peaks.iter().fold(0.0f32, |acc, &p| acc.max(p));
    if max <= 0.0 {
        return AmplitudeSeries(peaks);
    }
    AmplitudeSeries(peaks.into_iter().map(|p| (p / max).min(1.0)).collect())
}

/// A single pass over one file.
struct PeakScan {
    reader: ChunkedReader,
    peaks: PeakAccumulator,
    total_frames: u64,
    chunks: usize,
}

impl PeakScan {
    fn open(path: &Path, bar_count: usize, config: &ExtractorConfig) -> Result<Self, WaveformError> {
        if bar_count == 0 {
            return Err(WaveformError::InvalidBarCount);
        }
        let reader = ChunkedReader::open(path, config)?;
        let total_frames = match reader.declared_frames() {
            Some(n) => n,
            None => {
                tracing::debug!(path = %path.display(), "container has no frame count, counting");
                count_frames(path)?
            }
        };
        Ok(Self {
            reader,
            peaks: PeakAccumulator::new(total_frames, bar_count),
            total_frames,
            chunks: 0,
        })
    }

    /// Process one chunk. Returns the progress fraction, or `None` when done.
    fn step(&mut self) -> Result<Option<f64>, WaveformError> {
        let Some(chunk) = self.reader.next_chunk()? else {
            return Ok(None);
        };
        self.peaks.push(&chunk);
        self.chunks += 1;
        let fraction = if self.total_frames == 0 {
            1.0
        } else {
            (self.peaks.frames_seen as f64 / self.total_frames as f64).min(1.0)
        };
        Ok(Some(fraction))
    }

    /// Partial bars if a snapshot is due after the chunk just processed.
    fn due_snapshot(&self, every: usize) -> Option<AmplitudeSeries> {
        if every == 0 || self.chunks % every != 0 {
            return None;
        }
        Some(self.peaks.snapshot())
    }

    fn finish(self) -> AmplitudeSeries {
        self.peaks.finish()
    }
}

/// Produces amplitude series from audio files.
#[derive(Clone, Debug, Default)]
pub struct WaveformExtractor {
    config: ExtractorConfig,
}

impl WaveformExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self { config }
    }

    /// Extract `bar_count` normalized peaks, blocking until the file is read.
    pub fn generate(&self, path: &Path, bar_count: usize) -> Result<AmplitudeSeries, WaveformError> {
        let mut scan = PeakScan::open(path, bar_count, &self.config)?;
        while scan.step()?.is_some() {}
        Ok(scan.finish())
    }

    /// Extract on the blocking pool, reporting progress after every chunk and
    /// partial bars every [`ExtractorConfig::snapshot_every`] chunks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn stream(&self, path: &Path, bar_count: usize) -> ExtractionStream {
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let config = self.config.clone();
        let path: PathBuf = path.to_path_buf();

        let worker = tokio::task::spawn_blocking(move || {
            let mut scan = match PeakScan::open(&path, bar_count, &config) {
                Ok(scan) => scan,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    return;
                }
            };

            loop {
                if worker_cancel.is_cancelled() {
                    tracing::debug!(path = %path.display(), "waveform extraction cancelled");
                    return;
                }
                match scan.step() {
                    Ok(Some(fraction)) => {
                        if tx
                            .blocking_send(Ok(ExtractionProgress::InProgress(fraction)))
                            .is_err()
                        {
                            return;
                        }
                        if let Some(partial) = scan.due_snapshot(config.snapshot_every) {
                            if tx
                                .blocking_send(Ok(ExtractionProgress::Partial(partial)))
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e));
                        return;
                    }
                }
            }

            if !worker_cancel.is_cancelled() {
                let _ = tx.blocking_send(Ok(ExtractionProgress::Completed(scan.finish())));
            }
        });

        ExtractionStream {
            rx,
            cancel,
            worker: Some(worker),
        }
    }
}

/// Seed for [`AmplitudeSeries::placeholder`] derived from a resource path.
pub fn placeholder_seed(path: &Path) -> u64 {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish()
}

/// Receiving side of [`WaveformExtractor::stream`].
///
/// Dropping the stream cancels the extraction.
pub struct ExtractionStream {
    rx: mpsc::Receiver<Result<ExtractionProgress, WaveformError>>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl ExtractionStream {
    /// Next progress item. `None` after completion, failure or cancellation.
    pub async fn next(&mut self) -> Option<Result<ExtractionProgress, WaveformError>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    /// Stop the extraction at the next chunk boundary.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.rx.close();
    }

    /// Token that cancels this stream from another task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Discard anything still buffered and wait for the worker to exit.
    pub async fn wait(mut self) {
        while self.rx.recv().await.is_some() {}
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl Drop for ExtractionStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
