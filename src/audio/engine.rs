use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use super::decoder;
use super::resample;
use super::transport::{PlaybackBackend, Transport};
use super::types::{AudioCommand, AudioData};
use crate::error::SessionError;

/// State published by the output callback for lock-free reads.
#[derive(Debug, Default)]
struct EngineShared {
    /// Current frame.
    position: AtomicU64,
    playing: AtomicBool,
    /// Bumped by every transport seek. A callback that started before the
    /// bump leaves `position` alone.
    seek_epoch: AtomicU64,
}

struct EngineState {
    /// Already at the device rate.
    audio: Arc<AudioData>,
    position: usize,
    playing: bool,
    shared: Arc<EngineShared>,
}

impl EngineState {
    fn new(audio: Arc<AudioData>, shared: Arc<EngineShared>) -> Self {
        Self {
            audio,
            position: 0,
            playing: false,
            shared,
        }
    }

    fn handle_command(&mut self, cmd: AudioCommand) {
        match cmd {
            AudioCommand::Play => self.playing = true,
            AudioCommand::Pause => self.playing = false,
            AudioCommand::Stop => {
                self.playing = false;
                self.position = 0;
            }
            AudioCommand::Seek(time) => {
                let frame = (time.max(0.0) * self.audio.sample_rate as f64) as usize;
                self.position = frame.min(self.audio.num_frames());
            }
        }
    }

    fn seek_epoch(&self) -> u64 {
        self.shared.seek_epoch.load(Ordering::Acquire)
    }

    /// Publish state read at the start of a callback that observed `epoch`.
    fn publish(&self, epoch: u64) {
        if self.seek_epoch() == epoch {
            self.shared
                .position
                .store(self.position as u64, Ordering::Relaxed);
        }
        self.shared.playing.store(self.playing, Ordering::Relaxed);
    }

    fn fill_buffer(&mut self, output: &mut [f32], channels: u16) {
        if !self.playing {
            output.fill(0.0);
            return;
        }

        let audio_channels = self.audio.channels as usize;
        let out_channels = channels as usize;
        let total_frames = self.audio.num_frames();
        if audio_channels == 0 || out_channels == 0 {
            output.fill(0.0);
            return;
        }

        for frame in output.chunks_mut(out_channels) {
            if self.position >= total_frames {
                self.playing = false;
                frame.fill(0.0);
                continue;
            }
            let src = &self.audio.samples[self.position * audio_channels..][..audio_channels];
            for (c, out) in frame.iter_mut().enumerate() {
                *out = src[c % audio_channels];
            }
            self.position += 1;
        }
    }

    /// One output callback: apply pending commands, then render.
    fn render(&mut self, cmd_rx: &Receiver<AudioCommand>, output: &mut [f32], channels: u16) {
        let epoch = self.seek_epoch();
        while let Ok(cmd) = cmd_rx.try_recv() {
            self.handle_command(cmd);
        }
        self.fill_buffer(output, channels);
        self.publish(epoch);
    }
}

/// Handle to an output stream running on its own thread.
///
/// Dropping the handle closes the shutdown channel, which ends the thread and
/// the stream with it.
struct EngineHandle {
    cmd_tx: Sender<AudioCommand>,
    shared: Arc<EngineShared>,
    _shutdown: Sender<()>,
}

impl EngineHandle {
    fn send(&self, cmd: AudioCommand) {
        if let Err(e) = self.cmd_tx.try_send(cmd) {
            tracing::warn!("dropping audio command {cmd:?}: {e}");
        }
    }
}

fn default_output() -> Result<(cpal::Device, cpal::SupportedStreamConfig), SessionError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| SessionError::SetupFailure("no audio output device found".into()))?;

    let config = device
        .default_output_config()
        .map_err(|e| SessionError::SetupFailure(format!("failed to get output config: {e}")))?;
    Ok((device, config))
}

/// Sample rate of the default output device.
fn output_sample_rate() -> Result<u32, SessionError> {
    let (_, config) = default_output()?;
    Ok(config.sample_rate())
}

fn build_stream(
    audio: Arc<AudioData>,
    cmd_rx: Receiver<AudioCommand>,
    shared: Arc<EngineShared>,
) -> Result<cpal::Stream, SessionError> {
    let (device, config) = default_output()?;

    let channels = config.channels();
    let sample_format = config.sample_format();
    if config.sample_rate() != audio.sample_rate {
        tracing::warn!(
            device_rate = config.sample_rate(),
            audio_rate = audio.sample_rate,
            "output rate changed since the audio was resampled"
        );
    }
    let mut stream_config: cpal::StreamConfig = config.into();
    stream_config.sample_rate = audio.sample_rate;

    let mut state = EngineState::new(audio, shared);

    let stream = match sample_format {
        cpal::SampleFormat::F32 => device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    state.render(&cmd_rx, data, channels);
                },
                |err| {
                    tracing::error!("audio stream error: {err}");
                },
                None,
            )
            .map_err(|e| SessionError::SetupFailure(format!("failed to build output stream: {e}")))?,
        _ => {
            return Err(SessionError::SetupFailure(format!(
                "unsupported sample format: {sample_format:?}"
            )))
        }
    };

    stream
        .play()
        .map_err(|e| SessionError::SetupFailure(format!("failed to start stream: {e}")))?;

    Ok(stream)
}

/// Spawn the output thread for `audio` and wait until its stream is running.
fn spawn_engine(audio: Arc<AudioData>) -> Result<EngineHandle, SessionError> {
    let (cmd_tx, cmd_rx) = crossbeam_channel::bounded::<AudioCommand>(64);
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), SessionError>>(1);
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    let shared = Arc::new(EngineShared::default());
    let thread_shared = shared.clone();

    // The stream is created and dropped on this thread since cpal streams are
    // not Send on every platform.
    std::thread::Builder::new()
        .name("audio-output".into())
        .spawn(move || {
            let stream = match build_stream(audio, cmd_rx, thread_shared) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            // Blocks until the handle is dropped.
            let _ = shutdown_rx.recv();
            drop(stream);
            tracing::debug!("audio output thread exiting");
        })
        .map_err(|e| SessionError::SetupFailure(format!("failed to spawn audio thread: {e}")))?;

    ready_rx
        .recv()
        .map_err(|_| SessionError::SetupFailure("audio thread exited during setup".into()))??;

    Ok(EngineHandle {
        cmd_tx,
        shared,
        _shutdown: shutdown_tx,
    })
}

/// Transport that plays decoded audio through the default output device.
pub struct CpalTransport {
    engine: EngineHandle,
    sample_rate: u32,
    duration: f64,
}

impl Transport for CpalTransport {
    fn duration(&self) -> f64 {
        self.duration
    }

    fn position(&self) -> f64 {
        let frame = self.engine.shared.position.load(Ordering::Relaxed);
        frame as f64 / self.sample_rate as f64
    }

    fn is_playing(&self) -> bool {
        self.engine.shared.playing.load(Ordering::Relaxed)
    }

    fn play(&mut self) {
        self.engine.shared.playing.store(true, Ordering::Relaxed);
        self.engine.send(AudioCommand::Play);
    }

    fn pause(&mut self) {
        self.engine.shared.playing.store(false, Ordering::Relaxed);
        self.engine.send(AudioCommand::Pause);
    }

    fn seek(&mut self, seconds: f64) {
        let frame = (seconds.max(0.0) * self.sample_rate as f64) as u64;
        let shared = &self.engine.shared;
        shared.seek_epoch.fetch_add(1, Ordering::AcqRel);
        shared.position.store(frame, Ordering::Relaxed);
        self.engine.send(AudioCommand::Seek(seconds));
    }

    fn stop(&mut self) {
        let shared = &self.engine.shared;
        shared.playing.store(false, Ordering::Relaxed);
        shared.seek_epoch.fetch_add(1, Ordering::AcqRel);
        shared.position.store(0, Ordering::Relaxed);
        self.engine.send(AudioCommand::Stop);
    }
}

/// Backend that decodes the whole file into memory, converts it to the device
/// rate and plays it with cpal.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl PlaybackBackend for CpalBackend {
    fn open(&self, resource: &Path) -> Result<Box<dyn Transport>, SessionError> {
        let audio = decoder::decode_file(resource)?;
        let duration = audio.duration;
        tracing::info!(
            path = %resource.display(),
            sample_rate = audio.sample_rate,
            channels = audio.channels,
            duration,
            "decoded audio for playback"
        );
        let audio = resample::resample(audio, output_sample_rate()?)?;
        let sample_rate = audio.sample_rate;
        let engine = spawn_engine(Arc::new(audio))?;
        Ok(Box::new(CpalTransport {
            engine,
            sample_rate,
            duration,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Arc<AudioData> {
        let frames = samples.len() / channels as usize;
        Arc::new(AudioData {
            samples,
            sample_rate,
            channels,
            duration: frames as f64 / sample_rate as f64,
        })
    }

    fn engine(samples: Vec<f32>, channels: u16) -> (EngineState, Arc<EngineShared>) {
        let shared = Arc::new(EngineShared::default());
        let state = EngineState::new(audio(samples, channels, 8), shared.clone());
        (state, shared)
    }

    #[test]
    fn paused_engine_outputs_silence() {
        let (mut state, _shared) = engine(vec![0.5; 8], 1);
        let (_tx, rx) = crossbeam_channel::unbounded();
        let mut out = vec![1.0; 4];
        state.render(&rx, &mut out, 1);
        assert_eq!(out, vec![0.0; 4]);
    }

    #[test]
    fn mono_source_fans_out_to_stereo() {
        let (mut state, shared) = engine(vec![0.1, 0.2, 0.3], 1);
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(AudioCommand::Play).unwrap();

        let mut out = vec![0.0; 4];
        state.render(&rx, &mut out, 2);
        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2]);
        assert_eq!(shared.position.load(Ordering::Relaxed), 2);
        assert!(shared.playing.load(Ordering::Relaxed));
    }

    #[test]
    fn stereo_source_folds_onto_mono_device() {
        let (mut state, _shared) = engine(vec![0.1, 0.9, 0.2, 0.8], 2);
        state.handle_command(AudioCommand::Play);
        let mut out = vec![0.0; 2];
        state.fill_buffer(&mut out, 1);
        assert_eq!(out, vec![0.1, 0.2]);
    }

    #[test]
    fn reaching_the_end_stops_playback() {
        let (mut state, shared) = engine(vec![0.4, 0.4], 1);
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(AudioCommand::Play).unwrap();

        let mut out = vec![1.0; 4];
        state.render(&rx, &mut out, 1);
        assert_eq!(out, vec![0.4, 0.4, 0.0, 0.0]);
        assert!(!shared.playing.load(Ordering::Relaxed));
        assert_eq!(shared.position.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn seek_is_clamped_to_length() {
        let (mut state, shared) = engine(vec![0.0; 16], 1);
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut out = vec![0.0; 1];

        tx.send(AudioCommand::Seek(1.0)).unwrap();
        state.render(&rx, &mut out, 1);
        assert_eq!(shared.position.load(Ordering::Relaxed), 8);

        tx.send(AudioCommand::Seek(100.0)).unwrap();
        state.render(&rx, &mut out, 1);
        assert_eq!(shared.position.load(Ordering::Relaxed), 16);

        tx.send(AudioCommand::Stop).unwrap();
        state.render(&rx, &mut out, 1);
        assert_eq!(shared.position.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn callback_does_not_clobber_a_newer_seek() {
        let (mut state, shared) = engine(vec![0.0; 16], 1);
        state.handle_command(AudioCommand::Play);

        // a callback is mid-render when the transport seeks
        let epoch = state.seek_epoch();
        let mut out = vec![0.0; 2];
        state.fill_buffer(&mut out, 1);
        shared.seek_epoch.fetch_add(1, Ordering::AcqRel);
        shared.position.store(12, Ordering::Relaxed);
        state.publish(epoch);
        assert_eq!(shared.position.load(Ordering::Relaxed), 12);

        // the next callback applies the queued seek and publishes again
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(AudioCommand::Seek(1.5)).unwrap();
        state.render(&rx, &mut out, 1);
        assert_eq!(shared.position.load(Ordering::Relaxed), 14);
    }
}
