//! Playback state machine for one audio resource at a time.
//!
//! A load runs two independent background jobs: waveform extraction and
//! session preparation. Only the latter decides the player state; extraction
//! failures fall back to placeholder bars. Every job and the progress tick is
//! tagged with the load generation it was started for and goes inert once a
//! newer `load` or a `reset` bumps the generation.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::audio::transport::{PlaybackBackend, Transport};
use crate::config::ControllerConfig;
use crate::error::SessionError;
use crate::session::PlaybackSession;
use crate::waveform::{
    placeholder_seed, AmplitudeSeries, ExtractionProgress, ExtractionStream, WaveformExtractor,
};

/// Lifecycle of the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerState {
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
    Error(String),
}

/// Change notifications published to subscribers.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    StateChanged {
        old: PlayerState,
        new: PlayerState,
    },
    PositionChanged {
        current_time: f64,
        duration: f64,
        progress: f64,
    },
    ExtractionProgress(f64),
    AmplitudesChanged(AmplitudeSeries),
}

const EVENT_CAPACITY: usize = 64;

struct ExtractionTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct ControllerState {
    player_state: PlayerState,
    session: Option<PlaybackSession>,
    amplitudes: AmplitudeSeries,
    extraction_progress: f64,
    generation: u64,
    extraction: Option<ExtractionTask>,
    preparation: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl ControllerState {
    fn new() -> Self {
        Self {
            player_state: PlayerState::Idle,
            session: None,
            amplitudes: AmplitudeSeries::default(),
            extraction_progress: 0.0,
            generation: 0,
            extraction: None,
            preparation: None,
            ticker: None,
        }
    }

    /// Stop background work and release the session.
    fn teardown(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        if let Some(task) = self.extraction.take() {
            task.cancel.cancel();
            task.handle.abort();
        }
        if let Some(prep) = self.preparation.take() {
            prep.abort();
        }
        if let Some(mut session) = self.session.take() {
            session.stop();
        }
    }

    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

struct Inner {
    backend: Arc<dyn PlaybackBackend>,
    extractor: WaveformExtractor,
    config: ControllerConfig,
    runtime: Handle,
    state: Mutex<ControllerState>,
    events: broadcast::Sender<PlayerEvent>,
}

impl Inner {
    fn emit(&self, event: PlayerEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn transition(&self, state: &mut ControllerState, new: PlayerState) {
        if state.player_state == new {
            return;
        }
        let old = std::mem::replace(&mut state.player_state, new.clone());
        tracing::debug!(?old, ?new, generation = state.generation, "player state changed");
        self.emit(PlayerEvent::StateChanged { old, new });
    }

    fn emit_position(&self, session: &PlaybackSession) {
        self.emit(PlayerEvent::PositionChanged {
            current_time: session.current_time(),
            duration: session.duration(),
            progress: session.progress(),
        });
    }

    fn set_amplitudes(&self, state: &mut ControllerState, series: AmplitudeSeries) {
        if state.amplitudes == series {
            return;
        }
        state.amplitudes = series.clone();
        self.emit(PlayerEvent::AmplitudesChanged(series));
    }

    fn start_ticker(inner: &Arc<Inner>, state: &mut ControllerState) {
        state.stop_ticker();
        let weak = Arc::downgrade(inner);
        let generation = state.generation;
        let period = inner.config.tick_interval;
        state.ticker = Some(inner.runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if !inner.on_tick(generation) {
                    break;
                }
            }
        }));
    }

    /// Refresh the clock from the transport. Returns false once the ticker
    /// should stop.
    fn on_tick(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation || state.player_state != PlayerState::Playing {
            return false;
        }
        let epsilon = self.config.end_epsilon;
        let Some(session) = state.session.as_mut().filter(|s| s.id == generation) else {
            return false;
        };

        session.sync_from_transport();
        let finished =
            !session.transport_playing() && session.current_time() >= session.duration() - epsilon;
        if !finished {
            self.emit_position(session);
            return true;
        }

        tracing::debug!(generation, "playback reached the end, rewinding");
        session.pause();
        session.seek_to_time(0.0);
        self.emit_position(session);
        // this task is the ticker; let it finish on its own
        state.ticker = None;
        self.transition(&mut state, PlayerState::Paused);
        false
    }

    fn apply_extraction_progress(&self, generation: u64, fraction: f64) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        state.extraction_progress = fraction;
        self.emit(PlayerEvent::ExtractionProgress(fraction));
    }

    fn apply_partial_amplitudes(&self, generation: u64, series: AmplitudeSeries) {
        let mut state = self.state.lock();
        if state.generation != generation || state.extraction.is_none() {
            return;
        }
        self.set_amplitudes(&mut state, series);
    }

    fn finish_extraction(&self, generation: u64, series: AmplitudeSeries) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        state.extraction = None;
        state.extraction_progress = 1.0;
        self.emit(PlayerEvent::ExtractionProgress(1.0));
        self.set_amplitudes(&mut state, series);
    }

    fn finish_preparation(
        &self,
        generation: u64,
        result: Result<Box<dyn Transport>, SessionError>,
    ) {
        let mut state = self.state.lock();
        if state.generation != generation || state.player_state != PlayerState::Loading {
            tracing::debug!(generation, "discarding superseded session");
            if let Ok(mut transport) = result {
                transport.stop();
            }
            return;
        }
        state.preparation = None;

        match result {
            Ok(transport) => {
                let session = PlaybackSession::new(generation, transport);
                tracing::info!(generation, duration = session.duration(), "session ready");
                self.emit_position(&session);
                state.session = Some(session);
                self.transition(&mut state, PlayerState::Ready);
            }
            Err(e) => {
                tracing::warn!(generation, "session preparation failed: {e}");
                self.transition(&mut state, PlayerState::Error(e.to_string()));
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.state.get_mut().teardown();
    }
}

async fn consume_extraction(
    inner: Weak<Inner>,
    generation: u64,
    bar_count: usize,
    path: PathBuf,
    mut stream: ExtractionStream,
) {
    while let Some(item) = stream.next().await {
        let Some(owner) = inner.upgrade() else { return };
        match item {
            Ok(ExtractionProgress::InProgress(fraction)) => {
                owner.apply_extraction_progress(generation, fraction);
            }
            Ok(ExtractionProgress::Partial(series)) => {
                owner.apply_partial_amplitudes(generation, series);
            }
            Ok(ExtractionProgress::Completed(series)) => {
                owner.finish_extraction(generation, series);
                return;
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    "waveform extraction failed, using placeholder: {e}"
                );
                let placeholder = AmplitudeSeries::placeholder(bar_count, placeholder_seed(&path));
                owner.finish_extraction(generation, placeholder);
                return;
            }
        }
    }
}

/// Drives playback of one resource and keeps its waveform in sync.
///
/// Cheap to clone; clones share the same session. Commands take effect before
/// they return and never fail; calls that make no sense in the current state
/// are ignored.
#[derive(Clone)]
pub struct PlaybackController {
    inner: Arc<Inner>,
}

impl PlaybackController {
    /// Background jobs are spawned on `runtime`.
    pub fn new(backend: Arc<dyn PlaybackBackend>, config: ControllerConfig, runtime: Handle) -> Self {
        Self::with_extractor(backend, WaveformExtractor::default(), config, runtime)
    }

    pub fn with_extractor(
        backend: Arc<dyn PlaybackBackend>,
        extractor: WaveformExtractor,
        config: ControllerConfig,
        runtime: Handle,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                backend,
                extractor,
                config,
                runtime,
                state: Mutex::new(ControllerState::new()),
                events,
            }),
        }
    }

    /// Subscribe to state, position and waveform changes.
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> PlayerState {
        self.inner.state.lock().player_state.clone()
    }

    pub fn current_time(&self) -> f64 {
        let state = self.inner.state.lock();
        state.session.as_ref().map_or(0.0, |s| s.current_time())
    }

    pub fn duration(&self) -> f64 {
        let state = self.inner.state.lock();
        state.session.as_ref().map_or(0.0, |s| s.duration())
    }

    pub fn progress(&self) -> f64 {
        let state = self.inner.state.lock();
        state.session.as_ref().map_or(0.0, |s| s.progress())
    }

    /// Current bars; zeros of the requested length while extraction runs.
    pub fn amplitudes(&self) -> AmplitudeSeries {
        self.inner.state.lock().amplitudes.clone()
    }

    pub fn extraction_progress(&self) -> f64 {
        self.inner.state.lock().extraction_progress
    }

    /// Replace whatever is loaded with `resource`.
    ///
    /// Returns once both background jobs are running; completion is observed
    /// through [`state`](Self::state) or [`subscribe`](Self::subscribe).
    pub fn load(&self, resource: impl AsRef<Path>) {
        let inner = &self.inner;
        let path = resource.as_ref().to_path_buf();
        let bar_count = inner.config.bar_count.max(1);

        let mut state = inner.state.lock();
        state.teardown();
        state.generation += 1;
        let generation = state.generation;
        state.extraction_progress = 0.0;
        inner.set_amplitudes(&mut state, AmplitudeSeries::zeros(bar_count));
        inner.transition(&mut state, PlayerState::Loading);
        tracing::info!(path = %path.display(), generation, "loading");

        let _guard = inner.runtime.enter();

        let stream = inner.extractor.stream(&path, bar_count);
        let cancel = stream.cancellation_token();
        let handle = inner.runtime.spawn(consume_extraction(
            Arc::downgrade(inner),
            generation,
            bar_count,
            path.clone(),
            stream,
        ));
        state.extraction = Some(ExtractionTask { cancel, handle });

        let weak = Arc::downgrade(inner);
        let backend = inner.backend.clone();
        state.preparation = Some(inner.runtime.spawn(async move {
            let result = tokio::task::spawn_blocking(move || backend.open(&path))
                .await
                .unwrap_or_else(|e| {
                    Err(SessionError::SetupFailure(format!(
                        "session preparation aborted: {e}"
                    )))
                });
            if let Some(inner) = weak.upgrade() {
                inner.finish_preparation(generation, result);
            }
        }));
    }

    /// Start playback from `Ready` or `Paused`.
    pub fn play(&self) {
        let mut state = self.inner.state.lock();
        if !matches!(state.player_state, PlayerState::Ready | PlayerState::Paused) {
            tracing::debug!(state = ?state.player_state, "ignoring play");
            return;
        }
        let Some(session) = state.session.as_mut() else {
            return;
        };
        session.play();
        Inner::start_ticker(&self.inner, &mut state);
        self.inner.transition(&mut state, PlayerState::Playing);
    }

    /// Pause playback from `Playing`.
    pub fn pause(&self) {
        let mut state = self.inner.state.lock();
        if state.player_state != PlayerState::Playing {
            tracing::debug!(state = ?state.player_state, "ignoring pause");
            return;
        }
        state.stop_ticker();
        if let Some(session) = state.session.as_mut() {
            session.pause();
            session.sync_from_transport();
            self.inner.emit_position(session);
        }
        self.inner.transition(&mut state, PlayerState::Paused);
    }

    pub fn toggle_play_pause(&self) {
        if self.state() == PlayerState::Playing {
            self.pause();
        } else {
            self.play();
        }
    }

    /// Seek to a fraction of the duration.
    pub fn seek_to_progress(&self, progress: f64) {
        self.seek_with(|session| session.seek_to_progress(progress));
    }

    /// Seek to an absolute time in seconds.
    pub fn seek_to_time(&self, seconds: f64) {
        self.seek_with(|session| session.seek_to_time(seconds));
    }

    pub fn skip_forward(&self, seconds: f64) {
        self.seek_with(|session| session.seek_to_time(session.current_time() + seconds));
    }

    pub fn skip_backward(&self, seconds: f64) {
        self.seek_with(|session| session.seek_to_time(session.current_time() - seconds));
    }

    /// Skip forward by the configured offset.
    pub fn skip_forward_default(&self) {
        self.skip_forward(self.inner.config.skip_seconds);
    }

    /// Skip backward by the configured offset.
    pub fn skip_backward_default(&self) {
        self.skip_backward(self.inner.config.skip_seconds);
    }

    fn seek_with(&self, f: impl FnOnce(&mut PlaybackSession)) {
        let mut state = self.inner.state.lock();
        let Some(session) = state.session.as_mut() else {
            return;
        };
        f(session);
        self.inner.emit_position(session);
    }

    /// Drop the session and return to `Idle`. Safe in any state.
    pub fn reset(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        state.teardown();
        // late results from the old load must not land
        state.generation += 1;
        state.extraction_progress = 0.0;
        inner.set_amplitudes(&mut state, AmplitudeSeries::default());
        inner.transition(&mut state, PlayerState::Idle);
    }
}
