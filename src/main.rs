//! `wavescrub`: print the waveform of an audio file and optionally play it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use wavescrub::{
    AmplitudeSeries, ControllerConfig, CpalBackend, PlaybackController, PlayerEvent, PlayerState,
    WaveformExtractor,
};

#[derive(Parser, Debug)]
#[command(name = "wavescrub", version)]
struct Args {
    /// Audio file to analyse
    path: PathBuf,

    /// Number of waveform bars
    #[arg(long, default_value_t = 64)]
    bars: usize,

    /// Play the file through the default output device
    #[arg(long)]
    play: bool,
}

const LEVELS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

fn render(series: &AmplitudeSeries) -> String {
    series
        .as_slice()
        .iter()
        .map(|&v| {
            let idx = (v.clamp(0.0, 1.0) * (LEVELS.len() - 1) as f32).round() as usize;
            LEVELS[idx]
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,wavescrub=info")),
        )
        .init();

    if args.bars == 0 {
        bail!("--bars must be greater than zero");
    }

    if args.play {
        play(&args.path, args.bars).await
    } else {
        let path = args.path.clone();
        let bars = args.bars;
        let series = tokio::task::spawn_blocking(move || {
            WaveformExtractor::default().generate(&path, bars)
        })
        .await?
        .with_context(|| format!("extract waveform from {}", args.path.display()))?;
        println!("{}", render(&series));
        Ok(())
    }
}

async fn play(path: &Path, bars: usize) -> Result<()> {
    let config = ControllerConfig {
        bar_count: bars,
        ..ControllerConfig::default()
    };
    let controller = PlaybackController::new(
        Arc::new(CpalBackend),
        config,
        tokio::runtime::Handle::current(),
    );
    let mut events = controller.subscribe();
    controller.load(path);

    let mut last_second = None;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "event receiver lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            PlayerEvent::StateChanged { old, new } => match new {
                PlayerState::Ready => {
                    tracing::info!(duration = controller.duration(), "ready, starting playback");
                    controller.play();
                }
                PlayerState::Paused if old == PlayerState::Playing => {
                    tracing::info!("playback finished");
                    break;
                }
                PlayerState::Error(message) => bail!("cannot play {}: {message}", path.display()),
                _ => {}
            },
            PlayerEvent::AmplitudesChanged(series) if controller.extraction_progress() >= 1.0 => {
                println!("{}", render(&series));
            }
            PlayerEvent::PositionChanged {
                current_time,
                duration,
                ..
            } => {
                let second = current_time as u64;
                if last_second != Some(second) {
                    last_second = Some(second);
                    tracing::info!("{:>4}s / {:.0}s", second, duration);
                }
            }
            _ => {}
        }
    }

    controller.reset();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_maps_extremes() {
        let series = AmplitudeSeries::placeholder(0, 1);
        assert_eq!(render(&series), "");

        let silent = AmplitudeSeries::zeros(3);
        assert_eq!(render(&silent), "▁▁▁");
    }

    #[test]
    fn args_parse_defaults() {
        let args = Args::try_parse_from(["wavescrub", "song.flac"]).unwrap();
        assert_eq!(args.bars, 64);
        assert!(!args.play);
        assert_eq!(args.path, PathBuf::from("song.flac"));
    }
}
