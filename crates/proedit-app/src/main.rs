//! ProEdit Play - headless playback driver
//!
//! Plays a synthetic two-track session through the full pipeline and prints
//! the final pipeline stats as JSON.
//!
//! Usage: `proedit-play [config.json] [seconds]`

use anyhow::{Context, Result};
use proedit_core::{DecodedImage, FrameRate};
use proedit_playback::{
    Clip, DecodeWorkerPool, PlaybackConfig, PlaybackOrchestrator, PlaybackState,
    PresentationSink, SourceRef, TestPatternCompositor, TestPatternDecoder,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Counts what the pipeline hands to the display.
#[derive(Default)]
struct CountingSink {
    frames: AtomicU64,
    ended: Notify,
}

impl PresentationSink for CountingSink {
    fn on_frame(&self, image: &DecodedImage, timestamp: f64) {
        let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 30 == 0 {
            info!(
                timestamp,
                width = image.width(),
                height = image.height(),
                "Presented {} frames",
                n
            );
        }
    }

    fn on_state_change(&self, state: PlaybackState) {
        info!(?state, "State");
    }

    fn on_ended(&self) {
        self.ended.notify_one();
    }
}

fn load_config(path: Option<PathBuf>) -> Result<PlaybackConfig> {
    let Some(path) = path else {
        let mut config = PlaybackConfig::default();
        config.output_width = 640;
        config.output_height = 360;
        return Ok(config);
    };
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("reading config {}", path.display()))?;
    Ok(PlaybackConfig::from_json(&json)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut args = std::env::args().skip(1);
    let config = load_config(args.next().map(PathBuf::from))?;
    let seconds: f64 = match args.next() {
        Some(s) => s.parse().with_context(|| format!("invalid duration {s:?}"))?,
        None => 3.0,
    };

    info!("ProEdit Play starting...");
    let rate = config.clock.frame_rate;
    let decoder = TestPatternDecoder::new(rate).with_latency(Duration::from_millis(4));
    let pool = DecodeWorkerPool::initialize(config.pool.clone(), Arc::new(decoder)).await?;

    let sink = Arc::new(CountingSink::default());
    let player = PlaybackOrchestrator::new(config, Arc::new(pool), sink.clone())
        .with_compositor(Arc::new(TestPatternCompositor::new(rate)));

    let clips = vec![
        Clip::new(SourceRef::new("synthetic://background"), 0, 0.0, 0.0, seconds),
        Clip::new(SourceRef::new("synthetic://overlay"), 1, seconds / 3.0, 2.0, seconds / 3.0),
    ];
    if let Some(clip) = clips.get(1) {
        player.preload(clip, clip.start_time, clip.end_time(), 1)?;
    }

    player.play(&clips, 0.0).await?;
    // Jump back to the start of the overlay once, halfway through
    tokio::time::sleep(Duration::from_secs_f64(seconds / 2.0)).await;
    player.seek(seconds / 3.0, &clips).await?;

    let deadline = Duration::from_secs_f64(seconds * 2.0 + 2.0);
    if tokio::time::timeout(deadline, sink.ended.notified()).await.is_err() {
        warn!("Playback did not finish within {:?}", deadline);
    }

    let stats = player.stats();
    info!(
        frames = sink.frames.load(Ordering::Relaxed),
        hit_rate = stats.cache.hit_rate,
        dropped = stats.buffers.total_dropped(),
        "Session finished"
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);

    player.dispose();
    Ok(())
}
