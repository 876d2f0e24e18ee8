//! Integration tests for full playback sessions.
//!
//! Drives the orchestrator over a real decode pool with synthetic sources
//! and checks what a presentation surface would receive.

use parking_lot::Mutex;
use proedit_core::{DecodedImage, FrameRate, ProEditError};
use proedit_playback::{
    Clip, DecodeWorkerPool, PlaybackConfig, PlaybackOrchestrator, PlaybackState, PlaybackStats,
    PresentationSink, SourceRef, TestPatternCompositor, TestPatternDecoder,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ── Helpers ────────────────────────────────────────────────────

#[derive(Default)]
struct Surface {
    /// Presented timestamp and the pattern seed of the image shown.
    frames: Mutex<Vec<(f64, u64)>>,
    states: Mutex<Vec<PlaybackState>>,
    ended: AtomicBool,
}

impl Surface {
    fn timestamps(&self) -> Vec<f64> {
        self.frames.lock().iter().map(|(t, _)| *t).collect()
    }
}

impl PresentationSink for Surface {
    fn on_frame(&self, image: &DecodedImage, timestamp: f64) {
        self.frames.lock().push((timestamp, seed_of(image)));
    }

    fn on_state_change(&self, state: PlaybackState) {
        self.states.lock().push(state);
    }

    fn on_ended(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

/// Recover the seed a test pattern was painted with from its marker pixel.
fn seed_of(image: &DecodedImage) -> u64 {
    image
        .buffer()
        .pixels(0)
        .iter()
        .find(|px| px[2] == 128)
        .map_or(u64::MAX, |px| px[0] as u64 | (px[1] as u64) << 8)
}

fn config() -> PlaybackConfig {
    let mut config = PlaybackConfig::default();
    config.output_width = 64;
    config.output_height = 4;
    config.pool.worker_count = 2;
    config.buffer.fill_timeout_ms = 1_000;
    config
}

async fn player(decoder: TestPatternDecoder) -> (Arc<PlaybackOrchestrator>, Arc<Surface>) {
    let config = config();
    let pool = DecodeWorkerPool::initialize(config.pool.clone(), Arc::new(decoder))
        .await
        .unwrap();
    let surface = Arc::new(Surface::default());
    let player = PlaybackOrchestrator::new(config, Arc::new(pool), surface.clone());
    (Arc::new(player), surface)
}

fn decoder() -> TestPatternDecoder {
    TestPatternDecoder::new(FrameRate::FPS_30)
}

fn clip(uri: &str, track: usize, start: f64, duration: f64) -> Clip {
    Clip::new(SourceRef::new(uri), track, start, 0.0, duration)
}

async fn wait_until(check: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn strictly_increasing(times: &[f64]) -> bool {
    times.windows(2).all(|w| w[0] < w[1])
}

// ── Sessions ───────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_track_session_runs_to_the_end() {
    let (player, surface) = player(decoder()).await;
    let clips = vec![clip("base.mp4", 0, 0.0, 1.0), clip("overlay.mp4", 1, 0.5, 0.5)];

    player.play(&clips, 0.0).await.unwrap();
    assert_eq!(player.state(), PlaybackState::Playing);
    assert!(wait_until(|| surface.ended.load(Ordering::SeqCst)).await);

    assert_eq!(player.state(), PlaybackState::Idle);
    assert!(strictly_increasing(&surface.timestamps()));
    let stats = player.stats();
    assert!(stats.frames_presented > 0);
    assert_eq!(stats.decode_errors, 0);
    assert_eq!(stats.lookahead, 0);
    assert!(stats.buffers.tracks.len() >= 2);
    assert_eq!(
        surface.states.lock().first().copied(),
        Some(PlaybackState::Buffering)
    );
    player.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn base_track_shows_through_once_the_overlay_ends() {
    let (player, surface) = player(decoder()).await;
    // Overlay source frames start at 300 so they are told apart from the base
    let overlay = Clip::new(SourceRef::new("overlay.mp4"), 1, 0.0, 10.0, 0.3);
    let clips = vec![clip("base.mp4", 0, 0.0, 2.0), overlay];

    player.play(&clips, 0.0).await.unwrap();
    assert!(wait_until(|| surface.timestamps().iter().any(|t| *t >= 1.0)).await);

    let frames = surface.frames.lock().clone();
    assert!(frames.iter().any(|(t, seed)| *t < 0.3 && *seed >= 300), "{frames:?}");
    let after: Vec<_> = frames.iter().filter(|(t, _)| *t >= 0.3).collect();
    assert!(!after.is_empty());
    for (time, seed) in after {
        assert_eq!(*seed, FrameRate::FPS_30.nearest_frame(*time) as u64, "at {time}");
    }
    player.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn compositor_output_reaches_the_surface() {
    let compositor = Arc::new(TestPatternCompositor::new(FrameRate::FPS_30));
    let (player, surface) = player(decoder()).await;
    let player = Arc::into_inner(player)
        .unwrap()
        .with_compositor(compositor.clone());
    let clips = vec![clip("base.mp4", 0, 0.0, 0.5), clip("title.png", 1, 0.0, 0.5)];

    player.play(&clips, 0.0).await.unwrap();
    assert!(wait_until(|| surface.ended.load(Ordering::SeqCst)).await);

    assert!(compositor.render_count() > 0);
    let frames = surface.frames.lock().clone();
    assert!(!frames.is_empty());
    for (time, seed) in frames {
        assert_eq!(seed, FrameRate::FPS_30.nearest_frame(time) as u64);
    }
    player.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_mid_play_releases_the_session() {
    let (player, surface) = player(decoder()).await;
    let clips = vec![clip("long.mp4", 0, 0.0, 5.0)];

    player.play(&clips, 0.0).await.unwrap();
    assert!(wait_until(|| player.stats().frames_presented >= 3).await);
    player.stop();

    let stats = player.stats();
    assert_eq!(stats.state, PlaybackState::Idle);
    assert_eq!(stats.lookahead, 0);
    assert_eq!(stats.streams, 0);
    assert_eq!(player.current_time(), 0.0);

    // A tick already running when stop landed may still finish
    tokio::time::sleep(Duration::from_millis(30)).await;
    let presented = surface.frames.lock().len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(surface.frames.lock().len(), presented);
    assert!(!surface.ended.load(Ordering::SeqCst));

    // Nothing to resume once stopped
    player.resume().unwrap();
    assert_eq!(player.state(), PlaybackState::Idle);
    player.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn seek_shows_preloaded_frame_from_cache() {
    let (player, surface) = player(decoder()).await;
    let base = clip("base.mp4", 0, 0.0, 2.0);
    let clips = vec![base.clone()];

    player.preload(&base, 0.0, 1.0, 0).unwrap();
    assert!(wait_until(|| player.stats().preloaded == 30).await);
    player.cache().reset_stats();

    player.seek(0.5, &clips).await.unwrap();
    assert_eq!(player.state(), PlaybackState::Paused);
    assert_eq!(surface.frames.lock().first().copied(), Some((0.5, 15)));
    assert!(player.cache().stats().hits >= 1);
    player.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispose_while_buffering_ends_cleanly() {
    let (player, surface) = player(decoder().with_latency(Duration::from_millis(40))).await;
    let clips = vec![clip("slow.mp4", 0, 0.0, 5.0)];

    let starting = {
        let player = Arc::clone(&player);
        tokio::spawn(async move { player.play(&clips, 0.0).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    player.dispose();
    player.dispose();

    match starting.await.unwrap() {
        Ok(()) | Err(ProEditError::Disposed) => {}
        Err(e) => panic!("unexpected play result: {e}"),
    }
    assert_eq!(player.state(), PlaybackState::Idle);
    assert!(player.pool().is_disposed());
    assert!(matches!(
        player.play(&[clip("again.mp4", 0, 0.0, 1.0)], 0.0).await,
        Err(ProEditError::Disposed)
    ));
    assert!(!surface.ended.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stats_snapshot_serializes() {
    let (player, _surface) = player(decoder()).await;
    player.play(&[clip("base.mp4", 0, 0.0, 1.0)], 0.0).await.unwrap();
    assert!(wait_until(|| player.stats().frames_presented >= 2).await);

    let json = serde_json::to_string(&player.stats()).unwrap();
    let parsed: PlaybackStats = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.pool.workers, player.stats().pool.workers);
    assert!(json.contains("\"frames_presented\""));
    player.dispose();
}
