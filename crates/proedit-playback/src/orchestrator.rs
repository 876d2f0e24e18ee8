//! Playback session orchestration.
//!
//! Wires the clock, decode pool, frame cache, lookahead queue and ring
//! buffers into one session. Two tokio tasks do the work:
//!
//! - the decode loop keeps the lookahead filled, one request per free slot,
//!   always from the stream whose next frame is earliest on the timeline
//! - the presentation loop ticks the clock at the refresh rate and hands the
//!   newest frame that is due to the [`PresentationSink`]
//!
//! Every session (`play`, `seek`, `stop`) starts a new generation. Work from
//! an older generation checks its [`CancelToken`] before touching shared
//! state, so a superseded decode can never land in the new session.

use crate::cancel::{CancelSource, CancelToken};
use crate::clip::{timeline_duration, Clip, DecodedFrame};
use crate::clock::{Clock, ClockTick, TimeSource};
use crate::config::PlaybackConfig;
use crate::decode::FrameCompositor;
use crate::decode_pool::{DecodeRequest, DecodeWorkerPool, PoolStats};
use crate::frame_cache::{CacheKey, CacheStats, FrameCache};
use crate::frame_queue::FrameQueue;
use crate::preload::{PreloadTarget, PreloadTask, Preloader};
use crate::ring_buffer::{CompositeRingBuffer, CompositeStats};
use crate::stream::{ClipStream, StreamSample};
use parking_lot::Mutex;
use proedit_core::{DecodedImage, ProEditError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// A backwards clock step larger than this is a loop wrap.
const WRAP_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackState {
    #[default]
    Idle,
    Buffering,
    Playing,
    Paused,
    Seeking,
}

/// Receiver of presented frames and session events.
///
/// Images handed to `on_frame` stay owned by the pipeline; keep a clone to
/// hold one past the call.
pub trait PresentationSink: Send + Sync {
    fn on_frame(&self, image: &DecodedImage, timestamp: f64);

    fn on_state_change(&self, _state: PlaybackState) {}

    /// Once per presentation tick while playing.
    fn on_time_update(&self, _time: f64) {}

    /// Playback reached the end without a loop.
    fn on_ended(&self) {}
}

/// Snapshot of the whole pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackStats {
    pub state: PlaybackState,
    pub current_time: f64,
    pub drift_ms: f64,
    pub cache: CacheStats,
    pub buffers: CompositeStats,
    /// Frames waiting in the lookahead.
    pub lookahead: usize,
    pub lookahead_depth: usize,
    pub pool: PoolStats,
    /// Streams with frames left to decode.
    pub streams: usize,
    pub frames_presented: u64,
    pub decode_errors: u64,
    pub skip_advisories: u64,
    pub repeat_advisories: u64,
    pub starvations: u64,
    pub preloaded: u64,
}

#[derive(Debug, Clone, Default)]
struct Counters {
    frames_presented: u64,
    decode_errors: u64,
    skip_advisories: u64,
    repeat_advisories: u64,
    starvations: u64,
}

/// What the presentation side has already handed on.
#[derive(Debug, Default)]
struct Presented {
    written: HashMap<usize, (Uuid, i64)>,
    last_sent: Option<f64>,
    last_tick: Option<f64>,
}

#[derive(Default)]
struct Tasks {
    decode: Option<JoinHandle<()>>,
    present: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_present(&mut self) {
        if let Some(task) = self.present.take() {
            task.abort();
        }
    }

    fn abort_all(&mut self) {
        self.abort_present();
        if let Some(task) = self.decode.take() {
            task.abort();
        }
    }
}

struct Job {
    clip: Arc<Clip>,
    sample: StreamSample,
}

enum TickOutcome {
    Continue,
    Ended,
}

struct Shared {
    config: PlaybackConfig,
    pool: Arc<DecodeWorkerPool>,
    cache: Arc<FrameCache>,
    sink: Arc<dyn PresentationSink>,
    compositor: Mutex<Option<Arc<dyn FrameCompositor>>>,
    clock: Mutex<Clock>,
    state: Mutex<PlaybackState>,
    queue: Mutex<FrameQueue>,
    buffers: Mutex<CompositeRingBuffer>,
    streams: Mutex<Vec<ClipStream>>,
    /// Clips that opened, kept for loop restarts.
    clips: Mutex<Vec<Arc<Clip>>>,
    session: CancelSource,
    tasks: Mutex<Tasks>,
    presented: Mutex<Presented>,
    counters: Mutex<Counters>,
    /// Signalled when a frame lands in the lookahead.
    inserted: Notify,
    /// Signalled when the lookahead has room again.
    space: Notify,
    /// Every stream is exhausted and nothing is in flight.
    drained: AtomicBool,
    wants_playback: AtomicBool,
}

impl Shared {
    fn state(&self) -> PlaybackState {
        *self.state.lock()
    }

    fn set_state(&self, next: PlaybackState) {
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        if previous != next {
            debug!(?previous, ?next, "Playback state");
            self.sink.on_state_change(next);
        }
    }

    /// Cancel the current generation, stop both loops and release every
    /// buffered frame. Returns a token for the new generation.
    fn begin_session(&self) -> CancelToken {
        self.session.cancel();
        self.tasks.lock().abort_all();
        let purged = self.pool.purge_cancelled();
        let released = self.queue.lock().clear() + self.buffers.lock().reset();
        self.streams.lock().clear();
        *self.presented.lock() = Presented::default();
        self.drained.store(false, Ordering::Release);
        trace!(released, purged, generation = self.session.epoch(), "Session reset");
        self.session.token()
    }

    fn stop_session(&self) {
        self.begin_session();
        self.wants_playback.store(false, Ordering::Release);
        self.clips.lock().clear();
        self.clock.lock().stop();
        self.set_state(PlaybackState::Idle);
    }

    /// Probe and open one stream per clip still visible from `from`.
    /// Clips that cannot be opened are skipped.
    fn open_streams(&self, clips: &[Clip], from: f64) -> usize {
        let mut usable = Vec::with_capacity(clips.len());
        for clip in clips {
            match self.pool.probe(&clip.source) {
                Ok(()) => usable.push(Arc::new(clip.clone())),
                Err(e) => warn!(
                    clip = %clip.id,
                    uri = %clip.source.uri,
                    error = %e,
                    "Skipping clip that cannot be opened"
                ),
            }
        }
        let tracks = usable.iter().map(|c| c.track + 1).max().unwrap_or(0);
        self.buffers.lock().ensure_tracks(tracks);
        *self.clips.lock() = usable;
        self.restart_streams(from)
    }

    fn restart_streams(&self, from: f64) -> usize {
        let rate = self.config.clock.frame_rate;
        let until = self
            .clock
            .lock()
            .loop_region()
            .and_then(|(_, end)| (from < end).then_some(end));
        let streams: Vec<ClipStream> = self
            .clips
            .lock()
            .iter()
            .filter(|c| c.overlaps_from(from))
            .map(|c| ClipStream::open(Arc::clone(c), rate, from, until))
            .collect();
        let opened = streams.len();
        *self.streams.lock() = streams;
        self.drained.store(false, Ordering::Release);
        opened
    }

    /// Earliest pending frame across every stream.
    fn next_job(&self) -> Option<Job> {
        let mut streams = self.streams.lock();
        let stream = streams
            .iter_mut()
            .filter(|s| !s.is_exhausted())
            .min_by(|a, b| {
                let a = a.peek_time().unwrap_or(f64::INFINITY);
                let b = b.peek_time().unwrap_or(f64::INFINITY);
                a.total_cmp(&b)
            })?;
        let sample = stream.advance()?;
        Some(Job {
            clip: Arc::clone(stream.clip()),
            sample,
        })
    }

    fn streams_exhausted(&self) -> bool {
        self.streams.lock().iter().all(ClipStream::is_exhausted)
    }

    fn spawn_decode_loop(self: &Arc<Self>, token: &CancelToken) {
        let mut tasks = self.tasks.lock();
        if token.is_cancelled() {
            return;
        }
        if let Some(old) = tasks.decode.take() {
            old.abort();
        }
        tasks.decode = Some(tokio::spawn(decode_loop(Arc::clone(self), token.clone())));
    }

    /// Start the clock and the presentation loop.
    fn start_presenting(self: &Arc<Self>, token: &CancelToken) {
        {
            let mut tasks = self.tasks.lock();
            if token.is_cancelled() {
                return;
            }
            tasks.abort_present();
            self.clock.lock().play();
            tasks.present = Some(tokio::spawn(presentation_loop(Arc::clone(self), token.clone())));
        }
        self.set_state(PlaybackState::Playing);
    }

    /// Wait until the lookahead holds `threshold` frames, every stream has
    /// drained, or the fill timeout passes. Returns whether the buffer
    /// filled.
    async fn wait_for_buffer(&self, threshold: usize, token: &CancelToken) -> bool {
        let buffer = &self.config.buffer;
        let started = Instant::now();
        let deadline = started + buffer.fill_timeout();
        loop {
            if token.is_cancelled() {
                return false;
            }
            let fill = self.queue.lock().len();
            if fill >= threshold || self.drained.load(Ordering::Acquire) {
                let waited_ms = started.elapsed().as_millis() as u64;
                debug!(fill, threshold, waited_ms, "Buffer ready");
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    fill,
                    threshold,
                    timeout_ms = buffer.fill_timeout_ms,
                    "Buffer did not fill in time, continuing anyway"
                );
                self.counters.lock().starvations += 1;
                return false;
            }
            let wait = buffer.fill_poll().min(deadline - now);
            let _ = tokio::time::timeout(wait, self.inserted.notified()).await;
        }
    }

    async fn fetch_frame(&self, job: Job, token: &CancelToken) -> Option<DecodedFrame> {
        let Job { clip, sample } = job;
        let image = self.load_image(&clip, sample.source_time, token).await?;
        Some(
            DecodedFrame::new(image, sample.timeline_time, sample.frame_number)
                .on_track(clip.track, clip.id)
                .ending_at(clip.end_time()),
        )
    }

    /// Frame cache first, then the pool. Decode failures are logged and
    /// come back as `None`.
    async fn load_image(
        &self,
        clip: &Clip,
        source_time: f64,
        token: &CancelToken,
    ) -> Option<DecodedImage> {
        let rate = self.config.clock.frame_rate;
        let key = CacheKey::at(clip.source.media_id, source_time, rate);
        if let Some(image) = self.cache.get(&key) {
            return Some(image);
        }
        let request = DecodeRequest::new(
            clip.id,
            clip.source.clone(),
            source_time,
            self.config.output_width,
            self.config.output_height,
        )
        .with_token(token.clone());
        let timeout = self.config.decode_timeout();
        match self.pool.decode_frame_timeout(request, timeout).await {
            Ok(image) => {
                if token.is_cancelled() {
                    return None;
                }
                self.cache.set(key, image.clone());
                Some(image)
            }
            Err(e) if e.is_cancellation() => None,
            Err(e) => {
                self.counters.lock().decode_errors += 1;
                warn!(
                    clip = %clip.id,
                    time = source_time,
                    error = %e,
                    "Skipping frame that failed to decode"
                );
                None
            }
        }
    }

    /// Show the frame at `time` directly, without the ring buffers.
    async fn present_immediate(&self, time: f64, token: &CancelToken) {
        let has_compositor = self.compositor.lock().is_some();
        let image = if has_compositor {
            self.render_composite(time).await
        } else {
            let topmost = self
                .clips
                .lock()
                .iter()
                .filter(|c| c.contains(time))
                .max_by_key(|c| c.track)
                .cloned();
            match topmost {
                Some(clip) => self.load_image(&clip, clip.to_source_time(time), token).await,
                None => None,
            }
        };
        if token.is_cancelled() {
            return;
        }
        if let Some(image) = image {
            trace!(time, "Presenting seek frame");
            self.sink.on_frame(&image, time);
        }
    }

    /// One presentation tick.
    async fn present_tick(&self, token: &CancelToken) -> TickOutcome {
        let time = match self.clock.lock().tick() {
            ClockTick::Idle => return TickOutcome::Continue,
            ClockTick::Ended => return TickOutcome::Ended,
            ClockTick::Time(time) => time,
        };
        self.sink.on_time_update(time);

        let wrapped = {
            let mut presented = self.presented.lock();
            let wrapped = presented.last_tick.is_some_and(|last| time + WRAP_EPSILON < last);
            presented.last_tick = Some(time);
            wrapped
        };
        if wrapped {
            debug!(time, "Loop wrapped, restarting streams");
            self.queue.lock().clear();
            self.buffers.lock().reset();
            {
                let mut presented = self.presented.lock();
                presented.written.clear();
                presented.last_sent = None;
            }
            self.restart_streams(time);
            self.space.notify_one();
        }

        let picked = self.queue.lock().select_at(time);
        if picked.is_empty() {
            return TickOutcome::Continue;
        }
        self.space.notify_one();

        // The same frame stays due for several ticks; write it only once.
        // A track whose clip ended changes the picture without a new frame.
        let (fresh, vanished) = {
            let mut presented = self.presented.lock();
            let before = presented.written.len();
            presented
                .written
                .retain(|track, _| picked.iter().any(|f| f.track == *track));
            let vanished = presented.written.len() < before;
            let fresh: Vec<bool> = picked
                .iter()
                .map(|f| {
                    let id = (f.clip_id, f.frame_number);
                    presented.written.insert(f.track, id) != Some(id)
                })
                .collect();
            (fresh, vanished)
        };

        let composite = match picked.last() {
            Some(top) if vanished || fresh.contains(&true) => {
                let timestamp = picked
                    .iter()
                    .map(|f| f.timestamp)
                    .fold(top.timestamp, f64::max);
                let frame_number = self.config.clock.frame_rate.nearest_frame(timestamp);
                let image = match self.render_composite(timestamp).await {
                    Some(image) => image,
                    None => top.image.clone(),
                };
                if token.is_cancelled() {
                    return TickOutcome::Continue;
                }
                Some(DecodedFrame::new(image, timestamp, frame_number))
            }
            _ => None,
        };
        let recomposed = composite.is_some();

        let shown = {
            let mut buffers = self.buffers.lock();
            for (frame, is_fresh) in picked.into_iter().zip(fresh) {
                if is_fresh {
                    buffers.track_mut(frame.track).write(frame);
                }
            }
            if let Some(frame) = composite {
                buffers.composite_mut().write(frame);
            }
            buffers.swap_all();
            buffers
                .composite_mut()
                .present_or_fallback()
                .map(|f| (f.image.clone(), f.timestamp))
        };

        if let Some((image, timestamp)) = shown {
            let is_new = {
                let mut presented = self.presented.lock();
                let is_new = recomposed || presented.last_sent != Some(timestamp);
                presented.last_sent = Some(timestamp);
                is_new
            };
            if is_new {
                self.report_presented(timestamp);
                self.sink.on_frame(&image, timestamp);
            }
        }
        TickOutcome::Continue
    }

    /// Run the compositor, if any, on the blocking pool.
    async fn render_composite(&self, time: f64) -> Option<DecodedImage> {
        let compositor = self.compositor.lock().clone()?;
        let (width, height) = (self.config.output_width, self.config.output_height);
        let render =
            tokio::task::spawn_blocking(move || compositor.render_frame(time, width, height));
        match render.await {
            Ok(Ok(image)) => Some(image),
            Ok(Err(e)) => {
                warn!(time, error = %e, "Composite render failed");
                None
            }
            Err(e) => {
                warn!(time, error = %e, "Composite render task failed");
                None
            }
        }
    }

    fn report_presented(&self, timestamp: f64) {
        let (skip, repeat, drift_ms) = {
            let mut clock = self.clock.lock();
            clock.report_presented_time(timestamp);
            (clock.should_skip_frame(), clock.should_repeat_frame(), clock.drift_ms())
        };
        let mut counters = self.counters.lock();
        counters.frames_presented += 1;
        // Selection always takes the newest due frame, so late video catches
        // up on the next tick and early video is held; both are just counted.
        if skip {
            counters.skip_advisories += 1;
            trace!(drift_ms, "Video behind clock");
        } else if repeat {
            counters.repeat_advisories += 1;
            trace!(drift_ms, "Video ahead of clock");
        }
    }

    fn finish(&self, token: &CancelToken) {
        if token.is_cancelled() {
            return;
        }
        info!("Playback reached the end");
        self.stop_session();
        self.sink.on_ended();
    }
}

async fn decode_loop(shared: Arc<Shared>, token: CancelToken) {
    let mut in_flight: JoinSet<Option<DecodedFrame>> = JoinSet::new();
    debug!(generation = token.generation(), "Decode loop started");
    while !token.is_cancelled() {
        let parallelism = shared.pool.capacity().max(1);
        let room = shared.queue.lock().free().saturating_sub(in_flight.len());
        let mut issued = 0;
        while issued < room && in_flight.len() < parallelism {
            let Some(job) = shared.next_job() else {
                break;
            };
            let (shared, token) = (Arc::clone(&shared), token.clone());
            in_flight.spawn(async move { shared.fetch_frame(job, &token).await });
            issued += 1;
        }

        if in_flight.is_empty() {
            if shared.streams_exhausted() && !shared.drained.swap(true, Ordering::AcqRel) {
                debug!("Every stream drained");
                shared.inserted.notify_waiters();
            }
            shared.space.notified().await;
            continue;
        }

        tokio::select! {
            joined = in_flight.join_next() => {
                if let Some(Ok(Some(frame))) = joined {
                    if token.is_cancelled() {
                        break;
                    }
                    shared.queue.lock().insert(frame);
                    shared.inserted.notify_waiters();
                }
            }
            _ = shared.space.notified() => {}
        }
    }
    trace!(generation = token.generation(), "Decode loop stopped");
}

async fn presentation_loop(shared: Arc<Shared>, token: CancelToken) {
    let mut ticker = tokio::time::interval(shared.config.clock.refresh_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if token.is_cancelled() {
            return;
        }
        if let TickOutcome::Ended = shared.present_tick(&token).await {
            shared.finish(&token);
            return;
        }
    }
}

/// Drives one playback session at a time.
pub struct PlaybackOrchestrator {
    shared: Arc<Shared>,
    preloader: Mutex<Option<Preloader>>,
    disposed: AtomicBool,
}

impl PlaybackOrchestrator {
    pub fn new(
        config: PlaybackConfig,
        pool: Arc<DecodeWorkerPool>,
        sink: Arc<dyn PresentationSink>,
    ) -> Self {
        let config = config.validated();
        let cache = Arc::new(FrameCache::new(config.cache.max_frames, config.cache.max_size_bytes));
        let shared = Shared {
            clock: Mutex::new(Clock::system(&config.clock)),
            queue: Mutex::new(FrameQueue::new(config.buffer.max_depth)),
            buffers: Mutex::new(CompositeRingBuffer::new(0, config.buffer.ring_slots)),
            pool,
            cache,
            sink,
            compositor: Mutex::new(None),
            state: Mutex::new(PlaybackState::Idle),
            streams: Mutex::new(Vec::new()),
            clips: Mutex::new(Vec::new()),
            session: CancelSource::new(),
            tasks: Mutex::new(Tasks::default()),
            presented: Mutex::new(Presented::default()),
            counters: Mutex::new(Counters::default()),
            inserted: Notify::new(),
            space: Notify::new(),
            drained: AtomicBool::new(false),
            wants_playback: AtomicBool::new(false),
            config,
        };
        Self {
            shared: Arc::new(shared),
            preloader: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Render composite output through `compositor` instead of showing the
    /// top track.
    pub fn with_compositor(self, compositor: Arc<dyn FrameCompositor>) -> Self {
        *self.shared.compositor.lock() = Some(compositor);
        self
    }

    /// Drive the clock from `source` instead of the system clock.
    pub fn with_time_source(self, source: Arc<dyn TimeSource>) -> Self {
        *self.shared.clock.lock() = Clock::new(source, &self.shared.config.clock);
        self
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(ProEditError::Disposed)
        } else {
            Ok(())
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.state()
    }

    pub fn current_time(&self) -> f64 {
        self.shared.clock.lock().current_time()
    }

    pub fn cache(&self) -> &Arc<FrameCache> {
        &self.shared.cache
    }

    pub fn pool(&self) -> &Arc<DecodeWorkerPool> {
        &self.shared.pool
    }

    /// Start playback of `clips` at `start`.
    ///
    /// Returns once the lookahead reached its play threshold (or the fill
    /// timeout passed) and the clock is running. A call superseded by a later
    /// `play`, `seek` or `stop` returns `Ok` without starting anything.
    pub async fn play(&self, clips: &[Clip], start: f64) -> Result<()> {
        self.ensure_live()?;
        let shared = &self.shared;
        let token = shared.begin_session();
        shared.wants_playback.store(true, Ordering::Release);
        shared.set_state(PlaybackState::Buffering);

        let start = {
            let mut clock = shared.clock.lock();
            clock.stop();
            clock.set_duration(timeline_duration(clips));
            clock.seek(start);
            clock.current_time()
        };
        let opened = shared.open_streams(clips, start);
        info!(clips = clips.len(), opened, start, "Starting playback");

        shared.spawn_decode_loop(&token);
        shared
            .wait_for_buffer(shared.config.buffer.play_threshold(), &token)
            .await;
        if token.is_cancelled() {
            debug!("Play superseded before it started");
            return Ok(());
        }
        if !shared.wants_playback.load(Ordering::Acquire) {
            debug!(start, "Paused before playback started");
            shared.set_state(PlaybackState::Paused);
            return Ok(());
        }
        shared.start_presenting(&token);
        Ok(())
    }

    /// Stop presenting. Decoding keeps running so `resume` is instant.
    ///
    /// While buffering or seeking, the pending `play` or `seek` settles in
    /// `Paused` instead of starting playback.
    pub fn pause(&self) {
        let shared = &self.shared;
        match shared.state() {
            PlaybackState::Playing => {}
            PlaybackState::Buffering | PlaybackState::Seeking => {
                shared.wants_playback.store(false, Ordering::Release);
                debug!("Pause requested before playback started");
                return;
            }
            PlaybackState::Idle | PlaybackState::Paused => return,
        }
        shared.wants_playback.store(false, Ordering::Release);
        shared.tasks.lock().abort_present();
        shared.clock.lock().pause();
        shared.set_state(PlaybackState::Paused);
    }

    pub fn resume(&self) -> Result<()> {
        self.ensure_live()?;
        let shared = &self.shared;
        if shared.state() != PlaybackState::Paused {
            return Ok(());
        }
        shared.wants_playback.store(true, Ordering::Release);
        shared.start_presenting(&shared.session.token());
        Ok(())
    }

    /// End the session: release every stream and frame and reset the clock.
    pub fn stop(&self) {
        self.shared.stop_session();
        info!("Playback stopped");
    }

    /// Jump to `time`. The frame there is shown at once; playback resumes
    /// afterwards if it was running.
    pub async fn seek(&self, time: f64, clips: &[Clip]) -> Result<()> {
        self.ensure_live()?;
        let shared = &self.shared;
        let resume = shared.wants_playback.load(Ordering::Acquire);
        let token = shared.begin_session();
        shared.set_state(PlaybackState::Seeking);

        let target = {
            let mut clock = shared.clock.lock();
            clock.pause();
            clock.set_duration(timeline_duration(clips));
            clock.seek(time);
            clock.current_time()
        };
        let opened = shared.open_streams(clips, target);
        debug!(time = target, opened, resume, "Seeking");

        shared.present_immediate(target, &token).await;
        if token.is_cancelled() {
            debug!(time = target, "Seek superseded");
            return Ok(());
        }
        shared.spawn_decode_loop(&token);

        if shared.wants_playback.load(Ordering::Acquire) {
            shared
                .wait_for_buffer(shared.config.buffer.seek_threshold(), &token)
                .await;
            if token.is_cancelled() {
                return Ok(());
            }
            if shared.wants_playback.load(Ordering::Acquire) {
                shared.start_presenting(&token);
            } else {
                shared.set_state(PlaybackState::Paused);
            }
        } else {
            shared.set_state(PlaybackState::Paused);
        }
        Ok(())
    }

    pub fn set_playback_rate(&self, rate: f64) {
        let mut clock = self.shared.clock.lock();
        clock.set_rate(rate);
        debug!(rate = clock.playback_rate(), "Playback rate");
    }

    /// Loop `[start, end)` or clear the loop. Takes effect immediately for
    /// the clock and from the next wrap for decoding.
    pub fn set_loop(&self, enabled: bool, start: f64, end: f64) -> Result<()> {
        self.shared.clock.lock().set_loop(enabled, start, end)?;
        debug!(enabled, start, end, "Loop region");
        Ok(())
    }

    /// Decode `clip`'s frames in timeline range `[from, to)` into the frame
    /// cache in the background. Replaces any preload for the same media.
    pub fn preload(&self, clip: &Clip, from: f64, to: f64, priority: i32) -> Result<CancelToken> {
        self.ensure_live()?;
        if to.is_nan() || from.is_nan() || to <= from {
            return Err(ProEditError::InvalidParameter(format!(
                "preload range [{from}, {to}) is empty"
            )));
        }
        let rate = self.shared.config.clock.frame_rate;
        let first = rate.nearest_frame(from.max(clip.start_time));
        let last = rate.nearest_frame(to.min(clip.end_time()));
        let timestamps: Vec<f64> = (first..last)
            .map(|frame| clip.to_source_time(rate.frame_start_secs(frame)))
            .collect();

        let mut preloader = self.preloader.lock();
        if preloader.is_none() {
            tokio::runtime::Handle::try_current().map_err(|e| {
                ProEditError::Internal(format!("preload needs a tokio runtime: {e}"))
            })?;
        }
        let shared = &self.shared;
        let preloader = preloader.get_or_insert_with(|| {
            Preloader::spawn(PreloadTarget {
                pool: Arc::clone(&shared.pool),
                cache: Arc::clone(&shared.cache),
                rate,
                width: shared.config.output_width,
                height: shared.config.output_height,
                decode_timeout: shared.config.decode_timeout(),
            })
        });
        Ok(preloader.enqueue(PreloadTask::new(clip.id, clip.source.clone(), timestamps, priority)))
    }

    pub fn stats(&self) -> PlaybackStats {
        let shared = &self.shared;
        let (current_time, drift_ms) = {
            let clock = shared.clock.lock();
            (clock.current_time(), clock.drift_ms())
        };
        let (lookahead, lookahead_depth) = {
            let queue = shared.queue.lock();
            (queue.len(), queue.max_depth())
        };
        let counters = shared.counters.lock().clone();
        PlaybackStats {
            state: shared.state(),
            current_time,
            drift_ms,
            cache: shared.cache.stats(),
            buffers: shared.buffers.lock().stats(),
            lookahead,
            lookahead_depth,
            pool: shared.pool.stats(),
            streams: shared.streams.lock().iter().filter(|s| !s.is_exhausted()).count(),
            frames_presented: counters.frames_presented,
            decode_errors: counters.decode_errors,
            skip_advisories: counters.skip_advisories,
            repeat_advisories: counters.repeat_advisories,
            starvations: counters.starvations,
            preloaded: self.preloader.lock().as_ref().map_or(0, Preloader::loaded),
        }
    }

    /// Stop the session, the preloader and the decode pool. Safe to call
    /// repeatedly; every later control call fails with `Disposed`.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.stop_session();
        if let Some(mut preloader) = self.preloader.lock().take() {
            preloader.shutdown();
        }
        self.shared.pool.dispose();
        self.shared.cache.clear();
        info!("Playback orchestrator disposed");
    }
}

impl Drop for PlaybackOrchestrator {
    fn drop(&mut self) {
        // The loops hold the shared state; stop them so it can be freed
        self.shared.session.cancel();
        self.shared.tasks.lock().abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::SourceRef;
    use crate::clock::ManualTimeSource;
    use crate::config::PoolConfig;
    use crate::decode::{TestPatternCompositor, TestPatternDecoder};
    use proedit_core::FrameRate;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<(f64, [u8; 4])>>,
        states: Mutex<Vec<PlaybackState>>,
        ticks: Mutex<u64>,
        ended: AtomicBool,
    }

    impl RecordingSink {
        fn frame_times(&self) -> Vec<f64> {
            self.frames.lock().iter().map(|(t, _)| *t).collect()
        }
    }

    impl PresentationSink for RecordingSink {
        fn on_frame(&self, image: &DecodedImage, timestamp: f64) {
            let marker = image.buffer().pixels(0)[15];
            self.frames.lock().push((timestamp, marker));
        }

        fn on_state_change(&self, state: PlaybackState) {
            self.states.lock().push(state);
        }

        fn on_time_update(&self, _time: f64) {
            *self.ticks.lock() += 1;
        }

        fn on_ended(&self) {
            self.ended.store(true, Ordering::SeqCst);
        }
    }

    fn config() -> PlaybackConfig {
        let mut config = PlaybackConfig::default();
        config.output_width = 64;
        config.output_height = 4;
        config.pool.worker_count = 2;
        config.buffer.fill_timeout_ms = 1_000;
        config
    }

    async fn orchestrator(
        decoder: TestPatternDecoder,
    ) -> (PlaybackOrchestrator, Arc<RecordingSink>) {
        let config = config();
        let pool = DecodeWorkerPool::initialize(config.pool.clone(), Arc::new(decoder))
            .await
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = PlaybackOrchestrator::new(config, Arc::new(pool), sink.clone());
        (orchestrator, sink)
    }

    fn clip(uri: &str, track: usize, start: f64, duration: f64) -> Clip {
        Clip::new(SourceRef::new(uri), track, start, 0.0, duration)
    }

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..300 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn play_buffers_then_presents_in_order() {
        let (player, sink) = orchestrator(TestPatternDecoder::new(FrameRate::FPS_30)).await;
        let clips = vec![clip("a.mp4", 0, 0.0, 2.0)];

        player.play(&clips, 0.0).await.unwrap();
        assert_eq!(player.state(), PlaybackState::Playing);
        assert!(eventually(|| sink.frames.lock().len() >= 5).await);

        let times = sink.frame_times();
        assert!(times.windows(2).all(|w| w[0] <= w[1]), "{times:?}");
        assert_eq!(
            sink.states.lock()[..2],
            [PlaybackState::Buffering, PlaybackState::Playing]
        );
        assert!(*sink.ticks.lock() > 0);
        player.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reaching_the_end_stops_and_notifies() {
        let (player, sink) = orchestrator(TestPatternDecoder::new(FrameRate::FPS_30)).await;
        let clips = vec![clip("a.mp4", 0, 0.0, 0.3)];

        player.play(&clips, 0.0).await.unwrap();
        assert!(eventually(|| sink.ended.load(Ordering::SeqCst)).await);
        assert_eq!(player.state(), PlaybackState::Idle);
        assert_eq!(player.stats().lookahead, 0);
        player.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pause_holds_the_frame_and_resume_continues() {
        let source = Arc::new(ManualTimeSource::new());
        let (player, sink) = orchestrator(TestPatternDecoder::new(FrameRate::FPS_30)).await;
        let player = player.with_time_source(source.clone());
        let clips = vec![clip("a.mp4", 0, 0.0, 5.0)];

        player.play(&clips, 0.0).await.unwrap();
        assert!(eventually(|| !sink.frames.lock().is_empty()).await);

        player.pause();
        assert_eq!(player.state(), PlaybackState::Paused);
        let shown = sink.frames.lock().len();
        source.advance(1.0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.frames.lock().len(), shown);
        assert_eq!(player.current_time(), 0.0);

        player.resume().unwrap();
        assert_eq!(player.state(), PlaybackState::Playing);
        source.advance(0.2);
        assert!(eventually(|| sink.frame_times().last().is_some_and(|t| *t > 0.15)).await);
        player.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn seek_while_idle_shows_the_target_frame_and_settles_paused() {
        let (player, sink) = orchestrator(TestPatternDecoder::new(FrameRate::FPS_30)).await;
        let clips = vec![clip("a.mp4", 0, 0.0, 2.0)];

        player.seek(0.5, &clips).await.unwrap();
        assert_eq!(player.state(), PlaybackState::Paused);
        let frames = sink.frames.lock().clone();
        assert_eq!(frames, vec![(0.5, [15, 0, 128, 255])]);
        assert_eq!(player.current_time(), 0.5);
        player.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn seek_during_playback_resumes_playing() {
        let (player, sink) = orchestrator(TestPatternDecoder::new(FrameRate::FPS_30)).await;
        let clips = vec![clip("a.mp4", 0, 0.0, 5.0)];

        player.play(&clips, 0.0).await.unwrap();
        player.seek(3.0, &clips).await.unwrap();
        assert_eq!(player.state(), PlaybackState::Playing);
        assert!(player.current_time() >= 3.0);
        assert!(eventually(|| sink.frame_times().iter().filter(|t| **t >= 3.0).count() >= 2).await);
        player.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn seek_drops_decodes_of_the_superseded_session() {
        let decoder =
            TestPatternDecoder::new(FrameRate::FPS_30).with_latency(Duration::from_millis(80));
        let mut config = config();
        config.pool.worker_count = 1;
        config.pool.max_in_flight_per_worker = 3;
        let pool = DecodeWorkerPool::initialize(config.pool.clone(), Arc::new(decoder.clone()))
            .await
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let player = PlaybackOrchestrator::new(config, Arc::new(pool), sink);
        let clips = vec![clip("a.mp4", 0, 0.0, 10.0)];

        let seek = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let before = decoder.decoded_times().len();
            player.seek(5.0, &clips).await.unwrap();
            decoder.decoded_times().split_off(before)
        };
        let (played, during_seek) = tokio::join!(player.play(&clips, 0.0), seek);
        assert!(played.is_ok());

        // Only the decode already running when the seek landed may finish
        let stale = during_seek.iter().filter(|t| **t < 5.0).count();
        assert!(stale <= 1, "{during_seek:?}");
        assert!(during_seek.iter().any(|t| *t >= 5.0));
        assert_eq!(player.state(), PlaybackState::Playing);
        player.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pause_while_buffering_settles_paused() {
        let decoder =
            TestPatternDecoder::new(FrameRate::FPS_30).with_latency(Duration::from_millis(60));
        let (player, sink) = orchestrator(decoder).await;
        let clips = vec![clip("a.mp4", 0, 0.0, 5.0)];

        let pause = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(player.state(), PlaybackState::Buffering);
            player.pause();
        };
        let (played, ()) = tokio::join!(player.play(&clips, 0.0), pause);
        assert!(played.is_ok());
        assert_eq!(player.state(), PlaybackState::Paused);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(player.state(), PlaybackState::Paused);
        assert!(sink.frames.lock().is_empty());
        assert_eq!(player.current_time(), 0.0);

        player.resume().unwrap();
        assert_eq!(player.state(), PlaybackState::Playing);
        assert!(eventually(|| !sink.frames.lock().is_empty()).await);
        player.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_seeks_settle_on_the_last_one() {
        let decoder =
            TestPatternDecoder::new(FrameRate::FPS_30).with_latency(Duration::from_millis(20));
        let (player, _sink) = orchestrator(decoder).await;
        let clips = vec![clip("a.mp4", 0, 0.0, 5.0)];

        let (first, second) = tokio::join!(player.seek(1.0, &clips), player.seek(2.0, &clips));
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(player.state(), PlaybackState::Paused);
        assert_eq!(player.current_time(), 2.0);
        player.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unsupported_clip_is_skipped() {
        let decoder = TestPatternDecoder::new(FrameRate::FPS_30).with_unsupported(["broken.mov"]);
        let (player, sink) = orchestrator(decoder).await;
        let clips = vec![clip("broken.mov", 1, 0.0, 2.0), clip("a.mp4", 0, 0.0, 2.0)];

        player.play(&clips, 0.0).await.unwrap();
        assert_eq!(player.state(), PlaybackState::Playing);
        assert!(eventually(|| sink.frames.lock().len() >= 3).await);
        assert_eq!(player.stats().decode_errors, 0);
        player.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_frames_are_skipped_not_fatal() {
        let decoder = TestPatternDecoder::new(FrameRate::FPS_30).with_failing_frames([2, 3]);
        let (player, sink) = orchestrator(decoder).await;
        let clips = vec![clip("a.mp4", 0, 0.0, 2.0)];

        player.play(&clips, 0.0).await.unwrap();
        assert!(eventually(|| sink.frame_times().iter().any(|t| *t > 0.2)).await);
        assert_eq!(player.stats().decode_errors, 2);
        assert_eq!(player.state(), PlaybackState::Playing);
        player.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn loop_wraps_instead_of_ending() {
        let source = Arc::new(ManualTimeSource::new());
        let (player, sink) = orchestrator(TestPatternDecoder::new(FrameRate::FPS_30)).await;
        let player = player.with_time_source(source.clone());
        let clips = vec![clip("a.mp4", 0, 0.0, 1.0)];

        player.set_loop(true, 0.0, 0.5).unwrap();
        player.play(&clips, 0.0).await.unwrap();
        source.advance(0.4);
        assert!(eventually(|| sink.frame_times().last().is_some_and(|t| *t > 0.3)).await);

        source.advance(0.3);
        let wrapped = || sink.frame_times().last().is_some_and(|t| *t > 0.1 && *t < 0.3);
        assert!(eventually(wrapped).await);
        assert!(!sink.ended.load(Ordering::SeqCst));
        assert_eq!(player.state(), PlaybackState::Playing);
        player.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn compositor_output_is_presented() {
        let (player, sink) = orchestrator(TestPatternDecoder::new(FrameRate::FPS_30)).await;
        let compositor = Arc::new(TestPatternCompositor::new(FrameRate::FPS_30));
        let player = player.with_compositor(compositor.clone());
        let clips = vec![clip("a.mp4", 0, 0.0, 2.0)];

        player.seek(0.5, &clips).await.unwrap();
        assert_eq!(compositor.render_count(), 1);
        player.resume().unwrap();
        assert!(eventually(|| compositor.render_count() >= 3).await);
        assert!(!sink.frames.lock().is_empty());
        player.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn preload_fills_the_frame_cache() {
        let (player, _sink) = orchestrator(TestPatternDecoder::new(FrameRate::FPS_30)).await;
        let clip = clip("a.mp4", 0, 0.0, 2.0);

        let token = player.preload(&clip, 1.0, 1.5, 1).unwrap();
        assert!(!token.is_cancelled());
        assert!(eventually(|| player.stats().preloaded == 15).await);
        let key = CacheKey::at(clip.source.media_id, 1.2, FrameRate::FPS_30);
        assert!(player.cache().has(&key));
        assert!(player.preload(&clip, 2.0, 1.0, 0).is_err());
        player.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dispose_is_idempotent_and_final() {
        let (player, _sink) = orchestrator(TestPatternDecoder::new(FrameRate::FPS_30)).await;
        let clips = vec![clip("a.mp4", 0, 0.0, 2.0)];
        player.play(&clips, 0.0).await.unwrap();

        player.dispose();
        player.dispose();
        assert_eq!(player.state(), PlaybackState::Idle);
        assert!(player.pool().is_disposed());
        assert!(matches!(player.play(&clips, 0.0).await, Err(ProEditError::Disposed)));
        assert!(matches!(player.seek(1.0, &clips).await, Err(ProEditError::Disposed)));
    }
}
