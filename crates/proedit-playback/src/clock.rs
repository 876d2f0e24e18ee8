//! Master playback clock.
//!
//! Timeline time is never accumulated tick by tick. Every read derives it
//! from the wall-clock distance to the last anchor, which `play`, `pause`,
//! `seek` and `set_rate` rewrite:
//!
//! ```text
//! current = start_timeline + (wall_now - start_wall) * rate
//! ```
//!
//! Frame-rate jitter in whoever polls the clock therefore cannot make it
//! drift.

use crate::config::{ClockConfig, MAX_PLAYBACK_RATE, MIN_PLAYBACK_RATE};
use parking_lot::Mutex;
use proedit_core::{FrameRate, ProEditError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

/// Source of wall-clock seconds.
pub trait TimeSource: Send + Sync {
    /// Monotonic seconds since an arbitrary origin.
    fn now(&self) -> f64;

    /// Wake the underlying source if the platform suspended it.
    fn resume(&self) {}
}

/// Monotonic wall clock backed by the tokio timer.
#[derive(Debug, Clone, Copy)]
pub struct SystemTimeSource {
    origin: tokio::time::Instant,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Hand-driven time source for tests and offline stepping.
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    now: Arc<Mutex<f64>>,
    resumes: Arc<Mutex<u32>>,
}

impl ManualTimeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, secs: f64) {
        *self.now.lock() += secs;
    }

    pub fn set(&self, secs: f64) {
        *self.now.lock() = secs;
    }

    /// How many times `resume` was requested.
    pub fn resume_count(&self) -> u32 {
        *self.resumes.lock()
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> f64 {
        *self.now.lock()
    }

    fn resume(&self) {
        *self.resumes.lock() += 1;
    }
}

/// Transport state of the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClockState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Notification delivered to clock subscribers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockEvent {
    /// Once per tick while playing.
    TimeUpdate(f64),
    /// On every state transition.
    StateChange(ClockState),
    /// The end of the timeline was reached without looping.
    Ended,
}

/// Outcome of a single [`Clock::tick`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockTick {
    /// Not playing; nothing emitted.
    Idle,
    /// Playing at this timeline time.
    Time(f64),
    /// Hit the end; the clock has stopped.
    Ended,
}

/// Handle returned by [`Clock::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn Fn(&ClockEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq)]
struct LoopRegion {
    start: f64,
    end: f64,
}

/// Authoritative timeline clock.
///
/// Listeners run synchronously inside the mutating call and must not call
/// back into the clock.
pub struct Clock {
    source: Arc<dyn TimeSource>,
    state: ClockState,
    start_wall: f64,
    start_timeline: f64,
    paused_at: f64,
    rate: f64,
    duration: f64,
    loop_region: Option<LoopRegion>,
    frame_rate: FrameRate,
    drift_ms: f64,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
}

impl Clock {
    pub fn new(source: Arc<dyn TimeSource>, config: &ClockConfig) -> Self {
        Self {
            source,
            state: ClockState::Stopped,
            start_wall: 0.0,
            start_timeline: 0.0,
            paused_at: 0.0,
            rate: config
                .playback_rate
                .clamp(MIN_PLAYBACK_RATE, MAX_PLAYBACK_RATE),
            duration: 0.0,
            loop_region: None,
            frame_rate: config.frame_rate,
            drift_ms: 0.0,
            listeners: Vec::new(),
            next_subscription: 0,
        }
    }

    /// Clock on the system wall clock.
    pub fn system(config: &ClockConfig) -> Self {
        Self::new(Arc::new(SystemTimeSource::new()), config)
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == ClockState::Playing
    }

    pub fn playback_rate(&self) -> f64 {
        self.rate
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn set_duration(&mut self, duration: f64) {
        self.duration = duration.max(0.0);
        self.paused_at = self.paused_at.min(self.duration);
    }

    pub fn loop_region(&self) -> Option<(f64, f64)> {
        self.loop_region.map(|r| (r.start, r.end))
    }

    /// Current timeline position in seconds.
    pub fn current_time(&self) -> f64 {
        match self.state {
            ClockState::Playing => self.resolve(self.raw_time()),
            ClockState::Paused | ClockState::Stopped => self.paused_at,
        }
    }

    fn raw_time(&self) -> f64 {
        self.start_timeline + (self.source.now() - self.start_wall) * self.rate
    }

    fn resolve(&self, raw: f64) -> f64 {
        if let Some(region) = self.loop_region {
            if raw >= region.end {
                let len = region.end - region.start;
                return region.start + (raw - region.start).rem_euclid(len);
            }
        }
        raw.clamp(0.0, self.duration)
    }

    fn anchor(&mut self, timeline: f64) {
        self.start_timeline = timeline;
        self.start_wall = self.source.now();
    }

    pub fn play(&mut self) {
        if self.state == ClockState::Playing {
            return;
        }
        self.source.resume();
        self.anchor(self.paused_at);
        self.transition(ClockState::Playing);
    }

    pub fn pause(&mut self) {
        if self.state != ClockState::Playing {
            return;
        }
        self.paused_at = self.current_time();
        self.transition(ClockState::Paused);
    }

    /// Reset to the stopped state at time zero.
    pub fn stop(&mut self) {
        self.paused_at = 0.0;
        self.start_timeline = 0.0;
        self.start_wall = 0.0;
        self.drift_ms = 0.0;
        if self.state != ClockState::Stopped {
            self.transition(ClockState::Stopped);
        }
    }

    /// Jump to `time`, keeping the play/pause state.
    pub fn seek(&mut self, time: f64) {
        let time = time.clamp(0.0, self.duration);
        if self.state == ClockState::Playing {
            self.anchor(time);
        } else {
            self.paused_at = time;
        }
        self.drift_ms = 0.0;
        debug!(time, "Clock seek");
    }

    pub fn set_rate(&mut self, rate: f64) {
        let rate = rate.clamp(MIN_PLAYBACK_RATE, MAX_PLAYBACK_RATE);
        if self.state == ClockState::Playing {
            let now = self.current_time();
            self.anchor(now);
        }
        self.rate = rate;
    }

    /// Enable or clear the loop region `[start, end)`.
    pub fn set_loop(&mut self, enabled: bool, start: f64, end: f64) -> Result<()> {
        let region = if enabled {
            if start.is_nan() || end.is_nan() || start < 0.0 || end <= start {
                return Err(ProEditError::InvalidParameter(format!(
                    "loop region [{start}, {end}) is empty"
                )));
            }
            Some(LoopRegion { start, end })
        } else {
            None
        };
        if self.state == ClockState::Playing {
            let now = self.current_time();
            self.anchor(now);
        }
        self.loop_region = region;
        Ok(())
    }

    /// One animation tick. Emits `TimeUpdate` while playing, or stops and
    /// emits `Ended` once the end is reached without a loop.
    pub fn tick(&mut self) -> ClockTick {
        if self.state != ClockState::Playing {
            return ClockTick::Idle;
        }
        let raw = self.raw_time();
        if self.loop_region.is_none() && raw >= self.duration {
            debug!(duration = self.duration, "Clock reached end");
            self.stop();
            self.emit(&ClockEvent::Ended);
            return ClockTick::Ended;
        }
        let time = self.resolve(raw);
        self.emit(&ClockEvent::TimeUpdate(time));
        ClockTick::Time(time)
    }

    /// Record the timestamp of the frame just shown.
    pub fn report_presented_time(&mut self, video_time: f64) {
        self.drift_ms = (self.current_time() - video_time) * 1000.0;
        trace!(drift_ms = self.drift_ms, "Presented");
    }

    /// Clock time minus presented video time, in milliseconds.
    pub fn drift_ms(&self) -> f64 {
        self.drift_ms
    }

    fn frame_ms(&self) -> f64 {
        self.frame_rate.frame_duration_secs() * 1000.0
    }

    /// Video is more than a frame behind.
    pub fn should_skip_frame(&self) -> bool {
        self.drift_ms > self.frame_ms()
    }

    /// Video is more than two frames ahead.
    pub fn should_repeat_frame(&self) -> bool {
        self.drift_ms < -2.0 * self.frame_ms()
    }

    pub fn subscribe(
        &mut self,
        listener: impl Fn(&ClockEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        self.listeners.len() != before
    }

    fn transition(&mut self, state: ClockState) {
        self.state = state;
        self.emit(&ClockEvent::StateChange(state));
    }

    fn emit(&self, event: &ClockEvent) {
        for (_, listener) in &self.listeners {
            listener(event);
        }
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock")
            .field("state", &self.state)
            .field("time", &self.current_time())
            .field("rate", &self.rate)
            .field("duration", &self.duration)
            .field("loop_region", &self.loop_region)
            .finish()
    }
}
