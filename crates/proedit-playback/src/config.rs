//! Playback configuration.
//!
//! Every knob of the pipeline lives here with a sensible default. Serialized
//! configs may omit any field; `validated()` clamps values into the ranges
//! each component accepts.

use proedit_core::{memory_budget, FrameRate, ProEditError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Slowest and fastest playback rates the clock accepts.
pub const MIN_PLAYBACK_RATE: f64 = 0.1;
pub const MAX_PLAYBACK_RATE: f64 = 16.0;

/// Ring buffer slot count bounds.
pub const MIN_RING_SLOTS: usize = 2;
pub const MAX_RING_SLOTS: usize = 8;

/// Top-level configuration for a playback session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub clock: ClockConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub buffer: BufferConfig,
    /// Output frame width handed to the decoder and compositor.
    pub output_width: u32,
    /// Output frame height handed to the decoder and compositor.
    pub output_height: u32,
    /// Caller-side bound on a single decode request.
    pub decode_timeout_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            clock: ClockConfig::default(),
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            buffer: BufferConfig::default(),
            output_width: 1920,
            output_height: 1080,
            decode_timeout_ms: 2_000,
        }
    }
}

impl PlaybackConfig {
    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ProEditError::Serialization(e.to_string()))?;
        Ok(config.validated())
    }

    /// Clamp every field into its accepted range.
    pub fn validated(mut self) -> Self {
        self.clock.playback_rate = self
            .clock
            .playback_rate
            .clamp(MIN_PLAYBACK_RATE, MAX_PLAYBACK_RATE);
        if !self.clock.frame_rate.is_valid() {
            self.clock.frame_rate = FrameRate::default();
        }
        self.clock.refresh_hz = self.clock.refresh_hz.clamp(1, 240);

        self.pool.worker_count = self.pool.worker_count.clamp(1, num_cpus::get().max(1));
        self.pool.max_in_flight_per_worker = self.pool.max_in_flight_per_worker.max(1);

        self.buffer.ring_slots = self.buffer.ring_slots.clamp(MIN_RING_SLOTS, MAX_RING_SLOTS);
        self.buffer.target_depth = self.buffer.target_depth.max(1);
        self.buffer.max_depth = self.buffer.max_depth.max(self.buffer.target_depth);

        self.cache.max_frames = self.cache.max_frames.max(1);
        self.output_width = self.output_width.max(1);
        self.output_height = self.output_height.max(1);
        self
    }

    pub fn decode_timeout(&self) -> Duration {
        Duration::from_millis(self.decode_timeout_ms)
    }
}

/// Master clock settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Initial playback rate.
    pub playback_rate: f64,
    /// Project frame rate; sets drift thresholds and decode cadence.
    pub frame_rate: FrameRate,
    /// Presentation ticks per second.
    pub refresh_hz: u32,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            playback_rate: 1.0,
            frame_rate: FrameRate::FPS_30,
            refresh_hz: 60,
        }
    }
}

impl ClockConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.refresh_hz.max(1) as f64)
    }
}

/// Decode worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Requested workers; clamped to hardware concurrency.
    pub worker_count: usize,
    /// Requests a single worker may hold before new work is queued.
    pub max_in_flight_per_worker: usize,
    /// How long a worker may take to acknowledge `Init`.
    pub handshake_timeout_ms: u64,
    /// Start the pool with the workers that did come up instead of failing.
    pub allow_partial_start: bool,
    /// Bitmap cache bounds (decoder side, separate from the frame cache).
    pub bitmap_cache_frames: usize,
    pub bitmap_cache_bytes: usize,
    /// Rate used to quantize bitmap cache keys.
    pub bitmap_cache_rate: FrameRate,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_in_flight_per_worker: 2,
            handshake_timeout_ms: 5_000,
            allow_partial_start: false,
            bitmap_cache_frames: 64,
            bitmap_cache_bytes: memory_budget::BITMAP_CACHE_SIZE,
            bitmap_cache_rate: FrameRate::FPS_30,
        }
    }
}

impl PoolConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Frame cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_frames: usize,
    pub max_size_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_frames: memory_budget::MAX_CACHED_FRAMES,
            max_size_bytes: memory_budget::FRAME_CACHE_SIZE,
        }
    }
}

/// Ring buffer and lookahead settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Slots per presentation ring buffer, 2 to 8.
    pub ring_slots: usize,
    /// Lookahead depth the decode loop aims for.
    pub target_depth: usize,
    /// Lookahead depth past which the front is trimmed.
    pub max_depth: usize,
    /// Overall bound on waiting for the lookahead to fill.
    pub fill_timeout_ms: u64,
    /// Granularity of the bounded fill wait.
    pub fill_poll_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            ring_slots: 3,
            target_depth: memory_budget::LOOKAHEAD_FRAMES,
            max_depth: 12,
            fill_timeout_ms: 3_000,
            fill_poll_ms: 16,
        }
    }
}

impl BufferConfig {
    pub fn fill_timeout(&self) -> Duration {
        Duration::from_millis(self.fill_timeout_ms)
    }

    pub fn fill_poll(&self) -> Duration {
        Duration::from_millis(self.fill_poll_ms.max(1))
    }

    /// Fill level required before `play` starts the clock.
    pub fn play_threshold(&self) -> usize {
        (self.target_depth / 2).max(1)
    }

    /// Fill level required before a seek resumes playback.
    pub fn seek_threshold(&self) -> usize {
        (self.target_depth / 4).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_memory_constants() {
        let config = PlaybackConfig::default();
        assert_eq!(config.pool.worker_count, 4);
        assert_eq!(config.pool.max_in_flight_per_worker, 2);
        assert_eq!(config.cache.max_frames, 100);
        assert_eq!(config.buffer.play_threshold(), 4);
        assert_eq!(config.buffer.seek_threshold(), 2);
    }

    #[test]
    fn partial_json_fills_defaults_and_clamps() {
        let json = r#"{
            "clock": { "playback_rate": 40.0 },
            "buffer": { "ring_slots": 20, "target_depth": 8, "max_depth": 2 },
            "pool": { "worker_count": 0 }
        }"#;
        let config = PlaybackConfig::from_json(json).unwrap();
        assert_eq!(config.clock.playback_rate, MAX_PLAYBACK_RATE);
        assert_eq!(config.clock.refresh_hz, 60);
        assert_eq!(config.buffer.ring_slots, MAX_RING_SLOTS);
        assert_eq!(config.buffer.max_depth, 8);
        assert_eq!(config.pool.worker_count, 1);
        assert_eq!(config.output_width, 1920);
    }

    #[test]
    fn malformed_json_is_a_serialization_error() {
        let err = PlaybackConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, ProEditError::Serialization(_)));
    }
}
