//! ProEdit Playback - frame production and presentation
//!
//! Turns pull-based, possibly slow frame decoding into smooth, time-accurate
//! playback:
//! - Master clock derived from wall time, with drift tracking
//! - Decode worker pool with least-busy dispatch and a bitmap cache
//! - Count- and byte-bounded LRU frame cache with a preload queue
//! - Per-track presentation ring buffers
//! - Orchestrator running the decode and presentation loops per session

pub mod cancel;
pub mod clip;
pub mod clock;
pub mod config;
pub mod decode;
pub mod decode_pool;
pub mod frame_cache;
pub mod frame_queue;
pub mod orchestrator;
pub mod preload;
pub mod ring_buffer;
pub mod stream;
mod worker;

pub use cancel::{CancelSource, CancelToken};
pub use clip::{timeline_duration, Clip, DecodedFrame, SourceRef};
pub use clock::{
    Clock, ClockEvent, ClockState, ClockTick, ManualTimeSource, SubscriptionId, SystemTimeSource,
    TimeSource,
};
pub use config::{BufferConfig, CacheConfig, ClockConfig, PlaybackConfig, PoolConfig};
pub use decode::{
    ClipDecoder, FrameCompositor, FrameDecoder, TestPatternCompositor, TestPatternDecoder,
};
pub use decode_pool::{DecodeRequest, DecodeWorkerPool, PoolStats};
pub use frame_cache::{CacheKey, CacheStats, CacheWeight, FrameCache};
pub use frame_queue::FrameQueue;
pub use orchestrator::{PlaybackOrchestrator, PlaybackState, PlaybackStats, PresentationSink};
pub use preload::{PreloadQueue, PreloadTarget, PreloadTask, Preloader};
pub use ring_buffer::{CompositeRingBuffer, CompositeStats, RingBuffer, RingStats};
pub use stream::{ClipStream, StreamSample};
