//! ProEdit Core - Foundation types for the playback pipeline
//!
//! This crate provides the fundamental types used throughout ProEdit:
//! - Time representation (RationalTime, FrameRate)
//! - Frame buffers and decoded image handles
//! - The shared error type

pub mod error;
pub mod frame;
pub mod time;

pub use error::{ProEditError, Result};
pub use frame::{DecodedImage, FrameBuffer, ImageWatch, BYTES_PER_PIXEL};
pub use time::{FrameRate, RationalTime};

/// Memory budget constants for 8GB M1 Mac
pub mod memory_budget {
    /// Total frame cache budget (for decoded frames in RAM)
    pub const FRAME_CACHE_SIZE: usize = 512 * 1024 * 1024; // 512 MB

    /// Decoder-side bitmap cache budget
    pub const BITMAP_CACHE_SIZE: usize = 256 * 1024 * 1024; // 256 MB

    /// Number of frames to buffer ahead of the playhead
    pub const LOOKAHEAD_FRAMES: usize = 8;

    /// Maximum frames held in the frame cache regardless of size
    pub const MAX_CACHED_FRAMES: usize = 100;
}
