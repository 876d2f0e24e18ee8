//! Frame buffer types for decoded video frames in CPU memory.
//!
//! Pixel data is always packed RGBA8. A [`FrameBuffer`] is the owned pixel
//! storage; a [`DecodedImage`] is the handle that moves through the playback
//! pipeline. The buffer is released when the last handle is dropped.

use std::sync::{Arc, Weak};

/// Bytes per RGBA8 pixel.
pub const BYTES_PER_PIXEL: usize = 4;

/// A packed RGBA8 frame in CPU memory.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Bytes per row (may include padding)
    pub stride: usize,
    /// Raw pixel data, `stride * height` bytes
    pub data: Vec<u8>,
}

impl FrameBuffer {
    /// Create a zeroed frame buffer.
    pub fn new(width: u32, height: u32) -> Self {
        // Align stride to 64 bytes for SIMD and GPU upload
        let min_stride = width as usize * BYTES_PER_PIXEL;
        let stride = (min_stride + 63) & !63;
        Self {
            width,
            height,
            stride,
            data: vec![0u8; stride * height as usize],
        }
    }

    /// Create a frame filled with a single colour.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let mut frame = Self::new(width, height);
        for y in 0..height {
            frame.pixels_mut(y).fill(rgba);
        }
        frame
    }

    /// Total memory usage of this frame in bytes.
    pub fn memory_size(&self) -> usize {
        self.data.len()
    }

    /// Get a row of pixel data.
    #[inline]
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        &self.data[start..start + self.width as usize * BYTES_PER_PIXEL]
    }

    /// Get a row as RGBA pixels.
    #[inline]
    pub fn pixels(&self, y: u32) -> &[[u8; 4]] {
        bytemuck::cast_slice(self.row(y))
    }

    /// Get a mutable row as RGBA pixels.
    #[inline]
    pub fn pixels_mut(&mut self, y: u32) -> &mut [[u8; 4]] {
        let start = y as usize * self.stride;
        let end = start + self.width as usize * BYTES_PER_PIXEL;
        bytemuck::cast_slice_mut(&mut self.data[start..end])
    }

    /// Colour bars with a marker bar whose position encodes `seed`.
    ///
    /// Used by synthetic decoders so tests can tell frames apart by pixels.
    pub fn test_pattern(width: u32, height: u32, seed: u64) -> Self {
        const BARS: [[u8; 4]; 8] = [
            [255, 255, 255, 255], // White
            [255, 255, 0, 255],   // Yellow
            [0, 255, 255, 255],   // Cyan
            [0, 255, 0, 255],     // Green
            [255, 0, 255, 255],   // Magenta
            [255, 0, 0, 255],     // Red
            [0, 0, 255, 255],     // Blue
            [0, 0, 0, 255],       // Black
        ];
        let mut frame = Self::new(width, height);
        if width == 0 {
            return frame;
        }
        let marker = (seed % width as u64) as usize;
        for y in 0..height {
            let row = frame.pixels_mut(y);
            for (x, px) in row.iter_mut().enumerate() {
                *px = BARS[x * 8 / width as usize];
            }
            row[marker] = [(seed & 0xff) as u8, ((seed >> 8) & 0xff) as u8, 128, 255];
        }
        frame
    }
}

/// Handle to a decoded image owned by the playback pipeline.
///
/// Cloning shares the underlying pixel buffer; the buffer is freed exactly
/// when the last handle is dropped or [`release`](Self::release)d. Holders
/// outside the pipeline only ever receive `&DecodedImage`.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    buffer: Arc<FrameBuffer>,
}

impl DecodedImage {
    pub fn new(buffer: FrameBuffer) -> Self {
        Self {
            buffer: Arc::new(buffer),
        }
    }

    pub fn width(&self) -> u32 {
        self.buffer.width
    }

    pub fn height(&self) -> u32 {
        self.buffer.height
    }

    /// Pixel bytes held by this image.
    pub fn size_bytes(&self) -> usize {
        self.buffer.memory_size()
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    /// Number of live handles sharing this buffer.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.buffer)
    }

    /// Observe the buffer's lifetime without keeping it alive.
    pub fn watch(&self) -> ImageWatch {
        ImageWatch(Arc::downgrade(&self.buffer))
    }

    /// Give up this handle.
    pub fn release(self) {
        drop(self);
    }
}

impl From<FrameBuffer> for DecodedImage {
    fn from(buffer: FrameBuffer) -> Self {
        Self::new(buffer)
    }
}

/// Weak observer for a [`DecodedImage`]'s buffer.
#[derive(Debug, Clone)]
pub struct ImageWatch(Weak<FrameBuffer>);

impl ImageWatch {
    /// True once every handle to the buffer is gone.
    pub fn is_released(&self) -> bool {
        self.0.strong_count() == 0
    }
}
