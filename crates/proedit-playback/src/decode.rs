//! Decode and composite primitives consumed by the pipeline.
//!
//! Actual codecs and the GPU compositor live elsewhere; playback reaches them
//! only through these traits. [`TestPatternDecoder`] is a synthetic
//! implementation for headless runs and tests.

use crate::clip::SourceRef;
use parking_lot::Mutex;
use proedit_core::{DecodedImage, FrameBuffer, FrameRate, ProEditError, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Per-clip decoder resources (demuxer, codec context) held by one worker.
pub trait ClipDecoder: Send {
    /// Decode the frame shown at source time `time`, scaled to `width`x`height`.
    fn decode(&mut self, time: f64, width: u32, height: u32) -> Result<DecodedImage>;
}

/// Decode primitive. Called concurrently from every worker thread.
pub trait FrameDecoder: Send + Sync + 'static {
    /// Worker-side setup, run once per worker during the startup handshake.
    fn init_worker(&self, _worker: usize) -> Result<()> {
        Ok(())
    }

    /// Cheap check that a source can be opened at all.
    fn probe(&self, _source: &SourceRef) -> Result<()> {
        Ok(())
    }

    /// Open per-clip resources.
    fn open(&self, source: &SourceRef) -> Result<Box<dyn ClipDecoder>>;
}

/// Frame-composite primitive: renders the whole project at a timeline time.
pub trait FrameCompositor: Send + Sync {
    fn render_frame(&self, time: f64, width: u32, height: u32) -> Result<DecodedImage>;
}

/// Synthetic decoder painting colour bars tagged with the frame number.
#[derive(Debug, Clone)]
pub struct TestPatternDecoder {
    rate: FrameRate,
    latency: Duration,
    init_delay: Duration,
    unsupported: Arc<HashSet<String>>,
    failing_frames: Arc<HashSet<i64>>,
    panic_frames: Arc<HashSet<i64>>,
    failing_workers: Arc<HashSet<usize>>,
    opens: Arc<AtomicUsize>,
    decodes: Arc<AtomicUsize>,
    decoded_times: Arc<Mutex<Vec<f64>>>,
}

impl TestPatternDecoder {
    pub fn new(rate: FrameRate) -> Self {
        Self {
            rate,
            latency: Duration::ZERO,
            init_delay: Duration::ZERO,
            unsupported: Arc::default(),
            failing_frames: Arc::default(),
            panic_frames: Arc::default(),
            failing_workers: Arc::default(),
            opens: Arc::default(),
            decodes: Arc::default(),
            decoded_times: Arc::default(),
        }
    }

    /// Simulated decode time per frame.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Simulated worker startup time.
    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }

    /// Sources whose probe/open fail as unsupported.
    pub fn with_unsupported(mut self, uris: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.unsupported = Arc::new(uris.into_iter().map(Into::into).collect());
        self
    }

    /// Frame numbers whose decode returns an error.
    pub fn with_failing_frames(mut self, frames: impl IntoIterator<Item = i64>) -> Self {
        self.failing_frames = Arc::new(frames.into_iter().collect());
        self
    }

    /// Frame numbers whose decode panics, killing the worker.
    pub fn with_panic_frames(mut self, frames: impl IntoIterator<Item = i64>) -> Self {
        self.panic_frames = Arc::new(frames.into_iter().collect());
        self
    }

    /// Workers whose startup fails.
    pub fn with_failing_workers(mut self, workers: impl IntoIterator<Item = usize>) -> Self {
        self.failing_workers = Arc::new(workers.into_iter().collect());
        self
    }

    /// How many per-clip decoders were opened.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }

    /// How many frames were actually decoded.
    pub fn decode_count(&self) -> usize {
        self.decodes.load(Ordering::Relaxed)
    }

    /// Source times of every successful decode, in completion order.
    pub fn decoded_times(&self) -> Vec<f64> {
        self.decoded_times.lock().clone()
    }

    fn check_supported(&self, source: &SourceRef) -> Result<()> {
        if self.unsupported.contains(&source.uri) {
            Err(ProEditError::UnsupportedFormat(source.uri.clone()))
        } else {
            Ok(())
        }
    }
}

impl FrameDecoder for TestPatternDecoder {
    fn init_worker(&self, worker: usize) -> Result<()> {
        if !self.init_delay.is_zero() {
            std::thread::sleep(self.init_delay);
        }
        if self.failing_workers.contains(&worker) {
            return Err(ProEditError::decoder(format!("worker {worker} has no decoder")));
        }
        Ok(())
    }

    fn probe(&self, source: &SourceRef) -> Result<()> {
        self.check_supported(source)
    }

    fn open(&self, source: &SourceRef) -> Result<Box<dyn ClipDecoder>> {
        self.check_supported(source)?;
        self.opens.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(PatternClip {
            decoder: self.clone(),
        }))
    }
}

struct PatternClip {
    decoder: TestPatternDecoder,
}

impl ClipDecoder for PatternClip {
    fn decode(&mut self, time: f64, width: u32, height: u32) -> Result<DecodedImage> {
        let d = &self.decoder;
        let frame = d.rate.nearest_frame(time);
        if !d.latency.is_zero() {
            std::thread::sleep(d.latency);
        }
        if d.panic_frames.contains(&frame) {
            panic!("decoder crashed on frame {frame}");
        }
        if d.failing_frames.contains(&frame) {
            return Err(ProEditError::decoder(format!("corrupt sample at frame {frame}")));
        }
        d.decodes.fetch_add(1, Ordering::Relaxed);
        d.decoded_times.lock().push(time);
        Ok(DecodedImage::new(FrameBuffer::test_pattern(
            width,
            height,
            frame.max(0) as u64,
        )))
    }
}

/// Compositor that paints a pattern keyed by the timeline frame.
#[derive(Debug, Clone)]
pub struct TestPatternCompositor {
    rate: FrameRate,
    renders: Arc<AtomicUsize>,
}

impl TestPatternCompositor {
    pub fn new(rate: FrameRate) -> Self {
        Self {
            rate,
            renders: Arc::default(),
        }
    }

    pub fn render_count(&self) -> usize {
        self.renders.load(Ordering::Relaxed)
    }
}

impl FrameCompositor for TestPatternCompositor {
    fn render_frame(&self, time: f64, width: u32, height: u32) -> Result<DecodedImage> {
        self.renders.fetch_add(1, Ordering::Relaxed);
        let frame = self.rate.nearest_frame(time).max(0) as u64;
        Ok(DecodedImage::new(FrameBuffer::test_pattern(width, height, frame)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_encodes_frame_number() {
        let decoder = TestPatternDecoder::new(FrameRate::FPS_30);
        let mut clip = decoder.open(&SourceRef::new("bars")).unwrap();
        let image = clip.decode(0.5, 64, 2).unwrap();
        assert_eq!(image.buffer().pixels(0)[15], [15, 0, 128, 255]);
        assert_eq!(decoder.open_count(), 1);
        assert_eq!(decoder.decode_count(), 1);
    }

    #[test]
    fn configured_failures() {
        let decoder = TestPatternDecoder::new(FrameRate::FPS_30)
            .with_unsupported(["broken.mov"])
            .with_failing_frames([3])
            .with_failing_workers([1]);
        assert!(matches!(
            decoder.probe(&SourceRef::new("broken.mov")),
            Err(ProEditError::UnsupportedFormat(_))
        ));
        let mut clip = decoder.open(&SourceRef::new("ok.mov")).unwrap();
        assert!(clip.decode(0.1, 4, 4).is_err());
        assert!(clip.decode(0.2, 4, 4).is_ok());
        assert!(decoder.init_worker(0).is_ok());
        assert!(decoder.init_worker(1).is_err());
    }
}
