//! Presentation ring buffers.
//!
//! A [`RingBuffer`] is a fixed ring of 2 to 8 slots with two cursors:
//!
//! - `write_index`: next slot a writer fills
//! - `present_index`: next slot [`swap`](RingBuffer::swap) reveals
//!
//! The frame on screen is the one just behind `present_index`. Slots from
//! `present_index` up to `write_index` hold unread frames, so at most
//! `size - 1` frames can wait while one is displayed. Writers never block:
//! when every other slot is unread, the oldest unread frame becomes the
//! displayed one (a drop) so the write lands in the slot that just left the
//! screen. The slot being presented is never overwritten in place.
//!
//! [`CompositeRingBuffer`] bundles one buffer per track with one for the
//! composited output and swaps them together.

use crate::clip::DecodedFrame;
use crate::config::{MAX_RING_SLOTS, MIN_RING_SLOTS};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::trace;

/// Counters exposed for starvation detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RingStats {
    pub frames_written: u64,
    pub frames_presented: u64,
    pub frames_dropped: u64,
    pub fallbacks: u64,
    /// Running mean of `present time - last write time`.
    pub avg_latency_ms: f64,
    /// Unread frames waiting for `swap`.
    pub fill: usize,
    pub slots: usize,
}

/// Fixed-size drop-oldest frame ring.
#[derive(Debug)]
pub struct RingBuffer {
    slots: Vec<Option<DecodedFrame>>,
    write_index: usize,
    present_index: usize,
    unread: usize,
    last_write: Option<Instant>,
    last_presented: Option<f64>,
    latency_samples: u64,
    stats: RingStats,
}

impl RingBuffer {
    /// Create a ring with `size` slots, clamped to 2 to 8.
    pub fn new(size: usize) -> Self {
        let size = size.clamp(MIN_RING_SLOTS, MAX_RING_SLOTS);
        Self {
            slots: (0..size).map(|_| None).collect(),
            write_index: 0,
            present_index: 0,
            unread: 0,
            last_write: None,
            last_presented: None,
            latency_samples: 0,
            stats: RingStats {
                slots: size,
                ..RingStats::default()
            },
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Unread frames.
    pub fn fill(&self) -> usize {
        self.unread
    }

    pub fn has_unread(&self) -> bool {
        self.unread > 0
    }

    fn prev(&self, index: usize) -> usize {
        (index + self.size() - 1) % self.size()
    }

    fn next(&self, index: usize) -> usize {
        (index + 1) % self.size()
    }

    fn is_unread(&self, index: usize) -> bool {
        (index + self.size() - self.present_index) % self.size() < self.unread
    }

    /// Store a frame. Never blocks; sacrifices the oldest unread frame when
    /// full.
    pub fn write(&mut self, frame: DecodedFrame) {
        if self.unread == self.size() - 1 {
            // write_index is the displayed slot; move the display forward first
            self.present_index = self.next(self.present_index);
            self.unread -= 1;
            self.stats.frames_dropped += 1;
            trace!(dropped = self.stats.frames_dropped, "Ring buffer full, dropped oldest");
        }
        if let Some(old) = self.slots[self.write_index].replace(frame) {
            old.close();
        }
        self.write_index = self.next(self.write_index);
        self.unread += 1;
        self.stats.frames_written += 1;
        self.last_write = Some(Instant::now());
    }

    /// Reveal the next unread frame. Returns `false` when nothing new was
    /// buffered and the current frame stays on screen.
    pub fn swap(&mut self) -> bool {
        if self.unread == 0 {
            return false;
        }
        self.present_index = self.next(self.present_index);
        self.unread -= 1;
        true
    }

    /// The frame currently on screen, if any. Does not move the cursors.
    pub fn present(&mut self) -> Option<&DecodedFrame> {
        let index = self.prev(self.present_index);
        if self.slots[index].is_none() {
            return None;
        }
        self.record_present(index);
        self.slots[index].as_ref()
    }

    /// Like [`present`](Self::present), but degrades to the most recent stale
    /// frame behind the display, then to the oldest unread frame, instead of
    /// showing nothing. Never returns a frame older than one already shown.
    pub fn present_or_fallback(&mut self) -> Option<&DecodedFrame> {
        let displayed = self.prev(self.present_index);
        if self.slots[displayed].is_some() {
            self.record_present(displayed);
            return self.slots[displayed].as_ref();
        }

        let mut candidate = None;
        let mut index = displayed;
        for _ in 1..self.size() {
            index = self.prev(index);
            if !self.is_unread(index) && self.is_presentable(index) {
                candidate = Some(index);
                break;
            }
        }
        if candidate.is_none() && self.unread > 0 && self.is_presentable(self.present_index) {
            candidate = Some(self.present_index);
        }

        let index = candidate?;
        self.stats.fallbacks += 1;
        self.record_present(index);
        self.slots[index].as_ref()
    }

    fn is_presentable(&self, index: usize) -> bool {
        match (&self.slots[index], self.last_presented) {
            (Some(frame), Some(last)) => frame.timestamp >= last,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn record_present(&mut self, index: usize) {
        if let Some(frame) = &self.slots[index] {
            self.last_presented = Some(frame.timestamp);
        }
        self.stats.frames_presented += 1;
        if let Some(written) = self.last_write {
            let sample = written.elapsed().as_secs_f64() * 1000.0;
            self.latency_samples += 1;
            self.stats.avg_latency_ms +=
                (sample - self.stats.avg_latency_ms) / self.latency_samples as f64;
        }
    }

    /// Release every held frame and rewind both cursors. Returns how many
    /// frames were released.
    pub fn reset(&mut self) -> usize {
        let released = self
            .slots
            .iter_mut()
            .filter_map(Option::take)
            .map(DecodedFrame::close)
            .count();
        self.write_index = 0;
        self.present_index = 0;
        self.unread = 0;
        self.last_write = None;
        self.last_presented = None;
        released
    }

    /// Tear down, releasing every held frame.
    pub fn dispose(mut self) -> usize {
        self.reset()
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            fill: self.unread,
            ..self.stats
        }
    }
}

/// Per-track stats plus the composited output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositeStats {
    pub tracks: Vec<RingStats>,
    pub composite: RingStats,
}

impl CompositeStats {
    /// Drops across every buffer.
    pub fn total_dropped(&self) -> u64 {
        self.composite.frames_dropped + self.tracks.iter().map(|t| t.frames_dropped).sum::<u64>()
    }
}

/// One ring per track plus one for the composited frame.
#[derive(Debug)]
pub struct CompositeRingBuffer {
    tracks: Vec<RingBuffer>,
    composite: RingBuffer,
    slots: usize,
}

impl CompositeRingBuffer {
    pub fn new(tracks: usize, slots: usize) -> Self {
        Self {
            tracks: (0..tracks).map(|_| RingBuffer::new(slots)).collect(),
            composite: RingBuffer::new(slots),
            slots,
        }
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Grow to at least `count` track buffers.
    pub fn ensure_tracks(&mut self, count: usize) {
        while self.tracks.len() < count {
            self.tracks.push(RingBuffer::new(self.slots));
        }
    }

    pub fn track(&self, index: usize) -> Option<&RingBuffer> {
        self.tracks.get(index)
    }

    /// Track buffer, created on demand.
    pub fn track_mut(&mut self, index: usize) -> &mut RingBuffer {
        self.ensure_tracks(index + 1);
        &mut self.tracks[index]
    }

    pub fn composite(&self) -> &RingBuffer {
        &self.composite
    }

    pub fn composite_mut(&mut self) -> &mut RingBuffer {
        &mut self.composite
    }

    /// Advance every track and the composite in one step. Returns whether
    /// the composite revealed a new frame.
    pub fn swap_all(&mut self) -> bool {
        for track in &mut self.tracks {
            track.swap();
        }
        self.composite.swap()
    }

    /// Release every frame in every buffer.
    pub fn reset(&mut self) -> usize {
        self.tracks.iter_mut().map(RingBuffer::reset).sum::<usize>() + self.composite.reset()
    }

    pub fn stats(&self) -> CompositeStats {
        CompositeStats {
            tracks: self.tracks.iter().map(RingBuffer::stats).collect(),
            composite: self.composite.stats(),
        }
    }
}
