//! Timeline-ordered lookahead of decoded frames.
//!
//! Decode results arrive out of order (several clips, several workers). The
//! queue keeps them sorted by timestamp with binary-search insertion, so the
//! presentation side can rely on order instead of on arrival.

use crate::clip::DecodedFrame;
use std::collections::{HashMap, VecDeque};
use tracing::trace;

/// Tolerance when deciding whether a frame is due.
const DUE_EPSILON: f64 = 1e-6;

/// Sorted frame lookahead, bounded by `max_depth`.
#[derive(Debug)]
pub struct FrameQueue {
    frames: VecDeque<DecodedFrame>,
    max_depth: usize,
    /// Last timestamp handed out per track.
    shown: HashMap<usize, f64>,
    trimmed: u64,
    stale: u64,
}

impl FrameQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(max_depth + 1),
            max_depth: max_depth.max(1),
            shown: HashMap::new(),
            trimmed: 0,
            stale: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Free room before the queue reaches `max_depth`.
    pub fn free(&self) -> usize {
        self.max_depth.saturating_sub(self.frames.len())
    }

    /// Frames discarded by trimming.
    pub fn trimmed(&self) -> u64 {
        self.trimmed
    }

    /// Frames rejected for arriving behind the playhead.
    pub fn stale(&self) -> u64 {
        self.stale
    }

    /// Insert in timestamp order. Frames older than what their track already
    /// showed are released immediately; a frame for an already-queued
    /// `(clip, frame_number)` replaces it. Returns whether the frame was kept.
    pub fn insert(&mut self, frame: DecodedFrame) -> bool {
        if let Some(&shown) = self.shown.get(&frame.track) {
            if frame.timestamp < shown {
                self.stale += 1;
                frame.close();
                return false;
            }
        }
        if let Some(pos) = self
            .frames
            .iter()
            .position(|f| f.clip_id == frame.clip_id && f.frame_number == frame.frame_number)
        {
            self.frames[pos] = frame;
            return true;
        }

        let pos = self.frames.partition_point(|f| f.timestamp <= frame.timestamp);
        self.frames.insert(pos, frame);
        self.trim_front();
        true
    }

    /// Release frames from the front until within `max_depth`.
    pub fn trim_front(&mut self) {
        while self.frames.len() > self.max_depth {
            if let Some(old) = self.frames.pop_front() {
                trace!(ts = old.timestamp, "Trimmed lookahead");
                self.trimmed += 1;
                old.close();
            }
        }
    }

    /// For each track, pick the newest frame due at `t` and
    /// release every frame on that track strictly older than it. Frames of
    /// clips that ended by `t` are released and never picked, so a track
    /// whose clip is gone drops out of the result. Picked frames stay queued
    /// until superseded; the returned frames share their images. Sorted by
    /// track.
    pub fn select_at(&mut self, t: f64) -> Vec<DecodedFrame> {
        let before = self.frames.len();
        self.frames.retain(|f| f.is_visible_at(t + DUE_EPSILON));
        if self.frames.len() < before {
            trace!(t, released = before - self.frames.len(), "Released frames of ended clips");
        }

        let mut chosen: HashMap<usize, f64> = HashMap::new();
        for frame in self.frames.iter().rev() {
            if frame.timestamp <= t + DUE_EPSILON {
                chosen.entry(frame.track).or_insert(frame.timestamp);
            }
        }
        if chosen.is_empty() {
            return Vec::new();
        }

        self.frames.retain(|f| match chosen.get(&f.track) {
            Some(&ts) => f.timestamp >= ts,
            None => true,
        });

        let mut picked: Vec<DecodedFrame> = Vec::with_capacity(chosen.len());
        for frame in &self.frames {
            if chosen.get(&frame.track) == Some(&frame.timestamp)
                && !picked.iter().any(|p| p.track == frame.track)
            {
                picked.push(frame.clone());
            }
        }
        for frame in &picked {
            self.shown.insert(frame.track, frame.timestamp);
        }
        picked.sort_by_key(|f| f.track);
        picked
    }

    /// Timestamp of the newest queued frame.
    pub fn newest(&self) -> Option<f64> {
        self.frames.back().map(|f| f.timestamp)
    }

    /// Release everything and forget what was shown.
    pub fn clear(&mut self) -> usize {
        let released = self.frames.len();
        self.frames.clear();
        self.shown.clear();
        released
    }

    pub fn iter(&self) -> impl Iterator<Item = &DecodedFrame> {
        self.frames.iter()
    }
}
