//! Per-clip frame position streams.

use crate::clip::Clip;
use proedit_core::FrameRate;
use std::sync::Arc;

/// Slack for float error when turning times into frame numbers.
const FRAME_EPSILON: f64 = 1e-6;

/// One frame position a stream wants decoded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamSample {
    /// Timeline frame number at the project rate.
    pub frame_number: i64,
    pub timeline_time: f64,
    pub source_time: f64,
}

/// Walks a clip's frames in timeline order at the project rate.
#[derive(Debug, Clone)]
pub struct ClipStream {
    clip: Arc<Clip>,
    rate: FrameRate,
    next_frame: i64,
    /// Exclusive.
    end_frame: i64,
}

impl ClipStream {
    /// Stream positioned at the frame shown at timeline time `from`, ending
    /// at the clip end or at `until`, whichever comes first.
    pub fn open(clip: Arc<Clip>, rate: FrameRate, from: f64, until: Option<f64>) -> Self {
        let fps = rate.to_fps_f64();
        let first_in_clip = (clip.start_time * fps - FRAME_EPSILON).ceil() as i64;
        let at_from = (from * fps + FRAME_EPSILON).floor() as i64;
        let end = until.map_or(clip.end_time(), |u| u.min(clip.end_time()));
        Self {
            next_frame: first_in_clip.max(at_from),
            end_frame: (end * fps - FRAME_EPSILON).ceil() as i64,
            clip,
            rate,
        }
    }

    pub fn clip(&self) -> &Arc<Clip> {
        &self.clip
    }

    pub fn is_exhausted(&self) -> bool {
        self.next_frame >= self.end_frame
    }

    /// Frames left to produce.
    pub fn remaining(&self) -> usize {
        (self.end_frame - self.next_frame).max(0) as usize
    }

    /// Timeline time of the next sample.
    pub fn peek_time(&self) -> Option<f64> {
        (!self.is_exhausted()).then(|| self.rate.frame_start_secs(self.next_frame))
    }

    /// Take the next sample.
    pub fn advance(&mut self) -> Option<StreamSample> {
        if self.is_exhausted() {
            return None;
        }
        let frame_number = self.next_frame;
        self.next_frame += 1;
        let timeline_time = self.rate.frame_start_secs(frame_number);
        Some(StreamSample {
            frame_number,
            timeline_time,
            source_time: self.clip.to_source_time(timeline_time),
        })
    }
}
