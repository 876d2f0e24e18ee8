//! Clip placement and decoded frame types.
//!
//! The timeline model itself lives outside this crate; playback only needs to
//! know where each clip sits and which part of its source it shows.

use proedit_core::DecodedImage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reference to a media source a decoder can open.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    /// Identity of the media item; frame cache entries are owned by it.
    pub media_id: Uuid,
    /// Location handed to the decoder (path, URL, blob id).
    pub uri: String,
}

impl SourceRef {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            media_id: Uuid::new_v4(),
            uri: uri.into(),
        }
    }
}

/// A clip placed on the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    pub id: Uuid,
    /// Track index; lower tracks are composited under higher ones.
    pub track: usize,
    pub source: SourceRef,
    /// Timeline position of the first frame (seconds).
    pub start_time: f64,
    /// Source position shown at `start_time` (seconds).
    pub in_point: f64,
    /// Timeline duration (seconds).
    pub duration: f64,
}

impl Clip {
    pub fn new(
        source: SourceRef,
        track: usize,
        start_time: f64,
        in_point: f64,
        duration: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            track,
            source,
            start_time,
            in_point,
            duration: duration.max(0.0),
        }
    }

    /// Timeline time (exclusive) where the clip ends.
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }

    /// Whether the clip is visible at timeline time `t`.
    pub fn contains(&self, t: f64) -> bool {
        t >= self.start_time && t < self.end_time()
    }

    /// Whether any part of the clip lies in `[t, ∞)`.
    pub fn overlaps_from(&self, t: f64) -> bool {
        self.end_time() > t
    }

    pub fn to_source_time(&self, timeline: f64) -> f64 {
        self.in_point + (timeline - self.start_time)
    }

    pub fn to_timeline_time(&self, source: f64) -> f64 {
        self.start_time + (source - self.in_point)
    }
}

/// End of the last clip, i.e. the timeline duration.
pub fn timeline_duration(clips: &[Clip]) -> f64 {
    clips.iter().map(Clip::end_time).fold(0.0, f64::max)
}

/// A decoded frame positioned on the timeline.
///
/// Owns its image handle; dropping the frame releases it.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub image: DecodedImage,
    /// Timeline seconds.
    pub timestamp: f64,
    /// Frame number at the project rate.
    pub frame_number: i64,
    pub track: usize,
    pub clip_id: Uuid,
    /// Timeline time (exclusive) after which the frame's clip is gone.
    pub visible_until: f64,
}

impl DecodedFrame {
    pub fn new(image: DecodedImage, timestamp: f64, frame_number: i64) -> Self {
        Self {
            image,
            timestamp,
            frame_number,
            track: 0,
            clip_id: Uuid::nil(),
            visible_until: f64::INFINITY,
        }
    }

    pub fn on_track(mut self, track: usize, clip_id: Uuid) -> Self {
        self.track = track;
        self.clip_id = clip_id;
        self
    }

    /// Mark the frame as belonging to a clip that ends at `end`.
    pub fn ending_at(mut self, end: f64) -> Self {
        self.visible_until = end;
        self
    }

    /// Whether the frame's clip is still on screen at `t`.
    pub fn is_visible_at(&self, t: f64) -> bool {
        t < self.visible_until
    }

    /// Release the image now instead of at end of scope.
    pub fn close(self) {
        self.image.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_mapping_round_trips_through_offsets() {
        let clip = Clip::new(SourceRef::new("a.mp4"), 0, 4.0, 10.0, 3.0);
        assert_eq!(clip.to_source_time(5.5), 11.5);
        assert_eq!(clip.to_timeline_time(11.5), 5.5);
        assert!(clip.contains(4.0));
        assert!(!clip.contains(7.0));
        assert!(clip.overlaps_from(6.9));
        assert!(!clip.overlaps_from(7.0));
    }

    #[test]
    fn duration_is_last_clip_end() {
        let source = SourceRef::new("a.mp4");
        let clips = vec![
            Clip::new(source.clone(), 0, 0.0, 0.0, 5.0),
            Clip::new(source, 1, 3.0, 0.0, 4.0),
        ];
        assert_eq!(timeline_duration(&clips), 7.0);
        assert_eq!(timeline_duration(&[]), 0.0);
    }
}
