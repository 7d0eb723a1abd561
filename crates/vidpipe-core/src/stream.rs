//! Stream metadata reported by a video source.

use crate::frame::PixelFormat;
use crate::time::{FrameRate, RationalTime};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata for an opened video stream. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Source file path
    pub path: PathBuf,
    /// Number of decodable frames
    pub total_frames: usize,
    /// Native frame rate
    pub frame_rate: FrameRate,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Format frames are read in, before conversion
    pub pixel_format: PixelFormat,
}

impl StreamInfo {
    /// Stream frame rate as a float.
    #[inline]
    pub fn fps(&self) -> f64 {
        self.frame_rate.to_fps_f64()
    }

    /// Total duration (`total_frames / fps`).
    pub fn duration(&self) -> RationalTime {
        RationalTime::from_frames(self.total_frames as i64, self.frame_rate)
    }

    /// Presentation time of `frame`.
    pub fn time_of_frame(&self, frame: usize) -> RationalTime {
        RationalTime::from_frames(frame as i64, self.frame_rate)
    }

    /// Frame shown at `time`, clamped into the stream.
    pub fn frame_at_time(&self, time: RationalTime) -> usize {
        let frame = time.to_frames(self.frame_rate).max(0) as usize;
        self.clamp_frame(frame)
    }

    /// Clamp a frame index into `[0, total_frames)`.
    #[inline]
    pub fn clamp_frame(&self, frame: usize) -> usize {
        frame.min(self.total_frames.saturating_sub(1))
    }

    /// Bytes of one frame once converted to `format`.
    pub fn frame_size_bytes(&self, format: PixelFormat) -> usize {
        format.frame_size(self.width, self.height)
    }

    /// Whether the stream has at least one frame.
    pub fn has_frames(&self) -> bool {
        self.total_frames > 0
    }
}
