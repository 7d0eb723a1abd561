//! Playback configuration.

use crate::defaults;
use crate::error::ConfigError;
use crate::frame::PixelFormat;
use crate::time::FrameRate;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What the decoder does when the source runs out of frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndOfStreamPolicy {
    /// Report end of stream once, then wait for a seek or stop.
    #[default]
    Hold,
    /// Seek back to frame 0 and keep decoding.
    Loop,
}

/// How the renderer passes pixels to its surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    /// The surface copies the pixels out; the frame stays owned by the buffer.
    #[default]
    Copy,
    /// The surface receives a shared handle and may hold the frame.
    HandOff,
}

/// Configuration for a playback scheduler and the sessions it spawns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Frames decoded per batch.
    pub batch_size: usize,
    /// Frame buffer capacity.
    pub max_buffer_size: usize,
    /// Presentation rate override; the stream's own rate when `None`.
    pub target_fps: Option<f64>,
    /// Buffered frames awaited after load.
    pub initial_buffer_frames: usize,
    pub initial_buffer_wait_timeout_ms: u64,
    /// Bound on waiting for the decoder to report stream info.
    pub load_timeout_ms: u64,
    /// Bound on waiting for the decoder to acknowledge a stop.
    pub dispose_grace_ms: u64,
    /// Delay before a paused seek renders its target.
    pub seek_settle_delay_ms: u64,
    pub tick_interval_us: u64,
    pub yield_interval_us: u64,
    /// Wrap to frame 0 after the last frame instead of pausing.
    pub looping: bool,
    pub end_of_stream: EndOfStreamPolicy,
    /// Format frames are converted to before buffering.
    pub presentation_format: PixelFormat,
    pub render_mode: RenderMode,
    /// Batches allowed in flight between decoder and buffer.
    pub data_channel_capacity: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::BATCH_SIZE,
            max_buffer_size: defaults::MAX_BUFFER_SIZE,
            target_fps: None,
            initial_buffer_frames: defaults::INITIAL_BUFFER_FRAMES,
            initial_buffer_wait_timeout_ms: defaults::INITIAL_BUFFER_WAIT_TIMEOUT_MS,
            load_timeout_ms: defaults::LOAD_TIMEOUT_MS,
            dispose_grace_ms: defaults::DISPOSE_GRACE_MS,
            seek_settle_delay_ms: defaults::SEEK_SETTLE_DELAY_MS,
            tick_interval_us: defaults::TICK_INTERVAL_US,
            yield_interval_us: defaults::YIELD_INTERVAL_US,
            looping: true,
            end_of_stream: EndOfStreamPolicy::Hold,
            presentation_format: PixelFormat::Rgba8,
            render_mode: RenderMode::Copy,
            data_channel_capacity: defaults::DATA_CHANNEL_CAPACITY,
        }
    }
}

impl PlaybackConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject values the pipeline can't run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be at least 1"));
        }
        if self.max_buffer_size == 0 {
            return Err(ConfigError::invalid("max_buffer_size", "must be at least 1"));
        }
        if let Some(fps) = self.target_fps {
            if !fps.is_finite() || fps <= 0.0 {
                return Err(ConfigError::invalid(
                    "target_fps",
                    format!("must be a positive number, got {fps}"),
                ));
            }
            if FrameRate::from_fps_f64(fps).is_none() {
                return Err(ConfigError::invalid(
                    "target_fps",
                    format!("{fps} is outside the supported range (0.001 to {})", u32::MAX),
                ));
            }
        }
        if self.data_channel_capacity == 0 {
            return Err(ConfigError::invalid(
                "data_channel_capacity",
                "must be at least 1",
            ));
        }
        if self.tick_interval_us == 0 {
            return Err(ConfigError::invalid("tick_interval_us", "must be non-zero"));
        }
        if !self.presentation_format.is_presentable() {
            return Err(ConfigError::invalid(
                "presentation_format",
                format!("{} is not a 4-channel format", self.presentation_format),
            ));
        }
        Ok(())
    }

    /// Presentation rate for a stream: the override if set, else the stream's rate.
    pub fn presentation_rate(&self, stream_rate: FrameRate) -> FrameRate {
        self.target_fps
            .and_then(FrameRate::from_fps_f64)
            .unwrap_or(stream_rate)
    }

    /// Initial fill target, never above the buffer capacity.
    pub fn initial_fill(&self) -> usize {
        self.initial_buffer_frames.min(self.max_buffer_size)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn initial_buffer_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_buffer_wait_timeout_ms)
    }

    pub fn dispose_grace(&self) -> Duration {
        Duration::from_millis(self.dispose_grace_ms)
    }

    pub fn seek_settle_delay(&self) -> Duration {
        Duration::from_millis(self.seek_settle_delay_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_micros(self.tick_interval_us)
    }

    pub fn yield_interval(&self) -> Duration {
        Duration::from_micros(self.yield_interval_us)
    }
}
