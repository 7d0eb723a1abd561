//! Error types for vidpipe.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for playback operations.
#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {timeout_ms}ms waiting for {path} to load")]
    LoadTimeout { path: PathBuf, timeout_ms: u64 },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Render target not ready")]
    RenderTargetNotReady,

    #[error("Buffer underrun at frame {frame}")]
    BufferUnderrun { frame: usize },

    #[error("Frame size {frame_width}x{frame_height} doesn't match surface size {surface_width}x{surface_height}")]
    DimensionMismatch {
        frame_width: u32,
        frame_height: u32,
        surface_width: u32,
        surface_height: u32,
    },

    #[error("Cannot {op} while {state}")]
    InvalidState { op: &'static str, state: String },

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors raised by a video source while opening, reading or seeking.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Video file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("Failed to start decoder process: {0}")]
    Spawn(String),

    #[error("Frame read failed: {0}")]
    Read(String),

    #[error("Seek target {target} out of range (0-{total})")]
    SeekOutOfRange { target: usize, total: usize },

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Config parse error: {0}")]
    Parse(String),

    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Result type alias for playback operations.
pub type Result<T> = std::result::Result<T, PlaybackError>;
