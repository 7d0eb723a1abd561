//! vidpipe Media - video sources and the decode worker
//!
//! This crate handles:
//! - The `VideoSource` abstraction over sequential frame readers
//! - An ffmpeg-backed source and a synthetic test-pattern source
//! - Pixel conversion into the presentation format
//! - The decode worker that streams frame batches to a consumer

pub mod convert;
pub mod decoder;
pub mod ffmpeg;
pub mod pattern;
pub mod source;

pub use convert::{convert_frame, ConvertError};
pub use decoder::{
    spawn_decoder, ControlCommand, DecoderConfig, DecoderEvent, DecoderHandle, DecoderWorker,
    DECODE_THREAD_NAME,
};
pub use ffmpeg::FfmpegSource;
pub use pattern::{frame_marker, PatternSource, PatternSpec};
pub use source::{RawFrame, SourceOpener, VideoSource};
