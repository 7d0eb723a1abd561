//! The sequential frame reader consumed by the decode worker.

use std::path::Path;
use std::sync::Arc;
use vidpipe_core::{PixelFormat, SourceError, StreamInfo};

/// One frame as read from a source, before conversion.
///
/// Borrows the source's scratch memory; the decode worker copies it into an
/// owned buffer before the next read.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub frame_number: usize,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: &'a [u8],
}

/// A video file opened for sequential reading.
///
/// Implementations are owned by exactly one decode worker and are never
/// shared between threads, so only `Send` is required.
pub trait VideoSource: Send {
    /// Stream metadata, fixed once the source is open.
    fn info(&self) -> &StreamInfo;

    /// Read the next frame, or `None` at end of stream.
    fn read_frame(&mut self) -> Result<Option<RawFrame<'_>>, SourceError>;

    /// Reposition so the next read returns frame `frame`.
    fn seek(&mut self, frame: usize) -> Result<(), SourceError>;

    /// Index of the frame the next read will return.
    fn position(&self) -> usize;
}

/// Factory used by the decode worker to open its source on its own thread.
pub type SourceOpener =
    Arc<dyn Fn(&Path) -> Result<Box<dyn VideoSource>, SourceError> + Send + Sync>;
