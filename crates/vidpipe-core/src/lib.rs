//! vidpipe Core - Foundation types for the playback pipeline
//!
//! This crate provides the types shared by the decode and presentation sides:
//! - Time representation (RationalTime, FrameRate)
//! - Owned pixel buffers and decoded frames, with allocation accounting
//! - Stream metadata
//! - Playback configuration
//! - Clocks for pacing (system and simulated)

pub mod clock;
pub mod config;
pub mod error;
pub mod frame;
pub mod stream;
pub mod time;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{EndOfStreamPolicy, PlaybackConfig, RenderMode};
pub use error::{ConfigError, PlaybackError, Result, SourceError};
pub use frame::{BufferLedger, DecodedFrame, LedgerSnapshot, PixelBuffer, PixelFormat, SharedFrame};
pub use stream::StreamInfo;
pub use time::{FrameRate, RationalTime};

/// Defaults shared by the decoder, the frame buffer and the scheduler.
pub mod defaults {
    /// Frames decoded per batch before a send.
    pub const BATCH_SIZE: usize = 3;

    /// Frame buffer capacity. 4K RGBA is ~33MB per frame, so 15 frames
    /// stays around 500MB in the worst case.
    pub const MAX_BUFFER_SIZE: usize = 15;

    /// Frames awaited after load before the session is `Ready`.
    pub const INITIAL_BUFFER_FRAMES: usize = 5;

    /// Presentation tick interval.
    pub const TICK_INTERVAL_US: u64 = 100;

    /// Decoder yield between batches.
    pub const YIELD_INTERVAL_US: u64 = 100;

    pub const LOAD_TIMEOUT_MS: u64 = 5_000;
    pub const INITIAL_BUFFER_WAIT_TIMEOUT_MS: u64 = 2_000;
    pub const DISPOSE_GRACE_MS: u64 = 500;
    pub const SEEK_SETTLE_DELAY_MS: u64 = 50;

    /// Batches allowed in flight on the data channel.
    pub const DATA_CHANNEL_CAPACITY: usize = 4;
}
