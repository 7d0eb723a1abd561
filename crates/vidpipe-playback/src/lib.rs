//! vidpipe Playback - buffering and presentation
//!
//! - [`FrameBuffer`]: bounded, thread-safe store of decoded frames
//! - [`FrameRenderer`]: pushes frames to a [`RenderSurface`]
//! - [`DecodeSession`]: decode and ingest threads for one loaded video
//! - [`PlaybackScheduler`]: lifecycle, seeking and frame pacing

pub mod frame_buffer;
pub mod renderer;
pub mod scheduler;
pub mod session;

pub use frame_buffer::FrameBuffer;
pub use renderer::{FrameRenderer, MemorySurface, NullSurface, RenderSurface};
pub use scheduler::{
    PerformanceMetrics, PlaybackCallbacks, PlaybackScheduler, PlaybackState, PlaybackStatus,
};
pub use session::{DecodeSession, SessionEvent, Shutdown};
