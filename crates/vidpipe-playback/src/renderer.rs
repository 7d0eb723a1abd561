//! Frame presentation onto a render surface.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};
use vidpipe_core::{
    PixelFormat, PlaybackError, RenderMode, SharedClock, SharedFrame, StreamInfo, SystemClock,
};

/// Number of render calls averaged by [`FrameRenderer::average_render_time_us`].
pub const RENDER_TIME_WINDOW: usize = 60;

const FPS_WINDOW_US: u64 = 1_000_000;

/// A display target that accepts frames.
///
/// The GPU or windowing backend lives behind this trait; the pipeline only
/// pushes pixels at it.
pub trait RenderSurface: Send {
    /// Whether the surface can accept a frame right now.
    fn is_ready(&self) -> bool;

    /// Fixed surface size, or `None` if any size is accepted.
    fn size(&self) -> Option<(u32, u32)>;

    /// Adapt to a newly loaded stream. Surfaces with a fixed size ignore this.
    fn configure(&mut self, _width: u32, _height: u32) {}

    /// Copy `pixels` out. The caller keeps ownership of the frame.
    fn upload(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<(), PlaybackError>;

    /// Take a shared handle to the frame. The surface may hold it until the
    /// next hand-off or [`RenderSurface::release`].
    fn hand_off(&mut self, frame: SharedFrame) -> Result<(), PlaybackError>;

    /// Drop anything held from the current session.
    fn release(&mut self);
}

#[derive(Debug, Default)]
struct MemorySurfaceState {
    width: u32,
    height: u32,
    resizable: bool,
    ready: bool,
    format: PixelFormat,
    pixels: Vec<u8>,
    held: Option<SharedFrame>,
    presented: u64,
}

/// CPU-side surface keeping the last presented image in memory.
///
/// Clones share state, so a caller can keep a clone to inspect what the
/// renderer presented.
#[derive(Debug, Clone)]
pub struct MemorySurface {
    state: Arc<Mutex<MemorySurfaceState>>,
}

impl MemorySurface {
    /// Fixed-size surface. Frames of any other size are rejected.
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_state(MemorySurfaceState {
            width,
            height,
            ready: true,
            ..Default::default()
        })
    }

    /// Surface that takes the size of each loaded stream.
    pub fn matching_stream() -> Self {
        Self::with_state(MemorySurfaceState {
            resizable: true,
            ready: true,
            ..Default::default()
        })
    }

    fn with_state(state: MemorySurfaceState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.state.lock().ready = ready;
    }

    /// Number of frames accepted since creation.
    pub fn presented(&self) -> u64 {
        self.state.lock().presented
    }

    /// Pixels of the last copied frame.
    pub fn last_pixels(&self) -> Option<Vec<u8>> {
        let state = self.state.lock();
        (!state.pixels.is_empty()).then(|| state.pixels.clone())
    }

    /// Frame currently held through a hand-off.
    pub fn held_frame(&self) -> Option<SharedFrame> {
        self.state.lock().held.clone()
    }

    pub fn format(&self) -> PixelFormat {
        self.state.lock().format
    }
}

impl RenderSurface for MemorySurface {
    fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    fn size(&self) -> Option<(u32, u32)> {
        let state = self.state.lock();
        Some((state.width, state.height))
    }

    fn configure(&mut self, width: u32, height: u32) {
        let mut state = self.state.lock();
        if state.resizable {
            state.width = width;
            state.height = height;
        }
    }

    fn upload(
        &mut self,
        pixels: &[u8],
        _width: u32,
        _height: u32,
        format: PixelFormat,
    ) -> Result<(), PlaybackError> {
        let mut state = self.state.lock();
        state.pixels.clear();
        state.pixels.extend_from_slice(pixels);
        state.format = format;
        state.held = None;
        state.presented += 1;
        Ok(())
    }

    fn hand_off(&mut self, frame: SharedFrame) -> Result<(), PlaybackError> {
        let mut state = self.state.lock();
        state.format = frame.format;
        state.held = Some(frame);
        state.presented += 1;
        Ok(())
    }

    fn release(&mut self) {
        let mut state = self.state.lock();
        state.held = None;
        state.pixels = Vec::new();
    }
}

/// Surface that accepts every frame and discards it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSurface;

impl RenderSurface for NullSurface {
    fn is_ready(&self) -> bool {
        true
    }

    fn size(&self) -> Option<(u32, u32)> {
        None
    }

    fn upload(&mut self, _: &[u8], _: u32, _: u32, _: PixelFormat) -> Result<(), PlaybackError> {
        Ok(())
    }

    fn hand_off(&mut self, _frame: SharedFrame) -> Result<(), PlaybackError> {
        Ok(())
    }

    fn release(&mut self) {}
}

/// Pushes frames to a [`RenderSurface`] and keeps rolling render metrics.
pub struct FrameRenderer {
    surface: Box<dyn RenderSurface>,
    mode: RenderMode,
    clock: SharedClock,
    /// Completion times of recent successful renders.
    rendered_at: VecDeque<u64>,
    render_times: VecDeque<u64>,
    frames_rendered: u64,
    failed_renders: u64,
}

impl FrameRenderer {
    pub fn new(surface: Box<dyn RenderSurface>, mode: RenderMode) -> Self {
        Self {
            surface,
            mode,
            clock: SystemClock::shared(),
            rendered_at: VecDeque::new(),
            render_times: VecDeque::with_capacity(RENDER_TIME_WINDOW),
            frames_rendered: 0,
            failed_renders: 0,
        }
    }

    /// Measure on `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn set_clock(&mut self, clock: SharedClock) {
        self.clock = clock;
    }

    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    /// Prepare the surface for a newly loaded stream.
    pub fn configure(&mut self, info: &StreamInfo) {
        self.surface.configure(info.width, info.height);
    }

    /// Present `frame`. Returns `false` if the surface refused it.
    pub fn render_frame(&mut self, frame: &SharedFrame) -> bool {
        match self.try_render(frame) {
            Ok(()) => true,
            Err(PlaybackError::RenderTargetNotReady) => {
                trace!(frame = frame.frame_number, "Render target not ready");
                self.failed_renders += 1;
                false
            }
            Err(e) => {
                debug!(frame = frame.frame_number, "Render failed: {e}");
                self.failed_renders += 1;
                false
            }
        }
    }

    fn try_render(&mut self, frame: &SharedFrame) -> Result<(), PlaybackError> {
        if !self.surface.is_ready() {
            return Err(PlaybackError::RenderTargetNotReady);
        }
        if let Some((surface_width, surface_height)) = self.surface.size() {
            if frame.width != surface_width || frame.height != surface_height {
                return Err(PlaybackError::DimensionMismatch {
                    frame_width: frame.width,
                    frame_height: frame.height,
                    surface_width,
                    surface_height,
                });
            }
        }

        let started = self.clock.now_us();
        match self.mode {
            RenderMode::Copy => {
                self.surface
                    .upload(frame.pixels(), frame.width, frame.height, frame.format)?
            }
            RenderMode::HandOff => self.surface.hand_off(Arc::clone(frame))?,
        }
        let finished = self.clock.now_us();

        self.record(finished.saturating_sub(started), finished);
        Ok(())
    }

    fn record(&mut self, render_time_us: u64, finished_us: u64) {
        self.frames_rendered += 1;

        if self.render_times.len() == RENDER_TIME_WINDOW {
            self.render_times.pop_front();
        }
        self.render_times.push_back(render_time_us);

        self.rendered_at.push_back(finished_us);
        self.expire(finished_us);
    }

    fn expire(&mut self, now_us: u64) {
        while let Some(&oldest) = self.rendered_at.front() {
            if now_us.saturating_sub(oldest) < FPS_WINDOW_US {
                break;
            }
            self.rendered_at.pop_front();
        }
    }

    /// Successful renders within the last second.
    pub fn current_fps(&self) -> f64 {
        let now_us = self.clock.now_us();
        self.rendered_at
            .iter()
            .rev()
            .take_while(|&&at| now_us.saturating_sub(at) < FPS_WINDOW_US)
            .count() as f64
    }

    /// Mean duration of the last [`RENDER_TIME_WINDOW`] renders.
    pub fn average_render_time_us(&self) -> f64 {
        if self.render_times.is_empty() {
            return 0.0;
        }
        self.render_times.iter().sum::<u64>() as f64 / self.render_times.len() as f64
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn failed_renders(&self) -> u64 {
        self.failed_renders
    }

    /// Release the surface's session state and clear all metrics.
    pub fn reset(&mut self) {
        self.surface.release();
        self.rendered_at.clear();
        self.render_times.clear();
        self.frames_rendered = 0;
        self.failed_renders = 0;
        debug!("Renderer reset");
    }
}
