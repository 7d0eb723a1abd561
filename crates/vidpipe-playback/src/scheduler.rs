//! Playback orchestration and presentation pacing.
//!
//! The scheduler owns the decode session, the frame buffer and the renderer.
//! The host drives presentation by calling [`PlaybackScheduler::tick`] at the
//! configured tick interval (or [`PlaybackScheduler::run_for`], which ticks
//! and sleeps on the scheduler's clock). Each tick does constant work: drain
//! session events, one buffer lookup, at most one render.

use crate::frame_buffer::FrameBuffer;
use crate::renderer::{FrameRenderer, RenderSurface};
use crate::session::{DecodeSession, SessionEvent};
use crossbeam_channel::{RecvTimeoutError, TryRecvError};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use vidpipe_core::{
    BufferLedger, PlaybackConfig, PlaybackError, RationalTime, Result, SharedClock, StreamInfo,
    SystemClock,
};
use vidpipe_media::{FfmpegSource, SourceOpener};

/// Lifecycle of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackStatus {
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
    Disposed,
}

impl PlaybackStatus {
    fn has_session(self) -> bool {
        matches!(self, Self::Ready | Self::Playing | Self::Paused)
    }
}

impl fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Snapshot of the presentation position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlaybackState {
    pub current_frame: usize,
    pub is_playing: bool,
    pub last_presentation_us: u64,
    /// Buffer occupancy over capacity.
    pub buffer_health: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    /// Renders within the last second.
    pub fps: f64,
    pub average_render_time_us: f64,
    pub buffer_size: usize,
    pub buffer_health: f64,
    /// Ticks that found their frame missing.
    pub underruns: u64,
    pub frames_presented: u64,
}

/// Host callbacks, invoked synchronously on the thread driving the scheduler.
#[derive(Default)]
pub struct PlaybackCallbacks {
    on_frame_changed: Option<Box<dyn FnMut(usize) + Send>>,
    on_error: Option<Box<dyn FnMut(&str) + Send>>,
}

impl PlaybackCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the new current frame after each advance.
    pub fn on_frame_changed(mut self, callback: impl FnMut(usize) + Send + 'static) -> Self {
        self.on_frame_changed = Some(Box::new(callback));
        self
    }

    /// Called once per fatal error with a readable message.
    pub fn on_error(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    fn frame_changed(&mut self, frame: usize) {
        if let Some(callback) = self.on_frame_changed.as_mut() {
            callback(frame);
        }
    }

    fn error(&mut self, message: &str) {
        if let Some(callback) = self.on_error.as_mut() {
            callback(message);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingPreview {
    frame: usize,
    due_us: u64,
}

/// Drives playback of one video at a time.
pub struct PlaybackScheduler {
    config: PlaybackConfig,
    clock: SharedClock,
    opener: SourceOpener,
    ledger: BufferLedger,
    buffer: Arc<FrameBuffer>,
    renderer: FrameRenderer,
    callbacks: PlaybackCallbacks,
    session: Option<DecodeSession>,
    info: Option<StreamInfo>,
    /// Where the decoder actually ran out, when short of the probed count.
    end_frame: Option<usize>,
    status: PlaybackStatus,
    current_frame: usize,
    last_presentation_us: u64,
    next_due_us: u64,
    frame_interval_us: u64,
    preview: Option<PendingPreview>,
    stalled_on: Option<usize>,
    underruns: u64,
    frames_presented: u64,
}

impl PlaybackScheduler {
    /// Create an idle scheduler presenting onto `surface`.
    ///
    /// Uses the system clock and opens files with [`FfmpegSource`].
    pub fn new(
        config: PlaybackConfig,
        surface: Box<dyn RenderSurface>,
        callbacks: PlaybackCallbacks,
    ) -> Result<Self> {
        config.validate()?;
        let clock = SystemClock::shared();
        let renderer = FrameRenderer::new(surface, config.render_mode).with_clock(Arc::clone(&clock));

        Ok(Self {
            buffer: FrameBuffer::shared(config.max_buffer_size),
            config,
            clock,
            opener: Arc::new(FfmpegSource::open_boxed),
            ledger: BufferLedger::new(),
            renderer,
            callbacks,
            session: None,
            info: None,
            end_frame: None,
            status: PlaybackStatus::Idle,
            current_frame: 0,
            last_presentation_us: 0,
            next_due_us: 0,
            frame_interval_us: 0,
            preview: None,
            stalled_on: None,
            underruns: 0,
            frames_presented: 0,
        })
    }

    /// Pace against `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.renderer.set_clock(Arc::clone(&clock));
        self.clock = clock;
        self
    }

    /// Open videos with `opener` instead of ffmpeg.
    pub fn with_opener(mut self, opener: SourceOpener) -> Self {
        self.opener = opener;
        self
    }

    /// Account pixel buffers in `ledger`.
    pub fn with_ledger(mut self, ledger: BufferLedger) -> Self {
        self.ledger = ledger;
        self
    }

    /// Load `path`, replacing any loaded video.
    ///
    /// Blocks until the decoder reports the stream (bounded by the load
    /// timeout) and then for the initial buffer fill (bounded by its own
    /// timeout; a miss is logged only). On failure `on_error` is invoked once
    /// and the scheduler is left `Idle`.
    pub fn load_video(&mut self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        if self.status == PlaybackStatus::Disposed {
            warn!(path = %path.display(), "Load after dispose ignored");
            return false;
        }
        if self.session.is_some() {
            self.dispose_session();
        }

        info!(path = %path.display(), "Loading video");
        self.status = PlaybackStatus::Loading;
        self.reset_position();
        self.renderer.reset();
        self.buffer = FrameBuffer::shared(self.config.max_buffer_size);

        let session = match DecodeSession::spawn(
            path.to_path_buf(),
            Arc::clone(&self.opener),
            &self.config,
            Arc::clone(&self.buffer),
            self.ledger.clone(),
        ) {
            Ok(session) => session,
            Err(e) => return self.fail_load(PlaybackError::Io(e)),
        };

        let first = session.events().recv_timeout(self.config.load_timeout());
        let info = match first {
            Ok(SessionEvent::StreamInfo(info)) => info,
            Ok(SessionEvent::Error(message)) => {
                session.shutdown(self.config.dispose_grace());
                return self.fail_load(PlaybackError::Decode(message));
            }
            Ok(other) => {
                session.shutdown(self.config.dispose_grace());
                return self.fail_load(PlaybackError::Decode(format!(
                    "unexpected decoder event before stream info: {other:?}"
                )));
            }
            Err(RecvTimeoutError::Timeout) => {
                session.shutdown(self.config.dispose_grace());
                return self.fail_load(PlaybackError::LoadTimeout {
                    path: path.to_path_buf(),
                    timeout_ms: self.config.load_timeout_ms,
                });
            }
            Err(RecvTimeoutError::Disconnected) => {
                session.shutdown(self.config.dispose_grace());
                return self.fail_load(PlaybackError::Decode("decoder exited during load".into()));
            }
        };

        let rate = self.config.presentation_rate(info.frame_rate);
        self.frame_interval_us = rate.frame_interval_us();
        self.renderer.configure(&info);

        let fill = self.config.initial_fill().min(info.total_frames);
        if !self
            .buffer
            .wait_for_initial_buffer(fill, self.config.initial_buffer_wait_timeout())
        {
            warn!(
                wanted = fill,
                buffered = self.buffer.len(),
                "Initial buffer not reached before timeout"
            );
        }

        info!(
            frames = info.total_frames,
            fps = %rate,
            frame_interval_us = self.frame_interval_us,
            buffered = self.buffer.len(),
            "Video ready"
        );
        self.session = Some(session);
        self.info = Some(info);
        self.status = PlaybackStatus::Ready;
        true
    }

    fn fail_load(&mut self, err: PlaybackError) -> bool {
        error!("Load failed: {err}");
        self.buffer.clear();
        self.status = PlaybackStatus::Idle;
        self.callbacks.error(&err.to_string());
        false
    }

    fn reset_position(&mut self) {
        self.info = None;
        self.end_frame = None;
        self.current_frame = 0;
        self.last_presentation_us = 0;
        self.next_due_us = 0;
        self.frame_interval_us = 0;
        self.preview = None;
        self.stalled_on = None;
        self.underruns = 0;
        self.frames_presented = 0;
    }

    /// Start presenting. The first due tick presents immediately.
    pub fn play(&mut self) -> Result<()> {
        match self.status {
            PlaybackStatus::Playing => Ok(()),
            PlaybackStatus::Ready | PlaybackStatus::Paused => {
                self.status = PlaybackStatus::Playing;
                self.preview = None;
                self.next_due_us = self.clock.now_us();
                debug!(frame = self.current_frame, "Play");
                Ok(())
            }
            state => Err(self.invalid("play", state)),
        }
    }

    /// Stop advancing. The buffer and the decoder are left as they are.
    pub fn pause(&mut self) -> Result<()> {
        match self.status {
            PlaybackStatus::Playing => {
                self.status = PlaybackStatus::Paused;
                debug!(frame = self.current_frame, "Pause");
                Ok(())
            }
            PlaybackStatus::Ready | PlaybackStatus::Paused => Ok(()),
            state => Err(self.invalid("pause", state)),
        }
    }

    /// Jump to `frame` (clamped into the stream). Returns the frame seeked to.
    ///
    /// The buffer is cleared before the decoder hears about the seek. When not
    /// playing, the target is rendered once after the settle delay.
    pub fn seek(&mut self, frame: usize) -> Result<usize> {
        if !self.status.has_session() {
            return Err(self.invalid("seek", self.status));
        }
        let target = self.seek_internal(frame);
        if self.status != PlaybackStatus::Playing {
            let settle = self.config.seek_settle_delay().as_micros() as u64;
            let due_us = self.clock.now_us() + settle;
            self.preview = Some(PendingPreview {
                frame: target,
                due_us,
            });
        }
        Ok(target)
    }

    /// Seek to the frame shown at `time`.
    pub fn seek_to_time(&mut self, time: RationalTime) -> Result<usize> {
        let frame = match &self.info {
            Some(info) => info.frame_at_time(time),
            None => return Err(self.invalid("seek", self.status)),
        };
        self.seek(frame)
    }

    fn seek_internal(&mut self, frame: usize) -> usize {
        let total = self.total_frames();
        let target = frame.min(total.saturating_sub(1));

        self.current_frame = target;
        self.buffer.set_playhead(target, total);
        let generation = self.buffer.clear();
        let sent = self
            .session
            .as_ref()
            .map_or(false, |session| session.seek(target, generation));
        debug!(target, generation, sent, "Seek");
        target
    }

    /// One evaluation of the presentation loop.
    pub fn tick(&mut self) {
        self.drain_events();
        match self.status {
            PlaybackStatus::Playing => self.present_due_frame(),
            PlaybackStatus::Ready | PlaybackStatus::Paused => self.present_preview(),
            _ => {}
        }
    }

    /// Tick for `duration` of clock time, sleeping one tick interval between ticks.
    pub fn run_for(&mut self, duration: Duration) {
        let end = self.clock.now_us() + duration.as_micros() as u64;
        let interval = self.config.tick_interval();
        while self.clock.now_us() < end && self.status != PlaybackStatus::Disposed {
            self.tick();
            self.clock.sleep(interval);
        }
    }

    fn present_due_frame(&mut self) {
        let now = self.clock.now_us();
        if now < self.next_due_us {
            return;
        }

        let Some(frame) = self.buffer.get_frame(self.current_frame) else {
            if self.stalled_on != Some(self.current_frame) {
                self.stalled_on = Some(self.current_frame);
                self.underruns += 1;
                trace!(frame = self.current_frame, "Buffer underrun");
            }
            return;
        };
        if !self.renderer.render_frame(&frame) {
            return;
        }
        drop(frame);
        self.stalled_on = None;
        self.frames_presented += 1;
        self.last_presentation_us = now;

        // Fixed cadence; resync when a whole interval behind.
        self.next_due_us += self.frame_interval_us;
        if now >= self.next_due_us {
            self.next_due_us = now + self.frame_interval_us;
        }

        let total = self.total_frames();
        if self.current_frame + 1 < total {
            self.current_frame += 1;
            self.buffer.set_playhead(self.current_frame, total);
            self.callbacks.frame_changed(self.current_frame);
        } else {
            self.end_of_pass();
        }
    }

    /// Wrap to frame 0 when looping, else pause on the last frame.
    fn end_of_pass(&mut self) {
        if self.config.looping {
            debug!("Wrapping to frame 0");
            self.seek_internal(0);
            self.callbacks.frame_changed(self.current_frame);
        } else {
            self.current_frame = self.total_frames().saturating_sub(1);
            debug!(frame = self.current_frame, "Reached last frame, pausing");
            self.status = PlaybackStatus::Paused;
        }
    }

    /// Shorten playback to `end_frame` when the decoder ran out early.
    fn note_end_of_stream(&mut self, end_frame: usize) {
        let total = self.total_frames();
        if end_frame == 0 || end_frame >= total {
            return;
        }
        warn!(end_frame, advertised = total, "Stream ends before its advertised frame count");
        self.end_frame = Some(end_frame);
        self.stalled_on = None;

        if self.current_frame < end_frame {
            self.buffer.set_playhead(self.current_frame, end_frame);
        } else if self.status == PlaybackStatus::Playing {
            self.end_of_pass();
        } else if let Err(err) = self.seek(end_frame - 1) {
            warn!("{err}");
        }
    }

    fn present_preview(&mut self) {
        let Some(preview) = self.preview else {
            return;
        };
        if self.clock.now_us() < preview.due_us {
            return;
        }
        if let Some(frame) = self.buffer.get_frame(preview.frame) {
            if self.renderer.render_frame(&frame) {
                self.preview = None;
                self.frames_presented += 1;
                self.callbacks.frame_changed(preview.frame);
            }
        }
    }

    fn drain_events(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };

        let mut failure = None;
        let mut reported_end = None;
        loop {
            match session.events().try_recv() {
                Ok(SessionEvent::Error(message)) => {
                    failure = Some(message);
                    break;
                }
                Ok(SessionEvent::EndOfStream {
                    generation,
                    end_frame,
                }) => {
                    if generation == self.buffer.generation() {
                        debug!(generation, end_frame, "Decoder reached end of stream");
                        reported_end = Some(end_frame);
                    } else {
                        trace!(generation, "Ignoring stale end of stream");
                    }
                }
                Ok(other) => trace!(?other, "Ignoring session event"),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    failure = Some("decoder exited unexpectedly".to_string());
                    break;
                }
            }
        }

        if let Some(message) = failure {
            let err = PlaybackError::Decode(message);
            error!("{err}");
            self.dispose_session();
            self.info = None;
            self.preview = None;
            self.status = PlaybackStatus::Idle;
            self.callbacks.error(&err.to_string());
            return;
        }
        if let Some(end_frame) = reported_end {
            self.note_end_of_stream(end_frame);
        }
    }

    /// Release the loaded video and everything it holds. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        if self.status == PlaybackStatus::Disposed {
            return;
        }
        self.dispose_session();
        self.renderer.reset();
        self.info = None;
        self.preview = None;
        self.status = PlaybackStatus::Disposed;
        info!("Scheduler disposed");
    }

    fn dispose_session(&mut self) {
        if let Some(session) = self.session.take() {
            let shutdown = session.shutdown(self.config.dispose_grace());
            if !shutdown.acknowledged {
                warn!("Decoder did not acknowledge stop within the grace period");
            }
        }
        self.buffer.clear();
    }

    fn invalid(&self, op: &'static str, state: PlaybackStatus) -> PlaybackError {
        PlaybackError::InvalidState {
            op,
            state: state.to_string(),
        }
    }

    /// Frames that can be played: the advertised count, or fewer once the
    /// decoder has found where the stream really ends.
    pub fn total_frames(&self) -> usize {
        let advertised = self.info.as_ref().map_or(0, |info| info.total_frames);
        self.end_frame.map_or(advertised, |end| end.min(advertised))
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status
    }

    pub fn is_playing(&self) -> bool {
        self.status == PlaybackStatus::Playing
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Presentation time of the current frame.
    pub fn position(&self) -> RationalTime {
        self.info
            .as_ref()
            .map_or(RationalTime::ZERO, |info| info.time_of_frame(self.current_frame))
    }

    pub fn stream_info(&self) -> Option<&StreamInfo> {
        self.info.as_ref()
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    /// Target microseconds between presented frames; zero before a load.
    pub fn frame_interval_us(&self) -> u64 {
        self.frame_interval_us
    }

    pub fn frame_buffer(&self) -> &Arc<FrameBuffer> {
        &self.buffer
    }

    pub fn ledger(&self) -> &BufferLedger {
        &self.ledger
    }

    pub fn playback_state(&self) -> PlaybackState {
        PlaybackState {
            current_frame: self.current_frame,
            is_playing: self.is_playing(),
            last_presentation_us: self.last_presentation_us,
            buffer_health: self.buffer.health(),
        }
    }

    pub fn performance_metrics(&self) -> PerformanceMetrics {
        PerformanceMetrics {
            fps: self.renderer.current_fps(),
            average_render_time_us: self.renderer.average_render_time_us(),
            buffer_size: self.buffer.len(),
            buffer_health: self.buffer.health(),
            underruns: self.underruns,
            frames_presented: self.frames_presented,
        }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}
