//! Background decode worker.
//!
//! The worker owns its [`VideoSource`] on a dedicated thread and streams
//! converted frames to a consumer in batches. Commands arrive on a bounded
//! control channel; everything the worker produces goes out on a single
//! bounded event channel, so a slow consumer throttles decoding.
//!
//! Every seek carries a generation number. Batches are tagged with the
//! generation they were decoded under, and a batch that is still waiting to
//! be sent when a newer seek arrives is dropped rather than delivered.

use crate::convert::convert_frame;
use crate::source::{SourceOpener, VideoSource};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, trace, warn};
use vidpipe_core::{
    defaults, BufferLedger, DecodedFrame, EndOfStreamPolicy, PixelBuffer, PixelFormat,
    PlaybackConfig, StreamInfo,
};

/// Name of the decode thread.
pub const DECODE_THREAD_NAME: &str = "vidpipe-decode";

const CONTROL_CAPACITY: usize = 64;
const CONTROL_SEND_TIMEOUT: Duration = Duration::from_millis(50);
const EVENT_SEND_POLL: Duration = Duration::from_millis(5);
const IDLE_POLL: Duration = Duration::from_millis(10);
const STOP_ACK_TIMEOUT: Duration = Duration::from_millis(100);

/// Commands from the consumer to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Reposition to `target` (clamped into the stream) and tag further
    /// batches with `generation`.
    Seek { target: usize, generation: u64 },
    /// Release the source, acknowledge with [`DecoderEvent::Stopped`] and exit.
    Stop,
}

/// Everything the worker reports to its consumer.
#[derive(Debug)]
pub enum DecoderEvent {
    /// Sent once, after the source opened.
    StreamInfo(StreamInfo),
    /// Consecutive frames decoded under `generation`.
    Batch {
        generation: u64,
        frames: Vec<DecodedFrame>,
    },
    /// The source ran out of frames; `end_frame` is one past the last frame
    /// it produced, which can be short of the probed frame count.
    ///
    /// Sent once per end under the hold policy. Under the loop policy it is
    /// only sent when the pass ended short of the probed count.
    EndOfStream { generation: u64, end_frame: usize },
    /// Fatal; the worker exits after sending it.
    Error(String),
    /// Acknowledges [`ControlCommand::Stop`]. The source has been released.
    Stopped,
}

impl DecoderEvent {
    fn is_stale(&self, current: u64) -> bool {
        match self {
            Self::Batch { generation, .. } | Self::EndOfStream { generation, .. } => {
                *generation != current
            }
            _ => false,
        }
    }
}

/// Decode worker settings.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Frames decoded per batch.
    pub batch_size: usize,
    pub end_of_stream: EndOfStreamPolicy,
    /// Format frames are converted to before they leave the worker.
    pub output_format: PixelFormat,
    /// Pause between batches.
    pub yield_interval: Duration,
    /// Batches allowed in flight on the event channel.
    pub event_capacity: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::BATCH_SIZE,
            end_of_stream: EndOfStreamPolicy::Hold,
            output_format: PixelFormat::Rgba8,
            yield_interval: Duration::from_micros(defaults::YIELD_INTERVAL_US),
            event_capacity: defaults::DATA_CHANNEL_CAPACITY,
        }
    }
}

impl From<&PlaybackConfig> for DecoderConfig {
    fn from(config: &PlaybackConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            end_of_stream: config.end_of_stream,
            output_format: config.presentation_format,
            yield_interval: config.yield_interval(),
            event_capacity: config.data_channel_capacity.max(1),
        }
    }
}

/// Consumer-side handle to a running worker.
pub struct DecoderHandle {
    control_tx: Sender<ControlCommand>,
    thread: Option<JoinHandle<()>>,
}

impl DecoderHandle {
    /// Request a seek. Returns `false` if the worker is gone or not accepting commands.
    pub fn seek(&self, target: usize, generation: u64) -> bool {
        self.send(ControlCommand::Seek { target, generation })
    }

    /// Request a stop. Returns `false` if the worker is gone or not accepting commands.
    pub fn stop(&self) -> bool {
        self.send(ControlCommand::Stop)
    }

    fn send(&self, command: ControlCommand) -> bool {
        match self.control_tx.send_timeout(command, CONTROL_SEND_TIMEOUT) {
            Ok(()) => true,
            Err(e) => {
                warn!(?command, "Decoder did not accept command: {e}");
                false
            }
        }
    }

    /// Whether the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the worker thread. Returns `false` if it panicked.
    pub fn join(mut self) -> bool {
        match self.thread.take() {
            Some(thread) => thread.join().is_ok(),
            None => true,
        }
    }

    /// Give up on the worker thread without waiting for it.
    pub fn detach(mut self) {
        self.thread.take();
    }
}

impl Drop for DecoderHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.control_tx.try_send(ControlCommand::Stop);
        }
    }
}

/// Start a worker for `path` on its own thread.
///
/// The source is opened on the worker thread; failures arrive as
/// [`DecoderEvent::Error`].
pub fn spawn_decoder(
    path: PathBuf,
    opener: SourceOpener,
    config: DecoderConfig,
    ledger: BufferLedger,
) -> std::io::Result<(DecoderHandle, Receiver<DecoderEvent>)> {
    let (control_tx, control_rx) = bounded(CONTROL_CAPACITY);
    let (event_tx, event_rx) = bounded(config.event_capacity.max(1));

    let worker = DecoderWorker {
        path,
        opener,
        config,
        ledger,
        control_rx,
        event_tx,
    };
    let thread = thread::Builder::new()
        .name(DECODE_THREAD_NAME.into())
        .spawn(move || worker.run())?;

    Ok((
        DecoderHandle {
            control_tx,
            thread: Some(thread),
        },
        event_rx,
    ))
}

enum Flow {
    Continue,
    /// Stop requested or control channel closed: release and acknowledge.
    Stop,
    /// Consumer gone or fatal error already reported.
    Exit,
}

struct Cursor {
    generation: u64,
    at_end: bool,
    /// End of stream waiting to be delivered.
    unreported_end: Option<usize>,
    /// Frame the current pass started at.
    pass_start: usize,
    /// Frame the next read should produce.
    next_frame: usize,
    frames_since_wrap: usize,
}

/// The worker's state, moved onto the decode thread.
pub struct DecoderWorker {
    path: PathBuf,
    opener: SourceOpener,
    config: DecoderConfig,
    ledger: BufferLedger,
    control_rx: Receiver<ControlCommand>,
    event_tx: Sender<DecoderEvent>,
}

impl DecoderWorker {
    /// Worker main loop. Returns when stopped, on a fatal error, or when the
    /// consumer disconnects.
    pub fn run(self) {
        let span = info_span!("decoder", path = %self.path.display());
        let _enter = span.enter();

        let mut source = match (self.opener)(&self.path) {
            Ok(source) => source,
            Err(e) => {
                error!("Failed to open source: {e}");
                let _ = self
                    .event_tx
                    .send_timeout(DecoderEvent::Error(e.to_string()), STOP_ACK_TIMEOUT);
                return;
            }
        };

        let info = source.info().clone();
        info!(
            frames = info.total_frames,
            fps = %info.frame_rate,
            batch_size = self.config.batch_size,
            "Decoder started"
        );

        let mut cursor = Cursor {
            generation: 0,
            at_end: !info.has_frames(),
            unreported_end: (!info.has_frames()).then_some(0),
            pass_start: 0,
            next_frame: 0,
            frames_since_wrap: 0,
        };
        let started = Instant::now();

        let mut flow = self.deliver(DecoderEvent::StreamInfo(info), source.as_mut(), &mut cursor);

        while let Flow::Continue = flow {
            flow = self.drain_control(source.as_mut(), &mut cursor);
            if !matches!(flow, Flow::Continue) {
                break;
            }

            if let Some(end_frame) = cursor.unreported_end.take() {
                debug!(generation = cursor.generation, end_frame, "End of stream");
                let end = DecoderEvent::EndOfStream {
                    generation: cursor.generation,
                    end_frame,
                };
                flow = self.deliver(end, source.as_mut(), &mut cursor);
                continue;
            }

            if cursor.at_end {
                flow = self.idle(source.as_mut(), &mut cursor);
                continue;
            }

            flow = match self.decode_batch(source.as_mut(), &mut cursor, started) {
                Ok(frames) if frames.is_empty() => Flow::Continue,
                Ok(frames) => {
                    trace!(
                        generation = cursor.generation,
                        first = frames[0].frame_number,
                        count = frames.len(),
                        "Sending batch"
                    );
                    let batch = DecoderEvent::Batch {
                        generation: cursor.generation,
                        frames,
                    };
                    self.deliver(batch, source.as_mut(), &mut cursor)
                }
                Err(message) => {
                    error!("Decode failed: {message}");
                    let _ = self.deliver(DecoderEvent::Error(message), source.as_mut(), &mut cursor);
                    Flow::Exit
                }
            };

            if matches!(flow, Flow::Continue) && !self.config.yield_interval.is_zero() {
                thread::sleep(self.config.yield_interval);
            }
        }

        drop(source);
        match flow {
            Flow::Stop => {
                info!("Decoder stopped");
                if self
                    .event_tx
                    .send_timeout(DecoderEvent::Stopped, STOP_ACK_TIMEOUT)
                    .is_err()
                {
                    debug!("Stop acknowledgement not delivered");
                }
            }
            _ => debug!("Decoder exited"),
        }
    }

    /// Wait at the end of the stream for a seek or stop.
    fn idle(&self, source: &mut dyn VideoSource, cursor: &mut Cursor) -> Flow {
        match self.control_rx.recv_timeout(IDLE_POLL) {
            Ok(command) => self.apply(command, source, cursor),
            Err(RecvTimeoutError::Timeout) => Flow::Continue,
            Err(RecvTimeoutError::Disconnected) => Flow::Stop,
        }
    }

    fn drain_control(&self, source: &mut dyn VideoSource, cursor: &mut Cursor) -> Flow {
        loop {
            match self.control_rx.try_recv() {
                Ok(command) => match self.apply(command, source, cursor) {
                    Flow::Continue => {}
                    other => return other,
                },
                Err(crossbeam_channel::TryRecvError::Empty) => return Flow::Continue,
                Err(crossbeam_channel::TryRecvError::Disconnected) => return Flow::Stop,
            }
        }
    }

    fn apply(&self, command: ControlCommand, source: &mut dyn VideoSource, cursor: &mut Cursor) -> Flow {
        match command {
            ControlCommand::Stop => Flow::Stop,
            ControlCommand::Seek { target, generation } => {
                cursor.generation = generation;
                cursor.unreported_end = None;
                cursor.frames_since_wrap = 0;

                if !source.info().has_frames() {
                    cursor.at_end = true;
                    cursor.unreported_end = Some(0);
                    return Flow::Continue;
                }
                let target = source.info().clamp_frame(target);
                cursor.pass_start = target;
                cursor.next_frame = target;
                debug!(target, generation, "Seeking");
                match source.seek(target) {
                    Ok(()) => {
                        cursor.at_end = false;
                        Flow::Continue
                    }
                    Err(e) => {
                        error!("Seek to {target} failed: {e}");
                        let _ = self
                            .event_tx
                            .send_timeout(DecoderEvent::Error(e.to_string()), STOP_ACK_TIMEOUT);
                        Flow::Exit
                    }
                }
            }
        }
    }

    /// Decode up to `batch_size` frames. Errors are fatal.
    fn decode_batch(
        &self,
        source: &mut dyn VideoSource,
        cursor: &mut Cursor,
        started: Instant,
    ) -> Result<Vec<DecodedFrame>, String> {
        let mut frames = Vec::with_capacity(self.config.batch_size);
        let output = self.config.output_format;

        while frames.len() < self.config.batch_size {
            let raw = match source.read_frame().map_err(|e| e.to_string())? {
                Some(raw) => raw,
                None => {
                    self.on_end_of_stream(source, cursor)?;
                    break;
                }
            };

            let size = output.frame_size(raw.width, raw.height);
            let mut pixels = PixelBuffer::zeroed(size, &self.ledger);
            convert_frame(&raw, output, pixels.as_mut_slice()).map_err(|e| e.to_string())?;

            let decoded_at_us = started.elapsed().as_micros() as u64;
            let raw_number = raw.frame_number;
            let frame = DecodedFrame::new(
                raw.frame_number,
                raw.width,
                raw.height,
                output,
                decoded_at_us,
                pixels,
            )
            .ok_or_else(|| format!("frame {} has an inconsistent size", raw.frame_number))?;

            frames.push(frame);
            cursor.next_frame = raw_number + 1;
            cursor.frames_since_wrap += 1;
        }

        Ok(frames)
    }

    fn on_end_of_stream(&self, source: &mut dyn VideoSource, cursor: &mut Cursor) -> Result<(), String> {
        let end_frame = cursor.next_frame;
        let short = end_frame < source.info().total_frames;
        if short {
            warn!(
                end_frame,
                probed = source.info().total_frames,
                "Stream ended before its probed frame count"
            );
        }
        match self.config.end_of_stream {
            // An empty pass from frame 0 means the source yields nothing; hold instead of spinning.
            EndOfStreamPolicy::Loop if cursor.frames_since_wrap > 0 || cursor.pass_start != 0 => {
                debug!(end_frame, "End of stream, looping to frame 0");
                if short {
                    cursor.unreported_end = Some(end_frame);
                }
                source.seek(0).map_err(|e| e.to_string())?;
                cursor.pass_start = 0;
                cursor.next_frame = 0;
                cursor.frames_since_wrap = 0;
            }
            _ => {
                cursor.at_end = true;
                cursor.unreported_end = Some(end_frame);
            }
        }
        Ok(())
    }

    /// Send `event`, servicing control commands while the channel is full.
    ///
    /// A seek arriving meanwhile makes generation-tagged events stale; those
    /// are dropped instead of sent.
    fn deliver(&self, mut event: DecoderEvent, source: &mut dyn VideoSource, cursor: &mut Cursor) -> Flow {
        loop {
            match self.event_tx.send_timeout(event, EVENT_SEND_POLL) {
                Ok(()) => return Flow::Continue,
                Err(SendTimeoutError::Disconnected(_)) => {
                    debug!("Event consumer disconnected");
                    return Flow::Exit;
                }
                Err(SendTimeoutError::Timeout(unsent)) => event = unsent,
            }

            match self.drain_control(source, cursor) {
                Flow::Continue => {}
                other => return other,
            }
            if event.is_stale(cursor.generation) {
                trace!(generation = cursor.generation, "Dropping stale event");
                return Flow::Continue;
            }
        }
    }
}
