//! One loaded video: a decode thread plus the ingest thread feeding the
//! frame buffer.

use crate::frame_buffer::FrameBuffer;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use vidpipe_core::{BufferLedger, PlaybackConfig};
use vidpipe_media::{spawn_decoder, DecoderConfig, DecoderEvent, DecoderHandle, SourceOpener};

/// Name of the ingest thread.
pub const INGEST_THREAD_NAME: &str = "vidpipe-ingest";

const SPACE_POLL: Duration = Duration::from_millis(10);
const JOIN_POLL: Duration = Duration::from_millis(1);

/// Events forwarded from the decoder to the scheduler. Never carries frames.
pub type SessionEvent = DecoderEvent;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shutdown {
    /// The decoder acknowledged the stop (or had already exited).
    pub acknowledged: bool,
    /// Threads still running after the grace period were detached.
    pub detached: bool,
}

pub struct DecodeSession {
    decoder: Option<DecoderHandle>,
    ingest: Option<JoinHandle<()>>,
    events: Receiver<SessionEvent>,
    buffer: Arc<FrameBuffer>,
}

impl DecodeSession {
    /// Start decoding `path` into `buffer`.
    pub fn spawn(
        path: PathBuf,
        opener: SourceOpener,
        config: &PlaybackConfig,
        buffer: Arc<FrameBuffer>,
        ledger: BufferLedger,
    ) -> std::io::Result<Self> {
        let (decoder, data_rx) = spawn_decoder(path, opener, DecoderConfig::from(config), ledger)?;
        let (event_tx, event_rx) = unbounded();

        let ingest = {
            let buffer = Arc::clone(&buffer);
            thread::Builder::new()
                .name(INGEST_THREAD_NAME.into())
                .spawn(move || ingest(data_rx, event_tx, buffer))?
        };

        Ok(Self {
            decoder: Some(decoder),
            ingest: Some(ingest),
            events: event_rx,
            buffer,
        })
    }

    /// Non-frame decoder events, in the order they were produced.
    pub fn events(&self) -> &Receiver<SessionEvent> {
        &self.events
    }

    /// Ask the decoder to restart at `target` for buffer generation `generation`.
    pub fn seek(&self, target: usize, generation: u64) -> bool {
        self.decoder
            .as_ref()
            .map_or(false, |decoder| decoder.seek(target, generation))
    }

    /// Stop the decoder and wait up to `grace` for both threads.
    ///
    /// Never blocks longer than `grace`. Threads still alive afterwards are
    /// detached; they exit on their own once their channels close.
    pub fn shutdown(mut self, grace: Duration) -> Shutdown {
        let deadline = Instant::now() + grace;

        // Unblock the ingest thread so it keeps draining while we wait.
        self.buffer.close();
        if let Some(decoder) = self.decoder.as_ref().filter(|d| !d.is_finished()) {
            decoder.stop();
        }

        let mut acknowledged = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(DecoderEvent::Stopped) => {
                    acknowledged = true;
                    break;
                }
                Ok(other) => trace!(?other, "Discarding event during shutdown"),
                Err(RecvTimeoutError::Disconnected) => {
                    acknowledged = true;
                    break;
                }
                Err(RecvTimeoutError::Timeout) => break,
            }
        }

        let mut detached = false;
        if let Some(decoder) = self.decoder.take() {
            if wait_finished(|| decoder.is_finished(), deadline) {
                decoder.join();
            } else {
                warn!("Decode thread still running after grace period, detaching");
                decoder.detach();
                detached = true;
            }
        }
        if let Some(ingest) = self.ingest.take() {
            if wait_finished(|| ingest.is_finished(), deadline) {
                let _ = ingest.join();
            } else {
                warn!("Ingest thread still running after grace period, detaching");
                detached = true;
            }
        }

        debug!(acknowledged, detached, "Session shut down");
        Shutdown {
            acknowledged,
            detached,
        }
    }
}

impl Drop for DecodeSession {
    fn drop(&mut self) {
        self.buffer.close();
    }
}

fn wait_finished(finished: impl Fn() -> bool, deadline: Instant) -> bool {
    loop {
        if finished() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(JOIN_POLL);
    }
}

/// Ingest loop: frames into the buffer, everything else to the scheduler.
fn ingest(data_rx: Receiver<DecoderEvent>, event_tx: Sender<SessionEvent>, buffer: Arc<FrameBuffer>) {
    for event in data_rx.iter() {
        match event {
            DecoderEvent::Batch { generation, frames } => {
                while !buffer.wait_for_space(generation, &frames, SPACE_POLL) {}
                let inserted = buffer.add_frames(generation, frames);
                trace!(generation, inserted, len = buffer.len(), "Ingested batch");
            }
            other => {
                if let DecoderEvent::StreamInfo(info) = &other {
                    // Before any batch of this session can arrive.
                    buffer.set_playhead(0, info.total_frames);
                }
                if event_tx.send(other).is_err() {
                    trace!("Scheduler gone, dropping event");
                }
            }
        }
    }
    trace!("Ingest finished");
}
