//! FFmpeg-backed video source.
//!
//! `ffprobe` supplies the stream metadata at open time; `ffmpeg` runs as a
//! child process writing raw frames to its stdout, which are read one frame
//! at a time. Seeking restarts the child at the target timestamp. The
//! executables are located with ffmpeg-sidecar, so a sidecar download next
//! to the binary is picked up before the system `PATH`.

use crate::source::{RawFrame, VideoSource};
use serde::Deserialize;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use tracing::{debug, info, warn};
use vidpipe_core::{FrameRate, PixelFormat, SourceError, StreamInfo};

// ── Probe ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Probe `path` with ffprobe and describe its first video stream.
pub fn probe(path: &Path) -> Result<StreamInfo, SourceError> {
    if !path.exists() {
        return Err(SourceError::NotFound(path.to_path_buf()));
    }

    let output = Command::new(ffmpeg_sidecar::ffprobe::ffprobe_path())
        .args(["-v", "quiet", "-print_format", "json", "-show_streams", "-show_format"])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .map_err(|e| SourceError::Probe(format!("failed to run ffprobe: {e}")))?;

    if !output.status.success() {
        return Err(SourceError::Probe(format!(
            "ffprobe exited with {} for {}",
            output.status,
            path.display()
        )));
    }

    parse_probe(path, &output.stdout)
}

fn parse_probe(path: &Path, json: &[u8]) -> Result<StreamInfo, SourceError> {
    let probe: ProbeOutput = serde_json::from_slice(json)
        .map_err(|e| SourceError::Probe(format!("bad ffprobe output: {e}")))?;

    let stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| SourceError::Probe(format!("no video stream in {}", path.display())))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(SourceError::Probe("video stream has no dimensions".into())),
    };

    let frame_rate = [&stream.r_frame_rate, &stream.avg_frame_rate]
        .into_iter()
        .flatten()
        .find_map(|rate| FrameRate::parse(rate))
        .ok_or_else(|| SourceError::Probe("video stream has no frame rate".into()))?;

    let total_frames = match stream.nb_frames.as_deref().and_then(|n| n.parse().ok()) {
        Some(n) => n,
        None => {
            let seconds = probe
                .format
                .as_ref()
                .and_then(|f| f.duration.as_deref())
                .or(stream.duration.as_deref())
                .and_then(|d| d.parse::<f64>().ok())
                .unwrap_or(0.0);
            (seconds * frame_rate.to_fps_f64()).round().max(0.0) as usize
        }
    };

    Ok(StreamInfo {
        path: path.to_path_buf(),
        total_frames,
        frame_rate,
        width,
        height,
        pixel_format: output_format(width, height),
    })
}

/// NV12 halves the pipe bandwidth but needs even dimensions.
fn output_format(width: u32, height: u32) -> PixelFormat {
    if width % 2 == 0 && height % 2 == 0 {
        PixelFormat::Nv12
    } else {
        PixelFormat::Rgba8
    }
}

/// Build the ffmpeg arguments that stream raw frames from `start_frame` on.
pub fn decode_args(info: &StreamInfo, start_frame: usize) -> Vec<String> {
    let mut args: Vec<String> = vec!["-v".into(), "error".into(), "-nostdin".into()];

    // Input seeking: fast, and frame-accurate for the formats ffmpeg decodes itself.
    if start_frame > 0 {
        let seconds = info.time_of_frame(start_frame).to_seconds_f64();
        args.extend_from_slice(&["-ss".into(), format!("{seconds:.6}")]);
    }

    args.extend_from_slice(&[
        "-i".into(),
        info.path.to_string_lossy().into_owned(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        info.pixel_format.ffmpeg_name().into(),
        "-an".into(),
        "-sn".into(),
        "pipe:1".into(),
    ]);

    args
}

// ── Source ──────────────────────────────────────────────────────

struct DecodeProcess {
    child: Child,
    stdout: ChildStdout,
}

impl DecodeProcess {
    fn spawn(ffmpeg: &Path, args: &[String]) -> Result<Self, SourceError> {
        let mut child = Command::new(ffmpeg)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SourceError::Spawn(format!("{}: {e}", ffmpeg.display())))?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SourceError::Spawn("ffmpeg stdout not captured".into()));
        };

        Ok(Self { child, stdout })
    }

    fn shutdown(mut self) {
        drop(self.stdout);
        if let Err(e) = self.child.kill() {
            debug!("ffmpeg already exited: {e}");
        }
        let _ = self.child.wait();
    }
}

/// A video file decoded by an ffmpeg child process.
pub struct FfmpegSource {
    info: StreamInfo,
    ffmpeg: PathBuf,
    process: Option<DecodeProcess>,
    scratch: Vec<u8>,
    position: usize,
}

impl FfmpegSource {
    /// Probe `path` and start decoding from frame 0.
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let info = probe(path)?;
        info!(
            path = %path.display(),
            width = info.width,
            height = info.height,
            fps = %info.frame_rate,
            frames = info.total_frames,
            format = %info.pixel_format,
            "Opened video"
        );

        let ffmpeg = ffmpeg_sidecar::paths::ffmpeg_path();
        let process = DecodeProcess::spawn(&ffmpeg, &decode_args(&info, 0))?;
        let scratch = vec![0u8; info.frame_size_bytes(info.pixel_format)];

        Ok(Self {
            info,
            ffmpeg,
            process: Some(process),
            scratch,
            position: 0,
        })
    }

    /// Open as a boxed [`VideoSource`]; usable as a [`crate::SourceOpener`].
    pub fn open_boxed(path: &Path) -> Result<Box<dyn VideoSource>, SourceError> {
        Ok(Box::new(Self::open(path)?))
    }
}

impl VideoSource for FfmpegSource {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn read_frame(&mut self) -> Result<Option<RawFrame<'_>>, SourceError> {
        if self.position >= self.info.total_frames {
            return Ok(None);
        }
        let Some(process) = self.process.as_mut() else {
            return Ok(None);
        };

        match process.stdout.read_exact(&mut self.scratch) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                // The container held fewer frames than probed.
                warn!(
                    position = self.position,
                    expected = self.info.total_frames,
                    "ffmpeg ended early"
                );
                if let Some(process) = self.process.take() {
                    process.shutdown();
                }
                return Ok(None);
            }
            Err(e) => return Err(SourceError::Read(e.to_string())),
        }

        let frame_number = self.position;
        self.position += 1;

        Ok(Some(RawFrame {
            frame_number,
            width: self.info.width,
            height: self.info.height,
            format: self.info.pixel_format,
            data: &self.scratch,
        }))
    }

    fn seek(&mut self, frame: usize) -> Result<(), SourceError> {
        if frame >= self.info.total_frames {
            return Err(SourceError::SeekOutOfRange {
                target: frame,
                total: self.info.total_frames,
            });
        }

        if let Some(process) = self.process.take() {
            process.shutdown();
        }
        debug!(frame, "Restarting ffmpeg for seek");
        self.process = Some(DecodeProcess::spawn(
            &self.ffmpeg,
            &decode_args(&self.info, frame),
        )?);
        self.position = frame;
        Ok(())
    }

    fn position(&self) -> usize {
        self.position
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if let Some(process) = self.process.take() {
            process.shutdown();
        }
    }
}
