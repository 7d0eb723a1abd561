//! Synthetic test-pattern source.
//!
//! Produces color bars with the frame number encoded in the first pixel, so
//! a rendered frame can be traced back to the index it was decoded for. Fault
//! injection (failing to open, failing at a frame, slow reads) makes the
//! pipeline's error and timeout paths reachable without real media.

use crate::source::{RawFrame, SourceOpener, VideoSource};
use parking_lot::Mutex;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use vidpipe_core::{DecodedFrame, FrameRate, PixelFormat, SourceError, StreamInfo};

const BARS: [[u8; 3]; 8] = [
    [255, 255, 255], // White
    [255, 255, 0],   // Yellow
    [0, 255, 255],   // Cyan
    [0, 255, 0],     // Green
    [255, 0, 255],   // Magenta
    [255, 0, 0],     // Red
    [0, 0, 255],     // Blue
    [0, 0, 0],       // Black
];

/// Parameters of a synthetic stream.
#[derive(Debug, Clone)]
pub struct PatternSpec {
    pub width: u32,
    pub height: u32,
    pub total_frames: usize,
    pub frame_rate: FrameRate,
    /// Format frames are produced in (before the worker converts them).
    pub format: PixelFormat,
    /// Opening fails with a probe error.
    pub fail_open: bool,
    /// Reading this frame fails with a read error.
    pub fail_at: Option<usize>,
    /// Delay before the source reports itself open.
    pub open_delay: Option<Duration>,
    /// Delay per frame read, to simulate a slow decoder.
    pub read_delay: Option<Duration>,
    /// Frames actually readable when fewer than `total_frames`, like a file
    /// whose container overstates its length.
    pub readable_frames: Option<usize>,
}

impl PatternSpec {
    pub fn new(width: u32, height: u32, total_frames: usize) -> Self {
        Self {
            width,
            height,
            total_frames,
            frame_rate: FrameRate::FPS_30,
            format: PixelFormat::Rgba8,
            fail_open: false,
            fail_at: None,
            open_delay: None,
            read_delay: None,
            readable_frames: None,
        }
    }

    pub fn with_frame_rate(mut self, frame_rate: FrameRate) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn failing_at(mut self, frame: usize) -> Self {
        self.fail_at = Some(frame);
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Report `total_frames` but run out after `frames`.
    pub fn truncated_at(mut self, frames: usize) -> Self {
        self.readable_frames = Some(frames);
        self
    }

    /// Opener producing a fresh source for every load.
    ///
    /// Every seek performed by any source from this opener is appended to
    /// `seek_log`.
    pub fn opener(self, seek_log: Arc<Mutex<Vec<usize>>>) -> SourceOpener {
        Arc::new(move |path: &Path| {
            PatternSource::open(path, self.clone(), Arc::clone(&seek_log))
                .map(|source| Box::new(source) as Box<dyn VideoSource>)
        })
    }
}

/// Parses `WIDTHxHEIGHT@FRAMES`, e.g. `640x360@300`.
impl FromStr for PatternSpec {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SourceError::Unsupported(format!("pattern spec '{s}', expected WxH@FRAMES"));
        let (size, frames) = s.split_once('@').ok_or_else(invalid)?;
        let (w, h) = size.split_once('x').ok_or_else(invalid)?;
        let width: u32 = w.parse().map_err(|_| invalid())?;
        let height: u32 = h.parse().map_err(|_| invalid())?;
        let total_frames: usize = frames.parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self::new(width, height, total_frames))
    }
}

/// Test-pattern implementation of [`VideoSource`].
pub struct PatternSource {
    info: StreamInfo,
    spec: PatternSpec,
    position: usize,
    scratch: Vec<u8>,
    seek_log: Arc<Mutex<Vec<usize>>>,
}

impl PatternSource {
    pub fn open(
        path: &Path,
        spec: PatternSpec,
        seek_log: Arc<Mutex<Vec<usize>>>,
    ) -> Result<Self, SourceError> {
        if let Some(delay) = spec.open_delay {
            std::thread::sleep(delay);
        }
        if spec.fail_open {
            return Err(SourceError::Probe(format!(
                "cannot open {}: injected failure",
                path.display()
            )));
        }
        if spec.width == 0 || spec.height == 0 {
            return Err(SourceError::Unsupported("zero-sized pattern".into()));
        }

        let info = StreamInfo {
            path: path.to_path_buf(),
            total_frames: spec.total_frames,
            frame_rate: spec.frame_rate,
            width: spec.width,
            height: spec.height,
            pixel_format: spec.format,
        };
        let scratch = vec![0u8; spec.format.frame_size(spec.width, spec.height)];

        Ok(Self {
            info,
            spec,
            position: 0,
            scratch,
            seek_log,
        })
    }

    fn paint(&mut self, frame_number: usize) {
        let width = self.spec.width as usize;
        let height = self.spec.height as usize;
        let bar_of = |x: usize| BARS[x * BARS.len() / width];

        match self.spec.format {
            PixelFormat::Nv12 => {
                // Luma bars, neutral chroma.
                let (y_plane, uv_plane) = self.scratch.split_at_mut(width * height);
                for row in y_plane.chunks_exact_mut(width) {
                    for (x, luma) in row.iter_mut().enumerate() {
                        let [r, g, b] = bar_of(x);
                        *luma = luma_of(r, g, b);
                    }
                }
                uv_plane.fill(128);
            }
            PixelFormat::Gray8 => {
                for row in self.scratch.chunks_exact_mut(width) {
                    for (x, luma) in row.iter_mut().enumerate() {
                        let [r, g, b] = bar_of(x);
                        *luma = luma_of(r, g, b);
                    }
                }
            }
            packed => {
                let bpp = packed.bytes_per_pixel();
                for row in self.scratch.chunks_exact_mut(width * bpp) {
                    for (x, px) in row.chunks_exact_mut(bpp).enumerate() {
                        let [r, g, b] = bar_of(x);
                        write_rgb(packed, px, r, g, b);
                    }
                }
                // Frame number marker in the first pixel: low byte in R, high byte in G.
                let [lo, hi] = (frame_number as u16).to_le_bytes();
                write_rgb(packed, &mut self.scratch[..bpp], lo, hi, 0);
            }
        }
    }
}

fn write_rgb(format: PixelFormat, px: &mut [u8], r: u8, g: u8, b: u8) {
    match format {
        PixelFormat::Bgra8 => {
            px[0] = b;
            px[1] = g;
            px[2] = r;
            px[3] = 255;
        }
        PixelFormat::Rgba8 => {
            px[0] = r;
            px[1] = g;
            px[2] = b;
            px[3] = 255;
        }
        _ => {
            px[0] = r;
            px[1] = g;
            px[2] = b;
        }
    }
}

fn luma_of(r: u8, g: u8, b: u8) -> u8 {
    // BT.601 limited range
    let y = (66 * r as u32 + 129 * g as u32 + 25 * b as u32 + 128) >> 8;
    (y + 16) as u8
}

impl VideoSource for PatternSource {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn read_frame(&mut self) -> Result<Option<RawFrame<'_>>, SourceError> {
        let readable = self
            .spec
            .readable_frames
            .map_or(self.info.total_frames, |n| n.min(self.info.total_frames));
        if self.position >= readable {
            return Ok(None);
        }
        let frame_number = self.position;
        if self.spec.fail_at == Some(frame_number) {
            return Err(SourceError::Read(format!(
                "injected failure at frame {frame_number}"
            )));
        }
        if let Some(delay) = self.spec.read_delay {
            std::thread::sleep(delay);
        }

        self.paint(frame_number);
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
        if frame >= self.info.total_frames && self.info.total_frames > 0 {
            return Err(SourceError::SeekOutOfRange {
                target: frame,
                total: self.info.total_frames,
            });
        }
        self.position = frame;
        self.seek_log.lock().push(frame);
        Ok(())
    }

    fn position(&self) -> usize {
        self.position
    }
}

/// Recover the frame number a pattern frame was painted with.
///
/// Only meaningful for frames produced from a packed-format pattern.
pub fn frame_marker(frame: &DecodedFrame) -> usize {
    let px = frame.pixels();
    let (lo, hi) = match frame.format {
        PixelFormat::Bgra8 => (px[2], px[1]),
        _ => (px[0], px[1]),
    };
    u16::from_le_bytes([lo, hi]) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(spec: PatternSpec) -> PatternSource {
        PatternSource::open(Path::new("pattern"), spec, Arc::default()).unwrap()
    }

    #[test]
    fn test_reads_sequentially_then_ends() {
        let mut source = open(PatternSpec::new(8, 2, 3));
        for expected in 0..3 {
            let frame = source.read_frame().unwrap().unwrap();
            assert_eq!(frame.frame_number, expected);
            assert_eq!(frame.data.len(), 8 * 2 * 4);
            assert_eq!(frame.data[0], expected as u8);
        }
        assert!(source.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_truncated_source_ends_early() {
        let mut source = open(PatternSpec::new(8, 2, 10).truncated_at(4));
        assert_eq!(source.info().total_frames, 10);
        for _ in 0..4 {
            assert!(source.read_frame().unwrap().is_some());
        }
        assert!(source.read_frame().unwrap().is_none());

        // Seeking inside the advertised range is allowed but yields nothing.
        source.seek(7).unwrap();
        assert!(source.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_seek_repositions_and_is_logged() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut source =
            PatternSource::open(Path::new("pattern"), PatternSpec::new(8, 2, 300), Arc::clone(&log))
                .unwrap();
        source.seek(150).unwrap();
        assert_eq!(source.read_frame().unwrap().unwrap().frame_number, 150);
        assert_eq!(source.position(), 151);
        assert!(matches!(
            source.seek(300),
            Err(SourceError::SeekOutOfRange { target: 300, total: 300 })
        ));
        assert_eq!(*log.lock(), vec![150]);
    }

    #[test]
    fn test_injected_failures() {
        let spec = PatternSpec::new(8, 2, 10).failing_open();
        assert!(PatternSource::open(Path::new("x"), spec, Arc::default()).is_err());

        let mut source = open(PatternSpec::new(8, 2, 10).failing_at(1));
        assert!(source.read_frame().unwrap().is_some());
        assert!(matches!(source.read_frame(), Err(SourceError::Read(_))));
    }

    #[test]
    fn test_nv12_pattern_has_neutral_chroma() {
        let mut source = open(PatternSpec::new(8, 2, 1).with_format(PixelFormat::Nv12));
        let frame = source.read_frame().unwrap().unwrap();
        assert_eq!(frame.data.len(), 16 + 8);
        assert!(frame.data[16..].iter().all(|&c| c == 128));
        assert_eq!(frame.data[0], 235);
    }

    #[test]
    fn test_parse_spec() {
        let spec: PatternSpec = "640x360@300".parse().unwrap();
        assert_eq!((spec.width, spec.height, spec.total_frames), (640, 360, 300));
        assert!("640x360".parse::<PatternSpec>().is_err());
        assert!("0x360@10".parse::<PatternSpec>().is_err());
    }
}
