//! Owned pixel buffers and decoded frames.
//!
//! Every decoded frame carries exactly one [`PixelBuffer`]. The buffer is
//! released in `Drop`, synchronously, when its last owner lets go of it. A
//! [`BufferLedger`] counts allocations and releases so callers can verify
//! that a session leaves no buffers behind.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Pixel format enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 8-bit RGBA (32 bits per pixel)
    #[default]
    Rgba8,
    /// 8-bit BGRA (32 bits per pixel), native for most desktop surfaces
    Bgra8,
    /// 8-bit packed RGB (24 bits per pixel)
    Rgb8,
    /// 8-bit grayscale
    Gray8,
    /// NV12 YUV 4:2:0, Y plane followed by interleaved UV
    Nv12,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats, or 0 for planar.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8 | Self::Bgra8 => 4,
            Self::Rgb8 => 3,
            Self::Gray8 => 1,
            Self::Nv12 => 0,
        }
    }

    /// Calculate total bytes needed for a frame of this format.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            Self::Nv12 => {
                // Y plane + UV interleaved at half resolution, rounded up
                let chroma_w = (width as usize).div_ceil(2);
                let chroma_h = (height as usize).div_ceil(2);
                pixels + chroma_w * chroma_h * 2
            }
            packed => pixels * packed.bytes_per_pixel(),
        }
    }

    /// Whether frames of this format can be handed to a render surface.
    pub fn is_presentable(self) -> bool {
        matches!(self, Self::Rgba8 | Self::Bgra8)
    }

    /// Name as understood by ffmpeg's `-pix_fmt`.
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            Self::Rgba8 => "rgba",
            Self::Bgra8 => "bgra",
            Self::Rgb8 => "rgb24",
            Self::Gray8 => "gray",
            Self::Nv12 => "nv12",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ffmpeg_name())
    }
}

#[derive(Debug, Default)]
struct LedgerCounters {
    allocated: AtomicU64,
    released: AtomicU64,
    live_bytes: AtomicUsize,
}

/// Counts pixel buffer allocations and releases.
///
/// Cheap to clone; clones share the same counters. One ledger is created
/// per scheduler (or per test) rather than per process.
#[derive(Debug, Clone, Default)]
pub struct BufferLedger {
    counters: Arc<LedgerCounters>,
}

/// Point-in-time view of a [`BufferLedger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LedgerSnapshot {
    pub allocated: u64,
    pub released: u64,
    pub live_bytes: usize,
}

impl LedgerSnapshot {
    /// Buffers allocated but not yet released.
    pub fn live(&self) -> u64 {
        self.allocated - self.released
    }
}

impl BufferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        // Read released first so a concurrent release can't make live() underflow.
        let released = self.counters.released.load(Ordering::Acquire);
        let allocated = self.counters.allocated.load(Ordering::Acquire);
        LedgerSnapshot {
            allocated,
            released,
            live_bytes: self.counters.live_bytes.load(Ordering::Acquire),
        }
    }

    /// Buffers currently alive.
    pub fn live(&self) -> u64 {
        self.snapshot().live()
    }

    fn record_alloc(&self, bytes: usize) {
        self.counters.live_bytes.fetch_add(bytes, Ordering::AcqRel);
        self.counters.allocated.fetch_add(1, Ordering::AcqRel);
    }

    fn record_release(&self, bytes: usize) {
        self.counters.live_bytes.fetch_sub(bytes, Ordering::AcqRel);
        self.counters.released.fetch_add(1, Ordering::AcqRel);
    }
}

/// An exclusively-owned allocation of pixel bytes.
///
/// Not `Clone`: there is only ever one owner. Sharing goes through
/// [`SharedFrame`], and the bytes are freed when the last handle drops.
pub struct PixelBuffer {
    data: Box<[u8]>,
    ledger: BufferLedger,
}

impl PixelBuffer {
    /// Allocate a zeroed buffer of `len` bytes, recorded in `ledger`.
    pub fn zeroed(len: usize, ledger: &BufferLedger) -> Self {
        ledger.record_alloc(len);
        Self {
            data: vec![0u8; len].into_boxed_slice(),
            ledger: ledger.clone(),
        }
    }

    /// Allocate a buffer sized exactly for `pixels` and copy them in.
    pub fn copy_from(pixels: &[u8], ledger: &BufferLedger) -> Self {
        ledger.record_alloc(pixels.len());
        Self {
            data: pixels.to_vec().into_boxed_slice(),
            ledger: ledger.clone(),
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        self.ledger.record_release(self.data.len());
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}

/// A decoded video frame in presentation format.
#[derive(Debug)]
pub struct DecodedFrame {
    /// Index of this frame in the stream
    pub frame_number: usize,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel format of `pixels` (always presentable)
    pub format: PixelFormat,
    /// Monotonic decode timestamp, microseconds since the session started
    pub decoded_at_us: u64,
    pixels: PixelBuffer,
}

impl DecodedFrame {
    /// Wrap an owned buffer as a frame.
    ///
    /// Returns `None` if the buffer is not exactly `width * height` pixels of `format`.
    pub fn new(
        frame_number: usize,
        width: u32,
        height: u32,
        format: PixelFormat,
        decoded_at_us: u64,
        pixels: PixelBuffer,
    ) -> Option<Self> {
        if pixels.len() != format.frame_size(width, height) {
            return None;
        }
        Some(Self {
            frame_number,
            width,
            height,
            format,
            decoded_at_us,
            pixels,
        })
    }

    #[inline]
    pub fn pixels(&self) -> &[u8] {
        self.pixels.as_slice()
    }

    /// Bytes per row (frames are tightly packed).
    #[inline]
    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Total memory usage of this frame in bytes.
    pub fn memory_size(&self) -> usize {
        self.pixels.len()
    }

    /// Consume the frame and keep only its buffer.
    pub fn into_buffer(self) -> PixelBuffer {
        self.pixels
    }
}

/// Arc-wrapped frame for shared ownership between the buffer and a surface.
pub type SharedFrame = Arc<DecodedFrame>;
