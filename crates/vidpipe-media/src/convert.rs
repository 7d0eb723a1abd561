//! Pixel conversion from source formats into a 4-channel presentation format.

use crate::source::RawFrame;
use thiserror::Error;
use vidpipe_core::PixelFormat;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("{format} frame {width}x{height} needs {expected} bytes, got {actual}")]
    SizeMismatch {
        format: PixelFormat,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Cannot convert {from} to {to}")]
    Unsupported { from: PixelFormat, to: PixelFormat },
}

/// Byte positions of R, G and B inside one output pixel. Alpha is always last.
#[derive(Clone, Copy)]
struct ChannelOrder {
    r: usize,
    g: usize,
    b: usize,
}

impl ChannelOrder {
    fn for_format(format: PixelFormat) -> Option<Self> {
        match format {
            PixelFormat::Rgba8 => Some(Self { r: 0, g: 1, b: 2 }),
            PixelFormat::Bgra8 => Some(Self { r: 2, g: 1, b: 0 }),
            _ => None,
        }
    }

    #[inline]
    fn put(self, px: &mut [u8], r: u8, g: u8, b: u8, a: u8) {
        px[self.r] = r;
        px[self.g] = g;
        px[self.b] = b;
        px[3] = a;
    }
}

/// Convert `src` into `to`, writing a tightly packed frame into `dst`.
///
/// `dst` must be exactly `to.frame_size(src.width, src.height)` bytes.
pub fn convert_frame(src: &RawFrame<'_>, to: PixelFormat, dst: &mut [u8]) -> Result<(), ConvertError> {
    let order = ChannelOrder::for_format(to).ok_or(ConvertError::Unsupported {
        from: src.format,
        to,
    })?;

    check_size(src.format, src.width, src.height, src.data.len())?;
    check_size(to, src.width, src.height, dst.len())?;

    match src.format {
        PixelFormat::Rgba8 | PixelFormat::Bgra8 if src.format == to => {
            dst.copy_from_slice(src.data);
        }
        PixelFormat::Rgba8 | PixelFormat::Bgra8 => {
            // Only the R and B channels differ between the two layouts.
            for (out, px) in dst.chunks_exact_mut(4).zip(src.data.chunks_exact(4)) {
                out[0] = px[2];
                out[1] = px[1];
                out[2] = px[0];
                out[3] = px[3];
            }
        }
        PixelFormat::Rgb8 => {
            for (out, px) in dst.chunks_exact_mut(4).zip(src.data.chunks_exact(3)) {
                order.put(out, px[0], px[1], px[2], 255);
            }
        }
        PixelFormat::Gray8 => {
            for (out, &luma) in dst.chunks_exact_mut(4).zip(src.data.iter()) {
                order.put(out, luma, luma, luma, 255);
            }
        }
        PixelFormat::Nv12 => nv12_to_packed(src, order, dst),
    }

    Ok(())
}

fn check_size(format: PixelFormat, width: u32, height: u32, actual: usize) -> Result<(), ConvertError> {
    let expected = format.frame_size(width, height);
    if expected != actual {
        return Err(ConvertError::SizeMismatch {
            format,
            width,
            height,
            expected,
            actual,
        });
    }
    Ok(())
}

/// BT.601 limited-range YUV to RGB, integer arithmetic.
fn nv12_to_packed(src: &RawFrame<'_>, order: ChannelOrder, dst: &mut [u8]) {
    let width = src.width as usize;
    let height = src.height as usize;
    let chroma_stride = width.div_ceil(2) * 2;
    let (y_plane, uv_plane) = src.data.split_at(width * height);

    for row in 0..height {
        let y_row = &y_plane[row * width..(row + 1) * width];
        let uv_row = &uv_plane[(row / 2) * chroma_stride..(row / 2 + 1) * chroma_stride];
        let out_row = &mut dst[row * width * 4..(row + 1) * width * 4];

        for (col, out) in out_row.chunks_exact_mut(4).enumerate() {
            let c = y_row[col] as i32 - 16;
            let d = uv_row[(col / 2) * 2] as i32 - 128;
            let e = uv_row[(col / 2) * 2 + 1] as i32 - 128;

            let r = (298 * c + 409 * e + 128) >> 8;
            let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
            let b = (298 * c + 516 * d + 128) >> 8;

            order.put(out, clamp_u8(r), clamp_u8(g), clamp_u8(b), 255);
        }
    }
}

#[inline]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}
