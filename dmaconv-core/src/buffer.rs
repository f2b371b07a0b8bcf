//! Pixel formats and dma-buf image layout math.
//!
//! A [`BufferDescriptor`] describes one caller-owned dma-buf as an image:
//! file descriptor, real byte size, logical dimensions, row stride and
//! pixel format. All plane/size arithmetic for the two supported layouts
//! lives here so the GPU modules never juggle raw byte offsets.
//!
//! Layout contracts (see also `shaders.rs` for the transform constants):
//!
//! - **NV12**: a luma plane of `stride * height` bytes, immediately
//!   followed by an interleaved UV plane of `stride * ceil(height / 2)`
//!   bytes, chroma subsampled 2x2. The stride must be even so U/V pairs
//!   never straddle rows.
//! - **RGB8**: 4 bytes per pixel `R, G, B, X` (X written as 0xFF, ignored
//!   on input), rows padded to `stride * 4` bytes. One pixel is always one
//!   aligned 32-bit word.

use std::mem;
use std::os::fd::RawFd;

use crate::error::ConvertError;

// ============================================================================
// Pixel Formats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Semi-planar YUV 4:2:0, one byte per sample.
    Nv12,
    /// Packed RGB, stored as 4 bytes per pixel (R, G, B, X).
    Rgb8,
}

impl PixelFormat {
    /// Minimum buffer size for an image with the given stride and height.
    pub fn required_bytes(&self, row_stride_px: u32, height: u32) -> u64 {
        let stride = row_stride_px as u64;
        let h = height as u64;
        match self {
            PixelFormat::Nv12 => stride * h + stride * h.div_ceil(2),
            PixelFormat::Rgb8 => stride * 4 * h,
        }
    }
}

/// Row stride the boolean facade derives for an NV12 image of the given
/// width: the width itself, rounded up to even so UV pairs stay in-row.
pub fn nv12_row_stride(width: u32) -> u32 {
    width + (width & 1)
}

// ============================================================================
// Buffer Descriptor
// ============================================================================

/// One caller-owned dma-buf, described as an image.
///
/// The descriptor borrows the fd; it never closes it. `byte_size` is the
/// actual size of the underlying buffer (from `fstat`), which is allowed
/// to exceed the minimum layout size (dma-heap allocations are
/// page-aligned).
#[derive(Debug, Clone, Copy)]
pub struct BufferDescriptor {
    pub fd: RawFd,
    pub byte_size: u64,
    pub width: u32,
    pub height: u32,
    pub row_stride_px: u32,
    pub format: PixelFormat,
}

impl BufferDescriptor {
    /// Builds a validated descriptor, reading the buffer size from the fd.
    ///
    /// Fails with [`ConvertError::Import`] if the fd is invalid or the
    /// buffer is too small for the declared layout.
    pub fn from_fd(
        fd: RawFd,
        width: u32,
        height: u32,
        row_stride_px: u32,
        format: PixelFormat,
    ) -> Result<Self, ConvertError> {
        let byte_size = fd_byte_size(fd)?;
        let desc = Self {
            fd,
            byte_size,
            width,
            height,
            row_stride_px,
            format,
        };
        desc.validate()?;
        Ok(desc)
    }

    pub fn required_bytes(&self) -> u64 {
        self.format.required_bytes(self.row_stride_px, self.height)
    }

    /// Byte offset of the interleaved UV plane. `None` for packed formats.
    pub fn chroma_offset(&self) -> Option<u64> {
        match self.format {
            PixelFormat::Nv12 => Some(self.row_stride_px as u64 * self.height as u64),
            PixelFormat::Rgb8 => None,
        }
    }

    /// Checks the stride/size contract. Violations are reported as
    /// [`ConvertError::Import`]: the allocator and the caller agreed on an
    /// alignment, so a mismatch here is a broken contract, not a condition
    /// to paper over.
    pub fn validate(&self) -> Result<(), ConvertError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConvertError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if self.row_stride_px < self.width {
            return Err(ConvertError::Import {
                detail: format!(
                    "row stride {} is smaller than image width {}",
                    self.row_stride_px, self.width
                ),
            });
        }
        if self.format == PixelFormat::Nv12 && self.row_stride_px % 2 != 0 {
            return Err(ConvertError::Import {
                detail: format!("NV12 row stride {} must be even", self.row_stride_px),
            });
        }
        let required = self.required_bytes();
        if self.byte_size < required {
            return Err(ConvertError::Import {
                detail: format!(
                    "buffer holds {} bytes but {:?} {}x{} with stride {} needs {}",
                    self.byte_size,
                    self.format,
                    self.width,
                    self.height,
                    self.row_stride_px,
                    required
                ),
            });
        }
        Ok(())
    }
}

/// Size of the buffer behind `fd`, via `fstat`. This is also the cheapest
/// way to reject a closed or bogus fd before touching the GPU.
pub(crate) fn fd_byte_size(fd: RawFd) -> Result<u64, ConvertError> {
    let mut stat: libc::stat = unsafe { mem::zeroed() };
    let rc = unsafe { libc::fstat(fd, &mut stat) };
    if rc != 0 {
        return Err(ConvertError::Import {
            detail: format!(
                "fstat on fd {} failed: {}",
                fd,
                std::io::Error::last_os_error()
            ),
        });
    }
    Ok(stat.st_size as u64)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(
        byte_size: u64,
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
    ) -> BufferDescriptor {
        BufferDescriptor {
            fd: -1,
            byte_size,
            width,
            height,
            row_stride_px: stride,
            format,
        }
    }

    #[test]
    fn nv12_size_is_one_and_a_half_planes() {
        assert_eq!(PixelFormat::Nv12.required_bytes(64, 32), 64 * 32 + 64 * 16);
        assert_eq!(PixelFormat::Nv12.required_bytes(128, 30), 128 * 30 + 128 * 15);
    }

    #[test]
    fn nv12_chroma_rows_round_up_for_odd_heights() {
        // 3 luma rows, 2 chroma rows.
        assert_eq!(PixelFormat::Nv12.required_bytes(64, 3), 64 * 3 + 64 * 2);
        assert_eq!(PixelFormat::Nv12.required_bytes(2, 1), 2 + 2);
    }

    #[test]
    fn rgb8_is_four_bytes_per_pixel() {
        assert_eq!(PixelFormat::Rgb8.required_bytes(64, 32), 64 * 4 * 32);
    }

    #[test]
    fn facade_stride_rounds_width_to_even() {
        assert_eq!(nv12_row_stride(1), 2);
        assert_eq!(nv12_row_stride(2), 2);
        assert_eq!(nv12_row_stride(1919), 1920);
        assert_eq!(nv12_row_stride(1920), 1920);
    }

    #[test]
    fn chroma_plane_starts_after_luma() {
        let d = desc(64 * 48, 60, 32, 64, PixelFormat::Nv12);
        assert_eq!(d.chroma_offset(), Some(64 * 32));
        assert_eq!(desc(1 << 20, 60, 32, 64, PixelFormat::Rgb8).chroma_offset(), None);
    }

    #[test]
    fn zero_dimensions_are_rejected() {
        let d = desc(1 << 20, 0, 32, 64, PixelFormat::Nv12);
        assert!(matches!(
            d.validate(),
            Err(ConvertError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn stride_below_width_is_rejected() {
        let d = desc(1 << 20, 100, 32, 64, PixelFormat::Rgb8);
        assert!(matches!(d.validate(), Err(ConvertError::Import { .. })));
    }

    #[test]
    fn odd_nv12_stride_is_rejected() {
        let d = desc(1 << 20, 33, 32, 33, PixelFormat::Nv12);
        assert!(matches!(d.validate(), Err(ConvertError::Import { .. })));
    }

    #[test]
    fn undersized_buffer_is_rejected() {
        let needed = PixelFormat::Nv12.required_bytes(64, 32);
        let d = desc(needed - 1, 64, 32, 64, PixelFormat::Nv12);
        assert!(matches!(d.validate(), Err(ConvertError::Import { .. })));
        assert!(desc(needed, 64, 32, 64, PixelFormat::Nv12).validate().is_ok());
    }

    #[test]
    fn fstat_on_closed_fd_is_an_import_error() {
        assert!(matches!(fd_byte_size(-1), Err(ConvertError::Import { .. })));
    }
}
