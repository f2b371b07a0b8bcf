//! Public conversion facade.
//!
//! [`Accelerator`] mirrors the fd-in, bool-out surface the engine is
//! consumed through: hand it two dma-buf fds and the image dimensions,
//! get back whether the conversion ran. All failure detail goes to the
//! log; callers that want typed errors use [`Accelerator::convert_buffers`]
//! with their own descriptors.

use crate::buffer::{nv12_row_stride, BufferDescriptor, PixelFormat};
use crate::context::GpuContext;
use crate::convert::{convert, ConversionRequest, Direction};
use crate::dmabuf::{import_readable, import_writable};
use crate::error::ConvertError;

/// GPU pixel-format converter over dma-buf file descriptors.
///
/// The GPU context is created on the first conversion and reused for the
/// accelerator's lifetime. If context creation fails, the accelerator is
/// poisoned: every later call fails fast until a new one is constructed.
/// Thread-affine: the context binds to the thread that runs the first
/// conversion, and calls from any other thread are rejected at call time.
#[derive(Default)]
pub struct Accelerator {
    context: Option<GpuContext>,
    poisoned: bool,
}

impl Accelerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Converts an NV12 dma-buf into an RGB8 one.
    ///
    /// `width`/`height` are the logical image dimensions and double as the
    /// stride basis: the NV12 rows are assumed `width` bytes apart (odd
    /// widths are rounded up to the even stride NV12 requires), the RGB8
    /// rows `width * 4` bytes apart.
    pub fn nv12_to_rgb8(&mut self, input_fd: i32, output_fd: i32, width: u32, height: u32) -> bool {
        self.run(input_fd, output_fd, width, height, Direction::Nv12ToRgb8)
    }

    /// Converts an RGB8 dma-buf into an NV12 one. Same dimension
    /// conventions as [`Accelerator::nv12_to_rgb8`].
    pub fn rgb8_to_nv12(&mut self, input_fd: i32, output_fd: i32, width: u32, height: u32) -> bool {
        self.run(input_fd, output_fd, width, height, Direction::Rgb8ToNv12)
    }

    fn run(
        &mut self,
        input_fd: i32,
        output_fd: i32,
        width: u32,
        height: u32,
        direction: Direction,
    ) -> bool {
        match self.convert_fds(input_fd, output_fd, width, height, direction) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(%err, ?direction, width, height, "conversion failed");
                false
            }
        }
    }

    fn convert_fds(
        &mut self,
        input_fd: i32,
        output_fd: i32,
        width: u32,
        height: u32,
        direction: Direction,
    ) -> Result<(), ConvertError> {
        if width == 0 || height == 0 {
            return Err(ConvertError::InvalidDimensions { width, height });
        }

        let nv12 = |fd| BufferDescriptor::from_fd(fd, width, height, nv12_row_stride(width), PixelFormat::Nv12);
        let rgb8 = |fd| BufferDescriptor::from_fd(fd, width, height, width, PixelFormat::Rgb8);

        let (src, dst) = match direction {
            Direction::Nv12ToRgb8 => (nv12(input_fd)?, rgb8(output_fd)?),
            Direction::Rgb8ToNv12 => (rgb8(input_fd)?, nv12(output_fd)?),
        };
        self.convert_buffers(&src, &dst, direction)
    }

    /// Runs one conversion over caller-built descriptors, allowing row
    /// strides wider than the image.
    pub fn convert_buffers(
        &mut self,
        src: &BufferDescriptor,
        dst: &BufferDescriptor,
        direction: Direction,
    ) -> Result<(), ConvertError> {
        if src.width != dst.width || src.height != dst.height {
            return Err(ConvertError::InvalidDimensions {
                width: dst.width,
                height: dst.height,
            });
        }

        let ctx = self.ensure_ready()?;
        ctx.make_current()?;

        let imported_src = import_readable(ctx, src)?;
        let imported_dst = match import_writable(ctx, dst) {
            Ok(buf) => buf,
            Err(err) => {
                imported_src.release(ctx.device());
                return Err(err);
            }
        };

        let result = convert(
            ctx,
            &ConversionRequest {
                src: &imported_src,
                dst: &imported_dst,
                width: src.width,
                height: src.height,
                direction,
            },
        );

        imported_src.release(ctx.device());
        imported_dst.release(ctx.device());
        result
    }

    fn ensure_ready(&mut self) -> Result<&GpuContext, ConvertError> {
        if self.poisoned {
            return Err(ConvertError::ContextInit {
                detail: "GPU context previously failed to initialize; recreate the Accelerator"
                    .into(),
            });
        }
        if self.context.is_none() {
            match GpuContext::new() {
                Ok(ctx) => {
                    tracing::info!(adapter = ctx.adapter_name(), "GPU context ready");
                    self.context = Some(ctx);
                }
                Err(err) => {
                    self.poisoned = true;
                    return Err(err);
                }
            }
        }
        match self.context.as_ref() {
            Some(ctx) => Ok(ctx),
            None => Err(ConvertError::ContextInit {
                detail: "context unavailable".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_dimensions_fail_before_touching_the_gpu() {
        let mut acc = Accelerator::new();
        assert!(!acc.nv12_to_rgb8(3, 4, 0, 1080));
        assert!(!acc.rgb8_to_nv12(3, 4, 1920, 0));
        // The failure path above must not have poisoned the accelerator.
        assert!(!acc.poisoned);
    }
}
