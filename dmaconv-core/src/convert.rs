//! Conversion execution.
//!
//! Records a single compute dispatch over two imported dma-bufs and
//! blocks until the GPU has finished, so the destination buffer is fully
//! written when [`convert`] returns. Failures are tagged with the stage
//! they occurred in (bind, execute, completion wait).

use bytemuck::Zeroable;

use crate::buffer::{BufferDescriptor, PixelFormat};
use crate::context::GpuContext;
use crate::dmabuf::ImportedBuffer;
use crate::error::{ConvertError, ConvertStage};
use crate::shaders::{ConvertParams, WORKGROUP_DIM, WORKGROUP_WORDS};

/// Which way the pixels flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Nv12ToRgb8,
    Rgb8ToNv12,
}

/// One conversion over a pair of already-imported buffers.
pub struct ConversionRequest<'a> {
    pub src: &'a ImportedBuffer,
    pub dst: &'a ImportedBuffer,
    pub width: u32,
    pub height: u32,
    pub direction: Direction,
}

/// Runs the conversion and waits for completion.
pub fn convert(ctx: &GpuContext, req: &ConversionRequest<'_>) -> Result<(), ConvertError> {
    let (yuv, rgb) = match req.direction {
        Direction::Nv12ToRgb8 => (req.src.descriptor(), req.dst.descriptor()),
        Direction::Rgb8ToNv12 => (req.dst.descriptor(), req.src.descriptor()),
    };
    check_formats(yuv, rgb, req.direction)?;

    let chroma_offset = yuv.chroma_offset().ok_or(ConvertError::Conversion {
        stage: ConvertStage::Bind,
        detail: "source descriptor has no chroma plane".into(),
    })?;
    let chroma_offset = u32::try_from(chroma_offset).map_err(|_| ConvertError::Conversion {
        stage: ConvertStage::Bind,
        detail: format!("chroma plane offset {chroma_offset} exceeds addressable range"),
    })?;

    // Round up: an NV12 layout is not always a whole number of words
    // (even stride, odd height). The trailing bytes of the last word fall
    // inside the page-granular allocation.
    let nv12_words = (yuv.required_bytes().div_ceil(4)) as u32;
    let params = ConvertParams {
        width: req.width,
        height: req.height,
        yuv_stride: yuv.row_stride_px,
        rgb_stride: rgb.row_stride_px,
        chroma_offset,
        total_words: nv12_words,
        ..ConvertParams::zeroed()
    };
    ctx.queue()
        .write_buffer(ctx.params_buffer(), 0, bytemuck::bytes_of(&params));

    // Bind-group and encoder validation surfaces here rather than through
    // the global uncaptured-error handler.
    ctx.device().push_error_scope(wgpu::ErrorFilter::Validation);

    let bind_group = ctx.device().create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("convert_bind"),
        layout: ctx.bind_layout(),
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: ctx.params_buffer().as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: req.src.buffer().as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: req.dst.buffer().as_entire_binding(),
            },
        ],
    });

    let mut encoder = ctx
        .device()
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("convert_encoder"),
        });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("convert_pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(ctx.pipeline(req.direction));
        pass.set_bind_group(0, &bind_group, &[]);
        let (x, y) = dispatch_size(req.direction, req.width, req.height, nv12_words)?;
        pass.dispatch_workgroups(x, y, 1);
    }
    let commands = encoder.finish();

    if let Some(err) = pollster::block_on(ctx.device().pop_error_scope()) {
        return Err(ConvertError::Conversion {
            stage: ConvertStage::Bind,
            detail: err.to_string(),
        });
    }

    ctx.device().push_error_scope(wgpu::ErrorFilter::Validation);
    let index = ctx.queue().submit(Some(commands));
    if let Some(err) = pollster::block_on(ctx.device().pop_error_scope()) {
        return Err(ConvertError::Conversion {
            stage: ConvertStage::Execute,
            detail: err.to_string(),
        });
    }

    let state = ctx
        .device()
        .poll(wgpu::Maintain::WaitForSubmissionIndex(index));
    if !state.is_queue_empty() {
        return Err(ConvertError::Conversion {
            stage: ConvertStage::Wait,
            detail: "device did not reach idle after submission".into(),
        });
    }

    tracing::trace!(
        width = req.width,
        height = req.height,
        direction = ?req.direction,
        "conversion complete"
    );
    Ok(())
}

fn check_formats(
    yuv: &BufferDescriptor,
    rgb: &BufferDescriptor,
    direction: Direction,
) -> Result<(), ConvertError> {
    if yuv.format != PixelFormat::Nv12 || rgb.format != PixelFormat::Rgb8 {
        return Err(ConvertError::Conversion {
            stage: ConvertStage::Bind,
            detail: format!(
                "buffer formats {:?}/{:?} do not match direction {:?}",
                yuv.format, rgb.format, direction
            ),
        });
    }
    Ok(())
}

fn dispatch_size(
    direction: Direction,
    width: u32,
    height: u32,
    nv12_words: u32,
) -> Result<(u32, u32), ConvertError> {
    match direction {
        // One thread per RGB pixel.
        Direction::Nv12ToRgb8 => {
            let x = width.div_ceil(WORKGROUP_DIM);
            let y = height.div_ceil(WORKGROUP_DIM);
            if x > 65_535 || y > 65_535 {
                return Err(ConvertError::Conversion {
                    stage: ConvertStage::Bind,
                    detail: format!("image too large for a 2D dispatch ({x}x{y} workgroups)"),
                });
            }
            Ok((x, y))
        }
        // One thread per destination word; a 1D dispatch covers the
        // whole NV12 allocation.
        Direction::Rgb8ToNv12 => {
            let groups = nv12_words.div_ceil(WORKGROUP_WORDS);
            if groups > 65_535 {
                return Err(ConvertError::Conversion {
                    stage: ConvertStage::Bind,
                    detail: format!("image too large for a 1D dispatch ({groups} workgroups)"),
                });
            }
            Ok((groups, 1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_to_rgb8_dispatch_covers_every_pixel() {
        let (x, y) = dispatch_size(Direction::Nv12ToRgb8, 1920, 1080, 0).unwrap();
        assert!(x * WORKGROUP_DIM >= 1920);
        assert!(y * WORKGROUP_DIM >= 1080);
        assert!((x - 1) * WORKGROUP_DIM < 1920);
    }

    #[test]
    fn rgb8_to_nv12_dispatch_covers_every_word() {
        // 1920x1080 NV12 is 1920*1080*3/2 bytes = 777600 words.
        let words = 1920 * 1080 * 3 / 2 / 4;
        let (x, y) = dispatch_size(Direction::Rgb8ToNv12, 1920, 1080, words).unwrap();
        assert_eq!(y, 1);
        assert!(x * WORKGROUP_WORDS >= words);
    }

    #[test]
    fn oversized_2d_dispatch_is_rejected() {
        // 1_048_576 / 16 = 65_536 workgroups, one past the per-axis limit.
        let err = dispatch_size(Direction::Nv12ToRgb8, 1_048_576, 16, 0).unwrap_err();
        assert!(matches!(
            err,
            ConvertError::Conversion {
                stage: ConvertStage::Bind,
                ..
            }
        ));
    }

    #[test]
    fn oversized_1d_dispatch_is_rejected() {
        let err = dispatch_size(Direction::Rgb8ToNv12, 0, 0, u32::MAX).unwrap_err();
        assert!(matches!(
            err,
            ConvertError::Conversion {
                stage: ConvertStage::Bind,
                ..
            }
        ));
    }
}
