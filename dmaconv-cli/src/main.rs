//! # dmaconv
//!
//! Command-line harness for the dma-buf conversion engine: loads a raw
//! image file into a dma-heap buffer, runs one GPU conversion, and saves
//! the converted buffer back to a file.
//!
//! Width and height are aligned up before conversion (128/32 by default,
//! matching common camera pipeline alignment), so input files must be
//! laid out with the aligned dimensions.

mod heap;

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use dma_heap::HeapKind;
use dmaconv_core::{Accelerator, PixelFormat};
use tracing_subscriber::EnvFilter;

use crate::heap::DmaBuffer;

#[derive(Parser)]
#[command(name = "dmaconv", version, about = "GPU pixel format conversion over dma-buf")]
struct Cli {
    /// Image width in pixels, before alignment
    #[arg(long)]
    width: u32,

    /// Image height in pixels, before alignment
    #[arg(long)]
    height: u32,

    /// Alignment applied to the width
    #[arg(long, default_value_t = 128)]
    align_width: u32,

    /// Alignment applied to the height
    #[arg(long, default_value_t = 32)]
    align_height: u32,

    /// Raw input image file
    #[arg(long)]
    input: PathBuf,

    /// Output file for the converted image
    #[arg(long)]
    output: PathBuf,

    #[command(subcommand)]
    direction: DirectionCmd,
}

#[derive(Subcommand)]
enum DirectionCmd {
    /// Convert a raw NV12 file to RGB8
    Nv12ToRgb8,
    /// Convert a raw RGB8 file (4 bytes per pixel) to NV12
    Rgb8ToNv12,
}

fn align(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if cli.width == 0 || cli.height == 0 || cli.align_width == 0 || cli.align_height == 0 {
        bail!("width, height and alignments must be non-zero");
    }

    let width = align(cli.width, cli.align_width);
    let height = align(cli.height, cli.align_height);
    if (width, height) != (cli.width, cli.height) {
        tracing::info!(width, height, "dimensions aligned up");
    }

    let (src_format, dst_format) = match cli.direction {
        DirectionCmd::Nv12ToRgb8 => (PixelFormat::Nv12, PixelFormat::Rgb8),
        DirectionCmd::Rgb8ToNv12 => (PixelFormat::Rgb8, PixelFormat::Nv12),
    };
    let src_bytes = src_format.required_bytes(width, height) as usize;
    let dst_bytes = dst_format.required_bytes(width, height) as usize;

    let data = fs::read(&cli.input)?;
    if data.len() < src_bytes {
        bail!(
            "{} holds {} bytes, {}x{} {:?} needs {}",
            cli.input.display(),
            data.len(),
            width,
            height,
            src_format,
            src_bytes
        );
    }

    let heap = heap::open_heap(HeapKind::System)?;
    let mut input = DmaBuffer::allocate(&heap, src_bytes)?;
    input.as_mut_slice().copy_from_slice(&data[..src_bytes]);
    let output = DmaBuffer::allocate(&heap, dst_bytes)?;

    let mut acc = Accelerator::new();
    let ok = match cli.direction {
        DirectionCmd::Nv12ToRgb8 => acc.nv12_to_rgb8(input.raw_fd(), output.raw_fd(), width, height),
        DirectionCmd::Rgb8ToNv12 => acc.rgb8_to_nv12(input.raw_fd(), output.raw_fd(), width, height),
    };
    if !ok {
        bail!("conversion failed (run with RUST_LOG=debug for details)");
    }

    fs::write(&cli.output, output.as_slice())?;
    tracing::info!(
        output = %cli.output.display(),
        bytes = dst_bytes,
        "conversion complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::align;

    #[test]
    fn alignment_rounds_up_to_the_next_multiple() {
        assert_eq!(align(1920, 128), 1920);
        assert_eq!(align(1080, 32), 1088);
        assert_eq!(align(1, 128), 128);
    }
}
