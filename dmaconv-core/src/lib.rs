//! # dmaconv-core
//!
//! Hardware-accelerated pixel format conversion between semi-planar
//! YUV 4:2:0 (NV12) and packed 8-bit RGB, operating directly on
//! dma-buf file descriptors.
//!
//! Input and output buffers are allocated by the caller (typically from a
//! dma-heap) and imported into the GPU as external memory, so the
//! conversion runs without any intermediate CPU copy. The caller keeps
//! ownership of the file descriptors at all times; the accelerator only
//! borrows them for the duration of one conversion call.
//!
//! Entry point is [`Accelerator`]:
//!
//! ```no_run
//! use dmaconv_core::Accelerator;
//!
//! # let (input_fd, output_fd) = (3, 4);
//! let mut acc = Accelerator::new();
//! let ok = acc.nv12_to_rgb8(input_fd, output_fd, 1920, 1080);
//! ```

pub mod accelerator;
pub mod buffer;
pub mod context;
pub mod convert;
pub mod dmabuf;
pub mod error;
pub mod shaders;

pub use accelerator::Accelerator;
pub use buffer::{BufferDescriptor, PixelFormat};
pub use convert::Direction;
pub use error::{ConvertError, ConvertStage};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
