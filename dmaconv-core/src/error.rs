//! Error taxonomy for the conversion engine.
//!
//! The public boolean facade collapses all of these to `false`; the richer
//! types exist so library users and logs can tell a fatal context failure
//! apart from a recoverable per-call import or conversion failure.

use std::fmt;
use thiserror::Error;

/// Which part of a conversion pass failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertStage {
    /// Binding resources or recording the compute pass.
    Bind,
    /// Submitting the recorded work to the GPU queue.
    Execute,
    /// The blocking wait for pass completion.
    Wait,
}

impl fmt::Display for ConvertStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvertStage::Bind => write!(f, "bind"),
            ConvertStage::Execute => write!(f, "execute"),
            ConvertStage::Wait => write!(f, "completion wait"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConvertError {
    /// Display/device/pipeline setup failed. Fatal for this `Accelerator`
    /// instance; create a new one to retry.
    #[error("GPU context initialization failed: {detail}")]
    ContextInit { detail: String },

    /// The context was used from a thread other than the one that
    /// initialized it. A usage error, not a data error.
    #[error("GPU context is bound to another thread")]
    ContextBind,

    /// A specific dma-buf could not be bridged to the GPU. Recoverable;
    /// the context stays valid for subsequent calls.
    #[error("dma-buf import failed: {detail}")]
    Import { detail: String },

    /// The conversion pass itself failed. The output buffer content is
    /// undefined and must not be treated as valid.
    #[error("conversion failed during {stage}: {detail}")]
    Conversion { stage: ConvertStage, detail: String },

    /// Zero or inconsistent dimensions, rejected before any GPU work.
    #[error("invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_is_named_in_conversion_errors() {
        let err = ConvertError::Conversion {
            stage: ConvertStage::Wait,
            detail: "device lost".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("completion wait"), "{msg}");
        assert!(msg.contains("device lost"), "{msg}");
    }
}
