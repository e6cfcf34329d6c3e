//! Typed errors for the output pipeline

use thiserror::Error;

/// Errors surfaced by the packing, ancillary and scheduling layers.
#[derive(Debug, Error)]
pub enum OutputError {
    /// Invalid configuration or input, caught before anything reaches the device.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A fixed protocol capacity was exceeded; the payload was truncated or dropped.
    #[error("ancillary capacity exceeded: {0}")]
    Capacity(String),

    /// A device call failed. The frame is dropped, the slot reclaimed, and the
    /// pipeline continues with the next frame.
    #[error("device call `{call}` failed: {detail}")]
    Device { call: &'static str, detail: String },

    /// Allocation failure while preparing a unit for hand-off.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),
}

impl OutputError {
    pub fn device(call: &'static str, detail: impl Into<String>) -> Self {
        Self::Device {
            call,
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OutputError>;
