//! Error types for the demultiplexer administrative interface.
//!
//! Errors on the packet path never surface here; they are counted in
//! [`crate::DemuxStats`] instead.

use thiserror::Error;

use crate::bbframe::BbFrameError;

/// Errors returned by feed/filter registration and lifecycle calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DemuxError {
    /// A parameter is out of range or the feed is in the wrong state.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No free feed or filter slot, or the feed is already filtering.
    #[error("Resource busy: {0}")]
    Busy(&'static str),

    /// The required collaborator hook is not installed.
    #[error("No device: {0}")]
    NoDevice(&'static str),

    /// The feed has no buffer, or the buffer is too small for the request.
    #[error("No buffer space: {0}")]
    NoBuffer(&'static str),

    /// The handle refers to a slot that has been released or reused.
    #[error("Stale handle: slot {index} generation {generation}")]
    StaleHandle { index: usize, generation: u32 },

    /// A collaborator hook reported a failure.
    #[error("Hook failed: {0}")]
    Hook(String),

    /// A base-band frame handed to `swfilter_bbframe` was rejected.
    #[error("Base-band frame rejected: {0}")]
    BbFrame(#[from] BbFrameError),
}

/// Result alias for demux operations.
pub type Result<T> = std::result::Result<T, DemuxError>;
