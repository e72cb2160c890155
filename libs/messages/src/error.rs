//! Error types for message framing.

use thiserror::Error;

/// Errors that can occur when encoding or decoding a frame.
#[derive(Debug, Error, Clone)]
pub enum MessageError {
    /// The frame was not valid JSON for the expected type.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The frame could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The frame exceeded the maximum line length.
    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}
