//! Newline-delimited JSON framing.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::MessageError;

/// Largest accepted frame, newline excluded.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Encode a message as one line, trailing newline included.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<String, MessageError> {
    let mut line =
        serde_json::to_string(message).map_err(|e| MessageError::Serialization(e.to_string()))?;
    if line.len() > MAX_FRAME_BYTES {
        return Err(MessageError::TooLarge {
            size: line.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    line.push('\n');
    Ok(line)
}

/// Decode one line. Surrounding whitespace, including the newline, is ignored.
pub fn decode_frame<T: DeserializeOwned>(line: &str) -> Result<T, MessageError> {
    let line = line.trim();
    if line.len() > MAX_FRAME_BYTES {
        return Err(MessageError::TooLarge {
            size: line.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    serde_json::from_str(line).map_err(|e| MessageError::Malformed(e.to_string()))
}
