//! Line-delimited JSON framing: one `{"xid":..,"msg":{"type":..}}` object
//! per line.

use thiserror::Error;

use super::Frame;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Serialize a frame, newline included.
pub fn encode(frame: &Frame) -> Result<String, CodecError> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

pub fn decode(line: &str) -> Result<Frame, CodecError> {
    Ok(serde_json::from_str(line.trim_end())?)
}
