//! Base64 transcoding of file bytes for the text protocol.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::{CubbyError, Result};

/// Encode raw file bytes as padded standard Base64.
pub fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode a Base64 payload. Surrounding whitespace is ignored.
pub fn decode(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| CubbyError::Decode(e.to_string()))
}
