//! Wire framing for render requests.
//!
//! A request is the raw byte stream a client sends before half-closing its
//! side of the connection. It may carry a short mode tag in front of the
//! markdown, separated by a single NUL byte:
//!
//! ```text
//! <mode-tag, 2..=10 bytes> 0x00 <markdown text>
//! ```
//!
//! Without that prefix the whole payload is markdown and the mode is `gfm`.

use std::borrow::Cow;

use bytes::Bytes;
use thiserror::Error;

/// Mode used when the payload carries no tag.
pub const DEFAULT_MODE: &str = "gfm";

/// Smallest byte offset at which the tag separator may appear.
pub const MIN_TAG_LEN: usize = 2;
/// Largest byte offset at which the tag separator may appear.
pub const MAX_TAG_LEN: usize = 10;

const SEPARATOR: u8 = 0x00;

/// A decoded request: optional mode tag plus the byte-exact content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    mode: Option<String>,
    content: Bytes,
}

impl Frame {
    pub fn new(mode: Option<String>, content: impl Into<Bytes>) -> Self {
        Self {
            mode,
            content: content.into(),
        }
    }

    /// The requested mode, falling back to [`DEFAULT_MODE`].
    pub fn mode(&self) -> &str {
        self.mode.as_deref().unwrap_or(DEFAULT_MODE)
    }

    /// Whether the client supplied a tag (even one equal to `gfm`).
    pub fn has_explicit_mode(&self) -> bool {
        self.mode.is_some()
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Content as text; invalid UTF-8 sequences are replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }
}

/// Split a complete payload into its mode tag and content.
///
/// Only the first NUL inside the tag window (offsets 2 through 10) counts as
/// a separator; NUL bytes anywhere else are ordinary content.
pub fn decode(payload: &[u8]) -> Frame {
    let window_end = payload.len().min(MAX_TAG_LEN + 1);
    let separator = payload
        .get(MIN_TAG_LEN..window_end)
        .and_then(|window| window.iter().position(|byte| *byte == SEPARATOR))
        .map(|offset| offset + MIN_TAG_LEN);

    match separator {
        Some(index) => Frame {
            mode: Some(String::from_utf8_lossy(&payload[..index]).into_owned()),
            content: Bytes::copy_from_slice(&payload[index + 1..]),
        },
        None => Frame {
            mode: None,
            content: Bytes::copy_from_slice(payload),
        },
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("mode tag must be between {MIN_TAG_LEN} and {MAX_TAG_LEN} bytes, got {len}")]
    TagLength { len: usize },
    #[error("mode tag must not contain NUL bytes")]
    TagContainsNul,
}

/// Build a request payload, optionally prefixed with a mode tag.
pub fn encode(mode: Option<&str>, content: &[u8]) -> Result<Vec<u8>, FrameError> {
    let Some(mode) = mode else {
        return Ok(content.to_vec());
    };

    let tag = mode.as_bytes();
    if !(MIN_TAG_LEN..=MAX_TAG_LEN).contains(&tag.len()) {
        return Err(FrameError::TagLength { len: tag.len() });
    }
    if tag.contains(&SEPARATOR) {
        return Err(FrameError::TagContainsNul);
    }

    let mut payload = Vec::with_capacity(tag.len() + 1 + content.len());
    payload.extend_from_slice(tag);
    payload.push(SEPARATOR);
    payload.extend_from_slice(content);
    Ok(payload)
}
