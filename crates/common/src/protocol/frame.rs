// Frame layout: varuint(message_type) ++ payload (lib0 variable-length encoding).

use thiserror::Error;
use yrs::encoding::read::{self, Cursor, Read};
use yrs::encoding::write::Write;

/// Top-level message types carried by a relay frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Document sync: handshake steps and incremental updates.
    Sync,
    /// Ephemeral presence state.
    Awareness,
}

impl MessageType {
    pub const fn tag(self) -> u64 {
        match self {
            Self::Sync => 0,
            Self::Awareness => 1,
        }
    }

    pub const fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(Self::Sync),
            1 => Some(Self::Awareness),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Awareness => "awareness",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("frame is empty")]
    Empty,

    #[error("malformed varuint: {0}")]
    Header(String),

    #[error("length prefix {declared} exceeds remaining {remaining} bytes")]
    Truncated { declared: u64, remaining: usize },
}

impl From<read::Error> for FrameError {
    fn from(error: read::Error) -> Self {
        Self::Header(error.to_string())
    }
}

/// A decoded frame header. The tag stays raw so callers can report unknown types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame<'a> {
    pub tag: u64,
    pub payload: &'a [u8],
}

impl RawFrame<'_> {
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_tag(self.tag)
    }
}

pub fn decode_frame(raw: &[u8]) -> Result<RawFrame<'_>, FrameError> {
    if raw.is_empty() {
        return Err(FrameError::Empty);
    }

    let mut cursor = Cursor::new(raw);
    let tag: u64 = cursor.read_var()?;
    Ok(RawFrame { tag, payload: &raw[cursor.next..] })
}

pub fn encode_frame(message_type: MessageType, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.write_var(message_type.tag());
    frame.extend_from_slice(payload);
    frame
}

/// Wrap `bytes` as `varuint(len) ++ bytes`, the shape of an awareness payload.
pub fn encode_var_buf(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + 4);
    out.write_buf(bytes);
    out
}

/// Inverse of [`encode_var_buf`]. Trailing bytes after the declared length are ignored.
pub fn decode_var_buf(payload: &[u8]) -> Result<&[u8], FrameError> {
    let mut cursor = Cursor::new(payload);
    let declared: u64 = cursor.read_var()?;
    let start = cursor.next;
    let remaining = payload.len() - start;
    if declared > remaining as u64 {
        return Err(FrameError::Truncated { declared, remaining });
    }

    Ok(&payload[start..start + declared as usize])
}
