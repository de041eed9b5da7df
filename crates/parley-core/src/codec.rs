//! Length-prefixed JSON framing for the parley socket.
//!
//! Wire format: `[4-byte big-endian length][UTF-8 JSON payload]`

use crate::error::{ParleyError, ParleyResult};

/// Largest payload accepted unless the caller configures otherwise (64 KiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Encode a serializable value into a length-prefixed JSON frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> ParleyResult<Vec<u8>> {
    let payload = serde_json::to_vec(value)?;

    let len = u32::try_from(payload.len())
        .map_err(|_| ParleyError::MalformedMessage("frame exceeds u32 length".into()))?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a JSON payload (without length prefix) into a typed value.
pub fn json_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> ParleyResult<T> {
    let value: T = serde_json::from_slice(data)?;
    Ok(value)
}

/// Streaming frame decoder: accumulates bytes and yields complete frames.
///
/// One socket read may carry several frames, or only part of one; the
/// decoder keeps the remainder until the next `feed`.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Decoder that rejects any frame whose payload exceeds `max_len` bytes.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_len,
        }
    }

    /// Feed bytes into the decoder and return all complete JSON-decoded messages.
    pub fn feed<T: serde::de::DeserializeOwned>(&mut self, data: &[u8]) -> ParleyResult<Vec<T>> {
        self.feed_raw(data)?
            .iter()
            .map(|payload| json_decode(payload))
            .collect()
    }

    /// Feed raw bytes and return complete raw frames (undecoded JSON payloads).
    pub fn feed_raw(&mut self, data: &[u8]) -> ParleyResult<Vec<Vec<u8>>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        while self.buffer.len() >= 4 {
            let len =
                u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                    as usize;

            if len == 0 {
                return Err(ParleyError::MalformedMessage("empty frame".into()));
            }
            if len > self.max_len {
                return Err(ParleyError::MalformedMessage(format!(
                    "frame too large: {len} bytes (max {})",
                    self.max_len
                )));
            }
            if self.buffer.len() < 4 + len {
                break;
            }

            frames.push(self.buffer[4..4 + len].to_vec());
            self.buffer.drain(..4 + len);
        }

        Ok(frames)
    }

    /// Reset internal buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
