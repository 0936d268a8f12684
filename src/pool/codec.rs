//! Frame codecs for the worker pipes.
//!
//! The two directions use different framing:
//!
//! - **Down** (dispatcher → worker): one JSON document per line. Commands are
//!   small and `serde_json` never emits a raw newline, so `\n` is a safe
//!   delimiter.
//! - **Up** (worker → dispatcher): an 8-byte big-endian length followed by
//!   that many bytes of JSON. Results are unbounded and arrive in arbitrary
//!   chunks, so the reader needs the length to know when a frame is complete.
//!
//! Both codecs share the same contract: `encode` produces the bytes of one
//! frame and `try_decode` returns `Ok(None)` until the buffer holds a complete
//! frame, then the message and the number of bytes it occupied.

use crate::error::{ProcfanError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Size of the upward length prefix.
pub const LEN_PREFIX_SIZE: usize = 8;

/// Default cap on the declared length of an upward frame (1 GiB).
pub const MAX_FRAME_LEN: u64 = 1024 * 1024 * 1024;

/// Newline-delimited JSON, used for commands.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineCodec;

impl LineCodec {
    pub fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(msg)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn try_decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<Option<(T, usize)>> {
        let Some(end) = buf.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let line = &buf[..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let msg = serde_json::from_slice(line)?;
        Ok(Some((msg, end + 1)))
    }
}

/// Length-prefixed JSON, used for replies.
#[derive(Debug, Clone, Copy)]
pub struct LengthPrefixedCodec {
    max_frame_len: u64,
}

impl Default for LengthPrefixedCodec {
    fn default() -> Self {
        Self {
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

impl LengthPrefixedCodec {
    /// Create a codec that rejects frames longer than `max_frame_len` bytes.
    pub fn with_max_frame_len(max_frame_len: u64) -> Self {
        Self { max_frame_len }
    }

    pub fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(msg)?;
        let mut bytes = Vec::with_capacity(LEN_PREFIX_SIZE + payload.len());
        bytes.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    pub fn try_decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<Option<(T, usize)>> {
        let Some(prefix) = buf.first_chunk::<LEN_PREFIX_SIZE>() else {
            return Ok(None);
        };
        let len = u64::from_be_bytes(*prefix);
        if len > self.max_frame_len {
            return Err(ProcfanError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        // len <= max_frame_len, which fits in usize on every supported target
        let total = LEN_PREFIX_SIZE + len as usize;
        if buf.len() < total {
            return Ok(None);
        }
        let msg = serde_json::from_slice(&buf[LEN_PREFIX_SIZE..total])?;
        Ok(Some((msg, total)))
    }
}
