// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix framing.
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4B LE) | payload           |
//! +----------------+-------------------+
//! ```
//!
//! TCP is a stream; the reader accumulates raw socket bytes and yields one
//! complete frame at a time. Oversized length prefixes are rejected as soon
//! as the four length bytes are in, before any body accumulates.

use crate::error::{Result, RosError};

/// Frame header size (4 bytes, little-endian length).
pub const LEN_PREFIX: usize = 4;

/// Append one framed payload: `[len: u32 LE][payload]`.
pub fn encode_frame_into(payload: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
}

/// Incremental frame reader over an internal accumulator.
#[derive(Debug)]
pub struct FrameReader {
    buf: Vec<u8>,
    pos: usize,
    max_size: usize,
    frames_decoded: u64,
}

impl FrameReader {
    pub fn new(max_size: usize) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            pos: 0,
            max_size,
            frames_decoded: 0,
        }
    }

    /// Feed raw socket bytes into the accumulator.
    pub fn feed(&mut self, data: &[u8]) {
        // Compact once the consumed prefix dominates.
        if self.pos > 0 && self.pos > self.buf.len() / 2 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed.
    pub fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Number of complete frames yielded so far.
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Pop one complete frame payload, if buffered.
    ///
    /// `Ok(None)` means more bytes are needed. A length prefix above the
    /// configured maximum is a `ProtocolFrame` error; the session dies with
    /// it, so the reader makes no attempt to resynchronize.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let avail = &self.buf[self.pos..];
        if avail.len() < LEN_PREFIX {
            return Ok(None);
        }

        let len = u32::from_le_bytes([avail[0], avail[1], avail[2], avail[3]]) as usize;
        if len > self.max_size {
            return Err(RosError::protocol_frame(format!(
                "frame of {} bytes exceeds limit of {}",
                len, self.max_size
            )));
        }

        if avail.len() < LEN_PREFIX + len {
            return Ok(None);
        }

        let frame = avail[LEN_PREFIX..LEN_PREFIX + len].to_vec();
        self.pos += LEN_PREFIX + len;
        self.frames_decoded += 1;
        Ok(Some(frame))
    }

    /// Pop one raw byte (the service-response ok-byte precedes its frame).
    pub fn take_byte(&mut self) -> Option<u8> {
        if self.pos < self.buf.len() {
            let b = self.buf[self.pos];
            self.pos += 1;
            Some(b)
        } else {
            None
        }
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }
}
