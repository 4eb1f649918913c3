//! Receive buffer for the frame parser

use crate::{
    constants::{BUF_CHUNK, MAX_BUFFER_SIZE},
    error::{EslError, EslResult},
};
use bytes::{Buf, BytesMut};

/// Growable byte buffer holding data not yet consumed by the parser.
#[derive(Debug)]
pub(crate) struct EslBuffer {
    data: BytesMut,
}

impl EslBuffer {
    pub(crate) fn new() -> Self {
        Self {
            data: BytesMut::with_capacity(BUF_CHUNK),
        }
    }

    pub(crate) fn extend_from_slice(&mut self, data: &[u8]) {
        self.data
            .extend_from_slice(data);
    }

    /// Refuse to keep buffering once the limit is exceeded.
    pub(crate) fn check_size_limits(&self) -> EslResult<()> {
        if self
            .data
            .len()
            > MAX_BUFFER_SIZE
        {
            return Err(EslError::protocol_error(format!(
                "Receive buffer exceeded {} bytes without a complete message",
                MAX_BUFFER_SIZE
            )));
        }
        Ok(())
    }

    /// Remove and return everything before `pattern`, discarding the pattern itself.
    pub(crate) fn extract_until_pattern(&mut self, pattern: &[u8]) -> Option<Vec<u8>> {
        let pos = self
            .data
            .windows(pattern.len())
            .position(|window| window == pattern)?;
        let extracted = self
            .data
            .split_to(pos)
            .to_vec();
        self.data
            .advance(pattern.len());
        Some(extracted)
    }

    /// Remove and return exactly `len` bytes, or nothing if fewer are buffered.
    pub(crate) fn extract_bytes(&mut self, len: usize) -> Option<Vec<u8>> {
        if self
            .data
            .len()
            < len
        {
            return None;
        }
        Some(
            self.data
                .split_to(len)
                .to_vec(),
        )
    }

    pub(crate) fn len(&self) -> usize {
        self.data
            .len()
    }
}
