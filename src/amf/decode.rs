// AMF decoder utilities

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use crate::base::StreamError;

/// AMF decoding error
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmfError {
    #[error("unexpected end of AMF data")]
    EndOfData,

    #[error("unsupported AMF0 marker 0x{0:02x}")]
    UnsupportedMarker(u8),

    #[error("AMF string is not valid UTF-8")]
    InvalidString,
}

impl From<AmfError> for StreamError {
    fn from(e: AmfError) -> StreamError {
        StreamError::ProtocolViolation(e.to_string())
    }
}

// Cursor for AMF decoding
pub struct AMFDecodingCursor<'a> {
    /// Buffer being decoded
    buffer: &'a [u8],

    /// Current position
    pos: usize,
}

impl<'a> AMFDecodingCursor<'a> {
    /// Creates new cursor for a buffer
    pub fn new(buffer: &'a [u8]) -> AMFDecodingCursor<'a> {
        AMFDecodingCursor { buffer, pos: 0 }
    }

    /// Checks if the cursor position can be incremented by n units
    fn can_increment_pos(&self, n: usize) -> bool {
        match self.pos.checked_add(n) {
            Some(np) => np <= self.buffer.len(),
            None => false,
        }
    }

    /// Reads bytes
    /// Errors on buffer overflow
    pub fn read(&mut self, n: usize) -> Result<&'a [u8], AmfError> {
        if !self.can_increment_pos(n) {
            return Err(AmfError::EndOfData);
        }

        let pos = self.pos;
        self.pos += n;

        Ok(&self.buffer[pos..(pos + n)])
    }

    /// Reads byte
    pub fn read_byte(&mut self) -> Result<u8, AmfError> {
        Ok(self.read(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, AmfError> {
        Ok(BigEndian::read_u16(self.read(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32, AmfError> {
        Ok(BigEndian::read_u32(self.read(4)?))
    }

    pub fn read_f64(&mut self) -> Result<f64, AmfError> {
        Ok(BigEndian::read_f64(self.read(8)?))
    }

    /// Reads a string of n bytes
    pub fn read_utf8(&mut self, n: usize) -> Result<String, AmfError> {
        let bytes = self.read(n)?;

        String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidString)
    }

    /// Looks byte, without changing the cursor
    pub fn look_byte(&self) -> Result<u8, AmfError> {
        self.buffer
            .get(self.pos)
            .copied()
            .ok_or(AmfError::EndOfData)
    }

    /// Skips bytes
    pub fn skip(&mut self, n: usize) -> Result<(), AmfError> {
        if !self.can_increment_pos(n) {
            return Err(AmfError::EndOfData);
        }

        self.pos += n;

        Ok(())
    }

    /// Current position in the buffer
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Returns true if the cursor is at the end
    pub fn ended(&self) -> bool {
        self.pos >= self.buffer.len()
    }
}

// Tests
