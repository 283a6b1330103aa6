// Bit level reader for codec parameter sets

use crate::base::{StreamError, StreamResult};

fn end_of_data() -> StreamError {
    StreamError::MalformedMedia("unexpected end of bitstream".to_string())
}

/// MSB first bit reader with Exp-Golomb support
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_pos: usize,
    bit_pos: u8,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> BitReader<'a> {
        BitReader {
            data,
            byte_pos: 0,
            bit_pos: 0,
        }
    }

    pub fn read_bit(&mut self) -> StreamResult<bool> {
        if self.byte_pos >= self.data.len() {
            return Err(end_of_data());
        }

        let bit = (self.data[self.byte_pos] >> (7 - self.bit_pos)) & 1;

        self.bit_pos += 1;

        if self.bit_pos == 8 {
            self.bit_pos = 0;
            self.byte_pos += 1;
        }

        Ok(bit != 0)
    }

    /// Reads up to 32 bits
    pub fn read_bits(&mut self, n: u8) -> StreamResult<u32> {
        let mut value: u32 = 0;

        for _ in 0..n.min(32) {
            value = (value << 1) | (self.read_bit()? as u32);
        }

        Ok(value)
    }

    pub fn skip_bits(&mut self, n: usize) -> StreamResult<()> {
        for _ in 0..n {
            self.read_bit()?;
        }

        Ok(())
    }

    /// Reads an unsigned Exp-Golomb value, ue(v)
    pub fn read_ue(&mut self) -> StreamResult<u32> {
        let mut leading_zeros = 0u8;

        while !self.read_bit()? {
            leading_zeros += 1;

            if leading_zeros > 31 {
                return Err(StreamError::MalformedMedia(
                    "Exp-Golomb value overflow".to_string(),
                ));
            }
        }

        if leading_zeros == 0 {
            return Ok(0);
        }

        let suffix = self.read_bits(leading_zeros)?;

        Ok(((1u64 << leading_zeros) - 1 + suffix as u64) as u32)
    }

    /// Reads a signed Exp-Golomb value, se(v)
    pub fn read_se(&mut self) -> StreamResult<i32> {
        let v = self.read_ue()? as i64;

        if v & 1 == 1 {
            Ok(((v + 1) / 2) as i32)
        } else {
            Ok((-(v / 2)) as i32)
        }
    }
}

/// Removes emulation prevention bytes (00 00 03 -> 00 00)
pub fn remove_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;

    for &b in data {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }

        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }

        out.push(b);
    }

    out
}

// Tests
