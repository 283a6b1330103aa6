// NAL unit framing helpers (length prefixed and Annex-B)

use byteorder::{BigEndian, ByteOrder};

use crate::base::{StreamError, StreamResult};

pub const ANNEXB_START_CODE: &[u8] = &[0x00, 0x00, 0x00, 0x01];

/// Splits a length prefixed buffer into NAL units
///
/// # Arguments
///
/// * `data` - Buffer with NAL units prefixed by their length
/// * `length_size` - Size of the length prefix (1 to 4)
pub fn split_length_prefixed(data: &[u8], length_size: usize) -> StreamResult<Vec<&[u8]>> {
    let mut nalus = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        if pos + length_size > data.len() {
            return Err(StreamError::MalformedMedia(
                "truncated NAL unit length".to_string(),
            ));
        }

        let len = BigEndian::read_uint(&data[pos..pos + length_size], length_size) as usize;
        pos += length_size;

        if pos + len > data.len() {
            return Err(StreamError::MalformedMedia(format!(
                "NAL unit of {} bytes exceeds the buffer",
                len
            )));
        }

        if len > 0 {
            nalus.push(&data[pos..pos + len]);
        }

        pos += len;
    }

    Ok(nalus)
}

/// Appends a NAL unit with a 4 byte length prefix
pub fn write_length_prefixed(out: &mut Vec<u8>, nalu: &[u8]) {
    let mut b = [0u8; 4];
    BigEndian::write_u32(&mut b, nalu.len() as u32);
    out.extend_from_slice(&b);
    out.extend_from_slice(nalu);
}

/// Appends a NAL unit with an Annex-B start code
pub fn write_annexb(out: &mut Vec<u8>, nalu: &[u8]) {
    out.extend_from_slice(ANNEXB_START_CODE);
    out.extend_from_slice(nalu);
}

/// H.264 NAL unit type
pub fn avc_nalu_type(nalu: &[u8]) -> u8 {
    nalu.first().map(|b| b & 0x1f).unwrap_or(0)
}

/// H.265 NAL unit type
pub fn hevc_nalu_type(nalu: &[u8]) -> u8 {
    nalu.first().map(|b| (b >> 1) & 0x3f).unwrap_or(0)
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_prefixed_split() {
        let mut buf = Vec::new();
        write_length_prefixed(&mut buf, &[0x65, 1, 2]);
        write_length_prefixed(&mut buf, &[0x41]);

        let nalus = split_length_prefixed(&buf, 4).unwrap();
        assert_eq!(nalus, vec![&[0x65, 1, 2][..], &[0x41][..]]);
        assert_eq!(avc_nalu_type(nalus[0]), 5);

        assert!(split_length_prefixed(&buf[..buf.len() - 1], 4).is_err());
    }

    #[test]
    fn test_hevc_nalu_type() {
        assert_eq!(hevc_nalu_type(&[0x40, 0x01]), 32);
        assert_eq!(hevc_nalu_type(&[0x26, 0x01]), 19);
    }
}
