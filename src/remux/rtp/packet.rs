// RTP packet

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

use crate::base::{StreamError, StreamResult};

pub const RTP_VERSION: u8 = 2;

/// Size of the fixed header (no CSRC, no extension)
pub const RTP_FIXED_HEADER_SIZE: usize = 12;

/// Dynamic payload type used for video
pub const RTP_PAYLOAD_TYPE_VIDEO: u8 = 96;

/// Dynamic payload type used for audio
pub const RTP_PAYLOAD_TYPE_AUDIO: u8 = 97;

/// Max payload size of a packet, keeps packets under a typical MTU
pub const RTP_MAX_PAYLOAD_SIZE: usize = 1400;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub seq: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

#[derive(Clone, Debug)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Parses a packet, skipping CSRCs, header extension and padding
    pub fn parse(data: &Bytes) -> StreamResult<RtpPacket> {
        if data.len() < RTP_FIXED_HEADER_SIZE {
            return Err(StreamError::MalformedMedia("RTP packet too short".to_string()));
        }

        let version = data[0] >> 6;

        if version != RTP_VERSION {
            return Err(StreamError::MalformedMedia(format!(
                "unsupported RTP version {}",
                version
            )));
        }

        let has_padding = data[0] & 0x20 != 0;
        let has_extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0f) as usize;

        let header = RtpHeader {
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7f,
            seq: BigEndian::read_u16(&data[2..4]),
            timestamp: BigEndian::read_u32(&data[4..8]),
            ssrc: BigEndian::read_u32(&data[8..12]),
        };

        let mut start = RTP_FIXED_HEADER_SIZE + 4 * csrc_count;

        if has_extension {
            if data.len() < start + 4 {
                return Err(StreamError::MalformedMedia(
                    "truncated RTP header extension".to_string(),
                ));
            }

            let ext_words = BigEndian::read_u16(&data[start + 2..start + 4]) as usize;
            start += 4 + 4 * ext_words;
        }

        let mut end = data.len();

        if has_padding && end > start {
            end = end.saturating_sub(data[end - 1] as usize);
        }

        if start > end {
            return Err(StreamError::MalformedMedia("truncated RTP packet".to_string()));
        }

        Ok(RtpPacket {
            header,
            payload: data.slice(start..end),
        })
    }

    /// Serializes the packet
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(RTP_FIXED_HEADER_SIZE + self.payload.len());

        out.push(RTP_VERSION << 6);
        let marker = if self.header.marker { 0x80 } else { 0x00 };
        out.push(marker | (self.header.payload_type & 0x7f));

        let mut b = [0u8; 10];
        BigEndian::write_u16(&mut b[0..2], self.header.seq);
        BigEndian::write_u32(&mut b[2..6], self.header.timestamp);
        BigEndian::write_u32(&mut b[6..10], self.header.ssrc);
        out.extend_from_slice(&b);

        out.extend_from_slice(&self.payload);

        Bytes::from(out)
    }
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtp_packet_encode_parse() {
        let pkt = RtpPacket {
            header: RtpHeader {
                marker: true,
                payload_type: RTP_PAYLOAD_TYPE_VIDEO,
                seq: 65535,
                timestamp: 0xdeadbeef,
                ssrc: 0x01020304,
            },
            payload: Bytes::from_static(&[1, 2, 3]),
        };

        let encoded = pkt.encode();
        assert_eq!(encoded.len(), 15);
        assert_eq!(encoded[0], 0x80);
        assert_eq!(encoded[1], 0x80 | 96);

        let parsed = RtpPacket::parse(&encoded).unwrap();
        assert_eq!(parsed.header, pkt.header);
        assert_eq!(parsed.payload, pkt.payload);
    }

    #[test]
    fn test_rtp_packet_padding_and_extension() {
        let mut raw = vec![0xb1, 97, 0, 1, 0, 0, 0, 10, 0, 0, 0, 5];
        raw.extend_from_slice(&[0, 0, 0, 0]); // CSRC
        raw.extend_from_slice(&[0xbe, 0xde, 0, 1, 9, 9, 9, 9]); // extension, one word
        raw.extend_from_slice(&[7, 8]);
        raw.extend_from_slice(&[0, 2]); // padding

        let parsed = RtpPacket::parse(&Bytes::from(raw)).unwrap();
        assert_eq!(parsed.header.payload_type, 97);
        assert_eq!(parsed.payload.as_ref(), &[7, 8]);

        assert!(RtpPacket::parse(&Bytes::from_static(&[0x40; 12])).is_err());
    }
}
