// RTP packets to access units

use bytes::Bytes;

use crate::{
    base::{AvPacket, AvPacketPayloadType, StreamError, StreamResult},
    codec::{write_length_prefixed, BitReader, AAC_SAMPLES_PER_FRAME},
};

use super::RtpPacket;

const AVC_STAP_A: u8 = 24;
const AVC_FU_A: u8 = 28;
const HEVC_AP: u8 = 48;
const HEVC_FU: u8 = 49;

/// Codec of a depacketized track
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RtpUnpackerCodec {
    Avc,
    Hevc,
    /// mpeg4-generic with the AU header field sizes (in bits)
    Aac {
        size_length: usize,
        index_length: usize,
    },
}

/// Depacketizer of one track.
///
/// Packets are expected in order; a sequence gap drops the
/// fragmented NAL unit in progress.
pub struct RtpUnpacker {
    codec: RtpUnpackerCodec,
    clock_rate: u32,

    base_timestamp: Option<u32>,
    last_seq: Option<u16>,

    current_timestamp: Option<u32>,
    nalus: Vec<Vec<u8>>,
    fragment: Option<Vec<u8>>,
}

impl RtpUnpacker {
    /// Creates a depacketizer
    ///
    /// # Arguments
    ///
    /// * `codec` - Payload format of the track
    /// * `clock_rate` - RTP clock rate (90000 for video, the sample rate for audio)
    pub fn new(codec: RtpUnpackerCodec, clock_rate: u32) -> RtpUnpacker {
        RtpUnpacker {
            codec,
            clock_rate: clock_rate.max(1),
            base_timestamp: None,
            last_seq: None,
            current_timestamp: None,
            nalus: Vec::new(),
            fragment: None,
        }
    }

    fn to_ms(&mut self, timestamp: u32) -> i64 {
        let base = *self.base_timestamp.get_or_insert(timestamp);
        (timestamp.wrapping_sub(base) as i64) * 1000 / self.clock_rate as i64
    }

    /// Feeds a packet, returning the completed access units
    pub fn feed(&mut self, pkt: &RtpPacket) -> StreamResult<Vec<AvPacket>> {
        if let Some(last) = self.last_seq {
            if pkt.header.seq != last.wrapping_add(1) {
                self.fragment = None;
            }
        }

        self.last_seq = Some(pkt.header.seq);

        match self.codec {
            RtpUnpackerCodec::Aac {
                size_length,
                index_length,
            } => self.feed_aac(pkt, size_length, index_length),
            _ => self.feed_video(pkt),
        }
    }

    fn flush_access_unit(&mut self, out: &mut Vec<AvPacket>) {
        let timestamp = match self.current_timestamp.take() {
            Some(t) => t,
            None => return,
        };

        if self.nalus.is_empty() {
            return;
        }

        let mut payload = Vec::with_capacity(self.nalus.iter().map(|n| n.len() + 4).sum());

        for nalu in self.nalus.drain(..) {
            write_length_prefixed(&mut payload, &nalu);
        }

        let ms = self.to_ms(timestamp);

        out.push(AvPacket {
            payload_type: if self.codec == RtpUnpackerCodec::Hevc {
                AvPacketPayloadType::Hevc
            } else {
                AvPacketPayloadType::Avc
            },
            timestamp: ms,
            pts: ms,
            payload: Bytes::from(payload),
        });
    }

    fn feed_video(&mut self, pkt: &RtpPacket) -> StreamResult<Vec<AvPacket>> {
        let mut out = Vec::new();

        if self.current_timestamp.is_some() && self.current_timestamp != Some(pkt.header.timestamp)
        {
            self.flush_access_unit(&mut out);
        }

        self.current_timestamp = Some(pkt.header.timestamp);

        let p = &pkt.payload;

        if self.codec == RtpUnpackerCodec::Hevc {
            self.unpack_hevc(p)?;
        } else {
            self.unpack_avc(p)?;
        }

        if pkt.header.marker {
            self.flush_access_unit(&mut out);
        }

        Ok(out)
    }

    fn unpack_aggregated(&mut self, p: &[u8], mut pos: usize) -> StreamResult<()> {
        while pos + 2 <= p.len() {
            let size = ((p[pos] as usize) << 8) | p[pos + 1] as usize;
            pos += 2;

            if pos + size > p.len() {
                return Err(StreamError::MalformedMedia(
                    "truncated RTP aggregation packet".to_string(),
                ));
            }

            if size > 0 {
                self.nalus.push(p[pos..pos + size].to_vec());
            }

            pos += size;
        }

        Ok(())
    }

    fn unpack_avc(&mut self, p: &[u8]) -> StreamResult<()> {
        if p.is_empty() {
            return Ok(());
        }

        match p[0] & 0x1f {
            AVC_STAP_A => self.unpack_aggregated(p, 1),
            AVC_FU_A => {
                if p.len() < 2 {
                    return Err(StreamError::MalformedMedia("truncated FU-A".to_string()));
                }

                let start = p[1] & 0x80 != 0;
                let end = p[1] & 0x40 != 0;

                if start {
                    let mut nalu = Vec::with_capacity(p.len() * 4);
                    nalu.push((p[0] & 0xe0) | (p[1] & 0x1f));
                    self.fragment = Some(nalu);
                }

                if let Some(nalu) = self.fragment.as_mut() {
                    nalu.extend_from_slice(&p[2..]);
                }

                if end {
                    if let Some(nalu) = self.fragment.take() {
                        self.nalus.push(nalu);
                    }
                }

                Ok(())
            }
            1..=23 => {
                self.nalus.push(p.to_vec());
                Ok(())
            }
            t => Err(StreamError::MalformedMedia(format!(
                "unsupported H.264 RTP packet type {}",
                t
            ))),
        }
    }

    fn unpack_hevc(&mut self, p: &[u8]) -> StreamResult<()> {
        if p.len() < 2 {
            return Ok(());
        }

        match (p[0] >> 1) & 0x3f {
            HEVC_AP => self.unpack_aggregated(p, 2),
            HEVC_FU => {
                if p.len() < 3 {
                    return Err(StreamError::MalformedMedia("truncated HEVC FU".to_string()));
                }

                let start = p[2] & 0x80 != 0;
                let end = p[2] & 0x40 != 0;
                let nalu_type = p[2] & 0x3f;

                if start {
                    let mut nalu = Vec::with_capacity(p.len() * 4);
                    nalu.push((p[0] & 0x81) | (nalu_type << 1));
                    nalu.push(p[1]);
                    self.fragment = Some(nalu);
                }

                if let Some(nalu) = self.fragment.as_mut() {
                    nalu.extend_from_slice(&p[3..]);
                }

                if end {
                    if let Some(nalu) = self.fragment.take() {
                        self.nalus.push(nalu);
                    }
                }

                Ok(())
            }
            0..=47 => {
                self.nalus.push(p.to_vec());
                Ok(())
            }
            t => Err(StreamError::MalformedMedia(format!(
                "unsupported H.265 RTP packet type {}",
                t
            ))),
        }
    }

    fn feed_aac(
        &mut self,
        pkt: &RtpPacket,
        size_length: usize,
        index_length: usize,
    ) -> StreamResult<Vec<AvPacket>> {
        let p = &pkt.payload;

        if p.len() < 2 {
            return Err(StreamError::MalformedMedia("truncated AAC RTP payload".to_string()));
        }

        let headers_bits = ((p[0] as usize) << 8) | p[1] as usize;
        let headers_bytes = headers_bits.div_ceil(8);

        if 2 + headers_bytes > p.len() || size_length + index_length == 0 {
            return Err(StreamError::MalformedMedia("truncated AU headers".to_string()));
        }

        let count = headers_bits / (size_length + index_length);
        let mut reader = BitReader::new(&p[2..2 + headers_bytes]);
        let mut sizes = Vec::with_capacity(count);

        for _ in 0..count {
            sizes.push(reader.read_bits(size_length as u8)? as usize);
            reader.skip_bits(index_length)?;
        }

        let base_ms = self.to_ms(pkt.header.timestamp);
        let frame_ms = AAC_SAMPLES_PER_FRAME as i64 * 1000 / self.clock_rate as i64;

        let mut pos = 2 + headers_bytes;
        let mut out = Vec::with_capacity(count);

        for (i, size) in sizes.into_iter().enumerate() {
            if pos + size > p.len() {
                return Err(StreamError::MalformedMedia("truncated AAC access unit".to_string()));
            }

            let ts = base_ms + i as i64 * frame_ms;

            out.push(AvPacket {
                payload_type: AvPacketPayloadType::Aac,
                timestamp: ts,
                pts: ts,
                payload: pkt.payload.slice(pos..pos + size),
            });

            pos += size;
        }

        Ok(out)
    }
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::split_length_prefixed,
        remux::rtp::{RtpHeader, RtpPacker},
    };

    fn packet(seq: u16, ts: u32, marker: bool, payload: Vec<u8>) -> RtpPacket {
        RtpPacket {
            header: RtpHeader {
                marker,
                payload_type: 96,
                seq,
                timestamp: ts,
                ssrc: 1,
            },
            payload: Bytes::from(payload),
        }
    }

    #[test]
    fn test_unpack_avc_fu_a_roundtrip() {
        let mut packer = RtpPacker::new(96, 1).with_max_payload(64);
        let mut idr = vec![0x65u8];
        idr.extend((0..300).map(|i| i as u8));
        let sps = vec![0x67u8, 1, 2, 3];

        let packets = packer.pack_avc(&[&sps, &idr], 90000);

        let mut unpacker = RtpUnpacker::new(RtpUnpackerCodec::Avc, 90000);
        let mut units = Vec::new();

        for p in &packets {
            units.extend(unpacker.feed(p).unwrap());
        }

        assert_eq!(units.len(), 1);
        assert_eq!(units[0].timestamp, 0);

        let nalus = split_length_prefixed(&units[0].payload, 4).unwrap();
        assert_eq!(nalus, vec![sps.as_slice(), idr.as_slice()]);
    }

    #[test]
    fn test_unpack_avc_stap_a_and_timestamp_change() {
        let mut unpacker = RtpUnpacker::new(RtpUnpackerCodec::Avc, 90000);

        let stap = vec![24, 0, 2, 0x67, 0xaa, 0, 2, 0x68, 0xbb];
        assert!(unpacker.feed(&packet(1, 0, false, stap)).unwrap().is_empty());
        assert!(unpacker.feed(&packet(2, 0, false, vec![0x65, 1])).unwrap().is_empty());

        // No marker, the next timestamp closes the unit
        let units = unpacker.feed(&packet(3, 3600, true, vec![0x41, 2])).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(split_length_prefixed(&units[0].payload, 4).unwrap().len(), 3);
        assert_eq!(units[1].timestamp, 40);
    }

    #[test]
    fn test_unpack_fu_gap_drops_fragment() {
        let mut unpacker = RtpUnpacker::new(RtpUnpackerCodec::Avc, 90000);

        unpacker.feed(&packet(1, 0, false, vec![28, 0x85, 1, 2])).unwrap();
        // seq 2 lost
        let units = unpacker.feed(&packet(3, 0, true, vec![28, 0x45, 5, 6])).unwrap();
        assert!(units.is_empty());
    }

    #[test]
    fn test_unpack_hevc_fu() {
        let mut packer = RtpPacker::new(96, 1).with_max_payload(40);
        let mut idr = vec![0x26u8, 0x01];
        idr.extend(std::iter::repeat(7).take(100));

        let mut unpacker = RtpUnpacker::new(RtpUnpackerCodec::Hevc, 90000);
        let mut units = Vec::new();

        for p in packer.pack_hevc(&[&idr], 0) {
            units.extend(unpacker.feed(&p).unwrap());
        }

        assert_eq!(units.len(), 1);
        assert_eq!(units[0].payload_type, AvPacketPayloadType::Hevc);
        assert_eq!(split_length_prefixed(&units[0].payload, 4).unwrap(), vec![idr.as_slice()]);
    }

    #[test]
    fn test_unpack_aac_multiple_au() {
        let mut unpacker = RtpUnpacker::new(
            RtpUnpackerCodec::Aac {
                size_length: 13,
                index_length: 3,
            },
            44100,
        );

        // Two AU headers (32 bits): sizes 3 and 2
        let payload = vec![0x00, 0x20, 0x00, 0x18, 0x00, 0x10, 1, 2, 3, 4, 5];
        let units = unpacker.feed(&packet(1, 44100, true, payload)).unwrap();

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].payload.as_ref(), &[1, 2, 3]);
        assert_eq!(units[1].payload.as_ref(), &[4, 5]);
        assert_eq!(units[0].timestamp, 0);
        assert_eq!(units[1].timestamp, 23);
    }
}
