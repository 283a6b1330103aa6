// Messages to RTP packets

use bytes::Bytes;

use crate::{
    base::{AvMsg, StreamResult, AUDIO_CODEC_ID_AAC, VIDEO_CODEC_ID_AVC, VIDEO_CODEC_ID_HEVC},
    codec::{
        avc_nalu_type, hevc_nalu_type, split_length_prefixed, AudioSpecificConfig,
        AvcDecoderConfig, HevcDecoderConfig, AVC_NALU_TYPE_AUD, HEVC_NALU_TYPE_AUD,
    },
};

use super::{
    RtpHeader, RtpPacket, RTP_MAX_PAYLOAD_SIZE, RTP_PAYLOAD_TYPE_AUDIO, RTP_PAYLOAD_TYPE_VIDEO,
};

/// Video clock rate
pub const RTP_VIDEO_CLOCK_RATE: u32 = 90000;

const AVC_NALU_TYPE_FU_A: u8 = 28;
const HEVC_NALU_TYPE_FU: u8 = 49;

/// Packetizer of one track
pub struct RtpPacker {
    payload_type: u8,
    ssrc: u32,
    seq: u16,
    max_payload: usize,
}

impl RtpPacker {
    pub fn new(payload_type: u8, ssrc: u32) -> RtpPacker {
        RtpPacker {
            payload_type,
            ssrc,
            seq: rand::random::<u16>(),
            max_payload: RTP_MAX_PAYLOAD_SIZE,
        }
    }

    #[cfg(test)]
    pub fn with_max_payload(mut self, max_payload: usize) -> RtpPacker {
        self.max_payload = max_payload;
        self
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn make_packet(&mut self, marker: bool, timestamp: u32, payload: Bytes) -> RtpPacket {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);

        RtpPacket {
            header: RtpHeader {
                marker,
                payload_type: self.payload_type,
                seq,
                timestamp,
                ssrc: self.ssrc,
            },
            payload,
        }
    }

    /// Packs the NAL units of one H.264 access unit
    /// (single NAL unit mode or FU-A). The marker is set on the last packet.
    pub fn pack_avc(&mut self, nalus: &[&[u8]], timestamp: u32) -> Vec<RtpPacket> {
        let mut out = Vec::new();

        for (i, nalu) in nalus.iter().enumerate() {
            if nalu.is_empty() {
                continue;
            }

            let last_nalu = i == nalus.len() - 1;

            if nalu.len() <= self.max_payload {
                out.push(self.make_packet(last_nalu, timestamp, Bytes::copy_from_slice(nalu)));
                continue;
            }

            let indicator = (nalu[0] & 0xe0) | AVC_NALU_TYPE_FU_A;
            let nalu_type = nalu[0] & 0x1f;

            let body = &nalu[1..];
            let fragment_size = self.max_payload - 2;
            let count = body.len().div_ceil(fragment_size);

            for (j, fragment) in body.chunks(fragment_size).enumerate() {
                let mut fu_header = nalu_type;

                if j == 0 {
                    fu_header |= 0x80;
                }

                if j == count - 1 {
                    fu_header |= 0x40;
                }

                let mut payload = Vec::with_capacity(2 + fragment.len());
                payload.push(indicator);
                payload.push(fu_header);
                payload.extend_from_slice(fragment);

                out.push(self.make_packet(
                    last_nalu && j == count - 1,
                    timestamp,
                    Bytes::from(payload),
                ));
            }
        }

        out
    }

    /// Packs the NAL units of one H.265 access unit
    /// (single NAL unit packets or fragmentation units)
    pub fn pack_hevc(&mut self, nalus: &[&[u8]], timestamp: u32) -> Vec<RtpPacket> {
        let mut out = Vec::new();

        for (i, nalu) in nalus.iter().enumerate() {
            if nalu.len() < 3 {
                continue;
            }

            let last_nalu = i == nalus.len() - 1;

            if nalu.len() <= self.max_payload {
                out.push(self.make_packet(last_nalu, timestamp, Bytes::copy_from_slice(nalu)));
                continue;
            }

            let nalu_type = hevc_nalu_type(nalu);
            let payload_header = [(nalu[0] & 0x81) | (HEVC_NALU_TYPE_FU << 1), nalu[1]];

            let body = &nalu[2..];
            let fragment_size = self.max_payload - 3;
            let count = body.len().div_ceil(fragment_size);

            for (j, fragment) in body.chunks(fragment_size).enumerate() {
                let mut fu_header = nalu_type;

                if j == 0 {
                    fu_header |= 0x80;
                }

                if j == count - 1 {
                    fu_header |= 0x40;
                }

                let mut payload = Vec::with_capacity(3 + fragment.len());
                payload.extend_from_slice(&payload_header);
                payload.push(fu_header);
                payload.extend_from_slice(fragment);

                out.push(self.make_packet(
                    last_nalu && j == count - 1,
                    timestamp,
                    Bytes::from(payload),
                ));
            }
        }

        out
    }

    /// Packs one raw AAC frame (mpeg4-generic, AAC-hbr, one AU per packet)
    pub fn pack_aac(&mut self, frame: &[u8], timestamp: u32) -> RtpPacket {
        let mut payload = Vec::with_capacity(4 + frame.len());

        // AU-headers-length in bits, then sizelength 13 + indexlength 3
        payload.extend_from_slice(&[0x00, 0x10]);
        payload.push((frame.len() >> 5) as u8);
        payload.push(((frame.len() & 0x1f) << 3) as u8);
        payload.extend_from_slice(frame);

        self.make_packet(true, timestamp, Bytes::from(payload))
    }
}

/// Video state of the remuxer
enum RtpVideoState {
    Avc(AvcDecoderConfig),
    Hevc(HevcDecoderConfig),
}

/// Converts messages into RTP packets, one batch per message.
///
/// Parameter sets are repeated in-band before every keyframe.
pub struct RtpRemuxer {
    video: Option<RtpVideoState>,
    audio: Option<AudioSpecificConfig>,
    video_packer: RtpPacker,
    audio_packer: RtpPacker,
}

impl Default for RtpRemuxer {
    fn default() -> Self {
        RtpRemuxer::new()
    }
}

impl RtpRemuxer {
    pub fn new() -> RtpRemuxer {
        RtpRemuxer {
            video: None,
            audio: None,
            video_packer: RtpPacker::new(RTP_PAYLOAD_TYPE_VIDEO, rand::random::<u32>()),
            audio_packer: RtpPacker::new(RTP_PAYLOAD_TYPE_AUDIO, rand::random::<u32>()),
        }
    }

    pub fn video_ssrc(&self) -> u32 {
        self.video_packer.ssrc()
    }

    pub fn audio_ssrc(&self) -> u32 {
        self.audio_packer.ssrc()
    }

    /// Forgets the codec state
    pub fn flush(&mut self) {
        self.video = None;
        self.audio = None;
    }

    /// Converts a message. Sequence headers update the state and produce nothing.
    pub fn feed(&mut self, msg: &AvMsg) -> StreamResult<Vec<RtpPacket>> {
        if msg.is_video() {
            return self.feed_video(msg);
        }

        if msg.is_audio() {
            return self.feed_audio(msg);
        }

        Ok(Vec::new())
    }

    fn feed_video(&mut self, msg: &AvMsg) -> StreamResult<Vec<RtpPacket>> {
        let codec_id = msg.video_codec_id();

        if (codec_id != Some(VIDEO_CODEC_ID_AVC) && codec_id != Some(VIDEO_CODEC_ID_HEVC))
            || msg.payload.len() < 5
        {
            return Ok(Vec::new());
        }

        if msg.is_video_key_seq_header() {
            let record = &msg.payload[5..];

            self.video = Some(if codec_id == Some(VIDEO_CODEC_ID_AVC) {
                RtpVideoState::Avc(AvcDecoderConfig::parse(record)?)
            } else {
                RtpVideoState::Hevc(HevcDecoderConfig::parse(record)?)
            });

            return Ok(Vec::new());
        }

        if msg.payload[1] != 1 {
            return Ok(Vec::new());
        }

        let pts = (msg.header.timestamp_abs as i64 + msg.composition_time() as i64).max(0) as u64;
        let timestamp = (pts * (RTP_VIDEO_CLOCK_RATE as u64 / 1000)) as u32;
        let key = msg.is_video_key_frame();

        match &self.video {
            Some(RtpVideoState::Avc(config)) => {
                let mut nalus: Vec<&[u8]> = Vec::new();

                if key {
                    nalus.extend(config.sps.iter().map(|n| n.as_slice()));
                    nalus.extend(config.pps.iter().map(|n| n.as_slice()));
                }

                for nalu in split_length_prefixed(&msg.payload[5..], config.nalu_length_size)? {
                    if avc_nalu_type(nalu) != AVC_NALU_TYPE_AUD {
                        nalus.push(nalu);
                    }
                }

                Ok(self.video_packer.pack_avc(&nalus, timestamp))
            }
            Some(RtpVideoState::Hevc(config)) => {
                let mut nalus: Vec<&[u8]> = Vec::new();

                if key {
                    nalus.extend(config.vps.iter().map(|n| n.as_slice()));
                    nalus.extend(config.sps.iter().map(|n| n.as_slice()));
                    nalus.extend(config.pps.iter().map(|n| n.as_slice()));
                }

                for nalu in split_length_prefixed(&msg.payload[5..], config.nalu_length_size)? {
                    if hevc_nalu_type(nalu) != HEVC_NALU_TYPE_AUD {
                        nalus.push(nalu);
                    }
                }

                Ok(self.video_packer.pack_hevc(&nalus, timestamp))
            }
            None => Ok(Vec::new()),
        }
    }

    fn feed_audio(&mut self, msg: &AvMsg) -> StreamResult<Vec<RtpPacket>> {
        if msg.audio_codec_id() != Some(AUDIO_CODEC_ID_AAC) || msg.payload.len() < 2 {
            return Ok(Vec::new());
        }

        if msg.is_aac_seq_header() {
            self.audio = Some(AudioSpecificConfig::parse(&msg.payload[2..])?);
            return Ok(Vec::new());
        }

        let asc = match self.audio {
            Some(a) => a,
            None => return Ok(Vec::new()),
        };

        let timestamp =
            (msg.header.timestamp_abs as u64 * asc.sample_rate() as u64 / 1000) as u32;

        Ok(vec![self.audio_packer.pack_aac(&msg.payload[2..], timestamp)])
    }
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_avc_single_and_fu_a() {
        let mut packer = RtpPacker::new(96, 1).with_max_payload(100);

        let small = vec![0x67u8; 20];
        let mut big = vec![0x65u8];
        big.extend(std::iter::repeat(0xaa).take(250));

        let packets = packer.pack_avc(&[&small, &big], 9000);

        // 1 single + ceil(250 / 98) = 3 fragments
        assert_eq!(packets.len(), 4);
        assert_eq!(packets[0].payload.as_ref(), small.as_slice());
        assert!(!packets[0].header.marker);

        assert_eq!(packets[1].payload[0], 0x60 | 28);
        assert_eq!(packets[1].payload[1], 0x80 | 5);
        assert_eq!(packets[2].payload[1], 5);
        assert_eq!(packets[3].payload[1], 0x40 | 5);
        assert!(packets[3].header.marker);

        let seq0 = packets[0].header.seq;
        for (i, p) in packets.iter().enumerate() {
            assert_eq!(p.header.seq, seq0.wrapping_add(i as u16));
            assert_eq!(p.header.timestamp, 9000);
        }
    }

    #[test]
    fn test_pack_hevc_fu() {
        let mut packer = RtpPacker::new(96, 1).with_max_payload(50);

        let mut idr = vec![0x26, 0x01];
        idr.extend(std::iter::repeat(0x11).take(100));

        let packets = packer.pack_hevc(&[&idr], 0);

        assert_eq!(packets.len(), 3);
        assert_eq!((packets[0].payload[0] >> 1) & 0x3f, 49);
        assert_eq!(packets[0].payload[2], 0x80 | 19);
        assert_eq!(packets[2].payload[2], 0x40 | 19);
    }

    #[test]
    fn test_pack_aac_au_header() {
        let mut packer = RtpPacker::new(97, 1);
        let frame = vec![0x21u8; 300];

        let packet = packer.pack_aac(&frame, 1024);

        assert_eq!(&packet.payload[0..2], &[0x00, 0x10]);
        let size = ((packet.payload[2] as usize) << 5) | (packet.payload[3] as usize >> 3);
        assert_eq!(size, 300);
        assert!(packet.header.marker);
    }
}
