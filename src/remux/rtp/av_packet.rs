// Access units to messages

use crate::{
    base::{
        AvMsg, AvPacket, AvPacketPayloadType, StreamResult, VIDEO_CODEC_ID_AVC,
        VIDEO_CODEC_ID_HEVC,
    },
    codec::{
        avc_nalu_type, hevc_nalu_type, is_hevc_irap, split_length_prefixed,
        write_length_prefixed, AvcDecoderConfig, HevcDecoderConfig, AVC_NALU_TYPE_AUD,
        AVC_NALU_TYPE_IDR, AVC_NALU_TYPE_PPS, AVC_NALU_TYPE_SPS, HEVC_NALU_TYPE_AUD,
        HEVC_NALU_TYPE_PPS, HEVC_NALU_TYPE_SPS, HEVC_NALU_TYPE_VPS,
    },
    remux::{make_aac_payload, make_video_payload, SdpContext},
    rtmp::{RTMP_TYPE_AUDIO, RTMP_TYPE_VIDEO},
};

/// Rebuilds messages from depacketized access units.
///
/// Sequence headers come from the SDP parameter sets, then from
/// in-band parameter sets whenever they change. Video frames
/// before the first sequence header are dropped.
#[derive(Default)]
pub struct AvPacketRemuxer {
    vps: Option<Vec<u8>>,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    video_record: Option<Vec<u8>>,

    asc: Option<Vec<u8>>,
    audio_seq_header_sent: bool,
}

impl AvPacketRemuxer {
    pub fn new(sdp: &SdpContext) -> AvPacketRemuxer {
        let mut r = AvPacketRemuxer::default();

        if let Some(v) = &sdp.video {
            r.vps = v.vps.clone();
            r.sps = v.sps.clone();
            r.pps = v.pps.clone();
        }

        if let Some(a) = &sdp.audio {
            r.asc = a.asc.clone();
        }

        r
    }

    /// Converts an access unit into zero or more messages
    pub fn feed(&mut self, pkt: &AvPacket) -> StreamResult<Vec<AvMsg>> {
        let timestamp = pkt.timestamp.max(0) as u32;

        if pkt.is_audio() {
            let asc = match &self.asc {
                Some(a) => a,
                None => return Ok(Vec::new()),
            };

            let mut out = Vec::with_capacity(2);

            if !self.audio_seq_header_sent {
                out.push(AvMsg::new_media(RTMP_TYPE_AUDIO, timestamp, make_aac_payload(0, asc)));
                self.audio_seq_header_sent = true;
            }

            out.push(AvMsg::new_media(
                RTMP_TYPE_AUDIO,
                timestamp,
                make_aac_payload(1, &pkt.payload),
            ));

            return Ok(out);
        }

        let hevc = pkt.payload_type == AvPacketPayloadType::Hevc;

        let mut body = Vec::with_capacity(pkt.payload.len());
        let mut key = false;

        for nalu in split_length_prefixed(&pkt.payload, 4)? {
            if hevc {
                match hevc_nalu_type(nalu) {
                    HEVC_NALU_TYPE_VPS => self.vps = Some(nalu.to_vec()),
                    HEVC_NALU_TYPE_SPS => self.sps = Some(nalu.to_vec()),
                    HEVC_NALU_TYPE_PPS => self.pps = Some(nalu.to_vec()),
                    HEVC_NALU_TYPE_AUD => {}
                    t => {
                        key = key || is_hevc_irap(t);
                        write_length_prefixed(&mut body, nalu);
                    }
                }
            } else {
                match avc_nalu_type(nalu) {
                    AVC_NALU_TYPE_SPS => self.sps = Some(nalu.to_vec()),
                    AVC_NALU_TYPE_PPS => self.pps = Some(nalu.to_vec()),
                    AVC_NALU_TYPE_AUD => {}
                    t => {
                        key = key || t == AVC_NALU_TYPE_IDR;
                        write_length_prefixed(&mut body, nalu);
                    }
                }
            }
        }

        let codec_id = if hevc {
            VIDEO_CODEC_ID_HEVC
        } else {
            VIDEO_CODEC_ID_AVC
        };

        let mut out = Vec::with_capacity(2);

        if let Some(record) = self.build_record(hevc)? {
            if self.video_record.as_ref() != Some(&record) {
                out.push(AvMsg::new_media(
                    RTMP_TYPE_VIDEO,
                    timestamp,
                    make_video_payload(codec_id, true, 0, 0, &record),
                ));
                self.video_record = Some(record);
            }
        }

        if self.video_record.is_none() || body.is_empty() {
            return Ok(out);
        }

        let cts = (pkt.pts - pkt.timestamp) as i32;

        out.push(AvMsg::new_media(
            RTMP_TYPE_VIDEO,
            timestamp,
            make_video_payload(codec_id, key, 1, cts, &body),
        ));

        Ok(out)
    }

    fn build_record(&self, hevc: bool) -> StreamResult<Option<Vec<u8>>> {
        match (hevc, &self.vps, &self.sps, &self.pps) {
            (false, _, Some(sps), Some(pps)) => Ok(Some(AvcDecoderConfig::build(sps, pps))),
            (true, Some(vps), Some(sps), Some(pps)) => {
                Ok(Some(HevcDecoderConfig::build(vps, sps, pps)?))
            }
            _ => Ok(None),
        }
    }
}

// Tests
