// SDP parsing and building

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::{
    base::{AvMsg, StreamError, StreamResult},
    codec::{AudioSpecificConfig, AvcDecoderConfig, HevcDecoderConfig},
};

use super::rtp::{
    RtpUnpackerCodec, RTP_PAYLOAD_TYPE_AUDIO, RTP_PAYLOAD_TYPE_VIDEO, RTP_VIDEO_CLOCK_RATE,
};

pub const SDP_VIDEO_CONTROL: &str = "streamid=0";
pub const SDP_AUDIO_CONTROL: &str = "streamid=1";

/// Codec announced by a media section
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SdpCodec {
    H264,
    H265,
    Aac,
    Other(String),
}

/// One media section
#[derive(Clone, Debug)]
pub struct SdpMedia {
    pub payload_type: u8,
    pub codec: SdpCodec,
    pub clock_rate: u32,
    pub channels: u32,
    pub control: String,
    pub fmtp: HashMap<String, String>,

    pub vps: Option<Vec<u8>>,
    pub sps: Option<Vec<u8>>,
    pub pps: Option<Vec<u8>>,
    pub asc: Option<Vec<u8>>,
}

impl SdpMedia {
    fn new(payload_type: u8) -> SdpMedia {
        SdpMedia {
            payload_type,
            codec: SdpCodec::Other("".to_string()),
            clock_rate: 0,
            channels: 1,
            control: "".to_string(),
            fmtp: HashMap::new(),
            vps: None,
            sps: None,
            pps: None,
            asc: None,
        }
    }

    /// Depacketizer codec of the section, None for unsupported codecs
    pub fn unpacker_codec(&self) -> Option<RtpUnpackerCodec> {
        match self.codec {
            SdpCodec::H264 => Some(RtpUnpackerCodec::Avc),
            SdpCodec::H265 => Some(RtpUnpackerCodec::Hevc),
            SdpCodec::Aac => {
                let field = |name: &str, default: usize| {
                    self.fmtp
                        .get(name)
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(default)
                };

                Some(RtpUnpackerCodec::Aac {
                    size_length: field("sizelength", 13),
                    index_length: field("indexlength", 3),
                })
            }
            SdpCodec::Other(_) => None,
        }
    }

    /// True if the track URL of a SETUP request designates this section
    pub fn matches_control(&self, url: &str) -> bool {
        !self.control.is_empty()
            && (url == self.control || url.ends_with(&format!("/{}", self.control)))
    }

    fn apply_fmtp(&mut self) {
        let b64 = |v: Option<&String>| v.and_then(|s| BASE64.decode(s.trim()).ok());

        match self.codec {
            SdpCodec::H264 => {
                if let Some(sets) = self.fmtp.get("sprop-parameter-sets") {
                    let mut parts = sets.split(',');
                    self.sps = parts.next().and_then(|s| BASE64.decode(s.trim()).ok());
                    self.pps = parts.next().and_then(|s| BASE64.decode(s.trim()).ok());
                }
            }
            SdpCodec::H265 => {
                self.vps = b64(self.fmtp.get("sprop-vps"));
                self.sps = b64(self.fmtp.get("sprop-sps"));
                self.pps = b64(self.fmtp.get("sprop-pps"));
            }
            SdpCodec::Aac => {
                self.asc = self.fmtp.get("config").and_then(|c| hex::decode(c.trim()).ok());
            }
            SdpCodec::Other(_) => {}
        }
    }
}

/// Session description of a stream
#[derive(Clone, Debug)]
pub struct SdpContext {
    pub raw: String,
    pub video: Option<SdpMedia>,
    pub audio: Option<SdpMedia>,
}

impl SdpContext {
    /// Parses an SDP document (ANNOUNCE body)
    pub fn parse(text: &str) -> StreamResult<SdpContext> {
        let mut video: Option<SdpMedia> = None;
        let mut audio: Option<SdpMedia> = None;

        // Section being parsed: (is_video, media)
        let mut current: Option<(bool, SdpMedia)> = None;

        let mut finish = |section: Option<(bool, SdpMedia)>| {
            if let Some((is_video, mut media)) = section {
                media.apply_fmtp();

                if is_video && video.is_none() {
                    video = Some(media);
                } else if !is_video && audio.is_none() {
                    audio = Some(media);
                }
            }
        };

        for line in text.lines() {
            let line = line.trim();

            if let Some(m) = line.strip_prefix("m=") {
                finish(current.take());

                let fields: Vec<&str> = m.split_whitespace().collect();

                if fields.len() < 4 {
                    return Err(StreamError::ProtocolViolation(format!(
                        "invalid SDP media line: {}",
                        line
                    )));
                }

                let payload_type = fields[3].parse::<u8>().map_err(|_| {
                    StreamError::ProtocolViolation(format!("invalid SDP payload type: {}", line))
                })?;

                match fields[0] {
                    "video" => current = Some((true, SdpMedia::new(payload_type))),
                    "audio" => current = Some((false, SdpMedia::new(payload_type))),
                    _ => current = None,
                }

                continue;
            }

            let media = match current.as_mut() {
                Some((_, m)) => m,
                None => continue,
            };

            if let Some(rtpmap) = line.strip_prefix("a=rtpmap:") {
                // <pt> <encoding>/<clock>[/<channels>]
                let mut it = rtpmap.splitn(2, ' ');
                let _ = it.next();
                let encoding = it.next().unwrap_or("");
                let parts: Vec<&str> = encoding.split('/').collect();

                media.codec = match parts[0].to_ascii_uppercase().as_str() {
                    "H264" => SdpCodec::H264,
                    "H265" | "HEVC" => SdpCodec::H265,
                    "MPEG4-GENERIC" => SdpCodec::Aac,
                    other => SdpCodec::Other(other.to_string()),
                };

                media.clock_rate = parts.get(1).and_then(|c| c.parse().ok()).unwrap_or(0);
                media.channels = parts.get(2).and_then(|c| c.parse().ok()).unwrap_or(1);
            } else if let Some(fmtp) = line.strip_prefix("a=fmtp:") {
                let params = fmtp.split_once(' ').map(|(_, p)| p).unwrap_or("");

                for param in params.split(';') {
                    if let Some((k, v)) = param.trim().split_once('=') {
                        media
                            .fmtp
                            .insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
                    }
                }
            } else if let Some(control) = line.strip_prefix("a=control:") {
                media.control = control.trim().to_string();
            }
        }

        finish(current.take());

        if video.is_none() && audio.is_none() {
            return Err(StreamError::ProtocolViolation(
                "SDP has no audio or video section".to_string(),
            ));
        }

        Ok(SdpContext {
            raw: text.to_string(),
            video,
            audio,
        })
    }

    /// Builds the description served to RTSP subscribers from the
    /// sequence headers of the stream
    pub fn from_seq_headers(
        video_seq_header: Option<&AvMsg>,
        audio_seq_header: Option<&AvMsg>,
    ) -> StreamResult<SdpContext> {
        let mut raw = String::new();

        raw.push_str("v=0\r\n");
        raw.push_str("o=- 0 0 IN IP4 127.0.0.1\r\n");
        raw.push_str("s=No Name\r\n");
        raw.push_str("c=IN IP4 127.0.0.1\r\n");
        raw.push_str("t=0 0\r\n");
        raw.push_str(&format!("a=tool:{}\r\n", env!("CARGO_PKG_NAME")));

        if let Some(msg) = video_seq_header.filter(|m| m.payload.len() > 5) {
            let record = &msg.payload[5..];
            let pt = RTP_PAYLOAD_TYPE_VIDEO;

            raw.push_str(&format!("m=video 0 RTP/AVP {}\r\n", pt));

            if msg.is_avc_key_seq_header() {
                let config = AvcDecoderConfig::parse(record)?;
                let sps = &config.sps[0];
                let pps = &config.pps[0];

                raw.push_str(&format!("a=rtpmap:{} H264/{}\r\n", pt, RTP_VIDEO_CLOCK_RATE));
                raw.push_str(&format!(
                    "a=fmtp:{} packetization-mode=1; \
                     sprop-parameter-sets={},{}; profile-level-id={}\r\n",
                    pt,
                    BASE64.encode(sps),
                    BASE64.encode(pps),
                    hex::encode(&sps[1..sps.len().min(4)]),
                ));
            } else if msg.is_hevc_key_seq_header() {
                let config = HevcDecoderConfig::parse(record)?;

                raw.push_str(&format!("a=rtpmap:{} H265/{}\r\n", pt, RTP_VIDEO_CLOCK_RATE));
                raw.push_str(&format!(
                    "a=fmtp:{} sprop-vps={}; sprop-sps={}; sprop-pps={}\r\n",
                    pt,
                    BASE64.encode(&config.vps[0]),
                    BASE64.encode(&config.sps[0]),
                    BASE64.encode(&config.pps[0]),
                ));
            }

            raw.push_str(&format!("a=control:{}\r\n", SDP_VIDEO_CONTROL));
        }

        if let Some(msg) = audio_seq_header.filter(|m| m.is_aac_seq_header()) {
            let asc = AudioSpecificConfig::parse(&msg.payload[2..])?;
            let pt = RTP_PAYLOAD_TYPE_AUDIO;

            raw.push_str(&format!("m=audio 0 RTP/AVP {}\r\n", pt));
            raw.push_str(&format!(
                "a=rtpmap:{} MPEG4-GENERIC/{}/{}\r\n",
                pt,
                asc.sample_rate(),
                asc.channel_configuration
            ));
            raw.push_str(&format!(
                "a=fmtp:{} profile-level-id=1;mode=AAC-hbr;\
                 sizelength=13;indexlength=3;indexdeltalength=3; config={}\r\n",
                pt,
                hex::encode(&msg.payload[2..])
            ));
            raw.push_str(&format!("a=control:{}\r\n", SDP_AUDIO_CONTROL));
        }

        SdpContext::parse(&raw)
    }
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        base::VIDEO_CODEC_ID_AVC,
        codec::avc_test_util::make_avc_sps,
        remux::{make_aac_payload, make_video_payload},
        rtmp::{RTMP_TYPE_AUDIO, RTMP_TYPE_VIDEO},
    };

    const ANNOUNCE: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=Stream\r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1; \
sprop-parameter-sets=Z0IAHpWoKA9puAgICBA=,aM48gA==; profile-level-id=42001E\r\n\
a=control:streamid=0\r\n\
m=audio 0 RTP/AVP 97\r\n\
a=rtpmap:97 MPEG4-GENERIC/44100/2\r\n\
a=fmtp:97 profile-level-id=1;mode=AAC-hbr;\
sizelength=13;indexlength=3;indexdeltalength=3; config=1210\r\n\
a=control:streamid=1\r\n";

    #[test]
    fn test_sdp_parse_announce() {
        let sdp = SdpContext::parse(ANNOUNCE).unwrap();

        let video = sdp.video.as_ref().unwrap();
        assert_eq!(video.codec, SdpCodec::H264);
        assert_eq!(video.payload_type, 96);
        assert_eq!(video.clock_rate, 90000);
        assert_eq!(video.sps.as_ref().unwrap()[0], 0x67);
        assert_eq!(video.pps.as_ref().unwrap(), &vec![0x68, 0xce, 0x3c, 0x80]);
        assert!(video.matches_control("rtsp://host/live/test/streamid=0"));
        assert!(!video.matches_control("rtsp://host/live/test/streamid=1"));

        let audio = sdp.audio.as_ref().unwrap();
        assert_eq!(audio.codec, SdpCodec::Aac);
        assert_eq!(audio.clock_rate, 44100);
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.asc.as_ref().unwrap(), &vec![0x12, 0x10]);
        assert_eq!(
            audio.unpacker_codec(),
            Some(RtpUnpackerCodec::Aac {
                size_length: 13,
                index_length: 3
            })
        );
    }

    #[test]
    fn test_sdp_from_seq_headers() {
        let sps = make_avc_sps(80, 45, 0);
        let record = AvcDecoderConfig::build(&sps, &[0x68, 0xce, 0x3c, 0x80]);
        let video = AvMsg::new_media(
            RTMP_TYPE_VIDEO,
            0,
            make_video_payload(VIDEO_CODEC_ID_AVC, true, 0, 0, &record),
        );
        let audio = AvMsg::new_media(RTMP_TYPE_AUDIO, 0, make_aac_payload(0, &[0x12, 0x10]));

        let sdp = SdpContext::from_seq_headers(Some(&video), Some(&audio)).unwrap();

        assert!(sdp.raw.contains("a=rtpmap:96 H264/90000"));
        assert!(sdp.raw.contains("MPEG4-GENERIC/44100/2"));
        assert_eq!(sdp.video.unwrap().sps.unwrap(), sps);
        assert_eq!(sdp.audio.unwrap().asc.unwrap(), vec![0x12, 0x10]);
    }

    #[test]
    fn test_sdp_without_media_is_rejected() {
        assert!(SdpContext::parse("v=0\r\ns=x\r\n").is_err());
    }
}
