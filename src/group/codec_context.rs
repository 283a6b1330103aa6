// Codec information of a stream

use crate::{
    base::{AvMsg, StreamResult, AUDIO_CODEC_ID_AAC, VIDEO_CODEC_ID_AVC, VIDEO_CODEC_ID_HEVC},
    codec::{AvcDecoderConfig, HevcDecoderConfig},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoCodec {
    Avc,
    Hevc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AudioCodec {
    Aac,
    /// Any other FLV sound format
    Other(u8),
}

/// Codecs and resolution, taken from the sequence headers
#[derive(Clone, Debug, Default)]
pub struct CodecContext {
    pub video_codec: Option<VideoCodec>,
    pub audio_codec: Option<AudioCodec>,
    pub width: u32,
    pub height: u32,

    /// Last video sequence header
    pub video_seq_header: Option<AvMsg>,

    /// Last audio sequence header
    pub audio_seq_header: Option<AvMsg>,
}

impl CodecContext {
    /// Updates the context from a message
    ///
    /// Only sequence headers (and the first audio message, for
    /// formats without one) change anything.
    pub fn update(&mut self, msg: &AvMsg) -> StreamResult<()> {
        if msg.is_video_key_seq_header() {
            if self
                .video_seq_header
                .as_ref()
                .is_some_and(|h| h.payload == msg.payload)
            {
                return Ok(());
            }

            self.video_seq_header = Some(msg.clone());

            let record = msg.payload.slice(5.min(msg.payload.len())..);

            // The codec is known from the tag even if the record cannot be read
            self.video_codec = match msg.video_codec_id() {
                Some(VIDEO_CODEC_ID_AVC) => Some(VideoCodec::Avc),
                Some(VIDEO_CODEC_ID_HEVC) => Some(VideoCodec::Hevc),
                _ => return Ok(()),
            };

            self.width = 0;
            self.height = 0;

            let resolution = match self.video_codec {
                Some(VideoCodec::Hevc) => HevcDecoderConfig::parse(&record)?.resolution()?,
                _ => AvcDecoderConfig::parse(&record)?.resolution()?,
            };

            self.width = resolution.0;
            self.height = resolution.1;

            return Ok(());
        }

        if msg.is_aac_seq_header() {
            self.audio_codec = Some(AudioCodec::Aac);
            self.audio_seq_header = Some(msg.clone());
            return Ok(());
        }

        if self.audio_codec.is_none() {
            if let Some(id) = msg.audio_codec_id() {
                if id != AUDIO_CODEC_ID_AAC {
                    self.audio_codec = Some(AudioCodec::Other(id));
                }
            }
        }

        Ok(())
    }

    pub fn video_codec_name(&self) -> String {
        match self.video_codec {
            Some(VideoCodec::Avc) => "H264".to_string(),
            Some(VideoCodec::Hevc) => "H265".to_string(),
            None => "".to_string(),
        }
    }

    pub fn audio_codec_name(&self) -> String {
        match self.audio_codec {
            Some(AudioCodec::Aac) => "AAC".to_string(),
            Some(AudioCodec::Other(id)) => format!("SOUND_FORMAT_{}", id),
            None => "".to_string(),
        }
    }
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::avc_test_util::make_avc_sps,
        remux::{make_aac_payload, make_video_payload},
        rtmp::{RTMP_TYPE_AUDIO, RTMP_TYPE_VIDEO},
    };

    #[test]
    fn test_codec_context_from_seq_headers() {
        let mut ctx = CodecContext::default();

        let sps = make_avc_sps(80, 45, 0);
        let record = AvcDecoderConfig::build(&sps, &[0x68, 0xce, 0x3c, 0x80]);

        ctx.update(&AvMsg::new_media(
            RTMP_TYPE_VIDEO,
            0,
            make_video_payload(VIDEO_CODEC_ID_AVC, true, 0, 0, &record),
        ))
        .unwrap();

        assert_eq!(ctx.video_codec, Some(VideoCodec::Avc));
        assert_eq!((ctx.width, ctx.height), (1280, 720));
        assert_eq!(ctx.video_codec_name(), "H264");

        ctx.update(&AvMsg::new_media(
            RTMP_TYPE_AUDIO,
            0,
            make_aac_payload(0, &[0x12, 0x10]),
        ))
        .unwrap();

        assert_eq!(ctx.audio_codec_name(), "AAC");
        assert!(ctx.audio_seq_header.is_some());
    }

    #[test]
    fn test_unreadable_sps_keeps_the_codec() {
        let mut ctx = CodecContext::default();

        let sps = make_avc_sps(80, 45, 0);
        let record = AvcDecoderConfig::build(&sps[..4], &[0x68, 0xce, 0x3c, 0x80]);

        let result = ctx.update(&AvMsg::new_media(
            RTMP_TYPE_VIDEO,
            0,
            make_video_payload(VIDEO_CODEC_ID_AVC, true, 0, 0, &record),
        ));

        assert!(result.is_err());
        assert_eq!(ctx.video_codec_name(), "H264");
        assert_eq!((ctx.width, ctx.height), (0, 0));
        assert!(ctx.video_seq_header.is_some());
    }

    #[test]
    fn test_codec_context_other_sound_format() {
        let mut ctx = CodecContext::default();

        // MP3
        ctx.update(&AvMsg::new_media(
            RTMP_TYPE_AUDIO,
            0,
            bytes::Bytes::from_static(&[0x2f, 0xff]),
        ))
        .unwrap();

        assert_eq!(ctx.audio_codec, Some(AudioCodec::Other(2)));
        assert!(ctx.video_codec.is_none());
    }
}
