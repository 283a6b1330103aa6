// Canonical media message

use bytes::Bytes;

use crate::rtmp::{
    RTMP_CSID_AMF, RTMP_CSID_AUDIO, RTMP_CSID_VIDEO, RTMP_MSID_MEDIA, RTMP_TYPE_AUDIO,
    RTMP_TYPE_DATA, RTMP_TYPE_FLEX_STREAM, RTMP_TYPE_VIDEO,
};

/// FLV / RTMP video codec id for AVC (H.264)
pub const VIDEO_CODEC_ID_AVC: u8 = 7;

/// FLV / RTMP video codec id for HEVC (H.265)
pub const VIDEO_CODEC_ID_HEVC: u8 = 12;

/// FLV / RTMP sound format for AAC
pub const AUDIO_CODEC_ID_AAC: u8 = 10;

/// Header of a message, as framed by the chunk codec
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AvMsgHeader {
    /// Chunk stream id
    pub csid: u32,

    /// Length of the payload
    pub msg_len: u32,

    /// Message type id
    pub msg_type_id: u8,

    /// Message stream id
    pub msg_stream_id: u32,

    /// Absolute timestamp (milliseconds)
    pub timestamp_abs: u32,
}

/// Message flowing through a group.
///
/// The payload is reference counted, so cloning a message
/// never copies the media bytes.
#[derive(Clone, Debug)]
pub struct AvMsg {
    pub header: AvMsgHeader,
    pub payload: Bytes,
}

impl AvMsg {
    /// Creates a media message with the usual chunk stream and
    /// message stream ids for its type
    ///
    /// # Arguments
    ///
    /// * `msg_type_id` - Message type (audio, video or data)
    /// * `timestamp_abs` - Absolute timestamp
    /// * `payload` - Message payload
    pub fn new_media(msg_type_id: u8, timestamp_abs: u32, payload: Bytes) -> AvMsg {
        let csid = match msg_type_id {
            RTMP_TYPE_AUDIO => RTMP_CSID_AUDIO,
            RTMP_TYPE_VIDEO => RTMP_CSID_VIDEO,
            _ => RTMP_CSID_AMF,
        };

        AvMsg {
            header: AvMsgHeader {
                csid,
                msg_len: payload.len() as u32,
                msg_type_id,
                msg_stream_id: RTMP_MSID_MEDIA,
                timestamp_abs,
            },
            payload,
        }
    }

    /// Returns a copy of the message with the ids used for media egress
    pub fn normalized(&self) -> AvMsg {
        AvMsg::new_media(
            self.header.msg_type_id,
            self.header.timestamp_abs,
            self.payload.clone(),
        )
    }

    /// Returns a copy of the message with another timestamp
    pub fn with_timestamp(&self, timestamp_abs: u32) -> AvMsg {
        let mut msg = self.clone();
        msg.header.timestamp_abs = timestamp_abs;
        msg
    }

    pub fn is_audio(&self) -> bool {
        self.header.msg_type_id == RTMP_TYPE_AUDIO
    }

    pub fn is_video(&self) -> bool {
        self.header.msg_type_id == RTMP_TYPE_VIDEO
    }

    pub fn is_metadata(&self) -> bool {
        self.header.msg_type_id == RTMP_TYPE_DATA
            || self.header.msg_type_id == RTMP_TYPE_FLEX_STREAM
    }

    /// Video codec id (low nibble of the first byte)
    pub fn video_codec_id(&self) -> Option<u8> {
        if !self.is_video() || self.payload.is_empty() {
            return None;
        }

        Some(self.payload[0] & 0x0f)
    }

    /// Sound format (high nibble of the first byte)
    pub fn audio_codec_id(&self) -> Option<u8> {
        if !self.is_audio() || self.payload.is_empty() {
            return None;
        }

        Some(self.payload[0] >> 4)
    }

    fn is_video_frame_of(&self, packet_type: u8) -> bool {
        if !self.is_video() || self.payload.len() < 2 {
            return false;
        }

        let frame_type = self.payload[0] >> 4;
        let codec_id = self.payload[0] & 0x0f;

        frame_type == 1
            && (codec_id == VIDEO_CODEC_ID_AVC || codec_id == VIDEO_CODEC_ID_HEVC)
            && self.payload[1] == packet_type
    }

    /// True for a coded keyframe (not the sequence header)
    pub fn is_video_key_frame(&self) -> bool {
        self.is_video_frame_of(1)
    }

    /// True for an AVC or HEVC decoder configuration record
    pub fn is_video_key_seq_header(&self) -> bool {
        self.is_video_frame_of(0)
    }

    pub fn is_avc_key_seq_header(&self) -> bool {
        self.is_video_key_seq_header() && self.video_codec_id() == Some(VIDEO_CODEC_ID_AVC)
    }

    pub fn is_hevc_key_seq_header(&self) -> bool {
        self.is_video_key_seq_header() && self.video_codec_id() == Some(VIDEO_CODEC_ID_HEVC)
    }

    /// True for an AAC AudioSpecificConfig message
    pub fn is_aac_seq_header(&self) -> bool {
        self.is_audio()
            && self.payload.len() >= 2
            && self.payload[0] >> 4 == AUDIO_CODEC_ID_AAC
            && self.payload[1] == 0
    }

    pub fn is_seq_header(&self) -> bool {
        self.is_video_key_seq_header() || self.is_aac_seq_header()
    }

    /// Composition time offset of a video frame (signed, milliseconds)
    pub fn composition_time(&self) -> i32 {
        if !self.is_video() || self.payload.len() < 5 {
            return 0;
        }

        let raw = ((self.payload[2] as i32) << 16)
            | ((self.payload[3] as i32) << 8)
            | (self.payload[4] as i32);

        // Sign extend the 24 bit value
        (raw << 8) >> 8
    }
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_av_msg_classification() {
        let seq = AvMsg::new_media(RTMP_TYPE_VIDEO, 0, Bytes::from_static(&[0x17, 0, 0, 0, 0]));
        assert!(seq.is_video_key_seq_header());
        assert!(seq.is_avc_key_seq_header());
        assert!(!seq.is_video_key_frame());
        assert_eq!(seq.header.csid, RTMP_CSID_VIDEO);
        assert_eq!(seq.header.msg_len, 5);

        let key = AvMsg::new_media(RTMP_TYPE_VIDEO, 40, Bytes::from_static(&[0x1c, 1, 0, 0, 0]));
        assert!(key.is_video_key_frame());
        assert_eq!(key.video_codec_id(), Some(VIDEO_CODEC_ID_HEVC));

        let inter = AvMsg::new_media(RTMP_TYPE_VIDEO, 80, Bytes::from_static(&[0x27, 1, 0, 0, 0]));
        assert!(!inter.is_video_key_frame());

        let aac = AvMsg::new_media(RTMP_TYPE_AUDIO, 0, Bytes::from_static(&[0xaf, 0, 0x12, 0x10]));
        assert!(aac.is_aac_seq_header());
        assert!(aac.is_seq_header());
        assert_eq!(aac.header.csid, RTMP_CSID_AUDIO);
    }

    #[test]
    fn test_composition_time_sign() {
        let msg = AvMsg::new_media(
            RTMP_TYPE_VIDEO,
            0,
            Bytes::from_static(&[0x27, 1, 0xff, 0xff, 0xd8]),
        );
        assert_eq!(msg.composition_time(), -40);

        let msg = AvMsg::new_media(RTMP_TYPE_VIDEO, 0, Bytes::from_static(&[0x27, 1, 0, 0, 80]));
        assert_eq!(msg.composition_time(), 80);
    }
}
