// FLV tags

use byteorder::{BigEndian, ByteOrder};
use bytes::{Bytes, BytesMut};

use crate::{
    base::{AvMsg, StreamError, StreamResult},
    rtmp::{RTMP_TYPE_AUDIO, RTMP_TYPE_DATA, RTMP_TYPE_VIDEO},
};

/// Size of the FLV file header plus the first PreviousTagSize
pub const FLV_HEADER_SIZE: usize = 13;

/// Size of a tag header
pub const FLV_TAG_HEADER_SIZE: usize = 11;

/// Size of the PreviousTagSize trailer
pub const FLV_PREV_TAG_SIZE_SIZE: usize = 4;

pub const FLV_TAG_TYPE_AUDIO: u8 = RTMP_TYPE_AUDIO;
pub const FLV_TAG_TYPE_VIDEO: u8 = RTMP_TYPE_VIDEO;
pub const FLV_TAG_TYPE_SCRIPT: u8 = RTMP_TYPE_DATA;

/// Sound format AAC, 44 kHz, 16 bits, stereo
pub const FLV_AUDIO_AAC_HEADER: u8 = 0xaf;

/// Builds the FLV file header
///
/// # Arguments
///
/// * `has_video` - Sets the video flag
/// * `has_audio` - Sets the audio flag
pub fn flv_file_header(has_video: bool, has_audio: bool) -> [u8; FLV_HEADER_SIZE] {
    let mut flags = 0u8;

    if has_video {
        flags |= 0x01;
    }

    if has_audio {
        flags |= 0x04;
    }

    [b'F', b'L', b'V', 0x01, flags, 0, 0, 0, 9, 0, 0, 0, 0]
}

/// Tag header fields
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlvTagHeader {
    pub tag_type: u8,
    pub data_size: u32,
    pub timestamp: u32,
    pub stream_id: u32,
}

impl FlvTagHeader {
    pub fn parse(b: &[u8]) -> StreamResult<FlvTagHeader> {
        if b.len() < FLV_TAG_HEADER_SIZE {
            return Err(StreamError::MalformedMedia(
                "truncated FLV tag header".to_string(),
            ));
        }

        Ok(FlvTagHeader {
            tag_type: b[0] & 0x1f,
            data_size: BigEndian::read_u24(&b[1..4]),
            timestamp: BigEndian::read_u24(&b[4..7]) | ((b[7] as u32) << 24),
            stream_id: BigEndian::read_u24(&b[8..11]),
        })
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        let mut b = [0u8; FLV_TAG_HEADER_SIZE];

        b[0] = self.tag_type;
        BigEndian::write_u24(&mut b[1..4], self.data_size);
        BigEndian::write_u24(&mut b[4..7], self.timestamp & 0xffffff);
        b[7] = (self.timestamp >> 24) as u8;
        BigEndian::write_u24(&mut b[8..11], self.stream_id);

        out.extend_from_slice(&b);
    }
}

/// One FLV tag
#[derive(Clone, Debug)]
pub struct FlvTag {
    pub header: FlvTagHeader,
    pub payload: Bytes,
}

impl FlvTag {
    /// Converts the tag into a media message
    pub fn into_av_msg(self) -> AvMsg {
        AvMsg::new_media(self.header.tag_type, self.header.timestamp, self.payload)
    }

    /// Serializes the tag, including the PreviousTagSize trailer
    pub fn encode(&self) -> Bytes {
        let mut out =
            Vec::with_capacity(FLV_TAG_HEADER_SIZE + self.payload.len() + FLV_PREV_TAG_SIZE_SIZE);

        self.header.write_to(&mut out);
        out.extend_from_slice(&self.payload);

        let mut b = [0u8; 4];
        BigEndian::write_u32(&mut b, (FLV_TAG_HEADER_SIZE + self.payload.len()) as u32);
        out.extend_from_slice(&b);

        Bytes::from(out)
    }
}

/// Builds the FLV tag of a message
pub fn av_msg_to_flv_tag(msg: &AvMsg) -> FlvTag {
    FlvTag {
        header: FlvTagHeader {
            tag_type: msg.header.msg_type_id,
            data_size: msg.payload.len() as u32,
            timestamp: msg.header.timestamp_abs,
            stream_id: 0,
        },
        payload: msg.payload.clone(),
    }
}

/// Incremental FLV stream reader.
///
/// Accepts the file header (optional) followed by tags, in any split.
#[derive(Default)]
pub struct FlvTagReader {
    buffer: BytesMut,
    header_checked: bool,
}

impl FlvTagReader {
    pub fn new() -> FlvTagReader {
        FlvTagReader::default()
    }

    /// Feeds bytes, returning the completed tags
    pub fn feed(&mut self, data: &[u8]) -> StreamResult<Vec<FlvTag>> {
        self.buffer.extend_from_slice(data);

        if !self.header_checked {
            if self.buffer.len() < 3 {
                return Ok(Vec::new());
            }

            if &self.buffer[0..3] == b"FLV" {
                if self.buffer.len() < FLV_HEADER_SIZE {
                    return Ok(Vec::new());
                }

                let _ = self.buffer.split_to(FLV_HEADER_SIZE);
            }

            self.header_checked = true;
        }

        let mut tags = Vec::new();

        loop {
            if self.buffer.len() < FLV_TAG_HEADER_SIZE {
                break;
            }

            let header = FlvTagHeader::parse(&self.buffer[..FLV_TAG_HEADER_SIZE])?;
            let total = FLV_TAG_HEADER_SIZE + header.data_size as usize + FLV_PREV_TAG_SIZE_SIZE;

            if self.buffer.len() < total {
                break;
            }

            let mut tag_bytes = self.buffer.split_to(total);
            let _ = tag_bytes.split_to(FLV_TAG_HEADER_SIZE);
            tag_bytes.truncate(header.data_size as usize);

            tags.push(FlvTag {
                header,
                payload: tag_bytes.freeze(),
            });
        }

        Ok(tags)
    }
}

/// Builds a video message body: frame type, codec id, packet type, composition time
///
/// # Arguments
///
/// * `codec_id` - FLV video codec id
/// * `key_frame` - True for keyframes and sequence headers
/// * `packet_type` - 0 for sequence header, 1 for NAL units
/// * `cts` - Composition time offset
/// * `body` - Decoder configuration record or length prefixed NAL units
pub fn make_video_payload(
    codec_id: u8,
    key_frame: bool,
    packet_type: u8,
    cts: i32,
    body: &[u8],
) -> Bytes {
    let mut out = Vec::with_capacity(5 + body.len());

    out.push(((if key_frame { 1 } else { 2 }) << 4) | codec_id);
    out.push(packet_type);

    let mut b = [0u8; 3];
    BigEndian::write_i24(&mut b, cts);
    out.extend_from_slice(&b);

    out.extend_from_slice(body);

    Bytes::from(out)
}

/// Builds an AAC audio message body
///
/// # Arguments
///
/// * `packet_type` - 0 for AudioSpecificConfig, 1 for raw frames
/// * `body` - Payload
pub fn make_aac_payload(packet_type: u8, body: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(2 + body.len());
    out.push(FLV_AUDIO_AAC_HEADER);
    out.push(packet_type);
    out.extend_from_slice(body);
    Bytes::from(out)
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::VIDEO_CODEC_ID_AVC;

    #[test]
    fn test_flv_header() {
        let h = flv_file_header(true, true);
        assert_eq!(&h[0..4], b"FLV\x01");
        assert_eq!(h[4], 0x05);
        assert_eq!(&h[5..9], &[0, 0, 0, 9]);
        assert_eq!(&h[9..13], &[0, 0, 0, 0]);

        assert_eq!(flv_file_header(false, true)[4], 0x04);
    }

    #[test]
    fn test_flv_tag_preserves_message() {
        let payload = make_video_payload(VIDEO_CODEC_ID_AVC, true, 1, 40, &[0, 0, 0, 1, 0x65]);
        let msg = AvMsg::new_media(RTMP_TYPE_VIDEO, 0x12345678, payload);

        let encoded = av_msg_to_flv_tag(&msg).encode();
        assert_eq!(encoded.len(), 11 + msg.payload.len() + 4);

        let mut reader = FlvTagReader::new();
        let tags = reader.feed(&encoded).unwrap();
        assert_eq!(tags.len(), 1);

        let back = tags[0].clone().into_av_msg();
        assert_eq!(back.header, msg.header);
        assert_eq!(back.payload, msg.payload);
        assert_eq!(back.composition_time(), 40);
    }

    #[test]
    fn test_flv_reader_split_input_with_header() {
        let a = AvMsg::new_media(RTMP_TYPE_AUDIO, 10, make_aac_payload(1, &[1, 2, 3]));
        let v = AvMsg::new_media(
            RTMP_TYPE_VIDEO,
            20,
            make_video_payload(VIDEO_CODEC_ID_AVC, false, 1, 0, &[9; 50]),
        );

        let mut stream = flv_file_header(true, true).to_vec();
        stream.extend_from_slice(&av_msg_to_flv_tag(&a).encode());
        stream.extend_from_slice(&av_msg_to_flv_tag(&v).encode());

        let mut reader = FlvTagReader::new();
        let mut tags = Vec::new();

        for piece in stream.chunks(7) {
            tags.extend(reader.feed(piece).unwrap());
        }

        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].header.tag_type, FLV_TAG_TYPE_AUDIO);
        assert_eq!(tags[1].header.timestamp, 20);
        assert_eq!(tags[1].payload, v.payload);
    }
}
