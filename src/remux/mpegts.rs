// FLV style messages to MPEG-TS packets

use bytes::Bytes;

use crate::{
    base::{AvMsg, StreamResult, AUDIO_CODEC_ID_AAC, VIDEO_CODEC_ID_AVC, VIDEO_CODEC_ID_HEVC},
    codec::{
        avc_nalu_type, hevc_nalu_type, split_length_prefixed, write_annexb, AudioSpecificConfig,
        AvcDecoderConfig, HevcDecoderConfig, AVC_AUD_NALU, AVC_NALU_TYPE_AUD, HEVC_AUD_NALU,
        HEVC_NALU_TYPE_AUD,
    },
};

pub const TS_PACKET_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;

pub const TS_PID_PAT: u16 = 0x0000;
pub const TS_PID_PMT: u16 = 0x1001;
pub const TS_PID_VIDEO: u16 = 0x0100;
pub const TS_PID_AUDIO: u16 = 0x0101;

pub const TS_STREAM_TYPE_H264: u8 = 0x1b;
pub const TS_STREAM_TYPE_H265: u8 = 0x24;
pub const TS_STREAM_TYPE_AAC: u8 = 0x0f;

const PES_STREAM_ID_VIDEO: u8 = 0xe0;
const PES_STREAM_ID_AUDIO: u8 = 0xc0;

const CRC32_POLY: u32 = 0x04c11db7;

static CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut j = 0;

        while j < 8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ CRC32_POLY;
            } else {
                crc <<= 1;
            }

            j += 1;
        }

        table[i] = crc;
        i += 1;
    }

    table
};

/// CRC-32/MPEG-2 of a PSI section
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xffff_ffff;

    for &b in data {
        crc = (crc << 8) ^ CRC32_TABLE[(((crc >> 24) as u8) ^ b) as usize];
    }

    crc
}

/// Video codec configuration known to the remuxer
#[derive(Clone)]
enum VideoConfig {
    Avc(AvcDecoderConfig),
    Hevc(HevcDecoderConfig),
}

impl VideoConfig {
    fn stream_type(&self) -> u8 {
        match self {
            VideoConfig::Avc(_) => TS_STREAM_TYPE_H264,
            VideoConfig::Hevc(_) => TS_STREAM_TYPE_H265,
        }
    }
}

/// Converts messages into MPEG-TS packets, one PES per message.
///
/// PAT and PMT are written at start, after a codec configuration
/// change and before every video keyframe.
#[derive(Default)]
pub struct MpegtsRemuxer {
    video: Option<VideoConfig>,
    video_seq_header: Option<Bytes>,
    audio: Option<AudioSpecificConfig>,
    audio_seq_header: Option<Bytes>,

    pmt_version: u8,
    psi_pending: bool,

    pat_cc: u8,
    pmt_cc: u8,
    video_cc: u8,
    audio_cc: u8,
}

impl MpegtsRemuxer {
    pub fn new() -> MpegtsRemuxer {
        MpegtsRemuxer {
            psi_pending: true,
            ..Default::default()
        }
    }

    /// Converts a message
    ///
    /// # Return value
    ///
    /// Returns the TS packets for the message, a multiple of 188 bytes.
    /// Sequence headers and metadata only update the remuxer state
    /// and produce no packets.
    pub fn feed(&mut self, msg: &AvMsg) -> StreamResult<Bytes> {
        if msg.is_video() {
            return self.feed_video(msg);
        }

        if msg.is_audio() {
            return self.feed_audio(msg);
        }

        Ok(Bytes::new())
    }

    /// PAT and PMT for a subscriber joining mid-stream.
    ///
    /// Does not advance the continuity counters of the stream.
    pub fn pat_pmt(&self) -> Bytes {
        let mut out = Vec::with_capacity(2 * TS_PACKET_SIZE);
        let mut pat_cc = self.pat_cc;
        let mut pmt_cc = self.pmt_cc;

        write_psi_packet(&mut out, TS_PID_PAT, &mut pat_cc, &self.pat_section());
        write_psi_packet(&mut out, TS_PID_PMT, &mut pmt_cc, &self.pmt_section());

        Bytes::from(out)
    }

    /// Forgets the codec state, the next message starts a new stream
    pub fn flush(&mut self) {
        self.video = None;
        self.video_seq_header = None;
        self.audio = None;
        self.audio_seq_header = None;
        self.psi_pending = true;
    }

    fn write_pat_pmt(&mut self, out: &mut Vec<u8>) {
        let pat = self.pat_section();
        let pmt = self.pmt_section();

        write_psi_packet(out, TS_PID_PAT, &mut self.pat_cc, &pat);
        write_psi_packet(out, TS_PID_PMT, &mut self.pmt_cc, &pmt);

        self.psi_pending = false;
    }

    fn pcr_pid(&self) -> u16 {
        if self.video.is_some() || self.audio.is_none() {
            TS_PID_VIDEO
        } else {
            TS_PID_AUDIO
        }
    }

    fn pat_section(&self) -> Vec<u8> {
        let mut s = vec![
            0x00, // table id
            0xb0,
            13,
            0x00,
            0x01, // transport stream id
            0xc1,
            0x00,
            0x00,
            0x00,
            0x01, // program number
            0xe0 | ((TS_PID_PMT >> 8) as u8 & 0x1f),
            (TS_PID_PMT & 0xff) as u8,
        ];

        let crc = crc32_mpeg2(&s);
        s.extend_from_slice(&crc.to_be_bytes());
        s
    }

    fn pmt_section(&self) -> Vec<u8> {
        let mut streams: Vec<(u8, u16)> = Vec::with_capacity(2);

        if let Some(v) = &self.video {
            streams.push((v.stream_type(), TS_PID_VIDEO));
        }

        if self.audio.is_some() {
            streams.push((TS_STREAM_TYPE_AAC, TS_PID_AUDIO));
        }

        let section_length = 9 + 5 * streams.len() + 4;
        let pcr_pid = self.pcr_pid();

        let mut s = vec![
            0x02, // table id
            0xb0 | ((section_length >> 8) as u8 & 0x0f),
            (section_length & 0xff) as u8,
            0x00,
            0x01, // program number
            0xc1 | ((self.pmt_version & 0x1f) << 1),
            0x00,
            0x00,
            0xe0 | ((pcr_pid >> 8) as u8 & 0x1f),
            (pcr_pid & 0xff) as u8,
            0xf0,
            0x00,
        ];

        for (stream_type, pid) in streams {
            s.push(stream_type);
            s.push(0xe0 | ((pid >> 8) as u8 & 0x1f));
            s.push((pid & 0xff) as u8);
            s.push(0xf0);
            s.push(0x00);
        }

        let crc = crc32_mpeg2(&s);
        s.extend_from_slice(&crc.to_be_bytes());
        s
    }

    fn config_changed(&mut self) {
        self.pmt_version = (self.pmt_version + 1) & 0x1f;
        self.psi_pending = true;
    }

    fn feed_video(&mut self, msg: &AvMsg) -> StreamResult<Bytes> {
        let codec_id = match msg.video_codec_id() {
            Some(id) if id == VIDEO_CODEC_ID_AVC || id == VIDEO_CODEC_ID_HEVC => id,
            _ => return Ok(Bytes::new()),
        };

        if msg.payload.len() < 5 {
            return Ok(Bytes::new());
        }

        if msg.is_video_key_seq_header() {
            if self.video_seq_header.as_ref() == Some(&msg.payload) {
                return Ok(Bytes::new());
            }

            let record = &msg.payload[5..];

            let config = if codec_id == VIDEO_CODEC_ID_AVC {
                VideoConfig::Avc(AvcDecoderConfig::parse(record)?)
            } else {
                VideoConfig::Hevc(HevcDecoderConfig::parse(record)?)
            };

            self.video = Some(config);
            self.video_seq_header = Some(msg.payload.clone());
            self.config_changed();

            return Ok(Bytes::new());
        }

        if msg.payload[1] != 1 {
            // end of sequence
            return Ok(Bytes::new());
        }

        let config = match &self.video {
            Some(c) => c.clone(),
            None => return Ok(Bytes::new()),
        };

        let key = msg.is_video_key_frame();

        let mut es: Vec<u8> = Vec::with_capacity(msg.payload.len() + 128);

        let (nalu_length_size, aud_nalu) = match &config {
            VideoConfig::Avc(c) => (c.nalu_length_size, AVC_AUD_NALU),
            VideoConfig::Hevc(c) => (c.nalu_length_size, HEVC_AUD_NALU),
        };

        write_annexb(&mut es, aud_nalu);

        if key {
            match &config {
                VideoConfig::Avc(c) => {
                    for nalu in c.sps.iter().chain(c.pps.iter()) {
                        write_annexb(&mut es, nalu);
                    }
                }
                VideoConfig::Hevc(c) => {
                    for nalu in c.vps.iter().chain(c.sps.iter()).chain(c.pps.iter()) {
                        write_annexb(&mut es, nalu);
                    }
                }
            }
        }

        for nalu in split_length_prefixed(&msg.payload[5..], nalu_length_size)? {
            let is_aud = match &config {
                VideoConfig::Avc(_) => avc_nalu_type(nalu) == AVC_NALU_TYPE_AUD,
                VideoConfig::Hevc(_) => hevc_nalu_type(nalu) == HEVC_NALU_TYPE_AUD,
            };

            if !is_aud {
                write_annexb(&mut es, nalu);
            }
        }

        let dts = msg.header.timestamp_abs as u64 * 90;
        let pts_ms = msg.header.timestamp_abs as i64 + msg.composition_time() as i64;
        let pts = pts_ms.max(0) as u64 * 90;

        let mut out = Vec::with_capacity(es.len() + es.len() / 184 * 4 + 3 * TS_PACKET_SIZE);

        if key || self.psi_pending {
            self.write_pat_pmt(&mut out);
        }

        let pes = make_pes(PES_STREAM_ID_VIDEO, pts, Some(dts), &es, true);

        write_pes_packets(
            &mut out,
            TS_PID_VIDEO,
            &mut self.video_cc,
            &pes,
            Some(dts),
            key,
        );

        Ok(Bytes::from(out))
    }

    fn feed_audio(&mut self, msg: &AvMsg) -> StreamResult<Bytes> {
        if msg.audio_codec_id() != Some(AUDIO_CODEC_ID_AAC) || msg.payload.len() < 2 {
            return Ok(Bytes::new());
        }

        if msg.is_aac_seq_header() {
            if self.audio_seq_header.as_ref() == Some(&msg.payload) {
                return Ok(Bytes::new());
            }

            self.audio = Some(AudioSpecificConfig::parse(&msg.payload[2..])?);
            self.audio_seq_header = Some(msg.payload.clone());
            self.config_changed();

            return Ok(Bytes::new());
        }

        let asc = match self.audio {
            Some(a) => a,
            None => return Ok(Bytes::new()),
        };

        let raw = &msg.payload[2..];

        let mut es = Vec::with_capacity(raw.len() + 7);
        es.extend_from_slice(&asc.adts_header(raw.len()));
        es.extend_from_slice(raw);

        let pts = msg.header.timestamp_abs as u64 * 90;

        let mut out = Vec::with_capacity(es.len() + 3 * TS_PACKET_SIZE);

        if self.psi_pending {
            self.write_pat_pmt(&mut out);
        }

        let pes = make_pes(PES_STREAM_ID_AUDIO, pts, None, &es, false);

        let pcr = if self.pcr_pid() == TS_PID_AUDIO {
            Some(pts)
        } else {
            None
        };

        write_pes_packets(&mut out, TS_PID_AUDIO, &mut self.audio_cc, &pes, pcr, false);

        Ok(Bytes::from(out))
    }
}

fn write_pes_timestamp(out: &mut Vec<u8>, prefix: u8, ts: u64) {
    let ts = ts & 0x1_ffff_ffff;

    out.push((prefix << 4) | ((((ts >> 30) & 0x07) as u8) << 1) | 0x01);
    out.push(((ts >> 22) & 0xff) as u8);
    out.push(((((ts >> 15) & 0x7f) as u8) << 1) | 0x01);
    out.push(((ts >> 7) & 0xff) as u8);
    out.push((((ts & 0x7f) as u8) << 1) | 0x01);
}

/// Builds a PES packet (header and elementary stream data)
fn make_pes(stream_id: u8, pts: u64, dts: Option<u64>, es: &[u8], unbounded: bool) -> Vec<u8> {
    let dts = dts.filter(|d| *d != pts);
    let header_data_len: usize = if dts.is_some() { 10 } else { 5 };

    let pes_len = 3 + header_data_len + es.len();
    let pes_len_field = if unbounded || pes_len > 0xffff {
        0
    } else {
        pes_len as u16
    };

    let mut out = Vec::with_capacity(9 + header_data_len + es.len());

    out.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);
    out.extend_from_slice(&pes_len_field.to_be_bytes());
    out.push(0x80);
    out.push(if dts.is_some() { 0xc0 } else { 0x80 });
    out.push(header_data_len as u8);

    match dts {
        Some(d) => {
            write_pes_timestamp(&mut out, 0x03, pts);
            write_pes_timestamp(&mut out, 0x01, d);
        }
        None => write_pes_timestamp(&mut out, 0x02, pts),
    }

    out.extend_from_slice(es);

    out
}

/// Writes a PSI section in a single packet
fn write_psi_packet(out: &mut Vec<u8>, pid: u16, cc: &mut u8, section: &[u8]) {
    let mut pkt = [0xffu8; TS_PACKET_SIZE];

    pkt[0] = TS_SYNC_BYTE;
    pkt[1] = 0x40 | ((pid >> 8) as u8 & 0x1f);
    pkt[2] = (pid & 0xff) as u8;
    pkt[3] = 0x10 | (*cc & 0x0f);
    pkt[4] = 0x00; // pointer field

    let len = section.len().min(TS_PACKET_SIZE - 5);
    pkt[5..5 + len].copy_from_slice(&section[..len]);

    *cc = (*cc + 1) & 0x0f;

    out.extend_from_slice(&pkt);
}

/// Splits a PES packet into TS packets
///
/// # Arguments
///
/// * `out` - Output buffer
/// * `pid` - Elementary stream PID
/// * `cc` - Continuity counter of the PID
/// * `pes` - PES packet
/// * `pcr` - PCR (90 kHz) written in the first packet, if any
/// * `random_access` - Sets the random access indicator in the first packet
fn write_pes_packets(
    out: &mut Vec<u8>,
    pid: u16,
    cc: &mut u8,
    pes: &[u8],
    pcr: Option<u64>,
    random_access: bool,
) {
    let mut remaining = pes;
    let mut first = true;

    while !remaining.is_empty() {
        let mut pkt = [0xffu8; TS_PACKET_SIZE];

        pkt[0] = TS_SYNC_BYTE;
        pkt[1] = (if first { 0x40 } else { 0x00 }) | ((pid >> 8) as u8 & 0x1f);
        pkt[2] = (pid & 0xff) as u8;

        // Adaptation field content, after the length byte
        let mut af: Vec<u8> = Vec::new();

        if first && (pcr.is_some() || random_access) {
            let mut flags = 0u8;

            if random_access {
                flags |= 0x40;
            }

            if pcr.is_some() {
                flags |= 0x10;
            }

            af.push(flags);

            if let Some(base) = pcr {
                let base = base & 0x1_ffff_ffff;
                af.push((base >> 25) as u8);
                af.push((base >> 17) as u8);
                af.push((base >> 9) as u8);
                af.push((base >> 1) as u8);
                af.push((((base & 0x01) as u8) << 7) | 0x7e);
                af.push(0x00);
            }
        }

        let mut af_total = if af.is_empty() { 0 } else { 1 + af.len() };
        let space = TS_PACKET_SIZE - 4 - af_total;

        if remaining.len() < space {
            let stuffing = space - remaining.len();

            if af_total == 0 {
                if stuffing > 1 {
                    af.push(0x00);
                    af.resize(stuffing - 1, 0xff);
                }
                af_total = stuffing;
            } else {
                af.resize(af.len() + stuffing, 0xff);
                af_total += stuffing;
            }
        }

        let payload_len = remaining.len().min(TS_PACKET_SIZE - 4 - af_total);

        pkt[3] = (if af_total > 0 { 0x30 } else { 0x10 }) | (*cc & 0x0f);
        *cc = (*cc + 1) & 0x0f;

        let mut pos = 4;

        if af_total > 0 {
            pkt[4] = (af_total - 1) as u8;
            pkt[5..5 + af.len()].copy_from_slice(&af);
            pos += af_total;
        }

        pkt[pos..pos + payload_len].copy_from_slice(&remaining[..payload_len]);
        remaining = &remaining[payload_len..];

        first = false;

        out.extend_from_slice(&pkt);
    }
}

// Tests
