// H.264 decoder configuration and SPS parsing

use byteorder::{BigEndian, ByteOrder};

use crate::base::{StreamError, StreamResult};

use super::{remove_emulation_prevention, BitReader};

pub const AVC_NALU_TYPE_SLICE: u8 = 1;
pub const AVC_NALU_TYPE_IDR: u8 = 5;
pub const AVC_NALU_TYPE_SEI: u8 = 6;
pub const AVC_NALU_TYPE_SPS: u8 = 7;
pub const AVC_NALU_TYPE_PPS: u8 = 8;
pub const AVC_NALU_TYPE_AUD: u8 = 9;

/// Access unit delimiter NAL unit, written before each TS video frame
pub const AVC_AUD_NALU: &[u8] = &[0x09, 0xf0];

/// AVCDecoderConfigurationRecord
#[derive(Clone, Debug, PartialEq)]
pub struct AvcDecoderConfig {
    pub nalu_length_size: usize,
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
}

fn truncated() -> StreamError {
    StreamError::MalformedMedia("truncated AVC decoder configuration record".to_string())
}

impl AvcDecoderConfig {
    /// Parses a record (the video tag body after the 5 byte header)
    pub fn parse(record: &[u8]) -> StreamResult<AvcDecoderConfig> {
        if record.len() < 6 {
            return Err(truncated());
        }

        let nalu_length_size = ((record[4] & 0x03) + 1) as usize;

        let mut pos = 5;

        let sps_count = (record[pos] & 0x1f) as usize;
        pos += 1;

        let mut sps = Vec::with_capacity(sps_count);

        for _ in 0..sps_count {
            sps.push(read_u16_prefixed(record, &mut pos)?);
        }

        let pps_count = *record.get(pos).ok_or_else(truncated)? as usize;
        pos += 1;

        let mut pps = Vec::with_capacity(pps_count);

        for _ in 0..pps_count {
            pps.push(read_u16_prefixed(record, &mut pos)?);
        }

        if sps.is_empty() {
            return Err(StreamError::MalformedMedia(
                "AVC decoder configuration record without SPS".to_string(),
            ));
        }

        Ok(AvcDecoderConfig {
            nalu_length_size,
            sps,
            pps,
        })
    }

    /// Builds a record from one SPS and one PPS
    pub fn build(sps: &[u8], pps: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(11 + sps.len() + pps.len());

        out.push(0x01);
        out.push(sps.get(1).copied().unwrap_or(0x42));
        out.push(sps.get(2).copied().unwrap_or(0x00));
        out.push(sps.get(3).copied().unwrap_or(0x1e));
        out.push(0xff); // 4 bytes NALU length
        out.push(0xe1);
        write_u16_prefixed(&mut out, sps);
        out.push(0x01);
        write_u16_prefixed(&mut out, pps);

        out
    }

    /// Video resolution from the first SPS
    pub fn resolution(&self) -> StreamResult<(u32, u32)> {
        parse_avc_sps_resolution(&self.sps[0])
    }
}

pub(super) fn read_u16_prefixed(data: &[u8], pos: &mut usize) -> StreamResult<Vec<u8>> {
    if *pos + 2 > data.len() {
        return Err(truncated());
    }

    let len = BigEndian::read_u16(&data[*pos..*pos + 2]) as usize;
    *pos += 2;

    if *pos + len > data.len() {
        return Err(truncated());
    }

    let v = data[*pos..*pos + len].to_vec();
    *pos += len;

    Ok(v)
}

pub(super) fn write_u16_prefixed(out: &mut Vec<u8>, data: &[u8]) {
    let mut b = [0u8; 2];
    BigEndian::write_u16(&mut b, data.len() as u16);
    out.extend_from_slice(&b);
    out.extend_from_slice(data);
}

fn skip_scaling_list(r: &mut BitReader, size: usize) -> StreamResult<()> {
    let mut last_scale: i32 = 8;
    let mut next_scale: i32 = 8;

    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }

        if next_scale != 0 {
            last_scale = next_scale;
        }
    }

    Ok(())
}

/// Parses width and height from an SPS NAL unit (header byte included)
pub fn parse_avc_sps_resolution(sps: &[u8]) -> StreamResult<(u32, u32)> {
    if sps.len() < 4 {
        return Err(StreamError::MalformedMedia("SPS too short".to_string()));
    }

    let rbsp = remove_emulation_prevention(&sps[1..]);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.read_bits(8)?;
    r.skip_bits(16)?; // constraint flags, level
    r.read_ue()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;

    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = r.read_ue()?;

        if chroma_format_idc == 3 {
            separate_colour_plane = r.read_bit()?;
        }

        r.read_ue()?; // bit_depth_luma_minus8
        r.read_ue()?; // bit_depth_chroma_minus8
        r.read_bit()?; // qpprime_y_zero_transform_bypass_flag

        if r.read_bit()? {
            let count = if chroma_format_idc != 3 { 8 } else { 12 };

            for i in 0..count {
                if r.read_bit()? {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.read_ue()?; // log2_max_frame_num_minus4

    let pic_order_cnt_type = r.read_ue()?;

    if pic_order_cnt_type == 0 {
        r.read_ue()?;
    } else if pic_order_cnt_type == 1 {
        r.read_bit()?;
        r.read_se()?;
        r.read_se()?;

        let n = r.read_ue()?;

        for _ in 0..n {
            r.read_se()?;
        }
    }

    r.read_ue()?; // max_num_ref_frames
    r.read_bit()?; // gaps_in_frame_num_value_allowed_flag

    let pic_width_in_mbs = r.read_ue()? + 1;
    let pic_height_in_map_units = r.read_ue()? + 1;

    let frame_mbs_only = r.read_bit()? as u32;

    if frame_mbs_only == 0 {
        r.read_bit()?; // mb_adaptive_frame_field_flag
    }

    r.read_bit()?; // direct_8x8_inference_flag

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0, 0, 0, 0);

    if r.read_bit()? {
        crop_left = r.read_ue()?;
        crop_right = r.read_ue()?;
        crop_top = r.read_ue()?;
        crop_bottom = r.read_ue()?;
    }

    let chroma_array_type = if separate_colour_plane {
        0
    } else {
        chroma_format_idc
    };

    let (crop_unit_x, crop_unit_y) = if chroma_array_type == 0 {
        (1, 2 - frame_mbs_only)
    } else {
        let sub_width = if chroma_format_idc == 3 { 1 } else { 2 };
        let sub_height = if chroma_format_idc == 1 { 2 } else { 1 };
        (sub_width, sub_height * (2 - frame_mbs_only))
    };

    let width = (pic_width_in_mbs * 16).saturating_sub(crop_unit_x * (crop_left + crop_right));
    let height = ((2 - frame_mbs_only) * pic_height_in_map_units * 16)
        .saturating_sub(crop_unit_y * (crop_top + crop_bottom));

    Ok((width, height))
}


// Tests

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn test_avc_sps_resolution_baseline() {
        let sps = make_avc_sps(120, 68, 4);
        assert_eq!(parse_avc_sps_resolution(&sps).unwrap(), (1920, 1080));

        let sps = make_avc_sps(80, 45, 0);
        assert_eq!(parse_avc_sps_resolution(&sps).unwrap(), (1280, 720));
    }

    #[test]
    fn test_avc_sps_resolution_high_profile() {
        let mut w = BitWriter::default();

        w.bits(0x67, 8)
            .bits(100, 8)
            .bits(0, 8)
            .bits(31, 8)
            .ue(0)
            .ue(1) // chroma_format_idc
            .ue(0)
            .ue(0)
            .bits(0, 1)
            .bits(0, 1) // no scaling matrix
            .ue(0)
            .ue(0)
            .ue(4) // log2_max_poc_lsb_minus4
            .ue(4)
            .bits(0, 1)
            .ue(39)
            .ue(29)
            .bits(1, 1)
            .bits(1, 1)
            .bits(0, 1)
            .bits(0, 1);

        let sps = w.finish();

        assert_eq!(parse_avc_sps_resolution(&sps).unwrap(), (640, 480));
    }

    #[test]
    fn test_avc_decoder_config_build_parse() {
        let sps = make_avc_sps(80, 45, 0);
        let pps = vec![0x68, 0xce, 0x3c, 0x80];

        let record = AvcDecoderConfig::build(&sps, &pps);
        let config = AvcDecoderConfig::parse(&record).unwrap();

        assert_eq!(config.nalu_length_size, 4);
        assert_eq!(config.sps, vec![sps]);
        assert_eq!(config.pps, vec![pps]);
        assert_eq!(config.resolution().unwrap(), (1280, 720));

        assert!(AvcDecoderConfig::parse(&record[..record.len() - 2]).is_err());
    }
}
