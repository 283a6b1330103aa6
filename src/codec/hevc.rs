// H.265 decoder configuration and SPS parsing

use crate::base::{StreamError, StreamResult};

use super::{
    avc::{read_u16_prefixed, write_u16_prefixed},
    hevc_nalu_type, remove_emulation_prevention, BitReader,
};

pub const HEVC_NALU_TYPE_IDR_W_RADL: u8 = 19;
pub const HEVC_NALU_TYPE_IDR_N_LP: u8 = 20;
pub const HEVC_NALU_TYPE_CRA: u8 = 21;
pub const HEVC_NALU_TYPE_VPS: u8 = 32;
pub const HEVC_NALU_TYPE_SPS: u8 = 33;
pub const HEVC_NALU_TYPE_PPS: u8 = 34;
pub const HEVC_NALU_TYPE_AUD: u8 = 35;

/// Access unit delimiter NAL unit, written before each TS video frame
pub const HEVC_AUD_NALU: &[u8] = &[0x46, 0x01, 0x50];

/// True for IRAP pictures (BLA, IDR, CRA)
pub fn is_hevc_irap(nalu_type: u8) -> bool {
    (16..=23).contains(&nalu_type)
}

/// HEVCDecoderConfigurationRecord
#[derive(Clone, Debug, PartialEq)]
pub struct HevcDecoderConfig {
    pub nalu_length_size: usize,
    pub vps: Vec<Vec<u8>>,
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
}

impl HevcDecoderConfig {
    /// Parses a record (the video tag body after the 5 byte header)
    pub fn parse(record: &[u8]) -> StreamResult<HevcDecoderConfig> {
        if record.len() < 23 {
            return Err(StreamError::MalformedMedia(
                "truncated HEVC decoder configuration record".to_string(),
            ));
        }

        let nalu_length_size = ((record[21] & 0x03) + 1) as usize;
        let num_arrays = record[22] as usize;

        let mut config = HevcDecoderConfig {
            nalu_length_size,
            vps: Vec::new(),
            sps: Vec::new(),
            pps: Vec::new(),
        };

        let mut pos = 23;

        for _ in 0..num_arrays {
            if pos + 3 > record.len() {
                return Err(StreamError::MalformedMedia(
                    "truncated HEVC parameter set array".to_string(),
                ));
            }

            let nalu_type = record[pos] & 0x3f;
            let count = ((record[pos + 1] as usize) << 8) | record[pos + 2] as usize;
            pos += 3;

            for _ in 0..count {
                let nalu = read_u16_prefixed(record, &mut pos)?;

                match nalu_type {
                    HEVC_NALU_TYPE_VPS => config.vps.push(nalu),
                    HEVC_NALU_TYPE_SPS => config.sps.push(nalu),
                    HEVC_NALU_TYPE_PPS => config.pps.push(nalu),
                    _ => {}
                }
            }
        }

        if config.vps.is_empty() || config.sps.is_empty() || config.pps.is_empty() {
            return Err(StreamError::MalformedMedia(
                "HEVC decoder configuration record misses VPS, SPS or PPS".to_string(),
            ));
        }

        Ok(config)
    }

    /// Builds a record from one VPS, SPS and PPS
    pub fn build(vps: &[u8], sps: &[u8], pps: &[u8]) -> StreamResult<Vec<u8>> {
        if sps.len() < 15 {
            return Err(StreamError::MalformedMedia("HEVC SPS too short".to_string()));
        }

        let rbsp = remove_emulation_prevention(&sps[2..]);

        if rbsp.len() < 13 {
            return Err(StreamError::MalformedMedia("HEVC SPS too short".to_string()));
        }

        let ptl = &rbsp[1..13];

        let mut out = Vec::with_capacity(23 + 15 + vps.len() + sps.len() + pps.len());

        out.push(0x01);
        out.extend_from_slice(ptl);
        out.extend_from_slice(&[0xf0, 0x00]); // min_spatial_segmentation_idc
        out.push(0xfc); // parallelismType
        out.push(0xfd); // chroma_format_idc 4:2:0
        out.push(0xf8); // bit_depth_luma_minus8
        out.push(0xf8); // bit_depth_chroma_minus8
        out.extend_from_slice(&[0x00, 0x00]); // avgFrameRate
        out.push(0x0f); // 1 temporal layer, nested, 4 bytes NALU length
        out.push(0x03);

        for nalu in [vps, sps, pps] {
            out.push(0x80 | hevc_nalu_type(nalu));
            out.extend_from_slice(&[0x00, 0x01]);
            write_u16_prefixed(&mut out, nalu);
        }

        Ok(out)
    }

    /// Video resolution from the first SPS
    pub fn resolution(&self) -> StreamResult<(u32, u32)> {
        parse_hevc_sps_resolution(&self.sps[0])
    }
}

/// Parses width and height from an SPS NAL unit (2 byte header included)
pub fn parse_hevc_sps_resolution(sps: &[u8]) -> StreamResult<(u32, u32)> {
    if sps.len() < 3 {
        return Err(StreamError::MalformedMedia("HEVC SPS too short".to_string()));
    }

    let rbsp = remove_emulation_prevention(&sps[2..]);
    let mut r = BitReader::new(&rbsp);

    r.skip_bits(4)?; // sps_video_parameter_set_id

    let max_sub_layers_minus1 = r.read_bits(3)? as usize;

    r.skip_bits(1)?; // sps_temporal_id_nesting_flag

    // profile_tier_level: general profile (88 bits) and level (8 bits)
    r.skip_bits(96)?;

    let mut sub_layer_profile_present = [false; 8];
    let mut sub_layer_level_present = [false; 8];

    for i in 0..max_sub_layers_minus1 {
        sub_layer_profile_present[i] = r.read_bit()?;
        sub_layer_level_present[i] = r.read_bit()?;
    }

    if max_sub_layers_minus1 > 0 {
        r.skip_bits(2 * (8 - max_sub_layers_minus1))?;
    }

    for i in 0..max_sub_layers_minus1 {
        if sub_layer_profile_present[i] {
            r.skip_bits(88)?;
        }

        if sub_layer_level_present[i] {
            r.skip_bits(8)?;
        }
    }

    r.read_ue()?; // sps_seq_parameter_set_id

    let chroma_format_idc = r.read_ue()?;

    if chroma_format_idc == 3 {
        r.read_bit()?; // separate_colour_plane_flag
    }

    let mut width = r.read_ue()?;
    let mut height = r.read_ue()?;

    if r.read_bit()? {
        let left = r.read_ue()?;
        let right = r.read_ue()?;
        let top = r.read_ue()?;
        let bottom = r.read_ue()?;

        let sub_width = if chroma_format_idc == 1 || chroma_format_idc == 2 {
            2
        } else {
            1
        };
        let sub_height = if chroma_format_idc == 1 { 2 } else { 1 };

        width = width.saturating_sub(sub_width * (left + right));
        height = height.saturating_sub(sub_height * (top + bottom));
    }

    Ok((width, height))
}

#[cfg(test)]
pub(crate) mod test_util {
    use crate::codec::avc::test_util::BitWriter;

    /// Main profile SPS (2 byte header included)
    pub fn make_hevc_sps(width: u32, height: u32, crop_bottom: u32) -> Vec<u8> {
        let mut w = BitWriter::default();

        w.bits(0x42, 8)
            .bits(0x01, 8)
            .bits(0, 4)
            .bits(0, 3)
            .bits(1, 1)
            .bits(0x01, 8) // profile space, tier, profile idc
            .bits(0x6000_0000, 32)
            .bits(0x9000_0000_0000, 48)
            .bits(93, 8)
            .ue(0)
            .ue(1)
            .ue(width)
            .ue(height);

        if crop_bottom > 0 {
            w.bits(1, 1).ue(0).ue(0).ue(0).ue(crop_bottom);
        } else {
            w.bits(0, 1);
        }

        w.finish()
    }

    pub fn make_hevc_vps() -> Vec<u8> {
        vec![0x40, 0x01, 0x0c, 0x01, 0xff, 0xff]
    }

    pub fn make_hevc_pps() -> Vec<u8> {
        vec![0x44, 0x01, 0xc1, 0x72, 0xb4, 0x62, 0x40]
    }
}

// Tests

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn test_hevc_sps_resolution() {
        let sps = make_hevc_sps(1920, 1088, 4);
        assert_eq!(parse_hevc_sps_resolution(&sps).unwrap(), (1920, 1080));

        let sps = make_hevc_sps(1280, 720, 0);
        assert_eq!(parse_hevc_sps_resolution(&sps).unwrap(), (1280, 720));
    }

    #[test]
    fn test_hevc_decoder_config_build_parse() {
        let vps = make_hevc_vps();
        let sps = make_hevc_sps(1280, 720, 0);
        let pps = make_hevc_pps();

        let record = HevcDecoderConfig::build(&vps, &sps, &pps).unwrap();

        assert_eq!(record[1], 0x01);
        assert_eq!(record[12], 93);

        let config = HevcDecoderConfig::parse(&record).unwrap();

        assert_eq!(config.nalu_length_size, 4);
        assert_eq!(config.vps, vec![vps]);
        assert_eq!(config.sps, vec![sps]);
        assert_eq!(config.pps, vec![pps]);
        assert_eq!(config.resolution().unwrap(), (1280, 720));
    }

    #[test]
    fn test_hevc_irap() {
        assert!(is_hevc_irap(HEVC_NALU_TYPE_IDR_W_RADL));
        assert!(is_hevc_irap(HEVC_NALU_TYPE_CRA));
        assert!(!is_hevc_irap(1));
    }
}
