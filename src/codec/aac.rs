// AAC AudioSpecificConfig and ADTS

use crate::base::{StreamError, StreamResult};

/// Sample rates by sampling frequency index
pub const AAC_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Samples carried by one AAC-LC frame
pub const AAC_SAMPLES_PER_FRAME: u32 = 1024;

/// AudioSpecificConfig (first two bytes)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub object_type: u8,
    pub sampling_frequency_index: u8,
    pub channel_configuration: u8,
}

impl AudioSpecificConfig {
    pub fn parse(data: &[u8]) -> StreamResult<AudioSpecificConfig> {
        if data.len() < 2 {
            return Err(StreamError::MalformedMedia(
                "AudioSpecificConfig too short".to_string(),
            ));
        }

        let config = AudioSpecificConfig {
            object_type: data[0] >> 3,
            sampling_frequency_index: ((data[0] & 0x07) << 1) | (data[1] >> 7),
            channel_configuration: (data[1] >> 3) & 0x0f,
        };

        if config.sampling_frequency_index as usize >= AAC_SAMPLE_RATES.len() {
            return Err(StreamError::MalformedMedia(format!(
                "unsupported AAC sampling frequency index {}",
                config.sampling_frequency_index
            )));
        }

        Ok(config)
    }

    pub fn to_bytes(&self) -> [u8; 2] {
        [
            (self.object_type << 3) | (self.sampling_frequency_index >> 1),
            ((self.sampling_frequency_index & 0x01) << 7) | (self.channel_configuration << 3),
        ]
    }

    pub fn sample_rate(&self) -> u32 {
        AAC_SAMPLE_RATES
            .get(self.sampling_frequency_index as usize)
            .copied()
            .unwrap_or(44100)
    }

    /// Builds the 7 byte ADTS header for a raw frame
    ///
    /// # Arguments
    ///
    /// * `payload_len` - Length of the raw AAC frame
    pub fn adts_header(&self, payload_len: usize) -> [u8; 7] {
        let frame_len = payload_len + 7;
        let profile = self.object_type.saturating_sub(1) & 0x03;

        [
            0xff,
            0xf1,
            (profile << 6)
                | ((self.sampling_frequency_index & 0x0f) << 2)
                | ((self.channel_configuration >> 2) & 0x01),
            ((self.channel_configuration & 0x03) << 6) | ((frame_len >> 11) & 0x03) as u8,
            ((frame_len >> 3) & 0xff) as u8,
            (((frame_len & 0x07) << 5) as u8) | 0x1f,
            0xfc,
        ]
    }
}

// Tests
