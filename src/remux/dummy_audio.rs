// Silent audio track for video-only publishers

use crate::{
    base::AvMsg,
    codec::AAC_SAMPLES_PER_FRAME,
    remux::make_aac_payload,
    rtmp::RTMP_TYPE_AUDIO,
};

/// AudioSpecificConfig: AAC-LC, 44.1 kHz, stereo
pub const DUMMY_AUDIO_ASC: [u8; 2] = [0x12, 0x10];

/// One silent AAC-LC stereo frame
pub const DUMMY_AUDIO_SILENT_FRAME: [u8; 9] =
    [0x21, 0x00, 0x49, 0x90, 0x02, 0x19, 0x00, 0x23, 0x80];

const DUMMY_AUDIO_SAMPLE_RATE: u64 = 44100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DummyAudioStage {
    /// Waiting for audio after the first video message
    Analysis,
    /// The stream has its own audio
    Normal,
    /// Synthesising silence
    Dummy,
}

/// Inserts a silent AAC track when a stream carries no audio.
///
/// After the first video message, messages are held for up to
/// `wait_audio_ms` of stream time. If audio shows up they are released
/// unchanged; otherwise an AAC sequence header is emitted and silent
/// frames are interleaved with the video timeline from then on.
pub struct DummyAudioFilter {
    wait_audio_ms: u32,
    stage: DummyAudioStage,

    first_video_ts: Option<u32>,
    early: Vec<AvMsg>,

    base_ts: u32,
    frames: u64,
}

impl DummyAudioFilter {
    pub fn new(wait_audio_ms: u32) -> DummyAudioFilter {
        DummyAudioFilter {
            wait_audio_ms,
            stage: DummyAudioStage::Analysis,
            first_video_ts: None,
            early: Vec::new(),
            base_ts: 0,
            frames: 0,
        }
    }

    /// True once silence is being synthesised
    pub fn is_synthesising(&self) -> bool {
        self.stage == DummyAudioStage::Dummy
    }

    /// Feeds a message, returning the messages to forward, in order
    pub fn feed(&mut self, msg: AvMsg) -> Vec<AvMsg> {
        match self.stage {
            DummyAudioStage::Normal => vec![msg],
            DummyAudioStage::Analysis => self.feed_analysis(msg),
            DummyAudioStage::Dummy => {
                let mut out = Vec::new();
                self.push_dummy(msg, &mut out);
                out
            }
        }
    }

    fn feed_analysis(&mut self, msg: AvMsg) -> Vec<AvMsg> {
        if msg.is_audio() {
            self.stage = DummyAudioStage::Normal;

            let mut out: Vec<AvMsg> = self.early.drain(..).collect();
            out.push(msg);
            return out;
        }

        if !msg.is_video() {
            if self.first_video_ts.is_none() {
                return vec![msg];
            }

            self.early.push(msg);
            return Vec::new();
        }

        let first = *self.first_video_ts.get_or_insert(msg.header.timestamp_abs);
        let elapsed = msg.header.timestamp_abs.saturating_sub(first);

        self.early.push(msg);

        if elapsed < self.wait_audio_ms {
            return Vec::new();
        }

        self.stage = DummyAudioStage::Dummy;
        self.base_ts = first;

        let mut out = Vec::with_capacity(self.early.len() * 2 + 1);

        out.push(AvMsg::new_media(
            RTMP_TYPE_AUDIO,
            first,
            make_aac_payload(0, &DUMMY_AUDIO_ASC),
        ));

        let early: Vec<AvMsg> = self.early.drain(..).collect();

        for m in early {
            self.push_dummy(m, &mut out);
        }

        out
    }

    fn frame_ts(&self, n: u64) -> u32 {
        let offset = n * AAC_SAMPLES_PER_FRAME as u64 * 1000 / DUMMY_AUDIO_SAMPLE_RATE;
        self.base_ts.wrapping_add(offset as u32)
    }

    fn push_dummy(&mut self, msg: AvMsg, out: &mut Vec<AvMsg>) {
        if msg.is_audio() {
            // Late audio would compete with the synthesised track
            return;
        }

        if msg.is_video() {
            while self.frame_ts(self.frames) <= msg.header.timestamp_abs {
                out.push(AvMsg::new_media(
                    RTMP_TYPE_AUDIO,
                    self.frame_ts(self.frames),
                    make_aac_payload(1, &DUMMY_AUDIO_SILENT_FRAME),
                ));
                self.frames += 1;
            }
        }

        out.push(msg);
    }
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        base::VIDEO_CODEC_ID_AVC,
        remux::make_video_payload,
        rtmp::{RTMP_TYPE_DATA, RTMP_TYPE_VIDEO},
    };
    use bytes::Bytes;

    fn dummy_audio_frame_payload() -> Bytes {
        make_aac_payload(1, &DUMMY_AUDIO_SILENT_FRAME)
    }

    fn video(ts: u32) -> AvMsg {
        AvMsg::new_media(
            RTMP_TYPE_VIDEO,
            ts,
            make_video_payload(VIDEO_CODEC_ID_AVC, false, 1, 0, &[0, 0, 0, 1, 0x41]),
        )
    }

    #[test]
    fn test_dummy_audio_passthrough_when_audio_arrives() {
        let mut filter = DummyAudioFilter::new(1000);

        let meta = AvMsg::new_media(RTMP_TYPE_DATA, 0, Bytes::from_static(&[2, 0, 0]));
        assert_eq!(filter.feed(meta).len(), 1);

        assert!(filter.feed(video(0)).is_empty());
        assert!(filter.feed(video(40)).is_empty());

        let audio = AvMsg::new_media(RTMP_TYPE_AUDIO, 50, make_aac_payload(0, &[0x12, 0x10]));
        let out = filter.feed(audio);

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].header.timestamp_abs, 0);
        assert!(out[2].is_aac_seq_header());

        assert_eq!(filter.feed(video(80)).len(), 1);
        assert!(!filter.is_synthesising());
    }

    #[test]
    fn test_dummy_audio_synthesises_silence() {
        let mut filter = DummyAudioFilter::new(100);

        assert!(filter.feed(video(1000)).is_empty());
        assert!(filter.feed(video(1040)).is_empty());

        let out = filter.feed(video(1100));
        assert!(filter.is_synthesising());

        // Seq header, then silent frames aligned to the video timeline
        assert!(out[0].is_aac_seq_header());
        assert_eq!(out[0].header.timestamp_abs, 1000);
        assert_eq!(out[1].payload, dummy_audio_frame_payload());
        assert_eq!(out[1].header.timestamp_abs, 1000);
        assert!(out[2].is_video());

        let audio_ts: Vec<u32> = out
            .iter()
            .filter(|m| m.is_audio() && !m.is_aac_seq_header())
            .map(|m| m.header.timestamp_abs)
            .collect();
        assert_eq!(audio_ts, vec![1000, 1023, 1046, 1069, 1092]);

        // Video order and count preserved
        let video_ts: Vec<u32> = out
            .iter()
            .filter(|m| m.is_video())
            .map(|m| m.header.timestamp_abs)
            .collect();
        assert_eq!(video_ts, vec![1000, 1040, 1100]);

        // Real audio after the decision is dropped
        let late = AvMsg::new_media(RTMP_TYPE_AUDIO, 1200, make_aac_payload(1, &[1]));
        assert!(filter.feed(late).is_empty());
    }
}
