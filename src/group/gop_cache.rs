// GOP cache for late subscribers

use std::collections::VecDeque;

use bytes::Bytes;

use crate::base::AvMsg;

/// Cached sequence header, in one output format
struct CachedSeqHeader<T> {
    timestamp: u32,
    item: T,

    // Source payload, to detect replacements
    raw: Bytes,
}

/// Recent stream state, in one output format.
///
/// Holds the metadata, the sequence headers and up to `gop_num`
/// groups of pictures. A GOP always starts with a video keyframe
/// and is only started once a video sequence header is known.
/// A sequence header replaced by a different one invalidates
/// every cached GOP.
pub struct GopCache<T> {
    gop_num: usize,

    metadata: Option<T>,
    video_seq_header: Option<CachedSeqHeader<T>>,
    audio_seq_header: Option<CachedSeqHeader<T>>,

    gops: VecDeque<Vec<T>>,
}

impl<T: Clone> GopCache<T> {
    /// Creates a cache
    ///
    /// # Arguments
    ///
    /// * `gop_num` - Max number of GOPs. With 0 only headers are kept.
    pub fn new(gop_num: usize) -> GopCache<T> {
        GopCache {
            gop_num,
            metadata: None,
            video_seq_header: None,
            audio_seq_header: None,
            gops: VecDeque::with_capacity(gop_num + 1),
        }
    }

    /// Feeds a message
    ///
    /// # Arguments
    ///
    /// * `msg` - Message, used to classify the item
    /// * `lazy_item` - Produces the message in the cache format.
    ///   Not called if the message is not kept.
    pub fn feed<F: FnOnce() -> T>(&mut self, msg: &AvMsg, lazy_item: F) {
        if msg.is_metadata() {
            self.metadata = Some(lazy_item());
            return;
        }

        if msg.is_video_key_seq_header() {
            if changed(&self.video_seq_header, msg) {
                self.gops.clear();
            }

            self.video_seq_header = Some(CachedSeqHeader {
                timestamp: msg.header.timestamp_abs,
                item: lazy_item(),
                raw: msg.payload.clone(),
            });
            return;
        }

        if msg.is_aac_seq_header() {
            if changed(&self.audio_seq_header, msg) {
                self.gops.clear();
            }

            self.audio_seq_header = Some(CachedSeqHeader {
                timestamp: msg.header.timestamp_abs,
                item: lazy_item(),
                raw: msg.payload.clone(),
            });
            return;
        }

        if !msg.is_audio() && !msg.is_video() {
            return;
        }

        if self.gop_num == 0 {
            return;
        }

        if msg.is_video_key_frame() {
            if self.video_seq_header.is_none() {
                return;
            }

            while self.gops.len() >= self.gop_num {
                self.gops.pop_front();
            }

            self.gops.push_back(vec![lazy_item()]);
            return;
        }

        if let Some(gop) = self.gops.back_mut() {
            gop.push(lazy_item());
        }
    }

    /// Replays the cache: metadata, sequence headers ordered by
    /// timestamp, then the GOPs from oldest to newest
    pub fn send_cache<F: FnMut(&T)>(&self, mut write: F) {
        if let Some(m) = &self.metadata {
            write(m);
        }

        let mut headers: Vec<&CachedSeqHeader<T>> = self
            .video_seq_header
            .iter()
            .chain(self.audio_seq_header.iter())
            .collect();

        // Stable: video first on equal timestamps
        headers.sort_by_key(|h| h.timestamp);

        for h in headers {
            write(&h.item);
        }

        for gop in &self.gops {
            for item in gop {
                write(item);
            }
        }
    }

    /// Empties every slot
    pub fn clear(&mut self) {
        self.metadata = None;
        self.video_seq_header = None;
        self.audio_seq_header = None;
        self.gops.clear();
    }

    pub fn gop_count(&self) -> usize {
        self.gops.len()
    }

    pub fn has_video_seq_header(&self) -> bool {
        self.video_seq_header.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_none()
            && self.video_seq_header.is_none()
            && self.audio_seq_header.is_none()
            && self.gops.is_empty()
    }
}

fn changed<T>(slot: &Option<CachedSeqHeader<T>>, msg: &AvMsg) -> bool {
    match slot {
        Some(h) => h.raw != msg.payload,
        None => false,
    }
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        base::VIDEO_CODEC_ID_AVC,
        remux::{make_aac_payload, make_video_payload},
        rtmp::{RTMP_TYPE_AUDIO, RTMP_TYPE_DATA, RTMP_TYPE_VIDEO},
    };

    fn video_header(ts: u32, record: &[u8]) -> AvMsg {
        AvMsg::new_media(
            RTMP_TYPE_VIDEO,
            ts,
            make_video_payload(VIDEO_CODEC_ID_AVC, true, 0, 0, record),
        )
    }

    fn audio_header(ts: u32) -> AvMsg {
        AvMsg::new_media(RTMP_TYPE_AUDIO, ts, make_aac_payload(0, &[0x12, 0x10]))
    }

    fn frame(ts: u32, key: bool) -> AvMsg {
        AvMsg::new_media(
            RTMP_TYPE_VIDEO,
            ts,
            make_video_payload(VIDEO_CODEC_ID_AVC, key, 1, 0, &[0, 0, 0, 1, 0x65]),
        )
    }

    fn audio(ts: u32) -> AvMsg {
        AvMsg::new_media(RTMP_TYPE_AUDIO, ts, make_aac_payload(1, &[0x21]))
    }

    fn meta() -> AvMsg {
        AvMsg::new_media(RTMP_TYPE_DATA, 0, Bytes::from_static(&[2, 0, 0]))
    }

    /// Feeds a message, using its timestamp as the cached item
    fn feed(cache: &mut GopCache<u32>, msg: &AvMsg) {
        let ts = msg.header.timestamp_abs;
        cache.feed(msg, || ts);
    }

    fn replay(cache: &GopCache<u32>) -> Vec<u32> {
        let mut out = Vec::new();
        cache.send_cache(|item| out.push(*item));
        out
    }

    #[test]
    fn test_gop_cache_replay_order() {
        let mut cache: GopCache<u32> = GopCache::new(2);

        feed(&mut cache, &audio_header(1));
        feed(&mut cache, &meta());
        feed(&mut cache, &video_header(2, &[1, 2, 3]));

        // Frames before the first keyframe are not kept
        feed(&mut cache, &frame(10, false));

        feed(&mut cache, &frame(20, true));
        feed(&mut cache, &audio(21));
        feed(&mut cache, &frame(22, false));
        feed(&mut cache, &frame(30, true));
        feed(&mut cache, &audio(31));

        assert_eq!(cache.gop_count(), 2);

        // Metadata, headers by timestamp, GOPs oldest first
        assert_eq!(replay(&cache), vec![0, 1, 2, 20, 21, 22, 30, 31]);
    }

    #[test]
    fn test_gop_cache_bounded() {
        let mut cache: GopCache<u32> = GopCache::new(1);

        feed(&mut cache, &video_header(0, &[1]));

        for i in 0..5 {
            feed(&mut cache, &frame(100 * i, true));
            feed(&mut cache, &frame(100 * i + 40, false));
            assert_eq!(cache.gop_count(), 1);
        }

        assert_eq!(replay(&cache), vec![0, 400, 440]);
    }

    #[test]
    fn test_gop_cache_zero_keeps_headers() {
        let mut cache: GopCache<u32> = GopCache::new(0);

        feed(&mut cache, &meta());
        feed(&mut cache, &video_header(5, &[1]));
        feed(&mut cache, &audio_header(6));
        feed(&mut cache, &frame(10, true));
        feed(&mut cache, &audio(11));

        assert_eq!(cache.gop_count(), 0);
        assert_eq!(replay(&cache), vec![0, 5, 6]);
    }

    #[test]
    fn test_gop_cache_no_gop_without_video_header() {
        let mut cache: GopCache<u32> = GopCache::new(3);

        feed(&mut cache, &frame(10, true));
        feed(&mut cache, &frame(20, false));

        assert_eq!(cache.gop_count(), 0);
        assert!(!cache.has_video_seq_header());
    }

    #[test]
    fn test_gop_cache_seq_header_replacement() {
        let mut cache: GopCache<u32> = GopCache::new(2);

        feed(&mut cache, &video_header(0, &[1, 2]));
        feed(&mut cache, &frame(10, true));

        // Same header again keeps the GOPs
        feed(&mut cache, &video_header(15, &[1, 2]));
        assert_eq!(cache.gop_count(), 1);

        // Different header drops them
        feed(&mut cache, &video_header(20, &[9, 9]));
        assert_eq!(cache.gop_count(), 0);
        assert_eq!(replay(&cache), vec![20]);

        feed(&mut cache, &frame(30, true));
        assert_eq!(replay(&cache), vec![20, 30]);

        cache.clear();
        assert!(cache.is_empty());
        assert!(replay(&cache).is_empty());
    }
}
