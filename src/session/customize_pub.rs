// In-process publisher

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::{
    base::{AvMsg, PubSubInfo, StreamError, StreamResult},
    group::Group,
    remux::{FlvTag, FlvTagReader},
};

use super::{SessionHandle, SessionProtocol};

/// Publisher fed by the embedding application instead of a socket
///
/// Created through the server manager. Media is pushed with
/// `feed_av_msg`, `feed_flv_tag` or `feed_flv_bytes`, and the
/// session leaves the group with `dispose`.
pub struct CustomizePubSession {
    handle: Arc<SessionHandle>,
    group: Arc<Group>,

    // Reader for raw FLV input, the 13-byte file header is skipped
    flv_reader: Mutex<FlvTagReader>,
}

impl CustomizePubSession {
    /// Adds a customize publisher to a group
    ///
    /// # Arguments
    ///
    /// * `group` - Target group
    /// * `handle` - Handle for the new session
    ///
    /// # Return value
    ///
    /// Returns `DupPublisher` if the group already has an input
    pub async fn start(
        group: Arc<Group>,
        handle: Arc<SessionHandle>,
    ) -> StreamResult<CustomizePubSession> {
        let info = PubSubInfo {
            session_id: handle.id(),
            protocol: SessionProtocol::CustomizePub.as_str().to_string(),
            app_name: group.app_name().to_string(),
            stream_name: group.stream_name().to_string(),
            raw_query: "".to_string(),
            remote_addr: "".to_string(),
        };

        group.add_customize_pub(handle.clone(), info).await?;

        Ok(CustomizePubSession {
            handle,
            group,
            flv_reader: Mutex::new(FlvTagReader::new()),
        })
    }

    pub fn session_id(&self) -> u64 {
        self.handle.id()
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    pub fn is_disposed(&self) -> bool {
        self.handle.is_disposed()
    }

    /// Feeds an audio, video or metadata message
    pub async fn feed_av_msg(&self, msg: AvMsg) -> StreamResult<()> {
        if self.handle.is_disposed() {
            return Err(StreamError::closed());
        }

        self.handle.add_read_bytes(msg.payload.len());
        self.group.on_av_msg(self.handle.id(), msg).await;

        Ok(())
    }

    /// Feeds a parsed FLV tag
    pub async fn feed_flv_tag(&self, tag: FlvTag) -> StreamResult<()> {
        self.feed_av_msg(tag.into_av_msg()).await
    }

    /// Feeds a piece of an FLV byte stream
    ///
    /// The data may be split at any position.
    pub async fn feed_flv_bytes(&self, data: &[u8]) -> StreamResult<()> {
        let tags = {
            let mut reader = self.flv_reader.lock().await;
            reader.feed(data)?
        };

        for tag in tags {
            self.feed_flv_tag(tag).await?;
        }

        Ok(())
    }

    /// Leaves the group. Further feeds fail.
    pub async fn dispose(&self) {
        if self.handle.dispose() {
            self.group.del_pub(self.handle.id()).await;
        }
    }
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        base::{ManualClock, VIDEO_CODEC_ID_AVC},
        codec::{avc_test_util::make_avc_sps, AvcDecoderConfig},
        group::{GroupConfiguration, GroupContext},
        callback::NoopObserver,
        log::Logger,
        remux::{av_msg_to_flv_tag, flv_file_header, make_video_payload},
        rtmp::RTMP_TYPE_VIDEO,
        server::SessionIdGenerator,
    };

    fn make_group() -> Arc<Group> {
        let clock = Arc::new(ManualClock::new(1000));

        Arc::new(Group::new(
            &Logger::new_disabled(),
            "live",
            "custom",
            GroupContext {
                config: Arc::new(GroupConfiguration::default()),
                observer: Arc::new(NoopObserver),
                clock,
                session_id_generator: Arc::new(SessionIdGenerator::new()),
            },
        ))
    }

    fn make_handle(group: &Group, id: u64) -> Arc<SessionHandle> {
        Arc::new(SessionHandle::new(id, SessionProtocol::CustomizePub, "", group.clock().clone()))
    }

    #[tokio::test]
    async fn test_customize_pub_feeds_group() {
        let group = make_group();

        let session = CustomizePubSession::start(group.clone(), make_handle(&group, 1))
            .await
            .unwrap();

        assert!(group.has_input().await);

        let dup = CustomizePubSession::start(group.clone(), make_handle(&group, 2)).await;
        assert!(matches!(dup, Err(StreamError::DupPublisher(_))));

        let record = AvcDecoderConfig::build(&make_avc_sps(80, 45, 0), &[0x68, 0xce, 0x3c, 0x80]);
        let seq = AvMsg::new_media(
            RTMP_TYPE_VIDEO,
            0,
            make_video_payload(VIDEO_CODEC_ID_AVC, true, 0, 0, &record),
        );

        // File header and tag split across feeds
        let mut data = flv_file_header(true, false).to_vec();
        data.extend_from_slice(&av_msg_to_flv_tag(&seq).encode());

        let (a, b) = data.split_at(20);
        session.feed_flv_bytes(a).await.unwrap();
        session.feed_flv_bytes(b).await.unwrap();

        let stat = group.stat().await;
        assert_eq!(stat.video_codec, "H264");
        assert_eq!(stat.video_width, 1280);

        session.dispose().await;

        assert!(!group.has_input().await);
        assert!(session.feed_av_msg(seq).await.is_err());
    }
}
