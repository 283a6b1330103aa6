// Group outputs and the per-set fan-out

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    base::{AvMsg, PubSubInfo, StreamError, StreamResult},
    remux::rtp::RtpPacket,
    session::SessionHandle,
};

use super::{BackpressurePolicy, GopCache};

/// RTP packets produced for one message
pub type RtpBatch = Arc<Vec<RtpPacket>>;

/// Item carried by a subscriber channel
pub trait OutputPayload: Clone + Send + Sync + 'static {
    fn is_empty_payload(&self) -> bool;
}

impl OutputPayload for Bytes {
    fn is_empty_payload(&self) -> bool {
        self.is_empty()
    }
}

impl OutputPayload for RtpBatch {
    fn is_empty_payload(&self) -> bool {
        self.is_empty()
    }
}

/// Subscriber of one output format
pub struct Subscriber<T> {
    pub handle: Arc<SessionHandle>,
    pub info: PubSubInfo,
    pub sender: mpsc::Sender<T>,

    /// The cache was not replayed yet
    pub is_fresh: bool,

    /// Video is held back until a keyframe
    pub should_wait_video_key_frame: bool,
}

impl<T: OutputPayload> Subscriber<T> {
    pub fn new(handle: Arc<SessionHandle>, info: PubSubInfo, sender: mpsc::Sender<T>) -> Self {
        Subscriber {
            handle,
            info,
            sender,
            is_fresh: true,
            should_wait_video_key_frame: true,
        }
    }

    /// Queues an item on the subscriber channel
    pub async fn deliver(&self, item: T, policy: BackpressurePolicy) -> StreamResult<()> {
        match policy {
            BackpressurePolicy::Drop => self.sender.try_send(item).map_err(|e| match e {
                TrySendError::Full(_) => StreamError::SubscriberBackpressure,
                TrySendError::Closed(_) => StreamError::closed(),
            }),
            BackpressurePolicy::Block => self
                .sender
                .send(item)
                .await
                .map_err(|_| StreamError::closed()),
        }
    }
}

/// Subscriber removed from a set by the fan-out
pub struct DroppedSubscriber {
    pub handle: Arc<SessionHandle>,
    pub info: PubSubInfo,
    pub error: StreamError,
}

/// Delivers a message to every subscriber of one set
///
/// Fresh subscribers get the preamble and the cache replay first.
/// Subscribers waiting for a keyframe get no audio or coded video
/// until one arrives. Subscribers that fail are removed from the set.
///
/// # Arguments
///
/// * `subs` - Subscriber set
/// * `cache` - Cache of the set format
/// * `preamble` - Sent to fresh subscribers before the cache
/// * `msg` - Message being fanned out
/// * `make_item` - Produces the message in the set format
/// * `policy` - Backpressure policy
/// * `dropped` - Receives the removed subscribers
pub async fn fan_out<T, F>(
    subs: &mut Vec<Subscriber<T>>,
    cache: &GopCache<T>,
    preamble: Option<T>,
    msg: &AvMsg,
    make_item: &mut F,
    policy: BackpressurePolicy,
    dropped: &mut Vec<DroppedSubscriber>,
) where
    T: OutputPayload,
    F: FnMut() -> T,
{
    let mut failed: Vec<(usize, StreamError)> = Vec::new();

    for (index, sub) in subs.iter_mut().enumerate() {
        if sub.is_fresh {
            sub.is_fresh = false;

            let mut replay: Vec<T> = Vec::new();

            if let Some(p) = &preamble {
                replay.push(p.clone());
            }

            cache.send_cache(|item| replay.push(item.clone()));

            if cache.gop_count() > 0 {
                // The replay ends with a GOP this message continues
                sub.should_wait_video_key_frame = false;
            }

            let mut replay_error = None;

            for item in replay {
                if item.is_empty_payload() {
                    continue;
                }

                if let Err(e) = sub.deliver(item, policy).await {
                    replay_error = Some(e);
                    break;
                }
            }

            if let Some(e) = replay_error {
                failed.push((index, e));
                continue;
            }
        }

        if sub.should_wait_video_key_frame {
            if msg.is_video_key_frame() {
                sub.should_wait_video_key_frame = false;
            } else if !msg.is_metadata() && !msg.is_seq_header() {
                continue;
            }
        }

        let item = make_item();

        if item.is_empty_payload() {
            continue;
        }

        if let Err(e) = sub.deliver(item, policy).await {
            failed.push((index, e));
        }
    }

    for (index, error) in failed.into_iter().rev() {
        let sub = subs.remove(index);

        dropped.push(DroppedSubscriber {
            handle: sub.handle,
            info: sub.info,
            error,
        });
    }
}
