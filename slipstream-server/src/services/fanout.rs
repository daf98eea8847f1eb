use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use metrics::counter;
use serde::Serialize;
use shared::models::Channel;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tracing::{trace, warn};

/// A live feed of serialized events published on one channel.
pub type Subscription = BoxStream<'static, Arc<str>>;

/// Best-effort pub/sub keyed by [`Channel`].
///
/// Delivery is at-most-once: nothing is buffered for channels without
/// subscribers and slow subscribers lose the oldest events.
#[async_trait]
pub trait FanoutChannel: Send + Sync {
    /// Publishes a serialized payload and returns how many subscribers saw it.
    async fn publish_raw(&self, channel: &Channel, payload: Arc<str>) -> usize;

    fn subscribe(&self, channel: &Channel) -> Subscription;
}

impl<'a> dyn FanoutChannel + 'a {
    /// Serializes and publishes one event. Serialization failures are logged.
    pub async fn publish<T>(&self, channel: &Channel, event: &T) -> usize
    where
        T: Serialize + ?Sized,
    {
        match serde_json::to_string(event) {
            Ok(payload) => self.publish_raw(channel, Arc::from(payload)).await,
            Err(err) => {
                warn!(channel = %channel, error = %err, "dropping unserializable fanout event");
                0
            }
        }
    }
}

/// In-process hub backed by one `tokio::sync::broadcast` channel per topic.
pub struct FanoutHub {
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<Arc<str>>>>,
}

impl std::fmt::Debug for FanoutHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutHub")
            .field("capacity", &self.capacity)
            .field("topics", &self.topic_count())
            .finish()
    }
}

impl FanoutHub {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Number of topics that currently have a sender registered.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.lock().map_or(0, |topics| topics.len())
    }
}

#[async_trait]
impl FanoutChannel for FanoutHub {
    async fn publish_raw(&self, channel: &Channel, payload: Arc<str>) -> usize {
        let name = channel.name();
        let Ok(mut topics) = self.topics.lock() else {
            warn!(channel = %name, "fanout registry poisoned");
            return 0;
        };

        let Some(sender) = topics.get(&name) else {
            trace!(channel = %name, "no subscribers for fanout event");
            return 0;
        };

        if let Ok(receivers) = sender.send(payload) {
            receivers
        } else {
            // Every subscriber went away; forget the topic.
            topics.remove(&name);
            0
        }
    }

    fn subscribe(&self, channel: &Channel) -> Subscription {
        let name = channel.name();
        let receiver = match self.topics.lock() {
            Ok(mut topics) => topics
                .entry(name.clone())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe(),
            Err(_) => {
                warn!(channel = %name, "fanout registry poisoned; subscription is empty");
                return futures::stream::empty().boxed();
            }
        };

        BroadcastStream::new(receiver)
            .filter_map(move |item| {
                let name = name.clone();
                async move {
                    match item {
                        Ok(payload) => Some(payload),
                        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                            counter!("slipstream_fanout_lagged_total").increment(skipped);
                            warn!(channel = %name, skipped, "fanout subscriber lagged");
                            None
                        }
                    }
                }
            })
            .boxed()
    }
}
