use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::events::{ChangeEvent, WireMessage, EVENT_NOTES_CHANGED};

pub type ChannelId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelClosed;

impl std::fmt::Display for ChannelClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel closed")
    }
}
impl std::error::Error for ChannelClosed {}

/// One connected client's outbound half. The hub only ever pushes text
/// frames at it; a failed send means the client is gone.
#[async_trait]
pub trait ClientChannel: Send + Sync + 'static {
    async fn send_text(&self, text: &str) -> Result<(), ChannelClosed>;
}

/// Process-wide fan-out point for Change Events.
///
/// Pure relay: no deduplication, no ordering across channels, no payload
/// validation, no retry, no persistence. A client that is disconnected when
/// an event fires simply misses it and catches up via reconnect-resync or
/// polling. Injectable so tests can register fake channels.
pub struct BroadcastHub {
    next_id: AtomicU64,
    channels: Mutex<HashMap<ChannelId, Arc<dyn ClientChannel>>>,
}

impl BroadcastHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            channels: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(&self, channel: Arc<dyn ClientChannel>) -> ChannelId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.channels.lock().unwrap().insert(id, channel);
        debug!(channel = id, "hub: channel registered");
        id
    }

    pub fn unregister(&self, id: ChannelId) {
        if self.channels.lock().unwrap().remove(&id).is_some() {
            debug!(channel = id, "hub: channel unregistered");
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    /// Deliver a Change Event to every live channel, at most once each,
    /// fire-and-forget. Channels whose send fails are dropped.
    pub async fn publish(&self, event: &ChangeEvent) {
        let text = event.to_wire().to_json();
        self.fan_out(&text, None).await;
    }

    /// Rebroadcast a client-submitted "I changed something" signal to every
    /// other channel as `notes:changed`. The originator already has local
    /// state from its own write and is skipped.
    pub async fn relay_from(&self, origin: ChannelId, payload: serde_json::Value) {
        let text = WireMessage {
            event: EVENT_NOTES_CHANGED.to_string(),
            payload,
        }
        .to_json();
        self.fan_out(&text, Some(origin)).await;
    }

    async fn fan_out(&self, text: &str, skip: Option<ChannelId>) {
        // Snapshot under the lock, send outside it.
        let targets: Vec<(ChannelId, Arc<dyn ClientChannel>)> = {
            let g = self.channels.lock().unwrap();
            g.iter()
                .filter(|(id, _)| Some(**id) != skip)
                .map(|(id, ch)| (*id, ch.clone()))
                .collect()
        };
        for (id, ch) in targets {
            if ch.send_text(text).await.is_err() {
                warn!(channel = id, "hub: send failed, dropping channel");
                self.unregister(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_id::RecordId;
    use tokio::sync::Mutex as AsyncMutex;

    struct Sink {
        texts: AsyncMutex<Vec<String>>,
        fail: bool,
    }

    impl Sink {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                texts: AsyncMutex::new(Vec::new()),
                fail,
            })
        }
        async fn received(&self) -> Vec<String> {
            self.texts.lock().await.clone()
        }
    }

    #[async_trait]
    impl ClientChannel for Sink {
        async fn send_text(&self, text: &str) -> Result<(), ChannelClosed> {
            if self.fail {
                return Err(ChannelClosed);
            }
            self.texts.lock().await.push(text.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn publish_reaches_every_channel() {
        let hub = BroadcastHub::new();
        let a = Sink::new(false);
        let b = Sink::new(false);
        hub.register(a.clone());
        hub.register(b.clone());

        hub.publish(&ChangeEvent::note_soft_deleted(RecordId::new()))
            .await;

        assert_eq!(a.received().await.len(), 1);
        assert_eq!(b.received().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_channel_is_dropped_and_others_still_receive() {
        let hub = BroadcastHub::new();
        let dead = Sink::new(true);
        let live = Sink::new(false);
        hub.register(dead);
        hub.register(live.clone());
        assert_eq!(hub.channel_count(), 2);

        hub.publish(&ChangeEvent::note_soft_deleted(RecordId::new()))
            .await;

        assert_eq!(hub.channel_count(), 1);
        assert_eq!(live.received().await.len(), 1);

        // Next publish only hits the survivor.
        hub.publish(&ChangeEvent::note_soft_deleted(RecordId::new()))
            .await;
        assert_eq!(live.received().await.len(), 2);
    }

    #[tokio::test]
    async fn relay_skips_the_originator() {
        let hub = BroadcastHub::new();
        let origin = Sink::new(false);
        let other = Sink::new(false);
        let origin_id = hub.register(origin.clone());
        hub.register(other.clone());

        hub.relay_from(origin_id, serde_json::json!({ "type": "client" }))
            .await;

        assert!(origin.received().await.is_empty());
        let got = other.received().await;
        assert_eq!(got.len(), 1);
        let msg: WireMessage = serde_json::from_str(&got[0]).unwrap();
        assert_eq!(msg.event, EVENT_NOTES_CHANGED);
        assert_eq!(msg.payload["type"], "client");
    }

    #[tokio::test]
    async fn unregistered_channel_no_longer_receives() {
        let hub = BroadcastHub::new();
        let a = Sink::new(false);
        let id = hub.register(a.clone());
        hub.unregister(id);

        hub.publish(&ChangeEvent::note_soft_deleted(RecordId::new()))
            .await;
        assert!(a.received().await.is_empty());
        assert_eq!(hub.channel_count(), 0);
    }
}
