//! The EventBus: a process-scoped pub/sub channel for control-plane
//! messages, independent of the chunk graph (spec §4.7). Stages may hold a
//! clone to publish NOTIFY/DASHBOARD events; the control-plane server and
//! the optional OSC mirror both subscribe.

use tokio::sync::broadcast;

use crate::control::message::ControlMessage;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ControlMessage>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, message: ControlMessage) {
        // No subscribers is not an error: plenty of runs have no control
        // plane attached at all.
        let _ = self.tx.send(message);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlMessage> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn published_messages_reach_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(ControlMessage::notify("vad1", vec![json!("speech_start")]));
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, ControlMessage::Notify { node, .. } if node == "vad1"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(ControlMessage::dashboard("meter", "x", "final", json!(1)));
    }
}
