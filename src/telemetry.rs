//! Outbound telemetry publishing.
//!
//! All three outbound flavors (live data, recorded data, device-initiated
//! actions) share the same path: stamp the effective device id into the
//! envelope, encode, publish. Sends are fire-and-forget; a failed publish
//! is logged and the reading is dropped, the next tick brings fresh data.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tracing::warn;

use crate::codec;
use crate::identity::StatePortal;
use crate::session::{DEST_ACTION, DEST_DATA, DEST_LIVE};
use crate::transport::PubSubLink;

pub struct TelemetryPublisher {
    link: Arc<dyn PubSubLink>,
    portal: StatePortal,
    // latest live payload, fanned out to local observers (UI, logs)
    live_tx: watch::Sender<Value>,
}

impl TelemetryPublisher {
    pub fn new(link: Arc<dyn PubSubLink>, portal: StatePortal) -> Self {
        let (live_tx, _) = watch::channel(Value::Null);
        Self {
            link,
            portal,
            live_tx,
        }
    }

    /// Publishes a live reading and mirrors it to local watchers.
    pub async fn send_live(&self, doc: &Value) {
        self.live_tx.send_replace(doc.clone());
        self.publish(DEST_LIVE, doc).await;
    }

    /// Publishes a reading for backend persistence.
    pub async fn send_data(&self, doc: &Value) {
        self.publish(DEST_DATA, doc).await;
    }

    /// Publishes a device-initiated action.
    pub async fn send_action(&self, doc: &Value) {
        self.publish(DEST_ACTION, doc).await;
    }

    /// Observes the most recent live payload without touching the link.
    pub fn watch_live(&self) -> watch::Receiver<Value> {
        self.live_tx.subscribe()
    }

    async fn publish(&self, destination: &str, doc: &Value) {
        let id = self.portal.effective_id().await;
        let body = codec::encode(doc, &id);
        if let Err(e) = self.link.send(destination, &body).await {
            warn!("Publish to '{}' failed, dropping payload: {}", destination, e);
            return;
        }
        self.portal.note_sent().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AckCode, LinkError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    struct TestLink {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl TestLink {
        fn new(fail: bool) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl PubSubLink for TestLink {
        async fn open(&self) -> Result<(), LinkError> {
            Ok(())
        }
        async fn is_open(&self) -> bool {
            true
        }
        async fn subscribe(&self, _topic: &str) -> Result<(), LinkError> {
            Ok(())
        }
        async fn send(&self, destination: &str, body: &str) -> Result<(), LinkError> {
            if self.fail {
                return Err(LinkError::Transport("socket gone".into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((destination.to_string(), body.to_string()));
            Ok(())
        }
        async fn ack(&self, _frame_id: u64, _code: AckCode) -> Result<(), LinkError> {
            Ok(())
        }
        async fn close(&self) {}
    }

    fn publisher(fail: bool) -> (TelemetryPublisher, Arc<TestLink>, StatePortal) {
        let link = Arc::new(TestLink::new(fail));
        let portal = StatePortal::new("dev".into(), Duration::from_millis(9000));
        let publisher = TelemetryPublisher::new(link.clone(), portal.clone());
        (publisher, link, portal)
    }

    #[tokio::test]
    async fn live_send_stamps_id_and_counts() {
        let (publisher, link, portal) = publisher(false);
        portal.adopt_assigned_id("8".into()).await;

        publisher.send_live(&json!({"temp": 21.5})).await;

        let sent = link.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, DEST_LIVE);
        let decoded = codec::decode(&sent[0].1);
        assert_eq!(decoded["device_id"], "8");
        assert_eq!(decoded["temp"], 21.5);
        assert_eq!(portal.stats().await.messages_sent, 1);
    }

    #[tokio::test]
    async fn destinations_route_per_flavor() {
        let (publisher, link, _) = publisher(false);

        publisher.send_data(&json!({"temp": 1})).await;
        publisher.send_action(&json!({"valve": "open"})).await;

        let sent = link.sent.lock().unwrap().clone();
        assert_eq!(sent[0].0, DEST_DATA);
        assert_eq!(sent[1].0, DEST_ACTION);
    }

    #[tokio::test]
    async fn failed_publish_is_dropped_silently() {
        let (publisher, _, portal) = publisher(true);

        publisher.send_live(&json!({"temp": 1})).await;

        assert_eq!(portal.stats().await.messages_sent, 0);
        // the local mirror still observes the payload
        assert_eq!(*publisher.watch_live().borrow(), json!({"temp": 1}));
    }

    #[tokio::test]
    async fn watchers_see_latest_live_payload() {
        let (publisher, _, _) = publisher(false);
        let rx = publisher.watch_live();

        publisher.send_live(&json!({"n": 1})).await;
        publisher.send_live(&json!({"n": 2})).await;

        assert_eq!(*rx.borrow(), json!({"n": 2}));
    }
}
