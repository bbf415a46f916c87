//! Pub/sub session lifecycle and inbound frame dispatch.
//!
//! A session subscribes the device's two topics (config updates and action
//! commands) in client-acknowledgement mode. Inbound frames are drained on
//! the cooperative tick via [`SessionManager::pump`]; every frame gets
//! exactly one acknowledgement after its handler ran.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::codec;
use crate::identity::{SessionState, StatePortal};
use crate::router::ActionRouter;
use crate::store::DeviceStore;
use crate::transport::{AckCode, InboundFrame, LinkError, LinkEvent, PubSubLink};

pub const DEST_LIVE: &str = "/app/sendLiveData";
pub const DEST_DATA: &str = "/app/sendData";
pub const DEST_ACTION: &str = "/app/action";
pub const DEST_ACK: &str = "/app/ackAction";

const UPDATE_TOPIC_PREFIX: &str = "/topic/update/";
const ACTION_TOPIC_PREFIX: &str = "/topic/action/";

pub fn update_topic(device_id: &str) -> String {
    format!("{}{}", UPDATE_TOPIC_PREFIX, device_id)
}

pub fn action_topic(device_id: &str) -> String {
    format!("{}{}", ACTION_TOPIC_PREFIX, device_id)
}

/// Owns the pub/sub session: opens it, holds the subscriptions, and drains
/// inbound frames into the update handler and the action router.
pub struct SessionManager {
    link: Arc<dyn PubSubLink>,
    events: mpsc::Receiver<LinkEvent>,
    portal: StatePortal,
    store: DeviceStore,
    router: ActionRouter,
}

impl SessionManager {
    pub fn new(
        link: Arc<dyn PubSubLink>,
        events: mpsc::Receiver<LinkEvent>,
        portal: StatePortal,
        store: DeviceStore,
        router: ActionRouter,
    ) -> Self {
        Self {
            link,
            events,
            portal,
            store,
            router,
        }
    }

    /// Opens the link and subscribes both device topics under the current
    /// effective id. Subscriptions re-use whatever id is adopted at call
    /// time, so a session opened after registration listens on the assigned
    /// id rather than the placeholder.
    pub async fn open(&self) -> Result<(), LinkError> {
        self.portal.set_session(SessionState::Opening);
        self.link.open().await?;

        let id = self.portal.effective_id().await;
        self.link.subscribe(&update_topic(&id)).await?;
        self.link.subscribe(&action_topic(&id)).await?;

        self.portal.set_session(SessionState::Open);
        info!("Session open, subscribed topics for device {}", id);
        Ok(())
    }

    pub async fn is_open(&self) -> bool {
        self.link.is_open().await
    }

    /// Drains all queued inbound events without blocking. Called from the
    /// cooperative tick.
    pub async fn pump(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                LinkEvent::ProtocolError(message) => {
                    error!("Protocol error frame: {}", message);
                }
                LinkEvent::Frame(frame) => {
                    let code = self.dispatch(&frame).await;
                    if let Err(e) = self.link.ack(frame.id, code).await {
                        warn!("Acknowledgement of frame {} failed: {}", frame.id, e);
                    }
                    self.portal.note_received().await;
                }
            }
        }
    }

    async fn dispatch(&self, frame: &InboundFrame) -> AckCode {
        let doc = codec::decode(&frame.body);
        if frame.topic.starts_with(UPDATE_TOPIC_PREFIX) {
            self.handle_update(doc).await;
            AckCode::Continue
        } else if frame.topic.starts_with(ACTION_TOPIC_PREFIX) {
            self.router.route(doc, &*self.link).await
        } else {
            warn!("Frame on unexpected topic '{}', ignoring", frame.topic);
            AckCode::Continue
        }
    }

    /// Applies a backend config update: adopt the pushed id, persist the
    /// whole payload for cold-start hydration, and refresh the working
    /// update interval.
    async fn handle_update(&self, doc: Value) {
        if let Some(id) = extract_id(&doc) {
            self.store.set_device_id(&id);
            self.portal.adopt_assigned_id(id).await;
        }

        self.store.set_config(&doc);

        if let Some(ms) = doc.get("updateInterval").and_then(Value::as_u64) {
            info!("Update interval set to {}ms by backend", ms);
            self.portal
                .set_update_interval(std::time::Duration::from_millis(ms))
                .await;
        }
    }
}

// The backend sends ids as strings, but numbers show up in older payloads.
fn extract_id(doc: &Value) -> Option<String> {
    match doc.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::ActionRouter;
    use crate::transport::{MemoryStore, RestartHandle};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingLink {
        acks: Mutex<Vec<(u64, AckCode)>>,
        subscriptions: Mutex<Vec<String>>,
        sends: AtomicUsize,
    }

    #[async_trait]
    impl PubSubLink for CountingLink {
        async fn open(&self) -> Result<(), LinkError> {
            Ok(())
        }
        async fn is_open(&self) -> bool {
            true
        }
        async fn subscribe(&self, topic: &str) -> Result<(), LinkError> {
            self.subscriptions.lock().unwrap().push(topic.to_string());
            Ok(())
        }
        async fn send(&self, _destination: &str, _body: &str) -> Result<(), LinkError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn ack(&self, frame_id: u64, code: AckCode) -> Result<(), LinkError> {
            self.acks.lock().unwrap().push((frame_id, code));
            Ok(())
        }
        async fn close(&self) {}
    }

    struct Fixture {
        session: SessionManager,
        link: Arc<CountingLink>,
        events: mpsc::Sender<LinkEvent>,
        portal: StatePortal,
        store: DeviceStore,
    }

    fn fixture() -> Fixture {
        let link = Arc::new(CountingLink::default());
        let (events, rx) = mpsc::channel(16);
        let portal = StatePortal::new("dev".into(), Duration::from_millis(9000));
        let store = DeviceStore::new(Arc::new(MemoryStore::new()));
        let router = ActionRouter::new(store.clone(), portal.clone(), RestartHandle::new());
        let session = SessionManager::new(
            link.clone(),
            rx,
            portal.clone(),
            store.clone(),
            router,
        );
        Fixture {
            session,
            link,
            events,
            portal,
            store,
        }
    }

    fn frame(id: u64, topic: &str, doc: &serde_json::Value) -> LinkEvent {
        LinkEvent::Frame(InboundFrame {
            id,
            topic: topic.to_string(),
            body: codec::encode(doc, "1"),
        })
    }

    #[tokio::test]
    async fn open_subscribes_both_topics_under_effective_id() {
        let fx = fixture();
        fx.portal.adopt_assigned_id("23".into()).await;

        fx.session.open().await.unwrap();

        let subs = fx.link.subscriptions.lock().unwrap().clone();
        assert_eq!(subs, vec!["/topic/update/23", "/topic/action/23"]);
        assert_eq!(fx.portal.session(), SessionState::Open);
    }

    #[tokio::test]
    async fn update_frame_adopts_id_and_interval() {
        let mut fx = fixture();
        fx.events
            .send(frame(
                7,
                "/topic/update/1",
                &json!({"id": "42", "updateInterval": 4000}),
            ))
            .await
            .unwrap();

        fx.session.pump().await;

        assert!(fx.portal.is_registered().await);
        assert_eq!(fx.portal.effective_id().await, "42");
        assert_eq!(
            fx.portal.update_interval().await,
            Duration::from_millis(4000)
        );
        assert_eq!(fx.store.device_id().as_deref(), Some("42"));
        assert!(fx.store.config().is_some(), "payload persisted verbatim");
        assert_eq!(
            fx.link.acks.lock().unwrap().as_slice(),
            &[(7, AckCode::Continue)]
        );
    }

    #[tokio::test]
    async fn every_frame_is_acked_exactly_once() {
        let mut fx = fixture();
        fx.events
            .send(frame(1, "/topic/update/1", &json!({"updateInterval": 3000})))
            .await
            .unwrap();
        fx.events
            .send(frame(2, "/topic/action/1", &json!({"keys": "t", "t": "t>1"})))
            .await
            .unwrap();
        fx.events
            .send(frame(3, "/topic/other/1", &json!({})))
            .await
            .unwrap();

        fx.session.pump().await;

        let acks = fx.link.acks.lock().unwrap().clone();
        assert_eq!(
            acks,
            vec![
                (1, AckCode::Continue),
                (2, AckCode::Continue),
                (3, AckCode::Continue),
            ]
        );
        assert_eq!(fx.portal.stats().await.messages_received, 3);
    }

    #[tokio::test]
    async fn protocol_errors_are_logged_not_acked() {
        let mut fx = fixture();
        fx.events
            .send(LinkEvent::ProtocolError("broker said no".into()))
            .await
            .unwrap();

        fx.session.pump().await;

        assert!(fx.link.acks.lock().unwrap().is_empty());
        assert_eq!(fx.portal.stats().await.messages_received, 0);
    }

    #[tokio::test]
    async fn pump_returns_immediately_when_queue_empty() {
        let mut fx = fixture();
        fx.session.pump().await;
        assert!(fx.link.acks.lock().unwrap().is_empty());
    }
}
