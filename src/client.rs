//! Application-facing client facade.
//!
//! Wires the collaborators together, hydrates persisted identity and
//! configuration at startup, spawns the connectivity supervisor and exposes
//! the cooperative [`AutomataClient::tick`] the application drives from its
//! main loop.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::LinkConfig;
use crate::http_api::BackendApi;
use crate::identity::{
    Attribute, ConnectionState, CredentialSet, SessionState, StatePortal,
};
use crate::registration::RegistrationClient;
use crate::router::{ActionCallback, ActionRouter};
use crate::scheduler::{TickScheduler, TickTask};
use crate::session::SessionManager;
use crate::store::DeviceStore;
use crate::supervisor::{SupervisorDeps, SupervisorHandle};
use crate::telemetry::TelemetryPublisher;
use crate::transport::{
    KvStore, LinkEvent, NetworkInterface, PubSubLink, RestartHandle, TimeSync, UpdateChannel,
};

pub type IntervalCallback = Arc<dyn Fn() + Send + Sync>;

/// Builder for [`AutomataClient`]. Collaborators are injected so the same
/// wiring serves devices, hosts and tests.
pub struct AutomataClientBuilder {
    config: LinkConfig,
    network: Arc<dyn NetworkInterface>,
    link: Arc<dyn PubSubLink>,
    events: mpsc::Receiver<LinkEvent>,
    api: Arc<dyn BackendApi>,
    kv: Arc<dyn KvStore>,
    time_sync: Arc<dyn TimeSync>,
    updates: Arc<dyn UpdateChannel>,
    attributes: Vec<Attribute>,
    on_action: Option<ActionCallback>,
    on_interval: Option<IntervalCallback>,
}

impl AutomataClientBuilder {
    pub fn new(
        config: LinkConfig,
        network: Arc<dyn NetworkInterface>,
        link: Arc<dyn PubSubLink>,
        events: mpsc::Receiver<LinkEvent>,
        api: Arc<dyn BackendApi>,
        kv: Arc<dyn KvStore>,
        time_sync: Arc<dyn TimeSync>,
        updates: Arc<dyn UpdateChannel>,
    ) -> Self {
        Self {
            config,
            network,
            link,
            events,
            api,
            kv,
            time_sync,
            updates,
            attributes: Vec::new(),
            on_action: None,
            on_interval: None,
        }
    }

    /// Declares an attribute reported at registration time.
    pub fn add_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Callback invoked with every inbound action, before the built-in
    /// handling runs.
    pub fn on_action(mut self, callback: ActionCallback) -> Self {
        self.on_action = Some(callback);
        self
    }

    /// Callback invoked on every telemetry tick while the session is open.
    pub fn on_interval(mut self, callback: IntervalCallback) -> Self {
        self.on_interval = Some(callback);
        self
    }

    /// Wires everything, hydrates persisted state and spawns the
    /// connectivity supervisor.
    pub async fn build(self) -> AutomataClient {
        let store = DeviceStore::new(self.kv);
        let portal = StatePortal::new(
            self.config.device_name.clone(),
            self.config.update_interval(),
        );
        let restart = RestartHandle::new();

        hydrate(&store, &portal).await;
        portal.set_mac_address(self.network.mac_address()).await;

        // configured credentials first, persisted backend refreshes merged in
        let mut credentials = CredentialSet::new(self.config.credentials.clone());
        credentials.merge(store.wifi_list());

        let mut router = ActionRouter::new(store.clone(), portal.clone(), restart.clone());
        if let Some(callback) = self.on_action {
            router.set_callback(callback);
        }

        let session = SessionManager::new(
            self.link.clone(),
            self.events,
            portal.clone(),
            store.clone(),
            router,
        );
        let registration = RegistrationClient::new(
            self.api.clone(),
            store.clone(),
            portal.clone(),
            restart.clone(),
            self.config.device_name.clone(),
            self.attributes,
            self.config.registration.clone(),
        );
        let telemetry = Arc::new(TelemetryPublisher::new(self.link.clone(), portal.clone()));

        let session = Arc::new(Mutex::new(session));
        let supervisor = SupervisorHandle::spawn(SupervisorDeps {
            network: self.network,
            link: self.link,
            api: self.api,
            time_sync: self.time_sync,
            updates: self.updates,
            portal: portal.clone(),
            store: store.clone(),
            session: session.clone(),
            registration: Arc::new(Mutex::new(registration)),
            credentials: Arc::new(Mutex::new(credentials)),
            timing: self.config.timing.clone(),
        });

        let mut scheduler = TickScheduler::new();
        scheduler.schedule_after(
            TickTask::Telemetry,
            self.config.update_interval(),
            Instant::now(),
        );

        AutomataClient {
            portal,
            store,
            session,
            telemetry,
            restart,
            supervisor,
            scheduler,
            on_interval: self.on_interval,
        }
    }
}

/// Restores identity and configuration persisted by earlier runs, so a
/// restarted device skips re-registration and keeps its tuned interval.
async fn hydrate(store: &DeviceStore, portal: &StatePortal) {
    if let Some(id) = store.device_id() {
        info!("Hydrated persisted device id {}", id);
        portal.adopt_assigned_id(id).await;
    }
    if let Some(config) = store.config() {
        // older runs persisted the id only inside the config blob
        if !portal.is_registered().await {
            if let Some(id) = config.get("id").and_then(serde_json::Value::as_str) {
                info!("Hydrated device id {} from config payload", id);
                portal.adopt_assigned_id(id.to_string()).await;
            }
        }
        if let Some(ms) = config.get("updateInterval").and_then(serde_json::Value::as_u64) {
            debug!("Hydrated update interval {}ms", ms);
            portal
                .set_update_interval(std::time::Duration::from_millis(ms))
                .await;
        }
    }
}

pub struct AutomataClient {
    portal: StatePortal,
    store: DeviceStore,
    session: Arc<Mutex<SessionManager>>,
    telemetry: Arc<TelemetryPublisher>,
    restart: RestartHandle,
    supervisor: SupervisorHandle,
    scheduler: TickScheduler,
    on_interval: Option<IntervalCallback>,
}

impl AutomataClient {
    /// One cooperative tick: drain inbound frames and run the telemetry
    /// cadence. A no-op while the network is down; the supervisor owns
    /// reconnection in the background.
    pub async fn tick(&mut self) {
        if self.portal.connection() != ConnectionState::Connected {
            return;
        }

        self.session.lock().await.pump().await;

        let now = Instant::now();
        for task in self.scheduler.due(now) {
            if task == TickTask::Telemetry {
                if self.portal.session() == SessionState::Open {
                    if let Some(callback) = &self.on_interval {
                        callback();
                    }
                }
                let interval = self.portal.update_interval().await;
                self.scheduler.schedule_after(TickTask::Telemetry, interval, now);
            }
        }
    }

    pub fn telemetry(&self) -> Arc<TelemetryPublisher> {
        self.telemetry.clone()
    }

    pub fn restart_handle(&self) -> RestartHandle {
        self.restart.clone()
    }

    pub fn portal(&self) -> StatePortal {
        self.portal.clone()
    }

    pub fn store(&self) -> DeviceStore {
        self.store.clone()
    }
}

impl Drop for AutomataClient {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_api::ApiError;
    use crate::identity::NetworkCredential;
    use crate::rules::{IndexEntry, MasterEntry};
    use crate::transport::{
        LogLink, MemoryStore, NetworkError, NullUpdateChannel, SystemClockSync,
    };
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct IdleNetwork;

    #[async_trait]
    impl NetworkInterface for IdleNetwork {
        async fn associate(&self, _c: &NetworkCredential) -> Result<(), NetworkError> {
            Ok(())
        }
        async fn is_connected(&self) -> bool {
            true
        }
        async fn local_ip(&self) -> Option<String> {
            Some("10.0.0.2".into())
        }
        fn mac_address(&self) -> String {
            "de:ad:be:ef:00:01".into()
        }
    }

    struct NoApi;

    #[async_trait]
    impl BackendApi for NoApi {
        async fn register(&self, _doc: &Value) -> Result<Value, ApiError> {
            Err(ApiError::Malformed("offline".into()))
        }
        async fn wifi_list(&self) -> Result<Vec<NetworkCredential>, ApiError> {
            Ok(Vec::new())
        }
        async fn automation_index(&self) -> Result<Vec<IndexEntry>, ApiError> {
            Ok(Vec::new())
        }
        async fn master_list(&self) -> Result<Vec<MasterEntry>, ApiError> {
            Ok(Vec::new())
        }
    }

    fn builder(kv: Arc<dyn KvStore>) -> AutomataClientBuilder {
        let (_tx, rx) = mpsc::channel(4);
        let mut config = LinkConfig::default();
        config.credentials = vec![NetworkCredential {
            ssid: "home".into(),
            secret: "pw".into(),
        }];
        AutomataClientBuilder::new(
            config,
            Arc::new(IdleNetwork),
            Arc::new(LogLink::new()),
            rx,
            Arc::new(NoApi),
            kv,
            Arc::new(SystemClockSync),
            Arc::new(NullUpdateChannel),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn hydration_restores_id_and_interval() {
        let kv = Arc::new(MemoryStore::new());
        kv.put("deviceId", "31").unwrap();
        kv.put("config", &json!({"updateInterval": 4000}).to_string())
            .unwrap();

        let client = builder(kv).build().await;

        let portal = client.portal();
        assert!(portal.is_registered().await);
        assert_eq!(portal.effective_id().await, "31");
        assert_eq!(
            portal.update_interval().await,
            Duration::from_millis(4000)
        );
        assert_eq!(portal.identity().await.mac_address, "de:ad:be:ef:00:01");
    }

    #[tokio::test(start_paused = true)]
    async fn cold_start_uses_placeholder_identity() {
        let client = builder(Arc::new(MemoryStore::new())).build().await;
        let portal = client.portal();
        assert!(!portal.is_registered().await);
        assert_eq!(portal.effective_id().await, "1");
    }

    struct DeadNetwork;

    #[async_trait]
    impl NetworkInterface for DeadNetwork {
        async fn associate(&self, _c: &NetworkCredential) -> Result<(), NetworkError> {
            Err(NetworkError::AssociationFailed("no beacon".into()))
        }
        async fn is_connected(&self) -> bool {
            false
        }
        async fn local_ip(&self) -> Option<String> {
            None
        }
        fn mac_address(&self) -> String {
            "de:ad:be:ef:00:02".into()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tick_is_inert_while_disconnected() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counted = ticks.clone();
        let (_tx, rx) = mpsc::channel(4);
        let mut config = LinkConfig::default();
        config.credentials = vec![NetworkCredential {
            ssid: "home".into(),
            secret: "pw".into(),
        }];
        let mut client = AutomataClientBuilder::new(
            config,
            Arc::new(DeadNetwork),
            Arc::new(LogLink::new()),
            rx,
            Arc::new(NoApi),
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClockSync),
            Arc::new(NullUpdateChannel),
        )
        .on_interval(Arc::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        }))
        .build()
        .await;

        tokio::time::advance(Duration::from_secs(30)).await;
        client.tick().await;

        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_callback_fires_on_cadence_while_open() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counted = ticks.clone();
        let mut client = builder(Arc::new(MemoryStore::new()))
            .on_interval(Arc::new(move || {
                counted.fetch_add(1, Ordering::SeqCst);
            }))
            .build()
            .await;

        client.portal().set_connection(ConnectionState::Connected);
        client.portal().set_session(SessionState::Open);

        tokio::time::advance(Duration::from_millis(9100)).await;
        client.tick().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(9100)).await;
        client.tick().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }
}
