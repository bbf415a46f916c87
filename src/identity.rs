//! Device identity and shared runtime state.
//!
//! The original firmware kept the assigned id, registration flag and update
//! interval as bare fields written by one task and read by another, relying
//! on the timing of human-scale config changes to avoid torn reads. The
//! [`StatePortal`] makes that sharing explicit: small snapshots behind
//! `Arc<RwLock>` for the identity and active configuration, and `watch`
//! channels for the connection and session state so any component can
//! observe transitions without polling the supervisor.

use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{watch, RwLock};

/// Network connectivity as driven by the supervisor. `Connected` implies an
/// IP address has been assigned.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Pub/sub session state, layered on top of `Connected`. `Open` implies the
/// topic subscriptions are active.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Closed,
    Opening,
    Open,
}

/// Identity of this device as known to the backend.
///
/// `assigned_id` is issued by the backend at registration and persisted;
/// once set it is stable for the process lifetime and only an explicit
/// update frame overwrites it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub local_name: String,
    pub mac_address: String,
    pub assigned_id: Option<String>,
    pub registered: bool,
}

impl DeviceIdentity {
    /// Id used in topic names and envelopes. The firmware used `"1"` as the
    /// pre-registration placeholder; kept for backend compatibility.
    pub fn effective_id(&self) -> String {
        self.assigned_id.clone().unwrap_or_else(|| "1".to_string())
    }
}

/// A single attribute descriptor declared at registration time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Attribute {
    pub key: String,
    pub display_name: String,
    pub unit: String,
    pub kind: String,
    #[serde(default)]
    pub extras: serde_json::Value,
}

impl Attribute {
    pub fn new(key: &str, display_name: &str, unit: &str, kind: &str) -> Self {
        Self {
            key: key.to_string(),
            display_name: display_name.to_string(),
            unit: unit.to_string(),
            kind: kind.to_string(),
            extras: serde_json::Value::Null,
        }
    }

    pub fn with_extras(mut self, extras: serde_json::Value) -> Self {
        self.extras = extras;
        self
    }
}

/// Formats raw MAC bytes as lowercase colon-separated hex, the form the
/// backend expects in `macAddr`.
pub fn format_mac(bytes: &[u8; 6]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// One WiFi credential pair.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCredential {
    pub ssid: String,
    pub secret: String,
}

/// Ordered credential list with merge semantics for backend refreshes.
#[derive(Clone, Debug, Default)]
pub struct CredentialSet {
    entries: Vec<NetworkCredential>,
}

impl CredentialSet {
    pub fn new(entries: Vec<NetworkCredential>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<NetworkCredential> {
        self.entries.clone()
    }

    /// Merges a refreshed list from the backend into the in-memory set.
    /// Known SSIDs get their secret updated in place, new ones are appended;
    /// locally configured credentials are never dropped.
    pub fn merge(&mut self, refreshed: Vec<NetworkCredential>) -> usize {
        let mut added = 0;
        for cred in refreshed {
            if cred.ssid.is_empty() {
                continue;
            }
            match self.entries.iter_mut().find(|e| e.ssid == cred.ssid) {
                Some(existing) => existing.secret = cred.secret,
                None => {
                    self.entries.push(cred);
                    added += 1;
                }
            }
        }
        added
    }
}

/// Configuration pushed by the backend, kept in working memory.
#[derive(Clone, Debug)]
pub struct ActiveConfig {
    pub update_interval: Duration,
}

/// Counters mirrored from the transport activity, for diagnostics.
#[derive(Clone, Debug, Default)]
pub struct LinkStats {
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

/// Shared-state hub for the connectivity layer.
///
/// Written by the supervisor background task and the inbound dispatch,
/// read from the cooperative tick. Cloning is cheap; all clones observe
/// the same state.
#[derive(Clone)]
pub struct StatePortal {
    identity: Arc<RwLock<DeviceIdentity>>,
    active: Arc<RwLock<ActiveConfig>>,
    stats: Arc<RwLock<LinkStats>>,
    connection_tx: watch::Sender<ConnectionState>,
    session_tx: watch::Sender<SessionState>,
}

impl StatePortal {
    pub fn new(local_name: String, update_interval: Duration) -> Self {
        let (connection_tx, _) = watch::channel(ConnectionState::default());
        let (session_tx, _) = watch::channel(SessionState::default());
        Self {
            identity: Arc::new(RwLock::new(DeviceIdentity {
                local_name,
                ..DeviceIdentity::default()
            })),
            active: Arc::new(RwLock::new(ActiveConfig { update_interval })),
            stats: Arc::new(RwLock::new(LinkStats::default())),
            connection_tx,
            session_tx,
        }
    }

    pub async fn identity(&self) -> DeviceIdentity {
        self.identity.read().await.clone()
    }

    pub async fn effective_id(&self) -> String {
        self.identity.read().await.effective_id()
    }

    pub async fn set_mac_address(&self, mac: String) {
        self.identity.write().await.mac_address = mac;
    }

    /// Adopts a backend-issued id and marks the device registered.
    pub async fn adopt_assigned_id(&self, id: String) {
        let mut identity = self.identity.write().await;
        identity.assigned_id = Some(id);
        identity.registered = true;
    }

    pub async fn is_registered(&self) -> bool {
        self.identity.read().await.registered
    }

    pub async fn update_interval(&self) -> Duration {
        self.active.read().await.update_interval
    }

    pub async fn set_update_interval(&self, interval: Duration) {
        self.active.write().await.update_interval = interval;
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection_tx.borrow().clone()
    }

    pub fn set_connection(&self, state: ConnectionState) {
        // send_replace so the value updates even with no subscribers yet
        self.connection_tx.send_replace(state);
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection_tx.subscribe()
    }

    pub fn session(&self) -> SessionState {
        self.session_tx.borrow().clone()
    }

    pub fn set_session(&self, state: SessionState) {
        self.session_tx.send_replace(state);
    }

    pub fn watch_session(&self) -> watch::Receiver<SessionState> {
        self.session_tx.subscribe()
    }

    pub async fn stats(&self) -> LinkStats {
        self.stats.read().await.clone()
    }

    pub async fn note_received(&self) {
        let mut stats = self.stats.write().await;
        stats.messages_received += 1;
        stats.last_activity = Some(Local::now());
    }

    pub async fn note_sent(&self) {
        let mut stats = self.stats.write().await;
        stats.messages_sent += 1;
        stats.last_activity = Some(Local::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred(ssid: &str, secret: &str) -> NetworkCredential {
        NetworkCredential {
            ssid: ssid.to_string(),
            secret: secret.to_string(),
        }
    }

    #[test]
    fn mac_formats_lowercase_colon_separated() {
        assert_eq!(
            format_mac(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x1A]),
            "de:ad:be:ef:00:1a"
        );
    }

    #[test]
    fn effective_id_falls_back_to_placeholder() {
        let identity = DeviceIdentity::default();
        assert_eq!(identity.effective_id(), "1");
    }

    #[test]
    fn merge_updates_existing_and_appends_new() {
        let mut set = CredentialSet::new(vec![cred("home", "old"), cred("shed", "pw")]);
        let added = set.merge(vec![cred("home", "new"), cred("office", "pw2")]);

        assert_eq!(added, 1);
        let entries = set.snapshot();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], cred("home", "new"));
        assert_eq!(entries[2], cred("office", "pw2"));
    }

    #[test]
    fn merge_skips_empty_ssids() {
        let mut set = CredentialSet::new(vec![cred("home", "pw")]);
        assert_eq!(set.merge(vec![cred("", "junk")]), 0);
        assert_eq!(set.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn portal_publishes_state_transitions() {
        let portal = StatePortal::new("dev".into(), Duration::from_millis(9000));
        let mut rx = portal.watch_connection();

        portal.set_connection(ConnectionState::Connecting);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);

        portal.set_connection(ConnectionState::Connected);
        rx.changed().await.unwrap();
        assert_eq!(portal.connection(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn adopting_id_marks_registered() {
        let portal = StatePortal::new("dev".into(), Duration::from_millis(9000));
        assert!(!portal.is_registered().await);

        portal.adopt_assigned_id("42".into()).await;
        let identity = portal.identity().await;
        assert!(identity.registered);
        assert_eq!(identity.effective_id(), "42");
    }
}
