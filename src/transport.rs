//! Collaborator seams for the transports this layer sits on.
//!
//! The socket, pub/sub and key-value mechanics are external components
//! assumed correct; this module defines the traits the core talks through
//! plus the lightweight implementations used by the demo binary and tests.
//! Keeping the seams as traits (instead of the firmware's process-wide
//! singleton with free-function callbacks) lets every component be exercised
//! against fakes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::identity::NetworkCredential;

/// Acknowledgement code a subscription handler must return for every frame.
/// `Continue` tells the transport the message was accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckCode {
    Continue,
    Reject,
}

/// One inbound frame delivered on a subscribed topic.
#[derive(Clone, Debug)]
pub struct InboundFrame {
    pub id: u64,
    pub topic: String,
    pub body: String,
}

/// Events surfaced by a pub/sub link implementation.
#[derive(Clone, Debug)]
pub enum LinkEvent {
    Frame(InboundFrame),
    /// Protocol-level error frame from the broker. Logged only, never fatal.
    ProtocolError(String),
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Association failed: {0}")]
    AssociationFailed(String),

    #[error("Association attempt timed out")]
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Link is not open")]
    NotOpen,

    #[error("Transport error: {0}")]
    Transport(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store write failed: {0}")]
    WriteFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TimeError {
    #[error("Time synchronization failed: {0}")]
    SyncFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("Update channel failed to start: {0}")]
    StartFailed(String),
}

/// Network association layer (WiFi on the device, OS-managed elsewhere).
#[async_trait]
pub trait NetworkInterface: Send + Sync {
    /// Attempts to associate using one credential. The caller time-boxes
    /// the attempt; implementations may block until associated or failed.
    async fn associate(&self, credential: &NetworkCredential) -> Result<(), NetworkError>;

    async fn is_connected(&self) -> bool;

    /// Local IP once associated, used for the device access URL.
    async fn local_ip(&self) -> Option<String>;

    /// Station MAC, formatted as lowercase hex bytes joined by `:`.
    fn mac_address(&self) -> String;
}

/// Topic-subscription messaging link requiring explicit per-frame
/// acknowledgement. Inbound traffic arrives on the event channel handed
/// over at wiring time, in arrival order.
#[async_trait]
pub trait PubSubLink: Send + Sync {
    async fn open(&self) -> Result<(), LinkError>;

    async fn is_open(&self) -> bool;

    /// Subscribes a topic in client-acknowledgement mode.
    async fn subscribe(&self, topic: &str) -> Result<(), LinkError>;

    /// Sends a payload to a destination. Fire-and-forget from the caller's
    /// point of view; delivery guarantees are the transport's business.
    async fn send(&self, destination: &str, body: &str) -> Result<(), LinkError>;

    /// Acknowledges a previously delivered frame.
    async fn ack(&self, frame_id: u64, code: AckCode) -> Result<(), LinkError>;

    async fn close(&self);
}

/// Plain get/put string store (device flash preferences, a file, ...).
/// No transactional guarantees.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Clock synchronization collaborator, invoked once per connect.
#[async_trait]
pub trait TimeSync: Send + Sync {
    async fn sync(&self) -> Result<(), TimeError>;
}

/// Firmware-update transport, started once per connect. Out of scope
/// beyond the seam.
#[async_trait]
pub trait UpdateChannel: Send + Sync {
    async fn start(&self) -> Result<(), UpdateError>;
}

/// Process-wide restart request token.
///
/// The only global cancellation mechanism in this layer is a full device
/// restart; the token is tripped by a reboot action (or, by policy, after
/// the registration attempt ceiling) and observed by the application's
/// main loop.
#[derive(Clone, Default)]
pub struct RestartHandle {
    token: CancellationToken,
}

impl RestartHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn triggered(&self) {
        self.token.cancelled().await;
    }
}

/// Log-only pub/sub link.
///
/// Lets the whole connectivity flow run without a broker: publishes are
/// logged and dropped, subscriptions are recorded, no frames ever arrive.
#[derive(Default)]
pub struct LogLink {
    open: AtomicBool,
}

impl LogLink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PubSubLink for LogLink {
    async fn open(&self) -> Result<(), LinkError> {
        self.open.store(true, Ordering::Relaxed);
        info!("link(LOG): session opened");
        Ok(())
    }

    async fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    async fn subscribe(&self, topic: &str) -> Result<(), LinkError> {
        info!("link(LOG): subscribed '{}'", topic);
        Ok(())
    }

    async fn send(&self, destination: &str, body: &str) -> Result<(), LinkError> {
        info!(
            "link(LOG): publish to '{}' len={}",
            destination,
            body.len()
        );
        debug!("link(LOG): payload {}", body);
        Ok(())
    }

    async fn ack(&self, frame_id: u64, code: AckCode) -> Result<(), LinkError> {
        debug!("link(LOG): ack frame {} with {:?}", frame_id, code);
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
        info!("link(LOG): session closed");
    }
}

/// In-memory key-value store for tests and the demo binary.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("store mutex poisoned")
            .get(key)
            .cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .expect("store mutex poisoned")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Network interface for hosts where the OS manages connectivity. Always
/// reports connected; association is a no-op that succeeds immediately.
pub struct HostNetwork {
    mac: String,
}

impl HostNetwork {
    pub fn new(mac: String) -> Self {
        Self { mac }
    }
}

#[async_trait]
impl NetworkInterface for HostNetwork {
    async fn associate(&self, credential: &NetworkCredential) -> Result<(), NetworkError> {
        debug!("network(host): association to '{}' delegated to OS", credential.ssid);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        true
    }

    async fn local_ip(&self) -> Option<String> {
        // UDP connect trick; no packet is sent
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        socket.local_addr().ok().map(|addr| addr.ip().to_string())
    }

    fn mac_address(&self) -> String {
        self.mac.clone()
    }
}

/// No-op time sync for hosts with NTP-managed clocks.
pub struct SystemClockSync;

#[async_trait]
impl TimeSync for SystemClockSync {
    async fn sync(&self) -> Result<(), TimeError> {
        debug!("timesync: host clock assumed NTP-synchronized");
        Ok(())
    }
}

/// Update channel stub for builds without an update transport.
pub struct NullUpdateChannel;

#[async_trait]
impl UpdateChannel for NullUpdateChannel {
    async fn start(&self) -> Result<(), UpdateError> {
        debug!("updates: no update transport configured");
        Ok(())
    }
}
