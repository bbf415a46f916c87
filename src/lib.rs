//! Connectivity and session resilience layer for backend-managed devices.
//!
//! The crate keeps a device's link to its backend alive end to end: network
//! association with credential walking, device registration with capped
//! exponential backoff, a pub/sub session with per-frame acknowledgement,
//! inbound config/action routing with persisted automation rules, and
//! fire-and-forget telemetry publishing. Transports, persistence and the
//! clock are trait seams, so the same core runs on devices, hosts and tests.

pub mod client;
pub mod codec;
pub mod config;
pub mod http_api;
pub mod identity;
pub mod registration;
pub mod router;
pub mod rules;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod transport;

pub use client::{AutomataClient, AutomataClientBuilder, IntervalCallback};
pub use config::LinkConfig;
pub use identity::{Attribute, ConnectionState, DeviceIdentity, NetworkCredential, SessionState};
pub use router::{Action, ActionCallback};
pub use rules::AutomationRule;
pub use transport::RestartHandle;
