//! Device registration with capped exponential backoff.
//!
//! Registration is idempotent and safe to re-invoke; the supervisor calls it
//! from the background task whenever a retry is due. The blocking HTTP call
//! never runs on the cooperative tick.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::RegistrationSettings;
use crate::http_api::{ApiError, BackendApi};
use crate::identity::{Attribute, StatePortal};
use crate::store::DeviceStore;
use crate::transport::RestartHandle;

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("Registration request failed: {0}")]
    Api(#[from] ApiError),

    #[error("Registration response carried no id")]
    MissingId,
}

/// Retry bookkeeping for a deferred registration.
///
/// The delay after `n` failures is `min(cap, base * 2^n)`, monotonically
/// non-decreasing in `n` until a success resets the counter (bringing the
/// delay back to `base`).
#[derive(Debug)]
pub struct PendingRegistration {
    attempt_count: u32,
    last_attempt: Option<Instant>,
    base: Duration,
    cap: Duration,
}

impl PendingRegistration {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            attempt_count: 0,
            last_attempt: None,
            base,
            cap,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempt_count
    }

    /// Current backoff delay, derived purely from the attempt count.
    pub fn backoff(&self) -> Duration {
        let factor = 1u64
            .checked_shl(self.attempt_count)
            .unwrap_or(u64::MAX);
        let millis = (self.base.as_millis() as u64)
            .saturating_mul(factor)
            .min(self.cap.as_millis() as u64);
        Duration::from_millis(millis)
    }

    /// Whether enough time has elapsed since the last failed attempt.
    /// Always true before the first attempt.
    pub fn due(&self, now: Instant) -> bool {
        match self.last_attempt {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.backoff(),
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_attempt = Some(now);
    }

    pub fn reset(&mut self) {
        self.attempt_count = 0;
        self.last_attempt = None;
    }
}

/// Registers the device identity with the backend and keeps retrying with
/// backoff until it sticks.
pub struct RegistrationClient {
    api: Arc<dyn BackendApi>,
    store: DeviceStore,
    portal: StatePortal,
    restart: RestartHandle,
    device_name: String,
    attributes: Vec<Attribute>,
    settings: RegistrationSettings,
    pending: PendingRegistration,
}

impl RegistrationClient {
    pub fn new(
        api: Arc<dyn BackendApi>,
        store: DeviceStore,
        portal: StatePortal,
        restart: RestartHandle,
        device_name: String,
        attributes: Vec<Attribute>,
        settings: RegistrationSettings,
    ) -> Self {
        let pending = PendingRegistration::new(
            Duration::from_millis(settings.base_ms),
            Duration::from_millis(settings.cap_ms),
        );
        Self {
            api,
            store,
            portal,
            restart,
            device_name,
            attributes,
            settings,
            pending,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.pending.attempts()
    }

    /// Whether a retry may be attempted now, per the backoff schedule.
    pub fn retry_due(&self, now: Instant) -> bool {
        self.pending.due(now)
    }

    /// Registers the device. Success persists the assigned id, marks the
    /// identity registered, resets the backoff and triggers the follow-up
    /// list fetches (best-effort). Failure defers; the caller re-invokes
    /// once [`RegistrationClient::retry_due`] reports the backoff elapsed.
    pub async fn register(&mut self, access_url: Option<String>) -> Result<(), RegistrationError> {
        if self.portal.is_registered().await {
            debug!("Device already registered, skipping registration");
            return Ok(());
        }

        info!("Registering device '{}'", self.device_name);
        let doc = self.build_document(access_url).await;

        let response = match self.api.register(&doc).await {
            Ok(response) => response,
            Err(e) => {
                self.note_failure();
                return Err(e.into());
            }
        };

        let Some(id) = response
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
        else {
            self.note_failure();
            return Err(RegistrationError::MissingId);
        };

        self.store.set_device_id(&id);
        self.portal.adopt_assigned_id(id.clone()).await;
        self.pending.reset();
        info!("Device registered with id {}", id);

        self.fetch_reference_lists().await;
        Ok(())
    }

    async fn build_document(&self, access_url: Option<String>) -> Value {
        let identity = self.portal.identity().await;
        let update_interval = self.portal.update_interval().await;

        let attributes: Vec<Value> = self
            .attributes
            .iter()
            .map(|attribute| {
                json!({
                    "value": "",
                    "displayName": attribute.display_name,
                    "key": attribute.key,
                    "units": attribute.unit,
                    "type": attribute.kind,
                    "extras": attribute.extras,
                    "valueDataType": "String",
                })
            })
            .collect();

        json!({
            "name": self.device_name,
            "deviceId": identity.effective_id(),
            "type": "sensor",
            "updateInterval": update_interval.as_millis() as u64,
            "status": "ONLINE",
            "macAddr": identity.mac_address,
            "reboot": false,
            "sleep": false,
            "accessUrl": access_url
                .map(|ip| format!("http://{}", ip))
                .unwrap_or_default(),
            "attributes": attributes,
        })
    }

    fn note_failure(&mut self) {
        self.pending.record_failure(Instant::now());
        let attempts = self.pending.attempts();
        warn!(
            "Device registration failed (attempt {}), next retry in {:?}",
            attempts,
            self.pending.backoff()
        );

        if attempts >= self.settings.max_attempts {
            error!(
                "Registration failed {} times, at or above the configured ceiling of {}",
                attempts, self.settings.max_attempts
            );
            if self.settings.restart_on_ceiling {
                error!("Requesting device restart per registration policy");
                self.restart.trigger();
            }
        }
    }

    /// Follow-up fetches after a successful registration. Their failure does
    /// not affect the registration outcome.
    async fn fetch_reference_lists(&self) {
        match self.api.automation_index().await {
            Ok(index) => info!("Fetched automation index ({} entries)", index.len()),
            Err(e) => warn!("Automation index fetch failed: {}", e),
        }
        match self.api.master_list().await {
            Ok(entries) => info!("Fetched master list ({} entries)", entries.len()),
            Err(e) => warn!("Master list fetch failed: {}", e),
        }
    }
}
