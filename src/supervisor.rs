//! Connectivity supervisor with a statum state machine.
//!
//! Owns the background reconnect loop for the whole connectivity stack.
//! The lifecycle is enforced at compile time:
//!
//! ```text
//! Idle ──► Associating ──► Established
//!  ▲            │               │
//!  └────────────┴───────────────┘
//!    (all credentials failed /    (network drop)
//!     network drop + cooldown)
//! ```
//!
//! `Idle → Associating` walks the credential list with a per-attempt
//! timeout. `Established` runs first-connect setup (time sync, registration,
//! session open, update channel) exactly once per association, then holds
//! the connection: polling the network, probing the session, refreshing
//! credentials and retrying deferred registrations on their own cadences.

use std::sync::Arc;

use statum::{machine, state, transition};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::TimingConfig;
use crate::http_api::BackendApi;
use crate::identity::{ConnectionState, CredentialSet, SessionState, StatePortal};
use crate::registration::RegistrationClient;
use crate::scheduler::{TickScheduler, TickTask};
use crate::session::SessionManager;
use crate::store::DeviceStore;
use crate::transport::{NetworkInterface, PubSubLink, TimeSync, UpdateChannel};

/// Connectivity lifecycle phases.
#[state]
#[derive(Debug, Clone)]
pub enum LinkPhase {
    Idle,        // No network, waiting to (re)try
    Associating, // Walking the credential list
    Established, // Network up, steady-state maintenance
}

/// Everything the supervisor drives. Cloning shares all collaborators.
#[derive(Clone)]
pub struct SupervisorDeps {
    pub network: Arc<dyn NetworkInterface>,
    pub link: Arc<dyn PubSubLink>,
    pub api: Arc<dyn BackendApi>,
    pub time_sync: Arc<dyn TimeSync>,
    pub updates: Arc<dyn UpdateChannel>,
    pub portal: StatePortal,
    pub store: DeviceStore,
    pub session: Arc<Mutex<SessionManager>>,
    pub registration: Arc<Mutex<RegistrationClient>>,
    pub credentials: Arc<Mutex<CredentialSet>>,
    pub timing: TimingConfig,
}

/// Connectivity state machine with compile-time phase safety via statum.
#[machine]
pub struct Connectivity<LinkPhase> {
    deps: SupervisorDeps,
    fresh_connect: bool,
}

impl Connectivity<Idle> {
    pub fn start(deps: SupervisorDeps) -> Self {
        Self::builder().deps(deps).fresh_connect(false).build()
    }
}

#[transition]
impl Connectivity<Idle> {
    pub fn begin(self) -> Connectivity<Associating> {
        info!("Starting network association");
        self.deps.portal.set_connection(ConnectionState::Connecting);
        self.transition()
    }
}

#[transition]
impl Connectivity<Associating> {
    /// Tries every credential once, in order, each attempt time-boxed.
    /// The first success wins; if the whole list fails the machine falls
    /// back to idle and the caller applies the cooldown.
    pub async fn associate(
        mut self,
    ) -> ::core::result::Result<Connectivity<Established>, Connectivity<Idle>> {
        let credentials = self.deps.credentials.lock().await.snapshot();
        if credentials.is_empty() {
            warn!("No credentials configured, cannot associate");
            self.deps
                .portal
                .set_connection(ConnectionState::Disconnected);
            return Err(self.transition());
        }

        let timeout = self.deps.timing.associate_timeout();
        for credential in &credentials {
            debug!("Trying network '{}'", credential.ssid);
            match tokio::time::timeout(timeout, self.deps.network.associate(credential)).await {
                Ok(Ok(())) => {
                    info!("Associated with '{}'", credential.ssid);
                    self.deps.portal.set_connection(ConnectionState::Connected);
                    self.fresh_connect = true;
                    return Ok(self.transition());
                }
                Ok(Err(e)) => warn!("Association with '{}' failed: {}", credential.ssid, e),
                Err(_) => warn!(
                    "Association with '{}' timed out after {:?}",
                    credential.ssid, timeout
                ),
            }
        }

        warn!("All {} credential(s) failed", credentials.len());
        self.deps
            .portal
            .set_connection(ConnectionState::Disconnected);
        Err(self.transition())
    }
}

impl Connectivity<Established> {
    /// First-connect setup, run once per association. Each step is
    /// best-effort: a failure is logged and the remaining steps still run,
    /// the maintenance cadences repair what they can later.
    pub async fn bring_up(&mut self) {
        if !self.fresh_connect {
            return;
        }
        self.fresh_connect = false;

        if let Err(e) = self.deps.time_sync.sync().await {
            warn!("Time sync failed: {}", e);
        }

        let access_url = self.deps.network.local_ip().await;
        if let Err(e) = self
            .deps
            .registration
            .lock()
            .await
            .register(access_url)
            .await
        {
            warn!("Initial registration attempt failed: {}", e);
        }

        if let Err(e) = self.deps.session.lock().await.open().await {
            error!("Session open failed: {}", e);
        }

        if let Err(e) = self.deps.updates.start().await {
            warn!("Update channel start failed: {}", e);
        }
    }

    async fn refresh_credentials(&self) {
        match self.deps.api.wifi_list().await {
            Ok(refreshed) => {
                let mut credentials = self.deps.credentials.lock().await;
                let added = credentials.merge(refreshed);
                self.deps.store.set_wifi_list(&credentials.snapshot());
                if added > 0 {
                    info!("Credential refresh added {} network(s)", added);
                }
            }
            Err(e) => warn!("Credential refresh failed: {}", e),
        }
    }

    async fn retry_registration(&self) {
        if self.deps.portal.is_registered().await {
            return;
        }
        let mut registration = self.deps.registration.lock().await;
        if !registration.retry_due(Instant::now()) {
            return;
        }
        let access_url = self.deps.network.local_ip().await;
        if let Err(e) = registration.register(access_url).await {
            debug!("Deferred registration attempt failed: {}", e);
        }
    }
}

#[transition]
impl Connectivity<Established> {
    /// Steady-state maintenance loop. Returns (to idle) only when the
    /// network drops; the cooldown before reassociation happens here so the
    /// caller can retry immediately.
    pub async fn hold(mut self) -> Connectivity<Idle> {
        let mut scheduler = TickScheduler::new();
        let now = Instant::now();
        let timing = self.deps.timing.clone();
        scheduler.schedule_after(TickTask::LinkPoll, timing.link_poll(), now);
        scheduler.schedule_after(TickTask::SessionProbe, timing.session_probe(), now);
        scheduler.schedule_after(TickTask::CredentialRefresh, timing.credential_refresh(), now);
        scheduler.schedule_after(TickTask::RegistrationRetry, timing.registration_check(), now);

        loop {
            let deadline = scheduler
                .next_deadline()
                .expect("maintenance tasks always reschedule");
            tokio::time::sleep_until(deadline).await;
            let now = Instant::now();

            for task in scheduler.due(now) {
                match task {
                    TickTask::LinkPoll => {
                        if !self.deps.network.is_connected().await {
                            warn!("Network connection lost");
                            self.deps
                                .portal
                                .set_connection(ConnectionState::Disconnected);
                            self.deps.portal.set_session(SessionState::Closed);
                            tokio::time::sleep(timing.cooldown()).await;
                            return self.transition();
                        }
                        scheduler.schedule_after(TickTask::LinkPoll, timing.link_poll(), now);
                    }
                    TickTask::SessionProbe => {
                        if !self.deps.link.is_open().await {
                            warn!("Session closed underneath us, reopening");
                            if let Err(e) = self.deps.session.lock().await.open().await {
                                error!("Session reopen failed: {}", e);
                            }
                        }
                        scheduler.schedule_after(
                            TickTask::SessionProbe,
                            timing.session_probe(),
                            now,
                        );
                    }
                    TickTask::CredentialRefresh => {
                        self.refresh_credentials().await;
                        scheduler.schedule_after(
                            TickTask::CredentialRefresh,
                            timing.credential_refresh(),
                            now,
                        );
                    }
                    TickTask::RegistrationRetry => {
                        self.retry_registration().await;
                        scheduler.schedule_after(
                            TickTask::RegistrationRetry,
                            timing.registration_check(),
                            now,
                        );
                    }
                    // driven from the application tick, never scheduled here
                    TickTask::Telemetry => {}
                }
            }
        }
    }
}

/// Handle to the spawned supervisor task.
pub struct SupervisorHandle {
    handle: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Spawns the reconnect loop as a background task. The loop never
    /// terminates on its own; abort the handle (or trip the restart token
    /// and exit the process) to stop it.
    pub fn spawn(deps: SupervisorDeps) -> Self {
        let cooldown = deps.timing.cooldown();
        let handle = tokio::spawn(async move {
            let mut idle = Connectivity::start(deps);
            loop {
                match idle.begin().associate().await {
                    Ok(mut established) => {
                        established.bring_up().await;
                        idle = established.hold().await;
                    }
                    Err(back_to_idle) => {
                        idle = back_to_idle;
                        tokio::time::sleep(cooldown).await;
                    }
                }
            }
        });
        Self { handle }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
