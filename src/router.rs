//! Inbound action routing.
//!
//! Action frames arrive on the device's action topic and carry either a
//! reboot request or a rule update (a `keys` field naming sensor keys whose
//! companion fields hold condition strings). Every action, including ones
//! the router cannot make sense of, is answered with exactly one
//! acknowledgement publish so the backend can close its command loop.

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::codec;
use crate::identity::{SessionState, StatePortal};
use crate::rules::{parse_condition, AutomationRule};
use crate::session::DEST_ACK;
use crate::store::DeviceStore;
use crate::transport::{AckCode, PubSubLink, RestartHandle};

/// One inbound action, handed to the application callback before the router
/// applies its own semantics.
#[derive(Clone, Debug)]
pub struct Action {
    pub raw: Value,
}

pub type ActionCallback = std::sync::Arc<dyn Fn(Action) + Send + Sync>;

/// Routes decoded action documents: application callback, reboot handling,
/// rule-set replacement, acknowledgement.
pub struct ActionRouter {
    callback: Option<ActionCallback>,
    store: DeviceStore,
    portal: StatePortal,
    restart: RestartHandle,
}

impl ActionRouter {
    pub fn new(store: DeviceStore, portal: StatePortal, restart: RestartHandle) -> Self {
        Self {
            callback: None,
            store,
            portal,
            restart,
        }
    }

    pub fn set_callback(&mut self, callback: ActionCallback) {
        self.callback = Some(callback);
    }

    /// Handles one decoded action document. Always publishes exactly one
    /// acknowledgement; on reboot the ack goes out before the session is
    /// torn down, so the backend sees the command land.
    pub async fn route(&self, doc: Value, link: &dyn PubSubLink) -> AckCode {
        if let Some(callback) = &self.callback {
            callback(Action { raw: doc.clone() });
        }

        let reboot = doc.get("reboot").map(is_truthy).unwrap_or(false);

        if !reboot {
            if let Some(rules) = self.extract_rules(&doc) {
                info!("Replacing rule set with {} rule(s)", rules.len());
                self.store.set_automations(&rules);
            }
        }

        let command = if reboot {
            "reboot".to_string()
        } else {
            doc.get("command")
                .and_then(Value::as_str)
                .or_else(|| doc.get("keys").and_then(Value::as_str))
                .unwrap_or("")
                .to_string()
        };

        self.send_ack(&command, link).await;

        if reboot {
            info!("Reboot requested, closing session and requesting restart");
            link.close().await;
            self.portal.set_session(SessionState::Closed);
            self.restart.trigger();
        }

        AckCode::Continue
    }

    /// Derives the replacement rule set from the `keys` field. Each
    /// comma-separated token names a sensor key whose companion field holds
    /// the condition string; tokens without a parsable condition are skipped.
    fn extract_rules(&self, doc: &Value) -> Option<Vec<AutomationRule>> {
        let keys = doc.get("keys")?.as_str()?;
        let rules = keys
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .filter_map(|token| {
                let condition = doc.get(token).and_then(Value::as_str)?;
                let rule = parse_condition(token, condition);
                if rule.is_none() {
                    debug!("Condition '{}' for key '{}' has no operator", condition, token);
                }
                rule
            })
            .collect();
        Some(rules)
    }

    async fn send_ack(&self, command: &str, link: &dyn PubSubLink) {
        let ack = json!({
            "key": "actionAck",
            "actionAck": "Success",
            "command": command,
        });
        let id = self.portal.effective_id().await;
        let body = codec::encode(&ack, &id);
        if let Err(e) = link.send(DEST_ACK, &body).await {
            warn!("Action acknowledgement publish failed: {}", e);
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => false,
    }
}
