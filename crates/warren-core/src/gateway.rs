// ── External trigger gateway ──
//
// Broadcast-style request surface for automation tools: a message names
// a tunnel, a desired state, and a shared secret. The gateway validates
// the secret against preferences before touching the manager. Rejections
// are logged, never surfaced to the sender.

use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::manager::TunnelManager;
use crate::model::TunnelState;
use crate::prefs::Preferences;

/// What an external trigger asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerAction {
    SetTunnelUp { name: String },
    SetTunnelDown { name: String },
    /// Reconcile every cached state against the backend. Carries no
    /// tunnel name and requires no secret.
    RefreshStates,
}

/// One external trigger message.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub action: TriggerAction,
    /// Shared secret presented by the sender; required for state
    /// changes, ignored for refreshes.
    pub secret: Option<String>,
}

/// Maps authenticated external requests onto manager operations.
pub struct TriggerGateway {
    manager: TunnelManager,
    prefs: Arc<dyn Preferences>,
}

impl TriggerGateway {
    pub fn new(manager: TunnelManager, prefs: Arc<dyn Preferences>) -> Self {
        Self { manager, prefs }
    }

    /// Handle one trigger message.
    ///
    /// Never returns an error to the sender: unauthenticated or
    /// malformed requests are dropped with a log line, and manager
    /// failures are logged the same way.
    pub async fn handle(&self, request: TriggerRequest) {
        let (name, state) = match request.action {
            TriggerAction::RefreshStates => {
                debug!("trigger: refreshing tunnel states");
                if let Err(err) = self.manager.refresh_states().await {
                    warn!(error = %err, "trigger: state refresh failed");
                }
                return;
            }
            TriggerAction::SetTunnelUp { name } => (name, TunnelState::Up),
            TriggerAction::SetTunnelDown { name } => (name, TunnelState::Down),
        };

        if !self.prefs.integration_enabled() {
            warn!("trigger integration is disabled; dropping state change request");
            return;
        }
        let Some(expected) = self.prefs.integration_secret() else {
            warn!("no trigger integration secret configured; dropping state change request");
            return;
        };
        if expected.expose_secret().is_empty() {
            warn!("empty trigger integration secret; dropping state change request");
            return;
        }
        let presented = request.secret.as_deref().unwrap_or_default();
        if presented != expected.expose_secret() {
            warn!(tunnel = %name, "trigger integration secret mismatch; dropping request");
            return;
        }

        // Gate on bootstrap so early triggers see the full collection.
        self.manager.tunnels_loaded().await;
        let Some(tunnel) = self.manager.get(&name) else {
            debug!(tunnel = %name, "trigger names an unknown tunnel; ignoring");
            return;
        };

        debug!(tunnel = %name, %state, "trigger: requesting state change");
        if let Err(err) = self.manager.set_state(&tunnel, state).await {
            warn!(tunnel = %name, error = %err, "trigger: state change failed");
        }
    }
}
