// ── Network backend collaborator ──
//
// The control plane that applies configurations to the live network
// stack. Implementations are platform plumbing and live outside this
// crate; the manager only ever talks to the trait.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::BackendError;
use crate::model::{TunnelConfig, TunnelState, TunnelStatistics};

/// Abstract network control plane.
///
/// All operations may fail; failures surface to manager callers as
/// [`TunnelError::Backend`](crate::TunnelError::Backend). Timeout policy
/// belongs to the implementation, not the manager.
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    /// Names of the tunnels currently running on the system.
    async fn running_tunnels(&self) -> Result<HashSet<String>, BackendError>;

    /// Apply a configuration to a tunnel, returning the configuration as
    /// actually applied (the backend may normalize it).
    async fn apply_config(
        &self,
        name: &str,
        config: &TunnelConfig,
    ) -> Result<TunnelConfig, BackendError>;

    /// Drive a tunnel toward `state`, returning the state actually
    /// reached. `config` is the cached configuration when one is loaded;
    /// bringing a tunnel up requires it.
    async fn set_state(
        &self,
        name: &str,
        state: TunnelState,
        config: Option<&TunnelConfig>,
    ) -> Result<TunnelState, BackendError>;

    /// The live state of one tunnel.
    async fn state(&self, name: &str) -> Result<TunnelState, BackendError>;

    /// Traffic counters for one tunnel.
    async fn statistics(&self, name: &str) -> Result<TunnelStatistics, BackendError>;
}
