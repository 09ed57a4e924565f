// ── Config store collaborator ──
//
// Durable storage for named tunnel configurations. The store is the
// authoritative copy; entities only cache what it returns.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::TunnelConfig;

/// Abstract persistent configuration store.
///
/// Failures surface to manager callers as
/// [`TunnelError::Store`](crate::TunnelError::Store); during delete and
/// rename they additionally trigger the manager's rollback paths.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Names of all stored configurations.
    async fn enumerate(&self) -> Result<Vec<String>, StoreError>;

    /// Load the configuration stored under `name`.
    async fn load(&self, name: &str) -> Result<TunnelConfig, StoreError>;

    /// Overwrite the configuration stored under `name`, returning the
    /// configuration as stored.
    async fn save(&self, name: &str, config: &TunnelConfig) -> Result<TunnelConfig, StoreError>;

    /// Store a configuration under a name not yet in use, returning the
    /// configuration as stored.
    async fn create(&self, name: &str, config: &TunnelConfig) -> Result<TunnelConfig, StoreError>;

    /// Delete the configuration stored under `name`.
    async fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// Move a configuration from `old_name` to `new_name`.
    async fn rename(&self, old_name: &str, new_name: &str) -> Result<(), StoreError>;
}
