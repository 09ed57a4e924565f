// ── Preferences collaborator ──
//
// Small durable key-value surface the manager reads and writes around
// its operations: the last-used tunnel, the running set persisted for
// restart-on-boot, and the trigger-gateway integration settings.

use std::collections::HashSet;

use secrecy::SecretString;

/// Abstract preference storage.
///
/// Methods are synchronous and expected to be cheap; implementations own
/// their durability strategy. The manager treats the layout as opaque.
pub trait Preferences: Send + Sync {
    /// Name of the most recently activated tunnel, if any.
    fn last_used_tunnel(&self) -> Option<String>;

    fn set_last_used_tunnel(&self, name: Option<&str>);

    /// Names of the tunnels that were up at the last snapshot.
    fn running_tunnels(&self) -> HashSet<String>;

    fn set_running_tunnels(&self, names: &HashSet<String>);

    /// Whether previously-running tunnels are restored after a fresh
    /// process start.
    fn restore_on_boot(&self) -> bool;

    /// Whether the external trigger gateway may change tunnel state.
    fn integration_enabled(&self) -> bool;

    /// Shared secret external triggers must present. `None` when unset.
    fn integration_secret(&self) -> Option<SecretString>;
}
