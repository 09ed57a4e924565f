//! Tunnel lifecycle coordination for warren.
//!
//! This crate owns the business logic and reactive data infrastructure
//! for managing named VPN tunnel definitions:
//!
//! - **[`TunnelManager`]** — Central facade managing the full lifecycle:
//!   create/delete/rename/set-config/set-state, startup restore, and
//!   periodic state reconciliation. Mutations are serialized onto an
//!   internal service task; collaborator I/O runs on worker tasks, so
//!   operations on different tunnels proceed concurrently.
//!
//! - **[`Tunnel`]** — One named tunnel: cached configuration, cached
//!   runtime state, cached traffic statistics. Every mutable field is
//!   observable through a [`ValueStream`].
//!
//! - **Collaborator traits** — [`TunnelBackend`] (live network control
//!   plane), [`ConfigStore`] (durable configuration storage), and
//!   [`Preferences`] (small persisted settings). All injected at
//!   construction; the manager never reaches for ambient globals.
//!
//! - **[`TriggerGateway`]** — Secret-authenticated external request
//!   surface that maps trigger messages onto manager operations.

mod backend;
mod error;
mod gateway;
mod manager;
mod model;
mod prefs;
mod registry;
mod store;
mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use backend::TunnelBackend;
pub use error::{BackendError, StoreError, TunnelError};
pub use gateway::{TriggerAction, TriggerGateway, TriggerRequest};
pub use manager::TunnelManager;
pub use model::{MAX_NAME_LEN, Tunnel, TunnelConfig, TunnelState, TunnelStatistics, is_name_valid};
pub use prefs::Preferences;
pub use registry::TunnelList;
pub use store::ConfigStore;
pub use stream::{ValueStream, ValueWatchStream};
