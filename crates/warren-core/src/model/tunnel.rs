// ── Tunnel entity ──
//
// One named tunnel: cached configuration, cached runtime state, cached
// statistics. Every mutable field is a `watch` channel so UI bindings
// observe property changes without polling. Entities are created by the
// manager only and live exactly as long as the registry references them.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::TunnelConfig;
use crate::stream::ValueStream;

/// Maximum tunnel name length, matching the platform interface-name limit.
pub const MAX_NAME_LEN: usize = 15;

/// Whether `name` is acceptable as a tunnel name.
///
/// Names are non-empty, at most [`MAX_NAME_LEN`] bytes, and restricted to
/// `[A-Za-z0-9_=+.-]`. Uniqueness is enforced separately (and
/// case-insensitively) by the registry.
pub fn is_name_valid(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'=' | b'+' | b'.' | b'-'))
}

// ── TunnelState ──────────────────────────────────────────────────────

/// Runtime state of a tunnel as last observed from the backend.
///
/// Cached and may transiently diverge from the live state while an
/// operation is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Up,
    Down,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

// ── TunnelStatistics ─────────────────────────────────────────────────

/// Last-observed traffic counters. Advisory only; no invariant depends
/// on these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelStatistics {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

// ── Tunnel ───────────────────────────────────────────────────────────

/// A named tunnel entity.
///
/// Handled as `Arc<Tunnel>` throughout; identity is pointer identity.
/// Field mutation is reserved to the manager's service task -- observers
/// subscribe via the `watch_*` accessors.
pub struct Tunnel {
    name: watch::Sender<String>,
    state: watch::Sender<TunnelState>,
    config: watch::Sender<Option<TunnelConfig>>,
    statistics: watch::Sender<Option<TunnelStatistics>>,
}

impl Tunnel {
    pub(crate) fn new(name: String, config: Option<TunnelConfig>, state: TunnelState) -> Self {
        let (name, _) = watch::channel(name);
        let (state, _) = watch::channel(state);
        let (config, _) = watch::channel(config);
        let (statistics, _) = watch::channel(None);
        Self {
            name,
            state,
            config,
            statistics,
        }
    }

    // ── Cached-field accessors ───────────────────────────────────────

    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    /// The cached configuration, if it has been loaded.
    ///
    /// Use [`TunnelManager::tunnel_config`](crate::TunnelManager::tunnel_config)
    /// to load it from the store on first access.
    pub fn config(&self) -> Option<TunnelConfig> {
        self.config.borrow().clone()
    }

    pub fn statistics(&self) -> Option<TunnelStatistics> {
        *self.statistics.borrow()
    }

    // ── Property-change subscriptions ────────────────────────────────

    pub fn watch_name(&self) -> ValueStream<String> {
        ValueStream::new(self.name.subscribe())
    }

    pub fn watch_state(&self) -> ValueStream<TunnelState> {
        ValueStream::new(self.state.subscribe())
    }

    pub fn watch_config(&self) -> ValueStream<Option<TunnelConfig>> {
        ValueStream::new(self.config.subscribe())
    }

    pub fn watch_statistics(&self) -> ValueStream<Option<TunnelStatistics>> {
        ValueStream::new(self.statistics.subscribe())
    }

    // ── Mutators (manager service task only) ─────────────────────────
    //
    // All writes go through `send_if_modified` so an unchanged value
    // produces no change event -- reconciliation passes that observe no
    // drift must be silent.

    pub(crate) fn set_name(&self, name: String) {
        self.name.send_if_modified(|current| {
            if *current == name {
                false
            } else {
                *current = name;
                true
            }
        });
    }

    pub(crate) fn set_state(&self, state: TunnelState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    pub(crate) fn set_config(&self, config: TunnelConfig) {
        self.config.send_if_modified(|current| {
            if current.as_ref() == Some(&config) {
                false
            } else {
                *current = Some(config);
                true
            }
        });
    }

    pub(crate) fn set_statistics(&self, statistics: TunnelStatistics) {
        self.statistics.send_if_modified(|current| {
            if *current == Some(statistics) {
                false
            } else {
                *current = Some(statistics);
                true
            }
        });
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
