// ── Tunnel lifecycle manager ──
//
// The coordinator that owns the tunnel registry and serializes every
// mutating operation against the config store and network backend.
//
// Operation protocol: handles send typed ops with a oneshot reply through
// an mpsc channel. The service task runs each op's synchronous phase
// inline (validation, registry removal, name reservation), spawns a
// worker for the collaborator I/O, and receives the outcome back as an
// internal completion op for the finish phase (cache updates, rollback,
// reply delivery). Registry and entity mutations therefore happen on one
// logical sequence, while operations on different tunnels interleave
// freely -- the service task never awaits collaborator I/O.
//
// Per-tunnel serialization falls out of the protocol: a tunnel is removed
// from the registry while a risky operation is in flight, and its name is
// reserved so a conflicting create/rename cannot slip into the gap.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::backend::TunnelBackend;
use crate::error::TunnelError;
use crate::model::{Tunnel, TunnelConfig, TunnelState, TunnelStatistics, is_name_valid};
use crate::prefs::Preferences;
use crate::registry::{TunnelList, TunnelRegistry};
use crate::store::ConfigStore;
use crate::stream::ValueStream;

const OPS_CHANNEL_SIZE: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, TunnelError>>;

// ── Operations ───────────────────────────────────────────────────────

enum Op {
    Create {
        name: String,
        config: Option<TunnelConfig>,
        reply: Reply<Arc<Tunnel>>,
    },
    Delete {
        tunnel: Arc<Tunnel>,
        reply: Reply<()>,
    },
    Rename {
        tunnel: Arc<Tunnel>,
        new_name: String,
        reply: Reply<String>,
    },
    SetConfig {
        tunnel: Arc<Tunnel>,
        config: TunnelConfig,
        reply: Reply<TunnelConfig>,
    },
    SetState {
        tunnel: Arc<Tunnel>,
        state: TunnelState,
        reply: Reply<TunnelState>,
    },
    LoadConfig {
        tunnel: Arc<Tunnel>,
        reply: Reply<TunnelConfig>,
    },
    FetchStatistics {
        tunnel: Arc<Tunnel>,
        reply: Reply<TunnelStatistics>,
    },
    Bootstrap {
        reply: Reply<()>,
    },
    RestoreState {
        force: bool,
        reply: Reply<()>,
    },
    RefreshStates {
        reply: Reply<()>,
    },
    RestartActive {
        reply: Reply<()>,
    },
    Finish(Finish),
}

/// Worker outcomes delivered back to the service task for the finish
/// phase of an operation.
enum Finish {
    Create {
        name: String,
        outcome: Result<TunnelConfig, TunnelError>,
        reply: Reply<Arc<Tunnel>>,
    },
    Delete {
        tunnel: Arc<Tunnel>,
        was_last_used: bool,
        outcome: Result<(), TunnelError>,
        reply: Reply<()>,
    },
    Rename {
        tunnel: Arc<Tunnel>,
        old_name: String,
        new_name: String,
        was_last_used: bool,
        renamed_in_store: bool,
        outcome: Result<(), TunnelError>,
        reply: Reply<String>,
    },
    SetConfig {
        tunnel: Arc<Tunnel>,
        outcome: Result<TunnelConfig, TunnelError>,
        reply: Reply<TunnelConfig>,
    },
    SetState {
        tunnel: Arc<Tunnel>,
        loaded_config: Option<TunnelConfig>,
        outcome: Result<TunnelState, TunnelError>,
        reply: Reply<TunnelState>,
    },
    ConfigLoaded {
        tunnel: Arc<Tunnel>,
        outcome: Result<TunnelConfig, TunnelError>,
        reply: Reply<TunnelConfig>,
    },
    Statistics {
        tunnel: Arc<Tunnel>,
        outcome: Result<TunnelStatistics, TunnelError>,
        reply: Reply<TunnelStatistics>,
    },
    Loaded {
        outcome: Result<(Vec<String>, HashSet<String>), TunnelError>,
        reply: Reply<()>,
    },
    StateSynced {
        tunnel: Arc<Tunnel>,
        state: TunnelState,
    },
    StatesRefreshed {
        outcome: Result<HashSet<String>, TunnelError>,
        reply: Reply<()>,
    },
}

// ── TunnelManager ────────────────────────────────────────────────────

/// The main entry point for consumers.
///
/// Cheaply cloneable. Owns the ordered tunnel collection and the
/// last-used pointer; mutates them only on its internal service task.
/// Collaborators are injected at construction -- the manager never
/// reaches for ambient globals.
#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    ops: mpsc::Sender<Op>,
    tunnels: watch::Receiver<TunnelList>,
    last_used: watch::Receiver<Option<Arc<Tunnel>>>,
    loaded: watch::Receiver<bool>,
}

impl TunnelManager {
    /// Create a new manager and spawn its service task.
    ///
    /// Does NOT load anything -- call [`bootstrap()`](Self::bootstrap) to
    /// populate the collection from the store and backend. Must be called
    /// from within a tokio runtime.
    pub fn new(
        backend: Arc<dyn TunnelBackend>,
        store: Arc<dyn ConfigStore>,
        prefs: Arc<dyn Preferences>,
    ) -> Self {
        let (ops_tx, ops_rx) = mpsc::channel(OPS_CHANNEL_SIZE);
        let registry = TunnelRegistry::new();
        let tunnels = registry.subscribe();
        let (last_used_tx, last_used_rx) = watch::channel(None);
        let (loaded_tx, loaded_rx) = watch::channel(false);

        let service = Service {
            backend,
            store,
            prefs,
            registry,
            last_used: last_used_tx,
            loaded: loaded_tx,
            loading: false,
            pending_restores: Vec::new(),
            reserved: HashSet::new(),
            ops: ops_tx.downgrade(),
        };
        tokio::spawn(service.run(ops_rx));

        Self {
            inner: Arc::new(ManagerInner {
                ops: ops_tx,
                tunnels,
                last_used: last_used_rx,
                loaded: loaded_rx,
            }),
        }
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Op) -> Result<T, TunnelError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .ops
            .send(build(tx))
            .await
            .map_err(|_| TunnelError::ServiceStopped)?;
        rx.await.map_err(|_| TunnelError::ServiceStopped)?
    }

    // ── Lifecycle operations ─────────────────────────────────────────

    /// Load the collection: enumerate stored configurations and the
    /// backend's running set concurrently, merge, restore the last-used
    /// pointer, then kick the boot restore sequence.
    ///
    /// Resolves once the collection is populated; the restore sequence
    /// continues asynchronously (await [`restore_state`](Self::restore_state)
    /// to observe its outcome). Safe to call again after a failure.
    pub async fn bootstrap(&self) -> Result<(), TunnelError> {
        self.call(|reply| Op::Bootstrap { reply }).await
    }

    /// Create a tunnel in state DOWN, persisting `config` to the store
    /// when one is given.
    pub async fn create(
        &self,
        name: &str,
        config: Option<TunnelConfig>,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        self.call(|reply| Op::Create {
            name: name.to_owned(),
            config,
            reply,
        })
        .await
    }

    /// Delete a tunnel from the backend and the store.
    ///
    /// All-or-nothing to observers: on store failure the backend is
    /// restored and the tunnel reappears in the collection, last-used
    /// linkage included.
    pub async fn delete(&self, tunnel: &Arc<Tunnel>) -> Result<(), TunnelError> {
        self.call(|reply| Op::Delete {
            tunnel: Arc::clone(tunnel),
            reply,
        })
        .await
    }

    /// Rename a tunnel in the store (bouncing the backend when it is up),
    /// returning the new name.
    pub async fn rename(&self, tunnel: &Arc<Tunnel>, new_name: &str) -> Result<String, TunnelError> {
        self.call(|reply| Op::Rename {
            tunnel: Arc::clone(tunnel),
            new_name: new_name.to_owned(),
            reply,
        })
        .await
    }

    /// Apply a configuration through the backend and persist the result
    /// as applied (the backend may normalize it).
    pub async fn set_config(
        &self,
        tunnel: &Arc<Tunnel>,
        config: TunnelConfig,
    ) -> Result<TunnelConfig, TunnelError> {
        self.call(|reply| Op::SetConfig {
            tunnel: Arc::clone(tunnel),
            config,
            reply,
        })
        .await
    }

    /// Drive a tunnel toward `state`, returning the state actually
    /// reached. The cached state is always resolved on completion and the
    /// running-set snapshot is persisted, success or failure.
    pub async fn set_state(
        &self,
        tunnel: &Arc<Tunnel>,
        state: TunnelState,
    ) -> Result<TunnelState, TunnelError> {
        self.call(|reply| Op::SetState {
            tunnel: Arc::clone(tunnel),
            state,
            reply,
        })
        .await
    }

    /// The tunnel's configuration, loading and caching it from the store
    /// on first access.
    pub async fn tunnel_config(&self, tunnel: &Arc<Tunnel>) -> Result<TunnelConfig, TunnelError> {
        self.call(|reply| Op::LoadConfig {
            tunnel: Arc::clone(tunnel),
            reply,
        })
        .await
    }

    /// Fetch fresh traffic counters from the backend and cache them on
    /// the entity.
    pub async fn refresh_statistics(
        &self,
        tunnel: &Arc<Tunnel>,
    ) -> Result<TunnelStatistics, TunnelError> {
        self.call(|reply| Op::FetchStatistics {
            tunnel: Arc::clone(tunnel),
            reply,
        })
        .await
    }

    /// Re-enumerate the backend and reconcile every cached entity state.
    /// A second call with no backend change in between produces no entity
    /// change events.
    pub async fn refresh_states(&self) -> Result<(), TunnelError> {
        self.call(|reply| Op::RefreshStates { reply }).await
    }

    /// Drive every tunnel toward the state recorded in the persisted
    /// running set.
    ///
    /// Unforced calls are a no-op unless restore-on-boot is enabled.
    /// Calls made before [`bootstrap`](Self::bootstrap) completes are
    /// queued and resolve with the boot restore's outcome.
    pub async fn restore_state(&self, force: bool) -> Result<(), TunnelError> {
        self.call(|reply| Op::RestoreState { force, reply }).await
    }

    /// Bounce every tunnel currently up (down, then up again), e.g. to
    /// apply a global settings change. Individual failures are logged and
    /// skipped.
    pub async fn restart_active_tunnels(&self) -> Result<(), TunnelError> {
        self.call(|reply| Op::RestartActive { reply }).await
    }

    // ── Read surface ─────────────────────────────────────────────────

    /// The current ordered snapshot of the collection.
    pub fn tunnels(&self) -> TunnelList {
        self.inner.tunnels.borrow().clone()
    }

    /// The ordered snapshot, after bootstrap has populated it.
    pub async fn tunnels_loaded(&self) -> TunnelList {
        let mut loaded = self.inner.loaded.clone();
        let _ = loaded.wait_for(|loaded| *loaded).await;
        self.tunnels()
    }

    /// Case-insensitive lookup by name in the current snapshot.
    pub fn get(&self, name: &str) -> Option<Arc<Tunnel>> {
        self.tunnels()
            .iter()
            .find(|tunnel| tunnel.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Subscribe to ordered collection snapshots.
    pub fn subscribe(&self) -> ValueStream<TunnelList> {
        ValueStream::new(self.inner.tunnels.clone())
    }

    /// The most recently activated tunnel, if any.
    pub fn last_used_tunnel(&self) -> Option<Arc<Tunnel>> {
        self.inner.last_used.borrow().clone()
    }

    /// Subscribe to last-used pointer changes.
    pub fn subscribe_last_used(&self) -> ValueStream<Option<Arc<Tunnel>>> {
        ValueStream::new(self.inner.last_used.clone())
    }
}

// ── Service task ─────────────────────────────────────────────────────

struct Service {
    backend: Arc<dyn TunnelBackend>,
    store: Arc<dyn ConfigStore>,
    prefs: Arc<dyn Preferences>,
    registry: TunnelRegistry,
    last_used: watch::Sender<Option<Arc<Tunnel>>>,
    loaded: watch::Sender<bool>,
    loading: bool,
    pending_restores: Vec<Reply<()>>,
    /// Lowercased names with an operation in flight. Closes the window in
    /// which a removed-for-the-duration tunnel's name could be recreated.
    reserved: HashSet<String>,
    /// Weak so the service stops once every handle and worker is gone.
    ops: mpsc::WeakSender<Op>,
}

impl Service {
    async fn run(mut self, mut rx: mpsc::Receiver<Op>) {
        while let Some(op) = rx.recv().await {
            self.handle(op);
        }
        debug!("ops channel closed; tunnel service stopping");
    }

    fn handle(&mut self, op: Op) {
        match op {
            Op::Create {
                name,
                config,
                reply,
            } => self.begin_create(name, config, reply),
            Op::Delete { tunnel, reply } => self.begin_delete(tunnel, reply),
            Op::Rename {
                tunnel,
                new_name,
                reply,
            } => self.begin_rename(tunnel, new_name, reply),
            Op::SetConfig {
                tunnel,
                config,
                reply,
            } => self.begin_set_config(tunnel, config, reply),
            Op::SetState {
                tunnel,
                state,
                reply,
            } => self.begin_set_state(tunnel, state, reply),
            Op::LoadConfig { tunnel, reply } => self.begin_load_config(tunnel, reply),
            Op::FetchStatistics { tunnel, reply } => self.begin_fetch_statistics(tunnel, reply),
            Op::Bootstrap { reply } => self.begin_bootstrap(reply),
            Op::RestoreState { force, reply } => self.begin_restore_state(force, reply),
            Op::RefreshStates { reply } => self.begin_refresh_states(reply),
            Op::RestartActive { reply } => self.begin_restart_active(reply),
            Op::Finish(finish) => self.finish(finish),
        }
    }

    fn finish(&mut self, finish: Finish) {
        match finish {
            Finish::Create {
                name,
                outcome,
                reply,
            } => self.finish_create(name, outcome, reply),
            Finish::Delete {
                tunnel,
                was_last_used,
                outcome,
                reply,
            } => self.finish_delete(tunnel, was_last_used, outcome, reply),
            Finish::Rename {
                tunnel,
                old_name,
                new_name,
                was_last_used,
                renamed_in_store,
                outcome,
                reply,
            } => self.finish_rename(
                tunnel,
                old_name,
                new_name,
                was_last_used,
                renamed_in_store,
                outcome,
                reply,
            ),
            Finish::SetConfig {
                tunnel,
                outcome,
                reply,
            } => {
                let _ = match outcome {
                    Ok(config) => {
                        tunnel.set_config(config.clone());
                        reply.send(Ok(config))
                    }
                    Err(err) => reply.send(Err(err)),
                };
            }
            Finish::SetState {
                tunnel,
                loaded_config,
                outcome,
                reply,
            } => self.finish_set_state(tunnel, loaded_config, outcome, reply),
            Finish::ConfigLoaded {
                tunnel,
                outcome,
                reply,
            } => {
                let _ = match outcome {
                    Ok(config) => {
                        tunnel.set_config(config.clone());
                        reply.send(Ok(config))
                    }
                    Err(err) => reply.send(Err(err)),
                };
            }
            Finish::Statistics {
                tunnel,
                outcome,
                reply,
            } => {
                let _ = match outcome {
                    Ok(statistics) => {
                        tunnel.set_statistics(statistics);
                        reply.send(Ok(statistics))
                    }
                    Err(err) => reply.send(Err(err)),
                };
            }
            Finish::Loaded { outcome, reply } => self.finish_loaded(outcome, reply),
            Finish::StateSynced { tunnel, state } => tunnel.set_state(state),
            Finish::StatesRefreshed { outcome, reply } => {
                self.finish_refresh_states(outcome, reply);
            }
        }
    }

    // ── create ───────────────────────────────────────────────────────

    fn begin_create(&mut self, name: String, config: Option<TunnelConfig>, reply: Reply<Arc<Tunnel>>) {
        if !is_name_valid(&name) {
            let _ = reply.send(Err(TunnelError::InvalidName { name }));
            return;
        }
        if self.name_taken(&name) {
            let _ = reply.send(Err(TunnelError::AlreadyExists { name }));
            return;
        }

        // Nothing to persist: the entity can be allocated immediately.
        let Some(config) = config else {
            let tunnel = self.add_tunnel(name, None, TunnelState::Down);
            let _ = reply.send(Ok(tunnel));
            return;
        };

        self.reserve(&name);
        let store = Arc::clone(&self.store);
        let Some(ops) = self.ops.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let outcome = store
                .create(&name, &config)
                .await
                .map_err(|err| TunnelError::store("create", &err));
            let _ = ops
                .send(Op::Finish(Finish::Create {
                    name,
                    outcome,
                    reply,
                }))
                .await;
        });
    }

    fn finish_create(
        &mut self,
        name: String,
        outcome: Result<TunnelConfig, TunnelError>,
        reply: Reply<Arc<Tunnel>>,
    ) {
        self.unreserve(&name);
        let _ = match outcome {
            Ok(saved) => {
                let tunnel = self.add_tunnel(name, Some(saved), TunnelState::Down);
                reply.send(Ok(tunnel))
            }
            Err(err) => {
                warn!(tunnel = %name, error = %err, "create failed");
                reply.send(Err(err))
            }
        };
    }

    // ── delete ───────────────────────────────────────────────────────

    fn begin_delete(&mut self, tunnel: Arc<Tunnel>, reply: Reply<()>) {
        let name = tunnel.name();
        let original_state = tunnel.state();
        let was_last_used = self.is_last_used(&tunnel);

        // Make sure nothing touches the tunnel while the delete runs.
        if was_last_used {
            self.set_last_used(None);
        }
        self.registry.remove(&tunnel);
        self.reserve(&name);

        let backend = Arc::clone(&self.backend);
        let store = Arc::clone(&self.store);
        let Some(ops) = self.ops.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let outcome = delete_worker(&*backend, &*store, &tunnel, original_state).await;
            let _ = ops
                .send(Op::Finish(Finish::Delete {
                    tunnel,
                    was_last_used,
                    outcome,
                    reply,
                }))
                .await;
        });
    }

    fn finish_delete(
        &mut self,
        tunnel: Arc<Tunnel>,
        was_last_used: bool,
        outcome: Result<(), TunnelError>,
        reply: Reply<()>,
    ) {
        let name = tunnel.name();
        self.unreserve(&name);
        let _ = match outcome {
            Ok(()) => {
                info!(tunnel = %name, "tunnel deleted");
                reply.send(Ok(()))
            }
            Err(err) => {
                // Failure: put the tunnel back, last-used linkage included.
                warn!(tunnel = %name, error = %err, "delete failed; restoring tunnel");
                self.registry.insert(Arc::clone(&tunnel));
                if was_last_used {
                    self.set_last_used(Some(tunnel));
                }
                reply.send(Err(err))
            }
        };
    }

    // ── rename ───────────────────────────────────────────────────────

    fn begin_rename(&mut self, tunnel: Arc<Tunnel>, new_name: String, reply: Reply<String>) {
        if !is_name_valid(&new_name) {
            let _ = reply.send(Err(TunnelError::InvalidName { name: new_name }));
            return;
        }
        if self.name_taken_by_other(&new_name, &tunnel) {
            let _ = reply.send(Err(TunnelError::AlreadyExists { name: new_name }));
            return;
        }

        let old_name = tunnel.name();
        let original_state = tunnel.state();
        let was_last_used = self.is_last_used(&tunnel);

        // Make sure nothing touches the tunnel while the rename runs.
        if was_last_used {
            self.set_last_used(None);
        }
        self.registry.remove(&tunnel);
        self.reserve(&old_name);
        self.reserve(&new_name);

        let backend = Arc::clone(&self.backend);
        let store = Arc::clone(&self.store);
        let Some(ops) = self.ops.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let (renamed_in_store, outcome) =
                rename_worker(&*backend, &*store, &tunnel, &old_name, &new_name, original_state)
                    .await;
            let _ = ops
                .send(Op::Finish(Finish::Rename {
                    tunnel,
                    old_name,
                    new_name,
                    was_last_used,
                    renamed_in_store,
                    outcome,
                    reply,
                }))
                .await;
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_rename(
        &mut self,
        tunnel: Arc<Tunnel>,
        old_name: String,
        new_name: String,
        was_last_used: bool,
        renamed_in_store: bool,
        outcome: Result<(), TunnelError>,
        reply: Reply<String>,
    ) {
        self.unreserve(&old_name);
        self.unreserve(&new_name);

        // The entity keeps the new name iff the store rename committed.
        if renamed_in_store {
            tunnel.set_name(new_name.clone());
        }
        // Add the tunnel back, under whatever name it now has.
        self.registry.insert(Arc::clone(&tunnel));
        if was_last_used {
            self.set_last_used(Some(Arc::clone(&tunnel)));
        }

        let _ = match outcome {
            Ok(()) => {
                info!(from = %old_name, to = %new_name, "tunnel renamed");
                reply.send(Ok(tunnel.name()))
            }
            Err(err) => {
                // The cached state is now unknown; resynchronize from the
                // backend before anyone trusts it.
                warn!(tunnel = %tunnel.name(), error = %err, "rename failed");
                self.spawn_state_sync(tunnel);
                reply.send(Err(err))
            }
        };
    }

    // ── set_config ───────────────────────────────────────────────────

    fn begin_set_config(&self, tunnel: Arc<Tunnel>, config: TunnelConfig, reply: Reply<TunnelConfig>) {
        let backend = Arc::clone(&self.backend);
        let store = Arc::clone(&self.store);
        let Some(ops) = self.ops.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let name = tunnel.name();
            let outcome = async {
                let applied = backend
                    .apply_config(&name, &config)
                    .await
                    .map_err(|err| TunnelError::backend("set_config", &err))?;
                store
                    .save(&name, &applied)
                    .await
                    .map_err(|err| TunnelError::store("set_config", &err))
            }
            .await;
            let _ = ops
                .send(Op::Finish(Finish::SetConfig {
                    tunnel,
                    outcome,
                    reply,
                }))
                .await;
        });
    }

    // ── set_state ────────────────────────────────────────────────────

    fn begin_set_state(&self, tunnel: Arc<Tunnel>, state: TunnelState, reply: Reply<TunnelState>) {
        let backend = Arc::clone(&self.backend);
        let store = Arc::clone(&self.store);
        let Some(ops) = self.ops.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let name = tunnel.name();

            // Ensure the configuration is loaded before trying to use it.
            let (cached, loaded_config) = match tunnel.config() {
                Some(config) => (Some(config), None),
                None => match store.load(&name).await {
                    Ok(config) => (Some(config.clone()), Some(config)),
                    Err(err) => {
                        let _ = ops
                            .send(Op::Finish(Finish::SetState {
                                tunnel,
                                loaded_config: None,
                                outcome: Err(TunnelError::store("set_state", &err)),
                                reply,
                            }))
                            .await;
                        return;
                    }
                },
            };

            let outcome = backend
                .set_state(&name, state, cached.as_ref())
                .await
                .map_err(|err| TunnelError::backend("set_state", &err));
            let _ = ops
                .send(Op::Finish(Finish::SetState {
                    tunnel,
                    loaded_config,
                    outcome,
                    reply,
                }))
                .await;
        });
    }

    fn finish_set_state(
        &mut self,
        tunnel: Arc<Tunnel>,
        loaded_config: Option<TunnelConfig>,
        outcome: Result<TunnelState, TunnelError>,
        reply: Reply<TunnelState>,
    ) {
        if let Some(config) = loaded_config {
            tunnel.set_config(config);
        }

        // The cached state is always resolved here, success or failure:
        // the new state when the backend obliged, the prior cached state
        // otherwise. The running-set snapshot is persisted either way so
        // restart-on-boot reflects reality after partial failures.
        let result = match outcome {
            Ok(new_state) => {
                tunnel.set_state(new_state);
                if new_state == TunnelState::Up {
                    self.set_last_used(Some(Arc::clone(&tunnel)));
                }
                debug!(tunnel = %tunnel.name(), state = %new_state, "tunnel state changed");
                Ok(new_state)
            }
            Err(err) => {
                warn!(tunnel = %tunnel.name(), error = %err, "state change failed");
                Err(err)
            }
        };
        self.save_running_set();
        let _ = reply.send(result);
    }

    // ── config / statistics fetches ──────────────────────────────────

    fn begin_load_config(&self, tunnel: Arc<Tunnel>, reply: Reply<TunnelConfig>) {
        if let Some(config) = tunnel.config() {
            let _ = reply.send(Ok(config));
            return;
        }
        let store = Arc::clone(&self.store);
        let Some(ops) = self.ops.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let outcome = store
                .load(&tunnel.name())
                .await
                .map_err(|err| TunnelError::store("load_config", &err));
            let _ = ops
                .send(Op::Finish(Finish::ConfigLoaded {
                    tunnel,
                    outcome,
                    reply,
                }))
                .await;
        });
    }

    fn begin_fetch_statistics(&self, tunnel: Arc<Tunnel>, reply: Reply<TunnelStatistics>) {
        let backend = Arc::clone(&self.backend);
        let Some(ops) = self.ops.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let outcome = backend
                .statistics(&tunnel.name())
                .await
                .map_err(|err| TunnelError::backend("statistics", &err));
            let _ = ops
                .send(Op::Finish(Finish::Statistics {
                    tunnel,
                    outcome,
                    reply,
                }))
                .await;
        });
    }

    // ── bootstrap / restore ──────────────────────────────────────────

    fn begin_bootstrap(&mut self, reply: Reply<()>) {
        if *self.loaded.borrow() || self.loading {
            debug!("bootstrap already done or in flight; ignoring");
            let _ = reply.send(Ok(()));
            return;
        }
        self.loading = true;

        let backend = Arc::clone(&self.backend);
        let store = Arc::clone(&self.store);
        let Some(ops) = self.ops.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let (present, running) = tokio::join!(store.enumerate(), backend.running_tunnels());
            let outcome = match (present, running) {
                (Ok(present), Ok(running)) => Ok((present, running)),
                (Err(err), _) => Err(TunnelError::store("bootstrap", &err)),
                (_, Err(err)) => Err(TunnelError::backend("bootstrap", &err)),
            };
            let _ = ops.send(Op::Finish(Finish::Loaded { outcome, reply })).await;
        });
    }

    fn finish_loaded(
        &mut self,
        outcome: Result<(Vec<String>, HashSet<String>), TunnelError>,
        reply: Reply<()>,
    ) {
        self.loading = false;
        let (present, running) = match outcome {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(error = %err, "bootstrap enumeration failed");
                let _ = reply.send(Err(err));
                return;
            }
        };

        for name in present {
            if self.registry.contains_key(&name) {
                continue;
            }
            let state = if running.contains(&name) {
                TunnelState::Up
            } else {
                TunnelState::Down
            };
            self.add_tunnel(name, None, state);
        }

        if let Some(last_used) = self.prefs.last_used_tunnel() {
            if let Some(tunnel) = self.registry.get(&last_used) {
                self.set_last_used(Some(tunnel));
            }
        }

        // One-way flip; queued restore calls resolve with the outcome of
        // the boot restore sequence started here.
        let _ = self.loaded.send(true);
        info!(tunnels = self.registry.entries().len(), "tunnel collection loaded");

        let waiters = std::mem::take(&mut self.pending_restores);
        self.spawn_restore(waiters);
        let _ = reply.send(Ok(()));
    }

    fn begin_restore_state(&mut self, force: bool, reply: Reply<()>) {
        if !force && !self.prefs.restore_on_boot() {
            let _ = reply.send(Ok(()));
            return;
        }
        if !*self.loaded.borrow() {
            self.pending_restores.push(reply);
            return;
        }
        self.spawn_restore(vec![reply]);
    }

    /// Drive every tunnel whose cached state differs from the persisted
    /// running set toward its persisted state, then resolve the waiters
    /// with the collective outcome (first failure wins, all attempted).
    fn spawn_restore(&self, waiters: Vec<Reply<()>>) {
        let previously_running = self.prefs.running_tunnels();
        let targets: Vec<(Arc<Tunnel>, TunnelState)> = self
            .registry
            .entries()
            .iter()
            .map(|tunnel| {
                let desired = if previously_running.contains(&tunnel.name()) {
                    TunnelState::Up
                } else {
                    TunnelState::Down
                };
                (Arc::clone(tunnel), desired)
            })
            .filter(|(tunnel, desired)| tunnel.state() != *desired)
            .collect();

        let Some(ops) = self.ops.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let mut outcome: Result<(), TunnelError> = Ok(());
            for (tunnel, desired) in targets {
                match set_state_via(&ops, &tunnel, desired).await {
                    Ok(_) => {}
                    Err(err) => {
                        warn!(tunnel = %tunnel.name(), error = %err, "restore failed");
                        if outcome.is_ok() {
                            outcome = Err(err);
                        }
                    }
                }
            }
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        });
    }

    // ── refresh / restart ────────────────────────────────────────────

    fn begin_refresh_states(&self, reply: Reply<()>) {
        let backend = Arc::clone(&self.backend);
        let Some(ops) = self.ops.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let outcome = backend
                .running_tunnels()
                .await
                .map_err(|err| TunnelError::backend("refresh_states", &err));
            let _ = ops
                .send(Op::Finish(Finish::StatesRefreshed { outcome, reply }))
                .await;
        });
    }

    fn finish_refresh_states(
        &mut self,
        outcome: Result<HashSet<String>, TunnelError>,
        reply: Reply<()>,
    ) {
        let _ = match outcome {
            Ok(running) => {
                for tunnel in self.registry.entries() {
                    let state = if running.contains(&tunnel.name()) {
                        TunnelState::Up
                    } else {
                        TunnelState::Down
                    };
                    tunnel.set_state(state);
                }
                reply.send(Ok(()))
            }
            Err(err) => {
                warn!(error = %err, "state refresh failed");
                reply.send(Err(err))
            }
        };
    }

    fn begin_restart_active(&self, reply: Reply<()>) {
        let active: Vec<Arc<Tunnel>> = self
            .registry
            .entries()
            .iter()
            .filter(|tunnel| tunnel.state() == TunnelState::Up)
            .cloned()
            .collect();

        let Some(ops) = self.ops.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            for tunnel in active {
                // Bounce; bring the tunnel back up even if the stop failed.
                if let Err(err) = set_state_via(&ops, &tunnel, TunnelState::Down).await {
                    warn!(tunnel = %tunnel.name(), error = %err, "restart: stop failed");
                }
                if let Err(err) = set_state_via(&ops, &tunnel, TunnelState::Up).await {
                    warn!(tunnel = %tunnel.name(), error = %err, "restart: start failed");
                }
            }
            let _ = reply.send(Ok(()));
        });
    }

    // ── Shared helpers ───────────────────────────────────────────────

    fn add_tunnel(
        &mut self,
        name: String,
        config: Option<TunnelConfig>,
        state: TunnelState,
    ) -> Arc<Tunnel> {
        debug!(tunnel = %name, %state, "adding tunnel");
        let tunnel = Arc::new(Tunnel::new(name, config, state));
        self.registry.insert(Arc::clone(&tunnel));
        tunnel
    }

    fn spawn_state_sync(&self, tunnel: Arc<Tunnel>) {
        let backend = Arc::clone(&self.backend);
        let Some(ops) = self.ops.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            match backend.state(&tunnel.name()).await {
                Ok(state) => {
                    let _ = ops
                        .send(Op::Finish(Finish::StateSynced { tunnel, state }))
                        .await;
                }
                Err(err) => {
                    warn!(tunnel = %tunnel.name(), error = %err, "state resync failed");
                }
            }
        });
    }

    fn name_taken(&self, name: &str) -> bool {
        self.registry.contains_key(name) || self.reserved.contains(&name.to_ascii_lowercase())
    }

    /// Like [`name_taken`](Self::name_taken), but a tunnel may take a
    /// case-variant of its own current name.
    fn name_taken_by_other(&self, name: &str, tunnel: &Arc<Tunnel>) -> bool {
        if self.reserved.contains(&name.to_ascii_lowercase()) {
            return true;
        }
        match self.registry.get(name) {
            Some(existing) => !Arc::ptr_eq(&existing, tunnel),
            None => false,
        }
    }

    fn reserve(&mut self, name: &str) {
        self.reserved.insert(name.to_ascii_lowercase());
    }

    fn unreserve(&mut self, name: &str) {
        self.reserved.remove(&name.to_ascii_lowercase());
    }

    fn is_last_used(&self, tunnel: &Arc<Tunnel>) -> bool {
        self.last_used
            .borrow()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, tunnel))
    }

    fn set_last_used(&self, tunnel: Option<Arc<Tunnel>>) {
        let unchanged = {
            let current = self.last_used.borrow();
            match (current.as_ref(), tunnel.as_ref()) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            }
        };
        if unchanged {
            return;
        }
        self.prefs
            .set_last_used_tunnel(tunnel.as_ref().map(|t| t.name()).as_deref());
        let _ = self.last_used.send(tunnel);
    }

    /// Persist the names of every tunnel currently up, for
    /// restart-on-boot.
    fn save_running_set(&self) {
        let running: HashSet<String> = self
            .registry
            .entries()
            .iter()
            .filter(|tunnel| tunnel.state() == TunnelState::Up)
            .map(|tunnel| tunnel.name())
            .collect();
        self.prefs.set_running_tunnels(&running);
    }
}

// ── Worker bodies ────────────────────────────────────────────────────

async fn delete_worker(
    backend: &dyn TunnelBackend,
    store: &dyn ConfigStore,
    tunnel: &Arc<Tunnel>,
    original_state: TunnelState,
) -> Result<(), TunnelError> {
    let name = tunnel.name();
    let config = tunnel.config();

    if original_state == TunnelState::Up {
        backend
            .set_state(&name, TunnelState::Down, config.as_ref())
            .await
            .map_err(|err| TunnelError::backend("delete", &err))?;
    }

    match store.delete(&name).await {
        Ok(()) => Ok(()),
        Err(err) => {
            // Store refused; undo the stop so the observable outcome is
            // all-or-nothing.
            if original_state == TunnelState::Up {
                if let Err(restore_err) = backend
                    .set_state(&name, TunnelState::Up, config.as_ref())
                    .await
                {
                    warn!(tunnel = %name, error = %restore_err, "could not restart tunnel after failed delete");
                }
            }
            Err(TunnelError::store("delete", &err))
        }
    }
}

/// Returns whether the store rename committed, alongside the outcome.
async fn rename_worker(
    backend: &dyn TunnelBackend,
    store: &dyn ConfigStore,
    tunnel: &Arc<Tunnel>,
    old_name: &str,
    new_name: &str,
    original_state: TunnelState,
) -> (bool, Result<(), TunnelError>) {
    let config = tunnel.config();

    if original_state == TunnelState::Up {
        if let Err(err) = backend
            .set_state(old_name, TunnelState::Down, config.as_ref())
            .await
        {
            return (false, Err(TunnelError::backend("rename", &err)));
        }
    }

    if let Err(err) = store.rename(old_name, new_name).await {
        return (false, Err(TunnelError::store("rename", &err)));
    }

    if original_state == TunnelState::Up {
        if let Err(err) = backend
            .set_state(new_name, TunnelState::Up, config.as_ref())
            .await
        {
            return (true, Err(TunnelError::backend("rename", &err)));
        }
    }

    (true, Ok(()))
}

/// Run a set-state op through the service channel and await its outcome.
/// Used by the restore and restart workers so their state changes take
/// the same path as everyone else's.
async fn set_state_via(
    ops: &mpsc::Sender<Op>,
    tunnel: &Arc<Tunnel>,
    state: TunnelState,
) -> Result<TunnelState, TunnelError> {
    let (tx, rx) = oneshot::channel();
    ops.send(Op::SetState {
        tunnel: Arc::clone(tunnel),
        state,
        reply: tx,
    })
    .await
    .map_err(|_| TunnelError::ServiceStopped)?;
    rx.await.map_err(|_| TunnelError::ServiceStopped)?
}
