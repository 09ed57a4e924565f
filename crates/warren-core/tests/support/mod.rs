// Shared in-memory collaborator fakes for the integration tests.
// Failure switches let individual tests break exactly one collaborator
// call while everything else keeps working.
#![allow(clippy::unwrap_used, dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use secrecy::SecretString;

use warren_core::{
    BackendError, ConfigStore, Preferences, StoreError, TunnelBackend, TunnelConfig, TunnelState,
    TunnelStatistics,
};

// ── MemoryConfigStore ───────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryConfigStore {
    configs: Mutex<BTreeMap<String, TunnelConfig>>,
    pub fail_create: AtomicBool,
    pub fail_load: AtomicBool,
    pub fail_save: AtomicBool,
    pub fail_delete: AtomicBool,
    pub fail_rename: AtomicBool,
    pub fail_enumerate: AtomicBool,
    /// When set, `delete` blocks until the sender side is dropped.
    pub delete_gate: Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
}

impl MemoryConfigStore {
    pub fn with_configs(names: &[&str]) -> Self {
        let store = Self::default();
        {
            let mut configs = store.configs.lock().unwrap();
            for name in names {
                configs.insert((*name).to_owned(), TunnelConfig::new("[Interface]"));
            }
        }
        store
    }

    pub fn contains(&self, name: &str) -> bool {
        self.configs.lock().unwrap().contains_key(name)
    }

    fn check(flag: &AtomicBool, operation: &str) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::new(format!("injected {operation} failure")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn enumerate(&self) -> Result<Vec<String>, StoreError> {
        Self::check(&self.fail_enumerate, "enumerate")?;
        Ok(self.configs.lock().unwrap().keys().cloned().collect())
    }

    async fn load(&self, name: &str) -> Result<TunnelConfig, StoreError> {
        Self::check(&self.fail_load, "load")?;
        self.configs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::new(format!("no stored config: {name}")))
    }

    async fn save(&self, name: &str, config: &TunnelConfig) -> Result<TunnelConfig, StoreError> {
        Self::check(&self.fail_save, "save")?;
        self.configs
            .lock()
            .unwrap()
            .insert(name.to_owned(), config.clone());
        Ok(config.clone())
    }

    async fn create(&self, name: &str, config: &TunnelConfig) -> Result<TunnelConfig, StoreError> {
        Self::check(&self.fail_create, "create")?;
        let mut configs = self.configs.lock().unwrap();
        if configs.contains_key(name) {
            return Err(StoreError::new(format!("config already exists: {name}")));
        }
        configs.insert(name.to_owned(), config.clone());
        Ok(config.clone())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let gate = self.delete_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Self::check(&self.fail_delete, "delete")?;
        self.configs
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::new(format!("no stored config: {name}")))
    }

    async fn rename(&self, old_name: &str, new_name: &str) -> Result<(), StoreError> {
        Self::check(&self.fail_rename, "rename")?;
        let mut configs = self.configs.lock().unwrap();
        if configs.contains_key(new_name) {
            return Err(StoreError::new(format!("config already exists: {new_name}")));
        }
        let config = configs
            .remove(old_name)
            .ok_or_else(|| StoreError::new(format!("no stored config: {old_name}")))?;
        configs.insert(new_name.to_owned(), config);
        Ok(())
    }
}

// ── FakeBackend ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeBackend {
    running: Mutex<HashSet<String>>,
    pub fail_set_state: AtomicBool,
    pub fail_enumerate: AtomicBool,
    /// Every `set_state` call in order, for asserting bounce sequences.
    pub state_calls: Mutex<Vec<(String, TunnelState)>>,
}

impl FakeBackend {
    pub fn with_running(names: &[&str]) -> Self {
        let backend = Self::default();
        {
            let mut running = backend.running.lock().unwrap();
            for name in names {
                running.insert((*name).to_owned());
            }
        }
        backend
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running.lock().unwrap().contains(name)
    }

    pub fn set_running(&self, names: &[&str]) {
        *self.running.lock().unwrap() = names.iter().map(|n| (*n).to_owned()).collect();
    }
}

#[async_trait]
impl TunnelBackend for FakeBackend {
    async fn running_tunnels(&self) -> Result<HashSet<String>, BackendError> {
        if self.fail_enumerate.load(Ordering::SeqCst) {
            return Err(BackendError::new("injected enumerate failure"));
        }
        Ok(self.running.lock().unwrap().clone())
    }

    async fn apply_config(
        &self,
        _name: &str,
        config: &TunnelConfig,
    ) -> Result<TunnelConfig, BackendError> {
        // "Normalization": the applied config is the trimmed text.
        Ok(TunnelConfig::new(config.contents().trim()))
    }

    async fn set_state(
        &self,
        name: &str,
        state: TunnelState,
        _config: Option<&TunnelConfig>,
    ) -> Result<TunnelState, BackendError> {
        self.state_calls
            .lock()
            .unwrap()
            .push((name.to_owned(), state));
        if self.fail_set_state.load(Ordering::SeqCst) {
            return Err(BackendError::new("injected set_state failure"));
        }
        let mut running = self.running.lock().unwrap();
        match state {
            TunnelState::Up => running.insert(name.to_owned()),
            TunnelState::Down => running.remove(name),
        };
        Ok(state)
    }

    async fn state(&self, name: &str) -> Result<TunnelState, BackendError> {
        Ok(if self.is_running(name) {
            TunnelState::Up
        } else {
            TunnelState::Down
        })
    }

    async fn statistics(&self, _name: &str) -> Result<TunnelStatistics, BackendError> {
        Ok(TunnelStatistics {
            rx_bytes: 1024,
            tx_bytes: 4096,
        })
    }
}

// ── MemoryPreferences ───────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryPreferences {
    last_used: Mutex<Option<String>>,
    running: Mutex<HashSet<String>>,
    pub restore_on_boot: AtomicBool,
    pub integration_enabled: AtomicBool,
    secret: Mutex<Option<String>>,
}

impl MemoryPreferences {
    pub fn with_running(names: &[&str]) -> Self {
        let prefs = Self::default();
        *prefs.running.lock().unwrap() = names.iter().map(|n| (*n).to_owned()).collect();
        prefs
    }

    pub fn set_secret(&self, secret: Option<&str>) {
        *self.secret.lock().unwrap() = secret.map(ToOwned::to_owned);
    }

    pub fn set_last_used(&self, name: Option<&str>) {
        *self.last_used.lock().unwrap() = name.map(ToOwned::to_owned);
    }
}

impl Preferences for MemoryPreferences {
    fn last_used_tunnel(&self) -> Option<String> {
        self.last_used.lock().unwrap().clone()
    }

    fn set_last_used_tunnel(&self, name: Option<&str>) {
        *self.last_used.lock().unwrap() = name.map(ToOwned::to_owned);
    }

    fn running_tunnels(&self) -> HashSet<String> {
        self.running.lock().unwrap().clone()
    }

    fn set_running_tunnels(&self, names: &HashSet<String>) {
        *self.running.lock().unwrap() = names.clone();
    }

    fn restore_on_boot(&self) -> bool {
        self.restore_on_boot.load(Ordering::SeqCst)
    }

    fn integration_enabled(&self) -> bool {
        self.integration_enabled.load(Ordering::SeqCst)
    }

    fn integration_secret(&self) -> Option<SecretString> {
        self.secret
            .lock()
            .unwrap()
            .clone()
            .map(SecretString::from)
    }
}
