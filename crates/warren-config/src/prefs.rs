// ── File-backed preferences ──
//
// The small persisted settings surface the manager and gateway consult:
// TOML on disk, figment for load-time layering (defaults, file, then
// WARREN_ environment overrides), whole-document write on every setter.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use warren_core::Preferences;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to serialize preferences: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("preference loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── On-disk document ────────────────────────────────────────────────

/// The preferences document as stored on disk.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PrefsDocument {
    /// Name of the most recently activated tunnel.
    #[serde(default)]
    pub last_used_tunnel: Option<String>,

    /// Names of the tunnels that were up at the last snapshot.
    /// `BTreeSet` so the serialized form is stable.
    #[serde(default)]
    pub running_tunnels: BTreeSet<String>,

    /// Reactivate previously-running tunnels after a fresh start.
    #[serde(default)]
    pub restore_on_boot: bool,

    /// Allow the external trigger gateway to change tunnel state.
    #[serde(default)]
    pub integration_enabled: bool,

    /// Shared secret external triggers must present.
    #[serde(default)]
    pub integration_secret: Option<String>,
}

// ── Preferences file path ───────────────────────────────────────────

/// Resolve the preferences file path via XDG / platform conventions.
pub fn prefs_path() -> PathBuf {
    ProjectDirs::from("io", "warren", "warren").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("prefs.toml");
            p
        },
        |dirs| dirs.config_dir().join("prefs.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("warren");
    p
}

// ── FilePreferences ─────────────────────────────────────────────────

/// TOML-file implementation of [`Preferences`].
///
/// The document is held in memory and rewritten in full on every setter.
/// Write failures are logged, not surfaced -- preference persistence is
/// best-effort and the in-memory view stays authoritative for the
/// lifetime of the process.
pub struct FilePreferences {
    path: PathBuf,
    data: RwLock<PrefsDocument>,
}

impl FilePreferences {
    /// Load from the canonical path (see [`prefs_path`]).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(prefs_path())
    }

    /// Load from an explicit path. A missing file yields defaults.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let data: PrefsDocument = Figment::new()
            .merge(Serialized::defaults(PrefsDocument::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("WARREN_"))
            .extract()?;
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// A copy of the current document.
    pub fn document(&self) -> PrefsDocument {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PrefsDocument> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate(&self, apply: impl FnOnce(&mut PrefsDocument)) {
        let snapshot = {
            let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
            apply(&mut data);
            data.clone()
        };
        if let Err(err) = self.persist(&snapshot) {
            warn!(path = %self.path.display(), error = %err, "could not persist preferences");
        }
    }

    fn persist(&self, data: &PrefsDocument) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let toml_str = toml::to_string_pretty(data)?;
        std::fs::write(&self.path, toml_str)?;
        Ok(())
    }
}

impl Preferences for FilePreferences {
    fn last_used_tunnel(&self) -> Option<String> {
        self.read()
            .last_used_tunnel
            .clone()
            .filter(|name| !name.is_empty())
    }

    fn set_last_used_tunnel(&self, name: Option<&str>) {
        self.mutate(|data| data.last_used_tunnel = name.map(ToOwned::to_owned));
    }

    fn running_tunnels(&self) -> HashSet<String> {
        self.read().running_tunnels.iter().cloned().collect()
    }

    fn set_running_tunnels(&self, names: &HashSet<String>) {
        self.mutate(|data| data.running_tunnels = names.iter().cloned().collect());
    }

    fn restore_on_boot(&self) -> bool {
        self.read().restore_on_boot
    }

    fn integration_enabled(&self) -> bool {
        self.read().integration_enabled
    }

    fn integration_secret(&self) -> Option<SecretString> {
        self.read()
            .integration_secret
            .clone()
            .filter(|secret| !secret.is_empty())
            .map(SecretString::from)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = FilePreferences::load_from(dir.path().join("prefs.toml")).unwrap();

        assert_eq!(prefs.last_used_tunnel(), None);
        assert!(prefs.running_tunnels().is_empty());
        assert!(!prefs.restore_on_boot());
        assert!(!prefs.integration_enabled());
        assert!(prefs.integration_secret().is_none());
    }

    #[test]
    fn setters_persist_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.toml");

        let prefs = FilePreferences::load_from(&path).unwrap();
        prefs.set_last_used_tunnel(Some("office"));
        prefs.set_running_tunnels(&HashSet::from(["office".to_owned(), "oslo".to_owned()]));

        let reloaded = FilePreferences::load_from(&path).unwrap();
        assert_eq!(reloaded.last_used_tunnel().as_deref(), Some("office"));
        assert_eq!(
            reloaded.running_tunnels(),
            HashSet::from(["office".to_owned(), "oslo".to_owned()])
        );
    }

    #[test]
    fn clearing_last_used_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.toml");

        let prefs = FilePreferences::load_from(&path).unwrap();
        prefs.set_last_used_tunnel(Some("office"));
        prefs.set_last_used_tunnel(None);

        let reloaded = FilePreferences::load_from(&path).unwrap();
        assert_eq!(reloaded.last_used_tunnel(), None);
    }

    #[test]
    fn empty_secret_reads_as_unset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.toml");
        std::fs::write(&path, "integration_secret = \"\"\n").unwrap();

        let prefs = FilePreferences::load_from(&path).unwrap();
        assert!(prefs.integration_secret().is_none());
    }
}
