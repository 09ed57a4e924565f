// ── Filesystem config store ──
//
// One `<name>.conf` file per tunnel under a configured directory. Names
// are re-validated before any path is formed, so a hostile name can
// never escape the directory.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use warren_core::{ConfigStore, StoreError, TunnelConfig, is_name_valid};

const CONFIG_EXTENSION: &str = "conf";

/// Directory-of-files implementation of [`ConfigStore`].
pub struct FileConfigStore {
    directory: PathBuf,
}

impl FileConfigStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &std::path::Path {
        &self.directory
    }

    fn config_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        if !is_name_valid(name) {
            return Err(StoreError::new(format!("invalid tunnel name: {name:?}")));
        }
        Ok(self.directory.join(format!("{name}.{CONFIG_EXTENSION}")))
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn enumerate(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            // An absent directory simply holds no configurations yet.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(CONFIG_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                names.push(stem.to_owned());
            }
        }
        Ok(names)
    }

    async fn load(&self, name: &str) -> Result<TunnelConfig, StoreError> {
        let path = self.config_path(name)?;
        let contents = tokio::fs::read_to_string(&path).await?;
        Ok(TunnelConfig::new(contents))
    }

    async fn save(&self, name: &str, config: &TunnelConfig) -> Result<TunnelConfig, StoreError> {
        let path = self.config_path(name)?;
        tokio::fs::create_dir_all(&self.directory).await?;
        tokio::fs::write(&path, config.contents()).await?;
        debug!(tunnel = %name, path = %path.display(), "configuration saved");
        Ok(config.clone())
    }

    async fn create(&self, name: &str, config: &TunnelConfig) -> Result<TunnelConfig, StoreError> {
        let path = self.config_path(name)?;
        if tokio::fs::try_exists(&path).await? {
            return Err(StoreError::new(format!("config already exists: {name}")));
        }
        self.save(name, config).await
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let path = self.config_path(name)?;
        tokio::fs::remove_file(&path).await?;
        debug!(tunnel = %name, "configuration deleted");
        Ok(())
    }

    async fn rename(&self, old_name: &str, new_name: &str) -> Result<(), StoreError> {
        let old_path = self.config_path(old_name)?;
        let new_path = self.config_path(new_name)?;
        if tokio::fs::try_exists(&new_path).await? {
            return Err(StoreError::new(format!(
                "config already exists: {new_name}"
            )));
        }
        tokio::fs::rename(&old_path, &new_path).await?;
        debug!(from = %old_name, to = %new_name, "configuration renamed");
        Ok(())
    }
}
