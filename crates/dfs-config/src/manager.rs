use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::{Config, ConfigError};

/// Holds the live configuration and swaps it atomically on reload.
pub struct ConfigManager<T: Config> {
    config: ArcSwap<T>,
    path: Option<PathBuf>,
}

impl<T: Config> ConfigManager<T> {
    pub fn new(config: T) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            path: None,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = Self::read_file(path)?;
        Ok(Self {
            config: ArcSwap::from_pointee(config),
            path: Some(path.to_path_buf()),
        })
    }

    fn read_file(path: &Path) -> Result<T, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let value: toml::Value = content.parse()?;
        let config = T::from_toml(&value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn get(&self) -> arc_swap::Guard<Arc<T>> {
        self.config.load()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn update(&self, new_config: T) -> Result<(), ConfigError> {
        new_config.validate()?;
        self.config.store(Arc::new(new_config));
        Ok(())
    }
}

impl<T: Config + Clone> ConfigManager<T> {
    /// Re-read the backing file and apply only its hot-updatable fields.
    ///
    /// A manager built with [`ConfigManager::new`] has no file and this is a
    /// no-op.
    pub fn reload(&self) -> Result<(), ConfigError> {
        if let Some(ref path) = self.path {
            let new_config = Self::read_file(path)?;

            let mut current = (*self.config.load_full()).clone();
            current.hot_update(&new_config);
            current.validate()?;
            self.config.store(Arc::new(current));

            tracing::info!(path = %path.display(), "config reloaded");
        }
        Ok(())
    }

    pub fn snapshot(&self) -> T {
        (*self.config.load_full()).clone()
    }
}
