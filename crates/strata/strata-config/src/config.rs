use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Where the shared arena and the two semaphore sets live and how big the
/// arena is. Every process on a machine must load the same values.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MboxConfig {
    #[serde(default = "defaults::shm_dir")]
    pub shm_dir: PathBuf,
    #[serde(default = "defaults::arena_name")]
    pub arena_name: String,
    #[serde(default = "defaults::arena_size")]
    pub arena_size: usize,
    #[serde(default = "defaults::lock_sem_key")]
    pub lock_sem_key: u32,
    #[serde(default = "defaults::wait_sem_key")]
    pub wait_sem_key: u32,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

mod defaults {
    use std::path::PathBuf;

    pub fn shm_dir() -> PathBuf {
        "/dev/shm".into()
    }

    pub fn arena_name() -> String {
        "strata-arena".into()
    }

    pub fn arena_size() -> usize {
        4 << 20 // 4 MiB
    }

    pub fn lock_sem_key() -> u32 {
        0x5354_0001
    }

    pub fn wait_sem_key() -> u32 {
        0x5354_0002
    }

    pub fn log_level() -> String {
        "info".into()
    }
}

impl Default for MboxConfig {
    fn default() -> Self {
        Self {
            shm_dir: defaults::shm_dir(),
            arena_name: defaults::arena_name(),
            arena_size: defaults::arena_size(),
            lock_sem_key: defaults::lock_sem_key(),
            wait_sem_key: defaults::wait_sem_key(),
            log_level: defaults::log_level(),
        }
    }
}

impl MboxConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&toml_to_str)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: MboxConfig = toml::from_str(text)?;
        Ok(config)
    }

    pub fn arena_path(&self) -> PathBuf {
        self.shm_dir.join(&self.arena_name)
    }

    /// File backing the semaphore set registered under `key`.
    pub fn sem_path(&self, key: u32) -> PathBuf {
        self.shm_dir.join(format!("strata-sem-{key:08x}"))
    }

    pub fn lock_sem_path(&self) -> PathBuf {
        self.sem_path(self.lock_sem_key)
    }

    pub fn wait_sem_path(&self) -> PathBuf {
        self.sem_path(self.wait_sem_key)
    }
}
