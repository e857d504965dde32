use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::POLL_INTERVAL;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Accounts whose event streams are synchronized.
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Opaque user id assigned by the remote service.
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds between event-log polls when nothing forces an earlier one.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding per-user store databases. Defaults to the
    /// platform data directory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl StoreConfig {
    /// Database path for one user's store.
    pub fn db_path(&self, user_id: &str) -> Result<PathBuf> {
        let dir = match &self.dir {
            Some(dir) => dir.clone(),
            None => Config::data_dir()?,
        };
        Ok(dir.join(format!("store-{}.db", user_id)))
    }
}

fn default_poll_interval_secs() -> u64 {
    POLL_INTERVAL.as_secs()
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("mailbridge");
        Ok(dir)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn data_dir() -> Result<PathBuf> {
        let dir = dirs::data_local_dir()
            .context("Could not find data directory")?
            .join("mailbridge");
        Ok(dir)
    }

    pub fn account_by_user_id(&self, user_id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.user_id == user_id)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            anyhow::bail!(
                "Configuration file not found at {}\n\
                 Please create a config file. Example:\n\n\
                 [[accounts]]\n\
                 user_id = \"user-1\"\n\
                 email = \"you@example.com\"\n\n\
                 [sync]\n\
                 poll_interval_secs = 30",
                path.display()
            );
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).context("Failed to parse configuration")?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(Self::config_dir()?)?;
        if let Some(dir) = &self.store.dir {
            fs::create_dir_all(dir)?;
        } else {
            fs::create_dir_all(Self::data_dir()?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [[accounts]]
            user_id = "user-1"
            email = "personal@example.com"

            [[accounts]]
            user_id = "user-2"
            email = "work@company.com"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.sync.poll_interval(), Duration::from_secs(30));
        assert_eq!(
            config.account_by_user_id("user-2").unwrap().email,
            "work@company.com"
        );
    }

    #[test]
    fn test_poll_interval_override() {
        let toml = r#"
            [sync]
            poll_interval_secs = 5
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.sync.poll_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_store_db_path_uses_configured_dir() {
        let config: Config = toml::from_str(
            r#"
            [store]
            dir = "/tmp/bridge-stores"
        "#,
        )
        .unwrap();

        let path = config.store.db_path("user-9").unwrap();
        assert_eq!(path, PathBuf::from("/tmp/bridge-stores/store-user-9.db"));
    }
}
