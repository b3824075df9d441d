//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: API
//! location, renewal endpoint, login entry point and tenant context.
//!
//! Configuration is stored at `~/.config/authkeeper/config.json`. A few
//! fields can be overridden from the environment (see [`Config::apply_overrides`]).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::storage::{FileStorage, KeyValueStore, KeyringStorage};

/// Application name used for config/data directory paths
const APP_NAME: &str = "authkeeper";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default path of the renewal endpoint, relative to the API base URL
const DEFAULT_RENEWAL_PATH: &str = "/auth/refresh";

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Environment variables that override config file values
pub const ENV_API_URL: &str = "AUTHKEEPER_API_URL";
pub const ENV_LOGIN_URL: &str = "AUTHKEEPER_LOGIN_URL";
pub const ENV_TENANT: &str = "AUTHKEEPER_TENANT";
pub const ENV_LOCALE: &str = "AUTHKEEPER_LOCALE";

/// Where the durable storage tier lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurableBackend {
    /// JSON file in the user's data directory
    #[default]
    File,
    /// OS keychain
    Keyring,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub renewal_path: String,
    pub login_url: String,
    pub tenant_id: Option<String>,
    pub locale: String,
    pub request_timeout_secs: u64,
    pub durable_backend: DurableBackend,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".to_string(),
            renewal_path: DEFAULT_RENEWAL_PATH.to_string(),
            login_url: "http://localhost:8080/login".to_string(),
            tenant_id: None,
            locale: "en".to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            durable_backend: DurableBackend::File,
        }
    }
}

/// Tenant-identifying values attached to every outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TenantContext {
    pub tenant_id: Option<String>,
    pub locale: String,
}

impl Config {
    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Override fields from variables resolved by `lookup`. Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_API_URL) {
            self.api_base_url = url;
        }
        if let Some(url) = get(ENV_LOGIN_URL) {
            self.login_url = url;
        }
        if let Some(tenant) = get(ENV_TENANT) {
            self.tenant_id = Some(tenant);
        }
        if let Some(locale) = get(ENV_LOCALE) {
            self.locale = locale;
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Full URL of the renewal endpoint
    pub fn renewal_url(&self) -> String {
        self.url_for(&self.renewal_path)
    }

    /// Join a path onto the API base URL
    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn tenant(&self) -> TenantContext {
        TenantContext {
            tenant_id: self.tenant_id.clone(),
            locale: self.locale.clone(),
        }
    }

    /// Open the durable storage tier selected by `durable_backend`.
    pub fn durable_storage(&self) -> Result<Arc<dyn KeyValueStore>> {
        Ok(match self.durable_backend {
            DurableBackend::File => Arc::new(FileStorage::in_dir(&Self::data_dir()?)),
            DurableBackend::Keyring => Arc::new(KeyringStorage::new(APP_NAME)),
        })
    }
}
