//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use crate::Result;
use crate::error::Error;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Identity provider settings
    #[serde(default)]
    pub auth: AuthConfig,

    /// VM management API settings
    #[serde(default)]
    pub vm: VmConfig,

    /// Object storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Task polling settings
    #[serde(default)]
    pub tracker: TrackerConfig,
}

/// Identity provider (Keycloak realm) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Base URL of the identity provider, e.g. https://auth.example.org
    #[serde(default)]
    pub server_url: String,

    #[serde(default = "default_realm")]
    pub realm: String,

    /// Client ids this CLI is allowed to authenticate as
    #[serde(default)]
    pub supported_clients: Vec<String>,

    #[serde(default = "default_scope")]
    pub scope: String,

    /// Local port for the browser redirect listener
    #[serde(default = "default_callback_port")]
    pub callback_port: u16,

    /// How long to wait for the browser login before giving up
    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,
}

/// VM management API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    #[serde(default = "default_template")]
    pub default_template: String,

    #[serde(default = "default_storage_device")]
    pub default_storage: String,

    #[serde(default = "default_remote_viewer")]
    pub remote_viewer: PathBuf,

    /// Seconds to wait for a freshly started VM to boot
    #[serde(default = "default_boot_wait_secs")]
    pub boot_wait_secs: u64,

    /// Attempts for state-mutating provisioning calls
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_vcpus")]
    pub vcpus: u32,

    /// Memory in MiB
    #[serde(default = "default_memory")]
    pub memory: u64,
}

/// Object storage (S3-compatible) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// STS / S3 endpoint URL
    #[serde(default)]
    pub url: String,

    /// Web console URL
    #[serde(default)]
    pub ui_url: String,

    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    /// Credential validity requested from the STS endpoint
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
}

/// Polling intervals for long-running VM tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_log_interval_ms")]
    pub log_interval_ms: u64,

    #[serde(default = "default_settle_interval_ms")]
    pub settle_interval_ms: u64,
}

fn default_realm() -> String {
    "UO".to_string()
}

fn default_scope() -> String {
    "email".to_string()
}

fn default_callback_port() -> u16 {
    8239
}

fn default_login_timeout_secs() -> u64 {
    300
}

fn default_template() -> String {
    "linux-mint-201-template".to_string()
}

fn default_storage_device() -> String {
    "luna".to_string()
}

fn default_remote_viewer() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Program Files\VirtViewer\bin\remote-viewer.exe")
    } else {
        PathBuf::from("/usr/local/bin/remote-viewer")
    }
}

fn default_boot_wait_secs() -> u64 {
    40
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_vcpus() -> u32 {
    4
}

fn default_memory() -> u64 {
    16384
}

fn default_duration_secs() -> u64 {
    31_536_000
}

fn default_log_interval_ms() -> u64 {
    1000
}

fn default_settle_interval_ms() -> u64 {
    2000
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            realm: default_realm(),
            supported_clients: Vec::new(),
            scope: default_scope(),
            callback_port: default_callback_port(),
            login_timeout_secs: default_login_timeout_secs(),
        }
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            default_template: default_template(),
            default_storage: default_storage_device(),
            remote_viewer: default_remote_viewer(),
            boot_wait_secs: default_boot_wait_secs(),
            retry_attempts: default_retry_attempts(),
            vcpus: default_vcpus(),
            memory: default_memory(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            ui_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            duration_secs: default_duration_secs(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            log_interval_ms: default_log_interval_ms(),
            settle_interval_ms: default_settle_interval_ms(),
        }
    }
}

impl TrackerConfig {
    pub fn log_interval(&self) -> Duration {
        Duration::from_millis(self.log_interval_ms)
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }
}

impl Config {
    /// Check that the endpoints needed by the CLI are filled in
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("auth.server_url", &self.auth.server_url),
            ("vm.url", &self.vm.url),
            ("vm.client_id", &self.vm.client_id),
            ("storage.url", &self.storage.url),
            ("storage.client_id", &self.storage.client_id),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(Error::Config(format!(
                    "'{}' is not set in {:?}",
                    name,
                    config_path()
                )));
            }
        }
        Ok(())
    }
}

/// Get the config directory path
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".muon")
}

/// Get the config file path
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Get the OIDC token cache path
pub fn token_cache_path() -> PathBuf {
    config_dir().join("auth_tokens")
}

/// Get the AWS-CLI style directory holding storage credentials
pub fn aws_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".aws")
}

/// Load configuration from file
pub fn load() -> Result<Config> {
    let path = config_path();

    if !path.exists() {
        return Err(Error::Config(format!(
            "Config not found at {:?}. Run 'muon init' first.",
            path
        )));
    }

    let content = std::fs::read_to_string(&path)?;
    let config: Config = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Save configuration to file
pub fn save(config: &Config) -> Result<()> {
    let path = config_path();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, content)?;
    Ok(())
}

/// Interactive setup wizard
pub fn init() -> Result<()> {
    use crate::ui;
    use inquire::{Password, Text};

    fn prompt_err(e: inquire::InquireError) -> Error {
        Error::Config(format!("Prompt failed: {}", e))
    }

    ui::print_step("Let's point muon at your backend.");

    let mut config = match load() {
        Ok(existing) => existing,
        Err(_) => Config::default(),
    };

    config.auth.server_url = Text::new("Identity provider URL:")
        .with_initial_value(&config.auth.server_url)
        .prompt()
        .map_err(prompt_err)?;
    config.auth.realm = Text::new("Realm:")
        .with_initial_value(&config.auth.realm)
        .prompt()
        .map_err(prompt_err)?;

    config.vm.url = Text::new("VM API URL:")
        .with_initial_value(&config.vm.url)
        .prompt()
        .map_err(prompt_err)?;
    config.vm.client_id = Text::new("VM API client id:")
        .with_initial_value(&config.vm.client_id)
        .prompt()
        .map_err(prompt_err)?;
    config.vm.client_secret = Password::new("VM API client secret:")
        .without_confirmation()
        .prompt()
        .map_err(prompt_err)?;

    config.storage.url = Text::new("Storage (STS) URL:")
        .with_initial_value(&config.storage.url)
        .prompt()
        .map_err(prompt_err)?;
    config.storage.ui_url = Text::new("Storage console URL:")
        .with_initial_value(&config.storage.ui_url)
        .prompt()
        .map_err(prompt_err)?;
    config.storage.client_id = Text::new("Storage client id:")
        .with_initial_value(&config.storage.client_id)
        .prompt()
        .map_err(prompt_err)?;
    config.storage.client_secret = Password::new("Storage client secret:")
        .without_confirmation()
        .prompt()
        .map_err(prompt_err)?;

    for client in [&config.vm.client_id, &config.storage.client_id] {
        if !config.auth.supported_clients.contains(client) {
            config.auth.supported_clients.push(client.clone());
        }
    }

    config.validate()?;

    ui::print_thinking("Saving configuration");
    save(&config)?;
    ui::print_success(&format!("Configuration written to {:?}", config_path()));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.auth.realm, "UO");
        assert_eq!(config.auth.callback_port, 8239);
        assert_eq!(config.vm.retry_attempts, 3);
        assert_eq!(config.storage.duration_secs, 31_536_000);
        assert_eq!(config.tracker.log_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{"auth": {"server_url": "https://auth.example.org"}, "vm": {"url": "https://vm.example.org"}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.auth.server_url, "https://auth.example.org");
        assert_eq!(config.auth.scope, "email");
        assert_eq!(config.vm.default_storage, "luna");
        assert_eq!(config.tracker.settle_interval_ms, 2000);
    }

    #[test]
    fn test_validate_reports_missing_field() {
        let config = Config::default();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("auth.server_url"));
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.auth.supported_clients = vec!["vm-cli".to_string()];
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.auth.supported_clients, config.auth.supported_clients);
        assert_eq!(parsed.vm.memory, config.vm.memory);
    }
}
