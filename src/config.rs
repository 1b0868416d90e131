//! Configuration types for the runtime client.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level configuration for the runtime client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Server process and health-probe settings.
    pub server: ServerConfig,
    /// Model catalog settings (list/delete/pull).
    pub catalog: CatalogConfig,
    /// Completion streaming settings (chat/generate).
    pub chat: ChatConfig,
}

/// Server process supervision configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host the server binds and is probed on.
    pub host: String,
    /// Port the server binds and is probed on.
    pub port: u16,
    /// Explicit path to the server executable.
    ///
    /// When set, bundled-location and `$PATH` discovery are skipped.
    pub executable_path: Option<PathBuf>,
    /// Executable name used for `$PATH` lookup and orphan matching.
    pub executable_name: String,
    /// Whether the spawn environment enables GPU offload.
    pub gpu_offload: bool,
    /// Extra environment variables applied to the spawned process.
    ///
    /// Applied last, so entries here override the built-in ones.
    pub extra_env: BTreeMap<String, String>,
    /// Health probe timeout in seconds.
    pub probe_timeout_secs: u64,
    /// Interval between health polls while starting, in milliseconds.
    pub health_poll_interval_ms: u64,
    /// How long to wait for the server to become healthy after spawn,
    /// in seconds.
    pub start_timeout_secs: u64,
    /// How long to wait after a graceful termination signal before
    /// force-killing, in seconds.
    pub stop_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 11434,
            executable_path: None,
            executable_name: "ollama".to_string(),
            gpu_offload: true,
            extra_env: BTreeMap::new(),
            probe_timeout_secs: 3,
            health_poll_interval_ms: 500,
            start_timeout_secs: 10,
            stop_grace_secs: 3,
        }
    }
}

impl ServerConfig {
    /// Base URL for API requests, e.g. `http://127.0.0.1:11434`.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Address the spawned server is told to bind, e.g. `127.0.0.1:11434`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Set the probe/bind host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the probe/bind port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set an explicit server executable path.
    pub fn with_executable_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable_path = Some(path.into());
        self
    }

    /// Set the health probe timeout in seconds.
    pub fn with_probe_timeout_secs(mut self, secs: u64) -> Self {
        self.probe_timeout_secs = secs;
        self
    }

    /// Set the health poll interval in milliseconds.
    pub fn with_health_poll_interval_ms(mut self, ms: u64) -> Self {
        self.health_poll_interval_ms = ms;
        self
    }

    /// Set the start window in seconds.
    pub fn with_start_timeout_secs(mut self, secs: u64) -> Self {
        self.start_timeout_secs = secs;
        self
    }

    /// Set the graceful-stop grace period in seconds.
    pub fn with_stop_grace_secs(mut self, secs: u64) -> Self {
        self.stop_grace_secs = secs;
        self
    }
}

/// Model catalog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Timeout for list/delete requests in seconds.
    ///
    /// Pull requests carry no overall timeout; the stall watchdog bounds
    /// them instead.
    pub request_timeout_secs: u64,
    /// Total pull attempts before the last error surfaces.
    pub pull_max_retries: u32,
    /// Stall watchdog window in seconds: a pull attempt is aborted when
    /// no bytes arrive for this long.
    pub stall_timeout_secs: u64,
    /// Base delay for pull retry backoff in milliseconds.
    pub backoff_base_ms: u64,
    /// Backoff delay ceiling in milliseconds.
    pub backoff_cap_ms: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            pull_max_retries: 3,
            stall_timeout_secs: 120,
            backoff_base_ms: 2000,
            backoff_cap_ms: 8000,
        }
    }
}

impl CatalogConfig {
    /// Set the list/delete request timeout in seconds.
    pub fn with_request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Set the total pull attempt budget.
    pub fn with_pull_max_retries(mut self, retries: u32) -> Self {
        self.pull_max_retries = retries;
        self
    }

    /// Set the stall watchdog window in seconds.
    pub fn with_stall_timeout_secs(mut self, secs: u64) -> Self {
        self.stall_timeout_secs = secs;
        self
    }

    /// Set the backoff base and cap in milliseconds.
    pub fn with_backoff_ms(mut self, base_ms: u64, cap_ms: u64) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_cap_ms = cap_ms;
        self
    }
}

/// Completion streaming configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Request timeout for text-only chat/generate, in seconds.
    pub request_timeout_secs: u64,
    /// Request timeout when any message carries image payloads, in
    /// seconds. Vision inference is materially slower.
    pub vision_request_timeout_secs: u64,
    /// Model-name fragments (matched case-insensitively) whose responses
    /// need the aggressive decoder: these servers emit concatenated JSON
    /// objects without newline framing.
    pub aggressive_model_families: Vec<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            vision_request_timeout_secs: 300,
            aggressive_model_families: vec!["deepseek".to_string()],
        }
    }
}

impl ChatConfig {
    /// Set the text-only request timeout in seconds.
    pub fn with_request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Set the vision request timeout in seconds.
    pub fn with_vision_request_timeout_secs(mut self, secs: u64) -> Self {
        self.vision_request_timeout_secs = secs;
        self
    }

    /// Replace the aggressive-decoder model family list.
    pub fn with_aggressive_model_families(mut self, families: Vec<String>) -> Self {
        self.aggressive_model_families = families;
        self
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::RuntimeError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot
    /// be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::RuntimeError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path, e.g.
    /// `~/.config/stoker/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = dirs::config_dir() {
            config.join("stoker").join("config.toml")
        } else {
            PathBuf::from("/tmp/stoker-config/config.toml")
        }
    }
}
