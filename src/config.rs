//! Configuration types for preview sessions and the render authority.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Render request batching.
    pub batcher: BatcherConfig,
    /// Pane/preview message channel.
    pub messenger: MessengerConfig,
    /// Render authority server.
    pub authority: AuthorityConfig,
    /// Log filter for the binaries.
    pub logging: LoggingConfig,
}

/// Debounce settings for the render request batcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Debounce window in milliseconds. Every refresh inside one window shares
    /// a single round trip.
    pub debounce_ms: u64,
}

impl BatcherConfig {
    /// Debounce window as a [`Duration`].
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self { debounce_ms: 150 }
    }
}

/// Message channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessengerConfig {
    /// Buffered envelopes per direction for line bridges.
    pub capacity: usize,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

/// A token accepted by the render authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenConfig {
    pub token: String,
    /// Whether the holder may render previews.
    #[serde(default = "default_can_customize")]
    pub can_customize: bool,
}

fn default_can_customize() -> bool {
    true
}

/// A template partial served by the standalone authority binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplatePartialConfig {
    pub id: String,
    /// Related setting ids. Defaults to `[id]`.
    #[serde(default)]
    pub settings: Vec<String>,
    /// Partial type. Defaults to `default`.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Markup with `{{setting_id}}` placeholders.
    pub template: String,
}

/// Render authority server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Bind host.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Route serving render batches.
    pub route: String,
    /// Secret mixed into structural context signatures.
    pub signing_secret: String,
    /// Accepted auth tokens.
    pub tokens: Vec<TokenConfig>,
    /// Template partials registered at startup.
    pub partials: Vec<TemplatePartialConfig>,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 0,
            route: "/partials".to_owned(),
            signing_secret: String::new(),
            tokens: Vec::new(),
            partials: Vec::new(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `tracing_subscriber::EnvFilter` directive when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
        }
    }
}

impl RefreshConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::RefreshError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::RefreshError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/partial-refresh/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config)
                .join("partial-refresh")
                .join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("partial-refresh")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/partial-refresh-config/config.toml")
        }
    }
}
