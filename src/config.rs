//! Daemon configuration.
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no file
//! at all) yields a working configuration:
//!
//! ```toml
//! [socket]
//! primary_path = "/run/inputbridge/inputbridge.sock"
//! fallback_path = "/tmp/inputbridge.sock"
//! mode = 0o660
//!
//! [security]
//! group = "inputbridge"
//! polkit_action = "org.inputbridge.capture"
//! policy_timeout_ms = 5000
//! auth_cache_ttl_secs = 30
//!
//! [rate_limit]
//! max_attempts = 10
//! window_secs = 60
//! ban_secs = 300
//!
//! [session]
//! handshake_timeout_ms = 5000
//! default_width = 1920
//! default_height = 1080
//! outbound_queue = 1024
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_PRIMARY_SOCKET: &str = "/run/inputbridge/inputbridge.sock";
pub const DEFAULT_FALLBACK_SOCKET: &str = "/tmp/inputbridge.sock";

/// System-wide config location consulted when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/inputbridge/daemon.toml";

/// Environment variable that overrides `DEFAULT_CONFIG_PATH`.
pub const CONFIG_ENV_VAR: &str = "INPUTBRIDGE_CONFIG";

/// Longest accepted handshake or policy timeout (5 minutes).
const MAX_TIMEOUT_MS: u64 = 5 * 60 * 1000;
/// Longest accepted rate-limit window, ban or cache TTL (30 days).
const MAX_PERIOD_SECS: u64 = 30 * 24 * 60 * 60;
const MAX_OUTBOUND_QUEUE: u64 = 1 << 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// toml reports line and column in its message.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub socket: SocketConfig,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SocketConfig {
    pub primary_path: PathBuf,
    pub fallback_path: PathBuf,
    /// Permission bits applied to the socket file after bind.
    pub mode: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            primary_path: PathBuf::from(DEFAULT_PRIMARY_SOCKET),
            fallback_path: PathBuf::from(DEFAULT_FALLBACK_SOCKET),
            mode: 0o660,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityConfig {
    /// Access-control group whose members may connect.
    pub group: String,
    /// Policy action id checked for every connecting process.
    pub polkit_action: String,
    pub policy_timeout_ms: u64,
    pub auth_cache_ttl_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            group: "inputbridge".into(),
            polkit_action: "org.inputbridge.capture".into(),
            policy_timeout_ms: 5_000,
            auth_cache_ttl_secs: 30,
        }
    }
}

impl SecurityConfig {
    pub fn policy_timeout(&self) -> Duration {
        Duration::from_millis(self.policy_timeout_ms)
    }

    pub fn auth_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.auth_cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Connection attempts allowed per window before a ban.
    pub max_attempts: u32,
    pub window_secs: u64,
    pub ban_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            window_secs: 60,
            ban_secs: 300,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn ban(&self) -> Duration {
        Duration::from_secs(self.ban_secs)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub handshake_timeout_ms: u64,
    /// Geometry applied to the virtual device when capture starts.
    pub default_width: i32,
    pub default_height: i32,
    /// Frames buffered per connection before captured events are dropped.
    pub outbound_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            default_width: 1920,
            default_height: 1080,
            outbound_queue: 1024,
        }
    }
}

impl SessionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl DaemonConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: DaemonConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Resolves the config source: explicit path, then `$INPUTBRIDGE_CONFIG`,
    /// then the system default if it exists, else built-in defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR).filter(|v| !v.is_empty()) {
            return Self::load(Path::new(&path));
        }
        let system = Path::new(DEFAULT_CONFIG_PATH);
        if system.exists() {
            return Self::load(system);
        }
        log::info!("config: no config file found, using defaults");
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_owned()));

        if self.socket.primary_path.as_os_str().is_empty() {
            return invalid("socket.primary_path must not be empty");
        }
        if self.security.group.trim().is_empty() {
            return invalid("security.group must not be empty");
        }
        if self.security.polkit_action.trim().is_empty() {
            return invalid("security.polkit_action must not be empty");
        }
        if self.security.policy_timeout_ms == 0 {
            return invalid("security.policy_timeout_ms must be positive");
        }
        if self.rate_limit.max_attempts == 0 {
            return invalid("rate_limit.max_attempts must be positive");
        }
        if self.rate_limit.window_secs == 0 {
            return invalid("rate_limit.window_secs must be positive");
        }
        if self.session.handshake_timeout_ms == 0 {
            return invalid("session.handshake_timeout_ms must be positive");
        }
        if self.session.default_width <= 0 || self.session.default_height <= 0 {
            return invalid("session default geometry must be positive");
        }
        if self.session.outbound_queue == 0 {
            return invalid("session.outbound_queue must be positive");
        }

        let limits: [(&str, u64, u64); 6] = [
            ("security.policy_timeout_ms", self.security.policy_timeout_ms, MAX_TIMEOUT_MS),
            ("session.handshake_timeout_ms", self.session.handshake_timeout_ms, MAX_TIMEOUT_MS),
            ("security.auth_cache_ttl_secs", self.security.auth_cache_ttl_secs, MAX_PERIOD_SECS),
            ("rate_limit.window_secs", self.rate_limit.window_secs, MAX_PERIOD_SECS),
            ("rate_limit.ban_secs", self.rate_limit.ban_secs, MAX_PERIOD_SECS),
            ("session.outbound_queue", self.session.outbound_queue as u64, MAX_OUTBOUND_QUEUE),
        ];
        for (key, value, max) in limits {
            if value > max {
                return Err(ConfigError::Invalid(format!("{key} must be at most {max}")));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
