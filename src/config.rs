//! Configuration file parser for the bot's TOML config.
//!
//! Unlike most optional settings, the file itself is required: without a
//! homeserver and token there is nothing to post to. Unknown keys are
//! accepted by serde but logged as warnings to catch typos.
use crate::format::FormatStyle;
use crate::matrix::DEFAULT_API_PREFIX;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Environment variable that overrides `as_token` from the file.
pub const TOKEN_ENV_VAR: &str = "RSSBOT_AS_TOKEN";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// One feed posted into one room.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoomMapping {
    pub room_id: String,
    pub feed_url: String,
    #[serde(default)]
    pub format: FormatStyle,
}

/// Top-level bot configuration.
///
/// SEC-015: Custom Debug impl masks `as_token` to prevent secret leakage
/// in logs, error messages, and debug output.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the Matrix homeserver, e.g. `https://matrix.example.org`.
    pub homeserver_url: String,

    /// Access token sent with every homeserver request.
    /// `RSSBOT_AS_TOKEN` takes precedence when set.
    pub as_token: String,

    /// Matrix user the bot posts as. Informational.
    pub bot_username: String,

    /// Feeds and the rooms they are posted to.
    pub room_mapping: Vec<RoomMapping>,

    /// Append-only file of entry ids that were already posted.
    pub entry_cache_path: String,

    /// Seconds between two checks of the same feed.
    pub poll_interval_secs: u64,

    /// Client-server API path prefix.
    pub api_prefix: String,

    /// Delay before the first retry of a rate-limited message, in milliseconds.
    pub backoff_unit_ms: u64,

    /// Upper bound on a single retry delay, in seconds.
    pub max_backoff_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            homeserver_url: String::new(),
            as_token: String::new(),
            bot_username: String::new(),
            room_mapping: Vec::new(),
            entry_cache_path: "entries.txt".to_string(),
            poll_interval_secs: 60,
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            backoff_unit_ms: 1000,
            max_backoff_secs: 3600,
        }
    }
}

/// SEC-015: Mask as_token in Debug output to prevent secret leakage.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("homeserver_url", &self.homeserver_url)
            .field(
                "as_token",
                &if self.as_token.is_empty() { "" } else { "[REDACTED]" },
            )
            .field("bot_username", &self.bot_username)
            .field("room_mapping", &self.room_mapping)
            .field("entry_cache_path", &self.entry_cache_path)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("api_prefix", &self.api_prefix)
            .field("backoff_unit_ms", &self.backoff_unit_ms)
            .field("max_backoff_secs", &self.max_backoff_secs)
            .finish()
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 9] = [
        "homeserver_url",
        "as_token",
        "bot_username",
        "room_mapping",
        "entry_cache_path",
        "poll_interval_secs",
        "api_prefix",
        "backoff_unit_ms",
        "max_backoff_secs",
    ];

    /// Load and validate configuration from a TOML file, then apply the
    /// `RSSBOT_AS_TOKEN` override.
    ///
    /// - Missing file → `Err(ConfigError::Io)`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Missing or malformed required settings → `Err(ConfigError::Invalid)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_file(path)?;
        if let Ok(token) = std::env::var(TOKEN_ENV_VAR) {
            if !token.is_empty() {
                tracing::debug!("Using access token from {}", TOKEN_ENV_VAR);
                config.as_token = token;
            }
        }
        config.validate()?;

        tracing::info!(
            path = %path.display(),
            homeserver = %config.homeserver_url,
            feeds = config.room_mapping.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse the file without applying overrides or validation.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        // SEC-014: Check file size before reading to prevent memory exhaustion
        // from a maliciously large or corrupted config file.
        let meta = std::fs::metadata(path)?;
        if meta.len() > Self::MAX_FILE_SIZE {
            return Err(ConfigError::TooLarge(format!(
                "Config file is {} bytes (max {} bytes)",
                meta.len(),
                Self::MAX_FILE_SIZE
            )));
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        Ok(toml::from_str(content)?)
    }

    /// Checks that the bot can actually run with these settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_http_url("homeserver_url", &self.homeserver_url)?;

        if self.as_token.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "as_token is empty (set it in the file or via {TOKEN_ENV_VAR})"
            )));
        }
        if self.entry_cache_path.trim().is_empty() {
            return Err(ConfigError::Invalid("entry_cache_path is empty".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be greater than zero".into(),
            ));
        }
        if self.backoff_unit_ms == 0 {
            return Err(ConfigError::Invalid(
                "backoff_unit_ms must be greater than zero".into(),
            ));
        }
        if self.max_backoff_secs == 0 {
            return Err(ConfigError::Invalid(
                "max_backoff_secs must be greater than zero".into(),
            ));
        }
        if self.max_backoff() < self.backoff_unit() {
            return Err(ConfigError::Invalid(format!(
                "max_backoff_secs ({}s) is shorter than backoff_unit_ms ({}ms)",
                self.max_backoff_secs, self.backoff_unit_ms
            )));
        }

        for (i, mapping) in self.room_mapping.iter().enumerate() {
            if mapping.room_id.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "room_mapping[{i}] has an empty room_id"
                )));
            }
            require_http_url(&format!("room_mapping[{i}].feed_url"), &mapping.feed_url)?;
        }

        if self.room_mapping.is_empty() {
            tracing::warn!("No room_mapping entries configured, nothing will be posted");
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

fn require_http_url(field: &str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value)
        .map_err(|e| ConfigError::Invalid(format!("{field} '{value}' is not a URL: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(ConfigError::Invalid(format!(
            "{field} uses unsupported scheme '{scheme}' (only http/https allowed)"
        ))),
    }
}

// ============================================================================
// Tests
// ============================================================================
