//! TOML configuration for the portal.
//!
//! Layered: an explicit `--config` path wins, then `ADPORTAL_CONFIG`, then
//! `/etc/adportal/adportal.toml`, then compiled-in defaults. Every section is
//! optional and missing keys fall back to their defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ads::Ad;
use crate::retry::RetryPolicy;

pub const CONFIG_ENV: &str = "ADPORTAL_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/adportal/adportal.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortalConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub radius: RadiusConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    // Last: holds an array of tables, which TOML wants after plain values.
    #[serde(default)]
    pub ads: AdsConfig,
}

impl PortalConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded portal configuration");
        Ok(config)
    }

    /// An explicit path must load; otherwise fall through the usual locations.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    /// Try, in order: `ADPORTAL_CONFIG`, `/etc/adportal/adportal.toml`, defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "ADPORTAL_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject settings the access core cannot run safely with.
    pub fn validate(&self) -> Result<()> {
        if self.session.time_budget_secs == 0 {
            bail!("session.time_budget_secs must be positive");
        }
        // A cache entry that dies before the budget would let the cache and
        // the durable record disagree about a live session.
        if self.session.cache_ttl_secs < self.session.time_budget_secs {
            bail!(
                "session.cache_ttl_secs ({}) must be >= session.time_budget_secs ({})",
                self.session.cache_ttl_secs,
                self.session.time_budget_secs
            );
        }
        if self.ads.min_watch_percentage > 100 {
            bail!(
                "ads.min_watch_percentage must be 0-100, got {}",
                self.ads.min_watch_percentage
            );
        }
        if self.radius.attempts == 0 {
            bail!("radius.attempts must be at least 1");
        }
        if self.radius.secret.is_empty() {
            bail!("radius.secret must be set");
        }
        if self.token.secret.is_empty() {
            bail!("token.secret must be set");
        }
        if self.sweeper.interval_secs == 0 {
            bail!("sweeper.interval_secs must be positive");
        }
        self.radius.nas_socket()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server / database
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the JSON API listens on.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file holding sessions and impressions.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/adportal.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long an activated session stays valid.
    pub time_budget_secs: u64,
    /// TTL of the cached session projection. Must be >= the budget.
    pub cache_ttl_secs: u64,
    /// A pending session younger than this is reused by a new request.
    pub pending_reuse_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            time_budget_secs: 900,
            cache_ttl_secs: 3600,
            pending_reuse_secs: 300,
        }
    }
}

impl SessionConfig {
    pub fn time_budget(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.time_budget_secs as i64)
    }

    pub fn pending_reuse(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pending_reuse_secs as i64)
    }

    /// Never shorter than the budget, whatever the file says.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs.max(self.time_budget_secs))
    }
}

// ---------------------------------------------------------------------------
// Ads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdsConfig {
    /// Minimum share of the ad, in percent, that must be watched.
    pub min_watch_percentage: u8,
    /// Base URL of the ad-selection service. Unset means catalog only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    /// Local ads used when no service is configured or it fails.
    pub catalog: Vec<Ad>,
}

impl Default for AdsConfig {
    fn default() -> Self {
        Self {
            min_watch_percentage: 80,
            service_url: None,
            catalog: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// RADIUS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadiusConfig {
    /// NAS dynamic-authorization endpoint (`host:port`, port 3799 by convention).
    pub nas_address: String,
    /// Shared secret with the NAS.
    pub secret: String,
    /// Sent as NAS-Identifier in every request.
    pub nas_identifier: String,
    /// Per-attempt timeout.
    pub timeout_ms: u64,
    /// Total attempts per request, including the first.
    pub attempts: usize,
    /// Linear backoff step between attempts.
    pub retry_backoff_ms: u64,
    /// Idle-Timeout reply attribute.
    pub idle_timeout_secs: u32,
    /// Separate SQLite file for radcheck/radreply. Unset shares the main DB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_db: Option<PathBuf>,
}

impl Default for RadiusConfig {
    fn default() -> Self {
        Self {
            nas_address: "127.0.0.1:3799".to_string(),
            secret: String::new(),
            nas_identifier: "adportal".to_string(),
            timeout_ms: 5000,
            attempts: 3,
            retry_backoff_ms: 200,
            idle_timeout_secs: 300,
            credential_db: None,
        }
    }
}

impl RadiusConfig {
    pub fn nas_socket(&self) -> Result<SocketAddr> {
        self.nas_address
            .parse()
            .with_context(|| format!("radius.nas_address '{}' is not host:port", self.nas_address))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(
            self.attempts,
            Duration::from_millis(self.timeout_ms),
            Duration::from_millis(self.retry_backoff_ms),
        )
    }
}

// ---------------------------------------------------------------------------
// Token / sweeper / logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// HMAC key for completion and access tokens.
    pub secret: String,
    pub issuer: String,
    /// Access token lifetime.
    pub lifetime_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            issuer: "adportal".to_string(),
            lifetime_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub interval_secs: u64,
    /// Impressions older than this are purged by housekeeping.
    pub impression_retention_days: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            impression_retention_days: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of the human format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
