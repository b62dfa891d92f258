//! Server configuration.
//!
//! Loaded from an optional TOML file, then environment overrides
//! (`TOSSBOOK_*`), then command line overrides applied by the binary.
//! `ServerConfig::default()` runs entirely in memory.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Multiplier used when a match's odds table has no entry for the backed side.
pub const DEFAULT_ODDS: Decimal = Decimal::from_parts(198, 0, 0, false, 2);

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Websocket listen address.
    pub listen_addr: String,

    /// Default tracing filter, `RUST_LOG` wins when set.
    pub log_level: String,

    /// Capacity of each actor's work queue.
    pub queue_depth: usize,

    /// Name of an admin to create on startup if no admin exists yet.
    pub bootstrap_admin: Option<String>,

    pub database: DatabaseConfig,

    pub betting: BettingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:6379".to_string(),
            log_level: "info".to_string(),
            queue_depth: 32,
            bootstrap_admin: None,
            database: DatabaseConfig::default(),
            betting: BettingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Any surrealdb endpoint: `mem://`, `ws://host:port`, ...
    pub endpoint: String,
    pub namespace: String,
    pub database: String,
    /// Root credentials, only used when both are set.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Attempts made before startup gives up on the store.
    pub connect_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "tossbook".to_string(),
            database: "ledger".to_string(),
            username: None,
            password: None,
            connect_retries: 5,
            retry_delay_ms: 5000,
        }
    }
}

impl DatabaseConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BettingConfig {
    pub default_odds: Decimal,
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for BettingConfig {
    fn default() -> Self {
        Self {
            default_odds: DEFAULT_ODDS,
            default_page_size: 20,
            max_page_size: 100,
        }
    }
}

impl BettingConfig {
    /// Zero means "default"; anything above the maximum is capped.
    pub fn page_limit(&self, requested: u32) -> u32 {
        match requested {
            0 => self.default_page_size,
            n => n.min(self.max_page_size),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: ServerConfig = toml::from_str(raw).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies `TOSSBOOK_*` overrides read through `lookup`.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(addr) = lookup("TOSSBOOK_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(level) = lookup("TOSSBOOK_LOG") {
            self.log_level = level;
        }
        if let Some(admin) = lookup("TOSSBOOK_BOOTSTRAP_ADMIN") {
            self.bootstrap_admin = Some(admin);
        }
        if let Some(endpoint) = lookup("TOSSBOOK_DB_ENDPOINT") {
            self.database.endpoint = endpoint;
        }
        if let Some(namespace) = lookup("TOSSBOOK_DB_NAMESPACE") {
            self.database.namespace = namespace;
        }
        if let Some(database) = lookup("TOSSBOOK_DB_DATABASE") {
            self.database.database = database;
        }
        if let Some(username) = lookup("TOSSBOOK_DB_USER") {
            self.database.username = Some(username);
        }
        if let Some(password) = lookup("TOSSBOOK_DB_PASS") {
            self.database.password = Some(password);
        }
        if let Some(odds) = lookup("TOSSBOOK_DEFAULT_ODDS") {
            self.betting.default_odds = Decimal::from_str(odds.trim())
                .with_context(|| format!("TOSSBOOK_DEFAULT_ODDS is not a number: {odds}"))?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_depth == 0 {
            bail!("queue_depth must be at least 1");
        }
        if self.betting.default_odds < Decimal::ONE {
            bail!("default_odds must be at least 1, got {}", self.betting.default_odds);
        }
        if self.betting.default_page_size == 0 || self.betting.max_page_size == 0 {
            bail!("page sizes must be positive");
        }
        if self.betting.default_page_size > self.betting.max_page_size {
            bail!("default_page_size exceeds max_page_size");
        }
        if self.database.connect_retries == 0 {
            bail!("database.connect_retries must be at least 1");
        }
        Ok(())
    }
}
