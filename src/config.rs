// src/config.rs

//! Manages cache configuration: loading, resolving size strings, and validation.

use crate::core::clock::SharedClock;
use crate::core::interceptor::CacheOptions;
use crate::core::policy::{CacheType, is_unsafe_method};
use crate::core::storage::{
    MemoryStore, MemoryStoreConfig, PersistentStore, SharedStore, SqliteStoreConfig,
};
use anyhow::{Context, Result, anyhow};
use http::Method;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Which `CacheStore` implementation backs the cache.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Sqlite,
}

/// Interceptor behaviour.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CacheConfig {
    #[serde(default)]
    pub cache_type: CacheType,
    /// Methods whose responses are cached. Only safe methods are accepted.
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    /// Serve stale-while-revalidate entries immediately and refresh them in
    /// the background.
    #[serde(default = "default_background_revalidation")]
    pub background_revalidation: bool,
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string()]
}
fn default_background_revalidation() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_type: CacheType::default(),
            methods: default_methods(),
            background_revalidation: default_background_revalidation(),
        }
    }
}

/// A size given either as a plain byte count or as a string with a unit.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum SizeConfig {
    Bytes(usize),
    String(String),
}

#[derive(Deserialize, Debug, Default)]
struct RawStoreConfig {
    #[serde(default)]
    kind: StoreKind,
    #[serde(default)]
    max_count: Option<usize>,
    #[serde(default)]
    max_size: Option<SizeConfig>,
    #[serde(default)]
    max_entry_size: Option<SizeConfig>,
    #[serde(default)]
    path: Option<String>,
}

/// Store selection and limits, with sizes resolved to bytes.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_count: Option<usize>,
    /// Total body bytes; memory store only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_entry_size: Option<usize>,
    /// Database file for the sqlite store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Settings for the periodic expiry sweep.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SweeperConfig {
    #[serde(default = "default_sweeper_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sweeper_interval")]
    pub interval_secs: u64,
}

fn default_sweeper_enabled() -> bool {
    true
}
fn default_sweeper_interval() -> u64 {
    60
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: default_sweeper_enabled(),
            interval_secs: default_sweeper_interval(),
        }
    }
}

/// Configuration for the Prometheus metrics dump.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, the collected metrics are printed once all requests are done.
    #[serde(default)]
    pub enabled: bool,
}

/// A raw representation of the config file before validation and resolution.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    cache: CacheConfig,
    #[serde(default)]
    store: RawStoreConfig,
    #[serde(default)]
    sweeper: SweeperConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Represents the final, validated, and resolved configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub log_level: String,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            cache: CacheConfig::default(),
            store: StoreConfig::default(),
            sweeper: SweeperConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to load config from '{path}'"))
    }

    /// Parses, resolves, and validates a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let raw_config: RawConfig = toml::from_str(contents).context("Failed to parse TOML")?;
        let raw_store = raw_config.store;

        let config = Config {
            log_level: raw_config.log_level,
            cache: raw_config.cache,
            store: StoreConfig {
                kind: raw_store.kind,
                max_count: raw_store.max_count,
                max_size: raw_store
                    .max_size
                    .map(|s| resolve_size("store.max_size", s))
                    .transpose()?,
                max_entry_size: raw_store
                    .max_entry_size
                    .map(|s| resolve_size("store.max_entry_size", s))
                    .transpose()?,
                path: raw_store.path,
            },
            sweeper: raw_config.sweeper,
            metrics: raw_config.metrics,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    fn validate(&self) -> Result<()> {
        if self.log_level.trim().is_empty() {
            return Err(anyhow!("log_level cannot be empty"));
        }
        if self.cache.methods.is_empty() {
            return Err(anyhow!("cache.methods cannot be empty"));
        }
        for method in self.cacheable_methods()? {
            if is_unsafe_method(&method) {
                return Err(anyhow!(
                    "cache.methods cannot contain the unsafe method {method}"
                ));
            }
        }

        for (name, limit) in [
            ("store.max_count", self.store.max_count),
            ("store.max_size", self.store.max_size),
            ("store.max_entry_size", self.store.max_entry_size),
        ] {
            if limit == Some(0) {
                return Err(anyhow!("{name} cannot be 0"));
            }
        }
        if let (Some(total), Some(entry)) = (self.store.max_size, self.store.max_entry_size)
            && entry > total
        {
            warn!(
                "store.max_entry_size ({} bytes) is larger than store.max_size ({} bytes).",
                entry, total
            );
        }

        match self.store.kind {
            StoreKind::Sqlite => {
                if self
                    .store
                    .path
                    .as_deref()
                    .is_some_and(|p| p.trim().is_empty())
                {
                    return Err(anyhow!("store.path cannot be empty"));
                }
                if self.store.max_size.is_some() {
                    warn!("store.max_size is ignored by the sqlite store; use max_count.");
                }
            }
            StoreKind::Memory => {
                if self.store.path.is_some() {
                    warn!("store.path is ignored by the memory store.");
                }
            }
        }

        if self.sweeper.enabled && self.sweeper.interval_secs == 0 {
            return Err(anyhow!("sweeper.interval_secs cannot be 0"));
        }
        Ok(())
    }

    /// The configured cacheable methods, parsed.
    pub fn cacheable_methods(&self) -> Result<Vec<Method>> {
        self.cache
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes())
                    .with_context(|| format!("Invalid HTTP method '{m}' in cache.methods"))
            })
            .collect()
    }

    /// Builds the configured store.
    pub fn open_store(&self, clock: SharedClock) -> Result<SharedStore> {
        let store: SharedStore = match self.store.kind {
            StoreKind::Memory => {
                let store = MemoryStore::new(MemoryStoreConfig {
                    max_count: self.store.max_count,
                    max_size: self.store.max_size,
                    max_entry_size: self.store.max_entry_size,
                    clock,
                })?;
                info!("Using in-memory cache store.");
                Arc::new(store)
            }
            StoreKind::Sqlite => {
                let store = PersistentStore::open(SqliteStoreConfig {
                    path: self.store.path.as_ref().map(PathBuf::from),
                    max_count: self.store.max_count,
                    max_entry_size: self.store.max_entry_size,
                    clock,
                })
                .context("Failed to open the sqlite cache store")?;
                Arc::new(store)
            }
        };
        Ok(store)
    }

    /// Interceptor options for `store`.
    pub fn cache_options(&self, store: SharedStore, clock: SharedClock) -> Result<CacheOptions> {
        Ok(CacheOptions::new(store)
            .cache_type(self.cache.cache_type)
            .methods(self.cacheable_methods()?)
            .background_revalidation(self.cache.background_revalidation)
            .clock(clock))
    }
}

/// Resolves a `SizeConfig` into bytes.
fn resolve_size(field: &str, cfg: SizeConfig) -> Result<usize> {
    match cfg {
        SizeConfig::Bytes(b) => Ok(b),
        SizeConfig::String(s) => {
            let s_lower = s.trim().to_lowercase();
            if let Some(val_str) = s_lower.strip_suffix("gb") {
                parse_size_string(field, &s, val_str, 1024 * 1024 * 1024)
            } else if let Some(val_str) = s_lower.strip_suffix('g') {
                parse_size_string(field, &s, val_str, 1024 * 1024 * 1024)
            } else if let Some(val_str) = s_lower.strip_suffix("mb") {
                parse_size_string(field, &s, val_str, 1024 * 1024)
            } else if let Some(val_str) = s_lower.strip_suffix('m') {
                parse_size_string(field, &s, val_str, 1024 * 1024)
            } else if let Some(val_str) = s_lower.strip_suffix("kb") {
                parse_size_string(field, &s, val_str, 1024)
            } else if let Some(val_str) = s_lower.strip_suffix('k') {
                parse_size_string(field, &s, val_str, 1024)
            } else if let Some(val_str) = s_lower.strip_suffix('b') {
                parse_size_string(field, &s, val_str, 1)
            } else {
                s_lower.parse().with_context(|| {
                    format!(
                        "Invalid {field} value '{s}'. Must be a number (bytes) or have a unit (e.g., '64mb')."
                    )
                })
            }
        }
    }
}

/// Parses a string number with a unit (kb, mb, gb) and applies a multiplier.
fn parse_size_string(field: &str, original_str: &str, value_str: &str, multiplier: u64) -> Result<usize> {
    let value: u64 = value_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid number in {field}: '{original_str}'"))?;
    let result_u64 = value.saturating_mul(multiplier);
    if result_u64 > (usize::MAX as u64) {
        return Err(anyhow!(
            "{} value '{}' is too large for this system's architecture (max is {} bytes)",
            field,
            original_str,
            usize::MAX
        ));
    }
    Ok(result_u64 as usize)
}
