//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroUsize, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::config::{DEFAULT_MAX_MEMO_RECORDS, DEFAULT_MEMORY_BUDGET_BYTES};

mod cli;

pub use cli::{
    CliArgs, Command, GetArgs, GlobalOverrides, PutArgs, PutKind, RevalidateArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "artifact-cache";
const ENV_PREFIX: &str = "ARTIFACT_CACHE";
const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub store: StoreSettings,
    pub purge: PurgeSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Base URL of the blob service; required by the binary, not by the library.
    pub url: Option<String>,
    pub token: Option<String>,
    pub namespace: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct PurgeSettings {
    pub url: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub memory_budget_bytes: usize,
    pub max_memo_records: NonZeroUsize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration from the process arguments, returning both.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    store: RawStoreSettings,
    purge: RawPurgeSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(url) = overrides.store_url.as_ref() {
            self.store.url = Some(url.clone());
        }
        if let Some(token) = overrides.store_token.as_ref() {
            self.store.token = Some(token.clone());
        }
        if let Some(namespace) = overrides.store_namespace.as_ref() {
            self.store.namespace = Some(namespace.clone());
        }
        if let Some(timeout) = overrides.store_timeout_ms {
            self.store.timeout_ms = Some(timeout);
        }
        if let Some(url) = overrides.purge_url.as_ref() {
            self.purge.url = Some(url.clone());
        }
        if let Some(token) = overrides.purge_token.as_ref() {
            self.purge.token = Some(token.clone());
        }
        if let Some(budget) = overrides.memory_budget_bytes {
            self.cache.memory_budget_bytes = Some(budget);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        Ok(Self {
            logging: build_logging_settings(raw.logging)?,
            store: build_store_settings(raw.store)?,
            purge: build_purge_settings(raw.purge)?,
            cache: build_cache_settings(raw.cache)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let url = non_empty(store.url);
    if let Some(url) = url.as_deref() {
        validate_url(url, "store.url")?;
    }

    let timeout_ms = store.timeout_ms.unwrap_or(DEFAULT_STORE_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "store.timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(StoreSettings {
        url,
        token: non_empty(store.token),
        namespace: non_empty(store.namespace),
        timeout: Duration::from_millis(timeout_ms),
    })
}

fn build_purge_settings(purge: RawPurgeSettings) -> Result<PurgeSettings, LoadError> {
    let url = non_empty(purge.url);
    if let Some(url) = url.as_deref() {
        validate_url(url, "purge.url")?;
    }

    Ok(PurgeSettings {
        url,
        token: non_empty(purge.token),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let memory_budget_bytes = match cache.memory_budget_bytes {
        Some(value) => usize::try_from(value).map_err(|_| {
            LoadError::invalid(
                "cache.memory_budget_bytes",
                "value exceeds supported range for usize",
            )
        })?,
        None => DEFAULT_MEMORY_BUDGET_BYTES,
    };

    let records = cache
        .max_memo_records
        .unwrap_or(DEFAULT_MAX_MEMO_RECORDS as u64);
    let max_memo_records = usize::try_from(records)
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or_else(|| {
            LoadError::invalid("cache.max_memo_records", "must be greater than zero")
        })?;

    Ok(CacheSettings {
        memory_budget_bytes,
        max_memo_records,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn validate_url(value: &str, key: &'static str) -> Result<(), LoadError> {
    let url = reqwest::Url::parse(value)
        .map_err(|err| LoadError::invalid(key, format!("failed to parse: {err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(LoadError::invalid(
            key,
            format!("unsupported scheme `{other}`"),
        )),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    url: Option<String>,
    token: Option<String>,
    namespace: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPurgeSettings {
    url: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    memory_budget_bytes: Option<u64>,
    max_memo_records: Option<u64>,
}
