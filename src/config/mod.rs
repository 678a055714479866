//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{collections::HashSet, num::NonZeroUsize, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{EvictionStrategy, normalize_version, sanitize_namespace};

mod cli;

pub use cli::{
    CliArgs, Command, KeyArgs, KeyCommand, KeyFormatArgs, KeyParseArgs, RunArgs, RunOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tiercache";
const ENV_PREFIX: &str = "TIERCACHE";
const DEFAULT_LAYER_NAME: &str = "memory";
const DEFAULT_LAYER_PRIORITY: i32 = 1;
const DEFAULT_LAYER_MAX_SIZE: u64 = 1000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;
const DEFAULT_LAYER_TIMEOUT_MS: u64 = 250;
const DEFAULT_BATCH_SIZE: u64 = 100;
const DEFAULT_SCHEDULER_TICK_MS: u64 = 1000;
const DEFAULT_EVENT_QUEUE_LIMIT: u64 = 1024;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub keys: KeySettings,
    pub layers: Vec<LayerSettings>,
    pub manager: ManagerSettings,
    pub invalidation: InvalidationSettings,
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

#[derive(Debug, Clone, Default)]
pub struct KeySettings {
    pub default_namespace: Option<String>,
    pub default_version: Option<String>,
}

/// One in-memory tier.
#[derive(Debug, Clone)]
pub struct LayerSettings {
    pub name: String,
    pub priority: i32,
    pub max_size: NonZeroUsize,
    pub strategy: EvictionStrategy,
    pub default_ttl: Option<Duration>,
    pub sweep_interval: Option<Duration>,
    pub enabled: bool,
    pub read_only: bool,
    pub fallback: bool,
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub layer_timeout: Duration,
    pub promotion_ttl: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct InvalidationSettings {
    pub batch_size: NonZeroUsize,
    pub monitor_interval: Option<Duration>,
    pub scheduler_tick: Duration,
    pub event_queue_limit: NonZeroUsize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

impl LoadError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
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

    match cli.command.as_ref() {
        Some(Command::Run(args)) => raw.apply_run_overrides(&args.overrides),
        Some(Command::Key(_)) => {}
        None => raw.apply_run_overrides(&RunOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    keys: RawKeySettings,
    layers: Option<Vec<RawLayerSettings>>,
    manager: RawManagerSettings,
    invalidation: RawInvalidationSettings,
}

impl RawSettings {
    fn apply_run_overrides(&mut self, overrides: &RunOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(timeout) = overrides.layer_timeout_ms {
            self.manager.layer_timeout_ms = Some(timeout);
        }
        if let Some(interval) = overrides.monitor_interval_ms {
            self.invalidation.monitor_interval_ms = Some(interval);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            keys,
            layers,
            manager,
            invalidation,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            keys: build_key_settings(keys)?,
            layers: build_layer_settings(layers)?,
            manager: build_manager_settings(manager)?,
            invalidation: build_invalidation_settings(invalidation)?,
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

fn build_key_settings(keys: RawKeySettings) -> Result<KeySettings, LoadError> {
    let default_namespace = keys
        .default_namespace
        .filter(|ns| !ns.trim().is_empty())
        .map(|ns| {
            sanitize_namespace(&ns)
                .map_err(|err| LoadError::invalid("keys.default_namespace", err.to_string()))
        })
        .transpose()?;
    let default_version = keys
        .default_version
        .filter(|v| !v.trim().is_empty())
        .map(|v| {
            normalize_version(&v)
                .map_err(|err| LoadError::invalid("keys.default_version", err.to_string()))
        })
        .transpose()?;

    Ok(KeySettings {
        default_namespace,
        default_version,
    })
}

fn build_layer_settings(
    layers: Option<Vec<RawLayerSettings>>,
) -> Result<Vec<LayerSettings>, LoadError> {
    let layers = layers.unwrap_or_else(|| vec![RawLayerSettings::default()]);
    if layers.is_empty() {
        return Err(LoadError::invalid("layers", "at least one layer is required"));
    }

    let mut names = HashSet::new();
    layers
        .into_iter()
        .enumerate()
        .map(|(index, layer)| {
            let key = |field: &str| format!("layers[{index}].{field}");

            let name = layer
                .name
                .unwrap_or_else(|| DEFAULT_LAYER_NAME.to_string())
                .trim()
                .to_string();
            if name.is_empty() {
                return Err(LoadError::invalid(key("name"), "must not be empty"));
            }
            if !names.insert(name.clone()) {
                return Err(LoadError::invalid(
                    key("name"),
                    format!("duplicate layer name `{name}`"),
                ));
            }

            let strategy = match layer.strategy {
                Some(raw) => EvictionStrategy::from_str(raw.trim())
                    .map_err(|err| LoadError::invalid(key("strategy"), err.to_string()))?,
                None => EvictionStrategy::default(),
            };

            Ok(LayerSettings {
                name,
                priority: layer.priority.unwrap_or(DEFAULT_LAYER_PRIORITY),
                max_size: non_zero_usize(
                    layer.max_size.unwrap_or(DEFAULT_LAYER_MAX_SIZE),
                    key("max_size"),
                )?,
                strategy,
                default_ttl: optional_millis(layer.default_ttl_ms.unwrap_or(0)),
                sweep_interval: optional_millis(
                    layer.sweep_interval_ms.unwrap_or(DEFAULT_SWEEP_INTERVAL_MS),
                ),
                enabled: layer.enabled.unwrap_or(true),
                read_only: layer.read_only.unwrap_or(false),
                fallback: layer.fallback.unwrap_or(false),
            })
        })
        .collect()
}

fn build_manager_settings(manager: RawManagerSettings) -> Result<ManagerSettings, LoadError> {
    let timeout_ms = manager.layer_timeout_ms.unwrap_or(DEFAULT_LAYER_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "manager.layer_timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(ManagerSettings {
        layer_timeout: Duration::from_millis(timeout_ms),
        promotion_ttl: manager.promotion_ttl_ms.and_then(optional_millis),
    })
}

fn build_invalidation_settings(
    invalidation: RawInvalidationSettings,
) -> Result<InvalidationSettings, LoadError> {
    let tick_ms = invalidation
        .scheduler_tick_ms
        .unwrap_or(DEFAULT_SCHEDULER_TICK_MS);
    if tick_ms == 0 {
        return Err(LoadError::invalid(
            "invalidation.scheduler_tick_ms",
            "must be greater than zero",
        ));
    }

    Ok(InvalidationSettings {
        batch_size: non_zero_usize(
            invalidation.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            "invalidation.batch_size",
        )?,
        monitor_interval: optional_millis(invalidation.monitor_interval_ms.unwrap_or(0)),
        scheduler_tick: Duration::from_millis(tick_ms),
        event_queue_limit: non_zero_usize(
            invalidation
                .event_queue_limit
                .unwrap_or(DEFAULT_EVENT_QUEUE_LIMIT),
            "invalidation.event_queue_limit",
        )?,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawKeySettings {
    default_namespace: Option<String>,
    default_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLayerSettings {
    name: Option<String>,
    priority: Option<i32>,
    max_size: Option<u64>,
    strategy: Option<String>,
    default_ttl_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
    enabled: Option<bool>,
    read_only: Option<bool>,
    fallback: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawManagerSettings {
    layer_timeout_ms: Option<u64>,
    promotion_ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawInvalidationSettings {
    batch_size: Option<u64>,
    monitor_interval_ms: Option<u64>,
    scheduler_tick_ms: Option<u64>,
    event_queue_limit: Option<u64>,
}

/// Zero means "off".
fn optional_millis(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_millis(value))
}

fn non_zero_usize(value: u64, key: impl Into<String>) -> Result<NonZeroUsize, LoadError> {
    let key = key.into();
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key.clone(), "value exceeds supported range"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
