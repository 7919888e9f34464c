// src/config.rs
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::events::{LookupFailurePolicy, WorkerSettings, DEFAULT_FAILURE_REPLY};
use crate::rabbitmq::{BaseConfig, ConsumerConfig, ProducerConfig, ReconnectPolicy};

pub const CONFIG_FILE_ENV: &str = "TRACK_RELAY_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rabbitmq: RabbitSettings,
    #[serde(default)]
    pub app: AppSettings,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RabbitSettings {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Queue the search service answers on.
    #[serde(default)]
    pub consumer_queue: String,
    /// Queue search requests are published to.
    #[serde(default)]
    pub producer_queue: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

// Keeps the password out of logs.
impl fmt::Debug for RabbitSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("consumer_queue", &self.consumer_queue)
            .field("producer_queue", &self.producer_queue)
            .field("prefetch_count", &self.prefetch_count)
            .field("reconnect_delay_ms", &self.reconnect_delay_ms)
            .field("reconnect_max_delay_ms", &self.reconnect_max_delay_ms)
            .finish()
    }
}

impl Default for RabbitSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            consumer_queue: String::new(),
            producer_queue: String::new(),
            prefetch_count: default_prefetch_count(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_event_workers")]
    pub event_workers: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_failure_reply")]
    pub failure_reply: String,
    #[serde(default)]
    pub on_lookup_failure: LookupFailurePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_queue: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            event_workers: default_event_workers(),
            log_level: default_log_level(),
            failure_reply: default_failure_reply(),
            on_lookup_failure: LookupFailurePolicy::default(),
            dead_letter_queue: None,
        }
    }
}

// Default values
fn default_port() -> u16 { 5672 }
fn default_prefetch_count() -> u16 { 100 }
fn default_reconnect_delay_ms() -> u64 { 5_000 }
fn default_reconnect_max_delay_ms() -> u64 { 60_000 }
fn default_event_workers() -> usize { 3 }
fn default_log_level() -> String { "info".to_string() }
fn default_failure_reply() -> String { DEFAULT_FAILURE_REPLY.to_string() }

impl Config {
    /// `.env`, then the optional JSON file, then environment overrides.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let lookup = |key: &str| env::var(key).ok();
        let mut config = match find_config_file(lookup)? {
            Some(path) => Self::from_file(&path)?,
            None => {
                debug!("No config file found, using defaults and environment");
                Self::default()
            }
        };

        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;

        let config: Config = serde_json::from_str(&content)
            .context("Configuration file contains invalid JSON")?;

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Overrides fields from `lookup`, usually the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rabbit = &mut self.rabbitmq;
        override_string(&lookup, "RABBITMQ_HOST", &mut rabbit.host);
        override_parsed(&lookup, "RABBITMQ_PORT", &mut rabbit.port)?;
        override_string(&lookup, "RABBITMQ_USERNAME", &mut rabbit.username);
        override_string(&lookup, "RABBITMQ_PASSWORD", &mut rabbit.password);
        override_string(&lookup, "RABBITMQ_CONSUMER_QUEUE", &mut rabbit.consumer_queue);
        override_string(&lookup, "RABBITMQ_PRODUCER_QUEUE", &mut rabbit.producer_queue);
        override_parsed(&lookup, "RABBITMQ_PREFETCH_COUNT", &mut rabbit.prefetch_count)?;
        override_parsed(&lookup, "RABBITMQ_RECONNECT_DELAY_MS", &mut rabbit.reconnect_delay_ms)?;
        override_parsed(
            &lookup,
            "RABBITMQ_RECONNECT_MAX_DELAY_MS",
            &mut rabbit.reconnect_max_delay_ms,
        )?;

        let app = &mut self.app;
        override_parsed(&lookup, "EVENT_WORKERS", &mut app.event_workers)?;
        override_string(&lookup, "LOG_LEVEL", &mut app.log_level);
        override_string(&lookup, "FAILURE_REPLY", &mut app.failure_reply);
        override_parsed(&lookup, "ON_LOOKUP_FAILURE", &mut app.on_lookup_failure)?;
        if let Some(queue) = lookup("DEAD_LETTER_QUEUE") {
            app.dead_letter_queue = Some(queue).filter(|q| !q.is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let rabbit = &self.rabbitmq;
        if rabbit.host.is_empty() {
            bail!("Configuration error: rabbitmq.host cannot be empty");
        }
        if rabbit.port == 0 {
            bail!("Configuration error: rabbitmq.port must be non-zero");
        }
        if rabbit.consumer_queue.is_empty() {
            bail!("Configuration error: rabbitmq.consumer_queue cannot be empty");
        }
        if rabbit.producer_queue.is_empty() {
            bail!("Configuration error: rabbitmq.producer_queue cannot be empty");
        }
        if rabbit.reconnect_max_delay_ms < rabbit.reconnect_delay_ms {
            bail!(
                "Configuration error: reconnect_max_delay_ms ({}) is below reconnect_delay_ms ({})",
                rabbit.reconnect_max_delay_ms,
                rabbit.reconnect_delay_ms
            );
        }
        if self.app.event_workers == 0 {
            bail!("Configuration error: app.event_workers must be at least 1");
        }
        Ok(())
    }

    pub fn base(&self) -> BaseConfig {
        BaseConfig {
            host: self.rabbitmq.host.clone(),
            port: self.rabbitmq.port,
            username: self.rabbitmq.username.clone(),
            password: self.rabbitmq.password.clone(),
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            base: self.base(),
            prefetch_count: self.rabbitmq.prefetch_count,
        }
    }

    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig { base: self.base() }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.rabbitmq.reconnect_delay_ms),
            max_delay: Duration::from_millis(self.rabbitmq.reconnect_max_delay_ms),
            ..ReconnectPolicy::default()
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            failure_reply: self.app.failure_reply.clone(),
            on_lookup_failure: self.app.on_lookup_failure,
            dead_letter_queue: self.app.dead_letter_queue.clone(),
        }
    }
}

fn override_string<F>(lookup: &F, key: &str, field: &mut String)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(key) {
        *field = value;
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, field: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    if let Some(value) = lookup(key) {
        *field = value
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid value {:?} for {}: {}", value, key, e))?;
    }
    Ok(())
}

/// The explicit `TRACK_RELAY_CONFIG` path, else the first conventional location that exists.
pub fn find_config_file<F>(lookup: F) -> Result<Option<PathBuf>>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(explicit) = lookup(CONFIG_FILE_ENV) {
        let path = PathBuf::from(explicit);
        if !path.exists() {
            bail!("{} points to a missing file: {}", CONFIG_FILE_ENV, path.display());
        }
        return Ok(Some(path));
    }

    let locations = [
        ("Current directory", Path::new("track_relay.json")),
        ("Current directory (alternative)", Path::new("config/track_relay.json")),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(Some(path.to_path_buf()));
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(".track_relay.json");
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(Some(home_config));
        }
    }

    Ok(None)
}

/// Writes a starter configuration for a local broker.
pub fn create_default_config_file(path: &Path) -> Result<()> {
    let default_config = Config {
        rabbitmq: RabbitSettings {
            host: "localhost".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            consumer_queue: "search_track_responses".to_string(),
            producer_queue: "search_track_requests".to_string(),
            ..RabbitSettings::default()
        },
        app: AppSettings::default(),
    };

    let json = serde_json::to_string_pretty(&default_config)
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .with_context(|| format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
