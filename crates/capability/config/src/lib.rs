//! 网关运行配置加载（环境变量 + 设备 schema 文档）。

use domain::DeviceSchema;
use std::env;
use std::path::Path;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
    #[error("read schema {0}: {1}")]
    SchemaRead(String, String),
    #[error("parse schema {0}: {1}")]
    SchemaParse(String, String),
}

/// 网关运行配置。
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http_addr: String,
    pub schema_path: String,
    pub link_host: String,
    pub link_port: u16,
    pub link_rack: u8,
    pub link_slot: u8,
    pub link_connect_timeout_ms: u64,
    pub link_read_timeout_ms: u64,
    pub link_reconnect_attempts: u32,
    pub link_backoff_ms: u64,
    pub link_backoff_max_ms: u64,
    pub simulated: bool,
    pub sim_error_rate: f64,
    pub sim_seed: Option<u64>,
    pub poll_interval_ms: u64,
    pub degraded_after: u32,
    pub degraded_interval_ms: u64,
    pub flush_batch_size: usize,
    pub flush_interval_ms: u64,
    pub store_write_timeout_ms: u64,
    pub replay_interval_ms: u64,
    pub replay_batch_size: usize,
    pub replay_max_retries: u32,
    pub sink_queue_capacity: usize,
    pub hub_queue_capacity: usize,
    pub feed_window_size: usize,
    pub feed_recompute_interval: usize,
    pub heartbeat_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub reemit_interval_ms: u64,
    pub subscriber_queue_capacity: usize,
    /// 未设置时使用内存历史库（启动时告警）。
    pub store_url: Option<String>,
    pub fallback_path: String,
}

/// 与环境变量全部缺省时一致。
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8080".to_string(),
            schema_path: "config/device_schema.json".to_string(),
            link_host: "127.0.0.1".to_string(),
            link_port: 102,
            link_rack: 0,
            link_slot: 1,
            link_connect_timeout_ms: 5000,
            link_read_timeout_ms: 5000,
            link_reconnect_attempts: 3,
            link_backoff_ms: 500,
            link_backoff_max_ms: 8000,
            simulated: false,
            sim_error_rate: 0.03,
            sim_seed: None,
            poll_interval_ms: 5000,
            degraded_after: 5,
            degraded_interval_ms: 30_000,
            flush_batch_size: 100,
            flush_interval_ms: 60_000,
            store_write_timeout_ms: 10_000,
            replay_interval_ms: 60_000,
            replay_batch_size: 100,
            replay_max_retries: 5,
            sink_queue_capacity: 1024,
            hub_queue_capacity: 256,
            feed_window_size: 36,
            feed_recompute_interval: 12,
            heartbeat_timeout_secs: 45,
            sweep_interval_secs: 10,
            reemit_interval_ms: 100,
            subscriber_queue_capacity: 64,
            store_url: None,
            fallback_path: "data/fallback.db".to_string(),
        }
    }
}

impl AppConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let http_addr =
            env::var("KILN_HTTP_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let schema_path = env::var("KILN_SCHEMA_PATH")
            .unwrap_or_else(|_| "config/device_schema.json".to_string());
        let link_host = env::var("KILN_LINK_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let link_port = read_u16_with_default("KILN_LINK_PORT", 102)?;
        let link_rack = read_u8_with_default("KILN_LINK_RACK", 0)?;
        let link_slot = read_u8_with_default("KILN_LINK_SLOT", 1)?;
        let link_connect_timeout_ms =
            read_u64_with_default("KILN_LINK_CONNECT_TIMEOUT_MS", 5000)?;
        let link_read_timeout_ms = read_u64_with_default("KILN_LINK_READ_TIMEOUT_MS", 5000)?;
        let link_reconnect_attempts =
            read_u32_with_default("KILN_LINK_RECONNECT_ATTEMPTS", 3)?;
        let link_backoff_ms = read_u64_with_default("KILN_LINK_BACKOFF_MS", 500)?;
        let link_backoff_max_ms = read_u64_with_default("KILN_LINK_BACKOFF_MAX_MS", 8000)?;
        let simulated = read_bool_with_default("KILN_SIMULATED", false);
        let sim_error_rate = read_f64_with_default("KILN_SIM_ERROR_RATE", 0.03)?;
        let sim_seed = read_optional_u64("KILN_SIM_SEED")?;
        let poll_interval_ms = read_u64_with_default("KILN_POLL_INTERVAL_MS", 5000)?;
        let degraded_after = read_u32_with_default("KILN_DEGRADED_AFTER", 5)?;
        let degraded_interval_ms = read_u64_with_default("KILN_DEGRADED_INTERVAL_MS", 30_000)?;
        let flush_batch_size = read_usize_with_default("KILN_FLUSH_BATCH_SIZE", 100)?;
        let flush_interval_ms = read_u64_with_default("KILN_FLUSH_INTERVAL_MS", 60_000)?;
        let store_write_timeout_ms =
            read_u64_with_default("KILN_STORE_WRITE_TIMEOUT_MS", 10_000)?;
        let replay_interval_ms = read_u64_with_default("KILN_REPLAY_INTERVAL_MS", 60_000)?;
        let replay_batch_size = read_usize_with_default("KILN_REPLAY_BATCH_SIZE", 100)?;
        let replay_max_retries = read_u32_with_default("KILN_REPLAY_MAX_RETRIES", 5)?;
        let sink_queue_capacity = read_usize_with_default("KILN_SINK_QUEUE_CAPACITY", 1024)?;
        let hub_queue_capacity = read_usize_with_default("KILN_HUB_QUEUE_CAPACITY", 256)?;
        let feed_window_size = read_usize_with_default("KILN_FEED_WINDOW_SIZE", 36)?;
        let feed_recompute_interval =
            read_usize_with_default("KILN_FEED_RECOMPUTE_INTERVAL", 12)?;
        let heartbeat_timeout_secs = read_u64_with_default("KILN_HEARTBEAT_TIMEOUT_SECS", 45)?;
        let sweep_interval_secs = read_u64_with_default("KILN_SWEEP_INTERVAL_SECS", 10)?;
        let reemit_interval_ms = read_u64_with_default("KILN_REEMIT_INTERVAL_MS", 100)?;
        let subscriber_queue_capacity =
            read_usize_with_default("KILN_SUBSCRIBER_QUEUE_CAPACITY", 64)?;
        let store_url = read_optional("KILN_STORE_URL");
        let fallback_path =
            env::var("KILN_FALLBACK_PATH").unwrap_or_else(|_| "data/fallback.db".to_string());

        if !(0.0..=1.0).contains(&sim_error_rate) {
            return Err(ConfigError::Invalid(
                "KILN_SIM_ERROR_RATE".to_string(),
                sim_error_rate.to_string(),
            ));
        }

        Ok(Self {
            http_addr,
            schema_path,
            link_host,
            link_port,
            link_rack,
            link_slot,
            link_connect_timeout_ms,
            link_read_timeout_ms,
            link_reconnect_attempts,
            link_backoff_ms,
            link_backoff_max_ms,
            simulated,
            sim_error_rate,
            sim_seed,
            poll_interval_ms,
            degraded_after,
            degraded_interval_ms,
            flush_batch_size,
            flush_interval_ms,
            store_write_timeout_ms,
            replay_interval_ms,
            replay_batch_size,
            replay_max_retries,
            sink_queue_capacity,
            hub_queue_capacity,
            feed_window_size,
            feed_recompute_interval,
            heartbeat_timeout_secs,
            sweep_interval_secs,
            reemit_interval_ms,
            subscriber_queue_capacity,
            store_url,
            fallback_path,
        })
    }
}

/// 读取并解析设备 schema 文档（仅解析，校验由 codec 完成）。
pub fn load_schema(path: impl AsRef<Path>) -> Result<DeviceSchema, ConfigError> {
    let path = path.as_ref();
    let display = path.display().to_string();
    let text = std::fs::read_to_string(path)
        .map_err(|err| ConfigError::SchemaRead(display.clone(), err.to_string()))?;
    parse_schema(&text).map_err(|err| match err {
        ConfigError::SchemaParse(_, reason) => ConfigError::SchemaParse(display, reason),
        other => other,
    })
}

/// 从 JSON 文本解析设备 schema。
pub fn parse_schema(text: &str) -> Result<DeviceSchema, ConfigError> {
    serde_json::from_str(text)
        .map_err(|err| ConfigError::SchemaParse("<inline>".to_string(), err.to_string()))
}

fn read_u8_with_default(key: &str, default: u8) -> Result<u8, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u8>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u16_with_default(key: &str, default: u16) -> Result<u16, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u32_with_default(key: &str, default: u32) -> Result<u32, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u32>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_usize_with_default(key: &str, default: usize) -> Result<usize, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<usize>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_f64_with_default(key: &str, default: f64) -> Result<f64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<f64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn read_optional_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match env::var(key) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(key.to_string(), value)),
        Err(_) => Ok(None),
    }
}

fn read_bool_with_default(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on"),
        Err(_) => default,
    }
}
