pub use crate::models::DatasourceConfig;
use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use validator::Validate;

// Default constants
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_STORE_PATH: &str = "data/askql.db";
pub const DEFAULT_LOG_DIR: &str = "logs";
pub const DEFAULT_SERVICE_NAME: &str = "askql";

pub const DEFAULT_MAX_ROWS: usize = 500;
pub const DEFAULT_MAX_SQL_REPAIRS: u32 = 2;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SLOW_QUERY_THRESHOLD_MS: u64 = 3000;
pub const DEFAULT_RETRIEVAL_K: usize = 6;
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

pub const DEFAULT_RETRIES: u32 = 2;
pub const DEFAULT_BASE_DELAY_MS: u64 = 400;
pub const DEFAULT_MAX_DELAY_MS: u64 = 4000;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_RECOVERY_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";
pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Deserialize, Default, Clone, Validate)]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub server: ServerSettings,
    #[serde(default)]
    #[validate(nested)]
    pub limits: QueryLimits,
    #[serde(default)]
    #[validate(nested)]
    pub mysql: MysqlSettings,
    #[serde(default = "default_llm_settings")]
    #[validate(nested)]
    pub llm: LlmSettings,
    #[serde(default = "default_embedding_settings")]
    #[validate(nested)]
    pub embedding: LlmSettings,
    #[serde(default)]
    #[validate(nested)]
    pub schema_monitor: SchemaMonitorSettings,
    #[serde(default)]
    pub masking: MaskingSettings,
    #[serde(default)]
    pub assistant: AssistantSettings,
    #[serde(default)]
    #[validate(nested)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    #[validate(nested)]
    pub datasources: Vec<DatasourceConfig>,
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct ServerSettings {
    #[serde(default = "default_listen_addr")]
    #[validate(length(min = 1))]
    pub listen_addr: String,
    #[serde(default = "default_store_path")]
    pub store_path: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            store_path: default_store_path(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_store_path() -> String {
    DEFAULT_STORE_PATH.to_string()
}

fn default_log_dir() -> String {
    DEFAULT_LOG_DIR.to_string()
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct QueryLimits {
    #[serde(default = "default_max_rows")]
    #[validate(range(min = 1))]
    pub max_rows: usize,
    #[serde(default = "default_max_sql_repairs")]
    pub max_sql_repairs: u32,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    #[serde(default = "default_slow_query_threshold_ms")]
    pub slow_query_threshold_ms: u64,
    #[serde(default = "default_retrieval_k")]
    #[validate(range(min = 1, max = 100))]
    pub retrieval_k: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
            max_sql_repairs: DEFAULT_MAX_SQL_REPAIRS,
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            slow_query_threshold_ms: DEFAULT_SLOW_QUERY_THRESHOLD_MS,
            retrieval_k: DEFAULT_RETRIEVAL_K,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

fn default_max_rows() -> usize {
    DEFAULT_MAX_ROWS
}
fn default_max_sql_repairs() -> u32 {
    DEFAULT_MAX_SQL_REPAIRS
}
fn default_query_timeout_secs() -> u64 {
    DEFAULT_QUERY_TIMEOUT_SECS
}
fn default_slow_query_threshold_ms() -> u64 {
    DEFAULT_SLOW_QUERY_THRESHOLD_MS
}
fn default_retrieval_k() -> usize {
    DEFAULT_RETRIEVAL_K
}
fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

#[derive(Debug, Deserialize, Clone, Copy, Validate)]
pub struct RetrySettings {
    #[serde(default = "default_retries")]
    #[validate(range(max = 10))]
    pub retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

#[derive(Debug, Deserialize, Clone, Copy, Validate)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    #[validate(range(min = 1))]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    #[validate(range(min = 1))]
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout_secs: DEFAULT_RECOVERY_TIMEOUT_SECS,
        }
    }
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}
fn default_recovery_timeout_secs() -> u64 {
    DEFAULT_RECOVERY_TIMEOUT_SECS
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct MysqlSettings {
    #[serde(default = "default_pool_size")]
    #[validate(range(min = 1))]
    pub pool_size: usize,
    #[serde(default = "default_max_overflow")]
    pub max_overflow: usize,
    #[serde(default = "default_pool_recycle_secs")]
    pub pool_recycle_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetrySettings,
    #[serde(default)]
    #[validate(nested)]
    pub breaker: BreakerSettings,
}

impl Default for MysqlSettings {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_overflow: default_max_overflow(),
            pool_recycle_secs: default_pool_recycle_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            retry: RetrySettings::default(),
            breaker: BreakerSettings::default(),
        }
    }
}

fn default_pool_size() -> usize {
    5
}
fn default_max_overflow() -> usize {
    10
}
fn default_pool_recycle_secs() -> u64 {
    1800
}
fn default_connect_timeout_secs() -> u64 {
    10
}

/// Settings for one OpenAI-compatible endpoint (chat or embeddings).
#[derive(Debug, Deserialize, Clone, Validate)]
pub struct LlmSettings {
    #[serde(default = "default_llm_base_url")]
    #[validate(url)]
    pub base_url: String,
    #[serde(default, deserialize_with = "crate::models::deserialize_secret")]
    pub api_key: Option<SecretString>,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_temperature")]
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetrySettings,
    #[serde(default)]
    #[validate(nested)]
    pub breaker: BreakerSettings,
}

impl LlmSettings {
    /// Both a key and a model are needed before any call is attempted.
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some() && !self.model.is_empty()
    }
}

impl Default for LlmSettings {
    fn default() -> Self {
        default_llm_settings()
    }
}

fn default_llm_settings() -> LlmSettings {
    LlmSettings {
        base_url: default_llm_base_url(),
        api_key: None,
        model: String::new(),
        temperature: default_temperature(),
        timeout_secs: default_llm_timeout_secs(),
        retry: RetrySettings::default(),
        breaker: BreakerSettings::default(),
    }
}

fn default_embedding_settings() -> LlmSettings {
    LlmSettings {
        temperature: 0.0,
        ..default_llm_settings()
    }
}

fn default_llm_base_url() -> String {
    DEFAULT_LLM_BASE_URL.to_string()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_llm_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct SchemaMonitorSettings {
    #[serde(default = "default_monitor_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u64,
    #[serde(default = "default_poll_secs")]
    #[validate(range(min = 1))]
    pub poll_secs: u64,
}

impl Default for SchemaMonitorSettings {
    fn default() -> Self {
        Self {
            enabled: default_monitor_enabled(),
            interval_hours: default_interval_hours(),
            poll_secs: default_poll_secs(),
        }
    }
}

fn default_monitor_enabled() -> bool {
    true
}
fn default_interval_hours() -> u64 {
    24
}
fn default_poll_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct MaskingSettings {
    #[serde(default = "default_mask_keywords")]
    pub keywords: Vec<String>,
    #[serde(default = "default_keep")]
    pub keep_start: usize,
    #[serde(default = "default_keep")]
    pub keep_end: usize,
}

impl Default for MaskingSettings {
    fn default() -> Self {
        Self {
            keywords: default_mask_keywords(),
            keep_start: default_keep(),
            keep_end: default_keep(),
        }
    }
}

fn default_mask_keywords() -> Vec<String> {
    ["phone", "mobile", "email", "id_card", "password", "token", "secret"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_keep() -> usize {
    2
}

/// Optional SQL assistant passes; all off unless enabled.
#[derive(Debug, Deserialize, Clone, Copy, Default)]
pub struct AssistantSettings {
    #[serde(default)]
    pub explain: bool,
    #[serde(default)]
    pub suggest: bool,
    #[serde(default)]
    pub fix: bool,
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_otlp_endpoint")]
    #[validate(url)]
    pub endpoint: String,

    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otlp_endpoint(),
            service_name: default_service_name(),
        }
    }
}

fn default_otlp_endpoint() -> String {
    DEFAULT_OTLP_ENDPOINT.to_string()
}

fn default_service_name() -> String {
    DEFAULT_SERVICE_NAME.to_string()
}

impl AppConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let builder = config::Config::builder();

        let builder = if std::path::Path::new(path).exists() {
            builder.add_source(config::File::with_name(path))
        } else {
            builder
        };

        // ASKQL_LIMITS__MAX_ROWS=100 overrides limits.max_rows
        let builder = builder.add_source(
            config::Environment::with_prefix("ASKQL")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().context("Failed to build configuration")?;

        let app_config: AppConfig = cfg
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config
            .validate()
            .map_err(|e| anyhow::anyhow!("Configuration validation failed: {:?}", e))?;

        Ok(app_config)
    }

    /// The datasource marked `is_default`, else the first one listed.
    pub fn default_datasource(&self) -> Option<&DatasourceConfig> {
        self.datasources
            .iter()
            .find(|d| d.is_default)
            .or_else(|| self.datasources.first())
    }

    pub fn datasource(&self, id: &str) -> Option<&DatasourceConfig> {
        self.datasources.iter().find(|d| d.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_app_config_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.limits.max_rows, 500);
        assert_eq!(config.limits.max_sql_repairs, 2);
        assert_eq!(config.mysql.breaker.failure_threshold, 3);
        assert!(!config.assistant.explain);
        assert!(!config.llm.is_configured());
    }

    #[test]
    fn test_telemetry_config_validation() {
        let config = TelemetryConfig {
            endpoint: "not_a_url".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_breaker_threshold_must_be_positive() {
        let mut config = AppConfig::default();
        config.mysql.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("askql.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
limits:
  max_rows: 50
llm:
  model: gpt-4o-mini
  api_key: sk-test
datasources:
  - id: sales
    name: Sales
    host: db.internal
    database: sales
    user: reader
    password: hunter2
  - id: hr
    name: HR
    host: db.internal
    database: hr
    user: reader
    is_default: true
"#
        )
        .unwrap();

        let config = AppConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.limits.max_rows, 50);
        assert_eq!(config.limits.retrieval_k, DEFAULT_RETRIEVAL_K);
        assert!(config.llm.is_configured());
        assert_eq!(config.datasources.len(), 2);
        assert_eq!(config.datasources[0].port, 3306);
        assert_eq!(config.default_datasource().unwrap().id, "hr");
        assert!(config.datasource("sales").is_some());
        assert!(!format!("{:?}", config.datasources[0]).contains("hunter2"));
    }
}
