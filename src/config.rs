//! config.rs - YAML 配置加载与校验
//!
//! 配置分四段: splunk 连接参数、环境到索引的映射、查询默认值、日志级别。
//! 启动时缺段或缺关键字段直接报错退出, 不做运行时兜底。

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SplunkMcpError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplunkConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_encrypted: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_hash: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    #[serde(default)]
    pub verify_ssl: bool,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl SplunkConfig {
    pub fn base_url(&self, resolved_host: &str) -> String {
        format!("{}://{}:{}", self.scheme, resolved_host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySettings {
    #[serde(default = "default_earliest_time")]
    pub default_earliest_time: String,
    #[serde(default = "default_latest_time")]
    pub default_latest_time: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time: u64,
    #[serde(default = "default_true")]
    pub include_raw_events: bool,
    #[serde(default = "default_true")]
    pub log_queries: bool,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            default_earliest_time: default_earliest_time(),
            default_latest_time: default_latest_time(),
            max_results: default_max_results(),
            page_size: default_page_size(),
            max_execution_time: default_max_execution_time(),
            include_raw_events: true,
            log_queries: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub splunk: SplunkConfig,
    pub indexes: BTreeMap<String, String>,
    #[serde(default)]
    pub query_settings: QuerySettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_earliest_time() -> String {
    "-30d".to_string()
}

fn default_latest_time() -> String {
    "now".to_string()
}

fn default_max_results() -> usize {
    10000
}

fn default_page_size() -> usize {
    1000
}

fn default_max_execution_time() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SplunkMcpError::ConfigMissing(path.display().to_string())
            } else {
                SplunkMcpError::Io(e)
            }
        })?;
        let config: Config = serde_yaml::from_str(&text)
            .map_err(|e| SplunkMcpError::ConfigInvalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.splunk.host.trim().is_empty() {
            return Err(SplunkMcpError::ConfigInvalid("splunk.host must not be empty".into()));
        }
        if self.splunk.port == 0 {
            return Err(SplunkMcpError::ConfigInvalid("splunk.port must not be 0".into()));
        }
        if self.splunk.username.trim().is_empty() {
            return Err(SplunkMcpError::ConfigInvalid("splunk.username must not be empty".into()));
        }
        if self.splunk.scheme != "https" && self.splunk.scheme != "http" {
            return Err(SplunkMcpError::ConfigInvalid(format!(
                "splunk.scheme must be https or http, got '{}'",
                self.splunk.scheme
            )));
        }
        if self.splunk.password_encrypted.is_some() {
            if self.splunk.password_salt.is_none() {
                return Err(SplunkMcpError::ConfigInvalid(
                    "splunk.password_encrypted requires splunk.password_salt".into(),
                ));
            }
            if self.splunk.machine_hash.is_none() {
                return Err(SplunkMcpError::ConfigInvalid(
                    "splunk.password_encrypted requires splunk.machine_hash".into(),
                ));
            }
        }
        for required in ["uat", "prod"] {
            if !self.indexes.contains_key(required) {
                return Err(SplunkMcpError::ConfigInvalid(format!(
                    "indexes.{required} is required"
                )));
            }
        }
        Ok(())
    }

    pub fn index_for_environment(&self, environment: &str) -> Result<&str> {
        self.indexes.get(environment).map(String::as_str).ok_or_else(|| {
            SplunkMcpError::InvalidRequest(format!(
                "unknown environment '{}', available: {}",
                environment,
                self.list_environments().join(", ")
            ))
        })
    }

    pub fn list_environments(&self) -> Vec<String> {
        self.indexes.keys().cloned().collect()
    }

    /// 资源接口用的脱敏视图, 密码相关字段一律打码。
    pub fn sanitized(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Some(splunk) = value.get_mut("splunk").and_then(Value::as_object_mut) {
            for (key, masked) in [
                ("password", "***HIDDEN***"),
                ("password_encrypted", "***ENCRYPTED***"),
                ("password_salt", "***SALT***"),
            ] {
                if splunk.contains_key(key) {
                    splunk.insert(key.to_string(), Value::String(masked.to_string()));
                }
            }
        }
        Ok(value)
    }
}
