use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SplunkMcpError;

/// 查询结果中的单条事件。splunkd 返回的字段名和顺序都要原样保留。
pub type Record = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    HttpError,
    GeneralError,
}

impl ErrorKind {
    pub fn classify(err: &SplunkMcpError) -> Self {
        match err {
            SplunkMcpError::QueryTimeout(_) => ErrorKind::Timeout,
            SplunkMcpError::HttpStatus { .. } => ErrorKind::HttpError,
            _ => ErrorKind::GeneralError,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::HttpError => "http_error",
            ErrorKind::GeneralError => "general_error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeRange {
    pub earliest: String,
    pub latest: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchStats {
    pub scan_count: u64,
    pub event_count: u64,
    pub result_count: u64,
    pub run_duration: f64,
}

/// 一次查询的完整结果。执行器保证任何失败都落在 error 分支里而不是 panic。
#[derive(Debug, Clone, Serialize)]
pub struct ResultEnvelope {
    pub status: QueryStatus,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<SearchStats>,
    pub results: Vec<Record>,
    pub fields: Vec<Value>,
    pub messages: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorKind>,
}

impl ResultEnvelope {
    pub fn success(
        query: String,
        time_range: TimeRange,
        statistics: SearchStats,
        results: Vec<Record>,
        fields: Vec<Value>,
        messages: Vec<Value>,
    ) -> Self {
        Self {
            status: QueryStatus::Success,
            query,
            time_range: Some(time_range),
            statistics: Some(statistics),
            results,
            fields,
            messages,
            error: None,
            error_type: None,
        }
    }

    pub fn failure(query: String, err: &SplunkMcpError) -> Self {
        Self {
            status: QueryStatus::Error,
            query,
            time_range: None,
            statistics: None,
            results: Vec::new(),
            fields: Vec::new(),
            messages: Vec::new(),
            error: Some(err.to_string()),
            error_type: Some(ErrorKind::classify(err)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub build: String,
    pub server_name: String,
}

/// check_connection 的返回值。错误也走正常返回而不是 Result。
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_indexes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub connection_time: String,
}

impl ConnectionStatus {
    pub fn connected(server_info: ServerInfo, available_indexes: Vec<String>) -> Self {
        Self {
            status: "connected".to_string(),
            server_info: Some(server_info),
            available_indexes: Some(available_indexes),
            error: None,
            connection_time: Utc::now().to_rfc3339(),
        }
    }

    pub fn failed(err: &SplunkMcpError) -> Self {
        Self {
            status: "error".to_string(),
            server_info: None,
            available_indexes: None,
            error: Some(err.to_string()),
            connection_time: Utc::now().to_rfc3339(),
        }
    }
}

/// 搜索作业的调度状态。轮询时从 entry[0].content 里解析出来。
#[derive(Debug, Clone, Default)]
pub struct JobStatus {
    pub is_done: bool,
    pub is_failed: bool,
    pub dispatch_state: String,
    pub stats: SearchStats,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobResults {
    #[serde(default)]
    pub results: Vec<Record>,
    #[serde(default)]
    pub fields: Vec<Value>,
    #[serde(default)]
    pub messages: Vec<Value>,
}
