//! client.rs - splunkd REST 客户端
//!
//! 只封装本服务用到的端点: 登录、服务信息、应用列表(探活)、搜索作业的
//! 创建/轮询/取结果/取消、索引列表、登出。所有请求都带 output_mode=json。

use std::time::Duration;

use reqwest::{Client as ReqwestClient, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error};

use crate::error::{Result, SplunkMcpError};
use crate::model::{JobResults, JobStatus, SearchStats, ServerInfo};

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "sessionKey")]
    session_key: String,
}

/// One authenticated connection to splunkd. Cheap to clone, the underlying
/// connection pool is shared.
#[derive(Clone)]
pub struct SplunkApi {
    http: ReqwestClient,
    base_url: String,
    session_key: String,
}

impl std::fmt::Debug for SplunkApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplunkApi")
            .field("base_url", &self.base_url)
            .field("session_key", &"***")
            .finish_non_exhaustive()
    }
}

impl SplunkApi {
    /// POST /services/auth/login。401 一律判定为认证失败, 调用方不得重试。
    pub async fn login(
        base_url: &str,
        username: &str,
        password: &str,
        timeout: Duration,
        verify_ssl: bool,
    ) -> Result<Self> {
        let http = ReqwestClient::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_ssl)
            .build()?;

        debug!(base_url, "logging in to splunkd");
        let response = http
            .post(format!("{base_url}/services/auth/login"))
            .form(&[
                ("username", username),
                ("password", password),
                ("output_mode", "json"),
            ])
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if status == StatusCode::UNAUTHORIZED {
            return Err(SplunkMcpError::AuthFailed(format!(
                "splunkd rejected credentials for user '{username}'"
            )));
        }
        if !status.is_success() {
            error!("login failed: {} - {}", status, truncate(&text));
            return Err(SplunkMcpError::HttpStatus {
                status: status.as_u16(),
                message: truncate(&text),
            });
        }
        let login: LoginResponse = serde_json::from_str(&text)?;
        Ok(Self {
            http,
            base_url: base_url.to_string(),
            session_key: login.session_key,
        })
    }

    pub async fn server_info(&self) -> Result<ServerInfo> {
        let value = self
            .get_json("/services/server/info", &[("output_mode", "json")])
            .await?;
        let content = entry_content(&value)?;
        Ok(ServerInfo {
            version: str_field(content, "version"),
            build: str_field(content, "build"),
            server_name: str_field(content, "serverName"),
        })
    }

    /// 探活。任何失败都按会话失效处理, 由调用方决定是否重建。
    pub async fn is_alive(&self) -> bool {
        self.get_json("/services/apps/local", &[("output_mode", "json"), ("count", "1")])
            .await
            .is_ok()
    }

    pub async fn list_indexes(&self) -> Result<Vec<String>> {
        let value = self
            .get_json("/services/data/indexes", &[("output_mode", "json"), ("count", "0")])
            .await?;
        let mut names = Vec::new();
        if let Some(entries) = value.get("entry").and_then(Value::as_array) {
            for entry in entries {
                if let Some(name) = entry.get("name").and_then(Value::as_str) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    /// 提交异步搜索作业, 返回 sid。
    pub async fn create_job(
        &self,
        query: &str,
        earliest: &str,
        latest: &str,
        max_count: usize,
    ) -> Result<String> {
        let max = max_count.to_string();
        let value = self
            .post_form(
                "/services/search/jobs",
                &[
                    ("search", query),
                    ("earliest_time", earliest),
                    ("latest_time", latest),
                    ("max_count", max.as_str()),
                    ("exec_mode", "normal"),
                    ("output_mode", "json"),
                ],
            )
            .await?;
        value
            .get("sid")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SplunkMcpError::Internal("job creation response had no sid".into()))
    }

    pub async fn job_status(&self, sid: &str) -> Result<JobStatus> {
        let path = format!("/services/search/jobs/{}", urlencoding::encode(sid));
        let value = self.get_json(&path, &[("output_mode", "json")]).await?;
        let content = entry_content(&value)?;
        Ok(JobStatus {
            is_done: bool_field(content, "isDone"),
            is_failed: bool_field(content, "isFailed"),
            dispatch_state: str_field(content, "dispatchState"),
            stats: SearchStats {
                scan_count: u64_field(content, "scanCount"),
                event_count: u64_field(content, "eventCount"),
                result_count: u64_field(content, "resultCount"),
                run_duration: f64_field(content, "runDuration"),
            },
        })
    }

    /// 一次性拉取至多 count 条结果, 不做游标分页。
    pub async fn job_results(&self, sid: &str, count: usize) -> Result<JobResults> {
        let path = format!("/services/search/jobs/{}/results", urlencoding::encode(sid));
        let n = count.to_string();
        let value = self
            .get_json(&path, &[("output_mode", "json"), ("count", n.as_str())])
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn cancel_job(&self, sid: &str) -> Result<()> {
        let path = format!("/services/search/jobs/{}/control", urlencoding::encode(sid));
        self.post_form(&path, &[("action", "cancel"), ("output_mode", "json")])
            .await?;
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        let path = format!(
            "{}/services/authentication/httpauth-tokens/{}",
            self.base_url,
            urlencoding::encode(&self.session_key)
        );
        let response = self
            .http
            .delete(path)
            .header("Authorization", self.auth_header())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SplunkMcpError::HttpStatus {
                status: status.as_u16(),
                message: "logout rejected".to_string(),
            });
        }
        Ok(())
    }

    fn auth_header(&self) -> String {
        format!("Splunk {}", self.session_key)
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .header("Authorization", self.auth_header())
            .query(query)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> Result<Value> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("Authorization", self.auth_header())
            .form(form)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn read_json(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let text = response.text().await?;
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SplunkMcpError::AuthFailed(format!(
                "splunkd rejected the session with HTTP {status}"
            )));
        }
        if !status.is_success() {
            error!("splunkd error: {} - {}", status, truncate(&text));
            return Err(SplunkMcpError::HttpStatus {
                status: status.as_u16(),
                message: truncate(&text),
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

fn entry_content(value: &Value) -> Result<&Value> {
    value
        .get("entry")
        .and_then(Value::as_array)
        .and_then(|entries| entries.first())
        .and_then(|entry| entry.get("content"))
        .ok_or_else(|| SplunkMcpError::Internal("splunkd response missing entry content".into()))
}

// splunkd 时不时把数字和布尔编码成字符串, 下面统一做宽松转换。

fn bool_field(content: &Value, key: &str) -> bool {
    match content.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0) != 0,
        Some(Value::String(s)) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn u64_field(content: &Value, key: &str) -> u64 {
    match content.get(key) {
        Some(Value::Number(n)) => {
            n.as_u64().unwrap_or_else(|| n.as_f64().map(|f| f as u64).unwrap_or(0))
        }
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn f64_field(content: &Value, key: &str) -> f64 {
    match content.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn str_field(content: &Value, key: &str) -> String {
    content
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

fn truncate(text: &str) -> String {
    const MAX_CHARS: usize = 300;
    if text.chars().count() <= MAX_CHARS {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(MAX_CHARS).collect();
        out.push_str("...");
        out
    }
}
