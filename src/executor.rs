//! executor.rs - 查询执行
//!
//! 把一条 SPL 变成异步搜索作业: 规范化、提交、按固定节奏轮询直到完成或超时、
//! 单批拉取结果。作业无论走哪条路径最后都会释放, 不在服务端积压。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::client::SplunkApi;
use crate::config::Config;
use crate::error::{Result, SplunkMcpError};
use crate::model::{JobResults, JobStatus, QueryStatus, ResultEnvelope, SearchStats, TimeRange};
use crate::session::SessionManager;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Submitted,
    Running,
    Done,
    Cancelled,
}

pub struct QueryExecutor {
    config: Arc<Config>,
    sessions: Arc<SessionManager>,
}

impl QueryExecutor {
    pub fn new(config: Arc<Config>, sessions: Arc<SessionManager>) -> Self {
        Self { config, sessions }
    }

    /// 执行一条查询。未给的参数取 query_settings 里的默认值, 任何失败都
    /// 折叠进返回的信封, 不向上抛。
    pub async fn execute(
        &self,
        raw_query: &str,
        earliest: Option<String>,
        latest: Option<String>,
        max_results: Option<usize>,
        timeout_secs: Option<u64>,
    ) -> ResultEnvelope {
        let qs = &self.config.query_settings;
        let earliest = earliest.unwrap_or_else(|| qs.default_earliest_time.clone());
        let latest = latest.unwrap_or_else(|| qs.default_latest_time.clone());
        let max_results = max_results.unwrap_or(qs.max_results);
        let timeout_secs = timeout_secs.unwrap_or(qs.max_execution_time);

        let query = normalize_query(raw_query);
        if qs.log_queries {
            info!(query = %query, earliest = %earliest, latest = %latest, max_results, "executing splunk query");
        }

        let time_range = TimeRange {
            earliest: earliest.clone(),
            latest: latest.clone(),
        };
        match self
            .run(&query, &earliest, &latest, max_results, timeout_secs)
            .await
        {
            Ok((stats, data)) => ResultEnvelope::success(
                query,
                time_range,
                stats,
                data.results,
                data.fields,
                data.messages,
            ),
            Err(e) => {
                error!(error = %e, "query failed");
                ResultEnvelope::failure(query, &e)
            }
        }
    }

    async fn run(
        &self,
        query: &str,
        earliest: &str,
        latest: &str,
        max_results: usize,
        timeout_secs: u64,
    ) -> Result<(SearchStats, JobResults)> {
        let session = self.sessions.connect(false).await?;
        let api = &session.api;

        let sid = api.create_job(query, earliest, latest, max_results).await?;
        let mut state = JobState::Submitted;
        debug!(sid = %sid, state = ?state, "search job submitted");

        match self.wait_for_job(api, &sid, timeout_secs, &mut state).await {
            Ok(status) => {
                let fetched = api.job_results(&sid, max_results).await;
                release_job(api, &sid).await;
                let data = fetched?;
                debug!(sid = %sid, state = ?state, results = data.results.len(), "search job finished");
                Ok((status.stats, data))
            }
            Err(e) => {
                if matches!(e, SplunkMcpError::QueryTimeout(_)) {
                    state = JobState::Cancelled;
                    warn!(sid = %sid, state = ?state, timeout_secs, "search job cancelled after deadline");
                }
                release_job(api, &sid).await;
                Err(e)
            }
        }
    }

    /// 每 500ms 轮询一次完成标志。完成判定先于超时判定, 正好踩线完成的
    /// 作业按成功处理。
    async fn wait_for_job(
        &self,
        api: &SplunkApi,
        sid: &str,
        timeout_secs: u64,
        state: &mut JobState,
    ) -> Result<JobStatus> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
        loop {
            let status = api.job_status(sid).await?;
            if status.is_failed {
                return Err(SplunkMcpError::Internal(format!(
                    "search job entered {} state",
                    status.dispatch_state
                )));
            }
            if status.is_done {
                *state = JobState::Done;
                return Ok(status);
            }
            *state = JobState::Running;
            if tokio::time::Instant::now() >= deadline {
                return Err(SplunkMcpError::QueryTimeout(timeout_secs));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// 列出可见索引。失败降级为空列表, 报告层会如实说明数量为零。
    pub async fn get_indexes(&self) -> Vec<String> {
        let listed = async {
            let session = self.sessions.connect(false).await?;
            session.api.list_indexes().await
        };
        match listed.await {
            Ok(names) => names,
            Err(e) => {
                error!(error = %e, "failed to list indexes");
                Vec::new()
            }
        }
    }

    /// 用 metadata 生成命令取最近 7 天出现过的 sourcetype。
    pub async fn get_sourcetypes(&self, index: Option<&str>) -> Vec<String> {
        let query = match index {
            Some(index) => format!("| metadata type=sourcetypes index={index}"),
            None => "| metadata type=sourcetypes".to_string(),
        };
        let envelope = self
            .execute(
                &query,
                Some("-7d".to_string()),
                Some("now".to_string()),
                Some(1000),
                None,
            )
            .await;
        if envelope.status == QueryStatus::Error {
            error!(error = ?envelope.error, "sourcetype listing failed");
            return Vec::new();
        }
        envelope
            .results
            .iter()
            .filter_map(|record| record.get("sourcetype"))
            .filter_map(Value::as_str)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// 对已完成的作业 cancel 等价于清理, 所以所有路径统一走这里。
async fn release_job(api: &SplunkApi, sid: &str) {
    if let Err(e) = api.cancel_job(sid).await {
        warn!(sid = %sid, error = %e, "failed to release search job");
    }
}

/// SPL 规定非生成式查询要以 search 开头, 裸关键字自动补前缀。
/// 以 `|`、`index=` 或 search 关键字(带词边界)开头的查询原样保留。
fn normalize_query(raw: &str) -> String {
    let trimmed = raw.trim();
    let lowered = trimmed.to_lowercase();
    let generating = lowered.starts_with('|')
        || lowered.starts_with("index=")
        || (lowered.starts_with("search")
            && lowered[6..].chars().next().map_or(true, |c| c.is_whitespace()));
    if generating {
        trimmed.to_string()
    } else {
        format!("search {trimmed}")
    }
}
