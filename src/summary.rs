//! summary.rs - 面向 AI 客户端的结果报告
//!
//! 把查询信封整理成"摘要先行"的 JSON 文本: 统计、分页、字段画像、事件画像,
//! 然后才是(可能被截断的)结果本体。所有报告都带 type 判别字段和时间戳。

use std::collections::HashMap;

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::model::{ConnectionStatus, ErrorKind, QueryStatus, Record, ResultEnvelope};

/// 清洗后的记录里排在最前面的字段, 顺序即输出顺序。
const PRIORITY_FIELDS: [&str; 6] = ["_time", "host", "source", "sourcetype", "message", "_raw"];

/// 预览模式下无论页大小如何, 最多只嵌入前 100 条。
const PREVIEW_LIMIT: usize = 100;

/// 字段画像只看前 100 条, 事件画像看全部。
const FIELD_SAMPLE_LIMIT: usize = 100;

const SAMPLE_VALUE_LIMIT: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct ResponseFormatter;

impl ResponseFormatter {
    pub fn new() -> Self {
        Self
    }

    pub fn format_query_response(
        &self,
        envelope: &ResultEnvelope,
        include_raw: bool,
        page_size: usize,
    ) -> String {
        if envelope.status == QueryStatus::Error {
            return self.format_error_report(envelope);
        }

        let page_size = page_size.max(1);
        let results = &envelope.results;
        let total_results = results.len();
        let stats = envelope.statistics.clone().unwrap_or_default();
        let total_pages = (total_results + page_size - 1) / page_size;

        let mut report = Map::new();
        report.insert("type".into(), json!("query_results"));
        report.insert("status".into(), json!("success"));
        report.insert("query".into(), json!(envelope.query));
        report.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        report.insert(
            "time_range".into(),
            match &envelope.time_range {
                Some(range) => json!(range),
                None => json!({}),
            },
        );
        report.insert(
            "statistics".into(),
            json!({
                "total_events": stats.event_count,
                "total_results": total_results,
                "scan_count": stats.scan_count,
                "execution_time": format!("{:.2}s", stats.run_duration),
            }),
        );
        report.insert(
            "pagination".into(),
            json!({
                "total_results": total_results,
                "page_size": page_size,
                "total_pages": total_pages,
                "requires_pagination": total_pages > 1,
            }),
        );
        report.insert("field_summary".into(), field_summary(results));
        report.insert("event_summary".into(), event_summary(results));

        if total_results <= page_size {
            if include_raw {
                report.insert("results".into(), clean_results(results.iter()));
            }
            report.insert(
                "message".into(),
                json!(format!("Query completed with {total_results} results")),
            );
        } else {
            report.insert(
                "results_preview".into(),
                clean_results(results.iter().take(PREVIEW_LIMIT)),
            );
            report.insert(
                "message".into(),
                json!(format!(
                    "Query returned {total_results} results (exceeds page size of {page_size}). \
                     Showing preview of first {PREVIEW_LIMIT} results. \
                     Use pagination or refine your query for complete results."
                )),
            );
            report.insert(
                "pagination_guidance".into(),
                json!({
                    "total_pages": total_pages,
                    "results_per_page": page_size,
                    "suggestion": "Consider adding filters or time constraints to reduce result set",
                }),
            );
        }

        if !envelope.messages.is_empty() {
            report.insert("splunk_messages".into(), json!(envelope.messages));
        }

        to_pretty(Value::Object(report))
    }

    fn format_error_report(&self, envelope: &ResultEnvelope) -> String {
        let report = json!({
            "type": "query_error",
            "status": "error",
            "query": envelope.query,
            "timestamp": Utc::now().to_rfc3339(),
            "error": {
                "message": envelope.error.clone().unwrap_or_else(|| "Unknown error".to_string()),
                "type": envelope.error_type.map(|kind| kind.as_str()).unwrap_or("general_error"),
            },
            "troubleshooting": troubleshooting_tips(envelope.error_type),
        });
        to_pretty(report)
    }

    pub fn format_connection_response(&self, status: &ConnectionStatus) -> String {
        let mut report = Map::new();
        report.insert("type".into(), json!("connection_status"));
        report.insert("status".into(), json!(status.status));
        report.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        if status.status == "connected" {
            report.insert(
                "server_info".into(),
                match &status.server_info {
                    Some(info) => json!(info),
                    None => json!({}),
                },
            );
            report.insert(
                "available_indexes".into(),
                json!(status.available_indexes.clone().unwrap_or_default()),
            );
            report.insert("message".into(), json!("Successfully connected to Splunk"));
        } else {
            report.insert(
                "error".into(),
                json!(status.error.clone().unwrap_or_else(|| "Unknown error".to_string())),
            );
            report.insert("message".into(), json!("Failed to connect to Splunk"));
        }
        to_pretty(Value::Object(report))
    }

    pub fn format_indexes_response(&self, indexes: &[String]) -> String {
        to_pretty(json!({
            "type": "indexes_list",
            "status": "success",
            "timestamp": Utc::now().to_rfc3339(),
            "total_indexes": indexes.len(),
            "indexes": indexes,
            "message": format!("Found {} indexes", indexes.len()),
        }))
    }

    pub fn format_sourcetypes_response(&self, sourcetypes: &[String], index: Option<&str>) -> String {
        let mut report = Map::new();
        report.insert("type".into(), json!("sourcetypes_list"));
        report.insert("status".into(), json!("success"));
        report.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        report.insert("total_sourcetypes".into(), json!(sourcetypes.len()));
        report.insert("sourcetypes".into(), json!(sourcetypes));
        match index {
            Some(index) => {
                report.insert("index".into(), json!(index));
                report.insert(
                    "message".into(),
                    json!(format!("Found {} sourcetypes in index '{index}'", sourcetypes.len())),
                );
            }
            None => {
                report.insert(
                    "message".into(),
                    json!(format!("Found {} sourcetypes", sourcetypes.len())),
                );
            }
        }
        to_pretty(Value::Object(report))
    }

    pub fn format_environment_index_response(&self, environment: &str, index: &str) -> String {
        to_pretty(json!({
            "type": "environment_index",
            "status": "success",
            "environment": environment,
            "timestamp": Utc::now().to_rfc3339(),
            "index": index,
            "message": format!("Index for {} environment: {index}", environment.to_uppercase()),
        }))
    }
}

/// 前 100 条里每个外部字段的画像: 首见顺序的样本值、去重计数、出现次数前五。
fn field_summary(results: &[Record]) -> Value {
    if results.is_empty() {
        return json!({});
    }

    #[derive(Default)]
    struct FieldAcc {
        samples: Vec<String>,
        value_order: Vec<String>,
        counts: HashMap<String, u64>,
    }

    let sample_size = results.len().min(FIELD_SAMPLE_LIMIT);
    let mut field_order: Vec<String> = Vec::new();
    let mut accs: HashMap<String, FieldAcc> = HashMap::new();

    for record in &results[..sample_size] {
        for (field, value) in record.iter() {
            if field.starts_with('_') {
                continue;
            }
            let text = value_to_string(value);
            let acc = accs.entry(field.clone()).or_insert_with(|| {
                field_order.push(field.clone());
                FieldAcc::default()
            });
            if acc.samples.len() < SAMPLE_VALUE_LIMIT && !acc.samples.contains(&text) {
                acc.samples.push(text.clone());
            }
            let count = acc.counts.entry(text.clone()).or_insert_with(|| {
                acc.value_order.push(text);
                0
            });
            *count += 1;
        }
    }

    let mut summary = Map::new();
    for field in field_order {
        if let Some(acc) = accs.remove(&field) {
            let ordered: Vec<(String, u64)> = acc
                .value_order
                .iter()
                .map(|value| (value.clone(), acc.counts.get(value).copied().unwrap_or(0)))
                .collect();
            let top_values: Vec<Value> = top_n(&ordered, 5)
                .into_iter()
                .map(|(value, count)| json!({"value": value, "count": count}))
                .collect();
            summary.insert(
                field,
                json!({
                    "sample_values": acc.samples,
                    "unique_count": acc.counts.len(),
                    "top_values": top_values,
                }),
            );
        }
    }
    Value::Object(summary)
}

/// 全量结果上的聚合画像: host/source 前五、sourcetype 全量、严重级别分布。
fn event_summary(results: &[Record]) -> Value {
    if results.is_empty() {
        return json!({});
    }

    let mut summary = Map::new();
    summary.insert("total_events".into(), json!(results.len()));

    if results.iter().any(|r| r.contains_key("host")) {
        let hosts = frequency(results, "host");
        summary.insert("unique_hosts".into(), json!(hosts.len()));
        let top: Vec<Value> = top_n(&hosts, 5)
            .into_iter()
            .map(|(host, count)| json!({"host": host, "count": count}))
            .collect();
        summary.insert("top_hosts".into(), json!(top));
    }

    if results.iter().any(|r| r.contains_key("source")) {
        let sources = frequency(results, "source");
        summary.insert("unique_sources".into(), json!(sources.len()));
        let top: Vec<Value> = top_n(&sources, 5)
            .into_iter()
            .map(|(source, count)| json!({"source": source, "count": count}))
            .collect();
        summary.insert("top_sources".into(), json!(top));
    }

    if results.iter().any(|r| r.contains_key("sourcetype")) {
        let sourcetypes = frequency(results, "sourcetype");
        let all = sourcetypes.len();
        let listed: Vec<Value> = top_n(&sourcetypes, all)
            .into_iter()
            .map(|(sourcetype, count)| json!({"sourcetype": sourcetype, "count": count}))
            .collect();
        summary.insert("sourcetypes".into(), json!(listed));
    }

    // 固定优先级取第一个出现过的严重级别字段, 不混合统计。
    for severity_field in ["severity", "level", "log_level"] {
        if results.iter().any(|r| r.contains_key(severity_field)) {
            let levels = frequency(results, severity_field);
            let all = levels.len();
            let distribution: Vec<Value> = top_n(&levels, all)
                .into_iter()
                .map(|(level, count)| json!({"level": level, "count": count}))
                .collect();
            summary.insert("severity_distribution".into(), json!(distribution));
            break;
        }
    }

    Value::Object(summary)
}

fn clean_results<'a>(results: impl Iterator<Item = &'a Record>) -> Value {
    Value::Array(results.map(|r| Value::Object(clean_record(r))).collect())
}

/// 优先字段在前, 然后是外部字段; 只有既没有 _raw 也没有 message 时
/// 才补充其余内部字段(_time 和 _raw 除外)。
fn clean_record(record: &Record) -> Record {
    let mut cleaned = Record::new();
    for field in PRIORITY_FIELDS {
        if let Some(value) = record.get(field) {
            cleaned.insert(field.to_string(), value.clone());
        }
    }
    for (field, value) in record.iter() {
        if !field.starts_with('_') && !cleaned.contains_key(field) {
            cleaned.insert(field.clone(), value.clone());
        }
    }
    if !cleaned.contains_key("_raw") && !cleaned.contains_key("message") {
        for (field, value) in record.iter() {
            if field.starts_with('_') && field != "_time" && field != "_raw" {
                cleaned.insert(field.clone(), value.clone());
            }
        }
    }
    cleaned
}

/// 出现次数统计, 保持首见顺序。字段缺失按 "unknown" 计入。
fn frequency(results: &[Record], field: &str) -> Vec<(String, u64)> {
    let mut order: Vec<String> = Vec::new();
    let mut counts: HashMap<String, u64> = HashMap::new();
    for record in results {
        let value = record
            .get(field)
            .map(value_to_string)
            .unwrap_or_else(|| "unknown".to_string());
        let count = counts.entry(value.clone()).or_insert_with(|| {
            order.push(value);
            0
        });
        *count += 1;
    }
    order
        .into_iter()
        .map(|value| {
            let count = counts.get(&value).copied().unwrap_or(0);
            (value, count)
        })
        .collect()
}

/// 按次数降序取前 n。排序是稳定的, 并列时保持首见顺序。
fn top_n(counts: &[(String, u64)], n: usize) -> Vec<(String, u64)> {
    let mut sorted = counts.to_vec();
    sorted.sort_by(|a, b| b.1.cmp(&a.1));
    sorted.truncate(n);
    sorted
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn troubleshooting_tips(kind: Option<ErrorKind>) -> Vec<&'static str> {
    match kind {
        Some(ErrorKind::Timeout) => vec![
            "Query took too long to execute",
            "Try reducing the time range",
            "Add more specific filters to reduce data volume",
            "Consider using summary indexes for large datasets",
        ],
        Some(ErrorKind::HttpError) => vec![
            "Check your network connectivity",
            "Verify Splunk server is accessible",
            "Ensure credentials are correct",
            "Check if your account has necessary permissions",
        ],
        // 未知类别按一般错误给建议
        Some(ErrorKind::GeneralError) | None => vec![
            "Verify query syntax is correct",
            "Check if specified indexes exist",
            "Ensure you have permissions for the requested data",
            "Try a simpler query to test connectivity",
        ],
    }
}

fn to_pretty(value: Value) -> String {
    serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string())
}
