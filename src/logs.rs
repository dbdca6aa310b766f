// ============================================================================
// SECTION 16: LOG ANALYZER
// ============================================================================
// OpenTelemetry log tables filtered by entity, service, severity, body text
// and time. Output is either paginated lines or message patterns produced by
// a pluggable `LogClusterer`.
// ============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::DEFAULT_MAX_LOG_PATTERNS;
use crate::error::ForensicsResult;
use crate::identity::{name_variants, EntityQuery};
use crate::ingest::{parse_tags, read_table, AccessPolicy, Row};
use crate::pipeline::{paginate, Paginated};
use crate::timeutil::{format_timestamp, parse_time, TimeWindow, Timestamp};
use crate::value::Value;

const EXAMPLE_BODY_CHARS: usize = 500;

// ----------------------------------------------------------------------------
// 16.1 Log Lines
// ----------------------------------------------------------------------------

/// One log record with its Kubernetes placement resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogLine {
    pub timestamp: Option<String>,
    #[serde(skip)]
    pub time: Option<Timestamp>,
    pub service: Option<String>,
    pub severity: Option<String>,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    pub deployment: String,
    pub pod: String,
    pub namespace: String,
}

fn cell(row: &Row, column: &str) -> Option<String> {
    row.get(column).filter(|v| !v.is_null()).map(Value::render)
}

fn first_cell(row: &Row, columns: &[&str]) -> String {
    columns.iter().find_map(|c| cell(row, c)).unwrap_or_default()
}

impl LogLine {
    /// Build from a raw OTel row (`ResourceAttributes`) or a processed row
    /// with `k8s_*` columns.
    pub fn from_row(row: &Row) -> Self {
        let timestamp = cell(row, "Timestamp").or_else(|| cell(row, "TimestampTime"));
        let time = timestamp.as_deref().and_then(parse_time);

        let (deployment, pod, namespace) = match row.get("ResourceAttributes").and_then(Value::as_str) {
            Some(raw) => {
                let attrs = parse_tags(raw);
                let attr = |k: &str| attrs.get(k).map(Value::render).unwrap_or_default();
                (attr("k8s.deployment.name"), attr("k8s.pod.name"), attr("k8s.namespace.name"))
            }
            None => (
                first_cell(row, &["k8s_deployment_name", "deployment"]),
                first_cell(row, &["k8s_pod_name", "pod_name"]),
                first_cell(row, &["k8s_namespace", "namespace"]),
            ),
        };

        Self {
            timestamp,
            time,
            service: cell(row, "ServiceName"),
            severity: cell(row, "SeverityText"),
            body: cell(row, "Body").unwrap_or_default(),
            trace_id: cell(row, "TraceId"),
            span_id: cell(row, "SpanId"),
            deployment,
            pod,
            namespace,
        }
    }

    /// Entity filter: deployments and services match exactly, pods by
    /// substring; name-only identifiers try all three.
    pub fn matches_entity(&self, query: &EntityQuery) -> bool {
        let variants: Vec<String> = name_variants(&query.name.to_ascii_lowercase());
        let service = self.service.as_deref().unwrap_or_default().to_ascii_lowercase();
        let deployment = self.deployment.to_ascii_lowercase();
        let pod = self.pod.to_ascii_lowercase();

        let by_service = variants.iter().any(|v| *v == service);
        let by_deployment = variants.iter().any(|v| *v == deployment);
        let by_pod = variants.iter().any(|v| pod.contains(v.as_str()));

        match query.kind.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("deployment" | "deploy") => by_deployment,
            Some("pod") => by_pod,
            Some(_) => by_service || by_deployment,
            None => by_service || by_deployment || by_pod,
        }
    }
}

// ----------------------------------------------------------------------------
// 16.2 Clustering
// ----------------------------------------------------------------------------

/// Lines sharing one message template.
#[derive(Debug, Clone, PartialEq)]
pub struct LogCluster {
    pub template: String,
    /// Indices into the clustered slice, in input order
    pub members: Vec<usize>,
}

/// Groups log bodies into templates.
pub trait LogClusterer: Send + Sync {
    fn name(&self) -> &str;

    fn cluster(&self, bodies: &[&str]) -> Vec<LogCluster>;
}

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .expect("valid uuid pattern")
});
static IP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("valid ip pattern"));
static HEX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"0x[0-9a-fA-F]+").expect("valid hex pattern"));
static NUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(\.\d+)?").expect("valid number pattern"));

/// Replace volatile tokens (UUIDs, IPs, hex, numbers) with placeholders.
pub fn mask_body(body: &str) -> String {
    let masked = UUID_RE.replace_all(body.trim(), "<UUID>");
    let masked = IP_RE.replace_all(&masked, "<IP>");
    let masked = HEX_RE.replace_all(&masked, "<HEX>");
    NUM_RE.replace_all(&masked, "<NUM>").into_owned()
}

/// Groups bodies that are identical after masking.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatchClusterer;

impl LogClusterer for ExactMatchClusterer {
    fn name(&self) -> &str {
        "exact_match"
    }

    fn cluster(&self, bodies: &[&str]) -> Vec<LogCluster> {
        let mut order: Vec<String> = Vec::new();
        let mut members: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, body) in bodies.iter().enumerate() {
            if body.trim().is_empty() {
                continue;
            }
            let template = mask_body(body);
            let entry = members.entry(template.clone()).or_default();
            if entry.is_empty() {
                order.push(template);
            }
            entry.push(idx);
        }
        order
            .into_iter()
            .filter_map(|template| {
                let members = members.remove(&template)?;
                Some(LogCluster { template, members })
            })
            .collect()
    }
}

// ----------------------------------------------------------------------------
// 16.3 Log Analysis
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogRequest {
    pub entity: Option<String>,
    pub service_name: Option<String>,
    /// Comma separated severities, case-insensitive
    pub severity_filter: Option<String>,
    pub body_contains: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub pattern_analysis: bool,
    pub max_patterns: usize,
    pub offset: usize,
    pub limit: usize,
}

impl Default for LogRequest {
    fn default() -> Self {
        Self {
            entity: None,
            service_name: None,
            severity_filter: None,
            body_contains: None,
            start_time: None,
            end_time: None,
            pattern_analysis: true,
            max_patterns: DEFAULT_MAX_LOG_PATTERNS,
            offset: 0,
            limit: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogFilters {
    pub entity: Option<String>,
    pub service_name: Option<String>,
    pub severity_filter: Option<String>,
    pub body_contains: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeRange {
    pub first: String,
    pub last: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogPattern {
    pub pattern: String,
    pub count: usize,
    pub percentage: f64,
    pub severity_breakdown: BTreeMap<String, usize>,
    pub service_breakdown: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    pub example: LogLine,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum LogReport {
    Patterns {
        total_logs: usize,
        pattern_count: usize,
        clusterer: String,
        filters_applied: LogFilters,
        patterns: Vec<LogPattern>,
    },
    Lines {
        #[serde(flatten)]
        page: Paginated<LogLine>,
        filters_applied: LogFilters,
    },
}

impl LogReport {
    pub fn total(&self) -> usize {
        match self {
            LogReport::Patterns { total_logs, .. } => *total_logs,
            LogReport::Lines { page, .. } => page.total_count,
        }
    }
}

/// Filtered log lines of `path`, in file order.
pub fn load_log_lines(path: &Path, request: &LogRequest, policy: &AccessPolicy) -> ForensicsResult<Vec<LogLine>> {
    let window = TimeWindow::parse(request.start_time.as_deref(), request.end_time.as_deref())?;
    let entity = request.entity.as_deref().map(EntityQuery::parse).transpose()?;
    let severities: Option<Vec<String>> = request
        .severity_filter
        .as_deref()
        .map(|s| s.split(',').map(|p| p.trim().to_ascii_uppercase()).filter(|p| !p.is_empty()).collect());
    let body_needle = request.body_contains.as_deref().map(str::to_lowercase);

    let (table, _) = read_table(path, policy)?;
    let lines: Vec<LogLine> = table
        .rows
        .iter()
        .map(LogLine::from_row)
        .filter(|line| entity.as_ref().map_or(true, |q| line.matches_entity(q)))
        .filter(|line| match (&request.service_name, &line.service) {
            (Some(wanted), Some(service)) => wanted.eq_ignore_ascii_case(service),
            (Some(_), None) => !table.has_column("ServiceName"),
            (None, _) => true,
        })
        .filter(|line| match (&severities, &line.severity) {
            (Some(wanted), Some(sev)) => wanted.contains(&sev.to_ascii_uppercase()),
            (Some(_), None) => !table.has_column("SeverityText"),
            (None, _) => true,
        })
        .filter(|line| {
            body_needle
                .as_ref()
                .map_or(true, |needle| line.body.to_lowercase().contains(needle.as_str()))
        })
        .filter(|line| !window.is_bounded() || window.contains_opt(line.time.as_ref()))
        .collect();
    Ok(lines)
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Filter a log table, then page lines or summarise patterns.
pub fn analyze_logs(
    path: &Path,
    request: &LogRequest,
    clusterer: &dyn LogClusterer,
    policy: &AccessPolicy,
) -> ForensicsResult<LogReport> {
    let mut lines = load_log_lines(path, request, policy)?;
    let filters = LogFilters {
        entity: request.entity.clone(),
        service_name: request.service_name.clone(),
        severity_filter: request.severity_filter.clone(),
        body_contains: request.body_contains.clone(),
        start_time: request.start_time.clone(),
        end_time: request.end_time.clone(),
    };
    debug!(target: "forensics::logs", lines = lines.len(), clusterer = clusterer.name(), "Log lines filtered");

    if !request.pattern_analysis {
        // Most recent first.
        lines.sort_by(|a, b| b.time.cmp(&a.time));
        return Ok(LogReport::Lines {
            page: paginate(lines, request.offset, request.limit),
            filters_applied: filters,
        });
    }

    let total = lines.len();
    let bodies: Vec<&str> = lines.iter().map(|l| l.body.as_str()).collect();
    let mut patterns: Vec<LogPattern> = clusterer
        .cluster(&bodies)
        .into_iter()
        .filter(|c| !c.members.is_empty())
        .map(|cluster| {
            let members: Vec<&LogLine> = cluster.members.iter().filter_map(|i| lines.get(*i)).collect();
            let mut severity_breakdown = BTreeMap::new();
            let mut service_breakdown = BTreeMap::new();
            for line in &members {
                if let Some(sev) = &line.severity {
                    *severity_breakdown.entry(sev.clone()).or_insert(0) += 1;
                }
                if let Some(svc) = &line.service {
                    *service_breakdown.entry(svc.clone()).or_insert(0) += 1;
                }
            }
            let times = members.iter().filter_map(|l| l.time);
            let first = times.clone().min();
            let last = times.max();
            let time_range = first.zip(last).map(|(f, l)| TimeRange {
                first: format_timestamp(&f),
                last: format_timestamp(&l),
            });
            let mut example = members.first().map(|l| (*l).clone()).unwrap_or_default();
            example.body = truncate_chars(&example.body, EXAMPLE_BODY_CHARS);

            let count = members.len();
            LogPattern {
                pattern: cluster.template,
                count,
                percentage: if total > 0 {
                    (10_000.0 * count as f64 / total as f64).round() / 100.0
                } else {
                    0.0
                },
                severity_breakdown,
                service_breakdown,
                time_range,
                example,
            }
        })
        .collect();

    patterns.sort_by(|a, b| b.count.cmp(&a.count));
    if request.max_patterns > 0 {
        patterns.truncate(request.max_patterns);
    }

    Ok(LogReport::Patterns {
        total_logs: total,
        pattern_count: patterns.len(),
        clusterer: clusterer.name().to_string(),
        filters_applied: filters,
        patterns,
    })
}

#[cfg(test)]
mod logs_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const OTEL_LOGS: &str = "Timestamp\tServiceName\tSeverityText\tBody\tResourceAttributes\n\
2025-01-01T10:00:00Z\tcart\tERROR\tfailed to reach redis after 3 retries\t{'k8s.deployment.name': 'cart', 'k8s.pod.name': 'cart-7d9f8b6c4-abcde', 'k8s.namespace.name': 'demo'}\n\
2025-01-01T10:00:05Z\tcart\tERROR\tfailed to reach redis after 5 retries\t{'k8s.deployment.name': 'cart', 'k8s.pod.name': 'cart-7d9f8b6c4-abcde', 'k8s.namespace.name': 'demo'}\n\
2025-01-01T10:00:07Z\tcart\tINFO\tGetCart ok\t{'k8s.deployment.name': 'cart', 'k8s.pod.name': 'cart-7d9f8b6c4-abcde', 'k8s.namespace.name': 'demo'}\n\
2025-01-01T10:00:09Z\tfrontend\tWARN\tslow request 0x1f\t{'k8s.deployment.name': 'frontend', 'k8s.pod.name': 'frontend-6b8d9c7f5-q2w3e', 'k8s.namespace.name': 'demo'}\n";

    fn fixture() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otel_logs.tsv");
        std::fs::write(&path, OTEL_LOGS).unwrap();
        (dir, path)
    }

    #[test]
    fn test_mask_body() {
        assert_eq!(
            mask_body("conn 10.0.0.12 id 3668f213-3a05-42a5-add7-927432543d35 took 35ms at 0xff"),
            "conn <IP> id <UUID> took <NUM>ms at <HEX>"
        );
    }

    #[test]
    fn test_exact_match_clusterer_groups_masked_bodies() {
        let bodies = ["retry 1 failed", "retry 2 failed", "", "done"];
        let clusters = ExactMatchClusterer.cluster(&bodies);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].template, "retry <NUM> failed");
        assert_eq!(clusters[0].members, vec![0, 1]);
    }

    #[rstest]
    #[case("cart", 3)]
    #[case("deployment/cart-service", 3)]
    #[case("pod/frontend-6b8d9c7f5", 1)]
    #[case("service/frontend", 1)]
    #[case("checkout", 0)]
    fn test_entity_filter(#[case] entity: &str, #[case] expected: usize) {
        let (_dir, path) = fixture();
        let request = LogRequest {
            entity: Some(entity.into()),
            ..LogRequest::default()
        };
        let lines = load_log_lines(&path, &request, &AccessPolicy::permissive()).unwrap();
        assert_eq!(lines.len(), expected);
    }

    #[test]
    fn test_patterns_sorted_by_count() {
        let (_dir, path) = fixture();
        let report = analyze_logs(&path, &LogRequest::default(), &ExactMatchClusterer, &AccessPolicy::permissive()).unwrap();
        let LogReport::Patterns { total_logs, patterns, .. } = report else {
            panic!("expected patterns");
        };
        assert_eq!(total_logs, 4);
        assert_eq!(patterns[0].pattern, "failed to reach redis after <NUM> retries");
        assert_eq!(patterns[0].count, 2);
        assert_eq!(patterns[0].percentage, 50.0);
        assert_eq!(patterns[0].severity_breakdown.get("ERROR"), Some(&2));
        assert_eq!(patterns[0].time_range.as_ref().unwrap().last, "2025-01-01T10:00:05Z");
    }

    #[test]
    fn test_raw_lines_newest_first_with_severity_filter() {
        let (_dir, path) = fixture();
        let request = LogRequest {
            pattern_analysis: false,
            severity_filter: Some("error, warn".into()),
            limit: 2,
            ..LogRequest::default()
        };
        let report = analyze_logs(&path, &request, &ExactMatchClusterer, &AccessPolicy::permissive()).unwrap();
        let LogReport::Lines { page, .. } = report else {
            panic!("expected lines");
        };
        assert_eq!(page.total_count, 3);
        assert_eq!(page.returned_count, 2);
        assert_eq!(page.data[0].service.as_deref(), Some("frontend"));
        assert_eq!(page.data[0].namespace, "demo");
    }

    #[test]
    fn test_body_and_time_filters() {
        let (_dir, path) = fixture();
        let request = LogRequest {
            body_contains: Some("REDIS".into()),
            end_time: Some("2025-01-01T10:00:02Z".into()),
            ..LogRequest::default()
        };
        let lines = load_log_lines(&path, &request, &AccessPolicy::permissive()).unwrap();
        assert_eq!(lines.len(), 1);
    }
}
