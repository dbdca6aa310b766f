// ============================================================================
// SECTION 21: TRACE PATH ANALYSIS
// ============================================================================
// Reconstructs one service path per trace, groups traces by path signature
// and compares pre/post pivot windows per path and per hop. Also builds a
// per-service error tree.
// ============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::config::TracesConfig;
use crate::constants::{
    CRITICAL_ERROR_PCT, CRITICAL_LATENCY_PCT, ERROR_MESSAGE_MAX_CHARS, MAX_ERROR_SAMPLES, MAX_LISTED_PATHS,
};
use crate::deadline::Deadline;
use crate::error::{ForensicsResult, InputError};
use crate::ingest::{read_table, AccessPolicy, Row};
use crate::stats::{delta_pct, round_to, Percentiles};
use crate::timeutil::{format_latency, format_rate, format_timestamp, parse_bound, parse_duration, parse_time, TimeWindow, Timestamp};
use crate::value::Value;

/// Services along one reconstructed path.
pub type ServicePath = SmallVec<[CompactString; 8]>;

const PATH_SEPARATOR: &str = " → ";
const UNKNOWN_SERVICE: &str = "unknown";
const MAX_TOP_ERRORS: usize = 5;

// ----------------------------------------------------------------------------
// 21.1 Spans
// ----------------------------------------------------------------------------

const COLUMN_MAP: [(&str, &str); 15] = [
    ("TraceId", "trace_id"),
    ("SpanId", "span_id"),
    ("ParentSpanId", "parent_span_id"),
    ("TraceState", "trace_state"),
    ("SpanName", "span_name"),
    ("SpanKind", "span_kind"),
    ("ServiceName", "service_name"),
    ("ResourceAttributes", "resource_attributes"),
    ("ScopeName", "scope_name"),
    ("ScopeVersion", "scope_version"),
    ("SpanAttributes", "span_attributes"),
    ("Duration", "duration"),
    ("StatusCode", "status_code"),
    ("StatusMessage", "status_message"),
    ("Timestamp", "timestamp"),
];

/// Canonical snake_case name of a trace column.
pub fn normalize_column(name: &str) -> String {
    if let Some((_, mapped)) = COLUMN_MAP.iter().find(|(from, _)| *from == name) {
        return (*mapped).to_string();
    }
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Rename every column of a span row to its snake_case form.
pub fn normalize_columns(row: Row) -> Row {
    row.into_iter().map(|(k, v)| (normalize_column(&k), v)).collect()
}

/// One span, normalised.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Span {
    pub trace_id: CompactString,
    pub span_id: Option<CompactString>,
    pub parent_span_id: Option<CompactString>,
    pub service: CompactString,
    pub span_name: Option<String>,
    pub span_kind: Option<String>,
    pub timestamp: Option<Timestamp>,
    pub duration_ms: Option<f64>,
    pub status_code: Option<String>,
    pub status_message: Option<String>,
}

fn text(row: &Row, column: &str) -> Option<String> {
    row.get(column)
        .filter(|v| !v.is_null())
        .map(Value::render)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl Span {
    /// Build from a normalised row. Rows without a trace id are dropped.
    pub fn from_row(row: &Row) -> Option<Self> {
        let trace_id = text(row, "trace_id")?;
        let duration_ms = row
            .get("duration_ms")
            .and_then(Value::as_f64)
            .or_else(|| row.get("duration").and_then(Value::as_f64).map(|ns| ns / 1_000_000.0));
        Some(Self {
            trace_id: trace_id.into(),
            span_id: text(row, "span_id").map(CompactString::from),
            parent_span_id: text(row, "parent_span_id").map(CompactString::from),
            service: text(row, "service_name").unwrap_or_else(|| UNKNOWN_SERVICE.into()).into(),
            span_name: text(row, "span_name"),
            span_kind: text(row, "span_kind"),
            timestamp: text(row, "timestamp").as_deref().and_then(parse_time),
            duration_ms,
            status_code: text(row, "status_code"),
            status_message: text(row, "status_message"),
        })
    }

    pub fn is_error(&self) -> bool {
        self.status_code.as_deref() == Some("Error")
    }

    /// Kind filter; `Server` matches `SPAN_KIND_SERVER`.
    fn has_kind(&self, wanted: &str) -> bool {
        self.span_kind
            .as_deref()
            .is_some_and(|k| k.to_ascii_lowercase().ends_with(&wanted.to_ascii_lowercase()))
    }
}

/// Load and normalise every span of a trace table.
pub fn load_spans(path: &Path, policy: &AccessPolicy) -> ForensicsResult<(Vec<Span>, Vec<String>)> {
    let (table, report) = read_table(path, policy)?;
    let spans: Vec<Span> = table
        .rows
        .into_iter()
        .map(normalize_columns)
        .filter_map(|row| Span::from_row(&row))
        .collect();
    debug!(
        target: "forensics::traces",
        source = %report.source,
        rows = report.rows_read,
        spans = spans.len(),
        "Spans loaded"
    );
    Ok((spans, report.warnings))
}

// ----------------------------------------------------------------------------
// 21.2 Path Reconstruction
// ----------------------------------------------------------------------------

/// Spans grouped by trace id, in first-seen order.
pub fn group_by_trace(spans: &[Span]) -> Vec<(&str, Vec<&Span>)> {
    let mut index: AHashMap<&str, usize> = AHashMap::new();
    let mut groups: Vec<(&str, Vec<&Span>)> = Vec::new();
    for span in spans {
        let slot = *index.entry(span.trace_id.as_str()).or_insert_with(|| {
            groups.push((span.trace_id.as_str(), Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(span);
    }
    groups
}

struct SpanTree<'a> {
    spans: &'a [&'a Span],
    children: AHashMap<&'a str, Vec<usize>>,
    root: Option<usize>,
}

impl<'a> SpanTree<'a> {
    fn new(spans: &'a [&'a Span]) -> Self {
        let ids: AHashSet<&str> = spans.iter().filter_map(|s| s.span_id.as_deref()).collect();
        let mut children: AHashMap<&str, Vec<usize>> = AHashMap::new();
        let mut root = None;
        for (idx, span) in spans.iter().enumerate() {
            match span.parent_span_id.as_deref().filter(|p| ids.contains(p)) {
                Some(parent) => children.entry(parent).or_default().push(idx),
                None if span.span_id.is_some() && root.is_none() => root = Some(idx),
                None => {}
            }
        }
        Self { spans, children, root }
    }

    /// Deepest chain below `idx`; the first child wins ties.
    fn deepest(&self, idx: usize, visiting: &mut AHashSet<usize>) -> Vec<usize> {
        if !visiting.insert(idx) {
            return Vec::new();
        }
        let mut longest: Vec<usize> = Vec::new();
        let kids = self.spans[idx]
            .span_id
            .as_deref()
            .and_then(|id| self.children.get(id));
        for &child in kids.into_iter().flatten() {
            let path = self.deepest(child, visiting);
            if path.len() > longest.len() {
                longest = path;
            }
        }
        visiting.remove(&idx);
        let mut path = Vec::with_capacity(longest.len() + 1);
        path.push(idx);
        path.extend(longest);
        path
    }
}

/// Collapsed service path of one trace.
pub fn service_path(spans: &[&Span]) -> ServicePath {
    let tree = SpanTree::new(spans);
    let Some(root) = tree.root else {
        return ServicePath::new();
    };
    let mut services: ServicePath = tree
        .deepest(root, &mut AHashSet::new())
        .into_iter()
        .map(|idx| spans[idx].service.clone())
        .collect();
    services.dedup();
    services
}

pub fn signature(services: &[CompactString]) -> String {
    services.iter().map(CompactString::as_str).collect::<Vec<_>>().join(PATH_SEPARATOR)
}

/// Traces sharing one path signature.
#[derive(Debug, Clone)]
pub struct PathGroup<'a> {
    pub signature: String,
    pub services: ServicePath,
    pub trace_ids: BTreeSet<&'a str>,
    pub spans: Vec<&'a Span>,
}

/// Group traces by path, optionally keeping only paths through `service`.
pub fn group_paths<'a>(spans: &'a [Span], service: Option<&str>) -> Vec<PathGroup<'a>> {
    let mut index: AHashMap<String, usize> = AHashMap::new();
    let mut groups: Vec<PathGroup<'a>> = Vec::new();
    for (trace_id, trace_spans) in group_by_trace(spans) {
        let services = service_path(&trace_spans);
        if services.is_empty() {
            continue;
        }
        if let Some(wanted) = service {
            if !services.iter().any(|s| s.as_str() == wanted) {
                continue;
            }
        }
        let sig = signature(&services);
        let slot = match index.get(&sig) {
            Some(slot) => *slot,
            None => {
                index.insert(sig.clone(), groups.len());
                groups.push(PathGroup {
                    signature: sig,
                    services,
                    trace_ids: BTreeSet::new(),
                    spans: Vec::new(),
                });
                groups.len() - 1
            }
        };
        groups[slot].trace_ids.insert(trace_id);
        groups[slot].spans.extend(trace_spans);
    }
    groups
}

// ----------------------------------------------------------------------------
// 21.3 Windows & Tallies
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Pre,
    Post,
}

/// Comparison windows around a pivot, or one window over all data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Windows {
    Pivot { pivot: Timestamp, delta: Duration },
    All { start: Timestamp, end: Timestamp },
}

impl Windows {
    fn side(&self, ts: &Timestamp) -> Option<Side> {
        match *self {
            Windows::Pivot { pivot, delta } => {
                let delta = chrono::Duration::from_std(delta).unwrap_or_else(|_| chrono::Duration::zero());
                if *ts >= pivot - delta && *ts < pivot {
                    Some(Side::Pre)
                } else if *ts >= pivot && *ts <= pivot + delta {
                    Some(Side::Post)
                } else {
                    None
                }
            }
            Windows::All { start, end } => (*ts >= start && *ts <= end).then_some(Side::Post),
        }
    }

    /// Window length used for traffic rates, at least one second.
    pub fn duration_sec(&self) -> f64 {
        let secs = match *self {
            Windows::Pivot { delta, .. } => delta.as_secs_f64(),
            Windows::All { start, end } => (end - start).num_milliseconds() as f64 / 1000.0,
        };
        if secs > 0.0 {
            secs
        } else {
            1.0
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowTally {
    pub count: usize,
    pub errors: usize,
    pub latencies: Vec<f64>,
}

impl WindowTally {
    fn add(&mut self, span: &Span) {
        self.count += 1;
        if span.is_error() {
            self.errors += 1;
        }
        if let Some(ms) = span.duration_ms {
            self.latencies.push(ms);
        }
    }

    fn merge(&mut self, other: &WindowTally) {
        self.count += other.count;
        self.errors += other.errors;
        self.latencies.extend_from_slice(&other.latencies);
    }

    pub fn error_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.errors as f64 / self.count as f64 * 100.0
        }
    }

    pub fn p99(&self) -> f64 {
        Percentiles::compute(&self.latencies).p99
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tally {
    pub pre: WindowTally,
    pub post: WindowTally,
}

impl Tally {
    fn side_mut(&mut self, side: Side) -> &mut WindowTally {
        match side {
            Side::Pre => &mut self.pre,
            Side::Post => &mut self.post,
        }
    }

    fn merge(&mut self, other: &Tally) {
        self.pre.merge(&other.pre);
        self.post.merge(&other.post);
    }
}

/// Pre/post figures of one path and of each of its hops.
#[derive(Debug, Clone)]
pub struct PathStats {
    pub signature: String,
    pub services: ServicePath,
    pub trace_count: usize,
    pub total: Tally,
    pub hops: Vec<(CompactString, Tally)>,
    pub error_messages: BTreeSet<String>,
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

pub fn path_stats(group: &PathGroup<'_>, windows: &Windows, span_kind: Option<&str>) -> PathStats {
    let mut per_service: AHashMap<&str, Tally> = AHashMap::new();
    let mut error_messages = BTreeSet::new();
    for span in &group.spans {
        if span_kind.is_some_and(|k| !span.has_kind(k)) {
            continue;
        }
        let Some(side) = span.timestamp.as_ref().and_then(|ts| windows.side(ts)) else {
            continue;
        };
        per_service.entry(span.service.as_str()).or_default().side_mut(side).add(span);
        if span.is_error() {
            if let Some(msg) = &span.status_message {
                error_messages.insert(truncate_chars(msg, ERROR_MESSAGE_MAX_CHARS));
            }
        }
    }

    let mut hops: Vec<(CompactString, Tally)> = Vec::new();
    let mut total = Tally::default();
    for service in &group.services {
        if hops.iter().any(|(s, _)| s == service) {
            continue;
        }
        let tally = per_service.remove(service.as_str()).unwrap_or_default();
        total.merge(&tally);
        hops.push((service.clone(), tally));
    }

    PathStats {
        signature: group.signature.clone(),
        services: group.services.clone(),
        trace_count: group.trace_ids.len(),
        total,
        hops,
        error_messages,
    }
}

// ----------------------------------------------------------------------------
// 21.4 Classification
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    Warning,
    New,
    Disappeared,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::Warning => "WARNING",
            Severity::New => "NEW",
            Severity::Disappeared => "DISAPPEARED",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a path's pre/post tallies. `None` means unremarkable.
pub fn classify(tally: &Tally, error_threshold: f64, latency_threshold: f64) -> Option<Severity> {
    let (pre, post) = (&tally.pre, &tally.post);
    match (pre.count, post.count) {
        (0, 0) => return None,
        (0, _) => return Some(Severity::New),
        (_, 0) => return Some(Severity::Disappeared),
        _ => {}
    }

    let (pre_err, post_err) = (pre.error_rate(), post.error_rate());
    let (pre_lat, post_lat) = (pre.p99(), post.p99());
    let err_change = (post_err - pre_err).abs();
    let lat_change = if pre_lat > 0.0 || post_lat > 0.0 {
        delta_pct(pre_lat, post_lat).abs()
    } else {
        0.0
    };

    if err_change <= error_threshold && lat_change <= latency_threshold {
        return None;
    }
    if err_change > CRITICAL_ERROR_PCT || post_err > CRITICAL_ERROR_PCT || lat_change > CRITICAL_LATENCY_PCT {
        Some(Severity::Critical)
    } else {
        Some(Severity::Warning)
    }
}

// ----------------------------------------------------------------------------
// 21.5 Trace Path Report
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TraceRequest {
    pub service_name: Option<String>,
    pub span_kind: Option<String>,
    pub pivot_time: Option<String>,
    /// Window half-width such as `5m`; the configured default when unset
    pub delta: Option<String>,
    pub error_threshold: Option<f64>,
    pub latency_threshold: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeWindowsDescription {
    pub pre: String,
    pub post: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Thresholds {
    pub error_rate_change_pct: f64,
    pub latency_change_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceDescription {
    pub overview: String,
    pub time_windows: TimeWindowsDescription,
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowSummary {
    pub trace_count: usize,
    pub span_count: usize,
    pub error_rate_pct: f64,
    pub latency_p99_ms: f64,
}

impl WindowSummary {
    fn of(tally: &WindowTally, trace_count: usize) -> Option<Self> {
        (tally.count > 0).then(|| Self {
            trace_count,
            span_count: tally.count,
            error_rate_pct: round_to(tally.error_rate(), 1),
            latency_p99_ms: tally.p99(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceSummary {
    pub pre: Option<WindowSummary>,
    pub post: Option<WindowSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HopReport {
    pub service: String,
    pub traffic: String,
    pub error_rate: String,
    pub latency_p99: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RootCauseSuspect {
    pub service: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriticalPath {
    pub path: String,
    pub severity: Severity,
    pub hops: Vec<HopReport>,
    pub sample_errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_cause_suspect: Option<RootCauseSuspect>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceFilters {
    pub service_name: Option<String>,
    pub span_kind: Option<String>,
    pub pivot_time: Option<String>,
    pub delta_time: Option<String>,
    pub error_threshold_pct: f64,
    pub latency_threshold_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceReport {
    #[serde(rename = "_description")]
    pub description: TraceDescription,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<TraceSummary>,
    pub total_paths: usize,
    pub all_paths: Vec<String>,
    pub critical_paths: Vec<CriticalPath>,
    pub filters_applied: TraceFilters,
    pub timed_out: bool,
}

fn hop_report(service: &str, tally: &Tally, window_sec: f64) -> HopReport {
    let (pre, post) = (&tally.pre, &tally.post);
    HopReport {
        service: service.to_string(),
        traffic: format!(
            "{}{}{}",
            format_rate(pre.count as f64 / window_sec),
            PATH_SEPARATOR,
            format_rate(post.count as f64 / window_sec)
        ),
        error_rate: format!("{:.0}%{}{:.0}%", pre.error_rate(), PATH_SEPARATOR, post.error_rate()),
        latency_p99: format!("{}{}{}", format_latency(pre.p99()), PATH_SEPARATOR, format_latency(post.p99())),
    }
}

/// Hop with the highest post-window error rate above the critical bound.
fn root_cause(stats: &PathStats) -> Option<RootCauseSuspect> {
    let mut best: Option<(&str, f64)> = None;
    for (service, tally) in &stats.hops {
        let rate = tally.post.error_rate();
        if rate > CRITICAL_ERROR_PCT && best.map_or(true, |(_, b)| rate > b) {
            best = Some((service.as_str(), rate));
        }
    }
    best.map(|(service, rate)| RootCauseSuspect {
        service: service.to_string(),
        reason: format!("{:.0}% error rate", rate),
    })
}

/// Compare path behaviour before and after a pivot over loaded spans.
pub fn analyze_spans(
    spans: &[Span],
    request: &TraceRequest,
    config: &TracesConfig,
    deadline: &Deadline,
) -> ForensicsResult<TraceReport> {
    let delta_raw = request
        .delta
        .clone()
        .unwrap_or_else(|| humantime::format_duration(config.delta).to_string());
    let delta = parse_duration(&delta_raw).ok_or_else(|| InputError::InvalidArgument {
        name: "delta_time".into(),
        value: delta_raw.clone(),
        message: "expected a duration such as 5m or 1h".into(),
    })?;
    let pivot = parse_bound("pivot_time", request.pivot_time.as_deref())?;
    let error_threshold = request.error_threshold.unwrap_or(config.error_threshold);
    let latency_threshold = request.latency_threshold.unwrap_or(config.latency_threshold);

    let mut warnings = Vec::new();
    let windows = match pivot {
        Some(pivot) => Some(Windows::Pivot { pivot, delta }),
        None => {
            warnings.push(
                "pivot_time not provided - comparative analysis disabled. Providing pivot_time is highly encouraged for incident investigation."
                    .to_string(),
            );
            let start = spans.iter().filter_map(|s| s.timestamp).min();
            let end = spans.iter().filter_map(|s| s.timestamp).max();
            match (start, end) {
                (Some(start), Some(end)) => Some(Windows::All { start, end }),
                _ => {
                    warnings.push("No valid timestamps in traces".to_string());
                    None
                }
            }
        }
    };

    let groups = match windows {
        Some(_) => group_paths(spans, request.service_name.as_deref()),
        None => Vec::new(),
    };
    if groups.is_empty() && windows.is_some() {
        warnings.push(match &request.service_name {
            Some(service) => format!("No traces found containing service: {}", service),
            None => "No valid trace paths found".to_string(),
        });
    }

    let mut timed_out = false;
    let mut stats = Vec::with_capacity(groups.len());
    if let Some(windows) = &windows {
        for group in &groups {
            if !deadline.allows("trace_paths") {
                timed_out = true;
                break;
            }
            stats.push(path_stats(group, windows, request.span_kind.as_deref()));
        }
    }
    let window_sec = windows.as_ref().map_or(1.0, Windows::duration_sec);

    let summary = pivot.map(|_| {
        let mut total = Tally::default();
        for s in &stats {
            total.merge(&s.total);
        }
        let trace_count = groups.iter().map(|g| g.trace_ids.len()).sum();
        TraceSummary {
            pre: WindowSummary::of(&total.pre, trace_count),
            post: WindowSummary::of(&total.post, trace_count),
        }
    });

    let mut listed: Vec<(Option<Severity>, String)> = Vec::with_capacity(stats.len());
    let mut critical_paths = Vec::new();
    for s in &stats {
        let severity = classify(&s.total, error_threshold, latency_threshold);
        let mut line = format!(
            "{} [{}]",
            s.signature,
            format_rate(s.total.post.count as f64 / window_sec)
        );
        if let Some(sev) = severity {
            line.push_str(&format!(" ({})", sev));
        }
        listed.push((severity, line));

        if pivot.is_some() && matches!(severity, Some(Severity::Critical | Severity::Warning)) {
            critical_paths.push(CriticalPath {
                path: s.signature.clone(),
                severity: severity.unwrap_or(Severity::Warning),
                hops: s.hops.iter().map(|(svc, t)| hop_report(svc, t, window_sec)).collect(),
                sample_errors: s.error_messages.iter().take(MAX_ERROR_SAMPLES).cloned().collect(),
                root_cause_suspect: root_cause(s),
            });
        }
    }
    listed.sort_by_key(|(sev, _)| sev.map_or(4, |s| s as u8));
    critical_paths.sort_by_key(|p| p.severity);

    info!(
        target: "forensics::traces",
        spans = spans.len(),
        paths = stats.len(),
        flagged = critical_paths.len(),
        timed_out,
        "Trace path analysis complete"
    );

    let pivot_text = request.pivot_time.clone().filter(|_| pivot.is_some());
    Ok(TraceReport {
        description: TraceDescription {
            overview: "Critical path analysis - stats computed per unique trace path using trace_id stitching".into(),
            time_windows: TimeWindowsDescription {
                pre: match pivot {
                    Some(_) => format!("[pivot_time - {}, pivot_time)", delta_raw),
                    None => "N/A".into(),
                },
                post: match pivot {
                    Some(_) => format!("[pivot_time, pivot_time + {}]", delta_raw),
                    None => "All data".into(),
                },
            },
            thresholds: Thresholds {
                error_rate_change_pct: error_threshold,
                latency_change_pct: latency_threshold,
            },
        },
        warnings,
        summary,
        total_paths: listed.len(),
        all_paths: listed.into_iter().take(MAX_LISTED_PATHS).map(|(_, line)| line).collect(),
        critical_paths,
        filters_applied: TraceFilters {
            service_name: request.service_name.clone(),
            span_kind: request.span_kind.clone(),
            delta_time: pivot_text.as_ref().map(|_| delta_raw.clone()),
            pivot_time: pivot_text,
            error_threshold_pct: error_threshold,
            latency_threshold_pct: latency_threshold,
        },
        timed_out,
    })
}

/// Trace path analysis over a trace table.
pub fn analyze_trace_paths(
    path: &Path,
    request: &TraceRequest,
    config: &TracesConfig,
    policy: &AccessPolicy,
    deadline: &Deadline,
) -> ForensicsResult<TraceReport> {
    let (spans, ingest_warnings) = load_spans(path, policy)?;
    let mut report = analyze_spans(&spans, request, config, deadline)?;
    report.warnings.extend(ingest_warnings);
    Ok(report)
}

// ----------------------------------------------------------------------------
// 21.6 Service Error Tree
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ErrorTreeRequest {
    pub service_name: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageCount {
    pub message: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceErrors {
    pub service: String,
    pub span_count: usize,
    pub error_count: usize,
    pub error_rate_pct: f64,
    pub top_errors: Vec<MessageCount>,
    /// Services called by this service's failing spans
    pub downstream_services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorTreeReport {
    pub time_range: TimeWindow,
    pub total_spans: usize,
    pub total_errors: usize,
    pub first_span: Option<String>,
    pub last_span: Option<String>,
    pub services: Vec<ServiceErrors>,
}

#[derive(Default)]
struct ServiceAccumulator {
    spans: usize,
    errors: usize,
    messages: BTreeMap<String, usize>,
    downstream: BTreeSet<String>,
}

/// Per-service error counts over loaded spans. Services without errors are
/// kept only when they are the requested service.
pub fn error_tree_from_spans(spans: &[Span], request: &ErrorTreeRequest) -> ForensicsResult<ErrorTreeReport> {
    let window = TimeWindow::parse(request.start_time.as_deref(), request.end_time.as_deref())?;
    let selected: Vec<&Span> = spans
        .iter()
        .filter(|s| !window.is_bounded() || window.contains_opt(s.timestamp.as_ref()))
        .collect();

    let mut children: AHashMap<(&str, &str), Vec<&Span>> = AHashMap::new();
    for span in &selected {
        if let Some(parent) = span.parent_span_id.as_deref() {
            children.entry((span.trace_id.as_str(), parent)).or_default().push(*span);
        }
    }

    let mut by_service: BTreeMap<&str, ServiceAccumulator> = BTreeMap::new();
    for span in &selected {
        let acc = by_service.entry(span.service.as_str()).or_default();
        acc.spans += 1;
        if !span.is_error() {
            continue;
        }
        acc.errors += 1;
        let message = span
            .status_message
            .as_deref()
            .map(|m| truncate_chars(m, ERROR_MESSAGE_MAX_CHARS))
            .unwrap_or_else(|| "(no message)".into());
        *acc.messages.entry(message).or_default() += 1;
        let kids = span
            .span_id
            .as_deref()
            .and_then(|id| children.get(&(span.trace_id.as_str(), id)));
        for child in kids.into_iter().flatten() {
            if child.service != span.service {
                acc.downstream.insert(child.service.to_string());
            }
        }
    }

    let wanted = request.service_name.as_deref();
    let mut services: Vec<ServiceErrors> = by_service
        .into_iter()
        .filter(|(service, acc)| match wanted {
            Some(w) => *service == w,
            None => acc.errors > 0,
        })
        .map(|(service, acc)| {
            let mut top: Vec<MessageCount> = acc
                .messages
                .into_iter()
                .map(|(message, count)| MessageCount { message, count })
                .collect();
            top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.message.cmp(&b.message)));
            top.truncate(MAX_TOP_ERRORS);
            ServiceErrors {
                service: service.to_string(),
                span_count: acc.spans,
                error_count: acc.errors,
                error_rate_pct: if acc.spans == 0 {
                    0.0
                } else {
                    round_to(acc.errors as f64 / acc.spans as f64 * 100.0, 1)
                },
                top_errors: top,
                downstream_services: acc.downstream.into_iter().collect(),
            }
        })
        .collect();
    services.sort_by(|a, b| b.error_count.cmp(&a.error_count).then_with(|| a.service.cmp(&b.service)));

    Ok(ErrorTreeReport {
        time_range: window,
        total_spans: selected.len(),
        total_errors: selected.iter().filter(|s| s.is_error()).count(),
        first_span: selected.iter().filter_map(|s| s.timestamp).min().as_ref().map(format_timestamp),
        last_span: selected.iter().filter_map(|s| s.timestamp).max().as_ref().map(format_timestamp),
        services,
    })
}

pub fn service_error_tree(path: &Path, request: &ErrorTreeRequest, policy: &AccessPolicy) -> ForensicsResult<ErrorTreeReport> {
    let (spans, _) = load_spans(path, policy)?;
    error_tree_from_spans(&spans, request)
}
