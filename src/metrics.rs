// ============================================================================
// SECTION 15: METRIC ANALYZER
// ============================================================================
// Per-object metric tables (`<kind>_<name>.tsv`). Compact mode summarises
// each series; histogram buckets are reduced to percentiles; `eval` pivots
// long-form rows into aligned series before a derive expression runs.
// ============================================================================

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ForensicsError, ForensicsResult, InputError};
use crate::expr::{DeriveExpr, DEFAULT_TARGET};
use crate::identity::{deployment_from_pod, name_variants, EntityQuery};
use crate::ingest::{object_info_from_filename, parse_tags, read_table, AccessPolicy, Row, Table};
use crate::pipeline::{
    numeric_columns, pivot_long_form, sort_by_time, strip_internal, Aggregation, LongForm, PivotMode, Pipeline,
    Query,
};
use crate::stats::{histogram_quantile, mean_and_stddev, outliers_above, parse_le};
use crate::timeutil::{parse_time, TimeWindow};
use crate::value::{Value, ValueMap};

/// Labels kept from the tag cell by default
pub const DEFAULT_LABELS_KEEP: [&str; 4] = ["span_name", "span_kind", "status_code", "le"];

/// Group-by columns that select per-object eval mode
pub const OBJECT_DIMENSIONS: [&str; 3] = ["deployment", "pod_name", "_object_name"];

const DEDUPE_COLUMNS: [&str; 9] = [
    "timestamp",
    "metric_name",
    "metric_type",
    "namespace",
    "service_name",
    "status_code",
    "bucket_le",
    "value",
    "_labels_sig",
];

const METRIC_AGGREGATIONS: [Aggregation; 7] = [
    Aggregation::Count,
    Aggregation::First,
    Aggregation::Last,
    Aggregation::Sum,
    Aggregation::Mean,
    Aggregation::Max,
    Aggregation::Min,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    #[default]
    Compact,
    Raw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricRequest {
    /// `namespace/kind/name`, `kind/name` or `name`; batch mode when absent
    pub object: Option<String>,
    /// Batch selector such as `pod/*` or `pod/frontend*`
    pub object_pattern: String,
    pub metric_names: Vec<String>,
    pub eval: Option<String>,
    pub filters: BTreeMap<String, Value>,
    pub group_by: Option<String>,
    pub agg: Option<String>,
    pub verbosity: Verbosity,
    /// Row limit; `None` uses the configured default, 0 returns everything
    pub limit: Option<usize>,
    pub sort_by: Option<String>,
    pub include_tags: bool,
    pub include_buckets: bool,
    pub labels_keep: Option<Vec<String>>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

impl Default for MetricRequest {
    fn default() -> Self {
        Self {
            object: None,
            object_pattern: "*".into(),
            metric_names: Vec::new(),
            eval: None,
            filters: BTreeMap::new(),
            group_by: None,
            agg: None,
            verbosity: Verbosity::Compact,
            limit: None,
            sort_by: None,
            include_tags: false,
            include_buckets: false,
            labels_keep: None,
            start_time: None,
            end_time: None,
        }
    }
}

/// Which shape the metric result took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricOutput {
    Summary,
    Quantiles,
    Grouped,
    Aggregate,
    Rows,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricReport {
    pub output: MetricOutput,
    pub files: usize,
    pub total_count: usize,
    pub returned_count: usize,
    pub data: Vec<Row>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl MetricReport {
    fn new(output: MetricOutput, files: usize, mut data: Vec<Row>, limit: usize, warnings: Vec<String>) -> Self {
        let total_count = data.len();
        if limit > 0 {
            data.truncate(limit);
        }
        Self {
            output,
            files,
            total_count,
            returned_count: data.len(),
            data,
            warnings,
        }
    }
}

// ----------------------------------------------------------------------------
// 15.1 File Selection
// ----------------------------------------------------------------------------

fn glob_sorted(dir: &Path, pattern: &str) -> Vec<PathBuf> {
    let full = dir.join(pattern);
    let mut files: Vec<PathBuf> = glob::glob(&full.to_string_lossy())
        .map(|paths| paths.filter_map(Result::ok).filter(|p| p.is_file()).collect())
        .unwrap_or_default();
    files.sort();
    files
}

/// Metric files for one object (trying shortened service names) or for a
/// batch pattern.
pub fn metric_files(dir: &Path, object: Option<&str>, object_pattern: &str) -> ForensicsResult<Vec<PathBuf>> {
    if !dir.exists() {
        return Err(InputError::FileNotFound { path: dir.to_path_buf() }.into());
    }

    let files = match object {
        Some(raw) => {
            let query = EntityQuery::parse(raw)?;
            let name = glob::Pattern::escape(&query.name);
            match &query.kind {
                None => {
                    let files = glob_sorted(dir, &format!("*_{}*.tsv", name));
                    if files.is_empty() {
                        glob_sorted(dir, &format!("*{}*.tsv", name))
                    } else {
                        files
                    }
                }
                Some(kind) => name_variants(&query.name)
                    .iter()
                    .map(|variant| {
                        let prefix = format!("{}_{}", kind.to_ascii_lowercase(), glob::Pattern::escape(variant));
                        glob_sorted(dir, &format!("{}*.tsv", prefix))
                    })
                    .find(|files| !files.is_empty())
                    .unwrap_or_default(),
            }
        }
        None => {
            let pattern = match object_pattern.split_once('/') {
                Some((kind, names)) => format!("{}_{}.tsv", kind.to_ascii_lowercase(), names),
                None if object_pattern == "*" || object_pattern.is_empty() => "*.tsv".to_string(),
                None => format!("{}.tsv", object_pattern),
            };
            glob_sorted(dir, &pattern)
        }
    };
    Ok(files)
}

// ----------------------------------------------------------------------------
// 15.2 Loading
// ----------------------------------------------------------------------------

struct Loaded {
    rows: Vec<Row>,
    columns: Vec<String>,
    warnings: Vec<String>,
}

fn push_column(columns: &mut Vec<String>, name: &str) {
    if !columns.iter().any(|c| c == name) {
        columns.push(name.to_string());
    }
}

/// Load, tag and filter every file. Unreadable files become warnings.
fn load_metric_rows(
    files: &[PathBuf],
    metric_names: &[String],
    filters: &BTreeMap<String, Value>,
    window: &TimeWindow,
    policy: &AccessPolicy,
) -> ForensicsResult<Loaded> {
    let mut loaded = Loaded {
        rows: Vec::new(),
        columns: Vec::new(),
        warnings: Vec::new(),
    };

    for path in files {
        let (table, report) = match read_table(path, policy) {
            Ok(parsed) => parsed,
            Err(ForensicsError::Input(e @ InputError::AccessDenied { .. })) => return Err(e.into()),
            Err(e) => {
                warn!(target: "forensics::metrics", file = %path.display(), error = %e, "Skipping metric file");
                loaded.warnings.push(format!("{}: {}", path.display(), e));
                continue;
            }
        };
        loaded.warnings.extend(report.warnings);

        let file_name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let (kind, name) = object_info_from_filename(&file_name);
        let deployment = if kind == "pod" { deployment_from_pod(&name) } else { name.clone() };

        let has_metric_name = table.has_column("metric_name");
        let has_timestamp = table.has_column("timestamp");
        for col in &table.columns {
            push_column(&mut loaded.columns, col);
        }
        for col in ["_source_file", "_object_kind", "_object_name", "deployment"] {
            push_column(&mut loaded.columns, col);
        }

        for mut row in table.rows {
            if has_metric_name && !metric_names.is_empty() {
                let name = row.get("metric_name").and_then(Value::as_str).unwrap_or_default();
                if !metric_names.iter().any(|m| m == name) {
                    continue;
                }
            }
            if has_timestamp && window.is_bounded() {
                let ts = row.get("timestamp").and_then(Value::as_str).and_then(parse_time);
                if !window.contains_opt(ts.as_ref()) {
                    continue;
                }
            }
            row.insert("_source_file".into(), Value::from(file_name.as_str()));
            row.insert("_object_kind".into(), Value::from(kind.as_str()));
            row.insert("_object_name".into(), Value::from(name.as_str()));
            row.insert("deployment".into(), Value::from(deployment.as_str()));

            // Filters on columns a file lacks are ignored for that file.
            let keep = filters.iter().all(|(col, expected)| match row.get(col) {
                None => true,
                Some(actual) => actual.loosely_equals(expected),
            });
            if keep {
                loaded.rows.push(row);
            }
        }
    }
    Ok(loaded)
}

// ----------------------------------------------------------------------------
// 15.3 Compact Shaping
// ----------------------------------------------------------------------------

fn signature(map: &ValueMap) -> String {
    serde_json::to_string(&Value::Map(map.clone()).to_json()).unwrap_or_default()
}

fn is_bucket_row(row: &Row) -> bool {
    row.get("metric_name")
        .and_then(Value::as_str)
        .map_or(false, |m| m.ends_with("_bucket"))
}

/// Replace the verbose tag cell with an allow-listed `labels` map.
fn attach_labels(rows: &mut [Row], columns: &mut Vec<String>, keep: &[String], include_tags: bool) {
    if !columns.iter().any(|c| c == "tags") {
        return;
    }
    for row in rows.iter_mut() {
        let tags = row.get("tags").and_then(Value::as_str).map(parse_tags).unwrap_or_default();
        let labels: ValueMap = keep
            .iter()
            .filter_map(|k| tags.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        let without_le: ValueMap = labels.iter().filter(|(k, _)| *k != "le").map(|(k, v)| (k.clone(), v.clone())).collect();
        row.insert("_labels_sig".into(), Value::from(signature(&labels)));
        row.insert("_labels_no_le_sig".into(), Value::from(signature(&without_le)));
        row.insert("labels".into(), Value::Map(labels));
        if !include_tags {
            row.remove("tags");
        }
    }
    for col in ["labels", "_labels_sig", "_labels_no_le_sig"] {
        push_column(columns, col);
    }
    if !include_tags {
        columns.retain(|c| c != "tags");
    }
}

/// Drop duplicate rows, keeping the last occurrence.
fn dedupe_keep_last(rows: Vec<Row>, columns: &[String]) -> Vec<Row> {
    let subset: Vec<&str> = DEDUPE_COLUMNS
        .iter()
        .copied()
        .filter(|c| columns.iter().any(|col| col == c))
        .collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut kept: Vec<Row> = rows
        .into_iter()
        .rev()
        .filter(|row| {
            let key = if subset.is_empty() {
                serde_json::to_string(&Value::Map(row.clone()).to_json()).unwrap_or_default()
            } else {
                let cells: Vec<String> = subset.iter().map(|c| row.get(*c).map(Value::render).unwrap_or_default()).collect();
                cells.join("\u{1f}")
            };
            seen.insert(key)
        })
        .collect();
    kept.reverse();
    kept
}

/// Per-series p50/p90/p95/p99 at each series' latest timestamp.
fn bucket_quantiles(rows: &[Row], columns: &[String]) -> Vec<Row> {
    let group_columns: Vec<&String> = columns
        .iter()
        .filter(|c| {
            !matches!(c.as_str(), "timestamp" | "bucket_le" | "value" | "labels") && !c.starts_with('_')
        })
        .collect();

    let mut series: BTreeMap<Vec<String>, Vec<&Row>> = BTreeMap::new();
    for row in rows.iter().filter(|r| is_bucket_row(r)) {
        let mut key: Vec<String> = group_columns.iter().map(|c| row.get(*c).map(Value::render).unwrap_or_default()).collect();
        key.push(row.get("_labels_no_le_sig").map(Value::render).unwrap_or_default());
        series.entry(key).or_default().push(row);
    }

    let mut out = Vec::new();
    for members in series.values() {
        let latest = members
            .iter()
            .filter_map(|r| r.get("timestamp").and_then(Value::as_str).and_then(parse_time))
            .max();
        let at_latest: Vec<&&Row> = members
            .iter()
            .filter(|r| r.get("timestamp").and_then(Value::as_str).and_then(parse_time) == latest)
            .collect();
        let Some(first) = at_latest.first() else { continue };

        let buckets: Vec<(f64, f64)> = at_latest
            .iter()
            .filter_map(|r| {
                let le = r
                    .get("bucket_le")
                    .filter(|v| !v.is_null())
                    .or_else(|| r.get("labels").and_then(|l| l.get("le")))
                    .map(Value::render)
                    .and_then(|raw| parse_le(&raw))?;
                Some((le, r.get("value").and_then(Value::as_f64).unwrap_or(0.0)))
            })
            .collect();

        let sample_count = buckets
            .iter()
            .filter(|(le, _)| le.is_infinite())
            .map(|(_, c)| *c)
            .reduce(f64::max)
            .or_else(|| buckets.iter().map(|(_, c)| *c).reduce(f64::max))
            .unwrap_or(0.0);

        let mut row = Row::new();
        for col in &group_columns {
            row.insert((*col).clone(), first.get(*col).cloned().unwrap_or(Value::Null));
        }
        let labels = first
            .get("_labels_no_le_sig")
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok())
            .map(Value::from);
        if let Some(labels) = labels {
            row.insert("labels".into(), labels);
        }
        row.insert("timestamp".into(), first.get("timestamp").cloned().unwrap_or(Value::Null));
        row.insert("sample_count".into(), Value::Number(sample_count));
        let quantiles: ValueMap = [("p50", 0.50), ("p90", 0.90), ("p95", 0.95), ("p99", 0.99)]
            .into_iter()
            .map(|(name, q)| (name.to_string(), Value::from(histogram_quantile(q, &buckets))))
            .collect();
        row.insert("duration_ms".into(), Value::Map(quantiles));
        out.push(row);
    }
    out
}

/// `count/mean/min/max/last_value/last_timestamp` per dimension.
fn summarize(rows: &[Row], columns: &[String]) -> Vec<Row> {
    let dims: Vec<&String> = columns
        .iter()
        .filter(|c| !matches!(c.as_str(), "timestamp" | "value") && !c.starts_with('_'))
        .collect();

    let mut groups: BTreeMap<Vec<String>, Vec<&Row>> = BTreeMap::new();
    for row in rows {
        let key = dims
            .iter()
            .map(|c| match c.as_str() {
                "labels" => row.get("_labels_sig").map(Value::render).unwrap_or_default(),
                other => row.get(other).map(Value::render).unwrap_or_default(),
            })
            .collect();
        groups.entry(key).or_default().push(row);
    }

    groups
        .into_values()
        .map(|members| {
            let mut out = Row::new();
            if let Some(first) = members.first() {
                for col in &dims {
                    out.insert((*col).clone(), first.get(*col).cloned().unwrap_or(Value::Null));
                }
            }
            let values: Vec<f64> = members
                .iter()
                .filter_map(|r| r.get("value").and_then(Value::as_f64))
                .filter(|v| !v.is_nan())
                .collect();
            out.insert("count".into(), Value::from(values.len()));
            for agg in [Aggregation::Mean, Aggregation::Min, Aggregation::Max] {
                out.insert(agg.name().into(), Value::from(agg.reduce(&values)));
            }
            let last = members
                .iter()
                .filter(|r| r.get("value").and_then(Value::as_f64).is_some())
                .max_by_key(|r| r.get("timestamp").and_then(Value::as_str).and_then(parse_time));
            if let Some(last) = last {
                out.insert("last_value".into(), last.get("value").and_then(Value::as_f64).map_or(Value::Null, Value::Number));
                out.insert("last_timestamp".into(), last.get("timestamp").cloned().unwrap_or(Value::Null));
            }
            out
        })
        .collect()
}

fn sort_desc(rows: &mut [Row], column: &str) {
    let null = Value::Null;
    rows.sort_by(|a, b| {
        let va = a.get(column).unwrap_or(&null);
        let vb = b.get(column).unwrap_or(&null);
        vb.cmp_total(va)
    });
}

// ----------------------------------------------------------------------------
// 15.4 Metric Analysis
// ----------------------------------------------------------------------------

/// Load metric files and shape them per the request.
pub fn analyze_metrics(
    dir: &Path,
    request: &MetricRequest,
    default_limit: usize,
    policy: &AccessPolicy,
) -> ForensicsResult<MetricReport> {
    let window = TimeWindow::parse(request.start_time.as_deref(), request.end_time.as_deref())?;
    let aggregation = match &request.agg {
        Some(name) => Some(Aggregation::parse_supported(name, &METRIC_AGGREGATIONS)?),
        None => None,
    };
    let limit = request.limit.unwrap_or(default_limit);

    let files = metric_files(dir, request.object.as_deref(), &request.object_pattern)?;
    if files.is_empty() {
        return Err(InputError::FileNotFound {
            path: dir.join(request.object.as_deref().unwrap_or(&request.object_pattern)),
        }
        .into());
    }

    let Loaded {
        mut rows,
        mut columns,
        warnings,
    } = load_metric_rows(&files, &request.metric_names, &request.filters, &window, policy)?;
    debug!(target: "forensics::metrics", files = files.len(), rows = rows.len(), "Metric rows loaded");

    let compact = request.verbosity == Verbosity::Compact;
    if compact {
        let requested_buckets = request.metric_names.iter().any(|m| m.ends_with("_bucket"));
        if !requested_buckets && !request.include_buckets {
            rows.retain(|r| !is_bucket_row(r));
        }
        let keep: Vec<String> = request
            .labels_keep
            .clone()
            .unwrap_or_else(|| DEFAULT_LABELS_KEEP.iter().map(|s| s.to_string()).collect());
        attach_labels(&mut rows, &mut columns, &keep, request.include_tags);
        rows = dedupe_keep_last(rows, &columns);

        if requested_buckets && !request.include_buckets && rows.iter().any(is_bucket_row) {
            let mut out = bucket_quantiles(&rows, &columns);
            if let Some(sort) = &request.sort_by {
                sort_desc(&mut out, sort);
            }
            return Ok(MetricReport::new(MetricOutput::Quantiles, files.len(), out, limit, warnings));
        }
    }

    let mut table = Table { columns, rows };
    let mut eval_target = None;
    if let Some(source) = request.eval.as_deref().filter(|s| !s.trim().is_empty()) {
        if !table.has_column("metric_name") || !table.has_column("value") {
            return Err(InputError::unsupported_format(
                "eval needs long-form rows with metric_name and value columns",
            )
            .into());
        }
        let per_object = request
            .group_by
            .as_deref()
            .map_or(false, |g| OBJECT_DIMENSIONS.contains(&g));
        let mode = if per_object {
            PivotMode::PerEntity {
                entity_column: "_object_name".into(),
            }
        } else {
            PivotMode::ClusterWide
        };
        let layout = LongForm {
            time: "timestamp",
            name: "metric_name",
            value: "value",
        };
        let mut pivoted = pivot_long_form(&table.rows, layout, &mode, &["deployment"]);
        if per_object {
            for row in pivoted.rows.iter_mut() {
                let pod = row.get("_object_name").cloned().unwrap_or(Value::Null);
                row.insert("pod_name".into(), pod);
            }
            push_column(&mut pivoted.columns, "pod_name");
        }

        let expr = DeriveExpr::compile(source, &pivoted.columns)?;
        for row in pivoted.rows.iter_mut() {
            expr.apply(row);
        }
        push_column(&mut pivoted.columns, &expr.target);
        eval_target = Some(expr.target);
        table = pivoted;
    }

    let agg_explicit = aggregation.filter(|a| *a != Aggregation::Mean);
    if compact && request.group_by.is_none() && request.eval.is_none() && agg_explicit.is_none() && table.has_column("value") {
        let mut out = summarize(&table.rows, &table.columns);
        match &request.sort_by {
            Some(sort) if out.iter().any(|r| r.contains_key(sort)) => sort_desc(&mut out, sort),
            _ => sort_desc(&mut out, "max"),
        }
        return Ok(MetricReport::new(MetricOutput::Summary, files.len(), out, limit, warnings));
    }

    if let Some(group) = &request.group_by {
        let aggregation = aggregation.unwrap_or(Aggregation::Mean);
        let sort_by = request
            .sort_by
            .clone()
            .or_else(|| eval_target.clone().filter(|t| t != DEFAULT_TARGET));
        let query = Query {
            time_column: Some("timestamp".into()),
            group_by: vec![group.clone()],
            aggregation,
            sort_by,
            ..Query::default()
        };
        let page = Pipeline::default().supporting(&METRIC_AGGREGATIONS).run(table, &query)?;
        return Ok(MetricReport::new(MetricOutput::Grouped, files.len(), page.data, limit, warnings));
    }

    if let Some(agg) = agg_explicit {
        let numeric = numeric_columns(table.rows.iter(), &table.columns, &[], Some("timestamp"));
        if numeric.is_empty() {
            return Err(InputError::NoNumericColumns { agg: agg.name().into() }.into());
        }
        let row: Row = numeric
            .into_iter()
            .map(|col| {
                let samples: Vec<f64> = table.rows.iter().filter_map(|r| r.get(&col).and_then(Value::as_f64)).collect();
                let value = match agg {
                    Aggregation::First => samples.first().copied(),
                    Aggregation::Last => samples.last().copied(),
                    other => other.reduce(&samples),
                };
                (col, Value::from(value))
            })
            .collect();
        return Ok(MetricReport::new(MetricOutput::Aggregate, files.len(), vec![row], 0, warnings));
    }

    let mut rows = table.rows;
    sort_by_time(&mut rows, "timestamp");
    let mut rows: Vec<Row> = rows.into_iter().map(strip_internal).collect();
    if compact {
        if let Some(sort) = &request.sort_by {
            sort_desc(&mut rows, sort);
        }
    }
    let limit = if compact { limit } else { 0 };
    Ok(MetricReport::new(MetricOutput::Rows, files.len(), rows, limit, warnings))
}

// ----------------------------------------------------------------------------
// 15.5 Anomalies
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyRequest {
    pub object: String,
    /// Substring a metric name must contain
    pub metric_name_filter: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    /// Include every row of each file
    pub raw_content: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileAnomalies {
    pub file: String,
    pub metric_name: String,
    pub count: usize,
    pub mean: Option<f64>,
    pub stddev: Option<f64>,
    pub anomaly_count: usize,
    pub anomalies: Vec<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Row>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnomalyReport {
    pub object: String,
    pub metrics: Vec<FileAnomalies>,
}

/// Values above mean + 2σ (sample σ), per metric file.
pub fn metric_anomalies(dir: &Path, request: &AnomalyRequest, policy: &AccessPolicy) -> ForensicsResult<AnomalyReport> {
    let window = TimeWindow::parse(request.start_time.as_deref(), request.end_time.as_deref())?;
    let files = metric_files(dir, Some(&request.object), "*")?;
    if files.is_empty() {
        return Err(InputError::FileNotFound { path: dir.join(&request.object) }.into());
    }

    let mut metrics = Vec::new();
    for path in &files {
        let file = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let table = match read_table(path, policy) {
            Ok((table, _)) => table,
            Err(ForensicsError::Input(e @ InputError::AccessDenied { .. })) => return Err(e.into()),
            Err(e) => {
                metrics.push(FileAnomalies {
                    file,
                    metric_name: "unknown".into(),
                    count: 0,
                    mean: None,
                    stddev: None,
                    anomaly_count: 0,
                    anomalies: Vec::new(),
                    data: None,
                    error: Some(e.to_string()),
                });
                continue;
            }
        };

        let rows: Vec<Row> = table
            .rows
            .into_iter()
            .filter(|r| match &request.metric_name_filter {
                Some(f) => r.get("metric_name").and_then(Value::as_str).map_or(false, |m| m.contains(f.as_str())),
                None => true,
            })
            .filter(|r| {
                !window.is_bounded()
                    || window.contains_opt(r.get("timestamp").and_then(Value::as_str).and_then(parse_time).as_ref())
            })
            .collect();
        if rows.is_empty() {
            continue;
        }

        let values: Vec<f64> = rows.iter().map(|r| r.get("value").and_then(Value::as_f64).unwrap_or(f64::NAN)).collect();
        let present: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        let moments = mean_and_stddev(&present);
        let flagged: HashSet<usize> = {
            let indices: Vec<usize> = values.iter().enumerate().filter(|(_, v)| !v.is_nan()).map(|(i, _)| i).collect();
            outliers_above(&present, 2.0).into_iter().map(|i| indices[i]).collect()
        };
        let anomalies: Vec<Row> = rows
            .iter()
            .enumerate()
            .filter(|(i, _)| flagged.contains(i))
            .map(|(_, r)| r.clone())
            .collect();

        metrics.push(FileAnomalies {
            file,
            metric_name: rows[0]
                .get("metric_name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            count: rows.len(),
            mean: moments.map(|(m, _)| m),
            stddev: moments.and_then(|(_, sd)| sd),
            anomaly_count: anomalies.len(),
            anomalies,
            data: request.raw_content.then_some(rows),
            error: None,
        });
    }

    Ok(AnomalyReport {
        object: request.object.clone(),
        metrics,
    })
}

#[cfg(test)]
mod metrics_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CART_POD: &str = "timestamp\tmetric_name\tvalue\ttags\n\
2025-01-01T10:00:00Z\tcpu_usage\t0.5\t{'span_name': 'GetCart', 'pod': 'x'}\n\
2025-01-01T10:01:00Z\tcpu_usage\t0.7\t{'span_name': 'GetCart', 'pod': 'x'}\n\
2025-01-01T10:01:00Z\tcpu_usage\t0.7\t{'span_name': 'GetCart', 'pod': 'x'}\n\
2025-01-01T10:00:00Z\tcpu_limit\t1.0\t{}\n\
2025-01-01T10:01:00Z\tcpu_limit\t1.0\t{}\n";

    const LATENCY_SVC: &str = "timestamp\tmetric_name\tvalue\ttags\n\
2025-01-01T10:00:00Z\tlatency_bucket\t5\t{'le': '1'}\n\
2025-01-01T10:01:00Z\tlatency_bucket\t10\t{'le': '1'}\n\
2025-01-01T10:01:00Z\tlatency_bucket\t40\t{'le': '5'}\n\
2025-01-01T10:01:00Z\tlatency_bucket\t50\t{'le': '+Inf'}\n\
2025-01-01T10:01:00Z\tlatency_count\t50\t{}\n";

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pod_cart-7d9f8b6c4-abcde.tsv"), CART_POD).unwrap();
        std::fs::write(dir.path().join("service_latency.tsv"), LATENCY_SVC).unwrap();
        dir
    }

    #[test]
    fn test_file_selection_strips_service_suffix() {
        let dir = fixture();
        let files = metric_files(dir.path(), Some("service/latency-service"), "*").unwrap();
        assert_eq!(files.len(), 1);
        let files = metric_files(dir.path(), Some("cart"), "*").unwrap();
        assert_eq!(files.len(), 1);
        let files = metric_files(dir.path(), None, "pod/*").unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_compact_summary_dedupes_and_hides_buckets() {
        let dir = fixture();
        let report = analyze_metrics(dir.path(), &MetricRequest::default(), 200, &AccessPolicy::permissive()).unwrap();
        assert_eq!(report.output, MetricOutput::Summary);
        assert!(report.data.iter().all(|r| r["metric_name"] != Value::from("latency_bucket")));
        let usage = report.data.iter().find(|r| r["metric_name"] == Value::from("cpu_usage")).unwrap();
        assert_eq!(usage["count"], Value::from(2usize));
        assert_eq!(usage["last_value"], Value::Number(0.7));
        assert_eq!(usage["deployment"], Value::from("cart"));
        let labels = usage["labels"].as_map().unwrap();
        assert_eq!(labels.keys().collect::<Vec<_>>(), vec!["span_name"]);
        assert!(!usage.contains_key("tags"));
    }

    #[test]
    fn test_requested_buckets_become_quantiles() {
        let dir = fixture();
        let request = MetricRequest {
            metric_names: vec!["latency_bucket".into()],
            ..MetricRequest::default()
        };
        let report = analyze_metrics(dir.path(), &request, 200, &AccessPolicy::permissive()).unwrap();
        assert_eq!(report.output, MetricOutput::Quantiles);
        assert_eq!(report.data.len(), 1);
        let row = &report.data[0];
        assert_eq!(row["sample_count"], Value::Number(50.0));
        let p50 = row["duration_ms"].get("p50").and_then(Value::as_f64).unwrap();
        assert!(p50 > 1.0 && p50 < 5.0);
        assert_eq!(row["duration_ms"].get("p99"), Some(&Value::Number(5.0)));
    }

    #[test]
    fn test_eval_per_object_ratio() {
        let dir = fixture();
        let request = MetricRequest {
            object_pattern: "pod/*".into(),
            eval: Some("ratio = cpu_usage / cpu_limit".into()),
            group_by: Some("deployment".into()),
            ..MetricRequest::default()
        };
        let report = analyze_metrics(dir.path(), &request, 200, &AccessPolicy::permissive()).unwrap();
        assert_eq!(report.output, MetricOutput::Grouped);
        assert_eq!(report.data[0]["deployment"], Value::from("cart"));
        assert_eq!(report.data[0]["ratio"], Value::Number(0.6));
    }

    #[test]
    fn test_eval_unknown_series_is_reported() {
        let dir = fixture();
        let request = MetricRequest {
            object_pattern: "pod/*".into(),
            eval: Some("nope / cpu_limit".into()),
            ..MetricRequest::default()
        };
        let err = analyze_metrics(dir.path(), &request, 200, &AccessPolicy::permissive()).unwrap_err();
        assert_eq!(err.category(), "expression");
    }

    #[test]
    fn test_raw_mode_returns_rows_in_time_order() {
        let dir = fixture();
        let request = MetricRequest {
            object: Some("pod/cart-7d9f8b6c4-abcde".into()),
            verbosity: Verbosity::Raw,
            ..MetricRequest::default()
        };
        let report = analyze_metrics(dir.path(), &request, 2, &AccessPolicy::permissive()).unwrap();
        assert_eq!(report.output, MetricOutput::Rows);
        assert_eq!(report.total_count, 5);
        assert_eq!(report.returned_count, 5);
        assert!(!report.data[0].contains_key("_object_name"));
    }

    #[test]
    fn test_anomalies_above_two_sigma() {
        let dir = tempfile::tempdir().unwrap();
        let mut content = String::from("timestamp\tmetric_name\tvalue\n");
        for i in 0..20 {
            content.push_str(&format!("2025-01-01T10:{:02}:00Z\tcpu\t10\n", i));
        }
        content.push_str("2025-01-01T10:30:00Z\tcpu\t100\n");
        std::fs::write(dir.path().join("pod_api-1-2.tsv"), content).unwrap();

        let request = AnomalyRequest {
            object: "pod/api-1-2".into(),
            ..AnomalyRequest::default()
        };
        let report = metric_anomalies(dir.path(), &request, &AccessPolicy::permissive()).unwrap();
        assert_eq!(report.metrics.len(), 1);
        assert_eq!(report.metrics[0].anomaly_count, 1);
        assert_eq!(report.metrics[0].anomalies[0]["timestamp"], Value::from("2025-01-01T10:30:00Z"));
        assert!(report.metrics[0].data.is_none());
    }
}
