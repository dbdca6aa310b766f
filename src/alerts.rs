// ============================================================================
// SECTION 14: ALERT ANALYZER
// ============================================================================
// Alert snapshots (one JSON document per scrape) flattened into rows and run
// through the query pipeline, plus an incident-level summary per
// (alertname, entity, severity).
// ============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::error::{ForensicsError, ForensicsResult, InputError};
use crate::ingest::{alert_snapshot_timestamp, read_json, AccessPolicy, Row, Table};
use crate::pipeline::{Aggregation, ColumnShortcuts, Paginated, Pipeline, Query};
use crate::timeutil::{format_minutes, format_timestamp, parse_time, TimeWindow, Timestamp};
use crate::value::Value;

/// Aggregations meaningful for alert rows
pub const ALERT_AGGREGATIONS: [Aggregation; 7] = [
    Aggregation::Count,
    Aggregation::First,
    Aggregation::Last,
    Aggregation::Sum,
    Aggregation::Mean,
    Aggregation::Max,
    Aggregation::Min,
];

const NUMERIC_ALERT_COLUMNS: [&str; 2] = ["value", "duration_active_min"];
const DESCENDING_SORTS: [&str; 3] = ["duration_active_min", "value", "count"];
const ENTITY_LABELS: [&str; 6] = ["service_name", "service", "pod", "deployment", "instance", "job"];
const SNAPSHOT_COLUMN: &str = "_file_timestamp";

/// Which clock windows and ordering use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeBasis {
    /// When the snapshot was taken
    #[default]
    #[serde(rename = "snapshot")]
    Snapshot,
    /// When the alert became active
    #[serde(rename = "activeAt")]
    ActiveAt,
}

// ----------------------------------------------------------------------------
// 14.1 Snapshot Loading
// ----------------------------------------------------------------------------

/// One alert object and the time of the snapshot it came from.
#[derive(Debug, Clone)]
pub struct ObservedAlert {
    pub snapshot: Option<Timestamp>,
    pub alert: JsonValue,
}

/// The directory holding alert snapshots: `dir` itself, or its `alerts/`
/// child when `dir` has no JSON files.
pub fn alerts_dir(dir: &Path) -> ForensicsResult<PathBuf> {
    if !dir.exists() {
        return Err(InputError::FileNotFound { path: dir.to_path_buf() }.into());
    }
    let sub = dir.join("alerts");
    if sub.is_dir() && json_files(dir).is_empty() {
        return Ok(sub);
    }
    Ok(dir.to_path_buf())
}

fn json_files(dir: &Path) -> Vec<PathBuf> {
    let pattern = dir.join("*.json");
    let mut files: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .map(|paths| paths.filter_map(Result::ok).collect())
        .unwrap_or_default();
    files.sort();
    files
}

/// Every alert of every snapshot, in file order. Unreadable files are skipped
/// with a warning; policy violations are errors.
pub fn load_alerts(dir: &Path, policy: &AccessPolicy) -> ForensicsResult<Vec<ObservedAlert>> {
    let dir = alerts_dir(dir)?;
    let mut out = Vec::new();

    for file in json_files(&dir) {
        let doc = match read_json(&file, policy) {
            Ok(doc) => doc,
            Err(ForensicsError::Input(e @ InputError::AccessDenied { .. })) => return Err(e.into()),
            Err(e) => {
                warn!(target: "forensics::alerts", file = %file.display(), error = %e, "Skipping alert snapshot");
                continue;
            }
        };
        let file_name = file.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let snapshot = alert_snapshot_timestamp(&file_name, &doc);

        let alerts = match doc {
            JsonValue::Object(mut obj) => {
                let nested = obj
                    .get_mut("data")
                    .and_then(|d| d.get_mut("alerts"))
                    .map(JsonValue::take);
                match nested.or_else(|| obj.remove("alerts")) {
                    Some(JsonValue::Array(list)) => list,
                    Some(other) => vec![other],
                    None => vec![JsonValue::Object(obj)],
                }
            }
            JsonValue::Array(list) => list,
            other => vec![other],
        };
        out.extend(
            alerts
                .into_iter()
                .filter(JsonValue::is_object)
                .map(|alert| ObservedAlert { snapshot, alert }),
        );
    }

    debug!(target: "forensics::alerts", dir = %dir.display(), alerts = out.len(), "Alert snapshots loaded");
    Ok(out)
}

/// Flatten nested objects into dotted columns; arrays stay values.
pub fn flatten_json(prefix: &str, value: &JsonValue, out: &mut Row) {
    match value {
        JsonValue::Object(obj) if !obj.is_empty() => {
            for (k, v) in obj {
                let key = if prefix.is_empty() { k.clone() } else { format!("{}.{}", prefix, k) };
                flatten_json(&key, v, out);
            }
        }
        other if !prefix.is_empty() => {
            out.insert(prefix.to_string(), Value::from(other.clone()));
        }
        _ => {}
    }
}

/// Minutes between `since` and `snapshot`; negative spans are invalid.
fn active_minutes(snapshot: Option<Timestamp>, since: Option<Timestamp>) -> Option<f64> {
    let (snap, since) = (snapshot?, since?);
    let minutes = (snap - since).num_milliseconds() as f64 / 60_000.0;
    (minutes >= 0.0).then(|| (minutes * 10.0).round() / 10.0)
}

/// Build the flattened alert table with duration columns.
pub fn alerts_table(alerts: &[ObservedAlert]) -> Table {
    let active_column = if alerts.iter().any(|a| a.alert.get("activeAt").is_some()) {
        "activeAt"
    } else {
        "startsAt"
    };
    let has_snapshots = alerts.iter().any(|a| a.snapshot.is_some());

    let mut columns: BTreeSet<String> = BTreeSet::new();
    let rows: Vec<Row> = alerts
        .iter()
        .map(|observed| {
            let mut row = Row::new();
            flatten_json("", &observed.alert, &mut row);

            if let Some(v) = row.get_mut("value") {
                *v = v.as_f64().filter(|n| !n.is_nan()).map_or(Value::Null, Value::Number);
            }

            if has_snapshots {
                let snap = observed.snapshot.as_ref().map(format_timestamp);
                row.insert(SNAPSHOT_COLUMN.into(), Value::from(snap.clone()));
                row.insert("snapshot_timestamp".into(), Value::from(snap));

                let since = row.get(active_column).and_then(Value::as_str).and_then(parse_time);
                let minutes = active_minutes(observed.snapshot, since);
                row.insert("duration_active_min".into(), Value::from(minutes));
                row.insert(
                    "duration_active".into(),
                    Value::from(minutes.map_or_else(|| "unknown".to_string(), format_minutes)),
                );
            }
            columns.extend(row.keys().cloned());
            row
        })
        .collect();

    Table {
        columns: columns.into_iter().collect(),
        rows,
    }
}

// ----------------------------------------------------------------------------
// 14.2 Alert Analysis
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertRequest {
    pub time_basis: TimeBasis,
    pub filters: BTreeMap<String, Value>,
    pub group_by: Vec<String>,
    pub agg: Option<String>,
    pub sort_by: Option<String>,
    pub offset: usize,
    pub limit: usize,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

/// Filter → group → aggregate → paginate over every alert snapshot in `dir`.
pub fn analyze_alerts(dir: &Path, request: &AlertRequest, policy: &AccessPolicy) -> ForensicsResult<Paginated<Row>> {
    let pipeline = Pipeline::with_shortcuts(ColumnShortcuts::alerts()).supporting(&ALERT_AGGREGATIONS);
    let aggregation = match &request.agg {
        Some(name) => Aggregation::parse_supported(name, &pipeline.supported)?,
        None => Aggregation::Count,
    };
    let window = TimeWindow::parse(request.start_time.as_deref(), request.end_time.as_deref())?;

    let alerts = load_alerts(dir, policy)?;
    let table = alerts_table(&alerts);

    let active_column = table.first_column(&["activeAt", "startsAt"]);
    let time_column = match request.time_basis {
        TimeBasis::Snapshot if table.has_column(SNAPSHOT_COLUMN) => Some(SNAPSHOT_COLUMN),
        _ => active_column,
    };

    let descending = request
        .sort_by
        .as_deref()
        .map(|s| DESCENDING_SORTS.contains(&s));

    let query = Query {
        filters: request.filters.clone(),
        window,
        time_column: time_column.map(str::to_string),
        group_by: request.group_by.clone(),
        aggregation,
        numeric_columns: Some(NUMERIC_ALERT_COLUMNS.iter().map(|c| c.to_string()).collect()),
        sort_by: request.sort_by.clone(),
        descending: if request.group_by.is_empty() { descending } else { None },
        offset: request.offset,
        limit: request.limit,
        ..Query::default()
    };

    pipeline.run(table, &query)
}

// ----------------------------------------------------------------------------
// 14.3 Alert Summary
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSummaryRequest {
    pub time_basis: TimeBasis,
    pub state_filter: Option<String>,
    pub min_duration_min: Option<f64>,
    pub limit: usize,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

impl Default for AlertSummaryRequest {
    fn default() -> Self {
        Self {
            time_basis: TimeBasis::Snapshot,
            state_filter: None,
            min_duration_min: None,
            limit: 50,
            start_time: None,
            end_time: None,
        }
    }
}

/// One alert incident observed across snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertSummaryEntry {
    pub alertname: String,
    pub entity: String,
    pub namespace: String,
    pub severity: String,
    pub state: String,
    pub first_seen: Option<String>,
    pub last_seen: Option<String>,
    pub duration_min: Option<f64>,
    pub occurrences: usize,
}

#[derive(Debug)]
struct SummaryAccumulator {
    namespace: String,
    times: BTreeSet<Timestamp>,
    occurrences: usize,
    states_seen: BTreeSet<String>,
    latest_state: String,
    latest_time: Option<Timestamp>,
}

fn label<'a>(alert: &'a JsonValue, key: &str) -> Option<&'a str> {
    alert
        .get("labels")
        .and_then(|l| l.get(key))
        .and_then(JsonValue::as_str)
        .filter(|s| !s.is_empty())
}

/// The most specific workload label an alert carries.
pub fn alert_entity(alert: &JsonValue) -> String {
    ENTITY_LABELS
        .iter()
        .find_map(|k| label(alert, k))
        .or_else(|| label(alert, "namespace"))
        .unwrap_or("cluster-wide")
        .to_string()
}

/// Summarise alert incidents across snapshots.
pub fn alert_summary(
    dir: &Path,
    request: &AlertSummaryRequest,
    policy: &AccessPolicy,
) -> ForensicsResult<Vec<AlertSummaryEntry>> {
    let window = TimeWindow::parse(request.start_time.as_deref(), request.end_time.as_deref())?;
    let alerts = load_alerts(dir, policy)?;

    let mut summaries: BTreeMap<(String, String, String), SummaryAccumulator> = BTreeMap::new();
    for observed in &alerts {
        // Snapshot basis filters whole snapshots by their observation time.
        if request.time_basis == TimeBasis::Snapshot && window.is_bounded() {
            if let Some(snap) = observed.snapshot {
                if !window.contains(&snap) {
                    continue;
                }
            }
        }

        let alert = &observed.alert;
        let alertname = label(alert, "alertname")
            .or_else(|| alert.get("alertname").and_then(JsonValue::as_str))
            .unwrap_or("Unknown")
            .to_string();
        let severity = label(alert, "severity").unwrap_or("unknown").to_string();
        let namespace = label(alert, "namespace").unwrap_or("unknown").to_string();
        let state = alert
            .get("state")
            .and_then(JsonValue::as_str)
            .unwrap_or("unknown")
            .to_string();
        let active_at = alert.get("activeAt").and_then(JsonValue::as_str).and_then(parse_time);

        let acc = summaries
            .entry((alertname, alert_entity(alert), severity))
            .or_insert_with(|| SummaryAccumulator {
                namespace,
                times: BTreeSet::new(),
                occurrences: 0,
                states_seen: BTreeSet::new(),
                latest_state: state.clone(),
                latest_time: None,
            });
        acc.occurrences += 1;
        acc.states_seen.insert(state.clone());

        let basis_time = match request.time_basis {
            TimeBasis::Snapshot => observed.snapshot,
            TimeBasis::ActiveAt => active_at,
        };
        match basis_time {
            Some(t) if acc.latest_time.map_or(true, |latest| t >= latest) => {
                acc.latest_time = Some(t);
                acc.latest_state = state.clone();
            }
            Some(_) => {}
            None => acc.latest_state = state.clone(),
        }

        if state == "firing" {
            if let Some(t) = basis_time.filter(|t| window.contains(t)) {
                acc.times.insert(t);
            }
        }
    }

    let mut entries: Vec<AlertSummaryEntry> = summaries
        .into_iter()
        .map(|((alertname, entity, severity), acc)| {
            let first = acc.times.iter().next().copied();
            let last = acc.times.iter().next_back().copied();
            let duration_min = match (first, last) {
                (Some(f), Some(l)) => Some(((l - f).num_milliseconds() as f64 / 60_000.0 * 10.0).round() / 10.0),
                _ => None,
            };
            let state = if acc.states_seen.contains("firing") {
                "firing".to_string()
            } else {
                acc.latest_state
            };
            AlertSummaryEntry {
                alertname,
                entity,
                namespace: acc.namespace,
                severity,
                state,
                first_seen: first.as_ref().map(format_timestamp),
                last_seen: last.as_ref().map(format_timestamp),
                duration_min,
                occurrences: acc.occurrences,
            }
        })
        .collect();

    if let Some(state) = &request.state_filter {
        entries.retain(|e| &e.state == state);
    }
    if window.is_bounded() {
        entries.retain(|e| e.first_seen.is_some());
    }
    if let Some(min) = request.min_duration_min {
        entries.retain(|e| e.duration_min.map_or(false, |d| d >= min));
    }

    entries.sort_by(|a, b| {
        let da = a.duration_min.unwrap_or(0.0);
        let db = b.duration_min.unwrap_or(0.0);
        db.total_cmp(&da).then_with(|| b.occurrences.cmp(&a.occurrences))
    });
    if request.limit > 0 {
        entries.truncate(request.limit);
    }
    Ok(entries)
}

#[cfg(test)]
mod alerts_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn snapshot_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let alerts = dir.path().join("alerts");
        std::fs::create_dir(&alerts).unwrap();
        let first = json!({"data": {"alerts": [
            {"labels": {"alertname": "HighLatency", "severity": "critical", "service_name": "cart", "namespace": "demo"},
             "state": "firing", "activeAt": "2025-01-01T09:50:00Z", "value": "1.5"},
            {"labels": {"alertname": "KafkaLag", "severity": "warning"},
             "state": "pending", "activeAt": "2025-01-01T09:59:00Z", "value": "12"}
        ]}});
        let second = json!({"alerts": [
            {"labels": {"alertname": "HighLatency", "severity": "critical", "service_name": "cart", "namespace": "demo"},
             "state": "firing", "activeAt": "2025-01-01T09:50:00Z", "value": "2.5"}
        ]});
        std::fs::write(alerts.join("alerts_at_2025-01-01T10-00-00.json"), first.to_string()).unwrap();
        std::fs::write(alerts.join("alerts_at_2025-01-01T10-30-00.json"), second.to_string()).unwrap();
        std::fs::write(alerts.join("broken.json"), "{not json").unwrap();
        dir
    }

    #[test]
    fn test_load_uses_alerts_subdirectory() {
        let dir = snapshot_dir();
        let alerts = load_alerts(dir.path(), &AccessPolicy::permissive()).unwrap();
        assert_eq!(alerts.len(), 3);
        assert!(alerts.iter().all(|a| a.snapshot.is_some()));
    }

    #[test]
    fn test_flatten_and_durations() {
        let dir = snapshot_dir();
        let alerts = load_alerts(dir.path(), &AccessPolicy::permissive()).unwrap();
        let table = alerts_table(&alerts);
        assert!(table.has_column("labels.alertname"));
        assert_eq!(table.rows[0]["duration_active_min"], Value::Number(10.0));
        assert_eq!(table.rows[0]["duration_active"], Value::from("10m"));
        assert_eq!(table.rows[2]["duration_active_min"], Value::Number(40.0));
        assert_eq!(table.rows[0]["value"], Value::Number(1.5));
    }

    #[test]
    fn test_group_by_severity_mean_value() {
        let dir = snapshot_dir();
        let request = AlertRequest {
            group_by: vec!["severity".into()],
            agg: Some("mean".into()),
            ..AlertRequest::default()
        };
        let page = analyze_alerts(dir.path(), &request, &AccessPolicy::permissive()).unwrap();
        assert_eq!(page.total_count, 2);
        assert_eq!(page.data[0]["severity"], Value::from("warning"));
        assert_eq!(page.data[0]["value"], Value::Number(12.0));
        assert_eq!(page.data[1]["value"], Value::Number(2.0));
    }

    #[test]
    fn test_ungrouped_sort_by_duration_desc() {
        let dir = snapshot_dir();
        let request = AlertRequest {
            sort_by: Some("duration_active_min".into()),
            ..AlertRequest::default()
        };
        let page = analyze_alerts(dir.path(), &request, &AccessPolicy::permissive()).unwrap();
        assert_eq!(page.data[0]["duration_active_min"], Value::Number(40.0));
        assert!(!page.data[0].contains_key(SNAPSHOT_COLUMN));
    }

    #[test]
    fn test_summary_incident_window() {
        let dir = snapshot_dir();
        let entries = alert_summary(dir.path(), &AlertSummaryRequest::default(), &AccessPolicy::permissive()).unwrap();
        assert_eq!(entries.len(), 2);
        let top = &entries[0];
        assert_eq!(top.alertname, "HighLatency");
        assert_eq!(top.entity, "cart");
        assert_eq!(top.state, "firing");
        assert_eq!(top.duration_min, Some(30.0));
        assert_eq!(top.occurrences, 2);
        assert_eq!(top.first_seen.as_deref(), Some("2025-01-01T10:00:00Z"));
        assert_eq!(entries[1].entity, "cluster-wide");
        assert_eq!(entries[1].state, "pending");
    }

    #[test]
    fn test_summary_window_keeps_only_observed_firing() {
        let dir = snapshot_dir();
        let request = AlertSummaryRequest {
            start_time: Some("2025-01-01T10:15:00Z".into()),
            ..AlertSummaryRequest::default()
        };
        let entries = alert_summary(dir.path(), &request, &AccessPolicy::permissive()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].duration_min, Some(0.0));
        assert_eq!(entries[0].occurrences, 1);
    }

    #[test]
    fn test_missing_directory() {
        let err = load_alerts(Path::new("/no/such/alerts"), &AccessPolicy::permissive()).unwrap_err();
        assert_eq!(err.category(), "input_file");
    }
}
