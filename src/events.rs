// ============================================================================
// SECTION 13: EVENT ANALYZER
// ============================================================================
// Kubernetes events through the query pipeline. Accepts flat event tables
// and raw tables whose `Body` column holds the original event object.
// ============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ForensicsResult;
use crate::identity::deployment_for;
use crate::ingest::{parse_event_body, read_table, AccessPolicy, IngestReport, Row, Table};
use crate::pipeline::{Aggregation, Paginated, Pipeline, Query};
use crate::timeutil::TimeWindow;
use crate::value::Value;

/// Aggregations meaningful for event rows
pub const EVENT_AGGREGATIONS: [Aggregation; 5] = [
    Aggregation::Count,
    Aggregation::First,
    Aggregation::Last,
    Aggregation::Nunique,
    Aggregation::List,
];

/// Columns collected by the `list` aggregation
pub const EVENT_LIST_COLUMNS: [&str; 3] = ["reason", "message", "event_kind"];

const FLAT_EVENT_COLUMNS: [&str; 10] = [
    "object_kind",
    "object_name",
    "namespace",
    "reason",
    "message",
    "event_time",
    "event_kind",
    "watch_type",
    "count",
    "source_component",
];

/// Event query as accepted from callers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventRequest {
    pub filters: BTreeMap<String, Value>,
    pub group_by: Vec<String>,
    pub agg: Option<String>,
    pub sort_by: Option<String>,
    pub offset: usize,
    pub limit: usize,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventReport {
    #[serde(flatten)]
    pub page: Paginated<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "is_clean")]
    pub ingest: IngestReport,
}

fn is_clean(report: &IngestReport) -> bool {
    report.warning_count == 0
}

/// Load an event table, flattening raw bodies and adding `deployment`.
pub fn load_events(path: &Path, policy: &AccessPolicy) -> ForensicsResult<(Table, IngestReport)> {
    let (table, mut report) = read_table(path, policy)?;

    let body_column = ["Body", "body"].into_iter().find(|c| table.has_column(c));
    let mut table = match body_column {
        Some(body) if !table.has_column("object_name") => {
            let mut rows = Vec::with_capacity(table.rows.len());
            for (idx, row) in table.rows.into_iter().enumerate() {
                let parsed = row.get(body).and_then(Value::as_str).and_then(parse_event_body);
                match parsed {
                    Some(mut flat) => {
                        if let Some(ts) = row.get("Timestamp").filter(|v| !v.is_null()) {
                            flat.insert("log_timestamp".into(), ts.clone());
                        }
                        rows.push(flat);
                    }
                    None => report.skip(format!("row {}: body is not a Kubernetes event", idx + 2)),
                }
            }
            let mut columns: Vec<String> = FLAT_EVENT_COLUMNS.iter().map(|c| c.to_string()).collect();
            if rows.iter().any(|r| r.contains_key("log_timestamp")) {
                columns.push("log_timestamp".into());
            }
            Table { columns, rows }
        }
        _ => table,
    };

    if table.has_column("object_name") && table.has_column("object_kind") {
        for row in table.rows.iter_mut() {
            let kind = row.get("object_kind").map(Value::render).unwrap_or_default();
            let name = row.get("object_name").map(Value::render).unwrap_or_default();
            row.insert("deployment".into(), Value::from(deployment_for(&kind, &name)));
        }
        if !table.has_column("deployment") {
            table.columns.push("deployment".into());
        }
    }

    Ok((table, report))
}

/// Filter → group → aggregate → paginate over an event file.
pub fn analyze_events(path: &Path, request: &EventRequest, policy: &AccessPolicy) -> ForensicsResult<EventReport> {
    let pipeline = Pipeline::default().supporting(&EVENT_AGGREGATIONS);
    let aggregation = match &request.agg {
        Some(name) => Aggregation::parse_supported(name, &pipeline.supported)?,
        None => Aggregation::Count,
    };
    let window = TimeWindow::parse(request.start_time.as_deref(), request.end_time.as_deref())?;

    let (table, report) = load_events(path, policy)?;
    if table.rows.is_empty() && report.rows_skipped > 0 {
        return Ok(EventReport {
            page: Paginated {
                total_count: 0,
                offset: 0,
                limit: request.limit,
                returned_count: 0,
                data: Vec::new(),
            },
            note: Some("Events file has a raw body column but no valid Kubernetes events were found".into()),
            ingest: report,
        });
    }

    let time_column = table.first_column(&["event_time", "timestamp"]).map(str::to_string);
    let query = Query {
        filters: request.filters.clone(),
        window,
        time_column,
        group_by: request.group_by.clone(),
        aggregation,
        list_columns: EVENT_LIST_COLUMNS.iter().map(|c| c.to_string()).collect(),
        sort_by: request.sort_by.clone(),
        offset: request.offset,
        limit: request.limit,
        ..Query::default()
    };

    let page = pipeline.run(table, &query)?;
    debug!(
        target: "forensics::events",
        total = page.total_count,
        returned = page.returned_count,
        "Event analysis complete"
    );

    Ok(EventReport {
        page,
        note: None,
        ingest: report,
    })
}

#[cfg(test)]
mod events_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FLAT: &str = "object_kind\tobject_name\tnamespace\treason\tmessage\tevent_time\tevent_kind\n\
Pod\tcart-7d9f8b6c4-abcde\tdemo\tBackOff\trestarting\t2025-01-01T10:00:00Z\tWarning\n\
Pod\tcart-7d9f8b6c4-abcde\tdemo\tBackOff\trestarting\t2025-01-01T10:02:00Z\tWarning\n\
Pod\tcart-7d9f8b6c4-xyz12\tdemo\tKilling\tstopping\t2025-01-01T10:03:00Z\tNormal\n\
ReplicaSet\tad-5f6d7c8b9\tdemo\tScalingReplicaSet\tscaled\t2025-01-01T10:04:00Z\tNormal\n";

    fn write(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k8s_events.tsv");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_group_by_deployment_count() {
        let (_dir, path) = write(FLAT);
        let request = EventRequest {
            group_by: vec!["deployment".into()],
            ..EventRequest::default()
        };
        let report = analyze_events(&path, &request, &AccessPolicy::permissive()).unwrap();
        let rows: Vec<(String, f64)> = report
            .page
            .data
            .iter()
            .map(|r| (r["deployment"].render(), r["count"].as_f64().unwrap()))
            .collect();
        assert_eq!(rows, vec![("cart".to_string(), 3.0), ("ad".to_string(), 1.0)]);
    }

    #[test]
    fn test_list_aggregation_collects_reasons() {
        let (_dir, path) = write(FLAT);
        let request = EventRequest {
            group_by: vec!["deployment".into()],
            agg: Some("list".into()),
            ..EventRequest::default()
        };
        let report = analyze_events(&path, &request, &AccessPolicy::permissive()).unwrap();
        let cart = report.page.data.iter().find(|r| r["deployment"] == Value::from("cart")).unwrap();
        assert_eq!(cart["reason"], Value::List(vec![Value::from("BackOff"), Value::from("Killing")]));
    }

    #[test]
    fn test_strict_filters_and_sum_rejected() {
        let (_dir, path) = write(FLAT);
        let mut request = EventRequest::default();
        request.filters.insert("no_such".into(), Value::from("x"));
        assert!(analyze_events(&path, &request, &AccessPolicy::permissive()).is_err());

        let request = EventRequest {
            group_by: vec!["reason".into()],
            agg: Some("sum".into()),
            ..EventRequest::default()
        };
        let err = analyze_events(&path, &request, &AccessPolicy::permissive()).unwrap_err();
        assert!(err.to_string().contains("count, first, last, nunique, list"));
    }

    #[test]
    fn test_time_window_and_default_time_sort() {
        let (_dir, path) = write(FLAT);
        let request = EventRequest {
            start_time: Some("2025-01-01T10:02:00Z".into()),
            end_time: Some("2025-01-01T10:03:00Z".into()),
            ..EventRequest::default()
        };
        let report = analyze_events(&path, &request, &AccessPolicy::permissive()).unwrap();
        assert_eq!(report.page.total_count, 2);
        assert_eq!(report.page.data[1]["reason"], Value::from("Killing"));
    }

    #[test]
    fn test_raw_body_events_are_flattened() {
        let body = r#"{"involvedObject":{"kind":"Pod","name":"frontend-6b8d9c7f5-q2w3e","namespace":"demo"},"reason":"Unhealthy","message":"probe failed","lastTimestamp":"2025-01-01T10:00:00Z","type":"Warning"}"#
            .replace('"', "\"\"");
        let content = format!("Timestamp\tBody\n2025-01-01 10:00:00\t\"{}\"\n2025-01-01 10:00:01\t{{}}\n", body);
        let (_dir, path) = write(&content);
        let report = analyze_events(&path, &EventRequest::default(), &AccessPolicy::permissive()).unwrap();
        assert_eq!(report.page.total_count, 1);
        assert_eq!(report.page.data[0]["deployment"], Value::from("frontend"));
        assert_eq!(report.ingest.rows_skipped, 1);
    }
}
