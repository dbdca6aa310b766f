// ============================================================================
// SECTION 7: INGESTION & NORMALIZATION
// ============================================================================
// Turns flat snapshot files into typed records:
// - Tab-separated tables with spreadsheet-style quoting
// - JSON documents
// - Kubernetes identity from pre-flattened columns or raw nested bodies
// - UTC timestamps everywhere
// Malformed rows are skipped and counted, never fatal for the file.
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};

use glob::Pattern;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::constants::MAX_REPORTED_WARNINGS;
use crate::error::{ConfigError, ForensicsResult, InputError};
use crate::identity::EntityId;
use crate::timeutil::{format_timestamp, parse_time, Timestamp};
use crate::value::{Value, ValueMap};

/// One table row keyed by column name.
pub type Row = ValueMap;

// ----------------------------------------------------------------------------
// 7.1 Access Policy
// ----------------------------------------------------------------------------

/// File access rules passed explicitly into every ingestion call.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    allowed_roots: Vec<PathBuf>,
    denied: Vec<Pattern>,
}

impl AccessPolicy {
    /// Allows every path.
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Build from configured roots and glob patterns.
    pub fn new(allowed_roots: &[PathBuf], denied_patterns: &[String]) -> Result<Self, ConfigError> {
        let denied = denied_patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| ConfigError::invalid_value("access.denied_patterns", format!("'{}': {}", p, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            allowed_roots: allowed_roots.to_vec(),
            denied,
        })
    }

    /// Fail fast on missing or forbidden paths.
    pub fn check(&self, path: &Path) -> ForensicsResult<()> {
        if !path.exists() {
            return Err(InputError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }
        if let Some(rule) = self.denied.iter().find(|p| p.matches_path(path)) {
            return Err(InputError::AccessDenied {
                path: path.to_path_buf(),
                rule: rule.as_str().to_string(),
            }
            .into());
        }
        if !self.allowed_roots.is_empty() && !self.allowed_roots.iter().any(|root| path.starts_with(root)) {
            return Err(InputError::AccessDenied {
                path: path.to_path_buf(),
                rule: "outside allowed roots".into(),
            }
            .into());
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 7.2 Ingest Report
// ----------------------------------------------------------------------------

/// Partial-failure bookkeeping for one source file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub source: String,
    pub rows_read: usize,
    pub rows_skipped: usize,
    pub warning_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl IngestReport {
    fn new(source: &Path) -> Self {
        Self {
            source: source.display().to_string(),
            ..Default::default()
        }
    }

    /// Record a warning; only the first few are kept verbatim.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.warning_count += 1;
        if self.warnings.len() < MAX_REPORTED_WARNINGS {
            self.warnings.push(message.into());
        }
    }

    pub fn skip(&mut self, message: impl Into<String>) {
        self.rows_skipped += 1;
        self.warn(message);
    }
}

// ----------------------------------------------------------------------------
// 7.3 Tab-Separated Tables
// ----------------------------------------------------------------------------

/// A parsed table; empty cells are `Null`, every other cell a string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// First of `candidates` present in the header.
    pub fn first_column<'a>(&self, candidates: &[&'a str]) -> Option<&'a str> {
        candidates.iter().copied().find(|c| self.has_column(c))
    }
}

/// Read and parse a TSV file with a header row.
pub fn read_table(path: &Path, policy: &AccessPolicy) -> ForensicsResult<(Table, IngestReport)> {
    policy.check(path)?;
    let content = fs::read_to_string(path)?;
    let mut report = IngestReport::new(path);
    let table = parse_tsv(&content, &mut report);
    debug!(
        target: "forensics::ingest",
        source = %path.display(),
        rows = table.rows.len(),
        skipped = report.rows_skipped,
        "Table loaded"
    );
    Ok((table, report))
}

/// Parse TSV text. Rows with more fields than the header are skipped,
/// short rows are padded with nulls; both are reported.
pub fn parse_tsv(content: &str, report: &mut IngestReport) -> Table {
    let mut records = split_records(content).into_iter();
    let columns: Vec<String> = match records.next() {
        Some(header) => header.into_iter().map(|c| c.trim().to_string()).collect(),
        None => return Table::default(),
    };

    let mut rows = Vec::new();
    for (idx, fields) in records.enumerate() {
        let line = idx + 2;
        if fields.len() > columns.len() {
            report.skip(format!(
                "row {}: expected {} fields, found {}",
                line,
                columns.len(),
                fields.len()
            ));
            continue;
        }
        if fields.len() < columns.len() {
            report.warn(format!(
                "row {}: {} of {} fields present, remainder treated as empty",
                line,
                fields.len(),
                columns.len()
            ));
        }
        let mut row = Row::new();
        for (i, column) in columns.iter().enumerate() {
            let cell = match fields.get(i) {
                Some(f) if !f.is_empty() => Value::String(f.clone()),
                _ => Value::Null,
            };
            row.insert(column.clone(), cell);
        }
        report.rows_read += 1;
        rows.push(row);
    }

    Table { columns, rows }
}

/// Split into records of fields. A quote opening a field starts a quoted
/// section in which tabs and newlines are data and `""` is a literal quote.
fn split_records(content: &str) -> Vec<Vec<String>> {
    // Fast path: no quoting anywhere.
    if memchr::memchr(b'"', content.as_bytes()).is_none() {
        return content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.split('\t').map(str::to_string).collect())
            .collect();
    }

    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut at_field_start = true;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
            continue;
        }
        match c {
            '\t' => {
                record.push(std::mem::take(&mut field));
                at_field_start = true;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                if !(record.len() == 1 && record[0].trim().is_empty()) {
                    records.push(std::mem::take(&mut record));
                } else {
                    record.clear();
                }
                at_field_start = true;
            }
            '"' if at_field_start => {
                in_quotes = true;
                at_field_start = false;
            }
            _ => {
                field.push(c);
                at_field_start = false;
            }
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        if !(record.len() == 1 && record[0].trim().is_empty()) {
            records.push(record);
        }
    }
    records
}

/// Read a JSON document.
pub fn read_json(path: &Path, policy: &AccessPolicy) -> ForensicsResult<JsonValue> {
    policy.check(path)?;
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

// ----------------------------------------------------------------------------
// 7.4 Nested Body Parsing
// ----------------------------------------------------------------------------

/// Parse an object body that may be quoted, escaped or double-encoded.
pub fn parse_body_json(raw: &str) -> Option<Value> {
    let mut s = raw.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s = &s[1..s.len() - 1];
    }
    let unescaped = s.replace("\"\"", "\"");

    let mut parsed: JsonValue = serde_json::from_str(&unescaped)
        .or_else(|_| serde_json::from_str(s))
        .ok()?;
    if let JsonValue::String(inner) = &parsed {
        parsed = serde_json::from_str(inner).ok()?;
    }
    match parsed {
        JsonValue::Object(_) => Some(Value::from(parsed)),
        _ => None,
    }
}

/// Best-effort true change time of an object: the latest of its
/// `managedFields[].time` entries and the rollout-restart annotation.
pub fn effective_update_timestamp(body: &Value) -> Option<Timestamp> {
    let managed = body
        .get_path(&["metadata", "managedFields"])
        .and_then(Value::as_list)
        .unwrap_or(&[])
        .iter()
        .filter_map(|entry| entry.get("time").and_then(Value::as_str).and_then(parse_time));

    let restarted = body
        .get_path(&[
            "spec",
            "template",
            "metadata",
            "annotations",
            "kubectl.kubernetes.io/restartedAt",
        ])
        .and_then(Value::as_str)
        .and_then(parse_time);

    managed.chain(restarted).max()
}

/// Parse a tag/label cell given as JSON or as a single-quoted dict literal.
pub fn parse_tags(raw: &str) -> ValueMap {
    let s = raw.trim();
    if s.is_empty() {
        return ValueMap::new();
    }
    if s.starts_with('{') && s.contains('"') {
        if let Ok(JsonValue::Object(obj)) = serde_json::from_str::<JsonValue>(s) {
            return obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect();
        }
    }
    match serde_json::from_str::<JsonValue>(&dict_literal_to_json(s)) {
        Ok(JsonValue::Object(obj)) => obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
        _ => ValueMap::new(),
    }
}

/// Rewrite a dict literal (single quotes, True/False/None) as JSON text.
fn dict_literal_to_json(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                let quote = c;
                let mut literal = String::new();
                while let Some(n) = chars.next() {
                    if n == '\\' {
                        if let Some(escaped) = chars.next() {
                            literal.push(escaped);
                        }
                    } else if n == quote {
                        break;
                    } else {
                        literal.push(n);
                    }
                }
                out.push_str(&JsonValue::String(literal).to_string());
            }
            c if c.is_ascii_alphabetic() => {
                let mut word = String::from(c);
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        word.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(match word.as_str() {
                    "True" => "true",
                    "False" => "false",
                    "None" => "null",
                    other => other,
                });
            }
            other => out.push(other),
        }
    }
    out
}

/// Flatten a raw Kubernetes event body into event columns.
pub fn parse_event_body(raw: &str) -> Option<Row> {
    let body = parse_body_json(raw)?;
    // Watch streams wrap the event as {"type": "ADDED", "object": {...}}.
    let (event, watch_type) = match body.get("object") {
        Some(obj @ Value::Map(_)) => (obj.clone(), body.get("type").cloned()),
        _ => (body.clone(), None),
    };

    let involved = event
        .get("involvedObject")
        .or_else(|| event.get("regarding"))
        .cloned()
        .unwrap_or_default();
    let name = involved.str_at(&["name"])?.to_string();

    let first_str = |keys: &[&str]| -> Value {
        keys.iter()
            .find_map(|k| event.get(k).and_then(Value::as_str).filter(|s| !s.is_empty()))
            .map(Value::from)
            .unwrap_or(Value::Null)
    };

    let mut row = Row::new();
    row.insert("object_kind".into(), involved.get("kind").cloned().unwrap_or_default());
    row.insert("object_name".into(), Value::from(name));
    row.insert(
        "namespace".into(),
        involved
            .get("namespace")
            .cloned()
            .or_else(|| event.get_path(&["metadata", "namespace"]).cloned())
            .unwrap_or_default(),
    );
    row.insert("reason".into(), first_str(&["reason"]));
    row.insert("message".into(), first_str(&["message", "note"]));
    row.insert("event_time".into(), first_str(&["lastTimestamp", "firstTimestamp", "eventTime"]));
    row.insert("event_kind".into(), first_str(&["type"]));
    row.insert("watch_type".into(), watch_type.unwrap_or_default());
    row.insert(
        "count".into(),
        Value::Number(event.get("count").and_then(Value::as_f64).unwrap_or(1.0)),
    );
    row.insert(
        "source_component".into(),
        event
            .get_path(&["source", "component"])
            .or_else(|| event.get("reportingController"))
            .cloned()
            .unwrap_or_default(),
    );
    Some(row)
}

static ALERTS_AT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"alerts_at_(\d{4}-\d{2}-\d{2})T(\d{2})-(\d{2})-(\d{2})(\.\d+)?").expect("valid alerts_at pattern")
});

static ALERTING_STATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"alerts_in_alerting_state_(\d{4}-\d{2}-\d{2})T(\d{2})(\d{2})(\d{2})(\.\d+)?Z?")
        .expect("valid alerting_state pattern")
});

/// Observation time of an alert snapshot: the document's `timestamp`,
/// else the time encoded in the file name.
pub fn alert_snapshot_timestamp(file_name: &str, doc: &JsonValue) -> Option<Timestamp> {
    if let Some(ts) = doc.get("timestamp").and_then(JsonValue::as_str) {
        if let Some(parsed) = parse_time(ts) {
            return Some(parsed);
        }
    }
    [&*ALERTS_AT_RE, &*ALERTING_STATE_RE].iter().find_map(|re| {
        let caps = re.captures(file_name)?;
        let frac = caps.get(5).map_or("", |m| m.as_str());
        parse_time(&format!("{}T{}:{}:{}{}Z", &caps[1], &caps[2], &caps[3], &caps[4], frac))
    })
}

/// `<kind>_<name>.tsv` → (kind, name).
pub fn object_info_from_filename(file_name: &str) -> (String, String) {
    let stem = file_name.strip_suffix(".tsv").unwrap_or(file_name);
    match stem.split_once('_') {
        Some((kind, name)) => (kind.to_string(), name.to_string()),
        None => ("unknown".to_string(), stem.to_string()),
    }
}

// ----------------------------------------------------------------------------
// 7.5 Object Records
// ----------------------------------------------------------------------------

/// Detected layout of an object/event table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputShape {
    /// Pre-flattened kind/namespace/name/timestamp columns
    Structured,
    /// Only a timestamp and an opaque JSON body
    RawNested,
}

/// Column names to look for when loading records.
#[derive(Debug, Clone)]
pub struct SchemaHints {
    pub kind_column: &'static str,
    pub name_column: &'static str,
    pub namespace_columns: &'static [&'static str],
    pub timestamp_column: &'static str,
    pub body_columns: &'static [&'static str],
    pub raw_timestamp_columns: &'static [&'static str],
}

impl SchemaHints {
    /// Kubernetes object snapshot tables.
    pub fn k8s_objects() -> Self {
        Self {
            kind_column: "object_kind",
            name_column: "object_name",
            namespace_columns: &["object_namespace", "namespace"],
            timestamp_column: "timestamp",
            body_columns: &["body", "Body"],
            raw_timestamp_columns: &["TimestampTime", "Timestamp", "timestamp"],
        }
    }
}

impl Default for SchemaHints {
    fn default() -> Self {
        Self::k8s_objects()
    }
}

/// One ingested observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub timestamp: Option<Timestamp>,
    pub effective_timestamp: Option<Timestamp>,
    pub kind: Option<String>,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub fields: Row,
}

impl Record {
    pub fn entity_id(&self) -> Option<EntityId> {
        Some(EntityId::new(
            self.namespace.as_deref(),
            self.kind.clone()?,
            self.name.clone()?,
        ))
    }

    /// Parsed object body, when the record has one.
    pub fn body(&self) -> Option<&Value> {
        self.fields.get("body").filter(|b| b.as_map().is_some())
    }
}

/// Records of one file plus its detected shape and ingest report.
#[derive(Debug, Clone)]
pub struct Ingested {
    pub records: Vec<Record>,
    pub shape: InputShape,
    pub report: IngestReport,
}

/// Load object records, detecting structured vs raw nested layouts.
pub fn load_records(path: &Path, hints: &SchemaHints, policy: &AccessPolicy) -> ForensicsResult<Ingested> {
    let (table, mut report) = read_table(path, policy)?;
    let body_column = table.first_column(hints.body_columns);

    let shape = if table.has_column(hints.kind_column) && table.has_column(hints.name_column) {
        if !table.has_column(hints.timestamp_column) {
            return Err(InputError::unsupported_format(format!(
                "missing '{}' column (found {:?})",
                hints.timestamp_column, table.columns
            ))
            .into());
        }
        InputShape::Structured
    } else if body_column.is_some() && table.first_column(hints.raw_timestamp_columns).is_some() {
        InputShape::RawNested
    } else {
        return Err(InputError::unsupported_format(format!(
            "expected {}/{}/{} columns or a body column with a timestamp (found {:?})",
            hints.kind_column, hints.name_column, hints.timestamp_column, table.columns
        ))
        .into());
    };

    let ts_column = match shape {
        InputShape::Structured => hints.timestamp_column,
        InputShape::RawNested => table
            .first_column(hints.raw_timestamp_columns)
            .unwrap_or(hints.timestamp_column),
    };
    let ns_column = table.first_column(hints.namespace_columns);

    let mut records = Vec::with_capacity(table.rows.len());
    for (idx, mut row) in table.rows.into_iter().enumerate() {
        let line = idx + 2;
        let raw_ts = row.get(ts_column).map(Value::render).unwrap_or_default();
        let timestamp = parse_time(&raw_ts);
        if timestamp.is_none() {
            report.warn(format!("row {}: unparseable timestamp '{}'", line, raw_ts));
        }

        let body = body_column
            .and_then(|c| row.get(c))
            .and_then(Value::as_str)
            .and_then(parse_body_json);

        let (kind, namespace, name) = match shape {
            InputShape::Structured => (
                row.get(hints.kind_column).and_then(Value::as_str).map(str::to_string),
                ns_column
                    .and_then(|c| row.get(c))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                row.get(hints.name_column).and_then(Value::as_str).map(str::to_string),
            ),
            InputShape::RawNested => match &body {
                Some(b) => (
                    b.str_at(&["kind"]).map(str::to_string),
                    b.str_at(&["metadata", "namespace"]).map(str::to_string),
                    b.str_at(&["metadata", "name"]).map(str::to_string),
                ),
                None => (None, None, None),
            },
        };

        if kind.is_none() || name.is_none() {
            report.skip(format!("row {}: no kind/name could be extracted", line));
            continue;
        }

        let effective_timestamp = body.as_ref().and_then(effective_update_timestamp);
        if let Some(c) = body_column {
            row.remove(c);
        }
        if let Some(b) = body {
            row.insert("body".into(), b);
        }
        if let Some(ts) = &timestamp {
            row.insert("timestamp".into(), Value::String(format_timestamp(ts)));
        }

        records.push(Record {
            timestamp,
            effective_timestamp,
            kind,
            namespace: namespace.filter(|ns| !ns.is_empty()),
            name,
            fields: row,
        });
    }

    if report.warning_count > 0 {
        warn!(
            target: "forensics::ingest",
            source = %report.source,
            skipped = report.rows_skipped,
            warnings = report.warning_count,
            "Partial ingest"
        );
    }

    Ok(Ingested {
        records,
        shape,
        report,
    })
}

#[cfg(test)]
mod ingest_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_parse_tsv_quoted_fields() {
        let mut report = IngestReport::default();
        let content = "a\tb\n1\t\"x\"\"y\ttab\"\n2\t\n";
        let table = parse_tsv(content, &mut report);
        assert_eq!(table.columns, vec!["a", "b"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0]["b"], Value::from("x\"y\ttab"));
        assert_eq!(table.rows[1]["b"], Value::Null);
        assert_eq!(report.rows_skipped, 0);
    }

    #[test]
    fn test_malformed_row_is_skipped_not_fatal() {
        let mut report = IngestReport::default();
        let table = parse_tsv("a\tb\n1\t2\n1\t2\t3\n4\t5\n", &mut report);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(report.rows_skipped, 1);
        assert_eq!(report.warning_count, 1);
    }

    #[test]
    fn test_parse_body_json_variants() {
        let plain = parse_body_json(r#"{"kind":"Pod"}"#).unwrap();
        assert_eq!(plain.str_at(&["kind"]), Some("Pod"));

        let quoted = parse_body_json(r#""{""kind"":""Service""}""#).unwrap();
        assert_eq!(quoted.str_at(&["kind"]), Some("Service"));

        let double = parse_body_json(r#""{\"kind\":\"Node\"}""#).unwrap();
        assert_eq!(double.str_at(&["kind"]), Some("Node"));

        assert!(parse_body_json("[1,2]").is_none());
        assert!(parse_body_json("not json").is_none());
    }

    #[test]
    fn test_effective_update_timestamp_takes_latest() {
        let body = Value::from(json!({
            "metadata": {"managedFields": [
                {"time": "2025-01-01T10:00:00Z"},
                {"time": "2025-01-01T11:00:00Z"}
            ]},
            "spec": {"template": {"metadata": {"annotations": {
                "kubectl.kubernetes.io/restartedAt": "2025-01-01T10:30:00Z"
            }}}}
        }));
        let ts = effective_update_timestamp(&body).unwrap();
        assert_eq!(format_timestamp(&ts), "2025-01-01T11:00:00Z");
    }

    #[test]
    fn test_parse_tags_dict_literal() {
        let tags = parse_tags("{'span_name': 'GET /cart', 'le': '+Inf', 'ok': True, 'x': None}");
        assert_eq!(tags["span_name"], Value::from("GET /cart"));
        assert_eq!(tags["le"], Value::from("+Inf"));
        assert_eq!(tags["ok"], Value::Bool(true));
        assert_eq!(tags["x"], Value::Null);
        assert_eq!(parse_tags(r#"{"a":"b"}"#)["a"], Value::from("b"));
        assert!(parse_tags("garbage").is_empty());
    }

    #[test]
    fn test_parse_event_body() {
        let raw = r#"{"type":"ADDED","object":{"involvedObject":{"kind":"Pod","name":"cart-1-2","namespace":"demo"},"reason":"BackOff","message":"restarting","lastTimestamp":"2025-01-01T10:00:00Z","type":"Warning","source":{"component":"kubelet"}}}"#;
        let row = parse_event_body(raw).unwrap();
        assert_eq!(row["object_kind"], Value::from("Pod"));
        assert_eq!(row["namespace"], Value::from("demo"));
        assert_eq!(row["event_kind"], Value::from("Warning"));
        assert_eq!(row["watch_type"], Value::from("ADDED"));
        assert_eq!(row["count"], Value::Number(1.0));
        assert_eq!(row["source_component"], Value::from("kubelet"));
    }

    #[test]
    fn test_alert_snapshot_timestamp_from_filename() {
        let empty = json!({});
        let a = alert_snapshot_timestamp("alerts_at_2025-12-15T18-17-09.387695.json", &empty).unwrap();
        assert_eq!(format_timestamp(&a), "2025-12-15T18:17:09.387695Z");
        let b = alert_snapshot_timestamp("alerts_in_alerting_state_2025-12-15T175546Z.json", &empty).unwrap();
        assert_eq!(format_timestamp(&b), "2025-12-15T17:55:46Z");
        let c = alert_snapshot_timestamp("x.json", &json!({"timestamp": "2025-01-01T00:00:00Z"})).unwrap();
        assert_eq!(format_timestamp(&c), "2025-01-01T00:00:00Z");
    }

    #[test]
    fn test_load_records_raw_nested() {
        let dir = tempfile::tempdir().unwrap();
        let body = r#"{"kind":"Deployment","metadata":{"name":"cart","namespace":"demo"}}"#.replace('"', "\"\"");
        let content = format!(
            "Timestamp\tBody\n2025-01-01 10:00:00\t\"{}\"\n2025-01-01 10:01:00\tnot-json\n",
            body
        );
        let path = write_file(&dir, "objects.tsv", &content);
        let ingested = load_records(&path, &SchemaHints::k8s_objects(), &AccessPolicy::permissive()).unwrap();

        assert_eq!(ingested.shape, InputShape::RawNested);
        assert_eq!(ingested.records.len(), 1);
        assert_eq!(ingested.report.rows_skipped, 1);
        let id = ingested.records[0].entity_id().unwrap();
        assert_eq!(id.to_string(), "demo/Deployment/cart");
    }

    #[test]
    fn test_load_records_structured() {
        let dir = tempfile::tempdir().unwrap();
        let content = "timestamp\tobject_kind\tobject_name\tnamespace\tbody\n\
                       2025-01-01T10:00:00Z\tService\tcart\tdemo\t{}\n";
        let path = write_file(&dir, "objects.tsv", content);
        let ingested = load_records(&path, &SchemaHints::k8s_objects(), &AccessPolicy::permissive()).unwrap();
        assert_eq!(ingested.shape, InputShape::Structured);
        assert_eq!(ingested.records[0].namespace.as_deref(), Some("demo"));
    }

    #[test]
    fn test_unsupported_layout_names_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "x.tsv", "foo\tbar\n1\t2\n");
        let err = load_records(&path, &SchemaHints::k8s_objects(), &AccessPolicy::permissive()).unwrap_err();
        assert!(err.to_string().contains("foo"));
    }

    #[test]
    fn test_access_policy() {
        let dir = tempfile::tempdir().unwrap();
        let secret = write_file(&dir, "secrets.tsv", "a\n1\n");
        let policy = AccessPolicy::new(&[], &["**/secrets*".to_string()]).unwrap();
        assert!(policy.check(&secret).is_err());
        assert!(AccessPolicy::permissive().check(&secret).is_ok());
        assert!(AccessPolicy::permissive().check(&dir.path().join("missing.tsv")).is_err());
    }

    #[test]
    fn test_object_info_from_filename() {
        assert_eq!(
            object_info_from_filename("pod_checkout-8546fdc74d-7m4dn.tsv"),
            ("pod".to_string(), "checkout-8546fdc74d-7m4dn".to_string())
        );
        assert_eq!(object_info_from_filename("cluster.tsv"), ("unknown".to_string(), "cluster".to_string()));
    }
}
