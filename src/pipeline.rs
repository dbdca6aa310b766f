// ============================================================================
// SECTION 12: QUERY PIPELINE
// ============================================================================
// Generic tabular query engine shared by the event, alert, metric and log
// analyzers. Stages run in a fixed order:
//
//   filter → derive → group-by → aggregate → sort → paginate
//
// Grouping is an explicit ordered map from group key to rows; aggregation is
// a separate pass over that map.
// ============================================================================

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::ser::SerializeStruct;
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::constants::LIST_AGG_MAX_VALUES;
use crate::error::{ForensicsError, ForensicsResult, InputError};
use crate::expr::{sanitize_name, DeriveExpr};
use crate::identity::deployment_for;
use crate::ingest::{Row, Table};
use crate::timeutil::{parse_time, TimeWindow, Timestamp};
use crate::value::Value;

// ----------------------------------------------------------------------------
// 12.1 Aggregations
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    Count,
    First,
    Last,
    Sum,
    Mean,
    Max,
    Min,
    Nunique,
    List,
}

impl Aggregation {
    pub const ALL: [Aggregation; 9] = [
        Aggregation::Count,
        Aggregation::First,
        Aggregation::Last,
        Aggregation::Sum,
        Aggregation::Mean,
        Aggregation::Max,
        Aggregation::Min,
        Aggregation::Nunique,
        Aggregation::List,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Aggregation::Count => "count",
            Aggregation::First => "first",
            Aggregation::Last => "last",
            Aggregation::Sum => "sum",
            Aggregation::Mean => "mean",
            Aggregation::Max => "max",
            Aggregation::Min => "min",
            Aggregation::Nunique => "nunique",
            Aggregation::List => "list",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Aggregation::Sum | Aggregation::Mean | Aggregation::Max | Aggregation::Min)
    }

    /// Parse a name against the subset an analyzer supports.
    pub fn parse_supported(name: &str, supported: &[Aggregation]) -> ForensicsResult<Self> {
        let unsupported = || InputError::UnsupportedAggregation {
            name: name.to_string(),
            supported: supported.iter().map(|a| a.name().to_string()).collect(),
        };
        let agg: Aggregation = name.parse().map_err(|_| unsupported())?;
        if supported.contains(&agg) {
            Ok(agg)
        } else {
            Err(unsupported().into())
        }
    }

    /// Reduce numeric samples; `None` for an empty group.
    pub fn reduce(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        match self {
            Aggregation::Sum => Some(values.iter().sum()),
            Aggregation::Mean => Some(statistical::mean(values)),
            Aggregation::Max => values.iter().copied().reduce(f64::max),
            Aggregation::Min => values.iter().copied().reduce(f64::min),
            Aggregation::Count => Some(values.len() as f64),
            _ => None,
        }
    }
}

impl FromStr for Aggregation {
    type Err = ForensicsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Aggregation::ALL
            .iter()
            .copied()
            .find(|a| a.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                InputError::UnsupportedAggregation {
                    name: s.to_string(),
                    supported: Aggregation::ALL.iter().map(|a| a.name().to_string()).collect(),
                }
                .into()
            })
    }
}

impl Display for Aggregation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parse a snake_case request option (`effective_update`, `per_kind`, ...)
/// into its enum, naming the field on failure.
pub fn parse_choice<T: DeserializeOwned>(name: &str, raw: &str) -> ForensicsResult<T> {
    serde_json::from_value(JsonValue::String(raw.trim().to_string())).map_err(|e| {
        InputError::InvalidArgument {
            name: name.to_string(),
            value: raw.to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

// ----------------------------------------------------------------------------
// 12.2 Group Keys
// ----------------------------------------------------------------------------

/// Values of the group-by columns for one group, totally ordered.
#[derive(Debug, Clone)]
pub struct GroupKey(pub Vec<Value>);

impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for GroupKey {}

impl PartialOrd for GroupKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GroupKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            let ord = a.cmp_total(b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

/// Partition rows by the values of `columns`, preserving row order per group.
pub fn group_rows(rows: Vec<Row>, columns: &[String]) -> BTreeMap<GroupKey, Vec<Row>> {
    let mut groups: BTreeMap<GroupKey, Vec<Row>> = BTreeMap::new();
    for row in rows {
        let key = GroupKey(columns.iter().map(|c| row.get(c).cloned().unwrap_or_default()).collect());
        groups.entry(key).or_default().push(row);
    }
    groups
}

// ----------------------------------------------------------------------------
// 12.3 Pagination Envelope
// ----------------------------------------------------------------------------

/// `{total_count, offset, limit, returned_count, data}`; `limit` 0 renders as `"all"`.
#[derive(Debug, Clone, PartialEq)]
pub struct Paginated<T> {
    pub total_count: usize,
    pub offset: usize,
    pub limit: usize,
    pub returned_count: usize,
    pub data: Vec<T>,
}

impl<T> Paginated<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Paginated<U> {
        Paginated {
            total_count: self.total_count,
            offset: self.offset,
            limit: self.limit,
            returned_count: self.returned_count,
            data: self.data.into_iter().map(f).collect(),
        }
    }
}

impl<T: Serialize> Serialize for Paginated<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Paginated", 5)?;
        s.serialize_field("total_count", &self.total_count)?;
        s.serialize_field("offset", &self.offset)?;
        if self.limit == 0 {
            s.serialize_field("limit", "all")?;
        } else {
            s.serialize_field("limit", &self.limit)?;
        }
        s.serialize_field("returned_count", &self.returned_count)?;
        s.serialize_field("data", &self.data)?;
        s.end()
    }
}

/// Slice one page out of `items`; the total is taken before slicing.
pub fn paginate<T>(items: Vec<T>, offset: usize, limit: usize) -> Paginated<T> {
    let total_count = items.len();
    let data: Vec<T> = if limit == 0 {
        items.into_iter().skip(offset).collect()
    } else {
        items.into_iter().skip(offset).take(limit).collect()
    };
    Paginated {
        total_count,
        offset,
        limit,
        returned_count: data.len(),
        data,
    }
}

// ----------------------------------------------------------------------------
// 12.4 Column Shortcuts
// ----------------------------------------------------------------------------

/// Friendly column names mapped to their stored (often nested) columns.
#[derive(Debug, Clone, Default)]
pub struct ColumnShortcuts {
    aliases: Vec<(&'static str, &'static str)>,
    prefix: Option<&'static str>,
}

impl ColumnShortcuts {
    pub fn none() -> Self {
        Self::default()
    }

    /// Alert documents keep their dimensions under `labels.`.
    pub fn alerts() -> Self {
        Self {
            aliases: vec![
                ("alertname", "labels.alertname"),
                ("severity", "labels.severity"),
                ("service_name", "labels.service_name"),
                ("service", "labels.service_name"),
                ("namespace", "labels.namespace"),
            ],
            prefix: Some("labels."),
        }
    }

    /// Resolve `name` to an existing column.
    pub fn resolve(&self, name: &str, columns: &[String]) -> ForensicsResult<String> {
        let has = |c: &str| columns.iter().any(|col| col == c);
        if let Some((_, target)) = self.aliases.iter().find(|(alias, _)| *alias == name) {
            if has(target) {
                return Ok(target.to_string());
            }
        }
        if has(name) {
            return Ok(name.to_string());
        }
        if let Some(prefix) = self.prefix {
            let prefixed = format!("{}{}", prefix, name);
            if has(&prefixed) {
                return Ok(prefixed);
            }
        }
        Err(InputError::unknown_column(name, columns).into())
    }
}

// ----------------------------------------------------------------------------
// 12.5 Query
// ----------------------------------------------------------------------------

/// One pipeline request.
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// Exact-match filters; a list value matches any of its elements
    pub filters: BTreeMap<String, Value>,
    pub window: TimeWindow,
    /// Column the window and first/last ordering use
    pub time_column: Option<String>,
    /// Derive expression (`name = expr`)
    pub derive: Option<String>,
    pub group_by: Vec<String>,
    pub aggregation: Aggregation,
    /// Columns collected by `list`
    pub list_columns: Vec<String>,
    /// Restrict numeric aggregation to these columns
    pub numeric_columns: Option<Vec<String>>,
    pub sort_by: Option<String>,
    /// Overrides the default direction for the chosen sort
    pub descending: Option<bool>,
    pub offset: usize,
    /// 0 = unlimited
    pub limit: usize,
}

/// Pipeline configured for one analyzer.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub shortcuts: ColumnShortcuts,
    pub supported: Vec<Aggregation>,
    pub list_max_values: usize,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            shortcuts: ColumnShortcuts::none(),
            supported: Aggregation::ALL.to_vec(),
            list_max_values: LIST_AGG_MAX_VALUES,
        }
    }
}

const DEPLOYMENT_COLUMN: &str = "deployment";
const KIND_COLUMNS: [&str; 3] = ["object_kind", "_object_kind", "kind"];
const NAME_COLUMNS: [&str; 4] = ["object_name", "_object_name", "pod_name", "name"];

impl Pipeline {
    pub fn with_shortcuts(shortcuts: ColumnShortcuts) -> Self {
        Self {
            shortcuts,
            ..Self::default()
        }
    }

    pub fn supporting(mut self, supported: &[Aggregation]) -> Self {
        self.supported = supported.to_vec();
        self
    }

    pub fn list_max_values(mut self, n: usize) -> Self {
        self.list_max_values = n.max(1);
        self
    }

    /// Run every stage over `table`.
    pub fn run(&self, table: Table, query: &Query) -> ForensicsResult<Paginated<Row>> {
        if !self.supported.contains(&query.aggregation) {
            return Err(InputError::UnsupportedAggregation {
                name: query.aggregation.name().to_string(),
                supported: self.supported.iter().map(|a| a.name().to_string()).collect(),
            }
            .into());
        }

        let Table { mut columns, mut rows } = table;

        let wants_deployment = query.group_by.iter().any(|c| c == DEPLOYMENT_COLUMN)
            || query.filters.contains_key(DEPLOYMENT_COLUMN);
        if wants_deployment && !columns.iter().any(|c| c == DEPLOYMENT_COLUMN) {
            derive_deployment_column(&mut columns, &mut rows);
        }

        // ---- filter ----
        for (name, expected) in &query.filters {
            let column = self.shortcuts.resolve(name, &columns)?;
            rows.retain(|row| {
                let actual = row.get(&column).unwrap_or(&Value::Null);
                match expected {
                    Value::List(options) => options.iter().any(|o| actual.loosely_equals(o)),
                    other => actual.loosely_equals(other),
                }
            });
        }

        let time_column = query
            .time_column
            .as_deref()
            .filter(|c| columns.iter().any(|col| col == c));
        if let Some(tc) = time_column {
            if query.window.is_bounded() {
                rows.retain(|row| query.window.contains_opt(row_time(row, tc).as_ref()));
            }
        }

        // ---- derive ----
        if let Some(source) = query.derive.as_deref().filter(|s| !s.trim().is_empty()) {
            let expr = DeriveExpr::compile(source, &columns)?;
            for row in rows.iter_mut() {
                expr.apply(row);
            }
            if !columns.contains(&expr.target) {
                columns.push(expr.target.clone());
            }
        }

        debug!(
            target: "forensics::pipeline",
            rows = rows.len(),
            group_by = ?query.group_by,
            aggregation = %query.aggregation,
            "Filters applied"
        );

        // ---- group-by / aggregate / sort ----
        let output = if query.group_by.is_empty() {
            self.sort_ungrouped(rows, &columns, query, time_column)
        } else {
            let group_columns = query
                .group_by
                .iter()
                .map(|c| self.shortcuts.resolve(c, &columns))
                .collect::<ForensicsResult<Vec<_>>>()?;
            let groups = group_rows(rows, &group_columns);
            let (aggregated, default_sort) =
                self.aggregate(groups, &group_columns, &columns, query, time_column)?;
            sort_grouped(aggregated, query, default_sort)
        };

        // ---- paginate ----
        let page = paginate(output, query.offset, query.limit);
        Ok(page.map(strip_internal))
    }

    fn aggregate(
        &self,
        groups: BTreeMap<GroupKey, Vec<Row>>,
        group_columns: &[String],
        columns: &[String],
        query: &Query,
        time_column: Option<&str>,
    ) -> ForensicsResult<(Vec<Row>, Option<String>)> {
        // Group columns are reported under the names the caller used.
        let base = |key: &GroupKey| -> Row {
            query
                .group_by
                .iter()
                .cloned()
                .zip(key.0.iter().cloned())
                .collect()
        };

        match query.aggregation {
            Aggregation::Count => {
                let rows = groups
                    .iter()
                    .map(|(key, members)| {
                        let mut row = base(key);
                        row.insert("count".into(), Value::from(members.len()));
                        row
                    })
                    .collect();
                Ok((rows, Some("count".to_string())))
            }
            Aggregation::First | Aggregation::Last => {
                let last = query.aggregation == Aggregation::Last;
                let rows = groups
                    .into_values()
                    .filter_map(|mut members| {
                        if let Some(tc) = time_column {
                            sort_by_time(&mut members, tc);
                        }
                        if last {
                            members.pop()
                        } else {
                            members.into_iter().next()
                        }
                    })
                    .collect();
                Ok((rows, None))
            }
            agg if agg.is_numeric() => {
                let numeric = match &query.numeric_columns {
                    Some(wanted) => wanted
                        .iter()
                        .filter(|c| columns.contains(c) && !group_columns.contains(c))
                        .cloned()
                        .collect(),
                    None => numeric_columns(groups.values().flatten(), columns, group_columns, time_column),
                };
                if numeric.is_empty() {
                    return Err(InputError::NoNumericColumns { agg: agg.name().to_string() }.into());
                }
                let rows = groups
                    .iter()
                    .map(|(key, members)| {
                        let mut row = base(key);
                        for col in &numeric {
                            let samples: Vec<f64> = members
                                .iter()
                                .filter_map(|r| r.get(col).and_then(Value::as_f64))
                                .filter(|v| !v.is_nan())
                                .collect();
                            row.insert(col.clone(), agg.reduce(&samples).map_or(Value::Null, Value::Number));
                        }
                        row
                    })
                    .collect();
                Ok((rows, numeric.first().cloned()))
            }
            Aggregation::Nunique => {
                let targets: Vec<&String> = columns.iter().filter(|c| !group_columns.contains(c)).collect();
                let rows = groups
                    .iter()
                    .map(|(key, members)| {
                        let mut row = base(key);
                        for col in &targets {
                            let distinct = distinct_values(members.iter().filter_map(|r| r.get(*col)), usize::MAX);
                            row.insert(format!("{}_unique", col), Value::from(distinct.len()));
                        }
                        row
                    })
                    .collect();
                Ok((rows, None))
            }
            Aggregation::List => {
                let targets: Vec<&String> = query.list_columns.iter().filter(|c| columns.contains(c)).collect();
                let rows = groups
                    .iter()
                    .map(|(key, members)| {
                        let mut row = base(key);
                        if targets.is_empty() {
                            row.insert("count".into(), Value::from(members.len()));
                        }
                        for col in &targets {
                            let distinct = distinct_values(
                                members.iter().filter_map(|r| r.get(*col)),
                                self.list_max_values,
                            );
                            row.insert((*col).clone(), Value::List(distinct));
                        }
                        row
                    })
                    .collect();
                Ok((rows, None))
            }
            _ => Err(ForensicsError::Internal(format!(
                "aggregation {} has no implementation",
                query.aggregation
            ))),
        }
    }

    fn sort_ungrouped(
        &self,
        mut rows: Vec<Row>,
        columns: &[String],
        query: &Query,
        time_column: Option<&str>,
    ) -> Vec<Row> {
        let explicit = query
            .sort_by
            .as_deref()
            .and_then(|c| self.shortcuts.resolve(c, columns).ok());
        match (explicit, time_column) {
            (Some(col), _) => {
                rows.sort_by(|a, b| cmp_column(a, b, &col));
                if query.descending.unwrap_or(false) {
                    rows.reverse();
                    stable_reverse_ties(&mut rows, &col);
                }
            }
            (None, Some(tc)) => sort_by_time(&mut rows, tc),
            (None, None) => {}
        }
        rows
    }
}

/// Rows sharing a sort value keep their original relative order after a reversal.
fn stable_reverse_ties(rows: &mut [Row], column: &str) {
    let mut start = 0;
    while start < rows.len() {
        let mut end = start + 1;
        while end < rows.len() && cmp_column(&rows[start], &rows[end], column) == Ordering::Equal {
            end += 1;
        }
        rows[start..end].reverse();
        start = end;
    }
}

fn sort_grouped(mut rows: Vec<Row>, query: &Query, default_sort: Option<String>) -> Vec<Row> {
    let column = query
        .sort_by
        .clone()
        .filter(|c| rows.iter().any(|r| r.contains_key(c)))
        .or(default_sort);
    if let Some(col) = column {
        let descending = query.descending.unwrap_or(true);
        rows.sort_by(|a, b| {
            let ord = cmp_column(a, b, &col);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });
    }
    rows
}

fn cmp_column(a: &Row, b: &Row, column: &str) -> Ordering {
    let null = Value::Null;
    let va = a.get(column).unwrap_or(&null);
    let vb = b.get(column).unwrap_or(&null);
    va.cmp_total(vb)
}

/// Parsed time of a row's `column`.
pub fn row_time(row: &Row, column: &str) -> Option<Timestamp> {
    row.get(column).and_then(Value::as_str).and_then(parse_time)
}

/// Stable ascending sort by a time column; rows without a time go last.
pub fn sort_by_time(rows: &mut [Row], column: &str) {
    rows.sort_by_cached_key(|r| {
        let ts = row_time(r, column);
        (ts.is_none(), ts)
    });
}

/// Distinct values in first-seen order, nulls ignored.
pub fn distinct_values<'a>(values: impl Iterator<Item = &'a Value>, max: usize) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for v in values {
        if out.len() >= max {
            break;
        }
        if v.is_null() || out.iter().any(|seen| seen == v) {
            continue;
        }
        out.push(v.clone());
    }
    out
}

/// Columns whose non-null values are all numeric.
pub fn numeric_columns<'a>(
    rows: impl Iterator<Item = &'a Row> + Clone,
    columns: &[String],
    exclude: &[String],
    time_column: Option<&str>,
) -> Vec<String> {
    columns
        .iter()
        .filter(|c| !c.starts_with('_') && !exclude.contains(c) && Some(c.as_str()) != time_column)
        .filter(|c| {
            let mut seen = false;
            for row in rows.clone() {
                match row.get(c.as_str()) {
                    None | Some(Value::Null) => {}
                    Some(v) if v.as_f64().is_some() && !matches!(v, Value::Bool(_)) => seen = true,
                    Some(_) => return false,
                }
            }
            seen
        })
        .cloned()
        .collect()
}

/// Remove `_`-prefixed columns from an output row.
pub fn strip_internal(mut row: Row) -> Row {
    row.retain(|k, _| !k.starts_with('_'));
    row
}

fn derive_deployment_column(columns: &mut Vec<String>, rows: &mut [Row]) {
    let kind_col = KIND_COLUMNS.iter().find(|c| columns.iter().any(|col| col == *c));
    let name_col = NAME_COLUMNS.iter().find(|c| columns.iter().any(|col| col == *c));
    let Some(name_col) = name_col else {
        return;
    };
    for row in rows.iter_mut() {
        let kind = kind_col
            .and_then(|k| row.get(*k))
            .and_then(Value::as_str)
            .unwrap_or("Pod")
            .to_string();
        let deployment = match row.get(*name_col).and_then(Value::as_str) {
            Some(name) => Value::from(deployment_for(&kind, name)),
            None => Value::Null,
        };
        row.insert(DEPLOYMENT_COLUMN.into(), deployment);
    }
    columns.push(DEPLOYMENT_COLUMN.into());
}

// ----------------------------------------------------------------------------
// 12.6 Long-Form Pivoting
// ----------------------------------------------------------------------------

/// How long-form `(timestamp, name, value)` rows become wide series.
#[derive(Debug, Clone, PartialEq)]
pub enum PivotMode {
    /// One series per entity; duplicate timestamps are averaged.
    PerEntity { entity_column: String },
    /// One series for the whole selection; duplicate timestamps are summed.
    ClusterWide,
}

/// Column names of long-form metric rows.
#[derive(Debug, Clone, Copy)]
pub struct LongForm<'a> {
    pub time: &'a str,
    pub name: &'a str,
    pub value: &'a str,
}

/// Pivot long-form rows into aligned wide rows. Series columns use
/// sanitised names; gaps are forward then backward filled. `carry` columns
/// are copied from the first row of each entity.
pub fn pivot_long_form(rows: &[Row], layout: LongForm<'_>, mode: &PivotMode, carry: &[&str]) -> Table {
    let mut entities: BTreeMap<String, Vec<&Row>> = BTreeMap::new();
    for row in rows {
        let key = match mode {
            PivotMode::PerEntity { entity_column } => row.get(entity_column).map(Value::render).unwrap_or_default(),
            PivotMode::ClusterWide => String::new(),
        };
        entities.entry(key).or_default().push(row);
    }

    let mut series_names: Vec<String> = rows
        .iter()
        .filter_map(|r| r.get(layout.name).and_then(Value::as_str))
        .map(sanitize_name)
        .collect();
    series_names.sort();
    series_names.dedup();

    let mut columns = vec![layout.time.to_string()];
    if let PivotMode::PerEntity { entity_column } = mode {
        columns.push(entity_column.clone());
        for c in carry {
            if !columns.iter().any(|col| col == c) {
                columns.push(c.to_string());
            }
        }
    }
    columns.extend(series_names.iter().cloned());

    let mut out = Vec::new();
    for (entity, members) in entities {
        // timestamp -> series -> samples
        let mut grid: BTreeMap<(Option<Timestamp>, String), BTreeMap<String, Vec<f64>>> = BTreeMap::new();
        for row in &members {
            let (Some(name), Some(value)) = (
                row.get(layout.name).and_then(Value::as_str),
                row.get(layout.value).and_then(Value::as_f64),
            ) else {
                continue;
            };
            let ts_raw = row.get(layout.time).map(Value::render).unwrap_or_default();
            grid.entry((parse_time(&ts_raw), ts_raw))
                .or_default()
                .entry(sanitize_name(name))
                .or_default()
                .push(value);
        }

        let reduce = match mode {
            PivotMode::PerEntity { .. } => Aggregation::Mean,
            PivotMode::ClusterWide => Aggregation::Sum,
        };
        let mut wide: Vec<Row> = grid
            .into_iter()
            .map(|((_, ts_raw), cells)| {
                let mut row = Row::new();
                row.insert(layout.time.to_string(), Value::from(ts_raw));
                for name in &series_names {
                    let v = cells.get(name).and_then(|s| reduce.reduce(s));
                    row.insert(name.clone(), v.map_or(Value::Null, Value::Number));
                }
                row
            })
            .collect();

        fill_gaps(&mut wide, &series_names);

        if let PivotMode::PerEntity { entity_column } = mode {
            let first = members.first();
            for row in wide.iter_mut() {
                row.insert(entity_column.clone(), Value::from(entity.clone()));
                for c in carry {
                    let v = first.and_then(|r| r.get(*c)).cloned().unwrap_or_else(|| Value::from(entity.clone()));
                    row.insert(c.to_string(), v);
                }
            }
        }
        out.extend(wide);
    }

    Table { columns, rows: out }
}

/// Forward fill then backward fill each series.
fn fill_gaps(rows: &mut [Row], series: &[String]) {
    for name in series {
        let mut last: Option<Value> = None;
        for row in rows.iter_mut() {
            match row.get(name) {
                Some(Value::Null) | None => {
                    if let Some(v) = &last {
                        row.insert(name.clone(), v.clone());
                    }
                }
                Some(v) => last = Some(v.clone()),
            }
        }
        let mut next: Option<Value> = None;
        for row in rows.iter_mut().rev() {
            match row.get(name) {
                Some(Value::Null) | None => {
                    if let Some(v) = &next {
                        row.insert(name.clone(), v.clone());
                    }
                }
                Some(v) => next = Some(v.clone()),
            }
        }
    }
}

/// Convert a page of rows to JSON.
pub fn page_to_json(page: &Paginated<Row>) -> JsonValue {
    serde_json::to_value(page).unwrap_or(JsonValue::Null)
}

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn table(columns: &[&str], rows: &[&[&str]]) -> Table {
        Table {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .iter()
                .map(|cells| {
                    columns
                        .iter()
                        .zip(cells.iter())
                        .map(|(c, v)| {
                            let value = if v.is_empty() { Value::Null } else { Value::from(*v) };
                            (c.to_string(), value)
                        })
                        .collect()
                })
                .collect(),
        }
    }

    fn alerts_table() -> Table {
        table(
            &["labels.alertname", "labels.severity", "state", "value", "_file_timestamp"],
            &[
                &["HighLatency", "critical", "firing", "3.5", "2025-01-01T10:00:00Z"],
                &["HighErrors", "critical", "firing", "7", "2025-01-01T10:01:00Z"],
                &["KafkaLag", "critical", "firing", "1", "2025-01-01T10:02:00Z"],
                &["Disk", "warning", "pending", "2", "2025-01-01T10:03:00Z"],
            ],
        )
    }

    #[test]
    fn test_filter_group_count_scenario() {
        let pipeline = Pipeline::with_shortcuts(ColumnShortcuts::alerts());
        let mut query = Query {
            group_by: vec!["severity".into()],
            ..Query::default()
        };
        query.filters.insert("state".into(), Value::from("firing"));

        let page = pipeline.run(alerts_table(), &query).unwrap();
        assert_eq!(
            page_to_json(&page),
            json!({
                "total_count": 1,
                "offset": 0,
                "limit": "all",
                "returned_count": 1,
                "data": [{"severity": "critical", "count": 3}]
            })
        );
    }

    #[test]
    fn test_numeric_aggregation_sorts_desc() {
        let pipeline = Pipeline::with_shortcuts(ColumnShortcuts::alerts());
        let query = Query {
            group_by: vec!["alertname".into()],
            aggregation: Aggregation::Max,
            ..Query::default()
        };
        let page = pipeline.run(alerts_table(), &query).unwrap();
        let names: Vec<String> = page.data.iter().map(|r| r["alertname"].render()).collect();
        assert_eq!(names, vec!["HighErrors", "HighLatency", "Disk", "KafkaLag"]);
        // internal columns never leak
        assert!(page.data.iter().all(|r| !r.contains_key("_file_timestamp")));
    }

    #[test]
    fn test_unknown_filter_column_lists_available() {
        let mut query = Query::default();
        query.filters.insert("sevrity".into(), Value::from("x"));
        let err = Pipeline::default().run(alerts_table(), &query).unwrap_err();
        let payload = err.to_payload();
        assert_eq!(payload["category"], "input_query");
        assert!(payload["available_columns"].as_array().unwrap().len() >= 4);
    }

    #[test]
    fn test_unsupported_aggregation_is_reported() {
        let pipeline = Pipeline::default().supporting(&[Aggregation::Count, Aggregation::First]);
        assert!(Aggregation::parse_supported("median", &pipeline.supported).is_err());
        assert!(Aggregation::parse_supported("sum", &pipeline.supported).is_err());
        assert_eq!(Aggregation::parse_supported("FIRST", &pipeline.supported).unwrap(), Aggregation::First);
    }

    #[test]
    fn test_no_numeric_columns_error() {
        let t = table(&["reason", "kind"], &[&["BackOff", "Pod"]]);
        let query = Query {
            group_by: vec!["kind".into()],
            aggregation: Aggregation::Sum,
            ..Query::default()
        };
        let err = Pipeline::default().run(t, &query).unwrap_err();
        assert!(err.to_string().contains("No numeric columns"));
    }

    #[test]
    fn test_time_window_and_last() {
        let t = table(
            &["object_kind", "object_name", "reason", "event_time"],
            &[
                &["Pod", "cart-7d9f8b6c4-abcde", "Pulled", "2025-01-01T10:00:00Z"],
                &["Pod", "cart-7d9f8b6c4-abcde", "BackOff", "2025-01-01T10:05:00Z"],
                &["Pod", "cart-7d9f8b6c4-xyz12", "Killing", "2025-01-01T11:00:00Z"],
            ],
        );
        let query = Query {
            window: TimeWindow::parse(None, Some("2025-01-01T10:30:00Z")).unwrap(),
            time_column: Some("event_time".into()),
            group_by: vec!["deployment".into()],
            aggregation: Aggregation::Last,
            ..Query::default()
        };
        let page = Pipeline::default().run(t, &query).unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.data[0]["deployment"], Value::from("cart"));
        assert_eq!(page.data[0]["reason"], Value::from("BackOff"));
    }

    #[test]
    fn test_nunique_and_list() {
        let t = table(
            &["pod", "reason"],
            &[&["a", "X"], &["a", "Y"], &["a", "X"], &["b", "Z"]],
        );
        let nunique = Query {
            group_by: vec!["pod".into()],
            aggregation: Aggregation::Nunique,
            ..Query::default()
        };
        let page = Pipeline::default().run(t.clone(), &nunique).unwrap();
        assert_eq!(page.data[0]["reason_unique"], Value::Number(2.0));

        let list = Query {
            group_by: vec!["pod".into()],
            aggregation: Aggregation::List,
            list_columns: vec!["reason".into()],
            ..Query::default()
        };
        let page = Pipeline::default().run(t, &list).unwrap();
        assert_eq!(page.data[0]["reason"], Value::List(vec![Value::from("X"), Value::from("Y")]));
    }

    #[test]
    fn test_derive_row_wise() {
        let t = table(&["a", "b"], &[&["1", "4"], &["2", "0"]]);
        let query = Query {
            derive: Some("ratio = a / b".into()),
            ..Query::default()
        };
        let page = Pipeline::default().run(t, &query).unwrap();
        assert_eq!(page.data[0]["ratio"], Value::Number(0.25));
        assert_eq!(page.data[1]["ratio"], Value::Null);
    }

    #[test]
    fn test_pivot_per_entity_fills_and_averages() {
        let t = table(
            &["timestamp", "metric_name", "value", "_object_name"],
            &[
                &["2025-01-01T10:00:00Z", "cpu:used", "1", "p1"],
                &["2025-01-01T10:00:00Z", "cpu:used", "3", "p1"],
                &["2025-01-01T10:01:00Z", "cpu:limit", "4", "p1"],
                &["2025-01-01T10:00:00Z", "cpu:used", "5", "p2"],
            ],
        );
        let wide = pivot_long_form(
            &t.rows,
            LongForm {
                time: "timestamp",
                name: "metric_name",
                value: "value",
            },
            &PivotMode::PerEntity {
                entity_column: "_object_name".into(),
            },
            &["deployment"],
        );
        assert!(wide.columns.contains(&"cpu_used".to_string()));
        let p1: Vec<&Row> = wide.rows.iter().filter(|r| r["_object_name"] == Value::from("p1")).collect();
        assert_eq!(p1.len(), 2);
        assert_eq!(p1[0]["cpu_used"], Value::Number(2.0));
        assert_eq!(p1[0]["cpu_limit"], Value::Number(4.0)); // back filled
        assert_eq!(p1[1]["cpu_used"], Value::Number(2.0)); // forward filled
    }

    #[test]
    fn test_pivot_cluster_wide_sums() {
        let t = table(
            &["timestamp", "metric_name", "value"],
            &[
                &["2025-01-01T10:00:00Z", "req", "1"],
                &["2025-01-01T10:00:00Z", "req", "2"],
            ],
        );
        let wide = pivot_long_form(
            &t.rows,
            LongForm {
                time: "timestamp",
                name: "metric_name",
                value: "value",
            },
            &PivotMode::ClusterWide,
            &[],
        );
        assert_eq!(wide.rows.len(), 1);
        assert_eq!(wide.rows[0]["req"], Value::Number(3.0));
    }

    proptest! {
        #[test]
        fn prop_pagination_invariant(len in 0usize..200, offset in 0usize..250, limit in 0usize..50) {
            let items: Vec<usize> = (0..len).collect();
            let page = paginate(items, offset, limit);
            let available = len.saturating_sub(offset);
            let expected = if limit == 0 { available } else { available.min(limit) };
            prop_assert_eq!(page.total_count, len);
            prop_assert_eq!(page.returned_count, expected);
            prop_assert_eq!(page.data.len(), page.returned_count);
            if expected > 0 {
                prop_assert_eq!(page.data[0], offset);
            }
        }

        #[test]
        fn prop_pipeline_pages_concatenate_to_full_result(
            cells in proptest::collection::vec((0usize..3, 0usize..4, 0u32..20), 0..60),
            grouped in any::<bool>(),
            filtered in any::<bool>(),
            descending in any::<bool>(),
            k in 1usize..8,
        ) {
            const KINDS: [&str; 3] = ["Pod", "Service", "Node"];
            const REASONS: [&str; 4] = ["BackOff", "Pulled", "Killing", "Started"];
            let t = Table {
                columns: vec!["kind".into(), "reason".into(), "value".into()],
                rows: cells
                    .iter()
                    .map(|(kind, reason, value)| {
                        let mut row = Row::new();
                        row.insert("kind".into(), Value::from(KINDS[*kind]));
                        row.insert("reason".into(), Value::from(REASONS[*reason]));
                        row.insert("value".into(), Value::Number(f64::from(*value)));
                        row
                    })
                    .collect(),
            };
            let mut base = Query {
                descending: Some(descending),
                ..Query::default()
            };
            if grouped {
                base.group_by = vec!["reason".into()];
            } else {
                base.sort_by = Some("value".into());
            }
            if filtered {
                base.filters.insert("kind".into(), Value::from("Pod"));
            }

            let pipeline = Pipeline::default();
            let full = pipeline.run(t.clone(), &base).unwrap();
            prop_assert_eq!(full.returned_count, full.total_count);

            let mut collected: Vec<Row> = Vec::new();
            let mut offset = 0;
            loop {
                let query = Query {
                    offset,
                    limit: k,
                    ..base.clone()
                };
                let page = pipeline.run(t.clone(), &query).unwrap();
                prop_assert_eq!(page.total_count, full.total_count);
                prop_assert!(page.returned_count <= k);
                if page.data.is_empty() {
                    break;
                }
                collected.extend(page.data);
                offset += k;
            }
            prop_assert_eq!(collected, full.data);
        }
    }
}
