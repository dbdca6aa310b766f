// ============================================================================
// SECTION 19: SPEC CHANGE ANALYSIS & RETRIEVAL
// ============================================================================
// Per-entity change windows between consecutive cleaned specs, lifecycle
// inference (metadata or observation timing), and latest-spec retrieval.
// ============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, info};

use crate::config::ChangesConfig;
use crate::deadline::Deadline;
use crate::error::{ForensicsError, ForensicsResult, InputError};
use crate::identity::{resolve, EntityId, EntityQuery, IdentifierFormat};
use crate::ingest::{load_records, AccessPolicy, Ingested, InputShape, Record, SchemaHints};
use crate::specdiff::{diff, prepare, DiffItem};
use crate::timeutil::{format_k8s_time, format_timestamp, parse_time, TimeWindow, Timestamp};
use crate::value::Value;

const MAX_SAMPLE_KINDS: usize = 20;
const MAX_SAMPLE_ENTITIES: usize = 10;

// ----------------------------------------------------------------------------
// 19.1 Request Options
// ----------------------------------------------------------------------------

/// Which clock a change window is stamped with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBasis {
    Observation,
    EffectiveUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleMode {
    None,
    Window,
    #[serde(alias = "k8s_metadata")]
    Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleScope {
    Global,
    PerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSort {
    #[default]
    Entity,
    ChangeCount,
}

/// Change analysis request. Unset options take defaults from the input shape.
#[derive(Debug, Clone)]
pub struct ChangeQuery {
    pub identifier: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub time_basis: Option<TimeBasis>,
    pub lifecycle: Option<LifecycleMode>,
    pub scope: Option<LifecycleScope>,
    pub removal_grace: Option<Duration>,
    pub min_missing_cycles: Option<usize>,
    pub max_changes_per_diff: Option<usize>,
    pub include_no_change: bool,
    pub include_reference_spec: bool,
    pub include_change_items: bool,
    pub sort_by: ChangeSort,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Default for ChangeQuery {
    fn default() -> Self {
        Self {
            identifier: None,
            start_time: None,
            end_time: None,
            time_basis: None,
            lifecycle: None,
            scope: None,
            removal_grace: None,
            min_missing_cycles: None,
            max_changes_per_diff: None,
            include_no_change: false,
            include_reference_spec: true,
            include_change_items: true,
            sort_by: ChangeSort::Entity,
            offset: 0,
            limit: None,
        }
    }
}

/// Options after shape defaults have been applied.
#[derive(Debug, Clone, Copy)]
struct Resolved {
    basis: TimeBasis,
    mode: LifecycleMode,
    scope: LifecycleScope,
    grace: Duration,
    min_cycles: usize,
    max_items: usize,
}

impl Resolved {
    fn new(query: &ChangeQuery, shape: InputShape, config: &ChangesConfig) -> Self {
        let raw = shape == InputShape::RawNested;
        Self {
            basis: query.time_basis.unwrap_or(if raw {
                TimeBasis::EffectiveUpdate
            } else {
                TimeBasis::Observation
            }),
            mode: query.lifecycle.unwrap_or(if raw {
                LifecycleMode::Metadata
            } else {
                LifecycleMode::Window
            }),
            scope: query.scope.unwrap_or(if raw {
                LifecycleScope::PerKind
            } else {
                LifecycleScope::Global
            }),
            grace: query
                .removal_grace
                .unwrap_or(if raw { config.removal_grace } else { Duration::ZERO }),
            min_cycles: query
                .min_missing_cycles
                .unwrap_or(if raw { config.min_missing_cycles } else { 0 }),
            max_items: query.max_changes_per_diff.unwrap_or(config.max_changes_per_diff),
        }
    }
}

// ----------------------------------------------------------------------------
// 19.2 Observations & Change Windows
// ----------------------------------------------------------------------------

/// Lifecycle-relevant metadata of one observation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ObservationMeta {
    pub creation_timestamp: Option<Timestamp>,
    pub resource_version: Option<String>,
    pub deletion_timestamp: Option<String>,
}

/// One cleaned, normalised snapshot of an entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpecObservation {
    pub entity_id: EntityId,
    pub timestamp: Option<Timestamp>,
    pub effective_timestamp: Option<Timestamp>,
    pub cleaned_spec: Value,
    pub meta: ObservationMeta,
}

impl SpecObservation {
    pub fn from_record(record: &Record) -> Option<Self> {
        let body = record.body()?;
        let non_empty = |path: &[&str]| {
            body.get_path(path)
                .map(Value::render)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty() && s != "null")
        };
        Some(Self {
            entity_id: record.entity_id()?,
            timestamp: record.timestamp,
            effective_timestamp: record.effective_timestamp,
            cleaned_spec: prepare(body).unwrap_or_default(),
            meta: ObservationMeta {
                creation_timestamp: body
                    .str_at(&["metadata", "creationTimestamp"])
                    .and_then(parse_time),
                resource_version: non_empty(&["metadata", "resourceVersion"]),
                deletion_timestamp: non_empty(&["metadata", "deletionTimestamp"]),
            },
        })
    }

    /// Timestamp under the requested basis, falling back to observation time.
    fn stamped(&self, basis: TimeBasis) -> Option<Timestamp> {
        match basis {
            TimeBasis::Observation => self.timestamp,
            TimeBasis::EffectiveUpdate => self.effective_timestamp.or(self.timestamp),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    EntityAdded,
    EntityRemoved,
    EntityModified,
}

/// Entity-level change derived from metadata or observation timing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleItem {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: LifecycleKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<String>,
    pub inferred: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<bool>,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub evidence: Map<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChangeItem {
    Diff(DiffItem),
    Lifecycle(LifecycleItem),
}

/// Changes observed between two consecutive observations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeWindow {
    pub timestamp: String,
    pub from_timestamp: Option<String>,
    pub items: Vec<ChangeItem>,
    pub truncated: bool,
    pub item_total: usize,
    #[serde(skip)]
    at: Option<Timestamp>,
}

impl ChangeWindow {
    fn lifecycle(at: Option<Timestamp>, timestamp: String, from: Option<String>, item: LifecycleItem) -> Self {
        Self {
            timestamp,
            from_timestamp: from,
            items: vec![ChangeItem::Lifecycle(item)],
            truncated: false,
            item_total: 1,
            at,
        }
    }

    fn diff(at: Option<Timestamp>, from: Option<Timestamp>, mut items: Vec<DiffItem>, max_items: usize) -> Self {
        let item_total = items.len();
        if max_items > 0 {
            items.truncate(max_items);
        }
        Self {
            timestamp: at.as_ref().map(format_timestamp).unwrap_or_default(),
            from_timestamp: from.as_ref().map(format_timestamp),
            truncated: item_total > items.len(),
            items: items.into_iter().map(ChangeItem::Diff).collect(),
            item_total,
            at,
        }
    }
}

/// A diff item flattened with its window timestamps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatChangeItem {
    pub timestamp: String,
    pub from_timestamp: Option<String>,
    #[serde(flatten)]
    pub item: DiffItem,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceSpec {
    pub timestamp: Option<String>,
    pub spec: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleSummary {
    pub mode: LifecycleMode,
    pub inferred_added: bool,
    pub inferred_removed: bool,
    pub metadata_added: bool,
    pub metadata_removed: bool,
    pub metadata_modified: bool,
    pub creation_timestamp: Option<String>,
    pub resource_versions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityChanges {
    pub entity: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub time_basis: TimeBasis,
    pub first_timestamp: Option<String>,
    pub last_timestamp: Option<String>,
    pub observation_count: usize,
    pub duration_sec: f64,
    pub change_count: usize,
    pub changes: Vec<ChangeWindow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_spec: Option<ReferenceSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_items: Option<Vec<FlatChangeItem>>,
    pub lifecycle: LifecycleSummary,
}

impl EntityChanges {
    pub fn item_total(&self) -> usize {
        self.changes.iter().map(|w| w.item_total).sum()
    }
}

/// Result document of a change analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_format: Option<InputShape>,
    pub sort_by: ChangeSort,
    pub total_entities_observed: usize,
    pub total_entities: usize,
    pub returned_count: usize,
    pub offset: usize,
    pub limit: Option<usize>,
    pub total_change_events: usize,
    pub returned_change_events: usize,
    pub total_change_item_total: usize,
    pub returned_change_item_total: usize,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub entities: Vec<EntityChanges>,
}

impl ChangeReport {
    /// Error document with every count zeroed.
    pub fn from_error(source: &Path, query: &ChangeQuery, err: &ForensicsError) -> Self {
        Self {
            error: Some(err.to_string()),
            category: Some(err.category().to_string()),
            source: source.display().to_string(),
            sort_by: query.sort_by,
            offset: query.offset,
            limit: query.limit,
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// 19.3 Lifecycle Inference
// ----------------------------------------------------------------------------

/// Observation timestamps bounding a lifecycle scope.
#[derive(Debug, Clone, Default)]
struct ScopeBounds {
    first: Option<Timestamp>,
    last: Option<Timestamp>,
    cycles: BTreeSet<Timestamp>,
}

impl ScopeBounds {
    fn observe(&mut self, ts: Timestamp) {
        self.first = Some(self.first.map_or(ts, |f| f.min(ts)));
        self.last = Some(self.last.map_or(ts, |l| l.max(ts)));
        self.cycles.insert(ts);
    }
}

struct LifecycleOutcome {
    windows: Vec<ChangeWindow>,
    summary: LifecycleSummary,
}

fn infer_lifecycle(
    entity: &str,
    observations: &[SpecObservation],
    scope: &ScopeBounds,
    window: &TimeWindow,
    opts: &Resolved,
) -> LifecycleOutcome {
    let first_ts = observations.iter().filter_map(|o| o.timestamp).min();
    let last_ts = observations.iter().filter_map(|o| o.timestamp).max();
    let creation = observations.iter().find_map(|o| o.meta.creation_timestamp);
    let deletion = observations.iter().find_map(|o| o.meta.deletion_timestamp.clone());
    let mut versions: Vec<String> = Vec::new();
    for rv in observations.iter().filter_map(|o| o.meta.resource_version.clone()) {
        if !versions.contains(&rv) {
            versions.push(rv);
        }
    }

    let mut summary = LifecycleSummary {
        mode: opts.mode,
        inferred_added: false,
        inferred_removed: false,
        metadata_added: false,
        metadata_removed: false,
        metadata_modified: false,
        creation_timestamp: creation.as_ref().map(format_k8s_time),
        resource_versions: versions.clone(),
    };
    let mut windows = Vec::new();
    let render = |ts: Option<Timestamp>| ts.as_ref().map(format_timestamp);

    match opts.mode {
        LifecycleMode::None => {}
        LifecycleMode::Metadata => {
            if let Some(created) = creation {
                summary.metadata_added = window.is_bounded() && window.contains(&created);
                if summary.metadata_added {
                    let mut evidence = Map::new();
                    evidence.insert("creationTimestamp".into(), json!(format_k8s_time(&created)));
                    evidence.insert("investigation_start".into(), json!(window.start.as_ref().map(format_k8s_time)));
                    evidence.insert("investigation_end".into(), json!(window.end.as_ref().map(format_k8s_time)));
                    windows.push(ChangeWindow::lifecycle(
                        Some(created),
                        format_k8s_time(&created),
                        None,
                        LifecycleItem {
                            path: "entity".into(),
                            kind: LifecycleKind::EntityAdded,
                            old: None,
                            new: Some(entity.to_string()),
                            inferred: false,
                            confirmed: None,
                            source: "k8s_metadata".into(),
                            reason: None,
                            evidence,
                        },
                    ));
                }
            }
            if let Some(deleted) = &deletion {
                summary.metadata_removed = true;
                let mut evidence = Map::new();
                evidence.insert("deletionTimestamp".into(), json!(deleted));
                windows.push(ChangeWindow::lifecycle(
                    parse_time(deleted),
                    deleted.clone(),
                    None,
                    LifecycleItem {
                        path: "entity".into(),
                        kind: LifecycleKind::EntityRemoved,
                        old: Some(entity.to_string()),
                        new: None,
                        inferred: false,
                        confirmed: Some(true),
                        source: "k8s_metadata".into(),
                        reason: Some("deletionTimestamp".into()),
                        evidence,
                    },
                ));
            }
            summary.metadata_modified = versions.len() > 1;
            if summary.metadata_modified {
                let mut evidence = Map::new();
                evidence.insert("resourceVersions".into(), json!(versions));
                evidence.insert("observation_count".into(), json!(observations.len()));
                windows.push(ChangeWindow::lifecycle(
                    last_ts,
                    render(last_ts).unwrap_or_default(),
                    render(first_ts),
                    LifecycleItem {
                        path: "metadata.resourceVersion".into(),
                        kind: LifecycleKind::EntityModified,
                        old: versions.first().cloned(),
                        new: versions.last().cloned(),
                        inferred: false,
                        confirmed: None,
                        source: "k8s_metadata".into(),
                        reason: None,
                        evidence,
                    },
                ));
            }
        }
        LifecycleMode::Window => {
            summary.inferred_added = matches!((first_ts, scope.first), (Some(f), Some(s)) if f > s);
            if let (Some(last), Some(scope_last)) = (last_ts, scope.last) {
                if last < scope_last {
                    let gap = (scope_last - last).to_std().unwrap_or_default();
                    let later_cycles = scope.cycles.range(last..).filter(|t| **t > last).count();
                    summary.inferred_removed = gap >= opts.grace && later_cycles >= opts.min_cycles;
                }
            }
            let mut evidence = Map::new();
            evidence.insert("window_first_seen".into(), json!(render(scope.first)));
            evidence.insert("window_last_seen".into(), json!(render(scope.last)));

            if summary.inferred_added {
                let mut evidence = evidence.clone();
                evidence.insert("first_seen".into(), json!(render(first_ts)));
                windows.push(ChangeWindow::lifecycle(
                    first_ts,
                    render(first_ts).unwrap_or_default(),
                    None,
                    LifecycleItem {
                        path: "entity".into(),
                        kind: LifecycleKind::EntityAdded,
                        old: None,
                        new: Some(entity.to_string()),
                        inferred: true,
                        confirmed: None,
                        source: "observation_timing".into(),
                        reason: None,
                        evidence,
                    },
                ));
            }
            let confirmed = observations
                .last()
                .is_some_and(|o| o.meta.deletion_timestamp.is_some());
            if summary.inferred_removed || confirmed {
                let mut evidence = evidence;
                evidence.insert("last_seen".into(), json!(render(last_ts)));
                windows.push(ChangeWindow::lifecycle(
                    last_ts,
                    render(last_ts).unwrap_or_default(),
                    None,
                    LifecycleItem {
                        path: "entity".into(),
                        kind: LifecycleKind::EntityRemoved,
                        old: Some(entity.to_string()),
                        new: None,
                        inferred: !confirmed,
                        confirmed: Some(confirmed),
                        source: (if summary.inferred_removed { "observation_timing" } else { "k8s_metadata" }).into(),
                        reason: Some((if confirmed { "deletionTimestamp" } else { "not_observed" }).into()),
                        evidence,
                    },
                ));
            }
        }
    }

    LifecycleOutcome { windows, summary }
}

// ----------------------------------------------------------------------------
// 19.4 Change Analysis
// ----------------------------------------------------------------------------

fn no_match_error(query: &str, records: &[Record]) -> ForensicsError {
    let kinds: BTreeSet<&str> = records.iter().filter_map(|r| r.kind.as_deref()).collect();
    let samples: BTreeSet<String> = records.iter().filter_map(Record::entity_id).map(|id| id.to_string()).collect();
    InputError::NoMatchingEntity {
        query: query.to_string(),
        available_kinds: kinds.into_iter().take(MAX_SAMPLE_KINDS).map(str::to_string).collect(),
        sample_entities: samples.into_iter().take(MAX_SAMPLE_ENTITIES).collect(),
    }
    .into()
}

/// Keep only records of the entities `identifier` resolves to.
fn select_entities(records: Vec<Record>, identifier: &str) -> ForensicsResult<(Vec<Record>, EntityQuery, Vec<EntityId>, Option<String>)> {
    let query = EntityQuery::parse(identifier)?;
    let ids: BTreeSet<EntityId> = records.iter().filter_map(Record::entity_id).collect();
    let resolution = resolve(&query, &ids);
    if resolution.matches.is_empty() {
        return Err(no_match_error(identifier, &records));
    }
    let wanted: BTreeSet<&EntityId> = resolution.matches.iter().collect();
    let selected = records
        .into_iter()
        .filter(|r| r.entity_id().is_some_and(|id| wanted.contains(&id)))
        .collect();
    Ok((selected, query, resolution.matches, resolution.warning))
}

/// Analyze spec changes in an object snapshot table.
pub fn analyze_changes(
    path: &Path,
    query: &ChangeQuery,
    config: &ChangesConfig,
    policy: &AccessPolicy,
    deadline: &Deadline,
) -> ForensicsResult<ChangeReport> {
    let ingested = load_records(path, &SchemaHints::k8s_objects(), policy)?;
    analyze_loaded_changes(ingested, query, config, deadline)
}

/// Change analysis over records already loaded.
pub fn analyze_loaded_changes(
    ingested: Ingested,
    query: &ChangeQuery,
    config: &ChangesConfig,
    deadline: &Deadline,
) -> ForensicsResult<ChangeReport> {
    let Ingested {
        records,
        shape,
        report: ingest,
    } = ingested;
    let opts = Resolved::new(query, shape, config);
    let window = TimeWindow::parse(query.start_time.as_deref(), query.end_time.as_deref())?;
    let mut warnings = ingest.warnings.clone();

    let mut records = records;
    if let Some(identifier) = query.identifier.as_deref().filter(|s| !s.trim().is_empty()) {
        let (selected, _, _, warning) = select_entities(records, identifier)?;
        records = selected;
        warnings.extend(warning);
    }
    if opts.basis != TimeBasis::EffectiveUpdate && window.is_bounded() {
        records.retain(|r| window.contains_opt(r.timestamp.as_ref()));
    }
    if records.is_empty() {
        return Err(InputError::invalid_time("no observations remain after applying the time window").into());
    }

    // Scope bounds
    let mut global = ScopeBounds::default();
    let mut per_kind: BTreeMap<String, ScopeBounds> = BTreeMap::new();
    for record in &records {
        if let Some(ts) = record.timestamp {
            global.observe(ts);
            if let Some(kind) = &record.kind {
                per_kind.entry(kind.clone()).or_default().observe(ts);
            }
        }
    }

    let mut by_entity: BTreeMap<EntityId, Vec<&Record>> = BTreeMap::new();
    for record in &records {
        if let Some(id) = record.entity_id() {
            by_entity.entry(id).or_default().push(record);
        }
    }
    let total_entities_observed = by_entity.len();

    let mut results = Vec::new();
    let mut timed_out = false;
    for (id, mut group) in by_entity {
        if !deadline.allows("spec_changes") {
            timed_out = true;
            break;
        }
        group.sort_by_key(|r| r.timestamp);
        let entity = id.to_string();
        let observations: Vec<SpecObservation> = group.iter().filter_map(|r| SpecObservation::from_record(r)).collect();

        let scope = match opts.scope {
            LifecycleScope::PerKind => per_kind.get(&id.kind).unwrap_or(&global),
            LifecycleScope::Global => &global,
        };
        let lifecycle = infer_lifecycle(&entity, &observations, scope, &window, &opts);

        let mut changes = lifecycle.windows;
        let mut flat = Vec::new();
        for pair in observations.windows(2) {
            let (prev, curr) = (&pair[0], &pair[1]);
            if prev.cleaned_spec == curr.cleaned_spec {
                continue;
            }
            let items = diff(&prev.cleaned_spec, &curr.cleaned_spec);
            if items.is_empty() {
                continue;
            }
            let change = ChangeWindow::diff(curr.stamped(opts.basis), prev.stamped(opts.basis), items, opts.max_items);
            if query.include_change_items {
                for item in &change.items {
                    if let ChangeItem::Diff(d) = item {
                        flat.push((change.at, FlatChangeItem {
                            timestamp: change.timestamp.clone(),
                            from_timestamp: change.from_timestamp.clone(),
                            item: d.clone(),
                        }));
                    }
                }
            }
            changes.push(change);
        }

        if opts.basis == TimeBasis::EffectiveUpdate && window.is_bounded() {
            changes.retain(|w| window.contains_opt(w.at.as_ref()));
            flat.retain(|(at, _)| window.contains_opt(at.as_ref()));
        }
        if changes.is_empty() && !query.include_no_change {
            continue;
        }

        let first = group.iter().filter_map(|r| r.timestamp).min();
        let last = group.iter().filter_map(|r| r.timestamp).max();
        let duration_sec = match (first, last) {
            (Some(f), Some(l)) => (l - f).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        };
        results.push(EntityChanges {
            kind: id.kind.clone(),
            namespace: id.namespace.clone(),
            name: id.name.clone(),
            entity,
            time_basis: opts.basis,
            first_timestamp: first.as_ref().map(format_timestamp),
            last_timestamp: last.as_ref().map(format_timestamp),
            observation_count: group.len(),
            duration_sec,
            change_count: changes.len(),
            changes,
            reference_spec: query
                .include_reference_spec
                .then(|| observations.first())
                .flatten()
                .map(|o| ReferenceSpec {
                    timestamp: o.timestamp.as_ref().map(format_timestamp),
                    spec: o.cleaned_spec.clone(),
                }),
            change_items: query
                .include_change_items
                .then(|| flat.into_iter().map(|(_, item)| item).collect()),
            lifecycle: lifecycle.summary,
        });
    }

    match query.sort_by {
        ChangeSort::Entity => results.sort_by_key(|e| e.entity.to_lowercase()),
        ChangeSort::ChangeCount => results.sort_by(|a, b| {
            b.change_count
                .cmp(&a.change_count)
                .then_with(|| a.entity.to_lowercase().cmp(&b.entity.to_lowercase()))
        }),
    }

    let total_entities = results.len();
    let total_change_events = results.iter().map(|e| e.change_count).sum();
    let total_change_item_total = results.iter().map(EntityChanges::item_total).sum();
    let page: Vec<EntityChanges> = results
        .into_iter()
        .skip(query.offset)
        .take(query.limit.filter(|l| *l > 0).unwrap_or(usize::MAX))
        .collect();

    info!(
        target: "forensics::changes",
        entities = total_entities_observed,
        with_changes = total_entities,
        returned = page.len(),
        timed_out,
        "Spec change analysis complete"
    );

    Ok(ChangeReport {
        error: None,
        category: None,
        source: ingest.source,
        input_format: Some(shape),
        sort_by: query.sort_by,
        total_entities_observed,
        total_entities,
        returned_count: page.len(),
        offset: query.offset,
        limit: query.limit,
        total_change_events,
        returned_change_events: page.iter().map(|e| e.change_count).sum(),
        total_change_item_total,
        returned_change_item_total: page.iter().map(EntityChanges::item_total).sum(),
        timed_out,
        warnings,
        entities: page,
    })
}

// ----------------------------------------------------------------------------
// 19.5 Spec Retrieval
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SpecRequest {
    pub identifier: String,
    pub include_metadata: bool,
    pub all_observations: bool,
}

impl SpecRequest {
    pub fn latest(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            include_metadata: true,
            all_observations: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservedSpec {
    pub timestamp: Option<String>,
    pub spec: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntitySpec {
    pub entity_id: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub observation_count: usize,
    pub first_timestamp: Option<String>,
    pub last_timestamp: Option<String>,
    pub latest_spec: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observations: Option<Vec<ObservedSpec>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpecReport {
    pub source: String,
    pub identifier: String,
    pub identifier_format: IdentifierFormat,
    pub input_format: InputShape,
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub matched_entities: Vec<String>,
    pub total_observation_count: usize,
    pub entities: Vec<EntitySpec>,
}

impl SpecReport {
    /// Latest spec of the first matched entity.
    pub fn latest(&self) -> Option<&Value> {
        self.entities.first().map(|e| &e.latest_spec)
    }
}

fn strip_metadata(body: &Value) -> Value {
    match body {
        Value::Map(map) => Value::Map(
            map.iter()
                .filter(|(k, _)| k.as_str() != "metadata")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Latest (or every) raw spec of the entities an identifier matches.
pub fn get_spec(path: &Path, request: &SpecRequest, policy: &AccessPolicy) -> ForensicsResult<SpecReport> {
    let ingested = load_records(path, &SchemaHints::k8s_objects(), policy)?;
    spec_from_loaded(ingested, request)
}

pub fn spec_from_loaded(ingested: Ingested, request: &SpecRequest) -> ForensicsResult<SpecReport> {
    let shape = ingested.shape;
    let source = ingested.report.source.clone();
    let (records, query, matched, warning) = select_entities(ingested.records, &request.identifier)?;

    let mut by_entity: BTreeMap<EntityId, Vec<&Record>> = BTreeMap::new();
    for record in &records {
        if let Some(id) = record.entity_id() {
            by_entity.entry(id).or_default().push(record);
        }
    }

    let mut entities = Vec::new();
    let mut total = 0;
    for (id, mut group) in by_entity {
        group.sort_by_key(|r| r.timestamp);
        let observed: Vec<ObservedSpec> = group
            .iter()
            .filter_map(|r| {
                let body = r.body()?;
                Some(ObservedSpec {
                    timestamp: r.timestamp.as_ref().map(format_timestamp),
                    spec: if request.include_metadata { body.clone() } else { strip_metadata(body) },
                })
            })
            .collect();
        let Some(latest) = observed.last() else { continue };
        total += observed.len();
        entities.push(EntitySpec {
            entity_id: id.to_string(),
            kind: id.kind.clone(),
            namespace: id.namespace.clone(),
            name: id.name.clone(),
            observation_count: observed.len(),
            first_timestamp: observed.first().and_then(|o| o.timestamp.clone()),
            last_timestamp: latest.timestamp.clone(),
            latest_spec: latest.spec.clone(),
            observations: request.all_observations.then(|| observed.clone()),
        });
    }

    if entities.is_empty() {
        return Err(InputError::unsupported_format(format!(
            "no parseable spec bodies for '{}'",
            request.identifier
        ))
        .into());
    }

    debug!(
        target: "forensics::changes",
        identifier = %request.identifier,
        entities = entities.len(),
        observations = total,
        "Spec retrieved"
    );

    Ok(SpecReport {
        source,
        identifier: request.identifier.clone(),
        identifier_format: query.format,
        input_format: shape,
        found: true,
        warning,
        matched_entities: matched.iter().map(|id| id.to_string()).collect(),
        total_observation_count: total,
        entities,
    })
}

#[cfg(test)]
mod changes_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Write;

    fn write_raw(rows: &[(&str, JsonValue)]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "TimestampTime\tBody").unwrap();
        for (ts, body) in rows {
            writeln!(file, "{}\t{}", ts, body).unwrap();
        }
        file
    }

    fn deployment(name: &str, created: &str, rv: &str, replicas: u32, managed: Option<&str>) -> JsonValue {
        let mut body = json!({
            "kind": "Deployment",
            "metadata": {
                "name": name,
                "namespace": "otel-demo",
                "creationTimestamp": created,
                "resourceVersion": rv
            },
            "spec": {"replicas": replicas}
        });
        if let Some(t) = managed {
            body["metadata"]["managedFields"] = json!([{"manager": "kubectl", "time": t}]);
        }
        body
    }

    fn structured(rows: &[(&str, &str, &str, JsonValue)]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "timestamp\tobject_kind\tobject_name\tobject_namespace\tbody").unwrap();
        for (ts, kind, name, body) in rows {
            writeln!(file, "{}\t{}\t{}\totel-demo\t{}", ts, kind, name, body).unwrap();
        }
        file
    }

    fn count_kind(report: &ChangeReport, kind: LifecycleKind) -> usize {
        report
            .entities
            .iter()
            .flat_map(|e| &e.changes)
            .flat_map(|w| &w.items)
            .filter(|i| matches!(i, ChangeItem::Lifecycle(l) if l.kind == kind))
            .count()
    }

    #[test]
    fn test_lifecycle_metadata_scenario() {
        let file = write_raw(&[
            ("2024-01-01 10:06:00", deployment("cart", "2024-01-01T10:05:00Z", "100", 1, None)),
            ("2024-01-01 10:10:00", deployment("cart", "2024-01-01T10:05:00Z", "100", 1, None)),
            ("2024-01-01 10:06:00", deployment("ad", "2024-01-01T08:00:00Z", "50", 1, None)),
            (
                "2024-01-01 10:10:00",
                deployment("ad", "2024-01-01T08:00:00Z", "51", 2, Some("2024-01-01T10:08:00Z")),
            ),
        ]);
        let query = ChangeQuery {
            start_time: Some("2024-01-01T10:00:00Z".into()),
            end_time: Some("2024-01-01T10:30:00Z".into()),
            ..ChangeQuery::default()
        };
        let report = analyze_changes(
            file.path(),
            &query,
            &ChangesConfig::default(),
            &AccessPolicy::permissive(),
            &Deadline::none(),
        )
        .unwrap();

        assert_eq!(report.input_format, Some(InputShape::RawNested));
        assert_eq!(count_kind(&report, LifecycleKind::EntityAdded), 1);
        assert_eq!(count_kind(&report, LifecycleKind::EntityRemoved), 0);
        assert_eq!(report.total_entities_observed, 2);

        let ad = report.entities.iter().find(|e| e.name == "ad").unwrap();
        assert!(ad.lifecycle.metadata_modified);
        assert_eq!(ad.time_basis, TimeBasis::EffectiveUpdate);
        let diff_window = ad
            .changes
            .iter()
            .find(|w| matches!(w.items[0], ChangeItem::Diff(_)))
            .unwrap();
        assert_eq!(diff_window.timestamp, "2024-01-01T10:08:00Z");
        assert_eq!(ad.change_items.as_ref().unwrap()[0].item.path, "spec.replicas");

        let cart = report.entities.iter().find(|e| e.name == "cart").unwrap();
        assert!(cart.lifecycle.metadata_added);
        assert_eq!(cart.change_count, 1);
    }

    #[test]
    fn test_metadata_added_requires_bounded_window() {
        let file = write_raw(&[
            ("2024-01-01 10:06:00", deployment("cart", "2024-01-01T10:05:00Z", "100", 1, None)),
            ("2024-01-01 10:06:00", deployment("ad", "2023-06-01T00:00:00Z", "50", 1, None)),
        ]);
        let report = analyze_changes(
            file.path(),
            &ChangeQuery::default(),
            &ChangesConfig::default(),
            &AccessPolicy::permissive(),
            &Deadline::none(),
        )
        .unwrap();

        assert_eq!(report.total_entities_observed, 2);
        assert_eq!(count_kind(&report, LifecycleKind::EntityAdded), 0);
        assert!(report.entities.iter().all(|e| !e.lifecycle.metadata_added));
    }

    #[test]
    fn test_window_truncation_reports_total() {
        let many: serde_json::Map<String, JsonValue> = (0..5).map(|i| (format!("k{}", i), json!(i))).collect();
        let changed: serde_json::Map<String, JsonValue> = (0..5).map(|i| (format!("k{}", i), json!(i + 1))).collect();
        let file = structured(&[
            ("2024-01-01T10:00:00Z", "ConfigMap", "flags", json!({"data": many})),
            ("2024-01-01T10:05:00Z", "ConfigMap", "flags", json!({"data": changed})),
        ]);
        let query = ChangeQuery {
            max_changes_per_diff: Some(2),
            ..ChangeQuery::default()
        };
        let report = analyze_changes(
            file.path(),
            &query,
            &ChangesConfig::default(),
            &AccessPolicy::permissive(),
            &Deadline::none(),
        )
        .unwrap();

        let window = &report.entities[0].changes[0];
        assert_eq!(window.items.len(), 2);
        assert_eq!(window.item_total, 5);
        assert!(window.truncated);
        assert_eq!(report.total_change_item_total, 5);
        assert_eq!(report.entities[0].time_basis, TimeBasis::Observation);
    }

    #[test]
    fn test_window_mode_inference_on_structured_input() {
        let spec = json!({"spec": {"replicas": 1}});
        let file = structured(&[
            ("2024-01-01T10:00:00Z", "Deployment", "old", spec.clone()),
            ("2024-01-01T10:05:00Z", "Deployment", "steady", spec.clone()),
            ("2024-01-01T10:00:00Z", "Deployment", "steady", spec.clone()),
            ("2024-01-01T10:05:00Z", "Deployment", "fresh", spec.clone()),
        ]);
        let report = analyze_changes(
            file.path(),
            &ChangeQuery::default(),
            &ChangesConfig::default(),
            &AccessPolicy::permissive(),
            &Deadline::none(),
        )
        .unwrap();

        let names: Vec<&str> = report.entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["fresh", "old"]);
        assert!(report.entities[0].lifecycle.inferred_added);
        assert!(report.entities[1].lifecycle.inferred_removed);
        assert_eq!(report.total_entities_observed, 3);
    }

    #[test]
    fn test_pagination_and_sorting() {
        let a1 = json!({"spec": {"x": 1}});
        let a2 = json!({"spec": {"x": 2}});
        let a3 = json!({"spec": {"x": 3}});
        let file = structured(&[
            ("2024-01-01T10:00:00Z", "ConfigMap", "a", a1.clone()),
            ("2024-01-01T10:01:00Z", "ConfigMap", "a", a2.clone()),
            ("2024-01-01T10:00:00Z", "ConfigMap", "b", a1.clone()),
            ("2024-01-01T10:01:00Z", "ConfigMap", "b", a2),
            ("2024-01-01T10:02:00Z", "ConfigMap", "b", a3),
        ]);
        let query = ChangeQuery {
            sort_by: ChangeSort::ChangeCount,
            limit: Some(1),
            ..ChangeQuery::default()
        };
        let report = analyze_changes(
            file.path(),
            &query,
            &ChangesConfig::default(),
            &AccessPolicy::permissive(),
            &Deadline::none(),
        )
        .unwrap();
        assert_eq!(report.total_entities, 2);
        assert_eq!(report.returned_count, 1);
        assert_eq!(report.entities[0].name, "b");
        assert_eq!(report.total_change_events, 3);
        assert_eq!(report.returned_change_events, 2);
    }

    #[test]
    fn test_expired_deadline_returns_partial() {
        let file = structured(&[("2024-01-01T10:00:00Z", "ConfigMap", "a", json!({"data": {"k": "v"}}))]);
        let deadline = Deadline::none();
        deadline.cancel();
        let report = analyze_changes(
            file.path(),
            &ChangeQuery::default(),
            &ChangesConfig::default(),
            &AccessPolicy::permissive(),
            &deadline,
        )
        .unwrap();
        assert!(report.timed_out);
        assert!(report.entities.is_empty());
    }

    #[test]
    fn test_error_document_has_zero_counts() {
        let query = ChangeQuery::default();
        let missing = Path::new("/nonexistent/k8s_objects.tsv");
        let err = analyze_changes(
            missing,
            &query,
            &ChangesConfig::default(),
            &AccessPolicy::permissive(),
            &Deadline::none(),
        )
        .unwrap_err();
        let doc = serde_json::to_value(ChangeReport::from_error(missing, &query, &err)).unwrap();
        assert_eq!(doc["category"], json!("input_file"));
        assert_eq!(doc["total_change_events"], json!(0));
        assert_eq!(doc["entities"], json!([]));
    }

    #[test]
    fn test_get_spec_latest_and_ambiguity() {
        let file = structured(&[
            ("2024-01-01T10:00:00Z", "Deployment", "cart", json!({"metadata": {"name": "cart"}, "spec": {"replicas": 1}})),
            ("2024-01-01T10:05:00Z", "Deployment", "cart", json!({"metadata": {"name": "cart"}, "spec": {"replicas": 3}})),
            ("2024-01-01T10:00:00Z", "Service", "cart", json!({"spec": {"ports": [{"port": 80}]}})),
        ]);
        let request = SpecRequest {
            include_metadata: false,
            ..SpecRequest::latest("otel-demo/Deployment/cart")
        };
        let report = get_spec(file.path(), &request, &AccessPolicy::permissive()).unwrap();
        assert_eq!(report.identifier_format, IdentifierFormat::NamespaceKindName);
        assert_eq!(report.latest().unwrap().to_json(), json!({"spec": {"replicas": 3}}));
        assert_eq!(report.entities[0].observation_count, 2);
        assert!(report.warning.is_none());

        let ambiguous = get_spec(file.path(), &SpecRequest::latest("cart"), &AccessPolicy::permissive()).unwrap();
        assert_eq!(ambiguous.matched_entities.len(), 2);
        assert!(ambiguous.warning.is_some());
    }

    #[test]
    fn test_get_spec_no_match_lists_kinds() {
        let file = structured(&[("2024-01-01T10:00:00Z", "Deployment", "cart", json!({"spec": {}}))]);
        let err = get_spec(file.path(), &SpecRequest::latest("Secret/nope"), &AccessPolicy::permissive()).unwrap_err();
        let payload = err.to_payload();
        assert_eq!(payload["available_kinds"], json!(["Deployment"]));
        assert_eq!(payload["sample_entities"], json!(["otel-demo/Deployment/cart"]));
    }
}
