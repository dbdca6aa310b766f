// ============================================================================
// SECTION 22: CONTEXT AGGREGATION
// ============================================================================
// One paginated document per entity: topology, events, alerts, traces,
// metric anomalies, log patterns, spec and spec changes for the entity, then
// events, alerts and change counts for its dependencies. Section failures are
// recorded next to the section and never abort the document.
// ============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alerts::{analyze_alerts, AlertRequest};
use crate::changes::{analyze_loaded_changes, spec_from_loaded, ChangeQuery, ChangeReport, SpecRequest};
use crate::config::ForensicsConfig;
use crate::constants::{MAX_DEPENDENCY_PODS_INSPECTED, MAX_ENTITY_PODS_INSPECTED};
use crate::deadline::Deadline;
use crate::error::{ForensicsError, ForensicsResult, InputError};
use crate::events::{analyze_events, EventRequest};
use crate::identity::{name_variants, EntityQuery, IdentifierFormat};
use crate::ingest::{load_records, AccessPolicy, Ingested, Row, SchemaHints};
use crate::logging::PerfTimer;
use crate::logs::{analyze_logs, ExactMatchClusterer, LogReport, LogRequest};
use crate::metrics::{metric_anomalies, AnomalyReport, AnomalyRequest};
use crate::pipeline::Paginated;
use crate::timeutil::{format_timestamp, TimeWindow};
use crate::topology::{analyze_topology, TopologyGraph, TopologyReport};
use crate::traces::{analyze_spans, load_spans, TraceReport, TraceRequest};
use crate::value::Value;

const MAX_RELATED_ALERTS: usize = 10;
const MAX_DEPENDENCY_ITEMS: usize = 5;

// ----------------------------------------------------------------------------
// 22.1 Snapshot Discovery
// ----------------------------------------------------------------------------

/// Files of a snapshot directory, located by name pattern.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SnapshotFiles {
    pub events_file: Option<PathBuf>,
    pub objects_file: Option<PathBuf>,
    pub traces_file: Option<PathBuf>,
    pub logs_file: Option<PathBuf>,
    pub alerts_dir: Option<PathBuf>,
    pub metrics_dir: Option<PathBuf>,
    pub topology_file: Option<PathBuf>,
}

fn first_match(dir: &Path, pattern: &str) -> Option<PathBuf> {
    let full = dir.join(pattern);
    let mut files: Vec<PathBuf> = glob::glob(&full.to_string_lossy())
        .map(|paths| paths.filter_map(Result::ok).filter(|p| p.is_file()).collect())
        .unwrap_or_default();
    files.sort();
    files.into_iter().next()
}

impl SnapshotFiles {
    pub fn discover(dir: &Path) -> Self {
        let escaped = PathBuf::from(glob::Pattern::escape(&dir.to_string_lossy()));
        let subdir = |name: &str| Some(dir.join(name)).filter(|p| p.is_dir());
        Self {
            events_file: first_match(&escaped, "*events*.tsv"),
            objects_file: first_match(&escaped, "*objects*.tsv"),
            traces_file: first_match(&escaped, "*traces*.tsv"),
            logs_file: first_match(&escaped, "*logs*.tsv"),
            alerts_dir: subdir("alerts"),
            metrics_dir: subdir("metrics"),
            topology_file: first_match(&escaped, "*topology*.json"),
        }
    }
}

// ----------------------------------------------------------------------------
// 22.2 Request & Document
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ContextRequest {
    pub entity: String,
    pub snapshot_dir: PathBuf,
    /// Overrides the discovered topology document
    pub topology_file: Option<PathBuf>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    /// 1 = entity, 2.. = dependency batches, 0 = everything
    pub page: usize,
    pub deps_per_page: Option<usize>,
}

impl ContextRequest {
    pub fn new(entity: impl Into<String>, snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            entity: entity.into(),
            snapshot_dir: snapshot_dir.into(),
            topology_file: None,
            start_time: None,
            end_time: None,
            page: 1,
            deps_per_page: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    MainEntity,
    Dependencies,
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeWindowText {
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pagination {
    pub current_page: usize,
    pub total_pages: usize,
    pub total_dependencies: usize,
    pub deps_per_page: usize,
    pub all_pages: bool,
}

impl Pagination {
    fn new(page: usize, dependencies: usize, deps_per_page: usize) -> Self {
        let per_page = deps_per_page.max(1);
        Self {
            current_page: page,
            total_pages: 1 + dependencies.div_ceil(per_page),
            total_dependencies: dependencies,
            deps_per_page: per_page,
            all_pages: page == 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DependencyBreakdown {
    pub direct: Vec<String>,
    pub transitive: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventsSection {
    pub count: usize,
    pub items: Paginated<Row>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertsSection {
    pub total_alerts: usize,
    pub related_to_entity: usize,
    pub items: Vec<Row>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TraceSection {
    Found(Box<TraceReport>),
    Missing { message: String, variants_tried: Vec<String> },
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum LogSection {
    Found(LogReport),
    Empty { total_logs: usize, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpecSection {
    pub entity_id: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub timestamp: Option<String>,
    pub observation_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub spec_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec_preview: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyEvents {
    pub count: usize,
    pub items: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyAlerts {
    pub related: usize,
    pub items: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeCounts {
    pub entities: Vec<String>,
    pub total_change_events: usize,
    pub total_change_item_total: usize,
    pub timed_out: bool,
}

impl From<&ChangeReport> for ChangeCounts {
    fn from(report: &ChangeReport) -> Self {
        Self {
            entities: report.entities.iter().map(|e| e.entity.clone()).collect(),
            total_change_events: report.total_change_events,
            total_change_item_total: report.total_change_item_total,
            timed_out: report.timed_out,
        }
    }
}

/// Sections gathered for one dependency.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DependencyContext {
    pub entity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<DependencyEvents>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alerts: Option<DependencyAlerts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alerts_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec_changes: Option<ChangeCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec_changes_error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

/// The aggregated context document.
#[derive(Debug, Clone, Serialize)]
pub struct ContextReport {
    pub report_id: Uuid,
    pub generated_at: String,
    pub entity: String,
    pub identifier_format: IdentifierFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier_warning: Option<String>,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub page: usize,
    pub snapshot_dir: String,
    pub time_window: TimeWindowText,
    pub files_found: SnapshotFiles,
    pub context_type: ContextType,
    pub pagination: Pagination,
    pub dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency_breakdown: Option<DependencyBreakdown>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<TopologyReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<EventsSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alerts: Option<AlertsSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alerts_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_errors: Option<TraceSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_errors_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_anomalies: Option<AnomalyReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_anomalies_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_patterns: Option<LogSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_patterns_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k8s_spec: Option<SpecSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k8s_spec_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec_changes: Option<ChangeReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec_changes_error: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies_on_page: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub dependency_context: BTreeMap<String, DependencyContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timed_out: bool,
}

// ----------------------------------------------------------------------------
// 22.3 Section Runner
// ----------------------------------------------------------------------------

/// Runs sections in order until the deadline expires.
struct SectionRunner<'d> {
    deadline: &'d Deadline,
    timed_out: bool,
}

impl<'d> SectionRunner<'d> {
    fn new(deadline: &'d Deadline) -> Self {
        Self {
            deadline,
            timed_out: false,
        }
    }

    fn run<T, E: Display>(
        &mut self,
        name: &str,
        value: &mut Option<T>,
        error: &mut Option<String>,
        section: impl FnOnce() -> Result<Option<T>, E>,
    ) {
        if self.timed_out || !self.deadline.allows(name) {
            self.timed_out = true;
            return;
        }
        match section() {
            Ok(v) => *value = v,
            Err(e) => {
                warn!(target: "forensics::context", section = name, error = %e, "Context section failed");
                *error = Some(e.to_string());
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 22.4 Dependencies
// ----------------------------------------------------------------------------

struct Dependencies {
    direct: BTreeSet<String>,
    transitive: BTreeSet<String>,
}

impl Dependencies {
    fn all(&self) -> Vec<String> {
        self.direct.union(&self.transitive).cloned().collect()
    }
}

/// Functional dependencies of `report`, including those of up to `pods` backing pods.
fn deps_with_pods(graph: &TopologyGraph, report: &TopologyReport, pods: usize, config: &ForensicsConfig) -> BTreeSet<String> {
    let mut deps = report.functional_dependencies();
    for pod in report.backing_pods().into_iter().take(pods) {
        if let Ok(pod_report) = analyze_topology(graph, &pod, &config.topology) {
            deps.extend(pod_report.functional_dependencies());
        }
    }
    deps
}

fn collect_dependencies(
    graph: &TopologyGraph,
    report: &TopologyReport,
    query: &EntityQuery,
    config: &ForensicsConfig,
) -> Dependencies {
    let direct = deps_with_pods(graph, report, MAX_ENTITY_PODS_INSPECTED, config);
    let own: BTreeSet<String> = [
        query.raw.clone(),
        query.name.clone(),
        report.entity.clone(),
        format!("{}/{}", report.kind, report.name),
    ]
    .into_iter()
    .collect();

    let mut transitive = BTreeSet::new();
    for dep in &direct {
        let Ok(dep_report) = analyze_topology(graph, dep, &config.topology) else {
            continue;
        };
        for dd in deps_with_pods(graph, &dep_report, MAX_DEPENDENCY_PODS_INSPECTED, config) {
            if !direct.contains(&dd) && !own.contains(&dd) {
                transitive.insert(dd);
            }
        }
    }
    Dependencies { direct, transitive }
}

// ----------------------------------------------------------------------------
// 22.5 Entity Sections
// ----------------------------------------------------------------------------

fn row_mentions(row: &Row, needle: &str) -> bool {
    Value::Map(row.clone()).render().to_lowercase().contains(needle)
}

/// Event filter column for an entity kind.
fn event_filter_column(kind: Option<&str>) -> &'static str {
    match kind {
        Some("Deployment" | "Service" | "App") => "deployment",
        _ => "object_name",
    }
}

/// Short name of a dependency label such as `Service/kafka` or `kafka`.
fn dependency_name(dep: &str) -> &str {
    dep.rsplit('/').next().unwrap_or(dep)
}

struct Aggregator<'a> {
    request: &'a ContextRequest,
    files: &'a SnapshotFiles,
    config: &'a ForensicsConfig,
    policy: &'a AccessPolicy,
    deadline: &'a Deadline,
    objects: Option<Result<Ingested, String>>,
}

impl<'a> Aggregator<'a> {
    fn objects(&self) -> Option<Result<Ingested, String>> {
        self.objects.clone()
    }

    fn event_request(&self, column: &str, value: &str) -> EventRequest {
        EventRequest {
            filters: BTreeMap::from([(column.to_string(), Value::from(value))]),
            start_time: self.request.start_time.clone(),
            end_time: self.request.end_time.clone(),
            ..EventRequest::default()
        }
    }

    fn events(&self, query: &EntityQuery) -> ForensicsResult<Option<EventsSection>> {
        let Some(path) = &self.files.events_file else {
            return Ok(None);
        };
        let column = event_filter_column(query.kind.as_deref());
        let mut found: Option<Paginated<Row>> = None;
        for variant in name_variants(&query.name.to_lowercase()) {
            let report = analyze_events(path, &self.event_request(column, &variant), self.policy)?;
            let hit = report.page.total_count > 0;
            found = Some(report.page);
            if hit {
                break;
            }
        }
        Ok(found.map(|page| EventsSection {
            count: page.total_count,
            items: page,
            truncated: false,
        }))
    }

    fn alert_rows(&self, needle: &str) -> ForensicsResult<Option<(usize, Vec<Row>)>> {
        let Some(dir) = &self.files.alerts_dir else {
            return Ok(None);
        };
        let request = AlertRequest {
            start_time: self.request.start_time.clone(),
            end_time: self.request.end_time.clone(),
            ..AlertRequest::default()
        };
        let page = analyze_alerts(dir, &request, self.policy)?;
        let needle = needle.to_lowercase();
        let related = page.data.into_iter().filter(|row| row_mentions(row, &needle)).collect();
        Ok(Some((page.total_count, related)))
    }

    fn alerts(&self, query: &EntityQuery) -> ForensicsResult<Option<AlertsSection>> {
        Ok(self.alert_rows(&query.name)?.map(|(total, mut related)| {
            let related_count = related.len();
            related.truncate(MAX_RELATED_ALERTS);
            AlertsSection {
                total_alerts: total,
                related_to_entity: related_count,
                items: related,
                truncated: related_count > MAX_RELATED_ALERTS,
            }
        }))
    }

    fn traces(&self, query: &EntityQuery) -> ForensicsResult<Option<TraceSection>> {
        let Some(path) = &self.files.traces_file else {
            return Ok(None);
        };
        let (spans, _) = load_spans(path, self.policy)?;
        let variants = name_variants(&query.name.to_lowercase());
        for variant in &variants {
            let request = TraceRequest {
                service_name: Some(variant.clone()),
                pivot_time: self.request.start_time.clone(),
                ..TraceRequest::default()
            };
            let report = analyze_spans(&spans, &request, &self.config.traces, self.deadline)?;
            if report.total_paths > 0 {
                return Ok(Some(TraceSection::Found(Box::new(report))));
            }
        }
        Ok(Some(TraceSection::Missing {
            message: "No trace data found for entity".into(),
            variants_tried: variants,
        }))
    }

    fn try_metric_target(&self, dir: &Path, object: String) -> ForensicsResult<Option<AnomalyReport>> {
        let request = AnomalyRequest {
            object,
            start_time: self.request.start_time.clone(),
            end_time: self.request.end_time.clone(),
            ..AnomalyRequest::default()
        };
        match metric_anomalies(dir, &request, self.policy) {
            Ok(report) if !report.metrics.is_empty() => Ok(Some(report)),
            Ok(_) => Ok(None),
            Err(ForensicsError::Input(InputError::FileNotFound { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn metric_anomalies(&self, query: &EntityQuery) -> ForensicsResult<Option<AnomalyReport>> {
        let Some(dir) = &self.files.metrics_dir else {
            return Ok(None);
        };
        let kind = query.kind.as_deref().unwrap_or("Unknown");
        if matches!(kind.to_lowercase().as_str(), "pod" | "service") {
            return self.try_metric_target(dir, format!("{}/{}", kind, query.name));
        }

        let variants = name_variants(&query.name.to_lowercase());
        for variant in &variants {
            if let Some(report) = self.try_metric_target(dir, format!("Service/{}", variant))? {
                return Ok(Some(report));
            }
        }
        for variant in &variants {
            let pattern = format!("pod_{}-*.tsv", glob::Pattern::escape(variant));
            let Some(file) = first_match(dir, &pattern) else { continue };
            let stem = file.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
            let Some((_, pod)) = stem.split_once('_') else { continue };
            let pod = pod.strip_suffix("_raw").unwrap_or(pod);
            if let Some(report) = self.try_metric_target(dir, format!("Pod/{}", pod))? {
                return Ok(Some(report));
            }
        }
        Ok(None)
    }

    fn log_patterns(&self) -> ForensicsResult<Option<LogSection>> {
        let Some(path) = &self.files.logs_file else {
            return Ok(None);
        };
        let request = LogRequest {
            entity: Some(self.request.entity.clone()),
            start_time: self.request.start_time.clone(),
            end_time: self.request.end_time.clone(),
            pattern_analysis: true,
            max_patterns: self.config.context.max_log_patterns,
            ..LogRequest::default()
        };
        let report = analyze_logs(path, &request, &ExactMatchClusterer, self.policy)?;
        Ok(Some(if report.total() > 0 {
            LogSection::Found(report)
        } else {
            LogSection::Empty {
                total_logs: 0,
                message: "No logs found for entity in time window".into(),
            }
        }))
    }

    fn spec(&self) -> Result<Option<SpecSection>, String> {
        let Some(objects) = self.objects() else {
            return Ok(None);
        };
        let report = spec_from_loaded(objects?, &SpecRequest::latest(self.request.entity.clone()))
            .map_err(|e| e.to_string())?;
        let Some(entity) = report.entities.into_iter().next() else {
            return Err("Resource not found".into());
        };
        let rendered = entity.latest_spec.to_json().to_string();
        let max = self.config.context.spec_preview_chars;
        let truncated = rendered.chars().count() > max;
        Ok(Some(SpecSection {
            entity_id: entity.entity_id,
            kind: entity.kind,
            namespace: entity.namespace,
            name: entity.name,
            timestamp: entity.last_timestamp,
            observation_count: entity.observation_count,
            spec: (!truncated).then_some(entity.latest_spec),
            spec_truncated: truncated,
            spec_preview: truncated.then(|| format!("{}...", rendered.chars().take(max).collect::<String>())),
        }))
    }

    fn change_query(&self, identifier: &str) -> ChangeQuery {
        ChangeQuery {
            identifier: Some(identifier.to_string()),
            start_time: self.request.start_time.clone(),
            end_time: self.request.end_time.clone(),
            ..ChangeQuery::default()
        }
    }

    fn spec_changes(&self, identifier: &str, query: ChangeQuery) -> Result<Option<ChangeReport>, String> {
        let Some(objects) = self.objects() else {
            return Ok(None);
        };
        analyze_loaded_changes(objects?, &query, &self.config.changes, self.deadline)
            .map(Some)
            .map_err(|e| {
                debug!(target: "forensics::context", identifier, error = %e, "No spec changes");
                e.to_string()
            })
    }

    // ------------------------------------------------------------------------
    // Dependency sections
    // ------------------------------------------------------------------------

    fn dependency_context(&self, dep: &str) -> DependencyContext {
        let mut ctx = DependencyContext {
            entity: dep.to_string(),
            ..DependencyContext::default()
        };
        let mut runner = SectionRunner::new(self.deadline);
        let name = dependency_name(dep);

        runner.run("dependency_events", &mut ctx.events, &mut ctx.events_error, || {
            let Some(path) = &self.files.events_file else {
                return Ok(None);
            };
            let column = if dep.starts_with("Pod/") { "object_name" } else { "deployment" };
            let report = analyze_events(path, &self.event_request(column, name), self.policy)?;
            Ok::<_, ForensicsError>(Some(DependencyEvents {
                count: report.page.total_count,
                items: report.page.data.into_iter().take(MAX_DEPENDENCY_ITEMS).collect(),
            }))
        });
        runner.run("dependency_alerts", &mut ctx.alerts, &mut ctx.alerts_error, || {
            Ok::<_, ForensicsError>(self.alert_rows(name)?.map(|(_, related)| DependencyAlerts {
                related: related.len(),
                items: related.into_iter().take(MAX_DEPENDENCY_ITEMS).collect(),
            }))
        });
        runner.run("dependency_spec_changes", &mut ctx.spec_changes, &mut ctx.spec_changes_error, || {
            let query = ChangeQuery {
                include_reference_spec: false,
                include_change_items: false,
                ..self.change_query(dep)
            };
            self.spec_changes(dep, query).map(|r| r.as_ref().map(ChangeCounts::from))
        });
        ctx.timed_out = runner.timed_out;
        ctx
    }

    fn dependency_contexts(&self, deps: &[String]) -> BTreeMap<String, DependencyContext> {
        let contexts: Vec<DependencyContext> = if self.config.context.parallel_dependencies {
            deps.par_iter().map(|d| self.dependency_context(d)).collect()
        } else {
            deps.iter().map(|d| self.dependency_context(d)).collect()
        };
        contexts.into_iter().map(|c| (c.entity.clone(), c)).collect()
    }
}

// ----------------------------------------------------------------------------
// 22.6 Aggregation
// ----------------------------------------------------------------------------

/// Build the context document for one page.
pub fn aggregate_context(
    request: &ContextRequest,
    config: &ForensicsConfig,
    policy: &AccessPolicy,
    deadline: &Deadline,
) -> ForensicsResult<ContextReport> {
    if request.entity.trim().is_empty() {
        return Err(InputError::MissingArgument { name: "entity".into() }.into());
    }
    if !request.snapshot_dir.is_dir() {
        return Err(InputError::FileNotFound {
            path: request.snapshot_dir.clone(),
        }
        .into());
    }
    policy.check(&request.snapshot_dir)?;
    TimeWindow::parse(request.start_time.as_deref(), request.end_time.as_deref())?;
    let query = EntityQuery::parse(&request.entity)?;
    let timer = PerfTimer::new("aggregate_context");

    let mut files = SnapshotFiles::discover(&request.snapshot_dir);
    if let Some(topology) = &request.topology_file {
        files.topology_file = Some(topology.clone());
    }
    let deps_per_page = request.deps_per_page.unwrap_or(config.context.deps_per_page).max(1);
    let page = request.page;

    let objects = files.objects_file.as_ref().map(|path| {
        load_records(path, &SchemaHints::k8s_objects(), policy).map_err(|e| e.to_string())
    });
    let agg = Aggregator {
        request,
        files: &files,
        config,
        policy,
        deadline,
        objects,
    };

    let mut report = ContextReport {
        report_id: Uuid::now_v7(),
        generated_at: format_timestamp(&Utc::now()),
        entity: request.entity.clone(),
        identifier_format: query.format,
        identifier_warning: query.warning(),
        kind: query.kind.clone().unwrap_or_else(|| "Unknown".into()),
        namespace: query.namespace.clone(),
        name: match &query.namespace {
            Some(ns) => format!("{}/{}", ns, query.name),
            None => query.name.clone(),
        },
        page,
        snapshot_dir: request.snapshot_dir.display().to_string(),
        time_window: TimeWindowText {
            start: request.start_time.clone(),
            end: request.end_time.clone(),
        },
        files_found: files.clone(),
        context_type: match page {
            0 => ContextType::All,
            1 => ContextType::MainEntity,
            _ => ContextType::Dependencies,
        },
        pagination: Pagination::new(page, 0, deps_per_page),
        dependencies: Vec::new(),
        dependency_breakdown: None,
        topology: None,
        topology_error: None,
        events: None,
        events_error: None,
        alerts: None,
        alerts_error: None,
        trace_errors: None,
        trace_errors_error: None,
        metric_anomalies: None,
        metric_anomalies_error: None,
        log_patterns: None,
        log_patterns_error: None,
        k8s_spec: None,
        k8s_spec_error: None,
        spec_changes: None,
        spec_changes_error: None,
        dependencies_on_page: Vec::new(),
        dependency_context: BTreeMap::new(),
        message: None,
        timed_out: false,
    };

    // Topology and dependencies
    let mut runner = SectionRunner::new(deadline);
    let mut dependencies = Vec::new();
    let mut topology = None;
    runner.run("topology", &mut topology, &mut report.topology_error, || {
        let Some(path) = files.topology_file.as_ref().filter(|p| p.exists()) else {
            return Ok(None);
        };
        let graph = TopologyGraph::load(path, policy)?;
        let topo = analyze_topology(&graph, &request.entity, &config.topology)?;
        let deps = collect_dependencies(&graph, &topo, &query, config);
        Ok::<_, ForensicsError>(Some((topo, deps)))
    });
    if let Some((topo, deps)) = topology {
        dependencies = deps.all();
        if page <= 1 {
            report.dependency_breakdown = Some(DependencyBreakdown {
                direct: deps.direct.into_iter().collect(),
                transitive: deps.transitive.into_iter().collect(),
            });
            report.topology = Some(topo);
        }
    }
    report.pagination = Pagination::new(page, dependencies.len(), deps_per_page);

    if page <= 1 {
        runner.run("events", &mut report.events, &mut report.events_error, || agg.events(&query));
        runner.run("alerts", &mut report.alerts, &mut report.alerts_error, || agg.alerts(&query));
        runner.run("trace_errors", &mut report.trace_errors, &mut report.trace_errors_error, || {
            agg.traces(&query)
        });
        runner.run(
            "metric_anomalies",
            &mut report.metric_anomalies,
            &mut report.metric_anomalies_error,
            || agg.metric_anomalies(&query),
        );
        runner.run("log_patterns", &mut report.log_patterns, &mut report.log_patterns_error, || {
            agg.log_patterns()
        });
        runner.run("k8s_spec", &mut report.k8s_spec, &mut report.k8s_spec_error, || agg.spec());
        runner.run("spec_changes", &mut report.spec_changes, &mut report.spec_changes_error, || {
            agg.spec_changes(&request.entity, agg.change_query(&request.entity))
        });

        if page == 0 && !dependencies.is_empty() && !runner.timed_out {
            report.dependency_context = agg.dependency_contexts(&dependencies);
        }
        report.dependencies = dependencies;
    } else {
        let start = (page - 2).saturating_mul(deps_per_page);
        let page_deps: Vec<String> = dependencies.iter().skip(start).take(deps_per_page).cloned().collect();
        if page_deps.is_empty() {
            report.message = Some(format!(
                "No dependencies on page {}. Total pages: {}",
                page, report.pagination.total_pages
            ));
        } else if deadline.allows("dependency_context") {
            report.dependency_context = agg.dependency_contexts(&page_deps);
            report.dependencies_on_page = page_deps;
        } else {
            runner.timed_out = true;
        }
    }

    report.timed_out = runner.timed_out || report.dependency_context.values().any(|c| c.timed_out);

    info!(
        target: "forensics::context",
        entity = %request.entity,
        page,
        dependencies = report.pagination.total_dependencies,
        timed_out = report.timed_out,
        elapsed_ms = timer.stop(),
        "Context aggregated"
    );
    Ok(report)
}

#[cfg(test)]
mod context_tests {
    use super::*;
    use crate::config::TopologyConfig;
    use crate::topology::build_topology;
    use crate::topology::builder::builder_tests::{demo_arch, demo_records};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::fs;
    use std::io::Write;

    fn snapshot() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let graph = build_topology(&demo_arch(), &demo_records(), &TopologyConfig::default()).unwrap();
        graph.save(&dir.path().join("operational_topology.json")).unwrap();

        let mut objects = fs::File::create(dir.path().join("k8s_objects_raw.tsv")).unwrap();
        writeln!(objects, "timestamp\tobject_kind\tobject_name\tobject_namespace\tbody").unwrap();
        writeln!(
            objects,
            "2024-01-01T10:00:00Z\tService\tcheckout\totel-demo\t{}",
            json!({"spec": {"ports": [{"port": 8080}]}})
        )
        .unwrap();
        writeln!(
            objects,
            "2024-01-01T10:05:00Z\tService\tcheckout\totel-demo\t{}",
            json!({"spec": {"ports": [{"port": 9090}]}})
        )
        .unwrap();

        let mut events = fs::File::create(dir.path().join("k8s_events_raw.tsv")).unwrap();
        writeln!(events, "event_time\tobject_kind\tobject_name\tnamespace\treason\tmessage").unwrap();
        writeln!(events, "2024-01-01T10:01:00Z\tPod\tcheckout-7d9f8b6c5d-x2x4q\totel-demo\tBackOff\trestarting").unwrap();
        dir
    }

    #[test]
    fn test_discovery_by_pattern() {
        let dir = snapshot();
        fs::create_dir(dir.path().join("alerts")).unwrap();
        let files = SnapshotFiles::discover(dir.path());
        assert!(files.objects_file.unwrap().ends_with("k8s_objects_raw.tsv"));
        assert!(files.topology_file.unwrap().ends_with("operational_topology.json"));
        assert!(files.alerts_dir.is_some());
        assert!(files.traces_file.is_none());
        assert!(files.metrics_dir.is_none());
    }

    #[test]
    fn test_page_one_collects_entity_sections() {
        let dir = snapshot();
        let request = ContextRequest::new("otel-demo/Service/checkout", dir.path());
        let report = aggregate_context(
            &request,
            &ForensicsConfig::default(),
            &AccessPolicy::permissive(),
            &Deadline::none(),
        )
        .unwrap();

        assert_eq!(report.context_type, ContextType::MainEntity);
        assert_eq!(report.topology.as_ref().unwrap().id, "otel-demo/Service/checkout");
        assert!(report.dependencies.contains(&"kafka".to_string()));
        assert_eq!(report.pagination.total_dependencies, report.dependencies.len());
        assert_eq!(
            report.pagination.total_pages,
            1 + report.dependencies.len().div_ceil(report.pagination.deps_per_page)
        );
        let spec = report.k8s_spec.as_ref().unwrap();
        assert_eq!(spec.observation_count, 2);
        assert!(!spec.spec_truncated);
        assert_eq!(report.spec_changes.as_ref().unwrap().total_change_events, 1);
        assert!(report.events.is_some() || report.events_error.is_some());
        assert!(!report.timed_out);
        assert_eq!(report.report_id.get_version_num(), 7);
    }

    #[test]
    fn test_dependency_page_is_sorted_batch() {
        let dir = snapshot();
        let mut request = ContextRequest::new("otel-demo/Service/checkout", dir.path());
        request.page = 2;
        request.deps_per_page = Some(2);
        let report = aggregate_context(
            &request,
            &ForensicsConfig::default(),
            &AccessPolicy::permissive(),
            &Deadline::none(),
        )
        .unwrap();

        assert_eq!(report.context_type, ContextType::Dependencies);
        assert_eq!(report.dependencies_on_page.len(), 2);
        let mut sorted = report.dependencies_on_page.clone();
        sorted.sort();
        assert_eq!(report.dependencies_on_page, sorted);
        assert_eq!(
            report.dependency_context.keys().cloned().collect::<Vec<_>>(),
            report.dependencies_on_page
        );
        assert!(report.topology.is_none());
    }

    #[test]
    fn test_page_past_end_reports_message() {
        let dir = snapshot();
        let mut request = ContextRequest::new("otel-demo/Service/checkout", dir.path());
        request.page = 99;
        let report = aggregate_context(
            &request,
            &ForensicsConfig::default(),
            &AccessPolicy::permissive(),
            &Deadline::none(),
        )
        .unwrap();
        assert!(report.message.unwrap().starts_with("No dependencies on page 99"));
    }

    #[test]
    fn test_huge_page_number_is_past_end() {
        let dir = snapshot();
        let mut request = ContextRequest::new("otel-demo/Service/checkout", dir.path());
        request.page = usize::MAX;
        let report = aggregate_context(
            &request,
            &ForensicsConfig::default(),
            &AccessPolicy::permissive(),
            &Deadline::none(),
        )
        .unwrap();
        assert_eq!(report.pagination.current_page, usize::MAX);
        assert!(report.dependencies_on_page.is_empty());
        assert!(report.message.unwrap().starts_with("No dependencies on page"));
    }

    #[test]
    fn test_section_errors_do_not_abort() {
        let dir = snapshot();
        fs::write(dir.path().join("operational_topology.json"), "not json").unwrap();
        let request = ContextRequest::new("otel-demo/Service/checkout", dir.path());
        let report = aggregate_context(
            &request,
            &ForensicsConfig::default(),
            &AccessPolicy::permissive(),
            &Deadline::none(),
        )
        .unwrap();
        assert!(report.topology_error.is_some());
        assert!(report.dependencies.is_empty());
        assert!(report.k8s_spec.is_some());
    }

    #[test]
    fn test_expired_deadline_skips_sections() {
        let dir = snapshot();
        let deadline = Deadline::none();
        deadline.cancel();
        let report = aggregate_context(
            &ContextRequest::new("otel-demo/Service/checkout", dir.path()),
            &ForensicsConfig::default(),
            &AccessPolicy::permissive(),
            &deadline,
        )
        .unwrap();
        assert!(report.timed_out);
        assert!(report.topology.is_none());
        assert!(report.k8s_spec.is_none());
    }

    #[test]
    fn test_missing_snapshot_dir_is_input_error() {
        let request = ContextRequest::new("cart", "/nonexistent/snapshot");
        let err = aggregate_context(
            &request,
            &ForensicsConfig::default(),
            &AccessPolicy::permissive(),
            &Deadline::none(),
        )
        .unwrap_err();
        assert_eq!(err.category(), "input_file");
    }
}
