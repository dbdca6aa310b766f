// ============================================================================
// SECTION 23: CLI & MAIN ENTRY POINT
// ============================================================================
// Command-line front end. Every analysis command writes one JSON document to
// stdout; logs go to stderr. Analysis failures print the error payload and
// exit with status 1.
// ============================================================================

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result as AnyhowResult};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use cerebro_forensics::alerts::{alert_summary, analyze_alerts, AlertRequest, AlertSummaryRequest};
use cerebro_forensics::changes::{analyze_changes, get_spec, ChangeQuery, ChangeReport, SpecRequest};
use cerebro_forensics::constants::{ENGINE_FULL_NAME, ENGINE_NAME, ENGINE_VERSION};
use cerebro_forensics::context::{aggregate_context, ContextRequest};
use cerebro_forensics::error::InputError;
use cerebro_forensics::events::{analyze_events, EventRequest};
use cerebro_forensics::ingest::AccessPolicy;
use cerebro_forensics::logging::init_logging;
use cerebro_forensics::logs::{analyze_logs, ExactMatchClusterer, LogRequest};
use cerebro_forensics::metrics::{analyze_metrics, metric_anomalies, AnomalyRequest, MetricRequest};
use cerebro_forensics::pipeline::parse_choice;
use cerebro_forensics::topology::{analyze_topology_file, build_topology_files};
use cerebro_forensics::traces::{analyze_trace_paths, service_error_tree, ErrorTreeRequest, TraceRequest};
use cerebro_forensics::{Deadline, ForensicsConfig, ForensicsError, ForensicsResult, Value};

// ----------------------------------------------------------------------------
// 23.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Cerebro Forensics CLI
#[derive(Parser, Debug)]
#[command(
    name = "forensics",
    author = "AIOps Team",
    version,
    about = "Offline incident analysis over Kubernetes observability snapshots",
    long_about = "Cerebro Forensics answers incident questions over a captured snapshot: \
                  topology, events, alerts, metrics, logs, traces, spec changes and a \
                  paginated per-entity context document."
)]
pub struct Cli {
    /// Configuration file path (default: forensics.toml when present)
    #[arg(short, long, env = "FORENSICS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level override
    #[arg(short, long, env = "FORENSICS_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "FORENSICS_DEBUG", global = true)]
    pub debug: bool,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pub pretty: bool,

    /// Wall-clock budget such as `30s`
    #[arg(long, value_parser = humantime::parse_duration, global = true)]
    pub deadline: Option<Duration>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
pub struct TimeArgs {
    /// Window start (RFC 3339 or `YYYY-MM-DD HH:MM:SS`)
    #[arg(long)]
    pub start_time: Option<String>,

    /// Window end (RFC 3339 or `YYYY-MM-DD HH:MM:SS`)
    #[arg(long)]
    pub end_time: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct QueryArgs {
    /// Column filter `column=value`, repeatable
    #[arg(short, long = "filter", value_parser = parse_filter)]
    pub filters: Vec<(String, String)>,

    /// Group by column, repeatable
    #[arg(short, long = "group-by")]
    pub group_by: Vec<String>,

    /// Aggregation applied per group
    #[arg(short, long)]
    pub agg: Option<String>,

    /// Sort column, `-column` for descending
    #[arg(short, long)]
    pub sort_by: Option<String>,

    #[arg(long, default_value_t = 0)]
    pub offset: usize,

    /// Rows per page (0 = all)
    #[arg(long)]
    pub limit: Option<usize>,
}

impl QueryArgs {
    fn filter_map(&self) -> BTreeMap<String, Value> {
        self.filters
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect()
    }
}

fn parse_filter(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
        _ => Err(format!("expected column=value, got '{}'", raw)),
    }
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show engine version and build info
    Version,

    /// Build the topology graph from an architecture document and object inventory
    BuildTopology {
        /// Architecture JSON
        #[arg(long)]
        arch: PathBuf,
        /// Object inventory TSV
        #[arg(long)]
        inventory: PathBuf,
        /// Write the graph here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Relationships, call chains and backing infrastructure of an entity
    Topology {
        /// Topology graph JSON
        #[arg(long)]
        file: PathBuf,
        /// `namespace/kind/name`, `kind/name` or `name`
        entity: String,
    },

    /// Query Kubernetes events
    Events {
        /// Events TSV
        #[arg(long)]
        file: PathBuf,
        #[command(flatten)]
        query: QueryArgs,
        #[command(flatten)]
        time: TimeArgs,
    },

    /// Query alert snapshots
    Alerts {
        /// Directory of alert snapshots
        #[arg(long)]
        dir: PathBuf,
        /// `snapshot` or `activeAt`
        #[arg(long, default_value = "snapshot")]
        time_basis: String,
        #[command(flatten)]
        query: QueryArgs,
        #[command(flatten)]
        time: TimeArgs,
    },

    /// Summarise alert incidents across snapshots
    AlertSummary {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value = "snapshot")]
        time_basis: String,
        /// Only alerts in this state
        #[arg(long)]
        state: Option<String>,
        /// Only incidents lasting at least this many minutes
        #[arg(long)]
        min_duration_min: Option<f64>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[command(flatten)]
        time: TimeArgs,
    },

    /// Query metric files
    Metrics {
        /// Directory of metric TSVs
        #[arg(long)]
        dir: PathBuf,
        /// Single object; batch mode over --pattern when absent
        #[arg(long)]
        object: Option<String>,
        /// Batch selector such as `pod/frontend*`
        #[arg(long, default_value = "*")]
        pattern: String,
        /// Metric name, repeatable
        #[arg(short, long = "metric")]
        metrics: Vec<String>,
        /// Derived column expression `name = expr`
        #[arg(long)]
        eval: Option<String>,
        #[arg(short, long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, String)>,
        #[arg(short, long)]
        group_by: Option<String>,
        #[arg(short, long)]
        agg: Option<String>,
        #[arg(short, long)]
        sort_by: Option<String>,
        /// `compact` or `raw`
        #[arg(long, default_value = "compact")]
        verbosity: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        include_tags: bool,
        #[arg(long)]
        include_buckets: bool,
        #[command(flatten)]
        time: TimeArgs,
    },

    /// Statistical outliers in the metric files of one object
    MetricAnomalies {
        #[arg(long)]
        dir: PathBuf,
        object: String,
        #[arg(long)]
        metric: Option<String>,
        /// Include every row of each file
        #[arg(long)]
        raw: bool,
        #[command(flatten)]
        time: TimeArgs,
    },

    /// Log lines or log patterns
    Logs {
        /// Logs TSV
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        entity: Option<String>,
        #[arg(long)]
        service: Option<String>,
        /// Comma separated severities
        #[arg(long)]
        severity: Option<String>,
        #[arg(long)]
        contains: Option<String>,
        /// Return raw lines instead of patterns
        #[arg(long)]
        no_patterns: bool,
        #[arg(long)]
        max_patterns: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[command(flatten)]
        time: TimeArgs,
    },

    /// Compare service paths before and after a pivot time
    Traces {
        /// Traces TSV
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        span_kind: Option<String>,
        #[arg(long)]
        pivot_time: Option<String>,
        /// Window half-width such as `5m`
        #[arg(long)]
        delta: Option<String>,
        #[arg(long)]
        error_threshold: Option<f64>,
        #[arg(long)]
        latency_threshold: Option<f64>,
    },

    /// Error counts and downstream services per service
    TraceErrors {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        service: Option<String>,
        #[command(flatten)]
        time: TimeArgs,
    },

    /// Latest (or every) observed spec of an entity
    Spec {
        /// Objects TSV
        #[arg(long)]
        file: PathBuf,
        entity: String,
        #[arg(long)]
        all_observations: bool,
        #[arg(long)]
        no_metadata: bool,
    },

    /// Spec diffs and lifecycle changes per entity
    SpecChanges {
        /// Objects TSV
        #[arg(long)]
        file: PathBuf,
        /// Restrict to one entity
        #[arg(long)]
        entity: Option<String>,
        /// `observation` or `effective_update`
        #[arg(long)]
        time_basis: Option<String>,
        /// `none`, `window` or `metadata`
        #[arg(long)]
        lifecycle: Option<String>,
        /// `global` or `per_kind`
        #[arg(long)]
        scope: Option<String>,
        #[arg(long, value_parser = humantime::parse_duration)]
        removal_grace: Option<Duration>,
        #[arg(long)]
        min_missing_cycles: Option<usize>,
        #[arg(long)]
        max_changes_per_diff: Option<usize>,
        #[arg(long)]
        include_no_change: bool,
        #[arg(long)]
        no_reference_spec: bool,
        #[arg(long)]
        no_change_items: bool,
        /// `entity` or `change_count`
        #[arg(long, default_value = "entity")]
        sort_by: String,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long)]
        limit: Option<usize>,
        #[command(flatten)]
        time: TimeArgs,
    },

    /// Paginated context document for one entity
    Context {
        entity: String,
        /// Snapshot directory (default: general.snapshot_dir)
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,
        #[arg(long)]
        topology_file: Option<PathBuf>,
        /// 1 = entity, 2.. = dependencies, 0 = everything
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long)]
        deps_per_page: Option<usize>,
        #[command(flatten)]
        time: TimeArgs,
    },
}

// ----------------------------------------------------------------------------
// 23.2 Admin Handlers
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: Option<&Path>, verbose: bool) -> AnyhowResult<()> {
    match ForensicsConfig::load_or_default(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid");
            if verbose {
                println!("{}", toml::to_string_pretty(&config).context("Failed to serialize configuration")?);
            }
            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed: {}", e);
            Err(e.into())
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config_str = ForensicsConfig::generate_default_config();
    match output {
        Some(path) => {
            fs::write(path, &config_str).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }
    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("🧠 {} v{} ({})", ENGINE_FULL_NAME, ENGINE_VERSION, ENGINE_NAME);
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
}

// ----------------------------------------------------------------------------
// 23.3 Analysis Dispatch
// ----------------------------------------------------------------------------

fn to_doc<T: Serialize>(value: &T) -> ForensicsResult<JsonValue> {
    Ok(serde_json::to_value(value)?)
}

fn run_command(
    command: Commands,
    config: &ForensicsConfig,
    policy: &AccessPolicy,
    deadline: &Deadline,
) -> ForensicsResult<JsonValue> {
    let default_limit = config.pipeline.default_limit;
    match command {
        Commands::BuildTopology { arch, inventory, output } => {
            let graph = build_topology_files(&arch, &inventory, &config.topology, policy)?;
            match output {
                Some(path) => {
                    graph.save(&path)?;
                    Ok(json!({
                        "output": path.display().to_string(),
                        "nodes": graph.nodes.len(),
                        "edges": graph.edges.len(),
                        "relations": graph.relation_counts(),
                    }))
                }
                None => to_doc(&graph),
            }
        }
        Commands::Topology { file, entity } => {
            to_doc(&analyze_topology_file(&file, &entity, &config.topology, policy)?)
        }
        Commands::Events { file, query, time } => {
            let request = EventRequest {
                filters: query.filter_map(),
                group_by: query.group_by.clone(),
                agg: query.agg.clone(),
                sort_by: query.sort_by.clone(),
                offset: query.offset,
                limit: query.limit.unwrap_or(default_limit),
                start_time: time.start_time,
                end_time: time.end_time,
            };
            to_doc(&analyze_events(&file, &request, policy)?)
        }
        Commands::Alerts { dir, time_basis, query, time } => {
            let request = AlertRequest {
                time_basis: parse_choice("time_basis", &time_basis)?,
                filters: query.filter_map(),
                group_by: query.group_by.clone(),
                agg: query.agg.clone(),
                sort_by: query.sort_by.clone(),
                offset: query.offset,
                limit: query.limit.unwrap_or(default_limit),
                start_time: time.start_time,
                end_time: time.end_time,
            };
            to_doc(&analyze_alerts(&dir, &request, policy)?)
        }
        Commands::AlertSummary {
            dir,
            time_basis,
            state,
            min_duration_min,
            limit,
            time,
        } => {
            let request = AlertSummaryRequest {
                time_basis: parse_choice("time_basis", &time_basis)?,
                state_filter: state,
                min_duration_min,
                limit,
                start_time: time.start_time,
                end_time: time.end_time,
            };
            to_doc(&alert_summary(&dir, &request, policy)?)
        }
        Commands::Metrics {
            dir,
            object,
            pattern,
            metrics,
            eval,
            filters,
            group_by,
            agg,
            sort_by,
            verbosity,
            limit,
            include_tags,
            include_buckets,
            time,
        } => {
            let request = MetricRequest {
                object,
                object_pattern: pattern,
                metric_names: metrics,
                eval,
                filters: filters.into_iter().map(|(k, v)| (k, Value::from(v.as_str()))).collect(),
                group_by,
                agg,
                verbosity: parse_choice("verbosity", &verbosity)?,
                limit,
                sort_by,
                include_tags,
                include_buckets,
                start_time: time.start_time,
                end_time: time.end_time,
                ..MetricRequest::default()
            };
            to_doc(&analyze_metrics(&dir, &request, config.pipeline.metric_limit, policy)?)
        }
        Commands::MetricAnomalies {
            dir,
            object,
            metric,
            raw,
            time,
        } => {
            let request = AnomalyRequest {
                object,
                metric_name_filter: metric,
                start_time: time.start_time,
                end_time: time.end_time,
                raw_content: raw,
            };
            to_doc(&metric_anomalies(&dir, &request, policy)?)
        }
        Commands::Logs {
            file,
            entity,
            service,
            severity,
            contains,
            no_patterns,
            max_patterns,
            offset,
            limit,
            time,
        } => {
            let request = LogRequest {
                entity,
                service_name: service,
                severity_filter: severity,
                body_contains: contains,
                start_time: time.start_time,
                end_time: time.end_time,
                pattern_analysis: !no_patterns,
                max_patterns: max_patterns.unwrap_or(config.context.max_log_patterns),
                offset,
                limit,
            };
            to_doc(&analyze_logs(&file, &request, &ExactMatchClusterer, policy)?)
        }
        Commands::Traces {
            file,
            service,
            span_kind,
            pivot_time,
            delta,
            error_threshold,
            latency_threshold,
        } => {
            let request = TraceRequest {
                service_name: service,
                span_kind,
                pivot_time,
                delta,
                error_threshold,
                latency_threshold,
            };
            to_doc(&analyze_trace_paths(&file, &request, &config.traces, policy, deadline)?)
        }
        Commands::TraceErrors { file, service, time } => {
            let request = ErrorTreeRequest {
                service_name: service,
                start_time: time.start_time,
                end_time: time.end_time,
            };
            to_doc(&service_error_tree(&file, &request, policy)?)
        }
        Commands::Spec {
            file,
            entity,
            all_observations,
            no_metadata,
        } => {
            let request = SpecRequest {
                identifier: entity,
                include_metadata: !no_metadata,
                all_observations,
            };
            to_doc(&get_spec(&file, &request, policy)?)
        }
        Commands::SpecChanges {
            file,
            entity,
            time_basis,
            lifecycle,
            scope,
            removal_grace,
            min_missing_cycles,
            max_changes_per_diff,
            include_no_change,
            no_reference_spec,
            no_change_items,
            sort_by,
            offset,
            limit,
            time,
        } => {
            let query = ChangeQuery {
                identifier: entity,
                start_time: time.start_time,
                end_time: time.end_time,
                time_basis: time_basis.map(|v| parse_choice("time_basis", &v)).transpose()?,
                lifecycle: lifecycle.map(|v| parse_choice("lifecycle", &v)).transpose()?,
                scope: scope.map(|v| parse_choice("scope", &v)).transpose()?,
                removal_grace,
                min_missing_cycles,
                max_changes_per_diff,
                include_no_change,
                include_reference_spec: !no_reference_spec,
                include_change_items: !no_change_items,
                sort_by: parse_choice("sort_by", &sort_by)?,
                offset,
                limit,
            };
            match analyze_changes(&file, &query, &config.changes, policy, deadline) {
                Ok(report) => to_doc(&report),
                Err(err) => {
                    warn!(target: "forensics::cli", error = %err, "Spec change analysis failed");
                    to_doc(&ChangeReport::from_error(&file, &query, &err))
                }
            }
        }
        Commands::Context {
            entity,
            snapshot_dir,
            topology_file,
            page,
            deps_per_page,
            time,
        } => {
            let snapshot_dir = snapshot_dir
                .or_else(|| config.general.snapshot_dir.clone())
                .ok_or_else(|| InputError::MissingArgument {
                    name: "snapshot_dir".into(),
                })?;
            let request = ContextRequest {
                entity,
                snapshot_dir,
                topology_file,
                start_time: time.start_time,
                end_time: time.end_time,
                page,
                deps_per_page,
            };
            to_doc(&aggregate_context(&request, config, policy, deadline)?)
        }
        Commands::Validate { .. } | Commands::GenerateConfig { .. } | Commands::Version => {
            Ok(JsonValue::Null)
        }
    }
}

fn render(doc: &JsonValue, pretty: bool) -> String {
    let rendered = if pretty {
        serde_json::to_string_pretty(doc)
    } else {
        serde_json::to_string(doc)
    };
    rendered.unwrap_or_else(|e| json!({"error": e.to_string(), "category": "serialization"}).to_string())
}

// ----------------------------------------------------------------------------
// 23.4 Main
// ----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> AnyhowResult<ExitCode> {
    let cli = Cli::parse();

    // Handle subcommands that don't need full initialization
    match &cli.command {
        Commands::Version => {
            handle_version();
            return Ok(ExitCode::SUCCESS);
        }
        Commands::GenerateConfig { output } => {
            handle_generate_config(output.as_deref())?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Validate { verbose } => {
            handle_validate(cli.config.as_deref(), *verbose)?;
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    let config = ForensicsConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    let _guard = init_logging(&logging_config)?;

    let policy = config.access.policy()?;
    let pretty = cli.pretty || config.general.pretty_output;
    let deadline = Deadline::from_budget(cli.deadline.or(config.general.deadline));
    debug!(target: "forensics::cli", budget = ?deadline.remaining(), "Request deadline set");

    let token = deadline.token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(target: "forensics::cli", "Interrupted, cancelling request");
            token.cancel();
        }
    });

    info!(target: "forensics::cli", version = ENGINE_VERSION, "{} starting", ENGINE_FULL_NAME);
    let command = cli.command;
    let result =
        tokio::task::spawn_blocking(move || run_command(command, &config, &policy, &deadline)).await?;

    match result {
        Ok(doc) => {
            println!("{}", render(&doc, pretty));
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            warn!(target: "forensics::cli", category = err.category(), error = %err, "Request failed");
            println!("{}", render(&err.to_payload(), pretty));
            Ok(ExitCode::FAILURE)
        }
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("namespace=otel-demo", Some(("namespace", "otel-demo")) ; "simple")]
    #[test_case("reason = BackOff", Some(("reason", "BackOff")) ; "trimmed")]
    #[test_case("message=a=b", Some(("message", "a=b")) ; "value keeps equals")]
    #[test_case("=x", None ; "empty column")]
    #[test_case("novalue", None ; "no separator")]
    fn test_parse_filter(raw: &str, expected: Option<(&str, &str)>) {
        let parsed = parse_filter(raw).ok();
        assert_eq!(
            parsed,
            expected.map(|(k, v)| (k.to_string(), v.to_string()))
        );
    }

    #[test]
    fn test_cli_parses_context_command() {
        let cli = Cli::try_parse_from([
            "forensics",
            "--pretty",
            "--deadline",
            "30s",
            "context",
            "otel-demo/Service/checkout",
            "--snapshot-dir",
            "/tmp/snap",
            "--page",
            "2",
        ])
        .unwrap();
        assert!(cli.pretty);
        assert_eq!(cli.deadline, Some(Duration::from_secs(30)));
        match cli.command {
            Commands::Context { entity, page, snapshot_dir, .. } => {
                assert_eq!(entity, "otel-demo/Service/checkout");
                assert_eq!(page, 2);
                assert_eq!(snapshot_dir, Some(PathBuf::from("/tmp/snap")));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_context_without_snapshot_dir_is_argument_error() {
        let cli = Cli::try_parse_from(["forensics", "context", "cart"]).unwrap();
        let err = run_command(
            cli.command,
            &ForensicsConfig::default(),
            &AccessPolicy::permissive(),
            &Deadline::none(),
        )
        .unwrap_err();
        assert_eq!(err.category(), "input_argument");
    }

    #[test]
    fn test_spec_changes_failure_returns_error_document() {
        let cli = Cli::try_parse_from(["forensics", "spec-changes", "--file", "/nonexistent/objects.tsv"]).unwrap();
        let doc = run_command(
            cli.command,
            &ForensicsConfig::default(),
            &AccessPolicy::permissive(),
            &Deadline::none(),
        )
        .unwrap();
        assert_eq!(doc["category"], "input_file");
        assert_eq!(doc["total_change_events"], 0);
    }

    #[test]
    fn test_bad_choice_is_argument_error() {
        let cli = Cli::try_parse_from(["forensics", "alerts", "--dir", "/tmp", "--time-basis", "wallclock"]).unwrap();
        let err = run_command(
            cli.command,
            &ForensicsConfig::default(),
            &AccessPolicy::permissive(),
            &Deadline::none(),
        )
        .unwrap_err();
        assert_eq!(err.category(), "input_argument");
    }
}
