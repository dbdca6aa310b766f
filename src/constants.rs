// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Global constants that define defaults and limits of the engine.
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "cerebro-forensics";
pub const ENGINE_FULL_NAME: &str = "Cerebro Forensics Engine";

/// Prefix for environment variable overrides (`FORENSICS_TRACES__ERROR_THRESHOLD=20`)
pub const ENV_PREFIX: &str = "FORENSICS_";

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "forensics.toml";

// ----------------------------------------------------------------------------
// Query Pipeline
// ----------------------------------------------------------------------------

/// Distinct values kept per column by the `list` aggregation
pub const LIST_AGG_MAX_VALUES: usize = 10;

/// Maximum accepted page size (0 still means unlimited)
pub const MAX_PAGE_LIMIT: usize = 100_000;

/// Default row limit for compact metric output
pub const DEFAULT_METRIC_LIMIT: usize = 200;

/// Warnings kept verbatim in an ingest report; the rest are only counted
pub const MAX_REPORTED_WARNINGS: usize = 20;

// ----------------------------------------------------------------------------
// Topology
// ----------------------------------------------------------------------------

/// Namespace logical services are resolved in
pub const DEFAULT_APP_NAMESPACE: &str = "otel-demo";

/// Maximum DFS depth when enumerating call chains
pub const MAX_CHAIN_DEPTH: usize = 10;

/// Maximum chains reported per direction
pub const MAX_CHAINS: usize = 20;

/// Maximum candidate ids listed when an entity cannot be resolved
pub const MAX_SUGGESTED_ENTITIES: usize = 20;

/// Kind preference when several nodes share a name
pub const KIND_PRIORITY: [&str; 5] = ["App", "Service", "Deployment", "Pod", "ReplicaSet"];

/// Services whose names inside plain env values imply a runtime dependency
pub const DEFAULT_TELEMETRY_SERVICES: [&str; 5] =
    ["otel-collector", "flagd", "kafka", "valkey-cart", "postgresql"];

/// Logical service name -> concrete Kubernetes Service name
pub const DEFAULT_SERVICE_ALIASES: [(&str, &str); 20] = [
    ("ad-service", "ad"),
    ("cart-service", "cart"),
    ("checkout-service", "checkout"),
    ("currency-service", "currency"),
    ("product-catalog-service", "product-catalog"),
    ("recommendation-service", "recommendation"),
    ("shipping-service", "shipping"),
    ("product-reviews-service", "product-reviews"),
    ("email-service", "email"),
    ("payment-service", "payment"),
    ("quote-service", "quote"),
    ("valkey", "valkey-cart"),
    ("frontend-proxy", "frontend-proxy"),
    ("load-generator", "load-generator"),
    ("frontend", "frontend"),
    ("kafka", "kafka"),
    ("postgresql", "postgresql"),
    ("accounting-service", "accounting"),
    ("fraud-detection-service", "fraud-detection"),
    ("opentelemetry-collector", "otel-collector"),
];

// ----------------------------------------------------------------------------
// Spec Diff & Lifecycle
// ----------------------------------------------------------------------------

/// Default cap on diff items kept per change window
pub const DEFAULT_MAX_CHANGES_PER_DIFF: usize = 50;

/// Upper bound for `max_changes_per_diff`
pub const MAX_CHANGES_PER_DIFF_LIMIT: usize = 10_000;

/// Grace period before a vanished entity counts as removed (raw snapshots)
pub const DEFAULT_REMOVAL_GRACE_SECS: u64 = 300;

/// Later observation cycles required before a vanished entity counts as removed
pub const DEFAULT_MIN_MISSING_CYCLES: usize = 2;

/// Characters of a spec shown inline before it is replaced by a preview
pub const SPEC_PREVIEW_CHARS: usize = 2000;

// ----------------------------------------------------------------------------
// Traces
// ----------------------------------------------------------------------------

/// Default half-width of the pre/post comparison windows
pub const DEFAULT_TRACE_DELTA_SECS: u64 = 300;

/// Default error-rate change (percentage points) that flags a path
pub const DEFAULT_ERROR_THRESHOLD_PCT: f64 = 10.0;

/// Default p99 latency change (percent) that flags a path
pub const DEFAULT_LATENCY_THRESHOLD_PCT: f64 = 10.0;

/// Error-rate change / post error rate above which a path is critical
pub const CRITICAL_ERROR_PCT: f64 = 50.0;

/// p99 latency change above which a path is critical
pub const CRITICAL_LATENCY_PCT: f64 = 100.0;

/// Maximum entries in the `all_paths` listing
pub const MAX_LISTED_PATHS: usize = 50;

/// Error message samples kept per hop
pub const MAX_ERROR_SAMPLES: usize = 3;

/// Characters kept per error message sample
pub const ERROR_MESSAGE_MAX_CHARS: usize = 200;

// ----------------------------------------------------------------------------
// Context Aggregation
// ----------------------------------------------------------------------------

/// Dependencies rendered per context page
pub const DEFAULT_DEPS_PER_PAGE: usize = 3;

/// Backing pods inspected for the main entity's dependencies
pub const MAX_ENTITY_PODS_INSPECTED: usize = 3;

/// Backing pods inspected per dependency for transitive dependencies
pub const MAX_DEPENDENCY_PODS_INSPECTED: usize = 2;

/// Default number of log clusters returned
pub const DEFAULT_MAX_LOG_PATTERNS: usize = 50;
