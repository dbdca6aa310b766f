//! # Cerebro Forensics - Offline Incident Analysis
//!
//! Turns an offline snapshot of a Kubernetes cluster (object specs, events,
//! metrics, logs, traces, alerts) into structured answers to the questions an
//! SRE asks during an incident: what changed, who depends on what, and which
//! call path regressed around a given moment.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          CEREBRO FORENSICS ENGINE                            │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  INGEST → QUERY PIPELINE → { TOPOLOGY | SPEC DIFF | TRACE PATHS } → CONTEXT │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every analyzer is a stateless function over files read fresh from disk and
//! returns a self-contained, serialisable document. Only the context
//! aggregator calls more than one analyzer.
//!
//! ## Author
//!
//! AIOps Team

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod constants;
pub mod error;
pub mod config;
pub mod logging;
pub mod deadline;
pub mod value;
pub mod timeutil;
pub mod identity;
pub mod ingest;
pub mod expr;
pub mod pipeline;
pub mod events;
pub mod alerts;
pub mod metrics;
pub mod logs;
pub mod topology;
pub mod specdiff;
pub mod changes;
pub mod stats;
pub mod traces;
pub mod context;

pub use config::ForensicsConfig;
pub use deadline::Deadline;
pub use error::{ForensicsError, ForensicsResult};
pub use identity::{EntityId, EntityQuery};
pub use value::Value;
