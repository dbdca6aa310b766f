// ============================================================================
// SECTION 17: TOPOLOGY ENGINE
// ============================================================================
// Operational graph built from an architecture document plus an object
// inventory, and the relationship queries run against it.
//
//   builder   architecture + objects → nodes/edges (a set, sorted on output)
//   analyzer  entity → relationships, infrastructure, callers, call chains
// ============================================================================

pub mod analyzer;
pub mod builder;

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};

use crate::error::{ForensicsError, ForensicsResult, TopologyError};
use crate::identity::EntityId;
use crate::ingest::{read_json, AccessPolicy};

pub use analyzer::{analyze_topology, analyze_topology_file, TopologyReport, UsedByInfra};
pub use builder::{build_topology, build_topology_files, TopologyBuilder};

// ----------------------------------------------------------------------------
// 17.1 Graph Types
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Contains,
    Calls,
    DependsOn,
    IsAlias,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Contains => "contains",
            Relation::Calls => "calls",
            Relation::DependsOn => "depends_on",
            Relation::IsAlias => "is_alias",
        }
    }
}

impl Display for Relation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Graph ids travel as their rendered form.
mod rendered_id {
    use super::*;

    pub fn serialize<S: Serializer>(id: &EntityId, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<EntityId, D::Error> {
        let raw = String::deserialize(d)?;
        EntityId::parse_rendered(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("'{}' is not a kind/name id", raw)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    #[serde(with = "rendered_id")]
    pub id: EntityId,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl GraphNode {
    pub fn new(id: EntityId) -> Self {
        Self {
            kind: id.kind.clone(),
            name: id.name.clone(),
            namespace: id.namespace.clone(),
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    #[serde(with = "rendered_id")]
    pub source: EntityId,
    pub relation: Relation,
    #[serde(with = "rendered_id")]
    pub target: EntityId,
    #[serde(default, alias = "meta", skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, JsonValue>>,
}

impl GraphEdge {
    /// Identity used for de-duplication: metadata compares by canonical JSON.
    pub fn key(&self) -> (EntityId, Relation, EntityId, String) {
        let meta = self
            .metadata
            .as_ref()
            .map(|m| serde_json::to_string(m).unwrap_or_default())
            .unwrap_or_default();
        (self.source.clone(), self.relation, self.target.clone(), meta)
    }
}

/// The built graph: sorted, duplicate-free nodes and edges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl TopologyGraph {
    /// Read a graph document; nodes and edges are re-sorted for lookups.
    pub fn load(path: &Path, policy: &AccessPolicy) -> ForensicsResult<Self> {
        let doc = read_json(path, policy)?;
        let mut graph: Self = serde_json::from_value(doc).map_err(|e| {
            ForensicsError::from(TopologyError::InvalidDocument {
                message: format!("{}: {}", path.display(), e),
            })
        })?;
        graph.normalize();
        Ok(graph)
    }

    /// Sort and de-duplicate nodes by id and edges by key.
    pub fn normalize(&mut self) {
        self.nodes.sort_by(|a, b| a.id.cmp(&b.id));
        self.nodes.dedup_by(|a, b| a.id == b.id);
        self.edges.sort_by_cached_key(GraphEdge::key);
        self.edges.dedup_by(|a, b| a.key() == b.key());
    }

    pub fn save(&self, path: &Path) -> ForensicsResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn node(&self, id: &EntityId) -> Option<&GraphNode> {
        self.nodes
            .binary_search_by(|n| n.id.cmp(id))
            .ok()
            .map(|idx| &self.nodes[idx])
    }

    /// Number of edges per relation.
    pub fn relation_counts(&self) -> BTreeMap<Relation, usize> {
        let mut counts = BTreeMap::new();
        for edge in &self.edges {
            *counts.entry(edge.relation).or_insert(0) += 1;
        }
        counts
    }
}
