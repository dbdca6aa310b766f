// ----------------------------------------------------------------------------
// 17.3 Relationship Analyzer
// ----------------------------------------------------------------------------

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use super::{GraphNode, Relation, TopologyGraph};
use crate::config::TopologyConfig;
use crate::constants::{KIND_PRIORITY, MAX_SUGGESTED_ENTITIES};
use crate::error::{ForensicsResult, TopologyError};
use crate::identity::EntityId;
use crate::ingest::AccessPolicy;

/// Pods (and their deployments) that reference the entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsedByInfra {
    pub pods: Vec<String>,
    pub deployments: Vec<String>,
}

/// Everything the graph says about one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologyReport {
    pub entity: String,
    pub id: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub aliases: Vec<String>,
    pub direct_relationships: Vec<String>,
    pub relationships_by_type: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub backing_infrastructure: Vec<String>,
    pub callers: Vec<String>,
    pub callees: Vec<String>,
    pub call_chains_to_root: Vec<String>,
    pub call_chains_to_leaf: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_by_infra: Option<UsedByInfra>,
}

impl TopologyReport {
    /// Callees plus the targets of outgoing `calls` and `depends_on` edges.
    pub fn functional_dependencies(&self) -> BTreeSet<String> {
        let mut deps: BTreeSet<String> = self.callees.iter().cloned().collect();
        for (rel, targets) in &self.relationships_by_type {
            if rel == "--calls-->" || rel == "--depends_on-->" {
                deps.extend(targets.iter().cloned());
            }
        }
        deps
    }

    /// `Pod/<name>` of every pod in the backing infrastructure chain.
    pub fn backing_pods(&self) -> Vec<String> {
        self.backing_infrastructure
            .iter()
            .filter_map(|chain| chain.rsplit_once(" --contains--> "))
            .map(|(_, target)| target)
            .filter(|target| target.starts_with("Pod/"))
            .map(str::to_string)
            .collect()
    }
}

/// Adjacency view over a loaded graph.
struct GraphIndex<'g> {
    nodes: BTreeMap<&'g EntityId, &'g GraphNode>,
    outgoing: BTreeMap<&'g EntityId, Vec<(Relation, &'g EntityId)>>,
    incoming: BTreeMap<&'g EntityId, Vec<(Relation, &'g EntityId)>>,
}

impl<'g> GraphIndex<'g> {
    fn new(graph: &'g TopologyGraph) -> Self {
        let nodes = graph.nodes.iter().map(|n| (&n.id, n)).collect();
        let mut outgoing: BTreeMap<_, Vec<_>> = BTreeMap::new();
        let mut incoming: BTreeMap<_, Vec<_>> = BTreeMap::new();
        for edge in &graph.edges {
            outgoing.entry(&edge.source).or_default().push((edge.relation, &edge.target));
            incoming.entry(&edge.target).or_default().push((edge.relation, &edge.source));
        }
        Self {
            nodes,
            outgoing,
            incoming,
        }
    }

    fn out(&self, id: &EntityId) -> &[(Relation, &'g EntityId)] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    fn inc(&self, id: &EntityId) -> &[(Relation, &'g EntityId)] {
        self.incoming.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    fn kind_of(&self, id: &EntityId) -> Option<&'g str> {
        self.nodes.get(id).map(|n| n.kind.as_str())
    }

    fn name_of(&self, id: &EntityId) -> String {
        self.nodes
            .get(id)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| id.name.clone())
    }

    /// Exact id, case-insensitive id, name by kind priority, any name,
    /// then substring of the rendered id.
    fn find(&self, query: &str) -> Option<&'g EntityId> {
        let rendered: Vec<(String, &'g EntityId)> =
            self.nodes.keys().map(|id| (id.to_string(), *id)).collect();
        if let Some((_, id)) = rendered.iter().find(|(r, _)| r.as_str() == query) {
            return Some(*id);
        }
        let lower = query.to_lowercase();
        if let Some((_, id)) = rendered.iter().find(|(r, _)| r.to_lowercase() == lower) {
            return Some(*id);
        }
        for kind in KIND_PRIORITY {
            if let Some(node) = self
                .nodes
                .values()
                .find(|n| n.kind == kind && n.name.to_lowercase() == lower)
            {
                return Some(&node.id);
            }
        }
        if let Some(node) = self.nodes.values().find(|n| n.name.to_lowercase() == lower) {
            return Some(&node.id);
        }
        rendered
            .iter()
            .find(|(r, _)| r.to_lowercase().contains(&lower))
            .map(|(_, id)| *id)
    }

    fn sentence(&self, source: &EntityId, relation: Relation, target: &EntityId) -> String {
        format!("{} --{}--> {}", self.short(source), relation, self.short(target))
    }

    fn short(&self, id: &EntityId) -> String {
        match self.nodes.get(id) {
            Some(n) => format!("{}/{}", n.kind, n.name),
            None => id.short(),
        }
    }
}

/// Deployment name of a `<deployment>-<rs-hash>-<pod-hash>` pod, if it has that shape.
fn pod_deployment(pod_name: &str) -> Option<String> {
    let parts: Vec<&str> = pod_name.rsplitn(3, '-').collect();
    (parts.len() == 3).then(|| parts[2].to_string())
}

/// Call graph over normalised ids: Services aliased by an App collapse into it.
struct CallGraph<'g> {
    forward: BTreeMap<&'g EntityId, BTreeSet<&'g EntityId>>,
    reverse: BTreeMap<&'g EntityId, BTreeSet<&'g EntityId>>,
    alias_of: BTreeMap<&'g EntityId, &'g EntityId>,
}

impl<'g> CallGraph<'g> {
    fn new(graph: &'g TopologyGraph) -> Self {
        let mut alias_of: BTreeMap<&EntityId, &EntityId> = BTreeMap::new();
        for edge in graph.edges.iter().filter(|e| e.relation == Relation::IsAlias) {
            alias_of.entry(&edge.target).or_insert(&edge.source);
        }
        let mut forward: BTreeMap<_, BTreeSet<_>> = BTreeMap::new();
        let mut reverse: BTreeMap<_, BTreeSet<_>> = BTreeMap::new();
        for edge in graph.edges.iter().filter(|e| e.relation == Relation::Calls) {
            let src = alias_of.get(&edge.source).copied().unwrap_or(&edge.source);
            let tgt = alias_of.get(&edge.target).copied().unwrap_or(&edge.target);
            forward.entry(src).or_default().insert(tgt);
            reverse.entry(tgt).or_default().insert(src);
        }
        Self {
            forward,
            reverse,
            alias_of,
        }
    }

    fn normalize(&self, id: &'g EntityId) -> &'g EntityId {
        self.alias_of.get(id).copied().unwrap_or(id)
    }

    fn callees(&self, id: &EntityId) -> impl Iterator<Item = &'g EntityId> + '_ {
        self.forward.get(id).into_iter().flatten().copied()
    }

    fn all(&self) -> BTreeSet<&'g EntityId> {
        self.forward.keys().chain(self.reverse.keys()).copied().collect()
    }

    fn roots(&self) -> Vec<&'g EntityId> {
        self.all()
            .into_iter()
            .filter(|s| self.reverse.get(s).map_or(true, BTreeSet::is_empty))
            .collect()
    }

    fn is_leaf(&self, id: &EntityId) -> bool {
        self.forward.get(id).map_or(true, BTreeSet::is_empty)
    }
}

struct ChainSearch<'a, 'g> {
    index: &'a GraphIndex<'g>,
    calls: &'a CallGraph<'g>,
    targets: &'a BTreeSet<&'g EntityId>,
    max_depth: usize,
    found: Vec<String>,
}

impl<'a, 'g> ChainSearch<'a, 'g> {
    fn to_targets(&mut self, current: &'g EntityId, path: &mut Vec<String>, visited: &mut BTreeSet<&'g EntityId>) {
        if path.len() > self.max_depth {
            return;
        }
        if self.targets.contains(current) {
            self.found.push(path.join(" -> "));
            return;
        }
        let calls = self.calls;
        for callee in calls.callees(current) {
            if visited.insert(callee) {
                path.push(self.index.name_of(callee));
                self.to_targets(callee, path, visited);
                path.pop();
                visited.remove(callee);
            }
        }
    }

    fn to_leaves(&mut self, current: &'g EntityId, path: &mut Vec<String>, visited: &mut BTreeSet<&'g EntityId>) {
        if path.len() > self.max_depth {
            return;
        }
        if self.calls.is_leaf(current) {
            if path.len() > 1 {
                self.found.push(path.join(" -> "));
            }
            return;
        }
        let calls = self.calls;
        for callee in calls.callees(current) {
            if visited.insert(callee) {
                path.push(self.index.name_of(callee));
                self.to_leaves(callee, path, visited);
                path.pop();
                visited.remove(callee);
            }
        }
    }
}

fn finish_chains(mut chains: Vec<String>, cap: usize) -> Vec<String> {
    chains.sort();
    chains.dedup();
    chains.truncate(cap);
    chains
}

/// Analyze every relationship of the entity `query` resolves to.
pub fn analyze_topology(
    graph: &TopologyGraph,
    query: &str,
    config: &TopologyConfig,
) -> ForensicsResult<TopologyReport> {
    let index = GraphIndex::new(graph);
    let start = index.find(query).ok_or_else(|| TopologyError::EntityNotFound {
        query: query.to_string(),
        available: graph
            .nodes
            .iter()
            .filter(|n| matches!(n.kind.as_str(), "App" | "Service" | "Pod"))
            .take(MAX_SUGGESTED_ENTITIES)
            .map(|n| n.id.to_string())
            .collect(),
    })?;
    let node = index.nodes[start];

    let mut aliases: BTreeSet<&EntityId> = BTreeSet::from([start]);
    aliases.extend(index.out(start).iter().filter(|(r, _)| *r == Relation::IsAlias).map(|(_, t)| *t));
    aliases.extend(index.inc(start).iter().filter(|(r, _)| *r == Relation::IsAlias).map(|(_, s)| *s));

    // Direct relationships
    let mut direct: BTreeSet<String> = BTreeSet::new();
    let mut by_type: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for &alias in &aliases {
        for (rel, target) in index.out(alias) {
            direct.insert(index.sentence(alias, *rel, target));
            by_type
                .entry(format!("--{}-->", rel))
                .or_default()
                .insert(index.short(target));
        }
        for (rel, source) in index.inc(alias) {
            direct.insert(index.sentence(source, *rel, alias));
            by_type
                .entry(format!("<--{}--", rel))
                .or_default()
                .insert(index.short(source));
        }
    }

    // Backing infrastructure
    let mut backing = Vec::new();
    if node.kind == "App" || node.kind == "Service" {
        let service = aliases.iter().find(|a| index.kind_of(a) == Some("Service"));
        if let Some(service) = service {
            let deployment = EntityId::new(service.namespace.as_deref(), "Deployment", service.name.clone());
            if index.nodes.contains_key(&deployment) {
                backing.push(format!(
                    "Namespace/{} --contains--> Deployment/{}",
                    service.namespace.as_deref().unwrap_or_default(),
                    deployment.name
                ));
                for (rel, rs) in index.out(&deployment) {
                    if *rel != Relation::Contains || index.kind_of(rs) != Some("ReplicaSet") {
                        continue;
                    }
                    backing.push(index.sentence(&deployment, Relation::Contains, rs));
                    for (pod_rel, pod) in index.out(rs) {
                        if *pod_rel == Relation::Contains && index.kind_of(pod) == Some("Pod") {
                            backing.push(index.sentence(rs, Relation::Contains, pod));
                        }
                    }
                }
            }
        }
    }

    // Callers and callees
    let calls = CallGraph::new(graph);
    let mut infra_callers: BTreeMap<&EntityId, BTreeSet<String>> = BTreeMap::new();
    for edge in graph.edges.iter().filter(|e| e.relation == Relation::DependsOn) {
        if index.kind_of(&edge.source) != Some("Pod") {
            continue;
        }
        let pod_name = index.name_of(&edge.source);
        let deployment = pod_deployment(&pod_name).unwrap_or(pod_name);
        infra_callers
            .entry(calls.normalize(&edge.target))
            .or_default()
            .insert(deployment);
    }

    let normalized: BTreeSet<&EntityId> = aliases.iter().map(|a| calls.normalize(*a)).collect();
    let mut callers: BTreeSet<String> = BTreeSet::new();
    let mut callees: BTreeSet<String> = BTreeSet::new();
    for &id in &normalized {
        callers.extend(calls.reverse.get(id).into_iter().flatten().map(|c| index.name_of(c)));
        callees.extend(calls.callees(id).map(|c| index.name_of(c)));
    }
    let infra_names: BTreeSet<String> = normalized
        .iter()
        .filter_map(|a| infra_callers.get(*a))
        .flatten()
        .cloned()
        .collect();
    callers.extend(infra_names.iter().cloned());

    // Call chains
    let mut search = ChainSearch {
        index: &index,
        calls: &calls,
        targets: &normalized,
        max_depth: config.max_chain_depth,
        found: Vec::new(),
    };
    for root in calls.roots() {
        if normalized.contains(root) {
            search.found.push(index.name_of(root));
        } else {
            search.to_targets(root, &mut vec![index.name_of(root)], &mut BTreeSet::from([root]));
        }
    }
    let mut chains_to = std::mem::take(&mut search.found);
    for &source in &normalized {
        search.to_leaves(source, &mut vec![index.name_of(source)], &mut BTreeSet::from([source]));
    }
    let chains_from = std::mem::take(&mut search.found);

    let entity_name = index.name_of(start);
    if chains_to.is_empty() && !infra_names.is_empty() {
        chains_to = infra_names
            .iter()
            .map(|caller| format!("{} -> {} (infra)", caller, entity_name))
            .collect();
    }

    // Infrastructure users
    let pods: BTreeSet<String> = aliases
        .iter()
        .flat_map(|a| index.inc(a))
        .filter(|(rel, src)| *rel == Relation::DependsOn && index.kind_of(src) == Some("Pod"))
        .map(|(_, src)| index.name_of(src))
        .collect();
    let used_by_infra = (!pods.is_empty()).then(|| UsedByInfra {
        deployments: pods
            .iter()
            .filter_map(|p| pod_deployment(p))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
        pods: pods.into_iter().collect(),
    });

    debug!(
        target: "forensics::topology",
        query,
        entity = %start,
        aliases = aliases.len(),
        callers = callers.len(),
        callees = callees.len(),
        "Topology analyzed"
    );

    Ok(TopologyReport {
        entity: entity_name,
        id: start.to_string(),
        kind: node.kind.clone(),
        name: node.name.clone(),
        namespace: node.namespace.clone(),
        aliases: aliases
            .iter()
            .filter(|a| **a != start)
            .map(|a| a.to_string())
            .collect(),
        direct_relationships: direct.into_iter().collect(),
        relationships_by_type: by_type
            .into_iter()
            .map(|(k, v)| (k, v.into_iter().collect()))
            .collect(),
        backing_infrastructure: backing,
        callers: callers.into_iter().collect(),
        callees: callees.into_iter().collect(),
        call_chains_to_root: finish_chains(chains_to, config.max_chains),
        call_chains_to_leaf: finish_chains(chains_from, config.max_chains),
        used_by_infra,
    })
}

/// Load a graph document and analyze `query` against it.
pub fn analyze_topology_file(
    path: &Path,
    query: &str,
    config: &TopologyConfig,
    policy: &AccessPolicy,
) -> ForensicsResult<TopologyReport> {
    let graph = TopologyGraph::load(path, policy)?;
    analyze_topology(&graph, query, config)
}

#[cfg(test)]
mod analyzer_tests {
    use super::*;
    use crate::topology::builder::builder_tests::{demo_arch, demo_records};
    use crate::topology::{build_topology, GraphEdge};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn demo_graph() -> TopologyGraph {
        build_topology(&demo_arch(), &demo_records(), &TopologyConfig::default()).unwrap()
    }

    #[test]
    fn test_alias_set_is_direct_neighbours_only() {
        let web = EntityId::cluster("App", "web");
        let legacy = EntityId::cluster("App", "web-legacy");
        let service = EntityId::new(Some("otel-demo"), "Service", "web");
        let alias = |source: &EntityId| GraphEdge {
            source: source.clone(),
            relation: Relation::IsAlias,
            target: service.clone(),
            metadata: None,
        };
        let graph = TopologyGraph {
            nodes: vec![
                GraphNode::new(web.clone()),
                GraphNode::new(legacy.clone()),
                GraphNode::new(service.clone()),
            ],
            edges: vec![alias(&web), alias(&legacy)],
        };

        let from_app = analyze_topology(&graph, "App/web", &TopologyConfig::default()).unwrap();
        assert_eq!(from_app.aliases, vec!["otel-demo/Service/web"]);

        let from_service = analyze_topology(&graph, "otel-demo/Service/web", &TopologyConfig::default()).unwrap();
        assert_eq!(from_service.aliases, vec!["App/web", "App/web-legacy"]);
    }

    #[test]
    fn test_alias_resolves_callers_to_concrete_service() {
        let graph = demo_graph();
        let report = analyze_topology(&graph, "checkout", &TopologyConfig::default()).unwrap();

        assert_eq!(report.id, "otel-demo/Service/checkout");
        assert_eq!(report.aliases, vec!["App/checkout-service"]);
        assert!(report.callers.contains(&"frontend".to_string()));
        assert_eq!(report.callees, vec!["kafka", "payment-service"]);
        assert!(report
            .direct_relationships
            .contains(&"App/frontend --calls--> Service/checkout".to_string()));
        assert_eq!(
            report.relationships_by_type["<--is_alias--"],
            vec!["App/checkout-service"]
        );
        assert!(report
            .call_chains_to_root
            .contains(&"frontend -> checkout-service".to_string()));
        assert_eq!(
            report.call_chains_to_leaf,
            vec!["checkout-service -> kafka", "checkout-service -> payment-service"]
        );
    }

    #[test]
    fn test_backing_infrastructure_chain() {
        let report = analyze_topology(&demo_graph(), "App/checkout-service", &TopologyConfig::default()).unwrap();
        assert_eq!(
            report.backing_infrastructure,
            vec![
                "Namespace/otel-demo --contains--> Deployment/checkout",
                "Deployment/checkout --contains--> ReplicaSet/checkout-7d9f8b6c5d",
                "ReplicaSet/checkout-7d9f8b6c5d --contains--> Pod/checkout-7d9f8b6c5d-x2x4q",
            ]
        );
    }

    #[test]
    fn test_functional_dependencies_and_backing_pods() {
        let report = analyze_topology(&demo_graph(), "App/checkout-service", &TopologyConfig::default()).unwrap();
        assert_eq!(report.backing_pods(), vec!["Pod/checkout-7d9f8b6c5d-x2x4q"]);
        let deps = report.functional_dependencies();
        assert!(deps.contains("kafka"));
        assert!(deps.contains("payment-service"));
        assert!(!deps.contains("frontend"));

        let pod = analyze_topology(&demo_graph(), "Pod/checkout-7d9f8b6c5d-x2x4q", &TopologyConfig::default()).unwrap();
        assert!(pod.functional_dependencies().contains("ConfigMap/flagd-config"));
    }

    #[test]
    fn test_infra_callers_and_used_by() {
        let report = analyze_topology(&demo_graph(), "otel-collector", &TopologyConfig::default()).unwrap();
        assert_eq!(report.id, "otel-demo/Service/otel-collector");
        assert_eq!(report.callers, vec!["checkout"]);
        assert_eq!(report.call_chains_to_root, vec!["checkout -> otel-collector (infra)"]);
        assert_eq!(
            report.used_by_infra,
            Some(UsedByInfra {
                pods: vec!["checkout-7d9f8b6c5d-x2x4q".into()],
                deployments: vec!["checkout".into()],
            })
        );
    }

    #[test]
    fn test_resolution_prefers_kind_priority_then_substring() {
        let graph = demo_graph();
        let config = TopologyConfig::default();
        assert_eq!(analyze_topology(&graph, "frontend", &config).unwrap().id, "App/frontend");
        assert_eq!(analyze_topology(&graph, "OTEL-DEMO/SERVICE/FRONTEND", &config).unwrap().id, "otel-demo/Service/frontend");
        assert_eq!(analyze_topology(&graph, "worker", &config).unwrap().id, "Node/worker-1");
    }

    #[test]
    fn test_unknown_entity_lists_candidates() {
        let err = analyze_topology(&demo_graph(), "does-not-exist", &TopologyConfig::default()).unwrap_err();
        assert_eq!(err.category(), "topology");
        let message = err.to_string();
        assert!(message.contains("App/frontend"));
        assert!(!message.contains("ConfigMap"));
    }

    #[test]
    fn test_chain_depth_is_bounded() {
        let services: Vec<String> = (0..15).map(|i| format!("svc-{:02}", i)).collect();
        let dependencies: Vec<_> = services
            .windows(2)
            .map(|w| json!({"source": w[0], "target": w[1]}))
            .collect();
        let arch = json!({"dependencies": dependencies});
        let graph = build_topology(&arch, &[], &TopologyConfig::default()).unwrap();
        let report = analyze_topology(&graph, "svc-00", &TopologyConfig::default()).unwrap();
        assert!(report.call_chains_to_leaf.is_empty());

        let shallow = analyze_topology(&graph, "svc-10", &TopologyConfig::default()).unwrap();
        assert_eq!(shallow.call_chains_to_leaf.len(), 1);
    }
}
