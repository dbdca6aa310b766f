// ----------------------------------------------------------------------------
// 17.2 Graph Builder
// ----------------------------------------------------------------------------
// Inventory objects become nodes; ownership, endpoints, scheduling and pod
// references become edges; the architecture document adds `App` nodes,
// aliases and `calls` edges. Insertion order never affects the result.
// ----------------------------------------------------------------------------

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use aho_corasick::AhoCorasick;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info};

use super::{GraphEdge, GraphNode, Relation, TopologyGraph};
use crate::config::TopologyConfig;
use crate::error::{ConfigError, ForensicsResult};
use crate::identity::EntityId;
use crate::ingest::{load_records, read_json, AccessPolicy, Record, SchemaHints};
use crate::value::Value;

const DEFAULT_NAMESPACE: &str = "default";

/// Kinds that never live inside a namespace.
fn is_cluster_scoped(kind: &str) -> bool {
    kind == "Namespace" || kind == "Node"
}

fn object_id(namespace: Option<&str>, kind: &str, name: &str) -> EntityId {
    if is_cluster_scoped(kind) {
        EntityId::cluster(kind, name)
    } else {
        EntityId::new(Some(namespace.unwrap_or(DEFAULT_NAMESPACE)), kind, name)
    }
}

/// Accumulates a de-duplicated node/edge set.
#[derive(Debug)]
pub struct TopologyBuilder<'a> {
    config: &'a TopologyConfig,
    telemetry: AhoCorasick,
    nodes: BTreeMap<EntityId, GraphNode>,
    edges: BTreeMap<(EntityId, Relation, EntityId, String), GraphEdge>,
}

impl<'a> TopologyBuilder<'a> {
    pub fn new(config: &'a TopologyConfig) -> ForensicsResult<Self> {
        let telemetry = AhoCorasick::new(&config.telemetry_services).map_err(|e| {
            ConfigError::invalid_value("topology.telemetry_services", e.to_string())
        })?;
        Ok(Self {
            config,
            telemetry,
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
        })
    }

    pub fn add_node(&mut self, id: EntityId) {
        self.nodes
            .entry(id.clone())
            .or_insert_with(|| GraphNode::new(id));
    }

    pub fn add_edge(
        &mut self,
        source: EntityId,
        relation: Relation,
        target: EntityId,
        metadata: Option<Map<String, JsonValue>>,
    ) {
        let edge = GraphEdge {
            source,
            relation,
            target,
            metadata: metadata.filter(|m| !m.is_empty()),
        };
        self.edges.entry(edge.key()).or_insert(edge);
    }

    pub fn finish(self) -> TopologyGraph {
        TopologyGraph {
            nodes: self.nodes.into_values().collect(),
            edges: self.edges.into_values().collect(),
        }
    }

    // ------------------------------------------------------------------------
    // Inventory
    // ------------------------------------------------------------------------

    pub fn add_objects(&mut self, records: &[Record]) {
        let objects: Vec<(EntityId, Option<&Value>)> = records
            .iter()
            .filter_map(|r| {
                let kind = r.kind.as_deref()?;
                let name = r.name.as_deref()?;
                Some((object_id(r.namespace.as_deref(), kind, name), r.body()))
            })
            .collect();

        let known: BTreeSet<EntityId> = objects.iter().map(|(id, _)| id.clone()).collect();

        for (id, body) in &objects {
            self.add_node(id.clone());
            match &id.namespace {
                Some(ns) => {
                    let ns_id = EntityId::cluster("Namespace", ns.clone());
                    self.add_node(ns_id.clone());
                    self.add_edge(ns_id, Relation::Contains, id.clone(), None);
                }
                None if id.kind == "Namespace" => self.add_node(id.clone()),
                None => {}
            }

            let Some(body) = body else { continue };
            self.add_owner_edges(id, body);

            match id.kind.as_str() {
                "Service" => {
                    let endpoints = EntityId::new(id.namespace.as_deref(), "Endpoints", id.name.clone());
                    if known.contains(&endpoints) {
                        self.add_edge(id.clone(), Relation::Contains, endpoints, None);
                    }
                }
                "Endpoints" => self.add_endpoint_edges(id, body),
                "Pod" => {
                    if let Some(node_name) = body.str_at(&["spec", "nodeName"]) {
                        let node = EntityId::cluster("Node", node_name);
                        self.add_node(node.clone());
                        self.add_edge(node, Relation::Contains, id.clone(), None);
                    }
                    self.add_pod_dependencies(id, body);
                }
                _ => {}
            }
        }
    }

    fn add_owner_edges(&mut self, id: &EntityId, body: &Value) {
        let owners = body
            .get_path(&["metadata", "ownerReferences"])
            .and_then(Value::as_list)
            .unwrap_or_default();
        for owner in owners {
            let (Some(kind), Some(name)) = (owner.str_at(&["kind"]), owner.str_at(&["name"])) else {
                continue;
            };
            let owner_id = object_id(id.namespace.as_deref(), kind, name);
            self.add_node(owner_id.clone());
            self.add_edge(owner_id, Relation::Contains, id.clone(), None);
        }
    }

    fn add_endpoint_edges(&mut self, id: &EntityId, body: &Value) {
        let subsets = body.get("subsets").and_then(Value::as_list).unwrap_or_default();
        for subset in subsets {
            for key in ["addresses", "notReadyAddresses"] {
                let addresses = subset.get(key).and_then(Value::as_list).unwrap_or_default();
                for address in addresses {
                    if address.str_at(&["targetRef", "kind"]) != Some("Pod") {
                        continue;
                    }
                    let Some(pod) = address.str_at(&["targetRef", "name"]) else {
                        continue;
                    };
                    let namespace = address
                        .str_at(&["targetRef", "namespace"])
                        .or(id.namespace.as_deref());
                    let pod_id = object_id(namespace, "Pod", pod);
                    self.add_node(pod_id.clone());
                    self.add_edge(id.clone(), Relation::Contains, pod_id, None);
                }
            }
        }
    }

    fn add_pod_dependencies(&mut self, pod: &EntityId, body: &Value) {
        let ns = pod.namespace.as_deref();
        let mut targets: BTreeSet<EntityId> = BTreeSet::new();
        let spec = match body.get("spec") {
            Some(spec) => spec,
            None => return,
        };

        if let Some(sa) = spec.str_at(&["serviceAccountName"]) {
            targets.insert(object_id(ns, "ServiceAccount", sa));
        }

        for volume in spec.get("volumes").and_then(Value::as_list).unwrap_or_default() {
            if let Some(name) = volume.str_at(&["configMap", "name"]) {
                targets.insert(object_id(ns, "ConfigMap", name));
            }
            if let Some(name) = volume.str_at(&["secret", "secretName"]) {
                targets.insert(object_id(ns, "Secret", name));
            }
            if let Some(name) = volume.str_at(&["persistentVolumeClaim", "claimName"]) {
                targets.insert(object_id(ns, "PersistentVolumeClaim", name));
            }
            let sources = volume
                .get_path(&["projected", "sources"])
                .and_then(Value::as_list)
                .unwrap_or_default();
            for source in sources {
                if let Some(name) = source.str_at(&["configMap", "name"]) {
                    targets.insert(object_id(ns, "ConfigMap", name));
                }
                if let Some(name) = source.str_at(&["secret", "name"]) {
                    targets.insert(object_id(ns, "Secret", name));
                }
            }
        }

        let containers = ["containers", "initContainers"]
            .into_iter()
            .flat_map(|key| spec.get(key).and_then(Value::as_list).unwrap_or_default());
        for container in containers {
            for env in container.get("env").and_then(Value::as_list).unwrap_or_default() {
                if let Some(name) = env.str_at(&["valueFrom", "configMapKeyRef", "name"]) {
                    targets.insert(object_id(ns, "ConfigMap", name));
                }
                if let Some(name) = env.str_at(&["valueFrom", "secretKeyRef", "name"]) {
                    targets.insert(object_id(ns, "Secret", name));
                }
                if let Some(value) = env.str_at(&["value"]) {
                    for service in self.telemetry_matches(value) {
                        targets.insert(object_id(ns, "Service", &service));
                    }
                }
            }
            for from in container.get("envFrom").and_then(Value::as_list).unwrap_or_default() {
                if let Some(name) = from.str_at(&["configMapRef", "name"]) {
                    targets.insert(object_id(ns, "ConfigMap", name));
                }
                if let Some(name) = from.str_at(&["secretRef", "name"]) {
                    targets.insert(object_id(ns, "Secret", name));
                }
            }
        }

        for target in targets {
            self.add_node(target.clone());
            self.add_edge(pod.clone(), Relation::DependsOn, target, None);
        }
    }

    /// Allow-listed service names occurring anywhere in an env value.
    fn telemetry_matches(&self, value: &str) -> BTreeSet<String> {
        self.telemetry
            .find_overlapping_iter(value)
            .map(|m| self.config.telemetry_services[m.pattern().as_usize()].clone())
            .collect()
    }

    // ------------------------------------------------------------------------
    // Architecture
    // ------------------------------------------------------------------------

    /// Concrete Service a logical name maps to, when it exists in the graph.
    fn resolve_service(&self, logical: &str) -> Option<EntityId> {
        let concrete = self
            .config
            .service_aliases
            .get(logical)
            .map(String::as_str)
            .unwrap_or(logical);
        let id = EntityId::new(Some(&self.config.app_namespace), "Service", concrete);
        self.nodes.contains_key(&id).then_some(id)
    }

    fn add_app(&mut self, name: &str) {
        let app = EntityId::cluster("App", name);
        self.add_node(app.clone());
        if let Some(service) = self.resolve_service(name) {
            self.add_edge(app, Relation::IsAlias, service, None);
        }
    }

    /// Add `App` nodes, aliases and `calls` edges. Call after the inventory.
    pub fn add_architecture(&mut self, arch: &JsonValue) {
        for section in ["services", "infrastructure"] {
            let entries = arch
                .pointer(&format!("/components/{}", section))
                .and_then(JsonValue::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for entry in entries {
                let name = entry
                    .get("name")
                    .and_then(JsonValue::as_str)
                    .or_else(|| entry.as_str());
                if let Some(name) = name.filter(|n| !n.is_empty()) {
                    self.add_app(name);
                }
            }
        }

        let dependencies = arch
            .get("dependencies")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for dep in dependencies {
            let (Some(source), Some(target)) = (
                dep.get("source").and_then(JsonValue::as_str),
                dep.get("target").and_then(JsonValue::as_str),
            ) else {
                continue;
            };
            self.add_app(source);
            let metadata: Map<String, JsonValue> = dep
                .as_object()
                .into_iter()
                .flatten()
                .filter(|(k, _)| k.as_str() != "source" && k.as_str() != "target")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            let target_id = match self.resolve_service(target) {
                Some(service) => service,
                None => {
                    self.add_app(target);
                    EntityId::cluster("App", target)
                }
            };
            self.add_edge(
                EntityId::cluster("App", source),
                Relation::Calls,
                target_id,
                Some(metadata),
            );
        }
    }
}

/// Build the graph from an architecture document and inventory records.
pub fn build_topology(
    arch: &JsonValue,
    objects: &[Record],
    config: &TopologyConfig,
) -> ForensicsResult<TopologyGraph> {
    let mut builder = TopologyBuilder::new(config)?;
    builder.add_objects(objects);
    builder.add_architecture(arch);
    let graph = builder.finish();
    debug!(
        target: "forensics::topology",
        nodes = graph.nodes.len(),
        edges = graph.edges.len(),
        "Topology built"
    );
    Ok(graph)
}

/// Build from files: an architecture JSON and an object inventory table.
pub fn build_topology_files(
    arch_path: &Path,
    inventory_path: &Path,
    config: &TopologyConfig,
    policy: &AccessPolicy,
) -> ForensicsResult<TopologyGraph> {
    let arch = read_json(arch_path, policy)?;
    let ingested = load_records(inventory_path, &SchemaHints::k8s_objects(), policy)?;
    let graph = build_topology(&arch, &ingested.records, config)?;
    info!(
        target: "forensics::topology",
        objects = ingested.records.len(),
        nodes = graph.nodes.len(),
        edges = graph.edges.len(),
        "Topology built from files"
    );
    Ok(graph)
}

#[cfg(test)]
pub(crate) mod builder_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    pub(crate) fn record(kind: &str, namespace: Option<&str>, name: &str, body: JsonValue) -> Record {
        let mut fields = crate::ingest::Row::new();
        fields.insert("body".into(), Value::from(body));
        Record {
            timestamp: None,
            effective_timestamp: None,
            kind: Some(kind.into()),
            namespace: namespace.map(str::to_string),
            name: Some(name.into()),
            fields,
        }
    }

    pub(crate) fn demo_records() -> Vec<Record> {
        vec![
            record("Namespace", None, "otel-demo", json!({"kind": "Namespace"})),
            record("Service", Some("otel-demo"), "checkout", json!({"kind": "Service"})),
            record(
                "Endpoints",
                Some("otel-demo"),
                "checkout",
                json!({"subsets": [{
                    "addresses": [{"targetRef": {"kind": "Pod", "name": "checkout-7d9f8b6c5d-x2x4q"}}],
                    "notReadyAddresses": [{"targetRef": {"kind": "Pod", "name": "checkout-7d9f8b6c5d-zz9zz"}}]
                }]}),
            ),
            record("Deployment", Some("otel-demo"), "checkout", json!({"kind": "Deployment"})),
            record(
                "ReplicaSet",
                Some("otel-demo"),
                "checkout-7d9f8b6c5d",
                json!({"metadata": {"ownerReferences": [{"kind": "Deployment", "name": "checkout"}]}}),
            ),
            record(
                "Pod",
                Some("otel-demo"),
                "checkout-7d9f8b6c5d-x2x4q",
                json!({
                    "metadata": {"ownerReferences": [{"kind": "ReplicaSet", "name": "checkout-7d9f8b6c5d"}]},
                    "spec": {
                        "nodeName": "worker-1",
                        "serviceAccountName": "checkout",
                        "volumes": [
                            {"configMap": {"name": "flagd-config"}},
                            {"projected": {"sources": [{"secret": {"name": "tls"}}]}}
                        ],
                        "containers": [{
                            "env": [
                                {"name": "KAFKA_ADDR", "value": "kafka:9092"},
                                {"name": "OTEL_ENDPOINT", "value": "http://otel-collector:4317"},
                                {"name": "DB_PASS", "valueFrom": {"secretKeyRef": {"name": "db", "key": "p"}}}
                            ],
                            "envFrom": [{"configMapRef": {"name": "checkout-env"}}]
                        }]
                    }
                }),
            ),
            record("Service", Some("otel-demo"), "frontend", json!({"kind": "Service"})),
            record("Pod", None, "orphan", json!({})),
        ]
    }

    pub(crate) fn demo_arch() -> JsonValue {
        json!({
            "components": {
                "services": [{"name": "frontend"}, {"name": "checkout-service"}],
                "infrastructure": [{"name": "kafka"}]
            },
            "dependencies": [
                {"source": "frontend", "target": "checkout-service", "protocol": "grpc"},
                {"source": "checkout-service", "target": "kafka"},
                {"source": "checkout-service", "target": "payment-service"}
            ]
        })
    }

    fn has_edge(graph: &TopologyGraph, source: &str, relation: Relation, target: &str) -> bool {
        graph.edges.iter().any(|e| {
            e.source.to_string() == source && e.relation == relation && e.target.to_string() == target
        })
    }

    #[test]
    fn test_inventory_edges() {
        let graph = build_topology(&json!({}), &demo_records(), &TopologyConfig::default()).unwrap();
        let pod = "otel-demo/Pod/checkout-7d9f8b6c5d-x2x4q";

        assert!(has_edge(&graph, "Namespace/otel-demo", Relation::Contains, "otel-demo/Service/checkout"));
        assert!(has_edge(&graph, "otel-demo/Service/checkout", Relation::Contains, "otel-demo/Endpoints/checkout"));
        assert!(has_edge(&graph, "otel-demo/Endpoints/checkout", Relation::Contains, pod));
        assert!(has_edge(
            &graph,
            "otel-demo/Endpoints/checkout",
            Relation::Contains,
            "otel-demo/Pod/checkout-7d9f8b6c5d-zz9zz"
        ));
        assert!(has_edge(&graph, "otel-demo/Deployment/checkout", Relation::Contains, "otel-demo/ReplicaSet/checkout-7d9f8b6c5d"));
        assert!(has_edge(&graph, "otel-demo/ReplicaSet/checkout-7d9f8b6c5d", Relation::Contains, pod));
        assert!(has_edge(&graph, "Node/worker-1", Relation::Contains, pod));
        assert!(has_edge(&graph, "Namespace/default", Relation::Contains, "default/Pod/orphan"));
        assert!(!has_edge(&graph, "otel-demo/Service/frontend", Relation::Contains, "otel-demo/Endpoints/frontend"));
    }

    #[test]
    fn test_pod_dependencies() {
        let graph = build_topology(&json!({}), &demo_records(), &TopologyConfig::default()).unwrap();
        let pod = "otel-demo/Pod/checkout-7d9f8b6c5d-x2x4q";
        let deps: Vec<String> = graph
            .edges
            .iter()
            .filter(|e| e.source.to_string() == pod && e.relation == Relation::DependsOn)
            .map(|e| e.target.short())
            .collect();
        assert_eq!(
            deps,
            vec![
                "ConfigMap/checkout-env",
                "ConfigMap/flagd-config",
                "Secret/db",
                "Secret/tls",
                "Service/kafka",
                "Service/otel-collector",
                "ServiceAccount/checkout",
            ]
        );
    }

    #[test]
    fn test_architecture_aliases_and_calls() {
        let graph = build_topology(&demo_arch(), &demo_records(), &TopologyConfig::default()).unwrap();
        assert!(has_edge(&graph, "App/checkout-service", Relation::IsAlias, "otel-demo/Service/checkout"));
        assert!(has_edge(&graph, "App/frontend", Relation::IsAlias, "otel-demo/Service/frontend"));
        assert!(has_edge(&graph, "App/frontend", Relation::Calls, "otel-demo/Service/checkout"));
        // kafka resolves through the Service a pod references
        assert!(has_edge(&graph, "App/checkout-service", Relation::Calls, "otel-demo/Service/kafka"));
        assert!(has_edge(&graph, "App/checkout-service", Relation::Calls, "App/payment-service"));
        assert!(graph.node(&EntityId::cluster("App", "payment-service")).is_some());

        let call = graph
            .edges
            .iter()
            .find(|e| e.relation == Relation::Calls && e.source.name == "frontend")
            .unwrap();
        assert_eq!(call.metadata.as_ref().unwrap()["protocol"], json!("grpc"));
    }

    #[test]
    fn test_duplicate_observations_collapse() {
        let mut records = demo_records();
        records.extend(demo_records());
        let doubled = build_topology(&demo_arch(), &records, &TopologyConfig::default()).unwrap();
        let single = build_topology(&demo_arch(), &demo_records(), &TopologyConfig::default()).unwrap();
        assert_eq!(doubled, single);
    }

    proptest! {
        #[test]
        fn test_graph_is_independent_of_input_order(records in Just(demo_records()).prop_shuffle()) {
            let config = TopologyConfig::default();
            let expected = build_topology(&demo_arch(), &demo_records(), &config).unwrap();
            let shuffled = build_topology(&demo_arch(), &records, &config).unwrap();
            prop_assert_eq!(shuffled, expected);
        }
    }
}
