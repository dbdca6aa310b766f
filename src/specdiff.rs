// ============================================================================
// SECTION 18: SPEC DIFF
// ============================================================================
// Cleaning strips fields that churn on every observation, normalisation turns
// name-keyed lists into maps so diffs are positional only where they must be,
// and the diff itself is a deterministic walk producing path-addressed items.
// ============================================================================

use std::fmt::{self, Display, Formatter};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::value::{Value, ValueMap};

// ----------------------------------------------------------------------------
// 18.1 Cleaning
// ----------------------------------------------------------------------------

/// Keys removed wherever they appear.
pub const IGNORED_KEYS: [&str; 19] = [
    "resourceVersion",
    "managedFields",
    "generation",
    "uid",
    "selfLink",
    "creationTimestamp",
    "time",
    "lastTransitionTime",
    "lastUpdateTime",
    "lastProbeTime",
    "lastHeartbeatTime",
    "observedGeneration",
    "containerStatuses",
    "conditions",
    "podIP",
    "podIPs",
    "hostIP",
    "startTime",
    "status",
];

/// Time-looking keys that carry meaning and are kept.
const PRESERVED_TIME_KEYS: [&str; 2] = ["timeoutseconds", "deletiontimestamp"];

pub const IGNORED_ANNOTATIONS: [&str; 3] = [
    "endpoints.kubernetes.io/last-change-trigger-time",
    "kubectl.kubernetes.io/last-applied-configuration",
    "deployment.kubernetes.io/revision",
];

fn is_time_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    !PRESERVED_TIME_KEYS.contains(&lower.as_str())
        && (lower.ends_with("timestamp") || lower.ends_with("time") || lower.ends_with("date"))
}

/// Strip churn from an object tree. Empty maps and lists vanish; a tree
/// that cleans down to nothing yields `None`.
pub fn clean(value: &Value) -> Option<Value> {
    match value {
        Value::Map(map) => {
            let mut cleaned = ValueMap::new();
            for (key, child) in map {
                if IGNORED_KEYS.contains(&key.as_str()) || is_time_key(key) {
                    continue;
                }
                if key == "annotations" {
                    if let Value::Map(annotations) = child {
                        let kept: ValueMap = annotations
                            .iter()
                            .filter(|(k, _)| {
                                !IGNORED_ANNOTATIONS.contains(&k.as_str()) && !k.to_lowercase().contains("time")
                            })
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        if !kept.is_empty() {
                            cleaned.insert(key.clone(), Value::Map(kept));
                        }
                        continue;
                    }
                }
                if let Some(c) = clean(child) {
                    cleaned.insert(key.clone(), c);
                }
            }
            (!cleaned.is_empty()).then_some(Value::Map(cleaned))
        }
        Value::List(items) => {
            let cleaned: Vec<Value> = items.iter().filter_map(clean).collect();
            (!cleaned.is_empty()).then_some(Value::List(cleaned))
        }
        scalar => Some(scalar.clone()),
    }
}

// ----------------------------------------------------------------------------
// 18.2 Normalisation
// ----------------------------------------------------------------------------

fn item_name(item: &Value) -> Option<&str> {
    item.as_map()?.get("name")?.as_str()
}

/// Turn lists of maps keyed by a unique, non-empty `name` into maps keyed by
/// that name (the `name` field itself dropped). Idempotent.
pub fn normalize(value: Value) -> Value {
    match value {
        Value::Map(map) => Value::Map(map.into_iter().map(|(k, v)| (k, normalize(v))).collect()),
        Value::List(items) => {
            let keyed = !items.is_empty()
                && items.iter().all(|it| item_name(it).is_some_and(|n| !n.is_empty()))
                && {
                    let mut names: Vec<&str> = items.iter().filter_map(item_name).collect();
                    names.sort_unstable();
                    names.windows(2).all(|w| w[0] != w[1])
                };
            if !keyed {
                return Value::List(items.into_iter().map(normalize).collect());
            }
            let mut out = ValueMap::new();
            for item in items {
                if let Value::Map(mut fields) = item {
                    if let Some(Value::String(name)) = fields.remove("name") {
                        out.insert(name, normalize(Value::Map(fields)));
                    }
                }
            }
            Value::Map(out)
        }
        scalar => scalar,
    }
}

/// Clean then normalise one object body.
pub fn prepare(body: &Value) -> Option<Value> {
    clean(body).map(normalize)
}

// ----------------------------------------------------------------------------
// 18.3 Diff
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    Added,
    Removed,
    Changed,
}

/// One step of a diff path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Render segments as `a.b[0].c`, `root` when empty.
pub fn render_path(segments: &[PathSegment]) -> String {
    if segments.is_empty() {
        return "root".to_string();
    }
    let mut out = String::new();
    for segment in segments {
        match segment {
            PathSegment::Key(k) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(k);
            }
            PathSegment::Index(i) => {
                out.push('[');
                out.push_str(&i.to_string());
                out.push(']');
            }
        }
    }
    out
}

static INDEX_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(\d+)\]").expect("valid index regex"));

/// Best-effort inverse of [`render_path`]; keys containing `.` cannot be
/// recovered from the text form.
pub fn parse_path(path: &str) -> Vec<PathSegment> {
    if path == "root" || path.is_empty() {
        return Vec::new();
    }
    let mut segments = Vec::new();
    for part in path.split('.') {
        let key_end = part.find('[').unwrap_or(part.len());
        if key_end > 0 {
            segments.push(PathSegment::Key(part[..key_end].to_string()));
        }
        for cap in INDEX_SUFFIX.captures_iter(&part[key_end..]) {
            if let Ok(idx) = cap[1].parse() {
                segments.push(PathSegment::Index(idx));
            }
        }
    }
    segments
}

/// A single difference between two trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffItem {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: DiffKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
    #[serde(skip)]
    segments: Vec<PathSegment>,
}

impl DiffItem {
    fn at(segments: &[PathSegment], kind: DiffKind, old: Option<&Value>, new: Option<&Value>) -> Self {
        Self {
            path: render_path(segments),
            kind,
            old: old.cloned(),
            new: new.cloned(),
            segments: segments.to_vec(),
        }
    }

    pub fn segments(&self) -> Vec<PathSegment> {
        if self.segments.is_empty() && self.path != "root" {
            parse_path(&self.path)
        } else {
            self.segments.clone()
        }
    }
}

impl Display for DiffItem {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.kind {
            DiffKind::Added => write!(f, "+ {}", self.path),
            DiffKind::Removed => write!(f, "- {}", self.path),
            DiffKind::Changed => write!(f, "~ {}", self.path),
        }
    }
}

fn same_type(a: &Value, b: &Value) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

fn diff_into(old: &Value, new: &Value, path: &mut Vec<PathSegment>, out: &mut Vec<DiffItem>) {
    if !same_type(old, new) {
        out.push(DiffItem::at(path, DiffKind::Changed, Some(old), Some(new)));
        return;
    }
    match (old, new) {
        (Value::Map(a), Value::Map(b)) => {
            let mut keys: Vec<&String> = a.keys().chain(b.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                path.push(PathSegment::Key(key.clone()));
                match (a.get(key), b.get(key)) {
                    (None, Some(added)) => out.push(DiffItem::at(path, DiffKind::Added, None, Some(added))),
                    (Some(removed), None) => out.push(DiffItem::at(path, DiffKind::Removed, Some(removed), None)),
                    (Some(x), Some(y)) => diff_into(x, y, path, out),
                    (None, None) => {}
                }
                path.pop();
            }
        }
        (Value::List(a), Value::List(b)) => {
            if a.len() != b.len() {
                out.push(DiffItem::at(path, DiffKind::Changed, Some(old), Some(new)));
                return;
            }
            for (i, (x, y)) in a.iter().zip(b).enumerate() {
                path.push(PathSegment::Index(i));
                diff_into(x, y, path, out);
                path.pop();
            }
        }
        _ if old != new => out.push(DiffItem::at(path, DiffKind::Changed, Some(old), Some(new))),
        _ => {}
    }
}

/// Differences turning `old` into `new`, in sorted key order.
pub fn diff(old: &Value, new: &Value) -> Vec<DiffItem> {
    let mut out = Vec::new();
    diff_into(old, new, &mut Vec::new(), &mut out);
    out
}

fn slot<'v>(root: &'v mut Value, segments: &[PathSegment]) -> Option<&'v mut Value> {
    let mut current = root;
    for segment in segments {
        current = match (segment, current) {
            (PathSegment::Key(k), Value::Map(map)) => map.entry(k.clone()).or_insert_with(|| Value::Map(ValueMap::new())),
            (PathSegment::Key(k), other) => {
                *other = Value::Map(ValueMap::new());
                match other {
                    Value::Map(map) => map.entry(k.clone()).or_default(),
                    _ => return None,
                }
            }
            (PathSegment::Index(i), Value::List(items)) => items.get_mut(*i)?,
            (PathSegment::Index(_), _) => return None,
        };
    }
    Some(current)
}

/// Replay diff items onto `base`.
pub fn apply_diff(base: &Value, items: &[DiffItem]) -> Value {
    let mut result = base.clone();
    for item in items {
        let segments = item.segments();
        match item.kind {
            DiffKind::Added | DiffKind::Changed => {
                if let Some(target) = slot(&mut result, &segments) {
                    *target = item.new.clone().unwrap_or_default();
                }
            }
            DiffKind::Removed => {
                let Some((last, parent)) = segments.split_last() else {
                    result = Value::Null;
                    continue;
                };
                if let (Some(Value::Map(map)), PathSegment::Key(k)) = (slot(&mut result, parent), last) {
                    map.remove(k);
                }
            }
        }
    }
    result
}

#[cfg(test)]
mod specdiff_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn v(j: serde_json::Value) -> Value {
        Value::from(j)
    }

    #[test]
    fn test_clean_drops_churn() {
        let body = v(json!({
            "metadata": {
                "name": "cart",
                "resourceVersion": "123",
                "creationTimestamp": "2024-01-01T00:00:00Z",
                "deletionTimestamp": "2024-01-02T00:00:00Z",
                "annotations": {
                    "example.com/deploy-time": "2024-01-01T00:00:00Z",
                    "deployment.kubernetes.io/revision": "4",
                    "team": "checkout"
                },
                "labels": {}
            },
            "spec": {"replicas": 2, "template": {"spec": {"containers": [{"name": "cart", "livenessProbe": {"timeoutSeconds": 3}}]}}},
            "status": {"readyReplicas": 2}
        }));
        let cleaned = clean(&body).unwrap();
        assert_eq!(
            cleaned.to_json(),
            json!({
                "metadata": {
                    "name": "cart",
                    "deletionTimestamp": "2024-01-02T00:00:00Z",
                    "annotations": {"team": "checkout"}
                },
                "spec": {"replicas": 2, "template": {"spec": {"containers": [{"name": "cart", "livenessProbe": {"timeoutSeconds": 3}}]}}}
            })
        );
    }

    #[test]
    fn test_clean_of_only_churn_is_none() {
        assert_eq!(clean(&v(json!({"status": {"phase": "Running"}, "items": []}))), None);
    }

    #[test]
    fn test_normalize_named_lists() {
        let spec = v(json!({"containers": [{"name": "app", "image": "a:1"}, {"name": "sidecar", "image": "s:1"}]}));
        assert_eq!(
            normalize(spec).to_json(),
            json!({"containers": {"app": {"image": "a:1"}, "sidecar": {"image": "s:1"}}})
        );

        let duplicate = v(json!([{"name": "x", "a": 1}, {"name": "x", "a": 2}]));
        assert_eq!(normalize(duplicate.clone()), duplicate);

        let unnamed = v(json!([{"name": "", "a": 1}]));
        assert_eq!(normalize(unnamed.clone()), unnamed);
    }

    #[test]
    fn test_diff_paths() {
        let old = normalize(v(json!({"spec": {"containers": [{"name": "app", "image": "a:1"}], "ports": [80, 443], "replicas": 1}})));
        let new = normalize(v(json!({"spec": {"containers": [{"name": "app", "image": "a:2"}], "ports": [80, 8443], "paused": true}})));
        let items = diff(&old, &new);
        let rendered: Vec<(String, DiffKind)> = items.iter().map(|i| (i.path.clone(), i.kind)).collect();
        assert_eq!(
            rendered,
            vec![
                ("spec.containers.app.image".to_string(), DiffKind::Changed),
                ("spec.paused".to_string(), DiffKind::Added),
                ("spec.ports[1]".to_string(), DiffKind::Changed),
                ("spec.replicas".to_string(), DiffKind::Removed),
            ]
        );
        assert_eq!(items[0].old, Some(Value::from("a:1")));
        assert_eq!(items[0].new, Some(Value::from("a:2")));
    }

    #[test]
    fn test_type_mismatch_and_length_change() {
        let items = diff(&v(json!({"a": 1})), &v(json!([1])));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].path, "root");

        let items = diff(&v(json!({"a": [1, 2]})), &v(json!({"a": [1]})));
        assert_eq!(items[0].path, "a");
        assert_eq!(items[0].kind, DiffKind::Changed);
    }

    #[test]
    fn test_parse_path_inverts_render() {
        let segments = vec![
            PathSegment::Key("spec".into()),
            PathSegment::Key("ports".into()),
            PathSegment::Index(1),
            PathSegment::Key("port".into()),
        ];
        assert_eq!(render_path(&segments), "spec.ports[1].port");
        assert_eq!(parse_path("spec.ports[1].port"), segments);
        assert!(parse_path("root").is_empty());
    }

    #[test]
    fn test_apply_diff_from_serialized_items() {
        let old = v(json!({"a": {"b": 1}, "c": 2}));
        let new = v(json!({"a": {"b": 3}, "d": 4}));
        let wire = serde_json::to_string(&diff(&old, &new)).unwrap();
        let items: Vec<DiffItem> = serde_json::from_str(&wire).unwrap();
        assert_eq!(apply_diff(&old, &items), new);
    }

    fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            (-1000i32..1000).prop_map(|n| Value::Number(f64::from(n))),
            "[a-z]{0,6}".prop_map(Value::String),
        ]
    }

    fn arb_map_tree() -> impl Strategy<Value = Value> {
        arb_scalar().prop_recursive(4, 48, 5, |inner| {
            proptest::collection::btree_map("[a-z]{1,4}", inner, 0..5).prop_map(Value::Map)
        })
    }

    fn arb_tree() -> impl Strategy<Value = Value> {
        arb_scalar().prop_recursive(4, 48, 5, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::List),
                proptest::collection::btree_map("[a-z]{1,4}", inner.clone(), 0..4).prop_map(Value::Map),
                proptest::collection::vec(("[a-c]{0,2}", inner), 1..4).prop_map(|items| {
                    Value::List(
                        items
                            .into_iter()
                            .map(|(name, v)| {
                                let mut m = ValueMap::new();
                                m.insert("name".into(), Value::String(name));
                                m.insert("value".into(), v);
                                Value::Map(m)
                            })
                            .collect(),
                    )
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn test_normalize_is_idempotent(tree in arb_tree()) {
            let once = normalize(tree);
            prop_assert_eq!(normalize(once.clone()), once);
        }

        #[test]
        fn test_diff_roundtrips_on_map_trees(a in arb_map_tree(), b in arb_map_tree()) {
            let items = diff(&a, &b);
            prop_assert_eq!(apply_diff(&a, &items), b);
        }

        #[test]
        fn test_diff_of_identical_trees_is_empty(a in arb_tree()) {
            prop_assert!(diff(&a, &a).is_empty());
        }
    }
}
