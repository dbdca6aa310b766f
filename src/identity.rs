// ============================================================================
// SECTION 6: ENTITY IDENTITY
// ============================================================================
// Canonical `namespace/kind/name` identities and the flexible identifier
// syntax callers use to name them (`namespace/kind/name`, `kind/name`,
// `name`). Ambiguous forms resolve to every match plus a warning.
// ============================================================================

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{ForensicsResult, InputError};

// ----------------------------------------------------------------------------
// 6.1 EntityId
// ----------------------------------------------------------------------------

/// Identity of a Kubernetes-style object within one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    pub namespace: Option<String>,
    pub kind: String,
    pub name: String,
}

impl EntityId {
    pub fn new(namespace: Option<&str>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Cluster-scoped identity (`kind/name`).
    pub fn cluster(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(None, kind, name)
    }

    /// `Kind/name` without the namespace, as used in relationship sentences.
    pub fn short(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }

    /// Parse a rendered id back. Two segments are `kind/name`, three or
    /// more are `namespace/kind/name` with the remainder joined into the name.
    pub fn parse_rendered(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.split('/').filter(|p| !p.is_empty()).collect();
        match parts.len() {
            0 | 1 => None,
            2 => Some(Self::cluster(parts[0], parts[1])),
            _ => Some(Self::new(Some(parts[0]), parts[1], parts[2..].join("/"))),
        }
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", ns, self.kind, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

// ----------------------------------------------------------------------------
// 6.2 Identifier Queries
// ----------------------------------------------------------------------------

/// Which identifier shape the caller used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentifierFormat {
    #[serde(rename = "namespace/kind/name")]
    NamespaceKindName,
    #[serde(rename = "kind/name")]
    KindName,
    #[serde(rename = "name")]
    Name,
}

/// A parsed, possibly ambiguous, entity identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityQuery {
    pub raw: String,
    pub format: IdentifierFormat,
    pub namespace: Option<String>,
    pub kind: Option<String>,
    pub name: String,
}

impl EntityQuery {
    pub fn parse(raw: &str) -> ForensicsResult<Self> {
        let parts: Vec<&str> = raw.trim().split('/').filter(|p| !p.is_empty()).collect();
        let query = match parts.len() {
            0 => {
                return Err(InputError::InvalidIdentifier {
                    input: raw.to_string(),
                    message: "expected 'namespace/kind/name', 'kind/name' or 'name'".into(),
                }
                .into())
            }
            1 => Self {
                raw: raw.to_string(),
                format: IdentifierFormat::Name,
                namespace: None,
                kind: None,
                name: parts[0].to_string(),
            },
            2 => Self {
                raw: raw.to_string(),
                format: IdentifierFormat::KindName,
                namespace: None,
                kind: Some(parts[0].to_string()),
                name: parts[1].to_string(),
            },
            _ => Self {
                raw: raw.to_string(),
                format: IdentifierFormat::NamespaceKindName,
                namespace: Some(parts[0].to_string()),
                kind: Some(parts[1].to_string()),
                name: parts[2..].join("/"),
            },
        };
        Ok(query)
    }

    /// Warning text for ambiguous identifier shapes.
    pub fn warning(&self) -> Option<String> {
        match self.format {
            IdentifierFormat::NamespaceKindName => None,
            IdentifierFormat::KindName => Some(format!(
                "Identifier '{}' has no namespace; all namespaces are matched. Prefer 'namespace/{}'.",
                self.raw, self.raw
            )),
            IdentifierFormat::Name => Some(format!(
                "Identifier '{}' has no kind or namespace; every object named '{}' is matched. Prefer 'namespace/kind/name'.",
                self.raw, self.name
            )),
        }
    }

    /// Case-insensitive structural match.
    pub fn matches(&self, id: &EntityId) -> bool {
        if !id.name.eq_ignore_ascii_case(&self.name) {
            return false;
        }
        if let Some(kind) = &self.kind {
            if !id.kind.eq_ignore_ascii_case(kind) {
                return false;
            }
        }
        match (&self.namespace, &id.namespace) {
            (Some(q), Some(ns)) => q.eq_ignore_ascii_case(ns),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    /// Looser match used when nothing matches structurally.
    pub fn matches_substring(&self, id: &EntityId) -> bool {
        id.to_string()
            .to_ascii_lowercase()
            .contains(&self.name.to_ascii_lowercase())
    }
}

/// Outcome of resolving a query against the ids of one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub matches: Vec<EntityId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub used_fallback: bool,
}

/// Resolve `query` against `ids`, falling back to substring matching.
/// Matches are returned sorted and unique.
pub fn resolve<'a, I>(query: &EntityQuery, ids: I) -> Resolution
where
    I: IntoIterator<Item = &'a EntityId>,
{
    let all: Vec<&EntityId> = ids.into_iter().collect();
    let mut matches: Vec<EntityId> = all.iter().filter(|id| query.matches(id)).map(|id| (*id).clone()).collect();
    let mut used_fallback = false;
    if matches.is_empty() {
        matches = all
            .iter()
            .filter(|id| query.matches_substring(id))
            .map(|id| (*id).clone())
            .collect();
        used_fallback = !matches.is_empty();
    }
    matches.sort();
    matches.dedup();

    let warning = match query.warning() {
        Some(w) if matches.len() > 1 => Some(format!("{} Matched {} entities.", w, matches.len())),
        Some(w) => Some(w),
        None if used_fallback => Some(format!(
            "No exact match for '{}'; matched by substring.",
            query.raw
        )),
        None => None,
    };

    Resolution {
        matches,
        warning,
        used_fallback,
    }
}

// ----------------------------------------------------------------------------
// 6.3 Workload Name Derivation
// ----------------------------------------------------------------------------

/// Deployment name for a pod name (`<deployment>-<rs-hash>-<pod-hash>`).
pub fn deployment_from_pod(pod_name: &str) -> String {
    if pod_name.is_empty() {
        return "unknown".to_string();
    }
    let parts: Vec<&str> = pod_name.rsplitn(3, '-').collect();
    if parts.len() >= 2 {
        parts[parts.len() - 1].to_string()
    } else {
        pod_name.to_string()
    }
}

/// Deployment name for a ReplicaSet name (`<deployment>-<rs-hash>`).
pub fn deployment_from_replicaset(rs_name: &str) -> String {
    match rs_name.rsplit_once('-') {
        Some((head, hash)) if hash.len() >= 5 && !head.is_empty() => head.to_string(),
        _ => rs_name.to_string(),
    }
}

/// Deployment-level name for any workload object.
pub fn deployment_for(kind: &str, name: &str) -> String {
    if kind.eq_ignore_ascii_case("pod") {
        deployment_from_pod(name)
    } else if kind.eq_ignore_ascii_case("replicaset") {
        deployment_from_replicaset(name)
    } else if name.is_empty() {
        "unknown".to_string()
    } else {
        name.to_string()
    }
}

/// Name variants tried when files or series are keyed by a shorter service name.
pub fn name_variants(name: &str) -> Vec<String> {
    let mut variants = vec![name.to_string()];
    for suffix in ["-service", "_service", "-svc", "_svc"] {
        if let Some(stripped) = name.strip_suffix(suffix) {
            if !stripped.is_empty() {
                variants.push(stripped.to_string());
            }
        }
    }
    variants
}
