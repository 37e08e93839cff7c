use std::{
    collections::BTreeMap,
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
    path::PathBuf,
};

pub type Labels = BTreeMap<String, String>;

/// A workload's attachment to a single logical network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// The endpoint's own unique instance id. Index buckets are deduplicated on this value.
    pub uid: String,

    /// The workload that owns this endpoint.
    pub workload: WorkloadRef,

    /// Labels inherited from the owning workload.
    pub labels: Labels,

    /// The primary IPv4 address, unset when none was allocated.
    pub ipv4: Option<Ipv4Addr>,

    /// The primary IPv6 address, unset when none was allocated.
    pub ipv6: Option<Ipv6Addr>,

    pub network: NetworkRef,

    /// The path of the owning workload's network namespace.
    pub netns: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

/// Identifies a logical network.
///
/// Namespace-scoped networks with the same name in different namespaces are distinct, so the
/// namespace is part of the reference for every kind except [`NetworkKind::ClusterNetwork`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkRef {
    name: String,
    kind: NetworkKind,
    namespace: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NetworkKind {
    DanmNet,
    TenantNetwork,
    ClusterNetwork,
    /// A kind this controller does not know about. Treated as namespace-scoped.
    Other(String),
}

// === impl NetworkRef ===

impl NetworkRef {
    pub fn new(name: impl Into<String>, kind: NetworkKind, namespace: impl Into<String>) -> Self {
        let namespace = if kind.is_cluster_scoped() {
            None
        } else {
            Some(namespace.into())
        };
        Self {
            name: name.into(),
            kind,
            namespace,
        }
    }

}

impl fmt::Display for NetworkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}.{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

// === impl NetworkKind ===

impl NetworkKind {
    /// Parses an API type name. An empty name denotes the default kind, `DanmNet`.
    pub fn from_api_type(api_type: &str) -> Self {
        match api_type {
            "" | "DanmNet" => Self::DanmNet,
            "TenantNetwork" => Self::TenantNetwork,
            "ClusterNetwork" => Self::ClusterNetwork,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_cluster_scoped(&self) -> bool {
        matches!(self, Self::ClusterNetwork)
    }
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DanmNet => "DanmNet".fmt(f),
            Self::TenantNetwork => "TenantNetwork".fmt(f),
            Self::ClusterNetwork => "ClusterNetwork".fmt(f),
            Self::Other(kind) => kind.fmt(f),
        }
    }
}
