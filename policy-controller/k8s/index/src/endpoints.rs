use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use netpol_controller_core::{Endpoint, IpNet, NetworkKind, NetworkRef, WorkloadRef};
use netpol_controller_k8s_api::{self as k8s, endpoint::NONE_ALLOCATED, ResourceExt};
use std::{net::IpAddr, path::Path};

/// Indexes the endpoints of a single namespace by label and by logical network.
///
/// Every bucket holds each endpoint at most once, keyed by the endpoint's own uid. The set is
/// built from a complete listing and never updated incrementally.
#[derive(Debug, Default)]
pub struct EndpointSet {
    endpoints: Vec<Endpoint>,
    by_label: HashMap<String, HashMap<String, Vec<usize>>>,
    by_network: HashMap<NetworkRef, Vec<usize>>,
    workload: Vec<usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidEndpoint {
    #[error("endpoint {0} has no uid")]
    MissingUid(String),

    #[error("endpoint {0} has no namespace")]
    MissingNamespace(String),
}

// === impl EndpointSet ===

impl EndpointSet {
    /// Indexes `endpoints`, recording those owned by the workload with uid `workload_uid`.
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>, workload_uid: &str) -> Self {
        let mut set = Self::default();
        let mut seen = HashSet::new();
        for ep in endpoints {
            if !seen.insert(ep.uid.clone()) {
                tracing::debug!(uid = %ep.uid, "Skipping duplicate endpoint");
                continue;
            }

            let idx = set.endpoints.len();
            for (key, value) in &ep.labels {
                set.by_label
                    .entry(key.clone())
                    .or_default()
                    .entry(value.clone())
                    .or_default()
                    .push(idx);
            }
            set.by_network
                .entry(ep.network.clone())
                .or_default()
                .push(idx);
            if ep.workload.uid == workload_uid {
                set.workload.push(idx);
            }
            set.endpoints.push(ep);
        }
        set
    }

    /// Converts and indexes endpoint resources. Resources that cannot be converted are logged and
    /// skipped.
    pub fn from_resources(
        resources: impl IntoIterator<Item = k8s::NetworkEndpoint>,
        workload_uid: &str,
    ) -> Self {
        let endpoints = resources
            .into_iter()
            .filter_map(|ep| match convert(ep) {
                Ok(ep) => Some(ep),
                Err(error) => {
                    tracing::warn!(%error, "Ignoring endpoint");
                    None
                }
            })
            .collect::<Vec<_>>();
        Self::new(endpoints, workload_uid)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Endpoints carrying the label `key=value`.
    pub fn labeled<'a>(&'a self, key: &str, value: &str) -> impl Iterator<Item = &'a Endpoint> {
        let idxs = self
            .by_label
            .get(key)
            .and_then(|values| values.get(value))
            .map(Vec::as_slice)
            .unwrap_or_default();
        self.resolve(idxs)
    }

    /// Endpoints attached to `network`.
    pub fn attached<'a>(&'a self, network: &NetworkRef) -> impl Iterator<Item = &'a Endpoint> {
        let idxs = self
            .by_network
            .get(network)
            .map(Vec::as_slice)
            .unwrap_or_default();
        self.resolve(idxs)
    }

    /// Endpoints owned by the workload this set was built for.
    pub fn workload_endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.resolve(&self.workload)
    }

    /// The network namespace of the workload this set was built for, taken from its first
    /// endpoint.
    pub fn netns(&self) -> Option<&Path> {
        self.workload_endpoints().next().map(|ep| ep.netns.as_path())
    }

    fn resolve<'a>(&'a self, idxs: &'a [usize]) -> impl Iterator<Item = &'a Endpoint> + 'a {
        idxs.iter().map(move |&i| &self.endpoints[i])
    }
}

/// Converts an endpoint resource into an [`Endpoint`].
///
/// Addresses that are unset, [`NONE_ALLOCATED`], unparseable, or of the wrong family are dropped.
/// Addresses in CIDR notation are reduced to the host address.
pub fn convert(ep: k8s::NetworkEndpoint) -> Result<Endpoint, InvalidEndpoint> {
    let name = ep.name_any();
    let uid = ep
        .uid()
        .ok_or_else(|| InvalidEndpoint::MissingUid(name.clone()))?;
    let namespace = ep
        .namespace()
        .ok_or_else(|| InvalidEndpoint::MissingNamespace(name.clone()))?;
    let labels = ep.metadata.labels.unwrap_or_default();
    let spec = ep.spec;

    let ipv4 = match parse_addr(&spec.iface.address) {
        Some(IpAddr::V4(addr)) => Some(addr),
        Some(IpAddr::V6(addr)) => {
            tracing::warn!(endpoint = %name, %addr, "Ignoring IPv6 address in IPv4 field");
            None
        }
        None => None,
    };
    let ipv6 = match parse_addr(&spec.iface.address_ipv6) {
        Some(IpAddr::V6(addr)) => Some(addr),
        Some(IpAddr::V4(addr)) => {
            tracing::warn!(endpoint = %name, %addr, "Ignoring IPv4 address in IPv6 field");
            None
        }
        None => None,
    };

    Ok(Endpoint {
        uid,
        network: NetworkRef::new(
            spec.network_name,
            NetworkKind::from_api_type(&spec.api_type),
            namespace.clone(),
        ),
        workload: WorkloadRef {
            namespace,
            name: spec.pod,
            uid: spec.pod_uid,
        },
        labels,
        ipv4,
        ipv6,
        netns: spec.netns.into(),
    })
}

fn parse_addr(s: &str) -> Option<IpAddr> {
    let s = s.trim();
    if s.is_empty() || s == NONE_ALLOCATED {
        return None;
    }
    if let Ok(net) = s.parse::<IpNet>() {
        return Some(net.addr());
    }
    match s.parse::<IpAddr>() {
        Ok(addr) => Some(addr),
        Err(error) => {
            tracing::warn!(address = %s, %error, "Ignoring invalid endpoint address");
            None
        }
    }
}
