use crate::labels::Selector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Isolates the pods it selects, admitting only traffic to and from the listed peers and ports.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "netpol.k8s.io",
    version = "v1",
    kind = "DanmNetworkPolicy",
    root = "NetworkPolicy",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicySpec {
    /// Selects the pods this policy applies to. An empty selector selects every pod in the
    /// namespace.
    #[serde(default)]
    pub pod_selector: Selector,

    #[serde(default)]
    pub ingress: Vec<IngressRule>,

    #[serde(default)]
    pub egress: Vec<EgressRule>,

    #[serde(default)]
    pub policy_types: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct IngressRule {
    #[serde(default)]
    pub ports: Vec<PolicyPort>,

    #[serde(default)]
    pub from: Vec<Peer>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct EgressRule {
    #[serde(default)]
    pub ports: Vec<PolicyPort>,

    #[serde(default)]
    pub to: Vec<Peer>,
}

/// Describes the endpoints that may be a source (ingress) or destination (egress) of traffic.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub pod_selector: Option<Selector>,

    /// Accepted for compatibility; peers are always resolved within the policy's namespace.
    pub namespace_selector: Option<Selector>,

    pub network_selector: Option<NetworkSelector>,
}

/// References a logical network by name and API type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct NetworkSelector {
    #[serde(default)]
    pub name: String,

    /// The network's API type. Empty denotes `DanmNet`.
    #[serde(default, rename = "type")]
    pub kind: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct PolicyPort {
    /// TCP, UDP or SCTP. Defaults to TCP.
    pub protocol: Option<String>,

    /// A port number or name. All ports match when unset.
    pub port: Option<IntOrString>,
}
