use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Marks an address family for which no address was allocated.
pub const NONE_ALLOCATED: &str = "none";

/// A single workload's attachment to a logical network.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "danm.k8s.io",
    version = "v1",
    kind = "DanmEp",
    root = "NetworkEndpoint",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkEndpointSpec {
    #[serde(default)]
    pub network_name: String,

    #[serde(default)]
    pub network_type: String,

    #[serde(default, rename = "EndpointID")]
    pub endpoint_id: String,

    /// The owning pod's name.
    #[serde(default)]
    pub pod: String,

    #[serde(default, rename = "PodUID")]
    pub pod_uid: String,

    #[serde(default)]
    pub host: String,

    /// The path of the owning pod's network namespace.
    #[serde(default)]
    pub netns: String,

    #[serde(default)]
    pub iface: Interface,

    /// The kind of the referenced network. Empty denotes `DanmNet`.
    #[serde(default)]
    pub api_type: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Interface {
    #[serde(default)]
    pub name: String,

    /// An IPv4 address in CIDR notation, [`NONE_ALLOCATED`], or empty.
    #[serde(default)]
    pub address: String,

    /// An IPv6 address in CIDR notation, [`NONE_ALLOCATED`], or empty.
    #[serde(default, rename = "AddressIPv6")]
    pub address_ipv6: String,

    #[serde(default)]
    pub mac_address: String,

    #[serde(default, rename = "DeviceID")]
    pub device_id: String,
}
