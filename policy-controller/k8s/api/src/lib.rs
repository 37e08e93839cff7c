#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod endpoint;
pub mod labels;
pub mod policy;

pub use self::{
    endpoint::{NetworkEndpoint, NetworkEndpointSpec},
    labels::Selector,
    policy::{NetworkPolicy, NetworkPolicySpec},
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{Pod, PodSpec, PodStatus},
    },
    apimachinery::{self, pkg::util::intstr::IntOrString},
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, ResourceExt},
    error::ErrorResponse,
    Client, Error, Resource,
};
