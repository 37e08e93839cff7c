#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Types shared by the network policy controller's indexes, compiler and provisioner.
//!
//! Nothing in this crate knows about the Kubernetes API: endpoints arrive here already converted
//! from their custom resources, and rule sets leave here to be written into a workload's network
//! namespace.

mod endpoint;
mod rule;

pub use self::{
    endpoint::{Endpoint, Labels, NetworkKind, NetworkRef, WorkloadRef},
    rule::{
        Action, Chain, Direction, Family, Port, Protocol, Rule, RuleSet, UnknownProtocol,
        EGRESS_V4_CHAIN, EGRESS_V6_CHAIN, FILTER_TABLE, FORWARD_CHAIN, INGRESS_V4_CHAIN,
        INGRESS_V6_CHAIN, INPUT_CHAIN, OUTPUT_CHAIN,
    },
};
pub use ipnet::IpNet;
