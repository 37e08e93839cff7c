//! Network policy resolution
//!
//! A workload is isolated by every `DanmNetworkPolicy` in its namespace whose pod selector matches
//! it. Evaluating a workload proceeds in three steps, each rebuilt from a full namespace listing:
//!
//! - The [`PolicySet`] buckets policies by the label pairs of their pod selectors and finds the
//!   policies that apply to the workload's labels.
//! - The [`EndpointSet`] buckets the namespace's `DanmEp` endpoints by label and by logical
//!   network, and finds the workload's own endpoints (and thereby its network namespace).
//! - [`rules::compile`] resolves each policy's peers against the endpoint buckets and emits one
//!   packet-filter rule per peer address and port, split by direction and address family.
//!
//! ```text
//! [ Pod labels ] -> [ PolicySet ] -> [ Peer ] -> [ EndpointSet ] -> [ RuleSet ]
//! ```
//!
//! A workload to which no policy applies is left alone entirely: it is neither compiled nor
//! provisioned, so it receives no deny-all baseline either.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod endpoints;
pub mod policies;
pub mod rules;


pub use self::{
    endpoints::{EndpointSet, InvalidEndpoint},
    policies::PolicySet,
    rules::{compile, InvalidRuleEntries, PeerMatch, RuleEntries},
};
