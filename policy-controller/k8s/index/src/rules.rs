use crate::EndpointSet;
use ahash::AHashSet as HashSet;
use netpol_controller_core::{
    Direction, Endpoint, Family, IpNet, Labels, NetworkKind, NetworkRef, Port, Protocol, Rule,
    RuleSet,
};
use netpol_controller_k8s_api::{
    labels::SelectorError,
    policy::{NetworkSelector, Peer, PolicyPort},
    IntOrString, NetworkPolicy, ResourceExt,
};
use std::{fmt, net::IpAddr, num::NonZeroU16, path::PathBuf, str::FromStr};

/// Controls which entries of a policy's ingress and egress lists are compiled.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RuleEntries {
    /// Only the first entry of each list is honored.
    #[default]
    First,

    /// Every entry is compiled.
    All,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid rule entries mode: {0}; expected 'first' or 'all'")]
pub struct InvalidRuleEntries(String);

/// How a peer selects endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerMatch {
    /// Endpoints carrying any of the labels.
    Labels(Labels),

    /// Endpoints attached to the network.
    Network(NetworkRef),

    /// Endpoints carrying any of the labels that are also attached to the network. When either
    /// side matches no endpoints, the other side alone selects.
    Both { labels: Labels, network: NetworkRef },

    /// The peer selects nothing.
    Nothing,
}

/// A compiled port match.
#[derive(Clone, Debug, PartialEq, Eq)]
struct PortMatch {
    protocol: Protocol,
    port: Option<Port>,
}

/// Compiles the rules granted by `policies` into a rule set for the namespace at `netns`.
///
/// Peers are resolved against `endpoints`, which must index the policies' namespace. Within a
/// single rule entry each endpoint contributes its rules at most once.
pub fn compile<'p>(
    policies: impl IntoIterator<Item = &'p NetworkPolicy>,
    endpoints: &EndpointSet,
    netns: impl Into<PathBuf>,
    entries: RuleEntries,
) -> RuleSet {
    let mut rules = RuleSet::new(netns);
    for policy in policies {
        let namespace = policy.namespace().unwrap_or_default();
        let name = policy.name_any();
        let _span = tracing::debug_span!("policy", ns = %namespace, %name).entered();

        let ingress = policy.spec.ingress.iter().map(|r| (&r.from, &r.ports));
        for (peers, ports) in entries.select(ingress) {
            compile_entry(
                &mut rules,
                Direction::Ingress,
                peers,
                ports,
                endpoints,
                &namespace,
            );
        }

        let egress = policy.spec.egress.iter().map(|r| (&r.to, &r.ports));
        for (peers, ports) in entries.select(egress) {
            compile_entry(
                &mut rules,
                Direction::Egress,
                peers,
                ports,
                endpoints,
                &namespace,
            );
        }
    }
    tracing::debug!(rules = rules.len(), "Compiled");
    rules
}

fn compile_entry(
    rules: &mut RuleSet,
    direction: Direction,
    peers: &[Peer],
    ports: &[PolicyPort],
    endpoints: &EndpointSet,
    namespace: &str,
) {
    let declared = ports.len();
    let ports = ports.iter().filter_map(port_match).collect::<Vec<_>>();
    // Compiling without ports would admit every port.
    if declared > 0 && ports.is_empty() {
        tracing::warn!(%direction, "Ignoring rule entry without valid ports");
        return;
    }

    let mut seen = HashSet::new();
    for peer in peers {
        let peer = match PeerMatch::from_peer(peer, namespace) {
            Ok(peer) => peer,
            Err(error) => {
                tracing::warn!(%error, "Ignoring peer with unsupported pod selector");
                continue;
            }
        };

        for ep in peer.resolve(endpoints) {
            if !seen.insert(ep.uid.as_str()) {
                continue;
            }
            if let Some(addr) = ep.ipv4 {
                let chain = rules.chain_mut(direction, Family::V4);
                chain.rules.extend(peer_rules(direction, addr.into(), &ports));
            }
            if let Some(addr) = ep.ipv6 {
                let chain = rules.chain_mut(direction, Family::V6);
                chain.rules.extend(peer_rules(direction, addr.into(), &ports));
            }
        }
    }
}

/// Rules admitting traffic from (ingress) or to (egress) a single peer address.
fn peer_rules(
    direction: Direction,
    addr: IpAddr,
    ports: &[PortMatch],
) -> impl Iterator<Item = Rule> + '_ {
    let net = IpNet::from(addr);
    let base = match direction {
        Direction::Ingress => Rule {
            source: Some(net),
            ..Rule::default()
        },
        Direction::Egress => Rule {
            dest: Some(net),
            ..Rule::default()
        },
    };

    let unported = ports.is_empty().then(|| base.clone());
    let ported = ports.iter().map(move |p| Rule {
        protocol: Some(p.protocol),
        dest_port: p.port.clone(),
        ..base.clone()
    });
    unported.into_iter().chain(ported)
}

fn port_match(port: &PolicyPort) -> Option<PortMatch> {
    let protocol = match port.protocol.as_deref() {
        None | Some("") => Protocol::Tcp,
        Some(p) => match p.parse() {
            Ok(p) => p,
            Err(error) => {
                tracing::warn!(%error, "Ignoring port");
                return None;
            }
        },
    };

    let port = match &port.port {
        None => None,
        Some(IntOrString::Int(n)) => {
            match u16::try_from(*n).ok().and_then(NonZeroU16::new) {
                Some(n) => Some(Port::Number(n)),
                None => {
                    tracing::warn!(port = n, "Ignoring invalid port number");
                    return None;
                }
            }
        }
        Some(IntOrString::String(s)) => match s.parse::<u16>() {
            Ok(n) => match NonZeroU16::new(n) {
                Some(n) => Some(Port::Number(n)),
                None => {
                    tracing::warn!(port = %s, "Ignoring invalid port number");
                    return None;
                }
            },
            Err(_) if s.is_empty() => None,
            Err(_) => Some(Port::Name(s.clone())),
        },
    };

    Some(PortMatch { protocol, port })
}

// === impl RuleEntries ===

impl RuleEntries {
    fn select<I: Iterator>(self, entries: I) -> std::iter::Take<I> {
        match self {
            Self::First => entries.take(1),
            Self::All => entries.take(usize::MAX),
        }
    }
}

impl FromStr for RuleEntries {
    type Err = InvalidRuleEntries;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("first") {
            Ok(Self::First)
        } else if s.eq_ignore_ascii_case("all") {
            Ok(Self::All)
        } else {
            Err(InvalidRuleEntries(s.to_string()))
        }
    }
}

impl fmt::Display for RuleEntries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::First => "first".fmt(f),
            Self::All => "all".fmt(f),
        }
    }
}

// === impl PeerMatch ===

impl PeerMatch {
    /// Determines how `peer` selects endpoints. Networks of namespace-scoped kinds are resolved
    /// within `namespace`.
    pub fn from_peer(peer: &Peer, namespace: &str) -> Result<Self, SelectorError> {
        let labels = match &peer.pod_selector {
            Some(selector) => selector.as_map()?,
            None => Labels::new(),
        };
        let network = peer
            .network_selector
            .as_ref()
            .and_then(|sel| network_ref(sel, namespace));

        Ok(match (labels.is_empty(), network) {
            (false, None) => Self::Labels(labels),
            (true, Some(network)) => Self::Network(network),
            (false, Some(network)) => Self::Both { labels, network },
            (true, None) => Self::Nothing,
        })
    }

    /// Returns the selected endpoints, each at most once, in bucket order.
    pub fn resolve<'e>(&self, endpoints: &'e EndpointSet) -> Vec<&'e Endpoint> {
        match self {
            Self::Labels(labels) => by_labels(labels, endpoints),
            Self::Network(network) => endpoints.attached(network).collect(),
            Self::Both { labels, network } => {
                let labeled = by_labels(labels, endpoints);
                let attached = endpoints.attached(network).collect::<Vec<_>>();
                // A side that selects nothing does not constrain the other.
                if attached.is_empty() {
                    return labeled;
                }
                if labeled.is_empty() {
                    return attached;
                }
                let attached = attached
                    .into_iter()
                    .map(|ep| ep.uid.as_str())
                    .collect::<HashSet<_>>();
                labeled
                    .into_iter()
                    .filter(|ep| attached.contains(ep.uid.as_str()))
                    .collect()
            }
            Self::Nothing => Vec::new(),
        }
    }
}

fn by_labels<'e>(labels: &Labels, endpoints: &'e EndpointSet) -> Vec<&'e Endpoint> {
    let mut seen = HashSet::new();
    labels
        .iter()
        .flat_map(|(k, v)| endpoints.labeled(k, v))
        .filter(|&ep| seen.insert(ep.uid.as_str()))
        .collect()
}

fn network_ref(sel: &NetworkSelector, namespace: &str) -> Option<NetworkRef> {
    if sel.name.is_empty() {
        return None;
    }
    Some(NetworkRef::new(
        sel.name.clone(),
        NetworkKind::from_api_type(&sel.kind),
        namespace,
    ))
}
