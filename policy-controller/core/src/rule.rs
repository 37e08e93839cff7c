use ipnet::IpNet;
use std::{fmt, num::NonZeroU16, path::PathBuf, str::FromStr};

pub const FILTER_TABLE: &str = "filter";

pub const INPUT_CHAIN: &str = "INPUT";
pub const OUTPUT_CHAIN: &str = "OUTPUT";
pub const FORWARD_CHAIN: &str = "FORWARD";

// These names are visible to anything inspecting a workload's rules, so they must not change.
pub const INGRESS_V4_CHAIN: &str = "DANM_INGRESS_V4";
pub const INGRESS_V6_CHAIN: &str = "DANM_INGRESS_V6";
pub const EGRESS_V4_CHAIN: &str = "DANM_EGRESS_V4";
pub const EGRESS_V6_CHAIN: &str = "DANM_EGRESS_V6";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ingress,
    Egress,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown protocol: {0}")]
pub struct UnknownProtocol(String);

/// References a port by number or by service name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Port {
    Number(NonZeroU16),
    Name(String),
}

/// What the packet filter does with a packet that matches a rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Accept,
    Reject,
    Return,
    Jump(&'static str),
}

/// A single packet-filter rule. Unset fields do not constrain the match.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rule {
    pub protocol: Option<Protocol>,
    pub source_port: Option<Port>,
    pub dest_port: Option<Port>,
    pub in_iface: Option<String>,
    pub out_iface: Option<String>,
    pub source: Option<IpNet>,
    pub dest: Option<IpNet>,

    /// Accept when unset.
    pub action: Option<Action>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chain {
    pub name: &'static str,
    pub direction: Direction,
    pub family: Family,
    pub rules: Vec<Rule>,
}

/// The compiled rules for a single workload, one chain per direction and address family.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleSet {
    /// The workload's network namespace.
    pub netns: PathBuf,

    pub ingress_v4: Chain,
    pub ingress_v6: Chain,
    pub egress_v4: Chain,
    pub egress_v6: Chain,
}

// === impl Direction ===

impl Direction {
    /// The built-in chain that traffic in this direction traverses.
    pub fn builtin_chain(&self) -> &'static str {
        match self {
            Self::Ingress => INPUT_CHAIN,
            Self::Egress => OUTPUT_CHAIN,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingress => "ingress".fmt(f),
            Self::Egress => "egress".fmt(f),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => "ipv4".fmt(f),
            Self::V6 => "ipv6".fmt(f),
        }
    }
}

// === impl Protocol ===

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(Self::Udp)
        } else if s.eq_ignore_ascii_case("sctp") {
            Ok(Self::Sctp)
        } else {
            Err(UnknownProtocol(s.to_string()))
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => "tcp".fmt(f),
            Self::Udp => "udp".fmt(f),
            Self::Sctp => "sctp".fmt(f),
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => fmt::Display::fmt(n, f),
            Self::Name(n) => fmt::Display::fmt(n, f),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => "ACCEPT".fmt(f),
            Self::Reject => "REJECT".fmt(f),
            Self::Return => "RETURN".fmt(f),
            Self::Jump(chain) => chain.fmt(f),
        }
    }
}

// === impl Rule ===

impl Rule {
    pub fn jump(chain: &'static str) -> Self {
        Self {
            action: Some(Action::Jump(chain)),
            ..Self::default()
        }
    }

    pub fn returning() -> Self {
        Self {
            action: Some(Action::Return),
            ..Self::default()
        }
    }

    pub fn reject() -> Self {
        Self {
            action: Some(Action::Reject),
            ..Self::default()
        }
    }

    /// Renders the rule as packet-filter arguments.
    ///
    /// Flags are always emitted in the same order so that an existing rule can be found again by
    /// an exact match on its arguments.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(protocol) = self.protocol {
            args.extend(["-p".to_string(), protocol.to_string()]);
        }
        if let Some(port) = &self.source_port {
            args.extend(["--sport".to_string(), port.to_string()]);
        }
        if let Some(port) = &self.dest_port {
            args.extend(["--dport".to_string(), port.to_string()]);
        }
        if let Some(iface) = &self.in_iface {
            args.extend(["-i".to_string(), iface.clone()]);
        }
        if let Some(iface) = &self.out_iface {
            args.extend(["-o".to_string(), iface.clone()]);
        }
        if let Some(net) = &self.source {
            args.extend(["-s".to_string(), net.to_string()]);
        }
        if let Some(net) = &self.dest {
            args.extend(["-d".to_string(), net.to_string()]);
        }
        let action = self.action.as_ref().unwrap_or(&Action::Accept);
        args.extend(["-j".to_string(), action.to_string()]);
        args
    }
}

// === impl Chain ===

impl Chain {
    fn new(name: &'static str, direction: Direction, family: Family) -> Self {
        Self {
            name,
            direction,
            family,
            rules: Vec::new(),
        }
    }
}

// === impl RuleSet ===

impl RuleSet {
    pub fn new(netns: impl Into<PathBuf>) -> Self {
        Self {
            netns: netns.into(),
            ingress_v4: Chain::new(INGRESS_V4_CHAIN, Direction::Ingress, Family::V4),
            ingress_v6: Chain::new(INGRESS_V6_CHAIN, Direction::Ingress, Family::V6),
            egress_v4: Chain::new(EGRESS_V4_CHAIN, Direction::Egress, Family::V4),
            egress_v6: Chain::new(EGRESS_V6_CHAIN, Direction::Egress, Family::V6),
        }
    }

    pub fn chain(&self, direction: Direction, family: Family) -> &Chain {
        match (direction, family) {
            (Direction::Ingress, Family::V4) => &self.ingress_v4,
            (Direction::Ingress, Family::V6) => &self.ingress_v6,
            (Direction::Egress, Family::V4) => &self.egress_v4,
            (Direction::Egress, Family::V6) => &self.egress_v6,
        }
    }

    pub fn chain_mut(&mut self, direction: Direction, family: Family) -> &mut Chain {
        match (direction, family) {
            (Direction::Ingress, Family::V4) => &mut self.ingress_v4,
            (Direction::Ingress, Family::V6) => &mut self.ingress_v6,
            (Direction::Egress, Family::V4) => &mut self.egress_v4,
            (Direction::Egress, Family::V6) => &mut self.egress_v6,
        }
    }

    pub fn chains(&self) -> [&Chain; 4] {
        [
            &self.ingress_v4,
            &self.ingress_v6,
            &self.egress_v4,
            &self.egress_v6,
        ]
    }

    /// The total number of compiled rules across all chains.
    pub fn len(&self) -> usize {
        self.chains().iter().map(|c| c.rules.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
