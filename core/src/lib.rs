#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod names;
mod network_match;
mod ports;
mod protocol;

pub use self::{
    network_match::NetworkMatch,
    ports::NodePortRange,
    protocol::{Protocol, ProtocolPort},
};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::{collections::BTreeMap, net::IpAddr};

/// Packet mark set by policy chains when a rule admits the packet.
pub const MARK_POLICY_MATCHED: &str = "0x10000/0x10000";

/// Packet mark set at the tail of a pod firewall chain; the top-level custom
/// chains ACCEPT packets carrying it.
pub const MARK_ACCEPT: &str = "0x20000/0x20000";

/// A pod as it appears in the normalized policy model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodInfo {
    pub ip: IpAddr,
    pub name: String,
    pub namespace: String,
}

/// A network policy normalized against a cluster-state snapshot.
///
/// Semantics are strictly additive: a policy only ever contributes allows for
/// the pods its selector targets. A policy with no ingress rules contributes
/// no ingress allows; it does not mean "allow all".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyInfo {
    pub namespace: String,
    pub name: String,
    pub policy_type: PolicyType,

    /// Pods selected by the policy's pod selector, keyed by pod IP.
    ///
    /// Keyed maps are ordered so that successive syncs over unchanged state
    /// emit identical rule text.
    pub target_pods: BTreeMap<IpAddr, PodInfo>,

    pub ingress_rules: Vec<PolicyRule>,
    pub egress_rules: Vec<PolicyRule>,
}

/// Which directions a policy applies to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PolicyType {
    Ingress,
    Egress,
    Both,
}

/// A single allow rule. Peers are traffic sources for ingress rules and
/// destinations for egress rules.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyRule {
    /// The rule declared no ports, so it matches every port.
    pub match_all_ports: bool,
    pub ports: Vec<ProtocolPort>,

    /// Named ports resolved into concrete (protocol, port, exposing-pods)
    /// endpoints.
    pub named_ports: Vec<NamedPortEndpoints>,

    /// The rule declared no peers, so it matches every peer.
    pub match_all_peers: bool,
    pub peer_pods: BTreeMap<IpAddr, PodInfo>,
    pub ip_blocks: Vec<NetworkMatch>,
}

/// A named container port resolved against the pods that expose it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedPortEndpoints {
    pub protocol: Protocol,
    pub port: u16,
    pub ips: Vec<IpAddr>,
}

// === impl PolicyType ===

impl PolicyType {
    pub fn applies_ingress(&self) -> bool {
        matches!(self, Self::Ingress | Self::Both)
    }

    pub fn applies_egress(&self) -> bool {
        matches!(self, Self::Egress | Self::Both)
    }

    /// Normalizes the `policyTypes` field of a policy spec. A policy that
    /// declares neither direction applies to ingress only.
    pub fn from_declared(types: &[String]) -> Self {
        let ingress = types.iter().any(|t| t.eq_ignore_ascii_case("ingress"));
        let egress = types.iter().any(|t| t.eq_ignore_ascii_case("egress"));
        match (ingress, egress) {
            (_, false) => Self::Ingress,
            (false, true) => Self::Egress,
            (true, true) => Self::Both,
        }
    }
}
