use netpol_agent_core::{IpNet, NodePortRange};
use std::net::IpAddr;
use tokio::time;

/// Node- and cluster-level settings the engine is constructed with.
///
/// All fields are parsed and validated before the engine is built; an
/// invalid CIDR or port range never produces an engine instance.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// Hostname of the node this agent enforces policies on.
    pub node_name: String,

    /// The node's primary IP. Pods whose host IP matches are local and get a
    /// firewall chain; all other pods only ever appear as peers.
    pub node_ip: IpAddr,

    /// The node's pod CIDR, when known. With a CIDR, the jumps from the
    /// built-in chains are scoped so traffic that is not to or from local
    /// pods bypasses the engine entirely.
    pub pod_cidr: Option<IpNet>,

    /// The service cluster-IP range. Traffic to service VIPs is exempted
    /// from enforcement; the service proxy rewrites it before pod-scoped
    /// rules apply.
    pub service_cluster_cidr: IpNet,

    /// Additional service external-IP ranges exempted from enforcement.
    pub service_external_ranges: Vec<IpNet>,

    /// The node-port range exempted from enforcement for local-addressed
    /// TCP and UDP traffic.
    pub node_port_range: NodePortRange,

    /// Period of the full-sync ticker.
    pub sync_period: time::Duration,

    /// Accept (instead of reject) pod traffic in the window between a pod
    /// starting and its firewall chain being installed.
    pub allow_pre_enforcement: bool,
}
