//! Builds the normalized policy model from a cluster-state snapshot.
//!
//! Target pods are resolved by the policy's pod selector within its own
//! namespace. Peer clauses expand to pod-IP maps or CIDR matches; named
//! ports resolve to the concrete (protocol, port, exposing-pods) endpoints
//! they name. Any evaluation error aborts the sync before host state is
//! touched.

use crate::index::{ClusterSnapshot, PodMeta, PolicyMeta};
use anyhow::{Context, Result};
use netpol_agent_core::{
    NamedPortEndpoints, NetworkMatch, PolicyInfo, PolicyRule, PolicyType, Protocol, ProtocolPort,
};
use netpol_agent_k8s::{self as k8s, Selector};
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;

pub(crate) fn build_policy_model(snapshot: &ClusterSnapshot) -> Result<Vec<PolicyInfo>> {
    snapshot
        .policies
        .iter()
        .map(|meta| {
            build_policy(meta, snapshot).with_context(|| {
                format!("failed to evaluate policy {}/{}", meta.namespace, meta.name)
            })
        })
        .collect()
}

fn build_policy(meta: &PolicyMeta, snapshot: &ClusterSnapshot) -> Result<PolicyInfo> {
    let spec = &*meta.spec;
    let selector = Selector::from(spec.pod_selector.clone());

    let targets = snapshot
        .pods
        .iter()
        .filter(|pod| pod.namespace == meta.namespace && selector.matches(&pod.labels))
        .collect::<Vec<_>>();
    let target_pods = targets
        .iter()
        .filter_map(|pod| pod.routable_ip().map(|ip| (ip, pod.to_pod_info(ip))))
        .collect::<BTreeMap<_, _>>();

    let policy_type = PolicyType::from_declared(spec.policy_types.as_deref().unwrap_or(&[]));

    let mut ingress_rules = Vec::new();
    if policy_type.applies_ingress() {
        // Ingress ports name ports on the targets themselves.
        let target_ports = NamedPortIndex::build(targets.iter().copied());
        for rule in spec.ingress.iter().flatten() {
            ingress_rules.push(build_ingress_rule(meta, rule, snapshot, &target_ports)?);
        }
    }

    let mut egress_rules = Vec::new();
    if policy_type.applies_egress() {
        for rule in spec.egress.iter().flatten() {
            egress_rules.push(build_egress_rule(meta, rule, snapshot)?);
        }
    }

    Ok(PolicyInfo {
        namespace: meta.namespace.clone(),
        name: meta.name.clone(),
        policy_type,
        target_pods,
        ingress_rules,
        egress_rules,
    })
}

fn build_ingress_rule(
    meta: &PolicyMeta,
    rule: &k8s::NetworkPolicyIngressRule,
    snapshot: &ClusterSnapshot,
    target_ports: &NamedPortIndex,
) -> Result<PolicyRule> {
    let mut out = PolicyRule::default();
    build_peers(&meta.namespace, rule.from.as_deref(), snapshot, &mut out)?;
    build_ports(rule.ports.as_deref(), target_ports, &mut out)?;
    Ok(out)
}

fn build_egress_rule(
    meta: &PolicyMeta,
    rule: &k8s::NetworkPolicyEgressRule,
    snapshot: &ClusterSnapshot,
) -> Result<PolicyRule> {
    let mut out = PolicyRule::default();
    build_peers(&meta.namespace, rule.to.as_deref(), snapshot, &mut out)?;

    // Egress ports name ports on the peer pods the traffic is headed to.
    let peer_metas = snapshot
        .pods
        .iter()
        .filter(|pod| {
            pod.routable_ip()
                .map_or(false, |ip| out.peer_pods.contains_key(&ip))
        })
        .collect::<Vec<_>>();
    let peer_ports = NamedPortIndex::build(peer_metas.into_iter());
    build_ports(rule.ports.as_deref(), &peer_ports, &mut out)?;
    Ok(out)
}

fn build_peers(
    policy_ns: &str,
    peers: Option<&[k8s::NetworkPolicyPeer]>,
    snapshot: &ClusterSnapshot,
    out: &mut PolicyRule,
) -> Result<()> {
    let peers = match peers {
        None | Some([]) => {
            out.match_all_peers = true;
            return Ok(());
        }
        Some(peers) => peers,
    };

    for peer in peers {
        if peer.pod_selector.is_none() && peer.namespace_selector.is_none() {
            if let Some(block) = &peer.ip_block {
                out.ip_blocks.push(parse_ip_block(block)?);
            }
            continue;
        }
        for pod in eval_pod_peer(policy_ns, peer, snapshot) {
            if let Some(ip) = pod.routable_ip() {
                out.peer_pods.insert(ip, pod.to_pod_info(ip));
            }
        }
    }
    Ok(())
}

/// Expands a selector-bearing peer into matching pods.
///
/// A namespace selector widens the search to every matching namespace
/// (restricted by the pod selector when both are present); a bare pod
/// selector is scoped to the policy's own namespace.
fn eval_pod_peer<'a>(
    policy_ns: &str,
    peer: &k8s::NetworkPolicyPeer,
    snapshot: &'a ClusterSnapshot,
) -> Vec<&'a PodMeta> {
    if let Some(ns_selector) = &peer.namespace_selector {
        let ns_selector = Selector::from(ns_selector.clone());
        let pod_selector = peer.pod_selector.clone().map(Selector::from);
        let namespaces = snapshot
            .namespaces
            .iter()
            .filter(|(_, labels)| ns_selector.matches(labels))
            .map(|(name, _)| name.as_str())
            .collect::<HashSet<_>>();
        snapshot
            .pods
            .iter()
            .filter(|pod| {
                namespaces.contains(pod.namespace.as_str())
                    && pod_selector
                        .as_ref()
                        .map_or(true, |sel| sel.matches(&pod.labels))
            })
            .collect()
    } else if let Some(pod_selector) = &peer.pod_selector {
        let pod_selector = Selector::from(pod_selector.clone());
        snapshot
            .pods
            .iter()
            .filter(|pod| pod.namespace == policy_ns && pod_selector.matches(&pod.labels))
            .collect()
    } else {
        Vec::new()
    }
}

fn parse_ip_block(block: &k8s::IPBlock) -> Result<NetworkMatch> {
    let net = block
        .cidr
        .parse()
        .with_context(|| format!("invalid CIDR {:?}", block.cidr))?;
    let except = block
        .except
        .iter()
        .flatten()
        .map(|e| {
            e.parse()
                .with_context(|| format!("invalid exception CIDR {:?}", e))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(NetworkMatch { net, except })
}

fn build_ports(
    ports: Option<&[k8s::NetworkPolicyPort]>,
    named: &NamedPortIndex,
    out: &mut PolicyRule,
) -> Result<()> {
    let ports = match ports {
        None | Some([]) => {
            out.match_all_ports = true;
            return Ok(());
        }
        Some(ports) => ports,
    };

    for port in ports {
        let protocol = port
            .protocol
            .as_deref()
            .map(|p| p.parse::<Protocol>())
            .transpose()?
            .unwrap_or_default();
        match &port.port {
            None => out.ports.push(ProtocolPort {
                protocol,
                port: None,
            }),
            Some(k8s::IntOrString::Int(number)) => out.ports.push(ProtocolPort {
                protocol,
                port: Some(
                    u16::try_from(*number)
                        .with_context(|| format!("port {} out of range", number))?,
                ),
            }),
            Some(k8s::IntOrString::String(name)) => {
                out.named_ports.extend(named.lookup(name, protocol));
            }
        }
    }
    Ok(())
}

/// Maps a port name to the concrete ports and pod IPs exposing it. A name
/// may resolve to several numeric ports when containers disagree.
#[derive(Debug, Default)]
struct NamedPortIndex(BTreeMap<String, BTreeMap<(Protocol, u16), Vec<IpAddr>>>);

impl NamedPortIndex {
    fn build<'a>(pods: impl Iterator<Item = &'a PodMeta>) -> Self {
        let mut index = Self::default();
        for pod in pods {
            let ip = match pod.routable_ip() {
                Some(ip) => ip,
                None => continue,
            };
            for port in &pod.named_ports {
                index
                    .0
                    .entry(port.name.clone())
                    .or_default()
                    .entry((port.protocol, port.port))
                    .or_default()
                    .push(ip);
            }
        }
        index
    }

    fn lookup(&self, name: &str, protocol: Protocol) -> Vec<NamedPortEndpoints> {
        self.0
            .get(name)
            .into_iter()
            .flat_map(|by_port| {
                by_port
                    .iter()
                    .filter(move |((p, _), _)| *p == protocol)
                    .map(|((p, port), ips)| NamedPortEndpoints {
                        protocol: *p,
                        port: *port,
                        ips: ips.clone(),
                    })
            })
            .collect()
    }
}
