//! Per-pod firewall chain composition.
//!
//! Every local pod gets a chain (freshly named per sync version) that its
//! inbound and outbound traffic is funneled through by intercept rules
//! inserted at the head of the custom top-level chains.
//!
//! Rules inside the chain are emitted as position-1 inserts, so the
//! installed order is the reverse of emission: conntrack accepts first,
//! then the node-local accept, then the policy-chain jumps (or the default
//! policy jump). The appended tail is evaluated last: log and reject
//! anything the policy chains did not mark, then clear the matched mark and
//! set the accept mark for traffic that survived.

use crate::cluster_info::ClusterInfo;
use crate::index::ClusterSnapshot;
use netpol_agent_core::{names, PodInfo, PolicyInfo, MARK_ACCEPT, MARK_POLICY_MATCHED};
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;

/// Appends a firewall chain for every local pod to the table buffer.
/// Returns the names of the active pod chains.
pub(crate) fn sync_pod_fw_chains(
    table: &mut String,
    snapshot: &ClusterSnapshot,
    policies: &[PolicyInfo],
    config: &ClusterInfo,
    version: &str,
) -> HashSet<String> {
    let mut active = HashSet::new();
    for pod in local_pods(snapshot, config.node_ip).values() {
        let chain = names::pod_fw_chain(&pod.namespace, &pod.name, version);
        table.push_str(&format!(":{chain} - [0:0]\n"));
        active.insert(chain.clone());

        setup_pod_ingress_rules(table, pod, &chain, policies, version);
        setup_pod_egress_rules(table, pod, &chain, policies, version);
        append_unmatched_traffic_rules(table, pod, &chain);
        append_matched_traffic_rules(table, &chain);
        intercept_pod_inbound_traffic(table, pod, &chain);
        intercept_pod_outbound_traffic(table, pod, &chain);
    }
    active
}

/// Pods scheduled on this node that carry a routable IP, keyed by IP.
pub(crate) fn local_pods(
    snapshot: &ClusterSnapshot,
    node_ip: IpAddr,
) -> BTreeMap<IpAddr, PodInfo> {
    snapshot
        .pods
        .iter()
        .filter(|pod| pod.is_local(node_ip))
        .filter_map(|pod| pod.routable_ip().map(|ip| (ip, pod.to_pod_info(ip))))
        .collect()
}

fn insert1(table: &mut String, chain: &str, spec: &str) {
    table.push_str(&format!("-I {chain} 1 {spec}\n"));
}

fn append(table: &mut String, chain: &str, spec: &str) {
    table.push_str(&format!("-A {chain} {spec}\n"));
}

/// Jumps the pod's inbound traffic through the policy chains that target
/// it, falling through to the default ingress chain when none do.
fn setup_pod_ingress_rules(
    table: &mut String,
    pod: &PodInfo,
    chain: &str,
    policies: &[PolicyInfo],
    version: &str,
) {
    let mut has_policy = false;
    for policy in policies {
        if !policy.policy_type.applies_ingress() || !policy.target_pods.contains_key(&pod.ip) {
            continue;
        }
        has_policy = true;
        let policy_chain = names::policy_chain(&policy.namespace, &policy.name, version);
        insert1(
            table,
            chain,
            &format!(
                "-m comment --comment \"run through nw policy {}\" -j {policy_chain}",
                policy.name
            ),
        );
    }

    if !has_policy {
        insert1(
            table,
            chain,
            &format!(
                "-d {} -m comment --comment \"run through default ingress policy chain\" -j {}",
                pod.ip,
                names::DEFAULT_INGRESS_CHAIN
            ),
        );
    }

    insert1(
        table,
        chain,
        &format!(
            "-m comment --comment \"rule to permit the traffic to pods when source is the pod's local node\" -m addrtype --src-type LOCAL -d {} -j ACCEPT",
            pod.ip
        ),
    );

    insert1(
        table,
        chain,
        "-m comment --comment \"rule for stateful firewall for pod\" -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT",
    );
}

/// Jumps the pod's outbound traffic through the policy chains that target
/// it, falling through to the default egress chain when none do.
fn setup_pod_egress_rules(
    table: &mut String,
    pod: &PodInfo,
    chain: &str,
    policies: &[PolicyInfo],
    version: &str,
) {
    let mut has_policy = false;
    for policy in policies {
        if !policy.policy_type.applies_egress() || !policy.target_pods.contains_key(&pod.ip) {
            continue;
        }
        has_policy = true;
        let policy_chain = names::policy_chain(&policy.namespace, &policy.name, version);
        insert1(
            table,
            chain,
            &format!(
                "-m comment --comment \"run through nw policy {}\" -j {policy_chain}",
                policy.name
            ),
        );
    }

    if !has_policy {
        insert1(
            table,
            chain,
            &format!(
                "-s {} -m comment --comment \"run through default egress policy chain\" -j {}",
                pod.ip,
                names::DEFAULT_EGRESS_CHAIN
            ),
        );
    }

    insert1(
        table,
        chain,
        "-m comment --comment \"rule for stateful firewall for pod\" -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT",
    );
}

/// Logs and rejects traffic no policy chain marked. Installed ahead of the
/// mark tail because these are plain appends.
fn append_unmatched_traffic_rules(table: &mut String, pod: &PodInfo, chain: &str) {
    append(
        table,
        chain,
        &format!(
            "-m comment --comment \"rule to log dropped traffic POD name:{} namespace: {}\" -m mark ! --mark {MARK_POLICY_MATCHED} -j NFLOG --nflog-group 100 -m limit --limit 10/minute --limit-burst 10",
            pod.name, pod.namespace
        ),
    );
    append(
        table,
        chain,
        &format!(
            "-m comment --comment \"rule to REJECT traffic destined for POD name:{} namespace: {}\" -m mark ! --mark {MARK_POLICY_MATCHED} -j REJECT",
            pod.name, pod.namespace
        ),
    );
}

/// Clears the matched mark so a re-traversal through the peer pod's chain
/// starts clean, then sets the accept mark the top-level chains test.
fn append_matched_traffic_rules(table: &mut String, chain: &str) {
    append(table, chain, "-j MARK --set-mark 0/0x10000");
    append(
        table,
        chain,
        &format!(
            "-m comment --comment \"set mark to ACCEPT traffic that comply to network policies\" -j MARK --set-mark {MARK_ACCEPT}"
        ),
    );
}

fn intercept_pod_inbound_traffic(table: &mut String, pod: &PodInfo, chain: &str) {
    let comment = format!(
        "rule to jump traffic destined to POD name:{} namespace: {} to chain {chain}",
        pod.name, pod.namespace
    );

    // routed traffic from pods on other nodes
    insert1(
        table,
        names::FORWARD_CHAIN,
        &format!("-m comment --comment \"{comment}\" -d {} -j {chain}", pod.ip),
    );

    // traffic a pod sent through the service proxy back to this node
    insert1(
        table,
        names::OUTPUT_CHAIN,
        &format!("-m comment --comment \"{comment}\" -d {} -j {chain}", pod.ip),
    );

    // switched traffic from pods on the same node
    insert1(
        table,
        names::FORWARD_CHAIN,
        &format!(
            "-m physdev --physdev-is-bridged -m comment --comment \"{comment}\" -d {} -j {chain}",
            pod.ip
        ),
    );
}

fn intercept_pod_outbound_traffic(table: &mut String, pod: &PodInfo, chain: &str) {
    let comment = format!(
        "rule to jump traffic from POD name:{} namespace: {} to chain {chain}",
        pod.name, pod.namespace
    );

    for top_level in [names::INPUT_CHAIN, names::FORWARD_CHAIN, names::OUTPUT_CHAIN] {
        insert1(
            table,
            top_level,
            &format!("-m comment --comment \"{comment}\" -s {} -j {chain}", pod.ip),
        );
    }

    // switched traffic towards pods on the same node
    insert1(
        table,
        names::FORWARD_CHAIN,
        &format!(
            "-m physdev --physdev-is-bridged -m comment --comment \"{comment}\" -s {} -j {chain}",
            pod.ip
        ),
    );
}
