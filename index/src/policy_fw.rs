//! Per-policy chain composition.
//!
//! Each policy gets a chain (freshly named per sync version) whose rules
//! mark-and-return for every (peer-group x port-group) combination of its
//! normalized rules. Pod peers are matched through IP sets refreshed here;
//! IP-block peers become plain CIDR matches with their exceptions expanded
//! away. Ingress rules additionally match the policy's destination target
//! set and egress rules its source target set, scoping the shared chain to
//! the policy's own pods.

use crate::ipset::Ipsets;
use anyhow::{Context, Result};
use netpol_agent_core::{names, IpNet, PolicyInfo, PolicyRule, Protocol, MARK_POLICY_MATCHED};
use std::collections::HashSet;
use std::fmt::Write;

pub(crate) const SET_TYPE_HASH_IP: &str = "hash:ip";
pub(crate) const SET_OPTIONS: &[&str] = &["timeout", "0"];

/// One side of a rule match.
enum PeerMatch<'a> {
    Set(&'a str),
    Net(IpNet),
    Any,
}

/// Appends every policy's chain declaration and rules to the table buffer,
/// refreshing the IP sets they reference. Returns the names of the active
/// policy chains and active sets.
pub(crate) async fn sync_policy_chains(
    table: &mut String,
    ipsets: &dyn Ipsets,
    policies: &[PolicyInfo],
    version: &str,
) -> Result<(HashSet<String>, HashSet<String>)> {
    let mut active_chains = HashSet::new();
    let mut active_sets = HashSet::new();

    for policy in policies {
        let chain = names::policy_chain(&policy.namespace, &policy.name, version);
        table.push_str(&format!(":{chain} - [0:0]\n"));
        active_chains.insert(chain.clone());

        let target_ips = policy
            .target_pods
            .keys()
            .map(ToString::to_string)
            .collect::<Vec<_>>();

        if policy.policy_type.applies_ingress() {
            let target_set = names::policy_destination_set(&policy.namespace, &policy.name);
            refresh_set(ipsets, &target_set, &target_ips, &mut active_sets).await?;

            for (idx, rule) in policy.ingress_rules.iter().enumerate() {
                let named_sets =
                    refresh_named_port_sets(ipsets, policy, idx, rule, true, &mut active_sets)
                        .await?;

                if !rule.peer_pods.is_empty() {
                    let peer_set =
                        names::ingress_rule_peer_set(&policy.namespace, &policy.name, idx);
                    let peers = rule.peer_pods.keys().map(ToString::to_string).collect::<Vec<_>>();
                    refresh_set(ipsets, &peer_set, &peers, &mut active_sets).await?;
                    emit_ingress_combos(
                        table,
                        &chain,
                        policy,
                        rule,
                        &PeerMatch::Set(&peer_set),
                        &target_set,
                        &named_sets,
                    );
                }
                if rule.match_all_peers {
                    emit_ingress_combos(
                        table,
                        &chain,
                        policy,
                        rule,
                        &PeerMatch::Any,
                        &target_set,
                        &named_sets,
                    );
                }
                for block in &rule.ip_blocks {
                    for net in block.allowed_nets() {
                        emit_ingress_combos(
                            table,
                            &chain,
                            policy,
                            rule,
                            &PeerMatch::Net(net),
                            &target_set,
                            &named_sets,
                        );
                    }
                }
            }
        }

        if policy.policy_type.applies_egress() {
            let target_set = names::policy_source_set(&policy.namespace, &policy.name);
            refresh_set(ipsets, &target_set, &target_ips, &mut active_sets).await?;

            for (idx, rule) in policy.egress_rules.iter().enumerate() {
                let named_sets =
                    refresh_named_port_sets(ipsets, policy, idx, rule, false, &mut active_sets)
                        .await?;

                if !rule.peer_pods.is_empty() {
                    let peer_set =
                        names::egress_rule_peer_set(&policy.namespace, &policy.name, idx);
                    let peers = rule.peer_pods.keys().map(ToString::to_string).collect::<Vec<_>>();
                    refresh_set(ipsets, &peer_set, &peers, &mut active_sets).await?;
                    emit_egress_combos(
                        table,
                        &chain,
                        policy,
                        rule,
                        &PeerMatch::Set(&peer_set),
                        &target_set,
                        &named_sets,
                    );
                }
                if rule.match_all_peers {
                    emit_egress_combos(
                        table,
                        &chain,
                        policy,
                        rule,
                        &PeerMatch::Any,
                        &target_set,
                        &named_sets,
                    );
                }
                for block in &rule.ip_blocks {
                    for net in block.allowed_nets() {
                        emit_egress_combos(
                            table,
                            &chain,
                            policy,
                            rule,
                            &PeerMatch::Net(net),
                            &target_set,
                            &named_sets,
                        );
                    }
                }
            }
        }
    }

    Ok((active_chains, active_sets))
}

async fn refresh_set(
    ipsets: &dyn Ipsets,
    name: &str,
    members: &[String],
    active: &mut HashSet<String>,
) -> Result<()> {
    ipsets
        .refresh(name, SET_TYPE_HASH_IP, SET_OPTIONS, members)
        .await
        .with_context(|| format!("failed to refresh ipset {name}"))?;
    active.insert(name.to_string());
    Ok(())
}

/// Materializes the endpoint set for every named port of a rule.
async fn refresh_named_port_sets(
    ipsets: &dyn Ipsets,
    policy: &PolicyInfo,
    rule_idx: usize,
    rule: &PolicyRule,
    ingress: bool,
    active: &mut HashSet<String>,
) -> Result<Vec<(String, Protocol, u16)>> {
    let mut sets = Vec::with_capacity(rule.named_ports.len());
    for (port_idx, eps) in rule.named_ports.iter().enumerate() {
        let set = if ingress {
            names::ingress_named_port_set(&policy.namespace, &policy.name, rule_idx, port_idx)
        } else {
            names::egress_named_port_set(&policy.namespace, &policy.name, rule_idx, port_idx)
        };
        let members = eps.ips.iter().map(ToString::to_string).collect::<Vec<_>>();
        refresh_set(ipsets, &set, &members, active).await?;
        sets.push((set, eps.protocol, eps.port));
    }
    Ok(sets)
}

fn emit_ingress_combos(
    table: &mut String,
    chain: &str,
    policy: &PolicyInfo,
    rule: &PolicyRule,
    src: &PeerMatch<'_>,
    target_set: &str,
    named_sets: &[(String, Protocol, u16)],
) {
    let comment = format!(
        "rule to mark traffic matching an ingress rule of policy: {} namespace {}",
        policy.name, policy.namespace
    );
    for pp in &rule.ports {
        append_match_pair(
            table,
            chain,
            &comment,
            src,
            &PeerMatch::Set(target_set),
            Some((pp.protocol, pp.port)),
        );
    }
    for (set, protocol, port) in named_sets {
        append_match_pair(
            table,
            chain,
            &comment,
            src,
            &PeerMatch::Set(set),
            Some((*protocol, Some(*port))),
        );
    }
    if rule.match_all_ports {
        append_match_pair(table, chain, &comment, src, &PeerMatch::Set(target_set), None);
    }
}

fn emit_egress_combos(
    table: &mut String,
    chain: &str,
    policy: &PolicyInfo,
    rule: &PolicyRule,
    dst: &PeerMatch<'_>,
    target_set: &str,
    named_sets: &[(String, Protocol, u16)],
) {
    let comment = format!(
        "rule to mark traffic matching an egress rule of policy: {} namespace {}",
        policy.name, policy.namespace
    );
    let src = PeerMatch::Set(target_set);
    for pp in &rule.ports {
        append_match_pair(table, chain, &comment, &src, dst, Some((pp.protocol, pp.port)));
    }
    for (set, protocol, port) in named_sets {
        // The endpoint set already restricts the destination to the peer
        // pods exposing the name; a CIDR peer keeps its address match and
        // takes the resolved numeric port.
        let dst = match dst {
            PeerMatch::Net(net) => PeerMatch::Net(*net),
            _ => PeerMatch::Set(set),
        };
        append_match_pair(
            table,
            chain,
            &comment,
            &src,
            &dst,
            Some((*protocol, Some(*port))),
        );
    }
    if rule.match_all_ports {
        append_match_pair(table, chain, &comment, &src, dst, None);
    }
}

/// Appends the two rules implementing one match combination: set the
/// policy-matched mark, then return out of the chain when it is set.
fn append_match_pair(
    table: &mut String,
    chain: &str,
    comment: &str,
    src: &PeerMatch<'_>,
    dst: &PeerMatch<'_>,
    port: Option<(Protocol, Option<u16>)>,
) {
    let mut spec = format!("-m comment --comment \"{comment}\"");
    match src {
        PeerMatch::Set(set) => {
            let _ = write!(spec, " -m set --match-set {set} src");
        }
        PeerMatch::Net(net) => {
            let _ = write!(spec, " -s {net}");
        }
        PeerMatch::Any => {}
    }
    match dst {
        PeerMatch::Set(set) => {
            let _ = write!(spec, " -m set --match-set {set} dst");
        }
        PeerMatch::Net(net) => {
            let _ = write!(spec, " -d {net}");
        }
        PeerMatch::Any => {}
    }
    if let Some((protocol, port)) = port {
        let _ = write!(spec, " -p {protocol}");
        if let Some(port) = port {
            let _ = write!(spec, " --dport {port}");
        }
    }

    table.push_str(&format!(
        "-A {chain} {spec} -j MARK --set-xmark {MARK_POLICY_MATCHED}\n"
    ));
    table.push_str(&format!(
        "-A {chain} {spec} -m mark --mark {MARK_POLICY_MATCHED} -j RETURN\n"
    ));
}
