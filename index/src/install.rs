//! Top-level chain installation.
//!
//! Runs at the start of every full sync and is idempotent. The jump from
//! each built-in chain to the engine's custom chain sits at position 1 so
//! that traffic to or from local pods traverses the engine before any other
//! user rule can accept it. Jump rules are identified by a hash of their
//! spec embedded in the comment; a rule that has drifted from its position
//! is reinstalled.
//!
//! Failures here (other than a chain already existing) are escalated as
//! fatal by the engine: without these chains it cannot uphold its claim to
//! be authoritative for pod traffic.

use crate::cluster_info::ClusterInfo;
use crate::iptables::FilterTable;
use anyhow::{bail, Context, Result};
use netpol_agent_core::{names, MARK_ACCEPT, MARK_POLICY_MATCHED};

/// Comment marker carried by every rule the installer places in a built-in
/// chain.
const COMMENT_MARKER: &str = "netpol-agent";

const CHAINS: &[(&str, &str)] = &[
    ("INPUT", names::INPUT_CHAIN),
    ("FORWARD", names::FORWARD_CHAIN),
    ("OUTPUT", names::OUTPUT_CHAIN),
];

fn strs(args: &[&str]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

/// Appends the rule-identity token to the spec's comment, returning the
/// amended spec and the token.
fn with_rule_uuid(chain: &str, mut args: Vec<String>) -> Result<(Vec<String>, String)> {
    let uuid = names::rule_uuid(chain, &args);
    match args.iter().position(|arg| arg == "--comment") {
        Some(idx) if idx + 1 < args.len() => {
            args[idx + 1] = format!("{} - {}", args[idx + 1], uuid);
            Ok((args, uuid))
        }
        _ => bail!("no comment in rule spec: {}", args.join(" ")),
    }
}

/// Installs a rule at the given position, or moves it back there if an
/// earlier installation has drifted.
async fn ensure_rule_at_position(
    fw: &dyn FilterTable,
    chain: &str,
    args: Vec<String>,
    position: usize,
) -> Result<()> {
    let (args, uuid) = with_rule_uuid(chain, args)?;

    if !fw
        .rule_exists(chain, &args)
        .await
        .with_context(|| format!("failed to check rule in chain {chain}"))?
    {
        return fw
            .insert_rule(chain, position, &args)
            .await
            .with_context(|| format!("failed to insert rule in chain {chain}"));
    }

    let rules = fw
        .list_rules(chain)
        .await
        .with_context(|| format!("failed to list rules in chain {chain}"))?;
    // Declaration lines (`-P`/`-N`) precede the rules, offsetting the
    // 1-indexed rule numbers.
    let mut offset = 0;
    let mut rule_no = 0;
    for (idx, rule) in rules.iter().enumerate() {
        if rule.starts_with("-P") || rule.starts_with("-N") {
            offset += 1;
            continue;
        }
        if rule.contains(&uuid) {
            rule_no = idx + 1 - offset;
            break;
        }
    }
    if rule_no != position {
        fw.insert_rule(chain, position, &args)
            .await
            .with_context(|| format!("failed to insert rule in chain {chain}"))?;
        fw.delete_rule(chain, rule_no + 1)
            .await
            .with_context(|| format!("failed to delete drifted rule in chain {chain}"))?;
    }
    Ok(())
}

/// Creates the custom top-level chains, the jumps into them from the
/// built-in chains, the service-traffic exemptions, and the authoritative
/// accept tail.
pub(crate) async fn ensure_top_level_chains(
    fw: &dyn FilterTable,
    config: &ClusterInfo,
) -> Result<()> {
    for &(_, custom) in CHAINS {
        fw.ensure_chain(custom)
            .await
            .with_context(|| format!("failed to create chain {custom}"))?;
    }

    match &config.pod_cidr {
        Some(cidr) => {
            // With a known pod CIDR the jumps are scoped so traffic that is
            // not to or from local pods bypasses the engine entirely.
            let cidr = cidr.to_string();
            ensure_rule_at_position(
                fw,
                "INPUT",
                strs(&[
                    "-m", "comment", "--comment", COMMENT_MARKER, "-s", &cidr, "-j",
                    names::INPUT_CHAIN,
                ]),
                1,
            )
            .await?;
            ensure_rule_at_position(
                fw,
                "OUTPUT",
                strs(&[
                    "-m", "comment", "--comment", COMMENT_MARKER, "-d", &cidr, "-j",
                    names::OUTPUT_CHAIN,
                ]),
                1,
            )
            .await?;
            ensure_rule_at_position(
                fw,
                "FORWARD",
                strs(&[
                    "-m", "comment", "--comment", COMMENT_MARKER, "-s", &cidr, "-j",
                    names::FORWARD_CHAIN,
                ]),
                1,
            )
            .await?;
            ensure_rule_at_position(
                fw,
                "FORWARD",
                strs(&[
                    "-m", "comment", "--comment", COMMENT_MARKER, "-d", &cidr, "-j",
                    names::FORWARD_CHAIN,
                ]),
                2,
            )
            .await?;
        }
        None => {
            for &(builtin, custom) in CHAINS {
                ensure_rule_at_position(
                    fw,
                    builtin,
                    strs(&["-m", "comment", "--comment", COMMENT_MARKER, "-j", custom]),
                    1,
                )
                .await?;
            }
        }
    }

    // Service-addressed traffic is rewritten by the service proxy before the
    // pod-scoped rules apply, so it is exempted up front.
    let cluster_cidr = config.service_cluster_cidr.to_string();
    ensure_rule_at_position(
        fw,
        names::INPUT_CHAIN,
        strs(&[
            "-m",
            "comment",
            "--comment",
            "allow traffic to cluster IP",
            "-d",
            &cluster_cidr,
            "-j",
            "RETURN",
        ]),
        1,
    )
    .await?;

    let node_ports = config.node_port_range.to_string();
    ensure_rule_at_position(
        fw,
        names::INPUT_CHAIN,
        strs(&[
            "-p",
            "tcp",
            "-m",
            "comment",
            "--comment",
            "allow LOCAL TCP traffic to node ports",
            "-m",
            "addrtype",
            "--dst-type",
            "LOCAL",
            "-m",
            "multiport",
            "--dports",
            &node_ports,
            "-j",
            "RETURN",
        ]),
        2,
    )
    .await?;
    ensure_rule_at_position(
        fw,
        names::INPUT_CHAIN,
        strs(&[
            "-p",
            "udp",
            "-m",
            "comment",
            "--comment",
            "allow LOCAL UDP traffic to node ports",
            "-m",
            "addrtype",
            "--dst-type",
            "LOCAL",
            "-m",
            "multiport",
            "--dports",
            &node_ports,
            "-j",
            "RETURN",
        ]),
        3,
    )
    .await?;

    for (idx, range) in config.service_external_ranges.iter().enumerate() {
        let range = range.to_string();
        let comment = format!("allow traffic to external IP range: {range}");
        ensure_rule_at_position(
            fw,
            names::INPUT_CHAIN,
            strs(&[
                "-m", "comment", "--comment", &comment, "-d", &range, "-j", "RETURN",
            ]),
            idx + 4,
        )
        .await?;
    }

    for &(_, custom) in CHAINS {
        // The engine is the authoritative entity accepting local-pod traffic
        // that complies with the declared policies.
        fw.append_unique(
            custom,
            &strs(&[
                "-m",
                "comment",
                "--comment",
                "rule to explicitly ACCEPT traffic that comply to network policies",
                "-m",
                "mark",
                "--mark",
                MARK_ACCEPT,
                "-j",
                "ACCEPT",
            ]),
        )
        .await
        .with_context(|| format!("failed to append accept rule to {custom}"))?;

        fw.append_unique(
            custom,
            &strs(&[
                "-m",
                "comment",
                "--comment",
                "rule to apply default pod firewall",
                "-j",
                names::DEFAULT_POD_FW_CHAIN,
            ]),
        )
        .await
        .with_context(|| format!("failed to append default firewall jump to {custom}"))?;
    }

    Ok(())
}

/// Creates the default policy chains. Pods no policy targets jump here, and
/// the unconditional mark admits their traffic in both directions.
pub(crate) async fn ensure_default_policy_chains(fw: &dyn FilterTable) -> Result<()> {
    let mark = strs(&[
        "-j",
        "MARK",
        "-m",
        "comment",
        "--comment",
        "rule to mark traffic matching a network policy",
        "--set-xmark",
        MARK_POLICY_MATCHED,
    ]);
    for chain in [names::DEFAULT_INGRESS_CHAIN, names::DEFAULT_EGRESS_CHAIN] {
        fw.ensure_chain(chain)
            .await
            .with_context(|| format!("failed to create chain {chain}"))?;
        fw.append_unique(chain, &mark)
            .await
            .with_context(|| format!("failed to append mark rule to {chain}"))?;
    }
    Ok(())
}

/// Creates the default pod firewall chain covering the window between a pod
/// starting and its firewall chain being installed.
pub(crate) async fn ensure_default_pod_fw_chain(
    fw: &dyn FilterTable,
    config: &ClusterInfo,
) -> Result<()> {
    fw.ensure_chain(names::DEFAULT_POD_FW_CHAIN)
        .await
        .with_context(|| format!("failed to create chain {}", names::DEFAULT_POD_FW_CHAIN))?;

    let cidr = match &config.pod_cidr {
        Some(cidr) => cidr.to_string(),
        None => return Ok(()),
    };
    let action = if config.allow_pre_enforcement {
        "ACCEPT"
    } else {
        "REJECT"
    };

    fw.append_unique(
        names::DEFAULT_POD_FW_CHAIN,
        &strs(&[
            "-m",
            "comment",
            "--comment",
            "default action for pod ingress traffic",
            "-d",
            &cidr,
            "-j",
            action,
        ]),
    )
    .await
    .context("failed to append the default ingress action")?;

    fw.append_unique(
        names::DEFAULT_POD_FW_CHAIN,
        &strs(&[
            "-m",
            "comment",
            "--comment",
            "default action for pod egress traffic",
            "-s",
            &cidr,
            "-j",
            action,
        ]),
    )
    .await
    .context("failed to append the default egress action")
}
