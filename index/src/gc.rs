//! Garbage collection of stale chains, rules, and IP sets.
//!
//! Runs at the end of every full sync. Anything on the host carrying an
//! engine prefix that the sync did not mark active is stale: references to
//! stale pod chains are deleted from the custom top-level chains, the
//! rebuilt table (with every stale line stripped) is applied in one atomic
//! restore, and stale IP sets are destroyed afterwards so no rule still
//! references them.

use crate::ipset::Ipsets;
use crate::iptables::FilterTable;
use anyhow::{Context, Result};
use netpol_agent_core::names;
use std::collections::HashSet;
use tracing::{debug, info};

pub(crate) async fn cleanup_stale_rules(
    fw: &dyn FilterTable,
    ipsets: &dyn Ipsets,
    table: &str,
    active_policy_chains: &HashSet<String>,
    active_pod_fw_chains: &HashSet<String>,
    active_sets: &HashSet<String>,
) -> Result<()> {
    // The default chains are never collected.
    let mut active_policy_chains = active_policy_chains.clone();
    active_policy_chains.insert(names::DEFAULT_INGRESS_CHAIN.to_string());
    active_policy_chains.insert(names::DEFAULT_EGRESS_CHAIN.to_string());
    let mut active_pod_fw_chains = active_pod_fw_chains.clone();
    active_pod_fw_chains.insert(names::DEFAULT_POD_FW_CHAIN.to_string());

    let mut stale_policy_chains = Vec::new();
    let mut stale_pod_fw_chains = Vec::new();
    for chain in fw.list_chains().await.context("failed to list chains")? {
        if chain.starts_with(names::POLICY_CHAIN_PREFIX) && !active_policy_chains.contains(&chain)
        {
            stale_policy_chains.push(chain);
        } else if chain.starts_with(names::POD_FW_CHAIN_PREFIX)
            && !active_pod_fw_chains.contains(&chain)
        {
            stale_pod_fw_chains.push(chain);
        }
    }

    let mut stale_sets = Vec::new();
    for set in ipsets.list().await.context("failed to list ipsets")? {
        if names::is_engine_set(&set) && !active_sets.contains(&set) {
            stale_sets.push(set);
        }
    }

    debug!(
        stale_policy_chains = stale_policy_chains.len(),
        stale_pod_fw_chains = stale_pod_fw_chains.len(),
        stale_sets = stale_sets.len(),
        "collecting stale host state"
    );

    // Drop the jump rules referencing stale pod chains from the top-level
    // chains before the restore removes the chains themselves.
    for pod_fw_chain in &stale_pod_fw_chains {
        for top_level in [names::INPUT_CHAIN, names::FORWARD_CHAIN, names::OUTPUT_CHAIN] {
            delete_rules_containing(fw, top_level, pod_fw_chain).await?;
        }
    }

    // Rebuild the dump without any line that references a stale chain, then
    // apply it in a single restore.
    let mut chains = String::new();
    let mut rules = String::new();
    for line in table.lines() {
        if line.is_empty()
            || line.starts_with('#')
            || line.starts_with('*')
            || line.contains("COMMIT")
        {
            continue;
        }
        if stale_pod_fw_chains
            .iter()
            .chain(stale_policy_chains.iter())
            .any(|stale| line.contains(stale.as_str()))
        {
            continue;
        }
        if let Some(decl) = line.strip_prefix(':') {
            if let Some(name) = decl.split_whitespace().next() {
                chains.push_str(&format!(":{name} - [0:0]\n"));
            }
        } else if line.starts_with('-') {
            rules.push_str(line);
            rules.push('\n');
        }
    }
    let desired = format!("*filter\n{chains}{rules}COMMIT\n");
    fw.restore(&desired)
        .await
        .context("failed to restore the filter table")?;

    for set in &stale_sets {
        ipsets
            .destroy(set)
            .await
            .with_context(|| format!("failed to destroy ipset {set}"))?;
    }
    Ok(())
}

/// Deletes every rule in `chain` whose text references `needle`, scanning
/// by number because positions shift as rules are removed.
async fn delete_rules_containing(
    fw: &dyn FilterTable,
    chain: &str,
    needle: &str,
) -> Result<()> {
    let rules = fw
        .list_rules(chain)
        .await
        .with_context(|| format!("failed to list rules in chain {chain}"))?;
    let mut deleted = 0;
    for (idx, rule) in rules.iter().enumerate() {
        if rule.contains(needle) {
            fw.delete_rule(chain, idx - deleted)
                .await
                .with_context(|| format!("failed to delete rule from chain {chain}"))?;
            deleted += 1;
        }
    }
    Ok(())
}

/// Removes every trace of the engine from the host: the jump rules in the
/// built-in chains, every engine-prefixed chain, and every engine-prefixed
/// IP set.
pub async fn cleanup(fw: &dyn FilterTable, ipsets: &dyn Ipsets) -> Result<()> {
    info!("removing all chains, rules, and ipsets installed by the agent");

    for builtin in ["INPUT", "FORWARD", "OUTPUT"] {
        delete_rules_containing(fw, builtin, "KUBE-NETPOL-").await?;
    }

    let chains = fw
        .list_chains()
        .await
        .context("failed to list chains")?
        .into_iter()
        .filter(|chain| names::is_engine_chain(chain))
        .collect::<Vec<_>>();
    // Flush everything first so no chain-to-chain reference blocks deletion.
    for chain in &chains {
        fw.flush_chain(chain)
            .await
            .with_context(|| format!("failed to flush chain {chain}"))?;
    }
    for chain in &chains {
        fw.delete_chain(chain)
            .await
            .with_context(|| format!("failed to delete chain {chain}"))?;
    }

    for set in ipsets.list().await.context("failed to list ipsets")? {
        if names::is_engine_set(&set) {
            ipsets
                .destroy(&set)
                .await
                .with_context(|| format!("failed to destroy ipset {set}"))?;
        }
    }

    info!("cleanup complete");
    Ok(())
}
