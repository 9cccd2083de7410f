//! Chain and IP-set name derivation.
//!
//! Every name the engine ever creates or deletes carries one of the fixed
//! prefixes below; nothing outside these prefixes is ever touched. Name
//! tokens are a BASE32-encoded SHA-256 of a stable input string, truncated to
//! 16 characters, so names are deterministic, bounded-length, and
//! collision-resistant.
//!
//! Chain names additionally embed the sync version so that every full sync
//! regenerates rules into freshly-named chains while the previous generation
//! is garbage-collected; IP-set names omit the version so unchanged sets
//! survive across syncs.

use data_encoding::BASE32;
use sha2::{Digest, Sha256};

/// Prefix of per-pod firewall chains.
pub const POD_FW_CHAIN_PREFIX: &str = "KUBE-POD-FW-";

/// Prefix of per-policy chains.
pub const POLICY_CHAIN_PREFIX: &str = "KUBE-NWPLCY-";

/// Prefix of IP sets matched as traffic sources.
pub const SOURCE_SET_PREFIX: &str = "KUBE-SRC-";

/// Prefix of IP sets matched as traffic destinations.
pub const DESTINATION_SET_PREFIX: &str = "KUBE-DST-";

/// Custom top-level chains jumped to from the built-in filter chains.
pub const INPUT_CHAIN: &str = "KUBE-NETPOL-INPUT";
pub const FORWARD_CHAIN: &str = "KUBE-NETPOL-FORWARD";
pub const OUTPUT_CHAIN: &str = "KUBE-NETPOL-OUTPUT";

/// Enforces the configured default action on pod traffic that has not yet
/// traversed a pod firewall chain.
pub const DEFAULT_POD_FW_CHAIN: &str = "KUBE-POD-FW-DEFAULT";

/// Default policy chains jumped to by pods no policy targets; they mark all
/// traffic as matched.
pub const DEFAULT_INGRESS_CHAIN: &str = "KUBE-NWPLCY-DEFAULT-INGRESS";
pub const DEFAULT_EGRESS_CHAIN: &str = "KUBE-NWPLCY-DEFAULT-EGRESS";

const TOKEN_LEN: usize = 16;

fn token(input: &str) -> String {
    let hash = Sha256::digest(input.as_bytes());
    BASE32.encode(&hash)[..TOKEN_LEN].to_string()
}

/// Name of the firewall chain for a local pod at a given sync version.
pub fn pod_fw_chain(ns: &str, pod: &str, version: &str) -> String {
    format!("{}{}", POD_FW_CHAIN_PREFIX, token(&format!("{ns}{pod}{version}")))
}

/// Name of a policy's rule chain at a given sync version.
pub fn policy_chain(ns: &str, policy: &str, version: &str) -> String {
    format!(
        "{}{}",
        POLICY_CHAIN_PREFIX,
        token(&format!("{ns}{policy}{version}"))
    )
}

/// Set of a policy's target-pod IPs matched as sources (egress direction).
pub fn policy_source_set(ns: &str, policy: &str) -> String {
    format!("{}{}", SOURCE_SET_PREFIX, token(&format!("{ns}{policy}")))
}

/// Set of a policy's target-pod IPs matched as destinations (ingress
/// direction).
pub fn policy_destination_set(ns: &str, policy: &str) -> String {
    format!("{}{}", DESTINATION_SET_PREFIX, token(&format!("{ns}{policy}")))
}

/// Set of the peer-pod IPs allowed by one ingress rule.
pub fn ingress_rule_peer_set(ns: &str, policy: &str, rule: usize) -> String {
    format!(
        "{}{}",
        SOURCE_SET_PREFIX,
        token(&format!("{ns}{policy}ingressrule{rule}pod"))
    )
}

/// Set of the peer-pod IPs allowed by one egress rule.
pub fn egress_rule_peer_set(ns: &str, policy: &str, rule: usize) -> String {
    format!(
        "{}{}",
        DESTINATION_SET_PREFIX,
        token(&format!("{ns}{policy}egressrule{rule}pod"))
    )
}

/// Set of the pod IPs exposing one named port referenced by an ingress rule.
pub fn ingress_named_port_set(ns: &str, policy: &str, rule: usize, port: usize) -> String {
    format!(
        "{}{}",
        DESTINATION_SET_PREFIX,
        token(&format!("{ns}{policy}ingressrule{rule}{port}namedport"))
    )
}

/// Set of the pod IPs exposing one named port referenced by an egress rule.
pub fn egress_named_port_set(ns: &str, policy: &str, rule: usize, port: usize) -> String {
    format!(
        "{}{}",
        DESTINATION_SET_PREFIX,
        token(&format!("{ns}{policy}egressrule{rule}{port}namedport"))
    )
}

/// Identity token for a rule installed in a built-in or custom chain,
/// embedded in the rule's comment so the installer can find and reposition
/// its own rules.
pub fn rule_uuid(chain: &str, args: &[String]) -> String {
    token(&format!("{chain}{}", args.join("")))
}

/// Whether a chain name belongs to the engine.
pub fn is_engine_chain(name: &str) -> bool {
    name.starts_with(POD_FW_CHAIN_PREFIX)
        || name.starts_with(POLICY_CHAIN_PREFIX)
        || name.starts_with("KUBE-NETPOL-")
}

/// Whether an IP-set name belongs to the engine.
pub fn is_engine_set(name: &str) -> bool {
    name.starts_with(SOURCE_SET_PREFIX) || name.starts_with(DESTINATION_SET_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_stable_and_bounded() {
        let a = pod_fw_chain("ns", "pod", "1");
        let b = pod_fw_chain("ns", "pod", "1");
        assert_eq!(a, b);
        assert_eq!(a.len(), POD_FW_CHAIN_PREFIX.len() + 16);
        assert!(a.starts_with(POD_FW_CHAIN_PREFIX));
    }

    #[test]
    fn chain_names_vary_with_version_but_set_names_do_not() {
        assert_ne!(
            pod_fw_chain("ns", "pod", "1"),
            pod_fw_chain("ns", "pod", "2")
        );
        assert_ne!(
            policy_chain("ns", "policy", "1"),
            policy_chain("ns", "policy", "2")
        );
        assert_eq!(
            policy_source_set("ns", "policy"),
            policy_source_set("ns", "policy")
        );
        assert_ne!(
            policy_source_set("ns", "policy"),
            policy_destination_set("ns", "policy")
        );
    }

    #[test]
    fn rule_sets_are_distinct_per_index_and_direction() {
        assert_ne!(
            ingress_rule_peer_set("ns", "p", 0),
            ingress_rule_peer_set("ns", "p", 1)
        );
        assert_ne!(
            ingress_rule_peer_set("ns", "p", 0),
            egress_rule_peer_set("ns", "p", 0)
        );
        assert_ne!(
            ingress_named_port_set("ns", "p", 0, 0),
            ingress_named_port_set("ns", "p", 0, 1)
        );
    }

    #[test]
    fn prefix_discipline() {
        for name in [
            pod_fw_chain("ns", "pod", "1"),
            policy_chain("ns", "p", "1"),
            INPUT_CHAIN.to_string(),
            FORWARD_CHAIN.to_string(),
            OUTPUT_CHAIN.to_string(),
            DEFAULT_POD_FW_CHAIN.to_string(),
            DEFAULT_INGRESS_CHAIN.to_string(),
            DEFAULT_EGRESS_CHAIN.to_string(),
        ] {
            assert!(is_engine_chain(&name), "{name}");
        }
        for name in [
            policy_source_set("ns", "p"),
            policy_destination_set("ns", "p"),
            ingress_rule_peer_set("ns", "p", 3),
            egress_named_port_set("ns", "p", 1, 2),
        ] {
            assert!(is_engine_set(&name), "{name}");
        }
        assert!(!is_engine_chain("INPUT"));
        assert!(!is_engine_chain("KUBE-SERVICES"));
        assert!(!is_engine_set("cilium-node"));
    }
}
