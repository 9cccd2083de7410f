
use crate::{
    cluster_info::ClusterInfo,
    gc,
    index::{Index, SharedIndex},
    policy,
    sync::{sync_channel, Engine, Heartbeat, SyncHandle},
};
use fake::{FakeHost, FakeIpsets};
use kubert::index::{IndexClusterResource, IndexNamespacedResource};
use maplit::btreemap;
use netpol_agent_core::names;
use netpol_agent_k8s::{self as k8s, IntOrString, LabelSelector};
use std::sync::Arc;
use tokio::{sync::mpsc, time};

struct Harness {
    engine: Arc<Engine>,
    index: SharedIndex,
    handle: SyncHandle,
    requests: mpsc::Receiver<()>,
    health: mpsc::Receiver<Heartbeat>,
    fw: FakeHost,
    ipsets: FakeIpsets,
}

const NODE_IP: &str = "192.168.1.10";
const OTHER_NODE_IP: &str = "192.168.1.11";

fn test_config() -> ClusterInfo {
    ClusterInfo {
        node_name: "node-1".to_string(),
        node_ip: NODE_IP.parse().unwrap(),
        pod_cidr: Some("10.1.2.0/24".parse().unwrap()),
        service_cluster_cidr: "10.96.0.0/12".parse().unwrap(),
        service_external_ranges: vec![],
        node_port_range: "30000:32767".parse().unwrap(),
        sync_period: time::Duration::from_secs(3600),
        allow_pre_enforcement: false,
    }
}

fn harness() -> Harness {
    let fw = FakeHost::new();
    let ipsets = FakeIpsets::default();
    let (handle, requests) = sync_channel();
    let index = Index::shared(handle.clone());
    let (health_tx, health) = mpsc::channel(8);
    let engine = Arc::new(Engine::new(
        test_config(),
        index.clone(),
        Arc::new(fw.clone()),
        Arc::new(ipsets.clone()),
        health_tx,
        None,
        handle.clone(),
    ));
    Harness {
        engine,
        index,
        handle,
        requests,
        health,
        fw,
        ipsets,
    }
}

fn apply<T>(h: &Harness, resource: T)
where
    Index: IndexNamespacedResource<T>,
{
    IndexNamespacedResource::apply(&mut *h.index.write(), resource);
}

fn apply_namespace(h: &Harness, ns: k8s::Namespace) {
    IndexClusterResource::apply(&mut *h.index.write(), ns);
}

fn delete_policy(h: &Harness, ns: &str, name: &str) {
    IndexNamespacedResource::<k8s::NetworkPolicy>::delete(
        &mut *h.index.write(),
        ns.to_string(),
        name.to_string(),
    );
}

fn mk_pod(
    ns: &str,
    name: &str,
    host_ip: &str,
    pod_ip: &str,
    labels: impl IntoIterator<Item = (&'static str, &'static str)>,
) -> k8s::Pod {
    k8s::Pod {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(k8s::PodSpec::default()),
        status: Some(k8s::PodStatus {
            phase: Some("Running".to_string()),
            host_ip: Some(host_ip.to_string()),
            pod_ip: Some(pod_ip.to_string()),
            ..Default::default()
        }),
    }
}

fn mk_namespace(name: &str) -> k8s::Namespace {
    k8s::Namespace {
        metadata: k8s::ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn label_selector(
    labels: impl IntoIterator<Item = (&'static str, &'static str)>,
) -> LabelSelector {
    LabelSelector {
        match_labels: Some(
            labels
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
        match_expressions: None,
    }
}

fn mk_policy(ns: &str, name: &str, spec: k8s::NetworkPolicySpec) -> k8s::NetworkPolicy {
    k8s::NetworkPolicy {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    }
}

/// A policy allowing TCP/80 ingress to `target_labels` pods from
/// `peer_labels` pods in the same namespace.
fn mk_ingress_policy(
    ns: &str,
    name: &str,
    target_labels: impl IntoIterator<Item = (&'static str, &'static str)>,
    peer_labels: impl IntoIterator<Item = (&'static str, &'static str)>,
) -> k8s::NetworkPolicy {
    mk_policy(
        ns,
        name,
        k8s::NetworkPolicySpec {
            pod_selector: label_selector(target_labels),
            ingress: Some(vec![k8s::NetworkPolicyIngressRule {
                from: Some(vec![k8s::NetworkPolicyPeer {
                    pod_selector: Some(label_selector(peer_labels)),
                    ..Default::default()
                }]),
                ports: Some(vec![k8s::NetworkPolicyPort {
                    port: Some(IntOrString::Int(80)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
            }]),
            ..Default::default()
        },
    )
}

async fn sync(h: &Harness, version: &str) {
    h.engine
        .sync_with_version(version)
        .await
        .expect("sync must succeed");
}

/// Sets up scenario S1: one local pod, no policies.
fn apply_s1(h: &Harness) {
    apply_namespace(h, mk_namespace("default"));
    apply(h, mk_pod("default", "a", NODE_IP, "10.1.2.5", [("app", "web")]));
}

/// Extends S1 to S2: an ingress policy targeting the local pod and a remote
/// peer pod matching its peer selector.
fn apply_s2(h: &Harness) {
    apply_s1(h);
    apply(
        h,
        mk_pod("default", "c", OTHER_NODE_IP, "10.1.5.7", [("app", "client")]),
    );
    apply(
        h,
        mk_ingress_policy("default", "web-allow", [("app", "web")], [("app", "client")]),
    );
}

fn engine_chains(h: &Harness) -> Vec<String> {
    h.fw
        .chains()
        .into_iter()
        .filter(|c| names::is_engine_chain(c))
        .collect()
}

#[tokio::test]
async fn s1_local_pod_without_policies() {
    let h = harness();
    apply_s1(&h);
    sync(&h, "v1").await;

    let pod_chain = names::pod_fw_chain("default", "a", "v1");
    assert!(h.fw.has_chain(&pod_chain), "pod firewall chain must exist");

    // The jump from the built-in FORWARD chain to the custom chain is rule 1
    // and is scoped to the pod CIDR.
    let forward = h.fw.chain_rules("FORWARD");
    assert!(
        forward[0].contains("-s 10.1.2.0/24")
            && forward[0].contains(&format!("-j {}", names::FORWARD_CHAIN)),
        "FORWARD rule 1 must jump pod traffic to the custom chain: {forward:?}"
    );
    assert!(
        forward[1].contains("-d 10.1.2.0/24")
            && forward[1].contains(&format!("-j {}", names::FORWARD_CHAIN)),
        "FORWARD rule 2 must jump pod-bound traffic to the custom chain: {forward:?}"
    );

    // The intercept jump for the pod sits at the head of the custom forward
    // chain, ahead of the accept tail.
    let fwd = h.fw.chain_rules(names::FORWARD_CHAIN);
    let jump = fwd
        .iter()
        .position(|r| r.contains("-d 10.1.2.5") && r.contains(&format!("-j {pod_chain}")))
        .expect("destination intercept must be installed");
    let accept = fwd
        .iter()
        .position(|r| r.contains("--mark 0x20000/0x20000") && r.contains("-j ACCEPT"))
        .expect("authoritative accept must be installed");
    let default_fw = fwd
        .iter()
        .position(|r| r.contains(&format!("-j {}", names::DEFAULT_POD_FW_CHAIN)))
        .expect("default pod firewall jump must be installed");
    assert!(jump < accept, "intercept must precede the accept tail");
    assert_eq!(default_fw, fwd.len() - 1, "default firewall jump must be last");

    // Installed rule order inside the pod chain: conntrack accepts first,
    // default policy jumps after, then the appended tail.
    let rules = h.fw.chain_rules(&pod_chain);
    assert!(
        rules[0].contains("--ctstate RELATED,ESTABLISHED") && rules[0].contains("-j ACCEPT"),
        "chain must open with the conntrack accept: {rules:?}"
    );
    assert!(
        rules
            .iter()
            .any(|r| r.contains(&format!("-j {}", names::DEFAULT_INGRESS_CHAIN))),
        "a policy-less pod must jump to the default ingress chain"
    );
    assert!(
        rules
            .iter()
            .any(|r| r.contains(&format!("-j {}", names::DEFAULT_EGRESS_CHAIN))),
        "a policy-less pod must jump to the default egress chain"
    );
    assert!(
        rules
            .iter()
            .any(|r| r.contains("--src-type LOCAL") && r.contains("-j ACCEPT")),
        "node-to-own-pod traffic must be accepted"
    );

    // Appended tail: log, reject, reset mark, set accept mark.
    let tail = &rules[rules.len() - 4..];
    assert!(tail[0].contains("-j NFLOG") && tail[0].contains("! --mark 0x10000/0x10000"));
    assert!(tail[1].contains("-j REJECT") && tail[1].contains("! --mark 0x10000/0x10000"));
    assert!(tail[2].contains("--set-mark 0/0x10000"));
    assert!(tail[3].contains("--set-mark 0x20000/0x20000"));

    // The pre-enforcement default is REJECT.
    let default_fw = h.fw.chain_rules(names::DEFAULT_POD_FW_CHAIN);
    assert!(default_fw
        .iter()
        .any(|r| r.contains("-d 10.1.2.0/24") && r.contains("-j REJECT")));
    assert!(default_fw
        .iter()
        .any(|r| r.contains("-s 10.1.2.0/24") && r.contains("-j REJECT")));
}

#[tokio::test]
async fn s2_ingress_policy_with_pod_peer() {
    let h = harness();
    apply_s2(&h);
    sync(&h, "v1").await;

    // The peer set carries the source-pod prefix and exactly the peer's IP.
    let peer_set = names::ingress_rule_peer_set("default", "web-allow", 0);
    assert!(peer_set.starts_with(names::SOURCE_SET_PREFIX));
    assert_eq!(
        h.ipsets.members(&peer_set).expect("peer set must exist"),
        vec!["10.1.5.7".to_string()]
    );

    // The policy chain marks TCP/80 traffic from the peer set to the target
    // set.
    let policy_chain = names::policy_chain("default", "web-allow", "v1");
    let target_set = names::policy_destination_set("default", "web-allow");
    let rules = h.fw.chain_rules(&policy_chain);
    let mark = rules
        .iter()
        .position(|r| {
            r.contains(&format!("--match-set {peer_set} src"))
                && r.contains(&format!("--match-set {target_set} dst"))
                && r.contains("-p tcp --dport 80")
                && r.contains("--set-xmark 0x10000/0x10000")
        })
        .expect("policy chain must mark matching traffic");
    assert!(
        rules[mark + 1].contains("--mark 0x10000/0x10000") && rules[mark + 1].contains("-j RETURN"),
        "the mark rule must be followed by the return rule"
    );

    // The pod chain jumps to the policy chain instead of the default
    // ingress chain.
    let pod_chain = names::pod_fw_chain("default", "a", "v1");
    let rules = h.fw.chain_rules(&pod_chain);
    assert!(rules
        .iter()
        .any(|r| r.contains(&format!("-j {policy_chain}"))));
    assert!(
        !rules
            .iter()
            .any(|r| r.contains(&format!("-j {}", names::DEFAULT_INGRESS_CHAIN))),
        "a targeted pod must not fall through to the default ingress chain"
    );
    // The policy declares no egress rules, so the egress side still uses the
    // default chain.
    assert!(rules
        .iter()
        .any(|r| r.contains(&format!("-j {}", names::DEFAULT_EGRESS_CHAIN))));
}

#[tokio::test]
async fn s3_peer_ip_change_updates_membership_in_place() {
    let h = harness();
    apply_s2(&h);
    sync(&h, "v1").await;

    let chains_before = engine_chains(&h).len();
    let peer_set = names::ingress_rule_peer_set("default", "web-allow", 0);

    apply(
        &h,
        mk_pod("default", "c", OTHER_NODE_IP, "10.1.5.8", [("app", "client")]),
    );
    sync(&h, "v2").await;

    // Membership is refreshed under the same set name; the chain population
    // is unchanged apart from the version token.
    assert_eq!(
        h.ipsets.members(&peer_set).expect("peer set must exist"),
        vec!["10.1.5.8".to_string()]
    );
    assert_eq!(
        engine_chains(&h).len(),
        chains_before,
        "chain count must not grow"
    );
    assert!(h.fw.has_chain(&names::pod_fw_chain("default", "a", "v2")));
    assert!(!h.fw.has_chain(&names::pod_fw_chain("default", "a", "v1")));
}

#[tokio::test]
async fn s4_policy_deletion_collects_chain_and_sets() {
    let h = harness();
    apply_s2(&h);
    sync(&h, "v1").await;

    let peer_set = names::ingress_rule_peer_set("default", "web-allow", 0);
    assert!(h.ipsets.names().contains(&peer_set));

    delete_policy(&h, "default", "web-allow");
    sync(&h, "v2").await;

    assert!(
        !h.fw
            .has_chain(&names::policy_chain("default", "web-allow", "v1")),
        "the stale policy chain must be collected"
    );
    assert!(
        !h.fw
            .has_chain(&names::policy_chain("default", "web-allow", "v2")),
        "no replacement policy chain may exist"
    );

    let pod_chain = names::pod_fw_chain("default", "a", "v2");
    let rules = h.fw.chain_rules(&pod_chain);
    assert!(
        rules
            .iter()
            .any(|r| r.contains(&format!("-j {}", names::DEFAULT_INGRESS_CHAIN))),
        "the pod must fall back to the default ingress chain"
    );

    assert!(
        !h.ipsets.names().contains(&peer_set),
        "the peer set must be destroyed"
    );
    assert!(
        !h.ipsets
            .names()
            .contains(&names::policy_destination_set("default", "web-allow")),
        "the target set must be destroyed"
    );
}

#[tokio::test]
async fn s6_sync_requests_coalesce_into_one_pending_sync() {
    let h = harness();
    apply_s1(&h);

    let Harness {
        engine,
        handle,
        requests,
        mut health,
        fw,
        ..
    } = h;

    // Block the first sync inside the host dump, then flood the request
    // slot while it is held.
    let gate = fw.gate();
    let hold = gate.lock().await;

    let (drain_tx, drain_rx) = drain::channel();
    let task = tokio::spawn(engine.run(requests, drain_rx));

    // The run loop's immediate tick drives the first sync; wait for its
    // heartbeat so we know it is in flight.
    let beat = time::timeout(time::Duration::from_secs(5), health.recv())
        .await
        .expect("first sync must start")
        .expect("health channel must be open");
    assert_eq!(beat.component, "netpol");

    for _ in 0..1000 {
        handle.request();
    }
    drop(hold);

    // Exactly one coalesced sync follows the in-flight one.
    time::timeout(time::Duration::from_secs(5), health.recv())
        .await
        .expect("the coalesced sync must run")
        .expect("health channel must be open");
    time::sleep(time::Duration::from_millis(200)).await;
    assert!(
        health.try_recv().is_err(),
        "the burst must coalesce into a single additional sync"
    );

    drain_tx.drain().await;
    task.await
        .expect("engine task must not panic")
        .expect("engine must shut down cleanly");
}

#[tokio::test]
async fn event_handlers_are_inert_until_first_sync() {
    let mut h = harness();

    apply(&h, mk_pod("default", "a", NODE_IP, "10.1.2.5", [("app", "web")]));
    assert!(
        h.requests.try_recv().is_err(),
        "events must not request syncs before the first full sync"
    );
    assert!(!h.handle.is_ready());

    sync(&h, "v1").await;
    h.handle.set_ready();

    apply(&h, mk_pod("default", "a", NODE_IP, "10.1.2.6", [("app", "web")]));
    assert!(
        h.requests.try_recv().is_ok(),
        "a pod IP change must request a sync once ready"
    );
}

#[tokio::test]
async fn pod_updates_are_filtered_to_meaningful_changes() {
    let mut h = harness();
    sync(&h, "v1").await;
    h.handle.set_ready();

    let pod = mk_pod("default", "a", NODE_IP, "10.1.2.5", [("app", "web")]);
    apply(&h, pod.clone());
    assert!(h.requests.try_recv().is_ok(), "a new pod must request a sync");

    // An identical update changes nothing.
    apply(&h, pod);
    assert!(
        h.requests.try_recv().is_err(),
        "a no-op update must be ignored"
    );

    // A label change does.
    apply(&h, mk_pod("default", "a", NODE_IP, "10.1.2.5", [("app", "db")]));
    assert!(h.requests.try_recv().is_ok());
}

#[tokio::test]
async fn active_closure_holds_after_every_sync() {
    let h = harness();
    apply_s2(&h);
    sync(&h, "v1").await;
    sync(&h, "v2").await;

    // Everything on the host with an engine prefix is either a default
    // chain or belongs to the current sync generation.
    let expected = [
        names::INPUT_CHAIN.to_string(),
        names::FORWARD_CHAIN.to_string(),
        names::OUTPUT_CHAIN.to_string(),
        names::DEFAULT_POD_FW_CHAIN.to_string(),
        names::DEFAULT_INGRESS_CHAIN.to_string(),
        names::DEFAULT_EGRESS_CHAIN.to_string(),
        names::pod_fw_chain("default", "a", "v2"),
        names::policy_chain("default", "web-allow", "v2"),
    ];
    let mut actual = engine_chains(&h);
    actual.sort();
    let mut expected = expected.to_vec();
    expected.sort();
    assert_eq!(actual, expected);

    for set in h.ipsets.names() {
        assert!(
            names::is_engine_set(&set),
            "unprefixed set {set} must not exist"
        );
    }
}

#[tokio::test]
async fn syncs_are_idempotent_modulo_the_version_token() {
    let h = harness();
    apply_s2(&h);

    sync(&h, "v1").await;
    let first = normalize(&h.fw.save_text(), "v1");
    let sets_first = h.ipsets.dump();

    sync(&h, "v2").await;
    let second = normalize(&h.fw.save_text(), "v2");
    let sets_second = h.ipsets.dump();

    assert_eq!(
        first, second,
        "unchanged cluster state must produce an identical table"
    );
    assert_eq!(sets_first, sets_second);
}

/// Replaces version-derived chain names with placeholders so tables from
/// different syncs can be compared.
fn normalize(table: &str, version: &str) -> String {
    table
        .replace(&names::pod_fw_chain("default", "a", version), "<POD-FW-A>")
        .replace(
            &names::policy_chain("default", "web-allow", version),
            "<NWPLCY-WEB-ALLOW>",
        )
}

#[tokio::test]
async fn drifted_jump_rules_are_moved_back_to_position_one() {
    let h = harness();
    apply_s1(&h);
    sync(&h, "v1").await;

    // Another actor prepends a rule to the built-in INPUT chain.
    h.fw.prepend_foreign_rule("INPUT", "-s 203.0.113.0/24 -j DROP");
    let rules = h.fw.chain_rules("INPUT");
    assert!(rules[0].contains("-j DROP"));

    sync(&h, "v2").await;
    let rules = h.fw.chain_rules("INPUT");
    assert!(
        rules[0].contains(&format!("-j {}", names::INPUT_CHAIN)),
        "the engine jump must be restored to position 1: {rules:?}"
    );
    assert_eq!(
        rules
            .iter()
            .filter(|r| r.contains(&format!("-j {}", names::INPUT_CHAIN)))
            .count(),
        1,
        "repositioning must not duplicate the jump"
    );
    assert!(
        rules.iter().any(|r| r.contains("-j DROP")),
        "foreign rules must be left in place"
    );
}

#[tokio::test]
async fn cleanup_removes_every_trace_of_the_engine() {
    let h = harness();
    apply_s2(&h);
    sync(&h, "v1").await;

    gc::cleanup(&h.fw, &h.ipsets)
        .await
        .expect("cleanup must succeed");

    assert!(
        engine_chains(&h).is_empty(),
        "no engine chain may survive cleanup"
    );
    assert!(
        h.ipsets.names().is_empty(),
        "no engine set may survive cleanup"
    );
    for builtin in ["INPUT", "FORWARD", "OUTPUT"] {
        for rule in h.fw.chain_rules(builtin) {
            assert!(
                !rule.contains("KUBE-NETPOL-"),
                "builtin chain {builtin} still references the engine: {rule}"
            );
        }
    }
}

#[tokio::test]
async fn ip_block_exceptions_are_expanded_into_cidr_matches() {
    let h = harness();
    apply_namespace(&h, mk_namespace("default"));
    apply(&h, mk_pod("default", "a", NODE_IP, "10.1.2.5", [("app", "web")]));
    apply(
        &h,
        mk_policy(
            "default",
            "cidr-allow",
            k8s::NetworkPolicySpec {
                pod_selector: label_selector([("app", "web")]),
                ingress: Some(vec![k8s::NetworkPolicyIngressRule {
                    from: Some(vec![k8s::NetworkPolicyPeer {
                        ip_block: Some(k8s::IPBlock {
                            cidr: "10.1.5.0/24".to_string(),
                            except: Some(vec!["10.1.5.128/25".to_string()]),
                        }),
                        ..Default::default()
                    }]),
                    ports: None,
                }]),
                ..Default::default()
            },
        ),
    );
    sync(&h, "v1").await;

    let chain = names::policy_chain("default", "cidr-allow", "v1");
    let rules = h.fw.chain_rules(&chain);
    assert!(
        rules
            .iter()
            .any(|r| r.contains("-s 10.1.5.0/25") && r.contains("--set-xmark 0x10000/0x10000")),
        "the allowed half of the block must be matched: {rules:?}"
    );
    assert!(
        !rules.iter().any(|r| r.contains("-s 10.1.5.128/25")),
        "the excepted half must not appear: {rules:?}"
    );
    assert!(
        !rules.iter().any(|r| r.contains("-s 10.1.5.0/24 ")),
        "the undivided block must not appear: {rules:?}"
    );
}

#[tokio::test]
async fn named_ports_resolve_to_endpoint_sets() {
    let h = harness();
    apply_namespace(&h, mk_namespace("default"));
    let mut web = mk_pod("default", "a", NODE_IP, "10.1.2.5", [("app", "web")]);
    web.spec = Some(k8s::PodSpec {
        containers: vec![k8s::Container {
            name: "web".to_string(),
            ports: Some(vec![k8s::ContainerPort {
                name: Some("http".to_string()),
                container_port: 8080,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }],
        ..Default::default()
    });
    apply(&h, web);
    apply(
        &h,
        mk_pod("default", "c", OTHER_NODE_IP, "10.1.5.7", [("app", "client")]),
    );
    apply(
        &h,
        mk_policy(
            "default",
            "named-allow",
            k8s::NetworkPolicySpec {
                pod_selector: label_selector([("app", "web")]),
                ingress: Some(vec![k8s::NetworkPolicyIngressRule {
                    from: Some(vec![k8s::NetworkPolicyPeer {
                        pod_selector: Some(label_selector([("app", "client")])),
                        ..Default::default()
                    }]),
                    ports: Some(vec![k8s::NetworkPolicyPort {
                        port: Some(IntOrString::String("http".to_string())),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    }]),
                }]),
                ..Default::default()
            },
        ),
    );
    sync(&h, "v1").await;

    // The named port resolves against the target pods: an endpoint set with
    // the exposing pod, matched on the resolved numeric port.
    let eps_set = names::ingress_named_port_set("default", "named-allow", 0, 0);
    assert_eq!(
        h.ipsets.members(&eps_set).expect("endpoint set must exist"),
        vec!["10.1.2.5".to_string()]
    );
    let chain = names::policy_chain("default", "named-allow", "v1");
    let rules = h.fw.chain_rules(&chain);
    assert!(
        rules.iter().any(|r| {
            r.contains(&format!("--match-set {eps_set} dst")) && r.contains("-p tcp --dport 8080")
        }),
        "the rule must match the endpoint set on the resolved port: {rules:?}"
    );
}

#[tokio::test]
async fn namespace_selector_peers_span_matching_namespaces() {
    let h = harness();
    apply_namespace(&h, mk_namespace("default"));
    apply_namespace(
        &h,
        k8s::Namespace {
            metadata: k8s::ObjectMeta {
                name: Some("tools".to_string()),
                labels: Some(btreemap! {
                    "team".to_string() => "platform".to_string(),
                }),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    apply(&h, mk_pod("default", "a", NODE_IP, "10.1.2.5", [("app", "web")]));
    apply(
        &h,
        mk_pod("tools", "scanner", OTHER_NODE_IP, "10.1.5.9", [("app", "scanner")]),
    );
    apply(
        &h,
        mk_pod("default", "c", OTHER_NODE_IP, "10.1.5.7", [("app", "client")]),
    );
    apply(
        &h,
        mk_policy(
            "default",
            "ns-allow",
            k8s::NetworkPolicySpec {
                pod_selector: label_selector([("app", "web")]),
                ingress: Some(vec![k8s::NetworkPolicyIngressRule {
                    from: Some(vec![k8s::NetworkPolicyPeer {
                        namespace_selector: Some(label_selector([("team", "platform")])),
                        ..Default::default()
                    }]),
                    ports: None,
                }]),
                ..Default::default()
            },
        ),
    );

    let snapshot = h.index.read().snapshot();
    let policies = policy::build_policy_model(&snapshot).expect("model must build");
    let rule = &policies[0].ingress_rules[0];
    assert_eq!(
        rule.peer_pods
            .keys()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        vec!["10.1.5.9".to_string()],
        "only pods in namespaces matching the selector are peers"
    );
    assert!(rule.match_all_ports);
}

#[tokio::test]
async fn model_build_failure_aborts_the_sync_without_touching_the_host() {
    let h = harness();
    apply_namespace(&h, mk_namespace("default"));
    apply(&h, mk_pod("default", "a", NODE_IP, "10.1.2.5", [("app", "web")]));
    sync(&h, "v1").await;

    apply(
        &h,
        mk_policy(
            "default",
            "broken",
            k8s::NetworkPolicySpec {
                pod_selector: label_selector([("app", "web")]),
                ingress: Some(vec![k8s::NetworkPolicyIngressRule {
                    from: Some(vec![k8s::NetworkPolicyPeer {
                        ip_block: Some(k8s::IPBlock {
                            cidr: "not-a-cidr".to_string(),
                            except: None,
                        }),
                        ..Default::default()
                    }]),
                    ports: None,
                }]),
                ..Default::default()
            },
        ),
    );

    let err = h
        .engine
        .sync_with_version("v2")
        .await
        .expect_err("an unparseable CIDR must abort the sync");
    assert!(
        err.to_string().contains("failed to build network policies"),
        "{err}"
    );

    // The restore never ran: the previous generation is still enforcing and
    // nothing from the aborted sync exists.
    assert!(h.fw.has_chain(&names::pod_fw_chain("default", "a", "v1")));
    assert!(!h.fw.has_chain(&names::pod_fw_chain("default", "a", "v2")));
    assert!(
        !h.fw.chains().iter().any(|c| {
            c.starts_with(names::POLICY_CHAIN_PREFIX)
                && c != names::DEFAULT_INGRESS_CHAIN
                && c != names::DEFAULT_EGRESS_CHAIN
        }),
        "no policy chain may be created by an aborted sync"
    );
}
