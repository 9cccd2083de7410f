//! Cluster-state cache.
//!
//! A single [`Index`] holds the pod, namespace, and policy state delivered
//! by the watch streams. The `kubert::index` callbacks below are the only
//! writers. Handlers do no work beyond updating the cache and requesting a
//! full sync; the engine derives everything else from a snapshot at sync
//! time.
//!
//! Until the first full sync has completed, change events update the cache
//! but request nothing.

use crate::sync::SyncHandle;
use ahash::AHashMap as HashMap;
use netpol_agent_core::{PodInfo, Protocol};
use netpol_agent_k8s::{self as k8s, Labels, ResourceExt};
use parking_lot::RwLock;
use std::{net::IpAddr, sync::Arc};
use tracing::{debug, warn};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds all watched cluster state. Owned and updated by the watch-driven
/// indexing tasks; read by the engine as a snapshot at the start of each
/// full sync.
#[derive(Debug)]
pub struct Index {
    /// Pods by namespace and name.
    pods: HashMap<String, HashMap<String, PodMeta>>,

    /// Namespace labels by name, for namespace-selector peers.
    namespaces: HashMap<String, Labels>,

    /// Raw policy specs by namespace and name.
    policies: HashMap<String, HashMap<String, Arc<k8s::NetworkPolicySpec>>>,

    sync: SyncHandle,
}

/// The parts of a pod the engine cares about.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PodMeta {
    pub namespace: String,
    pub name: String,
    pub ip: Option<IpAddr>,
    pub host_ip: Option<IpAddr>,
    pub phase: Option<String>,
    pub host_network: bool,
    pub labels: Labels,
    pub named_ports: Vec<NamedContainerPort>,
}

/// A named container port declared by a pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct NamedContainerPort {
    pub name: String,
    pub protocol: Protocol,
    pub port: u16,
}

/// A copy of the cluster state taken at the start of a full sync.
#[derive(Clone, Debug, Default)]
pub(crate) struct ClusterSnapshot {
    /// All pods, ordered by (namespace, name).
    pub pods: Vec<PodMeta>,
    pub namespaces: HashMap<String, Labels>,
    /// All policies, ordered by (namespace, name).
    pub policies: Vec<PolicyMeta>,
}

#[derive(Clone, Debug)]
pub(crate) struct PolicyMeta {
    pub namespace: String,
    pub name: String,
    pub spec: Arc<k8s::NetworkPolicySpec>,
}

// === impl Index ===

impl Index {
    pub fn shared(sync: SyncHandle) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            pods: HashMap::default(),
            namespaces: HashMap::default(),
            policies: HashMap::default(),
            sync,
        }))
    }

    pub(crate) fn snapshot(&self) -> ClusterSnapshot {
        let mut pods = self
            .pods
            .values()
            .flat_map(|by_name| by_name.values().cloned())
            .collect::<Vec<_>>();
        pods.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));

        let mut policies = self
            .policies
            .iter()
            .flat_map(|(ns, by_name)| {
                by_name.iter().map(|(name, spec)| PolicyMeta {
                    namespace: ns.clone(),
                    name: name.clone(),
                    spec: spec.clone(),
                })
            })
            .collect::<Vec<_>>();
        policies.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));

        ClusterSnapshot {
            pods,
            namespaces: self.namespaces.clone(),
            policies,
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        let meta = PodMeta::from_pod(pod);
        let pods = self.pods.entry(meta.namespace.clone()).or_default();
        match pods.insert(meta.name.clone(), meta.clone()) {
            None => {
                debug!(pod = %meta.name, ns = %meta.namespace, "pod added");
                self.sync.request_if_ready();
            }
            Some(prior) => {
                // Only phase, IP, and label changes can alter the derived
                // firewall configuration.
                if prior.phase != meta.phase || prior.ip != meta.ip || prior.labels != meta.labels
                {
                    debug!(pod = %meta.name, ns = %meta.namespace, "pod updated");
                    self.sync.request_if_ready();
                }
            }
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(by_name) = self.pods.get_mut(&namespace) {
            if by_name.remove(&name).is_some() {
                debug!(pod = %name, ns = %namespace, "pod deleted");
                self.sync.request_if_ready();
            }
            if by_name.is_empty() {
                self.pods.remove(&namespace);
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::NetworkPolicy> for Index {
    fn apply(&mut self, policy: k8s::NetworkPolicy) {
        let namespace = policy.namespace().unwrap_or_default();
        let name = policy.name_any();
        let spec = policy.spec.unwrap_or_default();

        let policies = self.policies.entry(namespace.clone()).or_default();
        match policies.get(&name) {
            Some(prior) if **prior == spec => {
                debug!(policy = %name, ns = %namespace, "no changes");
            }
            _ => {
                debug!(policy = %name, ns = %namespace, "policy applied");
                policies.insert(name, Arc::new(spec));
                self.sync.request_if_ready();
            }
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(by_name) = self.policies.get_mut(&namespace) {
            if by_name.remove(&name).is_some() {
                debug!(policy = %name, ns = %namespace, "policy deleted");
                self.sync.request_if_ready();
            }
            if by_name.is_empty() {
                self.policies.remove(&namespace);
            }
        }
    }
}

impl kubert::index::IndexClusterResource<k8s::Namespace> for Index {
    fn apply(&mut self, ns: k8s::Namespace) {
        let name = ns.name_any();
        let labels = Labels::from(ns.metadata.labels);
        match self.namespaces.insert(name.clone(), labels.clone()) {
            Some(prior) if prior == labels => {}
            _ => {
                debug!(ns = %name, "namespace applied");
                self.sync.request_if_ready();
            }
        }
    }

    fn delete(&mut self, name: String) {
        if self.namespaces.remove(&name).is_some() {
            debug!(ns = %name, "namespace deleted");
            self.sync.request_if_ready();
        }
    }
}

// === impl PodMeta ===

impl PodMeta {
    fn from_pod(pod: k8s::Pod) -> Self {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        let labels = Labels::from(pod.metadata.labels);

        let (ip, host_ip, phase) = match pod.status {
            Some(status) => (
                parse_ip(&namespace, &name, status.pod_ip),
                parse_ip(&namespace, &name, status.host_ip),
                status.phase,
            ),
            None => (None, None, None),
        };

        let (host_network, named_ports) = match pod.spec {
            Some(spec) => (
                spec.host_network.unwrap_or(false),
                named_container_ports(&spec),
            ),
            None => (false, Vec::new()),
        };

        Self {
            namespace,
            name,
            ip,
            host_ip,
            phase,
            host_network,
            labels,
            named_ports,
        }
    }

    /// The pod's IP, if it has one the engine may route policy through.
    /// Host-network pods share the node address and are never policed.
    pub fn routable_ip(&self) -> Option<IpAddr> {
        if self.host_network {
            return None;
        }
        self.ip
    }

    pub fn is_local(&self, node_ip: IpAddr) -> bool {
        self.host_ip == Some(node_ip)
    }

    pub fn to_pod_info(&self, ip: IpAddr) -> PodInfo {
        PodInfo {
            ip,
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

fn parse_ip(ns: &str, pod: &str, ip: Option<String>) -> Option<IpAddr> {
    let ip = ip?;
    if ip.is_empty() {
        return None;
    }
    match ip.parse() {
        Ok(ip) => Some(ip),
        Err(error) => {
            warn!(%ns, %pod, %ip, %error, "ignoring unparseable pod address");
            None
        }
    }
}

fn named_container_ports(spec: &k8s::PodSpec) -> Vec<NamedContainerPort> {
    let mut ports = Vec::new();
    for container in &spec.containers {
        for port in container.ports.iter().flatten() {
            if let Some(name) = &port.name {
                let protocol = port
                    .protocol
                    .as_deref()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or_default();
                match u16::try_from(port.container_port) {
                    Ok(number) => ports.push(NamedContainerPort {
                        name: name.clone(),
                        protocol,
                        port: number,
                    }),
                    Err(_) => warn!(
                        container = %container.name,
                        port = %name,
                        "ignoring out-of-range container port"
                    ),
                }
            }
        }
    }
    ports
}
