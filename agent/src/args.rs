use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::runtime::watcher;
use netpol_agent_core::{IpNet, NodePortRange};
use netpol_agent_index::{
    self as index, metrics::SyncMetrics, ClusterInfo, Engine, Heartbeat, Index, IpsetCmd,
    IptablesCmd,
};
use netpol_agent_k8s as k8s;
use prometheus_client::registry::Registry;
use std::{net::IpAddr, sync::Arc};
use tokio::{sync::mpsc, time::Duration};
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "netpol-agent", about = "Per-node NetworkPolicy enforcement agent")]
pub struct Args {
    #[clap(long, default_value = "netpol=info,warn", env = "NETPOL_AGENT_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Hostname of the node this agent enforces policies on.
    #[clap(long, env = "HOSTNAME")]
    node_name: String,

    /// Primary IP of the node; pods scheduled here are local.
    #[clap(long)]
    node_ip: IpAddr,

    /// The node's pod CIDR. When set, traffic that is not to or from local
    /// pods bypasses the agent's chains entirely.
    #[clap(long)]
    pod_cidr: Option<IpNet>,

    /// Service cluster-IP range exempted from enforcement.
    #[clap(long, default_value = "10.96.0.0/12")]
    service_cluster_ip_range: IpNet,

    /// Service external-IP ranges exempted from enforcement.
    #[clap(long)]
    service_external_ip_range: Vec<IpNet>,

    /// Node-port range exempted from enforcement, as `low:high`.
    #[clap(long, default_value = "30000:32767")]
    service_node_port_range: NodePortRange,

    /// Seconds between periodic full syncs.
    #[clap(long, default_value = "300")]
    iptables_sync_period: u64,

    /// Accept (instead of reject) pod traffic during the window before a
    /// pod's firewall chain is installed.
    #[clap(long)]
    allow_pre_enforcement: bool,

    /// Remove every chain, rule, and IP set the agent ever installed, then
    /// exit.
    #[clap(long)]
    cleanup: bool,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            node_name,
            node_ip,
            pod_cidr,
            service_cluster_ip_range,
            service_external_ip_range,
            service_node_port_range,
            iptables_sync_period,
            allow_pre_enforcement,
            cleanup,
        } = self;

        if cleanup {
            // Host-only operation; no cluster access is needed.
            tracing_subscriber::fmt::init();
            let fw = IptablesCmd::new();
            let ipsets = IpsetCmd::new();
            return index::cleanup(&fw, &ipsets).await;
        }

        let config = ClusterInfo {
            node_name,
            node_ip,
            pod_cidr,
            service_cluster_cidr: service_cluster_ip_range,
            service_external_ranges: service_external_ip_range,
            node_port_range: service_node_port_range,
            sync_period: Duration::from_secs(iptables_sync_period),
            allow_pre_enforcement,
        };

        let mut prom = <Registry>::default();
        let sync_metrics = SyncMetrics::register(prom.sub_registry_with_prefix("netpol"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let (handle, requests) = index::sync_channel();
        let idx = Index::shared(handle.clone());

        // Watches feed the shared index; the handlers themselves only
        // request syncs.
        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(kubert::index::namespaced(idx.clone(), pods).instrument(info_span!("pods")));

        let namespaces = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(idx.clone(), namespaces).instrument(info_span!("namespaces")),
        );

        let policies = runtime.watch_all::<k8s::NetworkPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(idx.clone(), policies)
                .instrument(info_span!("networkpolicies")),
        );

        // Heartbeats are surfaced as log records; the admin server already
        // exposes liveness.
        let (health_tx, mut health_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            while let Some(Heartbeat { component, .. }) = health_rx.recv().await {
                debug!(%component, "heartbeat");
            }
        });

        let engine = Arc::new(Engine::new(
            config,
            idx,
            Arc::new(IptablesCmd::new()),
            Arc::new(IpsetCmd::new()),
            health_tx,
            Some(sync_metrics),
            handle,
        ));
        let engine_task = tokio::spawn(
            engine
                .run(requests, runtime.shutdown_handle())
                .instrument(info_span!("sync")),
        );

        tokio::select! {
            res = runtime.run() => {
                if res.is_err() {
                    bail!("aborted");
                }
            }
            res = engine_task => match res {
                Ok(Ok(())) => {}
                Ok(Err(error)) => return Err(error),
                Err(error) => return Err(error).context("engine task failed"),
            },
        }
        Ok(())
    }
}
