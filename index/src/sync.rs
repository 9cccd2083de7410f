//! The reconciler: coalesces change events and periodic ticks into
//! serialized full syncs.
//!
//! Sync requests travel through a single-slot channel; a request that finds
//! the slot occupied is dropped, because the pending sync will observe the
//! same or newer cluster state. The run loop is the only consumer and holds
//! the engine mutex for the duration of each sync, so syncs never overlap.
//! Shutdown is observed between syncs only; an in-flight sync always runs
//! to completion.

use crate::{
    cluster_info::ClusterInfo, gc, index::SharedIndex, install, ipset::Ipsets,
    iptables::FilterTable, metrics::SyncMetrics, pod_fw, policy, policy_fw,
};
use anyhow::{Context, Result};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{
    sync::{mpsc, Mutex},
    time,
};
use tracing::{debug, error, info, warn};

/// Sent on the health channel at the start of every full sync.
#[derive(Clone, Debug)]
pub struct Heartbeat {
    pub component: &'static str,
    pub at: time::Instant,
}

/// A full sync failure.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The top-level chains could not be installed; the engine cannot
    /// guarantee it is authoritative for pod traffic, so the process must
    /// exit.
    #[error("failed to install top-level chains: {0}")]
    Fatal(#[source] anyhow::Error),

    /// The sync was abandoned without touching host state; the next tick or
    /// event re-drives it.
    #[error(transparent)]
    Aborted(#[from] anyhow::Error),
}

/// Requests full syncs without ever blocking the caller.
#[derive(Clone, Debug)]
pub struct SyncHandle {
    tx: mpsc::Sender<()>,
    ready: Arc<AtomicBool>,
}

/// Creates the single-slot request channel and its handle.
pub fn sync_channel() -> (SyncHandle, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    (
        SyncHandle {
            tx,
            ready: Arc::new(AtomicBool::new(false)),
        },
        rx,
    )
}

impl SyncHandle {
    /// Requests a full sync. A request finding the slot occupied is dropped.
    pub fn request(&self) {
        match self.tx.try_send(()) {
            Ok(()) => debug!("full sync requested"),
            Err(mpsc::error::TrySendError::Full(())) => {
                debug!("full sync already pending, skipping")
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                warn!("sync loop has shut down, dropping sync request")
            }
        }
    }

    /// Requests a full sync only once the first sync has completed. Event
    /// handlers use this so that no event produces side effects before the
    /// engine has reconciled at least once.
    pub fn request_if_ready(&self) {
        if self.ready.load(Ordering::Acquire) {
            self.request();
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }
}

/// Reconciles cluster state into host filter-table and IP-set state.
pub struct Engine {
    config: ClusterInfo,
    index: SharedIndex,
    fw: Arc<dyn FilterTable>,
    ipsets: Arc<dyn Ipsets>,
    health: mpsc::Sender<Heartbeat>,
    metrics: Option<SyncMetrics>,
    handle: SyncHandle,

    /// Serializes full syncs; held for the duration of each sync.
    lock: Mutex<()>,
}

// === impl Engine ===

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ClusterInfo,
        index: SharedIndex,
        fw: Arc<dyn FilterTable>,
        ipsets: Arc<dyn Ipsets>,
        health: mpsc::Sender<Heartbeat>,
        metrics: Option<SyncMetrics>,
        handle: SyncHandle,
    ) -> Self {
        Self {
            config,
            index,
            fw,
            ipsets,
            health,
            metrics,
            handle,
            lock: Mutex::new(()),
        }
    }

    /// Drives the ticker and the sync consumer until shutdown. Returns an
    /// error only when a sync fails fatally.
    pub async fn run(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<()>,
        shutdown: drain::Watch,
    ) -> Result<()> {
        info!(period = ?self.config.sync_period, "starting network policy engine");
        let mut ticker = time::interval(self.config.sync_period);
        let mut shutdown = std::pin::pin!(shutdown.signaled());

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutting down network policy engine");
                    return Ok(());
                }

                // The first tick fires immediately, driving the initial sync.
                _ = ticker.tick() => {
                    debug!("requesting periodic full sync");
                    self.handle.request();
                }

                request = requests.recv() => match request {
                    Some(()) => {
                        match self.full_policy_sync().await {
                            Ok(()) => {}
                            Err(SyncError::Fatal(error)) => {
                                error!(%error, "cannot guarantee policy enforcement");
                                return Err(error);
                            }
                            Err(SyncError::Aborted(error)) => {
                                error!(%error, "aborted full sync");
                            }
                        }
                        // Event handlers stay dormant until at least one full
                        // sync has been driven to completion.
                        self.handle.set_ready();
                    }
                    None => {
                        info!("sync request channel closed");
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Runs one full reconciliation pass against the host.
    pub async fn full_policy_sync(&self) -> Result<(), SyncError> {
        let version = sync_version().map_err(SyncError::Aborted)?;
        self.sync_with_version(&version).await
    }

    pub(crate) async fn sync_with_version(&self, version: &str) -> Result<(), SyncError> {
        let _guard = self.lock.lock().await;
        self.heartbeat();

        let start = time::Instant::now();
        debug!(%version, "starting full sync");
        let res = self.sync_inner(version).await;
        let elapsed = start.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.observe_sync(elapsed);
        }
        debug!(?elapsed, ok = res.is_ok(), "full sync finished");
        res
    }

    async fn sync_inner(&self, version: &str) -> Result<(), SyncError> {
        install::ensure_default_pod_fw_chain(&*self.fw, &self.config)
            .await
            .map_err(SyncError::Fatal)?;
        install::ensure_top_level_chains(&*self.fw, &self.config)
            .await
            .map_err(SyncError::Fatal)?;
        install::ensure_default_policy_chains(&*self.fw)
            .await
            .map_err(SyncError::Fatal)?;

        let snapshot = self.index.read().snapshot();
        let policies =
            policy::build_policy_model(&snapshot).context("failed to build network policies")?;

        let mut table = self
            .fw
            .save()
            .await
            .context("failed to dump the filter table")?;

        let (active_policy_chains, active_sets) =
            policy_fw::sync_policy_chains(&mut table, &*self.ipsets, &policies, version)
                .await
                .context("failed to sync network policy chains")?;

        let active_pod_fw_chains =
            pod_fw::sync_pod_fw_chains(&mut table, &snapshot, &policies, &self.config, version);

        gc::cleanup_stale_rules(
            &*self.fw,
            &*self.ipsets,
            &table,
            &active_policy_chains,
            &active_pod_fw_chains,
            &active_sets,
        )
        .await
        .context("failed to clean up stale rules")?;

        Ok(())
    }

    /// Removes everything the engine ever installed. Runs outside the
    /// normal loop.
    pub async fn cleanup(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        gc::cleanup(&*self.fw, &*self.ipsets).await
    }

    fn heartbeat(&self) {
        let beat = Heartbeat {
            component: "netpol",
            at: time::Instant::now(),
        };
        if self.health.try_send(beat).is_err() {
            debug!("health channel is full or closed, skipping heartbeat");
        }
    }
}

/// Monotonically increasing token embedded in chain names so each sync
/// creates fresh chains alongside the previous generation.
fn sync_version() -> Result<String> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .context("system clock is before the epoch")?;
    Ok(now.as_nanos().to_string())
}
