use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use tokio::time;

/// Sync instrumentation exported through the admin server.
#[derive(Clone, Debug)]
pub struct SyncMetrics {
    sync_duration: Histogram,
}

impl SyncMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let sync_duration = Histogram::new(
            [0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0].into_iter(),
        );
        reg.register(
            "iptables_sync_duration_seconds",
            "Wall time of a full iptables sync",
            sync_duration.clone(),
        );
        Self { sync_duration }
    }

    pub(crate) fn observe_sync(&self, elapsed: time::Duration) {
        self.sync_duration.observe(elapsed.as_secs_f64());
    }
}
