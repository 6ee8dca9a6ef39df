use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const METRIC_MUTATIONS: &str = "pickline_mutations_total";
pub const METRIC_ROOMS_ACTIVE: &str = "pickline_rooms_active";
pub const METRIC_PAIRING_REDEEM: &str = "pickline_pairing_redeem_total";
pub const METRIC_PACK_PERSIST: &str = "pickline_pack_persist_seconds";
pub const METRIC_CONNECTIONS: &str = "pickline_connections_total";

pub struct Telemetry {
    metrics_handle: PrometheusHandle,
}

impl Telemetry {
    /// Installs the global subscriber and Prometheus recorder. `RUST_LOG`
    /// wins over `default_filter` when set.
    pub fn init(default_filter: &str) -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;

        tracing_subscriber::registry()
            .with(
                EnvFilter::try_from_default_env()
                    .or_else(|_| EnvFilter::try_new(default_filter))
                    .unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        Ok(Self { metrics_handle })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}
