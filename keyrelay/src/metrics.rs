use crate::config::MetricsConfig;
use metrics_exporter_statsd::{StatsdBuilder, StatsdError};
use shared::metrics_defs::describe_all;

#[derive(thiserror::Error, Debug)]
pub enum MetricsError {
    #[error("could not build statsd recorder: {0}")]
    Statsd(#[from] StatsdError),
    #[error("a metrics recorder is already installed")]
    AlreadyInstalled,
}

/// Installs the statsd recorder and registers every metric description.
pub fn init(config: &MetricsConfig) -> Result<(), MetricsError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some(&config.prefix))?;
    metrics::set_global_recorder(recorder).map_err(|_| MetricsError::AlreadyInstalled)?;

    for defs in [
        keypool::metrics_defs::ALL_METRICS,
        egress::metrics_defs::ALL_METRICS,
        engine::metrics_defs::ALL_METRICS,
    ] {
        describe_all(defs);
    }

    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "Metrics reporting to statsd"
    );
    Ok(())
}
