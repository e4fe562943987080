pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{MetricsRegistry, init_metrics};

use log::{Level, info};
use std::sync::Arc;

/// Process-wide observability handles.
pub struct ObservabilityState {
	pub metrics: Arc<MetricsRegistry>,
}

/// Install logging at `level` and create the metrics registry.
pub fn init_observability(level: Level) -> anyhow::Result<ObservabilityState> {
	init_logging(level)?;
	let metrics = init_metrics()?;

	info!("Observability initialized: logging at {}, metrics enabled", level);

	Ok(ObservabilityState { metrics })
}
