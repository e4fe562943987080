use log::warn;
use prometheus::{GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Instant;

use crate::sync::telemetry::{Metric, TelemetrySink};

/// Prometheus-backed telemetry sink.
pub struct MetricsRegistry {
	registry: Registry,

	/// Latest value per metric, labelled by name, category and unit.
	pub values: GaugeVec,
	/// Timings recorded through `record_timing`, in seconds.
	pub timings: HistogramVec,
	/// Threshold breaches per metric and level.
	pub breaches: IntCounterVec,
}

impl MetricsRegistry {
	pub fn try_new() -> Result<Self, prometheus::Error> {
		let registry = Registry::new();

		let values = GaugeVec::new(
			Opts::new("metric_value", "Latest value reported by the sync engine").namespace("itinerary_sync"),
			&["name", "category", "unit"],
		)?;

		let timings = HistogramVec::new(
			HistogramOpts::new("timing_seconds", "Duration of timed sync engine sections in seconds")
				.namespace("itinerary_sync")
				.buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
			&["name"],
		)?;

		let breaches = IntCounterVec::new(
			Opts::new("threshold_breaches_total", "Metric values at or above a threshold")
				.namespace("itinerary_sync"),
			&["name", "level"],
		)?;

		registry.register(Box::new(values.clone()))?;
		registry.register(Box::new(timings.clone()))?;
		registry.register(Box::new(breaches.clone()))?;

		Ok(Self {
			registry,
			values,
			timings,
			breaches,
		})
	}

	/// Render all metrics in the Prometheus text exposition format.
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		encoder
			.encode_to_string(&metric_families)
			.unwrap_or_else(|e| {
				warn!("Failed to encode metrics: {}", e);
				String::new()
			})
	}

	pub fn registry(&self) -> &Registry {
		&self.registry
	}
}

impl TelemetrySink for MetricsRegistry {
	fn record_metric(&self, metric: Metric) {
		self.values
			.with_label_values(&[metric.name.as_str(), metric.category.as_str(), metric.unit.as_str()])
			.set(metric.value);
		if let Some(breach) = metric.breach() {
			self.breaches
				.with_label_values(&[metric.name.as_str(), breach.as_str()])
				.inc();
		}
	}

	fn record_timing(&self, name: &str, start: Instant) {
		self.timings
			.with_label_values(&[name])
			.observe(start.elapsed().as_secs_f64());
	}
}

/// Create the process metrics registry.
pub fn init_metrics() -> anyhow::Result<Arc<MetricsRegistry>> {
	Ok(Arc::new(MetricsRegistry::try_new()?))
}
