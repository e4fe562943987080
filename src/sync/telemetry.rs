use serde::Serialize;
use std::fmt;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricCategory {
	Sync,
	Queue,
	Network,
	Storage,
}

impl MetricCategory {
	pub fn as_str(&self) -> &'static str {
		match self {
			MetricCategory::Sync => "sync",
			MetricCategory::Queue => "queue",
			MetricCategory::Network => "network",
			MetricCategory::Storage => "storage",
		}
	}
}

impl fmt::Display for MetricCategory {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Warning and critical levels; a value at or above a level breaches it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
	pub warning: f64,
	pub critical: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breach {
	Warning,
	Critical,
}

impl Breach {
	pub fn as_str(&self) -> &'static str {
		match self {
			Breach::Warning => "warning",
			Breach::Critical => "critical",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
	pub name: String,
	pub value: f64,
	pub category: MetricCategory,
	pub unit: String,
	pub thresholds: Option<Thresholds>,
}

impl Metric {
	pub fn new(name: impl Into<String>, value: f64, category: MetricCategory, unit: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			value,
			category,
			unit: unit.into(),
			thresholds: None,
		}
	}

	pub fn with_thresholds(mut self, warning: f64, critical: f64) -> Self {
		self.thresholds = Some(Thresholds { warning, critical });
		self
	}

	pub fn breach(&self) -> Option<Breach> {
		let t = self.thresholds?;
		if self.value >= t.critical {
			Some(Breach::Critical)
		} else if self.value >= t.warning {
			Some(Breach::Warning)
		} else {
			None
		}
	}
}

/// Optional metrics consumer. Nothing in the engine depends on what a sink
/// does with the values.
pub trait TelemetrySink: Send + Sync + 'static {
	fn record_metric(&self, metric: Metric);

	/// Record the time elapsed since `start` under `name`.
	fn record_timing(&self, name: &str, start: Instant);
}
