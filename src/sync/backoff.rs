use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with optional jitter, capped at `max_ms`.
///
/// `delay(n)` for the n-th attempt (1-based) is
/// `min(base_ms * factor^(n-1), max_ms)` plus up to `jitter` of that value
/// at random, clamped again to `max_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
	#[serde(default = "default_base_ms")]
	pub base_ms: u64,

	#[serde(default = "default_factor")]
	pub factor: f64,

	#[serde(default = "default_max_ms")]
	pub max_ms: u64,

	/// Fraction of the computed delay added as random jitter (0 disables).
	#[serde(default = "default_jitter")]
	pub jitter: f64,
}

impl Default for BackoffConfig {
	fn default() -> Self {
		Self::retry()
	}
}

impl BackoffConfig {
	/// Per-operation retry delays: 5s, 10s, 20s, ... up to 2 minutes.
	pub fn retry() -> Self {
		Self {
			base_ms: default_base_ms(),
			factor: default_factor(),
			max_ms: default_max_ms(),
			jitter: default_jitter(),
		}
	}

	/// Orchestrator resumption after a failed pass: 5s, 15s, 45s, 120s.
	pub fn resume() -> Self {
		Self {
			base_ms: 5_000,
			factor: 3.0,
			max_ms: 120_000,
			jitter: 0.0,
		}
	}

	pub fn max_delay(&self) -> Duration {
		Duration::from_millis(self.max_ms)
	}

	/// Delay before attempt `attempt` without jitter.
	pub fn base_delay(&self, attempt: u32) -> Duration {
		let exponent = attempt.saturating_sub(1).min(63) as i32;
		let raw = self.base_ms as f64 * self.factor.max(1.0).powi(exponent);
		let capped = if raw.is_finite() {
			raw.min(self.max_ms as f64)
		} else {
			self.max_ms as f64
		};
		Duration::from_millis(capped as u64)
	}

	/// Delay before attempt `attempt`, with jitter applied.
	pub fn delay(&self, attempt: u32) -> Duration {
		let base = self.base_delay(attempt);
		if self.jitter <= 0.0 {
			return base;
		}
		let max_jitter = (base.as_millis() as f64 * self.jitter) as u64;
		let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter);
		base.saturating_add(Duration::from_millis(jitter_ms))
			.min(self.max_delay())
	}
}

fn default_base_ms() -> u64 {
	5_000
}

fn default_factor() -> f64 {
	2.0
}

fn default_max_ms() -> u64 {
	120_000
}

fn default_jitter() -> f64 {
	0.25
}
