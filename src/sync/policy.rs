use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const MINUTE_MS: i64 = 60_000;
const ACTIVE_WINDOW_MS: i64 = 30_000;
const MAX_ACTIONS_PER_MINUTE: f64 = 30.0;

/// Tuning for the adaptive scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
	#[serde(default = "default_true")]
	pub enabled: bool,

	#[serde(default = "default_min_interval_ms")]
	pub min_interval_ms: u64,

	#[serde(default = "default_max_interval_ms")]
	pub max_interval_ms: u64,

	#[serde(default = "default_max_parallel_batches")]
	pub max_parallel_batches: usize,

	#[serde(default = "default_true")]
	pub parallel_processing: bool,

	#[serde(default = "default_true")]
	pub intelligent_batching: bool,

	#[serde(default = "default_true")]
	pub activity_tracking: bool,

	/// Queue depth above which a new operation triggers a pass right away.
	#[serde(default = "default_immediate_queue_depth")]
	pub immediate_queue_depth: usize,

	/// Actions per minute above which an active user triggers a pass right
	/// away.
	#[serde(default = "default_immediate_actions_per_minute")]
	pub immediate_actions_per_minute: f64,

	/// Passes slower than this shrink the next batch.
	#[serde(default = "default_slow_pass_ms")]
	pub slow_pass_ms: u64,
}

impl Default for AdaptiveConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			min_interval_ms: default_min_interval_ms(),
			max_interval_ms: default_max_interval_ms(),
			max_parallel_batches: default_max_parallel_batches(),
			parallel_processing: true,
			intelligent_batching: true,
			activity_tracking: true,
			immediate_queue_depth: default_immediate_queue_depth(),
			immediate_actions_per_minute: default_immediate_actions_per_minute(),
			slow_pass_ms: default_slow_pass_ms(),
		}
	}
}

impl AdaptiveConfig {
	pub fn min_interval(&self) -> Duration {
		Duration::from_millis(self.min_interval_ms)
	}

	pub fn max_interval(&self) -> Duration {
		Duration::from_millis(self.max_interval_ms.max(self.min_interval_ms))
	}

	pub fn slow_pass(&self) -> Duration {
		Duration::from_millis(self.slow_pass_ms)
	}
}

fn default_true() -> bool {
	true
}

fn default_min_interval_ms() -> u64 {
	5_000
}

fn default_max_interval_ms() -> u64 {
	300_000
}

fn default_max_parallel_batches() -> usize {
	3
}

fn default_immediate_queue_depth() -> usize {
	20
}

fn default_immediate_actions_per_minute() -> f64 {
	5.0
}

fn default_slow_pass_ms() -> u64 {
	5_000
}

/// Estimates how busy the user is from a stream of interaction events.
#[derive(Debug, Clone, Default)]
pub struct ActivityTracker {
	actions_per_minute: f64,
	last_action_ms: Option<i64>,
}

/// Point-in-time view of [`ActivityTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ActivitySnapshot {
	pub actions_per_minute: f64,
	pub active: bool,
	pub last_action_ms: Option<i64>,
}

impl ActivityTracker {
	pub fn new() -> Self {
		Self::default()
	}

	/// One action: +1/min (capped) if the previous one was within a minute,
	/// otherwise the estimate decays by 20%.
	pub fn record(&mut self, now_ms: i64) {
		self.actions_per_minute = match self.last_action_ms {
			None => 1.0,
			Some(last) if now_ms - last < MINUTE_MS => {
				(self.actions_per_minute + 1.0).min(MAX_ACTIONS_PER_MINUTE)
			}
			Some(_) => self.actions_per_minute * 0.8,
		};
		self.last_action_ms = Some(now_ms);
	}

	/// Periodic decay: after a minute without actions the estimate drops by
	/// 10% per call.
	pub fn decay(&mut self, now_ms: i64) {
		if self.last_action_ms.is_none_or(|last| now_ms - last > MINUTE_MS) {
			self.actions_per_minute *= 0.9;
		}
	}

	pub fn is_active(&self, now_ms: i64) -> bool {
		self.last_action_ms
			.is_some_and(|last| now_ms - last < ACTIVE_WINDOW_MS)
	}

	pub fn snapshot(&self, now_ms: i64) -> ActivitySnapshot {
		ActivitySnapshot {
			actions_per_minute: self.actions_per_minute,
			active: self.is_active(now_ms),
			last_action_ms: self.last_action_ms,
		}
	}
}

/// What the scheduler learned from one pass.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PassObservation {
	/// Queue depth after the pass.
	pub queue_depth: usize,
	pub duration: Duration,
	pub processed: usize,
	pub succeeded: usize,
}

impl PassObservation {
	pub fn success_rate(&self) -> f64 {
		if self.processed == 0 {
			1.0
		} else {
			self.succeeded as f64 / self.processed as f64
		}
	}
}

/// Decides when passes run and how much work each takes.
pub trait SchedulePolicy: Send + Sync + 'static {
	fn interval(&self) -> Duration;

	fn batch_size(&self) -> usize;

	/// Sub-batches dispatched concurrently per pass; 1 means sequential.
	fn parallel_batches(&self) -> usize;

	fn record_activity(&self, now_ms: i64);

	fn decay_activity(&self, now_ms: i64);

	fn activity(&self, now_ms: i64) -> ActivitySnapshot;

	/// Whether a freshly queued operation should trigger an out-of-band pass.
	fn should_process_immediately(&self, queue_depth: usize, now_ms: i64) -> bool;

	/// Feed back a completed pass. Returns the new interval when it changed.
	fn after_pass(&self, observation: &PassObservation, now_ms: i64) -> Option<Duration>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Constant interval and batch size, sequential dispatch, and a pass after
/// every enqueue.
#[derive(Debug)]
pub struct FixedPolicy {
	interval: Duration,
	batch_size: usize,
	tracker: Mutex<ActivityTracker>,
}

impl FixedPolicy {
	pub fn new(interval: Duration, batch_size: usize) -> Self {
		Self {
			interval,
			batch_size: batch_size.max(1),
			tracker: Mutex::new(ActivityTracker::new()),
		}
	}
}

impl SchedulePolicy for FixedPolicy {
	fn interval(&self) -> Duration {
		self.interval
	}

	fn batch_size(&self) -> usize {
		self.batch_size
	}

	fn parallel_batches(&self) -> usize {
		1
	}

	fn record_activity(&self, now_ms: i64) {
		lock(&self.tracker).record(now_ms);
	}

	fn decay_activity(&self, now_ms: i64) {
		lock(&self.tracker).decay(now_ms);
	}

	fn activity(&self, now_ms: i64) -> ActivitySnapshot {
		lock(&self.tracker).snapshot(now_ms)
	}

	fn should_process_immediately(&self, _queue_depth: usize, _now_ms: i64) -> bool {
		true
	}

	fn after_pass(&self, _observation: &PassObservation, _now_ms: i64) -> Option<Duration> {
		None
	}
}

#[derive(Debug)]
struct AdaptiveState {
	interval: Duration,
	batch_size: usize,
	tracker: ActivityTracker,
}

/// Retunes interval and batch size after every pass from queue depth,
/// user activity, pass duration and success ratio.
#[derive(Debug)]
pub struct AdaptivePolicy {
	config: AdaptiveConfig,
	base_interval: Duration,
	base_batch_size: usize,
	state: Mutex<AdaptiveState>,
}

impl AdaptivePolicy {
	pub fn new(config: AdaptiveConfig, base_interval: Duration, base_batch_size: usize) -> Self {
		let base_batch_size = base_batch_size.max(1);
		let interval = clamp_interval(base_interval, &config);
		Self {
			config,
			base_interval,
			base_batch_size,
			state: Mutex::new(AdaptiveState {
				interval,
				batch_size: base_batch_size,
				tracker: ActivityTracker::new(),
			}),
		}
	}

	pub fn config(&self) -> &AdaptiveConfig {
		&self.config
	}
}

impl SchedulePolicy for AdaptivePolicy {
	fn interval(&self) -> Duration {
		lock(&self.state).interval
	}

	fn batch_size(&self) -> usize {
		lock(&self.state).batch_size
	}

	fn parallel_batches(&self) -> usize {
		if self.config.parallel_processing {
			self.config.max_parallel_batches.max(1)
		} else {
			1
		}
	}

	fn record_activity(&self, now_ms: i64) {
		if self.config.activity_tracking {
			lock(&self.state).tracker.record(now_ms);
		}
	}

	fn decay_activity(&self, now_ms: i64) {
		lock(&self.state).tracker.decay(now_ms);
	}

	fn activity(&self, now_ms: i64) -> ActivitySnapshot {
		lock(&self.state).tracker.snapshot(now_ms)
	}

	fn should_process_immediately(&self, queue_depth: usize, now_ms: i64) -> bool {
		let activity = self.activity(now_ms);
		queue_depth > self.config.immediate_queue_depth
			|| (activity.active
				&& activity.actions_per_minute > self.config.immediate_actions_per_minute)
	}

	fn after_pass(&self, observation: &PassObservation, now_ms: i64) -> Option<Duration> {
		if !self.config.enabled {
			return None;
		}
		let mut state = lock(&self.state);
		let activity = state.tracker.snapshot(now_ms);

		if self.config.intelligent_batching {
			state.batch_size = compute_batch_size(
				self.base_batch_size,
				observation.queue_depth,
				&activity,
				observation.duration,
				&self.config,
			);
		}

		let interval = compute_interval(
			self.base_interval,
			observation.queue_depth,
			&activity,
			observation.success_rate(),
			&self.config,
		);
		if interval == state.interval {
			return None;
		}
		debug!(
			"Adaptive sync interval {}ms -> {}ms (depth {}, {:.1} actions/min, batch {})",
			state.interval.as_millis(),
			interval.as_millis(),
			observation.queue_depth,
			activity.actions_per_minute,
			state.batch_size
		);
		state.interval = interval;
		Some(interval)
	}
}

fn clamp_interval(interval: Duration, config: &AdaptiveConfig) -> Duration {
	interval.max(config.min_interval()).min(config.max_interval())
}

/// Deep queues and busy users shorten the interval; an empty queue or an
/// idle user lengthens it; a poor success ratio shortens it slightly.
/// Always within `[min_interval, max_interval]`.
pub fn compute_interval(
	base: Duration,
	queue_depth: usize,
	activity: &ActivitySnapshot,
	success_rate: f64,
	config: &AdaptiveConfig,
) -> Duration {
	let mut ms = base.as_millis() as f64;

	if queue_depth > 50 {
		ms *= 0.5;
	} else if queue_depth > 20 {
		ms *= 0.7;
	} else if queue_depth == 0 {
		ms *= 1.5;
	}

	if config.activity_tracking {
		if activity.active && activity.actions_per_minute > 10.0 {
			ms *= 0.6;
		} else if !activity.active {
			ms *= 2.0;
		}
	}

	if success_rate < 0.8 {
		ms *= 0.8;
	}

	let min = config.min_interval().as_millis() as f64;
	let max = config.max_interval().as_millis() as f64;
	Duration::from_millis(ms.max(min).min(max).round() as u64)
}

/// Deep queues grow the batch; a busy user or a slow previous pass shrinks
/// it. Never below 1.
pub fn compute_batch_size(
	base: usize,
	queue_depth: usize,
	activity: &ActivitySnapshot,
	last_duration: Duration,
	config: &AdaptiveConfig,
) -> usize {
	let base = base.max(1) as f64;
	let mut size = base;

	if queue_depth > 100 {
		size = (base * 2.0).min(50.0);
	} else if queue_depth > 50 {
		size = (base * 1.5).min(30.0);
	}

	if config.activity_tracking && activity.active && activity.actions_per_minute > 15.0 {
		size = (size * 0.7).max(5.0);
	}

	if last_duration > config.slow_pass() {
		size = (size * 0.8).max(5.0);
	}

	(size.round() as usize).max(1)
}

/// Split `items` into at most `max_parts` contiguous parts of near-equal
/// size, preserving order.
pub fn split_batch<T>(items: Vec<T>, max_parts: usize) -> Vec<Vec<T>> {
	let n = items.len();
	if n == 0 {
		return Vec::new();
	}
	let parts = max_parts.clamp(1, n);
	let size = n.div_ceil(parts);

	let mut out = Vec::with_capacity(parts);
	let mut iter = items.into_iter().peekable();
	while iter.peek().is_some() {
		out.push(iter.by_ref().take(size).collect());
	}
	out
}
