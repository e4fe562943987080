use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::backoff::BackoffConfig;
use super::conflict::{ConflictData, ConflictResolver, ConflictStrategy, ResolvedConflict, conflict_summary};
use super::error::{FailureKind, SyncError, classify_failure};
use super::platform::{ActivitySignal, Clock, NetworkStatus, ReadCache, TokioClock};
use super::policy::{
	ActivitySnapshot, AdaptiveConfig, AdaptivePolicy, FixedPolicy, PassObservation, SchedulePolicy, split_batch,
};
use super::pool::TaskPool;
use super::queue::{OperationQueue, QueueStats};
use super::realtime::{ChangeNotification, EventSource};
use super::telemetry::{Metric, MetricCategory, TelemetrySink};
use super::transport::{NetworkTransport, OperationResult, WireOperation, normalize_payload};
use super::types::{NewOperation, OperationType, QueuedOperation, ResourceKind};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
const DECAY_TICK: Duration = Duration::from_secs(10);
const EVENT_CAPACITY: usize = 256;

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
	#[serde(default = "default_interval_ms")]
	pub interval_ms: u64,

	/// Attempts per operation before a retryable failure is dropped.
	#[serde(default = "default_retry_attempts")]
	pub retry_attempts: u32,

	#[serde(default = "default_batch_size")]
	pub batch_size: usize,

	/// Conflict strategy for patch operations on fields without a rule.
	#[serde(default)]
	pub default_strategy: ConflictStrategy,

	#[serde(default = "default_enable_realtime")]
	pub enable_realtime: bool,

	#[serde(default = "default_startup_delay_ms")]
	pub startup_delay_ms: u64,

	#[serde(default = "default_immediate_delay_ms")]
	pub immediate_delay_ms: u64,

	/// Per-operation retry delays.
	#[serde(default)]
	pub backoff: BackoffConfig,

	/// Resumption delays after a failed pass.
	#[serde(default = "BackoffConfig::resume")]
	pub resume: BackoffConfig,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			interval_ms: default_interval_ms(),
			retry_attempts: default_retry_attempts(),
			batch_size: default_batch_size(),
			default_strategy: ConflictStrategy::default(),
			enable_realtime: default_enable_realtime(),
			startup_delay_ms: default_startup_delay_ms(),
			immediate_delay_ms: default_immediate_delay_ms(),
			backoff: BackoffConfig::retry(),
			resume: BackoffConfig::resume(),
		}
	}
}

impl SyncConfig {
	pub fn interval(&self) -> Duration {
		Duration::from_millis(self.interval_ms)
	}

	pub fn startup_delay(&self) -> Duration {
		Duration::from_millis(self.startup_delay_ms)
	}

	pub fn immediate_delay(&self) -> Duration {
		Duration::from_millis(self.immediate_delay_ms)
	}
}

fn default_interval_ms() -> u64 {
	30_000
}

fn default_retry_attempts() -> u32 {
	3
}

fn default_batch_size() -> usize {
	10
}

fn default_enable_realtime() -> bool {
	true
}

fn default_startup_delay_ms() -> u64 {
	1_000
}

fn default_immediate_delay_ms() -> u64 {
	100
}

/// Totals for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
	pub processed: usize,
	pub succeeded: usize,
	/// Non-retryable, unresolvable or exhausted operations removed.
	pub dropped: usize,
	pub retried: usize,
	pub conflicts_resolved: usize,
	/// Dropped because the retry budget ran out. Included in `dropped`.
	pub exhausted: usize,
	pub duration_ms: u64,
}

impl PassReport {
	pub fn failed(&self) -> usize {
		self.processed - self.succeeded
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
	SyncStart,
	SyncComplete(PassReport),
	SyncError {
		message: String,
	},
	ConflictDetected {
		operation_id: String,
		resolution: ResolvedConflict,
	},
	QueueUpdated {
		queue_size: usize,
	},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
	Idle,
	Syncing,
	/// No periodic timer running.
	Paused,
	Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
	Offline,
	InProgress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
	Skipped(SkipReason),
	/// Nothing ready to send.
	Empty,
	Completed(PassReport),
}

/// Lifetime counters.
#[derive(Debug, Default)]
pub struct SyncCounters {
	pub passes: AtomicU64,
	pub succeeded: AtomicU64,
	pub failed: AtomicU64,
	pub dropped: AtomicU64,
	pub conflicts_resolved: AtomicU64,
	pub pass_errors: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStats {
	pub queue_size: usize,
	pub queue: QueueStats,
	pub last_sync_ms: Option<i64>,
	pub in_progress: bool,
	pub status: SyncStatus,
	pub interval_ms: u64,
	pub batch_size: usize,
	pub activity: ActivitySnapshot,
	pub passes: u64,
	pub succeeded: u64,
	pub failed: u64,
	pub dropped: u64,
	pub conflicts_resolved: u64,
	pub pass_errors: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the in-progress flag when the pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
	fn acquire(flag: &'a AtomicBool) -> Option<Self> {
		flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.ok()
			.map(|_| PassGuard(flag))
	}
}

impl Drop for PassGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::Release);
	}
}

#[derive(Default)]
struct Tasks {
	periodic: Option<JoinHandle<()>>,
	kick: Option<JoinHandle<()>>,
	resume: Option<JoinHandle<()>>,
	listeners: Vec<JoinHandle<()>>,
}

fn is_live(handle: &Option<JoinHandle<()>>) -> bool {
	handle.as_ref().is_some_and(|h| !h.is_finished())
}

fn abort(handle: &mut Option<JoinHandle<()>>) {
	if let Some(h) = handle.take() {
		h.abort();
	}
}

struct Inner {
	queue: Arc<OperationQueue>,
	transport: Arc<dyn NetworkTransport>,
	resolver: ConflictResolver,
	clock: Arc<dyn Clock>,
	policy: Arc<dyn SchedulePolicy>,
	pool: Option<TaskPool>,
	network: NetworkStatus,
	activity: Option<ActivitySignal>,
	cache: Option<Arc<dyn ReadCache>>,
	telemetry: Option<Arc<dyn TelemetrySink>>,
	event_source: Option<Arc<dyn EventSource>>,
	config: SyncConfig,
	events: broadcast::Sender<SyncEvent>,
	in_progress: AtomicBool,
	error_paused: AtomicBool,
	started: AtomicBool,
	shut_down: AtomicBool,
	resume_attempt: AtomicU32,
	last_sync_ms: AtomicI64,
	counters: SyncCounters,
	tasks: Mutex<Tasks>,
}

/// Drives delivery of queued operations to the remote store.
///
/// Passes are single-flight. A periodic timer (paced by the schedule
/// policy) and out-of-band kicks both start passes as detached tasks, so
/// pausing never interrupts a pass already running. Cloning yields another
/// handle to the same orchestrator.
#[derive(Clone)]
pub struct SyncOrchestrator {
	inner: Arc<Inner>,
}

impl SyncOrchestrator {
	pub fn builder(queue: Arc<OperationQueue>, transport: Arc<dyn NetworkTransport>) -> SyncOrchestratorBuilder {
		SyncOrchestratorBuilder::new(queue, transport)
	}

	pub fn queue(&self) -> &Arc<OperationQueue> {
		&self.inner.queue
	}

	pub fn config(&self) -> &SyncConfig {
		&self.inner.config
	}

	pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
		self.inner.events.subscribe()
	}

	/// Run startup maintenance, attach listeners, and start syncing.
	pub async fn start(&self) {
		let inner = &self.inner;
		if !inner.started.swap(true, Ordering::AcqRel) {
			let removed = inner.run_maintenance().await;
			if removed > 0 {
				inner.emit_queue_size().await;
			}
			inner.spawn_listeners();
		}
		inner.start_sync();
	}

	/// Start the periodic timer if it is not running and schedule a pass
	/// shortly after.
	pub fn start_sync(&self) {
		self.inner.start_sync();
	}

	/// Stop scheduling passes. A pass already running completes.
	pub fn pause_sync(&self) {
		let mut tasks = lock(&self.inner.tasks);
		abort(&mut tasks.periodic);
		abort(&mut tasks.kick);
		abort(&mut tasks.resume);
		self.inner.error_paused.store(false, Ordering::Release);
		info!("Sync paused");
	}

	/// Enqueue an operation and, when the policy favours it, schedule a
	/// pass shortly after. Returns the operation id.
	pub async fn queue_operation(&self, operation: NewOperation) -> String {
		self.inner.queue_operation(operation).await
	}

	/// Run one pass now.
	pub async fn process_queue(&self) -> PassOutcome {
		self.inner.process_queue().await
	}

	/// Clear the read cache and run a pass now.
	pub async fn force_sync_all(&self) -> Result<PassOutcome, SyncError> {
		if !self.inner.network.is_online() {
			return Err(SyncError::Offline);
		}
		if let Some(cache) = &self.inner.cache {
			cache.clear();
		}
		Ok(self.inner.process_queue().await)
	}

	/// Apply a remote change: invalidate cached reads and drop queued
	/// operations the change supersedes. Returns how many were dropped.
	pub async fn handle_change(&self, change: &ChangeNotification) -> usize {
		self.inner.handle_change(change).await
	}

	/// Forward changes from `source` to [`Self::handle_change`] until
	/// shutdown. Ignored when realtime is disabled.
	pub fn attach_event_source(&self, source: &dyn EventSource) {
		self.inner.attach_event_source(source);
	}

	pub async fn clear_queue(&self) -> usize {
		let removed = self.inner.queue.clear().await;
		self.inner.emit(SyncEvent::QueueUpdated { queue_size: 0 });
		removed
	}

	pub fn status(&self) -> SyncStatus {
		self.inner.status()
	}

	pub fn counters(&self) -> &SyncCounters {
		&self.inner.counters
	}

	pub async fn stats(&self) -> SyncStats {
		let inner = &self.inner;
		let queue = inner.queue.get_stats().await;
		let last = inner.last_sync_ms.load(Ordering::Acquire);
		let c = &inner.counters;
		SyncStats {
			queue_size: queue.total,
			queue,
			last_sync_ms: (last > 0).then_some(last),
			in_progress: inner.in_progress.load(Ordering::Acquire),
			status: inner.status(),
			interval_ms: inner.policy.interval().as_millis() as u64,
			batch_size: inner.policy.batch_size(),
			activity: inner.policy.activity(inner.clock.now_ms()),
			passes: c.passes.load(Ordering::Relaxed),
			succeeded: c.succeeded.load(Ordering::Relaxed),
			failed: c.failed.load(Ordering::Relaxed),
			dropped: c.dropped.load(Ordering::Relaxed),
			conflicts_resolved: c.conflicts_resolved.load(Ordering::Relaxed),
			pass_errors: c.pass_errors.load(Ordering::Relaxed),
		}
	}

	/// Abort every background task. A pass already running completes.
	pub fn shutdown(&self) {
		self.inner.shut_down.store(true, Ordering::Release);
		let mut tasks = lock(&self.inner.tasks);
		abort(&mut tasks.periodic);
		abort(&mut tasks.kick);
		abort(&mut tasks.resume);
		for handle in tasks.listeners.drain(..) {
			handle.abort();
		}
		info!("Sync orchestrator shut down");
	}
}

impl Inner {
	fn emit(&self, event: SyncEvent) {
		// No subscribers is fine.
		let _ = self.events.send(event);
	}

	async fn emit_queue_size(&self) {
		let queue_size = self.queue.len().await;
		self.emit(SyncEvent::QueueUpdated { queue_size });
	}

	fn status(&self) -> SyncStatus {
		if self.in_progress.load(Ordering::Acquire) {
			SyncStatus::Syncing
		} else if !self.network.is_online() {
			SyncStatus::Offline
		} else if is_live(&lock(&self.tasks).periodic) {
			SyncStatus::Idle
		} else {
			SyncStatus::Paused
		}
	}

	fn start_sync(self: &Arc<Self>) {
		if self.shut_down.load(Ordering::Acquire) {
			return;
		}
		if !self.network.is_online() {
			info!("Offline; sync starts when the network returns");
			return;
		}
		let mut tasks = lock(&self.tasks);
		abort(&mut tasks.resume);
		self.error_paused.store(false, Ordering::Release);
		if is_live(&tasks.periodic) {
			return;
		}
		tasks.periodic = Some(self.spawn_periodic());
		if !is_live(&tasks.kick) {
			tasks.kick = Some(self.spawn_kick(self.config.startup_delay()));
		}
		info!(
			"Sync started (interval {}ms)",
			self.policy.interval().as_millis()
		);
	}

	/// Stop timers after a network loss or a failed pass.
	fn suspend(&self) {
		let mut tasks = lock(&self.tasks);
		abort(&mut tasks.periodic);
		abort(&mut tasks.kick);
	}

	fn spawn_periodic(self: &Arc<Self>) -> JoinHandle<()> {
		let weak = Arc::downgrade(self);
		let clock = self.clock.clone();
		tokio::spawn(async move {
			loop {
				let Some(interval) = weak.upgrade().map(|inner| inner.policy.interval()) else {
					break;
				};
				clock.sleep(interval).await;
				let Some(inner) = weak.upgrade() else {
					break;
				};
				inner.spawn_pass();
			}
		})
	}

	fn spawn_kick(self: &Arc<Self>, delay: Duration) -> JoinHandle<()> {
		let weak = Arc::downgrade(self);
		let sleep = self.clock.sleep(delay);
		tokio::spawn(async move {
			sleep.await;
			if let Some(inner) = weak.upgrade() {
				inner.spawn_pass();
			}
		})
	}

	fn spawn_pass(self: &Arc<Self>) {
		let inner = self.clone();
		tokio::spawn(async move {
			inner.process_queue().await;
		});
	}

	fn schedule_kick(self: &Arc<Self>, delay: Duration) {
		let mut tasks = lock(&self.tasks);
		if !is_live(&tasks.kick) {
			tasks.kick = Some(self.spawn_kick(delay));
		}
	}

	/// Restart the periodic timer so a new interval applies immediately.
	fn restart_periodic(self: &Arc<Self>) {
		let mut tasks = lock(&self.tasks);
		if is_live(&tasks.periodic) {
			abort(&mut tasks.periodic);
			tasks.periodic = Some(self.spawn_periodic());
		}
	}

	fn schedule_resume(self: &Arc<Self>) {
		self.suspend();
		self.error_paused.store(true, Ordering::Release);
		let attempt = self.resume_attempt.fetch_add(1, Ordering::AcqRel) + 1;
		let delay = self.config.resume.delay(attempt);
		warn!(
			"Sync paused after a failed pass; resuming in {}ms (attempt {})",
			delay.as_millis(),
			attempt
		);

		let weak: Weak<Inner> = Arc::downgrade(self);
		let sleep = self.clock.sleep(delay);
		let handle = tokio::spawn(async move {
			sleep.await;
			if let Some(inner) = weak.upgrade() {
				if inner.error_paused.load(Ordering::Acquire) {
					info!("Resuming sync");
					inner.start_sync();
				}
			}
		});
		lock(&self.tasks).resume = Some(handle);
	}

	fn spawn_listeners(self: &Arc<Self>) {
		let mut handles = Vec::new();

		let mut network = self.network.watch();
		let weak = Arc::downgrade(self);
		handles.push(tokio::spawn(async move {
			while network.changed().await.is_ok() {
				let online = *network.borrow_and_update();
				let Some(inner) = weak.upgrade() else {
					break;
				};
				if online {
					info!("Network online; starting sync");
					inner.start_sync();
				} else {
					info!("Network offline; pausing sync");
					inner.suspend();
				}
			}
		}));

		if let Some(signal) = &self.activity {
			let mut rx = signal.subscribe();
			let weak = Arc::downgrade(self);
			handles.push(tokio::spawn(async move {
				loop {
					match rx.recv().await {
						Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
						Err(broadcast::error::RecvError::Closed) => break,
					}
					let Some(inner) = weak.upgrade() else {
						break;
					};
					inner.policy.record_activity(inner.clock.now_ms());
				}
			}));
		}

		let weak = Arc::downgrade(self);
		let clock = self.clock.clone();
		handles.push(tokio::spawn(async move {
			loop {
				clock.sleep(DECAY_TICK).await;
				let Some(inner) = weak.upgrade() else {
					break;
				};
				inner.policy.decay_activity(inner.clock.now_ms());
			}
		}));

		lock(&self.tasks).listeners.extend(handles);

		if let Some(source) = self.event_source.clone() {
			self.attach_event_source(source.as_ref());
		}
	}

	fn attach_event_source(self: &Arc<Self>, source: &dyn EventSource) {
		if !self.config.enable_realtime {
			debug!("Realtime invalidation disabled; event source ignored");
			return;
		}
		let mut rx = source.subscribe();
		let weak = Arc::downgrade(self);
		let handle = tokio::spawn(async move {
			loop {
				let received = rx.recv().await;
				let Some(inner) = weak.upgrade() else {
					break;
				};
				match received {
					Ok(change) => {
						inner.handle_change(&change).await;
					}
					Err(broadcast::error::RecvError::Lagged(missed)) => {
						warn!("Missed {} remote changes; clearing read cache", missed);
						if let Some(cache) = &inner.cache {
							cache.clear();
						}
					}
					Err(broadcast::error::RecvError::Closed) => break,
				}
			}
		});
		lock(&self.tasks).listeners.push(handle);
	}

	async fn handle_change(&self, change: &ChangeNotification) -> usize {
		if let Some(cache) = &self.cache {
			for key in change.cache_keys() {
				cache.invalidate(&key);
			}
		}
		let Some(record_id) = change.record_id() else {
			return 0;
		};
		let removed = self.queue.remove_by_resource_id(&record_id).await;
		if removed > 0 {
			info!(
				"Remote {:?} on {} {} superseded {} queued operations",
				change.event_type, change.resource_kind, record_id, removed
			);
			self.emit_queue_size().await;
		}
		removed
	}

	async fn queue_operation(self: &Arc<Self>, operation: NewOperation) -> String {
		let id = self.queue.enqueue(operation).await;
		let queue_size = self.queue.len().await;
		self.emit(SyncEvent::QueueUpdated { queue_size });

		let now = self.clock.now_ms();
		self.policy.record_activity(now);
		if !self.shut_down.load(Ordering::Acquire)
			&& !self.error_paused.load(Ordering::Acquire)
			&& !self.in_progress.load(Ordering::Acquire)
			&& self.network.is_online()
			&& self.policy.should_process_immediately(queue_size, now)
		{
			self.schedule_kick(self.config.immediate_delay());
		}
		id
	}

	/// Remove stale operations and operations matching known error
	/// patterns before the first pass.
	async fn run_maintenance(&self) -> usize {
		let stale = self.queue.cleanup().await;
		let now = self.clock.now_ms();
		let failing = self
			.queue
			.remove_where(|m| {
				(m.op_type == OperationType::Delete && m.retry_count > 1)
					|| (now - m.timestamp > 7 * DAY_MS && m.retry_count > 0)
			})
			.await;
		if stale + failing > 0 {
			info!(
				"Startup maintenance removed {} stale and {} repeatedly failing operations",
				stale, failing
			);
		}
		stale + failing
	}

	async fn process_queue(self: &Arc<Self>) -> PassOutcome {
		if !self.network.is_online() {
			debug!("Skipping sync pass while offline");
			return PassOutcome::Skipped(SkipReason::Offline);
		}
		let Some(_guard) = PassGuard::acquire(&self.in_progress) else {
			debug!("Sync pass already in progress");
			return PassOutcome::Skipped(SkipReason::InProgress);
		};

		let batch_size = self.policy.batch_size();
		let operations = self.queue.peek(batch_size).await;
		if operations.is_empty() {
			return PassOutcome::Empty;
		}

		let started = tokio::time::Instant::now();
		let wall_start = std::time::Instant::now();
		self.emit(SyncEvent::SyncStart);
		info!("Sync pass started with {} operations", operations.len());

		let results = self.dispatch(&operations).await;
		let pass_failed = is_pass_failure(&results);
		let first_error = results.iter().find_map(|r| r.error.clone());
		let mut report = self.apply_results(&operations, results).await;
		report.duration_ms = started.elapsed().as_millis() as u64;

		let c = &self.counters;
		c.passes.fetch_add(1, Ordering::Relaxed);
		c.succeeded.fetch_add(report.succeeded as u64, Ordering::Relaxed);
		c.failed.fetch_add(report.failed() as u64, Ordering::Relaxed);
		c.dropped.fetch_add(report.dropped as u64, Ordering::Relaxed);

		let queue_depth = self.queue.len().await;
		let now = self.clock.now_ms();
		if pass_failed {
			c.pass_errors.fetch_add(1, Ordering::Relaxed);
			let message = first_error.unwrap_or_else(|| "sync pass failed".to_string());
			error!("Sync pass failed: {}", message);
			self.emit(SyncEvent::SyncError { message });
			self.schedule_resume();
		} else {
			self.resume_attempt.store(0, Ordering::Release);
			self.last_sync_ms.store(now, Ordering::Release);
		}

		let observation = PassObservation {
			queue_depth,
			duration: started.elapsed(),
			processed: report.processed,
			succeeded: report.succeeded,
		};
		if self.policy.after_pass(&observation, now).is_some() && !pass_failed {
			self.restart_periodic();
		}
		self.record_telemetry(wall_start, &report, queue_depth, batch_size);

		info!(
			"Sync pass complete: {} processed, {} succeeded, {} retried, {} dropped, {} conflicts resolved in {}ms",
			report.processed,
			report.succeeded,
			report.retried,
			report.dropped,
			report.conflicts_resolved,
			report.duration_ms
		);
		self.emit(SyncEvent::SyncComplete(report.clone()));
		self.emit(SyncEvent::QueueUpdated { queue_size: queue_depth });
		PassOutcome::Completed(report)
	}

	/// Send a batch, split across the task pool when the policy allows.
	/// A sub-batch whose task fails is reported as failed per operation.
	async fn dispatch(&self, operations: &[QueuedOperation]) -> Vec<OperationResult> {
		let parts = self.policy.parallel_batches();
		let Some(pool) = self.pool.as_ref().filter(|_| parts > 1 && operations.len() > 1) else {
			return dispatch_batch(self.transport.as_ref(), operations).await;
		};

		let sub_batches = split_batch(operations.to_vec(), parts);
		debug!(
			"Dispatching {} operations in {} parallel sub-batches",
			operations.len(),
			sub_batches.len()
		);
		let jobs: Vec<_> = sub_batches
			.iter()
			.cloned()
			.map(|batch| {
				let transport = self.transport.clone();
				async move { dispatch_batch(transport.as_ref(), &batch).await }
			})
			.collect();

		pool.run_all(jobs)
			.await
			.into_iter()
			.zip(sub_batches)
			.flat_map(|(settled, batch)| match settled {
				Ok(results) => results,
				Err(e) => {
					warn!("Sub-batch of {} operations failed: {}", batch.len(), e);
					batch
						.iter()
						.map(|op| OperationResult::failed(&op.id, e.to_string(), None))
						.collect()
				}
			})
			.collect()
	}

	async fn apply_results(&self, operations: &[QueuedOperation], results: Vec<OperationResult>) -> PassReport {
		let by_id: HashMap<&str, &QueuedOperation> = operations.iter().map(|op| (op.id.as_str(), op)).collect();
		let mut report = PassReport {
			processed: operations.len(),
			..Default::default()
		};
		let mut succeeded: Vec<(String, i64)> = Vec::new();
		let mut rejected: Vec<(String, i64)> = Vec::new();

		for result in results {
			let Some(op) = by_id.get(result.operation_id.as_str()).copied() else {
				warn!("Ignoring result for unknown operation {}", result.operation_id);
				continue;
			};
			if result.success {
				succeeded.push((op.id.clone(), op.timestamp));
				continue;
			}
			if let Some(conflict) = result.conflicts {
				match self.resolve_conflict(op, conflict).await {
					ConflictOutcome::Resolved => report.conflicts_resolved += 1,
					ConflictOutcome::Dropped => report.dropped += 1,
					ConflictOutcome::Superseded => {}
				}
				continue;
			}

			let message = result.error.as_deref();
			match classify_failure(message, result.status_code) {
				FailureKind::Client => {
					warn!(
						"Dropping {} ({}): status {:?}, {}",
						op.describe(),
						FailureKind::Client.as_str(),
						result.status_code,
						message.unwrap_or("no error message")
					);
					rejected.push((op.id.clone(), op.timestamp));
					report.dropped += 1;
				}
				_ => {
					if self.schedule_retry(op, message).await {
						report.retried += 1;
					} else {
						report.exhausted += 1;
						report.dropped += 1;
					}
				}
			}
		}

		report.succeeded = succeeded.len();
		self.queue.remove_unchanged(&succeeded).await;
		self.queue.remove_unchanged(&rejected).await;
		report
	}

	/// Returns false when the retry budget is spent and the operation was
	/// dropped.
	async fn schedule_retry(&self, op: &QueuedOperation, message: Option<&str>) -> bool {
		let Some(mut current) = self.queue.get(&op.id).await else {
			return true;
		};
		if current.timestamp != op.timestamp {
			// Re-enqueued while in flight; the new payload gets a fresh try.
			return true;
		}

		current.retry_count += 1;
		if current.retry_count >= self.config.retry_attempts {
			warn!(
				"Dropping {} ({}) after {} attempts: {}",
				current.describe(),
				FailureKind::ExhaustedRetries.as_str(),
				current.retry_count,
				message.unwrap_or("no error message")
			);
			self.queue
				.remove_unchanged(&[(current.id.clone(), current.timestamp)])
				.await;
			return false;
		}

		let delay = self.config.backoff.delay(current.retry_count);
		current.next_retry_at = Some(self.clock.now_ms() + delay.as_millis() as i64);
		debug!(
			"Retrying {} in {}ms (attempt {})",
			current.describe(),
			delay.as_millis(),
			current.retry_count + 1
		);
		self.queue.update_unchanged(current).await;
		true
	}

	/// Re-queue the operation with the resolved payload, or drop it when
	/// the conflict cannot be resolved. An operation re-enqueued while its
	/// pass was in flight keeps the newer payload either way.
	async fn resolve_conflict(&self, op: &QueuedOperation, conflict: ConflictData) -> ConflictOutcome {
		let mut conflict = conflict;
		if conflict.client_version.is_null() {
			conflict.client_version = op.payload.clone().unwrap_or_default();
		}
		let conflict = conflict.with_detected_fields();
		info!("Conflict on {}: {}", op.describe(), conflict_summary(&conflict));

		let Some(resolution) = self.resolver.resolve(op, &conflict).await else {
			let removed = self
				.queue
				.remove_unchanged(&[(op.id.clone(), op.timestamp)])
				.await;
			if removed == 0 {
				debug!("Keeping {}: re-enqueued with unresolved conflict", op.describe());
				return ConflictOutcome::Superseded;
			}
			warn!("Dropping {}: conflict could not be resolved", op.describe());
			return ConflictOutcome::Dropped;
		};
		let Some(mut current) = self.queue.get(&op.id).await else {
			return ConflictOutcome::Dropped;
		};
		if current.timestamp != op.timestamp {
			debug!("Discarding resolution for {}: re-enqueued in flight", op.describe());
			return ConflictOutcome::Superseded;
		}

		current.payload = Some(resolution.data.clone());
		current.retry_count = 0;
		current.next_retry_at = None;
		if !self.queue.update_unchanged(current).await {
			debug!("Discarding resolution for {}: re-enqueued in flight", op.describe());
			return ConflictOutcome::Superseded;
		}
		self.counters
			.conflicts_resolved
			.fetch_add(1, Ordering::Relaxed);
		self.emit(SyncEvent::ConflictDetected {
			operation_id: op.id.clone(),
			resolution,
		});
		ConflictOutcome::Resolved
	}

	fn record_telemetry(&self, started: std::time::Instant, report: &PassReport, queue_depth: usize, batch_size: usize) {
		let Some(sink) = &self.telemetry else {
			return;
		};
		sink.record_timing("sync_pass", started);
		sink.record_metric(
			Metric::new("queue_depth", queue_depth as f64, MetricCategory::Queue, "operations")
				.with_thresholds(100.0, 1_000.0),
		);
		let failure_ratio = if report.processed == 0 {
			0.0
		} else {
			report.failed() as f64 / report.processed as f64
		};
		sink.record_metric(
			Metric::new("sync_failure_ratio", failure_ratio, MetricCategory::Sync, "ratio").with_thresholds(0.2, 0.5),
		);
		sink.record_metric(Metric::new(
			"sync_batch_size",
			batch_size as f64,
			MetricCategory::Sync,
			"operations",
		));
	}
}

enum ConflictOutcome {
	Resolved,
	Dropped,
	/// Re-enqueued during the pass; the newer payload stays queued as is.
	Superseded,
}

/// A pass failed as a whole when nothing got through and every failure
/// was a connectivity error (no status, no conflicts).
fn is_pass_failure(results: &[OperationResult]) -> bool {
	!results.is_empty()
		&& results
			.iter()
			.all(|r| !r.success && r.status_code.is_none() && r.conflicts.is_none())
}

/// Group operations by `(type, resource)` in first-seen order and send each
/// group through the batch endpoint when supported, one by one otherwise.
/// Returns one result per operation.
async fn dispatch_batch(transport: &dyn NetworkTransport, operations: &[QueuedOperation]) -> Vec<OperationResult> {
	let mut groups: Vec<((OperationType, ResourceKind), Vec<&QueuedOperation>)> = Vec::new();
	for op in operations {
		let key = (op.op_type, op.resource);
		match groups.iter_mut().find(|(k, _)| *k == key) {
			Some((_, group)) => group.push(op),
			None => groups.push((key, vec![op])),
		}
	}

	let mut results = Vec::with_capacity(operations.len());
	for ((op_type, resource), group) in groups {
		if !transport.supports_batch(op_type, resource) {
			for op in group {
				results.push(send_single(transport, op).await);
			}
			continue;
		}

		let wire: Vec<WireOperation> = group
			.iter()
			.map(|op| {
				let mut wire = WireOperation::from(*op);
				wire.data = wire.data.as_ref().map(normalize_payload);
				wire
			})
			.collect();
		match transport.send_batch(resource, &wire).await {
			Ok(batch_results) => {
				let mut by_id: HashMap<String, OperationResult> = batch_results
					.into_iter()
					.map(|r| (r.operation_id.clone(), r))
					.collect();
				for op in group {
					results.push(by_id.remove(&op.id).unwrap_or_else(|| {
						OperationResult::failed(&op.id, "missing from batch response", None)
					}));
				}
			}
			Err(e) => {
				warn!("Batch {} {} request failed: {}", op_type, resource.plural(), e);
				let status = e.status_code();
				let message = e.to_string();
				for op in group {
					results.push(OperationResult::failed(&op.id, message.clone(), status));
				}
			}
		}
	}
	results
}

async fn send_single(transport: &dyn NetworkTransport, op: &QueuedOperation) -> OperationResult {
	let mut op = op.clone();
	op.payload = op.payload.as_ref().map(normalize_payload);
	match transport.send_one(&op).await {
		Ok(_) => OperationResult::ok(&op.id),
		Err(e) => {
			debug!("{} failed: {}", op.describe(), e);
			OperationResult::from_error(&op.id, e)
		}
	}
}

/// Builder for [`SyncOrchestrator`].
pub struct SyncOrchestratorBuilder {
	queue: Arc<OperationQueue>,
	transport: Arc<dyn NetworkTransport>,
	config: SyncConfig,
	resolver: Option<ConflictResolver>,
	clock: Option<Arc<dyn Clock>>,
	policy: Option<Arc<dyn SchedulePolicy>>,
	adaptive: Option<AdaptiveConfig>,
	pool: Option<TaskPool>,
	network: Option<NetworkStatus>,
	activity: Option<ActivitySignal>,
	cache: Option<Arc<dyn ReadCache>>,
	telemetry: Option<Arc<dyn TelemetrySink>>,
	event_source: Option<Arc<dyn EventSource>>,
}

impl SyncOrchestratorBuilder {
	pub fn new(queue: Arc<OperationQueue>, transport: Arc<dyn NetworkTransport>) -> Self {
		Self {
			queue,
			transport,
			config: SyncConfig::default(),
			resolver: None,
			clock: None,
			policy: None,
			adaptive: None,
			pool: None,
			network: None,
			activity: None,
			cache: None,
			telemetry: None,
			event_source: None,
		}
	}

	pub fn with_config(mut self, config: SyncConfig) -> Self {
		self.config = config;
		self
	}

	/// Defaults to a resolver with no rules.
	pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
		self.resolver = Some(resolver);
		self
	}

	pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = Some(clock);
		self
	}

	/// Overrides any policy chosen by [`Self::adaptive`].
	pub fn with_policy(mut self, policy: Arc<dyn SchedulePolicy>) -> Self {
		self.policy = Some(policy);
		self
	}

	/// Use the adaptive scheduler, with a task pool for parallel
	/// sub-batches when enabled.
	pub fn adaptive(mut self, config: AdaptiveConfig) -> Self {
		self.adaptive = Some(config);
		self
	}

	pub fn with_pool(mut self, pool: TaskPool) -> Self {
		self.pool = Some(pool);
		self
	}

	/// Defaults to always online.
	pub fn with_network(mut self, network: NetworkStatus) -> Self {
		self.network = Some(network);
		self
	}

	pub fn with_activity_signal(mut self, signal: ActivitySignal) -> Self {
		self.activity = Some(signal);
		self
	}

	pub fn with_cache(mut self, cache: Arc<dyn ReadCache>) -> Self {
		self.cache = Some(cache);
		self
	}

	pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
		self.telemetry = Some(sink);
		self
	}

	/// Subscribed when the orchestrator starts.
	pub fn with_event_source(mut self, source: Arc<dyn EventSource>) -> Self {
		self.event_source = Some(source);
		self
	}

	pub fn build(self) -> Result<SyncOrchestrator, SyncError> {
		let config = self.config;
		let resolver = match self.resolver {
			Some(resolver) => resolver,
			None => ConflictResolver::builder()
				.with_default_strategy(config.default_strategy)
				.build()?,
		};

		let mut pool = self.pool;
		let adaptive = self.adaptive.filter(|a| a.enabled);
		let policy: Arc<dyn SchedulePolicy> = match (self.policy, adaptive) {
			(Some(policy), _) => policy,
			(None, Some(adaptive)) => {
				if adaptive.parallel_processing && pool.is_none() {
					pool = Some(TaskPool::new(adaptive.max_parallel_batches));
				}
				Arc::new(AdaptivePolicy::new(adaptive, config.interval(), config.batch_size))
			}
			(None, None) => Arc::new(FixedPolicy::new(config.interval(), config.batch_size)),
		};

		let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
		Ok(SyncOrchestrator {
			inner: Arc::new(Inner {
				queue: self.queue,
				transport: self.transport,
				resolver,
				clock: self.clock.unwrap_or_else(|| Arc::new(TokioClock::new())),
				policy,
				pool,
				network: self.network.unwrap_or_else(|| NetworkStatus::fixed(true)),
				activity: self.activity,
				cache: self.cache,
				telemetry: self.telemetry,
				event_source: self.event_source,
				config,
				events,
				in_progress: AtomicBool::new(false),
				error_paused: AtomicBool::new(false),
				started: AtomicBool::new(false),
				shut_down: AtomicBool::new(false),
				resume_attempt: AtomicU32::new(0),
				last_sync_ms: AtomicI64::new(0),
				counters: SyncCounters::default(),
				tasks: Mutex::new(Tasks::default()),
			}),
		})
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn test_pass_failure_requires_only_connectivity_errors() {
		let offline = vec![
			OperationResult::failed("a", "connection refused", None),
			OperationResult::failed("b", "timed out", None),
		];
		assert!(is_pass_failure(&offline));

		let mixed = vec![
			OperationResult::failed("a", "connection refused", None),
			OperationResult::failed("b", "server error", Some(500)),
		];
		assert!(!is_pass_failure(&mixed));

		let conflict = vec![OperationResult::conflict("a", ConflictData::new(json!({}), json!({})))];
		assert!(!is_pass_failure(&conflict));
		assert!(!is_pass_failure(&[]));
	}

	#[test]
	fn test_config_defaults() {
		let config: SyncConfig = serde_json::from_value(json!({"interval_ms": 1000})).unwrap();
		assert_eq!(config.interval(), Duration::from_secs(1));
		assert_eq!(config.retry_attempts, 3);
		assert_eq!(config.batch_size, 10);
		assert_eq!(config.default_strategy, ConflictStrategy::Merge);
		assert_eq!(config.resume, BackoffConfig::resume());
		assert_eq!(config.backoff, BackoffConfig::retry());
	}

	#[test]
	fn test_event_wire_shape() {
		let event = serde_json::to_value(SyncEvent::QueueUpdated { queue_size: 4 }).unwrap();
		assert_eq!(event, json!({"type": "queue_updated", "queue_size": 4}));
		let start = serde_json::to_value(SyncEvent::SyncStart).unwrap();
		assert_eq!(start, json!({"type": "sync_start"}));
	}
}
