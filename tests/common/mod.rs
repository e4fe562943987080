//! Shared fixtures for the integration tests: a scripted transport, a
//! recording read cache, and queues over an in-memory store.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use itinerary_sync::sync::{
	ManualClock, MemoryStore, NetworkTransport, OperationQueue, OperationResult, OperationType, QueueConfig,
	QueuedOperation, ReadCache, ResourceKind, SyncConfig, TransportError, WireOperation,
};

/// 2023-11-14T22:13:20Z, a fixed starting point for manual clocks.
pub const T0: i64 = 1_700_000_000_000;

/// Decides the outcome for one operation, given its id and resource id.
pub type Responder = dyn Fn(&str, Option<&str>) -> Result<Option<Value>, TransportError> + Send + Sync;

/// Transport whose answers come from a closure and which records every
/// operation it was handed.
pub struct MockTransport {
	responder: Box<Responder>,
	batch_resources: HashSet<ResourceKind>,
	delay: Option<Duration>,
	/// Operation ids in the order they were sent, batched or not.
	pub sent: Mutex<Vec<String>>,
	/// Payloads as they reached the transport.
	pub payloads: Mutex<Vec<Value>>,
	/// One entry per `send_batch` call.
	pub batches: Mutex<Vec<(ResourceKind, Vec<String>)>>,
	in_flight: AtomicUsize,
	pub max_in_flight: AtomicUsize,
}

impl MockTransport {
	pub fn new<F>(responder: F) -> Self
	where
		F: Fn(&str, Option<&str>) -> Result<Option<Value>, TransportError> + Send + Sync + 'static,
	{
		Self {
			responder: Box::new(responder),
			batch_resources: HashSet::new(),
			delay: None,
			sent: Mutex::new(Vec::new()),
			payloads: Mutex::new(Vec::new()),
			batches: Mutex::new(Vec::new()),
			in_flight: AtomicUsize::new(0),
			max_in_flight: AtomicUsize::new(0),
		}
	}

	/// Accepts everything.
	pub fn ok() -> Self {
		Self::new(|_, _| Ok(None))
	}

	/// Fails everything with `status`.
	pub fn status(status: u16) -> Self {
		Self::new(move |_, _| {
			Err(TransportError::Status {
				status,
				body: format!("status {}", status),
			})
		})
	}

	/// Fails everything as unreachable.
	pub fn unreachable() -> Self {
		Self::new(|_, _| Err(TransportError::Network("connection refused".to_string())))
	}

	pub fn with_batch(mut self, resources: impl IntoIterator<Item = ResourceKind>) -> Self {
		self.batch_resources.extend(resources);
		self
	}

	pub fn with_delay(mut self, delay: Duration) -> Self {
		self.delay = Some(delay);
		self
	}

	pub fn sent(&self) -> Vec<String> {
		self.sent.lock().unwrap().clone()
	}

	pub fn sent_count(&self) -> usize {
		self.sent.lock().unwrap().len()
	}

	async fn enter(&self) {
		let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
		self.max_in_flight.fetch_max(now, Ordering::SeqCst);
		if let Some(delay) = self.delay {
			tokio::time::sleep(delay).await;
		}
	}

	fn leave(&self) {
		self.in_flight.fetch_sub(1, Ordering::SeqCst);
	}
}

#[async_trait]
impl NetworkTransport for MockTransport {
	fn supports_batch(&self, _op_type: OperationType, resource: ResourceKind) -> bool {
		self.batch_resources.contains(&resource)
	}

	async fn send_batch(
		&self,
		resource: ResourceKind,
		operations: &[WireOperation],
	) -> Result<Vec<OperationResult>, TransportError> {
		self.enter().await;
		let ids: Vec<String> = operations.iter().map(|op| op.id.clone()).collect();
		self.batches.lock().unwrap().push((resource, ids.clone()));
		self.sent.lock().unwrap().extend(ids);
		self.payloads
			.lock()
			.unwrap()
			.extend(operations.iter().filter_map(|op| op.data.clone()));

		let results = operations
			.iter()
			.map(|op| match (self.responder)(&op.id, op.resource_id.as_deref()) {
				Ok(_) => OperationResult::ok(&op.id),
				Err(e) => OperationResult::from_error(&op.id, e),
			})
			.collect();
		self.leave();
		Ok(results)
	}

	async fn send_one(&self, operation: &QueuedOperation) -> Result<Option<Value>, TransportError> {
		self.enter().await;
		self.sent.lock().unwrap().push(operation.id.clone());
		if let Some(payload) = &operation.payload {
			self.payloads.lock().unwrap().push(payload.clone());
		}
		let result = (self.responder)(&operation.id, operation.resource_id.as_deref());
		self.leave();
		result
	}
}

/// Read cache that remembers what it was told.
#[derive(Default)]
pub struct RecordingCache {
	pub invalidated: Mutex<Vec<String>>,
	pub cleared: AtomicUsize,
}

impl RecordingCache {
	pub fn invalidated(&self) -> Vec<String> {
		self.invalidated.lock().unwrap().clone()
	}
}

impl ReadCache for RecordingCache {
	fn invalidate(&self, key: &str) {
		self.invalidated.lock().unwrap().push(key.to_string());
	}

	fn clear(&self) {
		self.cleared.fetch_add(1, Ordering::SeqCst);
	}
}

pub async fn open_queue(store: Arc<MemoryStore>, config: QueueConfig, clock: Arc<ManualClock>) -> Arc<OperationQueue> {
	Arc::new(
		OperationQueue::open(store, "sync_queue", config, clock)
			.await
			.with_actor_id("tester"),
	)
}

/// Empty queue over a fresh in-memory store with default limits.
pub async fn memory_queue(clock: Arc<ManualClock>) -> (Arc<MemoryStore>, Arc<OperationQueue>) {
	let store = Arc::new(MemoryStore::new());
	let queue = open_queue(store.clone(), QueueConfig::default(), clock).await;
	(store, queue)
}

/// Orchestrator settings whose timers stay out of the way of tests that
/// drive passes by hand.
pub fn manual_config() -> SyncConfig {
	SyncConfig {
		interval_ms: 3_600_000,
		startup_delay_ms: 3_600_000,
		immediate_delay_ms: 3_600_000,
		..SyncConfig::default()
	}
}
