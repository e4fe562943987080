mod common;

use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

use async_trait::async_trait;
use common::{MockTransport, RecordingCache, T0, manual_config, memory_queue};
use itinerary_sync::sync::{
	AdaptiveConfig, ChangeEvent, ChangeNotification, ChannelEventSource, Clock, ConflictData, ConflictPrompt,
	ConflictResolver, ConflictRule, ConflictStrategy, ManualClock, MemoryStore, QueuedOperation, ResolvedConflict, NetworkMonitor, NewOperation, OperationQueue, PassOutcome, PassReport, QueueConfig, ResourceKind,
	SkipReason, SyncConfig, SyncError, SyncEvent, SyncOrchestrator, SyncOrchestratorBuilder, SyncStatus, TokioClock,
	TransportError,
};

async fn setup(transport: Arc<MockTransport>) -> (Arc<ManualClock>, Arc<OperationQueue>, SyncOrchestratorBuilder) {
	let clock = ManualClock::new(T0);
	let (_store, queue) = memory_queue(clock.clone()).await;
	let builder = SyncOrchestrator::builder(queue.clone(), transport)
		.with_config(manual_config())
		.with_clock(clock.clone());
	(clock, queue, builder)
}

fn completed(outcome: PassOutcome) -> PassReport {
	match outcome {
		PassOutcome::Completed(report) => report,
		other => panic!("expected a completed pass, got {:?}", other),
	}
}

fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
	let mut events = Vec::new();
	while let Ok(event) = rx.try_recv() {
		events.push(event);
	}
	events
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_pass_delivers_and_removes() {
	let transport = Arc::new(MockTransport::ok());
	let (clock, queue, builder) = setup(transport.clone()).await;
	let sync = builder.build().unwrap();
	let mut events = sync.subscribe();

	for id in ["T1", "T2", "T3"] {
		clock.advance(Duration::from_millis(1));
		queue
			.enqueue(NewOperation::update(ResourceKind::Trip, id, json!({ "title": id })))
			.await;
	}

	let report = completed(sync.process_queue().await);
	assert_eq!(report.processed, 3);
	assert_eq!(report.succeeded, 3);
	assert_eq!(report.failed(), 0);
	assert!(queue.is_empty().await);
	assert_eq!(transport.sent_count(), 3);
	assert_eq!(sync.process_queue().await, PassOutcome::Empty);

	let events = drain(&mut events);
	assert_eq!(events.first(), Some(&SyncEvent::SyncStart));
	assert!(matches!(events.get(1), Some(SyncEvent::SyncComplete(r)) if r.succeeded == 3));
	assert_eq!(events.get(2), Some(&SyncEvent::QueueUpdated { queue_size: 0 }));

	let stats = sync.stats().await;
	assert_eq!(stats.passes, 1);
	assert_eq!(stats.succeeded, 3);
	assert_eq!(stats.last_sync_ms, Some(clock.now_ms()));
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_passes_are_single_flight() {
	let transport = Arc::new(MockTransport::ok().with_delay(Duration::from_millis(200)));
	let (_clock, queue, builder) = setup(transport.clone()).await;
	let sync = builder.build().unwrap();
	queue
		.enqueue(NewOperation::delete(ResourceKind::Document, "D1"))
		.await;

	let second = async {
		tokio::time::sleep(Duration::from_millis(50)).await;
		let status = sync.status();
		(status, sync.process_queue().await)
	};
	let (first, (status, second)) = tokio::join!(sync.process_queue(), second);

	assert_eq!(completed(first).succeeded, 1);
	assert_eq!(status, SyncStatus::Syncing);
	assert_eq!(second, PassOutcome::Skipped(SkipReason::InProgress));
	assert_eq!(transport.sent_count(), 1);
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_client_errors_are_dropped_after_one_attempt() {
	let transport = Arc::new(MockTransport::status(404));
	let (_clock, queue, builder) = setup(transport.clone()).await;
	let sync = builder.build().unwrap();
	queue
		.enqueue(NewOperation::update(ResourceKind::Participant, "P1", json!({ "name": "Ana" })))
		.await;

	let report = completed(sync.process_queue().await);
	assert_eq!(report.dropped, 1);
	assert_eq!(report.retried, 0);
	assert!(queue.is_empty().await);
	assert_eq!(transport.sent_count(), 1);
	assert_eq!(sync.status(), SyncStatus::Paused);
	assert_eq!(sync.counters().pass_errors.load(Ordering::Relaxed), 0);
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_server_errors_retry_until_budget_spent() {
	let transport = Arc::new(MockTransport::status(503));
	let (clock, queue, builder) = setup(transport.clone()).await;
	let sync = builder.build().unwrap();
	let id = queue
		.enqueue(NewOperation::patch(ResourceKind::Expense, "E1", json!({ "amount": 20 })))
		.await;

	let report = completed(sync.process_queue().await);
	assert_eq!(report.retried, 1);
	let op = queue.get(&id).await.unwrap();
	assert_eq!(op.retry_count, 1);
	let retry_at = op.next_retry_at.unwrap();
	assert!(retry_at >= T0 + 5_000 && retry_at <= T0 + 6_250, "retry at {}", retry_at);

	// Backing off: nothing is ready yet.
	assert_eq!(sync.process_queue().await, PassOutcome::Empty);

	clock.advance(Duration::from_secs(600));
	completed(sync.process_queue().await);
	assert_eq!(queue.get(&id).await.unwrap().retry_count, 2);

	clock.advance(Duration::from_secs(600));
	let report = completed(sync.process_queue().await);
	assert_eq!(report.exhausted, 1);
	assert_eq!(report.dropped, 1);
	assert!(queue.is_empty().await);
	assert_eq!(transport.sent_count(), 3);
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_conflict_is_resolved_and_requeued() {
	let attempts = Arc::new(AtomicUsize::new(0));
	let seen = attempts.clone();
	let transport = Arc::new(MockTransport::new(move |_, _| {
		if seen.fetch_add(1, Ordering::SeqCst) == 0 {
			Err(TransportError::Conflict {
				conflicts: ConflictData {
					client_version: Value::Null,
					server_version: json!({ "title": "Lisbon", "budget": 900 }),
					conflicting_fields: Vec::new(),
				},
			})
		} else {
			Ok(None)
		}
	}));
	let (_clock, queue, builder) = setup(transport.clone()).await;
	let sync = builder.build().unwrap();
	let mut events = sync.subscribe();
	let id = queue
		.enqueue(NewOperation::update(ResourceKind::Trip, "T1", json!({ "title": "Lisbon 2024", "budget": 0 })))
		.await;

	let report = completed(sync.process_queue().await);
	assert_eq!(report.conflicts_resolved, 1);
	assert_eq!(report.dropped, 0);

	let merged = json!({ "title": "Lisbon 2024", "budget": 900 });
	let op = queue.get(&id).await.unwrap();
	assert_eq!(op.payload, Some(merged.clone()));
	assert_eq!(op.retry_count, 0);

	let conflict = drain(&mut events).into_iter().find_map(|event| match event {
		SyncEvent::ConflictDetected {
			operation_id,
			resolution,
		} => Some((operation_id, resolution)),
		_ => None,
	});
	let (operation_id, resolution) = conflict.expect("conflict event");
	assert_eq!(operation_id, id);
	assert_eq!(resolution.strategy, ConflictStrategy::Merge);

	completed(sync.process_queue().await);
	assert!(queue.is_empty().await);
	assert_eq!(transport.payloads.lock().unwrap().last(), Some(&merged));
	assert_eq!(sync.stats().await.conflicts_resolved, 1);
}

/// Every send comes back as a 409 against the given server copy.
fn conflicting(server: Value) -> MockTransport {
	MockTransport::new(move |_, _| {
		Err(TransportError::Conflict {
			conflicts: ConflictData {
				client_version: Value::Null,
				server_version: server.clone(),
				conflicting_fields: Vec::new(),
			},
		})
	})
	.with_delay(Duration::from_millis(200))
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_conflict_keeps_edit_made_during_pass() {
	let transport = Arc::new(conflicting(json!({ "title": "Server" })));
	let (clock, queue, builder) = setup(transport.clone()).await;
	let sync = builder.build().unwrap();
	let mut events = sync.subscribe();
	let id = queue
		.enqueue(NewOperation::update(ResourceKind::Trip, "T1", json!({ "title": "Stale" })))
		.await;

	let edit = async {
		tokio::time::sleep(Duration::from_millis(50)).await;
		clock.advance(Duration::from_millis(10));
		queue
			.enqueue(NewOperation::update(ResourceKind::Trip, "T1", json!({ "title": "Newest" })))
			.await
	};
	let (outcome, edited) = tokio::join!(sync.process_queue(), edit);
	assert_eq!(edited, id);

	let report = completed(outcome);
	assert_eq!(report.conflicts_resolved, 0);
	assert_eq!(report.dropped, 0);
	let op = queue.get(&id).await.unwrap();
	assert_eq!(op.payload, Some(json!({ "title": "Newest" })));
	assert_eq!(op.timestamp, T0 + 10);
	assert!(
		!drain(&mut events)
			.iter()
			.any(|e| matches!(e, SyncEvent::ConflictDetected { .. }))
	);
}

/// Never settles anything.
struct DismissedPrompt;

#[async_trait]
impl ConflictPrompt for DismissedPrompt {
	async fn resolve(&self, _conflict: &ConflictData, _operation: &QueuedOperation) -> anyhow::Result<ResolvedConflict> {
		anyhow::bail!("dialog dismissed")
	}
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_unresolvable_conflict_drops_only_the_sent_payload() {
	let transport = Arc::new(conflicting(json!({ "title": "Server" })));
	let (clock, queue, builder) = setup(transport.clone()).await;
	let resolver = ConflictResolver::builder()
		.add_rule(ConflictRule::new(ResourceKind::Trip, "title", ConflictStrategy::PromptUser))
		.with_prompt(Arc::new(DismissedPrompt))
		.build()
		.unwrap();
	let sync = builder.with_resolver(resolver).build().unwrap();

	queue
		.enqueue(NewOperation::update(ResourceKind::Trip, "T1", json!({ "title": "Mine" })))
		.await;
	let report = completed(sync.process_queue().await);
	assert_eq!(report.dropped, 1);
	assert!(queue.is_empty().await);

	clock.advance(Duration::from_secs(1));
	let id = queue
		.enqueue(NewOperation::update(ResourceKind::Trip, "T1", json!({ "title": "Stale" })))
		.await;
	let edit = async {
		tokio::time::sleep(Duration::from_millis(50)).await;
		clock.advance(Duration::from_millis(10));
		queue
			.enqueue(NewOperation::update(ResourceKind::Trip, "T1", json!({ "title": "Newest" })))
			.await
	};
	let (outcome, _) = tokio::join!(sync.process_queue(), edit);

	let report = completed(outcome);
	assert_eq!(report.dropped, 0);
	assert_eq!(queue.len().await, 1);
	assert_eq!(
		queue.get(&id).await.and_then(|op| op.payload),
		Some(json!({ "title": "Newest" }))
	);
	assert_eq!(transport.sent_count(), 2);
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_unreachable_remote_pauses_sync() {
	let transport = Arc::new(MockTransport::unreachable());
	let (_clock, queue, builder) = setup(transport.clone()).await;
	let sync = builder.build().unwrap();
	let mut events = sync.subscribe();
	let id = queue
		.enqueue(NewOperation::create(ResourceKind::Activity, json!({ "name": "Kayak" })))
		.await;

	let report = completed(sync.process_queue().await);
	assert_eq!(report.retried, 1);
	assert_eq!(sync.counters().pass_errors.load(Ordering::Relaxed), 1);
	assert_eq!(sync.status(), SyncStatus::Paused);
	assert_eq!(queue.get(&id).await.unwrap().retry_count, 1);
	assert!(
		drain(&mut events)
			.iter()
			.any(|e| matches!(e, SyncEvent::SyncError { message } if message.contains("connection refused")))
	);
	sync.shutdown();
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_offline_skips_and_force_sync_fails() {
	let transport = Arc::new(MockTransport::ok());
	let network = NetworkMonitor::new(false);
	let cache = Arc::new(RecordingCache::default());
	let (_clock, queue, builder) = setup(transport.clone()).await;
	let sync = builder
		.with_network(network.status())
		.with_cache(cache.clone())
		.build()
		.unwrap();
	queue
		.enqueue(NewOperation::delete(ResourceKind::Trip, "T9"))
		.await;

	assert_eq!(sync.status(), SyncStatus::Offline);
	assert_eq!(sync.process_queue().await, PassOutcome::Skipped(SkipReason::Offline));
	assert!(matches!(sync.force_sync_all().await, Err(SyncError::Offline)));
	assert_eq!(transport.sent_count(), 0);

	network.set_online(true);
	let report = completed(sync.force_sync_all().await.unwrap());
	assert_eq!(report.succeeded, 1);
	assert_eq!(cache.cleared.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_remote_change_supersedes_queued_operations() {
	let transport = Arc::new(MockTransport::ok());
	let cache = Arc::new(RecordingCache::default());
	let (clock, queue, builder) = setup(transport).await;
	let sync = builder.with_cache(cache.clone()).build().unwrap();

	queue
		.enqueue(NewOperation::update(ResourceKind::Trip, "T1", json!({ "title": "Old" })))
		.await;
	clock.advance(Duration::from_millis(1));
	queue
		.enqueue(NewOperation::patch(ResourceKind::Trip, "T1", json!({ "status": "draft" })))
		.await;
	clock.advance(Duration::from_millis(1));
	queue
		.enqueue(NewOperation::update(ResourceKind::Trip, "T2", json!({ "title": "Keep" })))
		.await;

	let change = ChangeNotification::new("trips", ChangeEvent::Update).with_new(json!({ "id": "T1", "title": "New" }));
	assert_eq!(sync.handle_change(&change).await, 2);
	assert_eq!(queue.len().await, 1);
	assert_eq!(cache.invalidated(), vec!["all-trips", "trip-T1"]);

	// Pushed through an event source.
	let source = ChannelEventSource::default();
	sync.attach_event_source(&source);
	let deleted = ChangeNotification::new("trips", ChangeEvent::Delete).with_old(json!({ "id": "T2" }));
	assert_eq!(source.publish(deleted), 1);
	for _ in 0..50 {
		if queue.is_empty().await {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert!(queue.is_empty().await);
	sync.shutdown();
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_realtime_disabled_ignores_event_source() {
	let transport = Arc::new(MockTransport::ok());
	let (_clock, queue, builder) = setup(transport).await;
	let sync = builder
		.with_config(SyncConfig {
			enable_realtime: false,
			..manual_config()
		})
		.build()
		.unwrap();
	queue
		.enqueue(NewOperation::delete(ResourceKind::Trip, "T1"))
		.await;

	let source = ChannelEventSource::default();
	sync.attach_event_source(&source);
	let change = ChangeNotification::new("trips", ChangeEvent::Delete).with_old(json!({ "id": "T1" }));
	assert_eq!(source.publish(change), 0);
	assert_eq!(queue.len().await, 1);
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_batch_endpoint_groups_by_type_and_resource() {
	let transport = Arc::new(MockTransport::ok().with_batch([ResourceKind::Trip]));
	let (clock, queue, builder) = setup(transport.clone()).await;
	let sync = builder.build().unwrap();

	for id in ["T1", "T2"] {
		clock.advance(Duration::from_millis(1));
		queue
			.enqueue(NewOperation::update(ResourceKind::Trip, id, json!({ "startDate": "2024-06-01" })))
			.await;
	}
	clock.advance(Duration::from_millis(1));
	queue
		.enqueue(NewOperation::update(ResourceKind::Expense, "E1", json!({ "amount": 5 })))
		.await;
	clock.advance(Duration::from_millis(1));
	queue
		.enqueue(NewOperation::delete(ResourceKind::Trip, "T3"))
		.await;

	let report = completed(sync.process_queue().await);
	assert_eq!(report.succeeded, 4);

	let batches = transport.batches.lock().unwrap().clone();
	assert_eq!(batches.len(), 2);
	assert_eq!(batches[0].0, ResourceKind::Trip);
	assert_eq!(batches[0].1.len(), 2);
	assert_eq!(batches[1].1.len(), 1);
	assert_eq!(transport.sent_count(), 4);

	let payloads = transport.payloads.lock().unwrap().clone();
	assert_eq!(payloads[0], json!({ "startDate": "2024-06-01T00:00:00.000Z" }));
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_adaptive_dispatch_runs_sub_batches_in_parallel() {
	let transport = Arc::new(MockTransport::ok().with_delay(Duration::from_millis(50)));
	let (clock, queue, builder) = setup(transport.clone()).await;
	let sync = builder.adaptive(AdaptiveConfig::default()).build().unwrap();

	for i in 0..9 {
		clock.advance(Duration::from_millis(1));
		queue
			.enqueue(NewOperation::update(ResourceKind::Document, format!("D{}", i), json!({ "name": i })))
			.await;
	}

	let report = completed(sync.process_queue().await);
	assert_eq!(report.succeeded, 9);
	assert!(queue.is_empty().await);
	let peak = transport.max_in_flight.load(Ordering::SeqCst);
	assert!(peak > 1 && peak <= 3, "peak concurrency {}", peak);
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_start_runs_maintenance_and_pause_stops_timer() {
	let transport = Arc::new(MockTransport::ok());
	let (clock, queue, builder) = setup(transport).await;
	let sync = builder.build().unwrap();

	let failing = queue
		.enqueue(NewOperation::delete(ResourceKind::Trip, "T1"))
		.await;
	let mut op = queue.get(&failing).await.unwrap();
	op.retry_count = 2;
	queue.update(op).await;
	clock.advance(Duration::from_millis(1));
	let kept = queue
		.enqueue(NewOperation::update(ResourceKind::Trip, "T2", json!({})))
		.await;

	sync.start().await;
	assert!(queue.get(&failing).await.is_none());
	assert!(queue.get(&kept).await.is_some());
	assert_eq!(sync.status(), SyncStatus::Idle);

	sync.pause_sync();
	assert_eq!(sync.status(), SyncStatus::Paused);
	sync.start_sync();
	assert_eq!(sync.status(), SyncStatus::Idle);

	sync.shutdown();
	assert_eq!(sync.status(), SyncStatus::Paused);
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_queue_operation_reports_queue_size() {
	let transport = Arc::new(MockTransport::ok());
	let (_clock, _queue, builder) = setup(transport).await;
	let sync = builder.build().unwrap();
	let mut events = sync.subscribe();

	let first = sync
		.queue_operation(NewOperation::update(ResourceKind::Trip, "T1", json!({ "title": "A" })))
		.await;
	let again = sync
		.queue_operation(NewOperation::update(ResourceKind::Trip, "T1", json!({ "title": "B" })))
		.await;
	assert_eq!(first, again);

	assert_eq!(
		drain(&mut events),
		vec![
			SyncEvent::QueueUpdated { queue_size: 1 },
			SyncEvent::QueueUpdated { queue_size: 1 },
		]
	);
	assert_eq!(sync.clear_queue().await, 1);
	sync.shutdown();
}

/// Queue and orchestrator on a clock that follows tokio's (paused) timer.
#[cfg(feature = "integration-tests")]
async fn tokio_queue() -> (Arc<dyn Clock>, Arc<OperationQueue>) {
	let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
	let queue = OperationQueue::open(Arc::new(MemoryStore::new()), "sync_queue", QueueConfig::default(), clock.clone()).await;
	(clock, Arc::new(queue))
}

#[tokio::test(start_paused = true)]
#[cfg(feature = "integration-tests")]
async fn test_start_kicks_a_pass_after_startup_delay() {
	let transport = Arc::new(MockTransport::ok());
	let (clock, queue) = tokio_queue().await;
	let sync = SyncOrchestrator::builder(queue.clone(), transport.clone())
		.with_clock(clock)
		.build()
		.unwrap();
	queue
		.enqueue(NewOperation::update(ResourceKind::Trip, "T1", json!({ "title": "Bergen" })))
		.await;

	sync.start().await;
	tokio::time::sleep(Duration::from_millis(500)).await;
	assert_eq!(transport.sent_count(), 0);

	tokio::time::sleep(Duration::from_secs(1)).await;
	assert_eq!(transport.sent_count(), 1);
	assert!(queue.is_empty().await);
	sync.shutdown();
}

#[tokio::test(start_paused = true)]
#[cfg(feature = "integration-tests")]
async fn test_failed_pass_resumes_with_backoff() {
	let attempts = Arc::new(AtomicUsize::new(0));
	let seen = attempts.clone();
	let transport = Arc::new(MockTransport::new(move |_, _| {
		if seen.fetch_add(1, Ordering::SeqCst) == 0 {
			Err(TransportError::Network("timed out".to_string()))
		} else {
			Ok(None)
		}
	}));
	let (clock, queue) = tokio_queue().await;
	let sync = SyncOrchestrator::builder(queue.clone(), transport.clone())
		.with_clock(clock)
		.build()
		.unwrap();
	queue
		.enqueue(NewOperation::patch(ResourceKind::Trip, "T1", json!({ "status": "booked" })))
		.await;

	sync.start().await;
	tokio::time::sleep(Duration::from_millis(1_500)).await;
	assert_eq!(attempts.load(Ordering::SeqCst), 1);
	assert_eq!(sync.counters().pass_errors.load(Ordering::Relaxed), 1);
	assert_eq!(sync.status(), SyncStatus::Paused);

	// Resumption after 5s, then the periodic timer picks the retry up.
	tokio::time::sleep(Duration::from_secs(60)).await;
	assert_eq!(attempts.load(Ordering::SeqCst), 2);
	assert!(queue.is_empty().await);
	assert_eq!(sync.status(), SyncStatus::Idle);
	sync.shutdown();
}
