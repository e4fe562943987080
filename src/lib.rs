pub mod config;
pub mod observability;
pub mod sync;

use anyhow::Context;
use log::info;
use std::sync::Arc;

use crate::config::Settings;
use crate::observability::MetricsRegistry;
use crate::sync::{
	Clock, ConflictResolver, FileStore, HttpTransport, OperationQueue, ResolverConfigError, SyncOrchestrator,
	TokioClock,
};

/// Open the file-backed queue described by `settings`.
pub async fn open_queue(settings: &Settings, clock: Arc<dyn Clock>) -> anyhow::Result<Arc<OperationQueue>> {
	let store = FileStore::open(settings.store_dir.clone())
		.await
		.with_context(|| format!("failed to open store at {}", settings.store_dir.display()))?
		.with_quota(settings.store_quota_bytes);

	let queue = OperationQueue::open(
		Arc::new(store),
		settings.queue_key.clone(),
		settings.queue.clone(),
		clock,
	)
	.await
	.with_actor_id(settings.actor_id.clone());

	Ok(Arc::new(queue))
}

/// Conflict resolver configured from `settings`. No prompt callback is
/// registered, so `prompt_user` rules need the merge fallback enabled.
pub fn build_resolver(settings: &Settings) -> Result<ConflictResolver, ResolverConfigError> {
	let mut builder = ConflictResolver::builder()
		.with_default_strategy(settings.sync.default_strategy)
		.allow_prompt_fallback(settings.conflict.allow_prompt_fallback);
	if settings.conflict.default_rules {
		builder = builder.with_default_rules();
	}
	builder.build()
}

/// Adaptive orchestrator over the file store and the HTTP transport.
pub async fn build_orchestrator(
	settings: &Settings,
	metrics: Option<Arc<MetricsRegistry>>,
) -> anyhow::Result<SyncOrchestrator> {
	let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
	let queue = open_queue(settings, clock.clone()).await?;
	let transport = HttpTransport::builder(settings.api_base_url.clone())
		.with_token(settings.api_token.clone())
		.build()
		.context("failed to build HTTP transport")?;
	let resolver = build_resolver(settings).context("invalid conflict settings")?;

	let mut builder = SyncOrchestrator::builder(queue, Arc::new(transport))
		.with_config(settings.sync.clone())
		.with_resolver(resolver)
		.with_clock(clock)
		.adaptive(settings.adaptive.clone());
	if let Some(metrics) = metrics {
		builder = builder.with_telemetry(metrics);
	}

	Ok(builder.build()?)
}

/// Sync until Ctrl-C, then print the metrics.
pub async fn run(settings: Settings, metrics: Arc<MetricsRegistry>) -> anyhow::Result<()> {
	let orchestrator = build_orchestrator(&settings, Some(metrics.clone())).await?;
	orchestrator.start().await;
	info!(
		"Syncing {} queued operations against {} as '{}'",
		orchestrator.queue().len().await,
		settings.api_base_url,
		settings.actor_id
	);

	tokio::signal::ctrl_c()
		.await
		.context("failed to listen for shutdown signal")?;

	orchestrator.shutdown();
	let stats = orchestrator.stats().await;
	info!(
		"Stopped after {} passes: {} succeeded, {} dropped, {} conflicts resolved, {} still queued",
		stats.passes, stats.succeeded, stats.dropped, stats.conflicts_resolved, stats.queue_size
	);
	println!("{}", metrics.encode());
	Ok(())
}
