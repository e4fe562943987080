use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::error::StoreError;
use super::platform::Clock;
use super::store::DurableStore;
use super::types::{NewOperation, OperationType, QueuedOperation, ResourceKind, dedup_key};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
const SNAPSHOT_VERSION: u32 = 1;

/// Sizing of the queue and its in-memory working set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
	/// Hard cap on queued operations; least urgent entries are evicted
	/// beyond it.
	#[serde(default = "default_max_queue_size")]
	pub max_queue_size: usize,

	/// Operations kept in memory before the least likely to flush are
	/// spilled to chunk blobs.
	#[serde(default = "default_max_memory_items")]
	pub max_memory_items: usize,

	/// Operations per spilled chunk.
	#[serde(default = "default_chunk_size")]
	pub chunk_size: usize,
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			max_queue_size: default_max_queue_size(),
			max_memory_items: default_max_memory_items(),
			chunk_size: default_chunk_size(),
		}
	}
}

fn default_max_queue_size() -> usize {
	5_000
}

fn default_max_memory_items() -> usize {
	500
}

fn default_chunk_size() -> usize {
	100
}

/// Index entry kept in memory for every queued operation, whether its
/// payload is in memory or in a spilled chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMeta {
	pub id: String,
	pub dedup_key: String,
	#[serde(rename = "type")]
	pub op_type: OperationType,
	pub resource: ResourceKind,
	#[serde(default)]
	pub resource_id: Option<String>,
	pub priority: i32,
	pub timestamp: i64,
	#[serde(default)]
	pub retry_count: u32,
	#[serde(default)]
	pub next_retry_at: Option<i64>,
	#[serde(default)]
	pub dependencies: BTreeSet<String>,
	#[serde(default)]
	pub chunk: Option<u64>,
}

impl EntryMeta {
	fn from_op(op: &QueuedOperation, chunk: Option<u64>) -> Self {
		Self {
			id: op.id.clone(),
			dedup_key: op.dedup_key(),
			op_type: op.op_type,
			resource: op.resource,
			resource_id: op.resource_id.clone(),
			priority: op.priority,
			timestamp: op.timestamp,
			retry_count: op.retry_count,
			next_retry_at: op.next_retry_at,
			dependencies: op.dependencies.clone(),
			chunk,
		}
	}

	fn is_ready(&self, now_ms: i64, is_queued: impl Fn(&str) -> bool) -> bool {
		self.next_retry_at.is_none_or(|at| at <= now_ms)
			&& !self.dependencies.iter().any(|d| is_queued(d))
	}

	pub fn is_stale(&self, now_ms: i64) -> bool {
		is_stale(self.op_type, self.timestamp, self.retry_count, now_ms)
	}
}

/// Staleness rules applied by `cleanup`:
/// older than 7 days with more than 3 retries; a delete older than 3 days
/// that has failed at least once; or more than 10 retries at any age.
pub fn is_stale(op_type: OperationType, timestamp: i64, retry_count: u32, now_ms: i64) -> bool {
	let age = now_ms - timestamp;
	(age > 7 * DAY_MS && retry_count > 3)
		|| (op_type == OperationType::Delete && age > 3 * DAY_MS && retry_count > 0)
		|| retry_count > 10
}

/// Counts over the whole queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
	pub total: usize,
	/// Never attempted, or not yet failed.
	pub pending: usize,
	/// Failed at least once and awaiting retry.
	pub failed: usize,
	/// Keyed `"{type}_{resource}"`, e.g. `update_trip`.
	pub by_kind: BTreeMap<String, usize>,
	pub oldest_timestamp: Option<i64>,
	pub in_memory: usize,
	pub spilled: usize,
	pub chunks: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueSnapshot {
	#[serde(default)]
	version: u32,
	#[serde(default)]
	operations: Vec<QueuedOperation>,
	#[serde(default)]
	spilled: Vec<EntryMeta>,
	#[serde(default)]
	next_chunk: u64,
	#[serde(default)]
	seq: u64,
}

#[derive(Debug, Default)]
struct QueueState {
	hot: HashMap<String, QueuedOperation>,
	index: HashMap<String, EntryMeta>,
	keys: HashMap<String, String>,
	chunks: BTreeMap<u64, BTreeSet<String>>,
	next_chunk: u64,
	seq: u64,
	/// Chunk blobs with no live entries left, deleted on the next persist.
	orphaned: Vec<u64>,
}

impl QueueState {
	fn from_snapshot(snapshot: QueueSnapshot) -> (Self, usize) {
		let mut state = QueueState {
			next_chunk: snapshot.next_chunk,
			seq: snapshot.seq,
			..Default::default()
		};
		let mut dropped = 0;

		for op in snapshot.operations {
			if !op.is_valid() {
				dropped += 1;
				continue;
			}
			if let Some(existing) = state.keys.get(&op.dedup_key()).cloned() {
				let keep_existing = state
					.hot
					.get(&existing)
					.is_some_and(|e| e.timestamp >= op.timestamp);
				dropped += 1;
				if keep_existing {
					continue;
				}
				state.remove_entry(&existing);
			}
			state.insert_hot(op);
		}

		for meta in snapshot.spilled {
			let Some(chunk) = meta.chunk else {
				dropped += 1;
				continue;
			};
			if meta.id.is_empty()
				|| state.index.contains_key(&meta.id)
				|| state.keys.contains_key(&meta.dedup_key)
			{
				dropped += 1;
				continue;
			}
			state.next_chunk = state.next_chunk.max(chunk + 1);
			state.keys.insert(meta.dedup_key.clone(), meta.id.clone());
			state.chunks.entry(chunk).or_default().insert(meta.id.clone());
			state.index.insert(meta.id.clone(), meta);
		}

		(state, dropped)
	}

	fn snapshot(&self) -> QueueSnapshot {
		let mut operations: Vec<QueuedOperation> = self.hot.values().cloned().collect();
		operations.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
		let mut spilled: Vec<EntryMeta> = self
			.index
			.values()
			.filter(|m| m.chunk.is_some())
			.cloned()
			.collect();
		spilled.sort_by(|a, b| a.id.cmp(&b.id));

		QueueSnapshot {
			version: SNAPSHOT_VERSION,
			operations,
			spilled,
			next_chunk: self.next_chunk,
			seq: self.seq,
		}
	}

	/// Insert or replace an operation in memory, detaching it from any
	/// chunk it was spilled to.
	fn insert_hot(&mut self, op: QueuedOperation) {
		let meta = EntryMeta::from_op(&op, None);
		let key = meta.dedup_key.clone();
		if let Some(previous) = self.index.insert(op.id.clone(), meta) {
			if let Some(chunk) = previous.chunk {
				self.detach(&op.id, chunk);
			}
			if previous.dedup_key != key && self.keys.get(&previous.dedup_key) == Some(&op.id) {
				self.keys.remove(&previous.dedup_key);
			}
		}
		self.keys.insert(key, op.id.clone());
		self.hot.insert(op.id.clone(), op);
	}

	fn remove_entry(&mut self, id: &str) -> Option<EntryMeta> {
		let meta = self.index.remove(id)?;
		self.hot.remove(id);
		if self.keys.get(&meta.dedup_key).is_some_and(|k| k == id) {
			self.keys.remove(&meta.dedup_key);
		}
		if let Some(chunk) = meta.chunk {
			self.detach(id, chunk);
		}
		Some(meta)
	}

	fn detach(&mut self, id: &str, chunk: u64) {
		if let Some(members) = self.chunks.get_mut(&chunk) {
			members.remove(id);
			if members.is_empty() {
				self.chunks.remove(&chunk);
				self.orphaned.push(chunk);
			}
		}
	}

	/// Ids ordered for capacity eviction: highest priority value first,
	/// oldest first within a priority.
	fn eviction_order(&self) -> Vec<String> {
		let mut metas: Vec<&EntryMeta> = self.index.values().collect();
		metas.sort_by(|a, b| {
			b.priority
				.cmp(&a.priority)
				.then(a.timestamp.cmp(&b.timestamp))
				.then_with(|| a.id.cmp(&b.id))
		});
		metas.into_iter().map(|m| m.id.clone()).collect()
	}
}

/// Durable, deduplicated, priority-ordered queue of pending operations.
///
/// At most one live operation exists per `(type, resource, resource_id,
/// actor)`. Every mutation persists a full snapshot to the durable store.
/// When the in-memory working set grows past `max_memory_items`, the least
/// urgent operations are written to chunk blobs (`{key}:chunk:{n}`) and
/// loaded back only when selected.
pub struct OperationQueue {
	store: Arc<dyn DurableStore>,
	key: String,
	config: QueueConfig,
	clock: Arc<dyn Clock>,
	actor_id: String,
	state: Mutex<QueueState>,
}

impl OperationQueue {
	/// Open the queue persisted under `key`. A missing snapshot starts an
	/// empty queue; an unreadable one is discarded.
	pub async fn open(
		store: Arc<dyn DurableStore>,
		key: impl Into<String>,
		config: QueueConfig,
		clock: Arc<dyn Clock>,
	) -> Self {
		let key = key.into();
		let state = match store.get(&key).await {
			Ok(Some(blob)) => decode_snapshot(&key, &blob),
			Ok(None) => QueueState::default(),
			Err(e) => {
				error!("Failed to read queue snapshot '{}': {}; starting empty", key, e);
				QueueState::default()
			}
		};
		info!(
			"Opened operation queue '{}' with {} operations ({} spilled)",
			key,
			state.index.len(),
			state.index.len() - state.hot.len()
		);

		Self {
			store,
			key,
			config,
			clock,
			actor_id: "local".to_string(),
			state: Mutex::new(state),
		}
	}

	/// Actor recorded on operations that do not name one.
	pub fn with_actor_id(mut self, actor_id: impl Into<String>) -> Self {
		self.actor_id = actor_id.into();
		self
	}

	pub fn key(&self) -> &str {
		&self.key
	}

	pub fn actor_id(&self) -> &str {
		&self.actor_id
	}

	pub fn config(&self) -> &QueueConfig {
		&self.config
	}

	fn chunk_key(&self, chunk: u64) -> String {
		format!("{}:chunk:{}", self.key, chunk)
	}

	/// Add an operation, or fold it into the live operation with the same
	/// dedup key (newest payload and timestamp win, identity and retry
	/// bookkeeping are kept, dependencies accumulate). Returns the
	/// operation id. Never fails:
	/// persistence problems are logged.
	pub async fn enqueue(&self, new: NewOperation) -> String {
		let now = self.clock.now_ms();
		let actor_id = new.actor_id.unwrap_or_else(|| self.actor_id.clone());
		let mutation_id = new.mutation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
		let key = dedup_key(
			new.op_type,
			new.resource,
			new.resource_id.as_deref(),
			&mutation_id,
			&actor_id,
		);

		let mut state = self.state.lock().await;

		let existing = match state.keys.get(&key).cloned() {
			Some(id) => self.load_one(&mut state, &id).await,
			None => None,
		};

		let id = match existing {
			Some(mut op) => {
				op.payload = new.payload;
				op.timestamp = now;
				op.priority = new.priority;
				op.dependencies.extend(new.dependencies);
				op.dependencies.remove(&op.id);
				op.mutation_id = mutation_id;
				debug!("Updated queued operation {} ({})", op.id, op.describe());
				let id = op.id.clone();
				state.insert_hot(op);
				id
			}
			None => {
				state.seq += 1;
				let id = format!("{}_{}_{}", key, now, state.seq);
				let mut dependencies = new.dependencies;
				dependencies.remove(&id);
				let op = QueuedOperation {
					id: id.clone(),
					op_type: new.op_type,
					resource: new.resource,
					resource_id: new.resource_id,
					payload: new.payload,
					timestamp: now,
					priority: new.priority,
					retry_count: 0,
					next_retry_at: None,
					dependencies,
					mutation_id,
					actor_id,
				};
				debug!("Enqueued operation {} ({})", id, op.describe());
				state.insert_hot(op);
				id
			}
		};

		self.enforce_capacity(&mut state);
		self.spill(&mut state).await;
		self.save(&mut state).await;
		id
	}

	/// Up to `limit` ready operations ordered by `(priority, timestamp)`.
	/// Ready means no retry is scheduled in the future and no dependency is
	/// still queued. Does not change the queue.
	pub async fn peek(&self, limit: usize) -> Vec<QueuedOperation> {
		if limit == 0 {
			return Vec::new();
		}
		let now = self.clock.now_ms();
		let mut state = self.state.lock().await;

		let mut ready: Vec<&EntryMeta> = state
			.index
			.values()
			.filter(|m| m.is_ready(now, |id| state.index.contains_key(id)))
			.collect();
		ready.sort_by(|a, b| {
			a.priority
				.cmp(&b.priority)
				.then(a.timestamp.cmp(&b.timestamp))
				.then_with(|| a.id.cmp(&b.id))
		});
		let picks: Vec<(String, Option<u64>)> = ready
			.into_iter()
			.take(limit)
			.map(|m| (m.id.clone(), m.chunk))
			.collect();

		self.load_many(&mut state, &picks).await
	}

	pub async fn get(&self, id: &str) -> Option<QueuedOperation> {
		let mut state = self.state.lock().await;
		self.load_one(&mut state, id).await
	}

	/// Replace a queued operation in place. Returns false when `op.id` is no
	/// longer queued.
	pub async fn update(&self, op: QueuedOperation) -> bool {
		let mut state = self.state.lock().await;
		if !state.index.contains_key(&op.id) {
			return false;
		}
		state.insert_hot(op);
		self.spill(&mut state).await;
		self.save(&mut state).await;
		true
	}

	/// Like [`update`](Self::update), but only while the queued entry still
	/// carries `op.timestamp`. Returns false when it was re-enqueued or
	/// removed in the meantime.
	pub async fn update_unchanged(&self, op: QueuedOperation) -> bool {
		let mut state = self.state.lock().await;
		if state.index.get(&op.id).map(|m| m.timestamp) != Some(op.timestamp) {
			return false;
		}
		state.insert_hot(op);
		self.spill(&mut state).await;
		self.save(&mut state).await;
		true
	}

	pub async fn remove(&self, id: &str) -> bool {
		self.remove_where(|m| m.id == id).await > 0
	}

	pub async fn remove_multiple(&self, ids: &[String]) -> usize {
		let ids: HashSet<&str> = ids.iter().map(String::as_str).collect();
		self.remove_where(|m| ids.contains(m.id.as_str())).await
	}

	/// Remove every operation targeting `resource_id`.
	pub async fn remove_by_resource_id(&self, resource_id: &str) -> usize {
		self.remove_where(|m| m.resource_id.as_deref() == Some(resource_id))
			.await
	}

	/// Remove operations whose timestamp still matches the given one, so an
	/// operation re-enqueued after it was read is kept.
	pub async fn remove_unchanged(&self, entries: &[(String, i64)]) -> usize {
		let wanted: HashMap<&str, i64> = entries.iter().map(|(id, ts)| (id.as_str(), *ts)).collect();
		self.remove_where(|m| wanted.get(m.id.as_str()) == Some(&m.timestamp))
			.await
	}

	pub async fn remove_where<F>(&self, predicate: F) -> usize
	where
		F: Fn(&EntryMeta) -> bool,
	{
		let mut state = self.state.lock().await;
		let victims: Vec<String> = state
			.index
			.values()
			.filter(|m| predicate(m))
			.map(|m| m.id.clone())
			.collect();
		if victims.is_empty() {
			return 0;
		}
		for id in &victims {
			state.remove_entry(id);
		}
		self.save(&mut state).await;
		victims.len()
	}

	/// Drop every queued operation.
	pub async fn clear(&self) -> usize {
		let mut state = self.state.lock().await;
		let count = state.index.len();
		let mut orphaned: Vec<u64> = state.chunks.keys().copied().collect();
		orphaned.append(&mut state.orphaned);
		*state = QueueState {
			next_chunk: state.next_chunk,
			seq: state.seq,
			orphaned,
			..Default::default()
		};
		self.save(&mut state).await;
		info!("Cleared {} operations from queue '{}'", count, self.key);
		count
	}

	/// Remove stale operations (see [`is_stale`]). Returns how many.
	pub async fn cleanup(&self) -> usize {
		let now = self.clock.now_ms();
		let removed = self.remove_where(|m| m.is_stale(now)).await;
		if removed > 0 {
			info!("Cleaned up {} stale operations", removed);
		}
		removed
	}

	pub async fn get_stats(&self) -> QueueStats {
		let state = self.state.lock().await;
		let mut stats = QueueStats {
			total: state.index.len(),
			in_memory: state.hot.len(),
			spilled: state.index.len() - state.hot.len(),
			chunks: state.chunks.len(),
			..Default::default()
		};
		for meta in state.index.values() {
			if meta.retry_count == 0 {
				stats.pending += 1;
			} else {
				stats.failed += 1;
			}
			*stats
				.by_kind
				.entry(format!("{}_{}", meta.op_type, meta.resource))
				.or_default() += 1;
			stats.oldest_timestamp = Some(
				stats
					.oldest_timestamp
					.map_or(meta.timestamp, |t| t.min(meta.timestamp)),
			);
		}
		stats
	}

	/// Every queued operation in `(priority, timestamp)` order.
	pub async fn export(&self) -> Vec<QueuedOperation> {
		self.collect_where(|_| true).await
	}

	pub async fn get_by_type_and_resource(
		&self,
		op_type: OperationType,
		resource: ResourceKind,
	) -> Vec<QueuedOperation> {
		self.collect_where(|m| m.op_type == op_type && m.resource == resource)
			.await
	}

	/// Whether an operation for `(op_type, resource, resource_id)` is queued
	/// for `actor_id` (default: this queue's actor).
	pub async fn exists(
		&self,
		op_type: OperationType,
		resource: ResourceKind,
		resource_id: &str,
		actor_id: Option<&str>,
	) -> bool {
		let actor = actor_id.unwrap_or(&self.actor_id);
		let key = dedup_key(op_type, resource, Some(resource_id), "", actor);
		self.state.lock().await.keys.contains_key(&key)
	}

	pub async fn len(&self) -> usize {
		self.state.lock().await.index.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.len().await == 0
	}

	async fn collect_where<F>(&self, predicate: F) -> Vec<QueuedOperation>
	where
		F: Fn(&EntryMeta) -> bool,
	{
		let mut state = self.state.lock().await;
		let mut metas: Vec<&EntryMeta> = state.index.values().filter(|m| predicate(m)).collect();
		metas.sort_by(|a, b| {
			a.priority
				.cmp(&b.priority)
				.then(a.timestamp.cmp(&b.timestamp))
				.then_with(|| a.id.cmp(&b.id))
		});
		let picks: Vec<(String, Option<u64>)> =
			metas.into_iter().map(|m| (m.id.clone(), m.chunk)).collect();
		self.load_many(&mut state, &picks).await
	}

	async fn load_one(&self, state: &mut QueueState, id: &str) -> Option<QueuedOperation> {
		let chunk = state.index.get(id)?.chunk;
		self.load_many(state, &[(id.to_string(), chunk)])
			.await
			.into_iter()
			.next()
	}

	/// Materialise operations in the given order, reading each needed
	/// chunk once. Entries whose chunk is gone or unreadable are dropped;
	/// entries whose chunk could not be read for I/O reasons are skipped.
	async fn load_many(
		&self,
		state: &mut QueueState,
		picks: &[(String, Option<u64>)],
	) -> Vec<QueuedOperation> {
		let mut chunks: HashMap<u64, Option<HashMap<String, QueuedOperation>>> = HashMap::new();
		let mut lost = Vec::new();
		let mut out = Vec::with_capacity(picks.len());

		for (id, chunk) in picks {
			let Some(chunk) = chunk else {
				if let Some(op) = state.hot.get(id) {
					out.push(op.clone());
				}
				continue;
			};
			if !chunks.contains_key(chunk) {
				let loaded = match self.load_chunk(*chunk).await {
					Ok(ops) => Some(ops),
					Err(e) => {
						warn!("Failed to read queue chunk {}: {}", chunk, e);
						None
					}
				};
				chunks.insert(*chunk, loaded);
			}
			match chunks.get(chunk) {
				Some(Some(ops)) => match ops.get(id) {
					Some(op) => out.push(op.clone()),
					None => lost.push(id.clone()),
				},
				_ => {}
			}
		}

		if !lost.is_empty() {
			warn!(
				"Dropping {} spilled operations missing from their chunk",
				lost.len()
			);
			for id in &lost {
				state.remove_entry(id);
			}
			self.save(state).await;
		}
		out
	}

	async fn load_chunk(&self, chunk: u64) -> Result<HashMap<String, QueuedOperation>, StoreError> {
		let Some(blob) = self.store.get(&self.chunk_key(chunk)).await? else {
			return Ok(HashMap::new());
		};
		match serde_json::from_slice::<Vec<QueuedOperation>>(&blob) {
			Ok(ops) => Ok(ops.into_iter().map(|op| (op.id.clone(), op)).collect()),
			Err(e) => {
				warn!("Discarding corrupted queue chunk {}: {}", chunk, e);
				Ok(HashMap::new())
			}
		}
	}

	fn enforce_capacity(&self, state: &mut QueueState) {
		let over = state.index.len().saturating_sub(self.config.max_queue_size);
		if over == 0 {
			return;
		}
		for id in state.eviction_order().into_iter().take(over) {
			if let Some(meta) = state.remove_entry(&id) {
				warn!(
					"Queue over capacity ({}): evicted {} {} (priority {})",
					self.config.max_queue_size, meta.op_type, meta.resource, meta.priority
				);
			}
		}
	}

	/// Move the least likely to flush in-memory operations (highest
	/// priority value, newest first) into a new chunk blob.
	async fn spill(&self, state: &mut QueueState) {
		let max = self.config.max_memory_items;
		if state.hot.len() <= max {
			return;
		}
		let count = (state.hot.len() - max)
			.max(self.config.chunk_size)
			.min(state.hot.len());

		let mut candidates: Vec<&QueuedOperation> = state.hot.values().collect();
		candidates.sort_by(|a, b| {
			b.priority
				.cmp(&a.priority)
				.then(b.timestamp.cmp(&a.timestamp))
				.then_with(|| b.id.cmp(&a.id))
		});
		let ops: Vec<QueuedOperation> = candidates.into_iter().take(count).cloned().collect();

		let chunk = state.next_chunk;
		let blob = match serde_json::to_vec(&ops) {
			Ok(blob) => blob,
			Err(e) => {
				error!("Failed to serialize queue chunk: {}", e);
				return;
			}
		};
		if let Err(e) = self.store.set(&self.chunk_key(chunk), blob).await {
			warn!("Failed to spill {} operations to chunk {}: {}", ops.len(), chunk, e);
			return;
		}

		state.next_chunk += 1;
		let mut members = BTreeSet::new();
		for op in ops {
			state.hot.remove(&op.id);
			if let Some(meta) = state.index.get_mut(&op.id) {
				meta.chunk = Some(chunk);
			}
			members.insert(op.id);
		}
		debug!("Spilled {} operations to chunk {}", members.len(), chunk);
		state.chunks.insert(chunk, members);
	}

	async fn drop_orphans(&self, state: &mut QueueState) {
		for chunk in std::mem::take(&mut state.orphaned) {
			if let Err(e) = self.store.remove(&self.chunk_key(chunk)).await {
				warn!("Failed to delete queue chunk {}: {}", chunk, e);
			}
		}
	}

	/// Persist the snapshot. A capacity rejection evicts the oldest 25% of
	/// operations and retries once.
	async fn persist(&self, state: &mut QueueState) -> Result<(), StoreError> {
		self.drop_orphans(state).await;
		let blob = serde_json::to_vec(&state.snapshot())?;
		match self.store.set(&self.key, blob).await {
			Err(e) if e.is_capacity() => {
				let evicted = self.evict_oldest_quarter(state);
				warn!(
					"Queue snapshot rejected ({}); evicted {} oldest operations and retrying",
					e, evicted
				);
				self.drop_orphans(state).await;
				let blob = serde_json::to_vec(&state.snapshot())?;
				self.store.set(&self.key, blob).await
			}
			other => other,
		}
	}

	async fn save(&self, state: &mut QueueState) {
		if let Err(e) = self.persist(state).await {
			error!(
				"Abandoned queue snapshot write for '{}': {}; in-memory state stays authoritative",
				self.key, e
			);
		}
	}

	fn evict_oldest_quarter(&self, state: &mut QueueState) -> usize {
		let total = state.index.len();
		if total == 0 {
			return 0;
		}
		let count = total.div_ceil(4);
		let mut metas: Vec<(i64, String)> = state
			.index
			.values()
			.map(|m| (m.timestamp, m.id.clone()))
			.collect();
		metas.sort();
		for (_, id) in metas.into_iter().take(count) {
			state.remove_entry(&id);
		}
		count
	}
}

fn decode_snapshot(key: &str, blob: &[u8]) -> QueueState {
	let snapshot = match serde_json::from_slice::<QueueSnapshot>(blob) {
		Ok(snapshot) => snapshot,
		Err(_) => match serde_json::from_slice::<Vec<QueuedOperation>>(blob) {
			Ok(operations) => QueueSnapshot {
				operations,
				..Default::default()
			},
			Err(e) => {
				warn!("Discarding corrupted queue snapshot '{}': {}", key, e);
				return QueueState::default();
			}
		},
	};
	let (state, dropped) = QueueState::from_snapshot(snapshot);
	if dropped > 0 {
		warn!("Dropped {} invalid entries from queue snapshot '{}'", dropped, key);
	}
	state
}
