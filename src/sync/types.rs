use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Kind of mutation carried by a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
	Create,
	Update,
	Delete,
	Patch,
}

impl OperationType {
	pub fn as_str(&self) -> &'static str {
		match self {
			OperationType::Create => "create",
			OperationType::Update => "update",
			OperationType::Delete => "delete",
			OperationType::Patch => "patch",
		}
	}

	fn verb(&self) -> &'static str {
		match self {
			OperationType::Create => "Creating",
			OperationType::Update => "Updating",
			OperationType::Delete => "Deleting",
			OperationType::Patch => "Patching",
		}
	}
}

impl fmt::Display for OperationType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for OperationType {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"create" => Ok(OperationType::Create),
			"update" => Ok(OperationType::Update),
			"delete" => Ok(OperationType::Delete),
			"patch" => Ok(OperationType::Patch),
			other => Err(format!("unknown operation type '{}'", other)),
		}
	}
}

/// Remote resource kinds the engine knows how to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
	Trip,
	Participant,
	Activity,
	Document,
	Expense,
}

impl ResourceKind {
	pub const ALL: [ResourceKind; 5] = [
		ResourceKind::Trip,
		ResourceKind::Participant,
		ResourceKind::Activity,
		ResourceKind::Document,
		ResourceKind::Expense,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			ResourceKind::Trip => "trip",
			ResourceKind::Participant => "participant",
			ResourceKind::Activity => "activity",
			ResourceKind::Document => "document",
			ResourceKind::Expense => "expense",
		}
	}

	/// Collection name used by REST paths and cache keys.
	pub fn plural(&self) -> &'static str {
		match self {
			ResourceKind::Trip => "trips",
			ResourceKind::Participant => "participants",
			ResourceKind::Activity => "activities",
			ResourceKind::Document => "documents",
			ResourceKind::Expense => "expenses",
		}
	}

	/// Map a remote table or channel name ("trips", "trip_participants",
	/// "activity") onto a resource kind.
	pub fn from_table(name: &str) -> Option<Self> {
		let name = name.trim().to_ascii_lowercase();
		let name = name.strip_prefix("trip_").unwrap_or(&name);
		ResourceKind::ALL
			.into_iter()
			.find(|k| k.as_str() == name || k.plural() == name)
	}
}

impl fmt::Display for ResourceKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ResourceKind {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ResourceKind::from_table(s).ok_or_else(|| format!("unknown resource '{}'", s))
	}
}

/// Well-known priority levels. Lower values are more urgent; any `i32`
/// is accepted by the queue.
pub struct Priority;

impl Priority {
	pub const CRITICAL: i32 = 0;
	pub const HIGH: i32 = 1;
	pub const NORMAL: i32 = 3;
	pub const LOW: i32 = 5;
}

/// A pending mutation awaiting delivery to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
	pub id: String,
	#[serde(rename = "type")]
	pub op_type: OperationType,
	pub resource: ResourceKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub resource_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub payload: Option<Value>,
	/// Creation or last-update time, Unix epoch milliseconds.
	pub timestamp: i64,
	pub priority: i32,
	#[serde(default)]
	pub retry_count: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub next_retry_at: Option<i64>,
	#[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
	pub dependencies: BTreeSet<String>,
	pub mutation_id: String,
	pub actor_id: String,
}

impl QueuedOperation {
	/// Identity used for deduplication. Creates without a resource id key
	/// on their mutation id so that distinct creates never collapse.
	pub fn dedup_key(&self) -> String {
		dedup_key(
			self.op_type,
			self.resource,
			self.resource_id.as_deref(),
			&self.mutation_id,
			&self.actor_id,
		)
	}

	/// Human-readable summary, e.g. "Updating trip T1".
	pub fn describe(&self) -> String {
		match &self.resource_id {
			Some(id) => format!("{} {} {}", self.op_type.verb(), self.resource, id),
			None => format!("{} {}", self.op_type.verb(), self.resource),
		}
	}

	/// Ready when no retry is pending in the future and every dependency
	/// has already left the queue.
	pub fn is_ready(&self, now_ms: i64, is_queued: impl Fn(&str) -> bool) -> bool {
		self.next_retry_at.is_none_or(|at| at <= now_ms)
			&& !self.dependencies.iter().any(|d| is_queued(d))
	}

	pub(crate) fn is_valid(&self) -> bool {
		!self.id.is_empty()
			&& self.timestamp > 0
			&& !self.actor_id.is_empty()
			&& (self.op_type == OperationType::Create || self.resource_id.is_some())
	}
}

pub(crate) fn dedup_key(
	op_type: OperationType,
	resource: ResourceKind,
	resource_id: Option<&str>,
	mutation_id: &str,
	actor_id: &str,
) -> String {
	match resource_id {
		Some(rid) => format!("{}_{}_{}_{}", op_type, resource, rid, actor_id),
		None => format!("{}_{}_new-{}_{}", op_type, resource, mutation_id, actor_id),
	}
}

/// Caller-facing description of a mutation to enqueue.
#[derive(Debug, Clone)]
pub struct NewOperation {
	pub op_type: OperationType,
	pub resource: ResourceKind,
	pub resource_id: Option<String>,
	pub payload: Option<Value>,
	pub priority: i32,
	pub dependencies: BTreeSet<String>,
	pub mutation_id: Option<String>,
	pub actor_id: Option<String>,
}

impl NewOperation {
	pub fn new(op_type: OperationType, resource: ResourceKind) -> Self {
		Self {
			op_type,
			resource,
			resource_id: None,
			payload: None,
			priority: Priority::NORMAL,
			dependencies: BTreeSet::new(),
			mutation_id: None,
			actor_id: None,
		}
	}

	pub fn create(resource: ResourceKind, payload: Value) -> Self {
		Self::new(OperationType::Create, resource).with_payload(payload)
	}

	pub fn update(resource: ResourceKind, resource_id: impl Into<String>, payload: Value) -> Self {
		Self::new(OperationType::Update, resource)
			.with_resource_id(resource_id)
			.with_payload(payload)
	}

	pub fn patch(resource: ResourceKind, resource_id: impl Into<String>, payload: Value) -> Self {
		Self::new(OperationType::Patch, resource)
			.with_resource_id(resource_id)
			.with_payload(payload)
	}

	pub fn delete(resource: ResourceKind, resource_id: impl Into<String>) -> Self {
		Self::new(OperationType::Delete, resource).with_resource_id(resource_id)
	}

	pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
		self.resource_id = Some(resource_id.into());
		self
	}

	pub fn with_payload(mut self, payload: Value) -> Self {
		self.payload = Some(payload);
		self
	}

	pub fn with_priority(mut self, priority: i32) -> Self {
		self.priority = priority;
		self
	}

	/// Hold this operation back until `operation_id` has left the queue.
	pub fn with_dependency(mut self, operation_id: impl Into<String>) -> Self {
		self.dependencies.insert(operation_id.into());
		self
	}

	pub fn with_mutation_id(mut self, mutation_id: impl Into<String>) -> Self {
		self.mutation_id = Some(mutation_id.into());
		self
	}

	pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
		self.actor_id = Some(actor_id.into());
		self
	}
}
