use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use super::types::ResourceKind;

/// Kind of remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEvent {
	Insert,
	Update,
	Delete,
}

/// Out-of-band change pushed by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
	/// Table or channel name, e.g. `trips` or `trip_participants`.
	pub resource_kind: String,
	pub event_type: ChangeEvent,
	#[serde(default, rename = "new")]
	pub new_record: Option<Value>,
	#[serde(default, rename = "old")]
	pub old_record: Option<Value>,
}

impl ChangeNotification {
	pub fn new(resource_kind: impl Into<String>, event_type: ChangeEvent) -> Self {
		Self {
			resource_kind: resource_kind.into(),
			event_type,
			new_record: None,
			old_record: None,
		}
	}

	pub fn with_new(mut self, record: Value) -> Self {
		self.new_record = Some(record);
		self
	}

	pub fn with_old(mut self, record: Value) -> Self {
		self.old_record = Some(record);
		self
	}

	pub fn resource(&self) -> Option<ResourceKind> {
		ResourceKind::from_table(&self.resource_kind)
	}

	/// `id` of the new record, else of the old one.
	pub fn record_id(&self) -> Option<String> {
		[&self.new_record, &self.old_record]
			.into_iter()
			.flatten()
			.find_map(|record| match record.get("id")? {
				Value::String(s) if !s.is_empty() => Some(s.clone()),
				Value::Number(n) => Some(n.to_string()),
				_ => None,
			})
	}

	/// Read-cache keys made stale by this change: the collection listing
	/// and, when the record id is known, the record itself.
	pub fn cache_keys(&self) -> Vec<String> {
		let Some(kind) = self.resource() else {
			return Vec::new();
		};
		let mut keys = vec![format!("all-{}", kind.plural())];
		if let Some(id) = self.record_id() {
			keys.push(format!("{}-{}", kind, id));
		}
		keys
	}
}

/// Subscription to remote change notifications.
pub trait EventSource: Send + Sync + 'static {
	fn subscribe(&self) -> broadcast::Receiver<ChangeNotification>;
}

/// In-process event source fed by whatever receives the remote feed.
#[derive(Debug, Clone)]
pub struct ChannelEventSource {
	tx: broadcast::Sender<ChangeNotification>,
}

impl ChannelEventSource {
	pub fn new(capacity: usize) -> Self {
		let (tx, _rx) = broadcast::channel(capacity.max(1));
		Self { tx }
	}

	/// Returns the number of subscribers reached.
	pub fn publish(&self, notification: ChangeNotification) -> usize {
		self.tx.send(notification).unwrap_or(0)
	}
}

impl Default for ChannelEventSource {
	fn default() -> Self {
		Self::new(256)
	}
}

impl EventSource for ChannelEventSource {
	fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
		self.tx.subscribe()
	}
}
