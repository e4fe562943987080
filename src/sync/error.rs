use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use super::conflict::ConflictData;

/// Status codes that mean the remote side will never accept the operation
/// as sent.
pub const NON_RETRYABLE_STATUS: [u16; 6] = [400, 401, 403, 404, 409, 410];

static NON_RETRYABLE_MESSAGE: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r"(?i)not found|does not exist|unauthorized|forbidden")
		.expect("non-retryable message pattern is a valid regex")
});

/// Errors raised by a durable key/value store.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("store capacity exceeded writing '{key}': {needed} bytes needed, limit {limit}")]
	Capacity {
		key: String,
		needed: usize,
		limit: usize,
	},

	#[error("store I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

impl StoreError {
	pub fn is_capacity(&self) -> bool {
		matches!(self, StoreError::Capacity { .. })
	}
}

/// Errors raised by a network transport.
#[derive(Debug, Error)]
pub enum TransportError {
	#[error("network error: {0}")]
	Network(String),

	#[error("remote returned status {status}: {body}")]
	Status { status: u16, body: String },

	#[error("remote reported conflicts on {} field(s)", conflicts.conflicting_fields.len())]
	Conflict { conflicts: ConflictData },

	#[error("unsupported operation: {0}")]
	Unsupported(String),

	#[error("failed to decode response: {0}")]
	Decode(String),
}

impl TransportError {
	/// HTTP-equivalent status for classification. Connectivity and decode
	/// failures carry none.
	pub fn status_code(&self) -> Option<u16> {
		match self {
			TransportError::Status { status, .. } => Some(*status),
			TransportError::Conflict { .. } => Some(409),
			TransportError::Unsupported(_) => Some(400),
			TransportError::Network(_) | TransportError::Decode(_) => None,
		}
	}
}

impl From<reqwest::Error> for TransportError {
	fn from(e: reqwest::Error) -> Self {
		if e.is_decode() {
			TransportError::Decode(e.to_string())
		} else if let Some(status) = e.status() {
			TransportError::Status {
				status: status.as_u16(),
				body: e.to_string(),
			}
		} else {
			TransportError::Network(e.to_string())
		}
	}
}

/// Invalid conflict resolver configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolverConfigError {
	#[error(
		"rules for {rules:?} use prompt_user but no prompt callback is registered; register one or allow the merge fallback explicitly"
	)]
	MissingPromptCallback { rules: Vec<String> },
}

/// Errors surfaced by the orchestrator's public API.
#[derive(Debug, Error)]
pub enum SyncError {
	#[error(transparent)]
	Store(#[from] StoreError),

	#[error(transparent)]
	Transport(#[from] TransportError),

	#[error("cannot sync while offline")]
	Offline,

	#[error("invalid configuration: {0}")]
	Config(#[from] ResolverConfigError),

	#[error("background task failed: {0}")]
	Task(String),
}

/// How a failed delivery is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
	/// Connectivity loss or server error; retried with backoff.
	Transient,
	/// Rejected by the remote store; dropped.
	Client,
	/// Carries field-level conflicts; resolved before any retry decision.
	Conflict,
	/// Durable store refused a write for size.
	StorageCapacity,
	/// Retry budget spent; dropped.
	ExhaustedRetries,
}

impl FailureKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			FailureKind::Transient => "transient",
			FailureKind::Client => "client",
			FailureKind::Conflict => "conflict",
			FailureKind::StorageCapacity => "storage_capacity",
			FailureKind::ExhaustedRetries => "exhausted_retries",
		}
	}
}

/// Returns false for failures the remote store will keep rejecting.
pub fn should_retry(message: Option<&str>, status: Option<u16>) -> bool {
	if let Some(code) = status {
		if NON_RETRYABLE_STATUS.contains(&code) {
			return false;
		}
	}
	!message.is_some_and(|m| NON_RETRYABLE_MESSAGE.is_match(m))
}

/// Classify a failure that carries no conflicts.
pub fn classify_failure(message: Option<&str>, status: Option<u16>) -> FailureKind {
	if should_retry(message, status) {
		FailureKind::Transient
	} else {
		FailureKind::Client
	}
}
