use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use log::debug;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

use super::conflict::ConflictData;
use super::error::TransportError;
use super::types::{OperationType, QueuedOperation, ResourceKind};

/// Payload fields rewritten to RFC 3339 UTC before dispatch.
pub const DATE_FIELDS: [&str; 6] = [
	"start_date",
	"end_date",
	"created_at",
	"updated_at",
	"startDate",
	"endDate",
];

/// One operation inside a batch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOperation {
	pub id: String,
	#[serde(rename = "type")]
	pub op_type: OperationType,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub resource_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
	pub timestamp: i64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub mutation_id: Option<String>,
}

impl From<&QueuedOperation> for WireOperation {
	fn from(op: &QueuedOperation) -> Self {
		Self {
			id: op.id.clone(),
			op_type: op.op_type,
			resource_id: op.resource_id.clone(),
			data: op.payload.clone(),
			timestamp: op.timestamp,
			mutation_id: Some(op.mutation_id.clone()),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
	pub operations: Vec<WireOperation>,
}

/// Per-operation outcome reported by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
	pub operation_id: String,
	pub success: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub conflicts: Option<ConflictData>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub status_code: Option<u16>,
}

impl OperationResult {
	pub fn ok(operation_id: impl Into<String>) -> Self {
		Self {
			operation_id: operation_id.into(),
			success: true,
			error: None,
			conflicts: None,
			status_code: None,
		}
	}

	pub fn failed(operation_id: impl Into<String>, error: impl Into<String>, status_code: Option<u16>) -> Self {
		Self {
			operation_id: operation_id.into(),
			success: false,
			error: Some(error.into()),
			conflicts: None,
			status_code,
		}
	}

	pub fn conflict(operation_id: impl Into<String>, conflicts: ConflictData) -> Self {
		Self {
			operation_id: operation_id.into(),
			success: false,
			error: Some("conflict".to_string()),
			conflicts: Some(conflicts),
			status_code: Some(409),
		}
	}

	pub fn from_error(operation_id: impl Into<String>, error: TransportError) -> Self {
		match error {
			TransportError::Conflict { conflicts } => Self::conflict(operation_id, conflicts),
			other => {
				let status = other.status_code();
				Self::failed(operation_id, other.to_string(), status)
			}
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
	#[serde(default)]
	pub results: Vec<OperationResult>,
}

/// Delivery of operations to the remote store.
///
/// Timeouts are the implementation's responsibility.
#[async_trait]
pub trait NetworkTransport: Send + Sync + 'static {
	/// Whether `(op_type, resource)` groups go through `send_batch`.
	fn supports_batch(&self, op_type: OperationType, resource: ResourceKind) -> bool;

	async fn send_batch(
		&self,
		resource: ResourceKind,
		operations: &[WireOperation],
	) -> Result<Vec<OperationResult>, TransportError>;

	/// Deliver one operation through the resource's single endpoint,
	/// returning the remote record when one is sent back.
	async fn send_one(&self, operation: &QueuedOperation) -> Result<Option<Value>, TransportError>;
}

/// Rewrite recognised date fields to RFC 3339 UTC. Values that parse as
/// neither RFC 3339 nor `YYYY-MM-DD` are left untouched.
pub fn normalize_payload(payload: &Value) -> Value {
	let mut out = payload.clone();
	if let Some(map) = out.as_object_mut() {
		for field in DATE_FIELDS {
			let normalized = match map.get(field) {
				Some(Value::String(raw)) => normalize_date(raw),
				_ => None,
			};
			if let Some(normalized) = normalized {
				map.insert(field.to_string(), Value::String(normalized));
			}
		}
	}
	out
}

fn normalize_date(raw: &str) -> Option<String> {
	let raw = raw.trim();
	if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
		return Some(dt.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Millis, true));
	}
	let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
	let dt = date.and_hms_opt(0, 0, 0)?.and_utc();
	Some(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// REST transport over `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
	client: reqwest::Client,
	base_url: Url,
	token: Option<String>,
	batch_resources: HashSet<ResourceKind>,
}

impl HttpTransport {
	pub fn builder(base_url: Url) -> HttpTransportBuilder {
		HttpTransportBuilder::new(base_url)
	}

	fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
		self.base_url
			.join(path)
			.map_err(|e| TransportError::Unsupported(format!("invalid endpoint '{}': {}", path, e)))
	}

	/// `api/{plural}` plus the id as one escaped path segment.
	fn resource_url(&self, resource: ResourceKind, id: Option<&str>) -> Result<Url, TransportError> {
		let mut url = self.endpoint(&format!("api/{}", resource.plural()))?;
		if let Some(id) = id {
			url.path_segments_mut()
				.map_err(|_| TransportError::Unsupported(format!("base URL {} cannot take a path", self.base_url)))?
				.push(id);
		}
		Ok(url)
	}

	fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
		let req = self.client.request(method, url);
		match &self.token {
			Some(token) => req.bearer_auth(token),
			None => req,
		}
	}

	async fn read_error(response: reqwest::Response) -> TransportError {
		let status = response.status();
		let body = response.text().await.unwrap_or_default();
		if status == StatusCode::CONFLICT {
			if let Ok(parsed) = serde_json::from_str::<Value>(&body) {
				if let Some(conflicts) = parsed
					.get("conflicts")
					.cloned()
					.and_then(|c| serde_json::from_value::<ConflictData>(c).ok())
				{
					return TransportError::Conflict { conflicts };
				}
			}
		}
		TransportError::Status {
			status: status.as_u16(),
			body,
		}
	}
}

#[async_trait]
impl NetworkTransport for HttpTransport {
	fn supports_batch(&self, op_type: OperationType, resource: ResourceKind) -> bool {
		op_type != OperationType::Patch && self.batch_resources.contains(&resource)
	}

	async fn send_batch(
		&self,
		resource: ResourceKind,
		operations: &[WireOperation],
	) -> Result<Vec<OperationResult>, TransportError> {
		let url = self.endpoint(&format!("api/{}/batch", resource.plural()))?;
		debug!("POST {} ({} operations)", url, operations.len());

		let response = self
			.request(Method::POST, url)
			.json(&json!({ "operations": operations }))
			.send()
			.await?;

		if !response.status().is_success() {
			return Err(Self::read_error(response).await);
		}

		let body: BatchResponse = response
			.json()
			.await
			.map_err(|e| TransportError::Decode(e.to_string()))?;
		Ok(body.results)
	}

	async fn send_one(&self, operation: &QueuedOperation) -> Result<Option<Value>, TransportError> {
		let resource = operation.resource;
		let (method, url) = match (operation.op_type, operation.resource_id.as_deref()) {
			(OperationType::Create, _) => (Method::POST, self.resource_url(resource, None)?),
			(OperationType::Update, Some(id)) => (Method::PUT, self.resource_url(resource, Some(id))?),
			(OperationType::Patch, Some(id)) => (Method::PATCH, self.resource_url(resource, Some(id))?),
			(OperationType::Delete, Some(id)) => (Method::DELETE, self.resource_url(resource, Some(id))?),
			(op_type, None) => {
				return Err(TransportError::Unsupported(format!(
					"{} {} requires a resource id",
					op_type, operation.resource
				)));
			}
		};

		debug!("{} {} ({})", method, url, operation.mutation_id);

		let mut req = self
			.request(method, url)
			.header("Idempotency-Key", operation.mutation_id.as_str());
		if operation.op_type != OperationType::Delete {
			let mut body = operation.payload.clone().unwrap_or_else(|| json!({}));
			if let Some(map) = body.as_object_mut() {
				map.insert(
					"clientMutationId".to_string(),
					Value::String(operation.mutation_id.clone()),
				);
			}
			req = req.json(&body);
		}

		let response = req.send().await?;
		if !response.status().is_success() {
			return Err(Self::read_error(response).await);
		}
		if response.status() == StatusCode::NO_CONTENT {
			return Ok(None);
		}

		let text = response.text().await?;
		if text.trim().is_empty() {
			return Ok(None);
		}
		serde_json::from_str(&text)
			.map(Some)
			.map_err(|e| TransportError::Decode(e.to_string()))
	}
}

/// Builder for [`HttpTransport`].
pub struct HttpTransportBuilder {
	base_url: Url,
	token: Option<String>,
	timeout: Duration,
	batch_resources: HashSet<ResourceKind>,
}

impl HttpTransportBuilder {
	pub fn new(base_url: Url) -> Self {
		Self {
			base_url,
			token: None,
			timeout: Duration::from_secs(30),
			batch_resources: HashSet::from([ResourceKind::Trip]),
		}
	}

	pub fn with_token(mut self, token: Option<String>) -> Self {
		self.token = token.filter(|t| !t.is_empty());
		self
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	/// Resources with a `/batch` endpoint (default: trips).
	pub fn with_batch_resources(mut self, resources: impl IntoIterator<Item = ResourceKind>) -> Self {
		self.batch_resources = resources.into_iter().collect();
		self
	}

	pub fn build(self) -> Result<HttpTransport, TransportError> {
		let client = reqwest::Client::builder()
			.timeout(self.timeout)
			.build()
			.map_err(|e| TransportError::Network(e.to_string()))?;

		// `Url::join` replaces the last segment unless the base ends in '/'.
		let mut base_url = self.base_url;
		if !base_url.path().ends_with('/') {
			let path = format!("{}/", base_url.path());
			base_url.set_path(&path);
		}

		Ok(HttpTransport {
			client,
			base_url,
			token: self.token,
			batch_resources: self.batch_resources,
		})
	}
}
