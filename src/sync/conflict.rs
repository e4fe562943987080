use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use super::error::ResolverConfigError;
use super::merge::{DEFAULT_IGNORED_FIELDS, detect_conflicts, get_path, merge_values, set_path};
use super::types::{OperationType, QueuedOperation, ResourceKind};

/// How a conflicting field is settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
	ServerWins,
	ClientWins,
	#[default]
	Merge,
	PromptUser,
}

impl ConflictStrategy {
	pub fn as_str(&self) -> &'static str {
		match self {
			ConflictStrategy::ServerWins => "server_wins",
			ConflictStrategy::ClientWins => "client_wins",
			ConflictStrategy::Merge => "merge",
			ConflictStrategy::PromptUser => "prompt_user",
		}
	}

	/// Default for fields without a rule: creates and deletes express
	/// explicit intent, updates merge, patches use `patch_default`.
	pub fn default_for(op_type: OperationType, patch_default: ConflictStrategy) -> Self {
		match op_type {
			OperationType::Create | OperationType::Delete => ConflictStrategy::ClientWins,
			OperationType::Update => ConflictStrategy::Merge,
			OperationType::Patch => patch_default,
		}
	}
}

impl fmt::Display for ConflictStrategy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// What a custom resolver sees besides the two values.
pub struct ResolutionContext<'a> {
	pub operation: &'a QueuedOperation,
	pub field: &'a str,
}

pub type CustomResolver = Arc<dyn Fn(&Value, &Value, &ResolutionContext<'_>) -> Value + Send + Sync>;

/// Per-resource, per-field resolution rule.
#[derive(Clone)]
pub struct ConflictRule {
	pub resource: ResourceKind,
	pub field: String,
	pub strategy: ConflictStrategy,
	pub custom_resolver: Option<CustomResolver>,
}

impl ConflictRule {
	pub fn new(resource: ResourceKind, field: impl Into<String>, strategy: ConflictStrategy) -> Self {
		Self {
			resource,
			field: field.into(),
			strategy,
			custom_resolver: None,
		}
	}

	/// Resolve this field with `resolver(client, server, context)` instead
	/// of the strategy.
	pub fn with_resolver<F>(mut self, resolver: F) -> Self
	where
		F: Fn(&Value, &Value, &ResolutionContext<'_>) -> Value + Send + Sync + 'static,
	{
		self.custom_resolver = Some(Arc::new(resolver));
		self
	}

	fn key(&self) -> (ResourceKind, String) {
		(self.resource, self.field.clone())
	}
}

impl fmt::Debug for ConflictRule {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConflictRule")
			.field("resource", &self.resource)
			.field("field", &self.field)
			.field("strategy", &self.strategy)
			.field("custom_resolver", &self.custom_resolver.is_some())
			.finish()
	}
}

/// Two versions of one resource and the fields where they disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictData {
	#[serde(default)]
	pub client_version: Value,
	#[serde(default)]
	pub server_version: Value,
	#[serde(default)]
	pub conflicting_fields: Vec<String>,
}

impl ConflictData {
	/// Diff two versions, ignoring volatile metadata fields.
	pub fn new(client_version: Value, server_version: Value) -> Self {
		let conflicting_fields =
			detect_conflicts(&client_version, &server_version, &DEFAULT_IGNORED_FIELDS);
		Self {
			client_version,
			server_version,
			conflicting_fields,
		}
	}

	/// Fill in `conflicting_fields` when the reporter left it empty.
	pub fn with_detected_fields(mut self) -> Self {
		if self.conflicting_fields.is_empty() {
			self.conflicting_fields = detect_conflicts(
				&self.client_version,
				&self.server_version,
				&DEFAULT_IGNORED_FIELDS,
			);
		}
		self
	}
}

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConflict {
	pub data: Value,
	pub strategy: ConflictStrategy,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub merged_fields: Vec<String>,
}

/// Asks a human (or any external authority) to settle `prompt_user` fields.
#[async_trait]
pub trait ConflictPrompt: Send + Sync + 'static {
	async fn resolve(
		&self,
		conflict: &ConflictData,
		operation: &QueuedOperation,
	) -> anyhow::Result<ResolvedConflict>;
}

/// "3 conflicting fields: endDate, status, title"
pub fn conflict_summary(conflict: &ConflictData) -> String {
	match conflict.conflicting_fields.len() {
		0 => "no conflicting fields".to_string(),
		1 => format!("1 conflicting field: {}", conflict.conflicting_fields[0]),
		n => format!(
			"{} conflicting fields: {}",
			n,
			conflict.conflicting_fields.join(", ")
		),
	}
}

/// Rules shipped for trips and activities.
pub fn default_rules() -> Vec<ConflictRule> {
	vec![
		ConflictRule::new(ResourceKind::Trip, "title", ConflictStrategy::ClientWins),
		ConflictRule::new(ResourceKind::Trip, "participants", ConflictStrategy::Merge)
			.with_resolver(|client, server, _| merge_values(client, server)),
		ConflictRule::new(ResourceKind::Trip, "status", ConflictStrategy::ServerWins),
		ConflictRule::new(ResourceKind::Trip, "startDate", ConflictStrategy::PromptUser),
		ConflictRule::new(ResourceKind::Trip, "endDate", ConflictStrategy::PromptUser),
		ConflictRule::new(ResourceKind::Activity, "notes", ConflictStrategy::Merge)
			.with_resolver(|client, server, _| join_notes(client, server)),
	]
}

/// Keep both sides of diverging free text, server first.
fn join_notes(client: &Value, server: &Value) -> Value {
	match (client.as_str(), server.as_str()) {
		(Some(c), Some(s)) if c.contains(s) => client.clone(),
		(Some(c), Some(s)) if s.contains(c) => server.clone(),
		(Some(c), Some(s)) => Value::String(format!("{}\n\n{}", s, c)),
		_ => merge_values(client, server),
	}
}

/// Builder for [`ConflictResolver`].
#[derive(Default)]
pub struct ConflictResolverBuilder {
	rules: Vec<ConflictRule>,
	prompt: Option<Arc<dyn ConflictPrompt>>,
	allow_prompt_fallback: bool,
	patch_default: ConflictStrategy,
}

impl ConflictResolverBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_default_rules(mut self) -> Self {
		self.rules.extend(default_rules());
		self
	}

	/// Add a rule; a later rule for the same resource and field replaces
	/// the earlier one.
	pub fn add_rule(mut self, rule: ConflictRule) -> Self {
		self.rules.push(rule);
		self
	}

	pub fn with_prompt(mut self, prompt: Arc<dyn ConflictPrompt>) -> Self {
		self.prompt = Some(prompt);
		self
	}

	/// Permit `prompt_user` rules without a callback; those fields are then
	/// merged and a warning is logged each time.
	pub fn allow_prompt_fallback(mut self, allow: bool) -> Self {
		self.allow_prompt_fallback = allow;
		self
	}

	/// Strategy for patch operations on fields without a rule.
	pub fn with_default_strategy(mut self, strategy: ConflictStrategy) -> Self {
		self.patch_default = strategy;
		self
	}

	pub fn build(self) -> Result<ConflictResolver, ResolverConfigError> {
		let mut rules = HashMap::new();
		for rule in self.rules {
			rules.insert(rule.key(), rule);
		}

		if self.prompt.is_none() && !self.allow_prompt_fallback {
			let mut prompting: Vec<String> = rules
				.values()
				.filter(|r| r.strategy == ConflictStrategy::PromptUser && r.custom_resolver.is_none())
				.map(|r| format!("{}.{}", r.resource, r.field))
				.collect();
			if self.patch_default == ConflictStrategy::PromptUser {
				prompting.push("patch default".to_string());
			}
			if !prompting.is_empty() {
				prompting.sort();
				return Err(ResolverConfigError::MissingPromptCallback { rules: prompting });
			}
		}

		Ok(ConflictResolver {
			rules,
			prompt: self.prompt,
			patch_default: self.patch_default,
		})
	}
}

/// Field-level reconciliation of a client operation with the server's
/// current version. Rules are fixed once built.
pub struct ConflictResolver {
	rules: HashMap<(ResourceKind, String), ConflictRule>,
	prompt: Option<Arc<dyn ConflictPrompt>>,
	patch_default: ConflictStrategy,
}

impl fmt::Debug for ConflictResolver {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConflictResolver")
			.field("rules", &self.rules.len())
			.field("prompt", &self.prompt.is_some())
			.field("patch_default", &self.patch_default)
			.finish()
	}
}

impl ConflictResolver {
	pub fn builder() -> ConflictResolverBuilder {
		ConflictResolverBuilder::new()
	}

	/// Rule for `field` on `resource`, falling back to the rule on the
	/// field's top-level segment for dotted paths.
	pub fn rule_for(&self, resource: ResourceKind, field: &str) -> Option<&ConflictRule> {
		self.rules.get(&(resource, field.to_string())).or_else(|| {
			field
				.split_once('.')
				.and_then(|(head, _)| self.rules.get(&(resource, head.to_string())))
		})
	}

	/// Strategy that would settle `field` for `operation`, before any prompt
	/// fallback.
	pub fn strategy_for(&self, operation: &QueuedOperation, field: &str) -> ConflictStrategy {
		self.rule_for(operation.resource, field)
			.map(|r| r.strategy)
			.unwrap_or_else(|| ConflictStrategy::default_for(operation.op_type, self.patch_default))
	}

	/// Settle every conflicting field. Returns `None` when the prompt
	/// callback fails.
	pub async fn resolve(
		&self,
		operation: &QueuedOperation,
		conflict: &ConflictData,
	) -> Option<ResolvedConflict> {
		let client = &conflict.client_version;
		let server = &conflict.server_version;

		if conflict.conflicting_fields.is_empty() {
			let mut strategy = ConflictStrategy::default_for(operation.op_type, self.patch_default);
			if strategy == ConflictStrategy::PromptUser {
				if let Some(prompt) = &self.prompt {
					return self.ask(prompt.as_ref(), conflict, operation).await;
				}
				warn!(
					"No prompt callback for {}; merging whole document",
					operation.describe()
				);
				strategy = ConflictStrategy::Merge;
			}
			let data = apply_strategy(strategy, client, server);
			return Some(ResolvedConflict {
				data,
				strategy,
				merged_fields: Vec::new(),
			});
		}

		let mut data = if client.is_object() {
			client.clone()
		} else {
			Value::Object(Default::default())
		};
		let mut used: BTreeMap<String, ConflictStrategy> = BTreeMap::new();
		let mut merged_fields = Vec::new();
		let mut prompt_fields = Vec::new();

		for field in &conflict.conflicting_fields {
			let cv = get_path(client, field).cloned().unwrap_or(Value::Null);
			let sv = get_path(server, field).cloned().unwrap_or(Value::Null);
			let rule = self.rule_for(operation.resource, field);

			if let Some(custom) = rule.and_then(|r| r.custom_resolver.as_ref()) {
				let ctx = ResolutionContext { operation, field };
				set_path(&mut data, field, Some(custom(&cv, &sv, &ctx)));
				let strategy = rule.map(|r| r.strategy).unwrap_or_default();
				if strategy == ConflictStrategy::Merge {
					merged_fields.push(field.clone());
				}
				used.insert(field.clone(), strategy);
				continue;
			}

			let mut strategy = self.strategy_for(operation, field);
			if strategy == ConflictStrategy::PromptUser {
				if self.prompt.is_some() {
					prompt_fields.push(field.clone());
					used.insert(field.clone(), strategy);
					continue;
				}
				warn!(
					"No prompt callback for {} field '{}'; falling back to merge",
					operation.describe(),
					field
				);
				strategy = ConflictStrategy::Merge;
			}

			let value = apply_strategy(strategy, &cv, &sv);
			set_path(&mut data, field, (!value.is_null()).then_some(value));
			if strategy == ConflictStrategy::Merge {
				merged_fields.push(field.clone());
			}
			used.insert(field.clone(), strategy);
		}

		if let Some(prompt) = &self.prompt {
			if !prompt_fields.is_empty() {
				let pending = ConflictData {
					client_version: client.clone(),
					server_version: server.clone(),
					conflicting_fields: prompt_fields.clone(),
				};
				let answer = self.ask(prompt.as_ref(), &pending, operation).await?;
				for field in &prompt_fields {
					if let Some(value) = get_path(&answer.data, field) {
						set_path(&mut data, field, Some(value.clone()));
						continue;
					}
					// Fields the answer leaves out are merged.
					let cv = get_path(client, field).cloned().unwrap_or(Value::Null);
					let sv = get_path(server, field).cloned().unwrap_or(Value::Null);
					let value = merge_values(&cv, &sv);
					set_path(&mut data, field, (!value.is_null()).then_some(value));
					merged_fields.push(field.clone());
					used.insert(field.clone(), ConflictStrategy::Merge);
				}
			}
		}

		let mut strategies = used.values().copied();
		let first = strategies.next().unwrap_or_default();
		let strategy = if strategies.all(|s| s == first) {
			first
		} else {
			ConflictStrategy::Merge
		};

		info!(
			"Resolved {} for {} using {}",
			conflict_summary(conflict),
			operation.describe(),
			strategy
		);

		Some(ResolvedConflict {
			data,
			strategy,
			merged_fields,
		})
	}

	async fn ask(
		&self,
		prompt: &dyn ConflictPrompt,
		conflict: &ConflictData,
		operation: &QueuedOperation,
	) -> Option<ResolvedConflict> {
		debug!(
			"Prompting for {} on {}",
			conflict_summary(conflict),
			operation.describe()
		);
		match prompt.resolve(conflict, operation).await {
			Ok(resolved) => Some(resolved),
			Err(e) => {
				warn!("Conflict prompt failed for {}: {}", operation.describe(), e);
				None
			}
		}
	}
}

fn apply_strategy(strategy: ConflictStrategy, client: &Value, server: &Value) -> Value {
	match strategy {
		ConflictStrategy::ServerWins => server.clone(),
		ConflictStrategy::ClientWins => client.clone(),
		ConflictStrategy::Merge | ConflictStrategy::PromptUser => merge_values(client, server),
	}
}
