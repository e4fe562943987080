use log::Level;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

use crate::sync::{AdaptiveConfig, QueueConfig, SyncConfig};

/// Runtime configuration for the sync engine.
///
/// Values are loaded from (in order): `/etc/itinerary-sync/config.json`,
/// `itinerary-sync/config.json` in the user config folder (both optional),
/// and environment variables prefixed with `ISYNC_` using `__` for nesting
/// (e.g. `ISYNC_SYNC__BATCH_SIZE`).
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(default)]
pub struct Settings {
	pub log_level: Level,
	pub api_base_url: Url,
	pub api_token: Option<String>,
	/// Directory holding the durable queue snapshot and spilled chunks.
	pub store_dir: PathBuf,
	pub store_quota_bytes: Option<usize>,
	pub queue_key: String,
	/// Recorded on every queued operation; part of the dedup key.
	pub actor_id: String,
	pub sync: SyncConfig,
	pub queue: QueueConfig,
	pub adaptive: AdaptiveConfig,
	pub conflict: ConflictSettings,
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct ConflictSettings {
	/// Merge `prompt_user` fields when no prompt callback is registered.
	pub allow_prompt_fallback: bool,
	pub default_rules: bool,
}

impl Default for ConflictSettings {
	fn default() -> Self {
		Self {
			allow_prompt_fallback: true,
			default_rules: true,
		}
	}
}

impl Default for Settings {
	fn default() -> Self {
		let actor_id = hostname::get()
			.ok()
			.and_then(|s| s.into_string().ok())
			.unwrap_or_else(|| "local".to_string());
		let store_dir = dirs::data_local_dir()
			.map(|d| d.join("itinerary-sync"))
			.unwrap_or_else(|| PathBuf::from(".itinerary-sync"));

		Self {
			log_level: Level::Info,
			api_base_url: Url::parse("http://localhost:8080/").expect("default API URL is valid"),
			api_token: None,
			store_dir,
			store_quota_bytes: None,
			queue_key: "sync_queue".to_string(),
			actor_id,
			sync: SyncConfig::default(),
			queue: QueueConfig::default(),
			adaptive: AdaptiveConfig::default(),
			conflict: ConflictSettings::default(),
		}
	}
}

#[derive(Debug, Error)]
pub enum SettingsError {
	#[error("configuration error: {0}")]
	Config(#[from] config::ConfigError),
}

pub fn load() -> Result<Settings, SettingsError> {
	let mut builder = config::Config::builder()
		.add_source(config::File::with_name("/etc/itinerary-sync/config.json").required(false));

	if let Some(folder) = dirs::config_dir() {
		let user_config_path = folder.join("itinerary-sync").join("config.json");
		builder = builder.add_source(config::File::from(user_config_path).required(false));
	}

	builder = builder.add_source(
		config::Environment::with_prefix("ISYNC")
			.prefix_separator("_")
			.separator("__"),
	);

	let cfg = builder.build()?;

	let mut s: Settings = cfg.try_deserialize()?;

	// Explicitly prefer direct environment variables when present.
	if let Ok(l) = std::env::var("ISYNC_LOG_LEVEL") {
		if let Ok(parsed) = l.parse::<Level>() {
			s.log_level = parsed;
		}
	}
	if let Ok(u) = std::env::var("ISYNC_API_BASE_URL") {
		if let Ok(parsed) = Url::parse(&u) {
			s.api_base_url = parsed;
		}
	}
	if let Ok(t) = std::env::var("ISYNC_API_TOKEN") {
		if !t.is_empty() {
			s.api_token = Some(t);
		}
	}
	if let Ok(d) = std::env::var("ISYNC_STORE_DIR") {
		if !d.is_empty() {
			s.store_dir = PathBuf::from(d);
		}
	}
	if let Ok(a) = std::env::var("ISYNC_ACTOR_ID") {
		if !a.is_empty() {
			s.actor_id = a;
		}
	}

	Ok(s)
}
