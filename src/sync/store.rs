use async_trait::async_trait;
use log::debug;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::error::StoreError;

/// Key/value persistence surviving process restarts.
///
/// Implementations replace a key's blob atomically: a reader sees either
/// the previous blob or the new one, never a partial write.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
	async fn set(&self, key: &str, blob: Vec<u8>) -> Result<(), StoreError>;
	async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// In-process store with an optional byte quota across all keys.
#[derive(Debug, Default)]
pub struct MemoryStore {
	entries: Mutex<HashMap<String, Vec<u8>>>,
	quota_bytes: Option<usize>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_quota(quota_bytes: usize) -> Self {
		Self {
			entries: Mutex::new(HashMap::new()),
			quota_bytes: Some(quota_bytes),
		}
	}

	/// Total bytes currently stored.
	pub async fn usage(&self) -> usize {
		self.entries.lock().await.values().map(Vec::len).sum()
	}

	pub async fn keys(&self) -> Vec<String> {
		let mut keys: Vec<String> = self.entries.lock().await.keys().cloned().collect();
		keys.sort();
		keys
	}
}

#[async_trait]
impl DurableStore for MemoryStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
		Ok(self.entries.lock().await.get(key).cloned())
	}

	async fn set(&self, key: &str, blob: Vec<u8>) -> Result<(), StoreError> {
		let mut entries = self.entries.lock().await;
		if let Some(limit) = self.quota_bytes {
			let others: usize = entries
				.iter()
				.filter(|(k, _)| k.as_str() != key)
				.map(|(_, v)| v.len())
				.sum();
			let needed = others + blob.len();
			if needed > limit {
				return Err(StoreError::Capacity {
					key: key.to_string(),
					needed,
					limit,
				});
			}
		}
		entries.insert(key.to_string(), blob);
		Ok(())
	}

	async fn remove(&self, key: &str) -> Result<(), StoreError> {
		self.entries.lock().await.remove(key);
		Ok(())
	}
}

/// One file per key under a directory. Writes go to a temporary sibling
/// and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileStore {
	dir: PathBuf,
	quota_bytes: Option<usize>,
}

impl FileStore {
	/// Open (creating if needed) a store rooted at `dir`.
	pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
		let dir = dir.into();
		tokio::fs::create_dir_all(&dir).await?;
		Ok(Self {
			dir,
			quota_bytes: None,
		})
	}

	pub fn with_quota(mut self, quota_bytes: Option<usize>) -> Self {
		self.quota_bytes = quota_bytes;
		self
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	fn path_for(&self, key: &str) -> PathBuf {
		self.dir.join(format!("{}.json", encode_key(key)))
	}

	async fn usage_excluding(&self, exclude: &Path) -> Result<usize, StoreError> {
		let mut total = 0usize;
		let mut entries = tokio::fs::read_dir(&self.dir).await?;
		while let Some(entry) = entries.next_entry().await? {
			let path = entry.path();
			if path == exclude || path.extension().is_some_and(|e| e == "tmp") {
				continue;
			}
			total += entry.metadata().await?.len() as usize;
		}
		Ok(total)
	}
}

#[async_trait]
impl DurableStore for FileStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
		match tokio::fs::read(self.path_for(key)).await {
			Ok(bytes) => Ok(Some(bytes)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	async fn set(&self, key: &str, blob: Vec<u8>) -> Result<(), StoreError> {
		let path = self.path_for(key);
		if let Some(limit) = self.quota_bytes {
			let needed = self.usage_excluding(&path).await? + blob.len();
			if needed > limit {
				return Err(StoreError::Capacity {
					key: key.to_string(),
					needed,
					limit,
				});
			}
		}

		let tmp = path.with_extension("tmp");
		tokio::fs::write(&tmp, &blob).await?;
		tokio::fs::rename(&tmp, &path).await?;
		debug!("Persisted {} bytes to {}", blob.len(), path.display());
		Ok(())
	}

	async fn remove(&self, key: &str) -> Result<(), StoreError> {
		match tokio::fs::remove_file(self.path_for(key)).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}
}

/// Bytes kept verbatim in file names: ASCII alphanumerics, '-' and '_'.
const FILE_NAME: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

/// Keys map onto file names with every other byte written as `%XX`.
fn encode_key(key: &str) -> String {
	if key.is_empty() {
		return "%00".to_string();
	}
	utf8_percent_encode(key, FILE_NAME).to_string()
}
