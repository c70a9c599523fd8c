//! Secret store for MCP auth records.
//!
//! A single JSON blob maps server keys (see [super::server_key]) to their
//! [McpAuthRecord]. The file implementation is the persistent store; the
//! memory implementation backs tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use super::{AuthError, McpAuthRecord, Result};

/// Credential storage trait
#[async_trait]
pub trait CredentialStorage: Send + Sync {
  /// Load the record for a server key
  async fn load(&self, key: &str) -> Result<Option<McpAuthRecord>>;

  /// Save a record
  async fn save(&self, key: &str, record: McpAuthRecord) -> Result<()>;

  /// Delete a record
  async fn delete(&self, key: &str) -> Result<()>;

  /// List all stored server keys
  async fn list(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AuthStore {
  #[serde(default)]
  servers: HashMap<String, McpAuthRecord>,
}

/// File-backed storage.
pub struct FileCredentialStorage {
  storage_path: PathBuf,
}

impl FileCredentialStorage {
  pub fn new(storage_path: impl AsRef<Path>) -> Self {
    Self {
      storage_path: storage_path.as_ref().to_path_buf(),
    }
  }

  pub fn default_path() -> Result<PathBuf> {
    let home = dirs::home_dir()
      .ok_or_else(|| AuthError::Storage("no home directory found".to_string()))?;
    Ok(home.join(".llmux").join("mcp-auth.json"))
  }

  pub fn default_storage() -> Result<Self> {
    Ok(Self::new(Self::default_path()?))
  }

  fn load_file(&self) -> Result<AuthStore> {
    if !self.storage_path.exists() {
      return Ok(AuthStore::default());
    }
    let content = std::fs::read_to_string(&self.storage_path)
      .map_err(|e| AuthError::Storage(format!("failed to read auth file: {e}")))?;
    let store: AuthStore = serde_json::from_str(&content)
      .map_err(|e| AuthError::Storage(format!("failed to parse auth file: {e}")))?;
    Ok(store)
  }

  fn save_file(&self, store: &AuthStore) -> Result<()> {
    if let Some(parent) = self.storage_path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| AuthError::Storage(format!("failed to create auth directory: {e}")))?;
    }
    let content = serde_json::to_string_pretty(store)
      .map_err(|e| AuthError::Storage(format!("failed to serialize auth store: {e}")))?;
    std::fs::write(&self.storage_path, content)
      .map_err(|e| AuthError::Storage(format!("failed to write auth file: {e}")))?;
    Ok(())
  }
}

#[async_trait]
impl CredentialStorage for FileCredentialStorage {
  async fn load(&self, key: &str) -> Result<Option<McpAuthRecord>> {
    Ok(self.load_file()?.servers.get(key).cloned())
  }

  async fn save(&self, key: &str, record: McpAuthRecord) -> Result<()> {
    let mut store = self.load_file()?;
    store.servers.insert(key.to_string(), record);
    self.save_file(&store)
  }

  async fn delete(&self, key: &str) -> Result<()> {
    let mut store = self.load_file()?;
    store.servers.remove(key);
    self.save_file(&store)
  }

  async fn list(&self) -> Result<Vec<String>> {
    Ok(self.load_file()?.servers.keys().cloned().collect())
  }
}

/// In-memory storage.
#[derive(Default)]
pub struct MemoryCredentialStorage {
  servers: RwLock<HashMap<String, McpAuthRecord>>,
}

impl MemoryCredentialStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl CredentialStorage for MemoryCredentialStorage {
  async fn load(&self, key: &str) -> Result<Option<McpAuthRecord>> {
    Ok(self.servers.read().await.get(key).cloned())
  }

  async fn save(&self, key: &str, record: McpAuthRecord) -> Result<()> {
    self.servers.write().await.insert(key.to_string(), record);
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<()> {
    self.servers.write().await.remove(key);
    Ok(())
  }

  async fn list(&self) -> Result<Vec<String>> {
    Ok(self.servers.read().await.keys().cloned().collect())
  }
}
