//! Persisted command repository (`YAKETYYAK.json`)
//!
//! One writer at a time: every mutation holds the write guard until the
//! document is durably on disk, so readers never observe a state that was
//! not persisted.

use bench_shared::descriptor::IngestError;
use bench_shared::persist::{read_json, write_json_atomic, StoreError};
use bench_shared::{topics, CommandTree, LookupError, ResolvedCommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Topic '{0}' is not a repository topic")]
    ForeignTopic(String),
}

pub struct CommandRepository {
    tree: RwLock<CommandTree>,
    path: PathBuf,
}

impl CommandRepository {
    /// Open the repository at `path`; a missing or unreadable document starts empty
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let tree = if path.exists() {
            match read_json::<Value>(&path)
                .map_err(RepositoryError::from)
                .and_then(|doc| CommandTree::from_value(doc).map_err(RepositoryError::from))
            {
                Ok(tree) => {
                    info!("[YAK] Loaded repository from {}", path.display());
                    tree
                }
                Err(e) => {
                    warn!("[YAK] Ignoring unreadable repository {}: {}", path.display(), e);
                    CommandTree::new()
                }
            }
        } else {
            info!("[YAK] No repository at {}, starting empty", path.display());
            CommandTree::new()
        };

        Self {
            tree: RwLock::new(tree),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write or merge `value` at `path` and persist before returning
    pub async fn ingest<S: AsRef<str>>(&self, path: &[S], value: Value) -> Result<(), RepositoryError> {
        let mut tree = self.tree.write().await;
        tree.ingest(path, value)?;
        self.persist(&tree)?;
        debug!("[YAK] Stored '{}'", topics::join(path));
        Ok(())
    }

    /// Ingest one bus message published under the repository prefix
    ///
    /// Returns the path the value was stored at.
    pub async fn ingest_topic(&self, topic: &str, payload: &Value) -> Result<Vec<String>, RepositoryError> {
        let relative = topic
            .strip_prefix(topics::REPOSITORY_PREFIX)
            .ok_or_else(|| RepositoryError::ForeignTopic(topic.to_string()))?;

        let mut path = topics::split(relative);
        if let Some((_, parents)) = path.split_last_mut() {
            for segment in parents {
                segment.retain(|c| c.is_ascii_alphanumeric() || c == '_');
            }
        }

        self.ingest(&path, stored_value(payload)).await?;
        Ok(path)
    }

    pub async fn lookup<S: AsRef<str>>(&self, path: &[S]) -> Result<Value, LookupError> {
        self.tree.read().await.lookup(path).cloned()
    }

    pub async fn resolve<S: AsRef<str>>(
        &self,
        path: &[S],
        model_key: &str,
    ) -> Result<ResolvedCommand, LookupError> {
        self.tree.read().await.resolve(path, model_key)
    }

    /// Persist the current document
    pub async fn save(&self) -> Result<(), StoreError> {
        let tree = self.tree.read().await;
        self.persist(&tree)
    }

    /// Replace the whole document
    pub async fn replace(&self, document: Value) -> Result<(), RepositoryError> {
        let replacement = CommandTree::from_value(document)?;
        let mut tree = self.tree.write().await;
        *tree = replacement;
        self.persist(&tree)?;
        info!("[YAK] Repository replaced");
        Ok(())
    }

    pub async fn snapshot(&self) -> Value {
        self.tree.read().await.to_value()
    }

    fn persist(&self, tree: &CommandTree) -> Result<(), StoreError> {
        write_json_atomic(&self.path, &tree.to_value())
    }
}

/// What a repository message stores: the payload's `value`, a bare object
/// whole, anything else as text with one pair of surrounding quotes removed
fn stored_value(payload: &Value) -> Value {
    let value = match payload {
        Value::Object(map) => map
            .get("value")
            .cloned()
            .unwrap_or_else(|| payload.clone()),
        Value::String(_) => payload.clone(),
        other => Value::String(other.to_string()),
    };
    match value {
        Value::String(text) => Value::String(strip_quotes(&text).to_string()),
        other => other,
    }
}

fn strip_quotes(text: &str) -> &str {
    text.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(text)
}
