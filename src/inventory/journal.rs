//! Journal of answered queries, one JSON file per response

use bench_shared::now_ms;
use bench_shared::persist::{write_json_atomic, StoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub serial_number: String,
    pub command: String,
    pub response: String,
    pub correlation_id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct ResponseJournal {
    dir: PathBuf,
}

impl ResponseJournal {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `<key>_query_<millis>.json`; a name already taken gets a `_<n>` suffix
    pub fn record(&self, key: &str, entry: &JournalEntry) -> Result<PathBuf, StoreError> {
        let stem = format!("{key}_query_{}", entry.timestamp);
        let mut path = self.dir.join(format!("{stem}.json"));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("{stem}_{n}.json"));
            n += 1;
        }
        write_json_atomic(&path, entry)?;
        debug!("[JOURNAL] {} -> {}", key, path.display());
        Ok(path)
    }
}

impl JournalEntry {
    pub fn now(serial_number: &str, command: &str, response: &str, correlation_id: &str) -> Self {
        Self {
            serial_number: serial_number.to_string(),
            command: command.to_string(),
            response: response.to_string(),
            correlation_id: correlation_id.to_string(),
            timestamp: now_ms(),
        }
    }
}
