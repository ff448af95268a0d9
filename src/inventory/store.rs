//! Durable grouped inventory (`VISA_FLEET.json`)

use bench_shared::device::{flatten, group_by_type_and_model};
use bench_shared::persist::{read_json, write_json_atomic, StoreError};
use bench_shared::{DeviceRecord, GroupedInventory};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct InventoryStore {
    path: PathBuf,
}

impl InventoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Group `records` and write them atomically; returns what was written
    pub fn save(&self, records: &[DeviceRecord]) -> Result<GroupedInventory, StoreError> {
        let grouped = group_by_type_and_model(records);
        write_json_atomic(&self.path, &grouped)?;
        info!(
            "[INVENTORY] Saved {} device(s) to {}",
            records.len(),
            self.path.display()
        );
        Ok(grouped)
    }

    /// Stored inventory; a missing or unreadable file yields an empty one
    pub fn load(&self) -> GroupedInventory {
        if !self.path.exists() {
            info!("[INVENTORY] No inventory at {}, starting empty", self.path.display());
            return GroupedInventory::new();
        }
        match read_json(&self.path) {
            Ok(grouped) => grouped,
            Err(e) => {
                warn!(
                    "[INVENTORY] Ignoring unreadable inventory {}: {}",
                    self.path.display(),
                    e
                );
                GroupedInventory::new()
            }
        }
    }

    pub fn load_records(&self) -> Vec<DeviceRecord> {
        flatten(&self.load())
    }
}
