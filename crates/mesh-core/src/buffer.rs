//! Local store-and-forward buffer used while the controller is unreachable.
//!
//! Items accumulate up to `max_items`; once full, the oldest item is dropped
//! to make room for the newest (FIFO). State is persisted to disk after
//! every mutation via a temp-file-then-rename write so a crash mid-write
//! never corrupts the on-disk copy.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Telemetry,
    CommandResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedItem {
    pub item_type: ItemType,
    pub data: serde_json::Value,
    pub timestamp: f64,
    pub attempt_count: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("failed to persist buffer to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Serialize, Deserialize)]
struct OnDisk {
    items: Vec<BufferedItem>,
    saved_at: f64,
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub struct LocalBuffer {
    max_items: usize,
    persist_path: Option<PathBuf>,
    flush_batch_size: usize,
    items: Mutex<Vec<BufferedItem>>,
}

impl LocalBuffer {
    pub fn new(max_items: usize, persist_path: Option<PathBuf>, flush_batch_size: usize) -> Self {
        let buffer = Self {
            max_items,
            persist_path,
            flush_batch_size,
            items: Mutex::new(Vec::new()),
        };
        buffer.load_from_disk();
        buffer
    }

    pub fn add_telemetry(&self, data: serde_json::Value) {
        self.add_item(ItemType::Telemetry, data);
    }

    pub fn add_command_result(&self, data: serde_json::Value) {
        self.add_item(ItemType::CommandResult, data);
    }

    fn add_item(&self, item_type: ItemType, data: serde_json::Value) {
        let item = BufferedItem {
            item_type,
            data,
            timestamp: now_secs(),
            attempt_count: 0,
        };
        {
            let mut items = self.items.lock();
            items.push(item);
            if items.len() > self.max_items {
                items.remove(0);
            }
        }
        if let Err(e) = self.save_to_disk() {
            log::error!("buffer: {e}");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.items.lock().len()
    }

    /// Per-type breakdown plus a `"total"` entry, matching the status dict
    /// the controller-facing debug endpoint reports.
    pub fn pending_counts(&self) -> std::collections::BTreeMap<&'static str, usize> {
        let items = self.items.lock();
        let telemetry = items.iter().filter(|i| i.item_type == ItemType::Telemetry).count();
        let command_result = items.iter().filter(|i| i.item_type == ItemType::CommandResult).count();
        let mut counts = std::collections::BTreeMap::new();
        counts.insert("telemetry", telemetry);
        counts.insert("command_result", command_result);
        counts.insert("total", items.len());
        counts
    }

    pub fn is_empty(&self) -> bool {
        self.pending_count() == 0
    }

    /// A read-only slice of up to `flush_batch_size` items, oldest first,
    /// optionally filtered to a single type; `None` batches across all types.
    pub fn items_to_flush(&self, item_type: Option<ItemType>) -> Vec<BufferedItem> {
        self.items
            .lock()
            .iter()
            .filter(|i| item_type.map_or(true, |t| i.item_type == t))
            .take(self.flush_batch_size)
            .cloned()
            .collect()
    }

    fn keys_of(items: &[BufferedItem]) -> HashSet<(ItemType, u64)> {
        items
            .iter()
            .map(|i| (i.item_type, i.timestamp.to_bits()))
            .collect()
    }

    pub fn mark_flushed(&self, flushed: &[BufferedItem]) {
        let keys = Self::keys_of(flushed);
        let mut items = self.items.lock();
        items.retain(|i| !keys.contains(&(i.item_type, i.timestamp.to_bits())));
        drop(items);
        if let Err(e) = self.save_to_disk() {
            log::error!("buffer: {e}");
        }
    }

    pub fn mark_failed(&self, failed: &[BufferedItem]) {
        let keys = Self::keys_of(failed);
        let mut items = self.items.lock();
        for item in items.iter_mut() {
            if keys.contains(&(item.item_type, item.timestamp.to_bits())) {
                item.attempt_count += 1;
            }
        }
        drop(items);
        if let Err(e) = self.save_to_disk() {
            log::error!("buffer: {e}");
        }
    }

    pub fn clear(&self) {
        self.items.lock().clear();
        if let Err(e) = self.save_to_disk() {
            log::error!("buffer: {e}");
        }
    }

    fn save_to_disk(&self) -> Result<(), BufferError> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let snapshot = OnDisk {
            items: self.items.lock().clone(),
            saved_at: now_secs(),
        };
        let json = serde_json::to_vec_pretty(&snapshot).unwrap_or_default();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BufferError::Persist {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let tmp_path = tmp_path_for(path);
        std::fs::write(&tmp_path, &json).map_err(|e| BufferError::Persist {
            path: tmp_path.clone(),
            source: e,
        })?;
        std::fs::rename(&tmp_path, path).map_err(|e| BufferError::Persist {
            path: path.clone(),
            source: e,
        })?;
        Ok(())
    }

    fn load_from_disk(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let loaded = std::fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<OnDisk>(&bytes).ok());
        match loaded {
            Some(on_disk) => *self.items.lock() = on_disk.items,
            None => *self.items.lock() = Vec::new(),
        }
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn add_drops_oldest_when_over_capacity() {
        let buffer = LocalBuffer::new(2, None, 10);
        buffer.add_telemetry(json!({"n": 1}));
        buffer.add_telemetry(json!({"n": 2}));
        buffer.add_telemetry(json!({"n": 3}));
        assert_eq!(buffer.pending_count(), 2);
        let remaining = buffer.items_to_flush(Some(ItemType::Telemetry));
        assert_eq!(remaining[0].data["n"], 2);
        assert_eq!(remaining[1].data["n"], 3);
    }

    #[test]
    fn items_to_flush_respects_batch_size_and_type_filter() {
        let buffer = LocalBuffer::new(10, None, 1);
        buffer.add_telemetry(json!({"n": 1}));
        buffer.add_command_result(json!({"n": 2}));
        buffer.add_telemetry(json!({"n": 3}));
        let batch = buffer.items_to_flush(Some(ItemType::Telemetry));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].data["n"], 1);
    }

    #[test]
    fn items_to_flush_with_no_type_filter_spans_all_types() {
        let buffer = LocalBuffer::new(10, None, 10);
        buffer.add_telemetry(json!({"n": 1}));
        buffer.add_command_result(json!({"n": 2}));
        let batch = buffer.items_to_flush(None);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn pending_counts_breaks_down_by_type() {
        let buffer = LocalBuffer::new(10, None, 10);
        buffer.add_telemetry(json!({"n": 1}));
        buffer.add_telemetry(json!({"n": 2}));
        buffer.add_command_result(json!({"n": 3}));
        let counts = buffer.pending_counts();
        assert_eq!(counts["telemetry"], 2);
        assert_eq!(counts["command_result"], 1);
        assert_eq!(counts["total"], 3);
    }

    #[test]
    fn mark_flushed_removes_exact_items() {
        let buffer = LocalBuffer::new(10, None, 10);
        buffer.add_telemetry(json!({"n": 1}));
        buffer.add_telemetry(json!({"n": 2}));
        let to_flush = buffer.items_to_flush(Some(ItemType::Telemetry));
        buffer.mark_flushed(&to_flush[..1]);
        assert_eq!(buffer.pending_count(), 1);
    }

    #[test]
    fn mark_failed_increments_attempt_count() {
        let buffer = LocalBuffer::new(10, None, 10);
        buffer.add_telemetry(json!({"n": 1}));
        let items = buffer.items_to_flush(Some(ItemType::Telemetry));
        buffer.mark_failed(&items);
        let retried = buffer.items_to_flush(Some(ItemType::Telemetry));
        assert_eq!(retried[0].attempt_count, 1);
    }

    #[test]
    fn save_to_disk_creates_missing_parent_directory() {
        let dir = std::env::temp_dir().join(format!("mesh-buffer-nested-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        let path = dir.join("nested").join("buffer.json");

        let buffer = LocalBuffer::new(10, Some(path.clone()), 10);
        buffer.add_telemetry(json!({"n": 1}));
        assert!(path.exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn persists_and_reloads_atomically() {
        let dir = std::env::temp_dir().join(format!("mesh-buffer-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("buffer.json");

        let buffer = LocalBuffer::new(10, Some(path.clone()), 10);
        buffer.add_telemetry(json!({"n": 42}));
        assert!(path.exists());
        assert!(!tmp_path_for(&path).exists());

        let reloaded = LocalBuffer::new(10, Some(path.clone()), 10);
        assert_eq!(reloaded.pending_count(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_from_disk_resets_to_empty_on_corrupt_file() {
        let dir = std::env::temp_dir().join(format!("mesh-buffer-corrupt-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("buffer.json");
        std::fs::write(&path, b"not json").unwrap();

        let buffer = LocalBuffer::new(10, Some(path), 10);
        assert!(buffer.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }
}
