use crate::config::SLICE_FORMAT_VERSION;
use crate::models::EditTable;
use crate::partition::IdRange;
use anyhow::{Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Serialize, Deserialize)]
struct SliceCheckpoint {
    version: u32,
    range: IdRange,
    edits: EditTable,
}

pub fn slice_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("slices")
}

/// Persisted edit tables, one per report slice, so aggregation can resume
/// without re-extracting finished windows.
#[derive(Debug)]
pub struct SliceStore {
    dir: PathBuf,
}

impl SliceStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = slice_dir(data_dir);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create slice directory: {:?}", dir))?;
        Ok(Self { dir })
    }

    pub fn path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("slice_{}.bin", index))
    }

    /// Returns the stored table if it exists, is readable, and was computed
    /// for exactly `range`.
    pub fn load_if_valid(&self, index: usize, range: IdRange) -> Option<EditTable> {
        let path = self.path(index);
        if !path.exists() {
            return None;
        }

        let file_size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                warn!(slice = index, error = %e, "Slice file is unreadable");
                return None;
            }
        };
        let reader = BufReader::new(file);
        let options = bincode::options().with_limit(file_size.saturating_add(1024));

        let checkpoint: SliceCheckpoint = match options.deserialize_from(reader) {
            Ok(c) => c,
            Err(e) => {
                warn!(slice = index, error = %e, "Slice file is corrupt or unreadable");
                return None;
            }
        };

        if checkpoint.version != SLICE_FORMAT_VERSION {
            info!(
                slice = index,
                cached = checkpoint.version,
                current = SLICE_FORMAT_VERSION,
                "Slice version mismatch"
            );
            return None;
        }

        if checkpoint.range != range {
            info!(
                slice = index,
                cached = %checkpoint.range,
                current = %range,
                "Slice range mismatch"
            );
            return None;
        }

        if !checkpoint.edits.is_consistent() {
            warn!(slice = index, "Slice totals do not match namespace counts");
            return None;
        }

        Some(checkpoint.edits)
    }

    pub fn save(&self, index: usize, range: IdRange, edits: &EditTable) -> Result<()> {
        let path = self.path(index);
        let tmp_path = path.with_extension("bin.tmp");

        let checkpoint = SliceCheckpointRef {
            version: SLICE_FORMAT_VERSION,
            range,
            edits,
        };

        let file = File::create(&tmp_path)
            .with_context(|| format!("Failed to create temp slice file: {:?}", tmp_path))?;
        let mut writer = BufWriter::new(file);

        bincode::DefaultOptions::new()
            .serialize_into(&mut writer, &checkpoint)
            .context("Failed to serialize slice")?;
        writer
            .into_inner()
            .map_err(|e| e.into_error())
            .and_then(|file| file.sync_all())
            .with_context(|| format!("Failed to flush temp slice file: {:?}", tmp_path))?;

        fs::rename(&tmp_path, &path)
            .with_context(|| format!("Failed to rename temp slice file to: {:?}", path))?;

        debug!(slice = index, range = %range, users = edits.len(), "Slice saved");
        Ok(())
    }

    /// Removes every stored slice.
    pub fn clear(&self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)
                .with_context(|| format!("Failed to remove slice directory: {:?}", self.dir))?;
            info!("Slice checkpoints cleared");
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create slice directory: {:?}", self.dir))?;
        Ok(())
    }
}

/// Borrows the table to avoid cloning it for serialization.
#[derive(Serialize)]
struct SliceCheckpointRef<'a> {
    version: u32,
    range: IdRange,
    edits: &'a EditTable,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Tally;
    use crate::models::Author;
    use std::io::Write;
    use tempfile::TempDir;

    fn sample_table() -> EditTable {
        let mut tally = Tally::default();
        tally.record(&Author::User("Alice".to_string()), 0);
        tally.record(&Author::User("Alice".to_string()), 10);
        tally.record(&Author::Hidden, 2);
        tally.finish()
    }

    #[test]
    fn slice_path_uses_index() {
        let dir = TempDir::new().unwrap();
        let store = SliceStore::open(dir.path()).unwrap();
        assert_eq!(store.path(3), dir.path().join("slices").join("slice_3.bin"));
    }

    #[test]
    fn save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = SliceStore::open(dir.path()).unwrap();
        let range = IdRange::new(5001, 10_000);

        store.save(1, range, &sample_table()).unwrap();
        assert_eq!(store.load_if_valid(1, range), Some(sample_table()));
    }

    #[test]
    fn missing_slice_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = SliceStore::open(dir.path()).unwrap();
        assert!(store.load_if_valid(0, IdRange::new(1, 5000)).is_none());
    }

    #[test]
    fn slice_invalidated_by_range_change() {
        let dir = TempDir::new().unwrap();
        let store = SliceStore::open(dir.path()).unwrap();

        // Final slice of a run with a smaller total
        store.save(2, IdRange::new(10_001, 12_000), &sample_table()).unwrap();
        assert!(store.load_if_valid(2, IdRange::new(10_001, 15_000)).is_none());
    }

    #[test]
    fn corrupt_slice_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = SliceStore::open(dir.path()).unwrap();

        let mut file = File::create(store.path(0)).unwrap();
        file.write_all(b"not valid bincode").unwrap();

        assert!(store.load_if_valid(0, IdRange::new(1, 5000)).is_none());
    }

    #[test]
    fn clear_removes_slices() {
        let dir = TempDir::new().unwrap();
        let store = SliceStore::open(dir.path()).unwrap();
        store.save(0, IdRange::new(1, 5000), &sample_table()).unwrap();
        assert!(store.path(0).exists());

        store.clear().unwrap();
        assert!(!store.path(0).exists());
        assert!(slice_dir(dir.path()).is_dir());
    }

    #[test]
    fn clear_ok_when_empty() {
        let dir = TempDir::new().unwrap();
        let store = SliceStore::open(dir.path()).unwrap();
        assert!(store.clear().is_ok());
    }
}
