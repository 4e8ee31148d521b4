//! In-memory view of a dataset's source shards: union of rows, row-key index (§4.2).

use std::collections::HashMap;
use std::path::{Path as FsPath, PathBuf};
use std::time::SystemTime;

use crate::error::{LilacError, Result};
use crate::storage::manifest::SourceManifest;
use crate::storage::parquet_shard;
use crate::value::Row;

/// The union of all source shards for one dataset, indexed by row key.
///
/// Duplicate row keys across (or within) shards are rejected at load time
/// (§9 "Open question": join-by-rowid semantics would otherwise silently
/// cross-product signal rows).
#[derive(Debug, Clone)]
pub struct RowStorage {
    rows: Vec<Row>,
    index: HashMap<String, usize>,
}

impl RowStorage {
    pub fn load(dataset_dir: &FsPath, manifest: &SourceManifest) -> Result<Self> {
        let mut rows = Vec::new();
        let mut index = HashMap::new();
        for filename in &manifest.files {
            let shard_path = dataset_dir.join(filename);
            for row in parquet_shard::read_shard(&shard_path)? {
                if index.insert(row.row_id.clone(), rows.len()).is_some() {
                    return Err(LilacError::storage(format!(
                        "duplicate row key {} across source shards",
                        row.row_id
                    )));
                }
                rows.push(row);
            }
        }
        Ok(RowStorage { rows, index })
    }

    pub fn get(&self, row_id: &str) -> Option<&Row> {
        self.index.get(row_id).map(|&i| &self.rows[i])
    }

    pub fn scan(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Max mtime across every regular file under `dataset_dir`, used to detect
/// whether the merged view needs to be recomputed (§4.2, §5 "Shared resources").
pub fn max_mtime(dataset_dir: &FsPath) -> Result<SystemTime> {
    fn walk(dir: &FsPath, latest: &mut SystemTime) -> Result<()> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| LilacError::storage(format!("reading dir {}: {e}", dir.display())))?;
        for entry in entries {
            let entry = entry.map_err(|e| LilacError::storage(format!("dir entry: {e}")))?;
            let path: PathBuf = entry.path();
            let metadata = entry
                .metadata()
                .map_err(|e| LilacError::storage(format!("stat {}: {e}", path.display())))?;
            if metadata.is_dir() {
                walk(&path, latest)?;
            } else {
                let modified = metadata
                    .modified()
                    .map_err(|e| LilacError::storage(format!("mtime {}: {e}", path.display())))?;
                if modified > *latest {
                    *latest = modified;
                }
            }
        }
        Ok(())
    }

    let mut latest = SystemTime::UNIX_EPOCH;
    walk(dataset_dir, &mut latest)?;
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;
    use crate::value::Value;

    #[test]
    fn load_rejects_duplicate_row_keys() {
        let dir = tempfile::tempdir().unwrap();
        let shard_path = dir.path().join("data-00000-of-00001.parquet");
        let rows = vec![
            Row::new("1").with_field("str", Value::String("a".into())),
            Row::new("1").with_field("str", Value::String("b".into())),
        ];
        parquet_shard::write_shard(&shard_path, &rows).unwrap();
        let manifest = SourceManifest::new(
            vec!["data-00000-of-00001.parquet".to_string()],
            Schema::new(),
        );
        let err = RowStorage::load(dir.path(), &manifest).unwrap_err();
        assert!(matches!(err, LilacError::StorageError { .. }));
    }

    #[test]
    fn load_indexes_rows_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let shard_path = dir.path().join("data-00000-of-00001.parquet");
        let rows = vec![Row::new("1").with_field("str", Value::String("a".into()))];
        parquet_shard::write_shard(&shard_path, &rows).unwrap();
        let manifest = SourceManifest::new(
            vec!["data-00000-of-00001.parquet".to_string()],
            Schema::new(),
        );
        let storage = RowStorage::load(dir.path(), &manifest).unwrap();
        assert_eq!(storage.len(), 1);
        assert!(storage.get("1").is_some());
        assert!(storage.get("missing").is_none());
    }
}
