//! Per-signal manifest: output shards, schema, and the enrichment site (§4.3).

use std::path::Path as FsPath;

use serde::{Deserialize, Serialize};

use crate::error::{LilacError, Result};
use crate::path::Path;
use crate::schema::{Schema, SignalDescriptor};

pub const SIGNAL_MANIFEST_FILENAME: &str = "signal_manifest.json";

/// Describes one signal's persisted output (§4.3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalManifest {
    pub files: Vec<String>,
    pub parquet_id: String,
    pub data_schema: Schema,
    pub signal: SignalDescriptor,
    pub enriched_path: Path,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_filename: Option<String>,
}

impl SignalManifest {
    pub fn load(signal_dir: &FsPath) -> Result<Self> {
        let path = signal_dir.join(SIGNAL_MANIFEST_FILENAME);
        let bytes = std::fs::read(&path)
            .map_err(|e| LilacError::storage(format!("reading {}: {e}", path.display())))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| LilacError::storage(format!("parsing {}: {e}", path.display())))
    }

    /// Write-then-rename: the manifest is the last thing written for a
    /// signal so a reader never sees a parquet shard without one (§4.9 step 5).
    pub fn save(&self, signal_dir: &FsPath) -> Result<()> {
        std::fs::create_dir_all(signal_dir)
            .map_err(|e| LilacError::storage(format!("creating {}: {e}", signal_dir.display())))?;
        let final_path = signal_dir.join(SIGNAL_MANIFEST_FILENAME);
        let tmp_path = signal_dir.join(format!("{SIGNAL_MANIFEST_FILENAME}.tmp"));
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| LilacError::storage(format!("serializing signal manifest: {e}")))?;
        std::fs::write(&tmp_path, bytes)
            .map_err(|e| LilacError::storage(format!("writing {}: {e}", tmp_path.display())))?;
        std::fs::rename(&tmp_path, &final_path)
            .map_err(|e| LilacError::storage(format!("renaming into {}: {e}", final_path.display())))?;
        Ok(())
    }

    /// Whether every parquet file this manifest names exists on disk. A
    /// manifest whose files are missing is an error (§4.9 "Failure semantics").
    pub fn files_exist(&self, signal_dir: &FsPath) -> bool {
        self.files.iter().all(|f| signal_dir.join(f).exists())
    }
}

/// `key(signal) + "(" + dotted(enriched_path minus trailing value-key / wildcards) + ")"` (§4.3).
pub fn make_parquet_id(signal: &SignalDescriptor, enriched_path_root: &Path) -> String {
    let stripped = enriched_path_root.without_trailing_value_or_wildcard();
    format!("{}({})", signal.key(), stripped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, Field, FieldMap};

    fn sample_manifest() -> SignalManifest {
        let mut fields = FieldMap::new();
        fields.insert("len", Field::primitive(DataType::Int32));
        let signal = SignalDescriptor::new("test_signal");
        let enriched_path = Path::from(["str"]);
        SignalManifest {
            files: vec!["data-00000-of-00001.parquet".to_string()],
            parquet_id: make_parquet_id(&signal, &enriched_path),
            data_schema: Schema::from_fields(fields),
            signal,
            enriched_path,
            embedding_filename: None,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = sample_manifest();
        manifest.save(dir.path()).unwrap();
        let loaded = SignalManifest::load(dir.path()).unwrap();
        assert_eq!(loaded.parquet_id, manifest.parquet_id);
    }

    #[test]
    fn parquet_id_is_unique_per_signal_and_path() {
        let a = make_parquet_id(&SignalDescriptor::new("sig"), &Path::from(["a"]));
        let b = make_parquet_id(&SignalDescriptor::new("sig"), &Path::from(["b"]));
        assert_ne!(a, b);
    }

    #[test]
    fn parquet_id_changes_with_params() {
        let a = make_parquet_id(
            &SignalDescriptor::new("sig").with_param("k", serde_json::json!(1)),
            &Path::from(["a"]),
        );
        let b = make_parquet_id(
            &SignalDescriptor::new("sig").with_param("k", serde_json::json!(2)),
            &Path::from(["a"]),
        );
        assert_ne!(a, b);
    }

    #[test]
    fn files_exist_detects_missing_shard() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = sample_manifest();
        assert!(!manifest.files_exist(dir.path()));
    }
}
