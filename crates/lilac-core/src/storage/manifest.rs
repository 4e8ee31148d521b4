//! Source manifest: shard filenames plus schema (§4.2, §6 "On-disk layout").

use std::path::Path as FsPath;

use serde::{Deserialize, Serialize};

use crate::error::{LilacError, Result};
use crate::schema::Schema;

pub const MANIFEST_FILENAME: &str = "manifest.json";

/// `SourceManifest = { files: [String], data_schema: Schema, images?: [...] }` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceManifest {
    pub files: Vec<String>,
    pub data_schema: Schema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<serde_json::Value>>,
}

impl SourceManifest {
    pub fn new(files: Vec<String>, data_schema: Schema) -> Self {
        SourceManifest {
            files,
            data_schema,
            images: None,
        }
    }

    pub fn load(dataset_dir: &FsPath) -> Result<Self> {
        let path = dataset_dir.join(MANIFEST_FILENAME);
        let bytes = std::fs::read(&path)
            .map_err(|e| LilacError::storage(format!("reading {}: {e}", path.display())))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| LilacError::storage(format!("parsing {}: {e}", path.display())))
    }

    /// Write-then-rename so a reader never observes a half-written manifest (§4.9 step 5).
    pub fn save(&self, dataset_dir: &FsPath) -> Result<()> {
        std::fs::create_dir_all(dataset_dir)
            .map_err(|e| LilacError::storage(format!("creating {}: {e}", dataset_dir.display())))?;
        let final_path = dataset_dir.join(MANIFEST_FILENAME);
        let tmp_path = dataset_dir.join(format!("{MANIFEST_FILENAME}.tmp"));
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| LilacError::storage(format!("serializing manifest: {e}")))?;
        std::fs::write(&tmp_path, bytes)
            .map_err(|e| LilacError::storage(format!("writing {}: {e}", tmp_path.display())))?;
        std::fs::rename(&tmp_path, &final_path)
            .map_err(|e| LilacError::storage(format!("renaming into {}: {e}", final_path.display())))?;
        Ok(())
    }
}
