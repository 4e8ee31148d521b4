//! Enrichment writer: computes a signal over a column and persists the
//! result as a new signal shard plus manifest (§4.9).

use std::collections::HashMap;
use std::path::{Path as FsPath, PathBuf};

use tracing::instrument;

use crate::error::{LilacError, Result};
use crate::executor::{self, collect_keys, ExecutionContext};
use crate::merge_view::{MergeView, SignalView, SIGNAL_VALUE_FIELD};
use crate::path::{Path, PathPart, VALUE_KEY};
use crate::planner::{self, ColumnRequest};
use crate::schema::{DataType, Schema};
use crate::signal::{dependency, DependencySpec, Signal, SignalRegistry};
use crate::signal_manifest::{self, SignalManifest};
use crate::storage::manifest::SourceManifest;
use crate::storage::parquet_shard;
use crate::storage::row_storage::RowStorage;
use crate::value::{Row, Value};
use crate::vector_store::VectorStore;

const SHARD_FILENAME: &str = "data-00000-of-00001.parquet";
const EMBEDDINGS_FILENAME: &str = "embeddings-00000-of-00001.json";

/// Mutable state a write needs beyond the immutable source shards: every
/// already-computed signal (so dependency reads and repeated `compute_signal`
/// calls within one write see each other) and every loaded vector store,
/// both scoped to one dataset for the process lifetime (§5 "Shared
/// resources"). `dataset.rs` owns the real, process-wide copies of these and
/// hands out a `WriteContext` borrowing them for the duration of one write.
pub struct WriteContext<'a> {
    pub dataset_dir: &'a FsPath,
    pub source_manifest: &'a SourceManifest,
    pub source_storage: &'a RowStorage,
    pub existing_signals: &'a mut Vec<SignalView>,
    pub vector_stores: &'a mut HashMap<Path, VectorStore>,
    pub registry: &'a SignalRegistry,
}

impl WriteContext<'_> {
    fn view(&self) -> Result<MergeView> {
        MergeView::build(self.source_manifest, self.source_storage, self.existing_signals)
    }
}

/// `compute_signal(signal, base_path)` (§4.9): resolves and auto-computes any
/// missing split/embedding dependency, evaluates `signal` as a single UDF
/// column over the merged view, and writes the result as a new signal shard.
#[instrument(
    skip(ctx, base_path, signal),
    fields(dataset_dir = %ctx.dataset_dir.display(), path = %base_path, signal = %signal.display_name())
)]
pub fn compute_signal(
    ctx: &mut WriteContext,
    base_path: &Path,
    signal: Box<dyn Signal>,
) -> Result<SignalManifest> {
    let spec = signal.dependency();

    // Step 1: resolve dependencies as a write, auto-computing missing
    // split/embedding subtrees recursively. The dependency shape is always
    // at most two hops (split, then embedding), so both are handled
    // directly rather than by a generic DAG walk.
    if let Some(split_key) = spec.split.clone() {
        let only_split = DependencySpec {
            split: Some(split_key.clone()),
            embedding: None,
        };
        let view = ctx.view()?;
        if !dependency::missing_dependencies(view.schema(), base_path, &only_split).is_empty() {
            let split_signal = construct_dependency(ctx.registry, &split_key)?;
            compute_signal(ctx, base_path, split_signal)?;
        }
    }

    if let Some(embedding_key) = spec.embedding.clone() {
        let view = ctx.view()?;
        let embedding_base = resolve_embedding_base(view.schema(), base_path, &spec);
        let full_spec = DependencySpec {
            split: spec.split.clone(),
            embedding: Some(embedding_key.clone()),
        };
        if !dependency::missing_dependencies(view.schema(), base_path, &full_spec).is_empty() {
            let embedding_signal = construct_dependency(ctx.registry, &embedding_key)?;
            compute_signal(ctx, &embedding_base, embedding_signal)?;
        }
    }

    // Step 2: evaluate `signal` as a single UDF column, spans forced,
    // limit disabled, combine_columns off (we want the bare projected row).
    let view = ctx.view()?;
    let request = ColumnRequest::udf(base_path.clone(), signal.descriptor(), SIGNAL_VALUE_FIELD);
    let plan = planner::plan(
        view.schema(),
        std::slice::from_ref(&request),
        vec![],
        vec![],
        None,
        0,
        true,
        false,
        ctx.registry,
    )?;
    let read_path = plan
        .columns
        .iter()
        .find(|c| c.output_alias == SIGNAL_VALUE_FIELD)
        .map(|c| c.read_path.clone())
        .ok_or_else(|| LilacError::invalid_query("planner dropped the enrichment UDF column"))?;
    let exec_ctx = ExecutionContext {
        view: &view,
        vector_stores: ctx.vector_stores,
    };
    let mut rows = executor::execute(&exec_ctx, plan)?;

    // Step 3: the output schema under the enriched path.
    let data_schema = build_enrichment_schema(view.schema(), base_path, signal.as_ref())?;

    let signal_key = signal.key(true);
    let dir = signal_dir(ctx.dataset_dir, base_path, &signal_key);
    std::fs::create_dir_all(&dir)
        .map_err(|e| LilacError::storage(format!("creating {}: {e}", dir.display())))?;

    // Step 4: embeddings never go to the shard — they live in the vector
    // store sidecar, keyed the same way as the read path's repetition.
    let is_embedding = signal.fields().dtype() == Some(DataType::Embedding);
    let embedding_filename = if is_embedding {
        let wildcard_depth = read_path
            .parts()
            .iter()
            .filter(|p| matches!(p, PathPart::Wildcard))
            .count();

        let mut keys = Vec::new();
        for row in &rows {
            collect_keys(row, &read_path, &mut keys);
        }
        let mut vectors = Vec::new();
        for row in &rows {
            let value = row.fields.get(SIGNAL_VALUE_FIELD).cloned().unwrap_or(Value::Null);
            collect_embedding_leaves(&value, wildcard_depth, &mut vectors);
        }
        if keys.len() != vectors.len() {
            return Err(LilacError::cardinality(
                base_path.clone(),
                format!(
                    "{} embedding keys but {} vectors produced",
                    keys.len(),
                    vectors.len()
                ),
            ));
        }

        let mut store = VectorStore::new();
        store.add(keys, vectors)?;
        store.save(&dir.join(EMBEDDINGS_FILENAME))?;
        ctx.vector_stores
            .insert(base_path.child(signal_key.as_str()), store);

        for row in &mut rows {
            row.fields.insert(SIGNAL_VALUE_FIELD.to_string(), Value::Null);
        }
        Some(EMBEDDINGS_FILENAME.to_string())
    } else {
        None
    };

    // Step 5: write the parquet shard, then the manifest last — a reader
    // never sees a shard without its manifest (write-then-rename lives
    // inside `SignalManifest::save`).
    parquet_shard::write_shard(&dir.join(SHARD_FILENAME), &rows)?;

    let manifest = SignalManifest {
        files: vec![SHARD_FILENAME.to_string()],
        parquet_id: signal_manifest::make_parquet_id(&signal.descriptor(), base_path),
        data_schema,
        signal: signal.descriptor(),
        enriched_path: base_path.clone(),
        embedding_filename,
    };
    manifest.save(&dir)?;

    // Step 6: invalidate the merged-view cache. This writer only tracks the
    // signal/vector-store state handed to it via `ctx`; the process-wide
    // mtime-guarded `MergeView` cache lives in `dataset.rs` and is dropped
    // there once this call returns, so a subsequent read rebuilds it.
    attach_signal_view(ctx, manifest.clone())?;

    Ok(manifest)
}

/// Reconstructs a parameterless dependency signal from its key string
/// (everything before the first `(`). Every builtin split/embedding
/// dependency used by the registered fixtures is parameterless; a signal
/// with a parameterized dependency would need its parameters threaded
/// through some other channel, which the write path doesn't have — this is
/// a deliberate, narrower contract than general dependency resolution.
fn construct_dependency(registry: &SignalRegistry, key: &str) -> Result<Box<dyn Signal>> {
    let name = key.split('(').next().unwrap_or(key);
    let descriptor = crate::schema::SignalDescriptor::new(name);
    let signal = registry.construct(&descriptor)?;
    if signal.key(true) != key {
        return Err(LilacError::missing_dependency(
            name,
            format!("cannot reconstruct parameterized dependency `{key}` for auto-compute"),
        ));
    }
    Ok(signal)
}

/// Where an embedding signal should read from: the split's per-item value if
/// `spec.split` is set, else `base_path` itself. Tries the bare position
/// first (the common case: nothing has enriched that leaf yet, so it's
/// still a plain primitive) and only appends `__value__` if an earlier
/// signal already promoted it into a struct — the same leniency
/// `dependency::path_exists_as_leaf_or_value` applies to existence checks,
/// specialized here to pick the one correct path rather than just to test
/// whether one exists.
fn resolve_embedding_base(schema: &Schema, base_path: &Path, spec: &DependencySpec) -> Path {
    let bare = match &spec.split {
        Some(split_key) => base_path.child(split_key.as_str()).child(PathPart::Wildcard),
        None => base_path.clone(),
    };
    match schema.get_field(&bare) {
        Ok(field) if field.is_leaf() => bare,
        _ => bare.child(VALUE_KEY),
    }
}

/// Builds the `Schema` a freshly computed signal contributes at its
/// enrichment site: a leaf-with-enrichment struct
/// (`{__value__: <original dtype>, <signal key>: <signal's own fields>}`)
/// nested back under `base_path`'s remaining path parts (§3, §4.9 step 3).
/// `Schema::merge`'s leaf-promotion rule (schema.rs) does the rest when this
/// gets unioned with the source/other signal schemas.
fn build_enrichment_schema(schema: &Schema, base_path: &Path, signal: &dyn Signal) -> Result<Schema> {
    let original = validate_enrichable_leaf(schema, base_path)?;

    let mut promoted = crate::schema::FieldMap::new();
    promoted.insert(VALUE_KEY, original);
    promoted.insert(signal.key(true), signal.fields().with_derived_from(base_path.clone()));
    let mut field = crate::schema::Field::struct_(promoted);

    let parts = base_path.parts();
    for part in parts[1..].iter().rev() {
        field = match part {
            PathPart::Wildcard => crate::schema::Field::list(field),
            PathPart::Name(name) => {
                let mut fields = crate::schema::FieldMap::new();
                fields.insert(name.clone(), field);
                crate::schema::Field::struct_(fields)
            }
            PathPart::ValueKey => {
                let mut fields = crate::schema::FieldMap::new();
                fields.insert(VALUE_KEY, field);
                crate::schema::Field::struct_(fields)
            }
        };
    }

    let root_name = match parts.first() {
        Some(PathPart::Name(name)) => name.clone(),
        Some(PathPart::ValueKey) => VALUE_KEY.to_string(),
        _ => {
            return Err(LilacError::invalid_query(
                "a signal's base path must start with a named field",
            ))
        }
    };
    let mut root = crate::schema::FieldMap::new();
    root.insert(root_name, field);
    Ok(Schema::from_fields(root))
}

/// Resolves `base_path` to its current leaf field, whether it is still bare
/// or was already promoted into a struct by an earlier signal on the same
/// position (mirrors [`resolve_embedding_base`]'s leniency).
fn validate_enrichable_leaf(schema: &Schema, base_path: &Path) -> Result<crate::schema::Field> {
    match schema.get_field(base_path) {
        Ok(field) if field.is_leaf() => Ok(field.clone()),
        Ok(field) => {
            if let crate::schema::Field::Struct { fields, .. } = field {
                if let Some(value_field) = fields.get(VALUE_KEY) {
                    return Ok(value_field.clone());
                }
            }
            Err(LilacError::schema_mismatch(
                base_path.clone(),
                "expected a leaf (or a leaf-with-enrichment struct) at this path",
            ))
        }
        Err(e) => {
            let with_value = base_path.child(VALUE_KEY);
            schema.get_field(&with_value).map(|f| f.clone()).map_err(|_| e)
        }
    }
}

/// Walks `value` down exactly `wildcard_depth` levels of lists (matching the
/// number of `Wildcard` parts in the read path) and collects the leaf
/// embedding vectors found there, in the same depth-first order
/// `collect_keys` visits keys — the two are zipped positionally.
fn collect_embedding_leaves(value: &Value, wildcard_depth: usize, out: &mut Vec<Vec<f32>>) {
    if wildcard_depth == 0 {
        if let Some(vector) = embedding_vector(value) {
            out.push(vector);
        }
        return;
    }
    if let Value::List(items) = value {
        for item in items {
            collect_embedding_leaves(item, wildcard_depth - 1, out);
        }
    }
}

fn embedding_vector(value: &Value) -> Option<Vec<f32>> {
    match value {
        Value::List(items) => Some(
            items
                .iter()
                .filter_map(|v| match v {
                    Value::Float(f) => Some(*f as f32),
                    Value::Int(i) => Some(*i as f32),
                    _ => None,
                })
                .collect(),
        ),
        Value::Null => None,
        _ => None,
    }
}

/// On-disk directory for a signal shard (§6): `<dataset>/<p1>/.../<signal_key>/`.
pub(crate) fn signal_dir(dataset_dir: &FsPath, base_path: &Path, signal_key: &str) -> PathBuf {
    let stripped = base_path.without_trailing_value_or_wildcard();
    let mut dir = dataset_dir.to_path_buf();
    for part in stripped.parts() {
        match part {
            PathPart::Name(name) => dir.push(name),
            PathPart::Wildcard => dir.push("*"),
            PathPart::ValueKey => dir.push(VALUE_KEY),
        }
    }
    dir.push(signal_key);
    dir
}

/// Reloads the shard we just wrote and records it as an already-computed
/// signal, so a sibling `compute_signal` call in the same write (or a
/// repeated read of a dependency chain) sees it immediately.
fn attach_signal_view(ctx: &mut WriteContext, manifest: SignalManifest) -> Result<()> {
    let dir = signal_dir(ctx.dataset_dir, &manifest.enriched_path, &manifest.signal.key());
    let source = SourceManifest::new(manifest.files.clone(), Schema::new());
    let storage = RowStorage::load(&dir, &source)?;
    ctx.existing_signals.push(SignalView { manifest, storage });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, Field, FieldMap, SignalDescriptor};
    use crate::signal::registry::SignalRegistry;
    use crate::value::Row;

    fn source(dir: &FsPath) -> (SourceManifest, RowStorage) {
        let mut fields = FieldMap::new();
        fields.insert("text", Field::primitive(DataType::String));
        let schema = Schema::from_fields(fields);
        let rows = vec![
            Row::new("1").with_field("text", Value::String("hello".into())),
            Row::new("2").with_field("text", Value::String("hello world".into())),
        ];
        let shard = dir.join("data-00000-of-00001.parquet");
        parquet_shard::write_shard(&shard, &rows).unwrap();
        let manifest = SourceManifest::new(vec!["data-00000-of-00001.parquet".to_string()], schema);
        let storage = RowStorage::load(dir, &manifest).unwrap();
        (manifest, storage)
    }

    #[test]
    fn computes_sparse_signal_and_writes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let (source_manifest, source_storage) = source(dir.path());
        let registry = SignalRegistry::with_builtins();
        let mut existing = Vec::new();
        let mut vector_stores = HashMap::new();
        let mut ctx = WriteContext {
            dataset_dir: dir.path(),
            source_manifest: &source_manifest,
            source_storage: &source_storage,
            existing_signals: &mut existing,
            vector_stores: &mut vector_stores,
            registry: &registry,
        };

        let signal = registry.construct(&SignalDescriptor::new("test_sparse")).unwrap();
        let base_path = Path::from(["text"]);
        let manifest = compute_signal(&mut ctx, &base_path, signal).unwrap();

        assert_eq!(manifest.signal.key(), "test_sparse()");
        assert!(manifest.embedding_filename.is_none());
        assert_eq!(existing.len(), 1);

        let view = MergeView::build(&source_manifest, &source_storage, &existing).unwrap();
        let row1 = view.get("1").unwrap();
        let text1 = row1.fields.get("text").unwrap().as_struct().unwrap();
        assert_eq!(text1.get("test_sparse()"), Some(&Value::Null));
        let row2 = view.get("2").unwrap();
        let text2 = row2.fields.get("text").unwrap().as_struct().unwrap();
        assert_eq!(text2.get("test_sparse()"), Some(&Value::Int(11)));
    }

    #[test]
    fn auto_computes_split_and_embedding_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let (source_manifest, source_storage) = source(dir.path());
        let registry = SignalRegistry::with_builtins();
        let mut existing = Vec::new();
        let mut vector_stores = HashMap::new();
        let mut ctx = WriteContext {
            dataset_dir: dir.path(),
            source_manifest: &source_manifest,
            source_storage: &source_storage,
            existing_signals: &mut existing,
            vector_stores: &mut vector_stores,
            registry: &registry,
        };

        let descriptor = SignalDescriptor::new("test_embedding_sum")
            .with_param("split", serde_json::json!("test_splitter()"))
            .with_param("embedding", serde_json::json!("test_embedding()"));
        let signal = registry.construct(&descriptor).unwrap();
        let base_path = Path::from(["text"]);
        let manifest = compute_signal(&mut ctx, &base_path, signal).unwrap();

        // split, embedding, and the target signal itself were all written.
        assert_eq!(existing.len(), 3);
        assert_eq!(manifest.signal.key(), descriptor.key());
        assert!(!vector_stores.is_empty());
    }
}
