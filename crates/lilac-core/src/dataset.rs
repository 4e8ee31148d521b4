//! Public dataset facade: the Query API surface (§5, §6).

use std::collections::HashMap;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::instrument;

use crate::config::EngineConfig;
use crate::enrichment::{self, WriteContext};
use crate::error::{LilacError, Result};
use crate::executor::{self, ExecutionContext};
use crate::merge_view::{MergeView, SignalView};
use crate::path::Path;
use crate::planner::{self, ColumnRequest, Filter, FilterOp, SortKey, SortOrder, UnaryOp};
use crate::schema::{DataType, FieldMap, Schema, SignalDescriptor};
use crate::signal::{Signal, SignalRegistry};
use crate::signal_manifest::{SignalManifest, SIGNAL_MANIFEST_FILENAME};
use crate::stats::{self, Bins, GroupCount, GroupOrder, SortBy, StatsResult};
use crate::storage::manifest::SourceManifest;
use crate::storage::parquet_shard::ROW_ID_COLUMN;
use crate::storage::row_storage::{self, RowStorage};
use crate::value::Row;
use crate::vector_store::VectorStore;

/// Identifies one step of a long-running operation for external progress
/// reporting (§5 "external progress reporting").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskStepId {
    pub task_id: String,
    pub step: u32,
}

pub trait ProgressSink: Send + Sync {
    fn on_step(&self, task_step: &TaskStepId, completed: usize, total: Option<usize>);
}

/// A search shortcut that desugars into a UDF column plus a filter or sort
/// (the "Search" supplemented feature).
#[derive(Debug, Clone)]
pub enum Search {
    Contains {
        path: Path,
        query: String,
    },
    Semantic {
        path: Path,
        embedding_signal: SignalDescriptor,
        query: Vec<f32>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct SelectRowsRequest {
    pub columns: Vec<ColumnRequest>,
    pub filters: Vec<Filter>,
    pub searches: Vec<Search>,
    pub sort_by: Vec<SortKey>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub resolve_spans: bool,
    pub combine_columns: bool,
}

#[derive(Debug, Clone)]
pub struct DatasetManifest {
    pub namespace: String,
    pub dataset: String,
    pub schema: Schema,
    pub num_items: usize,
}

#[derive(Debug, Clone)]
pub struct SelectRowsSchema {
    pub schema: Schema,
    pub alias_udf_paths: HashMap<String, Path>,
    pub search_results_paths: Vec<Path>,
    pub sort_results: Vec<SortKey>,
}

struct DatasetState {
    source_manifest: SourceManifest,
    source_storage: RowStorage,
    signals: Vec<SignalView>,
    vector_stores: HashMap<Path, VectorStore>,
    cached_view: Option<(SystemTime, Arc<MergeView>)>,
}

/// A single open dataset: source rows plus every discovered signal shard,
/// presented as one merged view (§5 "single-writer, multi-reader").
pub struct Dataset {
    dataset_dir: PathBuf,
    namespace: String,
    name: String,
    registry: SignalRegistry,
    config: EngineConfig,
    progress_sink: Option<Arc<dyn ProgressSink>>,
    state: Mutex<DatasetState>,
}

impl Dataset {
    pub fn open(
        root: &FsPath,
        namespace: impl Into<String>,
        name: impl Into<String>,
        registry: SignalRegistry,
        config: EngineConfig,
    ) -> Result<Self> {
        let namespace = namespace.into();
        let name = name.into();
        let dataset_dir = root.join(&namespace).join(&name);
        let source_manifest = SourceManifest::load(&dataset_dir)?;
        let source_storage = RowStorage::load(&dataset_dir, &source_manifest)?;

        let mut signals = Vec::new();
        let mut vector_stores = HashMap::new();
        discover_signals(&dataset_dir, &mut signals, &mut vector_stores)?;

        let state = DatasetState {
            source_manifest,
            source_storage,
            signals,
            vector_stores,
            cached_view: None,
        };

        Ok(Dataset {
            dataset_dir,
            namespace,
            name,
            registry,
            config,
            progress_sink: None,
            state: Mutex::new(state),
        })
    }

    /// Opens a dataset directly from its directory, inferring namespace and
    /// name from the last two path components (`<namespace>/<dataset>`) —
    /// the shape a CLI that only knows one directory argument needs.
    pub fn open_dir(
        dataset_dir: impl Into<PathBuf>,
        registry: SignalRegistry,
        config: EngineConfig,
    ) -> Result<Self> {
        let dataset_dir = dataset_dir.into();
        let name = dataset_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("dataset")
            .to_string();
        let namespace = dataset_dir
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or("default")
            .to_string();
        let root = dataset_dir
            .parent()
            .and_then(|p| p.parent())
            .map(PathBuf::from)
            .unwrap_or_else(|| dataset_dir.clone());
        Dataset::open(&root, namespace, name, registry, config)
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress_sink = Some(sink);
        self
    }

    fn notify(&self, task_step: Option<&TaskStepId>, completed: usize, total: Option<usize>) {
        if let (Some(sink), Some(task_step)) = (&self.progress_sink, task_step) {
            sink.on_step(task_step, completed, total);
        }
    }

    /// Rebuilds the merged view only when an on-disk mtime has advanced
    /// since the last build, guarded by `state`'s lock so two readers never
    /// race the rebuild (§5 "recomputation guarded by a process-wide mutex").
    fn view(&self) -> Result<Arc<MergeView>> {
        let mut state = self.state.lock();
        let current_mtime = row_storage::max_mtime(&self.dataset_dir)?;
        if let Some((cached_mtime, view)) = &state.cached_view {
            if *cached_mtime == current_mtime {
                return Ok(view.clone());
            }
        }
        let view = Arc::new(MergeView::build(
            &state.source_manifest,
            &state.source_storage,
            &state.signals,
        )?);
        state.cached_view = Some((current_mtime, view.clone()));
        Ok(view)
    }

    pub fn manifest(&self) -> Result<DatasetManifest> {
        let view = self.view()?;
        Ok(DatasetManifest {
            namespace: self.namespace.clone(),
            dataset: self.name.clone(),
            schema: view.schema().clone(),
            num_items: view.len(),
        })
    }

    #[instrument(skip(self, request), fields(namespace = %self.namespace, dataset = %self.name, columns = request.columns.len()))]
    pub fn select_rows(&self, request: SelectRowsRequest) -> Result<Vec<Row>> {
        let view = self.view()?;
        let (columns, extra_filters, extra_sorts) =
            desugar_searches(&request.columns, &request.searches, &self.registry)?;

        let mut filters = request.filters;
        filters.extend(extra_filters);
        let mut sorts = extra_sorts;
        sorts.extend(request.sort_by);

        let plan = planner::plan(
            view.schema(),
            &columns,
            filters,
            sorts,
            request.limit,
            request.offset,
            request.resolve_spans,
            request.combine_columns,
            &self.registry,
        )?;

        let state = self.state.lock();
        let exec_ctx = ExecutionContext {
            view: &view,
            vector_stores: &state.vector_stores,
        };
        executor::execute(&exec_ctx, plan)
    }

    /// Computes the output schema `select_rows` would produce for the same
    /// request, without running the query — used by callers (e.g. the CLI)
    /// to print column names/types ahead of execution.
    pub fn select_rows_schema(&self, request: &SelectRowsRequest) -> Result<SelectRowsSchema> {
        let view = self.view()?;
        let (columns, _, search_sorts) =
            desugar_searches(&request.columns, &request.searches, &self.registry)?;
        let planned = planner::plan_columns(view.schema(), &columns, &self.registry, false)?;

        let mut alias_udf_paths = HashMap::new();
        let mut search_results_paths = Vec::new();
        for column in &planned {
            if column.is_udf() {
                alias_udf_paths.insert(column.output_alias.clone(), column.read_path.clone());
            }
        }
        for search in &request.searches {
            search_results_paths.push(search_path(search));
        }

        let mut fields = FieldMap::new();
        for column in &planned {
            if column.output_alias == ROW_ID_COLUMN {
                continue;
            }
            let field = match &column.signal {
                Some(signal) => signal.fields(),
                None => view.schema().get_field(&column.declared_path)?.clone(),
            };
            fields.insert(column.output_alias.clone(), field);
        }

        let mut sort_results = search_sorts;
        sort_results.extend(request.sort_by.clone());

        Ok(SelectRowsSchema {
            schema: Schema::from_fields(fields),
            alias_udf_paths,
            search_results_paths,
            sort_results,
        })
    }

    /// Computes `signal` over `base_path` and writes it as a new signal
    /// shard, auto-computing any missing split/embedding dependency first
    /// (§4.9). Invalidates the cached merged view on success.
    #[instrument(
        skip(self, base_path, signal, task_step),
        fields(
            namespace = %self.namespace,
            dataset = %self.name,
            path = %base_path,
            task_step_id = ?task_step.as_ref().map(|t| format!("{}:{}", t.task_id, t.step)),
        )
    )]
    pub fn compute_signal(
        &self,
        base_path: &Path,
        signal: Box<dyn Signal>,
        task_step: Option<TaskStepId>,
    ) -> Result<SignalManifest> {
        let mut state = self.state.lock();
        let DatasetState {
            source_manifest,
            source_storage,
            signals,
            vector_stores,
            ..
        } = &mut *state;
        let mut ctx = WriteContext {
            dataset_dir: &self.dataset_dir,
            source_manifest,
            source_storage,
            existing_signals: signals,
            vector_stores,
            registry: &self.registry,
        };
        let manifest = enrichment::compute_signal(&mut ctx, base_path, signal)?;
        state.cached_view = None;
        self.notify(task_step.as_ref(), 1, Some(1));
        Ok(manifest)
    }

    pub fn stats(&self, path: &Path) -> Result<StatsResult> {
        let view = self.view()?;
        stats::stats(&view, path, self.config.sample_size)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn select_groups(
        &self,
        path: &Path,
        filters: Vec<Filter>,
        sort_by: SortBy,
        order: GroupOrder,
        limit: Option<usize>,
        bins: Option<&Bins>,
    ) -> Result<Vec<GroupCount>> {
        let view = self.view()?;
        stats::select_groups(
            &view,
            path,
            filters,
            sort_by,
            order,
            limit,
            bins,
            self.config.distinct_cap,
        )
    }

    /// Reads raw bytes for a binary leaf (images, audio). There is no
    /// `Value::Binary` variant; a `DataType::Binary` leaf stores a
    /// dataset-relative file path as a string, and this resolves it against
    /// `dataset_dir` and reads it from disk.
    pub fn media(&self, row_id: &str, path: &Path) -> Result<Vec<u8>> {
        let view = self.view()?;
        let field = planner::validate_leaf(view.schema(), path)?;
        if field.dtype() != Some(DataType::Binary) {
            return Err(LilacError::invalid_query(format!(
                "{path} is not a binary leaf"
            )));
        }
        let row = view
            .get(row_id)
            .ok_or_else(|| LilacError::not_found(format!("row {row_id}")))?;
        let value = executor::extract_for_path(row, path);
        let relative = value.as_str().ok_or_else(|| {
            LilacError::schema_mismatch(path.clone(), "binary leaf value is not a path string")
        })?;
        let file_path = self.dataset_dir.join(relative);
        std::fs::read(&file_path)
            .map_err(|e| LilacError::storage(format!("reading media {}: {e}", file_path.display())))
    }
}

/// Recursively discovers signal shard directories under `dir` (a
/// `signal_manifest.json` marks one; signal directories can nest, and a
/// directory with a partial write — a shard with no manifest yet — is
/// silently skipped per §9's crash-recovery rule).
fn discover_signals(
    dir: &FsPath,
    signals: &mut Vec<SignalView>,
    vector_stores: &mut HashMap<Path, VectorStore>,
) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| LilacError::storage(format!("reading dir {}: {e}", dir.display())))?;
    for entry in entries {
        let entry = entry.map_err(|e| LilacError::storage(format!("dir entry: {e}")))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let manifest_path = path.join(SIGNAL_MANIFEST_FILENAME);
        if manifest_path.exists() {
            let manifest = SignalManifest::load(&path)?;
            if manifest.files_exist(&path) {
                let source = SourceManifest::new(manifest.files.clone(), Schema::new());
                let storage = RowStorage::load(&path, &source)?;

                if let Some(embedding_filename) = &manifest.embedding_filename {
                    let store = VectorStore::load(&path.join(embedding_filename))?;
                    let output_path = manifest.enriched_path.child(manifest.signal.key().as_str());
                    vector_stores.insert(output_path, store);
                }

                signals.push(SignalView { manifest, storage });
            }
        }
        discover_signals(&path, signals, vector_stores)?;
    }
    Ok(())
}

fn search_alias(i: usize, path: &Path) -> String {
    format!("__search_{i}_{path}")
}

fn search_path(search: &Search) -> Path {
    match search {
        Search::Contains { path, .. } => path.clone(),
        Search::Semantic { path, .. } => path.clone(),
    }
}

/// Expands `Search` shortcuts into UDF `ColumnRequest`s plus the filter
/// (contains: require the UDF produced a match) or sort (semantic: rank by
/// descending score, letting the executor's top-k shortcut engage when a
/// `limit` is also set) that realizes the search.
fn desugar_searches(
    columns: &[ColumnRequest],
    searches: &[Search],
    registry: &SignalRegistry,
) -> Result<(Vec<ColumnRequest>, Vec<Filter>, Vec<SortKey>)> {
    let mut out_columns = columns.to_vec();
    let mut filters = Vec::new();
    let mut sorts = Vec::new();

    for (i, search) in searches.iter().enumerate() {
        match search {
            Search::Contains { path, query } => {
                let alias = search_alias(i, path);
                let descriptor = SignalDescriptor::new("substring_search")
                    .with_param("query", serde_json::json!(query));
                registry.construct(&descriptor)?;
                out_columns.push(ColumnRequest::udf(path.clone(), descriptor, alias.clone()));
                filters.push(Filter {
                    path: Path::from([alias.as_str()]),
                    op: FilterOp::Unary(UnaryOp::Exists),
                });
            }
            Search::Semantic {
                path,
                embedding_signal,
                query,
            } => {
                let alias = search_alias(i, path);
                let descriptor = embedding_signal.clone().with_param(
                    "query",
                    serde_json::Value::Array(query.iter().map(|v| serde_json::json!(v)).collect()),
                );
                registry.construct(&descriptor)?;
                out_columns.push(ColumnRequest::udf(path.clone(), descriptor, alias.clone()));
                sorts.push(SortKey {
                    path: Path::from([alias.as_str()]),
                    order: SortOrder::Desc,
                });
            }
        }
    }
    Ok((out_columns, filters, sorts))
}
