//! Python bindings for the Lilac dataset engine.
//!
//! Mirrors `datui-pyo3`'s role: a thin `pyo3` wrapper around the core
//! engine. Request and result shapes travel as JSON strings rather than a
//! hand-mirrored Python type for every core struct, so the core can grow
//! fields without a matching change here.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

use pyo3::exceptions::{PyFileNotFoundError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use lilac_core::dataset::{Search, SelectRowsRequest};
use lilac_core::path::Path;
use lilac_core::planner::ColumnRequest;
use lilac_core::schema::SignalDescriptor;
use lilac_core::signal::SignalRegistry;
use lilac_core::stats::{Bins, GroupOrder, SortBy};
use lilac_core::{Dataset, EngineConfig, LilacError};

/// Classifies a core error into the Python exception a caller would expect,
/// the way `error_for_python` classifies a `datui` report chain.
fn to_py_err(err: LilacError) -> PyErr {
    match err {
        LilacError::NotFound { what } => PyFileNotFoundError::new_err(what),
        LilacError::UnknownPath { .. }
        | LilacError::SchemaMismatch { .. }
        | LilacError::CardinalityError { .. }
        | LilacError::InvalidQuery { .. }
        | LilacError::MissingDependency { .. } => PyValueError::new_err(err.to_string()),
        LilacError::StorageError { .. } | LilacError::VectorStoreError { .. } => {
            PyRuntimeError::new_err(err.to_string())
        }
    }
}

/// Keeps a panic inside the core from unwinding across the Python FFI
/// boundary, turning it into a `RuntimeError` instead.
fn catch<T>(f: impl FnOnce() -> PyResult<T>) -> PyResult<T> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|_| Err(PyRuntimeError::new_err("lilac-core panicked; this is a bug")))
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> PyResult<String> {
    serde_json::to_string(value).map_err(|e| PyRuntimeError::new_err(format!("serializing {what}: {e}")))
}

fn parse_params(params: &str) -> PyResult<serde_json::Map<String, serde_json::Value>> {
    match serde_json::from_str(params) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(PyValueError::new_err("params must be a JSON object")),
        Err(e) => Err(PyValueError::new_err(format!("parsing params as JSON: {e}"))),
    }
}

#[pyclass(name = "Dataset")]
struct PyDataset {
    inner: Dataset,
}

#[pymethods]
impl PyDataset {
    #[new]
    #[pyo3(signature = (dataset_dir))]
    fn new(dataset_dir: PathBuf) -> PyResult<Self> {
        catch(|| {
            let inner = Dataset::open_dir(dataset_dir, SignalRegistry::with_builtins(), EngineConfig::default())
                .map_err(to_py_err)?;
            Ok(PyDataset { inner })
        })
    }

    /// Returns `{"namespace", "dataset", "num_items", "schema"}` as JSON.
    fn manifest(&self) -> PyResult<String> {
        catch(|| {
            let manifest = self.inner.manifest().map_err(to_py_err)?;
            Ok(serde_json::json!({
                "namespace": manifest.namespace,
                "dataset": manifest.dataset,
                "num_items": manifest.num_items,
                "schema": manifest.schema,
            })
            .to_string())
        })
    }

    /// `columns` are dotted leaf paths; `contains` is a list of
    /// `(path, query)` substring searches. Returns a JSON array of rows.
    #[pyo3(signature = (columns=Vec::new(), contains=Vec::new(), limit=None, offset=0, resolve_spans=false))]
    fn select_rows(
        &self,
        columns: Vec<String>,
        contains: Vec<(String, String)>,
        limit: Option<usize>,
        offset: usize,
        resolve_spans: bool,
    ) -> PyResult<String> {
        catch(|| {
            let columns = columns
                .into_iter()
                .map(|c| ColumnRequest::path(Path::normalize(&c)))
                .collect();
            let searches = contains
                .into_iter()
                .map(|(path, query)| Search::Contains {
                    path: Path::normalize(&path),
                    query,
                })
                .collect();
            let rows = self
                .inner
                .select_rows(SelectRowsRequest {
                    columns,
                    searches,
                    limit,
                    offset,
                    resolve_spans,
                    ..Default::default()
                })
                .map_err(to_py_err)?;
            to_json(&rows, "rows")
        })
    }

    fn stats(&self, path: String) -> PyResult<String> {
        catch(|| {
            let result = self.inner.stats(&Path::normalize(&path)).map_err(to_py_err)?;
            to_json(&result, "stats")
        })
    }

    #[pyo3(signature = (path, limit=None))]
    fn select_groups(&self, path: String, limit: Option<usize>) -> PyResult<String> {
        catch(|| {
            let groups = self
                .inner
                .select_groups(
                    &Path::normalize(&path),
                    Vec::new(),
                    SortBy::Count,
                    GroupOrder::Desc,
                    limit,
                    None::<&Bins>,
                )
                .map_err(to_py_err)?;
            to_json(&groups, "groups")
        })
    }

    /// Computes `signal_name(params)` over `path`, writes it as a new
    /// signal shard, and returns the resulting signal manifest as JSON.
    #[pyo3(signature = (path, signal_name, params="{}".to_string()))]
    fn compute_signal(&self, path: String, signal_name: String, params: String) -> PyResult<String> {
        catch(|| {
            let mut descriptor = SignalDescriptor::new(&signal_name);
            for (key, value) in parse_params(&params)? {
                descriptor = descriptor.with_param(key, value);
            }
            let registry = SignalRegistry::with_builtins();
            let signal = registry.construct(&descriptor).map_err(to_py_err)?;
            let manifest = self
                .inner
                .compute_signal(&Path::normalize(&path), signal, None)
                .map_err(to_py_err)?;
            to_json(&manifest, "signal manifest")
        })
    }

    /// Reads raw bytes for a binary leaf (images, audio) as a `bytes` object.
    fn media(&self, row_id: String, path: String) -> PyResult<Vec<u8>> {
        catch(|| self.inner.media(&row_id, &Path::normalize(&path)).map_err(to_py_err))
    }
}

#[pymodule]
fn lilac_pyo3(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyDataset>()?;
    Ok(())
}
