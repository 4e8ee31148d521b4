//! Polymorphic signal protocol: capability dispatch, registry, dependency
//! resolution, and the built-in test fixtures (§4.5).

pub mod builtin;
pub mod dependency;
pub mod registry;

use crate::error::{LilacError, Result};
use crate::path::Path;
use crate::schema::{Field, SignalDescriptor};
use crate::value::Value;
use crate::vector_store::{CompoundKey, VectorStore};

pub use dependency::DependencySpec;
pub use registry::SignalRegistry;

/// The input modality a signal reads (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    Text,
    TextEmbedding,
    Image,
}

/// Either raw text or a precomputed embedding, handed to a signal's `compute`.
#[derive(Debug, Clone)]
pub enum RichData {
    Text(String),
    Embedding(Vec<f32>),
}

impl RichData {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RichData::Text(t) => Some(t.as_str()),
            _ => None,
        }
    }
}

/// A named, parameterized, polymorphic computation over existing leaf data
/// (§4.5). Implements capability methods as defaulted, erroring stubs —
/// mirroring the original's ABC where only a subset of `compute` /
/// `vector_compute` / `vector_compute_topk` is overridden per concrete
/// signal — rather than a marker-trait-per-capability split, since the
/// registry and executor both need a single object-safe type to hold.
pub trait Signal: std::fmt::Debug + Send + Sync {
    fn descriptor(&self) -> SignalDescriptor;

    fn display_name(&self) -> String {
        self.descriptor().name.clone()
    }

    fn input_type(&self) -> InputType;

    fn compute_type(&self) -> InputType {
        self.input_type()
    }

    /// The schema subtree this signal produces at its enrichment site (§4.5).
    fn fields(&self) -> Field;

    /// `name + "(" + sorted_param_kv + ")"` by default; signals may override
    /// to guarantee uniqueness differently, e.g. by computed-vs-declared state.
    fn key(&self, _is_computed: bool) -> String {
        self.descriptor().key()
    }

    /// Declares which sibling signal outputs this signal reads, if any
    /// (§4.5 "Signal parameters ... encode dependencies").
    fn dependency(&self) -> DependencySpec {
        DependencySpec::default()
    }

    /// Whether this signal may emit `None` for some inputs (§4.5, §8 invariant 9).
    fn is_sparse(&self) -> bool {
        false
    }

    fn supports_compute(&self) -> bool {
        false
    }

    fn compute(&self, inputs: &[RichData]) -> Result<Vec<Option<Value>>> {
        Err(unsupported(self, "compute"))
    }

    fn supports_vector_compute(&self) -> bool {
        false
    }

    fn vector_compute(
        &self,
        _keys: &[CompoundKey],
        _store: &VectorStore,
    ) -> Result<Vec<Option<Value>>> {
        Err(unsupported(self, "vector_compute"))
    }

    fn supports_vector_topk(&self) -> bool {
        false
    }

    fn vector_compute_topk(
        &self,
        _k: usize,
        _store: &VectorStore,
        _restrict: Option<&[CompoundKey]>,
    ) -> Result<Vec<(CompoundKey, Value)>> {
        Err(unsupported(self, "vector_compute_topk"))
    }
}

fn unsupported(signal: &(impl Signal + ?Sized), method: &str) -> LilacError {
    LilacError::invalid_query(format!(
        "signal `{}` does not implement {method}",
        signal.descriptor().name
    ))
}

/// The full dotted address of a signal's output: the leaf path it reads
/// plus its own key (GLOSSARY "Enriched path"). `SignalManifest::enriched_path`
/// (§4.3, §6) instead stores the bare leaf path — the site the signal reads
/// from, used by `make_parquet_id`'s trailing-wildcard/value-key stripping —
/// so this helper is what planner/dependency code should use when it needs
/// the complete address including the signal's own subtree name.
pub fn full_output_path(base_path: &Path, signal: &dyn Signal) -> Path {
    base_path.child(signal.key(true).as_str())
}
