//! Lilac's nested-columnar dataset engine: schema, storage, signal
//! enrichment, and query planning/execution (see `SPEC_FULL.md`).

pub mod config;
pub mod dataset;
pub mod enrichment;
pub mod error;
pub mod executor;
pub mod merge_view;
pub mod path;
pub mod planner;
pub mod schema;
pub mod signal;
pub mod signal_manifest;
pub mod stats;
pub mod storage;
pub mod value;
pub mod vector_store;

pub use config::EngineConfig;
pub use dataset::{Dataset, DatasetManifest, ProgressSink, Search, SelectRowsRequest, TaskStepId};
pub use error::{LilacError, Result};
pub use path::Path;
pub use schema::{DataType, Field, Schema, SignalDescriptor};
pub use signal::{Signal, SignalRegistry};
pub use value::{Row, Value};
