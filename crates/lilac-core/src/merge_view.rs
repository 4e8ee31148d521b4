//! Logical join of the source view with every signal view on row key (§4.3).
//!
//! Modeled as a plan, not a materialized table: [`MergeView::build`] is
//! re-run whenever [`crate::storage::row_storage::max_mtime`] advances past
//! the memoized value (§5 "Shared resources").

use std::collections::{BTreeMap, HashMap};

use crate::error::{LilacError, Result};
use crate::path::{Path, PathPart, VALUE_KEY};
use crate::schema::Schema;
use crate::signal_manifest::SignalManifest;
use crate::storage::manifest::SourceManifest;
use crate::storage::row_storage::RowStorage;
use crate::value::{Row, Value};

/// The field under which an enrichment writer stores its computed item in a
/// signal shard (§4.9 step 2: the UDF column is aliased `value`).
pub const SIGNAL_VALUE_FIELD: &str = "value";

/// One signal's manifest alongside its loaded rows.
pub struct SignalView {
    pub manifest: SignalManifest,
    pub storage: RowStorage,
}

/// The joined logical view: merged schema plus merged per-row values.
pub struct MergeView {
    pub schema: Schema,
    rows: HashMap<String, Row>,
    row_order: Vec<String>,
}

impl MergeView {
    pub fn build(
        source_manifest: &SourceManifest,
        source_storage: &RowStorage,
        signals: &[SignalView],
    ) -> Result<MergeView> {
        let mut schemas = vec![source_manifest.data_schema.clone()];
        schemas.extend(signals.iter().map(|s| s.manifest.data_schema.clone()));
        let schema = Schema::merge(&schemas)?;

        let row_order: Vec<String> = source_storage.scan().map(|r| r.row_id.clone()).collect();
        let mut rows: HashMap<String, Row> = source_storage
            .scan()
            .map(|r| (r.row_id.clone(), r.clone()))
            .collect();

        for signal in signals {
            let root_name = root_field_name(&signal.manifest.enriched_path)?;
            let remaining = &signal.manifest.enriched_path.parts()[1..];
            let signal_key = signal.manifest.signal.key();

            for row_id in &row_order {
                // Left-outer: rows the signal never touched stay unenriched.
                let Some(signal_row) = signal.storage.get(row_id) else {
                    continue;
                };
                let signal_value = signal_row
                    .fields
                    .get(SIGNAL_VALUE_FIELD)
                    .cloned()
                    .unwrap_or(Value::Null);

                let row = rows
                    .get_mut(row_id)
                    .expect("row_order is derived from rows' own keys");
                let existing = row.fields.remove(root_name).unwrap_or(Value::Null);
                let embedded = embed_signal_value(
                    existing,
                    remaining,
                    &signal_key,
                    signal_value,
                    &signal.manifest.enriched_path,
                )?;
                row.fields.insert(root_name.to_string(), embedded);
            }
        }

        Ok(MergeView {
            schema,
            rows,
            row_order,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn get(&self, row_id: &str) -> Option<&Row> {
        self.rows.get(row_id)
    }

    /// Rows in storage-defined order (§5 "Ordering guarantees": stable for a
    /// fixed manifest when no sort key is given).
    pub fn scan(&self) -> impl Iterator<Item = &Row> {
        self.row_order.iter().filter_map(move |id| self.rows.get(id))
    }

    pub fn len(&self) -> usize {
        self.row_order.len()
    }
}

fn root_field_name(path: &Path) -> Result<&str> {
    match path.first() {
        Some(PathPart::Name(n)) => Ok(n.as_str()),
        Some(PathPart::ValueKey) => Ok(VALUE_KEY),
        _ => Err(LilacError::invalid_query(
            "enriched path must start with a named field",
        )),
    }
}

/// Recursively walks `remaining` path parts, then promotes the leaf value
/// into `{__value__: existing, <signal_key>: signal_value}` (or inserts into
/// an already-promoted struct from a prior signal on the same leaf).
fn embed_signal_value(
    existing: Value,
    remaining: &[PathPart],
    signal_key: &str,
    signal_value: Value,
    full_path: &Path,
) -> Result<Value> {
    match remaining.split_first() {
        None => Ok(match existing {
            Value::Struct(mut fields) => {
                fields.insert(signal_key.to_string(), signal_value);
                Value::Struct(fields)
            }
            other => {
                let mut fields = BTreeMap::new();
                fields.insert(VALUE_KEY.to_string(), other);
                fields.insert(signal_key.to_string(), signal_value);
                Value::Struct(fields)
            }
        }),
        Some((PathPart::Wildcard, rest)) => {
            let existing_items = match existing {
                Value::List(items) => items,
                Value::Null => Vec::new(),
                _ => {
                    return Err(LilacError::schema_mismatch(
                        full_path.clone(),
                        "expected a list value at wildcard position",
                    ))
                }
            };
            let signal_items = match signal_value {
                Value::List(items) => items,
                Value::Null => vec![Value::Null; existing_items.len()],
                _ => {
                    return Err(LilacError::cardinality(
                        full_path.clone(),
                        "signal value at a repeated position must be a list",
                    ))
                }
            };
            if signal_items.len() != existing_items.len() {
                return Err(LilacError::cardinality(
                    full_path.clone(),
                    format!(
                        "signal produced {} items, expected {}",
                        signal_items.len(),
                        existing_items.len()
                    ),
                ));
            }
            let merged: Result<Vec<Value>> = existing_items
                .into_iter()
                .zip(signal_items)
                .map(|(e, s)| embed_signal_value(e, rest, signal_key, s, full_path))
                .collect();
            Ok(Value::List(merged?))
        }
        Some((head, rest)) => {
            let field_name = match head {
                PathPart::Name(n) => n.as_str(),
                PathPart::ValueKey => VALUE_KEY,
                PathPart::Wildcard => unreachable!("wildcard handled above"),
            };
            let mut fields = match existing {
                Value::Struct(fields) => fields,
                Value::Null => BTreeMap::new(),
                _ => {
                    return Err(LilacError::schema_mismatch(
                        full_path.clone(),
                        "expected a struct value at this path position",
                    ))
                }
            };
            let child = fields.remove(field_name).unwrap_or(Value::Null);
            let embedded = embed_signal_value(child, rest, signal_key, signal_value, full_path)?;
            fields.insert(field_name.to_string(), embedded);
            Ok(Value::Struct(fields))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, Field, FieldMap, SignalDescriptor};
    use crate::signal_manifest::make_parquet_id;
    use crate::storage::parquet_shard;

    fn source_manifest_and_storage(dir: &std::path::Path) -> (SourceManifest, RowStorage) {
        let mut fields = FieldMap::new();
        fields.insert("str", Field::primitive(DataType::String));
        let schema = Schema::from_fields(fields);
        let rows = vec![
            Row::new("1").with_field("str", Value::String("hello".into())),
            Row::new("2").with_field("str", Value::String("hello world".into())),
        ];
        let shard_path = dir.join("data-00000-of-00001.parquet");
        parquet_shard::write_shard(&shard_path, &rows).unwrap();
        let manifest = SourceManifest::new(
            vec!["data-00000-of-00001.parquet".to_string()],
            schema,
        );
        let storage = RowStorage::load(dir, &manifest).unwrap();
        (manifest, storage)
    }

    #[test]
    fn build_embeds_sparse_signal_value_at_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let (source_manifest, source_storage) = source_manifest_and_storage(dir.path());

        // S2: sparse signal — length unless input == "hello".
        let signal_dir = dir.path().join("str").join("test_sparse(0)");
        let signal_rows = vec![
            Row::new("1").with_field(SIGNAL_VALUE_FIELD, Value::Null),
            Row::new("2").with_field(SIGNAL_VALUE_FIELD, Value::Int(11)),
        ];
        let shard_path = signal_dir.join("data-00000-of-00001.parquet");
        std::fs::create_dir_all(&signal_dir).unwrap();
        parquet_shard::write_shard(&shard_path, &signal_rows).unwrap();

        let mut signal_subtree = FieldMap::new();
        signal_subtree.insert(VALUE_KEY, Field::primitive(DataType::String));
        signal_subtree.insert("test_sparse()", Field::primitive(DataType::Int32));
        let mut signal_schema_fields = FieldMap::new();
        signal_schema_fields.insert("str", Field::struct_(signal_subtree));
        let signal = SignalDescriptor::new("test_sparse");
        let enriched_path = Path::from(["str"]);
        let manifest = SignalManifest {
            files: vec!["data-00000-of-00001.parquet".to_string()],
            parquet_id: make_parquet_id(&signal, &enriched_path),
            data_schema: Schema::from_fields(signal_schema_fields),
            signal,
            enriched_path,
            embedding_filename: None,
        };
        let storage = RowStorage::load(&signal_dir, &manifest_source_for(&manifest)).unwrap();

        let view = MergeView::build(
            &source_manifest,
            &source_storage,
            &[SignalView { manifest, storage }],
        )
        .unwrap();

        let row1 = view.get("1").unwrap();
        let str_field = row1.fields.get("str").unwrap().as_struct().unwrap();
        assert_eq!(str_field.get(VALUE_KEY), Some(&Value::String("hello".into())));
        assert_eq!(str_field.get("test_sparse()"), Some(&Value::Null));

        let row2 = view.get("2").unwrap();
        let str_field2 = row2.fields.get("str").unwrap().as_struct().unwrap();
        assert_eq!(str_field2.get("test_sparse()"), Some(&Value::Int(11)));
    }

    // RowStorage::load only needs `.files`; build a throwaway SourceManifest
    // wrapper so the signal shard can be loaded with the same loader.
    fn manifest_source_for(signal_manifest: &SignalManifest) -> SourceManifest {
        SourceManifest::new(signal_manifest.files.clone(), Schema::new())
    }
}
