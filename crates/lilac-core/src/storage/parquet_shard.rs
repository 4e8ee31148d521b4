//! Physical shard read/write.
//!
//! Lilac schemas are built at runtime and grow across signal shards, so a
//! generic dynamic nested-array builder would have to be reinvented for
//! every shape. Each shard instead carries two physical Arrow columns —
//! `__rowid__: Utf8` (a real, queryable row-key column) and `value: Utf8`
//! (a JSON encoding of that row's nested subtree) — while the logical
//! nested [`crate::schema::Schema`] lives in the sibling manifest. See
//! DESIGN.md "Storage encoding trade-off" for the reasoning.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path as FsPath;
use std::sync::Arc;

use arrow::array::{Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType as ArrowDataType, Field as ArrowField, Schema as ArrowSchema};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

use crate::error::{LilacError, Result};
use crate::value::{Row, Value};

pub const ROW_ID_COLUMN: &str = "__rowid__";
pub const VALUE_COLUMN: &str = "value";

fn shard_arrow_schema() -> ArrowSchema {
    ArrowSchema::new(vec![
        ArrowField::new(ROW_ID_COLUMN, ArrowDataType::Utf8, false),
        ArrowField::new(VALUE_COLUMN, ArrowDataType::Utf8, false),
    ])
}

/// Writes `rows` to a single parquet shard at `path`. Row-key uniqueness is
/// enforced by the caller (`row_storage::load_shards`), not here — a shard
/// alone does not see the rest of the dataset.
pub fn write_shard(path: &FsPath, rows: &[Row]) -> Result<()> {
    let row_ids: Vec<&str> = rows.iter().map(|r| r.row_id.as_str()).collect();
    let values: Result<Vec<String>> = rows
        .iter()
        .map(|r| {
            serde_json::to_string(&r.fields)
                .map_err(|e| LilacError::storage(format!("encoding row {}: {e}", r.row_id)))
        })
        .collect();
    let values = values?;
    let value_refs: Vec<&str> = values.iter().map(|s| s.as_str()).collect();

    let batch = RecordBatch::try_new(
        Arc::new(shard_arrow_schema()),
        vec![
            Arc::new(StringArray::from(row_ids)),
            Arc::new(StringArray::from(value_refs)),
        ],
    )
    .map_err(|e| LilacError::storage(format!("building record batch: {e}")))?;

    let file = File::create(path)
        .map_err(|e| LilacError::storage(format!("creating {}: {e}", path.display())))?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
        .map_err(|e| LilacError::storage(format!("opening parquet writer: {e}")))?;
    writer
        .write(&batch)
        .map_err(|e| LilacError::storage(format!("writing parquet batch: {e}")))?;
    writer
        .close()
        .map_err(|e| LilacError::storage(format!("closing parquet writer: {e}")))?;
    Ok(())
}

/// Reads every row out of a single parquet shard.
pub fn read_shard(path: &FsPath) -> Result<Vec<Row>> {
    let file = File::open(path)
        .map_err(|e| LilacError::storage(format!("opening {}: {e}", path.display())))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| LilacError::storage(format!("reading parquet footer: {e}")))?
        .build()
        .map_err(|e| LilacError::storage(format!("building parquet reader: {e}")))?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| LilacError::storage(format!("decoding batch: {e}")))?;
        let row_id_col = batch
            .column_by_name(ROW_ID_COLUMN)
            .ok_or_else(|| LilacError::storage(format!("shard {} missing {ROW_ID_COLUMN}", path.display())))?
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| LilacError::storage(format!("{ROW_ID_COLUMN} is not Utf8")))?;
        let value_col = batch
            .column_by_name(VALUE_COLUMN)
            .ok_or_else(|| LilacError::storage(format!("shard {} missing {VALUE_COLUMN}", path.display())))?
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| LilacError::storage(format!("{VALUE_COLUMN} is not Utf8")))?;

        for i in 0..batch.num_rows() {
            let row_id = row_id_col.value(i).to_string();
            let fields: BTreeMap<String, Value> = serde_json::from_str(value_col.value(i))
                .map_err(|e| LilacError::storage(format!("decoding row {row_id}: {e}")))?;
            rows.push(Row { row_id, fields });
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips_rows() {
        let dir = tempfile::tempdir().unwrap();
        let shard_path = dir.path().join("data-00000-of-00001.parquet");
        let rows = vec![
            Row::new("1").with_field("str", Value::String("a".into())),
            Row::new("2").with_field("str", Value::String("b".into())),
        ];
        write_shard(&shard_path, &rows).unwrap();

        let read_back = read_shard(&shard_path).unwrap();
        assert_eq!(read_back.len(), 2);
        assert_eq!(read_back[0].row_id, "1");
        assert_eq!(
            read_back[0].fields.get("str"),
            Some(&Value::String("a".into()))
        );
    }
}
