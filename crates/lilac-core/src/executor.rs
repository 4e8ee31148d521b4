//! Runs a planned query: scan → filter → project → sort → limit → UDF →
//! re-filter/sort → merge columns (§4.7).

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::instrument;

use crate::error::{LilacError, Result};
use crate::merge_view::MergeView;
use crate::path::{Path, PathPart, VALUE_KEY};
use crate::planner::{BinaryOp, Filter, FilterOp, ListOp, Plan, PlannedColumn, SortKey, SortOrder, UnaryOp};
use crate::schema::Schema;
use crate::signal::{RichData, Signal};
use crate::value::{Row, Value};
use crate::vector_store::{CompoundKey, KeyPart, VectorStore};

/// Everything the executor needs beyond the plan itself: the merged row
/// view and the per-path vector stores backing embedding/vector signals
/// (§5 "Shared resources": lazy-loaded, cached for the process lifetime).
pub struct ExecutionContext<'a> {
    pub view: &'a MergeView,
    pub vector_stores: &'a HashMap<Path, VectorStore>,
}

/// Runs `plan` to completion, returning the projected, filtered, sorted rows.
#[instrument(skip(ctx, plan), fields(columns = plan.columns.len()))]
pub fn execute(ctx: &ExecutionContext, plan: Plan) -> Result<Vec<Row>> {
    // 1. Scan.
    let mut rows: Vec<Row> = ctx.view.scan().cloned().collect();

    // 2. Span resolution.
    let needs_span_resolution =
        plan.resolve_spans || plan.columns.iter().any(|c| c.is_udf());
    if needs_span_resolution {
        rows = rows
            .iter()
            .map(|r| resolve_row_spans(ctx.view.schema(), r))
            .collect::<Result<Vec<_>>>()?;
    }

    // 3. Pre-UDF filter & sort.
    rows = apply_filters(rows, &plan.pre_filters)?;
    apply_sort(&mut rows, &plan.pre_sort)?;
    if plan.apply_limit_in_scan {
        rows = paginate(rows, plan.offset, plan.limit);
    }

    // 4. UDF evaluation.
    let mut already_sorted = false;
    for column in &plan.columns {
        let Some(signal) = column.signal.as_ref() else { continue };
        if column.is_vector_udf() && is_topk_shortcut(&plan, column) {
            let k = plan.limit.unwrap_or(0) + plan.offset;
            rows = apply_topk_shortcut(ctx, rows, column, signal.as_ref(), k)?;
            already_sorted = true;
        } else if column.is_vector_udf() {
            apply_vector_udf(ctx, &mut rows, column, signal.as_ref())?;
        } else {
            apply_compute_udf(&mut rows, column, signal.as_ref())?;
        }
    }

    // 5. Post-UDF filter & sort.
    rows = apply_filters(rows, &plan.post_filters)?;
    if !already_sorted {
        apply_sort(&mut rows, &plan.post_sort)?;
    }
    if !plan.apply_limit_in_scan {
        rows = paginate(rows, plan.offset, plan.limit);
    }

    // 6. Column merge.
    if plan.combine_columns {
        rows = rows
            .into_iter()
            .map(|r| combine_row(r, &plan.columns))
            .collect::<Result<Vec<_>>>()?;
    }

    // Final projection: only the requested output aliases survive.
    let allowed: HashSet<&str> = plan.columns.iter().map(|c| c.output_alias.as_str()).collect();
    for row in &mut rows {
        row.fields.retain(|k, _| allowed.contains(k.as_str()));
    }

    Ok(rows)
}

fn paginate(rows: Vec<Row>, offset: usize, limit: Option<usize>) -> Vec<Row> {
    let skipped: Vec<Row> = rows.into_iter().skip(offset).collect();
    match limit {
        Some(n) => skipped.into_iter().take(n).collect(),
        None => skipped,
    }
}

pub(crate) fn apply_filters(rows: Vec<Row>, filters: &[Filter]) -> Result<Vec<Row>> {
    if filters.is_empty() {
        return Ok(rows);
    }
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut keep = true;
        for filter in filters {
            let value = extract_for_path(&row, &filter.path);
            if !eval_filter(&value, &filter.op)? {
                keep = false;
                break;
            }
        }
        if keep {
            out.push(row);
        }
    }
    Ok(out)
}

fn eval_filter(value: &Value, op: &FilterOp) -> Result<bool> {
    match op {
        FilterOp::Binary(bop, rhs) => {
            let ord = compare_values(value, rhs)?;
            Ok(match bop {
                BinaryOp::Eq => ord == Ordering::Equal,
                BinaryOp::Ne => ord != Ordering::Equal,
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                BinaryOp::Ge => ord != Ordering::Less,
            })
        }
        FilterOp::Unary(UnaryOp::Exists) => Ok(match value {
            Value::List(items) => !items.is_empty(),
            Value::Null => false,
            _ => true,
        }),
        FilterOp::List(ListOp::In, candidates) => Ok(candidates.contains(value)),
    }
}

pub(crate) fn compare_values(a: &Value, b: &Value) -> Result<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => Ok(x.partial_cmp(y).unwrap_or(Ordering::Equal)),
        (Value::Int(x), Value::Float(y)) => Ok((*x as f64).partial_cmp(y).unwrap_or(Ordering::Equal)),
        (Value::Float(x), Value::Int(y)) => Ok(x.partial_cmp(&(*y as f64)).unwrap_or(Ordering::Equal)),
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        (Value::Null, Value::Null) => Ok(Ordering::Equal),
        (Value::Null, _) => Ok(Ordering::Less),
        (_, Value::Null) => Ok(Ordering::Greater),
        _ => Err(LilacError::invalid_query(format!(
            "cannot compare {a:?} with {b:?}"
        ))),
    }
}

fn apply_sort(rows: &mut [Row], keys: &[SortKey]) -> Result<()> {
    if keys.is_empty() {
        return Ok(());
    }
    let mut err = None;
    rows.sort_by(|a, b| {
        for key in keys {
            let va = sort_scalar(&extract_for_path(a, &key.path), key.order);
            let vb = sort_scalar(&extract_for_path(b, &key.path), key.order);
            let ord = match compare_values(&va, &vb) {
                Ok(o) => o,
                Err(e) => {
                    err.get_or_insert(e);
                    Ordering::Equal
                }
            };
            let ord = if key.order == SortOrder::Desc { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    match err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Sort on a repeated field aggregates to its min (ASC) or max (DESC)
/// element before comparison (§4.6 "sort on a repeated field requires
/// list-min (ASC) or list-max (DESC) aggregation").
fn sort_scalar(value: &Value, order: SortOrder) -> Value {
    match value {
        Value::List(items) if !items.is_empty() => {
            let mut best = items[0].clone();
            for item in &items[1..] {
                let better = match compare_values(item, &best) {
                    Ok(Ordering::Less) => order == SortOrder::Asc,
                    Ok(Ordering::Greater) => order == SortOrder::Desc,
                    _ => false,
                };
                if better {
                    best = item.clone();
                }
            }
            best
        }
        other => other.clone(),
    }
}

pub(crate) fn extract_for_path(row: &Row, path: &Path) -> Value {
    let root = Value::Struct(row.fields.clone());
    extract_at_path(&root, path.parts())
}

fn extract_at_path(value: &Value, parts: &[PathPart]) -> Value {
    match parts.split_first() {
        None => value.clone(),
        Some((PathPart::Wildcard, rest)) => match value {
            Value::List(items) => {
                Value::List(items.iter().map(|v| extract_at_path(v, rest)).collect())
            }
            _ => Value::Null,
        },
        Some((head, rest)) => {
            let name = field_name(head);
            match value {
                Value::Struct(fields) => match fields.get(name) {
                    Some(child) => extract_at_path(child, rest),
                    None => Value::Null,
                },
                _ => Value::Null,
            }
        }
    }
}

fn field_name(part: &PathPart) -> &str {
    match part {
        PathPart::Name(n) => n.as_str(),
        PathPart::ValueKey => VALUE_KEY,
        PathPart::Wildcard => unreachable!("caller handles wildcards separately"),
    }
}

/// Flattens a per-row extracted template (arbitrary list-nesting) into a
/// flat sequence of leaf values, in declared order (§4.7 step 4 "flatten").
fn flatten_values(value: &Value, out: &mut Vec<Value>) {
    match value {
        Value::List(items) => {
            for item in items {
                flatten_values(item, out);
            }
        }
        other => out.push(other.clone()),
    }
}

/// Inverse of [`flatten_values`]: rebuilds a value tree shaped like
/// `template`, consuming one flattened result per leaf slot.
fn unflatten_like(template: &Value, flat: &mut std::vec::IntoIter<Value>) -> Value {
    match template {
        Value::List(items) => {
            Value::List(items.iter().map(|t| unflatten_like(t, flat)).collect())
        }
        _ => flat.next().unwrap_or(Value::Null),
    }
}

fn apply_compute_udf(rows: &mut [Row], column: &PlannedColumn, signal: &dyn Signal) -> Result<()> {
    let templates: Vec<Value> = rows.iter().map(|r| extract_for_path(r, &column.read_path)).collect();
    let mut flat_inputs = Vec::new();
    for template in &templates {
        flatten_values(template, &mut flat_inputs);
    }
    let rich: Vec<RichData> = flat_inputs
        .iter()
        .map(|v| match v {
            Value::String(s) => RichData::Text(s.clone()),
            _ => RichData::Text(String::new()),
        })
        .collect();

    let flat_results = signal.compute(&rich)?;
    if !signal.is_sparse() && flat_results.len() != rich.len() {
        return Err(LilacError::cardinality(
            column.read_path.clone(),
            format!(
                "signal `{}` produced {} outputs for {} inputs",
                column.output_alias,
                flat_results.len(),
                rich.len()
            ),
        ));
    }

    let mut flat_values: std::vec::IntoIter<Value> = flat_results
        .into_iter()
        .map(|opt| opt.unwrap_or(Value::Null))
        .collect::<Vec<_>>()
        .into_iter();

    for (row, template) in rows.iter_mut().zip(templates.iter()) {
        let value = unflatten_like(template, &mut flat_values);
        row.fields.insert(column.output_alias.clone(), value);
    }
    Ok(())
}

fn vector_store_for<'a>(ctx: &'a ExecutionContext, path: &Path) -> Result<&'a VectorStore> {
    ctx.vector_stores
        .get(path)
        .ok_or_else(|| LilacError::vector_store(format!("no vector store loaded for {path}")))
}

fn apply_vector_udf(
    ctx: &ExecutionContext,
    rows: &mut [Row],
    column: &PlannedColumn,
    signal: &dyn Signal,
) -> Result<()> {
    let store = vector_store_for(ctx, &column.read_path)?;
    let templates: Vec<Value> = rows.iter().map(|r| extract_for_path(r, &column.read_path)).collect();
    let mut keys = Vec::new();
    for row in rows.iter() {
        collect_keys(row, &column.read_path, &mut keys);
    }

    let flat_results = signal.vector_compute(&keys, store)?;
    let mut flat_values: std::vec::IntoIter<Value> = flat_results
        .into_iter()
        .map(|opt| opt.unwrap_or(Value::Null))
        .collect::<Vec<_>>()
        .into_iter();

    for (row, template) in rows.iter_mut().zip(templates.iter()) {
        let value = unflatten_like(template, &mut flat_values);
        row.fields.insert(column.output_alias.clone(), value);
    }
    Ok(())
}

fn is_topk_shortcut(plan: &Plan, column: &PlannedColumn) -> bool {
    plan.limit.is_some()
        && plan.post_sort.len() == 1
        && plan.post_sort[0].order == SortOrder::Desc
        && matches!(
            plan.post_sort[0].path.first(),
            Some(PathPart::Name(n)) if n == &column.output_alias
        )
}

/// The top-k shortcut (§4.7 step 4, §8 invariant 6): row-level embeddings
/// only (a `CompoundKey` of exactly one part). Nested per-split top-k would
/// need per-position splicing into the output tree; out of scope for this
/// revision (see DESIGN.md).
fn apply_topk_shortcut(
    ctx: &ExecutionContext,
    rows: Vec<Row>,
    column: &PlannedColumn,
    signal: &dyn Signal,
    k: usize,
) -> Result<Vec<Row>> {
    let store = vector_store_for(ctx, &column.read_path)?;
    let ranked = signal.vector_compute_topk(k, store, None)?;

    let by_row: HashMap<String, Row> = rows.into_iter().map(|r| (r.row_id.clone(), r)).collect();
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (key, score) in ranked {
        if key.0.len() != 1 {
            continue;
        }
        let KeyPart::Str(row_id) = &key.0[0] else { continue };
        if !seen.insert(row_id.clone()) {
            continue;
        }
        if let Some(mut row) = by_row.get(row_id).cloned() {
            row.fields.insert(column.output_alias.clone(), score);
            out.push(row);
        }
    }
    Ok(out)
}

pub(crate) fn collect_keys(row: &Row, path: &Path, out: &mut Vec<CompoundKey>) {
    let mut prefix = vec![KeyPart::Str(row.row_id.clone())];
    let root = Value::Struct(row.fields.clone());
    collect_keys_rec(&root, path.parts(), &mut prefix, out);
}

fn collect_keys_rec(value: &Value, parts: &[PathPart], prefix: &mut Vec<KeyPart>, out: &mut Vec<CompoundKey>) {
    match parts.split_first() {
        None => out.push(CompoundKey::new(prefix.clone())),
        Some((PathPart::Wildcard, rest)) => {
            if let Value::List(items) = value {
                for (i, item) in items.iter().enumerate() {
                    prefix.push(KeyPart::Int(i as i64));
                    collect_keys_rec(item, rest, prefix, out);
                    prefix.pop();
                }
            }
        }
        Some((head, rest)) => {
            let name = field_name(head);
            if let Value::Struct(fields) = value {
                if let Some(child) = fields.get(name) {
                    collect_keys_rec(child, rest, prefix, out);
                }
            }
        }
    }
}

/// Replaces every `string_span` leaf's value with the substring of its
/// `derived_from` source (§4.7 step 2).
pub fn resolve_row_spans(schema: &Schema, row: &Row) -> Result<Row> {
    let mut resolved = row.clone();
    let root = Value::Struct(row.fields.clone());
    for (leaf_path, field) in schema.leafs() {
        if field.dtype() != Some(crate::schema::DataType::StringSpan) {
            continue;
        }
        let Some(source_path) = field.derived_from() else { continue };
        let source_value = extract_at_path(&root, source_path.parts());
        let Some(source_text) = source_value.as_str() else { continue };
        replace_spans(&mut resolved.fields, leaf_path.parts(), source_text);
    }
    Ok(resolved)
}

fn replace_spans(fields: &mut BTreeMap<String, Value>, parts: &[PathPart], source: &str) {
    let Some((head, rest)) = parts.split_first() else { return };
    match head {
        PathPart::Wildcard => {
            // A wildcard can't be the first part of a top-level leaf path here
            // since `fields` is always a struct map; unreachable in practice.
        }
        _ => {
            let name = field_name(head);
            if let Some(child) = fields.get_mut(name) {
                replace_spans_value(child, rest, source);
            }
        }
    }
}

fn replace_spans_value(value: &mut Value, parts: &[PathPart], source: &str) {
    match parts.split_first() {
        None => {
            if let Value::Span(span) = value {
                if let Some(text) = utf8_slice(source, span.start, span.end) {
                    *value = Value::String(text);
                }
            }
        }
        Some((PathPart::Wildcard, rest)) => {
            if let Value::List(items) = value {
                for item in items.iter_mut() {
                    replace_spans_value(item, rest, source);
                }
            }
        }
        Some((head, rest)) => {
            let name = field_name(head);
            if let Value::Struct(fields) = value {
                if let Some(child) = fields.get_mut(name) {
                    replace_spans_value(child, rest, source);
                }
            }
        }
    }
}

fn utf8_slice(source: &str, start: u32, end: u32) -> Option<String> {
    source.get(start as usize..end as usize).map(str::to_string)
}

/// `combine_columns=true`: re-nests every selected projection back under its
/// declared path and deep-merges overlapping subtrees into a single row
/// object (§4.7 step 6), rather than leaving each column as a flat top-level
/// alias. Idempotent by construction (§8 invariant 8): merging two
/// projections that share a prefix recurses structs/lists and collapses
/// equal primitives without conflict. Wildcards in a declared path are
/// treated as a literal `*` segment rather than expanded into a list —
/// UDF columns name their base path without a trailing wildcard in
/// practice, so this only matters for paths this executor doesn't plan.
fn combine_row(row: Row, columns: &[PlannedColumn]) -> Result<Row> {
    let mut merged = Value::Struct(BTreeMap::new());
    for column in columns {
        if column.output_alias == crate::storage::parquet_shard::ROW_ID_COLUMN {
            continue;
        }
        let Some(value) = row.fields.get(&column.output_alias) else { continue };
        let nested = nest_at(column.declared_path.parts(), value.clone());
        merged = Value::merge(&merged, &nested, &column.declared_path)?;
    }
    let fields = match merged {
        Value::Struct(fields) => fields,
        _ => BTreeMap::new(),
    };
    Ok(Row {
        row_id: row.row_id,
        fields,
    })
}

fn nest_at(parts: &[PathPart], value: Value) -> Value {
    match parts.split_first() {
        None => value,
        Some((head, rest)) => {
            let name = match head {
                PathPart::Wildcard => "*",
                other => field_name(other),
            };
            let mut fields = BTreeMap::new();
            fields.insert(name.to_string(), nest_at(rest, value));
            Value::Struct(fields)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::ColumnRequest;
    use crate::schema::{DataType, Field, FieldMap, SignalDescriptor};
    use crate::signal::SignalRegistry;
    use crate::storage::manifest::SourceManifest;
    use crate::storage::parquet_shard;
    use crate::storage::row_storage::RowStorage;

    fn build_view(dir: &std::path::Path, rows: Vec<Row>) -> MergeView {
        let mut fields = FieldMap::new();
        fields.insert("str", Field::primitive(DataType::String));
        fields.insert("int", Field::primitive(DataType::Int32));
        let schema = Schema::from_fields(fields);
        let shard = dir.join("data-00000-of-00001.parquet");
        parquet_shard::write_shard(&shard, &rows).unwrap();
        let manifest = SourceManifest::new(
            vec!["data-00000-of-00001.parquet".to_string()],
            schema,
        );
        let storage = RowStorage::load(dir, &manifest).unwrap();
        MergeView::build(&manifest, &storage, &[]).unwrap()
    }

    #[test]
    fn s1_basic_projection() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![
            Row::new("1")
                .with_field("str", Value::String("a".into()))
                .with_field("int", Value::Int(1)),
            Row::new("2")
                .with_field("str", Value::String("b".into()))
                .with_field("int", Value::Int(2)),
        ];
        let view = build_view(dir.path(), rows);
        let stores = HashMap::new();
        let ctx = ExecutionContext {
            view: &view,
            vector_stores: &stores,
        };
        let registry = SignalRegistry::new();
        let plan = crate::planner::plan(
            view.schema(),
            &[ColumnRequest::path(Path::from(["str"]))],
            vec![],
            vec![],
            None,
            0,
            false,
            false,
            &registry,
        )
        .unwrap();
        let result = execute(&ctx, plan).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].fields.get("str"), Some(&Value::String("a".into())));
        assert!(result[0].fields.get("int").is_none());
    }

    #[test]
    fn s2_sparse_signal_udf() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![
            Row::new("1")
                .with_field("str", Value::String("hello".into()))
                .with_field("int", Value::Int(1)),
            Row::new("2")
                .with_field("str", Value::String("hello world".into()))
                .with_field("int", Value::Int(2)),
        ];
        let view = build_view(dir.path(), rows);
        let stores = HashMap::new();
        let ctx = ExecutionContext {
            view: &view,
            vector_stores: &stores,
        };
        let registry = SignalRegistry::with_builtins();
        let request = ColumnRequest::udf(
            Path::from(["str"]),
            SignalDescriptor::new("test_sparse"),
            "sparse",
        );
        let plan = crate::planner::plan(
            view.schema(),
            &[request],
            vec![],
            vec![],
            None,
            0,
            false,
            false,
            &registry,
        )
        .unwrap();
        let result = execute(&ctx, plan).unwrap();
        assert_eq!(result[0].fields.get("sparse"), Some(&Value::Null));
        assert_eq!(result[1].fields.get("sparse"), Some(&Value::Int(11)));
    }

    #[test]
    fn filters_pre_udf_narrow_the_scan() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![
            Row::new("1").with_field("str", Value::String("a".into())).with_field("int", Value::Int(1)),
            Row::new("2").with_field("str", Value::String("b".into())).with_field("int", Value::Int(2)),
        ];
        let view = build_view(dir.path(), rows);
        let stores = HashMap::new();
        let ctx = ExecutionContext {
            view: &view,
            vector_stores: &stores,
        };
        let registry = SignalRegistry::new();
        let filter = Filter {
            path: Path::from(["int"]),
            op: FilterOp::Binary(BinaryOp::Gt, Value::Int(1)),
        };
        let plan = crate::planner::plan(
            view.schema(),
            &[ColumnRequest::path(Path::from(["str"]))],
            vec![filter],
            vec![],
            None,
            0,
            false,
            false,
            &registry,
        )
        .unwrap();
        let result = execute(&ctx, plan).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].row_id, "2");
    }
}
