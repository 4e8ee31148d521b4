//! Query planning: column normalization, UDF path resolution, filter/sort
//! classification and validation (§4.6).

use crate::error::{LilacError, Result};
use crate::path::Path;
use crate::schema::{DataType, Field, Schema, SignalDescriptor};
use crate::signal::{dependency, InputType, Signal, SignalRegistry};
use crate::storage::parquet_shard::ROW_ID_COLUMN;
use crate::value::Value;

/// A user-requested column: a bare path, or a path carrying an alias and/or
/// a signal UDF (§4.6).
#[derive(Debug, Clone)]
pub struct ColumnRequest {
    pub path: Path,
    pub alias: Option<String>,
    pub signal: Option<SignalDescriptor>,
}

impl ColumnRequest {
    pub fn path(path: Path) -> Self {
        ColumnRequest {
            path,
            alias: None,
            signal: None,
        }
    }

    pub fn udf(path: Path, signal: SignalDescriptor, alias: impl Into<String>) -> Self {
        ColumnRequest {
            path,
            alias: Some(alias.into()),
            signal: Some(signal),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Exists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOp {
    In,
}

#[derive(Debug, Clone)]
pub enum FilterOp {
    Binary(BinaryOp, Value),
    Unary(UnaryOp),
    List(ListOp, Vec<Value>),
}

/// A predicate on a column: either a leaf path or the alias of a UDF
/// column (§4.6 "a filter whose first path part is the alias of a UDF
/// column is a post-UDF filter").
#[derive(Debug, Clone)]
pub struct Filter {
    pub path: Path,
    pub op: FilterOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct SortKey {
    pub path: Path,
    pub order: SortOrder,
}

/// A column after path resolution: where to read it from, and (for UDFs)
/// the constructed signal plus whether it's a vector signal.
pub struct PlannedColumn {
    pub output_alias: String,
    pub declared_path: Path,
    pub read_path: Path,
    pub signal: Option<Box<dyn Signal>>,
}

impl PlannedColumn {
    pub fn is_udf(&self) -> bool {
        self.signal.is_some()
    }

    pub fn is_vector_udf(&self) -> bool {
        self.signal
            .as_ref()
            .map(|s| s.supports_vector_compute() || s.supports_vector_topk())
            .unwrap_or(false)
    }
}

/// The fully planned query: resolved columns plus filters/sorts classified
/// into pre-UDF (pushed to the scan) and post-UDF (applied in memory) (§4.6).
pub struct Plan {
    pub columns: Vec<PlannedColumn>,
    pub pre_filters: Vec<Filter>,
    pub post_filters: Vec<Filter>,
    pub pre_sort: Vec<SortKey>,
    pub post_sort: Vec<SortKey>,
    pub limit: Option<usize>,
    pub offset: usize,
    /// If false, `LIMIT`/`OFFSET` must be deferred to after UDF evaluation
    /// because a post-UDF sort key is present (§4.6 "Sort keys").
    pub apply_limit_in_scan: bool,
    pub resolve_spans: bool,
    pub combine_columns: bool,
}

/// Normalizes and resolves each requested column, auto-computing missing
/// dependency hops only when `allow_missing_dependencies` is set (write
/// path, §4.9 step 1) — otherwise a missing hop is a read-time
/// `MissingDependency` error (§4.5).
pub fn plan_columns(
    schema: &Schema,
    requests: &[ColumnRequest],
    registry: &SignalRegistry,
    allow_missing_dependencies: bool,
) -> Result<Vec<PlannedColumn>> {
    let mut planned = Vec::with_capacity(requests.len() + 1);
    planned.push(PlannedColumn {
        output_alias: ROW_ID_COLUMN.to_string(),
        declared_path: Path::from([ROW_ID_COLUMN]),
        read_path: Path::from([ROW_ID_COLUMN]),
        signal: None,
    });

    for request in requests {
        match &request.signal {
            None => {
                validate_selectable(schema, &request.path)?;
                planned.push(PlannedColumn {
                    output_alias: request.alias.clone().unwrap_or_else(|| request.path.to_string()),
                    declared_path: request.path.clone(),
                    read_path: request.path.clone(),
                    signal: None,
                });
            }
            Some(descriptor) => {
                validate_selectable(schema, &request.path)?;
                let signal = registry.construct(descriptor)?;
                let spec = signal.dependency();
                if !allow_missing_dependencies {
                    let missing = dependency::missing_dependencies(schema, &request.path, &spec);
                    if let Some(first) = missing.first() {
                        return Err(LilacError::missing_dependency(
                            descriptor.name.clone(),
                            first.to_string(),
                        ));
                    }
                }
                let mut resolved_via_fallback = false;
                let read_path = dependency::resolve_for_read(
                    schema,
                    &request.path,
                    &descriptor.name,
                    &spec,
                )
                .or_else(|err| {
                    if allow_missing_dependencies {
                        resolved_via_fallback = true;
                        Ok(request.path.clone())
                    } else {
                        Err(err)
                    }
                })?;
                if !resolved_via_fallback {
                    let input_dtype = schema.get_field(&read_path)?.dtype();
                    if !input_type_accepts(signal.compute_type(), input_dtype) {
                        return Err(LilacError::schema_mismatch(
                            read_path.clone(),
                            format!(
                                "signal `{}` expects {:?} input, found {:?} at `{}`",
                                descriptor.name,
                                signal.compute_type(),
                                input_dtype,
                                read_path
                            ),
                        ));
                    }
                }
                let alias = request
                    .alias
                    .clone()
                    .unwrap_or_else(|| signal.key(true));
                planned.push(PlannedColumn {
                    output_alias: alias,
                    declared_path: request.path.clone(),
                    read_path,
                    signal: Some(signal),
                });
            }
        }
    }
    Ok(planned)
}

/// Validates a plain (non-UDF) selected/filtered/sorted path against the
/// merged schema (§4.6 "Validation rules").
pub fn validate_selectable(schema: &Schema, path: &Path) -> Result<()> {
    schema.get_field(path)?;
    Ok(())
}

/// Whether a signal declaring `input_type` may read from a leaf of `dtype`
/// (§4.6 "signal dtype incompatible with the leaf dtype").
fn input_type_accepts(input_type: InputType, dtype: Option<DataType>) -> bool {
    matches!(
        (input_type, dtype),
        (InputType::Text, Some(DataType::String))
            | (InputType::Text, Some(DataType::StringSpan))
            | (InputType::TextEmbedding, Some(DataType::Embedding))
            | (InputType::Image, Some(DataType::Binary))
    )
}

pub fn validate_leaf(schema: &Schema, path: &Path) -> Result<&Field> {
    let field = schema.get_field(path)?;
    if !field.is_leaf() {
        return Err(LilacError::invalid_query(format!(
            "path {path} does not address a leaf"
        )));
    }
    Ok(field)
}

/// `EXISTS` is only meaningful on a repeated path (§4.6, §7 "EXISTS on
/// non-repeated or scalar violations").
pub fn validate_exists(schema: &Schema, path: &Path) -> Result<()> {
    let field = schema.get_field(path)?;
    if !field.is_repeated() {
        return Err(LilacError::invalid_query(format!(
            "EXISTS requires a repeated path, {path} is not repeated"
        )));
    }
    Ok(())
}

/// Classifies filters/sort keys against the set of UDF output aliases: a
/// predicate whose first path part names a UDF alias is post-UDF (§4.6).
pub fn classify_filters(filters: Vec<Filter>, udf_aliases: &[String]) -> (Vec<Filter>, Vec<Filter>) {
    filters
        .into_iter()
        .partition(|f| !is_udf_reference(&f.path, udf_aliases))
}

pub fn classify_sorts(sorts: Vec<SortKey>, udf_aliases: &[String]) -> (Vec<SortKey>, Vec<SortKey>) {
    sorts
        .into_iter()
        .partition(|s| !is_udf_reference(&s.path, udf_aliases))
}

fn is_udf_reference(path: &Path, udf_aliases: &[String]) -> bool {
    match path.first() {
        Some(crate::path::PathPart::Name(n)) => udf_aliases.iter().any(|a| a == n),
        _ => false,
    }
}

/// Builds a full [`Plan`] from request parts, applying the pre/post-UDF sort
/// classification rule that defers `LIMIT` whenever any sort key is post-UDF
/// (§4.6 "If any sort key is post-UDF, the pre-UDF scan must not apply LIMIT").
#[allow(clippy::too_many_arguments)]
pub fn plan(
    schema: &Schema,
    columns: &[ColumnRequest],
    filters: Vec<Filter>,
    sorts: Vec<SortKey>,
    limit: Option<usize>,
    offset: usize,
    resolve_spans: bool,
    combine_columns: bool,
    registry: &SignalRegistry,
) -> Result<Plan> {
    let planned_columns = plan_columns(schema, columns, registry, false)?;
    let udf_aliases: Vec<String> = planned_columns
        .iter()
        .filter(|c| c.is_udf())
        .map(|c| c.output_alias.clone())
        .collect();

    let (pre_filters, post_filters) = classify_filters(filters, &udf_aliases);
    let (pre_sort, post_sort) = classify_sorts(sorts, &udf_aliases);
    let apply_limit_in_scan = post_sort.is_empty();

    Ok(Plan {
        columns: planned_columns,
        pre_filters,
        post_filters,
        pre_sort,
        post_sort,
        limit,
        offset,
        apply_limit_in_scan,
        resolve_spans,
        combine_columns,
    })
}
