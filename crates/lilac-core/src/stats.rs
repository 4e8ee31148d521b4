//! Column statistics and bucketed group-by histograms (§4.8).

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{LilacError, Result};
use crate::executor::{apply_filters, compare_values, extract_for_path};
use crate::merge_view::MergeView;
use crate::path::Path;
use crate::planner::{validate_leaf, Filter};
use crate::value::Value;

/// Default sample size for `approx_count_distinct` and `avg_text_length`
/// (§4.8 "a sample of N rows (default 100 000)").
pub const DEFAULT_SAMPLE_SIZE: usize = 100_000;

/// Default cap on a categorical path's approx-distinct count before
/// `select_groups` requires explicit `bins` (§4.8).
pub const DEFAULT_DISTINCT_CAP: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsResult {
    pub total_count: usize,
    pub approx_count_distinct: usize,
    pub min_val: Option<Value>,
    pub max_val: Option<Value>,
    pub avg_text_length: Option<f64>,
}

/// Computes `stats(path)` over the merged view (§4.8).
///
/// Sampling is deterministic (a fixed stride over the scanned rows, no RNG)
/// so repeated calls against the same manifest agree, matching §5's
/// ordering guarantee.
pub fn stats(view: &MergeView, path: &Path, sample_size: usize) -> Result<StatsResult> {
    let field = validate_leaf(view.schema(), path)?;
    let dtype = field.dtype();

    let values: Vec<Value> = view
        .scan()
        .flat_map(|row| flatten_leaf_values(extract_for_path(row, path)))
        .filter(|v| !v.is_null())
        .collect();

    let total_count = values.len();
    let sample = sample_stride(&values, sample_size.max(1));

    let approx_count_distinct = if sample.is_empty() {
        0
    } else {
        let distinct_in_sample = count_distinct(&sample);
        let scale = (total_count as f64 / sample.len() as f64).max(1.0);
        ((distinct_in_sample as f64) * scale).round() as usize
    };

    let (min_val, max_val) = if dtype.is_some_and(|d| d.is_ordinal()) {
        min_max(&values)?
    } else {
        (None, None)
    };

    let avg_text_length = if matches!(dtype, Some(crate::schema::DataType::String | crate::schema::DataType::StringSpan)) {
        avg_length(&sample)
    } else {
        None
    };

    Ok(StatsResult {
        total_count,
        approx_count_distinct,
        min_val,
        max_val,
        avg_text_length,
    })
}

/// A repeated leaf path projects to nested lists; stats flatten every level
/// down to the scalar leaves, same as the executor's UDF input flattening.
fn flatten_leaf_values(value: Value) -> Vec<Value> {
    match value {
        Value::List(items) => items.into_iter().flat_map(flatten_leaf_values).collect(),
        other => vec![other],
    }
}

/// Takes an evenly-spaced stride of at most `sample_size` elements; no RNG,
/// so the same manifest always yields the same sample (§5 ordering).
fn sample_stride(values: &[Value], sample_size: usize) -> Vec<Value> {
    if values.len() <= sample_size {
        return values.to_vec();
    }
    let step = values.len() as f64 / sample_size as f64;
    (0..sample_size)
        .map(|i| values[((i as f64 * step) as usize).min(values.len() - 1)].clone())
        .collect()
}

fn count_distinct(values: &[Value]) -> usize {
    let mut seen: Vec<&Value> = Vec::new();
    for v in values {
        if !seen.iter().any(|s| values_equal(s, v)) {
            seen.push(v);
        }
    }
    seen.len()
}

fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b).map(|o| o == std::cmp::Ordering::Equal).unwrap_or(false)
}

fn min_max(values: &[Value]) -> Result<(Option<Value>, Option<Value>)> {
    let mut min: Option<&Value> = None;
    let mut max: Option<&Value> = None;
    for v in values {
        min = match min {
            None => Some(v),
            Some(cur) if compare_values(v, cur)? == std::cmp::Ordering::Less => Some(v),
            Some(cur) => Some(cur),
        };
        max = match max {
            None => Some(v),
            Some(cur) if compare_values(v, cur)? == std::cmp::Ordering::Greater => Some(v),
            Some(cur) => Some(cur),
        };
    }
    Ok((min.cloned(), max.cloned()))
}

fn avg_length(values: &[Value]) -> Option<f64> {
    let lengths: Vec<f64> = values.iter().filter_map(|v| v.as_str()).map(|s| s.chars().count() as f64).collect();
    if lengths.is_empty() {
        return None;
    }
    Some(lengths.iter().sum::<f64>() / lengths.len() as f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Count,
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOrder {
    Asc,
    Desc,
}

/// Numeric bucket boundaries for `select_groups`, with ±∞ sentinels on the
/// outer edges (§4.8 "bucket i such that bins[i-1] <= v < bins[i]").
#[derive(Debug, Clone)]
pub struct Bins {
    pub boundaries: Vec<f64>,
    pub labels: Option<Vec<String>>,
}

impl Bins {
    pub fn new(boundaries: Vec<f64>) -> Self {
        Bins { boundaries, labels: None }
    }

    pub fn with_labels(boundaries: Vec<f64>, labels: Vec<String>) -> Result<Self> {
        if labels.len() != boundaries.len() + 1 {
            return Err(LilacError::invalid_query(format!(
                "bins has {} boundaries but {} labels; expected {}",
                boundaries.len(),
                labels.len(),
                boundaries.len() + 1
            )));
        }
        Ok(Bins { boundaries, labels: Some(labels) })
    }

    /// Index `i` such that `boundaries[i-1] <= v < boundaries[i]`, with the
    /// outer edges acting as -inf/+inf.
    fn bucket_of(&self, v: f64) -> usize {
        self.boundaries.iter().position(|&b| v < b).unwrap_or(self.boundaries.len())
    }

    fn label_of(&self, bucket: usize) -> String {
        match &self.labels {
            Some(labels) => labels[bucket].clone(),
            None => {
                let lo = if bucket == 0 { "-inf".to_string() } else { self.boundaries[bucket - 1].to_string() };
                let hi = if bucket == self.boundaries.len() { "+inf".to_string() } else { self.boundaries[bucket].to_string() };
                format!("[{lo}, {hi})")
            }
        }
    }
}

/// One row of a `select_groups` result: the group's label and row count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupCount {
    pub value: String,
    pub count: usize,
}

#[allow(clippy::too_many_arguments)]
pub fn select_groups(
    view: &MergeView,
    path: &Path,
    filters: Vec<Filter>,
    sort_by: SortBy,
    order: GroupOrder,
    limit: Option<usize>,
    bins: Option<&Bins>,
    distinct_cap: usize,
) -> Result<Vec<GroupCount>> {
    let field = validate_leaf(view.schema(), path)?;
    let dtype = field.dtype();

    let rows: Vec<_> = view.scan().cloned().collect();
    let rows = apply_filters(rows, &filters)?;

    let is_numeric = dtype.is_some_and(|d| d.is_integer() || d.is_float());

    let mut counts: HashMap<String, usize> = HashMap::new();
    if is_numeric {
        let bins = bins.ok_or_else(|| {
            LilacError::invalid_query(format!("select_groups on numeric path {path} requires bins"))
        })?;
        for row in &rows {
            for v in flatten_leaf_values(extract_for_path(row, path)) {
                let Some(n) = as_f64(&v) else { continue };
                let bucket = bins.bucket_of(n);
                *counts.entry(bins.label_of(bucket)).or_insert(0) += 1;
            }
        }
    } else {
        if bins.is_none() {
            let distinct = count_distinct(
                &rows
                    .iter()
                    .flat_map(|row| flatten_leaf_values(extract_for_path(row, path)))
                    .filter(|v| !v.is_null())
                    .collect::<Vec<_>>(),
            );
            if distinct > distinct_cap {
                return Err(LilacError::cardinality(
                    path.clone(),
                    format!("{distinct} distinct values exceeds the cap of {distinct_cap} without bins"),
                ));
            }
        }
        for row in &rows {
            for v in flatten_leaf_values(extract_for_path(row, path)) {
                if v.is_null() {
                    continue;
                }
                let key = value_label(&v);
                *counts.entry(key).or_insert(0) += 1;
            }
        }
    }

    let mut groups: Vec<GroupCount> = counts
        .into_iter()
        .map(|(value, count)| GroupCount { value, count })
        .collect();

    groups.sort_by(|a, b| {
        let ord = match sort_by {
            SortBy::Count => a.count.cmp(&b.count),
            SortBy::Value => a.value.cmp(&b.value),
        };
        match order {
            GroupOrder::Asc => ord,
            GroupOrder::Desc => ord.reverse(),
        }
    });

    if let Some(n) = limit {
        groups.truncate(n);
    }

    Ok(groups)
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn value_label(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Bool(b) => b.to_string(),
        other => format!("{other:?}"),
    }
}
