//! In-memory nested row/value representation, independent of storage format.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::path::Path;

/// A byte-offset span `{start, end}` referencing a source string (§3 "Spans").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(start: u32, end: u32) -> Self {
        Span { start, end }
    }

    pub fn shift(self, by: u32) -> Self {
        Span {
            start: self.start + by,
            end: self.end + by,
        }
    }

    /// Whether `self` lies fully within `parent` (§8 invariant 7).
    pub fn within(&self, parent: &Span) -> bool {
        self.start >= parent.start && self.end <= parent.end
    }
}

/// A nested value at a row's leaf or subtree. Mirrors the dtype tags in
/// [`crate::schema::DataType`] plus the struct/list container shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Span(Span),
    /// Present in the schema, physically absent from storage (§3 "Embeddings").
    /// Real values are fetched from the vector store keyed by row + path.
    Embedding,
    List(Vec<Value>),
    Struct(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_span(&self) -> Option<Span> {
        match self {
            Value::Span(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Deep-merge rule for `combine_columns=true` (§4.7 step 6): structs
    /// recurse, lists zip position-wise, equal primitives collapse, unequal
    /// primitives raise.
    pub fn merge(a: &Value, b: &Value, path: &Path) -> crate::error::Result<Value> {
        use crate::error::LilacError;
        match (a, b) {
            (Value::Null, other) | (other, Value::Null) => Ok(other.clone()),
            (Value::Struct(fa), Value::Struct(fb)) => {
                let mut merged = fa.clone();
                for (key, vb) in fb {
                    let next = match merged.get(key) {
                        Some(va) => Value::merge(va, vb, &path.child(key.as_str()))?,
                        None => vb.clone(),
                    };
                    merged.insert(key.clone(), next);
                }
                Ok(Value::Struct(merged))
            }
            (Value::List(la), Value::List(lb)) => {
                let len = la.len().max(lb.len());
                let mut out = Vec::with_capacity(len);
                for i in 0..len {
                    let va = la.get(i).unwrap_or(&Value::Null);
                    let vb = lb.get(i).unwrap_or(&Value::Null);
                    out.push(Value::merge(va, vb, path)?);
                }
                Ok(Value::List(out))
            }
            (x, y) if x == y => Ok(x.clone()),
            _ => Err(LilacError::cardinality(
                path.clone(),
                format!("conflicting merged values {a:?} vs {b:?}"),
            )),
        }
    }
}

/// One row: a stable row key plus its nested field values (§3 "Rows").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub row_id: String,
    pub fields: BTreeMap<String, Value>,
}

impl Row {
    pub fn new(row_id: impl Into<String>) -> Self {
        Row {
            row_id: row_id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}
