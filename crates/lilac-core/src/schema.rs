//! Nested field types, leaf enumeration, and arrow-dtype mapping (§3, §4.1).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{LilacError, Result};
use crate::path::{Path, PathPart, VALUE_KEY};

/// Primitive leaf types (§3 "Schema").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    StringSpan,
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float16,
    Float32,
    Float64,
    Time,
    Date,
    Timestamp,
    Interval,
    Binary,
    /// Not physically stored in parquet; values live in the vector store (§3 "Embeddings").
    Embedding,
}

impl DataType {
    pub fn is_ordinal(self) -> bool {
        use DataType::*;
        matches!(
            self,
            Int8 | Int16
                | Int32
                | Int64
                | UInt8
                | UInt16
                | UInt32
                | UInt64
                | Float16
                | Float32
                | Float64
                | Time
                | Date
                | Timestamp
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::Float16 | DataType::Float32 | DataType::Float64)
    }

    pub fn is_integer(self) -> bool {
        use DataType::*;
        matches!(self, Int8 | Int16 | Int32 | Int64 | UInt8 | UInt16 | UInt32 | UInt64)
    }

    pub fn is_temporal(self) -> bool {
        matches!(self, DataType::Time | DataType::Date | DataType::Timestamp | DataType::Interval)
    }

    /// Maps a leaf dtype onto its physical arrow representation (§6 "Parquet row schema").
    pub fn to_arrow(self) -> arrow_schema::DataType {
        use arrow_schema::DataType as A;
        match self {
            DataType::String => A::Utf8,
            DataType::StringSpan => A::Struct(
                vec![
                    arrow_schema::Field::new("start", A::Int32, false),
                    arrow_schema::Field::new("end", A::Int32, false),
                ]
                .into(),
            ),
            DataType::Boolean => A::Boolean,
            DataType::Int8 => A::Int8,
            DataType::Int16 => A::Int16,
            DataType::Int32 => A::Int32,
            DataType::Int64 => A::Int64,
            DataType::UInt8 => A::UInt8,
            DataType::UInt16 => A::UInt16,
            DataType::UInt32 => A::UInt32,
            DataType::UInt64 => A::UInt64,
            DataType::Float16 => A::Float16,
            DataType::Float32 => A::Float32,
            DataType::Float64 => A::Float64,
            DataType::Time => A::Time64(arrow_schema::TimeUnit::Microsecond),
            DataType::Date => A::Date32,
            DataType::Timestamp => A::Timestamp(arrow_schema::TimeUnit::Microsecond, None),
            DataType::Interval => A::Interval(arrow_schema::IntervalUnit::MonthDayNano),
            DataType::Binary => A::Binary,
            // Embedding columns are written as physical nulls (§3 "Embeddings").
            DataType::Embedding => A::Null,
        }
    }

    /// Inverse of [`DataType::to_arrow`] for the subset of arrow types the engine emits.
    pub fn from_arrow(arrow_ty: &arrow_schema::DataType) -> Result<DataType> {
        use arrow_schema::DataType as A;
        Ok(match arrow_ty {
            A::Utf8 | A::LargeUtf8 => DataType::String,
            A::Boolean => DataType::Boolean,
            A::Int8 => DataType::Int8,
            A::Int16 => DataType::Int16,
            A::Int32 => DataType::Int32,
            A::Int64 => DataType::Int64,
            A::UInt8 => DataType::UInt8,
            A::UInt16 => DataType::UInt16,
            A::UInt32 => DataType::UInt32,
            A::UInt64 => DataType::UInt64,
            A::Float16 => DataType::Float16,
            A::Float32 => DataType::Float32,
            A::Float64 => DataType::Float64,
            A::Time64(_) | A::Time32(_) => DataType::Time,
            A::Date32 | A::Date64 => DataType::Date,
            A::Timestamp(_, _) => DataType::Timestamp,
            A::Interval(_) => DataType::Interval,
            A::Binary | A::LargeBinary => DataType::Binary,
            A::Null => DataType::Embedding,
            A::Struct(fields)
                if fields.len() == 2
                    && fields[0].name() == "start"
                    && fields[1].name() == "end" =>
            {
                DataType::StringSpan
            }
            other => {
                return Err(LilacError::schema_mismatch(
                    Path::root(),
                    format!("no dtype mapping for arrow type {other:?}"),
                ))
            }
        })
    }
}

/// Descriptor recorded on a Field produced by a signal: `name` plus sorted,
/// non-empty parameter key/value pairs (§4.5 `key(is_computed)`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl SignalDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        SignalDescriptor {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// `name + "(" + sorted_param_kv + ")"`, the default signal subtree name (§4.5).
    pub fn key(&self) -> String {
        let kv: Vec<String> = self
            .params
            .iter()
            .filter(|(_, v)| !is_empty_json(v))
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!("{}({})", self.name, kv.join(","))
    }
}

fn is_empty_json(v: &serde_json::Value) -> bool {
    matches!(v, serde_json::Value::Null)
        || matches!(v, serde_json::Value::String(s) if s.is_empty())
}

/// An ordered name→[`Field`] map. Order is preserved (not sorted) so leaf
/// enumeration matches the declared struct field order (§4.1).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMap(Vec<(String, Field)>);

impl FieldMap {
    pub fn new() -> Self {
        FieldMap(Vec::new())
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.0.iter_mut().find(|(n, _)| n == name).map(|(_, f)| f)
    }

    /// Inserts or overwrites the field named `name`, preserving its original
    /// position on overwrite and appending on insert.
    pub fn insert(&mut self, name: impl Into<String>, field: Field) {
        let name = name.into();
        if let Some(slot) = self.0.iter_mut().find(|(n, _)| n == &name) {
            slot.1 = field;
        } else {
            self.0.push((name, field));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Field)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Field)> for FieldMap {
    fn from_iter<T: IntoIterator<Item = (String, Field)>>(iter: T) -> Self {
        let mut map = FieldMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// A node in the schema tree: exactly one of primitive/struct/list (§3 "Schema").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node")]
pub enum Field {
    Primitive {
        dtype: DataType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<SignalDescriptor>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        derived_from: Option<Path>,
    },
    Struct {
        fields: FieldMap,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<SignalDescriptor>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        derived_from: Option<Path>,
    },
    List {
        repeated_field: Box<Field>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<SignalDescriptor>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        derived_from: Option<Path>,
    },
}

impl Field {
    pub fn primitive(dtype: DataType) -> Self {
        Field::Primitive {
            dtype,
            signal: None,
            derived_from: None,
        }
    }

    pub fn struct_(fields: FieldMap) -> Self {
        Field::Struct {
            fields,
            signal: None,
            derived_from: None,
        }
    }

    pub fn list(repeated_field: Field) -> Self {
        Field::List {
            repeated_field: Box::new(repeated_field),
            signal: None,
            derived_from: None,
        }
    }

    pub fn with_signal(mut self, descriptor: SignalDescriptor) -> Self {
        match &mut self {
            Field::Primitive { signal, .. }
            | Field::Struct { signal, .. }
            | Field::List { signal, .. } => *signal = Some(descriptor),
        }
        self
    }

    pub fn with_derived_from(mut self, path: Path) -> Self {
        match &mut self {
            Field::Primitive { derived_from, .. }
            | Field::Struct { derived_from, .. }
            | Field::List { derived_from, .. } => *derived_from = Some(path),
        }
        self
    }

    pub fn signal(&self) -> Option<&SignalDescriptor> {
        match self {
            Field::Primitive { signal, .. }
            | Field::Struct { signal, .. }
            | Field::List { signal, .. } => signal.as_ref(),
        }
    }

    pub fn derived_from(&self) -> Option<&Path> {
        match self {
            Field::Primitive { derived_from, .. }
            | Field::Struct { derived_from, .. }
            | Field::List { derived_from, .. } => derived_from.as_ref(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Field::Primitive { .. })
    }

    pub fn is_repeated(&self) -> bool {
        matches!(self, Field::List { .. })
    }

    pub fn dtype(&self) -> Option<DataType> {
        match self {
            Field::Primitive { dtype, .. } => Some(*dtype),
            _ => None,
        }
    }
}

/// A mapping from top-level field name to [`Field`] (§3 "Schema").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema(FieldMap);

impl Schema {
    pub fn new() -> Self {
        Schema(FieldMap::new())
    }

    pub fn from_fields(fields: FieldMap) -> Self {
        Schema(fields)
    }

    pub fn fields(&self) -> &FieldMap {
        &self.0
    }

    pub fn insert(&mut self, name: impl Into<String>, field: Field) {
        self.0.insert(name, field);
    }

    /// Depth-first leaf enumeration, struct field order preserved, descending
    /// through wildcards before any trailing value-key (§4.1). Order-
    /// preserving, not sorted — a `BTreeMap<Path, _>` would reorder leaves
    /// lexicographically and break that contract.
    pub fn leafs(&self) -> Vec<(Path, Field)> {
        let mut out = Vec::new();
        for (name, field) in self.0.iter() {
            collect_leafs(&Path::root().child(name.as_str()), field, &mut out);
        }
        out
    }

    pub fn get_field(&self, path: &Path) -> Result<&Field> {
        let mut parts = path.parts().iter();
        let first = parts
            .next()
            .ok_or_else(|| LilacError::invalid_query("empty path"))?;
        let name = part_field_name(first)?;
        let mut current = self
            .0
            .get(name)
            .ok_or_else(|| LilacError::unknown_path(path.clone()))?;
        for part in parts {
            current = descend(current, part, path)?;
        }
        Ok(current)
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.get_field(path).is_ok()
    }

    /// Deep union of schemas; conflicting dtypes at the same path raise
    /// [`LilacError::SchemaMismatch`]. Associative and commutative on
    /// non-conflicting inputs (§4.1).
    pub fn merge(schemas: &[Schema]) -> Result<Schema> {
        let mut merged = FieldMap::new();
        for schema in schemas {
            for (name, field) in schema.0.iter() {
                let next = match merged.get(name) {
                    Some(existing) => merge_fields(existing, field, &Path::root().child(name.as_str()))?,
                    None => field.clone(),
                };
                merged.insert(name.clone(), next);
            }
        }
        Ok(Schema(merged))
    }
}

fn part_field_name(part: &PathPart) -> Result<&str> {
    match part {
        PathPart::Name(n) => Ok(n.as_str()),
        PathPart::ValueKey => Ok(VALUE_KEY),
        PathPart::Wildcard => Err(LilacError::invalid_query(
            "path cannot begin with a wildcard",
        )),
    }
}

fn descend<'a>(field: &'a Field, part: &PathPart, full_path: &Path) -> Result<&'a Field> {
    match part {
        PathPart::Wildcard => match field {
            Field::List { repeated_field, .. } => Ok(repeated_field.as_ref()),
            _ => Err(LilacError::invalid_query(format!(
                "wildcard on non-repeated field at {full_path}"
            ))),
        },
        PathPart::Name(name) => match field {
            Field::Struct { fields, .. } => fields
                .get(name)
                .ok_or_else(|| LilacError::unknown_path(full_path.clone())),
            _ => Err(LilacError::unknown_path(full_path.clone())),
        },
        PathPart::ValueKey => match field {
            Field::Struct { fields, .. } => fields
                .get(VALUE_KEY)
                .ok_or_else(|| LilacError::unknown_path(full_path.clone())),
            _ => Err(LilacError::unknown_path(full_path.clone())),
        },
    }
}

fn collect_leafs(path: &Path, field: &Field, out: &mut Vec<(Path, Field)>) {
    match field {
        Field::Primitive { .. } => {
            out.push((path.clone(), field.clone()));
        }
        Field::Struct { fields, .. } => {
            for (name, child) in fields.iter() {
                collect_leafs(&path.child(name.as_str()), child, out);
            }
        }
        Field::List { repeated_field, .. } => {
            collect_leafs(&path.child(crate::path::PathPart::Wildcard), repeated_field, out);
        }
    }
}

fn merge_fields(a: &Field, b: &Field, path: &Path) -> Result<Field> {
    match (a, b) {
        (
            Field::Primitive { dtype: da, signal, derived_from },
            Field::Primitive { dtype: db, .. },
        ) => {
            if da != db {
                return Err(LilacError::schema_mismatch(
                    path.clone(),
                    format!("conflicting dtypes {da:?} vs {db:?}"),
                ));
            }
            Ok(Field::Primitive {
                dtype: *da,
                signal: signal.clone(),
                derived_from: derived_from.clone(),
            })
        }
        (
            Field::Struct { fields: fa, signal, derived_from },
            Field::Struct { fields: fb, .. },
        ) => {
            let mut merged = fa.clone();
            for (name, field_b) in fb.iter() {
                let next = match merged.get(name) {
                    Some(field_a) => merge_fields(field_a, field_b, &path.child(name.as_str()))?,
                    None => field_b.clone(),
                };
                merged.insert(name.clone(), next);
            }
            Ok(Field::Struct {
                fields: merged,
                signal: signal.clone(),
                derived_from: derived_from.clone(),
            })
        }
        (
            Field::List { repeated_field: ra, signal, derived_from },
            Field::List { repeated_field: rb, .. },
        ) => {
            let merged = merge_fields(ra, rb, &path.child(crate::path::PathPart::Wildcard))?;
            Ok(Field::List {
                repeated_field: Box::new(merged),
                signal: signal.clone(),
                derived_from: derived_from.clone(),
            })
        }
        // Leaf-with-enrichment promotion (§3): a signal's own schema expresses
        // its enrichment site as `Struct{__value__: <original dtype>, <signal_key>: ...}`.
        // Merging that against the still-bare source primitive reshapes the
        // leaf into a struct rather than conflicting, satisfying the
        // `merge(source_schema, ...signal_schemas...) == manifest().schema`
        // round-trip (§8 invariant 3).
        (Field::Primitive { dtype, signal, derived_from }, Field::Struct { .. })
        | (Field::Struct { .. }, Field::Primitive { dtype, signal, derived_from }) => {
            let (struct_fields, struct_signal, struct_derived_from) = match (a, b) {
                (Field::Struct { fields, signal, derived_from }, _)
                | (_, Field::Struct { fields, signal, derived_from }) => {
                    (fields, signal, derived_from)
                }
                _ => unreachable!(),
            };
            let value_field = struct_fields.get(VALUE_KEY).ok_or_else(|| {
                LilacError::schema_mismatch(
                    path.clone(),
                    "struct lacks __value__ sibling for leaf promotion",
                )
            })?;
            if value_field.dtype() != Some(*dtype) {
                return Err(LilacError::schema_mismatch(
                    path.clone(),
                    format!(
                        "__value__ dtype {:?} does not match original leaf dtype {dtype:?}",
                        value_field.dtype()
                    ),
                ));
            }
            let mut promoted = FieldMap::new();
            promoted.insert(
                VALUE_KEY,
                Field::Primitive {
                    dtype: *dtype,
                    signal: signal.clone(),
                    derived_from: derived_from.clone(),
                },
            );
            let promoted_struct = Field::Struct {
                fields: promoted,
                signal: None,
                derived_from: None,
            };
            merge_fields(
                &promoted_struct,
                &Field::Struct {
                    fields: struct_fields.clone(),
                    signal: struct_signal.clone(),
                    derived_from: struct_derived_from.clone(),
                },
                path,
            )
        }
        _ => Err(LilacError::schema_mismatch(
            path.clone(),
            "struct/list/primitive kind mismatch",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_field() -> Field {
        Field::primitive(DataType::String)
    }

    #[test]
    fn leafs_enumerates_depth_first_in_declared_order() {
        let mut top = FieldMap::new();
        top.insert("b", string_field());
        top.insert("a", string_field());
        let schema = Schema::from_fields(top);
        let leafs: Vec<String> = schema.leafs().into_iter().map(|(p, _)| p.to_string()).collect();
        // Declared order preserved: "b" was inserted before "a", so it comes
        // first, not alphabetically.
        assert_eq!(leafs, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn leafs_treats_string_span_as_leaf() {
        let mut top = FieldMap::new();
        top.insert("span", Field::primitive(DataType::StringSpan));
        let schema = Schema::from_fields(top);
        assert_eq!(schema.leafs().len(), 1);
    }

    #[test]
    fn get_field_resolves_wildcard_and_value_key() {
        let mut inner = FieldMap::new();
        inner.insert(VALUE_KEY, string_field());
        let repeated = Field::struct_(inner);
        let mut top = FieldMap::new();
        top.insert("text", Field::list(repeated));
        let schema = Schema::from_fields(top);

        let path = Path::normalize("text.*.__value__");
        let field = schema.get_field(&path).unwrap();
        assert_eq!(field.dtype(), Some(DataType::String));
    }

    #[test]
    fn get_field_rejects_unknown_path() {
        let schema = Schema::new();
        let err = schema.get_field(&Path::from(["missing"])).unwrap_err();
        assert!(matches!(err, LilacError::UnknownPath { .. }));
    }

    #[test]
    fn merge_is_associative_on_disjoint_fields() {
        let mut fa = FieldMap::new();
        fa.insert("a", string_field());
        let mut fb = FieldMap::new();
        fb.insert("b", string_field());
        let sa = Schema::from_fields(fa);
        let sb = Schema::from_fields(fb);

        let merged_ab = Schema::merge(&[sa.clone(), sb.clone()]).unwrap();
        let merged_ba = Schema::merge(&[sb, sa]).unwrap();
        assert_eq!(merged_ab.leafs().len(), 2);
        assert_eq!(merged_ba.leafs().len(), 2);
    }

    #[test]
    fn merge_rejects_conflicting_dtypes() {
        let mut fa = FieldMap::new();
        fa.insert("a", Field::primitive(DataType::String));
        let mut fb = FieldMap::new();
        fb.insert("a", Field::primitive(DataType::Int32));
        let err = Schema::merge(&[Schema::from_fields(fa), Schema::from_fields(fb)]).unwrap_err();
        assert!(matches!(err, LilacError::SchemaMismatch { .. }));
    }

    #[test]
    fn leaf_with_enrichment_reshapes_primitive_into_struct() {
        // §3 "Leaf-with-enrichment convention" / S6.
        let mut enriched = FieldMap::new();
        enriched.insert(VALUE_KEY, string_field());
        let mut signal_fields = FieldMap::new();
        signal_fields.insert("len", Field::primitive(DataType::Int32));
        enriched.insert(
            "test_signal",
            Field::struct_(signal_fields).with_derived_from(Path::from(["str", VALUE_KEY])),
        );
        let mut top = FieldMap::new();
        top.insert("str", Field::struct_(enriched));
        let schema = Schema::from_fields(top);

        assert!(schema.contains_path(&Path::from(["str", VALUE_KEY])));
        assert!(schema.contains_path(&Path::from(["str", "test_signal", "len"])));
    }

    #[test]
    fn dtype_arrow_round_trips_for_primitives() {
        for dtype in [
            DataType::String,
            DataType::Boolean,
            DataType::Int32,
            DataType::Float64,
            DataType::Binary,
        ] {
            let arrow_ty = dtype.to_arrow();
            assert_eq!(DataType::from_arrow(&arrow_ty).unwrap(), dtype);
        }
    }

    #[test]
    fn embedding_maps_to_physical_null() {
        assert_eq!(DataType::Embedding.to_arrow(), arrow_schema::DataType::Null);
    }

    #[test]
    fn merge_promotes_leaf_into_struct_for_signal_schema() {
        // §8 invariant 3: merge(source_schema, signal_schema) == manifest schema.
        let mut source_fields = FieldMap::new();
        source_fields.insert("str", string_field());
        let source_schema = Schema::from_fields(source_fields);

        let mut signal_subtree = FieldMap::new();
        signal_subtree.insert(VALUE_KEY, string_field());
        let mut signal_fields = FieldMap::new();
        signal_fields.insert("len", Field::primitive(DataType::Int32));
        signal_subtree.insert(
            "test_signal",
            Field::struct_(signal_fields).with_derived_from(Path::from(["str", VALUE_KEY])),
        );
        let mut signal_top = FieldMap::new();
        signal_top.insert("str", Field::struct_(signal_subtree));
        let signal_schema = Schema::from_fields(signal_top);

        let merged = Schema::merge(&[source_schema, signal_schema]).unwrap();
        assert!(merged.contains_path(&Path::from(["str", VALUE_KEY])));
        assert!(merged.contains_path(&Path::from(["str", "test_signal", "len"])));
    }

    #[test]
    fn merge_accepts_two_sibling_signals_on_the_same_leaf() {
        let mut source_fields = FieldMap::new();
        source_fields.insert("str", string_field());
        let source_schema = Schema::from_fields(source_fields);

        let make_signal_schema = |signal_name: &str| {
            let mut subtree = FieldMap::new();
            subtree.insert(VALUE_KEY, string_field());
            subtree.insert(signal_name, Field::primitive(DataType::Int32));
            let mut top = FieldMap::new();
            top.insert("str", Field::struct_(subtree));
            Schema::from_fields(top)
        };

        let merged = Schema::merge(&[
            source_schema,
            make_signal_schema("sig_a"),
            make_signal_schema("sig_b"),
        ])
        .unwrap();
        assert!(merged.contains_path(&Path::from(["str", "sig_a"])));
        assert!(merged.contains_path(&Path::from(["str", "sig_b"])));
    }
}
