//! Dependency-chain resolution for signals whose parameters name another
//! signal's output (splitter → embedding → model) (§4.6 control flow, §9
//! "Dependency graph").

use crate::error::{LilacError, Result};
use crate::path::{Path, PathPart, VALUE_KEY};
use crate::schema::Schema;

/// A signal's declared dependencies, read from its own parameters: the key
/// of a required splitter and/or embedding signal (§4.5).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySpec {
    pub split: Option<String>,
    pub embedding: Option<String>,
}

impl DependencySpec {
    pub fn is_empty(&self) -> bool {
        self.split.is_none() && self.embedding.is_none()
    }
}

/// Builds the ordered chain of paths that must already exist in `schema`
/// before a signal with `spec` can read its input at `base_path`: the
/// splitter's value path, then (if there's also an embedding dependency)
/// the embedding's path nested under each split. Innermost first.
pub fn dependency_chain(base_path: &Path, spec: &DependencySpec) -> Vec<Path> {
    let mut chain = Vec::new();
    let mut current = base_path.clone();

    if let Some(split_key) = &spec.split {
        current = current.child(split_key.as_str());
        chain.push(current.clone());
        // A splitter's own output is repeated (one span per split); further
        // dependants read the split's *value*, one level down a wildcard.
        current = current.child(PathPart::Wildcard).child(VALUE_KEY);
    }

    if let Some(embedding_key) = &spec.embedding {
        let attach_at = current.without_value_key();
        current = attach_at.child(embedding_key.as_str());
        chain.push(current.clone());
    }

    chain
}

/// Resolves a signal's final input path for a **read**: every hop in its
/// dependency chain must already exist, or this fails with
/// `MissingDependency` naming the first absent one (§4.5, §7).
pub fn resolve_for_read(
    schema: &Schema,
    base_path: &Path,
    signal_name: &str,
    spec: &DependencySpec,
) -> Result<Path> {
    let chain = dependency_chain(base_path, spec);
    let mut resolved = base_path.clone();
    for dep_path in chain {
        if !path_exists_as_leaf_or_value(schema, &dep_path) {
            return Err(LilacError::missing_dependency(
                signal_name,
                dep_path.to_string(),
            ));
        }
        resolved = dep_path;
    }
    Ok(resolved)
}

/// Dependency hops in `spec`'s chain not yet present in `schema`, in the
/// order they'd need to be computed to satisfy a **write** (§4.9 step 1:
/// "auto-compute missing split/embedding subtrees recursively").
pub fn missing_dependencies(schema: &Schema, base_path: &Path, spec: &DependencySpec) -> Vec<Path> {
    dependency_chain(base_path, spec)
        .into_iter()
        .filter(|p| !path_exists_as_leaf_or_value(schema, p))
        .collect()
}

fn path_exists_as_leaf_or_value(schema: &Schema, path: &Path) -> bool {
    schema.contains_path(path) || schema.contains_path(&path.child(VALUE_KEY))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, Field, FieldMap};

    fn schema_with_split_and_embedding() -> Schema {
        let mut embedding_fields = FieldMap::new();
        embedding_fields.insert(VALUE_KEY, Field::primitive(DataType::StringSpan));
        embedding_fields.insert("test_embedding", Field::primitive(DataType::Embedding));
        let repeated = Field::struct_(embedding_fields);

        let mut text_fields = FieldMap::new();
        text_fields.insert(VALUE_KEY, Field::primitive(DataType::String));
        text_fields.insert("test_splitter", Field::list(repeated));

        let mut top = FieldMap::new();
        top.insert("text", Field::struct_(text_fields));
        Schema::from_fields(top)
    }

    #[test]
    fn resolve_for_read_succeeds_when_chain_present() {
        let schema = schema_with_split_and_embedding();
        let spec = DependencySpec {
            split: Some("test_splitter".to_string()),
            embedding: Some("test_embedding".to_string()),
        };
        let resolved = resolve_for_read(&schema, &Path::from(["text"]), "test_embedding_sum", &spec);
        assert!(resolved.is_ok());
    }

    #[test]
    fn resolve_for_read_fails_naming_missing_hop() {
        let schema = Schema::new();
        let spec = DependencySpec {
            split: Some("test_splitter".to_string()),
            embedding: None,
        };
        let err = resolve_for_read(&schema, &Path::from(["text"]), "test_splitter_reader", &spec)
            .unwrap_err();
        match err {
            LilacError::MissingDependency { signal, dependency } => {
                assert_eq!(signal, "test_splitter_reader");
                assert!(dependency.contains("test_splitter"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_dependencies_lists_only_absent_hops() {
        let mut text_fields = FieldMap::new();
        text_fields.insert(VALUE_KEY, Field::primitive(DataType::String));
        let mut top = FieldMap::new();
        top.insert("text", Field::struct_(text_fields));
        let schema = Schema::from_fields(top);

        let spec = DependencySpec {
            split: Some("test_splitter".to_string()),
            embedding: Some("test_embedding".to_string()),
        };
        let missing = missing_dependencies(&schema, &Path::from(["text"]), &spec);
        assert_eq!(missing.len(), 2);
    }
}
