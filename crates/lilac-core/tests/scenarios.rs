//! End-to-end scenarios driven entirely through the public `Dataset`
//! facade — open, compute a signal, query, read stats — rather than the
//! individual module seams the unit tests already cover.

use std::collections::BTreeMap;

use lilac_core::dataset::{Search, SelectRowsRequest};
use lilac_core::path::Path;
use lilac_core::planner::ColumnRequest;
use lilac_core::schema::{DataType, Field, FieldMap, Schema, SignalDescriptor};
use lilac_core::signal::SignalRegistry;
use lilac_core::stats::{Bins, GroupOrder, SortBy};
use lilac_core::storage::manifest::SourceManifest;
use lilac_core::storage::parquet_shard;
use lilac_core::value::{Row, Value};
use lilac_core::{Dataset, EngineConfig};

/// Writes a source manifest and one shard under `<root>/ns/<name>/`, the
/// layout `Dataset::open` expects (§6).
fn seed_dataset(root: &std::path::Path, name: &str, fields: FieldMap, rows: Vec<Row>) -> std::path::PathBuf {
    let dataset_dir = root.join("ns").join(name);
    std::fs::create_dir_all(&dataset_dir).unwrap();
    let shard = dataset_dir.join("data-00000-of-00001.parquet");
    parquet_shard::write_shard(&shard, &rows).unwrap();
    let manifest = SourceManifest::new(
        vec!["data-00000-of-00001.parquet".to_string()],
        Schema::from_fields(fields),
    );
    manifest.save(&dataset_dir).unwrap();
    dataset_dir
}

fn open(root: &std::path::Path, name: &str) -> Dataset {
    Dataset::open(root, "ns", name, SignalRegistry::with_builtins(), EngineConfig::default()).unwrap()
}

#[test]
fn s1_basic_projection_through_the_dataset_facade() {
    let root = tempfile::tempdir().unwrap();
    let mut fields = FieldMap::new();
    fields.insert("str", Field::primitive(DataType::String));
    fields.insert("int", Field::primitive(DataType::Int32));
    let rows = vec![
        Row::new("1")
            .with_field("str", Value::String("a".into()))
            .with_field("int", Value::Int(1)),
        Row::new("2")
            .with_field("str", Value::String("b".into()))
            .with_field("int", Value::Int(2)),
    ];
    seed_dataset(root.path(), "basic", fields, rows);
    let ds = open(root.path(), "basic");

    let result = ds
        .select_rows(SelectRowsRequest {
            columns: vec![ColumnRequest::path(Path::normalize("str"))],
            ..Default::default()
        })
        .unwrap();

    assert_eq!(result.len(), 2);
    assert_eq!(result[0].fields.get("str"), Some(&Value::String("a".into())));
    assert!(result[0].fields.get("int").is_none());
}

#[test]
fn s2_sparse_signal_emits_null_for_exact_hello_through_the_dataset_facade() {
    let root = tempfile::tempdir().unwrap();
    let mut fields = FieldMap::new();
    fields.insert("text", Field::primitive(DataType::String));
    let rows = vec![
        Row::new("1").with_field("text", Value::String("hello".into())),
        Row::new("2").with_field("text", Value::String("hello world".into())),
    ];
    seed_dataset(root.path(), "sparse", fields, rows);
    let ds = open(root.path(), "sparse");

    let registry = SignalRegistry::with_builtins();
    let signal = registry.construct(&SignalDescriptor::new("test_sparse")).unwrap();
    ds.compute_signal(&Path::normalize("text"), signal, None).unwrap();

    let result = ds
        .select_rows(SelectRowsRequest {
            columns: vec![ColumnRequest::path(Path::normalize("text"))],
            ..Default::default()
        })
        .unwrap();

    assert_eq!(result.len(), 2);
    let value_at = |row_id: &str| -> Option<i64> {
        let row = result.iter().find(|r| r.row_id == row_id).unwrap();
        match row.fields.get("text") {
            Some(Value::Struct(inner)) => match inner.get("test_sparse()") {
                Some(Value::Int(n)) => Some(*n),
                Some(Value::Null) | None => None,
                other => panic!("unexpected test_sparse() value: {other:?}"),
            },
            other => panic!("expected text to be reshaped into a struct, got {other:?}"),
        }
    };
    assert_eq!(value_at("1"), None);
    assert_eq!(value_at("2"), Some(11));
}

#[test]
fn s3_split_embed_model_chain_auto_computes_dependencies() {
    let root = tempfile::tempdir().unwrap();
    let mut fields = FieldMap::new();
    fields.insert("text", Field::primitive(DataType::String));
    let rows = vec![
        Row::new("1").with_field("text", Value::String("hello world. hello world2.".into())),
    ];
    seed_dataset(root.path(), "chain", fields, rows);
    let ds = open(root.path(), "chain");

    let registry = SignalRegistry::with_builtins();
    let descriptor = SignalDescriptor::new("test_embedding_sum")
        .with_param("split", serde_json::json!("test_splitter()"))
        .with_param("embedding", serde_json::json!("test_embedding()"));
    let signal = registry.construct(&descriptor).unwrap();
    ds.compute_signal(&Path::normalize("text"), signal, None).unwrap();

    let manifest = ds.manifest().unwrap();
    // The exact dotted form of a parameterized key is an implementation
    // detail; what matters is that the splitter, embedding, and model all
    // got auto-computed and are each reachable somewhere in the merged
    // schema, named by their own signal key.
    let leaf_paths: Vec<String> = manifest.schema.leafs().into_iter().map(|(p, _)| p.to_string()).collect();
    for expected in ["test_splitter(", "test_embedding(", "test_embedding_sum("] {
        assert!(
            leaf_paths.iter().any(|p| p.contains(expected)),
            "expected a `{expected}` segment in the auto-computed chain, got {leaf_paths:?}"
        );
    }

    let rows = ds
        .select_rows(SelectRowsRequest {
            columns: vec![ColumnRequest::path(Path::normalize("text"))],
            ..Default::default()
        })
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[test]
fn s4_top_k_semantic_search_returns_highest_scoring_docs_first() {
    let root = tempfile::tempdir().unwrap();
    let mut fields = FieldMap::new();
    fields.insert("text", Field::primitive(DataType::String));
    // Deterministic embedding fixture is a function of (char count, vowel
    // count); score against query [1, 1] is (len+vowels)/sqrt(len²+vowels²),
    // maximized when len == vowels — "a" is the only all-vowel string here,
    // so it strictly outscores the other three.
    let rows = vec![
        Row::new("1").with_field("text", Value::String("a".into())),
        Row::new("2").with_field("text", Value::String("ab".into())),
        Row::new("3").with_field("text", Value::String("abc".into())),
        Row::new("4").with_field("text", Value::String("xyz".into())),
    ];
    seed_dataset(root.path(), "semantic", fields, rows);
    let ds = open(root.path(), "semantic");

    let registry = SignalRegistry::with_builtins();
    let embedding = registry.construct(&SignalDescriptor::new("test_embedding")).unwrap();
    ds.compute_signal(&Path::normalize("text"), embedding, None).unwrap();

    let result = ds
        .select_rows(SelectRowsRequest {
            columns: vec![ColumnRequest::path(Path::normalize("text"))],
            searches: vec![Search::Semantic {
                path: Path::normalize("text.test_embedding()"),
                embedding_signal: SignalDescriptor::new("test_semantic"),
                query: vec![1.0, 1.0],
            }],
            limit: Some(2),
            ..Default::default()
        })
        .unwrap();

    assert_eq!(result.len(), 2);
    let ids: Vec<&str> = result.iter().map(|r| r.row_id.as_str()).collect();
    // "a" (all vowels, len == vowel count) has the unique highest score;
    // "ab" is the runner-up over "abc" and "xyz".
    assert_eq!(ids[0], "1");
    assert_eq!(ids[1], "2");
}

#[test]
fn s5_bucketed_histogram_through_select_groups() {
    let root = tempfile::tempdir().unwrap();
    let mut fields = FieldMap::new();
    fields.insert("age", Field::primitive(DataType::Int32));
    let ages = [34, 45, 17, 80, 55];
    let rows = ages
        .iter()
        .enumerate()
        .map(|(i, age)| Row::new(i.to_string()).with_field("age", Value::Int(*age)))
        .collect();
    seed_dataset(root.path(), "ages", fields, rows);
    let ds = open(root.path(), "ages");

    let bins = Bins::with_labels(
        vec![20.0, 50.0, 65.0],
        vec![
            "young".to_string(),
            "adult".to_string(),
            "middle".to_string(),
            "senior".to_string(),
        ],
    )
    .unwrap();
    let groups = ds
        .select_groups(
            &Path::normalize("age"),
            Vec::new(),
            SortBy::Count,
            GroupOrder::Desc,
            None,
            Some(&bins),
        )
        .unwrap();

    let counts: BTreeMap<String, usize> = groups.into_iter().map(|g| (g.value, g.count)).collect();
    assert_eq!(counts.get("young"), Some(&1));
    assert_eq!(counts.get("adult"), Some(&2));
    assert_eq!(counts.get("middle"), Some(&1));
    assert_eq!(counts.get("senior"), Some(&1));
}

#[test]
fn s6_merged_schema_shows_the_leaf_with_enrichment_shape() {
    let root = tempfile::tempdir().unwrap();
    let mut fields = FieldMap::new();
    fields.insert("str", Field::primitive(DataType::String));
    let rows = vec![Row::new("1").with_field("str", Value::String("hi".into()))];
    seed_dataset(root.path(), "enrich", fields, rows);
    let ds = open(root.path(), "enrich");

    let before = ds.manifest().unwrap();
    let str_field_before = before.schema.fields().get("str").unwrap();
    assert!(str_field_before.is_leaf());

    let registry = SignalRegistry::with_builtins();
    let signal = registry.construct(&SignalDescriptor::new("text_statistics")).unwrap();
    ds.compute_signal(&Path::normalize("str"), signal, None).unwrap();

    let after = ds.manifest().unwrap();
    let str_field_after = after.schema.fields().get("str").unwrap();
    assert!(!str_field_after.is_leaf(), "enriched leaf should have reshaped into a struct");

    let value_field = after
        .schema
        .get_field(&Path::normalize("str.__value__"))
        .unwrap();
    assert_eq!(value_field.dtype(), Some(DataType::String));
    let signal_field = after
        .schema
        .get_field(&Path::normalize("str.text_statistics()"))
        .unwrap();
    assert_eq!(signal_field.dtype(), Some(DataType::Int32));
    assert_eq!(signal_field.derived_from(), Some(&Path::normalize("str")));
}
