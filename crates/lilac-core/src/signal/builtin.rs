//! Built-in signal fixtures (SPEC_FULL §12), grounded in the original
//! `substring_search`/`text_statistics`/`splitters/chunk_splitter` signals:
//! just enough of a test corpus to construct the engine's own end-to-end
//! scenarios. Not a production NLP signal library (those stay external,
//! §1 non-goals).

use crate::error::{LilacError, Result};
use crate::path::Path;
use crate::schema::{DataType, Field, SignalDescriptor};
use crate::signal::{DependencySpec, InputType, RichData, Signal};
use crate::value::{Span, Value};
use crate::vector_store::{CompoundKey, VectorStore};

use super::registry::SignalRegistry;

pub fn register_all(registry: &mut SignalRegistry) {
    registry.register("text_statistics", |_| Ok(Box::new(TextStatisticsSignal)));
    registry.register("test_sparse", |_| Ok(Box::new(TestSparseSignal)));
    registry.register("test_splitter", |_| Ok(Box::new(TestSplitterSignal)));
    registry.register("test_embedding", |_| Ok(Box::new(TestEmbeddingSignal)));
    registry.register("test_embedding_sum", |descriptor| {
        Ok(Box::new(TestEmbeddingSumSignal {
            descriptor: descriptor.clone(),
        }))
    });
    registry.register("test_semantic", |descriptor| {
        Ok(Box::new(TestSemanticSignal::from_descriptor(descriptor)?))
    });
    registry.register("substring_search", |descriptor| {
        let query = param_str(descriptor, "query").unwrap_or_default();
        Ok(Box::new(SubstringSearchSignal::new(query)))
    });
}

/// Dense length-counting signal, grounded on `text_statistics.py`.
#[derive(Debug)]
pub struct TextStatisticsSignal;

impl Signal for TextStatisticsSignal {
    fn descriptor(&self) -> SignalDescriptor {
        SignalDescriptor::new("text_statistics")
    }

    fn input_type(&self) -> InputType {
        InputType::Text
    }

    fn fields(&self) -> Field {
        Field::primitive(DataType::Int32)
    }

    fn supports_compute(&self) -> bool {
        true
    }

    fn compute(&self, inputs: &[RichData]) -> Result<Vec<Option<Value>>> {
        inputs
            .iter()
            .map(|input| {
                let text = input
                    .as_text()
                    .ok_or_else(|| LilacError::invalid_query("text_statistics requires text input"))?;
                Ok(Some(Value::Int(text.chars().count() as i64)))
            })
            .collect()
    }
}

/// Sparse fixture: length unless the input is exactly `"hello"` (S2).
#[derive(Debug)]
pub struct TestSparseSignal;

impl Signal for TestSparseSignal {
    fn descriptor(&self) -> SignalDescriptor {
        SignalDescriptor::new("test_sparse")
    }

    fn input_type(&self) -> InputType {
        InputType::Text
    }

    fn fields(&self) -> Field {
        Field::primitive(DataType::Int32)
    }

    fn is_sparse(&self) -> bool {
        true
    }

    fn supports_compute(&self) -> bool {
        true
    }

    fn compute(&self, inputs: &[RichData]) -> Result<Vec<Option<Value>>> {
        Ok(inputs
            .iter()
            .map(|input| match input.as_text() {
                Some("hello") => None,
                Some(text) => Some(Value::Int(text.chars().count() as i64)),
                None => None,
            })
            .collect())
    }
}

/// Sentence splitter, grounded on `splitters/chunk_splitter.py`: breaks on
/// `.` boundaries, keeping byte offsets into the source string (S3).
#[derive(Debug)]
pub struct TestSplitterSignal;

impl Signal for TestSplitterSignal {
    fn descriptor(&self) -> SignalDescriptor {
        SignalDescriptor::new("test_splitter")
    }

    fn input_type(&self) -> InputType {
        InputType::Text
    }

    fn fields(&self) -> Field {
        Field::list(Field::primitive(DataType::StringSpan))
    }

    fn supports_compute(&self) -> bool {
        true
    }

    fn compute(&self, inputs: &[RichData]) -> Result<Vec<Option<Value>>> {
        inputs
            .iter()
            .map(|input| {
                let text = input
                    .as_text()
                    .ok_or_else(|| LilacError::invalid_query("test_splitter requires text input"))?;
                let spans: Vec<Value> = split_sentences(text)
                    .into_iter()
                    .map(|(start, end)| Value::Span(Span::new(start, end)))
                    .collect();
                Ok(Some(Value::List(spans)))
            })
            .collect()
    }
}

fn split_sentences(text: &str) -> Vec<(u32, u32)> {
    let mut spans = Vec::new();
    let mut start = 0usize;
    for (i, c) in text.char_indices() {
        if c == '.' {
            let end = i + c.len_utf8();
            spans.push((start as u32, end as u32));
            start = end;
        }
    }
    if start < text.len() {
        spans.push((start as u32, text.len() as u32));
    }
    spans
}

/// Deterministic two-dimensional text embedding fixture (S3, S4): a function
/// of length and vowel count, small and reproducible rather than anything
/// claiming semantic meaning.
#[derive(Debug)]
pub struct TestEmbeddingSignal;

impl TestEmbeddingSignal {
    pub fn embed(text: &str) -> Vec<f32> {
        let len = text.chars().count() as f32;
        let vowels = text
            .chars()
            .filter(|c| "aeiouAEIOU".contains(*c))
            .count() as f32;
        vec![len, vowels]
    }
}

impl Signal for TestEmbeddingSignal {
    fn descriptor(&self) -> SignalDescriptor {
        SignalDescriptor::new("test_embedding")
    }

    fn input_type(&self) -> InputType {
        InputType::Text
    }

    fn fields(&self) -> Field {
        Field::primitive(DataType::Embedding)
    }

    fn supports_compute(&self) -> bool {
        true
    }

    fn compute(&self, inputs: &[RichData]) -> Result<Vec<Option<Value>>> {
        inputs
            .iter()
            .map(|input| {
                let text = input
                    .as_text()
                    .ok_or_else(|| LilacError::invalid_query("test_embedding requires text input"))?;
                let vector = Self::embed(text);
                Ok(Some(Value::List(
                    vector.into_iter().map(|v| Value::Float(v as f64)).collect(),
                )))
            })
            .collect()
    }
}

/// Embedding-model fixture: sums a precomputed embedding's components (S3).
#[derive(Debug)]
pub struct TestEmbeddingSumSignal {
    descriptor: SignalDescriptor,
}

impl TestEmbeddingSumSignal {
    pub fn new(split: impl Into<String>, embedding: impl Into<String>) -> Self {
        let descriptor = SignalDescriptor::new("test_embedding_sum")
            .with_param("split", serde_json::Value::String(split.into()))
            .with_param("embedding", serde_json::Value::String(embedding.into()));
        TestEmbeddingSumSignal { descriptor }
    }
}

impl Signal for TestEmbeddingSumSignal {
    fn descriptor(&self) -> SignalDescriptor {
        self.descriptor.clone()
    }

    fn input_type(&self) -> InputType {
        InputType::TextEmbedding
    }

    fn compute_type(&self) -> InputType {
        InputType::TextEmbedding
    }

    fn fields(&self) -> Field {
        Field::primitive(DataType::Float32)
    }

    fn dependency(&self) -> DependencySpec {
        DependencySpec {
            split: param_str(&self.descriptor, "split"),
            embedding: param_str(&self.descriptor, "embedding"),
        }
    }

    fn supports_vector_compute(&self) -> bool {
        true
    }

    fn vector_compute(&self, keys: &[CompoundKey], store: &VectorStore) -> Result<Vec<Option<Value>>> {
        let vectors = store.get(keys)?;
        Ok(vectors
            .into_iter()
            .map(|v| Some(Value::Float(v.iter().map(|x| *x as f64).sum())))
            .collect())
    }
}

/// Vector-signal fixture backing the top-k semantic search scenario (S4):
/// scores stored embeddings against a fixed query vector supplied as a
/// descriptor parameter.
#[derive(Debug)]
pub struct TestSemanticSignal {
    descriptor: SignalDescriptor,
    query: Vec<f32>,
}

impl TestSemanticSignal {
    pub fn new(query: Vec<f32>) -> Self {
        let descriptor = SignalDescriptor::new("test_semantic").with_param(
            "query",
            serde_json::Value::Array(
                query
                    .iter()
                    .map(|v| serde_json::Value::from(*v as f64))
                    .collect(),
            ),
        );
        TestSemanticSignal { descriptor, query }
    }

    fn from_descriptor(descriptor: &SignalDescriptor) -> Result<Self> {
        let query = descriptor
            .params
            .get("query")
            .and_then(|v| v.as_array())
            .ok_or_else(|| LilacError::invalid_query("test_semantic requires a `query` param"))?
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Option<Vec<f32>>>()
            .ok_or_else(|| LilacError::invalid_query("test_semantic `query` must be an array of numbers"))?;
        Ok(TestSemanticSignal {
            descriptor: descriptor.clone(),
            query,
        })
    }
}

impl Signal for TestSemanticSignal {
    fn descriptor(&self) -> SignalDescriptor {
        self.descriptor.clone()
    }

    fn input_type(&self) -> InputType {
        InputType::TextEmbedding
    }

    fn compute_type(&self) -> InputType {
        InputType::TextEmbedding
    }

    fn fields(&self) -> Field {
        Field::primitive(DataType::Float32)
    }

    fn supports_vector_compute(&self) -> bool {
        true
    }

    fn vector_compute(&self, keys: &[CompoundKey], store: &VectorStore) -> Result<Vec<Option<Value>>> {
        let vectors = store.get(keys)?;
        Ok(vectors
            .into_iter()
            .map(|v| Some(Value::Float(dot(&self.query, &v) as f64)))
            .collect())
    }

    fn supports_vector_topk(&self) -> bool {
        true
    }

    fn vector_compute_topk(
        &self,
        k: usize,
        store: &VectorStore,
        restrict: Option<&[CompoundKey]>,
    ) -> Result<Vec<(CompoundKey, Value)>> {
        Ok(store
            .topk(&self.query, k, restrict)?
            .into_iter()
            .map(|(key, score)| (key, Value::Float(score as f64)))
            .collect())
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn param_str(descriptor: &SignalDescriptor, key: &str) -> Option<String> {
    descriptor
        .params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Appends each split's start offset to its signal-declared span fields,
/// structurally (not by content) walking the declared field tree — the
/// propagation rule in §9 "Span offset propagation", used by the enrichment
/// writer when a signal's output nests spans under a split.
pub fn shift_spans(value: &Value, by: u32) -> Value {
    match value {
        Value::Span(span) => Value::Span(span.shift(by)),
        Value::List(items) => Value::List(items.iter().map(|v| shift_spans(v, by)).collect()),
        Value::Struct(fields) => Value::Struct(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), shift_spans(v, by)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Finds every (case-insensitive, literal) occurrence of `query` in a text
/// leaf, grounded on `substring_search.py`'s `SubstringSignal`. The original
/// compiles `query` as a regex; this stack carries no regex crate, and the
/// search shortcut (SPEC_FULL §12) only ever needs literal containment, so
/// matching is plain case-insensitive substring search.
#[derive(Debug, Clone)]
pub struct SubstringSearchSignal {
    query: String,
}

impl SubstringSearchSignal {
    pub fn new(query: impl Into<String>) -> Self {
        SubstringSearchSignal { query: query.into() }
    }
}

impl Signal for SubstringSearchSignal {
    fn descriptor(&self) -> SignalDescriptor {
        SignalDescriptor::new("substring_search").with_param("query", serde_json::json!(self.query))
    }

    fn input_type(&self) -> InputType {
        InputType::Text
    }

    fn fields(&self) -> Field {
        Field::list(Field::primitive(DataType::StringSpan))
    }

    fn supports_compute(&self) -> bool {
        true
    }

    fn compute(&self, inputs: &[RichData]) -> Result<Vec<Option<Value>>> {
        let needle = self.query.to_lowercase();
        Ok(inputs
            .iter()
            .map(|data| {
                let text = data.as_text()?;
                if needle.is_empty() {
                    return Some(Value::List(Vec::new()));
                }
                let haystack = text.to_lowercase();
                let mut spans = Vec::new();
                let mut cursor = 0usize;
                while let Some(pos) = haystack[cursor..].find(&needle) {
                    let start = cursor + pos;
                    let end = start + needle.len();
                    spans.push(Value::Span(Span::new(start as u32, end as u32)));
                    cursor = end.max(start + 1);
                }
                Some(Value::List(spans))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substring_search_finds_all_case_insensitive_occurrences() {
        let signal = SubstringSearchSignal::new("lo");
        let out = signal
            .compute(&[RichData::Text("Hello lollipop".to_string())])
            .unwrap();
        let Some(Value::List(spans)) = &out[0] else {
            panic!("expected a list of spans")
        };
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0], Value::Span(Span::new(3, 5)));
        assert_eq!(spans[1], Value::Span(Span::new(6, 8)));
    }

    #[test]
    fn text_statistics_counts_chars() {
        let signal = TextStatisticsSignal;
        let out = signal
            .compute(&[RichData::Text("hello world".to_string())])
            .unwrap();
        assert_eq!(out, vec![Some(Value::Int(11))]);
    }

    #[test]
    fn test_sparse_skips_exact_hello() {
        let signal = TestSparseSignal;
        let out = signal
            .compute(&[
                RichData::Text("hello".to_string()),
                RichData::Text("hello world".to_string()),
            ])
            .unwrap();
        assert_eq!(out, vec![None, Some(Value::Int(11))]);
    }

    #[test]
    fn splitter_breaks_on_period_boundaries() {
        let signal = TestSplitterSignal;
        let out = signal
            .compute(&[RichData::Text("hello world. hello world2.".to_string())])
            .unwrap();
        let spans = out[0].as_ref().unwrap().as_list().unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].as_span(), Some(Span::new(0, 12)));
        assert_eq!(spans[1].as_span(), Some(Span::new(12, 27)));
    }

    #[test]
    fn embedding_sum_matches_stored_vector_sum() {
        let mut store = VectorStore::new();
        store
            .add(vec![CompoundKey::row("1")], vec![vec![3.0, 4.0]])
            .unwrap();
        let signal = TestEmbeddingSumSignal::new("test_splitter()", "test_embedding()");
        let out = signal
            .vector_compute(&[CompoundKey::row("1")], &store)
            .unwrap();
        // Vectors are L2-normalized at ingest, so compare against the stored
        // (normalized) value rather than the raw [3.0, 4.0] input.
        let stored = store.get(&[CompoundKey::row("1")]).unwrap();
        let expected: f64 = stored[0].iter().map(|x| *x as f64).sum();
        assert_eq!(out, vec![Some(Value::Float(expected))]);
    }

    #[test]
    fn semantic_topk_orders_by_dot_product() {
        let mut store = VectorStore::new();
        store
            .add(
                vec![CompoundKey::row("a"), CompoundKey::row("b")],
                vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            )
            .unwrap();
        let signal = TestSemanticSignal::new(vec![1.0, 0.0]);
        let results = signal.vector_compute_topk(1, &store, None).unwrap();
        assert_eq!(results[0].0, CompoundKey::row("a"));
    }

    #[test]
    fn shift_spans_walks_structurally() {
        let value = Value::List(vec![Value::Span(Span::new(0, 5))]);
        let shifted = shift_spans(&value, 10);
        assert_eq!(
            shifted,
            Value::List(vec![Value::Span(Span::new(10, 15))])
        );
    }
}
