//! Keyed, L2-normalized embedding store with exact top-k retrieval (§4.4).

use std::collections::HashMap;
use std::path::Path as FsPath;

use serde::{Deserialize, Serialize};

use crate::error::{LilacError, Result};

/// A tuple of string/integer parts addressing one embedding, e.g. `(rowid,)`
/// for a row-level embedding or `(rowid, 3)` for "the third split of the row".
/// Keys form a hierarchical index: a shorter key is a prefix of every key
/// that extends it (§4.4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyPart {
    Str(String),
    Int(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompoundKey(pub Vec<KeyPart>);

impl CompoundKey {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        CompoundKey(parts)
    }

    pub fn row(row_id: impl Into<String>) -> Self {
        CompoundKey(vec![KeyPart::Str(row_id.into())])
    }

    /// Whether `self` extends `prefix` (or equals it) component-wise.
    pub fn has_prefix(&self, prefix: &CompoundKey) -> bool {
        prefix.0.len() <= self.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

/// An in-memory, keyed matrix of L2-normalized embedding vectors.
///
/// `get` is O(|keys|) average (hash lookup per key); `topk` is O(n·d) to
/// score every row plus a quickselect partition for the final k (§4.4
/// "Performance contract").
#[derive(Debug, Default)]
pub struct VectorStore {
    dim: Option<usize>,
    keys: Vec<CompoundKey>,
    vectors: Vec<Vec<f32>>,
    index: HashMap<CompoundKey, usize>,
}

impl VectorStore {
    pub fn new() -> Self {
        VectorStore::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Adds `keys` with their `embeddings`, L2-normalizing each vector at
    /// ingest so `topk`'s dot product is cosine-equivalent (§4.4).
    pub fn add(&mut self, keys: Vec<CompoundKey>, embeddings: Vec<Vec<f32>>) -> Result<()> {
        if keys.len() != embeddings.len() {
            return Err(LilacError::vector_store(format!(
                "{} keys but {} embeddings",
                keys.len(),
                embeddings.len()
            )));
        }
        for (key, vector) in keys.into_iter().zip(embeddings) {
            let dim = *self.dim.get_or_insert(vector.len());
            if vector.len() != dim {
                return Err(LilacError::vector_store(format!(
                    "dimension mismatch: expected {dim}, got {}",
                    vector.len()
                )));
            }
            let normalized = l2_normalize(vector);
            let slot = self.vectors.len();
            self.vectors.push(normalized);
            self.index.insert(key.clone(), slot);
            self.keys.push(key);
        }
        Ok(())
    }

    pub fn get(&self, keys: &[CompoundKey]) -> Result<Vec<Vec<f32>>> {
        keys.iter()
            .map(|k| {
                self.index
                    .get(k)
                    .map(|&i| self.vectors[i].clone())
                    .ok_or_else(|| LilacError::vector_store(format!("unknown key {k:?}")))
            })
            .collect()
    }

    /// Top `k` keys by descending dot product against `query` (already
    /// expected to be a unit vector). Ties break by insertion order (§4.4,
    /// §5 "Ordering guarantees"). `restrict`, if given, scores only keys
    /// whose prefix matches at least one entry.
    pub fn topk(
        &self,
        query: &[f32],
        k: usize,
        restrict: Option<&[CompoundKey]>,
    ) -> Result<Vec<(CompoundKey, f32)>> {
        if let Some(dim) = self.dim {
            if query.len() != dim {
                return Err(LilacError::vector_store(format!(
                    "query dimension {} does not match store dimension {dim}",
                    query.len()
                )));
            }
        }

        let candidate_indices: Vec<usize> = match restrict {
            None => (0..self.keys.len()).collect(),
            Some(prefixes) => self
                .keys
                .iter()
                .enumerate()
                .filter(|(_, key)| prefixes.iter().any(|p| key.has_prefix(p)))
                .map(|(i, _)| i)
                .collect(),
        };

        // (score, insertion_index) so a stable quickselect + final sort
        // breaks ties by insertion order.
        let mut scored: Vec<(f32, usize)> = candidate_indices
            .iter()
            .map(|&i| (dot(query, &self.vectors[i]), i))
            .collect();

        let k = k.min(scored.len());
        if k == 0 {
            return Ok(Vec::new());
        }
        // Partial sort: partition the top-k by score (descending), then
        // fully sort just that prefix — avoids an O(n log n) sort of the
        // whole candidate set (§4.4 "partial-sort (quickselect)").
        scored.select_nth_unstable_by(k - 1, |a, b| cmp_desc_then_insertion(*a, *b));
        let mut top = scored[..k].to_vec();
        top.sort_by(|a, b| cmp_desc_then_insertion(*a, *b));

        Ok(top
            .into_iter()
            .map(|(score, i)| (self.keys[i].clone(), score))
            .collect())
    }

    /// Persists keys and (already-normalized) vectors as the embedding
    /// sidecar file next to a signal shard (§4.9 step 4, §6). The original
    /// engine keeps these as a `.npy` matrix plus a `.keys.pkl` side index;
    /// there is no idiomatic Rust ndarray-on-disk counterpart in this stack,
    /// so both are folded into one `serde_json`-encoded file, consistent
    /// with how every other manifest in this engine is persisted.
    pub fn save(&self, path: &FsPath) -> Result<()> {
        let stored = StoredVectors {
            keys: self.keys.clone(),
            vectors: self.vectors.clone(),
        };
        let bytes = serde_json::to_vec(&stored)
            .map_err(|e| LilacError::storage(format!("encoding embeddings sidecar: {e}")))?;
        std::fs::write(path, bytes)
            .map_err(|e| LilacError::storage(format!("writing {}: {e}", path.display())))
    }

    pub fn load(path: &FsPath) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| LilacError::storage(format!("reading {}: {e}", path.display())))?;
        let stored: StoredVectors = serde_json::from_slice(&bytes)
            .map_err(|e| LilacError::storage(format!("decoding {}: {e}", path.display())))?;
        let mut store = VectorStore::new();
        store.add(stored.keys, stored.vectors)?;
        Ok(store)
    }
}

#[derive(Serialize, Deserialize)]
struct StoredVectors {
    keys: Vec<CompoundKey>,
    vectors: Vec<Vec<f32>>,
}

fn cmp_desc_then_insertion(a: (f32, usize), b: (f32, usize)) -> std::cmp::Ordering {
    b.0.partial_cmp(&a.0)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| a.1.cmp(&b.1))
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn l2_normalize(v: Vec<f32>) -> Vec<f32> {
    let norm = (v.iter().map(|x| x * x).sum::<f32>()).sqrt();
    if norm == 0.0 {
        v
    } else {
        v.into_iter().map(|x| x / norm).collect()
    }
}
