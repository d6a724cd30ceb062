//! Optional vector index over full-document embeddings.
//!
//! The [`VectorIndex`] trait abstracts candidate retrieval so an approximate
//! nearest-neighbor library can be slotted in without touching the retriever.
//! The shipped implementation is an exact brute-force scan over unit-norm
//! vectors (inner product = cosine), which the retriever treats identically:
//! the index only produces a candidate set, and the full hybrid score is
//! recomputed over it.
//!
//! Persistence is a sidecar JSON file next to the database holding
//! `{id_map, dimensions, embeddings}`.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{KeeperError, Result};

/// Candidate retrieval over document vectors.
pub trait VectorIndex: Send + Sync {
    /// Replace the index contents with the given `(document_id, vector)` set.
    fn build(&mut self, embeddings: Vec<(i64, Vec<f32>)>);
    /// Add or replace a single document vector.
    fn add(&mut self, document_id: i64, vector: Vec<f32>);
    /// Return up to `k` candidates ranked by cosine similarity.
    fn search(&self, query: &[f32], k: usize) -> Vec<(i64, f64)>;
    /// Persist to the sidecar file.
    fn save(&self, path: &Path) -> Result<()>;
    /// Restore from the sidecar file.
    fn load(&mut self, path: &Path) -> Result<()>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    id_map: Vec<i64>,
    dimensions: usize,
    embeddings: Vec<Vec<f32>>,
}

/// Exact cosine scan over all stored vectors.
#[derive(Default)]
pub struct BruteForceIndex {
    dimensions: usize,
    entries: Vec<(i64, Vec<f32>)>,
}

impl BruteForceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sidecar filename for a brute-force index stored beside the database.
    pub fn sidecar_path(db_path: &Path) -> std::path::PathBuf {
        let dir = db_path.parent().unwrap_or_else(|| Path::new("."));
        dir.join("faiss.index.json")
    }
}

impl VectorIndex for BruteForceIndex {
    fn build(&mut self, embeddings: Vec<(i64, Vec<f32>)>) {
        self.dimensions = embeddings.first().map(|(_, v)| v.len()).unwrap_or(0);
        self.entries = embeddings;
    }

    fn add(&mut self, document_id: i64, vector: Vec<f32>) {
        if self.entries.is_empty() {
            self.dimensions = vector.len();
        }
        if let Some(entry) = self.entries.iter_mut().find(|(id, _)| *id == document_id) {
            entry.1 = vector;
        } else {
            self.entries.push((document_id, vector));
        }
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<(i64, f64)> {
        let mut scored: Vec<(i64, f64)> = self
            .entries
            .iter()
            .map(|(id, vec)| (*id, crate::embedding::cosine_similarity(query, vec)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }

    fn save(&self, path: &Path) -> Result<()> {
        let file = IndexFile {
            id_map: self.entries.iter().map(|(id, _)| *id).collect(),
            dimensions: self.dimensions,
            embeddings: self.entries.iter().map(|(_, v)| v.clone()).collect(),
        };
        let payload = serde_json::to_string(&file)?;
        std::fs::write(path, payload).map_err(|e| KeeperError::Internal(format!("{e}")))?;
        Ok(())
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| KeeperError::NotFound(format!("{}: {e}", path.display())))?;
        let file: IndexFile = serde_json::from_str(&raw)
            .map_err(|e| KeeperError::Corrupt(format!("vector index: {e}")))?;
        if file.id_map.len() != file.embeddings.len() {
            return Err(KeeperError::Corrupt(
                "vector index: id_map and embeddings length mismatch".to_string(),
            ));
        }
        self.dimensions = file.dimensions;
        self.entries = file.id_map.into_iter().zip(file.embeddings).collect();
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::hash_embed;

    #[test]
    fn search_ranks_by_similarity() {
        let mut index = BruteForceIndex::new();
        index.build(vec![
            (1, hash_embed("kubernetes deployment", 64)),
            (2, hash_embed("cooking pasta recipes", 64)),
            (3, hash_embed("kubernetes cluster operations", 64)),
        ]);

        let hits = index.search(&hash_embed("kubernetes", 64), 2);
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|(id, _)| *id == 1 || *id == 3));
    }

    #[test]
    fn add_replaces_existing_entry() {
        let mut index = BruteForceIndex::new();
        index.add(7, vec![1.0, 0.0]);
        index.add(7, vec![0.0, 1.0]);
        assert_eq!(index.len(), 1);
        let hits = index.search(&[0.0, 1.0], 1);
        assert_eq!(hits[0].0, 7);
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faiss.index.json");

        let mut index = BruteForceIndex::new();
        index.build(vec![(1, vec![1.0, 0.0]), (2, vec![0.0, 1.0])]);
        index.save(&path).unwrap();

        let mut restored = BruteForceIndex::new();
        restored.load(&path).unwrap();
        assert_eq!(restored.len(), 2);
        let hits = restored.search(&[1.0, 0.0], 1);
        assert_eq!(hits[0].0, 1);
    }

    #[test]
    fn corrupt_sidecar_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faiss.index.json");
        std::fs::write(&path, "{not json").unwrap();

        let mut index = BruteForceIndex::new();
        let err = index.load(&path).unwrap_err();
        assert_eq!(err.kind(), "corrupt");
    }

    #[test]
    fn empty_index_returns_no_candidates() {
        let index = BruteForceIndex::new();
        assert!(index.search(&[1.0, 0.0], 5).is_empty());
    }
}
