//! Nearest-neighbor index over precedent fingerprints
//!
//! [`SimilarityIndex`] is the stable seam; [`BruteForceIndex`] is the exact
//! implementation suitable for small and medium corpora. Results are ordered
//! by similarity (descending) then id (ascending), so equal inputs always
//! yield equal outputs.

use crate::error::LedgerError;
use homeostat_core::{PrecedentId, SimilarityMetric};

/// Nearest-neighbor search over fingerprints
pub trait SimilarityIndex: Send + Sync {
    /// Add a vector
    fn insert(&mut self, id: PrecedentId, vector: Vec<f32>) -> Result<(), LedgerError>;

    /// Whether a vector of `dims` dimensions would be accepted
    fn check_dims(&self, dims: usize) -> Result<(), LedgerError>;

    /// Up to `k` ids with similarity at or above `threshold`
    fn search(
        &self,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<(PrecedentId, f32)>, LedgerError>;

    /// Number of indexed vectors
    fn len(&self) -> usize;

    /// Whether the index is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exact linear-scan index
#[derive(Debug, Clone)]
pub struct BruteForceIndex {
    metric: SimilarityMetric,
    dims: Option<usize>,
    entries: Vec<(PrecedentId, Vec<f32>)>,
}

impl BruteForceIndex {
    /// Create empty index
    #[must_use]
    pub fn new(metric: SimilarityMetric) -> Self {
        Self {
            metric,
            dims: None,
            entries: Vec::new(),
        }
    }

    /// Empty index that only accepts `dims`-dimensional vectors
    #[must_use]
    pub fn with_dims(metric: SimilarityMetric, dims: usize) -> Self {
        Self {
            dims: Some(dims),
            ..Self::new(metric)
        }
    }
}

impl SimilarityIndex for BruteForceIndex {
    fn insert(&mut self, id: PrecedentId, vector: Vec<f32>) -> Result<(), LedgerError> {
        self.check_dims(vector.len())?;
        self.dims = Some(vector.len());
        self.entries.push((id, vector));
        Ok(())
    }

    fn check_dims(&self, got: usize) -> Result<(), LedgerError> {
        match self.dims {
            Some(expected) if expected != got => {
                Err(LedgerError::DimensionMismatch { expected, got })
            }
            _ => Ok(()),
        }
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<(PrecedentId, f32)>, LedgerError> {
        self.check_dims(query.len())?;
        let mut hits: Vec<(PrecedentId, f32)> = self
            .entries
            .iter()
            .map(|(id, v)| (*id, similarity(self.metric, query, v)))
            .filter(|(_, s)| *s >= threshold)
            .collect();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(k);
        Ok(hits)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Similarity between two equal-length vectors under `metric`
#[must_use]
pub fn similarity(metric: SimilarityMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        SimilarityMetric::Cosine => cosine(a, b),
        SimilarityMetric::Euclidean => {
            let dist = a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt();
            1.0 / (1.0 + dist)
        }
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot / (na * nb)).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn cosine_of_identical_is_one() {
        let v = [0.3, 0.4, 0.5];
        assert!((similarity(SimilarityMetric::Cosine, &v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_has_no_similarity() {
        assert_eq!(similarity(SimilarityMetric::Cosine, &[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn euclidean_of_identical_is_one() {
        let v = [1.0, 2.0];
        assert_eq!(similarity(SimilarityMetric::Euclidean, &v, &v), 1.0);
    }

    #[test]
    fn search_respects_threshold_and_k() {
        let mut index = BruteForceIndex::new(SimilarityMetric::Cosine);
        let near = PrecedentId::new();
        let mid = PrecedentId::new();
        let far = PrecedentId::new();
        index.insert(near, vec![1.0, 0.0]).unwrap();
        index.insert(mid, vec![0.9, 0.1]).unwrap();
        index.insert(far, vec![0.0, 1.0]).unwrap();

        let hits = index.search(&[1.0, 0.0], 5, 0.85).unwrap();
        let ids: Vec<PrecedentId> = hits.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![near, mid]);

        let top1 = index.search(&[1.0, 0.0], 1, 0.0).unwrap();
        assert_eq!(top1[0].0, near);
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let mut index = BruteForceIndex::new(SimilarityMetric::Cosine);
        index.insert(PrecedentId::new(), vec![1.0, 0.0]).unwrap();
        assert!(matches!(
            index.insert(PrecedentId::new(), vec![1.0]),
            Err(LedgerError::DimensionMismatch { expected: 2, got: 1 })
        ));
        assert!(index.search(&[1.0, 0.0, 0.0], 1, 0.0).is_err());
    }

    proptest! {
        #[test]
        fn cosine_is_bounded_and_symmetric(
            a in prop::collection::vec(-10.0f32..10.0, 4),
            b in prop::collection::vec(-10.0f32..10.0, 4),
        ) {
            let ab = similarity(SimilarityMetric::Cosine, &a, &b);
            let ba = similarity(SimilarityMetric::Cosine, &b, &a);
            prop_assert!((-1.0..=1.0).contains(&ab));
            prop_assert!((ab - ba).abs() < 1e-5);
        }
    }
}
