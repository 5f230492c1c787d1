//! Precedent store
//!
//! Precedents are appended, never mutated. The durable implementation keeps
//! a JSON-lines log and rebuilds its similarity index from it at open.
//! Fingerprints whose dimensionality differs from the configured one stay
//! readable by id but are left out of similarity search.

use crate::durable::{load_records, LineWriter};
use crate::error::LedgerError;
use crate::index::{BruteForceIndex, SimilarityIndex};
use homeostat_core::{Precedent, PrecedentId, SimilarityMetric};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;

/// A precedent returned by similarity search
#[derive(Debug, Clone, PartialEq)]
pub struct PrecedentMatch {
    /// The stored precedent
    pub precedent: Precedent,
    /// Similarity to the query fingerprint
    pub similarity: f32,
}

/// Persistent anomaly → decision → outcome records
pub trait PrecedentStore: Send + Sync {
    /// Append a precedent
    fn append(&self, precedent: Precedent) -> Result<(), LedgerError>;

    /// Up to `k` precedents with similarity at or above `threshold`,
    /// most similar first
    fn nearest(
        &self,
        fingerprint: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<PrecedentMatch>, LedgerError>;

    /// Look up by id
    fn get(&self, id: PrecedentId) -> Result<Option<Precedent>, LedgerError>;

    /// Number of stored precedents
    fn len(&self) -> usize;

    /// Whether the store is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct Records {
    by_id: HashMap<PrecedentId, Precedent>,
    index: BruteForceIndex,
}

/// Append-only precedent log with an exact similarity index
#[derive(Debug)]
pub struct PrecedentLog {
    records: RwLock<Records>,
    writer: Option<Mutex<LineWriter>>,
}

impl PrecedentLog {
    /// Volatile store
    #[must_use]
    pub fn in_memory(metric: SimilarityMetric) -> Self {
        Self {
            records: RwLock::new(Records {
                by_id: HashMap::new(),
                index: BruteForceIndex::new(metric),
            }),
            writer: None,
        }
    }

    /// Open a durable store and rebuild the index over `dims`-dimensional
    /// fingerprints
    pub fn open(
        path: impl AsRef<Path>,
        metric: SimilarityMetric,
        dims: usize,
    ) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let precedents: Vec<Precedent> = load_records(path)?;
        let mut records = Records {
            by_id: HashMap::with_capacity(precedents.len()),
            index: BruteForceIndex::with_dims(metric, dims),
        };
        let mut unindexed = 0usize;
        for p in precedents {
            if p.anomaly_fingerprint.len() == dims {
                records.index.insert(p.id, p.anomaly_fingerprint.clone())?;
            } else {
                unindexed += 1;
            }
            records.by_id.insert(p.id, p);
        }
        if unindexed > 0 {
            tracing::warn!(
                path = %path.display(),
                unindexed,
                dims,
                "precedents with other fingerprint dimensions are excluded from search"
            );
        }
        tracing::info!(
            path = %path.display(),
            precedents = records.by_id.len(),
            "precedent store opened"
        );

        Ok(Self {
            records: RwLock::new(records),
            writer: Some(Mutex::new(LineWriter::open(path)?)),
        })
    }
}

impl PrecedentStore for PrecedentLog {
    fn append(&self, precedent: Precedent) -> Result<(), LedgerError> {
        // Writers serialize on the record lock so the log order matches the
        // index order; readers keep going until the write lands.
        let mut records = self.records.write();
        if records.by_id.contains_key(&precedent.id) {
            return Ok(());
        }
        records
            .index
            .check_dims(precedent.anomaly_fingerprint.len())?;
        if let Some(writer) = &self.writer {
            writer.lock().append(&precedent)?;
        }
        records
            .index
            .insert(precedent.id, precedent.anomaly_fingerprint.clone())?;
        records.by_id.insert(precedent.id, precedent);
        Ok(())
    }

    fn nearest(
        &self,
        fingerprint: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<PrecedentMatch>, LedgerError> {
        let records = self.records.read();
        let hits = records.index.search(fingerprint, k, threshold)?;
        Ok(hits
            .into_iter()
            .filter_map(|(id, similarity)| {
                records.by_id.get(&id).map(|p| PrecedentMatch {
                    precedent: p.clone(),
                    similarity,
                })
            })
            .collect())
    }

    fn get(&self, id: PrecedentId) -> Result<Option<Precedent>, LedgerError> {
        Ok(self.records.read().by_id.get(&id).cloned())
    }

    fn len(&self) -> usize {
        self.records.read().by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use homeostat_core::{AnomalyId, Outcome, Severity, Verdict};

    fn precedent(fingerprint: Vec<f32>, outcome: Outcome) -> Precedent {
        Precedent {
            id: PrecedentId::new(),
            anomaly_id: AnomalyId::new(),
            service: "payment-api".to_string(),
            severity: Severity::P2,
            anomaly_fingerprint: fingerprint,
            decision_taken: Verdict::Intervene,
            outcome,
            remediation: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn nearest_returns_most_similar_first() {
        let store = PrecedentLog::in_memory(SimilarityMetric::Cosine);
        let exact = precedent(vec![1.0, 0.0, 0.0], Outcome::Success);
        let close = precedent(vec![0.95, 0.3, 0.0], Outcome::Failure);
        let far = precedent(vec![0.0, 0.0, 1.0], Outcome::Success);
        store.append(exact.clone()).unwrap();
        store.append(close.clone()).unwrap();
        store.append(far).unwrap();

        let hits = store.nearest(&[1.0, 0.0, 0.0], 5, 0.85).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].precedent.id, exact.id);
        assert_eq!(hits[1].precedent.id, close.id);
    }

    #[test]
    fn duplicate_append_is_ignored() {
        let store = PrecedentLog::in_memory(SimilarityMetric::Cosine);
        let p = precedent(vec![1.0, 0.0], Outcome::Success);
        store.append(p.clone()).unwrap();
        store.append(p).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn durable_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("precedents.log");
        let p = precedent(vec![0.6, 0.8], Outcome::Success);
        {
            let store = PrecedentLog::open(&path, SimilarityMetric::Cosine, 2).unwrap();
            store.append(p.clone()).unwrap();
        }

        let reopened = PrecedentLog::open(&path, SimilarityMetric::Cosine, 2).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get(p.id).unwrap(), Some(p));
        assert_eq!(reopened.nearest(&[0.6, 0.8], 1, 0.99).unwrap().len(), 1);
    }

    #[test]
    fn wrong_dimensions_are_refused_before_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("precedents.log");
        {
            let store = PrecedentLog::open(&path, SimilarityMetric::Cosine, 2).unwrap();
            let err = store
                .append(precedent(vec![1.0, 0.0, 0.0], Outcome::Success))
                .unwrap_err();
            assert!(matches!(
                err,
                LedgerError::DimensionMismatch {
                    expected: 2,
                    got: 3
                }
            ));
            assert!(store.is_empty());
        }

        let reopened = PrecedentLog::open(&path, SimilarityMetric::Cosine, 2).unwrap();
        assert!(reopened.is_empty());
    }

    #[test]
    fn changed_dimensions_leave_old_precedents_out_of_search() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("precedents.log");
        let old = precedent(vec![0.6, 0.8], Outcome::Success);
        {
            let store = PrecedentLog::open(&path, SimilarityMetric::Cosine, 2).unwrap();
            store.append(old.clone()).unwrap();
        }

        let store = PrecedentLog::open(&path, SimilarityMetric::Cosine, 3).unwrap();
        assert_eq!(store.get(old.id).unwrap(), Some(old));
        assert!(store.nearest(&[1.0, 0.0, 0.0], 5, 0.0).unwrap().is_empty());

        let fresh = precedent(vec![1.0, 0.0, 0.0], Outcome::Success);
        store.append(fresh.clone()).unwrap();
        let hits = store.nearest(&[1.0, 0.0, 0.0], 5, 0.9).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].precedent.id, fresh.id);
    }
}
