//! Anomaly fingerprints
//!
//! The default embedder uses signed feature hashing: each categorical
//! feature (service, metric type, severity, metric name, metric magnitude
//! bucket) is hashed into one of `dims` slots with a hash-derived sign, and
//! the result is L2-normalized. Same inputs, same vector, on every host.

use homeostat_core::Anomaly;
use sha2::{Digest, Sha256};
use std::fmt::Debug;

/// Turns an anomaly into a fixed-length vector
pub trait Embedder: Send + Sync + Debug {
    /// Fingerprint for `anomaly`
    fn embed(&self, anomaly: &Anomaly) -> Vec<f32>;

    /// Output dimensionality
    fn dims(&self) -> usize;
}

/// Deterministic feature-hashing embedder
#[derive(Debug, Clone, Copy)]
pub struct FeatureHashEmbedder {
    dims: usize,
}

impl FeatureHashEmbedder {
    /// Create embedder with `dims` slots
    #[must_use]
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn add(&self, v: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        let h = u64::from_le_bytes(word);
        // dims is small; the cast cannot truncate a meaningful value
        #[allow(clippy::cast_possible_truncation)]
        let slot = (h % self.dims as u64) as usize;
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        v[slot] += sign * weight;
    }
}

impl Default for FeatureHashEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Embedder for FeatureHashEmbedder {
    fn embed(&self, anomaly: &Anomaly) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        self.add(&mut v, &format!("service={}", anomaly.service), 1.0);
        self.add(&mut v, &format!("metric_type={}", anomaly.metric_type), 1.0);
        self.add(&mut v, &format!("severity={}", anomaly.severity), 0.5);
        for (name, value) in &anomaly.metrics {
            self.add(&mut v, &format!("metric={name}"), 1.0);
            self.add(
                &mut v,
                &format!("magnitude={name}:{}", magnitude_bucket(*value)),
                0.75,
            );
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

/// Log2 bucket so that nearby magnitudes share a feature
fn magnitude_bucket(value: f64) -> i64 {
    if !value.is_finite() {
        return i64::MAX;
    }
    let bucket = (1.0 + value.abs()).log2().floor();
    #[allow(clippy::cast_possible_truncation)]
    let bucket = bucket as i64;
    if value < 0.0 {
        -bucket
    } else {
        bucket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::similarity;
    use chrono::Utc;
    use homeostat_core::{Severity, SimilarityMetric};

    fn anomaly(service: &str, p99: f64) -> Anomaly {
        Anomaly::new(service, "latency", Severity::P2, Utc::now()).with_metric("p99_latency_ms", p99)
    }

    #[test]
    fn embedding_is_deterministic_and_normalized() {
        let e = FeatureHashEmbedder::new(32);
        let a = e.embed(&anomaly("payment-api", 2500.0));
        let b = e.embed(&anomaly("payment-api", 2500.0));
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn nearby_magnitudes_share_a_bucket() {
        assert_eq!(magnitude_bucket(2500.0), magnitude_bucket(2400.0));
        assert_ne!(magnitude_bucket(2500.0), magnitude_bucket(25.0));
    }

    #[test]
    fn same_signal_is_more_similar_than_other_service() {
        let e = FeatureHashEmbedder::default();
        let base = e.embed(&anomaly("payment-api", 2500.0));
        let close = e.embed(&anomaly("payment-api", 2450.0));
        let other = e.embed(&anomaly("search-api", 30.0));
        let s_close = similarity(SimilarityMetric::Cosine, &base, &close);
        let s_other = similarity(SimilarityMetric::Cosine, &base, &other);
        assert!(s_close > 0.99);
        assert!(s_other < s_close);
    }
}
