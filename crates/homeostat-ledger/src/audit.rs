//! Append-only audit log
//!
//! Every entry gets a global sequence number and is chained to its
//! predecessor by SHA-256. `append` returns only after the entry is synced
//! to disk, and the next sequence number is recovered from the last durable
//! entry on reopen, so numbers are never reused or reordered across a crash.

use crate::durable::{load_records, LineWriter};
use crate::error::LedgerError;
use homeostat_core::{AuditDraft, AuditEntry, Clock, RunId};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug)]
struct AuditInner {
    entries: Vec<AuditEntry>,
    writer: Option<LineWriter>,
}

/// The audit log
#[derive(Debug)]
pub struct AuditLog {
    inner: Mutex<AuditInner>,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    /// Volatile log (tests, dry runs)
    #[must_use]
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(AuditInner {
                entries: Vec::new(),
                writer: None,
            }),
            clock,
        }
    }

    /// Open a durable log, verifying the existing chain
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let entries: Vec<AuditEntry> = load_records(path)?;
        verify_chain(&entries)?;
        let writer = LineWriter::open(path)?;

        tracing::info!(
            path = %path.display(),
            entries = entries.len(),
            last_seq = entries.last().map_or(0, |e| e.seq),
            "audit log opened"
        );

        Ok(Self {
            inner: Mutex::new(AuditInner {
                entries,
                writer: Some(writer),
            }),
            clock,
        })
    }

    /// Append an entry; returns its sequence number once durable
    pub fn append(&self, draft: AuditDraft) -> Result<u64, LedgerError> {
        let mut guard = self.inner.lock();
        let (seq, prev_hash) = guard
            .entries
            .last()
            .map_or((1, [0u8; 32]), |last| (last.seq + 1, last.hash));

        let mut entry = AuditEntry {
            seq,
            timestamp: self.clock.now(),
            entity_type: draft.entity_type,
            entity_id: draft.entity_id,
            run_id: draft.run_id,
            anomaly_id: draft.anomaly_id,
            payload_snapshot: draft.payload,
            prev_hash,
            hash: [0u8; 32],
        };
        entry.hash = compute_hash(&entry);

        if let Some(writer) = guard.writer.as_mut() {
            writer.append(&entry)?;
        }
        tracing::debug!(
            seq,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            "audit entry appended"
        );
        guard.entries.push(entry);
        Ok(seq)
    }

    /// Entries with `seq` strictly greater than `since`, in order
    #[must_use]
    pub fn stream_since(&self, since: u64) -> Vec<AuditEntry> {
        let guard = self.inner.lock();
        let start = guard.entries.partition_point(|e| e.seq <= since);
        guard.entries[start..].to_vec()
    }

    /// Entries belonging to one run, in order
    #[must_use]
    pub fn entries_for_run(&self, run_id: RunId) -> Vec<AuditEntry> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.run_id == Some(run_id))
            .cloned()
            .collect()
    }

    /// Sequence number of the last durable entry (0 when empty)
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.inner.lock().entries.last().map_or(0, |e| e.seq)
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-check sequence continuity and the hash chain
    pub fn verify_integrity(&self) -> Result<(), LedgerError> {
        verify_chain(&self.inner.lock().entries)
    }
}

fn verify_chain(entries: &[AuditEntry]) -> Result<(), LedgerError> {
    let mut prev_hash = [0u8; 32];
    let mut expected_seq = 1u64;
    for e in entries {
        if e.seq != expected_seq {
            return Err(LedgerError::IntegrityViolation {
                seq: e.seq,
                reason: format!("expected seq {expected_seq}"),
            });
        }
        if e.prev_hash != prev_hash {
            return Err(LedgerError::IntegrityViolation {
                seq: e.seq,
                reason: "prev_hash does not match predecessor".to_string(),
            });
        }
        if e.hash != compute_hash(e) {
            return Err(LedgerError::IntegrityViolation {
                seq: e.seq,
                reason: "entry hash mismatch".to_string(),
            });
        }
        prev_hash = e.hash;
        expected_seq += 1;
    }
    Ok(())
}

fn compute_hash(entry: &AuditEntry) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(entry.seq.to_le_bytes());
    hasher.update(entry.timestamp.timestamp().to_le_bytes());
    hasher.update(entry.timestamp.timestamp_subsec_nanos().to_le_bytes());
    hasher.update(entry.entity_type.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(entry.entity_id.as_bytes());
    hasher.update([0]);
    if let Some(run_id) = entry.run_id {
        hasher.update(run_id.0.to_bytes());
    }
    hasher.update([0]);
    if let Some(anomaly_id) = entry.anomaly_id {
        hasher.update(anomaly_id.0.to_bytes());
    }
    hasher.update([0]);
    hasher.update(entry.payload_snapshot.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(entry.prev_hash);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use homeostat_core::{AnomalyId, EntityType, SystemClock};
    use serde_json::json;

    fn draft(n: u32) -> AuditDraft {
        AuditDraft::new(EntityType::Run, format!("entity-{n}"), json!({ "n": n }))
    }

    fn memory_log() -> AuditLog {
        AuditLog::in_memory(Arc::new(SystemClock))
    }

    #[test]
    fn seq_starts_at_one_and_increments() {
        let log = memory_log();
        assert_eq!(log.append(draft(1)).unwrap(), 1);
        assert_eq!(log.append(draft(2)).unwrap(), 2);
        assert_eq!(log.last_seq(), 2);
        assert!(log.verify_integrity().is_ok());
    }

    #[test]
    fn stream_since_is_exclusive_cursor() {
        let log = memory_log();
        for n in 0..5 {
            log.append(draft(n)).unwrap();
        }
        let seqs: Vec<u64> = log.stream_since(2).iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(log.stream_since(0).len(), 5);
        assert!(log.stream_since(5).is_empty());
        assert!(log.stream_since(99).is_empty());
    }

    #[test]
    fn entries_for_run_filters() {
        let log = memory_log();
        let run = RunId::new();
        log.append(draft(1).for_run(run, AnomalyId::new())).unwrap();
        log.append(draft(2)).unwrap();
        log.append(draft(3).for_run(run, AnomalyId::new())).unwrap();

        let seqs: Vec<u64> = log.entries_for_run(run).iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 3]);
    }

    #[test]
    fn chain_links_entries() {
        let log = memory_log();
        log.append(draft(1)).unwrap();
        log.append(draft(2)).unwrap();
        let entries = log.stream_since(0);
        assert_eq!(entries[0].prev_hash, [0u8; 32]);
        assert_eq!(entries[1].prev_hash, entries[0].hash);
    }

    #[test]
    fn tampered_payload_breaks_chain() {
        let mut entries = {
            let log = memory_log();
            log.append(draft(1)).unwrap();
            log.append(draft(2)).unwrap();
            log.stream_since(0)
        };
        entries[0].payload_snapshot = json!({ "n": 42 });
        let err = verify_chain(&entries).unwrap_err();
        assert!(matches!(err, LedgerError::IntegrityViolation { seq: 1, .. }));
    }
}
