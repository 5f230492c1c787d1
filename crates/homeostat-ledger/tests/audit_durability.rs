//! Durability tests for the audit log.
//!
//! These exercise the guarantees the orchestrator relies on for recovery:
//! - seq values are strictly increasing with no gaps, across restarts.
//! - a torn tail left by a crash mid-write never acknowledged is dropped.
//! - concurrent appenders never lose or duplicate an entry.

use homeostat_core::{AuditDraft, EntityType, SystemClock};
use homeostat_ledger::{AuditLog, LedgerError};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;

fn draft(n: usize) -> AuditDraft {
    AuditDraft::new(EntityType::Action, format!("action-{n}"), json!({ "n": n }))
}

fn open(path: &std::path::Path) -> AuditLog {
    AuditLog::open(path, Arc::new(SystemClock)).unwrap()
}

#[test]
fn seq_is_gap_free_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.log");

    let mut seen = Vec::new();
    {
        let log = open(&path);
        for n in 0..3 {
            seen.push(log.append(draft(n)).unwrap());
        }
        // Simulated crash: drop without any shutdown step.
    }
    {
        let log = open(&path);
        assert_eq!(log.last_seq(), 3);
        for n in 3..6 {
            seen.push(log.append(draft(n)).unwrap());
        }
    }

    assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
    let log = open(&path);
    assert!(log.verify_integrity().is_ok());
    assert_eq!(log.stream_since(4).len(), 2);
}

#[test]
fn torn_tail_is_dropped_and_seq_continues() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.log");
    {
        let log = open(&path);
        log.append(draft(0)).unwrap();
        log.append(draft(1)).unwrap();
    }
    {
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"seq\":3,\"timestamp\":").unwrap();
    }

    let log = open(&path);
    assert_eq!(log.last_seq(), 2);
    assert_eq!(log.append(draft(2)).unwrap(), 3);
    assert!(log.verify_integrity().is_ok());
}

#[test]
fn edited_history_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.log");
    {
        let log = open(&path);
        log.append(draft(0)).unwrap();
        log.append(draft(1)).unwrap();
    }
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, text.replace("action-0", "action-X")).unwrap();

    let err = AuditLog::open(&path, Arc::new(SystemClock)).unwrap_err();
    assert!(matches!(err, LedgerError::IntegrityViolation { seq: 1, .. }));
}

#[test]
fn concurrent_appends_are_totally_ordered() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(open(&dir.path().join("audit.log")));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let log = Arc::clone(&log);
            std::thread::spawn(move || {
                (0..25)
                    .map(|n| log.append(draft(t * 100 + n)).unwrap())
                    .collect::<Vec<u64>>()
            })
        })
        .collect();

    let mut all: Vec<u64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all.sort_unstable();

    assert_eq!(all, (1..=200).collect::<Vec<u64>>());
    assert!(log.verify_integrity().is_ok());
}
