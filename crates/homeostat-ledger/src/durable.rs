//! Durable JSON-lines files
//!
//! Every record is one line. A line is acknowledged only after `sync_data`
//! returns, so a crash can leave at most one torn line at the tail; loading
//! truncates it. Corruption anywhere else is an error.
//!
//! A failed append is cut back to the previous length before the error is
//! returned, so a retry starts on a clean line boundary. If that cut fails
//! too the writer refuses further appends.

use crate::error::LedgerError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Load every record from `path`, truncating a torn tail.
///
/// A missing file is an empty log.
pub(crate) fn load_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, LedgerError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut good_len = 0usize;
    let mut line_no = 0usize;

    while offset < bytes.len() {
        line_no += 1;
        // No terminator: the write never completed.
        let Some(rel) = bytes[offset..].iter().position(|b| *b == b'\n') else {
            break;
        };
        let line = &bytes[offset..offset + rel];
        let next = offset + rel + 1;

        if line.iter().all(u8::is_ascii_whitespace) {
            good_len = next;
            offset = next;
            continue;
        }

        match serde_json::from_slice::<T>(line) {
            Ok(record) => {
                records.push(record);
                good_len = next;
            }
            Err(_) if next >= bytes.len() => break,
            Err(e) => {
                return Err(LedgerError::Corrupt {
                    path: path.to_path_buf(),
                    line: line_no,
                    reason: e.to_string(),
                });
            }
        }
        offset = next;
    }

    if good_len < bytes.len() {
        tracing::warn!(
            path = %path.display(),
            dropped_bytes = bytes.len() - good_len,
            "truncating torn tail record"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(good_len as u64)?;
        file.sync_all()?;
    }

    Ok(records)
}

/// The file operations an append needs
pub(crate) trait LogFile: Write + fmt::Debug + Send {
    /// Current length in bytes
    fn size(&self) -> io::Result<u64>;
    /// Cut the file back to `len` bytes
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    /// Flush written data to stable storage
    fn sync(&mut self) -> io::Result<()>;
}

impl LogFile for File {
    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Append-only writer that syncs every line before returning
#[derive(Debug)]
pub(crate) struct LineWriter<F: LogFile = File> {
    path: PathBuf,
    file: F,
    poisoned: bool,
}

impl LineWriter<File> {
    /// Open (creating parent directories) for append
    pub(crate) fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::over(path, file))
    }
}

impl<F: LogFile> LineWriter<F> {
    fn over(path: &Path, file: F) -> Self {
        Self {
            path: path.to_path_buf(),
            file,
            poisoned: false,
        }
    }

    /// Encode, write, and sync one record.
    ///
    /// On failure the file is left exactly as it was before the call.
    pub(crate) fn append<T: Serialize>(&mut self, record: &T) -> Result<(), LedgerError> {
        if self.poisoned {
            return Err(LedgerError::Poisoned {
                path: self.path.clone(),
            });
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let start = self.file.size()?;
        let written = self
            .file
            .write_all(&line)
            .and_then(|()| self.file.sync());
        if let Err(e) = written {
            if let Err(undo) = self.file.truncate(start).and_then(|()| self.file.sync()) {
                tracing::error!(
                    path = %self.path.display(),
                    error = %undo,
                    "could not cut back a failed append, refusing further writes"
                );
                self.poisoned = true;
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homeostat_core::Retryable;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Rec {
        n: u32,
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let recs: Vec<Rec> = load_records(&dir.path().join("nope.log")).unwrap();
        assert!(recs.is_empty());
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "{\"n\":1}\n{\"n\":2}\n{\"n\":").unwrap();

        let recs: Vec<Rec> = load_records(&path).unwrap();
        assert_eq!(recs, vec![Rec { n: 1 }, Rec { n: 2 }]);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"n\":1}\n{\"n\":2}\n");
    }

    #[test]
    fn garbled_last_line_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "{\"n\":1}\n{\"n\"\n").unwrap();

        let recs: Vec<Rec> = load_records(&path).unwrap();
        assert_eq!(recs, vec![Rec { n: 1 }]);
    }

    #[test]
    fn corruption_mid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "{\"n\":1}\ngarbage\n{\"n\":3}\n").unwrap();

        let err = load_records::<Rec>(&path).unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt { line: 2, .. }));
    }

    /// In-memory file with injectable faults
    #[derive(Debug, Default)]
    struct FlakyFile {
        bytes: Vec<u8>,
        write_budget: Option<usize>,
        failing_syncs: usize,
        truncate_fails: bool,
    }

    impl Write for FlakyFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.write_budget {
                Some(0) => {
                    self.write_budget = None;
                    Err(io::Error::other("disk full"))
                }
                Some(n) => {
                    let k = n.min(buf.len());
                    self.bytes.extend_from_slice(&buf[..k]);
                    self.write_budget = Some(n - k);
                    Ok(k)
                }
                None => {
                    self.bytes.extend_from_slice(buf);
                    Ok(buf.len())
                }
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogFile for FlakyFile {
        fn size(&self) -> io::Result<u64> {
            Ok(self.bytes.len() as u64)
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            if self.truncate_fails {
                return Err(io::Error::other("read-only filesystem"));
            }
            self.bytes.truncate(len as usize);
            Ok(())
        }

        fn sync(&mut self) -> io::Result<()> {
            if self.failing_syncs > 0 {
                self.failing_syncs -= 1;
                return Err(io::Error::other("EIO"));
            }
            Ok(())
        }
    }

    fn decoded(file: &FlakyFile) -> Vec<Rec> {
        String::from_utf8(file.bytes.clone())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn flaky() -> LineWriter<FlakyFile> {
        LineWriter::over(Path::new("flaky.log"), FlakyFile::default())
    }

    #[test]
    fn failed_sync_is_cut_back_before_retry() {
        let mut writer = flaky();
        writer.append(&Rec { n: 1 }).unwrap();

        writer.file.failing_syncs = 1;
        assert!(writer.append(&Rec { n: 2 }).is_err());
        writer.append(&Rec { n: 2 }).unwrap();

        assert_eq!(decoded(&writer.file), vec![Rec { n: 1 }, Rec { n: 2 }]);
    }

    #[test]
    fn torn_write_is_cut_back_before_retry() {
        let mut writer = flaky();
        writer.append(&Rec { n: 1 }).unwrap();

        writer.file.write_budget = Some(3);
        assert!(writer.append(&Rec { n: 2 }).is_err());
        writer.append(&Rec { n: 3 }).unwrap();

        assert_eq!(decoded(&writer.file), vec![Rec { n: 1 }, Rec { n: 3 }]);
    }

    #[test]
    fn writer_refuses_appends_after_failed_cut_back() {
        let mut writer = flaky();
        writer.file.failing_syncs = 1;
        writer.file.truncate_fails = true;
        assert!(matches!(
            writer.append(&Rec { n: 1 }),
            Err(LedgerError::Io(_))
        ));

        writer.file.truncate_fails = false;
        let err = writer.append(&Rec { n: 2 }).unwrap_err();
        assert!(matches!(err, LedgerError::Poisoned { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn writer_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("log");
        let mut writer = LineWriter::open(&path).unwrap();
        writer.append(&Rec { n: 7 }).unwrap();
        writer.append(&Rec { n: 8 }).unwrap();

        let recs: Vec<Rec> = load_records(writer.path()).unwrap();
        assert_eq!(recs.len(), 2);
    }
}
