//! Session recording and replay.
//!
//! Terminal output is appended to a replay log as it streams, framed by
//! the codec in `opshub_core::record`. Files land under a fixed layout:
//!
//! ```text
//! {base}/{machine_id}/{YYYYMMDD}/{operator}/{YYYYMMDD_HHMMSS}.rec
//! ```
//!
//! so replays can be listed per machine and day without an index.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use bytes::BytesMut;
use chrono::{DateTime, Local};
use tracing::{debug, info};

use opshub_core::constants::RECORDING_EXT;
use opshub_core::record::encode_event;
use opshub_core::{Error, ResourceId, Result};

/// Appends timestamped output chunks to one replay log.
///
/// Timestamps are milliseconds relative to recorder creation, so replay
/// speed is independent of wall-clock time. The writer is buffered;
/// [`finish`](Self::finish) (or drop) flushes it.
pub struct SessionRecorder {
    writer: BufWriter<File>,
    path: PathBuf,
    start: Instant,
    buf: BytesMut,
    finished: bool,
}

impl SessionRecorder {
    /// Create the log file for a session starting now.
    pub fn create(
        base: &Path,
        machine_id: ResourceId,
        operator: &str,
        started_at: DateTime<Local>,
    ) -> Result<Self> {
        let day = started_at.format("%Y%m%d").to_string();
        let dir = base
            .join(machine_id.to_string())
            .join(&day)
            .join(sanitize_component(operator));
        fs::create_dir_all(&dir)
            .map_err(|e| Error::recording(format!("create {}: {}", dir.display(), e)))?;

        let file_name = format!("{}.{}", started_at.format("%Y%m%d_%H%M%S"), RECORDING_EXT);
        let path = dir.join(file_name);
        let file = File::create(&path)
            .map_err(|e| Error::recording(format!("create {}: {}", path.display(), e)))?;

        info!(resource_id = machine_id, path = %path.display(), "Recording session");
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            start: Instant::now(),
            buf: BytesMut::new(),
            finished: false,
        })
    }

    /// Append one output chunk with its elapsed-time header.
    pub fn record(&mut self, payload: &[u8]) -> Result<()> {
        let elapsed_ms = self.start.elapsed().as_millis() as u64;
        self.buf.clear();
        encode_event(&mut self.buf, elapsed_ms, payload)?;
        self.writer
            .write_all(&self.buf)
            .map_err(|e| Error::recording(format!("write {}: {}", self.path.display(), e)))
    }

    /// Flush buffered records to disk. Idempotent.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.writer
            .flush()
            .map_err(|e| Error::recording(format!("flush {}: {}", self.path.display(), e)))?;
        debug!(path = %self.path.display(), "Recording finished");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionRecorder {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

/// One replay log on disk, relative to the store base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingEntry {
    pub day: String,
    pub operator: String,
    pub file_name: String,
    /// Path relative to the store base, usable with [`ReplayStore::read`].
    pub rel_path: PathBuf,
}

/// Read access to recorded sessions.
pub struct ReplayStore {
    base: PathBuf,
}

impl ReplayStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Every recording for `machine_id`, newest first.
    ///
    /// A machine with no recordings yields an empty list, not an error.
    pub fn list(&self, machine_id: ResourceId) -> Result<Vec<RecordingEntry>> {
        let machine_dir = self.base.join(machine_id.to_string());
        if !machine_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for day_entry in read_dir(&machine_dir)? {
            let day = day_entry.file_name().to_string_lossy().into_owned();
            if !day_entry.path().is_dir() {
                continue;
            }
            for operator_entry in read_dir(&day_entry.path())? {
                let operator = operator_entry.file_name().to_string_lossy().into_owned();
                if !operator_entry.path().is_dir() {
                    continue;
                }
                let suffix = format!(".{}", RECORDING_EXT);
                for file_entry in read_dir(&operator_entry.path())? {
                    let file_name = file_entry.file_name().to_string_lossy().into_owned();
                    if !file_name.ends_with(&suffix) {
                        continue;
                    }
                    entries.push(RecordingEntry {
                        rel_path: PathBuf::from(machine_id.to_string())
                            .join(&day)
                            .join(&operator)
                            .join(&file_name),
                        day: day.clone(),
                        operator: operator.clone(),
                        file_name,
                    });
                }
            }
        }

        // File names embed the start timestamp, so lexicographic order
        // is chronological order.
        entries.sort_by(|a, b| (&b.day, &b.file_name).cmp(&(&a.day, &a.file_name)));
        Ok(entries)
    }

    /// Raw bytes of one replay log. Rejects paths that escape the base
    /// directory.
    pub fn read(&self, rel_path: &Path) -> Result<Vec<u8>> {
        if rel_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::AccessDenied {
                message: format!("replay path {} escapes the store", rel_path.display()),
            });
        }
        let full = self.base.join(rel_path);
        fs::read(&full).map_err(|e| Error::recording(format!("read {}: {}", full.display(), e)))
    }
}

fn read_dir(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    let iter =
        fs::read_dir(dir).map_err(|e| Error::recording(format!("list {}: {}", dir.display(), e)))?;
    let mut entries = Vec::new();
    for entry in iter {
        entries
            .push(entry.map_err(|e| Error::recording(format!("list {}: {}", dir.display(), e)))?);
    }
    Ok(entries)
}

/// Strip anything that could change the directory layout out of an
/// operator-supplied path segment.
fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use opshub_core::record::decode_all;

    #[test]
    fn records_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let started = Local::now();

        let mut recorder = SessionRecorder::create(dir.path(), 42, "alice", started).unwrap();
        recorder.record(b"hello ").unwrap();
        recorder.record(b"world").unwrap();
        recorder.finish().unwrap();

        let store = ReplayStore::new(dir.path());
        let listed = store.list(42).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].operator, "alice");

        let raw = store.read(&listed[0].rel_path).unwrap();
        let events = decode_all(&raw).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(&events[0].payload[..], b"hello ");
        assert_eq!(&events[1].payload[..], b"world");
        assert!(events[0].elapsed_ms <= events[1].elapsed_ms);
    }

    #[test]
    fn list_is_empty_for_unknown_machine() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReplayStore::new(dir.path());
        assert!(store.list(999).unwrap().is_empty());
    }

    #[test]
    fn read_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReplayStore::new(dir.path());
        let result = store.read(Path::new("../etc/passwd"));
        assert!(matches!(result, Err(Error::AccessDenied { .. })));
    }

    #[test]
    fn operator_names_are_sanitized() {
        assert_eq!(sanitize_component("alice"), "alice");
        assert_eq!(sanitize_component("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_component(".."), "unknown");
        assert_eq!(sanitize_component(""), "unknown");
    }
}
