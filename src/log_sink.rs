//! Shared record of recent tunnel output.
//!
//! Appends go to a bounded in-memory ring and to a size-rotated file on
//! disk. One writer lock serializes appends from all pumps and the
//! supervisor so interleaved lines from different instances never corrupt
//! a single line. The file is opened, appended, and closed per write; a
//! crash can lose at most the line being written.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::warn;

/// Source tag for supervisor-level events.
pub const SYSTEM_SOURCE: &str = "System";

const DEFAULT_RING_CAPACITY: usize = 1000;
const DEFAULT_MAX_FILE_BYTES: u64 = 1024 * 1024;
const DEFAULT_MAX_BACKUPS: usize = 3;

/// One timestamped, alias-tagged output line.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub timestamp: DateTime<Local>,
    pub source: String,
    pub message: String,
}

impl LogRecord {
    pub fn format_line(&self) -> String {
        format!(
            "{} [{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.source,
            self.message
        )
    }
}

pub struct LogSink {
    path: PathBuf,
    capacity: usize,
    max_file_bytes: u64,
    max_backups: usize,
    ring: Mutex<VecDeque<LogRecord>>,
}

impl LogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_limits(
            path,
            DEFAULT_RING_CAPACITY,
            DEFAULT_MAX_FILE_BYTES,
            DEFAULT_MAX_BACKUPS,
        )
    }

    pub fn with_limits(
        path: impl Into<PathBuf>,
        capacity: usize,
        max_file_bytes: u64,
        max_backups: usize,
    ) -> Self {
        Self {
            path: path.into(),
            capacity: capacity.max(1),
            max_file_bytes,
            max_backups,
            ring: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends one record. Disk failures degrade to a warning; the ring
    /// keeps the record either way.
    pub fn append(&self, source: &str, message: &str) {
        let record = LogRecord {
            timestamp: Local::now(),
            source: source.to_string(),
            message: message.to_string(),
        };
        let line = record.format_line();

        let mut ring = self.ring.lock();
        while ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(record);

        if let Err(err) = self.write_line(&line) {
            warn!("log file write failed: {err}");
        }
    }

    /// Supervisor-level event, tagged `System`.
    pub fn system(&self, message: &str) {
        self.append(SYSTEM_SOURCE, message);
    }

    /// Most recent `n` lines, oldest first. Prefers the persisted file and
    /// falls back to the ring when the file is unavailable.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let ring = self.ring.lock();
        match fs::read_to_string(&self.path) {
            Ok(content) => {
                let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();
                let start = lines.len().saturating_sub(n);
                lines[start..].iter().map(|l| l.to_string()).collect()
            }
            Err(_) => {
                let start = ring.len().saturating_sub(n);
                ring.iter().skip(start).map(LogRecord::format_line).collect()
            }
        }
    }

    /// Empties the ring and removes the file plus its backups, then
    /// records the clear itself.
    pub fn clear(&self) {
        {
            let mut ring = self.ring.lock();
            ring.clear();
            let _ = fs::remove_file(&self.path);
            for index in 1..=self.max_backups {
                let _ = fs::remove_file(self.backup_path(index));
            }
        }
        self.system("Log cleared");
    }

    fn write_line(&self, line: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        self.rotate_if_needed(line.len() as u64 + 1)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")
    }

    /// Shifts `file -> file.1 -> file.2 -> ...` when the incoming line
    /// would push the active file past its size cap; the oldest backup
    /// falls off the end.
    fn rotate_if_needed(&self, incoming: u64) -> io::Result<()> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size + incoming <= self.max_file_bytes {
            return Ok(());
        }
        if self.max_backups == 0 {
            return fs::remove_file(&self.path);
        }
        let _ = fs::remove_file(self.backup_path(self.max_backups));
        for index in (1..self.max_backups).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                let _ = fs::rename(&from, self.backup_path(index + 1));
            }
        }
        fs::rename(&self.path, self.backup_path(1))
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        PathBuf::from(format!("{}.{index}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn ring_evicts_oldest_when_full() {
        let dir = tempdir().unwrap();
        let sink = LogSink::with_limits(dir.path().join("t.log"), 3, u64::MAX, 0);

        for i in 0..5 {
            sink.append("a", &format!("line-{i}"));
        }
        // Force the ring path by removing the file.
        fs::remove_file(dir.path().join("t.log")).unwrap();

        let lines = sink.tail(10);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("line-2"));
        assert!(lines[2].ends_with("line-4"));
    }

    #[test]
    fn tail_prefers_file_over_ring() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.log");
        let sink = LogSink::with_limits(&path, 2, u64::MAX, 0);

        for i in 0..4 {
            sink.append("a", &format!("line-{i}"));
        }

        // The ring only holds the last two records, the file all four.
        let lines = sink.tail(10);
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("line-0"));
    }

    #[test]
    fn tail_zero_is_empty() {
        let dir = tempdir().unwrap();
        let sink = LogSink::new(dir.path().join("t.log"));
        sink.append("a", "one");
        assert!(sink.tail(0).is_empty());
    }

    #[test]
    fn clear_drops_earlier_records() {
        let dir = tempdir().unwrap();
        let sink = LogSink::new(dir.path().join("t.log"));

        sink.append("a", "before-1");
        sink.append("b", "before-2");
        sink.clear();

        let lines = sink.tail(50);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[System] Log cleared"));
        assert!(!lines.iter().any(|l| l.contains("before")));
    }

    #[test]
    fn rotation_caps_file_size_and_backup_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.log");
        let sink = LogSink::with_limits(&path, 100, 256, 2);

        for i in 0..100 {
            sink.append("rotor", &format!("padding padding padding {i}"));
        }

        assert!(fs::metadata(&path).unwrap().len() <= 512);
        assert!(dir.path().join("t.log.1").exists());
        assert!(!dir.path().join("t.log.3").exists());
    }

    #[test]
    fn concurrent_appends_never_corrupt_lines() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(LogSink::new(dir.path().join("t.log")));

        let mut handles = Vec::new();
        for source in ["A", "B"] {
            let sink = Arc::clone(&sink);
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    sink.append(source, &format!("{source}-line-{i}"));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let lines = sink.tail(500);
        assert_eq!(lines.len(), 200);
        for line in &lines {
            let tagged_a = line.contains("[A]") && line.contains("A-line-");
            let tagged_b = line.contains("[B]") && line.contains("B-line-");
            assert!(tagged_a ^ tagged_b, "corrupted line: {line}");
        }
    }
}
