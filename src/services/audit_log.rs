//! Audit trail - append-only record of coordinator events
//!
//! One timestamped line per event, read back whole for the dashboard.
//! Appends are serialized so concurrent writers never interleave a line.

use crate::domain::types::LogEntry;
use crate::infra::clock::Clock;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Returned by `read_all` when the backing file cannot be read
pub const LOGS_UNAVAILABLE: &str = "Unable to load logs.";

enum Sink {
    File(PathBuf),
    Memory(Vec<String>),
}

pub struct AuditLog {
    sink: Mutex<Sink>,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    /// Audit trail backed by a text file (created on first append)
    pub fn with_file(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Self {
        let path = path.as_ref().to_path_buf();
        info!(file_path = %path.display(), "audit_log_initialized");
        Self { sink: Mutex::new(Sink::File(path)), clock }
    }

    /// Audit trail kept in memory only
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self { sink: Mutex::new(Sink::Memory(Vec::new())), clock }
    }

    /// Append one timestamped line. A write failure is logged, never raised.
    pub fn append(&self, message: impl Into<String>) -> LogEntry {
        let entry = LogEntry::new(self.clock.now(), message);
        let line = entry.to_line();

        let mut sink = self.sink.lock();
        match &mut *sink {
            Sink::File(path) => {
                if let Err(e) = append_line(path, &line) {
                    error!(file = %path.display(), error = %e, "audit_append_failed");
                } else {
                    debug!(file = %path.display(), bytes = %line.len(), "audit_appended");
                }
            }
            Sink::Memory(lines) => lines.push(line),
        }
        entry
    }

    /// Full accumulated content, oldest line first
    pub fn read_all(&self) -> String {
        let sink = self.sink.lock();
        match &*sink {
            Sink::File(path) => match std::fs::read_to_string(path) {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(e) => {
                    error!(file = %path.display(), error = %e, "audit_read_failed");
                    LOGS_UNAVAILABLE.to_string()
                }
            },
            Sink::Memory(lines) => {
                let mut content = String::new();
                for line in lines {
                    content.push_str(line);
                    content.push('\n');
                }
                content
            }
        }
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::clock::ManualClock;
    use chrono::{Duration, NaiveDate};
    use std::fs;
    use tempfile::tempdir;

    fn clock() -> ManualClock {
        let start = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap().and_hms_opt(8, 0, 0).unwrap();
        ManualClock::at(start)
    }

    #[test]
    fn test_append_and_read_in_order() {
        let clock = clock();
        let log = AuditLog::in_memory(Arc::new(clock.clone()));

        log.append("ROAD_LIGHT client connected.");
        clock.advance(Duration::minutes(5));
        let entry = log.append("rail_light_cross1 is now RED");
        assert_eq!(entry.message, "rail_light_cross1 is now RED");

        let content = log.read_all();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "[15-01-2025 08:00:00] ROAD_LIGHT client connected.");
        assert_eq!(lines[1], "[15-01-2025 08:05:00] rail_light_cross1 is now RED");
    }

    #[test]
    fn test_file_sink_appends_to_existing_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("TrackFile.txt");
        fs::write(&path, "earlier line\n").unwrap();

        let log = AuditLog::with_file(&path, Arc::new(clock()));
        log.append("Train detected, barrier lowered.");

        let content = log.read_all();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "earlier line");
        assert!(lines[1].ends_with("Train detected, barrier lowered."));
        assert_eq!(fs::read_to_string(&path).unwrap(), content);
    }

    #[test]
    fn test_file_sink_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("logs").join("audit.txt");
        let log = AuditLog::with_file(&path, Arc::new(clock()));

        assert_eq!(log.read_all(), "");
        log.append("first");
        assert!(path.exists());
    }

    #[test]
    fn test_concurrent_appends_keep_whole_lines() {
        let log = Arc::new(AuditLog::in_memory(Arc::new(clock())));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for j in 0..25 {
                        log.append(format!("writer {} line {}", i, j));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let content = log.read_all();
        assert_eq!(content.lines().count(), 200);
        assert!(content.lines().all(|l| l.starts_with("[15-01-2025 08:00:00] writer ")));
    }
}
