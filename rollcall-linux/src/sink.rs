//! Where accepted records go. Delivery is fire-and-forget: a failed write is logged and never
//! takes back an ACK already sent.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use rollcall_core::protocol::wall_clock_ms;
use rollcall_core::StudentRecord;
use serde::Serialize;
use tracing::{info, warn};

pub trait RecordSink: Send + Sync {
    fn deliver(&self, peer: &str, record: &StudentRecord) -> anyhow::Result<()>;
}

/// One line per record in the log.
pub struct LogSink;

impl RecordSink for LogSink {
    fn deliver(&self, peer: &str, record: &StudentRecord) -> anyhow::Result<()> {
        info!(peer, name = %record.name, roll = %record.roll_number, "record");
        Ok(())
    }
}

#[derive(Serialize)]
struct RecordLine<'a> {
    peer: &'a str,
    name: &'a str,
    roll_number: &'a str,
    recorded_at_ms: i64,
}

/// Appends records as JSON lines.
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening records file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }
}

impl RecordSink for JsonlSink {
    fn deliver(&self, peer: &str, record: &StudentRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(&RecordLine {
            peer,
            name: &record.name,
            roll_number: &record.roll_number,
            recorded_at_ms: wall_clock_ms(),
        })?;
        line.push(b'\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("records file lock poisoned"))?;
        file.write_all(&line)
            .and_then(|_| file.flush())
            .with_context(|| format!("appending to {}", self.path.display()))
    }
}

/// Run the sink on a blocking task; the caller does not wait.
pub fn spawn_deliver(sink: Arc<dyn RecordSink>, peer: String, record: StudentRecord) {
    tokio::task::spawn_blocking(move || {
        if let Err(e) = sink.deliver(&peer, &record) {
            warn!(peer = %peer, roll = %record.roll_number, error = %e, "sink failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/records.jsonl");
        let sink = JsonlSink::open(&path).unwrap();
        sink.deliver("AA:01", &StudentRecord::new("Jane Doe", "R-1"))
            .unwrap();
        sink.deliver("AA:02", &StudentRecord::new("Ravi", "R-2"))
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["peer"], "AA:01");
        assert_eq!(lines[0]["name"], "Jane Doe");
        assert_eq!(lines[1]["roll_number"], "R-2");
        assert!(lines[1]["recorded_at_ms"].as_i64().unwrap() > 0);
    }

    #[test]
    fn reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        JsonlSink::open(&path)
            .unwrap()
            .deliver("p", &StudentRecord::new("A", "1"))
            .unwrap();
        JsonlSink::open(&path)
            .unwrap()
            .deliver("p", &StudentRecord::new("B", "2"))
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[test]
    fn log_sink_accepts() {
        assert!(LogSink
            .deliver("p", &StudentRecord::new("A", "1"))
            .is_ok());
    }
}
