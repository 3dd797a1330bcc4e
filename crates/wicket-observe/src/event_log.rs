use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::{Event, EventSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLogConfig {
    pub log_path: PathBuf,
    pub flush_every: usize,
}

impl EventLogConfig {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            flush_every: 1,
        }
    }

    pub fn with_flush_every(mut self, flush_every: usize) -> Self {
        self.flush_every = flush_every.max(1);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct EventRecord<'a> {
    sequence_id: u64,
    kind: &'static str,
    flow_id: u64,
    client_addr: &'a str,
    server_host: &'a str,
    server_port: u16,
    occurred_at_unix_ms: u128,
    attributes: &'a BTreeMap<String, String>,
}

#[derive(Debug)]
struct EventLogState {
    writer: BufWriter<File>,
    events_since_flush: usize,
}

/// Appends one JSON object per event to a newline-delimited log file.
///
/// Write failures never reach the connection path; they are counted and the
/// last error message is retained for inspection.
#[derive(Debug)]
pub struct FileEventSink {
    config: EventLogConfig,
    state: Mutex<EventLogState>,
    next_sequence_id: AtomicU64,
    write_error_count: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl FileEventSink {
    pub fn new(config: EventLogConfig) -> io::Result<Self> {
        if config.log_path.as_os_str().is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "event log path must not be empty",
            ));
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_path)?;
        Ok(Self {
            config,
            state: Mutex::new(EventLogState {
                writer: BufWriter::new(file),
                events_since_flush: 0,
            }),
            next_sequence_id: AtomicU64::new(1),
            write_error_count: AtomicU64::new(0),
            last_error: Mutex::new(None),
        })
    }

    pub fn flush(&self) -> io::Result<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.events_since_flush = 0;
        state.writer.flush()
    }

    pub fn write_error_count(&self) -> u64 {
        self.write_error_count.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("lock poisoned").clone()
    }

    fn append(&self, event: &Event) -> io::Result<()> {
        let record = EventRecord {
            sequence_id: self.next_sequence_id.fetch_add(1, Ordering::Relaxed),
            kind: event.kind.as_str(),
            flow_id: event.context.flow_id,
            client_addr: &event.context.client_addr,
            server_host: &event.context.server_host,
            server_port: event.context.server_port,
            occurred_at_unix_ms: event.occurred_at_unix_ms,
            attributes: &event.attributes,
        };
        let line = serde_json::to_string(&record)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error.to_string()))?;

        let mut state = self.state.lock().expect("lock poisoned");
        state.writer.write_all(line.as_bytes())?;
        state.writer.write_all(b"\n")?;
        state.events_since_flush += 1;
        if state.events_since_flush >= self.config.flush_every {
            state.events_since_flush = 0;
            state.writer.flush()?;
        }
        Ok(())
    }
}

impl EventSink for FileEventSink {
    fn emit(&self, event: Event) {
        if let Err(error) = self.append(&event) {
            self.write_error_count.fetch_add(1, Ordering::Relaxed);
            *self.last_error.lock().expect("lock poisoned") = Some(error.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{EventLogConfig, FileEventSink};
    use crate::{Event, EventSink, EventType, FlowContext};

    fn temp_log_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("wicket-event-log-{name}-{}", std::process::id()));
        path
    }

    #[test]
    fn events_are_written_as_one_json_object_per_line() {
        let path = temp_log_path("ndjson");
        let _ = std::fs::remove_file(&path);
        let sink = FileEventSink::new(EventLogConfig::new(&path)).expect("create sink");

        let context = FlowContext {
            flow_id: 3,
            client_addr: "127.0.0.1:4000".to_string(),
            server_host: "example.com".to_string(),
            server_port: 80,
        };
        sink.emit(Event::new(EventType::RequestReceived, context.clone()));
        sink.emit(
            Event::new(EventType::StreamClosed, context).with_attribute("reason_code", "relay_eof"),
        );
        sink.flush().expect("flush");

        let contents = std::fs::read_to_string(&path).expect("read log");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("valid json");
        assert_eq!(first["kind"], "request_received");
        assert_eq!(first["server_host"], "example.com");
        let second: serde_json::Value = serde_json::from_str(lines[1]).expect("valid json");
        assert_eq!(second["attributes"]["reason_code"], "relay_eof");
        assert_eq!(sink.write_error_count(), 0);

        let _ = std::fs::remove_file(&path);
    }
}
