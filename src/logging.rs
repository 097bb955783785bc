//! Request monitor: a ring buffer of per-request records and component events,
//! persisted as JSONL and reloaded at startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

const MAX_LOG_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            component: component.into(),
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, ctx: serde_json::Value) -> Self {
        self.context = Some(ctx);
        self
    }
}

/// One proxied request as shown by `/api/request-logs`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub protocol: String,
    pub client_model: String,
    pub mapped_model: String,
    pub provider: String,
    #[serde(default)]
    pub account_email: String,
    pub status: u16,
    pub duration_ms: u64,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl RequestRecord {
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status) && self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestStats {
    pub total: u64,
    pub success: u64,
    pub error: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub avg_duration_ms: u64,
}

/// One JSONL line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum LogLine {
    Request(RequestRecord),
    Event(LogEntry),
}

fn push_capped<T>(buf: &mut VecDeque<T>, item: T) {
    if buf.len() >= MAX_LOG_ENTRIES {
        buf.pop_front();
    }
    buf.push_back(item);
}

/// Ring-buffer logger that persists to JSONL.
pub struct Logger {
    requests: VecDeque<RequestRecord>,
    events: VecDeque<LogEntry>,
    file_path: std::path::PathBuf,
    writer: Option<BufWriter<File>>,
}

impl Logger {
    pub fn new(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file_path = file_path.as_ref().to_path_buf();

        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut requests = VecDeque::with_capacity(MAX_LOG_ENTRIES);
        let mut events = VecDeque::new();
        let mut lines_read = 0usize;

        if file_path.exists() {
            let file = File::open(&file_path)?;
            let reader = BufReader::new(file);
            for line in reader.lines().map_while(std::result::Result::ok) {
                lines_read += 1;
                match serde_json::from_str::<LogLine>(&line) {
                    Ok(LogLine::Request(record)) => push_capped(&mut requests, record),
                    Ok(LogLine::Event(entry)) => push_capped(&mut events, entry),
                    Err(_) => {}
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)?;
        let mut logger = Self {
            requests,
            events,
            file_path,
            writer: Some(BufWriter::new(file)),
        };

        if lines_read > logger.requests.len() + logger.events.len() {
            logger.compact()?;
        }
        Ok(logger)
    }

    fn append(&mut self, line: &LogLine) {
        if let Some(ref mut writer) = self.writer {
            if let Ok(json) = serde_json::to_string(line) {
                let _ = writeln!(writer, "{}", json);
                let _ = writer.flush();
            }
        }
    }

    pub fn log(&mut self, entry: LogEntry) {
        let line = LogLine::Event(entry);
        self.append(&line);
        if let LogLine::Event(entry) = line {
            push_capped(&mut self.events, entry);
        }
    }

    pub fn record(&mut self, record: RequestRecord) {
        let line = LogLine::Request(record);
        self.append(&line);
        if let LogLine::Request(record) = line {
            push_capped(&mut self.requests, record);
        }
    }

    /// Newest request records first.
    pub fn recent(&self, limit: usize) -> Vec<RequestRecord> {
        self.requests.iter().rev().take(limit).cloned().collect()
    }

    pub fn recent_events(&self, limit: usize) -> Vec<LogEntry> {
        self.events.iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> RequestStats {
        let mut stats = RequestStats::default();
        let mut total_ms = 0u64;
        for r in &self.requests {
            stats.total += 1;
            if r.is_success() {
                stats.success += 1;
            } else {
                stats.error += 1;
            }
            stats.input_tokens += r.input_tokens;
            stats.output_tokens += r.output_tokens;
            total_ms += r.duration_ms;
        }
        if stats.total > 0 {
            stats.avg_duration_ms = total_ms / stats.total;
        }
        stats
    }

    /// Rewrite the file with only what the buffers still hold.
    pub fn compact(&mut self) -> std::io::Result<()> {
        self.writer = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.file_path)?;
        let mut writer = BufWriter::new(file);
        for entry in &self.events {
            if let Ok(json) = serde_json::to_string(&LogLine::Event(entry.clone())) {
                writeln!(writer, "{}", json)?;
            }
        }
        for record in &self.requests {
            if let Ok(json) = serde_json::to_string(&LogLine::Request(record.clone())) {
                writeln!(writer, "{}", json)?;
            }
        }
        writer.flush()?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }
}

#[derive(Clone)]
pub struct SharedLogger(Arc<Mutex<Logger>>);

impl SharedLogger {
    pub fn new(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(Logger::new(file_path)?))))
    }

    pub fn log(&self, entry: LogEntry) {
        if let Ok(mut logger) = self.0.lock() {
            logger.log(entry);
        }
    }

    pub fn info(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Info, component, message));
    }

    pub fn warn(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Warn, component, message));
    }

    pub fn error(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Error, component, message));
    }

    pub fn debug(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Debug, component, message));
    }

    pub fn log_with_context(
        &self,
        level: LogLevel,
        component: impl Into<String>,
        message: impl Into<String>,
        context: serde_json::Value,
    ) {
        self.log(LogEntry::new(level, component, message).with_context(context));
    }

    pub fn record(&self, record: RequestRecord) {
        if let Ok(mut logger) = self.0.lock() {
            logger.record(record);
        }
    }

    pub fn recent(&self, limit: usize) -> Vec<RequestRecord> {
        self.0.lock().map(|l| l.recent(limit)).unwrap_or_default()
    }

    pub fn recent_events(&self, limit: usize) -> Vec<LogEntry> {
        self.0.lock().map(|l| l.recent_events(limit)).unwrap_or_default()
    }

    pub fn stats(&self) -> RequestStats {
        self.0.lock().map(|l| l.stats()).unwrap_or_default()
    }
}
