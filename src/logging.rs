//! Gateway event log: a bounded in-memory ring of recent events, appended to a
//! JSONL file and mirrored into `tracing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

const MAX_EVENTS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl GatewayEvent {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            component: component.into(),
            message: message.into(),
            request_id: None,
            context: None,
        }
    }

    pub fn for_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, ctx: serde_json::Value) -> Self {
        self.context = Some(ctx);
        self
    }

    fn trace(&self) {
        let request_id = self.request_id.as_deref().unwrap_or("-");
        match self.level {
            LogLevel::Debug => {
                tracing::debug!(component = %self.component, request_id, "{}", self.message)
            }
            LogLevel::Info => {
                tracing::info!(component = %self.component, request_id, "{}", self.message)
            }
            LogLevel::Warn => {
                tracing::warn!(component = %self.component, request_id, "{}", self.message)
            }
            LogLevel::Error => {
                tracing::error!(component = %self.component, request_id, "{}", self.message)
            }
        }
    }
}

struct EventLog {
    events: VecDeque<GatewayEvent>,
    writer: Option<BufWriter<File>>,
}

impl EventLog {
    fn open(file_path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut events = VecDeque::with_capacity(1024);
        let mut stored_lines = 0;
        if file_path.exists() {
            let reader = BufReader::new(File::open(file_path)?);
            for line in reader.lines().map_while(std::result::Result::ok) {
                stored_lines += 1;
                if let Ok(event) = serde_json::from_str::<GatewayEvent>(&line) {
                    push_bounded(&mut events, event);
                }
            }
        }

        // Rewrite the file to the retained ring so it stays bounded across restarts.
        if stored_lines > events.len() {
            compact(file_path, &events)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        Ok(Self {
            events,
            writer: Some(BufWriter::new(file)),
        })
    }

    fn in_memory() -> Self {
        Self {
            events: VecDeque::new(),
            writer: None,
        }
    }

    fn append(&mut self, event: GatewayEvent) {
        if let Some(writer) = self.writer.as_mut() {
            if let Ok(json) = serde_json::to_string(&event) {
                let _ = writeln!(writer, "{json}");
                let _ = writer.flush();
            }
        }
        push_bounded(&mut self.events, event);
    }

    fn recent(&self, limit: usize) -> Vec<GatewayEvent> {
        self.events.iter().rev().take(limit).cloned().collect()
    }
}

fn compact(file_path: &Path, events: &VecDeque<GatewayEvent>) -> std::io::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(file_path)?;
    let mut writer = BufWriter::new(file);
    for event in events {
        if let Ok(json) = serde_json::to_string(event) {
            writeln!(writer, "{json}")?;
        }
    }
    writer.flush()
}

fn push_bounded(events: &mut VecDeque<GatewayEvent>, event: GatewayEvent) {
    if events.len() >= MAX_EVENTS {
        events.pop_front();
    }
    events.push_back(event);
}

/// Cloneable handle to the event log shared by all handlers.
#[derive(Clone)]
pub struct SharedLogger(Arc<Mutex<EventLog>>);

impl SharedLogger {
    /// Open (or create) the JSONL file at `file_path`, replaying its tail into memory.
    pub fn new(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(EventLog::open(
            file_path.as_ref(),
        )?))))
    }

    /// A logger with no backing file.
    pub fn in_memory() -> Self {
        Self(Arc::new(Mutex::new(EventLog::in_memory())))
    }

    pub fn log(&self, event: GatewayEvent) {
        event.trace();
        if let Ok(mut log) = self.0.lock() {
            log.append(event);
        }
    }

    pub fn info(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(GatewayEvent::new(LogLevel::Info, component, message));
    }

    pub fn warn(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(GatewayEvent::new(LogLevel::Warn, component, message));
    }

    pub fn error(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(GatewayEvent::new(LogLevel::Error, component, message));
    }

    /// Log an event tied to one exchange.
    pub fn request_event(
        &self,
        level: LogLevel,
        request_id: &str,
        component: impl Into<String>,
        message: impl Into<String>,
        context: Option<serde_json::Value>,
    ) {
        let event = GatewayEvent::new(level, component, message).for_request(request_id);
        self.log(match context {
            Some(ctx) => event.with_context(ctx),
            None => event,
        });
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<GatewayEvent> {
        self.0.lock().map(|l| l.recent(limit)).unwrap_or_default()
    }
}

impl std::fmt::Debug for SharedLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLogger").finish_non_exhaustive()
    }
}
