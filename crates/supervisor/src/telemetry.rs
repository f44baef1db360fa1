use std::io::Write;
use std::sync::{Arc, Mutex};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warn,
    Error,
    Fatal,
}

/// One structured telemetry event, e.g. a status update or the run summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub level: Level,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub msg: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Event {
    pub fn new(level: Level, topic: &str) -> Self {
        Event {
            level,
            topic: topic.to_string(),
            action: None,
            msg: String::new(),
            fields: Map::new(),
        }
    }

    pub fn info(topic: &str) -> Self {
        Self::new(Level::Info, topic)
    }

    pub fn warn(topic: &str) -> Self {
        Self::new(Level::Warn, topic)
    }

    pub fn error(topic: &str) -> Self {
        Self::new(Level::Error, topic)
    }

    pub fn fatal(topic: &str) -> Self {
        Self::new(Level::Fatal, topic)
    }

    pub fn action(mut self, action: &str) -> Self {
        self.action = Some(action.to_string());
        self
    }

    pub fn msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = msg.into();
        self
    }

    pub fn field(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn fields(mut self, fields: Map<String, Value>) -> Self {
        self.fields.extend(fields);
        self
    }
}

/// An event stamped with time and run id, as written to a sink
#[derive(Debug, Serialize)]
pub struct Record<'a> {
    pub ts: DateTime<Utc>,
    pub run: Uuid,
    #[serde(flatten)]
    pub event: &'a Event,
}

pub trait TelemetrySink: Send + Sync {
    fn write(&self, record: &Record<'_>);
}

/// Writes one JSON object per line
pub struct JsonLines<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLines<W> {
    pub fn new(out: W) -> Self {
        JsonLines { out: Mutex::new(out) }
    }
}

impl JsonLines<std::io::Stderr> {
    /// ffmpeg may own stdout (`pipe:1` outputs), so telemetry goes to stderr
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }
}

impl<W: Write + Send> TelemetrySink for JsonLines<W> {
    fn write(&self, record: &Record<'_>) {
        let Ok(mut out) = self.out.lock() else {
            return;
        };
        if let Err(e) = write_line(&mut *out, record) {
            log::error!("failed to write telemetry: {}", e);
        }
    }
}

fn write_line<W: Write>(out: &mut W, record: &Record<'_>) -> std::io::Result<()> {
    serde_json::to_writer(&mut *out, record)?;
    out.write_all(b"\n")?;
    out.flush()
}

/// Keeps events in memory; handy for embedding and tests
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl TelemetrySink for MemorySink {
    fn write(&self, record: &Record<'_>) {
        if let Ok(mut events) = self.events.lock() {
            events.push(record.event.clone());
        }
    }
}

/// Emits events for one supervised run. Every attempt of the run shares the run id.
#[derive(Clone)]
pub struct Telemetry {
    run: Uuid,
    sink: Arc<dyn TelemetrySink>,
}

impl Telemetry {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Telemetry { run: Uuid::new_v4(), sink }
    }

    pub fn run_id(&self) -> Uuid {
        self.run
    }

    pub fn emit(&self, event: Event) {
        let record = Record {
            ts: Utc::now(),
            run: self.run,
            event: &event,
        };
        self.sink.write(&record);
    }
}
