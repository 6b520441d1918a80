use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};

use crate::thinking::ThinkingResult;

/// One frame of a streamed generation.
#[derive(Debug, Clone, PartialEq)]
pub enum ThinkingEvent {
    Log(String),
    /// Base64 sketch, sent once after phase 1.
    Sketch(String),
    Result(ThinkingResult),
    Error(String),
}

impl ThinkingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Log(_) => "log",
            Self::Sketch(_) => "sketch",
            Self::Result(_) => "result",
            Self::Error(_) => "error",
        }
    }

    /// SSE `data` payload: plain text for log/sketch/error, JSON for result.
    pub fn data(&self) -> anyhow::Result<String> {
        match self {
            Self::Log(text) | Self::Sketch(text) | Self::Error(text) => Ok(text.clone()),
            Self::Result(result) => Ok(serde_json::to_string(result)?),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result(_) | Self::Error(_))
    }
}

/// Destination for thinking events (an SSE channel, a terminal, a test
/// buffer).
pub trait EventSink: Send + Sync {
    fn send(&self, event: ThinkingEvent) -> anyhow::Result<()>;

    /// True once the consumer has gone away. Producers check this between
    /// phases to stop early.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Serialised writer over an [`EventSink`].
///
/// Enforces that a stream carries at most one terminal event: once a
/// `result` or `error` has been written, every later event is dropped.
#[derive(Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

struct EventWriterInner {
    run_id: String,
    sink: Box<dyn EventSink>,
    terminated: Mutex<bool>,
}

impl EventWriter {
    pub fn new(sink: impl EventSink + 'static, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                run_id: run_id.into(),
                sink: Box::new(sink),
                terminated: Mutex::new(false),
            }),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// Writes `event` unless the stream already terminated. Returns whether
    /// the event was written.
    pub fn emit(&self, event: ThinkingEvent) -> anyhow::Result<bool> {
        let mut terminated = self
            .inner
            .terminated
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        if *terminated {
            tracing::debug!(
                run_id = %self.inner.run_id,
                event = event.name(),
                "dropping event after terminal"
            );
            return Ok(false);
        }
        if event.is_terminal() {
            *terminated = true;
        }
        self.inner.sink.send(event)?;
        Ok(true)
    }

    pub fn log(&self, line: impl Into<String>) -> anyhow::Result<bool> {
        self.emit(ThinkingEvent::Log(line.into()))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.sink.is_closed()
    }
}

/// In-memory sink that keeps every event it receives.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<ThinkingEvent>>>,
    closed: Arc<Mutex<bool>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ThinkingEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Simulates the consumer disconnecting.
    pub fn close(&self) {
        if let Ok(mut closed) = self.closed.lock() {
            *closed = true;
        }
    }
}

impl EventSink for RecordingSink {
    fn send(&self, event: ThinkingEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("recording sink lock poisoned"))?
            .push(event);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.lock().map(|closed| *closed).unwrap_or(true)
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
