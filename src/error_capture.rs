// Error relay: the host hands raw error events to an ordered handler chain; the capture
// handler turns them into records and ships them to the collector singly or in batches.

use crate::collector::CollectorClient;
use crate::config::ErrorCaptureConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const USER_AGENT_MAX_CHARS: usize = 500;

/// Level reported by the host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorLevel {
    Fatal,
    Recoverable,
    Warning,
    Notice,
    Deprecated,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorOrigin {
    #[default]
    Runtime,
    UncaughtException,
    ShutdownFatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Fatal,
    Critical,
    Error,
    Warning,
    Notice,
}

impl ErrorSeverity {
    pub fn from_level(level: ErrorLevel) -> Self {
        match level {
            ErrorLevel::Fatal => ErrorSeverity::Fatal,
            ErrorLevel::Recoverable => ErrorSeverity::Critical,
            ErrorLevel::Warning => ErrorSeverity::Warning,
            ErrorLevel::Notice | ErrorLevel::Deprecated => ErrorSeverity::Notice,
            ErrorLevel::Other => ErrorSeverity::Error,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RequestContext {
    pub url: Option<String>,
    pub method: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Raw event from the host runtime.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ErrorEvent {
    #[serde(default)]
    pub origin: ErrorOrigin,
    pub level: ErrorLevel,
    pub message: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u32,
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub request: RequestContext,
    /// Free-form host context (user, page, params), forwarded as is.
    #[serde(default)]
    pub context: Value,
    pub runtime_version: Option<String>,
}

/// Record as accepted by `POST /errors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    pub severity: ErrorSeverity,
    pub file: String,
    pub line: u32,
    pub stack_trace: Option<String>,
    pub context: Value,
    pub runtime_version: Option<String>,
    pub url: Option<String>,
    pub request_method: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Turn an event into a record, or drop it by severity filter or exclude pattern.
/// `server` is merged into the record context under `server`.
pub fn capture(event: &ErrorEvent, config: &ErrorCaptureConfig, server: &Value) -> Option<ErrorRecord> {
    let severity = match event.origin {
        ErrorOrigin::Runtime => ErrorSeverity::from_level(event.level),
        ErrorOrigin::UncaughtException => ErrorSeverity::Critical,
        ErrorOrigin::ShutdownFatal => {
            if event.level != ErrorLevel::Fatal {
                return None;
            }
            ErrorSeverity::Fatal
        }
    };
    let wanted = match severity {
        ErrorSeverity::Notice => config.include_notices,
        ErrorSeverity::Warning => config.include_warnings,
        _ => true,
    };
    if !wanted || is_excluded(&event.message, &config.exclude_patterns) {
        return None;
    }

    let mut context = match &event.context {
        Value::Object(map) => Value::Object(map.clone()),
        _ => json!({}),
    };
    if let Some(obj) = context.as_object_mut()
        && !server.is_null()
    {
        obj.insert("server".into(), server.clone());
    }

    Some(ErrorRecord {
        message: event.message.clone(),
        severity,
        file: event.file.clone(),
        line: event.line,
        stack_trace: event.stack_trace.clone(),
        context,
        runtime_version: event.runtime_version.clone(),
        url: event.request.url.clone(),
        request_method: event.request.method.clone(),
        ip_address: event.request.client_ip.clone(),
        user_agent: event
            .request
            .user_agent
            .as_ref()
            .map(|ua| ua.chars().take(USER_AGENT_MAX_CHARS).collect()),
    })
}

/// Case-insensitive substring match; empty patterns never match.
pub fn is_excluded(message: &str, patterns: &[String]) -> bool {
    let message = message.to_lowercase();
    patterns
        .iter()
        .filter(|p| !p.is_empty())
        .any(|p| message.contains(&p.to_lowercase()))
}

/// Buffers records and ships them to the collector without blocking the caller.
pub struct ErrorReporter {
    config: ErrorCaptureConfig,
    collector: Arc<CollectorClient>,
    buffer: Mutex<Vec<Value>>,
}

impl ErrorReporter {
    pub fn new(config: ErrorCaptureConfig, collector: Arc<CollectorClient>) -> Self {
        Self {
            config,
            collector,
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Shutdown fatals and `send_immediately` go out alone; everything else is buffered and
    /// flushed once `batch_size` records are waiting.
    pub fn report(&self, record: &ErrorRecord, origin: ErrorOrigin) -> anyhow::Result<()> {
        let value = serde_json::to_value(record)?;
        if self.config.send_immediately || origin == ErrorOrigin::ShutdownFatal {
            self.send_one(value);
            return Ok(());
        }
        let full = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            buffer.push(value);
            buffer.len() >= self.config.batch_size.max(1)
        };
        if full {
            self.flush();
        }
        Ok(())
    }

    /// Send whatever is buffered as one batch. Returns the send task, if any.
    pub fn flush(&self) -> Option<JoinHandle<()>> {
        let batch = std::mem::take(&mut *self.buffer.lock().unwrap_or_else(|e| e.into_inner()));
        if batch.is_empty() {
            return None;
        }
        let collector = self.collector.clone();
        debug!(count = batch.len(), "flushing error batch");
        Some(tokio::spawn(async move {
            if let Err(e) = collector.send_batch(&batch).await {
                warn!(count = batch.len(), error = %e, "failed to send error batch");
            }
        }))
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn send_one(&self, value: Value) {
        let collector = self.collector.clone();
        tokio::spawn(async move {
            if let Err(e) = collector.send_error(&value).await {
                warn!(error = %e, "failed to send error record");
            }
        });
    }
}

/// One link in the host's error handler chain.
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, event: &ErrorEvent);
}

/// Handlers run in registration order; each sees every event.
#[derive(Default, Clone)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn ErrorHandler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handler: Arc<dyn ErrorHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, event: &ErrorEvent) {
        for handler in &self.handlers {
            handler.handle(event);
        }
    }
}

/// Captures events and hands the records to an [`ErrorReporter`].
pub struct CaptureHandler {
    config: ErrorCaptureConfig,
    reporter: Arc<ErrorReporter>,
    server: Value,
}

impl CaptureHandler {
    pub fn new(config: ErrorCaptureConfig, reporter: Arc<ErrorReporter>, server: Value) -> Self {
        Self {
            config,
            reporter,
            server,
        }
    }
}

impl ErrorHandler for CaptureHandler {
    fn handle(&self, event: &ErrorEvent) {
        let Some(record) = capture(event, &self.config, &self.server) else {
            return;
        };
        if let Err(e) = self.reporter.report(&record, event.origin) {
            warn!(error = %e, "failed to queue error record");
        }
    }
}

/// Mirrors every event into the agent's own log.
pub struct LogHandler;

impl ErrorHandler for LogHandler {
    fn handle(&self, event: &ErrorEvent) {
        debug!(
            origin = ?event.origin,
            level = ?event.level,
            file = %event.file,
            line = event.line,
            "{}",
            event.message
        );
    }
}
