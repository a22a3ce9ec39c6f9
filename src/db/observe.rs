//! Observability hooks: the process-wide connection counter and the analytics,
//! error-report and trace callbacks.
//!
//! None of these influence control flow. The counter is read for analytics only and
//! every callback is fire-and-forget.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{error, trace, warn};
use uuid::Uuid;

use crate::error::DalError;

/// Physical connections currently open across the whole process.
static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// Count one more open physical connection and return the new total.
pub(crate) fn connection_opened() -> usize {
    ACTIVE_CONNECTIONS.fetch_add(1, Ordering::AcqRel) + 1
}

/// Count one closed physical connection and return the new total.
/// Saturates at 0 so an extra release cannot wrap the counter.
pub(crate) fn connection_closed() -> usize {
    let result = ACTIVE_CONNECTIONS.fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
        Some(count.saturating_sub(1))
    });

    match result {
        Ok(0) | Err(0) => {
            warn!("Active connection count underflow detected - extra release call");
            0
        }
        Ok(prev) | Err(prev) => prev - 1,
    }
}

/// Number of physical connections currently open in this process.
pub fn active_connection_count() -> usize {
    ACTIVE_CONNECTIONS.load(Ordering::Acquire)
}

/// Payload of connection analytics events.
#[derive(Debug, Clone)]
pub struct ConnectionAnalyticInfo {
    /// Display name of the engine, e.g. `PostgreSQL`
    pub server_type: String,
    pub repository_name: String,
    /// Connection string with any password masked
    pub connection_string: String,
    pub active_count: usize,
}

/// Payload of command analytics events.
#[derive(Debug, Clone)]
pub struct CommandAnalyticInfo {
    pub session_id: Uuid,
    pub repository_name: String,
    pub command_text: String,
    pub elapsed_seconds: f64,
}

/// Sink for connection and command analytics.
///
/// All methods default to doing nothing so implementors pick the events they need.
pub trait AnalyticRecorder: Send + Sync {
    fn connection_opened(&self, _info: &ConnectionAnalyticInfo) {}
    fn connection_closed(&self, _info: &ConnectionAnalyticInfo) {}
    fn connection_failed(&self, _info: &ConnectionAnalyticInfo) {}
    fn command_completed(&self, _info: &CommandAnalyticInfo) {}
    fn command_failed(&self, _info: &CommandAnalyticInfo) {}
}

/// Diagnostic sink for failures. Never alters control flow.
pub trait ErrorReporter: Send + Sync {
    fn report_error(
        &self,
        error: &DalError,
        message: &str,
        repository: Option<&str>,
        session: Option<Uuid>,
    );
}

/// Single-line textual trace hook.
pub trait TraceWriter: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Analytics sink that drops every event.
#[derive(Debug, Default)]
pub struct NoopAnalytics;

impl AnalyticRecorder for NoopAnalytics {}

/// Default error reporter: logs through `tracing` at error level.
#[derive(Debug, Default)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report_error(
        &self,
        error: &DalError,
        message: &str,
        repository: Option<&str>,
        session: Option<Uuid>,
    ) {
        error!(
            repository = repository.unwrap_or("-"),
            session_id = ?session,
            error = %error,
            "{}",
            message
        );
    }
}

/// Default trace writer: forwards to `tracing::trace!`.
#[derive(Debug, Default)]
pub struct TracingTraceWriter;

impl TraceWriter for TracingTraceWriter {
    fn write_line(&self, line: &str) {
        trace!(target: "cluster_dal::trace", "{}", line);
    }
}

/// The set of callbacks a session reports to.
#[derive(Clone)]
pub struct Observers {
    pub analytics: Arc<dyn AnalyticRecorder>,
    pub errors: Arc<dyn ErrorReporter>,
    pub trace: Arc<dyn TraceWriter>,
}

impl Default for Observers {
    fn default() -> Self {
        Self {
            analytics: Arc::new(NoopAnalytics),
            errors: Arc::new(TracingErrorReporter),
            trace: Arc::new(TracingTraceWriter),
        }
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers").finish_non_exhaustive()
    }
}

impl Observers {
    pub fn with_analytics(mut self, analytics: Arc<dyn AnalyticRecorder>) -> Self {
        self.analytics = analytics;
        self
    }

    pub fn with_error_reporter(mut self, errors: Arc<dyn ErrorReporter>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_trace_writer(mut self, trace: Arc<dyn TraceWriter>) -> Self {
        self.trace = trace;
        self
    }
}

/// Mask the password component of a URL-style connection string.
pub fn mask_connection_string(connection_string: &str) -> String {
    match url::Url::parse(connection_string) {
        Ok(mut parsed) if parsed.password().is_some() => {
            if parsed.set_password(Some("****")).is_ok() {
                parsed.to_string()
            } else {
                connection_string.to_string()
            }
        }
        _ => connection_string.to_string(),
    }
}
