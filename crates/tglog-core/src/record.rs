//! Log records as seen by the dispatch path.

use std::{collections::BTreeMap, error::Error as StdError};

use chrono::{DateTime, Utc};
use tracing::Level;

/// A single loggable event, detached from whatever produced it.
#[derive(Clone, Debug)]
pub struct LogRecord {
    pub level: Level,
    /// Logger name; for tracing events this is the event target.
    pub logger: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub exception: Option<ExceptionInfo>,
    pub request: Option<RequestContext>,
}

impl LogRecord {
    pub fn new(level: Level, logger: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            logger: logger.into(),
            timestamp: Utc::now(),
            message: message.into(),
            exception: None,
            request: None,
        }
    }

    pub fn with_exception(mut self, exception: ExceptionInfo) -> Self {
        self.exception = Some(exception);
        self
    }

    pub fn with_request(mut self, request: RequestContext) -> Self {
        self.request = Some(request);
        self
    }
}

/// Request-scoped metadata attached to a record: who triggered it and from where.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub user: String,
    pub meta: BTreeMap<String, String>,
}

impl RequestContext {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            meta: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

/// Error details: the top-level message, its `source()` chain and, when one was
/// captured at the logging site, a backtrace.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExceptionInfo {
    pub summary: String,
    pub causes: Vec<String>,
    pub backtrace: Option<String>,
}

impl ExceptionInfo {
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            summary: err.to_string(),
            causes,
            backtrace: None,
        }
    }

    /// Full multi-line rendering, in the same layout `anyhow` uses for `{:?}`.
    pub fn render_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("Error: {}", self.summary)];
        if !self.causes.is_empty() {
            lines.push(String::new());
            lines.push("Caused by:".to_string());
            for (i, cause) in self.causes.iter().enumerate() {
                lines.push(format!("    {i}: {cause}"));
            }
        }
        if let Some(bt) = &self.backtrace {
            lines.push(String::new());
            lines.push("Stack backtrace:".to_string());
            lines.extend(bt.lines().map(str::to_string));
        }
        lines
    }
}
