//! `tracing` integration: turns error events into [`LogRecord`]s and delivers
//! them off the logging thread.
//!
//! Request context is picked up from fields named `user`, `remote_addr`,
//! `hostname` and `http_referer`, on the event itself or on any enclosing span:
//!
//! ```ignore
//! let span = tracing::info_span!("request", user = %user, remote_addr = %peer);
//! let _g = span.enter();
//! tracing::error!(error = &err as &dyn std::error::Error, "handler failed");
//! ```

use std::{
    backtrace::{Backtrace, BacktraceStatus},
    collections::BTreeMap,
    error::Error as StdError,
    fmt,
    sync::Arc,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    field::{Field, Visit},
    span::{Attributes, Id, Record},
    warn, Event, Level, Subscriber,
};
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};

use crate::{
    dispatch::{Delivery, Dispatcher},
    formatting::META_ATTRS,
    record::{ExceptionInfo, LogRecord, RequestContext},
};

/// Events from these crates are never forwarded, so our own diagnostics can't loop.
const OWN_TARGETS: [&str; 2] = ["tglog_core", "tglog_telegram"];

tokio::task_local! {
    /// Set while the worker is delivering; anything logged then (transport noise included) is ignored.
    static DELIVERING: ();
}

fn is_own_target(target: &str) -> bool {
    OWN_TARGETS.iter().any(|own| {
        target
            .strip_prefix(own)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
    })
}

const USER_FIELD: &str = "user";

#[derive(Clone, Debug, Default)]
struct RequestFields {
    user: Option<String>,
    meta: BTreeMap<String, String>,
}

impl RequestFields {
    fn is_empty(&self) -> bool {
        self.user.is_none() && self.meta.is_empty()
    }

    /// Try to take `field` as a request field. Returns false if it isn't one.
    fn take(&mut self, field: &Field, value: String) -> bool {
        let name = field.name();
        if name.eq_ignore_ascii_case(USER_FIELD) {
            self.user = Some(value);
            return true;
        }
        match META_ATTRS.iter().find(|a| a.eq_ignore_ascii_case(name)) {
            Some(attr) => {
                self.meta.insert(attr.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Fill whatever is still missing from `outer`.
    fn fill_from(&mut self, outer: &RequestFields) {
        if self.user.is_none() {
            self.user = outer.user.clone();
        }
        for (k, v) in &outer.meta {
            self.meta.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    fn into_context(self) -> Option<RequestContext> {
        let user = self.user?;
        Some(RequestContext {
            user,
            meta: self.meta,
        })
    }
}

impl Visit for RequestFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.take(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.take(field, format!("{value:?}"));
    }
}

#[derive(Default)]
struct EventFields {
    message: String,
    extra: Vec<String>,
    exception: Option<ExceptionInfo>,
    request: RequestFields,
}

impl EventFields {
    fn put(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else if !self.request.take(field, value.clone()) {
            self.extra.push(format!("{}={value}", field.name()));
        }
    }

    fn message(&self) -> String {
        if self.extra.is_empty() {
            return self.message.clone();
        }
        format!("{} {}", self.message, self.extra.join(" "))
            .trim_start()
            .to_string()
    }
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn StdError + 'static)) {
        if self.exception.is_none() {
            self.exception = Some(ExceptionInfo::from_error(value));
        } else {
            self.put(field, value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, format!("{value:?}"));
    }
}

/// Layer that forwards events at or above `min_level` to a [`DeliveryWorker`].
///
/// Events carrying an error get a backtrace of the logging call site when
/// `RUST_BACKTRACE`/`RUST_LIB_BACKTRACE` enable one, or always after
/// [`TelegramLayer::with_backtraces`].
pub struct TelegramLayer {
    min_level: Level,
    force_backtraces: bool,
    tx: mpsc::UnboundedSender<LogRecord>,
}

impl TelegramLayer {
    pub fn new(min_level: Level) -> (Self, DeliveryWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let layer = Self {
            min_level,
            force_backtraces: false,
            tx,
        };
        (layer, DeliveryWorker { rx })
    }

    /// Capture backtraces regardless of the environment.
    pub fn with_backtraces(mut self, force: bool) -> Self {
        self.force_backtraces = force;
        self
    }

    fn capture_backtrace(&self) -> Option<String> {
        let bt = if self.force_backtraces {
            Backtrace::force_capture()
        } else {
            Backtrace::capture()
        };
        match bt.status() {
            BacktraceStatus::Captured => Some(bt.to_string()),
            _ => None,
        }
    }

    fn wants(&self, level: &Level, target: &str) -> bool {
        *level <= self.min_level && !is_own_target(target) && DELIVERING.try_with(|_| ()).is_err()
    }
}

impl<S> Layer<S> for TelegramLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut fields = RequestFields::default();
        attrs.record(&mut fields);
        if fields.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(fields);
        }
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut ext = span.extensions_mut();
        match ext.get_mut::<RequestFields>() {
            Some(fields) => values.record(fields),
            None => {
                let mut fields = RequestFields::default();
                values.record(&mut fields);
                if !fields.is_empty() {
                    ext.insert(fields);
                }
            }
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        if !self.wants(meta.level(), meta.target()) {
            return;
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(outer) = span.extensions().get::<RequestFields>() {
                    fields.request.fill_from(outer);
                }
            }
        }

        let mut record = LogRecord::new(*meta.level(), meta.target(), fields.message());
        record.exception = fields.exception.take().map(|mut exc| {
            // Captured here, on the thread that logged.
            exc.backtrace = self.capture_backtrace();
            exc
        });
        record.request = fields.request.into_context();

        // The worker is gone once shutdown completed; late events are dropped.
        let _ = self.tx.send(record);
    }
}

/// Receives records from a [`TelegramLayer`] and hands them to a [`Dispatcher`].
pub struct DeliveryWorker {
    rx: mpsc::UnboundedReceiver<LogRecord>,
}

impl DeliveryWorker {
    /// Deliver records one at a time until every layer is dropped or `shutdown`
    /// fires. On shutdown, records already queued are still delivered.
    pub async fn run(mut self, dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                next = self.rx.recv() => match next {
                    Some(record) => DELIVERING.scope((), deliver_one(&dispatcher, &record)).await,
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    self.rx.close();
                    while let Some(record) = self.rx.recv().await {
                        DELIVERING.scope((), deliver_one(&dispatcher, &record)).await;
                    }
                    break;
                }
            }
        }
        debug!("delivery worker stopped");
    }
}

async fn deliver_one(dispatcher: &Dispatcher, record: &LogRecord) {
    match dispatcher.deliver(record).await {
        Ok(Delivery::Sent { attempts, .. }) => {
            debug!(attempts, logger = %record.logger, "log record delivered")
        }
        Ok(Delivery::Skipped) => {}
        Err(e) => warn!(error = %e, logger = %record.logger, "failed to deliver log record"),
    }
}
