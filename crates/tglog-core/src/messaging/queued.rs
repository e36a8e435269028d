use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::trace;

use crate::{
    domain::{ChatId, MessageRef},
    messaging::{port::MessagingPort, types::MessagingCapabilities},
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct QueueConfig {
    /// Minimum spacing between *any* two sends (global flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between sends to the same chat.
    pub per_chat_min_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(34), // ~30/sec
            per_chat_min_interval: Duration::from_millis(1050), // ~0.95/sec
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// MessagingPort decorator that serializes sends and paces them.
///
/// Only one send is in flight at a time across all callers; each waits for its
/// global and per-chat slot first. Errors from the inner port pass through untouched,
/// retrying is the caller's business.
pub struct QueuedMessenger {
    inner: Arc<dyn MessagingPort>,
    cfg: QueueConfig,
    queue: Mutex<()>,
    global: Mutex<IntervalLimiter>,
    per_chat: Mutex<HashMap<i64, IntervalLimiter>>,
}

impl QueuedMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: QueueConfig) -> Self {
        Self {
            inner,
            cfg,
            queue: Mutex::new(()),
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_chat: Mutex::new(HashMap::new()),
        }
    }

    async fn throttle_chat(&self, chat_id: i64) {
        let global_wait = { self.global.lock().await.reserve() };
        let chat_wait = {
            let mut map = self.per_chat.lock().await;
            map.entry(chat_id)
                .or_insert_with(|| IntervalLimiter::new(self.cfg.per_chat_min_interval))
                .reserve()
        };

        let wait = global_wait.max(chat_wait);
        if wait > Duration::ZERO {
            trace!(chat_id, wait_ms = wait.as_millis() as u64, "pacing send");
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl MessagingPort for QueuedMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        self.inner.capabilities()
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let _turn = self.queue.lock().await;
        self.throttle_chat(chat_id.0).await;
        self.inner.send_html(chat_id, html).await
    }
}
