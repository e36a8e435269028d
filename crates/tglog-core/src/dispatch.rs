//! Delivery of formatted log records to the resolved chat.

use std::{sync::Arc, time::Duration};

use tokio::{sync::OnceCell, time::sleep};
use tracing::{debug, info, warn};

use crate::{
    domain::{BotToken, ChatId, MessageRef},
    formatting::TelegramFormatter,
    messaging::port::MessagingPort,
    record::LogRecord,
    registration::{BotRegistration, RegistrationStore},
    Error, Result,
};

/// Fixed wait before retrying a timed out send.
pub const TIMEOUT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Smallest accepted message cap; leaves room for the level tag and a `USER:` line.
pub const MIN_MESSAGE_LEN: usize = 64;

/// Transient failures the dispatcher recovers from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransientKind {
    RateLimited,
    TimedOut,
}

/// One row of the recovery table: which error it matches and how long to wait.
#[derive(Clone, Copy)]
pub struct RetryRule {
    pub kind: TransientKind,
    pub max_retries: u8,
    wait: fn(&Error) -> Option<Duration>,
}

impl RetryRule {
    pub fn wait_for(&self, err: &Error) -> Option<Duration> {
        (self.wait)(err)
    }
}

fn rate_limit_wait(err: &Error) -> Option<Duration> {
    match err {
        Error::RetryAfter(d) => Some(*d),
        _ => None,
    }
}

fn timeout_wait(err: &Error) -> Option<Duration> {
    match err {
        Error::TimedOut => Some(TIMEOUT_RETRY_DELAY),
        _ => None,
    }
}

/// Per-kind recovery table. Anything not listed is propagated without retrying.
pub const RETRY_RULES: [RetryRule; 2] = [
    RetryRule {
        kind: TransientKind::RateLimited,
        max_retries: 1,
        wait: rate_limit_wait,
    },
    RetryRule {
        kind: TransientKind::TimedOut,
        max_retries: 1,
        wait: timeout_wait,
    },
];

fn matching_rule(err: &Error) -> Option<(RetryRule, Duration)> {
    RETRY_RULES
        .iter()
        .find_map(|rule| rule.wait_for(err).map(|wait| (*rule, wait)))
}

/// What happened to a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent { message: MessageRef, attempts: u8 },
    /// No chat id could be resolved; nothing was sent.
    Skipped,
}

pub struct Dispatcher {
    token: BotToken,
    store: Arc<dyn RegistrationStore>,
    messenger: Arc<dyn MessagingPort>,
    formatter: TelegramFormatter,
    max_message_len: usize,
    registration: OnceCell<Arc<BotRegistration>>,
}

impl Dispatcher {
    pub fn new(
        token: BotToken,
        store: Arc<dyn RegistrationStore>,
        messenger: Arc<dyn MessagingPort>,
    ) -> Self {
        let max_message_len = messenger.capabilities().max_message_len;
        Self {
            token,
            store,
            messenger,
            formatter: TelegramFormatter::new(),
            max_message_len,
            registration: OnceCell::new(),
        }
    }

    pub fn with_formatter(mut self, formatter: TelegramFormatter) -> Self {
        self.formatter = formatter;
        self
    }

    /// Caps outgoing text; never above what the messenger itself accepts nor
    /// below [`MIN_MESSAGE_LEN`].
    pub fn with_max_message_len(mut self, max: usize) -> Self {
        self.max_message_len = max
            .max(MIN_MESSAGE_LEN)
            .min(self.messenger.capabilities().max_message_len);
        self
    }

    /// Format `record` and send it to the registration's chat.
    ///
    /// Rate limits and timeouts are retried once; everything else, including a
    /// failed retry, is returned as an error.
    pub async fn deliver(&self, record: &LogRecord) -> Result<Delivery> {
        let registration = self.registration().await?;

        let text = self.formatter.format_within(record, self.max_message_len);

        let Some(chat_id) = self.ensure_chat_id(&registration).await? else {
            warn!(
                bot_id = self.token.bot_id(),
                "no chat id resolved for bot; dropping log message"
            );
            return Ok(Delivery::Skipped);
        };

        self.send_with_retry(chat_id, &text).await
    }

    async fn registration(&self) -> Result<Arc<BotRegistration>> {
        let reg = self
            .registration
            .get_or_try_init(|| async {
                let (reg, created) = self.store.get_or_create(&self.token).await?;
                if created {
                    info!(bot_id = self.token.bot_id(), "created bot registration");
                    self.store.resolve_chat_id(&reg).await?;
                }
                Ok::<_, Error>(reg)
            })
            .await?;
        Ok(reg.clone())
    }

    async fn ensure_chat_id(&self, registration: &BotRegistration) -> Result<Option<ChatId>> {
        match registration.chat_id() {
            Some(id) => Ok(Some(id)),
            None => self.store.resolve_chat_id(registration).await,
        }
    }

    async fn send_with_retry(&self, chat_id: ChatId, text: &str) -> Result<Delivery> {
        let err = match self.messenger.send_html(chat_id, text).await {
            Ok(message) => return Ok(Delivery::Sent { message, attempts: 1 }),
            Err(e) => e,
        };

        let Some((rule, wait)) = matching_rule(&err) else {
            return Err(err);
        };

        let mut attempts = 1u8;
        let mut last = err;
        while attempts <= rule.max_retries {
            debug!(kind = ?rule.kind, wait_ms = wait.as_millis() as u64, error = %last, "retrying send");
            sleep(wait).await;
            attempts += 1;
            match self.messenger.send_html(chat_id, text).await {
                Ok(message) => return Ok(Delivery::Sent { message, attempts }),
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}
