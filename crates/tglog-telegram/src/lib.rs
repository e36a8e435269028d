//! Telegram adapter (teloxide).
//!
//! Implements the `tglog-core` [`MessagingPort`] and [`ChatLookup`] over the
//! Telegram Bot API. No retrying happens here; failures are mapped to core
//! error kinds and the dispatcher decides.

use async_trait::async_trait;

use teloxide::{prelude::*, types::ParseMode, RequestError};
use tracing::debug;

use tglog_core::{
    domain::{BotToken, ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::{port::MessagingPort, types::MessagingCapabilities},
    registration::ChatLookup,
    Result,
};

/// Telegram's hard limit for message text.
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn from_token(token: &BotToken) -> Self {
        Self::new(Bot::new(token.as_str()))
    }
}

fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
    teloxide::types::ChatId(chat_id.0)
}

/// Map a Bot API failure to a core error, keeping the two recoverable kinds distinct.
pub fn map_err(e: RequestError) -> Error {
    match e {
        RequestError::RetryAfter(wait) => Error::RetryAfter(wait),
        RequestError::Network(ref net) if net.is_timeout() => Error::TimedOut,
        RequestError::Io(ref io) if io.kind() == std::io::ErrorKind::TimedOut => Error::TimedOut,
        other => Error::Api(format!("telegram error: {other}")),
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            max_message_len: TELEGRAM_MESSAGE_LIMIT,
        }
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let msg = self
            .bot
            .send_message(tg_chat(chat_id), html.to_string())
            .parse_mode(ParseMode::Html)
            .await
            .map_err(map_err)?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }
}

/// Finds the chat to report to from the bot's pending updates: the chat that
/// most recently wrote to the bot (e.g. someone sent `/start` to it).
pub struct TelegramChatLookup;

#[async_trait]
impl ChatLookup for TelegramChatLookup {
    async fn lookup_chat_id(&self, token: &BotToken) -> Result<Option<ChatId>> {
        let bot = Bot::new(token.as_str());
        let updates = bot.get_updates().await.map_err(map_err)?;
        let found = updates
            .iter()
            .rev()
            .find_map(|u| u.chat().map(|c| ChatId(c.id.0)));
        debug!(
            bot_id = token.bot_id(),
            updates = updates.len(),
            found = found.is_some(),
            "looked up chat id from updates"
        );
        Ok(found)
    }
}
