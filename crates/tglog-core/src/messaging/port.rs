use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    messaging::types::MessagingCapabilities,
    Result,
};

/// Send-capable messenger.
///
/// Implementations map transport failures into [`crate::Error::RetryAfter`] and
/// [`crate::Error::TimedOut`] where they apply so callers can recover from them.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef>;
}
