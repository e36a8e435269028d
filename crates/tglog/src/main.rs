use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use tglog_core::{
    config::Config,
    dispatch::Dispatcher,
    formatting::TelegramFormatter,
    layer::TelegramLayer,
    messaging::queued::QueuedMessenger,
    registration::{
        ChatLookup, JsonFileRegistrationStore, MemoryRegistrationStore, RegistrationStore,
        StaticChatLookup,
    },
};
use tglog_telegram::{TelegramChatLookup, TelegramMessenger};

/// Sends one test error through the full path: tracing event → layer → Telegram.
///
/// Usage: `tglog [message...]`
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load()?;

    let (layer, worker) = TelegramLayer::new(cfg.level);
    tglog_core::logging::init("tglog", Some(layer.with_backtraces(cfg.backtrace)))?;

    let lookup: Arc<dyn ChatLookup> = match cfg.chat_id {
        Some(id) => Arc::new(StaticChatLookup(id)),
        None => Arc::new(TelegramChatLookup),
    };
    let store: Arc<dyn RegistrationStore> = match &cfg.registry_path {
        Some(path) => Arc::new(JsonFileRegistrationStore::open(path.clone(), lookup).await?),
        None => Arc::new(MemoryRegistrationStore::new(lookup)),
    };
    let messenger = Arc::new(QueuedMessenger::new(
        Arc::new(TelegramMessenger::from_token(&cfg.bot_token)),
        cfg.queue,
    ));
    let dispatcher = Arc::new(
        Dispatcher::new(cfg.bot_token.clone(), store, messenger)
            .with_formatter(TelegramFormatter::new().with_traceback_limit(cfg.traceback_limit))
            .with_max_message_len(cfg.max_message_len),
    );

    let shutdown = CancellationToken::new();
    let delivery = tokio::spawn(worker.run(dispatcher, shutdown.clone()));

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let message = if args.is_empty() {
        "tglog test notification".to_string()
    } else {
        args.join(" ")
    };

    info!(bot_id = cfg.bot_token.bot_id(), "sending test error");
    emit_test_error(&message);

    shutdown.cancel();
    delivery.await?;
    Ok(())
}

fn emit_test_error(message: &str) {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    let span = tracing::info_span!("request", user = %user, hostname = tracing::field::Empty);
    if let Ok(host) = std::env::var("HOSTNAME") {
        span.record("hostname", host.as_str());
    }
    let _g = span.enter();

    let err = anyhow::anyhow!("synthetic failure").context("tglog self-test");
    let err: &(dyn std::error::Error + 'static) = err.as_ref();
    tracing::error!(error = err, "{message}");
}
