use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::{errors::Error, layer::TelegramLayer, Result};

/// Initialize logging/tracing for the process.
///
/// Console output is filtered by `RUST_LOG` (default: info). The Telegram layer,
/// when given, sees every event and applies its own level threshold.
pub fn init(service_name: &str, telegram: Option<TelegramLayer>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "info,tglog_core=info,tglog_telegram=info,{service_name}=info"
        ))
    });

    let console = fmt::layer()
        .with_target(false)
        .with_ansi(true)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(console)
        .with(telegram)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {e}")))
}
