use std::time::Duration;

/// Core error type.
///
/// Adapter crates map their transport errors into this type so the dispatcher
/// can tell the two recoverable kinds (`RetryAfter`, `TimedOut`) apart from
/// everything else.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The messaging service is throttling us and asked to wait.
    #[error("rate limited, retry after {0:?}")]
    RetryAfter(Duration),

    /// The messaging call did not complete in time.
    #[error("request timed out")]
    TimedOut,

    #[error("messaging api error: {0}")]
    Api(String),
}

pub type Result<T> = std::result::Result<T, Error>;
