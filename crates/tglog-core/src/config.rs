use std::{env, fs, path::Path, path::PathBuf, str::FromStr, time::Duration};

use tracing::Level;

use crate::{
    domain::{BotToken, ChatId},
    errors::Error,
    messaging::queued::QueueConfig,
    Result,
};

/// Typed configuration for the Telegram log forwarder.
#[derive(Clone, Debug)]
pub struct Config {
    pub bot_token: BotToken,
    /// Fixed destination; skips the chat lookup when set.
    pub chat_id: Option<ChatId>,
    /// Least severe level that gets forwarded.
    pub level: Level,
    /// Where bot registrations are persisted. `None` keeps them in memory.
    pub registry_path: Option<PathBuf>,
    pub queue: QueueConfig,
    pub max_message_len: usize,
    /// Keep only the last N lines of error traces.
    pub traceback_limit: Option<usize>,
    /// Always capture backtraces for logged errors, not only when `RUST_BACKTRACE` asks.
    pub backtrace: bool,
}

impl Config {
    /// Load from `TGLOG_*` environment variables, reading `.env` first if present.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        Self::from_lookup(|key| env_str(&format!("TGLOG_{}", key.to_ascii_uppercase())))
    }

    /// Build from handler-style options (`bot_token`, `bot_id`, `chat_id`, ...).
    ///
    /// `bot_token` and `bot_id` are aliases; `bot_token` wins when both are given.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let pairs: Vec<(&str, &str)> = pairs.into_iter().collect();
        Self::from_lookup(|key| {
            pairs
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.to_string())
        })
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bot_token = get("bot_token")
            .and_then(non_empty)
            .or_else(|| get("bot_id").and_then(non_empty))
            .map(BotToken::new)
            .ok_or_else(|| Error::Config("bot_token (or bot_id) is required".to_string()))?;

        let chat_id = parse_opt::<i64>(&get, "chat_id")?.map(ChatId);

        let level = match get("level").and_then(non_empty) {
            Some(raw) => Level::from_str(raw.trim())
                .map_err(|_| Error::Config(format!("invalid level: {raw}")))?,
            None => Level::ERROR,
        };

        let registry_path = get("registry_path").and_then(non_empty).map(PathBuf::from);

        let defaults = QueueConfig::default();
        let queue = QueueConfig {
            global_min_interval: parse_opt::<u64>(&get, "global_min_interval_ms")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.global_min_interval),
            per_chat_min_interval: parse_opt::<u64>(&get, "per_chat_min_interval_ms")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.per_chat_min_interval),
        };

        let max_message_len = parse_opt::<usize>(&get, "max_message_len")?.unwrap_or(4096);
        let traceback_limit = parse_opt::<usize>(&get, "traceback_limit")?;
        let backtrace = parse_opt::<bool>(&get, "backtrace")?.unwrap_or(false);

        Ok(Self {
            bot_token,
            chat_id,
            level,
            registry_path,
            queue,
            max_message_len,
            traceback_limit,
            backtrace,
        })
    }
}

fn parse_opt<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    let Some(raw) = get(key).and_then(non_empty) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| Error::Config(format!("invalid value for {key}: {raw}")))
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_token_wins_over_bot_id() {
        let cfg = Config::from_pairs([("bot_id", "1:id"), ("bot_token", "2:token")]).unwrap();
        assert_eq!(cfg.bot_token.as_str(), "2:token");
    }

    #[test]
    fn bot_id_is_an_alias() {
        let cfg = Config::from_pairs([("bot_id", "1:id")]).unwrap();
        assert_eq!(cfg.bot_token.as_str(), "1:id");
        assert_eq!(cfg.level, Level::ERROR);
        assert_eq!(cfg.chat_id, None);
        assert_eq!(cfg.max_message_len, 4096);
        assert!(!cfg.backtrace);
        assert_eq!(cfg.queue.per_chat_min_interval, Duration::from_millis(1050));
    }

    #[test]
    fn missing_token_is_config_error() {
        let err = Config::from_pairs([("bot_token", "  "), ("level", "warn")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn parses_optional_values() {
        let cfg = Config::from_pairs([
            ("bot_token", "2:token"),
            ("chat_id", "-1001234"),
            ("level", "warn"),
            ("registry_path", "/var/lib/tglog/registry.json"),
            ("per_chat_min_interval_ms", "2000"),
            ("traceback_limit", "20"),
            ("backtrace", "true"),
        ])
        .unwrap();
        assert_eq!(cfg.chat_id, Some(ChatId(-1001234)));
        assert_eq!(cfg.level, Level::WARN);
        assert_eq!(
            cfg.registry_path,
            Some(PathBuf::from("/var/lib/tglog/registry.json"))
        );
        assert_eq!(cfg.queue.per_chat_min_interval, Duration::from_secs(2));
        assert_eq!(cfg.traceback_limit, Some(20));
        assert!(cfg.backtrace);
    }

    #[test]
    fn rejects_garbage_numbers() {
        let err = Config::from_pairs([("bot_token", "2:token"), ("chat_id", "general")]).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("chat_id")));
    }

    #[test]
    fn dotenv_does_not_override_existing_env() {
        let dir = std::env::temp_dir().join(format!("tglog-env-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join(".env");
        std::fs::write(
            &file,
            "# comment\nTGLOG_TEST_DOTENV_A=\"from file\"\nTGLOG_TEST_DOTENV_B=file\n",
        )
        .unwrap();
        env::set_var("TGLOG_TEST_DOTENV_B", "from env");

        load_dotenv_if_present(&file);

        assert_eq!(env_str("TGLOG_TEST_DOTENV_A").as_deref(), Some("from file"));
        assert_eq!(env_str("TGLOG_TEST_DOTENV_B").as_deref(), Some("from env"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
