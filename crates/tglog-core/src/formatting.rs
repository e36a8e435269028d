//! Log record → Telegram HTML text.

use tracing::{debug, trace};

use crate::record::{ExceptionInfo, LogRecord};

/// Request meta attributes reported after the `USER:` line, in this order.
pub const META_ATTRS: [&str; 3] = ["REMOTE_ADDR", "HOSTNAME", "HTTP_REFERER"];

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Formats records for HTML parse mode: a header line, the error trace, then the
/// requesting user and selected request meta.
#[derive(Clone, Debug, Default)]
pub struct TelegramFormatter {
    /// Keep only the last `n` lines of the error trace. `None` renders everything.
    pub traceback_limit: Option<usize>,
}

impl TelegramFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_traceback_limit(mut self, limit: Option<usize>) -> Self {
        self.traceback_limit = limit;
        self
    }

    pub fn format(&self, record: &LogRecord) -> String {
        self.format_within(record, usize::MAX)
    }

    /// Like [`TelegramFormatter::format`], but at most `max` chars long.
    ///
    /// The level tag and the `USER:`/meta lines are kept whole; the header text
    /// and then the error trace give up room, each ending with `…` when cut.
    pub fn format_within(&self, record: &LogRecord, max: usize) -> String {
        let tag = format!("<b>{}</b> ", record.level);
        let tail = truncate_html(
            &self.request_lines(record),
            max.saturating_sub(tag.chars().count()),
        );
        let mut room = max.saturating_sub(tag.chars().count() + tail.chars().count());

        let head = truncate_html(
            &format!(
                "{} {}: {}",
                record.timestamp.to_rfc3339(),
                escape_html(&record.logger),
                escape_html(&record.message),
            ),
            room,
        );
        room -= head.chars().count();

        let mut s = tag;
        s.push_str(&head);
        if let Some(exc) = &record.exception {
            if room > 1 {
                s.push('\n');
                s.push_str(&truncate_html(
                    &escape_html(&self.format_exception(exc)),
                    room - 1,
                ));
            }
        }
        s.push_str(&tail);
        s
    }

    fn request_lines(&self, record: &LogRecord) -> String {
        let Some(request) = &record.request else {
            debug!(logger = %record.logger, "record has no request context; skipping USER line");
            return String::new();
        };

        let mut s = format!("\nUSER: {}", escape_html(&request.user));
        for attr in META_ATTRS {
            if let Some(value) = request.meta.get(attr) {
                s.push_str(&format!("\n{attr}: {}", escape_html(value)));
            }
        }
        s
    }

    /// Plain-text trace, honoring `traceback_limit`, without a trailing newline.
    pub fn format_exception(&self, exc: &ExceptionInfo) -> String {
        let lines = exc.render_lines();
        let keep = match self.traceback_limit {
            Some(n) => &lines[lines.len().saturating_sub(n)..],
            None => &lines[..],
        };
        let mut s = keep.join("\n");
        while s.ends_with('\n') {
            s.pop();
        }
        trace!(traceback = %s, "formatted exception");
        s
    }
}

/// Cut `html` to at most `max` chars, ending with `…`, without splitting an entity.
///
/// Only meant for escaped text; markup tags are never passed through here.
fn truncate_html(html: &str, max: usize) -> String {
    if html.chars().count() <= max {
        return html.to_string();
    }
    if max == 0 {
        return String::new();
    }
    let mut out: String = html.chars().take(max - 1).collect();
    if let Some(amp) = out.rfind('&') {
        if !out[amp..].contains(';') {
            out.truncate(amp);
        }
    }
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RequestContext;
    use tracing::Level;

    fn record(message: &str) -> LogRecord {
        LogRecord::new(Level::ERROR, "app::views", message)
    }

    #[test]
    fn escapes_html() {
        let s = r#"<a href="x&y">"#;
        assert_eq!(escape_html(s), "&lt;a href=&quot;x&amp;y&quot;&gt;");
    }

    #[test]
    fn appends_user_and_present_meta() {
        let rec = record("boom")
            .with_request(RequestContext::new("alice").with_meta("REMOTE_ADDR", "1.2.3.4"));
        let text = TelegramFormatter::new().format(&rec);
        assert!(text.starts_with("<b>ERROR</b> "));
        assert!(text.contains("app::views: boom"));
        assert!(text.ends_with("\nUSER: alice\nREMOTE_ADDR: 1.2.3.4"));
    }

    #[test]
    fn meta_order_is_fixed_and_unknown_keys_ignored() {
        let ctx = RequestContext::new("bob")
            .with_meta("HTTP_REFERER", "https://example.com/")
            .with_meta("HTTP_USER_AGENT", "curl")
            .with_meta("REMOTE_ADDR", "10.0.0.1")
            .with_meta("HOSTNAME", "web-1");
        let text = TelegramFormatter::new().format(&record("boom").with_request(ctx));
        let tail: Vec<&str> = text.lines().rev().take(4).collect();
        assert_eq!(
            tail,
            vec![
                "HTTP_REFERER: https://example.com/",
                "HOSTNAME: web-1",
                "REMOTE_ADDR: 10.0.0.1",
                "USER: bob",
            ]
        );
        assert!(!text.contains("HTTP_USER_AGENT"));
    }

    #[test]
    fn no_request_context_means_no_user_line() {
        let text = TelegramFormatter::new().format(&record("boom"));
        assert!(!text.contains("USER:"));
        assert_eq!(text.lines().count(), 1);
    }

    #[test]
    fn renders_full_trace_without_trailing_newline() {
        let exc = ExceptionInfo {
            summary: "db down".to_string(),
            causes: (0..40).map(|i| format!("layer {i}")).collect(),
            backtrace: Some("   0: main\n\n".to_string()),
        };
        let rec = record("query failed")
            .with_exception(exc)
            .with_request(RequestContext::new("alice"));
        let text = TelegramFormatter::new().format(&rec);
        assert!(text.contains("\nError: db down\n"));
        assert!(text.contains("    0: layer 0\n"));
        assert!(text.contains("    39: layer 39\n"));
        assert!(text.contains("   0: main\nUSER: alice"));
    }

    #[test]
    fn traceback_limit_keeps_last_lines() {
        let exc = ExceptionInfo {
            summary: "outer".to_string(),
            causes: vec!["a".to_string(), "b".to_string()],
            backtrace: None,
        };
        let f = TelegramFormatter::new().with_traceback_limit(Some(2));
        assert_eq!(f.format_exception(&exc), "    0: a\n    1: b");
    }

    #[test]
    fn escapes_dynamic_fields() {
        let rec = record("x < y").with_request(RequestContext::new("<script>"));
        let text = TelegramFormatter::new().format(&rec);
        assert!(text.contains("x &lt; y"));
        assert!(text.contains("USER: &lt;script&gt;"));
    }

    fn long_trace(frames: usize) -> ExceptionInfo {
        let backtrace = (0..frames)
            .map(|i| format!("  {i:>3}: app::handlers::frame_{i}\n             at src/handlers.rs:{i}"))
            .collect::<Vec<_>>()
            .join("\n");
        ExceptionInfo {
            summary: "db down".to_string(),
            causes: vec!["connection refused".to_string()],
            backtrace: Some(backtrace),
        }
    }

    #[test]
    fn cut_trace_keeps_user_and_meta_lines() {
        let rec = record("query failed")
            .with_exception(long_trace(200))
            .with_request(RequestContext::new("alice").with_meta("REMOTE_ADDR", "1.2.3.4"));

        let text = TelegramFormatter::new().format_within(&rec, 4096);

        assert!(text.chars().count() <= 4096);
        assert!(text.starts_with("<b>ERROR</b> "));
        assert!(text.contains("\nError: db down\n"));
        assert!(text.contains("…\nUSER: alice\nREMOTE_ADDR: 1.2.3.4"));
        assert!(text.ends_with("\nUSER: alice\nREMOTE_ADDR: 1.2.3.4"));
    }

    #[test]
    fn short_records_are_not_cut() {
        let rec = record("boom").with_request(RequestContext::new("alice"));
        let f = TelegramFormatter::new();
        assert_eq!(f.format_within(&rec, 4096), f.format(&rec));
    }

    #[test]
    fn level_tag_survives_a_tiny_budget() {
        let rec = record(&"x".repeat(500)).with_exception(long_trace(5));

        let text = TelegramFormatter::new().format_within(&rec, 20);

        assert!(text.starts_with("<b>ERROR</b> "));
        assert_eq!(text.chars().count(), 20);
        assert!(text.ends_with('…'));
        assert!(!text.contains("Error: db down"));
    }

    #[test]
    fn truncation_does_not_split_entities() {
        let html = "abc&amp;def";
        assert_eq!(truncate_html(html, 6), "abc…");
        assert_eq!(truncate_html(html, 100), html);
        assert_eq!(truncate_html(html, 0), "");
    }
}
