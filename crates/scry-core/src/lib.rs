pub mod config;
pub mod events;
pub mod logging;
pub mod session_log;
pub mod spawn;

pub use events::{now_ms, EventPayload, EventType, HookEvent, MAIN_AGENT_ID, MAIN_AGENT_LABEL};

/// Replace anything outside `[A-Za-z0-9_-]` with `_` so an id is safe as a file name.
pub fn sanitize_session_id(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(input: &str, max: usize) -> String {
    match input.char_indices().nth(max) {
        Some((idx, _)) => input[..idx].to_string(),
        None => input.to_string(),
    }
}
