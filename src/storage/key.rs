/// Command prefixes whose output depends on the selected thread.
///
/// Matched against the first whitespace-separated token, case-insensitively.
pub const THREAD_SENSITIVE_PREFIXES: &[&str] = &[
    "!clrstack",
    "!dumpstack",
    "!dso",
    "!dumpstackobjects",
    "!pe",
    "!printexception",
    "!mk",
    "k",
    "kb",
    "kc",
    "kd",
    "kn",
    "kp",
    "kv",
    "r",
    "dv",
    ".frame",
];

/// Whether `command` belongs to the thread-sensitive set.
pub fn is_thread_sensitive(command: &str) -> bool {
    command
        .split_whitespace()
        .next()
        .map(|head| {
            let head = head.to_ascii_lowercase();
            THREAD_SENSITIVE_PREFIXES.contains(&head.as_str())
        })
        .unwrap_or(false)
}

/// Build the cache key: `<command>` or `<command>@thread_<context>`.
///
/// The thread suffix is added only for thread-sensitive commands and only
/// when a context is known.
pub fn cache_key(command: &str, thread_context: Option<&str>) -> String {
    let command = command.trim();
    match thread_context {
        Some(ctx) if is_thread_sensitive(command) => format!("{}@thread_{}", command, ctx),
        _ => command.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_sensitive_prefixes() {
        assert!(is_thread_sensitive("!clrstack -a"));
        assert!(is_thread_sensitive("KB 20"));
        assert!(is_thread_sensitive("r"));
        assert!(!is_thread_sensitive("!threads"));
        assert!(!is_thread_sensitive("!runaway"));
        assert!(!is_thread_sensitive("~*e !clrstack"));
        assert!(!is_thread_sensitive(""));
    }

    #[test]
    fn test_cache_key_grammar() {
        assert_eq!(cache_key("!clrstack", Some("5")), "!clrstack@thread_5");
        assert_eq!(cache_key("  kb ", Some("[3fc]")), "kb@thread_[3fc]");
        assert_eq!(cache_key("!threads", Some("5")), "!threads");
        assert_eq!(cache_key("!clrstack", None), "!clrstack");
    }
}
