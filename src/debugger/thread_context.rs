//! Tracking of the debugger's currently selected thread.
//!
//! Only explicit switch commands (`~3s`, `~~[3fc]s`) change the selection.
//! Per-thread execution forms such as `~3e !clrstack` or `~*e kb` run on a
//! thread without selecting it and therefore leave the context untouched.

use serde::{Deserialize, Serialize};

/// A combined "switch thread, then run payload" command, e.g. `~5s; !clrstack`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSwitch {
    /// The bare switch command (`~5s`).
    pub switch_command: String,
    /// Thread identifier the switch selects.
    pub thread: String,
    /// Command to run once the thread is selected.
    pub payload: String,
}

/// Parse a bare thread-switch command, returning the selected thread id.
///
/// Debugger thread numbers are kept as-is (`~12s` → `12`); OS thread ids are
/// normalised to lowercase hex without a `0x` prefix and bracketed
/// (`~~[0x3FC]s` → `[3fc]`) so the two id spaces can never collide.
pub fn parse_thread_switch(command: &str) -> Option<String> {
    let body = command.trim().strip_prefix('~')?;
    let body = body
        .strip_suffix('s')
        .or_else(|| body.strip_suffix('S'))?
        .trim();

    if let Some(osid) = body.strip_prefix("~[").and_then(|b| b.strip_suffix(']')) {
        let osid = osid.trim();
        let osid = osid
            .strip_prefix("0x")
            .or_else(|| osid.strip_prefix("0X"))
            .unwrap_or(osid)
            .to_ascii_lowercase();
        if !osid.is_empty() && osid.chars().all(|c| c.is_ascii_hexdigit()) {
            return Some(format!("[{}]", osid));
        }
        return None;
    }

    if !body.is_empty() && body.chars().all(|c| c.is_ascii_digit()) {
        Some(body.to_string())
    } else {
        None
    }
}

/// Split a combined switch-and-run command. Returns `None` for anything that
/// is not exactly `<switch>; <payload>` with a non-empty payload.
pub fn split_thread_switch(command: &str) -> Option<ThreadSwitch> {
    let (head, payload) = command.split_once(';')?;
    let thread = parse_thread_switch(head)?;
    let payload = payload.trim();
    if payload.is_empty() {
        return None;
    }
    Some(ThreadSwitch {
        switch_command: head.trim().to_string(),
        thread,
        payload: payload.to_string(),
    })
}

/// Records which thread is currently selected inside the debugger.
///
/// Pure state: the session feeds it successful switch commands and the
/// evidence cache reads it when building keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadContextTracker {
    current: Option<String>,
}

impl ThreadContextTracker {
    /// Create a tracker with no selection recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently selected thread, if a switch has been observed.
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Update the selection if `command` is a successful bare switch.
    ///
    /// Returns `true` when the context changed.
    pub fn observe(&mut self, command: &str) -> bool {
        match parse_thread_switch(command) {
            Some(thread) if self.current.as_deref() != Some(thread.as_str()) => {
                self.current = Some(thread);
                true
            }
            _ => false,
        }
    }

    /// Force the selection, e.g. after a combined command was split.
    pub fn set(&mut self, thread: impl Into<String>) {
        self.current = Some(thread.into());
    }

    /// Forget the selection.
    pub fn reset(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_debugger_thread_switch() {
        assert_eq!(parse_thread_switch("~12s"), Some("12".to_string()));
        assert_eq!(parse_thread_switch("  ~0s "), Some("0".to_string()));
    }

    #[test]
    fn test_parse_osid_switch_normalises() {
        assert_eq!(parse_thread_switch("~~[3FC]s"), Some("[3fc]".to_string()));
        assert_eq!(parse_thread_switch("~~[0x3fc]s"), Some("[3fc]".to_string()));
    }

    #[test]
    fn test_non_switch_commands() {
        assert_eq!(parse_thread_switch("~3e !clrstack"), None);
        assert_eq!(parse_thread_switch("~*e kb"), None);
        assert_eq!(parse_thread_switch("~s"), None);
        assert_eq!(parse_thread_switch("!threads"), None);
        assert_eq!(parse_thread_switch("~~[xyz]s"), None);
    }

    #[test]
    fn test_split_combined_command() {
        let split = split_thread_switch("~5s; !clrstack -a").unwrap();
        assert_eq!(split.switch_command, "~5s");
        assert_eq!(split.thread, "5");
        assert_eq!(split.payload, "!clrstack -a");

        assert!(split_thread_switch("~5s;").is_none());
        assert!(split_thread_switch("!threads; !syncblk").is_none());
    }

    #[test]
    fn test_tracker_observes_switches_only() {
        let mut tracker = ThreadContextTracker::new();
        assert_eq!(tracker.current(), None);

        assert!(!tracker.observe("!threads"));
        assert!(tracker.observe("~4s"));
        assert_eq!(tracker.current(), Some("4"));

        // Same selection is not a change
        assert!(!tracker.observe("~4s"));
        assert!(!tracker.observe("~4e !clrstack"));
        assert_eq!(tracker.current(), Some("4"));

        tracker.reset();
        assert_eq!(tracker.current(), None);
    }
}
