use serde::{Deserialize, Serialize};

use crate::error::CommandError;

/// Commands whose output is raw process memory or object field values.
const MEMORY_CONTENT_PREFIXES: &[&str] = &[
    "!do", "!dumpobj", "!dumparray", "!dso", "!dumpstackobjects", "db", "dc", "dd", "dq", "du",
    "da", "dps", "dx",
];

/// Exposure classification handed to the redaction collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandRisk {
    /// Structural output: thread lists, stacks, heap statistics.
    #[default]
    Metadata,
    /// Output may contain user data (strings, buffers, object fields).
    MemoryContents,
}

impl CommandRisk {
    /// Classify a command by its leading token.
    pub fn classify(command: &str) -> Self {
        let head = command
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        if MEMORY_CONTENT_PREFIXES.contains(&head.as_str()) {
            CommandRisk::MemoryContents
        } else {
            CommandRisk::Metadata
        }
    }
}

impl std::fmt::Display for CommandRisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandRisk::Metadata => write!(f, "metadata"),
            CommandRisk::MemoryContents => write!(f, "memory_contents"),
        }
    }
}

/// A debugger command as issued, with the thread context it ran under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub text: String,
    pub risk: CommandRisk,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_context: Option<String>,
}

impl Command {
    pub fn new(text: impl Into<String>, thread_context: Option<&str>) -> Self {
        let text = text.into();
        Self {
            risk: CommandRisk::classify(&text),
            text,
            thread_context: thread_context.map(str::to_string),
        }
    }
}

/// Outcome of one `execute` call. Failures are data, never panics or errors.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub command: Command,
    pub output: String,
    pub success: bool,
    pub error: Option<CommandError>,
    /// Served from the evidence cache instead of the debugger.
    pub cached: bool,
    /// Evidence id the raw output was stored under, if it was stored.
    pub evidence_id: Option<String>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Successful execution.
    pub fn completed(command: Command, output: String, duration_ms: u64) -> Self {
        Self {
            command,
            output,
            success: true,
            error: None,
            cached: false,
            evidence_id: None,
            duration_ms,
        }
    }

    /// Failed execution, keeping whatever output was captured.
    pub fn failed(command: Command, output: String, error: CommandError, duration_ms: u64) -> Self {
        Self {
            command,
            output,
            success: false,
            error: Some(error),
            cached: false,
            evidence_id: None,
            duration_ms,
        }
    }

    /// Result served from the cache.
    pub fn from_cache(command: Command, output: String, evidence_id: String) -> Self {
        Self {
            command,
            output,
            success: true,
            error: None,
            cached: true,
            evidence_id: Some(evidence_id),
            duration_ms: 0,
        }
    }

    /// Human-readable failure text, falling back to the head of the output.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| match e {
            CommandError::ToolError { line } => line.clone(),
            other => other.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_classification() {
        assert_eq!(CommandRisk::classify("!do 0x1234"), CommandRisk::MemoryContents);
        assert_eq!(CommandRisk::classify("du 00000123`45678900"), CommandRisk::MemoryContents);
        assert_eq!(CommandRisk::classify("DX @$curprocess"), CommandRisk::MemoryContents);
        assert_eq!(CommandRisk::classify("!threads"), CommandRisk::Metadata);
        assert_eq!(CommandRisk::classify("!dumpheap -stat"), CommandRisk::Metadata);
        assert_eq!(CommandRisk::classify(""), CommandRisk::Metadata);
    }

    #[test]
    fn test_command_new_captures_context() {
        let cmd = Command::new("!clrstack", Some("7"));
        assert_eq!(cmd.thread_context.as_deref(), Some("7"));
        assert_eq!(cmd.risk, CommandRisk::Metadata);
    }

    #[test]
    fn test_failed_result_message() {
        let result = ExecutionResult::failed(
            Command::new("!bogus", None),
            "No export bogus found".to_string(),
            CommandError::ToolError {
                line: "No export bogus found".to_string(),
            },
            3,
        );
        assert!(!result.success);
        assert_eq!(result.error_message().as_deref(), Some("No export bogus found"));
    }
}
