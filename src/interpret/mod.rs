//! Turning raw debugger output into summaries and findings.
//!
//! A registry holds specialized interpreters for well-known commands and
//! picks the most specific one able to handle a command. Anything else, and
//! any specialized interpreter that fails, goes to the generic chunked
//! interpreter, which segments the output and asks the oracle about each
//! segment.
//!
//! The registry is constructed explicitly and passed to the evidence cache;
//! there is no global registration.

mod builtin;
mod generic;

pub use builtin::{SyncBlockInterpreter, ThreadPoolInterpreter, ThreadsInterpreter};
pub use generic::{chunk_lines, ChunkInterpreter};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::oracle::Oracle;

/// Interpretation of one command's output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Interpretation {
    pub summary: String,
    pub findings: Vec<String>,
    pub structured_data: serde_json::Value,
    pub success: bool,
    /// Name of the interpreter that produced this.
    pub interpreter: String,
}

impl Interpretation {
    pub fn failed(interpreter: &str, reason: impl Into<String>) -> Self {
        Self {
            summary: String::new(),
            findings: Vec::new(),
            structured_data: serde_json::json!({ "error": reason.into() }),
            success: false,
            interpreter: interpreter.to_string(),
        }
    }
}

/// An analyzer for one family of commands.
#[async_trait]
pub trait Interpreter: Send + Sync {
    fn name(&self) -> &'static str;

    /// How specifically this interpreter matches `command`; higher wins.
    /// `None` when it cannot handle the command at all.
    fn specificity(&self, command: &str) -> Option<u8>;

    async fn interpret(&self, command: &str, output: &str) -> Interpretation;
}

/// The command proper, without a per-thread execution prefix (`~5e`, `~*e`,
/// `~~[3fc]e`).
pub fn payload_command(command: &str) -> &str {
    let command = command.trim();
    match command.split_once(char::is_whitespace) {
        Some((head, rest)) if head.starts_with('~') && head.ends_with('e') => rest.trim(),
        _ => command,
    }
}

/// Lowercased first token of the payload command.
pub fn command_head(command: &str) -> String {
    payload_command(command)
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Specialized interpreters plus the generic fallback.
pub struct InterpreterRegistry {
    interpreters: Vec<Arc<dyn Interpreter>>,
    fallback: ChunkInterpreter,
}

impl InterpreterRegistry {
    /// Registry with only the generic fallback.
    pub fn new(oracle: Arc<dyn Oracle>, chunk_size: usize) -> Self {
        Self {
            interpreters: Vec::new(),
            fallback: ChunkInterpreter::new(oracle, chunk_size),
        }
    }

    /// Registry with the built-in parsers for `!threads`, `!syncblk` and
    /// `!threadpool`.
    pub fn with_builtins(oracle: Arc<dyn Oracle>, chunk_size: usize) -> Self {
        Self::new(oracle, chunk_size)
            .register(Arc::new(ThreadsInterpreter))
            .register(Arc::new(SyncBlockInterpreter))
            .register(Arc::new(ThreadPoolInterpreter))
    }

    pub fn register(mut self, interpreter: Arc<dyn Interpreter>) -> Self {
        self.interpreters.push(interpreter);
        self
    }

    /// Most specific interpreter able to handle `command`.
    pub fn select(&self, command: &str) -> Option<&Arc<dyn Interpreter>> {
        self.interpreters
            .iter()
            .filter_map(|i| i.specificity(command).map(|score| (score, i)))
            .max_by_key(|(score, _)| *score)
            .map(|(_, i)| i)
    }

    pub fn has_specialized(&self, command: &str) -> bool {
        self.select(command).is_some()
    }

    /// Interpret with the best specialized interpreter, falling back to the
    /// generic chunked strategy.
    pub async fn interpret(&self, command: &str, output: &str) -> Interpretation {
        if let Some(interpreter) = self.select(command) {
            let result = interpreter.interpret(command, output).await;
            if result.success {
                debug!(command = %command, interpreter = interpreter.name(), "Specialized interpretation");
                return result;
            }
            warn!(
                command = %command,
                interpreter = interpreter.name(),
                "Specialized interpreter failed, using generic analysis"
            );
        }
        self.fallback.interpret(command, output).await
    }
}
