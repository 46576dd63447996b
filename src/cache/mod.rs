//! Cached command execution against an immutable dump.
//!
//! [`EvidenceCache`] owns the debugger session and the evidence store. A
//! command whose (command, thread-context) key already has a stored payload
//! is answered from the store; anything else runs on the debugger, is stored,
//! and is interpreted when it is large or has a specialized interpreter.
//!
//! Large outputs are handed to the investigation as external evidence that
//! carries only a bounded summary. The full payload stays retrievable by id.

mod evidence;

pub use evidence::{Evidence, EvidenceType};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::EvidenceConfig;
use crate::debugger::{
    parse_thread_switch, split_thread_switch, Command, DebuggerSession, ExecutionResult,
    SessionState,
};
use crate::error::{CommandError, SessionInitResult, StorageError, StorageResult};
use crate::interpret::{Interpretation, InterpreterRegistry};
use crate::oracle::ConfidenceLevel;
use crate::storage::EvidenceStorage;

/// Appended to the storage key of a failed command's oversized output.
const FAILED_OUTPUT_SUFFIX: &str = " #failed";

/// Executes commands on behalf of the investigation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run (or reuse) `command` and shape the result as evidence.
    async fn gather(&self, command: &str) -> Evidence;

    /// Full stored payload behind external evidence.
    async fn full_output(&self, evidence_id: &str) -> Option<String>;
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Debugger session plus content-addressable evidence store.
pub struct EvidenceCache {
    session: Mutex<DebuggerSession>,
    store: Arc<dyn EvidenceStorage>,
    interpreters: InterpreterRegistry,
    config: EvidenceConfig,
}

impl EvidenceCache {
    /// Wrap `session`; every successful output it produces is stored in `store`.
    pub fn new(
        session: DebuggerSession,
        store: Arc<dyn EvidenceStorage>,
        interpreters: InterpreterRegistry,
        config: EvidenceConfig,
    ) -> Self {
        Self {
            session: Mutex::new(session.with_evidence_sink(Arc::clone(&store))),
            store,
            interpreters,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn EvidenceStorage> {
        &self.store
    }

    /// Thread currently selected in the debugger.
    pub async fn thread_context(&self) -> Option<String> {
        self.session.lock().await.thread_context().map(str::to_string)
    }

    /// Bring the wrapped session to `Ready` if it is not already.
    pub async fn initialize(&self) -> SessionInitResult<()> {
        let mut session = self.session.lock().await;
        if session.state() == SessionState::Ready {
            return Ok(());
        }
        session.initialize().await
    }

    /// Tear down the debugger session.
    pub async fn shutdown(&self) {
        self.session.lock().await.shutdown().await;
    }

    /// Full original payload for an evidence id.
    pub async fn retrieve(&self, id: &str) -> StorageResult<String> {
        self.store.retrieve(id).await
    }

    /// Execute `command`, answering from the store when possible.
    ///
    /// The session lock is held for the whole lookup-or-execute so the thread
    /// context used for the key is the one the command would run under.
    ///
    /// A bare thread switch is never looked up or stored: answering it from
    /// the store would leave the debugger on the previous thread.
    pub async fn execute(&self, command: &str) -> ExecutionResult {
        let command = command.trim();
        let mut session = self.session.lock().await;

        if parse_thread_switch(command).is_some() {
            debug!(command = %command, "Thread switch bypasses the evidence cache");
            return session.execute(command).await;
        }

        // A combined switch is looked up under the thread it selects.
        let (lookup, context) = match split_thread_switch(command) {
            Some(split) => (split.payload, Some(split.thread)),
            None => (
                command.to_string(),
                session.thread_context().map(str::to_string),
            ),
        };

        if let Some(hit) = self.lookup(command, &lookup, context.as_deref()).await {
            return hit;
        }

        let mut result = session.execute(command).await;
        drop(session);

        if result.success && result.evidence_id.is_none() && !result.output.trim().is_empty() {
            let ctx = result.command.thread_context.clone();
            match self.store.store_raw(&lookup, &result.output, ctx.as_deref()).await {
                Ok(id) => result.evidence_id = Some(id),
                Err(e) => warn!(command = %command, error = %e, "Failed to store evidence"),
            }
        }
        result
    }

    async fn lookup(
        &self,
        command: &str,
        lookup: &str,
        context: Option<&str>,
    ) -> Option<ExecutionResult> {
        let id = match self.store.find(lookup, context).await {
            Ok(Some(id)) => id,
            Ok(None) => return None,
            Err(e) => {
                warn!(command = %command, error = %e, "Evidence lookup failed");
                return None;
            }
        };

        match self.store.retrieve(&id).await {
            Ok(output) => {
                info!(command = %command, evidence_id = %id, "Evidence cache hit");
                Some(ExecutionResult::from_cache(
                    Command::new(command, context),
                    output,
                    id,
                ))
            }
            Err(StorageError::BlobMissing { id, path }) => {
                warn!(
                    command = %command,
                    evidence_id = %id,
                    path = %path.display(),
                    "Cached payload missing, re-executing"
                );
                None
            }
            Err(e) => {
                warn!(command = %command, error = %e, "Evidence retrieval failed");
                None
            }
        }
    }

    /// Stored analysis for `id`, if any has been attached.
    async fn stored_analysis(&self, id: &str) -> Option<Interpretation> {
        let entry = self.store.metadata(id).await.ok()?;
        if !entry.is_analyzed() {
            return None;
        }
        Some(Interpretation {
            summary: entry.summary.unwrap_or_default(),
            findings: entry.findings,
            structured_data: serde_json::Value::Null,
            success: true,
            interpreter: "stored".to_string(),
        })
    }

    async fn analyze(&self, command: &str, result: &ExecutionResult) -> Option<Interpretation> {
        let payload = split_thread_switch(command)
            .map(|s| s.payload)
            .unwrap_or_else(|| command.to_string());

        let large = result.output.len() > self.config.storage_threshold;
        if !large && !self.interpreters.has_specialized(&payload) {
            return None;
        }

        if let Some(id) = &result.evidence_id {
            if let Some(stored) = self.stored_analysis(id).await {
                debug!(command = %command, evidence_id = %id, "Reusing stored analysis");
                return Some(stored);
            }
        }

        let interpretation = self.interpreters.interpret(&payload, &result.output).await;
        if interpretation.success {
            if let Some(id) = &result.evidence_id {
                if let Err(e) = self
                    .store
                    .enrich(id, &interpretation.summary, &interpretation.findings, None)
                    .await
                {
                    warn!(evidence_id = %id, error = %e, "Failed to attach analysis");
                }
            }
        }
        Some(interpretation)
    }

    fn shape(
        &self,
        result: ExecutionResult,
        interpretation: Option<Interpretation>,
    ) -> Evidence {
        let size = result.output.len();
        let (summary, findings, confidence) = match interpretation {
            Some(i) if i.success => {
                let confidence = if i.interpreter == "generic" {
                    ConfidenceLevel::Medium
                } else {
                    ConfidenceLevel::High
                };
                (Some(i.summary), i.findings, confidence)
            }
            Some(i) => (Some(i.summary).filter(|s| !s.is_empty()), Vec::new(), ConfidenceLevel::Low),
            None => (None, Vec::new(), ConfidenceLevel::Medium),
        };

        let (output, evidence_type) = if size > self.config.storage_threshold {
            let bounded = match &summary {
                Some(s) if !s.is_empty() => {
                    truncate_chars(s, self.config.max_summary_chars).to_string()
                }
                _ => format!(
                    "[Large output ({} bytes) stored externally as {}; summary unavailable]",
                    size,
                    result.evidence_id.as_deref().unwrap_or("<unstored>")
                ),
            };
            (bounded, EvidenceType::External)
        } else {
            (result.output, EvidenceType::Inline)
        };

        Evidence {
            command: result.command.text,
            output,
            evidence_type,
            evidence_id: result.evidence_id,
            summary,
            findings,
            confidence,
            significance: String::new(),
            failed: false,
            error: None,
            cached: result.cached,
            thread_context: result.command.thread_context,
        }
    }

    /// Failed evidence. Output above the storage threshold is stored and
    /// replaced by the bounded error line.
    async fn shape_failure(&self, command: &str, result: ExecutionResult) -> Evidence {
        let error = result.error.clone().unwrap_or(CommandError::ToolError {
            line: "unknown failure".to_string(),
        });
        let ctx = result.command.thread_context.clone();
        let size = result.output.len();

        if size <= self.config.storage_threshold {
            let mut evidence = Evidence::failed(command, result.output, &error);
            evidence.thread_context = ctx;
            return evidence;
        }

        // Keyed apart from the command so a later lookup never serves a failure.
        let payload = split_thread_switch(command)
            .map(|s| s.payload)
            .unwrap_or_else(|| command.to_string());
        let key = format!("{}{}", payload, FAILED_OUTPUT_SUFFIX);
        let evidence_id = match self.store.store_raw(&key, &result.output, ctx.as_deref()).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(command = %command, error = %e, "Failed to store failed output");
                None
            }
        };

        let line = match &error {
            CommandError::ToolError { line } => line.clone(),
            other => other.to_string(),
        };
        let excerpt = format!(
            "{}\n[Failed output ({} bytes) stored externally as {}]",
            truncate_chars(&line, self.config.max_summary_chars),
            size,
            evidence_id.as_deref().unwrap_or("<unstored>")
        );

        let mut evidence = Evidence::failed(command, excerpt, &error);
        evidence.evidence_type = EvidenceType::External;
        evidence.evidence_id = evidence_id;
        evidence.thread_context = ctx;
        evidence
    }
}

#[async_trait]
impl CommandExecutor for EvidenceCache {
    async fn gather(&self, command: &str) -> Evidence {
        let result = self.execute(command).await;

        if !result.success {
            return self.shape_failure(command, result).await;
        }

        let interpretation = self.analyze(command, &result).await;
        self.shape(result, interpretation)
    }

    async fn full_output(&self, evidence_id: &str) -> Option<String> {
        match self.store.retrieve(evidence_id).await {
            Ok(output) => Some(output),
            Err(e) => {
                warn!(evidence_id = %evidence_id, error = %e, "Stored payload unavailable");
                None
            }
        }
    }
}
