//! # Dump Investigator
//!
//! Hypothesis-driven investigation of a process memory dump through a
//! long-lived native debugger session.
//!
//! ## Features
//!
//! - **Debugger session**: sentinel-framed command execution over the
//!   debugger's text streams, with error classification and thread tracking
//! - **Evidence cache**: content-addressable store keyed by command and, for
//!   thread-sensitive commands, the selected thread
//! - **Interpretation**: specialized parsers for well-known commands plus a
//!   chunk-and-summarize fallback through the oracle
//! - **Hypothesis engine**: form, test, evaluate and pivot under fixed budgets,
//!   then a bounded root-cause deep dive
//!
//! ## Architecture
//!
//! ```text
//! HypothesisEngine → EvidenceCache → DebuggerSession → cdb (stdin/stdout)
//!        ↓                 ↓
//!   Oracle (Langbase)  SQLite metadata + blob files
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::path::Path;
//! use std::sync::Arc;
//! use dump_investigator::{
//!     cache::EvidenceCache, config::Config, debugger::DebuggerSession,
//!     engine::HypothesisEngine, interpret::InterpreterRegistry,
//!     langbase::LangbaseClient, oracle::LangbaseOracle, storage::SqliteEvidenceStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = Arc::new(SqliteEvidenceStore::new(&config.database).await?);
//!     let client = LangbaseClient::new(&config.langbase, config.request.clone())?;
//!     let oracle = Arc::new(LangbaseOracle::new(client, config.pipes.clone()));
//!
//!     let mut session = DebuggerSession::spawn(config.debugger.clone(), Path::new("app.dmp"))?;
//!     session.initialize().await?;
//!
//!     let interpreters = InterpreterRegistry::with_builtins(oracle.clone(), config.evidence.chunk_size);
//!     let cache = Arc::new(EvidenceCache::new(session, store, interpreters, config.evidence.clone()));
//!     let outcome = HypothesisEngine::new(cache.clone(), oracle, config.investigation.clone(), "app hangs")
//!         .run()
//!         .await;
//!     cache.shutdown().await;
//!     println!("{}", serde_json::to_string_pretty(&outcome)?);
//!     Ok(())
//! }
//! ```

/// Cached command execution and evidence shaping.
pub mod cache;
/// Configuration management.
pub mod config;
/// Native debugger session and its text protocol.
pub mod debugger;
/// Hypothesis state machine.
pub mod engine;
/// Error types and result aliases for the application.
pub mod error;
/// Output interpreters.
pub mod interpret;
/// Langbase API client used as the oracle transport.
pub mod langbase;
/// Oracle contract and typed replies.
pub mod oracle;
/// System prompts for every oracle call.
pub mod prompts;
/// Evidence store: SQLite metadata plus blob files.
pub mod storage;

pub use cache::{CommandExecutor, Evidence, EvidenceCache, EvidenceType};
pub use config::Config;
pub use debugger::{DebuggerSession, ExecutionResult};
pub use engine::{HypothesisEngine, InvestigationOutcome};
pub use error::{AppError, AppResult};
