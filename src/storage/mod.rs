//! Evidence store for raw debugger output.
//!
//! Raw payloads are written once to blob files under the session directory
//! and never rewritten. A SQLite row per payload carries the cache key,
//! content hash, size and the analysis fields, which are the only values
//! ever updated in place.
//!
//! There is no eviction: the dump under investigation is immutable, so an
//! entry stays valid for the whole session.

mod key;
mod sqlite;

pub use key::{cache_key, is_thread_sensitive, THREAD_SENSITIVE_PREFIXES};
pub use sqlite::SqliteEvidenceStore;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StorageResult;

/// Metadata row for one stored payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Unique evidence identifier, derived from the command and creation time.
    pub id: String,
    /// `command` or `command@thread_<ctx>`.
    pub cache_key: String,
    /// Command text as executed.
    pub command: String,
    /// Thread context active at execution time.
    pub thread_context: Option<String>,
    /// SHA-256 of the raw payload, lowercase hex.
    pub content_hash: String,
    /// Blob file holding the raw payload.
    pub blob_path: PathBuf,
    /// Payload size in bytes.
    pub size: u64,
    /// Interpretation summary, once attached.
    pub summary: Option<String>,
    /// Interpretation findings, once attached.
    pub findings: Vec<String>,
    /// Embedding vector, once attached.
    pub embedding: Option<Vec<f32>>,
    /// When the payload was stored.
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Whether analysis has been attached to this entry.
    pub fn is_analyzed(&self) -> bool {
        self.summary.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Hash used for content de-duplication.
pub fn content_hash(output: &str) -> String {
    format!("{:x}", Sha256::digest(output.as_bytes()))
}

/// Content-addressable evidence storage.
#[async_trait]
pub trait EvidenceStorage: Send + Sync {
    /// Newest entry for `command` under the given thread context.
    async fn find(&self, command: &str, thread_context: Option<&str>)
        -> StorageResult<Option<String>>;

    /// Persist a raw payload. Analysis fields start empty.
    async fn store_raw(
        &self,
        command: &str,
        output: &str,
        thread_context: Option<&str>,
    ) -> StorageResult<String>;

    /// Attach analysis to an existing entry without touching its blob.
    async fn enrich(
        &self,
        id: &str,
        summary: &str,
        findings: &[String],
        embedding: Option<&[f32]>,
    ) -> StorageResult<()>;

    /// Existing entry with the same key and byte-identical content.
    async fn find_duplicate_by_content(
        &self,
        command: &str,
        output: &str,
        thread_context: Option<&str>,
    ) -> StorageResult<Option<String>>;

    /// Full original payload for an id.
    async fn retrieve(&self, id: &str) -> StorageResult<String>;

    /// Metadata for an id without loading the payload.
    async fn metadata(&self, id: &str) -> StorageResult<CacheEntry>;

    /// All entries in creation order.
    async fn list(&self) -> StorageResult<Vec<CacheEntry>>;
}
