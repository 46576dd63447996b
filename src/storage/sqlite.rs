use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};
use uuid::Uuid;

use super::{cache_key, content_hash, CacheEntry, EvidenceStorage};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite metadata plus one blob file per evidence id.
#[derive(Clone)]
pub struct SqliteEvidenceStore {
    pool: SqlitePool,
    evidence_dir: PathBuf,
}

impl SqliteEvidenceStore {
    /// Open (or create) the evidence store inside the session directory.
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        let evidence_dir = config.session_dir.join("evidence");
        std::fs::create_dir_all(&evidence_dir).map_err(|e| StorageError::Connection {
            message: format!("Failed to create evidence directory: {}", e),
        })?;

        let db_path = config.session_dir.join("evidence.db");
        let database_url = format!("sqlite://{}?mode=rwc", db_path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let store = Self { pool, evidence_dir };
        store.run_migrations().await?;

        info!(path = %db_path.display(), "Evidence store opened");
        Ok(store)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Migration {
                message: format!("Failed to run migrations: {}", e),
            })
    }

    /// Directory holding the raw payload blobs.
    pub fn evidence_dir(&self) -> &Path {
        &self.evidence_dir
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn generate_id(command: &str) -> String {
        let sanitized: String = command
            .chars()
            .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' | '!' | '~'))
            .filter(|c| !c.is_control())
            .map(|c| if c.is_whitespace() { '_' } else { c })
            .take(20)
            .collect();
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S_%6f");
        let suffix = Uuid::new_v4().simple().to_string();
        format!("ev_{}_{}_{}", sanitized, timestamp, &suffix[..8])
    }
}

#[async_trait]
impl EvidenceStorage for SqliteEvidenceStore {
    async fn find(
        &self,
        command: &str,
        thread_context: Option<&str>,
    ) -> StorageResult<Option<String>> {
        let key = cache_key(command, thread_context);
        let id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM evidence
            WHERE cache_key = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(&key)
        .fetch_optional(&self.pool)
        .await?;

        debug!(cache_key = %key, hit = id.is_some(), "Evidence lookup");
        Ok(id)
    }

    async fn store_raw(
        &self,
        command: &str,
        output: &str,
        thread_context: Option<&str>,
    ) -> StorageResult<String> {
        let id = Self::generate_id(command);
        let key = cache_key(command, thread_context);
        let blob_path = self.evidence_dir.join(format!("{}.txt", id));

        tokio::fs::write(&blob_path, output.as_bytes()).await?;

        sqlx::query(
            r#"
            INSERT INTO evidence (id, cache_key, command, thread_context, content_hash, blob_path, size, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&key)
        .bind(command.trim())
        .bind(thread_context)
        .bind(content_hash(output))
        .bind(blob_path.to_string_lossy().to_string())
        .bind(output.len() as i64)
        .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool)
        .await?;

        info!(evidence_id = %id, cache_key = %key, size = output.len(), "Stored raw evidence");
        Ok(id)
    }

    async fn enrich(
        &self,
        id: &str,
        summary: &str,
        findings: &[String],
        embedding: Option<&[f32]>,
    ) -> StorageResult<()> {
        let findings = serde_json::to_string(findings).unwrap_or_else(|_| "[]".to_string());
        let embedding = embedding.and_then(|e| serde_json::to_string(e).ok());

        let result = sqlx::query(
            r#"
            UPDATE evidence
            SET summary = ?, key_findings = ?, embedding = COALESCE(?, embedding)
            WHERE id = ?
            "#,
        )
        .bind(summary)
        .bind(&findings)
        .bind(&embedding)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound { id: id.to_string() });
        }

        debug!(evidence_id = %id, "Attached analysis to evidence");
        Ok(())
    }

    async fn find_duplicate_by_content(
        &self,
        command: &str,
        output: &str,
        thread_context: Option<&str>,
    ) -> StorageResult<Option<String>> {
        let key = cache_key(command, thread_context);
        let candidates: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT id, blob_path FROM evidence
            WHERE cache_key = ? AND content_hash = ?
            ORDER BY created_at DESC, rowid DESC
            "#,
        )
        .bind(&key)
        .bind(content_hash(output))
        .fetch_all(&self.pool)
        .await?;

        // A row whose blob vanished cannot serve as the canonical copy.
        Ok(candidates
            .into_iter()
            .find(|(_, path)| Path::new(path).exists())
            .map(|(id, _)| id))
    }

    async fn retrieve(&self, id: &str) -> StorageResult<String> {
        let path: Option<String> = sqlx::query_scalar("SELECT blob_path FROM evidence WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let path = PathBuf::from(path.ok_or_else(|| StorageError::NotFound { id: id.to_string() })?);

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::BlobMissing {
                id: id.to_string(),
                path,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn metadata(&self, id: &str) -> StorageResult<CacheEntry> {
        let row: Option<EvidenceRow> = sqlx::query_as(
            r#"
            SELECT id, cache_key, command, thread_context, content_hash, blob_path, size,
                   summary, key_findings, embedding, created_at
            FROM evidence
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Into::into)
            .ok_or_else(|| StorageError::NotFound { id: id.to_string() })
    }

    async fn list(&self) -> StorageResult<Vec<CacheEntry>> {
        let rows: Vec<EvidenceRow> = sqlx::query_as(
            r#"
            SELECT id, cache_key, command, thread_context, content_hash, blob_path, size,
                   summary, key_findings, embedding, created_at
            FROM evidence
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// Internal row type for SQLx mapping
#[derive(sqlx::FromRow)]
struct EvidenceRow {
    id: String,
    cache_key: String,
    command: String,
    thread_context: Option<String>,
    content_hash: String,
    blob_path: String,
    size: i64,
    summary: Option<String>,
    key_findings: Option<String>,
    embedding: Option<String>,
    created_at: String,
}

impl From<EvidenceRow> for CacheEntry {
    fn from(row: EvidenceRow) -> Self {
        use chrono::DateTime;

        Self {
            id: row.id,
            cache_key: row.cache_key,
            command: row.command,
            thread_context: row.thread_context,
            content_hash: row.content_hash,
            blob_path: PathBuf::from(row.blob_path),
            size: row.size.max(0) as u64,
            summary: row.summary,
            findings: row
                .key_findings
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            embedding: row.embedding.and_then(|s| serde_json::from_str(&s).ok()),
            created_at: DateTime::parse_from_rfc3339(&row.created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_store() -> (TempDir, SqliteEvidenceStore) {
        let dir = TempDir::new().expect("temp dir");
        let config = DatabaseConfig {
            session_dir: dir.path().to_path_buf(),
            max_connections: 1,
        };
        let store = SqliteEvidenceStore::new(&config)
            .await
            .expect("Failed to create evidence store");
        (dir, store)
    }

    #[test]
    fn test_generate_id_sanitizes_command() {
        let id = SqliteEvidenceStore::generate_id("~~[3fc]s; !clrstack -a");
        assert!(id.starts_with("ev_"));
        assert!(!id.contains('!'));
        assert!(!id.contains('~'));
        assert!(!id.contains(' '));
    }

    #[tokio::test]
    async fn test_store_and_retrieve_round_trip() {
        let (_dir, store) = create_test_store().await;
        let output = "OSID  ThreadOBJ\n 3fc  000001\n";

        let id = store.store_raw("!threads", output, None).await.unwrap();
        assert_eq!(store.retrieve(&id).await.unwrap(), output);

        let entry = store.metadata(&id).await.unwrap();
        assert_eq!(entry.cache_key, "!threads");
        assert_eq!(entry.size, output.len() as u64);
        assert!(!entry.is_analyzed());
    }

    #[tokio::test]
    async fn test_find_returns_newest_entry() {
        let (_dir, store) = create_test_store().await;

        let first = store.store_raw("!syncblk", "one", None).await.unwrap();
        let second = store.store_raw("!syncblk", "two", None).await.unwrap();
        assert_ne!(first, second);

        let found = store.find("!syncblk", None).await.unwrap();
        assert_eq!(found, Some(second));
        assert_eq!(store.find("!threads", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_thread_context_separates_sensitive_keys() {
        let (_dir, store) = create_test_store().await;

        let t1 = store.store_raw("!clrstack", "stack of 1", Some("1")).await.unwrap();
        assert_eq!(store.find("!clrstack", Some("1")).await.unwrap(), Some(t1));
        assert_eq!(store.find("!clrstack", Some("2")).await.unwrap(), None);

        // Context is irrelevant for insensitive commands
        let heap = store.store_raw("!eeheap -gc", "heap", Some("1")).await.unwrap();
        assert_eq!(store.find("!eeheap -gc", Some("9")).await.unwrap(), Some(heap));
    }

    #[tokio::test]
    async fn test_enrich_keeps_blob_untouched() {
        let (_dir, store) = create_test_store().await;
        let id = store.store_raw("!dumpheap -stat", "raw heap", None).await.unwrap();

        let findings = vec!["System.String dominates".to_string()];
        store
            .enrich(&id, "Heap dominated by strings", &findings, Some(&[0.1, 0.2]))
            .await
            .unwrap();

        let entry = store.metadata(&id).await.unwrap();
        assert_eq!(entry.summary.as_deref(), Some("Heap dominated by strings"));
        assert_eq!(entry.findings, findings);
        assert_eq!(entry.embedding, Some(vec![0.1, 0.2]));
        assert_eq!(store.retrieve(&id).await.unwrap(), "raw heap");
    }

    #[tokio::test]
    async fn test_enrich_unknown_id() {
        let (_dir, store) = create_test_store().await;
        let result = store.enrich("ev_missing", "x", &[], None).await;
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_duplicate_by_content() {
        let (_dir, store) = create_test_store().await;
        let id = store.store_raw("!threadpool", "CPU 81%", None).await.unwrap();

        let dup = store
            .find_duplicate_by_content("!threadpool", "CPU 81%", None)
            .await
            .unwrap();
        assert_eq!(dup, Some(id));

        let different = store
            .find_duplicate_by_content("!threadpool", "CPU 12%", None)
            .await
            .unwrap();
        assert_eq!(different, None);
    }

    #[tokio::test]
    async fn test_missing_blob_is_reported() {
        let (_dir, store) = create_test_store().await;
        let id = store.store_raw("!finalizequeue", "queue", None).await.unwrap();
        let entry = store.metadata(&id).await.unwrap();
        std::fs::remove_file(&entry.blob_path).unwrap();

        let result = store.retrieve(&id).await;
        assert!(matches!(result, Err(StorageError::BlobMissing { .. })));

        let dup = store
            .find_duplicate_by_content("!finalizequeue", "queue", None)
            .await
            .unwrap();
        assert_eq!(dup, None);
    }

    #[tokio::test]
    async fn test_list_in_creation_order() {
        let (_dir, store) = create_test_store().await;
        store.store_raw("!threads", "a", None).await.unwrap();
        store.store_raw("!syncblk", "b", None).await.unwrap();

        let entries = store.list().await.unwrap();
        let commands: Vec<_> = entries.iter().map(|e| e.command.as_str()).collect();
        assert_eq!(commands, vec!["!threads", "!syncblk"]);
    }
}
