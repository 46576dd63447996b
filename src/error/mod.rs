use std::path::PathBuf;

use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Session initialization failed: {0}")]
    SessionInit(#[from] SessionInitError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Fatal errors raised while bringing a debugger session up.
///
/// Any of these moves the session to `FAILED`; it must not be used afterwards.
#[derive(Debug, Error)]
pub enum SessionInitError {
    #[error("Failed to spawn debugger {path}: {message}")]
    Spawn { path: String, message: String },

    #[error("Debugger did not become ready within {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Incompatible runtime support while running '{command}': {line}")]
    IncompatibleRuntime { command: String, line: String },

    #[error("Verification command '{command}' failed: {message}")]
    VerificationFailed { command: String, message: String },

    #[error("Debugger process exited during initialization")]
    ProcessExited,

    #[error("Session is {state}, expected {expected}")]
    InvalidState { state: String, expected: String },

    #[error("Dump file not found: {path}")]
    DumpNotFound { path: PathBuf },
}

/// Per-command failures. Always returned as data inside an execution result,
/// never propagated past the session boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Command timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Debugger reported an error: {line}")]
    ToolError { line: String },

    #[error("Invalid command syntax: {reason}")]
    InvalidSyntax { reason: String },

    #[error("Debugger process exited")]
    ProcessExited,

    #[error("Session unavailable: {state}")]
    SessionUnavailable { state: String },

    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("Could not resolve placeholders: {placeholders}")]
    UnresolvedPlaceholders { placeholders: String },
}

/// Evidence store errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Evidence not found: {id}")]
    NotFound { id: String },

    /// Metadata exists but the raw payload is gone. The caller must re-execute.
    #[error("Evidence blob missing for {id} at {path}")]
    BlobMissing { id: String, path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Langbase API errors
#[derive(Debug, Error)]
pub enum LangbaseError {
    #[error("Langbase unavailable: {message} (retries: {retries})")]
    Unavailable { message: String, retries: u32 },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Oracle transport errors
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Oracle transport failed: {0}")]
    Transport(#[from] LangbaseError),

    #[error("Oracle returned an unsuccessful completion for {call}")]
    Unsuccessful { call: String },

    #[error("Oracle unavailable: {message}")]
    Unavailable { message: String },
}

/// Failure to pull a JSON object out of free-text oracle output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleParseError {
    #[error("Empty oracle response")]
    Empty,

    #[error("No JSON object found. Response started with: '{preview}'")]
    NoJson { preview: String },

    #[error("JSON did not match the expected shape: {message}")]
    Shape { message: String },
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for session initialization
pub type SessionInitResult<T> = Result<T, SessionInitError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for Langbase operations
pub type LangbaseResult<T> = Result<T, LangbaseError>;

/// Result type alias for oracle calls
pub type OracleResult<T> = Result<T, OracleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config {
            message: "missing key".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: missing key");

        let err = AppError::Internal {
            message: "unexpected".to_string(),
        };
        assert_eq!(err.to_string(), "Internal error: unexpected");
    }

    #[test]
    fn test_session_init_error_display() {
        let err = SessionInitError::IncompatibleRuntime {
            command: ".loadby sos clr".to_string(),
            line: "CLRDLL: Unable to find mscordacwks".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Incompatible runtime support while running '.loadby sos clr': CLRDLL: Unable to find mscordacwks"
        );

        let err = SessionInitError::Timeout { timeout_secs: 30 };
        assert_eq!(err.to_string(), "Debugger did not become ready within 30s");
    }

    #[test]
    fn test_command_error_display() {
        let err = CommandError::Timeout { timeout_ms: 1500 };
        assert_eq!(err.to_string(), "Command timed out after 1500ms");

        let err = CommandError::ToolError {
            line: "Syntax error at '!bogus'".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Debugger reported an error: Syntax error at '!bogus'"
        );
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::NotFound {
            id: "ev_threads_1".to_string(),
        };
        assert_eq!(err.to_string(), "Evidence not found: ev_threads_1");

        let err = StorageError::BlobMissing {
            id: "ev_threads_1".to_string(),
            path: PathBuf::from("/tmp/ev_threads_1.txt"),
        };
        assert_eq!(
            err.to_string(),
            "Evidence blob missing for ev_threads_1 at /tmp/ev_threads_1.txt"
        );
    }

    #[test]
    fn test_langbase_error_display() {
        let err = LangbaseError::Unavailable {
            message: "server down".to_string(),
            retries: 3,
        };
        assert_eq!(err.to_string(), "Langbase unavailable: server down (retries: 3)");

        let err = LangbaseError::Timeout { timeout_ms: 5000 };
        assert_eq!(err.to_string(), "Request timeout after 5000ms");
    }

    #[test]
    fn test_oracle_parse_error_display() {
        let err = OracleParseError::NoJson {
            preview: "I think".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "No JSON object found. Response started with: 'I think'"
        );
    }

    #[test]
    fn test_error_conversions_to_app_error() {
        let app_err: AppError = SessionInitError::ProcessExited.into();
        assert!(matches!(app_err, AppError::SessionInit(_)));

        let app_err: AppError = StorageError::NotFound { id: "x".into() }.into();
        assert!(matches!(app_err, AppError::Storage(_)));

        let oracle_err: OracleError = LangbaseError::Timeout { timeout_ms: 1 }.into();
        let app_err: AppError = oracle_err.into();
        assert!(matches!(app_err, AppError::Oracle(_)));
    }
}
