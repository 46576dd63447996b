use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub langbase: LangbaseConfig,
    pub database: DatabaseConfig,
    pub debugger: DebuggerConfig,
    pub evidence: EvidenceConfig,
    pub investigation: InvestigationConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub pipes: PipeConfig,
}

/// Langbase API configuration
#[derive(Debug, Clone)]
pub struct LangbaseConfig {
    pub api_key: String,
    pub base_url: String,
}

/// Evidence database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Session directory holding `evidence.db` and the `evidence/` blob folder.
    pub session_dir: PathBuf,
    pub max_connections: u32,
}

/// Native debugger process configuration
#[derive(Debug, Clone)]
pub struct DebuggerConfig {
    pub path: PathBuf,
    pub symbol_path: String,
    pub sos_path: Option<PathBuf>,
    pub dac_path: Option<PathBuf>,
    pub verify_command: String,
    /// Template for the sentinel command; `{marker}` is replaced per call.
    pub echo_template: String,
    pub command_timeout_secs: u64,
    pub init_timeout_secs: u64,
    pub quit_timeout_secs: u64,
    pub channel_capacity: usize,
}

/// Evidence sizing configuration
#[derive(Debug, Clone)]
pub struct EvidenceConfig {
    pub storage_threshold: usize,
    pub chunk_size: usize,
    pub max_summary_chars: usize,
}

/// Hypothesis loop budgets
#[derive(Debug, Clone)]
pub struct InvestigationConfig {
    pub max_hypothesis_attempts: u32,
    pub max_inconclusive_retries: u32,
    pub max_commands_per_test: usize,
    pub max_deep_dive_tasks: usize,
    pub max_evidence_chars_single: usize,
    pub max_evidence_chars_total: usize,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Langbase pipe name configuration, one pipe per oracle call family
#[derive(Debug, Clone)]
pub struct PipeConfig {
    pub hypothesis: String,
    pub evaluation: String,
    pub analysis: String,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let langbase = LangbaseConfig {
            api_key: env::var("LANGBASE_API_KEY").map_err(|_| AppError::Config {
                message: "LANGBASE_API_KEY is required".to_string(),
            })?,
            base_url: env::var("LANGBASE_BASE_URL")
                .unwrap_or_else(|_| "https://api.langbase.com".to_string()),
        };

        let database = DatabaseConfig {
            session_dir: env::var("SESSION_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    PathBuf::from(".sessions").join(uuid::Uuid::new_v4().simple().to_string())
                }),
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 5),
        };

        let defaults = DebuggerConfig::default();
        let debugger = DebuggerConfig {
            path: env::var("DEBUGGER_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.path),
            symbol_path: env::var("SYMBOL_PATH").unwrap_or(defaults.symbol_path),
            sos_path: env::var("SOS_PATH").ok().map(PathBuf::from),
            dac_path: env::var("DAC_PATH").ok().map(PathBuf::from),
            verify_command: env::var("DEBUGGER_VERIFY_COMMAND").unwrap_or(defaults.verify_command),
            echo_template: env::var("DEBUGGER_ECHO_TEMPLATE").unwrap_or(defaults.echo_template),
            command_timeout_secs: env_parse("COMMAND_TIMEOUT_SECS", defaults.command_timeout_secs),
            init_timeout_secs: env_parse("INIT_TIMEOUT_SECS", defaults.init_timeout_secs),
            quit_timeout_secs: env_parse("QUIT_TIMEOUT_SECS", defaults.quit_timeout_secs),
            channel_capacity: defaults.channel_capacity,
        };

        let evidence_defaults = EvidenceConfig::default();
        let evidence = EvidenceConfig {
            storage_threshold: env_parse(
                "EVIDENCE_STORAGE_THRESHOLD",
                evidence_defaults.storage_threshold,
            ),
            chunk_size: env_parse("EVIDENCE_CHUNK_SIZE", evidence_defaults.chunk_size),
            max_summary_chars: evidence_defaults.max_summary_chars,
        };

        let budget_defaults = InvestigationConfig::default();
        let investigation = InvestigationConfig {
            max_hypothesis_attempts: env_parse(
                "MAX_HYPOTHESIS_ATTEMPTS",
                budget_defaults.max_hypothesis_attempts,
            ),
            max_inconclusive_retries: env_parse(
                "MAX_INCONCLUSIVE_RETRIES",
                budget_defaults.max_inconclusive_retries,
            ),
            ..budget_defaults
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: env_parse("REQUEST_TIMEOUT_MS", 30000),
            max_retries: env_parse("MAX_RETRIES", 3),
            retry_delay_ms: env_parse("RETRY_DELAY_MS", 1000),
        };

        let pipes = PipeConfig {
            hypothesis: env::var("PIPE_HYPOTHESIS")
                .unwrap_or_else(|_| "dump-hypothesis-v1".to_string()),
            evaluation: env::var("PIPE_EVALUATION")
                .unwrap_or_else(|_| "dump-evaluation-v1".to_string()),
            analysis: env::var("PIPE_ANALYSIS").unwrap_or_else(|_| "dump-analysis-v1".to_string()),
        };

        Ok(Config {
            langbase,
            database,
            debugger,
            evidence,
            investigation,
            logging,
            request,
            pipes,
        })
    }
}

impl DebuggerConfig {
    /// Default per-command deadline.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn quit_timeout(&self) -> Duration {
        Duration::from_secs(self.quit_timeout_secs)
    }
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cdb"),
            symbol_path: r"SRV*c:\symbols*https://msdl.microsoft.com/download/symbols".to_string(),
            sos_path: None,
            dac_path: None,
            verify_command: "!eeversion".to_string(),
            echo_template: ".echo {marker}".to_string(),
            // Heap walks such as !gcroot -all can run for many minutes.
            command_timeout_secs: 1800,
            init_timeout_secs: 300,
            quit_timeout_secs: 5,
            channel_capacity: 4096,
        }
    }
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            storage_threshold: 250_000,
            chunk_size: 8000,
            max_summary_chars: 4000,
        }
    }
}

impl Default for InvestigationConfig {
    fn default() -> Self {
        Self {
            max_hypothesis_attempts: 8,
            max_inconclusive_retries: 2,
            max_commands_per_test: 3,
            max_deep_dive_tasks: 5,
            max_evidence_chars_single: 200_000,
            max_evidence_chars_total: 800_000,
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            hypothesis: "dump-hypothesis-v1".to_string(),
            evaluation: "dump-evaluation-v1".to_string(),
            analysis: "dump-analysis-v1".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debugger_defaults() {
        let config = DebuggerConfig::default();
        assert_eq!(config.echo_template, ".echo {marker}");
        assert_eq!(config.verify_command, "!eeversion");
        assert_eq!(config.command_timeout(), Duration::from_secs(1800));
        assert_eq!(config.quit_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_investigation_budget_defaults() {
        let config = InvestigationConfig::default();
        assert_eq!(config.max_inconclusive_retries, 2);
        assert_eq!(config.max_commands_per_test, 3);
        assert!(config.max_evidence_chars_single < config.max_evidence_chars_total);
    }
}
