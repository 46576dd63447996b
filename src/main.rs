use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dump_investigator::{
    cache::{CommandExecutor, EvidenceCache},
    config::{Config, LogFormat},
    debugger::{DebuggerSession, DumpKind},
    engine::HypothesisEngine,
    interpret::InterpreterRegistry,
    langbase::LangbaseClient,
    oracle::{LangbaseOracle, Oracle},
    prompts::{ANALYSIS_PIPE_PROMPT, EVALUATION_PIPE_PROMPT, HYPOTHESIS_PIPE_PROMPT},
    storage::{EvidenceStorage, SqliteEvidenceStore},
};

/// Investigate a memory dump by forming and testing hypotheses.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the dump file
    dump: PathBuf,

    /// Description of the observed problem
    #[arg(short, long)]
    issue: String,

    /// Directory for the evidence database and blobs (overrides SESSION_DIR)
    #[arg(long)]
    session_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(dir) = args.session_dir {
        config.database.session_dir = dir;
    }

    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        dump = %args.dump.display(),
        "Dump investigator starting..."
    );

    let store = match SqliteEvidenceStore::new(&config.database).await {
        Ok(s) => {
            info!(session_dir = %config.database.session_dir.display(), "Evidence store initialized");
            s
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize evidence store");
            return Err(e.into());
        }
    };
    let store: Arc<dyn EvidenceStorage> = Arc::new(store);

    let langbase = match LangbaseClient::new(&config.langbase, config.request.clone()) {
        Ok(c) => {
            info!(base_url = %config.langbase.base_url, "Langbase client initialized");
            c
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize Langbase client");
            return Err(e.into());
        }
    };

    info!("Ensuring oracle pipes exist...");
    let pipes = [
        (&config.pipes.hypothesis, "Hypothesis formation and planning", HYPOTHESIS_PIPE_PROMPT),
        (&config.pipes.evaluation, "Evidence evaluation", EVALUATION_PIPE_PROMPT),
        (&config.pipes.analysis, "Debugger output analysis", ANALYSIS_PIPE_PROMPT),
    ];
    for (name, description, prompt) in pipes {
        if let Err(e) = langbase.ensure_pipe(name, description, prompt).await {
            error!(pipe = %name, error = %e, "Failed to ensure pipe exists");
            return Err(e.into());
        }
    }
    let oracle: Arc<dyn Oracle> = Arc::new(LangbaseOracle::new(langbase, config.pipes.clone()));

    let mut session = DebuggerSession::spawn(config.debugger.clone(), &args.dump)?;
    if let Err(e) = session.initialize().await {
        error!(error = %e, "Debugger session failed to initialize");
        session.shutdown().await;
        return Err(e.into());
    }

    let validation = session.validate_dump().await;
    if !validation.valid {
        warn!(error = ?validation.error, "Dump validation did not succeed");
    }
    if session.dump_kind().await == DumpKind::Kernel {
        warn!("Kernel dump detected; managed runtime commands may not apply");
    }

    let interpreters = InterpreterRegistry::with_builtins(Arc::clone(&oracle), config.evidence.chunk_size);
    let cache = Arc::new(EvidenceCache::new(
        session,
        store,
        interpreters,
        config.evidence.clone(),
    ));
    let executor: Arc<dyn CommandExecutor> = cache.clone();

    let outcome = HypothesisEngine::new(executor, oracle, config.investigation.clone(), args.issue)
        .run()
        .await;

    cache.shutdown().await;
    info!(status = %outcome.status, tests = outcome.tests.len(), "Investigation complete");

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

/// Initialize tracing/logging on stderr; stdout carries only the outcome.
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
