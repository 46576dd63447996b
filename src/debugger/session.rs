use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use super::command::{Command, ExecutionResult};
use super::protocol::{
    check_syntax, classify_output, find_fatal_init_line, FrameCollector, FrameStatus, Sentinel,
};
use super::thread_context::{parse_thread_switch, split_thread_switch, ThreadContextTracker};
use crate::config::DebuggerConfig;
use crate::error::{CommandError, SessionInitError, SessionInitResult};
use crate::storage::EvidenceStorage;

/// Lifecycle of a debugger session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Executing,
    /// Terminal: initialization failed or the process died.
    Failed,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Executing => "executing",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Whether the dump was captured from a user-mode process or the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    User,
    Kernel,
}

/// Answer of the `.lastevent` validation check.
#[derive(Debug, Clone)]
pub struct DumpValidation {
    pub valid: bool,
    pub info: Option<String>,
    pub error: Option<String>,
}

type DebuggerInput = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// A long-lived debugger process driven over its text streams.
///
/// Commands are serialized by `&mut self`. Each command is framed by a
/// unique sentinel echoed by the debugger, so output that arrives late for a
/// command we stopped waiting on is recognised and dropped instead of being
/// attributed to the next command.
pub struct DebuggerSession {
    config: DebuggerConfig,
    state: SessionState,
    child: Option<Child>,
    input: DebuggerInput,
    lines: mpsc::Receiver<String>,
    readers: Vec<JoinHandle<()>>,
    stale: VecDeque<String>,
    threads: ThreadContextTracker,
    evidence_sink: Option<Arc<dyn EvidenceStorage>>,
}

impl DebuggerSession {
    /// Launch the debugger against `dump_path`.
    ///
    /// The session starts `Uninitialized`; call [`initialize`](Self::initialize)
    /// before executing commands.
    pub fn spawn(config: DebuggerConfig, dump_path: &Path) -> SessionInitResult<Self> {
        if !dump_path.exists() {
            return Err(SessionInitError::DumpNotFound {
                path: dump_path.to_path_buf(),
            });
        }

        let mut child = ProcessCommand::new(&config.path)
            .arg("-z")
            .arg(dump_path)
            .arg("-y")
            .arg(&config.symbol_path)
            .arg("-lines")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionInitError::Spawn {
                path: config.path.display().to_string(),
                message: e.to_string(),
            })?;

        let stdin = child.stdin.take().ok_or(SessionInitError::ProcessExited)?;
        let stdout = child.stdout.take().ok_or(SessionInitError::ProcessExited)?;
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let mut readers = vec![spawn_line_reader(stdout, tx.clone())];
        if let Some(stderr) = stderr {
            readers.push(spawn_line_reader(stderr, tx));
        }

        info!(
            debugger = %config.path.display(),
            dump = %dump_path.display(),
            pid = ?child.id(),
            "Debugger process started"
        );

        Ok(Self::with_parts(config, Some(child), Box::new(stdin), rx, readers))
    }

    /// Drive a debugger that is already connected through the given streams.
    pub fn from_streams<W, R>(config: DebuggerConfig, input: W, output: R) -> Self
    where
        W: AsyncWrite + Send + Sync + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let reader = spawn_line_reader(output, tx);
        Self::with_parts(config, None, Box::new(input), rx, vec![reader])
    }

    fn with_parts(
        config: DebuggerConfig,
        child: Option<Child>,
        input: DebuggerInput,
        lines: mpsc::Receiver<String>,
        readers: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            config,
            state: SessionState::Uninitialized,
            child,
            input,
            lines,
            readers,
            stale: VecDeque::new(),
            threads: ThreadContextTracker::new(),
            evidence_sink: None,
        }
    }

    /// Offer every successful, non-empty output to `sink`.
    pub fn with_evidence_sink(mut self, sink: Arc<dyn EvidenceStorage>) -> Self {
        self.evidence_sink = Some(sink);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Currently selected thread, if a switch has been observed.
    pub fn thread_context(&self) -> Option<&str> {
        self.threads.current()
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.config
    }

    /// Bring the session to `Ready`.
    ///
    /// Waits for the debugger to answer a first sentinel, loads the managed
    /// runtime support and verifies it with the verification command. Any failure
    /// leaves the session `Failed` for good.
    pub async fn initialize(&mut self) -> SessionInitResult<()> {
        if self.state != SessionState::Uninitialized {
            return Err(SessionInitError::InvalidState {
                state: self.state.to_string(),
                expected: SessionState::Uninitialized.to_string(),
            });
        }
        self.state = SessionState::Initializing;
        info!("Initializing debugger session");

        match self.run_initialization().await {
            Ok(()) => {
                self.state = SessionState::Ready;
                info!("Debugger session ready");
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Failed;
                error!(error = %e, "Debugger session initialization failed");
                Err(e)
            }
        }
    }

    async fn run_initialization(&mut self) -> SessionInitResult<()> {
        let init_timeout = self.config.init_timeout();
        let timeout_secs = self.config.init_timeout_secs;
        let init_error = |e: CommandError| match e {
            CommandError::Timeout { .. } => SessionInitError::Timeout { timeout_secs },
            _ => SessionInitError::ProcessExited,
        };

        // Initial sync: swallows the banner and dump loading chatter.
        let banner = self.exchange(None, init_timeout).await.map_err(init_error)?;
        debug!(lines = banner.lines().count(), "Debugger banner consumed");

        for command in self.runtime_support_commands() {
            let output = self
                .exchange(Some(&command), init_timeout)
                .await
                .map_err(init_error)?;

            if let Some(line) = find_fatal_init_line(&output).or_else(|| classify_output(&output))
            {
                return Err(SessionInitError::IncompatibleRuntime { command, line });
            }
            debug!(command = %command, "Runtime support command completed");
        }

        let verify = self.config.verify_command.clone();
        let output = self
            .exchange(Some(&verify), init_timeout)
            .await
            .map_err(init_error)?;
        if let Some(line) = find_fatal_init_line(&output) {
            return Err(SessionInitError::IncompatibleRuntime {
                command: verify,
                line,
            });
        }
        if let Some(line) = classify_output(&output) {
            return Err(SessionInitError::VerificationFailed {
                command: verify,
                message: line,
            });
        }
        if output.trim().is_empty() {
            return Err(SessionInitError::VerificationFailed {
                command: verify,
                message: "verification command produced no output".to_string(),
            });
        }

        Ok(())
    }

    fn runtime_support_commands(&self) -> Vec<String> {
        let cordll = match &self.config.dac_path {
            Some(dac) => {
                let dir = dac.parent().unwrap_or(dac.as_path());
                format!(".cordll -lp {}", dir.display())
            }
            None => ".cordll -ve -u -l".to_string(),
        };
        let sos = match &self.config.sos_path {
            Some(sos) => format!(".load {}", sos.display()),
            None => ".loadby sos clr".to_string(),
        };
        vec![cordll, sos]
    }

    /// Execute one command with the configured default timeout.
    pub async fn execute(&mut self, command: &str) -> ExecutionResult {
        let timeout = self.config.command_timeout();
        self.execute_with_timeout(command, timeout).await
    }

    /// Execute one command. Failures are returned inside the result.
    ///
    /// A combined `~Ns; payload` command runs as two protocol exchanges: the
    /// switch, then the payload under the new thread context.
    pub async fn execute_with_timeout(&mut self, command: &str, timeout: Duration) -> ExecutionResult {
        let command = command.trim();

        if self.state != SessionState::Ready {
            return ExecutionResult::failed(
                Command::new(command, self.threads.current()),
                String::new(),
                CommandError::SessionUnavailable {
                    state: self.state.to_string(),
                },
                0,
            );
        }

        if let Err(e) = check_syntax(command) {
            warn!(command = %command, error = %e, "Refusing to send command");
            return ExecutionResult::failed(
                Command::new(command, self.threads.current()),
                String::new(),
                e,
                0,
            );
        }

        let Some(split) = split_thread_switch(command) else {
            return self.run_single(command, timeout).await;
        };

        let switched = self.run_single(&split.switch_command, timeout).await;
        if !switched.success {
            let mut failed = switched;
            failed.command = Command::new(command, self.threads.current());
            return failed;
        }
        self.threads.set(split.thread.clone());

        let mut result = self.run_single(&split.payload, timeout).await;
        result.command = Command::new(command, self.threads.current());
        result.duration_ms += switched.duration_ms;
        result
    }

    async fn run_single(&mut self, text: &str, timeout: Duration) -> ExecutionResult {
        self.state = SessionState::Executing;
        let started = Instant::now();
        let exchanged = self.exchange(Some(text), timeout).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut result = match exchanged {
            Ok(output) => {
                self.state = SessionState::Ready;
                if parse_thread_switch(text).is_some() && classify_output(&output).is_none() {
                    self.threads.observe(text);
                }
                let command = Command::new(text, self.threads.current());
                match classify_output(&output) {
                    Some(line) => {
                        ExecutionResult::failed(command, output, CommandError::ToolError { line }, duration_ms)
                    }
                    None => ExecutionResult::completed(command, output, duration_ms),
                }
            }
            Err(e) => {
                self.state = match e {
                    CommandError::ProcessExited => SessionState::Failed,
                    _ => SessionState::Ready,
                };
                warn!(command = %text, error = %e, duration_ms, "Command failed");
                ExecutionResult::failed(
                    Command::new(text, self.threads.current()),
                    String::new(),
                    e,
                    duration_ms,
                )
            }
        };

        if result.success {
            debug!(command = %text, bytes = result.output.len(), duration_ms, "Command completed");
            // The frame printed by a bare switch only describes where the thread stopped.
            if parse_thread_switch(text).is_none() {
                result.evidence_id = self.offer_evidence(&result).await;
            }
        }
        result
    }

    async fn offer_evidence(&self, result: &ExecutionResult) -> Option<String> {
        let sink = self.evidence_sink.as_ref()?;
        if result.output.trim().is_empty() {
            return None;
        }
        let command = result.command.text.as_str();
        let ctx = result.command.thread_context.as_deref();

        let stored = match sink.find_duplicate_by_content(command, &result.output, ctx).await {
            Ok(Some(id)) => Ok(id),
            Ok(None) => sink.store_raw(command, &result.output, ctx).await,
            Err(e) => Err(e),
        };
        match stored {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(command = %command, error = %e, "Failed to store evidence");
                None
            }
        }
    }

    /// One framed request/response with the debugger.
    ///
    /// Sends `command` (if any) followed by a fresh sentinel and collects
    /// lines until the sentinel is seen or `timeout` elapses. On timeout the
    /// sentinel is remembered as stale.
    async fn exchange(&mut self, command: Option<&str>, timeout: Duration) -> Result<String, CommandError> {
        self.drain_pending();

        let sentinel = Sentinel::new(&self.config.echo_template);
        let mut payload = String::new();
        if let Some(command) = command {
            payload.push_str(command);
            payload.push('\n');
        }
        payload.push_str(sentinel.command());
        payload.push('\n');

        self.write_input(payload.as_bytes()).await?;

        let deadline = Instant::now() + timeout;
        let mut collector = FrameCollector::new(&sentinel);
        loop {
            match timeout_at(deadline, self.lines.recv()).await {
                Err(_) => {
                    self.stale.push_back(sentinel.marker().to_string());
                    return Err(CommandError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                Ok(None) => return Err(CommandError::ProcessExited),
                Ok(Some(line)) => {
                    if collector.push(&line, &mut self.stale) == FrameStatus::Complete {
                        return Ok(collector.finish());
                    }
                }
            }
        }
    }

    /// Drop output that arrived between commands.
    fn drain_pending(&mut self) {
        let mut dropped = 0usize;
        while let Ok(line) = self.lines.try_recv() {
            if let Some(idx) = self.stale.iter().position(|m| line.contains(m.as_str())) {
                self.stale.remove(idx);
            }
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "Discarded pending debugger output");
        }
    }

    async fn write_input(&mut self, bytes: &[u8]) -> Result<(), CommandError> {
        let written = async {
            self.input.write_all(bytes).await?;
            self.input.flush().await
        }
        .await;

        written.map_err(|e| match e.kind() {
            std::io::ErrorKind::BrokenPipe => CommandError::ProcessExited,
            _ => CommandError::Io {
                message: e.to_string(),
            },
        })
    }

    /// Check that the dump opened and reports a last event.
    pub async fn validate_dump(&mut self) -> DumpValidation {
        let result = self.execute(".lastevent").await;
        if result.success {
            DumpValidation {
                valid: true,
                info: Some(result.output),
                error: None,
            }
        } else {
            DumpValidation {
                valid: false,
                info: None,
                error: result.error_message(),
            }
        }
    }

    /// User-mode dumps answer `!peb`; anything else is treated as kernel.
    pub async fn dump_kind(&mut self) -> DumpKind {
        let result = self.execute("!peb").await;
        if result.success && result.output.contains("PEB at") {
            DumpKind::User
        } else {
            DumpKind::Kernel
        }
    }

    /// Quit the debugger, killing it if it does not exit in time.
    pub async fn shutdown(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let quit_timeout = self.config.quit_timeout();

        if let Err(e) = self.write_input(b"q\n").await {
            debug!(error = %e, "Quit command not delivered");
        }

        if let Some(child) = self.child.as_mut() {
            match tokio::time::timeout(quit_timeout, child.wait()).await {
                Ok(Ok(status)) => info!(%status, "Debugger exited"),
                Ok(Err(e)) => warn!(error = %e, "Failed to wait for debugger"),
                Err(_) => {
                    warn!(
                        timeout_secs = quit_timeout.as_secs(),
                        "Debugger did not quit in time, killing"
                    );
                    if let Err(e) = child.kill().await {
                        error!(error = %e, "Failed to kill debugger process");
                    }
                }
            }
        }

        for reader in self.readers.drain(..) {
            reader.abort();
        }
        self.child = None;
        self.state = SessionState::Closed;
    }
}

impl Drop for DebuggerSession {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

/// Forward every line of `stream` into `tx` until EOF or the receiver goes away.
fn spawn_line_reader<R>(stream: R, tx: mpsc::Sender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut raw = Vec::with_capacity(256);
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&raw)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Debugger output stream closed");
                    break;
                }
            }
        }
    })
}
