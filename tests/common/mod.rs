//! Shared fixtures: an in-process fake debugger and a scripted oracle.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use dump_investigator::config::{DatabaseConfig, DebuggerConfig, EvidenceConfig};
use dump_investigator::debugger::DebuggerSession;
use dump_investigator::error::OracleResult;
use dump_investigator::oracle::{Oracle, OracleCall, OracleRequest};
use dump_investigator::storage::SqliteEvidenceStore;

// ============================================================================
// Fake debugger
// ============================================================================

/// How the fake debugger reacts to runtime-support loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeSupport {
    Matching,
    Mismatched,
}

/// Commands the fake debugger received, excluding sentinels.
#[derive(Clone, Default)]
pub struct Received(Arc<Mutex<Vec<String>>>);

impl Received {
    pub fn count(&self, command: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|c| *c == command).count()
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn push(&self, command: &str) {
        self.0.lock().unwrap().push(command.to_string());
    }
}

/// Deterministic large `!dumpheap -stat` output.
pub fn big_heap_output() -> String {
    let mut lines = vec![
        "Statistics:".to_string(),
        "              MT    Count    TotalSize Class Name".to_string(),
    ];
    for i in 0..120 {
        lines.push(format!(
            "00007ff8{:08x} {:>8} {:>12} Contoso.Orders.Line{}",
            i,
            i * 7 + 1,
            (i * 7 + 1) * 48,
            i
        ));
    }
    lines.push("Total 50820 objects".to_string());
    lines.join("\n")
}

fn clrstack_output(thread: &str) -> String {
    format!(
        "OS Thread Id: 0x{0} ({0})\n        Child SP               IP Call Site\n000000a1b2c3d4e0 00007ff8a0000000 Contoso.Worker.Run{0}()",
        thread
    )
}

/// The frame a real debugger prints after selecting a thread.
pub fn switch_frame(thread: &str) -> String {
    format!(
        "ntdll!NtWaitForMultipleObjects+0x14:\n00007ff8`b1c2{:0>4} c3              ret",
        thread
    )
}

/// Roughly 11 KB of rows behind a leading SOS failure line.
pub fn big_failure_output() -> String {
    let mut lines = vec!["Failed to request MethodData, not in JIT code range".to_string()];
    for i in 0..200 {
        lines.push(format!("000001f2a3b4{:04x} 00007ff8a1b20020       24 LeakedRow{}", i, i));
    }
    lines.join("\n")
}

fn reply_for(command: &str, thread: &mut String, runtime: RuntimeSupport) -> Option<String> {
    if let Some(id) = command.strip_prefix('~').and_then(|c| c.strip_suffix('s')) {
        *thread = id.to_string();
        return Some(switch_frame(id));
    }
    let reply = match command {
        ".cordll -ve -u -l" => match runtime {
            RuntimeSupport::Matching => "CLR DLL status: Loaded DLL mscordacwks.dll".to_string(),
            RuntimeSupport::Mismatched => {
                "CLRDLL: Unable to find mscordacwks_AMD64_AMD64_4.8.4515.00.dll".to_string()
            }
        },
        ".loadby sos clr" => String::new(),
        "!eeversion" => "4.8.4515.0 retail\nWorkstation mode\nSOS Version: 4.8.4515.0".to_string(),
        ".lastevent" => {
            "Last event: 1a2c.3f4: Break instruction exception - code 80000003".to_string()
        }
        "!peb" => "PEB at 000000d5a7e3f000\n    InheritedAddressSpace:    No".to_string(),
        "!threads" => "0:000> ThreadCount:      3\nUnstartedThread:  0\nBackgroundThread: 2\nDeadThread:       0".to_string(),
        "lm" => "start             end                 module name\n00007ff6`1a2b0000 00007ff6`1a2c8000   Contoso_Orders".to_string(),
        "!clrstack" => clrstack_output(thread),
        "~*e !clrstack" => format!(
            "OS Thread Id: 0x1a2c (0)\nUnable to walk the managed stack. The current thread is likely not a managed thread.\nYou can run !threads to get a list of managed threads in the process\n{}",
            clrstack_output("1")
        ),
        "!bigfail" => big_failure_output(),
        "!dumpheap -stat" => big_heap_output(),
        "!bogus" => "No export bogus found".to_string(),
        "!hang" => return None,
        _ => String::new(),
    };
    Some(reply)
}

/// Start a fake debugger task on `stream`.
///
/// `!slow` answers only after 200ms; `!hang` never answers, swallowing the
/// sentinel that follows it. `q` ends the conversation.
pub fn spawn_fake_debugger(
    stream: DuplexStream,
    runtime: RuntimeSupport,
    received: Received,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(stream);
        let mut lines = BufReader::new(read).lines();
        let mut thread = "0".to_string();

        while let Ok(Some(line)) = lines.next_line().await {
            let command = line.trim().to_string();
            if let Some(marker) = command.strip_prefix(".echo ") {
                if write.write_all(format!("{}\n", marker).as_bytes()).await.is_err() {
                    break;
                }
                continue;
            }
            received.push(&command);

            let reply = match command.as_str() {
                "q" => break,
                "!slow" => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Some("slow output".to_string())
                }
                other => reply_for(other, &mut thread, runtime),
            };
            let Some(reply) = reply else {
                let _ = lines.next_line().await;
                continue;
            };
            if !reply.is_empty() && write.write_all(format!("{}\n", reply).as_bytes()).await.is_err() {
                break;
            }
        }
    })
}

pub fn debugger_config() -> DebuggerConfig {
    DebuggerConfig {
        command_timeout_secs: 5,
        init_timeout_secs: 5,
        quit_timeout_secs: 1,
        channel_capacity: 256,
        ..DebuggerConfig::default()
    }
}

/// Uninitialized session wired to a fake debugger.
pub fn fake_session(runtime: RuntimeSupport) -> (DebuggerSession, Received) {
    let (ours, theirs) = duplex(256 * 1024);
    let received = Received::default();
    spawn_fake_debugger(theirs, runtime, received.clone());
    let (read, write) = tokio::io::split(ours);
    (DebuggerSession::from_streams(debugger_config(), write, read), received)
}

/// Initialized session wired to a matching fake debugger.
pub async fn ready_session() -> (DebuggerSession, Received) {
    let (mut session, received) = fake_session(RuntimeSupport::Matching);
    session.initialize().await.expect("fake debugger initializes");
    (session, received)
}

// ============================================================================
// Evidence store
// ============================================================================

pub async fn evidence_store(dir: &TempDir) -> SqliteEvidenceStore {
    SqliteEvidenceStore::new(&DatabaseConfig {
        session_dir: dir.path().join("session"),
        max_connections: 1,
    })
    .await
    .expect("evidence store opens")
}

/// Small thresholds so the fake `!dumpheap -stat` output counts as large.
pub fn evidence_config() -> EvidenceConfig {
    EvidenceConfig {
        storage_threshold: 2000,
        chunk_size: 1500,
        max_summary_chars: 120,
    }
}

// ============================================================================
// Scripted oracle
// ============================================================================

type Reply = Box<dyn Fn(&OracleRequest) -> OracleResult<String> + Send + Sync>;

/// Oracle answering through a closure and recording every request.
pub struct StubOracle {
    reply: Reply,
    requests: Mutex<Vec<OracleRequest>>,
}

impl StubOracle {
    pub fn new<F>(reply: F) -> Self
    where
        F: Fn(&OracleRequest) -> String + Send + Sync + 'static,
    {
        Self::fallible(move |request| Ok(reply(request)))
    }

    pub fn fallible<F>(reply: F) -> Self
    where
        F: Fn(&OracleRequest) -> OracleResult<String> + Send + Sync + 'static,
    {
        Self {
            reply: Box::new(reply),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self, call: OracleCall) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.call == call)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<OracleRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Oracle for StubOracle {
    async fn invoke(&self, request: OracleRequest) -> OracleResult<String> {
        let reply = (self.reply)(&request);
        self.requests.lock().unwrap().push(request);
        reply
    }
}
