use async_trait::async_trait;
use serde_json::json;

use super::{command_head, Interpretation, Interpreter};

/// First unsigned integer following `label` in `text`.
fn number_after(text: &str, label: &str) -> Option<u64> {
    let idx = text.find(label)? + label.len();
    let digits: String = text[idx..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn line_containing<'a>(text: &'a str, needle: &str) -> Option<&'a str> {
    text.lines().find(|line| line.contains(needle))
}

fn is_hex(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_hexdigit() || c == '`')
}

// ============================================================================
// !threads
// ============================================================================

/// Parses the managed thread table.
pub struct ThreadsInterpreter;

#[derive(Debug)]
struct ThreadRow {
    dbg: Option<u32>,
    managed_id: u32,
    osid: String,
    lock_count: u32,
    note: Option<String>,
}

impl ThreadsInterpreter {
    fn parse_row(line: &str) -> Option<ThreadRow> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 10 {
            return None;
        }
        let dbg = match tokens[0] {
            "XXXX" => None,
            t => Some(t.parse().ok()?),
        };
        let managed_id = tokens[1].parse().ok()?;
        if !is_hex(tokens[2]) || !tokens[6].contains(':') {
            return None;
        }
        let lock_count = tokens[8].parse().ok()?;
        let note = (tokens.len() > 10).then(|| tokens[10..].join(" "));
        Some(ThreadRow {
            dbg,
            managed_id,
            osid: tokens[2].to_ascii_lowercase(),
            lock_count,
            note,
        })
    }
}

#[async_trait]
impl Interpreter for ThreadsInterpreter {
    fn name(&self) -> &'static str {
        "threads"
    }

    fn specificity(&self, command: &str) -> Option<u8> {
        (command_head(command) == "!threads").then_some(10)
    }

    async fn interpret(&self, _command: &str, output: &str) -> Interpretation {
        let thread_count = number_after(output, "ThreadCount:");
        let dead = number_after(output, "DeadThread:").unwrap_or(0);
        let background = number_after(output, "BackgroundThread:").unwrap_or(0);
        let rows: Vec<ThreadRow> = output.lines().filter_map(Self::parse_row).collect();

        if thread_count.is_none() && rows.is_empty() {
            return Interpretation::failed(self.name(), "no thread table found");
        }

        let total = thread_count.unwrap_or(rows.len() as u64);
        let holding: Vec<&ThreadRow> = rows.iter().filter(|r| r.lock_count > 0).collect();
        let with_exception: Vec<&ThreadRow> = rows
            .iter()
            .filter(|r| r.note.as_deref().is_some_and(|n| n.contains("Exception")))
            .collect();

        let mut findings = vec![
            format!("Managed threads: {} ({} background, {} dead)", total, background, dead),
        ];
        for row in &holding {
            findings.push(format!(
                "Managed thread {} (debugger thread {}, OSID 0x{}) holds {} lock(s)",
                row.managed_id,
                row.dbg.map(|d| d.to_string()).unwrap_or_else(|| "XXXX".to_string()),
                row.osid,
                row.lock_count
            ));
        }
        for row in &with_exception {
            findings.push(format!(
                "Managed thread {} has exception: {}",
                row.managed_id,
                row.note.as_deref().unwrap_or_default()
            ));
        }

        let summary = format!(
            "{} managed threads, {} holding locks, {} with exceptions, {} dead",
            total,
            holding.len(),
            with_exception.len(),
            dead
        );

        Interpretation {
            summary,
            findings,
            structured_data: json!({
                "thread_count": total,
                "dead_threads": dead,
                "background_threads": background,
                "parsed_rows": rows.len(),
                "lock_holders": holding.iter().map(|r| json!({
                    "managed_id": r.managed_id,
                    "dbg": r.dbg,
                    "osid": r.osid,
                    "lock_count": r.lock_count,
                })).collect::<Vec<_>>(),
            }),
            success: true,
            interpreter: self.name().to_string(),
        }
    }
}

// ============================================================================
// !syncblk
// ============================================================================

/// Parses monitor ownership and waiter counts.
pub struct SyncBlockInterpreter;

#[derive(Debug)]
struct SyncBlockRow {
    index: u64,
    monitor_held: u64,
    osid: Option<String>,
    thread: Option<String>,
}

impl SyncBlockRow {
    /// MonitorHeld counts 1 for the owner and 2 for each waiter.
    fn waiters(&self) -> u64 {
        self.monitor_held.saturating_sub(1) / 2
    }
}

impl SyncBlockInterpreter {
    fn parse_row(line: &str) -> Option<SyncBlockRow> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 5 {
            return None;
        }
        let index = tokens[0].parse().ok()?;
        if !is_hex(tokens[1]) {
            return None;
        }
        let monitor_held = tokens[2].parse().ok()?;
        tokens[3].parse::<u64>().ok()?;
        Some(SyncBlockRow {
            index,
            monitor_held,
            osid: tokens.get(5).filter(|t| is_hex(t)).map(|t| t.to_ascii_lowercase()),
            thread: tokens.get(6).filter(|t| t.chars().all(|c| c.is_ascii_digit())).map(|t| t.to_string()),
        })
    }
}

#[async_trait]
impl Interpreter for SyncBlockInterpreter {
    fn name(&self) -> &'static str {
        "syncblk"
    }

    fn specificity(&self, command: &str) -> Option<u8> {
        (command_head(command) == "!syncblk").then_some(10)
    }

    async fn interpret(&self, _command: &str, output: &str) -> Interpretation {
        let has_header = output.contains("MonitorHeld") || output.contains("Total");
        let rows: Vec<SyncBlockRow> = output.lines().filter_map(Self::parse_row).collect();
        if !has_header && rows.is_empty() {
            return Interpretation::failed(self.name(), "no sync block table found");
        }

        let total = line_containing(output, "Total")
            .and_then(|l| number_after(l, "Total"))
            .unwrap_or(rows.len() as u64);
        let contended: Vec<&SyncBlockRow> = rows.iter().filter(|r| r.waiters() > 0).collect();

        let mut findings = vec![
            format!("Sync blocks: {}", total),
            format!("Sync blocks with waiters: {}", contended.len()),
        ];
        for row in contended.iter().take(5) {
            findings.push(format!(
                "Sync block {} owned by thread {} (OSID 0x{}), {} waiting",
                row.index,
                row.thread.as_deref().unwrap_or("?"),
                row.osid.as_deref().unwrap_or("?"),
                row.waiters()
            ));
        }

        let summary = if contended.is_empty() {
            format!("{} sync blocks, no lock contention", total)
        } else {
            format!(
                "Lock contention: {} of {} sync blocks have waiting threads",
                contended.len(),
                total
            )
        };

        Interpretation {
            summary,
            findings,
            structured_data: json!({
                "total": total,
                "contended": contended.iter().map(|r| json!({
                    "index": r.index,
                    "monitor_held": r.monitor_held,
                    "waiters": r.waiters(),
                    "owner_thread": r.thread,
                    "owner_osid": r.osid,
                })).collect::<Vec<_>>(),
            }),
            success: true,
            interpreter: self.name().to_string(),
        }
    }
}

// ============================================================================
// !threadpool
// ============================================================================

/// Parses worker and completion-port statistics.
pub struct ThreadPoolInterpreter;

#[async_trait]
impl Interpreter for ThreadPoolInterpreter {
    fn name(&self) -> &'static str {
        "threadpool"
    }

    fn specificity(&self, command: &str) -> Option<u8> {
        (command_head(command) == "!threadpool").then_some(10)
    }

    async fn interpret(&self, _command: &str, output: &str) -> Interpretation {
        let cpu = number_after(output, "CPU utilization:");
        // Desktop CLR prints one "Worker Thread:" line; .NET Core prints "Workers Total:" etc.
        let worker_line = line_containing(output, "Worker Thread:");
        let workers_total = worker_line
            .and_then(|l| number_after(l, "Total:"))
            .or_else(|| number_after(output, "Workers Total:"));
        let workers_running = worker_line
            .and_then(|l| number_after(l, "Running:"))
            .or_else(|| number_after(output, "Workers Running:"));
        let workers_idle = worker_line
            .and_then(|l| number_after(l, "Idle:"))
            .or_else(|| number_after(output, "Workers Idle:"));
        let queued = number_after(output, "Work Request in Queue:")
            .or_else(|| number_after(output, "Queued work items:"))
            .unwrap_or(0);

        if cpu.is_none() && workers_total.is_none() {
            return Interpretation::failed(self.name(), "no thread pool statistics found");
        }

        let mut issues = Vec::new();
        if let Some(cpu) = cpu.filter(|c| *c >= 80) {
            issues.push(format!("High CPU utilization: {}%", cpu));
        }
        if workers_total.unwrap_or(0) > 0 && workers_idle == Some(0) {
            issues.push("No idle worker threads (possible starvation)".to_string());
        }
        if queued > 0 {
            issues.push(format!("{} work requests queued", queued));
        }

        let mut findings = vec![format!(
            "Workers: {} total, {} running, {} idle",
            workers_total.unwrap_or(0),
            workers_running.unwrap_or(0),
            workers_idle.unwrap_or(0)
        )];
        if let Some(cpu) = cpu {
            findings.push(format!("CPU utilization: {}%", cpu));
        }
        findings.extend(issues.iter().cloned());

        let summary = if issues.is_empty() {
            format!(
                "Thread pool healthy: {} idle workers, {} queued items",
                workers_idle.unwrap_or(0),
                queued
            )
        } else {
            format!("Thread pool issues: {}", issues.join("; "))
        };

        Interpretation {
            summary,
            findings,
            structured_data: json!({
                "cpu_utilization": cpu,
                "workers_total": workers_total,
                "workers_running": workers_running,
                "workers_idle": workers_idle,
                "queued": queued,
            }),
            success: true,
            interpreter: self.name().to_string(),
        }
    }
}
