//! Text protocol spoken with the debugger process.
//!
//! Every command is followed by a unique sentinel emitted through the
//! debugger's own echo primitive. Output belonging to the command is
//! everything read after the buffer was cleared and before the line that
//! carries the sentinel. Sentinels of commands we stopped waiting for are
//! remembered as stale, and any output up to one of them is dropped.

use std::collections::VecDeque;

use uuid::Uuid;

use crate::error::CommandError;

/// Lines that mark a command as failed.
pub const ERROR_SIGNATURES: &[&str] = &[
    "error: unable to bind name",
    "couldn't resolve error at",
    "syntax error",
    "^ error:",
    "no export",
    "is not a recognized extension command",
    "invalid parameter",
    "unable to find module",
    "bad register error",
    "memory access error",
    "failed to",
    "unable to",
];

/// Warnings that contain error-like words but do not invalidate the output.
pub const BENIGN_SIGNATURES: &[&str] = &[
    "unable to verify checksum",
    "unable to verify timestamp",
    "unable to load image",
    "symbol file could not be found",
    "defaulted to export symbols",
    "symbol search path is",
    "executable search path is",
    "loading unloaded module list",
    "pdb symbol for",
    // Per-thread SOS notices printed while sweeping every thread with `~*e`.
    "unable to walk the managed stack",
    "not a managed thread",
    "failed to start stack walk",
    "unable to determine the managed thread",
];

/// Lines seen during initialization that mean runtime-support components
/// cannot be matched to the dump.
pub const FATAL_INIT_SIGNATURES: &[&str] = &[
    "clrdll: unable to",
    "clr dll status: error",
    "failed to load data access",
    "mismatch",
    "sos does not support",
    "the call to loadlibrary",
];

/// Shell and pipeline constructs the debugger does not understand.
pub const INVALID_SYNTAX_FRAGMENTS: &[&str] =
    &["| foreach", "| findstr", "| grep", "| where", "| select", "$_"];

/// Unique completion marker for one command.
#[derive(Debug, Clone)]
pub struct Sentinel {
    marker: String,
    command: String,
}

impl Sentinel {
    /// Generate a fresh marker and render it through `template`
    /// (`{marker}` is substituted).
    pub fn new(template: &str) -> Self {
        let marker = format!("__DBGSYNC_{}__", Uuid::new_v4().simple());
        let command = template.replace("{marker}", &marker);
        Self { marker, command }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// The command line that makes the debugger print the marker.
    pub fn command(&self) -> &str {
        &self.command
    }
}

/// Strip leading debugger prompts such as `0:000> ` or `0:012:x86> `.
pub fn strip_prompt(line: &str) -> &str {
    let mut rest = line;
    while let Some(idx) = rest.find("> ") {
        let prefix = &rest[..idx];
        let mut parts = prefix.split(':');
        let is_prompt = matches!(
            (parts.next(), parts.next()),
            (Some(a), Some(b))
                if !a.is_empty()
                    && a.chars().all(|c| c.is_ascii_digit())
                    && !b.is_empty()
                    && b.chars().all(|c| c.is_ascii_digit())
        );
        if !is_prompt {
            break;
        }
        rest = &rest[idx + 2..];
    }
    rest
}

fn contains_any(line: &str, signatures: &[&str]) -> Option<usize> {
    let lower = line.to_ascii_lowercase();
    signatures.iter().position(|sig| lower.contains(sig))
}

/// Return the first line of `output` that carries an error signature,
/// skipping lines recognised as benign warnings.
pub fn classify_output(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| contains_any(line, BENIGN_SIGNATURES).is_none())
        .find(|line| contains_any(line, ERROR_SIGNATURES).is_some())
        .map(str::to_string)
}

/// Return the first line that signals a runtime-support mismatch.
pub fn find_fatal_init_line(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| contains_any(line, FATAL_INIT_SIGNATURES).is_some())
        .map(str::to_string)
}

/// Reject commands the debugger cannot parse before they are sent.
pub fn check_syntax(command: &str) -> Result<(), CommandError> {
    if command.trim().is_empty() {
        return Err(CommandError::InvalidSyntax {
            reason: "empty command".to_string(),
        });
    }
    let lower = command.to_ascii_lowercase();
    if let Some(fragment) = INVALID_SYNTAX_FRAGMENTS.iter().find(|f| lower.contains(*f)) {
        return Err(CommandError::InvalidSyntax {
            reason: format!(
                "'{}' is a shell construct; use native debugger commands only",
                fragment.trim()
            ),
        });
    }
    if command.contains('\n') || command.contains('\r') {
        return Err(CommandError::InvalidSyntax {
            reason: "multi-line input".to_string(),
        });
    }
    Ok(())
}

/// Whether a frame is still being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Pending,
    Complete,
}

/// Accumulates output lines for one command until its sentinel shows up.
#[derive(Debug)]
pub struct FrameCollector<'a> {
    sentinel: &'a Sentinel,
    lines: Vec<String>,
}

impl<'a> FrameCollector<'a> {
    pub fn new(sentinel: &'a Sentinel) -> Self {
        Self {
            sentinel,
            lines: Vec::new(),
        }
    }

    /// Feed one raw line. Stale markers found in the stream are consumed
    /// from `stale` and everything collected before them is discarded.
    pub fn push(&mut self, raw: &str, stale: &mut VecDeque<String>) -> FrameStatus {
        let line = strip_prompt(raw.trim_end_matches('\r'));

        if let Some(pos) = line.find(self.sentinel.marker()) {
            // Some debuggers echo piped input; the echoed sentinel command is not the marker.
            if line.trim() == self.sentinel.command().trim() && line.trim() != self.sentinel.marker()
            {
                return FrameStatus::Pending;
            }
            let before = line[..pos].trim_end();
            if !before.is_empty() {
                self.lines.push(before.to_string());
            }
            return FrameStatus::Complete;
        }

        if let Some(idx) = stale.iter().position(|m| line.contains(m.as_str())) {
            stale.remove(idx);
            self.lines.clear();
            return FrameStatus::Pending;
        }

        self.lines.push(line.to_string());
        FrameStatus::Pending
    }

    /// Collected output with trailing blank lines removed.
    pub fn finish(self) -> String {
        let mut text = self.lines.join("\n");
        let trimmed = text.trim_end().len();
        text.truncate(trimmed);
        text
    }
}
