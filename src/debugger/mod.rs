//! Native debugger session management.
//!
//! This module provides:
//! - A long-lived debugger process with sentinel-framed command execution
//! - Error classification of debugger output
//! - Thread selection tracking for thread-sensitive commands

mod command;
mod protocol;
mod session;
mod thread_context;

pub use command::{Command, CommandRisk, ExecutionResult};
pub use protocol::{
    check_syntax, classify_output, find_fatal_init_line, strip_prompt, Sentinel,
    BENIGN_SIGNATURES, ERROR_SIGNATURES, FATAL_INIT_SIGNATURES,
};
pub use session::{DebuggerSession, DumpKind, DumpValidation, SessionState};
pub use thread_context::{
    parse_thread_switch, split_thread_switch, ThreadContextTracker, ThreadSwitch,
};
