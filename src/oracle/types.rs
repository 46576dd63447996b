use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::extract::extract_typed;
use crate::error::OracleParseError;

/// Result of parsing one oracle completion into the shape a call site expects.
#[derive(Debug, Clone, PartialEq)]
pub enum OracleReply<T> {
    Parsed(T),
    /// Every extraction strategy failed; the caller applies its default.
    Unparsed {
        raw: String,
        reason: OracleParseError,
    },
}

impl<T: DeserializeOwned> OracleReply<T> {
    pub fn parse(raw: String) -> Self {
        match extract_typed::<T>(&raw) {
            Ok(value) => OracleReply::Parsed(value),
            Err(reason) => OracleReply::Unparsed { raw, reason },
        }
    }
}

impl<T> OracleReply<T> {
    pub fn is_parsed(&self) -> bool {
        matches!(self, OracleReply::Parsed(_))
    }

    pub fn parsed(self) -> Option<T> {
        match self {
            OracleReply::Parsed(value) => Some(value),
            OracleReply::Unparsed { .. } => None,
        }
    }

    /// Parsed value, or `fallback` computed from the parse failure.
    pub fn or_else(self, fallback: impl FnOnce(&OracleParseError) -> T) -> T {
        match self {
            OracleReply::Parsed(value) => value,
            OracleReply::Unparsed { reason, .. } => fallback(&reason),
        }
    }
}

/// Three-level confidence used in hypothesis proposals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    #[default]
    Medium,
    Low,
}

/// A hypothesis with the commands that test it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisProposal {
    pub hypothesis: String,
    #[serde(default)]
    pub confidence: ConfidenceLevel,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub test_commands: Vec<String>,
    #[serde(default, alias = "expected_if_confirmed")]
    pub expected_confirmed: String,
    #[serde(default, alias = "expected_if_rejected")]
    pub expected_rejected: String,
    #[serde(default)]
    pub alternative_hypotheses: Vec<String>,
}

/// Outcome label of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Confirmed,
    Rejected,
    Inconclusive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationVerdict {
    pub result: Verdict,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub key_findings: Vec<String>,
}

/// Single replacement for a failed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlternativeCommand {
    pub alternative_command: String,
    #[serde(default)]
    pub reasoning: String,
}

/// Replacement commands for an inconclusive test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdditionalCommands {
    pub additional_commands: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

/// Root-cause task list produced after confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationPlan {
    pub investigation_plan: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

/// Commands for one deep-dive task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCommands {
    pub commands: Vec<String>,
    #[serde(default)]
    pub rationale: String,
}

/// Findings for one output segment, or the synthesis across segments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkAnalysis {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub blocking_operations: Vec<serde_json::Value>,
    #[serde(default)]
    pub thread_states: Vec<serde_json::Value>,
    #[serde(default)]
    pub exceptions: Vec<String>,
    #[serde(default)]
    pub root_cause: Option<String>,
}
