use serde::{Deserialize, Serialize};

use crate::error::CommandError;
use crate::oracle::ConfidenceLevel;

/// Where the full payload of a piece of evidence lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceType {
    /// `output` is the raw payload.
    Inline,
    /// `output` is a bounded summary; the payload is in the store under `evidence_id`.
    External,
}

/// One command's execution and interpretation as seen by the investigation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub command: String,
    pub output: String,
    pub evidence_type: EvidenceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<String>,
    pub confidence: ConfidenceLevel,
    #[serde(default)]
    pub significance: String,
    #[serde(default)]
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_context: Option<String>,
}

impl Evidence {
    /// Inline evidence carrying the raw output.
    pub fn inline(command: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            output: output.into(),
            evidence_type: EvidenceType::Inline,
            evidence_id: None,
            summary: None,
            findings: Vec::new(),
            confidence: ConfidenceLevel::Medium,
            significance: String::new(),
            failed: false,
            error: None,
            cached: false,
            thread_context: None,
        }
    }

    /// Record of a command that did not produce usable output.
    pub fn failed(command: impl Into<String>, output: impl Into<String>, error: &CommandError) -> Self {
        let output = output.into();
        let error_text = match error {
            CommandError::ToolError { line } => line.clone(),
            other => other.to_string(),
        };
        Self {
            output: if output.trim().is_empty() {
                format!("Error: {}", error_text)
            } else {
                output
            },
            failed: true,
            error: Some(error_text),
            confidence: ConfidenceLevel::Low,
            ..Self::inline(command, String::new())
        }
    }

    pub fn with_significance(mut self, significance: impl Into<String>) -> Self {
        self.significance = significance.into();
        self
    }

    pub fn is_external(&self) -> bool {
        self.evidence_type == EvidenceType::External
    }
}
