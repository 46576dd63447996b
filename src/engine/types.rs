use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cache::Evidence;
use crate::oracle::{ConfidenceLevel, HypothesisProposal, Verdict};

/// Evaluation state of one hypothesis test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestResult {
    #[default]
    Pending,
    Confirmed,
    Rejected,
    Inconclusive,
}

impl From<Verdict> for TestResult {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Confirmed => TestResult::Confirmed,
            Verdict::Rejected => TestResult::Rejected,
            Verdict::Inconclusive => TestResult::Inconclusive,
        }
    }
}

impl std::fmt::Display for TestResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TestResult::Pending => "pending",
            TestResult::Confirmed => "confirmed",
            TestResult::Rejected => "rejected",
            TestResult::Inconclusive => "inconclusive",
        };
        f.write_str(name)
    }
}

/// One hypothesis and everything gathered while testing it.
///
/// Tests are appended to the engine's list as pivots occur and never removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisTest {
    pub hypothesis: String,
    pub confidence: ConfidenceLevel,
    #[serde(default)]
    pub reasoning: String,
    /// Commands of the current attempt, at most the configured per-test limit.
    pub test_commands: Vec<String>,
    pub expected_confirmed: String,
    pub expected_rejected: String,
    pub result: TestResult,
    /// Evidence of the most recent attempt only.
    pub evidence: Vec<Evidence>,
    #[serde(default)]
    pub evaluation_reasoning: String,
    #[serde(default)]
    pub key_findings: Vec<String>,
    pub inconclusive_count: u32,
}

impl HypothesisTest {
    pub fn from_proposal(proposal: HypothesisProposal, max_commands: usize) -> Self {
        let mut test_commands: Vec<String> = proposal
            .test_commands
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        test_commands.truncate(max_commands);

        Self {
            hypothesis: proposal.hypothesis,
            confidence: proposal.confidence,
            reasoning: proposal.reasoning,
            test_commands,
            expected_confirmed: proposal.expected_confirmed,
            expected_rejected: proposal.expected_rejected,
            result: TestResult::Pending,
            evidence: Vec::new(),
            evaluation_reasoning: String::new(),
            key_findings: Vec::new(),
            inconclusive_count: 0,
        }
    }
}

/// Where the hypothesis loop currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnginePhase {
    Forming,
    Testing,
    Confirmed,
    Rejected,
    Inconclusive,
}

impl std::fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EnginePhase::Forming => "forming",
            EnginePhase::Testing => "testing",
            EnginePhase::Confirmed => "confirmed",
            EnginePhase::Rejected => "rejected",
            EnginePhase::Inconclusive => "inconclusive",
        };
        f.write_str(name)
    }
}

/// What the loop does after a test has been evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    /// The newest test has commands waiting to run.
    Test,
    /// Hypothesis confirmed; run these root-cause tasks.
    DeepDive { tasks: Vec<String> },
    /// No hypothesis could be confirmed within budget.
    Halt,
}

/// Evidence gathered by the root-cause tasks, keyed by task.
pub type EvidenceInventory = BTreeMap<String, Vec<Evidence>>;

/// Final document of an investigation.
#[derive(Debug, Clone, Serialize)]
pub struct InvestigationOutcome {
    pub issue: String,
    /// `confirmed` or `rejected`.
    pub status: EnginePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_hypothesis: Option<String>,
    pub tests: Vec<HypothesisTest>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub investigation_plan: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub inventory: EvidenceInventory,
}
