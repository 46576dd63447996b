//! Hypothesis-driven investigation.
//!
//! [`HypothesisEngine`] runs the form → test → evaluate loop over a
//! [`CommandExecutor`](crate::cache::CommandExecutor), consulting the oracle
//! for judgment calls:
//!
//! - `confirmed` hands off to a bounded list of root-cause tasks whose
//!   evidence is collected in a per-task inventory
//! - `rejected` pivots to a new hypothesis until the attempt budget runs out
//! - `inconclusive` replaces the test's commands with new ones, and is forced
//!   to `rejected` once the inconclusive budget is spent
//!
//! Evaluation always sees the evidence of every earlier hypothesis test plus
//! the current attempt. Placeholders such as `<address_of_largest_object>` in
//! planned commands are filled from that same evidence before execution.

mod hypothesis;
mod placeholders;
mod pooling;
mod types;

pub use hypothesis::HypothesisEngine;
pub use placeholders::{find_placeholders, has_placeholders, resolve, Placeholder, PlaceholderKind};
pub use pooling::{brief_evidence, pool, prepare_evidence_text, MAX_BRIEF_ITEMS};
pub use types::{
    EnginePhase, EvidenceInventory, HypothesisTest, InvestigationOutcome, NextStep, TestResult,
};
