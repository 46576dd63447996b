//! External reasoning service consulted for judgment calls.
//!
//! The investigation never depends on the oracle's free text directly: every
//! call site parses the completion into a typed [`OracleReply`] and supplies
//! its own fallback when parsing fails.

mod extract;
mod types;

pub use extract::{extract_json_object, extract_typed};
pub use types::{
    AdditionalCommands, AlternativeCommand, ChunkAnalysis, ConfidenceLevel, EvaluationVerdict,
    HypothesisProposal, InvestigationPlan, OracleReply, TaskCommands, Verdict,
};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::PipeConfig;
use crate::error::{OracleError, OracleResult};
use crate::langbase::{LangbaseClient, Message, PipeRequest};

/// Every kind of judgment the investigation asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleCall {
    FormHypothesis,
    Evaluate,
    AlternativeCommand,
    GatherEvidence,
    PlanDeepDive,
    PlanTask,
    AnalyzeChunk,
    Synthesize,
}

/// Pipe family an oracle call is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeFamily {
    Hypothesis,
    Evaluation,
    Analysis,
}

impl OracleCall {
    pub fn as_str(&self) -> &'static str {
        match self {
            OracleCall::FormHypothesis => "form_hypothesis",
            OracleCall::Evaluate => "evaluate",
            OracleCall::AlternativeCommand => "alternative_command",
            OracleCall::GatherEvidence => "gather_evidence",
            OracleCall::PlanDeepDive => "plan_deep_dive",
            OracleCall::PlanTask => "plan_task",
            OracleCall::AnalyzeChunk => "analyze_chunk",
            OracleCall::Synthesize => "synthesize",
        }
    }

    pub fn family(&self) -> PipeFamily {
        match self {
            OracleCall::FormHypothesis
            | OracleCall::AlternativeCommand
            | OracleCall::GatherEvidence
            | OracleCall::PlanDeepDive
            | OracleCall::PlanTask => PipeFamily::Hypothesis,
            OracleCall::Evaluate => PipeFamily::Evaluation,
            OracleCall::AnalyzeChunk | OracleCall::Synthesize => PipeFamily::Analysis,
        }
    }
}

impl std::fmt::Display for OracleCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A role-segmented prompt for one oracle call.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleRequest {
    pub call: OracleCall,
    pub system: String,
    pub user: String,
}

impl OracleRequest {
    pub fn new(call: OracleCall, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            call,
            system: system.into(),
            user: user.into(),
        }
    }
}

/// Free-text reasoning service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Send one prompt and return the raw completion text.
    async fn invoke(&self, request: OracleRequest) -> OracleResult<String>;
}

/// Invoke `oracle` and parse the completion as `T`.
///
/// Transport failures are returned as errors; unparseable text is not.
pub async fn consult<T: DeserializeOwned>(
    oracle: &dyn Oracle,
    request: OracleRequest,
) -> OracleResult<OracleReply<T>> {
    let call = request.call;
    let raw = oracle.invoke(request).await?;
    let reply = OracleReply::<T>::parse(raw);
    match &reply {
        OracleReply::Parsed(_) => debug!(call = %call, "Oracle reply parsed"),
        OracleReply::Unparsed { reason, raw } => warn!(
            call = %call,
            reason = %reason,
            preview = %raw.chars().take(200).collect::<String>(),
            "Oracle reply could not be parsed"
        ),
    }
    Ok(reply)
}

/// Oracle backed by Langbase pipes, one pipe per call family.
#[derive(Clone)]
pub struct LangbaseOracle {
    client: LangbaseClient,
    pipes: PipeConfig,
}

impl LangbaseOracle {
    pub fn new(client: LangbaseClient, pipes: PipeConfig) -> Self {
        Self { client, pipes }
    }

    fn pipe_for(&self, call: OracleCall) -> &str {
        match call.family() {
            PipeFamily::Hypothesis => &self.pipes.hypothesis,
            PipeFamily::Evaluation => &self.pipes.evaluation,
            PipeFamily::Analysis => &self.pipes.analysis,
        }
    }
}

#[async_trait]
impl Oracle for LangbaseOracle {
    async fn invoke(&self, request: OracleRequest) -> OracleResult<String> {
        let pipe = self.pipe_for(request.call).to_string();
        let messages = vec![Message::system(request.system), Message::user(request.user)];

        let response = self
            .client
            .call_pipe(PipeRequest::new(pipe, messages))
            .await?;

        if !response.success {
            return Err(OracleError::Unsuccessful {
                call: request.call.to_string(),
            });
        }
        Ok(response.completion)
    }
}
