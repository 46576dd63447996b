use std::sync::Arc;

use tracing::{debug, info, warn};

use super::placeholders;
use super::pooling::{brief_evidence, pool, prepare_evidence_text};
use super::types::{
    EnginePhase, EvidenceInventory, HypothesisTest, InvestigationOutcome, NextStep, TestResult,
};
use crate::cache::{truncate_chars, CommandExecutor, Evidence};
use crate::config::InvestigationConfig;
use crate::debugger::check_syntax;
use crate::error::CommandError;
use crate::oracle::{
    consult, AdditionalCommands, AlternativeCommand, ConfidenceLevel, EvaluationVerdict,
    HypothesisProposal, InvestigationPlan, Oracle, OracleCall, OracleReply, OracleRequest,
    TaskCommands, Verdict,
};
use crate::prompts::{pivot_system_prompt, system_prompt};

/// Replacement commands requested for an inconclusive test.
const MAX_ADDITIONAL_COMMANDS: usize = 2;
/// Deep-dive plans shorter than this are topped up with default tasks.
const MIN_DEEP_DIVE_TASKS: usize = 3;
/// Commands run for one deep-dive task.
const MAX_TASK_COMMANDS: usize = 3;
const MAX_HYPOTHESIS_CHARS: usize = 1000;
const MAX_EXPECTATION_CHARS: usize = 500;
const MAX_ERROR_CHARS: usize = 200;

const DEFAULT_HYPOTHESIS: &str =
    "Application threads are blocked waiting on a contended lock or exhausted resource";
const DEFAULT_TEST_COMMANDS: [&str; 3] = ["!threads", "!syncblk", "~*e !clrstack"];
const DEFAULT_DEEP_DIVE_TASKS: [&str; 3] = [
    "Inspect the managed call stacks of all threads with ~*e !clrstack",
    "Identify lock owners and waiting threads with !syncblk",
    "Check thread pool saturation and queued work with !threadpool",
];

/// Hypothesis-driven investigation loop.
///
/// Forms a hypothesis, tests it with a few commands, asks the oracle for a
/// verdict over the pooled evidence of every test so far, and then confirms
/// (deep dive), pivots, gathers more evidence or halts. The pivot and
/// inconclusive budgets are enforced here, never by the oracle.
pub struct HypothesisEngine {
    executor: Arc<dyn CommandExecutor>,
    oracle: Arc<dyn Oracle>,
    config: InvestigationConfig,
    issue: String,
    phase: EnginePhase,
    tests: Vec<HypothesisTest>,
    alternatives: Vec<String>,
    plan: Vec<String>,
    inventory: EvidenceInventory,
}

impl HypothesisEngine {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        oracle: Arc<dyn Oracle>,
        config: InvestigationConfig,
        issue: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            oracle,
            config,
            issue: issue.into(),
            phase: EnginePhase::Forming,
            tests: Vec::new(),
            alternatives: Vec::new(),
            plan: Vec::new(),
            inventory: EvidenceInventory::new(),
        }
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    pub fn tests(&self) -> &[HypothesisTest] {
        &self.tests
    }

    pub fn current_test(&self) -> Option<&HypothesisTest> {
        self.tests.last()
    }

    /// Alternatives offered by the latest hypothesis proposal.
    pub fn alternatives(&self) -> &[String] {
        &self.alternatives
    }

    pub fn inventory(&self) -> &EvidenceInventory {
        &self.inventory
    }

    /// Drive the loop to a terminal state.
    pub async fn run(mut self) -> InvestigationOutcome {
        info!(issue = %self.issue, "Starting investigation");
        if self.tests.is_empty() {
            self.form_hypothesis().await;
        }

        loop {
            let result = self.test_current().await;
            debug!(result = %result, tests = self.tests.len(), "Test evaluated");
            match self.decide_next_step().await {
                NextStep::Test => continue,
                NextStep::DeepDive { tasks } => {
                    self.run_deep_dive(&tasks).await;
                    break;
                }
                NextStep::Halt => break,
            }
        }

        self.into_outcome()
    }

    pub fn into_outcome(self) -> InvestigationOutcome {
        let confirmed_hypothesis = self
            .tests
            .iter()
            .rev()
            .find(|t| t.result == TestResult::Confirmed)
            .map(|t| t.hypothesis.clone());
        let status = if confirmed_hypothesis.is_some() {
            EnginePhase::Confirmed
        } else {
            EnginePhase::Rejected
        };

        InvestigationOutcome {
            issue: self.issue,
            status,
            confirmed_hypothesis,
            tests: self.tests,
            investigation_plan: self.plan,
            inventory: self.inventory,
        }
    }

    // ========================================================================
    // Forming
    // ========================================================================

    /// Form the initial hypothesis from the issue description.
    pub async fn form_hypothesis(&mut self) -> &HypothesisTest {
        self.phase = EnginePhase::Forming;
        let request = OracleRequest::new(
            OracleCall::FormHypothesis,
            system_prompt(OracleCall::FormHypothesis),
            format!("ISSUE: {}\n\nForm the initial hypothesis.", self.issue),
        );

        let proposal = match self.consult::<HypothesisProposal>(request).await {
            Some(proposal) if !proposal.hypothesis.trim().is_empty() => proposal,
            _ => {
                warn!("Hypothesis formation failed, using default hypothesis");
                default_proposal()
            }
        };
        self.push_test(proposal)
    }

    fn push_test(&mut self, mut proposal: HypothesisProposal) -> &HypothesisTest {
        self.alternatives = std::mem::take(&mut proposal.alternative_hypotheses);
        let test = HypothesisTest::from_proposal(proposal, self.config.max_commands_per_test);
        info!(
            hypothesis = %test.hypothesis,
            confidence = ?test.confidence,
            commands = ?test.test_commands,
            attempt = self.tests.len() + 1,
            "Hypothesis formed"
        );
        self.tests.push(test);
        self.phase = EnginePhase::Testing;
        &self.tests[self.tests.len() - 1]
    }

    // ========================================================================
    // Testing
    // ========================================================================

    /// Run the newest test's commands and evaluate the pooled evidence.
    ///
    /// The attempt's evidence replaces whatever the test held before.
    pub async fn test_current(&mut self) -> TestResult {
        let Some(index) = self.tests.len().checked_sub(1) else {
            return TestResult::Pending;
        };
        self.phase = EnginePhase::Testing;

        let batch = self.run_test_commands(&self.tests[index]).await;
        let verdict = self.evaluate(&batch).await;

        let test = &mut self.tests[index];
        test.evidence = batch;
        test.result = verdict.result.into();
        test.evaluation_reasoning = verdict.reasoning;
        test.key_findings = verdict.key_findings;

        info!(
            hypothesis = %test.hypothesis,
            result = %test.result,
            evidence = test.evidence.len(),
            "Hypothesis evaluated"
        );

        self.phase = match test.result {
            TestResult::Confirmed => EnginePhase::Confirmed,
            TestResult::Rejected => EnginePhase::Rejected,
            TestResult::Inconclusive | TestResult::Pending => EnginePhase::Inconclusive,
        };
        test.result
    }

    /// Execute one attempt's commands, one evidence record per slot.
    pub async fn run_test_commands(&self, test: &HypothesisTest) -> Vec<Evidence> {
        let mut batch = Vec::with_capacity(test.test_commands.len());
        for command in test.test_commands.iter().take(self.config.max_commands_per_test) {
            let evidence = self.run_slot(test, command, &batch).await;
            batch.push(evidence);
        }
        batch
    }

    /// One command slot: on failure, ask once for an alternative and keep the
    /// final attempt's evidence. A command whose placeholders cannot be
    /// filled is never sent and gets no alternative.
    async fn run_slot(&self, test: &HypothesisTest, command: &str, batch: &[Evidence]) -> Evidence {
        let command = match self.resolve_placeholders(command, batch).await {
            Ok(resolved) => resolved,
            Err(unresolved) => return unresolved,
        };
        let command = command.as_str();

        let evidence = self.gather_checked(command).await;
        if !evidence.failed {
            return evidence;
        }

        let error = evidence.error.clone().unwrap_or_else(|| evidence.output.clone());
        warn!(command = %command, error = %error, "Test command failed, requesting alternative");

        let Some(alternative) = self.request_alternative(test, command, &error).await else {
            return evidence;
        };

        info!(failed = %command, alternative = %alternative, "Retrying with alternative command");
        let alternative = match self.resolve_placeholders(&alternative, batch).await {
            Ok(resolved) => resolved,
            Err(unresolved) => return unresolved,
        };
        let retried = self.gather_checked(&alternative).await;
        let note = if retried.failed {
            format!("Alternative for failed '{}' also failed", command)
        } else {
            format!("Alternative for failed '{}'", command)
        };
        retried.with_significance(note)
    }

    /// Gather through the executor unless the command is syntactically unusable.
    async fn gather_checked(&self, command: &str) -> Evidence {
        match check_syntax(command) {
            Ok(()) => self.executor.gather(command).await,
            Err(error) => {
                warn!(command = %command, error = %error, "Refusing invalid command syntax");
                Evidence::failed(command, String::new(), &error)
            }
        }
    }

    /// Fill placeholders in `command` from the evidence gathered so far.
    ///
    /// `recent` is the evidence of the step in progress, which is not yet
    /// part of any test or the inventory. On failure the returned evidence
    /// records the command as failed.
    async fn resolve_placeholders(&self, command: &str, recent: &[Evidence]) -> Result<String, Evidence> {
        if !placeholders::has_placeholders(command) {
            return Ok(command.to_string());
        }

        let sources = self.placeholder_sources(recent).await;
        let texts: Vec<&str> = sources.iter().map(String::as_str).collect();
        match placeholders::resolve(command, &texts) {
            Ok(resolved) => {
                info!(command = %command, resolved = %resolved, "Resolved command placeholders");
                Ok(resolved)
            }
            Err(unresolved) => {
                let error = CommandError::UnresolvedPlaceholders {
                    placeholders: unresolved.join(", "),
                };
                warn!(command = %command, error = %error, "Skipping command");
                Err(Evidence::failed(command, String::new(), &error))
            }
        }
    }

    /// Evidence text to search for placeholder values, newest first. External
    /// items contribute their summary and full stored payload.
    async fn placeholder_sources(&self, recent: &[Evidence]) -> Vec<String> {
        let pooled: Vec<&Evidence> = self
            .tests
            .iter()
            .flat_map(|t| t.evidence.iter())
            .chain(self.inventory.values().flatten())
            .chain(recent.iter())
            .filter(|e| !e.failed)
            .collect();

        let mut sources = Vec::with_capacity(pooled.len());
        for evidence in pooled.into_iter().rev() {
            if !evidence.is_external() {
                sources.push(evidence.output.clone());
                continue;
            }
            if let Some(summary) = evidence.summary.as_deref().filter(|s| !s.is_empty()) {
                sources.push(summary.to_string());
            }
            let full = match &evidence.evidence_id {
                Some(id) => self.executor.full_output(id).await,
                None => None,
            };
            sources.push(full.unwrap_or_else(|| evidence.output.clone()));
        }
        sources
    }

    async fn request_alternative(
        &self,
        test: &HypothesisTest,
        command: &str,
        error: &str,
    ) -> Option<String> {
        let user = format!(
            "HYPOTHESIS: {}\nEXPECTED IF CONFIRMED: {}\n\nFAILED COMMAND:\n{}\n\nERROR:\n{}",
            truncate_chars(&test.hypothesis, MAX_HYPOTHESIS_CHARS),
            truncate_chars(&test.expected_confirmed, MAX_EXPECTATION_CHARS),
            command,
            truncate_chars(error.trim(), MAX_ERROR_CHARS)
        );
        let request = OracleRequest::new(
            OracleCall::AlternativeCommand,
            system_prompt(OracleCall::AlternativeCommand),
            user,
        );

        let reply = self.consult::<AlternativeCommand>(request).await?;
        let alternative = reply.alternative_command.trim().to_string();
        if alternative.is_empty() || alternative == command.trim() {
            warn!(command = %command, "Oracle offered no usable alternative");
            return None;
        }
        Some(alternative)
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    /// Verdict for the newest test over the evidence of all earlier tests
    /// plus `batch`. Exactly one oracle call.
    pub async fn evaluate(&self, batch: &[Evidence]) -> EvaluationVerdict {
        let Some((test, earlier)) = self.tests.split_last() else {
            return inconclusive("No hypothesis to evaluate");
        };

        let pooled = pool(earlier.iter().flat_map(|t| t.evidence.iter()), batch);
        let evidence_text = prepare_evidence_text(
            &pooled,
            self.config.max_evidence_chars_single,
            self.config.max_evidence_chars_total,
        );
        debug!(
            pooled = pooled.len(),
            current = batch.len(),
            chars = evidence_text.len(),
            "Prepared evidence for evaluation"
        );

        let user = format!(
            "HYPOTHESIS: {}\n\nEXPECTED IF CONFIRMED: {}\nEXPECTED IF REJECTED: {}\n\nACTUAL EVIDENCE (current test and all earlier tests):\n{}",
            truncate_chars(&test.hypothesis, MAX_HYPOTHESIS_CHARS),
            truncate_chars(&test.expected_confirmed, MAX_EXPECTATION_CHARS),
            truncate_chars(&test.expected_rejected, MAX_EXPECTATION_CHARS),
            evidence_text
        );
        let request =
            OracleRequest::new(OracleCall::Evaluate, system_prompt(OracleCall::Evaluate), user);

        match consult::<EvaluationVerdict>(self.oracle.as_ref(), request).await {
            Ok(OracleReply::Parsed(verdict)) => verdict,
            Ok(OracleReply::Unparsed { reason, .. }) => {
                inconclusive(format!("Evaluation could not be parsed: {}", reason))
            }
            Err(e) => {
                warn!(error = %e, "Evaluation call failed");
                inconclusive(format!("Evaluation unavailable: {}", e))
            }
        }
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Transition after an evaluation.
    pub async fn decide_next_step(&mut self) -> NextStep {
        let Some(result) = self.tests.last().map(|t| t.result) else {
            return NextStep::Halt;
        };

        match result {
            TestResult::Pending => NextStep::Test,
            TestResult::Confirmed => {
                self.phase = EnginePhase::Confirmed;
                let tasks = self.plan_deep_dive().await;
                self.plan = tasks.clone();
                NextStep::DeepDive { tasks }
            }
            TestResult::Rejected => self.after_rejection().await,
            TestResult::Inconclusive => self.after_inconclusive().await,
        }
    }

    async fn after_rejection(&mut self) -> NextStep {
        self.phase = EnginePhase::Rejected;
        let attempts = self.tests.len();
        if attempts >= self.config.max_hypothesis_attempts as usize {
            info!(attempts, "Hypothesis budget exhausted, halting");
            return NextStep::Halt;
        }
        self.pivot().await
    }

    async fn after_inconclusive(&mut self) -> NextStep {
        let max_retries = self.config.max_inconclusive_retries;
        let Some(test) = self.tests.last_mut() else {
            return NextStep::Halt;
        };
        test.inconclusive_count += 1;
        let count = test.inconclusive_count;

        if count >= max_retries {
            warn!(count, "Evidence remains inconclusive, treating hypothesis as rejected");
            force_reject(
                test,
                format!(
                    "After {} inconclusive evaluations the evidence still does not decide the hypothesis",
                    count
                ),
            );
            return self.after_rejection().await;
        }

        let Some(commands) = self.request_additional_commands(count).await else {
            if let Some(test) = self.tests.last_mut() {
                force_reject(test, "No further evidence could be planned".to_string());
            }
            return self.after_rejection().await;
        };

        let Some(test) = self.tests.last_mut() else {
            return NextStep::Halt;
        };
        info!(attempt = count, commands = ?commands, "Gathering more evidence");
        test.test_commands = commands;
        test.evidence.clear();
        test.result = TestResult::Pending;
        self.phase = EnginePhase::Testing;
        NextStep::Test
    }

    async fn request_additional_commands(&self, attempt: u32) -> Option<Vec<String>> {
        let test = self.tests.last()?;
        let failed: Vec<&str> = test
            .evidence
            .iter()
            .filter(|e| e.failed)
            .map(|e| e.command.as_str())
            .collect();

        let mut user = format!(
            "HYPOTHESIS: {}\n\nINCONCLUSIVE EVIDENCE:\n{}",
            truncate_chars(&test.hypothesis, MAX_HYPOTHESIS_CHARS),
            brief_evidence(&test.evidence)
        );
        if !failed.is_empty() {
            user.push_str("\n\nFAILED COMMANDS (do not repeat):\n");
            user.push_str(&failed.iter().map(|c| format!("- {}", c)).collect::<Vec<_>>().join("\n"));
        }
        user.push_str(&format!(
            "\n\nAttempt {}/{}",
            attempt, self.config.max_inconclusive_retries
        ));

        let request = OracleRequest::new(
            OracleCall::GatherEvidence,
            system_prompt(OracleCall::GatherEvidence),
            user,
        );
        let reply = self.consult::<AdditionalCommands>(request).await?;
        let commands: Vec<String> = reply
            .additional_commands
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .take(MAX_ADDITIONAL_COMMANDS)
            .collect();
        (!commands.is_empty()).then_some(commands)
    }

    /// Form a different hypothesis after a rejection.
    async fn pivot(&mut self) -> NextStep {
        self.phase = EnginePhase::Forming;
        let Some(rejected) = self.tests.last() else {
            return NextStep::Halt;
        };

        let earlier = self
            .tests
            .iter()
            .map(|t| format!("- {}", t.hypothesis))
            .collect::<Vec<_>>()
            .join("\n");
        let alternatives = if self.alternatives.is_empty() {
            "(none)".to_string()
        } else {
            self.alternatives
                .iter()
                .map(|a| format!("- {}", a))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let user = format!(
            "ISSUE: {}\n\nREJECTED HYPOTHESES:\n{}\n\nLAST REJECTED: {}\nWHY: {}\n\nEVIDENCE THAT REJECTED IT:\n{}\n\nALTERNATIVES TO CONSIDER:\n{}",
            self.issue,
            earlier,
            truncate_chars(&rejected.hypothesis, MAX_HYPOTHESIS_CHARS),
            rejected.evaluation_reasoning,
            brief_evidence(&rejected.evidence),
            alternatives
        );
        let request = OracleRequest::new(OracleCall::FormHypothesis, pivot_system_prompt(), user);

        let proposal = match self.consult::<HypothesisProposal>(request).await {
            Some(p) if !p.hypothesis.trim().is_empty() => p,
            _ => match self.alternatives.first() {
                Some(alternative) => {
                    warn!(alternative = %alternative, "Pivot failed, testing first alternative");
                    HypothesisProposal {
                        hypothesis: alternative.clone(),
                        alternative_hypotheses: self.alternatives[1..].to_vec(),
                        ..default_proposal()
                    }
                }
                None => {
                    warn!("Pivot failed and no alternatives remain, halting");
                    self.phase = EnginePhase::Rejected;
                    return NextStep::Halt;
                }
            },
        };

        self.push_test(proposal);
        NextStep::Test
    }

    // ========================================================================
    // Deep dive
    // ========================================================================

    async fn plan_deep_dive(&self) -> Vec<String> {
        let Some(test) = self.tests.last() else {
            return Vec::new();
        };
        let user = format!(
            "CONFIRMED HYPOTHESIS: {}\n\nEVALUATION: {}\n\nEVIDENCE:\n{}",
            truncate_chars(&test.hypothesis, MAX_HYPOTHESIS_CHARS),
            test.evaluation_reasoning,
            brief_evidence(&test.evidence)
        );
        let request = OracleRequest::new(
            OracleCall::PlanDeepDive,
            system_prompt(OracleCall::PlanDeepDive),
            user,
        );

        let mut tasks: Vec<String> = self
            .consult::<InvestigationPlan>(request)
            .await
            .map(|plan| {
                plan.investigation_plan
                    .into_iter()
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        if tasks.is_empty() {
            warn!("Deep-dive planning failed, using default tasks");
        } else if tasks.len() < MIN_DEEP_DIVE_TASKS {
            debug!(planned = tasks.len(), "Topping up deep-dive plan with default tasks");
        }
        for default in DEFAULT_DEEP_DIVE_TASKS {
            if tasks.len() >= MIN_DEEP_DIVE_TASKS {
                break;
            }
            if !tasks.iter().any(|t| t == default) {
                tasks.push(default.to_string());
            }
        }
        tasks.truncate(self.config.max_deep_dive_tasks);
        info!(tasks = tasks.len(), "Root-cause investigation planned");
        tasks
    }

    /// Run every task and append its evidence to the inventory.
    pub async fn run_deep_dive(&mut self, tasks: &[String]) {
        for task in tasks {
            let commands = self.plan_task(task).await;
            info!(task = %task, commands = ?commands, "Running investigation task");

            let mut gathered: Vec<Evidence> = Vec::with_capacity(commands.len());
            for command in &commands {
                let evidence = match self.resolve_placeholders(command, &gathered).await {
                    Ok(resolved) => self.gather_checked(&resolved).await,
                    Err(unresolved) => unresolved,
                };
                gathered.push(evidence.with_significance(task.clone()));
            }
            self.inventory.entry(task.clone()).or_default().extend(gathered);
        }
    }

    async fn plan_task(&self, task: &str) -> Vec<String> {
        let hypothesis = self
            .tests
            .last()
            .map(|t| t.hypothesis.as_str())
            .unwrap_or_default();
        let recent: Vec<Evidence> = self.inventory.values().flatten().cloned().collect();
        let user = format!(
            "CONFIRMED HYPOTHESIS: {}\nTASK: {}\n\nEVIDENCE SO FAR:\n{}",
            truncate_chars(hypothesis, MAX_HYPOTHESIS_CHARS),
            task,
            brief_evidence(&recent)
        );
        let request =
            OracleRequest::new(OracleCall::PlanTask, system_prompt(OracleCall::PlanTask), user);

        match self.consult::<TaskCommands>(request).await {
            Some(reply) => reply
                .commands
                .into_iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .take(MAX_TASK_COMMANDS)
                .collect(),
            None => {
                warn!(task = %task, "No commands planned for task");
                Vec::new()
            }
        }
    }

    /// Parsed reply, or `None` on transport or parse failure.
    async fn consult<T: serde::de::DeserializeOwned>(&self, request: OracleRequest) -> Option<T> {
        let call = request.call;
        match consult::<T>(self.oracle.as_ref(), request).await {
            Ok(reply) => reply.parsed(),
            Err(e) => {
                warn!(call = %call, error = %e, "Oracle call failed");
                None
            }
        }
    }
}

fn default_proposal() -> HypothesisProposal {
    HypothesisProposal {
        hypothesis: DEFAULT_HYPOTHESIS.to_string(),
        confidence: ConfidenceLevel::Low,
        reasoning: "Default starting point for a hang or slowdown".to_string(),
        test_commands: DEFAULT_TEST_COMMANDS.iter().map(|c| c.to_string()).collect(),
        expected_confirmed: "Threads waiting on a sync block owned by another thread".to_string(),
        expected_rejected: "No sync blocks with waiting threads".to_string(),
        alternative_hypotheses: Vec::new(),
    }
}

fn inconclusive(reasoning: impl Into<String>) -> EvaluationVerdict {
    EvaluationVerdict {
        result: Verdict::Inconclusive,
        reasoning: reasoning.into(),
        key_findings: Vec::new(),
    }
}

fn force_reject(test: &mut HypothesisTest, reasoning: String) {
    test.result = TestResult::Rejected;
    test.evaluation_reasoning = reasoning;
}

#[cfg(test)]
#[path = "hypothesis_tests.rs"]
mod hypothesis_tests;
