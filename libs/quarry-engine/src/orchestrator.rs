/// Retry-Driven Orchestrator
///
/// **Responsibility:**
/// Drive the two sequential phases of a request, each in a bounded retry
/// loop that repairs failed generated code by feeding the captured error
/// back into synthesis.
///
/// **Phase 1 - Acquisition:**
/// - status `1` → proceed with the normalized questions
/// - status `0` → counted retry, prompt = question + previous error
/// - any other status, synthesis transport failure, executor failure → abort
/// - malformed synthesis output counts as a status `0`
///
/// **Phase 2 - Answer:**
/// - same transitions as Phase 1, but prompts are built from the normalized
///   questions
/// - an executor failure on the very first attempt triggers exactly one
///   resynthesis asking for the JSON structure
/// - executor failures and malformed synthesis inside the loop are
///   structural retries: they do not touch `logged_failures` and have their
///   own cap
///
/// Counters only ever increase. The report is advisory; the resolver
/// decides the response from `result.json`.

use crate::engine::SandboxExecutor;
use crate::synthesis::{CodeSynthesizer, SynthesisError};
use quarry_common::types::{ExecutionOutcome, ExecutionStatus, Phase};
use quarry_common::workspace::RequestContext;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

pub const FOLLOW_JSON_STRUCTURE: &str = " Please follow the JSON structure.";
pub const FOLLOW_CODE_STRUCTURE: &str = " Follow the structure {'code': '', 'libraries': ''}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Status `0` outcomes tolerated per phase before aborting
    pub max_logged_failures: u32,
    /// Phase 2 structural retries tolerated before aborting
    pub max_structural_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_logged_failures: 3,
            max_structural_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseStats {
    pub synthesis_calls: u32,
    pub executions: u32,
    pub logged_failures: u32,
    pub structural_retries: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    RetriesExhausted,
    TerminalStatus { code: i64 },
    StructuralLimit,
    SynthesisFailed { message: String },
    ExecutorFailed { message: String },
}

impl AbortReason {
    pub fn label(&self) -> &'static str {
        match self {
            AbortReason::RetriesExhausted => "retries_exhausted",
            AbortReason::TerminalStatus { .. } => "terminal_status",
            AbortReason::StructuralLimit => "structural_limit",
            AbortReason::SynthesisFailed { .. } => "synthesis_failed",
            AbortReason::ExecutorFailed { .. } => "executor_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineStatus {
    Success,
    Aborted { phase: Phase, reason: AbortReason },
}

impl PipelineStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineStatus::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub status: PipelineStatus,
    pub acquisition: PhaseStats,
    pub answer: PhaseStats,
}

/// Result of one answer-phase synthesize+execute attempt
enum AnswerAttempt {
    Executed(ExecutionOutcome),
    Structural(String),
}

pub fn annotate_with_error(text: &str, output: &str) -> String {
    format!("{}\nPrevious error: {}", text, output)
}

pub struct Orchestrator {
    synthesizer: Arc<dyn CodeSynthesizer>,
    executor: Arc<dyn SandboxExecutor>,
    policy: RetryPolicy,
}

impl Orchestrator {
    pub fn new(
        synthesizer: Arc<dyn CodeSynthesizer>,
        executor: Arc<dyn SandboxExecutor>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            synthesizer,
            executor,
            policy,
        }
    }

    /// Run acquisition then answer computation for one staged request
    #[instrument(skip_all, fields(request_id = %ctx.id, executor = self.executor.name()))]
    pub async fn run(&self, ctx: &RequestContext) -> PipelineReport {
        let mut acquisition = PhaseStats::default();
        let mut answer = PhaseStats::default();

        let status = match self.acquire(ctx, &mut acquisition).await {
            Err(reason) => PipelineStatus::Aborted {
                phase: Phase::Acquisition,
                reason,
            },
            Ok(questions) => match self.answer(ctx, &questions, &mut answer).await {
                Ok(()) => PipelineStatus::Success,
                Err(reason) => PipelineStatus::Aborted {
                    phase: Phase::Answer,
                    reason,
                },
            },
        };

        match &status {
            PipelineStatus::Success => info!(
                acquisition_attempts = acquisition.executions,
                answer_attempts = answer.executions,
                "Pipeline succeeded"
            ),
            PipelineStatus::Aborted { phase, reason } => warn!(
                phase = %phase,
                reason = reason.label(),
                "Pipeline aborted"
            ),
        }

        PipelineReport {
            status,
            acquisition,
            answer,
        }
    }

    /// Phase 1: returns the normalized questions of the successful synthesis
    async fn acquire(
        &self,
        ctx: &RequestContext,
        stats: &mut PhaseStats,
    ) -> Result<String, AbortReason> {
        let phase = Phase::Acquisition;
        let mut prompt = ctx.question.clone();

        loop {
            stats.synthesis_calls += 1;
            let synthesis = match self
                .synthesizer
                .synthesize(&prompt, &ctx.staged, &ctx.workspace)
                .await
            {
                Ok(synthesis) => synthesis,
                Err(SynthesisError::Malformed(message)) => {
                    self.record_failure(phase, stats, &message)?;
                    prompt = annotate_with_error(&ctx.question, &message);
                    continue;
                }
                Err(e @ SynthesisError::Transport(_)) => {
                    error!(phase = %phase, error = %e, "Synthesis failed");
                    return Err(AbortReason::SynthesisFailed {
                        message: e.to_string(),
                    });
                }
            };

            stats.executions += 1;
            let outcome = self
                .executor
                .execute(&synthesis.code, &synthesis.libraries, &ctx.workspace)
                .await
                .map_err(|e| {
                    error!(phase = %phase, error = %format!("{:#}", e), "Sandbox failed");
                    AbortReason::ExecutorFailed {
                        message: format!("{:#}", e),
                    }
                })?;

            info!(
                phase = %phase,
                attempt = stats.executions,
                status = %outcome.code,
                "Execution finished"
            );

            match outcome.code {
                ExecutionStatus::Success => {
                    let questions = if synthesis.questions.trim().is_empty() {
                        ctx.question.clone()
                    } else {
                        synthesis.questions
                    };
                    return Ok(questions);
                }
                ExecutionStatus::Recoverable => {
                    self.record_failure(phase, stats, &outcome.output)?;
                    prompt = annotate_with_error(&ctx.question, &outcome.output);
                }
                ExecutionStatus::Terminal(code) => {
                    stats.last_error = Some(outcome.output);
                    return Err(AbortReason::TerminalStatus { code });
                }
            }
        }
    }

    /// Phase 2: succeeds once an execution reports status `1`
    async fn answer(
        &self,
        ctx: &RequestContext,
        questions: &str,
        stats: &mut PhaseStats,
    ) -> Result<(), AbortReason> {
        let phase = Phase::Answer;

        let mut attempt = self.answer_attempt(ctx, questions, stats).await?;
        if let AnswerAttempt::Structural(message) = &attempt {
            stats.structural_retries += 1;
            warn!(phase = %phase, error = %message, "First answer attempt was structurally broken, resynthesizing");
            stats.last_error = Some(message.clone());
            let prompt = format!("{}{}", questions, FOLLOW_JSON_STRUCTURE);
            attempt = self.answer_attempt(ctx, &prompt, stats).await?;
        }

        loop {
            let prompt = match attempt {
                AnswerAttempt::Executed(outcome) => {
                    info!(
                        phase = %phase,
                        attempt = stats.executions,
                        status = %outcome.code,
                        "Execution finished"
                    );
                    match outcome.code {
                        ExecutionStatus::Success => return Ok(()),
                        ExecutionStatus::Terminal(code) => {
                            stats.last_error = Some(outcome.output);
                            return Err(AbortReason::TerminalStatus { code });
                        }
                        ExecutionStatus::Recoverable => {
                            self.record_failure(phase, stats, &outcome.output)?;
                            annotate_with_error(questions, &outcome.output)
                        }
                    }
                }
                AnswerAttempt::Structural(message) => {
                    stats.last_error = Some(message.clone());
                    if stats.structural_retries >= self.policy.max_structural_retries {
                        warn!(phase = %phase, retries = stats.structural_retries, "Structural retry limit reached");
                        return Err(AbortReason::StructuralLimit);
                    }
                    stats.structural_retries += 1;
                    warn!(
                        phase = %phase,
                        structural_retries = stats.structural_retries,
                        error = %message,
                        "Structural failure, retrying without consuming budget"
                    );
                    format!("{}{}", annotate_with_error(questions, &message), FOLLOW_CODE_STRUCTURE)
                }
            };

            attempt = self.answer_attempt(ctx, &prompt, stats).await?;
        }
    }

    async fn answer_attempt(
        &self,
        ctx: &RequestContext,
        prompt: &str,
        stats: &mut PhaseStats,
    ) -> Result<AnswerAttempt, AbortReason> {
        stats.synthesis_calls += 1;
        let synthesis = match self
            .synthesizer
            .synthesize_answer(prompt, &ctx.workspace)
            .await
        {
            Ok(synthesis) => synthesis,
            Err(SynthesisError::Malformed(message)) => {
                return Ok(AnswerAttempt::Structural(message));
            }
            Err(e @ SynthesisError::Transport(_)) => {
                error!(phase = %Phase::Answer, error = %e, "Synthesis failed");
                return Err(AbortReason::SynthesisFailed {
                    message: e.to_string(),
                });
            }
        };

        stats.executions += 1;
        match self
            .executor
            .execute(&synthesis.code, &synthesis.libraries, &ctx.workspace)
            .await
        {
            Ok(outcome) => Ok(AnswerAttempt::Executed(outcome)),
            Err(e) => Ok(AnswerAttempt::Structural(format!("{:#}", e))),
        }
    }

    /// Count a status `0` failure, aborting once the budget is spent
    fn record_failure(
        &self,
        phase: Phase,
        stats: &mut PhaseStats,
        output: &str,
    ) -> Result<(), AbortReason> {
        stats.last_error = Some(output.to_string());
        if stats.logged_failures >= self.policy.max_logged_failures {
            warn!(phase = %phase, failures = stats.logged_failures, "Retry budget exhausted");
            return Err(AbortReason::RetriesExhausted);
        }
        stats.logged_failures += 1;
        warn!(
            phase = %phase,
            retry = stats.logged_failures,
            max_retries = self.policy.max_logged_failures,
            "Recoverable failure, resynthesizing with error context"
        );
        Ok(())
    }
}
