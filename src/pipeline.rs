//! One request, start to finish.
//!
//! ```text
//! rate limit ─► input moderation ─► retrieval ─► generation ─► output moderation ─► answered
//!     │                 │                                              │
//! rate_limited      blocked_pre                                   blocked_post
//! ```
//!
//! Each gate short-circuits. Retrieval and generation never fail the
//! request; they degrade to empty context and to the fallback chain. The
//! only error is [`PipelineError::Cancelled`], checked before every stage.
//! Every outcome, including cancellation, is written to the audit sink;
//! audit failures are logged and otherwise ignored.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::audit::{AuditAction, AuditRecord, AuditSink};
use crate::backend::{Embedder, Generator};
use crate::cancel::{CancellationFlag, Cancelled};
use crate::config::Config;
use crate::index_store::IndexHandle;
use crate::moderation::{ModerationDecision, ModerationGate};
use crate::orchestrator::{GenerationOrchestrator, GenerationPath};
use crate::rate_limit::{Clock, RateLimiter};
use crate::response::NestedTextAdapter;
use crate::retriever::Retriever;

pub const INPUT_REFUSAL: &str = "Sorry, I can't help with this request.";
pub const OUTPUT_REFUSAL: &str = "Sorry, I can't provide this answer for safety reasons.";

const RAW_ANSWER_AUDIT_CHARS: usize = 400;

#[derive(Debug, Clone)]
pub struct AnswerRequest {
    pub identity: String,
    pub query: String,
}

impl AnswerRequest {
    pub fn new(identity: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            query: query.into(),
        }
    }
}

/// Wall time per stage in milliseconds. Stages that did not run stay 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageTimings {
    pub rate_limit: u64,
    pub moderation_pre: u64,
    pub retrieval: u64,
    pub generation: u64,
    pub moderation_post: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    RateLimited,
    UnsafeInput,
    UnsafeOutput,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub answer: String,
    pub blocked: bool,
    pub block_reason: Option<BlockReason>,
    pub retrieved_count: usize,
    pub used_fallback: bool,
    pub generation_path: Option<GenerationPath>,
    /// Set when rate limited.
    pub wait_seconds: Option<u64>,
    pub moderation_input: Option<ModerationDecision>,
    pub moderation_output: Option<ModerationDecision>,
    pub timings: StageTimings,
}

impl PipelineResult {
    fn blocked(answer: String, reason: BlockReason) -> Self {
        Self {
            answer,
            blocked: true,
            block_reason: Some(reason),
            retrieved_count: 0,
            used_fallback: false,
            generation_path: None,
            wait_seconds: None,
            moderation_input: None,
            moderation_output: None,
            timings: StageTimings::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("request cancelled")]
    Cancelled,
}

impl From<Cancelled> for PipelineError {
    fn from(_: Cancelled) -> Self {
        PipelineError::Cancelled
    }
}

/// Pre-built stages for [`AnswerPipeline::new`].
pub struct PipelineParts {
    pub limiter: RateLimiter,
    pub moderation: ModerationGate,
    pub retriever: Retriever,
    pub orchestrator: GenerationOrchestrator,
    pub audit: Arc<dyn AuditSink>,
    pub top_k: usize,
}

pub struct AnswerPipeline {
    limiter: RateLimiter,
    moderation: ModerationGate,
    retriever: Retriever,
    orchestrator: GenerationOrchestrator,
    audit: Arc<dyn AuditSink>,
    top_k: usize,
}

impl AnswerPipeline {
    pub fn new(parts: PipelineParts) -> Self {
        Self {
            limiter: parts.limiter,
            moderation: parts.moderation,
            retriever: parts.retriever,
            orchestrator: parts.orchestrator,
            audit: parts.audit,
            top_k: parts.top_k.max(1),
        }
    }

    /// Wire every stage from configuration and the given collaborators.
    pub fn from_config(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        index: Arc<IndexHandle>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let adapter = Arc::new(NestedTextAdapter::default());
        Ok(Self::new(PipelineParts {
            limiter: RateLimiter::new(&config.rate_limit, clock),
            moderation: ModerationGate::new(&config.moderation, generator.clone(), adapter.clone())?,
            retriever: Retriever::new(
                embedder,
                index,
                &config.retrieval,
                Duration::from_secs(config.embedding.timeout_secs),
            ),
            orchestrator: GenerationOrchestrator::new(generator, adapter, &config.generation)?,
            audit,
            top_k: config.retrieval.top_k,
        }))
    }

    pub async fn answer(
        &self,
        request: &AnswerRequest,
        cancel: &CancellationFlag,
    ) -> Result<PipelineResult, PipelineError> {
        let started = Instant::now();
        let mut timings = StageTimings::default();

        // 1. Rate limit
        self.checkpoint(request, cancel, "rate_limit").await?;
        let t = Instant::now();
        let rate = self.limiter.is_allowed(&request.identity);
        timings.rate_limit = elapsed_ms(t);
        if !rate.allowed {
            info!(identity = %request.identity, wait = rate.wait_seconds, "request rate limited");
            self.record(
                request,
                AuditAction::RateLimited,
                json!({ "reason": rate.reason, "wait_seconds": rate.wait_seconds }),
            )
            .await;
            let mut result = PipelineResult::blocked(
                format!("Too many requests. Please retry in {} s.", rate.wait_seconds.max(1)),
                BlockReason::RateLimited,
            );
            result.wait_seconds = Some(rate.wait_seconds);
            timings.total = elapsed_ms(started);
            result.timings = timings;
            return Ok(result);
        }

        // 2. Input moderation
        self.checkpoint(request, cancel, "moderation_pre").await?;
        let t = Instant::now();
        let input_decision = self.moderation.moderate(&request.query, true).await;
        timings.moderation_pre = elapsed_ms(t);
        if !input_decision.safe {
            info!(identity = %request.identity, reason = %input_decision.reason, "query blocked");
            self.record(
                request,
                AuditAction::BlockedPre,
                json!({ "moderation": input_decision }),
            )
            .await;
            let mut result =
                PipelineResult::blocked(INPUT_REFUSAL.to_string(), BlockReason::UnsafeInput);
            result.moderation_input = Some(input_decision);
            timings.total = elapsed_ms(started);
            result.timings = timings;
            return Ok(result);
        }

        // 3. Retrieval
        self.checkpoint(request, cancel, "retrieval").await?;
        let t = Instant::now();
        let context = self.retriever.retrieve(&request.query, self.top_k).await;
        timings.retrieval = elapsed_ms(t);
        let retrieved_ids: Vec<&str> = context.hits.iter().map(|h| h.chunk.id.as_str()).collect();
        let retrieved_sources: Vec<&str> = context
            .hits
            .iter()
            .map(|h| h.chunk.source_key.as_str())
            .collect();

        // 4. Generation
        self.checkpoint(request, cancel, "generation").await?;
        let t = Instant::now();
        let outcome = match self.orchestrator.generate(&request.query, &context, cancel).await {
            Ok(outcome) => outcome,
            Err(Cancelled) => {
                self.record_cancelled(request, "generation").await;
                return Err(PipelineError::Cancelled);
            }
        };
        timings.generation = elapsed_ms(t);

        // 5. Output moderation
        self.checkpoint(request, cancel, "moderation_post").await?;
        let t = Instant::now();
        let output_decision = self.moderation.moderate(&outcome.answer, false).await;
        timings.moderation_post = elapsed_ms(t);
        timings.total = elapsed_ms(started);

        let needs_review = input_decision.needs_review() || output_decision.needs_review();
        if needs_review {
            warn!(identity = %request.identity, "moderation fell back to policy, flagged for review");
        }

        let mut result = PipelineResult {
            answer: outcome.answer.clone(),
            blocked: false,
            block_reason: None,
            retrieved_count: context.len(),
            used_fallback: outcome.used_fallback,
            generation_path: Some(outcome.path),
            wait_seconds: None,
            moderation_input: Some(input_decision.clone()),
            moderation_output: Some(output_decision.clone()),
            timings,
        };

        if !output_decision.safe {
            info!(identity = %request.identity, reason = %output_decision.reason, "answer blocked");
            let raw: String = outcome.answer.chars().take(RAW_ANSWER_AUDIT_CHARS).collect();
            self.record(
                request,
                AuditAction::BlockedPost,
                json!({
                    "raw_answer": raw,
                    "retrieved_ids": retrieved_ids,
                    "generation_path": outcome.path,
                    "moderation_input": input_decision,
                    "moderation_output": output_decision,
                    "needs_review": needs_review,
                }),
            )
            .await;
            result.answer = OUTPUT_REFUSAL.to_string();
            result.blocked = true;
            result.block_reason = Some(BlockReason::UnsafeOutput);
            return Ok(result);
        }

        // 6. Answered
        debug!(
            identity = %request.identity,
            retrieved = result.retrieved_count,
            path = ?outcome.path,
            total_ms = timings.total,
            "request answered"
        );
        self.record(
            request,
            AuditAction::Answered,
            json!({
                "retrieved_count": result.retrieved_count,
                "retrieved_ids": retrieved_ids,
                "retrieved_sources": retrieved_sources,
                "used_fallback": outcome.used_fallback,
                "generation_path": outcome.path,
                "attempts": outcome.attempts,
                "moderation_input": input_decision,
                "moderation_output": output_decision,
                "needs_review": needs_review,
                "timings": timings,
            }),
        )
        .await;
        Ok(result)
    }

    async fn checkpoint(
        &self,
        request: &AnswerRequest,
        cancel: &CancellationFlag,
        stage: &str,
    ) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            self.record_cancelled(request, stage).await;
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    async fn record_cancelled(&self, request: &AnswerRequest, stage: &str) {
        debug!(identity = %request.identity, stage, "request cancelled");
        self.record(request, AuditAction::Cancelled, json!({ "stage": stage }))
            .await;
    }

    async fn record(&self, request: &AnswerRequest, action: AuditAction, meta: Value) {
        let record = AuditRecord::new(&request.identity, action, &request.query, meta);
        if let Err(e) = self.audit.record(&record).await {
            warn!(error = %e, ?action, "failed to write audit record");
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
