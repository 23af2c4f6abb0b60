use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use waypoint_core::config::ExecutionConfig;
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::types::{
    ChatMessage, ModelCall, ModelCallRequest, ModelCallResponse, SnapshotId, ToolCall,
    ToolCallAttempt, ToolCallStatus, ToolContext, ToolResult, WorkflowEvent,
};

use crate::completion::{CompletionOutcome, StepCompletionChain};
use crate::context::AgentContext;
use crate::execution::{is_final_answer, StepExecution};
use crate::retry;
use crate::step::Step;

/// Runs one activation of a step: model round, tool dispatch, repeat.
///
/// Every model call and every tool attempt is bracketed by a memory
/// snapshot. A failed attempt rolls the conversation back before retrying,
/// so retries always see the same history as the first try.
///
/// `execute` never returns an error. Anything that goes wrong finalizes
/// the returned [`StepExecution`] as FAILED.
pub struct StepExecutor {
    step: Arc<dyn Step>,
    ctx: AgentContext,
    config: ExecutionConfig,
    completion_chain: StepCompletionChain,
}

impl StepExecutor {
    /// Limits come from the run config with the step's own metadata layered
    /// on top.
    pub fn new(step: Arc<dyn Step>, ctx: AgentContext) -> Self {
        let config = match step.metadata() {
            Some(meta) => ctx.config.clone().merge_metadata(meta),
            None => ctx.config.clone(),
        };
        Self {
            step,
            ctx,
            config,
            completion_chain: StepCompletionChain::default(),
        }
    }

    pub fn with_completion_chain(mut self, chain: StepCompletionChain) -> Self {
        self.completion_chain = chain;
        self
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Run on the tokio pool.
    pub fn spawn(self) -> JoinHandle<StepExecution> {
        tokio::spawn(async move { self.execute().await })
    }

    pub async fn execute(&self) -> StepExecution {
        let mut execution = StepExecution::new(self.step.clone());
        info!(
            step = %self.step.id(),
            max_model_calls = self.config.max_model_calls_per_step,
            sequential = self.config.sequential_tool_calls,
            "Executing step"
        );

        if let Err(e) = self.run_loop(&mut execution).await {
            error!(step = %self.step.id(), error = %e, "Step execution failed");
            execution.fail(e.to_string());
        }

        info!(
            step = %self.step.id(),
            status = %execution.status(),
            model_calls = execution.model_calls().len(),
            tool_calls = execution.tool_calls().len(),
            "Step finished"
        );
        self.ctx.publish(WorkflowEvent::StepFinished {
            step_id: self.step.id().to_string(),
            status: execution.status(),
            model_calls: execution.model_calls().len(),
            tool_calls: execution.tool_calls().len(),
        });
        execution
    }

    async fn run_loop(&self, execution: &mut StepExecution) -> Result<()> {
        let max_calls = self.config.max_model_calls_per_step;
        let conversation = &self.ctx.conversation_id;

        loop {
            if !execution.requires_more_calls(max_calls) {
                if execution.is_complete() {
                    execution.complete();
                } else {
                    execution.fail(
                        WaypointError::BudgetExhausted {
                            step: self.step.id().to_string(),
                            max_calls,
                        }
                        .to_string(),
                    );
                }
                return Ok(());
            }
            if self.ctx.is_cancelled() {
                return Err(WaypointError::Cancelled);
            }

            let request = self.build_request().await?;
            let mut call = ModelCall::new(request.clone());
            let response = match self.call_model(request).await {
                Ok((response, attempts)) => {
                    call.complete(response.clone(), attempts);
                    response
                }
                Err(e) => {
                    let attempts = match &e {
                        WaypointError::ModelCallFailed { attempts, .. } => *attempts,
                        _ => 1,
                    };
                    call.fail(e.to_string(), attempts);
                    execution.push_model_call(call);
                    return Err(e);
                }
            };
            execution.push_model_call(call);
            let call_index = execution.model_calls().len();

            self.ctx
                .memory
                .save_all(conversation, vec![response.assistant_message()])
                .await?;

            let dispatched = self.dispatch_tool_calls(response.tool_calls.clone()).await?;
            if !dispatched.is_empty() {
                self.ctx
                    .memory
                    .save_all(conversation, vec![ChatMessage::tool_results(&dispatched)])
                    .await?;
            }
            let tool_count = dispatched.len();
            execution.extend_tool_calls(dispatched);
            if let Some(instruction) = response.completion {
                execution.set_completion_result(instruction);
            }

            self.ctx.publish(WorkflowEvent::ModelCallFinished {
                step_id: self.step.id().to_string(),
                call_index,
                tool_calls: tool_count,
            });

            if let Some(verdict) = self.completion_chain.evaluate(execution, max_calls) {
                debug!(
                    step = %self.step.id(),
                    predicate = %verdict.predicate,
                    "Completion predicate fired"
                );
                match verdict.outcome {
                    CompletionOutcome::Complete => {
                        execution.complete();
                    }
                    CompletionOutcome::Fail(reason) => {
                        warn!(step = %self.step.id(), reason = %reason, "Step failed");
                        execution.fail(reason);
                    }
                    CompletionOutcome::Skip => {
                        info!(step = %self.step.id(), "Model skipped step");
                        execution.skip();
                    }
                }
                return Ok(());
            }
        }
    }

    async fn build_request(&self) -> Result<ModelCallRequest> {
        let mut messages = self
            .ctx
            .memory
            .prompt_messages(&self.ctx.conversation_id)
            .await?;
        messages.extend(self.step.prompt_messages());
        Ok(ModelCallRequest {
            messages,
            metadata: self.step.metadata().cloned().unwrap_or_default(),
            tools: self.step.available_tools().to_vec(),
        })
    }

    /// Call the model, retrying transient failures. Returns the response and
    /// the number of attempts it took.
    async fn call_model(&self, request: ModelCallRequest) -> Result<(ModelCallResponse, u32)> {
        let conversation = &self.ctx.conversation_id;
        let max_attempts = self.config.max_model_call_retries.saturating_add(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let snapshot = retry::guarded(
                &self.ctx.cancel,
                std::time::Duration::ZERO,
                "memory snapshot",
                self.ctx.memory.take_snapshot(conversation),
            )
            .await?;

            let outcome = retry::guarded(
                &self.ctx.cancel,
                self.config.model_call_timeout(),
                "model call",
                self.ctx.model.execute(request.clone()),
            )
            .await;

            match outcome {
                Ok(response) => {
                    self.release(snapshot).await;
                    return Ok((response, attempt));
                }
                Err(e) => {
                    self.ctx.memory.restore_snapshot(conversation, snapshot).await?;
                    self.release(snapshot).await;
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        warn!(
                            step = %self.step.id(),
                            attempt,
                            error = %e,
                            "Model call failed, retrying"
                        );
                        self.ctx.publish(WorkflowEvent::ModelCallRetry {
                            step_id: self.step.id().to_string(),
                            attempt,
                            error: last_error.clone(),
                        });
                        retry::sleep_or_cancel(
                            &self.ctx.cancel,
                            retry::calculate_backoff(attempt, self.config.retry_backoff_ms),
                        )
                        .await?;
                    }
                }
            }
        }

        Err(WaypointError::ModelCallFailed {
            step: self.step.id().to_string(),
            attempts: max_attempts,
            message: last_error,
        })
    }

    /// Dispatch a round's tool calls. Results come back in request order.
    async fn dispatch_tool_calls(&self, calls: Vec<ToolCall>) -> Result<Vec<ToolCall>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        if self.config.sequential_tool_calls {
            let mut done = Vec::with_capacity(calls.len());
            for call in calls {
                done.push(self.run_tool_call(call, None).await?);
            }
            return Ok(done);
        }

        // Concurrent attempts share one snapshot taken before the fan-out,
        // so every rollback lands on the same history.
        let conversation = &self.ctx.conversation_id;
        let base = retry::guarded(
            &self.ctx.cancel,
            std::time::Duration::ZERO,
            "memory snapshot",
            self.ctx.memory.take_snapshot(conversation),
        )
        .await?;
        let futs = calls
            .into_iter()
            .map(|call| self.run_tool_call(call, Some(base)));
        let results = futures::future::join_all(futs).await;
        self.release(base).await;
        results.into_iter().collect()
    }

    /// Drive one logical tool call to a final status.
    ///
    /// Tool failures are recorded on the call, not returned. Only
    /// cancellation and memory errors escape.
    async fn run_tool_call(&self, mut call: ToolCall, base: Option<SnapshotId>) -> Result<ToolCall> {
        let conversation = &self.ctx.conversation_id;
        let step_id = self.step.id();
        self.ctx.publish(WorkflowEvent::ToolStart {
            step_id: step_id.to_string(),
            name: call.name.clone(),
        });

        if is_final_answer(&call.name) {
            let now = Utc::now();
            call.record_attempt(ToolCallAttempt {
                number: 1,
                status: ToolCallStatus::Completed,
                started_at: now,
                finished_at: now,
                error: None,
            });
            call.complete(ToolResult::success(final_answer_text(&call.input)));
            return Ok(self.finish_tool(call));
        }

        if !self.step.available_tools().iter().any(|t| t == &call.name) {
            let reason = format!("tool '{}' is not available in step '{}'", call.name, step_id);
            warn!(step = %step_id, tool = %call.name, "Model requested a tool outside the step's tool set");
            call.fail(reason);
            return Ok(self.finish_tool(call));
        }

        let max_attempts = self.config.max_tool_call_retries.saturating_add(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            let snapshot = match base {
                Some(id) => id,
                None => {
                    retry::guarded(
                        &self.ctx.cancel,
                        std::time::Duration::ZERO,
                        "memory snapshot",
                        self.ctx.memory.take_snapshot(conversation),
                    )
                    .await?
                }
            };

            let started_at = Utc::now();
            let tool_ctx = ToolContext {
                conversation_id: conversation.clone(),
                step_id: step_id.to_string(),
                attempt,
            };
            let what = format!("tool {}", call.name);
            let outcome = retry::guarded(
                &self.ctx.cancel,
                self.config.tool_call_timeout(),
                &what,
                self.ctx.tools.execute(&call, tool_ctx),
            )
            .await;
            let finished_at = Utc::now();

            let (error, retryable) = match outcome {
                Ok(result) if !result.is_error => {
                    call.record_attempt(ToolCallAttempt {
                        number: attempt,
                        status: ToolCallStatus::Completed,
                        started_at,
                        finished_at,
                        error: None,
                    });
                    if base.is_none() {
                        self.release(snapshot).await;
                    }
                    call.complete(result);
                    return Ok(self.finish_tool(call));
                }
                Ok(result) => (result.content, true),
                Err(WaypointError::Cancelled) => {
                    self.ctx.memory.restore_snapshot(conversation, snapshot).await?;
                    if base.is_none() {
                        self.release(snapshot).await;
                    }
                    return Err(WaypointError::Cancelled);
                }
                Err(e) => (e.to_string(), e.is_retryable()),
            };

            self.ctx.memory.restore_snapshot(conversation, snapshot).await?;
            if base.is_none() {
                self.release(snapshot).await;
            }
            call.record_attempt(ToolCallAttempt {
                number: attempt,
                status: ToolCallStatus::Failed,
                started_at,
                finished_at,
                error: Some(error.clone()),
            });
            last_error = error;

            if !retryable || attempt == max_attempts {
                break;
            }
            warn!(
                step = %step_id,
                tool = %call.name,
                attempt,
                error = %last_error,
                "Tool call failed, retrying"
            );
            self.ctx.publish(WorkflowEvent::ToolRetry {
                step_id: step_id.to_string(),
                name: call.name.clone(),
                attempt,
                error: last_error.clone(),
            });
            retry::sleep_or_cancel(
                &self.ctx.cancel,
                retry::calculate_backoff(attempt, self.config.retry_backoff_ms),
            )
            .await?;
        }

        error!(
            step = %step_id,
            tool = %call.name,
            attempts = call.attempts.len(),
            error = %last_error,
            "Tool call failed"
        );
        call.fail(last_error);
        Ok(self.finish_tool(call))
    }

    fn finish_tool(&self, call: ToolCall) -> ToolCall {
        self.ctx.publish(WorkflowEvent::ToolEnd {
            step_id: self.step.id().to_string(),
            name: call.name.clone(),
            status: call.status,
        });
        call
    }

    async fn release(&self, snapshot: SnapshotId) {
        if let Err(e) = self
            .ctx
            .memory
            .release_snapshot(&self.ctx.conversation_id, snapshot)
            .await
        {
            debug!(%snapshot, error = %e, "Failed to release memory snapshot");
        }
    }
}

fn final_answer_text(input: &serde_json::Value) -> String {
    match input.get("answer") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => match input {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    }
}
