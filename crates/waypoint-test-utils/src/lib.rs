//! Test doubles for the collaborator traits in `waypoint-core`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::{ModelCallExecutor, ModelMemory, ToolCallExecutor};
use waypoint_core::types::{
    ChatMessage, ConversationId, ModelCallRequest, ModelCallResponse, SnapshotId, ToolCall,
    ToolContext, ToolResult,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Model that replays a fixed list of responses.
///
/// Optional leading errors are returned before the first response. Once the
/// script runs out it repeats the `repeating` response, or errors.
pub struct ScriptedModel {
    script: Mutex<VecDeque<ModelCallResponse>>,
    repeat: Option<ModelCallResponse>,
    leading_errors: AtomicUsize,
    delay: Option<Duration>,
    requests: Mutex<Vec<ModelCallRequest>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<ModelCallResponse>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            repeat: None,
            leading_errors: AtomicUsize::new(0),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call with the same response.
    pub fn repeating(response: ModelCallResponse) -> Self {
        let mut model = Self::new(Vec::new());
        model.repeat = Some(response);
        model
    }

    pub fn with_leading_errors(self, n: usize) -> Self {
        self.leading_errors.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every request received, failed attempts included.
    pub fn requests(&self) -> Vec<ModelCallRequest> {
        lock(&self.requests).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }

    fn next_response(&self) -> Result<ModelCallResponse> {
        let failing = self
            .leading_errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(WaypointError::ModelRequest("503 scripted failure".into()));
        }
        if let Some(next) = lock(&self.script).pop_front() {
            return Ok(next);
        }
        self.repeat
            .clone()
            .ok_or_else(|| WaypointError::ModelRequest("model script exhausted".into()))
    }
}

impl ModelCallExecutor for ScriptedModel {
    fn execute(&self, request: ModelCallRequest) -> BoxFuture<'_, Result<ModelCallResponse>> {
        Box::pin(async move {
            lock(&self.requests).push(request);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.next_response()
        })
    }
}

type ModelFn = dyn Fn(&ModelCallRequest, usize) -> Result<ModelCallResponse> + Send + Sync;

/// Model backed by a closure of (request, zero-based call index).
pub struct FnModel {
    f: Box<ModelFn>,
    calls: AtomicUsize,
}

impl FnModel {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&ModelCallRequest, usize) -> Result<ModelCallResponse> + Send + Sync + 'static,
    {
        Self {
            f: Box::new(f),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ModelCallExecutor for FnModel {
    fn execute(&self, request: ModelCallRequest) -> BoxFuture<'_, Result<ModelCallResponse>> {
        Box::pin(async move {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.f)(&request, index)
        })
    }
}

#[derive(Debug, Clone)]
enum Behavior {
    Output(String),
    Fail(String),
    FailTimes { remaining: usize, output: String },
    Delay { delay: Duration, output: String },
}

/// One tool invocation as seen by [`RecordingTools`].
#[derive(Debug, Clone)]
pub struct Invocation {
    pub name: String,
    pub step_id: String,
    pub attempt: u32,
    pub started: Instant,
    pub finished: Instant,
}

impl Invocation {
    pub fn overlaps(&self, other: &Invocation) -> bool {
        self.started < other.finished && other.started < self.finished
    }
}

/// Tool executor with per-tool scripted behavior that records every call.
///
/// Unknown tools fail with [`WaypointError::ToolNotFound`].
#[derive(Default)]
pub struct RecordingTools {
    behaviors: Mutex<HashMap<String, Behavior>>,
    invocations: Mutex<Vec<Invocation>>,
}

impl RecordingTools {
    pub fn new() -> Self {
        Self::default()
    }

    fn with(self, name: impl Into<String>, behavior: Behavior) -> Self {
        lock(&self.behaviors).insert(name.into(), behavior);
        self
    }

    pub fn with_output(self, name: impl Into<String>, output: impl Into<String>) -> Self {
        self.with(name, Behavior::Output(output.into()))
    }

    /// Every attempt returns an error result.
    pub fn with_failure(self, name: impl Into<String>, error: impl Into<String>) -> Self {
        self.with(name, Behavior::Fail(error.into()))
    }

    /// The first `n` attempts fail, later ones return `output`.
    pub fn with_fail_times(self, name: impl Into<String>, n: usize, output: impl Into<String>) -> Self {
        self.with(
            name,
            Behavior::FailTimes {
                remaining: n,
                output: output.into(),
            },
        )
    }

    pub fn with_delay(self, name: impl Into<String>, delay: Duration, output: impl Into<String>) -> Self {
        self.with(
            name,
            Behavior::Delay {
                delay,
                output: output.into(),
            },
        )
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        lock(&self.invocations).clone()
    }

    pub fn invocations_of(&self, name: &str) -> Vec<Invocation> {
        lock(&self.invocations)
            .iter()
            .filter(|i| i.name == name)
            .cloned()
            .collect()
    }

    pub fn call_count(&self, name: &str) -> usize {
        lock(&self.invocations)
            .iter()
            .filter(|i| i.name == name)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.invocations).len()
    }

    /// Decide this attempt's outcome, consuming one scripted failure if any.
    fn resolve(&self, name: &str) -> Result<Behavior> {
        let mut behaviors = lock(&self.behaviors);
        let behavior = behaviors
            .get_mut(name)
            .ok_or_else(|| WaypointError::ToolNotFound(name.to_string()))?;
        Ok(match behavior {
            Behavior::FailTimes { remaining, .. } if *remaining > 0 => {
                *remaining -= 1;
                Behavior::Fail(format!("{name} scripted failure"))
            }
            Behavior::FailTimes { output, .. } => Behavior::Output(output.clone()),
            other => other.clone(),
        })
    }
}

impl ToolCallExecutor for RecordingTools {
    fn execute<'a>(&'a self, call: &'a ToolCall, ctx: ToolContext) -> BoxFuture<'a, Result<ToolResult>> {
        Box::pin(async move {
            let started = Instant::now();
            let behavior = self.resolve(&call.name);
            let result = match behavior {
                Ok(Behavior::Output(out)) => Ok(ToolResult::success(out)),
                Ok(Behavior::Fail(err)) => Ok(ToolResult::error(err)),
                Ok(Behavior::Delay { delay, output }) => {
                    tokio::time::sleep(delay).await;
                    Ok(ToolResult::success(output))
                }
                Ok(Behavior::FailTimes { .. }) => Err(WaypointError::ToolCallFailed {
                    tool: call.name.clone(),
                    message: "unresolved scripted behavior".into(),
                }),
                Err(e) => Err(e),
            };
            lock(&self.invocations).push(Invocation {
                name: call.name.clone(),
                step_id: ctx.step_id,
                attempt: ctx.attempt,
                started,
                finished: Instant::now(),
            });
            result
        })
    }
}

/// Plain snapshot-capable memory that counts snapshot traffic.
#[derive(Default)]
pub struct CountingMemory {
    messages: Mutex<HashMap<ConversationId, Vec<ChatMessage>>>,
    snapshots: Mutex<HashMap<SnapshotId, (ConversationId, Vec<ChatMessage>)>>,
    next: AtomicUsize,
    taken: AtomicUsize,
    restored: Mutex<Vec<SnapshotId>>,
}

impl CountingMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_count(&self) -> usize {
        self.taken.load(Ordering::SeqCst)
    }

    pub fn restore_count(&self) -> usize {
        lock(&self.restored).len()
    }

    /// Snapshot ids in the order they were restored.
    pub fn restored(&self) -> Vec<SnapshotId> {
        lock(&self.restored).clone()
    }

    pub fn messages(&self, conversation: &ConversationId) -> Vec<ChatMessage> {
        lock(&self.messages)
            .get(conversation)
            .cloned()
            .unwrap_or_default()
    }
}

impl ModelMemory for CountingMemory {
    fn prompt_messages(&self, conversation: &ConversationId) -> BoxFuture<'_, Result<Vec<ChatMessage>>> {
        let messages = self.messages(conversation);
        Box::pin(async move { Ok(messages) })
    }

    fn save_all(&self, conversation: &ConversationId, messages: Vec<ChatMessage>) -> BoxFuture<'_, Result<()>> {
        lock(&self.messages)
            .entry(conversation.clone())
            .or_default()
            .extend(messages);
        Box::pin(async { Ok(()) })
    }

    fn take_snapshot(&self, conversation: &ConversationId) -> BoxFuture<'_, Result<SnapshotId>> {
        let id = SnapshotId(self.next.fetch_add(1, Ordering::SeqCst) as u64);
        let saved = self.messages(conversation);
        lock(&self.snapshots).insert(id, (conversation.clone(), saved));
        self.taken.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(id) })
    }

    fn restore_snapshot(&self, conversation: &ConversationId, snapshot: SnapshotId) -> BoxFuture<'_, Result<()>> {
        let saved = lock(&self.snapshots).get(&snapshot).cloned();
        let result = match saved {
            Some((owner, messages)) if &owner == conversation => {
                lock(&self.messages).insert(owner, messages);
                lock(&self.restored).push(snapshot);
                Ok(())
            }
            _ => Err(WaypointError::Memory(format!("unknown snapshot {snapshot}"))),
        };
        Box::pin(async move { result })
    }
}
