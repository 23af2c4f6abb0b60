use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Metadata keys understood by [`ExecutionConfig::from_metadata`].
pub mod keys {
    pub const MAX_MODEL_CALLS_PER_STEP: &str = "maxModelCallsPerStep";
    pub const MAX_TOOL_CALL_RETRIES: &str = "maxToolCallRetries";
    pub const SEQUENTIAL_TOOL_CALLS: &str = "sequentialToolCalls";
    pub const MAX_MODEL_CALL_RETRIES: &str = "maxModelCallRetries";
    pub const ALLOW_REPEATED_STEPS: &str = "allowRepeatedSteps";
    pub const CONTINUE_ON_STEP_FAILURE: &str = "continueOnStepFailure";
    pub const MODEL_CALL_TIMEOUT_SECS: &str = "modelCallTimeoutSecs";
    pub const TOOL_CALL_TIMEOUT_SECS: &str = "toolCallTimeoutSecs";
    pub const MAX_DURATION_SECS: &str = "maxDurationSecs";
    pub const RETRY_BACKOFF_MS: &str = "retryBackoffMs";
}

/// Execution limits and policies for a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Model calls a single step activation may make.
    #[serde(default = "default_max_model_calls_per_step")]
    pub max_model_calls_per_step: usize,
    /// Retries per tool call after the first attempt.
    #[serde(default = "default_max_tool_call_retries")]
    pub max_tool_call_retries: u32,
    /// Run tool calls one at a time in declared order.
    #[serde(default)]
    pub sequential_tool_calls: bool,
    /// Retries per model call after the first attempt.
    #[serde(default = "default_max_model_call_retries")]
    pub max_model_call_retries: u32,
    /// Permit a step to be activated more than once per run.
    #[serde(default)]
    pub allow_repeated_steps: bool,
    /// Keep walking the graph after a step finalizes as FAILED.
    #[serde(default)]
    pub continue_on_step_failure: bool,
    #[serde(default = "default_model_call_timeout_secs")]
    pub model_call_timeout_secs: u64,
    #[serde(default = "default_tool_call_timeout_secs")]
    pub tool_call_timeout_secs: u64,
    /// Wall-clock bound for the whole workflow (0 = unlimited).
    #[serde(default)]
    pub max_duration_secs: u64,
    /// Base delay between retry attempts (0 = retry immediately).
    #[serde(default)]
    pub retry_backoff_ms: u64,
}

fn default_max_model_calls_per_step() -> usize {
    10
}

fn default_max_tool_call_retries() -> u32 {
    2
}

fn default_max_model_call_retries() -> u32 {
    1
}

fn default_model_call_timeout_secs() -> u64 {
    120
}

fn default_tool_call_timeout_secs() -> u64 {
    30
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_model_calls_per_step: default_max_model_calls_per_step(),
            max_tool_call_retries: default_max_tool_call_retries(),
            sequential_tool_calls: false,
            max_model_call_retries: default_max_model_call_retries(),
            allow_repeated_steps: false,
            continue_on_step_failure: false,
            model_call_timeout_secs: default_model_call_timeout_secs(),
            tool_call_timeout_secs: default_tool_call_timeout_secs(),
            max_duration_secs: 0,
            retry_backoff_ms: 0,
        }
    }
}

impl ExecutionConfig {
    /// Resolve a config from a metadata map, falling back to defaults.
    pub fn from_metadata(metadata: &HashMap<String, serde_json::Value>) -> Self {
        Self::default().merge_metadata(metadata)
    }

    /// Override fields with any recognised keys present in `metadata`.
    ///
    /// Values of the wrong type are ignored with a warning.
    pub fn merge_metadata(mut self, metadata: &HashMap<String, serde_json::Value>) -> Self {
        if let Some(v) = read_u64(metadata, keys::MAX_MODEL_CALLS_PER_STEP) {
            self.max_model_calls_per_step = v as usize;
        }
        if let Some(v) = read_u64(metadata, keys::MAX_TOOL_CALL_RETRIES) {
            self.max_tool_call_retries = v.min(u32::MAX as u64) as u32;
        }
        if let Some(v) = read_bool(metadata, keys::SEQUENTIAL_TOOL_CALLS) {
            self.sequential_tool_calls = v;
        }
        if let Some(v) = read_u64(metadata, keys::MAX_MODEL_CALL_RETRIES) {
            self.max_model_call_retries = v.min(u32::MAX as u64) as u32;
        }
        if let Some(v) = read_bool(metadata, keys::ALLOW_REPEATED_STEPS) {
            self.allow_repeated_steps = v;
        }
        if let Some(v) = read_bool(metadata, keys::CONTINUE_ON_STEP_FAILURE) {
            self.continue_on_step_failure = v;
        }
        if let Some(v) = read_u64(metadata, keys::MODEL_CALL_TIMEOUT_SECS) {
            self.model_call_timeout_secs = v;
        }
        if let Some(v) = read_u64(metadata, keys::TOOL_CALL_TIMEOUT_SECS) {
            self.tool_call_timeout_secs = v;
        }
        if let Some(v) = read_u64(metadata, keys::MAX_DURATION_SECS) {
            self.max_duration_secs = v;
        }
        if let Some(v) = read_u64(metadata, keys::RETRY_BACKOFF_MS) {
            self.retry_backoff_ms = v;
        }
        self
    }

    pub fn model_call_timeout(&self) -> Duration {
        Duration::from_secs(self.model_call_timeout_secs)
    }

    pub fn tool_call_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_call_timeout_secs)
    }

    pub fn max_duration(&self) -> Option<Duration> {
        (self.max_duration_secs > 0).then(|| Duration::from_secs(self.max_duration_secs))
    }
}

fn read_u64(metadata: &HashMap<String, serde_json::Value>, key: &str) -> Option<u64> {
    let value = metadata.get(key)?;
    match value.as_u64() {
        Some(v) => Some(v),
        None => {
            warn!(key, %value, "Ignoring non-integer execution setting");
            None
        }
    }
}

fn read_bool(metadata: &HashMap<String, serde_json::Value>, key: &str) -> Option<bool> {
    let value = metadata.get(key)?;
    match value.as_bool() {
        Some(v) => Some(v),
        None => {
            warn!(key, %value, "Ignoring non-boolean execution setting");
            None
        }
    }
}
