use thiserror::Error;

#[derive(Debug, Error)]
pub enum WaypointError {
    // Model call errors
    #[error("Model call failed in step {step} after {attempts} attempt(s): {message}")]
    ModelCallFailed {
        step: String,
        attempts: u32,
        message: String,
    },

    #[error("Model request failed: {0}")]
    ModelRequest(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool call failed: {tool}: {message}")]
    ToolCallFailed { tool: String, message: String },

    #[error("Timeout after {timeout_secs}s: {what}")]
    Timeout { what: String, timeout_secs: u64 },

    // Step / workflow errors
    #[error("Step {step} exhausted its budget of {max_calls} model call(s)")]
    BudgetExhausted { step: String, max_calls: usize },

    #[error("Step already executed: {0}")]
    StepAlreadyExecuted(String),

    #[error("Step {step} failed: {reason}")]
    StepFailed { step: String, reason: String },

    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Workflow exceeded max duration ({0}s)")]
    MaxDurationExceeded(u64),

    #[error("Workflow cancelled")]
    Cancelled,

    // Memory errors
    #[error("Memory error: {0}")]
    Memory(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WaypointError {
    /// Whether a failed attempt may be retried.
    ///
    /// Cancellation and configuration problems never get better on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled
                | Self::MaxDurationExceeded(_)
                | Self::Config(_)
                | Self::ConfigNotFound(_)
                | Self::UnknownStep(_)
                | Self::ToolNotFound(_)
        )
    }

    /// Step id this error is about, if it names one.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::ModelCallFailed { step, .. }
            | Self::BudgetExhausted { step, .. }
            | Self::StepFailed { step, .. } => Some(step),
            Self::StepAlreadyExecuted(step) | Self::UnknownStep(step) => Some(step),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, WaypointError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_fatal_messages_name_step() {
        let e = WaypointError::StepAlreadyExecuted("draft".into());
        assert_eq!(e.to_string(), "Step already executed: draft");
        assert_eq!(e.step_id(), Some("draft"));

        let e = WaypointError::StepFailed {
            step: "review".into(),
            reason: "boom".into(),
        };
        assert!(e.to_string().contains("review"));
        assert_eq!(e.step_id(), Some("review"));
    }

    #[test]
    fn test_retryable() {
        assert!(WaypointError::ModelRequest("503".into()).is_retryable());
        assert!(WaypointError::Timeout {
            what: "tool search".into(),
            timeout_secs: 30
        }
        .is_retryable());
        assert!(!WaypointError::Cancelled.is_retryable());
        assert!(!WaypointError::ToolNotFound("nope".into()).is_retryable());
    }
}
