use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::debug;

use crate::types::{StepStatus, WorkflowEvent};

/// Events buffered per subscriber before slow readers start lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Fan-out of [`WorkflowEvent`]s to any number of observers.
///
/// One bus usually serves one workflow run. Publishing never blocks and
/// never fails; events sent while nobody listens are dropped.
pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many subscribers the event reached.
    pub fn publish(&self, event: WorkflowEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Take every event already queued on `rx` without waiting.
///
/// A lagging receiver skips what it missed and keeps reading.
pub fn drain_ready(rx: &mut broadcast::Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(missed)) => {
                debug!(missed, "Event receiver lagged");
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => return events,
        }
    }
}

impl WorkflowEvent {
    /// Step the event belongs to, if it is step-scoped.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::StepStarted { step_id, .. }
            | Self::ModelCallFinished { step_id, .. }
            | Self::ModelCallRetry { step_id, .. }
            | Self::ToolStart { step_id, .. }
            | Self::ToolRetry { step_id, .. }
            | Self::ToolEnd { step_id, .. }
            | Self::StepFinished { step_id, .. } => Some(step_id.as_str()),
            Self::NextStepChosen { from, .. } => Some(from.as_str()),
            Self::WorkflowStarted { .. } | Self::WorkflowComplete { .. } | Self::WorkflowFailed { .. } => {
                None
            }
        }
    }

    /// `(step_id, status)` for a finished step activation.
    pub fn finished_step(&self) -> Option<(&str, StepStatus)> {
        match self {
            Self::StepFinished { step_id, status, .. } => Some((step_id.as_str(), *status)),
            _ => None,
        }
    }
}
