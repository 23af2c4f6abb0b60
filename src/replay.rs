use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use serde::Deserialize;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::{ModelCallExecutor, ToolCallExecutor};
use waypoint_core::types::{
    CompletionInstruction, ModelCallRequest, ModelCallResponse, ToolCall, ToolContext, ToolResult,
};

/// A recorded session to replay through a workflow.
#[derive(Debug, Deserialize)]
pub struct Script {
    /// Model turns, consumed in order across all steps.
    #[serde(default)]
    pub model: Vec<ScriptedTurn>,
    /// Tool name -> output.
    #[serde(default)]
    pub tools: HashMap<String, ScriptedTool>,
}

#[derive(Debug, Deserialize)]
pub struct ScriptedTurn {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub completion: Option<CompletionInstruction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScriptedTool {
    Output(String),
    Result {
        output: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl From<ScriptedTurn> for ModelCallResponse {
    fn from(turn: ScriptedTurn) -> Self {
        let mut response = match turn.text {
            Some(text) => ModelCallResponse::text(text),
            None => ModelCallResponse::default(),
        };
        response.tool_calls = turn.tool_calls;
        response.completion = turn.completion;
        response
    }
}

impl Script {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WaypointError::ConfigNotFound(path.display().to_string()))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn into_executors(self) -> (ReplayModel, ReplayTools) {
        let turns = self.model.into_iter().map(ModelCallResponse::from).collect();
        (
            ReplayModel {
                turns: Mutex::new(turns),
            },
            ReplayTools { tools: self.tools },
        )
    }
}

pub struct ReplayModel {
    turns: Mutex<VecDeque<ModelCallResponse>>,
}

impl ModelCallExecutor for ReplayModel {
    fn execute(&self, _request: ModelCallRequest) -> BoxFuture<'_, Result<ModelCallResponse>> {
        let next = self
            .turns
            .lock()
            .map_err(|e| WaypointError::ModelRequest(e.to_string()))
            .and_then(|mut turns| {
                turns
                    .pop_front()
                    .ok_or_else(|| WaypointError::Config("script has no model turns left".into()))
            });
        Box::pin(async move { next })
    }
}

pub struct ReplayTools {
    tools: HashMap<String, ScriptedTool>,
}

impl ToolCallExecutor for ReplayTools {
    fn execute<'a>(&'a self, call: &'a ToolCall, _ctx: ToolContext) -> BoxFuture<'a, Result<ToolResult>> {
        Box::pin(async move {
            match self.tools.get(&call.name) {
                Some(ScriptedTool::Output(out)) => Ok(ToolResult::success(out.clone())),
                Some(ScriptedTool::Result { output, is_error }) => Ok(ToolResult {
                    content: output.clone(),
                    is_error: *is_error,
                }),
                None => Err(WaypointError::ToolNotFound(call.name.clone())),
            }
        })
    }
}
