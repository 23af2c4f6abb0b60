use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use waypoint_core::config::ExecutionConfig;
use waypoint_core::error::{Result, WaypointError};

use crate::graph::StepGraph;
use crate::step::{GoalIdentificationStep, ModelStep, Step, StepKind, ToolStep};

/// A workflow definition loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Id of the first step to run.
    pub start: String,
    /// Saved to memory as a system message before the first step.
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    /// Step id -> ordered next step ids.
    #[serde(default)]
    pub transitions: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// camelCase overrides applied on top of `execution`.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    #[serde(default)]
    pub kind: StepKind,
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub decision_tool: Option<DecisionToolDefinition>,
    /// Only used by `goal_identification` steps.
    #[serde(default)]
    pub user_message: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionToolDefinition {
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl Recipe {
    /// Load a recipe file, expanding `${VAR}` references first.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WaypointError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| WaypointError::Config(e.to_string()))
    }

    /// `[execution]` with `[metadata]` overrides applied.
    pub fn execution_config(&self) -> ExecutionConfig {
        self.execution.clone().merge_metadata(&self.metadata)
    }

    pub fn build_steps(&self) -> Result<Vec<Arc<dyn Step>>> {
        self.steps.iter().map(StepDefinition::build).collect()
    }

    pub fn build_graph(&self) -> Result<StepGraph> {
        StepGraph::new(self.build_steps()?, self.transitions.clone(), self.start.clone())
    }
}

impl StepDefinition {
    pub fn build(&self) -> Result<Arc<dyn Step>> {
        let step: Arc<dyn Step> = match self.kind {
            StepKind::Tool => {
                let mut step = ToolStep::new(&self.id).with_tools(self.tools.iter().cloned());
                if let Some(goal) = &self.goal {
                    step = step.with_goal(goal.clone());
                }
                if let Some(prompt) = &self.system_prompt {
                    step = step.with_system_prompt(prompt.clone());
                }
                if let Some(tool) = &self.decision_tool {
                    step = step.with_decision_tool(&tool.name, tool.input.clone());
                }
                for (k, v) in &self.metadata {
                    step = step.with_metadata(k.clone(), v.clone());
                }
                Arc::new(step)
            }
            StepKind::Model => {
                if !self.tools.is_empty() {
                    return Err(WaypointError::Config(format!(
                        "model step '{}' cannot declare tools",
                        self.id
                    )));
                }
                let mut step = ModelStep::new(&self.id);
                if let Some(goal) = &self.goal {
                    step = step.with_goal(goal.clone());
                }
                if let Some(prompt) = &self.system_prompt {
                    step = step.with_system_prompt(prompt.clone());
                }
                if let Some(tool) = &self.decision_tool {
                    step = step.with_decision_tool(&tool.name, tool.input.clone());
                }
                for (k, v) in &self.metadata {
                    step = step.with_metadata(k.clone(), v.clone());
                }
                Arc::new(step)
            }
            StepKind::GoalIdentification => {
                let message = self.user_message.as_deref().ok_or_else(|| {
                    WaypointError::Config(format!(
                        "goal identification step '{}' needs a user_message",
                        self.id
                    ))
                })?;
                Arc::new(GoalIdentificationStep::new(message).with_id(&self.id))
            }
        };
        Ok(step)
    }
}

/// Replace `${VAR}` with the environment value. Unset variables are left
/// as written.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' || chars.peek() != Some(&'{') {
            result.push(c);
            continue;
        }
        chars.next();
        let var_name: String = chars.by_ref().take_while(|&c| c != '}').collect();
        match std::env::var(&var_name) {
            Ok(val) => result.push_str(&val),
            Err(_) => {
                result.push_str("${");
                result.push_str(&var_name);
                result.push('}');
            }
        }
    }
    result
}
