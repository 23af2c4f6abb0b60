use std::io::Write;

use waypoint_agent::{Recipe, StepKind};
use waypoint_core::{ExecutionConfig, WaypointError};

fn write_recipe(content: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(content.as_bytes()).unwrap();
    tmp
}

#[test]
fn test_load_full_recipe_from_file() {
    let tmp = write_recipe(
        r#"
name = "support"
description = "Answer a customer question"
start = "goal_identification"
goal = "Resolve the customer's issue."

[[steps]]
id = "goal_identification"
kind = "goal_identification"
user_message = "My invoice is wrong"

[[steps]]
id = "investigate"
goal = "Look up the account."
system_prompt = "You are a billing assistant."
tools = ["lookup_account", "lookup_invoice"]
decision_tool = { name = "route", input = { options = ["refund", "explain"] } }
metadata = { maxModelCallsPerStep = 3 }

[[steps]]
id = "refund"
kind = "model"
goal = "Draft a refund confirmation."

[[steps]]
id = "explain"
kind = "model"
goal = "Explain the charge."

[transitions]
goal_identification = ["investigate"]
investigate = ["refund", "explain"]

[execution]
max_tool_call_retries = 1
model_call_timeout_secs = 60
continue_on_step_failure = true

[metadata]
maxModelCallRetries = 3
"#,
    );

    let recipe = Recipe::load(tmp.path()).unwrap();
    assert_eq!(recipe.name, "support");
    assert_eq!(recipe.steps.len(), 4);
    assert_eq!(recipe.steps[0].kind, StepKind::GoalIdentification);

    let config = recipe.execution_config();
    assert_eq!(config.max_tool_call_retries, 1);
    assert_eq!(config.model_call_timeout_secs, 60);
    assert_eq!(config.max_model_call_retries, 3);
    assert!(config.continue_on_step_failure);
    assert_eq!(config.max_model_calls_per_step, 10);

    let graph = recipe.build_graph().unwrap();
    assert!(graph.is_acyclic());
    assert_eq!(graph.start_step().id(), "goal_identification");
    let investigate = graph.step("investigate").unwrap();
    assert_eq!(investigate.available_tools(), ["lookup_account", "lookup_invoice"]);
    assert_eq!(investigate.decision_tool_call().unwrap().name, "route");
    assert!(graph.step("refund").unwrap().completes_after_model_call());
}

#[test]
fn test_minimal_recipe_uses_defaults() {
    let tmp = write_recipe(
        r#"
name = "one"
start = "only"

[[steps]]
id = "only"
"#,
    );
    let recipe = Recipe::load(tmp.path()).unwrap();
    assert_eq!(recipe.execution_config(), ExecutionConfig::default());
    let graph = recipe.build_graph().unwrap();
    assert!(graph.possible_next_steps("only").is_empty());
}

#[test]
fn test_env_vars_expanded_before_parsing() {
    std::env::set_var("WAYPOINT_IT_STEP_GOAL", "Summarize the report.");
    let tmp = write_recipe(
        r#"
name = "env"
start = "s"

[[steps]]
id = "s"
kind = "model"
goal = "${WAYPOINT_IT_STEP_GOAL}"
"#,
    );
    let recipe = Recipe::load(tmp.path()).unwrap();
    assert_eq!(recipe.steps[0].goal.as_deref(), Some("Summarize the report."));
}

#[test]
fn test_unknown_transition_target_rejected() {
    let tmp = write_recipe(
        r#"
name = "broken"
start = "a"

[[steps]]
id = "a"

[transitions]
a = ["missing"]
"#,
    );
    let recipe = Recipe::load(tmp.path()).unwrap();
    let err = recipe.build_graph().unwrap_err();
    assert!(matches!(err, WaypointError::Config(ref msg) if msg.contains("missing")));
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = Recipe::load(std::path::Path::new("/definitely/not/here.toml")).unwrap_err();
    assert!(matches!(err, WaypointError::ConfigNotFound(_)));
}
