mod replay;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use waypoint_core::event::EventBus;
use waypoint_core::types::{ConversationId, WorkflowEvent};

use waypoint_agent::{AgentContext, AgentExecutor, AgentResult, InMemoryModelMemory, Recipe};

use crate::replay::Script;

#[derive(Parser)]
#[command(name = "waypoint", version, about = "Step graph agent workflow engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a recipe and check its step graph
    Validate {
        /// Path to the recipe TOML file
        recipe: PathBuf,
    },
    /// Print the resolved execution settings of a recipe
    ShowConfig { recipe: PathBuf },
    /// Run a recipe against a replayed model session
    Run {
        recipe: PathBuf,
        /// JSON file with model turns and tool outputs
        #[arg(short, long)]
        script: PathBuf,
        /// Conversation ID (auto-generated if not provided)
        #[arg(short, long, env = "WAYPOINT_CONVERSATION")]
        conversation: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("waypoint=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { recipe } => validate(&recipe),
        Commands::ShowConfig { recipe } => {
            let recipe = Recipe::load(&recipe)?;
            println!("{}", serde_json::to_string_pretty(&recipe.execution_config())?);
            Ok(())
        }
        Commands::Run {
            recipe,
            script,
            conversation,
        } => run(&recipe, &script, conversation).await,
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let recipe = Recipe::load(path)?;
    let graph = recipe.build_graph()?;
    println!("Recipe: {}", recipe.name);
    if let Some(desc) = &recipe.description {
        println!("  {desc}");
    }
    println!("Start:  {}", graph.start_step().id());
    println!("Steps:");
    for step in graph.steps() {
        let next = graph.transitions_from(step.id());
        if next.is_empty() {
            println!("  {} ({:?}) -> end", step.id(), step.kind());
        } else {
            println!("  {} ({:?}) -> {}", step.id(), step.kind(), next.join(", "));
        }
    }
    if graph.is_acyclic() {
        println!("Graph is acyclic.");
    } else if recipe.execution_config().allow_repeated_steps {
        println!("Graph has cycles (repeated steps allowed).");
    } else {
        println!("Warning: graph has cycles but repeated steps are not allowed; a revisit will abort the run.");
    }
    Ok(())
}

async fn run(recipe_path: &Path, script_path: &Path, conversation: Option<String>) -> anyhow::Result<()> {
    let recipe = Recipe::load(recipe_path)?;
    let graph = recipe.build_graph()?;
    let (model, tools) = Script::load(script_path)?.into_executors();

    let event_bus = Arc::new(EventBus::default());
    let conversation_id = conversation
        .map(|c| ConversationId::from_str(&c))
        .unwrap_or_default();
    let ctx = AgentContext::new(
        Arc::new(model),
        Arc::new(tools),
        Arc::new(InMemoryModelMemory::new()),
    )
    .with_conversation_id(conversation_id)
    .with_config(recipe.execution_config())
    .with_event_bus(event_bus.clone());
    let cancel = ctx.cancel_token();

    let mut executor = AgentExecutor::new(graph, ctx);
    if let Some(goal) = &recipe.goal {
        executor = executor.with_goal(goal.clone());
    }

    let mut rx = event_bus.subscribe();
    let print_handle = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling workflow");
            ctrl_c_cancel.cancel();
        }
    });

    info!(recipe = %recipe.name, "Running workflow");
    let outcome = executor.execute().await;
    // Let the printer drain what was already published.
    tokio::task::yield_now().await;
    print_handle.abort();

    match outcome {
        Ok(result) => {
            print_summary(&result);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Workflow failed");
            Err(e.into())
        }
    }
}

fn print_event(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::StepStarted { step_id, activation } => {
            println!("▶ step {step_id} (activation {activation})");
        }
        WorkflowEvent::ToolStart { name, .. } => println!("  ⚙ {name}"),
        WorkflowEvent::ToolRetry {
            name, attempt, error, ..
        } => println!("  ↻ {name} attempt {attempt} failed: {error}"),
        WorkflowEvent::ToolEnd { name, status, .. } => println!("  ✓ {name} {status:?}"),
        WorkflowEvent::ModelCallRetry { attempt, error, .. } => {
            println!("  ↻ model attempt {attempt} failed: {error}");
        }
        WorkflowEvent::StepFinished {
            step_id,
            status,
            model_calls,
            tool_calls,
        } => println!("■ step {step_id} {status} ({model_calls} model / {tool_calls} tool calls)"),
        WorkflowEvent::NextStepChosen { from, to } => println!("→ {from} -> {to}"),
        WorkflowEvent::WorkflowFailed { error } => println!("✗ workflow failed: {error}"),
        _ => {}
    }
}

fn print_summary(result: &AgentResult) {
    println!();
    println!("{:<24} {:<12} {:>6} {:>6} {:>9}", "STEP", "STATUS", "MODEL", "TOOLS", "MS");
    for exec in &result.executions {
        println!(
            "{:<24} {:<12} {:>6} {:>6} {:>9}",
            exec.step_id(),
            exec.status().to_string(),
            exec.model_calls().len(),
            exec.tool_calls().len(),
            exec.duration_ms().unwrap_or_default(),
        );
    }
    println!("Total: {} ms", result.total_elapsed_ms);
    if let Some(output) = result.final_output() {
        println!();
        println!("{output}");
    }
}
