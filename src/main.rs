use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use auditflow_agent::{
    DelegatingRouter, HelperAgent, Persona, RegistryRouter, StepDispatch, StepExecutor, TurnLoop,
    TurnRouter, WaveDispatcher,
};
use auditflow_core::config::AppConfig;
use auditflow_core::event::EventBus;
use auditflow_core::traits::{ModelClient, WorkflowStore};
use auditflow_core::types::{
    StepResult, StepStatus, ToolContext, TurnEvent, UserContent, UserId, Workflow,
};
use auditflow_graph::{ExecutionPlanner, StepGraph};
use auditflow_store::SqliteStore;
use auditflow_tools::ToolRegistry;

const CHAT_SYSTEM_PROMPT: &str = "You are an audit workflow copilot. You help the user \
author and run audit workflows: use your tools to create, inspect, and update workflow \
documents, track per-step progress, and manage favorites. Delegate data lookups and \
analysis sub-tasks to your helper agents when that produces a better answer.";

#[derive(Parser)]
#[command(name = "auditflow", version, about = "Agentic audit workflow runner")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "auditflow.toml")]
    config: PathBuf,

    /// Acting user id
    #[arg(short, long, env = "AUDITFLOW_USER", default_value = "local")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config file
    Init,
    /// Send one message to the workflow copilot
    Chat {
        /// The message to send
        #[arg(trailing_var_arg = true)]
        message: Vec<String>,
    },
    /// Show the execution plan for a workflow
    Plan {
        /// Workflow id or slug
        workflow: String,
    },
    /// Execute a workflow wave by wave with an approval gate per step
    Run {
        /// Workflow id or slug
        workflow: String,
        /// Approve every draft without prompting
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

/// Everything a command needs, wired once.
struct Host {
    config: AppConfig,
    store: Arc<SqliteStore>,
    registry: Arc<ToolRegistry>,
    model: Arc<dyn ModelClient>,
    event_bus: Arc<EventBus>,
    user: UserId,
}

impl Host {
    fn build(config: AppConfig, user: UserId) -> anyhow::Result<Self> {
        let store = Arc::new(SqliteStore::open(&config.database_path())?);
        let registry = Arc::new(ToolRegistry::with_builtins());
        let model: Arc<dyn ModelClient> =
            Arc::from(auditflow_model::create_client(&config.model)?);
        let event_bus = Arc::new(EventBus::new(config.agent.event_capacity));
        Ok(Self {
            config,
            store,
            registry,
            model,
            event_bus,
            user,
        })
    }

    fn tool_context(&self) -> ToolContext {
        ToolContext {
            user_id: self.user.clone(),
            store: self.store.clone(),
        }
    }

    fn helpers(&self) -> anyhow::Result<Vec<Arc<HelperAgent>>> {
        let base_dir = self
            .config
            .database_path()
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let personas = Persona::load_all(&self.config.personas, &base_dir)?;
        Ok(personas
            .into_iter()
            .map(|p| {
                Arc::new(HelperAgent::from_persona(
                    p,
                    self.registry.clone(),
                    self.tool_context(),
                ))
            })
            .collect())
    }

    async fn load_workflow(&self, reference: &str) -> anyhow::Result<Workflow> {
        use auditflow_core::types::WorkflowId;
        if let Some(wf) = self
            .store
            .get_workflow(&WorkflowId::from_str(reference))
            .await?
        {
            return Ok(wf);
        }
        self.store
            .get_workflow_by_slug(reference)
            .await?
            .ok_or_else(|| anyhow::anyhow!("workflow '{}' not found", reference))
    }
}

/// Cancel the token on ctrl-c; a stop is a forward-only halt.
fn watch_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStopping...");
            cancel.cancel();
        }
    });
}

/// Render the event stream for the terminal until the bus closes.
fn spawn_renderer(event_bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => render_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    })
}

fn render_event(event: &TurnEvent) {
    match event {
        TurnEvent::Text(text) => println!("{}", text),
        TurnEvent::ToolCallStarted {
            name, step_label, ..
        } => match step_label {
            Some(label) => println!("  [{}] → {}", label, name),
            None => println!("  → {}", name),
        },
        TurnEvent::ToolCallFinished { name, result, .. } => {
            let marker = if result.is_error { "✗" } else { "✓" };
            println!("  {} {}", marker, name);
        }
        TurnEvent::CodeExecutionStarted { language, .. } => {
            println!("  → running {} code", language)
        }
        TurnEvent::CodeExecutionFinished { .. } => {}
        TurnEvent::DelegationStarted { target, .. } => println!("  → asking {}", target),
        TurnEvent::DelegationFinished {
            target, succeeded, ..
        } => {
            let marker = if *succeeded { "✓" } else { "✗" };
            println!("  {} {} answered", marker, target);
        }
        TurnEvent::StepStatus { step_id, status } => match status {
            StepStatus::Executing => println!("[{}] executing...", step_id),
            StepStatus::Review { .. } => println!("[{}] ready for review", step_id),
            StepStatus::Error { message } => println!("[{}] failed: {}", step_id, message),
        },
        TurnEvent::Terminal { .. } => {}
        TurnEvent::Fatal { error } => eprintln!("error: {}", error),
    }
}

async fn cmd_chat(host: &Host, message: String) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    watch_ctrl_c(cancel.clone());

    let helpers = host.helpers()?;
    let datastore = Arc::new(RegistryRouter::new(
        host.registry.clone(),
        host.tool_context(),
    ));
    let router = Arc::new(
        DelegatingRouter::from_shared(host.model.clone(), helpers, host.event_bus.clone())
            .with_datastore(datastore)
            .with_config(&host.config.agent)
            .with_cancel(cancel.clone()),
    );
    let catalog = router.catalog(host.registry.definitions());

    let turn_loop = TurnLoop::new(
        host.model.clone(),
        CHAT_SYSTEM_PROMPT,
        catalog,
        router as Arc<dyn TurnRouter>,
        host.event_bus.clone(),
    )
    .with_config(&host.config.agent)
    .with_cancel(cancel);

    let renderer = spawn_renderer(&host.event_bus);
    let result = turn_loop.run(vec![], UserContent::text(message)).await;
    renderer.abort();

    match result {
        Ok(outcome) => {
            if !outcome.tool_calls.is_empty() {
                println!(
                    "\n({} tool calls, {} in / {} out tokens)",
                    outcome.tool_calls.len(),
                    outcome.usage.input_tokens,
                    outcome.usage.output_tokens
                );
            }
            Ok(())
        }
        Err(auditflow_core::AuditflowError::Cancelled) => Ok(()),
        Err(e) => {
            eprintln!("error: {}", e);
            Err(e.into())
        }
    }
}

async fn cmd_plan(host: &Host, reference: &str) -> anyhow::Result<()> {
    let workflow = host.load_workflow(reference).await?;
    let results = host
        .store
        .list_step_results(&host.user, &workflow.id)
        .await?;

    let graph = StepGraph::from_workflow(&workflow)?;
    let planner = ExecutionPlanner::new(&graph, &results);

    println!("workflow: {} ({} steps)", workflow.title, workflow.steps.len());
    println!("order:    {}", planner.topological_order()?.join(" → "));
    println!("ready:    {}", planner.ready_frontier().join(", "));
    for (i, wave) in planner.parallel_groups()?.iter().enumerate() {
        println!("wave {}:   {}", i + 1, wave.join(", "));
    }
    Ok(())
}

async fn cmd_run(host: &Host, reference: &str, auto_approve: bool) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    watch_ctrl_c(cancel.clone());

    let workflow = host.load_workflow(reference).await?;
    let helpers = host.helpers()?;
    let executor = Arc::new(
        StepExecutor::new(host.model.clone(), helpers, host.event_bus.clone())
            .with_config(&host.config.agent)
            .with_cancel(cancel.clone()),
    );
    let dispatcher = WaveDispatcher::new(executor, host.event_bus.clone());
    let renderer = spawn_renderer(&host.event_bus);

    // Plan one wave, dispatch it, gate every draft on approval, then
    // re-plan. Approvals are the only thing that changes readiness, so
    // waves are never computed further ahead than this.
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let results = host
            .store
            .list_step_results(&host.user, &workflow.id)
            .await?;
        let graph = StepGraph::from_workflow(&workflow)?;
        let planner = ExecutionPlanner::new(&graph, &results);
        let frontier = planner.ready_frontier();
        if frontier.is_empty() {
            println!("All steps complete.");
            break;
        }

        let wave: Vec<StepDispatch> = frontier
            .iter()
            .filter_map(|id| graph.step(id).cloned())
            .map(|step| {
                let upstream = graph
                    .upstream_of(&step.id)
                    .iter()
                    .filter_map(|up_id| {
                        let label = graph
                            .step(up_id)
                            .map(|s| s.label.clone())
                            .unwrap_or_else(|| up_id.clone());
                        results
                            .iter()
                            .find(|r| &r.step_id == up_id && r.completed)
                            .map(|r| (label, r.result.clone()))
                    })
                    .collect();
                StepDispatch { step, upstream }
            })
            .collect();

        let reports = match dispatcher.dispatch(wave).await {
            Ok(reports) => reports,
            Err(auditflow_core::AuditflowError::Cancelled) => break,
            Err(e) => {
                renderer.abort();
                return Err(e.into());
            }
        };

        let mut approved_any = false;
        for report in reports {
            match report.outcome {
                auditflow_agent::StepOutcome::Review { draft } => {
                    println!("\n── draft for [{}] ──\n{}\n", report.step_id, draft);
                    let approve = auto_approve
                        || dialoguer::Confirm::new()
                            .with_prompt(format!("Approve step '{}'?", report.step_id))
                            .default(true)
                            .interact()?;
                    if approve {
                        host.store
                            .upsert_step_result(&StepResult::completed(
                                host.user.clone(),
                                workflow.id.clone(),
                                report.step_id.clone(),
                                draft,
                            ))
                            .await?;
                        approved_any = true;
                    } else {
                        // Keep the draft but leave the step incomplete.
                        host.store
                            .upsert_step_result(&StepResult::draft(
                                host.user.clone(),
                                workflow.id.clone(),
                                report.step_id.clone(),
                                draft,
                            ))
                            .await?;
                    }
                }
                auditflow_agent::StepOutcome::Error { message } => {
                    warn!(step_id = %report.step_id, error = %message, "Step failed");
                }
            }
        }

        if !approved_any {
            println!("No steps approved; stopping here.");
            break;
        }
    }

    renderer.abort();
    Ok(())
}

fn cmd_init(path: &PathBuf) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    let starter = r#"[model]
provider = "anthropic"
model = "claude-sonnet-4-5"
api_key = "${ANTHROPIC_API_KEY}"

[agent]
max_turns = 12
max_duration_secs = 600

[database]
path = "auditflow.db"
"#;
    std::fs::write(path, starter)?;
    println!("Wrote {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("auditflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        return cmd_init(&cli.config);
    }

    let config = AppConfig::load(&cli.config)?;
    let host = Host::build(config, UserId::from_str(&cli.user))?;

    match cli.command {
        Commands::Init => unreachable!(),
        Commands::Chat { message } => cmd_chat(&host, message.join(" ")).await,
        Commands::Plan { workflow } => cmd_plan(&host, &workflow).await,
        Commands::Run { workflow, yes } => cmd_run(&host, &workflow, yes).await,
    }
}
