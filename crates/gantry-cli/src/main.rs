//! Gantry CLI - approval-gated workflow orchestration
//!
//! Usage:
//!   gantry init                          Write default configuration
//!   gantry definitions                   List workflow definitions
//!   gantry start <requirements> -t rust  Start (and run) a workflow
//!   gantry status <workflow>             Show workflow status
//!   gantry pending                       List open approval requests
//!   gantry decide <workflow> <phase> <action>
//!   gantry resume                        Recover and continue all workflows

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gantry_core::{ApprovalAction, ApprovalMode, GantryConfig, WorkflowStatus};
use gantry_engine::{ApprovalResponse, WorkflowService};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "gantry")]
#[command(author, version, about = "Approval-gated workflow orchestration")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Project root holding the .gantry directory
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write default configuration to .gantry/config.toml
    Init,

    /// List available workflow definitions
    Definitions,

    /// Start a workflow
    Start {
        /// Requirements text, or @path to read them from a file
        requirements: String,

        /// Technology tag selecting the definition
        #[arg(short, long)]
        technology: String,

        /// Where workers should write their output
        #[arg(short, long, default_value = "./output")]
        output: String,

        /// Approval mode (interactive, auto_approve, batch)
        #[arg(long)]
        mode: Option<ApprovalMode>,

        /// Only create the workflow, do not run it
        #[arg(long)]
        no_run: bool,
    },

    /// Show workflow status
    Status {
        workflow_id: String,
    },

    /// List open approval requests
    Pending {
        /// Only show requests for this workflow
        #[arg(long)]
        workflow: Option<String>,
    },

    /// Decide an open approval request
    Decide {
        workflow_id: String,
        phase_id: String,

        /// approve, modify, retry, skip or cancel
        action: ApprovalAction,

        /// JSON payload for approve or modify
        #[arg(long)]
        modifications: Option<String>,

        /// Who is deciding
        #[arg(long, default_value = "cli")]
        actor: String,

        /// Keep running the workflow after the decision
        #[arg(long)]
        run: bool,
    },

    /// Approve every open gate of a workflow
    ApproveAll {
        workflow_id: String,

        #[arg(long, default_value = "cli")]
        actor: String,

        /// Keep running the workflow afterwards
        #[arg(long)]
        run: bool,
    },

    /// Cancel a workflow
    Cancel {
        workflow_id: String,

        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Run a workflow until it finishes or waits for approval
    Run {
        workflow_id: String,
    },

    /// Recover interrupted work and continue every active workflow
    Resume,

    /// Show a workflow's audit trail
    Audit {
        workflow_id: String,
    },

    /// List workflows
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<WorkflowStatus>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Init = cli.command {
        return cmd_init(&cli.root);
    }

    let service = open_service(&cli.root).await?;

    match cli.command {
        Commands::Init => Ok(()),
        Commands::Definitions => print_json(&service.get_workflow_definitions()),
        Commands::Start {
            requirements,
            technology,
            output,
            mode,
            no_run,
        } => cmd_start(&service, &requirements, &technology, &output, mode, no_run).await,
        Commands::Status { workflow_id } => {
            let status = service
                .get_workflow_status(&workflow_id)
                .await
                .with_context(|| format!("Failed to get status of {}", workflow_id))?;
            print_json(&status)
        }
        Commands::Pending { workflow } => {
            let mut pending = service.get_pending_approvals().await;
            if let Some(id) = workflow {
                pending.retain(|r| r.workflow_id == id);
            }
            print_json(&pending)
        }
        Commands::Decide {
            workflow_id,
            phase_id,
            action,
            modifications,
            actor,
            run,
        } => {
            cmd_decide(
                &service,
                &workflow_id,
                &phase_id,
                action,
                modifications,
                &actor,
                run,
            )
            .await
        }
        Commands::ApproveAll {
            workflow_id,
            actor,
            run,
        } => {
            let outcomes = service
                .approve_all(&workflow_id, &actor)
                .await
                .context("Failed to approve gates")?;
            print_json(&outcomes)?;
            if run {
                print_json(&service.run_workflow(&workflow_id).await?)?;
            }
            Ok(())
        }
        Commands::Cancel { workflow_id, actor } => {
            let status = service
                .cancel_workflow(&workflow_id, &actor)
                .await
                .with_context(|| format!("Failed to cancel {}", workflow_id))?;
            print_json(&status)
        }
        Commands::Run { workflow_id } => {
            let status = service
                .run_workflow(&workflow_id)
                .await
                .with_context(|| format!("Failed to run {}", workflow_id))?;
            print_json(&status)
        }
        Commands::Resume => {
            let statuses = service.resume().await.context("Failed to resume workflows")?;
            print_json(&statuses)
        }
        Commands::Audit { workflow_id } => print_json(&service.get_audit_log(&workflow_id).await?),
        Commands::List { status } => {
            let workflows = service.list_workflows(status).await?;
            let rows: Vec<Value> = workflows
                .iter()
                .map(|wf| {
                    serde_json::json!({
                        "workflow_id": wf.id,
                        "definition_id": wf.definition_id,
                        "status": wf.status,
                        "progress_percentage": wf.progress_percentage(),
                        "current_phase": wf.current_phase,
                        "updated_at": wf.updated_at,
                    })
                })
                .collect();
            print_json(&rows)
        }
    }
}

fn cmd_init(root: &Path) -> Result<()> {
    let path = GantryConfig::write_default(root).context("Failed to write configuration")?;
    println!("Initialized Gantry in {}", root.display());
    println!("Configuration: {}", path.display());
    Ok(())
}

async fn open_service(root: &Path) -> Result<WorkflowService> {
    let config = GantryConfig::load_or_default(root).context("Failed to load configuration")?;
    WorkflowService::open(config)
        .await
        .context("Failed to open workflow state")
}

async fn cmd_start(
    service: &WorkflowService,
    requirements: &str,
    technology: &str,
    output: &str,
    mode: Option<ApprovalMode>,
    no_run: bool,
) -> Result<()> {
    let requirements = match requirements.strip_prefix('@') {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read requirements from {}", path))?,
        None => requirements.to_string(),
    };

    let started = service
        .start_workflow(&requirements, technology, output, mode)
        .await
        .context("Failed to start workflow")?;
    info!("Started workflow {}", started.workflow_id);

    if no_run {
        return print_json(&started);
    }
    print_json(&service.run_workflow(&started.workflow_id).await?)
}

async fn cmd_decide(
    service: &WorkflowService,
    workflow_id: &str,
    phase_id: &str,
    action: ApprovalAction,
    modifications: Option<String>,
    actor: &str,
    run: bool,
) -> Result<()> {
    let modifications = modifications
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()
        .context("--modifications must be valid JSON")?;

    let response = match service
        .handle_approval(workflow_id, phase_id, action, modifications, actor)
        .await
    {
        Ok(response) => response,
        Err(e) if e.is_caller_error() => {
            print_json(&ApprovalResponse {
                success: false,
                message: e.to_string(),
            })?;
            return Err(e).with_context(|| {
                format!("Failed to {} {}/{}", action, workflow_id, phase_id)
            });
        }
        Err(e) => return Err(e.into()),
    };
    print_json(&response)?;

    if run {
        print_json(&service.run_workflow(workflow_id).await?)?;
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
