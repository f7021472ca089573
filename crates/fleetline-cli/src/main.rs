mod commands;
mod executor;
mod runtime;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fleetline_observability::{init_process_logging, ProcessKind};
use fleetline_types::{AgentStatus, ApprovalStatus, TaskStatus};

use commands::EXIT_USAGE_ERROR;
use runtime::Runtime;

#[derive(Parser)]
#[command(name = "fleetline", about = "Control plane for multi-agent workflow sessions")]
struct Cli {
    /// Project root; defaults to the current directory.
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bus, session, and agent-count snapshot.
    Status,
    /// Print the effective merged configuration.
    Config,
    #[command(subcommand)]
    Session(SessionCommand),
    #[command(subcommand)]
    Task(TaskCommand),
    #[command(subcommand)]
    Agent(AgentCommand),
    #[command(subcommand)]
    Tool(ToolCommand),
    /// Rolling-window metrics for a scope.
    Metrics { scope: String },
    /// Show a task's full record for review.
    Review { task_id: String },
    /// Render a handoff summary for the active session.
    Handoff {
        #[arg(long)]
        session_id: String,
        reason: String,
    },
    /// Tail a session's activity log.
    Logs {
        #[arg(long)]
        session_id: String,
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },
    #[command(subcommand)]
    Approvals(ApprovalsCommand),
}

#[derive(Subcommand)]
enum SessionCommand {
    Start { session_id: String },
    End {
        session_id: String,
        #[arg(long)]
        failed: bool,
    },
    List,
}

#[derive(Subcommand)]
enum TaskCommand {
    Create {
        id: String,
        description: String,
        #[arg(long, default_value_t = 3)]
        priority: u8,
    },
    List {
        #[arg(long)]
        status: Option<String>,
    },
    Show { id: String },
    Update {
        id: String,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        priority: Option<u8>,
    },
    Complete { id: String },
}

#[derive(Subcommand)]
enum AgentCommand {
    Spawn {
        agent_id: String,
        agent_type: String,
        #[arg(long, default_value = "base-default")]
        model: String,
    },
    List {
        #[arg(long)]
        status: Option<String>,
    },
    Show { agent_id: String },
    Pause { agent_id: String },
    Resume { agent_id: String },
    Terminate { agent_id: String },
    Heartbeat {
        agent_id: String,
        #[arg(long)]
        tokens_used: Option<u64>,
        #[arg(long)]
        input_tokens: Option<u64>,
        #[arg(long)]
        output_tokens: Option<u64>,
        #[arg(long)]
        cost_usd: Option<f64>,
    },
    SwitchModel { agent_id: String, model: String },
}

#[derive(Subcommand)]
enum ToolCommand {
    Check {
        tool: String,
        operation: String,
        path: Option<PathBuf>,
    },
    Simulate {
        #[arg(long)]
        session_id: String,
        tool: String,
        operation: String,
        path: Option<PathBuf>,
    },
    Read {
        #[arg(long)]
        session_id: String,
        path: PathBuf,
    },
    Write {
        #[arg(long)]
        session_id: String,
        path: PathBuf,
    },
    Edit {
        #[arg(long)]
        session_id: String,
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum ApprovalsCommand {
    List {
        #[arg(long)]
        status: Option<String>,
    },
    Decide {
        approval_id: String,
        #[arg(long)]
        grant: bool,
        #[arg(long)]
        reason: Option<String>,
    },
}

fn parse_task_status(raw: &str) -> Option<TaskStatus> {
    match raw {
        "pending" => Some(TaskStatus::Pending),
        "in_progress" => Some(TaskStatus::InProgress),
        "done" => Some(TaskStatus::Done),
        "blocked" => Some(TaskStatus::Blocked),
        "failed" => Some(TaskStatus::Failed),
        _ => None,
    }
}

fn parse_agent_status(raw: &str) -> Option<AgentStatus> {
    match raw {
        "pending" => Some(AgentStatus::Pending),
        "running" => Some(AgentStatus::Running),
        "paused" => Some(AgentStatus::Paused),
        "completed" => Some(AgentStatus::Completed),
        "failed" => Some(AgentStatus::Failed),
        "terminated" => Some(AgentStatus::Terminated),
        _ => None,
    }
}

fn parse_approval_status(raw: &str) -> Option<ApprovalStatus> {
    match raw {
        "required" => Some(ApprovalStatus::Required),
        "granted" => Some(ApprovalStatus::Granted),
        "denied" => Some(ApprovalStatus::Denied),
        _ => None,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let project_root = cli.project_root.unwrap_or_else(|| PathBuf::from("."));
    let logs_dir = fleetline_core::DataPaths::resolve(&project_root).logs_dir();

    let _log_guard = match init_process_logging(ProcessKind::Cli, &logs_dir, 14) {
        Ok((guard, _info)) => Some(guard),
        Err(err) => {
            eprintln!("warning: failed to initialize logging: {err}");
            None
        }
    };

    let runtime = match Runtime::init(&project_root).await {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to initialize runtime: {err}");
            std::process::exit(EXIT_USAGE_ERROR);
        }
    };

    let exit_code = match cli.command {
        Command::Status => commands::status(&runtime).await,
        Command::Config => commands::config(&runtime).await,
        Command::Session(sub) => match sub {
            SessionCommand::Start { session_id } => commands::session::start(&runtime, &session_id).await,
            SessionCommand::End { session_id, failed } => commands::session::end(&runtime, &session_id, failed).await,
            SessionCommand::List => commands::session::list(&runtime).await,
        },
        Command::Task(sub) => match sub {
            TaskCommand::Create { id, description, priority } => {
                commands::task::create(&runtime, &id, &description, priority).await
            }
            TaskCommand::List { status } => match status.as_deref().map(parse_task_status) {
                Some(None) => {
                    eprintln!("error: unknown task status {}", status.unwrap());
                    EXIT_USAGE_ERROR
                }
                Some(Some(status)) => commands::task::list(&runtime, Some(status)).await,
                None => commands::task::list(&runtime, None).await,
            },
            TaskCommand::Show { id } => commands::task::show(&runtime, &id).await,
            TaskCommand::Update { id, status, priority } => {
                match status.as_deref().map(parse_task_status) {
                    Some(None) => {
                        eprintln!("error: unknown task status {}", status.unwrap());
                        EXIT_USAGE_ERROR
                    }
                    Some(Some(status)) => commands::task::update(&runtime, &id, Some(status), priority).await,
                    None => commands::task::update(&runtime, &id, None, priority).await,
                }
            }
            TaskCommand::Complete { id } => commands::task::complete(&runtime, &id).await,
        },
        Command::Agent(sub) => match sub {
            AgentCommand::Spawn { agent_id, agent_type, model } => {
                commands::agent::spawn(&runtime, &agent_id, &agent_type, &model).await
            }
            AgentCommand::List { status } => match status.as_deref().map(parse_agent_status) {
                Some(None) => {
                    eprintln!("error: unknown agent status {}", status.unwrap());
                    EXIT_USAGE_ERROR
                }
                Some(Some(status)) => commands::agent::list(&runtime, Some(status)).await,
                None => commands::agent::list(&runtime, None).await,
            },
            AgentCommand::Show { agent_id } => commands::agent::show(&runtime, &agent_id).await,
            AgentCommand::Pause { agent_id } => commands::agent::pause(&runtime, &agent_id).await,
            AgentCommand::Resume { agent_id } => commands::agent::resume(&runtime, &agent_id).await,
            AgentCommand::Terminate { agent_id } => commands::agent::terminate(&runtime, &agent_id).await,
            AgentCommand::Heartbeat { agent_id, tokens_used, input_tokens, output_tokens, cost_usd } => {
                commands::agent::heartbeat(&runtime, &agent_id, tokens_used, input_tokens, output_tokens, cost_usd).await
            }
            AgentCommand::SwitchModel { agent_id, model } => {
                commands::agent::switch_model(&runtime, &agent_id, &model).await
            }
        },
        Command::Tool(sub) => match sub {
            ToolCommand::Check { tool, operation, path } => commands::tool::check(&runtime, &tool, &operation, path).await,
            ToolCommand::Simulate { session_id, tool, operation, path } => {
                commands::tool::simulate(&runtime, &session_id, &tool, &operation, path).await
            }
            ToolCommand::Read { session_id, path } => commands::tool::read(&runtime, &session_id, path).await,
            ToolCommand::Write { session_id, path } => commands::tool::write(&runtime, &session_id, path).await,
            ToolCommand::Edit { session_id, path } => commands::tool::edit(&runtime, &session_id, path).await,
        },
        Command::Metrics { scope } => commands::metrics(&runtime, &scope).await,
        Command::Review { task_id } => commands::review(&runtime, &task_id).await,
        Command::Handoff { session_id, reason } => commands::handoff(&runtime, &session_id, &reason).await,
        Command::Logs { session_id, lines } => commands::logs(&runtime, &session_id, lines).await,
        Command::Approvals(sub) => match sub {
            ApprovalsCommand::List { status } => match status.as_deref().map(parse_approval_status) {
                Some(None) => {
                    eprintln!("error: unknown approval status {}", status.unwrap());
                    EXIT_USAGE_ERROR
                }
                Some(Some(status)) => commands::approvals::list(&runtime, Some(status)).await,
                None => commands::approvals::list(&runtime, None).await,
            },
            ApprovalsCommand::Decide { approval_id, grant, reason } => {
                commands::approvals::decide(&runtime, &approval_id, grant, reason).await
            }
        },
    };

    std::process::exit(exit_code);
}
