// Inkforge CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Support text/json/yaml output formats for scripting.
// Design Decision: Exit codes are part of the contract: 0 success, 1 not
// found / not ready, 2 validation, 3 unknown workflow, 4 storage error.

mod client;
mod commands;
mod output;

use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "inkforge")]
#[command(about = "Inkforge CLI - Submit and track content workflow tasks")]
#[command(version)]
pub struct Cli {
    /// API base URL
    #[arg(
        long,
        env = "INKFORGE_API_URL",
        default_value = "http://localhost:8080"
    )]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json", "yaml"])]
    pub output: String,

    /// Suppress non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a workflow task
    Create {
        /// Registered workflow type
        #[arg(long)]
        workflow_type: String,

        /// Execution mode
        #[arg(long, default_value = "async", value_parser = ["sync", "async"])]
        mode: String,

        /// Workflow parameter as key=value (kebab-case keys accepted)
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Idempotency key collapsing repeated submissions
        #[arg(long)]
        idempotency_key: Option<String>,

        /// Priority 1..=10 (1 highest)
        #[arg(long)]
        priority: Option<u8>,

        /// Callback URL notified on terminal transitions
        #[arg(long)]
        callback_url: Option<String>,

        /// ISO-8601 time to start the task
        #[arg(long)]
        schedule_at: Option<String>,
    },

    /// Show a task's status
    Status {
        #[arg(long)]
        task_id: Uuid,
    },

    /// Fetch a completed task's results
    Result {
        #[arg(long)]
        task_id: Uuid,
    },

    /// Cancel a task
    Cancel {
        #[arg(long)]
        task_id: Uuid,
    },

    /// Inspect registered workflows
    Workflows {
        #[command(subcommand)]
        command: commands::workflows::WorkflowsCommand,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = client::Client::new(&cli.api_url);
    let format = output::OutputFormat::from_str(&cli.output);

    let code = match cli.command {
        Commands::Create {
            workflow_type,
            mode,
            params,
            idempotency_key,
            priority,
            callback_url,
            schedule_at,
        } => {
            commands::create::run(
                &client,
                format,
                cli.quiet,
                commands::create::CreateArgs {
                    workflow_type,
                    mode,
                    params,
                    idempotency_key,
                    priority,
                    callback_url,
                    schedule_at,
                },
            )
            .await
        }
        Commands::Status { task_id } => commands::status::run(&client, format, task_id).await,
        Commands::Result { task_id } => commands::result::run(&client, format, task_id).await,
        Commands::Cancel { task_id } => {
            commands::cancel::run(&client, format, cli.quiet, task_id).await
        }
        Commands::Workflows { command } => {
            commands::workflows::run(&client, format, command).await
        }
    };

    std::process::exit(code);
}
