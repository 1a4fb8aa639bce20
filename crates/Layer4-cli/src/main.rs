//! Yard CLI - Main entry point

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use yard_foundation::YardConfig;

/// Yard - run a coding agent against isolated task worktrees
#[derive(Parser, Debug)]
#[command(name = "yard")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a task and follow its run until idle (Ctrl-C stops it)
    Run {
        /// Environment (bare mirror) id
        env: String,

        prompt: String,

        #[arg(long)]
        model: Option<String>,

        /// Reasoning effort (minimal, low, medium, high, xhigh)
        #[arg(long)]
        effort: Option<String>,

        /// Give the agent its own nested container engine
        #[arg(long)]
        sidecar: bool,

        /// Extra environment checked out read-only next to the worktree
        #[arg(long = "context", value_name = "ENV")]
        contexts: Vec<String>,

        /// File copied into the task's attachments directory
        #[arg(long = "attach", value_name = "PATH")]
        attachments: Vec<PathBuf>,

        /// Branch name (default: yard/<task id>)
        #[arg(long)]
        branch: Option<String>,

        /// Ref the branch starts from
        #[arg(long)]
        base: Option<String>,
    },
    /// Continue a task's conversation with a new prompt
    Resume {
        id: String,

        prompt: String,

        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        effort: Option<String>,

        /// Force the sidecar on or off (default: the task's setting)
        #[arg(long)]
        sidecar: Option<bool>,
    },
    /// List tasks
    List,
    /// Print a task record as JSON
    Show { id: String },
    /// Print a run's log
    Logs {
        id: String,

        /// Run label (default: the latest run)
        #[arg(long)]
        run: Option<String>,

        /// Show the error log instead of the output log
        #[arg(long)]
        stderr: bool,

        /// Only the last N lines
        #[arg(short = 'n', long)]
        tail: Option<usize>,
    },
    /// Delete a task and its workspace
    Delete { id: String },
    /// Mark runs left in flight by a crashed process as failed
    Recover,
    /// Manage stored credentials
    Accounts {
        #[command(subcommand)]
        command: AccountsCommand,
    },
}

#[derive(Subcommand, Debug)]
enum AccountsCommand {
    /// List stored accounts
    List,
    /// Make an account the active one
    Use { id: String },
    /// Read an account's rate limits (default: the active account)
    Limits { id: Option<String> },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut config = YardConfig::load()?;
    if let Some(dir) = args.data_dir {
        config = config.with_data_dir(dir);
    }

    let app = commands::App::new(config);

    match args.command {
        Command::Run {
            env,
            prompt,
            model,
            effort,
            sidecar,
            contexts,
            attachments,
            branch,
            base,
        } => {
            let options = commands::RunOptions {
                model,
                effort,
                sidecar,
                contexts,
                attachments,
                branch,
                base,
            };
            app.run(env, prompt, options).await
        }
        Command::Resume {
            id,
            prompt,
            model,
            effort,
            sidecar,
        } => app.resume(&id, prompt, model, effort, sidecar).await,
        Command::List => app.list(),
        Command::Show { id } => app.show(&id),
        Command::Logs {
            id,
            run,
            stderr,
            tail,
        } => app.logs(&id, run.as_deref(), stderr, tail),
        Command::Delete { id } => app.delete(&id).await,
        Command::Recover => app.recover(),
        Command::Accounts { command } => match command {
            AccountsCommand::List => app.accounts_list(),
            AccountsCommand::Use { id } => app.accounts_use(&id),
            AccountsCommand::Limits { id } => app.accounts_limits(id.as_deref()).await,
        },
    }
}
