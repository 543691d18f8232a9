use crate::command;
use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "sc")]
#[command(about = "Disposable, isolated dev sandboxes: a git worktree plus a container per task")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a sandbox and start the agent in it
    Create {
        /// Sandbox name (letters, digits and hyphens)
        name: String,

        /// Task handed to the agent as its first prompt
        #[arg(trailing_var_arg = true)]
        task: Vec<String>,
    },

    /// Stop and remove a sandbox, its container and its worktree
    #[command(visible_alias = "rm")]
    Stop {
        /// Sandbox name (defaults to the sandbox of the current directory)
        #[arg(conflicts_with = "all")]
        name: Option<String>,

        /// Stop every sandbox of the project
        #[arg(long)]
        all: bool,
    },

    /// List the sandboxes of the project
    #[command(visible_alias = "ls")]
    List,

    /// Attach to the session of a sandbox
    Connect {
        /// Sandbox name (defaults to the sandbox of the current directory)
        name: Option<String>,
    },

    /// Merge a sandbox branch into the current branch
    Merge {
        /// Sandbox name (defaults to the sandbox of the current directory)
        name: Option<String>,
    },

    /// Show uncommitted changes in a sandbox
    Diff {
        /// Sandbox name (defaults to the sandbox of the current directory)
        name: Option<String>,
    },

    /// Copy fresh agent credentials into a running sandbox
    Refresh {
        /// Sandbox name (defaults to the sandbox of the current directory)
        name: Option<String>,
    },

    /// Sync the state file with the container runtime
    Reconcile,

    /// Remove stopped sandboxes and orphaned worktrees
    Cleanup,
}

// --- Public Entry Point ---
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let manager = command::open_manager()?;

    match cli.command {
        Commands::Create { name, task } => command::create::run(manager, &name, &task.join(" ")),
        Commands::Stop { name, all } => command::stop::run(manager, name.as_deref(), all),
        Commands::List => command::list::run(&manager),
        Commands::Connect { name } => command::connect::run(&manager, name.as_deref()),
        Commands::Merge { name } => command::merge::run(&manager, name.as_deref()),
        Commands::Diff { name } => command::diff::run(&manager, name.as_deref()),
        Commands::Refresh { name } => command::refresh::run(&manager, name.as_deref()),
        Commands::Reconcile => command::reconcile::run(&manager),
        Commands::Cleanup => command::cleanup::run(&manager),
    }
}
