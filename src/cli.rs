use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "yard")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Converge declared infrastructure resources in dependency order", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: ~/.config/yard/yard.toml)
    #[arg(long, global = true, env = "YARD_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create, replace or refresh resources to match a resource set
    Apply(ApplyArgs),

    /// Tear down every resource of a resource set, dependents first
    Destroy(DestroyArgs),

    /// Show what apply would change without changing anything
    Plan(PlanArgs),

    /// Inspect the state file
    #[command(subcommand)]
    State(StateCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Resource set file (TOML)
    pub file: PathBuf,

    /// Worker threads per level
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// State file (overrides config)
    #[arg(long)]
    pub state: Option<PathBuf>,
}

#[derive(Args)]
pub struct DestroyArgs {
    /// Resource set file (TOML)
    pub file: PathBuf,

    /// Retry failed destroys with the non-graceful strategy
    #[arg(long)]
    pub force: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Worker threads per level
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// State file (overrides config)
    #[arg(long)]
    pub state: Option<PathBuf>,
}

#[derive(Args)]
pub struct PlanArgs {
    /// Resource set file (TOML)
    pub file: PathBuf,

    /// State file (overrides config)
    #[arg(long)]
    pub state: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum StateCommand {
    /// List applied resources
    List {
        /// State file (overrides config)
        #[arg(long)]
        state: Option<PathBuf>,
    },

    /// Show one applied resource
    Show {
        /// Resource ID (e.g. module.network.container.consul)
        id: String,

        /// State file (overrides config)
        #[arg(long)]
        state: Option<PathBuf>,
    },
}
