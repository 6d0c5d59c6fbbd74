use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use declarative::FailurePolicy;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stackctl")]
#[command(author = "stackctl contributors")]
#[command(version)]
#[command(about = "Reconcile a k3s media stack from manifests, and tear k3s down cleanly", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: <config dir>/stackctl.toml)
    #[arg(long, global = true, env = "STACKCTL_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Make the cluster match a manifest directory
    Reconcile(ReconcileArgs),

    /// Show what reconcile would change, without changing anything
    Plan(PlanArgs),

    /// Remove k3s residue from this host
    Teardown(TeardownArgs),

    /// List teardown target sets
    Targets {
        /// Show every target of each set
        #[arg(short, long)]
        long: bool,
    },

    /// Show the last recorded runs
    Status,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Reconcile / Plan
// ============================================================================

/// Cluster connection flags shared by reconcile and plan
#[derive(Args, Clone, Debug, Default)]
pub struct ClusterArgs {
    /// kubeconfig context to use
    #[arg(long)]
    pub context: Option<String>,

    /// Deadline for each cluster call, in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// Manifest root (namespaces/, storage/, deployments/, ...)
    pub root: PathBuf,

    /// Operations to run in parallel
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Observe and plan, but apply nothing
    #[arg(long)]
    pub dry_run: bool,

    /// What to do after an operation fails
    #[arg(long, value_enum)]
    pub on_failure: Option<OnFailure>,

    /// Stop dispatching new operations after this many seconds
    #[arg(long, value_name = "SECS")]
    pub max_duration: Option<u64>,

    /// Scope to reconcile; only one reconcile per scope runs at a time,
    /// and only this scope's objects are ever deleted
    #[arg(long)]
    pub scope: Option<String>,

    #[command(flatten)]
    pub cluster: ClusterArgs,
}

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Manifest root
    pub root: PathBuf,

    /// Show a field diff for every update
    #[arg(short, long)]
    pub diff: bool,

    /// Scope whose objects count as orphans (default: from config)
    #[arg(long)]
    pub scope: Option<String>,

    #[command(flatten)]
    pub cluster: ClusterArgs,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OnFailure {
    /// Skip only what depends on the failed operation
    SkipDependents,
    /// Stop dispatching anything else
    Abort,
}

impl From<OnFailure> for FailurePolicy {
    fn from(value: OnFailure) -> Self {
        match value {
            OnFailure::SkipDependents => FailurePolicy::SkipDependents,
            OnFailure::Abort => FailurePolicy::Abort,
        }
    }
}

// ============================================================================
// Teardown
// ============================================================================

#[derive(Args, Debug)]
pub struct TeardownArgs {
    /// Target set to remove (see `stackctl targets`)
    #[arg(default_value = teardown::presets::K3S)]
    pub set: String,

    /// Discover and report, but change nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Don't ask for confirmation
    #[arg(short, long)]
    pub yes: bool,

    /// Deadline for each host command, in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Stop starting new actions after this many seconds
    #[arg(long, value_name = "SECS")]
    pub max_duration: Option<u64>,
}
