use clap::{Parser, Subcommand};
use clap_complete::Shell;
use safeguard::{ResourceId, ResourceState};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cloudsweep")]
#[command(version)]
#[command(about = "Safely tear down cloud resources from many terminals at once", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: ~/.config/cloudsweep/config.toml)
    #[arg(long, global = true, env = "CLOUDSWEEP_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Inspect and clean up resource locks
    #[command(subcommand)]
    Locks(LocksCommand),

    /// Inspect and repair the state document
    #[command(subcommand)]
    State(StateCommand),

    /// Show what depends on a resource
    Deps(DepsArgs),

    /// Delete a resource once nothing depends on it
    Delete(DeleteArgs),

    /// Browse filed error reports
    #[command(subcommand)]
    Errors(ErrorsCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Locks
// ============================================================================

#[derive(Subcommand)]
pub enum LocksCommand {
    /// List held locks and whether their owners are alive
    List,

    /// Remove locks whose owners have exited
    Sweep,
}

// ============================================================================
// State
// ============================================================================

#[derive(Subcommand)]
pub enum StateCommand {
    /// Show tracked resources and recent transitions
    Show {
        /// Print the raw document as JSON
        #[arg(long)]
        json: bool,

        /// Number of recent transitions to show
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },

    /// Show the record of one resource
    Get {
        /// Resource as <type>/<name>
        resource: ResourceId,
    },

    /// Record a state by hand, under the resource lock
    Set {
        /// Resource as <type>/<name>
        resource: ResourceId,

        /// unknown, unlocked, locked, mutating or deleted
        state: ResourceState,
    },

    /// Check that the state document parses
    Validate,

    /// Move a corrupt document aside and start a fresh one
    Repair,
}

// ============================================================================
// Deps / Delete
// ============================================================================

#[derive(Parser)]
pub struct DepsArgs {
    /// Resource as <type>/<name>
    pub resource: ResourceId,

    /// Inventory file describing resources and their dependencies
    #[arg(short, long, env = "CLOUDSWEEP_INVENTORY")]
    pub inventory: Option<PathBuf>,
}

#[derive(Parser)]
pub struct DeleteArgs {
    /// Resource as <type>/<name>
    pub resource: ResourceId,

    /// Inventory file describing resources and their dependencies
    #[arg(short, long, env = "CLOUDSWEEP_INVENTORY")]
    pub inventory: Option<PathBuf>,

    /// Also delete everything that depends on the resource
    #[arg(long)]
    pub cascade: bool,

    /// Show the deletion plan without changing anything
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Subcommand)]
pub enum ErrorsCommand {
    /// List filed reports, newest last
    List {
        /// Number of reports to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Show one report in full
    Show {
        /// Report identifier
        id: String,
    },
}
