use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "facesync",
    about = "Inspect and maintain the local face index"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show sync progress and index statistics
    Status(JsonArgs),
    /// List indexed files
    Files(FilesArgs),
    /// Show the stored ML record of one file
    Show(ShowArgs),
    /// Clear error counters so quarantined files are retried
    ResetErrors(ResetErrorsArgs),
    /// Show the current people clusters
    Clusters(JsonArgs),
    /// Recompute people clusters from stored embeddings
    Recluster(JsonArgs),
    /// Manage persisted sync settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

#[derive(Debug, Parser)]
pub struct JsonArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Files --

#[derive(Debug, Parser)]
pub struct FilesArgs {
    /// Only files still waiting to be processed
    #[arg(long, conflicts_with = "quarantined")]
    pub pending: bool,

    /// Only files that hit the error limit
    #[arg(long)]
    pub quarantined: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Show --

#[derive(Debug, Parser)]
pub struct ShowArgs {
    /// File id
    pub file_id: u64,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Reset errors --

#[derive(Debug, Parser)]
pub struct ResetErrorsArgs {
    /// Files to reset; all files when omitted
    pub file_ids: Vec<u64>,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show the resolved configuration
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a setting in the index database
    Set {
        /// Setting name (e.g. batch_size)
        key: String,
        value: String,
    },
    /// Remove a persisted setting (revert to default)
    Clear {
        /// Setting name
        key: String,
    },
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "facesync",
            &mut std::io::stdout(),
        );
    }
}
