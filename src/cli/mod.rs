//! CLI definitions using clap.

use crate::layout::FolderKind;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

/// storestack - SQLite store lifecycle and progressive migrations
#[derive(Parser, Debug)]
#[command(name = "storestack", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: ~/.storestack/config.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print version information
    Version,

    /// Write a config file from the given store flags
    Init(InitArgs),

    /// Show a store's schema version and the models available for it
    Info(StoreArgs),

    /// Migrate a store to the current (or given) model version, step by step
    Migrate(MigrateArgs),

    /// Remove files in the store directory that do not belong to the store
    Clean(CleanArgs),

    /// Configure and start a store, then report its contents
    Open(OpenArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Where the store and its models live. Flags override the config file.
#[derive(Args, Debug, Clone, Default)]
pub struct StoreArgs {
    /// Store name (file stem of `<name>.sqlite`)
    #[arg(long)]
    pub name: Option<String>,

    /// Directory of `<id>.sql` models and `<from>-<to>.mapping.sql` mappings
    #[arg(long)]
    pub models: Option<PathBuf>,

    /// Store directory (overrides --folder and --app-group)
    #[arg(long)]
    pub store_dir: Option<PathBuf>,

    /// Logical folder the store lives in
    #[arg(long, value_enum)]
    pub folder: Option<FolderKind>,

    /// Application group sharing the store
    #[arg(long)]
    pub app_group: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct InitArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Overwrite an existing config file
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug, Clone)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Target model version (default: the highest model)
    #[arg(long)]
    pub to: Option<i32>,

    /// Show the planned steps without migrating
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CleanArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// List the files that would be removed
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct OpenArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Open without migrating first
    #[arg(long)]
    pub no_migrate: bool,
}

/// Supported shells for completions.
#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}
