use clap::{Parser, Subcommand};
use std::path::PathBuf;

use genrouter::generation::GenerationCategory;
use genrouter::storage::Tier;

#[derive(Parser)]
#[command(name = "genrouter")]
#[command(about = "Quota-gated, metered AI generation with cross-provider fallback")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Log to stderr only
    #[arg(long, global = true)]
    pub no_log_file: bool,

    /// Keep quota counters and balances in memory instead of SQLite
    #[arg(long, global = true)]
    pub ephemeral: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one generation through admission, dispatch and metering
    Generate {
        /// Account the generation is charged to
        #[arg(short, long)]
        user: String,

        /// Studio category (image, video, song, tts, chat)
        #[arg(long, default_value = "chat")]
        category: GenerationCategory,

        /// Logical model id
        #[arg(short, long)]
        model: String,

        /// Optional system instruction
        #[arg(short, long)]
        system: Option<String>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,

        prompt: String,
    },

    /// Show which provider and model a logical model id routes to
    Resolve { model: String },

    /// Bucket an upstream error message
    Classify { message: String },

    /// Show monthly quota status
    Quota {
        #[arg(short, long)]
        user: String,

        /// Single category (all if omitted)
        #[arg(long)]
        category: Option<GenerationCategory>,
    },

    /// Show or update an account's tier and token balance
    Account {
        #[arg(short, long)]
        user: String,

        #[arg(long)]
        tier: Option<Tier>,

        /// Free token bucket
        #[arg(long)]
        free: Option<u64>,

        /// Purchased token bucket
        #[arg(long)]
        paid: Option<u64>,
    },

    /// List model routes with their per-message cost
    Models,

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration with keys redacted
    Show,
}
