//! Eigen CLI - chat with local models from the terminal.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

/// Eigen - private chat with local language models
#[derive(Parser)]
#[command(name = "eigen")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage downloadable models
    Models {
        #[command(subcommand)]
        command: ModelsCommand,
    },

    /// Show paths, the selected model and download state
    Status,

    /// Chat with the selected model
    Chat {
        /// Send one message and exit instead of starting a session
        message: Option<String>,
        /// Chat identifier used for history
        #[arg(long, default_value = "cli")]
        chat_id: String,
        /// Attach an image to the first message
        #[arg(long = "image")]
        images: Vec<PathBuf>,
        /// Inline a text file into the first message
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
        /// Print the model's reasoning as it streams
        #[arg(long)]
        show_reasoning: bool,
    },

    /// Suggest a title for a chat opening with TEXT
    Title {
        text: String,
    },
}

#[derive(Subcommand)]
enum ModelsCommand {
    /// List catalog models and their state
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Download a model
    Pull { id: String },
    /// Delete a downloaded model
    Rm { id: String },
    /// Load a model and remember it as the default
    Use { id: String },
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose { "debug" } else { "warn" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_env("EIGEN_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| miette::miette!("Failed to start async runtime: {}", e))?;

    match cli.command {
        Commands::Models { command } => match command {
            ModelsCommand::List { json } => commands::models::list(json),
            ModelsCommand::Pull { id } => rt.block_on(commands::models::pull(&id)),
            ModelsCommand::Rm { id } => rt.block_on(commands::models::remove(&id)),
            ModelsCommand::Use { id } => rt.block_on(commands::models::select(&id)),
        },
        Commands::Status => rt.block_on(commands::status::run()),
        Commands::Chat {
            message,
            chat_id,
            images,
            attachments,
            show_reasoning,
        } => rt.block_on(commands::chat::run(commands::chat::ChatOptions {
            message,
            chat_id,
            images,
            attachments,
            show_reasoning,
        })),
        Commands::Title { text } => rt.block_on(commands::chat::title(&text)),
    }
}
