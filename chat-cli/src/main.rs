//! # duet
//!
//! CLI tool for duet two-party conversations.
//!
//! ## Commands
//!
//! - `init`: Create the local participant profile
//! - `key`: Show the conversation key for two participants
//! - `send`: Send a message to a peer
//! - `history`: Show a conversation
//! - `status`: Show profile and store status
//! - `demo`: Run a scripted exchange in memory
//!
//! ## Example
//!
//! ```bash
//! # Two profiles sharing one store directory
//! duet --data-dir ./alice --store-dir ./shared init --name alice
//! duet --data-dir ./bob --store-dir ./shared init --name bob
//!
//! duet --data-dir ./alice --store-dir ./shared send bob "hey bob"
//! duet --data-dir ./bob --store-dir ./shared history alice --mark-read
//! duet --data-dir ./alice --store-dir ./shared history bob
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::history::HistoryOptions;
use commands::{demo, history, init, key, send, status};

/// CLI tool for duet two-party conversations.
#[derive(Parser, Debug)]
#[command(name = "duet")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory holding the local profile
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Directory of conversation documents (defaults to <data-dir>/store)
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,

    /// Engine configuration file (defaults to <data-dir>/duet.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the local participant profile
    Init {
        /// Participant id
        #[arg(long, short)]
        name: String,
    },

    /// Show the conversation key for two participants
    Key {
        /// First participant
        a: String,
        /// Second participant
        b: String,
    },

    /// Send a message to a peer
    Send {
        /// Peer participant id
        peer: String,
        /// Message text
        text: String,
    },

    /// Show a conversation
    History {
        /// Peer participant id
        peer: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,

        /// Mark everything from the peer read
        #[arg(long)]
        mark_read: bool,
    },

    /// Show profile and store status
    Status,

    /// Run a scripted exchange in memory
    Demo {
        /// Deliver changes by polling instead of push
        #[arg(long)]
        poll: bool,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Commands that touch no files
    match &cli.command {
        Commands::Key { a, b } => return key::run(a, b),
        Commands::Demo { poll, json } => {
            let config = match &cli.config {
                Some(path) => duet_chat_client::ChatConfig::from_file(path)
                    .with_context(|| format!("Failed to load {}", path.display()))?,
                None => duet_chat_client::ChatConfig::default(),
            };
            return demo::run(&config, *poll, *json).await;
        }
        _ => {}
    }

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    tokio::fs::create_dir_all(&data_dir)
        .await
        .context("Failed to create data directory")?;
    let store_dir = cli.store_dir.unwrap_or_else(|| data_dir.join("store"));

    match cli.command {
        Commands::Init { name } => {
            init::run(&data_dir, &name).await?;
        }
        Commands::Send { peer, text } => {
            let config = config::load_chat_config(&data_dir, cli.config.as_deref())?;
            send::run(&data_dir, &store_dir, &config, &peer, &text).await?;
        }
        Commands::History {
            peer,
            json,
            mark_read,
        } => {
            let config = config::load_chat_config(&data_dir, cli.config.as_deref())?;
            history::run(
                &data_dir,
                &store_dir,
                &config,
                &peer,
                HistoryOptions { json, mark_read },
            )
            .await?;
        }
        Commands::Status => {
            status::run(&data_dir, &store_dir).await?;
        }
        Commands::Key { .. } | Commands::Demo { .. } => {}
    }

    Ok(())
}

/// Get the default data directory for duet.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("chat", "duet", "duet")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}
