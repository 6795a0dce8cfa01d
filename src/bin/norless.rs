#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! CLI for the norless synchronizer
//!
//! Commands are given as positional arguments and run in the order
//! written, so `norless pull check` mirrors first and reports unread
//! counts afterwards.

use clap::{Parser, ValueEnum};
use norless::{Config, Error, SyncEngine};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Exit status when another instance holds the app lock.
const EXIT_LOCKED: u8 = 2;

#[derive(Parser)]
#[command(name = "norless")]
#[command(about = "Bidirectional IMAP to Maildir synchronizer")]
struct Args {
    /// Commands to run, in order
    #[arg(value_enum, required = true)]
    commands: Vec<Command>,

    /// Path to the configuration file
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Process this account only
    #[arg(short, long)]
    account: Option<String>,

    /// Run accounts sequentially in one worker
    #[arg(short, long)]
    sequential: bool,

    /// Suppress per-folder summaries
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Command {
    /// Mirror remote folders into local Maildirs
    Pull,
    /// Push local seen/deleted state to the servers
    RemotePush,
    /// Upload locally added messages
    UploadNew,
    /// Report unread counts per Maildir
    Check,
    /// List remote folders per account
    ShowFolders,
}

#[tokio::main]
async fn main() -> ExitCode {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(&args).await {
        Ok(code) => code,
        Err(Error::LockContention(path)) => {
            eprintln!("Another instance already running (lock: {})", path.display());
            ExitCode::from(EXIT_LOCKED)
        }
        Err(err) => {
            eprintln!("norless: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> norless::Result<ExitCode> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(norless::config::default_path);
    let mut config = Config::load(&config_path)?;
    if let Some(account) = &args.account {
        config.restrict_to(account)?;
    }

    let engine = SyncEngine::new(config)?
        .sequential(args.sequential)
        .quiet(args.quiet);

    let mut exit = ExitCode::SUCCESS;
    for command in &args.commands {
        match command {
            Command::Pull => engine.pull().await?,
            Command::RemotePush => engine.remote_push().await?,
            Command::UploadNew => engine.upload_new().await?,
            Command::Check => {
                if !engine.check()? {
                    exit = ExitCode::FAILURE;
                }
            }
            Command::ShowFolders => engine.show_folders().await?,
        }
    }
    Ok(exit)
}
