//! pansync CLI - resumable transfers and directory sync
//!
//! Uploads, downloads and one-way directory sync against the remote store.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// pansync - resumable cloud transfers
#[derive(Parser)]
#[command(name = "pansync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration directory (settings, caches, token)
    #[arg(long, env = "PANSYNC_CONFIG_DIR", global = true)]
    config_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human", global = true)]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Parallel workers per transfer
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Always use segmented downloads
    #[arg(long, global = true)]
    segmented: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file or directory
    Upload {
        /// Local file or directory
        local: PathBuf,

        /// Remote destination, relative to the remote root
        remote: Option<String>,
    },

    /// Download a file or directory
    Download {
        /// Remote file or directory
        remote: String,

        /// Local destination (defaults to the current directory)
        local: Option<PathBuf>,
    },

    /// Compare a local directory with a remote one
    Compare {
        local: PathBuf,
        remote: String,
    },

    /// Make the remote directory match the local one
    SyncUp {
        local: PathBuf,
        remote: String,

        /// Delete remote files missing locally
        #[arg(long)]
        delete: bool,
    },

    /// Make the local directory match the remote one
    SyncDown {
        remote: String,
        local: PathBuf,

        /// Delete local files missing remotely
        #[arg(long)]
        delete: bool,
    },

    /// List a remote directory
    Ls {
        #[arg(default_value = "")]
        remote: String,

        /// Include every file below the directory
        #[arg(short, long)]
        recursive: bool,
    },

    /// Search remote files by name
    Search {
        key: String,

        /// Restrict the search to this directory
        #[arg(short, long)]
        dir: Option<String>,
    },

    /// Create a remote directory
    Mkdir { remote: String },

    /// Delete remote files or directories
    Rm {
        #[arg(required = true)]
        remotes: Vec<String>,
    },

    /// Move a remote file
    Mv { src: String, dst: String },

    /// Copy a remote file
    Cp { src: String, dst: String },

    /// Rename a remote file in place
    Rename { remote: String, newname: String },

    /// Show configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand, Clone, Copy, Debug)]
pub enum ConfigAction {
    /// Show the effective settings
    Show,

    /// Print the configuration directory and its files
    Path,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = cli.command {
        use clap::CommandFactory;
        clap_complete::generate(shell, &mut Cli::command(), "pansync", &mut std::io::stdout());
        return Ok(());
    }

    let paths = pansync_core::ConfigPaths::resolve(cli.config_dir)?;
    let settings = pansync_core::load_settings(&paths)?;
    tracing::debug!("Using config dir {}", paths.root().display());

    if let Commands::Config { action } = cli.command {
        return commands::config_action(&paths, &settings, action, cli.output);
    }

    let token = pansync_core::token_provider(&paths);
    let core = pansync_core::Pansync::open(&paths, settings, token).await?;
    let options = commands::TransferOptions {
        workers: cli.workers,
        segmented: cli.segmented,
        format: cli.output,
    };

    match cli.command {
        Commands::Upload { local, remote } => {
            commands::upload(&core, &local, remote, &options).await?
        }

        Commands::Download { remote, local } => {
            commands::download(&core, &remote, local, &options).await?
        }

        Commands::Compare { local, remote } => {
            commands::compare(&core, &local, &remote, cli.output).await?
        }

        Commands::SyncUp {
            local,
            remote,
            delete,
        } => commands::sync_up(&core, &local, &remote, delete, &options).await?,

        Commands::SyncDown {
            remote,
            local,
            delete,
        } => commands::sync_down(&core, &remote, &local, delete, &options).await?,

        Commands::Ls { remote, recursive } => {
            commands::list(&core, &remote, recursive, cli.output).await?
        }

        Commands::Search { key, dir } => {
            commands::search(&core, &key, dir.as_deref(), cli.output).await?
        }

        Commands::Mkdir { remote } => commands::mkdir(&core, &remote, cli.output).await?,

        Commands::Rm { remotes } => commands::remove(&core, &remotes, cli.output).await?,

        Commands::Mv { src, dst } => {
            commands::relocate(&core, &src, &dst, false, cli.output).await?
        }

        Commands::Cp { src, dst } => {
            commands::relocate(&core, &src, &dst, true, cli.output).await?
        }

        Commands::Rename { remote, newname } => {
            commands::rename(&core, &remote, &newname, cli.output).await?
        }

        Commands::Config { .. } | Commands::Completions { .. } => {}
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "pansync", "sync-up", "./photos", "photos", "--delete", "-w", "4", "--output", "json",
        ])
        .unwrap();
        assert_eq!(cli.workers, Some(4));
        assert_eq!(cli.output, OutputFormat::Json);
        match cli.command {
            Commands::SyncUp { delete, remote, .. } => {
                assert!(delete);
                assert_eq!(remote, "photos");
            }
            _ => panic!("expected sync-up"),
        }
    }

    #[test]
    fn test_rm_requires_a_path() {
        assert!(Cli::try_parse_from(["pansync", "rm"]).is_err());
    }
}
