//! Command-line interface for devhaven.
//!
//! Parses arguments and handles the subcommands that need no tmux session
//! (`init-config`). Everything else is handed to [`crate::app::App`].

use clap::{Parser, Subcommand};
use devhaven_config::Config;
use devhaven_tmux::TmuxPaneId;
use std::path::PathBuf;

/// devhaven - tmux sessions for your workspaces
#[derive(Parser, Debug)]
#[command(name = "devhaven")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file to use instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Set debug log level (overrides config and RUST_LOG)
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevelArg>,
}

/// Log level argument for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevelArg {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevelArg {
    /// Convert to `log::LevelFilter`
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevelArg::Off => log::LevelFilter::Off,
            LogLevelArg::Error => log::LevelFilter::Error,
            LogLevelArg::Warn => log::LevelFilter::Warn,
            LogLevelArg::Info => log::LevelFilter::Info,
            LogLevelArg::Debug => log::LevelFilter::Debug,
            LogLevelArg::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Workspace selection shared by the session subcommands
#[derive(clap::Args, Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceArgs {
    /// Workspace name; becomes the tmux session name
    pub workspace: String,

    /// Workspace directory (default: current directory)
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Open or reattach a workspace session and print its windows and panes
    Open {
        #[command(flatten)]
        target: WorkspaceArgs,

        /// Keep the session attached and print events as JSON lines until interrupted
        #[arg(long)]
        watch: bool,
    },

    /// List sessions on the tmux server
    Sessions,

    /// Report whether tmux is installed and new enough for control mode
    Check,

    /// Print a pane's screen and scrollback
    Capture {
        #[command(flatten)]
        target: WorkspaceArgs,

        /// Pane id such as `%3` (default: the active pane)
        #[arg(long, value_parser = parse_pane_id)]
        pane: Option<TmuxPaneId>,
    },

    /// Type text into a pane
    Send {
        #[command(flatten)]
        target: WorkspaceArgs,

        /// Pane id such as `%3` (default: the active pane)
        #[arg(long, value_parser = parse_pane_id)]
        pane: Option<TmuxPaneId>,

        /// Press Enter after the text
        #[arg(long)]
        enter: bool,

        /// Text to type
        text: String,
    },

    /// Kill a workspace session
    Close {
        #[command(flatten)]
        target: WorkspaceArgs,
    },

    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

/// Accept `%3` as well as `3`.
pub fn parse_pane_id(value: &str) -> Result<TmuxPaneId, String> {
    value
        .strip_prefix('%')
        .unwrap_or(value)
        .parse()
        .map_err(|_| format!("invalid pane id '{value}', expected e.g. %3"))
}

/// Runtime options passed from CLI to the application
#[derive(Clone, Debug)]
pub struct RuntimeOptions {
    pub command: Commands,
    /// Config file override
    pub config_path: Option<PathBuf>,
    /// Log level override from CLI
    pub log_level: Option<log::LevelFilter>,
}

/// Result of CLI processing
pub enum CliResult {
    /// Continue with normal application startup
    Continue(RuntimeOptions),
    /// Exit with the given code (subcommand completed)
    Exit(i32),
}

/// Process CLI arguments and handle subcommands
pub fn process_cli() -> CliResult {
    resolve(Cli::parse())
}

/// Split parsed arguments into work done here and work for the app.
pub fn resolve(cli: Cli) -> CliResult {
    match cli.command {
        Commands::InitConfig { force } => {
            let path = cli.config.unwrap_or_else(Config::config_path);
            match init_config(&path, force) {
                Ok(()) => {
                    println!("Wrote {}", path.display());
                    CliResult::Exit(0)
                }
                Err(e) => {
                    eprintln!("devhaven: error: {e:#}");
                    CliResult::Exit(1)
                }
            }
        }
        command => CliResult::Continue(RuntimeOptions {
            command,
            config_path: cli.config,
            log_level: cli.log_level.map(|l| l.to_level_filter()),
        }),
    }
}

fn init_config(path: &std::path::Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save_to(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_config_respects_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        init_config(&path, false).unwrap();
        assert!(path.exists());
        assert!(init_config(&path, false).is_err());
        init_config(&path, true).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, Config::default());
    }
}
