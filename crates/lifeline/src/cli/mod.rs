//! Command-line interface for lifeline.
//!
//! This module provides the CLI structure for the `lifeline` binary, which
//! inspects the local event database: in-flight alerts, abandoned alerts that
//! need manual follow-up, and the armed safety check.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{ConfigCommand, EventsCommand, PruneCommand, StatusArg, StatusCommand};

/// lifeline - Offline-resilient emergency alerts
///
/// Inspect the emergency events recorded on this device, including alerts
/// still waiting for connectivity and alerts that could not be delivered.
#[derive(Debug, Parser)]
#[command(name = "lifeline")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show queue and safety check status
    Status(StatusCommand),

    /// Inspect recorded events
    #[command(subcommand)]
    Events(EventsCommand),

    /// Delete finished events past retention
    Prune(PruneCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        crate::logging::Verbosity::from_flags(self.quiet, self.verbose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn status_cli(verbose: u8, quiet: bool) -> Cli {
        Cli {
            config: None,
            verbose,
            quiet,
            command: Command::Status(StatusCommand { json: false }),
        }
    }

    #[test]
    fn test_cli_name() {
        let cli = Cli::command();
        assert_eq!(cli.get_name(), "lifeline");
    }

    #[test]
    fn test_verbosity_quiet() {
        assert_eq!(
            status_cli(0, true).verbosity(),
            crate::logging::Verbosity::Quiet
        );
    }

    #[test]
    fn test_verbosity_normal() {
        assert_eq!(
            status_cli(0, false).verbosity(),
            crate::logging::Verbosity::Normal
        );
    }

    #[test]
    fn test_verbosity_verbose() {
        assert_eq!(
            status_cli(1, false).verbosity(),
            crate::logging::Verbosity::Verbose
        );
    }

    #[test]
    fn test_verbosity_trace() {
        assert_eq!(
            status_cli(2, false).verbosity(),
            crate::logging::Verbosity::Trace
        );
    }

    #[test]
    fn test_cli_verify() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_status_json() {
        let cli = Cli::try_parse_from(["lifeline", "status", "--json"]).unwrap();
        assert!(matches!(cli.command, Command::Status(StatusCommand { json: true })));
    }

    #[test]
    fn test_parse_events_list_with_filter() {
        let cli =
            Cli::try_parse_from(["lifeline", "events", "list", "--status", "abandoned", "-l", "5"])
                .unwrap();
        match cli.command {
            Command::Events(EventsCommand::List { status, limit, json }) => {
                assert_eq!(status, Some(StatusArg::Abandoned));
                assert_eq!(limit, 5);
                assert!(!json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_events_show() {
        let cli = Cli::try_parse_from(["lifeline", "events", "show", "3f2a"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Events(EventsCommand::Show { ref id, .. }) if id == "3f2a"
        ));
    }

    #[test]
    fn test_parse_events_export_to_file() {
        let cli = Cli::try_parse_from(["lifeline", "events", "export", "-o", "out.json"]).unwrap();
        match cli.command {
            Command::Events(EventsCommand::Export { output, limit }) => {
                assert_eq!(output, Some(PathBuf::from("out.json")));
                assert_eq!(limit, 1000);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_prune_days() {
        let cli = Cli::try_parse_from(["lifeline", "prune", "--days", "7"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Prune(PruneCommand { days: Some(7) })
        ));
    }

    #[test]
    fn test_parse_config_validate() {
        let cli = Cli::try_parse_from(["lifeline", "config", "validate", "/tmp/lifeline.toml"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Config(ConfigCommand::Validate { file: Some(_) })
        ));
    }

    #[test]
    fn test_parse_with_config() {
        let cli = Cli::try_parse_from(["lifeline", "-c", "/custom/config.toml", "status"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/custom/config.toml")));
    }

    #[test]
    fn test_parse_with_verbose_and_quiet() {
        let cli = Cli::try_parse_from(["lifeline", "-v", "status"]).unwrap();
        assert_eq!(cli.verbose, 1);
        let cli = Cli::try_parse_from(["lifeline", "-q", "status"]).unwrap();
        assert!(cli.quiet);
    }
}
