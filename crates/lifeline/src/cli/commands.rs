//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

use crate::event::EventStatus;

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Event inspection commands.
#[derive(Debug, Subcommand)]
pub enum EventsCommand {
    /// List recorded events, newest first
    List {
        /// Only show events in this status
        #[arg(short, long, value_enum)]
        status: Option<StatusArg>,

        /// Maximum number of events
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show one event with its channel states and log
    Show {
        /// Event id (a unique prefix is enough)
        id: String,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Export events with their logs as JSON
    Export {
        /// Write to this file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Maximum number of events, newest first
        #[arg(short, long, default_value = "1000")]
        limit: usize,
    },
}

/// Prune command arguments.
#[derive(Debug, Args)]
pub struct PruneCommand {
    /// Delete finished events older than this many days (defaults to the
    /// configured retention)
    #[arg(short, long)]
    pub days: Option<u32>,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show configuration file path
    Path,

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        file: Option<PathBuf>,
    },
}

/// Event status filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusArg {
    /// Created, not yet confirming.
    Pending,
    /// In the confirmation countdown.
    Confirming,
    /// Waiting for delivery.
    Dispatching,
    /// Delivered through at least one channel.
    Delivered,
    /// Cancelled by the user.
    Cancelled,
    /// Could not be delivered.
    Abandoned,
}

impl From<StatusArg> for EventStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => Self::Pending,
            StatusArg::Confirming => Self::Confirming,
            StatusArg::Dispatching => Self::Dispatching,
            StatusArg::Delivered => Self::Delivered,
            StatusArg::Cancelled => Self::Cancelled,
            StatusArg::Abandoned => Self::Abandoned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_arg_conversion() {
        assert_eq!(EventStatus::from(StatusArg::Pending), EventStatus::Pending);
        assert_eq!(EventStatus::from(StatusArg::Dispatching), EventStatus::Dispatching);
        assert_eq!(EventStatus::from(StatusArg::Abandoned), EventStatus::Abandoned);
    }

    #[test]
    fn test_status_arg_covers_every_status() {
        let converted: Vec<EventStatus> = StatusArg::value_variants()
            .iter()
            .map(|arg| EventStatus::from(*arg))
            .collect();
        assert_eq!(converted, EventStatus::ALL.to_vec());
    }

    #[test]
    fn test_status_arg_debug() {
        assert_eq!(format!("{:?}", StatusArg::Delivered), "Delivered");
    }
}
