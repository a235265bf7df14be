/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::execution_modes::ExecutionMode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Cluster configuration
    #[arg(short, long, env = "NETEXP_CONFIG", default_value = "netexp.toml", global = true)]
    pub config: PathBuf,

    /// Verbose mode (-v, --verbose)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Act as this host instead of the machine's own short hostname
    #[arg(long, env = "NETEXP_HOSTNAME", global = true)]
    pub hostname: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run every configured experiment from the server host (default)
    Server {
        /// Assemble and print the experiments without running anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Run this host's load generators for a replicated experiment
    Client {
        /// Experiment directory
        dir: PathBuf,
    },

    /// Record runtime statistics for a replicated experiment
    Observer {
        /// Experiment directory
        dir: PathBuf,
    },

    /// Run a captured experiment again
    Replay {
        /// Experiment directory or its config.json
        path: PathBuf,
    },

    /// Write an example configuration
    Init,
}

impl Args {
    pub fn command(&self) -> Commands {
        self.command
            .clone()
            .unwrap_or(Commands::Server { dry_run: false })
    }
}

impl Commands {
    /// `None` for commands that do not take part in a run.
    pub fn mode(&self) -> Option<ExecutionMode> {
        match self {
            Commands::Server { .. } => Some(ExecutionMode::Server),
            Commands::Client { .. } => Some(ExecutionMode::Client),
            Commands::Observer { .. } => Some(ExecutionMode::Observer),
            Commands::Replay { .. } => Some(ExecutionMode::Replay),
            Commands::Init => None,
        }
    }
}

pub fn parse() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_is_the_default_command() -> anyhow::Result<()> {
        let args = Args::try_parse_from(["netexp"])?;
        assert_eq!(args.command(), Commands::Server { dry_run: false });
        assert_eq!(args.config, PathBuf::from("netexp.toml"));
        Ok(())
    }

    #[test]
    fn remote_roles_take_the_experiment_dir() -> anyhow::Result<()> {
        let args = Args::try_parse_from([
            "netexp",
            "--config",
            "run.1/netexp.toml",
            "client",
            "run.1",
        ])?;
        assert_eq!(
            args.command(),
            Commands::Client {
                dir: PathBuf::from("run.1")
            }
        );
        assert_eq!(args.command().mode(), Some(ExecutionMode::Client));
        assert!(ExecutionMode::Client.is_remote());
        Ok(())
    }

    #[test]
    fn hostname_can_be_overridden() -> anyhow::Result<()> {
        let args = Args::try_parse_from(["netexp", "--hostname", "pd3", "observer", "run.1"])?;
        assert_eq!(args.hostname.as_deref(), Some("pd3"));
        Ok(())
    }
}
