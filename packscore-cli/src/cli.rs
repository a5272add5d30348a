// Copyright (C) 2024 Quickwit, Inc.
//
// Quickwit is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@quickwit.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use anyhow::{bail, Context};
use clap::{arg, Arg, ArgMatches, Command};
use tracing::Level;

use crate::consume::ConsumeCliCommand;
use crate::observe::ObserveCliCommand;
use crate::scoring::ScoringCliCommand;
use crate::tasks::TasksCliCommand;

pub fn build_cli() -> Command {
    Command::new("packscore")
        .about("Analyzes the package registry population and scores it for search.")
        .arg(
            Arg::new("config")
                .long("config")
                .help("Path to the packscore config file")
                .env("PACKSCORE_CONFIG")
                .default_value("packscore.yaml")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .help("Log level (trace, debug, info, warn, error); overrides the per-command default")
                .env("PACKSCORE_LOG_LEVEL")
                .global(true),
        )
        .subcommand(build_observe_command().display_order(1))
        .subcommand(build_consume_command().display_order(2))
        .subcommand(build_scoring_command().display_order(3))
        .subcommand(TasksCliCommand::build_command().display_order(4))
        .arg_required_else_help(true)
        .disable_help_subcommand(true)
        .subcommand_required(true)
}

fn build_observe_command() -> Command {
    Command::new("observe")
        .about("Starts the realtime and stale observers feeding the work queue.")
        .arg(
            arg!(--"default-seq" <SEQ> "Change sequence to start from when no checkpoint exists; a number or `now`.")
                .required(false),
        )
}

fn build_consume_command() -> Command {
    Command::new("consume")
        .about("Starts the analyzer workers consuming the work queue.")
        .arg(arg!(--concurrency <N> "Parallel analyses (also the broker prefetch).").required(false))
}

fn build_scoring_command() -> Command {
    Command::new("scoring")
        .about("Runs scoring cycles, swapping the score index after each one.")
        .arg(arg!(--"cycle-delay" <SECS> "Seconds between the starts of two cycles.").required(false))
}

#[derive(Debug)]
pub enum CliCommand {
    Observe(ObserveCliCommand),
    Consume(ConsumeCliCommand),
    Scoring(ScoringCliCommand),
    Tasks(TasksCliCommand),
}

impl CliCommand {
    pub fn default_log_level(&self) -> Level {
        match self {
            CliCommand::Observe(_) | CliCommand::Consume(_) | CliCommand::Scoring(_) => Level::INFO,
            CliCommand::Tasks(_) => Level::WARN,
        }
    }

    pub fn parse_cli_args(mut matches: ArgMatches) -> anyhow::Result<Self> {
        let (subcommand, submatches) = matches
            .remove_subcommand()
            .context("failed to parse command")?;
        match subcommand.as_str() {
            "observe" => ObserveCliCommand::parse_cli_args(submatches).map(CliCommand::Observe),
            "consume" => ConsumeCliCommand::parse_cli_args(submatches).map(CliCommand::Consume),
            "scoring" => ScoringCliCommand::parse_cli_args(submatches).map(CliCommand::Scoring),
            "tasks" => TasksCliCommand::parse_cli_args(submatches).map(CliCommand::Tasks),
            _ => bail!("unknown command `{subcommand}`"),
        }
    }

    pub async fn execute(self) -> anyhow::Result<()> {
        match self {
            CliCommand::Observe(subcommand) => subcommand.execute().await,
            CliCommand::Consume(subcommand) => subcommand.execute().await,
            CliCommand::Scoring(subcommand) => subcommand.execute().await,
            CliCommand::Tasks(subcommand) => subcommand.execute().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_observe_with_default_seq() {
        let matches = build_cli()
            .try_get_matches_from(["packscore", "observe", "--default-seq", "now"])
            .unwrap();
        let command = CliCommand::parse_cli_args(matches).unwrap();
        let CliCommand::Observe(observe) = command else {
            panic!("expected an observe command");
        };
        assert_eq!(
            observe.default_seq,
            Some(packscore_config::DefaultSeq::Now)
        );
    }

    #[test]
    fn test_parse_consume_concurrency() {
        let matches = build_cli()
            .try_get_matches_from(["packscore", "consume", "--concurrency", "8"])
            .unwrap();
        let command = CliCommand::parse_cli_args(matches).unwrap();
        let CliCommand::Consume(consume) = command else {
            panic!("expected a consume command");
        };
        assert_eq!(consume.concurrency, Some(8));
    }

    #[test]
    fn test_parse_tasks_process_package() {
        let matches = build_cli()
            .try_get_matches_from(["packscore", "tasks", "process-package", "lodash"])
            .unwrap();
        let command = CliCommand::parse_cli_args(matches).unwrap();
        let CliCommand::Tasks(TasksCliCommand::ProcessPackage { name, .. }) = command else {
            panic!("expected a process-package task");
        };
        assert_eq!(name, "lodash");
    }

    #[test]
    fn test_unknown_subcommand_is_rejected() {
        assert!(build_cli()
            .try_get_matches_from(["packscore", "frobnicate"])
            .is_err());
    }
}
