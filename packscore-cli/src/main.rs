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

mod checklist;
mod cli;
mod consume;
mod observe;
mod scoring;
mod services;
mod tasks;

use cli::{build_cli, CliCommand};
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

fn setup_logging(level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("packscore={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let matches = build_cli().get_matches();
    let log_level_override = matches.get_one::<String>("log-level").cloned();
    let command = match CliCommand::parse_cli_args(matches) {
        Ok(command) => command,
        Err(parse_error) => {
            eprintln!("failed to parse command: {parse_error:#}");
            std::process::exit(1);
        }
    };
    let log_level =
        log_level_override.unwrap_or_else(|| command.default_log_level().to_string());
    setup_logging(&log_level);
    let return_code = match command.execute().await {
        Ok(()) => 0,
        Err(command_error) => {
            error!(err = ?command_error, "command failed");
            1
        }
    };
    std::process::exit(return_code);
}
