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

//! Startup readiness checklist printed before a long-lived command begins.

use anyhow::bail;
use colored::Colorize;

/// Prints one line per dependency probe and fails when any probe failed.
pub fn run_checklist(checks: Vec<(&str, bool)>) -> anyhow::Result<()> {
    let mut unreachable: Vec<&str> = Vec::new();
    for (dependency, is_up) in &checks {
        let mark = if *is_up { "✔".green() } else { "✖".red() };
        eprintln!(" {mark} {dependency}");
        if !is_up {
            unreachable.push(dependency);
        }
    }
    if !unreachable.is_empty() {
        bail!("dependencies unreachable: {}", unreachable.join(", "));
    }
    Ok(())
}
