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

use std::path::PathBuf;
use std::time::Duration;

use clap::ArgMatches;
use packscore_docstore::DocumentStore;
use packscore_index::SearchIndex;
use packscore_scoring::{CycleOptions, ScoringCycle};

use crate::checklist::run_checklist;
use crate::services::AppContext;

#[derive(Debug, PartialEq)]
pub struct ScoringCliCommand {
    pub config_path: PathBuf,
    pub cycle_delay_secs: Option<u64>,
}

impl ScoringCliCommand {
    pub fn parse_cli_args(mut matches: ArgMatches) -> anyhow::Result<Self> {
        let config_path = matches
            .remove_one::<String>("config")
            .map(PathBuf::from)
            .expect("`config` has a default value");
        let cycle_delay_secs = matches
            .remove_one::<String>("cycle-delay")
            .map(|raw| raw.parse::<u64>())
            .transpose()?;
        Ok(Self {
            config_path,
            cycle_delay_secs,
        })
    }

    pub async fn execute(self) -> anyhow::Result<()> {
        let app = AppContext::load(&self.config_path).await?;
        let docstore = app.docstore()?;
        let search_index = app.search_index()?;
        run_checklist(vec![
            ("document store", docstore.is_up().await),
            ("search index", search_index.is_up().await),
        ])?;

        let cycle_delay_secs = self
            .cycle_delay_secs
            .unwrap_or(app.config.scoring.cycle_delay_secs);
        let scoring_cycle = ScoringCycle::new(
            docstore,
            search_index,
            CycleOptions {
                cycle_delay: Duration::from_secs(cycle_delay_secs),
            },
            app.kill_switch.clone(),
        );
        scoring_cycle.run().await
    }
}
