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

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use clap::ArgMatches;
use packscore_analyzer::Analyzer;
use packscore_common::AnalyzerErrorKind;
use packscore_docstore::DocumentStore;
use packscore_queue::{ConsumeOptions, DeadLetterHandler, Envelope, MessageHandler};
use packscore_registry::PackageRegistry;
use tracing::{info, warn};

use crate::checklist::run_checklist;
use crate::services::AppContext;

/// Worker-side handler: runs the full analysis for each delivery.
pub struct AnalyzeMessageHandler {
    analyzer: Arc<Analyzer>,
    denylist: BTreeMap<String, String>,
}

#[async_trait]
impl MessageHandler for AnalyzeMessageHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        if let Some(reason) = self.denylist.get(&envelope.name) {
            warn!(name = %envelope.name, reason = %reason, "denylisted, dropping delivery");
            return Ok(());
        }
        self.analyzer.analyze(&envelope.name).await?;
        Ok(())
    }
}

/// Dead-letter handler: records a failed analysis so the stale observer
/// reconsiders the package after the failed threshold.
pub struct RecordFailureHandler {
    analyzer: Arc<Analyzer>,
}

#[async_trait]
impl DeadLetterHandler for RecordFailureHandler {
    async fn on_retries_exceeded(&self, envelope: &Envelope, error: &anyhow::Error) {
        let recorded_error = AnalyzerErrorKind::Unrecoverable
            .with_error(anyhow::anyhow!("retries exceeded: {error:#}"));
        if let Err(record_error) = self
            .analyzer
            .record_failure(&envelope.name, &recorded_error, Utc::now())
            .await
        {
            warn!(err = %record_error, name = %envelope.name, "failed to record dead-lettered analysis");
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct ConsumeCliCommand {
    pub config_path: PathBuf,
    pub concurrency: Option<usize>,
}

impl ConsumeCliCommand {
    pub fn parse_cli_args(mut matches: ArgMatches) -> anyhow::Result<Self> {
        let config_path = matches
            .remove_one::<String>("config")
            .map(PathBuf::from)
            .expect("`config` has a default value");
        let concurrency = matches
            .remove_one::<String>("concurrency")
            .map(|raw| raw.parse::<usize>())
            .transpose()?;
        Ok(Self {
            config_path,
            concurrency,
        })
    }

    pub async fn execute(self) -> anyhow::Result<()> {
        let app = AppContext::load(&self.config_path).await?;
        let registry = app.registry()?;
        let docstore = app.docstore()?;
        let queue = app.queue();
        run_checklist(vec![
            ("registry", registry.is_up().await),
            ("document store", docstore.is_up().await),
            ("broker", queue.is_up().await),
        ])?;

        let analyzer = app.analyzer(registry, docstore)?;
        let concurrency = self.concurrency.unwrap_or(app.config.analysis.concurrency);
        info!(concurrency = concurrency, "analyzer workers starting");
        let options = ConsumeOptions {
            concurrency,
            max_retries: app.config.analysis.max_retries,
            on_reconnect: Some(Arc::new(|attempt| {
                warn!(attempt = attempt, "broker connection re-established");
            })),
        };
        let handler = Arc::new(AnalyzeMessageHandler {
            analyzer: analyzer.clone(),
            denylist: app.config.analysis.denylist.clone(),
        });
        let dead_letter_handler = Arc::new(RecordFailureHandler { analyzer });
        queue.consume(handler, dead_letter_handler, options).await?;
        Ok(())
    }
}
