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

//! Wiring: adapters and pipeline objects built from the loaded config.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use packscore_analyzer::collect::{DefaultCollectorSet, GithubClient};
use packscore_analyzer::download::{ChainDownloader, DownloadLimits};
use packscore_analyzer::Analyzer;
use packscore_common::KillSwitch;
use packscore_config::PackscoreConfig;
use packscore_docstore::CouchDocstore;
use packscore_index::ElasticScoreIndex;
use packscore_queue::AmqpWorkQueue;
use packscore_registry::HttpRegistry;
use tracing::info;

pub struct AppContext {
    pub config: PackscoreConfig,
    pub kill_switch: KillSwitch,
}

impl AppContext {
    /// Loads the config and installs the ctrl-c handler that flips the kill
    /// switch shared by every long-lived loop.
    pub async fn load(config_path: &Path) -> anyhow::Result<Self> {
        let config = PackscoreConfig::load(config_path).await?;
        let kill_switch = KillSwitch::default();
        tokio::spawn({
            let kill_switch = kill_switch.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, shutting down");
                    kill_switch.kill();
                }
            }
        });
        Ok(Self {
            config,
            kill_switch,
        })
    }

    pub fn docstore(&self) -> anyhow::Result<Arc<CouchDocstore>> {
        Ok(Arc::new(CouchDocstore::new(
            &self.config.docstore.endpoint,
            &self.config.docstore.database,
        )?))
    }

    pub fn registry(&self) -> anyhow::Result<Arc<HttpRegistry>> {
        Ok(Arc::new(HttpRegistry::new(
            &self.config.registry.endpoint,
            &self.config.registry.downloads_endpoint,
            Duration::from_secs(self.config.registry.timeout_secs),
        )?))
    }

    pub fn search_index(&self) -> anyhow::Result<Arc<ElasticScoreIndex>> {
        Ok(Arc::new(ElasticScoreIndex::new(
            &self.config.search_index.endpoint,
        )?))
    }

    pub fn queue(&self) -> Arc<AmqpWorkQueue> {
        Arc::new(AmqpWorkQueue::new(
            self.config.broker.endpoint.clone(),
            self.config.broker.queue_name.clone(),
            self.kill_switch.clone(),
        ))
    }

    pub fn analyzer(
        &self,
        registry: Arc<HttpRegistry>,
        docstore: Arc<CouchDocstore>,
    ) -> anyhow::Result<Arc<Analyzer>> {
        let github = GithubClient::new(
            self.config.analysis.source_host_tokens.clone(),
            // Workers wait out a drained token pool rather than failing the
            // analysis.
            true,
        )?;
        let downloader = ChainDownloader::new(reqwest_client()?, DownloadLimits::default());
        let collectors = DefaultCollectorSet::new(registry.clone(), docstore.clone(), github);
        Ok(Arc::new(Analyzer::new(
            registry,
            docstore,
            Arc::new(downloader),
            Arc::new(collectors),
            workdir_root(),
        )))
    }
}

fn reqwest_client() -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(600))
        .user_agent("packscore")
        .build()?)
}

fn workdir_root() -> PathBuf {
    std::env::temp_dir().join("packscore")
}
