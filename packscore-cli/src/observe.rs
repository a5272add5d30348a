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
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use clap::ArgMatches;
use packscore_config::DefaultSeq;
use packscore_docstore::DocumentStore;
use packscore_observers::realtime::{RealtimeObserver, RealtimeOptions};
use packscore_observers::stale::{StaleObserver, StaleOptions};
use packscore_observers::PackageHandler;
use packscore_queue::Enqueuer;
use packscore_registry::PackageRegistry;
use tracing::{debug, info};

use crate::checklist::run_checklist;
use crate::services::AppContext;

/// Observer-side handler: pushes the package onto the work queue, unless it
/// is denylisted.
pub struct QueuePushHandler {
    queue: Arc<dyn Enqueuer>,
    priority: u8,
    denylist: BTreeMap<String, String>,
}

impl QueuePushHandler {
    pub fn new(
        queue: Arc<dyn Enqueuer>,
        priority: u8,
        denylist: BTreeMap<String, String>,
    ) -> Self {
        Self {
            queue,
            priority,
            denylist,
        }
    }
}

#[async_trait]
impl PackageHandler for QueuePushHandler {
    async fn on_package(&self, name: &str) -> anyhow::Result<()> {
        if let Some(reason) = self.denylist.get(name) {
            debug!(name = %name, reason = %reason, "denylisted, not enqueueing");
            return Ok(());
        }
        self.queue.push(name, self.priority).await?;
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
pub struct ObserveCliCommand {
    pub config_path: PathBuf,
    pub default_seq: Option<DefaultSeq>,
}

impl ObserveCliCommand {
    pub fn parse_cli_args(mut matches: ArgMatches) -> anyhow::Result<Self> {
        let config_path = matches
            .remove_one::<String>("config")
            .map(PathBuf::from)
            .expect("`config` has a default value");
        let default_seq = matches
            .remove_one::<String>("default-seq")
            .map(|raw_seq| DefaultSeq::from_str(&raw_seq))
            .transpose()?;
        Ok(Self {
            config_path,
            default_seq,
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

        let observers_config = &app.config.observers;
        let default_seq = self.default_seq.unwrap_or(observers_config.default_seq);
        let denylist = app.config.analysis.denylist.clone();
        let mut observer_tasks = Vec::new();
        if observers_config.realtime_enabled {
            let realtime_observer = RealtimeObserver::new(
                registry.clone(),
                docstore.clone(),
                Arc::new(QueuePushHandler::new(
                    queue.clone(),
                    packscore_queue::PRIORITY_REALTIME,
                    denylist.clone(),
                )),
                RealtimeOptions {
                    concurrency: observers_config.concurrency,
                    default_seq,
                },
                app.kill_switch.clone(),
            );
            observer_tasks.push(tokio::spawn(async move { realtime_observer.run().await }));
            info!("realtime observer started");
        }
        if observers_config.stale_enabled {
            let stale_observer = StaleObserver::new(
                docstore.clone(),
                Arc::new(QueuePushHandler::new(
                    queue.clone(),
                    packscore_queue::PRIORITY_STALE,
                    denylist,
                )),
                StaleOptions {
                    concurrency: observers_config.concurrency,
                    ..Default::default()
                },
                app.kill_switch.clone(),
            );
            observer_tasks.push(tokio::spawn(async move { stale_observer.run().await }));
            info!("stale observer started");
        }
        if observer_tasks.is_empty() {
            anyhow::bail!("both observers are disabled in the config");
        }
        for observer_task in observer_tasks {
            observer_task.await??;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use packscore_queue::MemWorkQueue;

    use super::*;

    #[tokio::test]
    async fn test_denylisted_package_is_not_pushed() -> anyhow::Result<()> {
        let queue = Arc::new(MemWorkQueue::default());
        let denylist: BTreeMap<String, String> =
            [("evil-pkg".to_string(), "malware".to_string())].into_iter().collect();
        let handler = QueuePushHandler::new(queue.clone(), 1, denylist);
        handler.on_package("evil-pkg").await?;
        handler.on_package("fine-pkg").await?;
        let pushed = queue.pushed();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].name, "fine-pkg");
        assert_eq!(pushed[0].priority, 1);
        Ok(())
    }
}
