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

//! Stale observer.
//!
//! Every tick scans the `packages-stale` view twice, failed analyses first,
//! then normal ones, and re-notifies packages whose analysis aged past the
//! type's threshold and that were not themselves notified recently. A tick
//! never runs concurrently with itself: the next one is scheduled only after
//! the previous one completed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use packscore_common::KillSwitch;
use packscore_docstore::{bulk_patch, DocumentStore, ViewParams};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, error, info, warn};

use crate::{obs_key, PackageHandler};

const STALE_VIEW_DESIGN: &str = "packscore";
const STALE_VIEW_NAME: &str = "packages-stale";
const VIEW_PAGE_SIZE: usize = 250;
/// Upper bound of a key range sharing a prefix, per view collation.
const KEY_RANGE_SENTINEL: &str = "\u{fff0}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleKind {
    Failed,
    Normal,
}

impl StaleKind {
    fn as_str(self) -> &'static str {
        match self {
            StaleKind::Failed => "failed",
            StaleKind::Normal => "normal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StaleOptions {
    pub concurrency: usize,
    pub check_interval: Duration,
    /// Re-analysis threshold for healthy analyses.
    pub normal_threshold: chrono::Duration,
    /// Re-analysis threshold for failed analyses.
    pub failed_threshold: chrono::Duration,
}

impl Default for StaleOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            check_interval: Duration::from_millis(if cfg!(test) { 20 } else { 5 * 60 * 1_000 }),
            normal_threshold: chrono::Duration::days(25),
            failed_threshold: chrono::Duration::hours(12),
        }
    }
}

impl StaleOptions {
    fn threshold(&self, kind: StaleKind) -> chrono::Duration {
        match kind {
            StaleKind::Failed => self.failed_threshold,
            StaleKind::Normal => self.normal_threshold,
        }
    }
}

pub struct StaleObserver {
    docstore: Arc<dyn DocumentStore>,
    handler: Arc<dyn PackageHandler>,
    options: StaleOptions,
    kill_switch: KillSwitch,
}

impl StaleObserver {
    pub fn new(
        docstore: Arc<dyn DocumentStore>,
        handler: Arc<dyn PackageHandler>,
        options: StaleOptions,
        kill_switch: KillSwitch,
    ) -> Self {
        Self {
            docstore,
            handler,
            options,
            kill_switch,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        info!(check_interval = ?self.options.check_interval, "stale observer running");
        loop {
            if self.kill_switch.is_dead() {
                return Ok(());
            }
            if let Err(tick_error) = self.run_tick().await {
                error!(err = %tick_error, "stale tick failed");
            }
            tokio::select! {
                _ = self.kill_switch.killed() => return Ok(()),
                _ = tokio::time::sleep(self.options.check_interval) => {}
            }
        }
    }

    /// One full tick: failed analyses first, then normal ones.
    async fn run_tick(&self) -> anyhow::Result<()> {
        for kind in [StaleKind::Failed, StaleKind::Normal] {
            self.scan(kind).await?;
        }
        Ok(())
    }

    async fn scan(&self, kind: StaleKind) -> anyhow::Result<()> {
        let now = Utc::now();
        let cutoff_ms = (now - self.options.threshold(kind)).timestamp_millis();
        let mut skip = 0usize;
        loop {
            if self.kill_switch.is_dead() {
                return Ok(());
            }
            let page = self
                .docstore
                .query_view(
                    STALE_VIEW_DESIGN,
                    STALE_VIEW_NAME,
                    ViewParams {
                        start_key: Some(json!([kind.as_str()])),
                        end_key: Some(json!([kind.as_str(), cutoff_ms, KEY_RANGE_SENTINEL])),
                        limit: Some(VIEW_PAGE_SIZE),
                        skip: Some(skip),
                        ..Default::default()
                    },
                )
                .await?;
            if page.rows.is_empty() {
                return Ok(());
            }
            skip += page.rows.len();
            let names: Vec<String> = page
                .rows
                .iter()
                .filter_map(|row| {
                    row.key
                        .get(2)
                        .and_then(JsonValue::as_str)
                        .map(str::to_string)
                })
                .collect();
            self.notify_page(kind, &names, now).await?;
            if page.rows.len() < VIEW_PAGE_SIZE {
                return Ok(());
            }
        }
    }

    async fn notify_page(
        &self,
        kind: StaleKind,
        names: &[String],
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        // One round-trip for the whole page of checkpoints.
        let obs_keys: Vec<String> = names.iter().map(|name| obs_key(name)).collect();
        let obs_docs = self.docstore.bulk_get(&obs_keys).await?;
        let threshold = self.options.threshold(kind);
        let stale_names: Vec<String> = names
            .iter()
            .zip(&obs_docs)
            .filter(|(_, obs_doc)| {
                let notified_at = obs_doc
                    .as_ref()
                    .and_then(|doc| doc.value.pointer("/stale/notified_at"))
                    .and_then(JsonValue::as_i64)
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
                match notified_at {
                    // Notified recently enough; the analyzer will get to it.
                    Some(notified_at) => now - notified_at > threshold,
                    None => true,
                }
            })
            .map(|(name, _)| name.clone())
            .collect();
        if stale_names.is_empty() {
            return Ok(());
        }
        debug!(kind = kind.as_str(), num_names = stale_names.len(), "notifying stale packages");

        let mut notify_tasks: FuturesUnordered<_> = FuturesUnordered::new();
        let mut pending = stale_names.iter();
        let mut successes: Vec<String> = Vec::new();
        let mut in_flight = 0usize;
        loop {
            while in_flight < self.options.concurrency {
                let Some(name) = pending.next() else {
                    break;
                };
                let handler = self.handler.clone();
                let name = name.clone();
                notify_tasks.push(async move {
                    let result = handler.on_package(&name).await;
                    (name, result)
                });
                in_flight += 1;
            }
            let Some((name, result)) = notify_tasks.next().await else {
                break;
            };
            in_flight -= 1;
            match result {
                Ok(()) => successes.push(name),
                Err(notify_error) => {
                    warn!(err = %notify_error, name = %name, "failed to notify stale package");
                }
            }
        }

        if !successes.is_empty() {
            let patch_keys: Vec<String> = successes.iter().map(|name| obs_key(name)).collect();
            let now_ms = now.timestamp_millis();
            bulk_patch(&*self.docstore, &patch_keys, |_key, current_doc| {
                let mut value = current_doc
                    .map(|doc| doc.value.clone())
                    .unwrap_or_else(|| json!({}));
                value["stale"] = json!({ "notified_at": now_ms });
                Some(value)
            })
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use packscore_docstore::{Document, MemDocstore};

    use super::*;
    use crate::test_support::RecordingHandler;

    /// Emulates the production `packages-stale` view: every analysis
    /// document emits `[type, last-evaluated-ms, name]`.
    fn register_stale_view(docstore: &MemDocstore) {
        docstore.register_view(STALE_VIEW_DESIGN, STALE_VIEW_NAME, |doc| {
            let Some(name) = doc.id.strip_prefix("analysis!") else {
                return Vec::new();
            };
            let kind = if doc.value.get("error").is_some() {
                "failed"
            } else {
                "normal"
            };
            let evaluated_at = doc
                .value
                .pointer("/error/caught_at")
                .or_else(|| doc.value.get("finished_at"))
                .and_then(JsonValue::as_str)
                .and_then(|date| DateTime::parse_from_rfc3339(date).ok())
                .map(|date| date.timestamp_millis())
                .unwrap_or(0);
            vec![(json!([kind, evaluated_at, name]), json!(null))]
        });
    }

    async fn insert_analysis(
        docstore: &MemDocstore,
        name: &str,
        finished_ago: ChronoDuration,
        failed: bool,
    ) {
        let timestamp = (Utc::now() - finished_ago).to_rfc3339();
        let value = if failed {
            json!({"finished_at": timestamp, "error": {"kind": "TRANSIENT", "caught_at": timestamp}})
        } else {
            json!({"finished_at": timestamp})
        };
        docstore
            .put(&Document::new(format!("analysis!{name}"), value))
            .await
            .unwrap();
    }

    fn observer(
        docstore: Arc<MemDocstore>,
        handler: Arc<RecordingHandler>,
        kill_switch: KillSwitch,
    ) -> StaleObserver {
        StaleObserver::new(docstore, handler, StaleOptions::default(), kill_switch)
    }

    #[tokio::test]
    async fn test_failed_analysis_requeued_after_threshold() -> anyhow::Result<()> {
        let docstore = Arc::new(MemDocstore::default());
        register_stale_view(&docstore);
        // Failed 13h ago: past the 12h failed threshold.
        insert_analysis(&docstore, "pkg-b", ChronoDuration::hours(13), true).await;
        let handler = Arc::new(RecordingHandler::default());
        let kill_switch = KillSwitch::default();
        let stale_observer = observer(docstore.clone(), handler.clone(), kill_switch.clone());

        stale_observer.run_tick().await?;
        assert_eq!(handler.notified.lock().unwrap().as_slice(), ["pkg-b"]);
        let obs_doc = docstore.get("obs!pkg-b").await?;
        let notified_at_ms = obs_doc.value["stale"]["notified_at"].as_i64().unwrap();
        let notified_at = Utc.timestamp_millis_opt(notified_at_ms).single().unwrap();
        assert!(Utc::now() - notified_at < ChronoDuration::seconds(10));
        Ok(())
    }

    #[tokio::test]
    async fn test_fresh_analysis_not_requeued() -> anyhow::Result<()> {
        let docstore = Arc::new(MemDocstore::default());
        register_stale_view(&docstore);
        // Failed 1h ago (threshold 12h), evaluated 1d ago (threshold 25d).
        insert_analysis(&docstore, "pkg-fresh-failed", ChronoDuration::hours(1), true).await;
        insert_analysis(&docstore, "pkg-fresh-normal", ChronoDuration::days(1), false).await;
        let handler = Arc::new(RecordingHandler::default());
        let stale_observer = observer(docstore, handler.clone(), KillSwitch::default());

        stale_observer.run_tick().await?;
        assert!(handler.notified.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_scanned_before_normal() -> anyhow::Result<()> {
        let docstore = Arc::new(MemDocstore::default());
        register_stale_view(&docstore);
        insert_analysis(&docstore, "pkg-normal", ChronoDuration::days(30), false).await;
        insert_analysis(&docstore, "pkg-failed", ChronoDuration::days(30), true).await;
        let handler = Arc::new(RecordingHandler::default());
        let stale_observer = observer(docstore, handler.clone(), KillSwitch::default());

        stale_observer.run_tick().await?;
        assert_eq!(
            handler.notified.lock().unwrap().as_slice(),
            ["pkg-failed", "pkg-normal"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_recently_notified_is_filtered() -> anyhow::Result<()> {
        let docstore = Arc::new(MemDocstore::default());
        register_stale_view(&docstore);
        insert_analysis(&docstore, "pkg-b", ChronoDuration::hours(13), true).await;
        // Notified 1h ago: below the 12h failed threshold.
        docstore
            .put(&Document::new(
                "obs!pkg-b",
                json!({"stale": {"notified_at": (Utc::now() - ChronoDuration::hours(1)).timestamp_millis()}}),
            ))
            .await?;
        let handler = Arc::new(RecordingHandler::default());
        let stale_observer = observer(docstore, handler.clone(), KillSwitch::default());

        stale_observer.run_tick().await?;
        assert!(handler.notified.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_notification_keeps_checkpoint_clear() -> anyhow::Result<()> {
        let docstore = Arc::new(MemDocstore::default());
        register_stale_view(&docstore);
        insert_analysis(&docstore, "pkg-b", ChronoDuration::hours(13), true).await;
        let handler = Arc::new(RecordingHandler {
            failing_names: vec!["pkg-b".to_string()],
            ..Default::default()
        });
        let stale_observer = observer(docstore.clone(), handler.clone(), KillSwitch::default());

        stale_observer.run_tick().await?;
        assert_eq!(handler.notified.lock().unwrap().len(), 1);
        assert!(docstore.get("obs!pkg-b").await.unwrap_err().is_not_found());
        Ok(())
    }
}
