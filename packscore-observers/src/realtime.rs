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

//! Realtime observer.
//!
//! Run loop: fetch the sequence checkpoint, follow the change feed, buffer
//! changes, flush on size or idleness, persist the checkpoint, repeat. Any
//! uncaught failure restarts the loop after a delay from the last persisted
//! sequence.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use packscore_common::KillSwitch;
use packscore_config::DefaultSeq;
use packscore_docstore::{bulk_patch, Document, DocumentStore};
use packscore_registry::{Change, PackageRegistry};
use serde_json::{json, Value as JsonValue};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{obs_key, PackageHandler, REALTIME_SEQ_KEY};

/// Rolling idle window after which a non-empty buffer flushes.
const FLUSH_IDLE: Duration = Duration::from_millis(if cfg!(test) { 20 } else { 2_500 });
/// Cool-down between polls when the feed reads as idle.
const POLL_COOL_DOWN: Duration = Duration::from_millis(if cfg!(test) { 5 } else { 1_000 });
/// Delay before a failed run re-enters from the last persisted sequence.
const RESTART_DELAY: Duration = Duration::from_millis(if cfg!(test) { 10 } else { 5_000 });
const CHANGES_BATCH_LIMIT: usize = 200;

#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    pub concurrency: usize,
    pub default_seq: DefaultSeq,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            default_seq: DefaultSeq::default(),
        }
    }
}

pub struct RealtimeObserver {
    registry: Arc<dyn PackageRegistry>,
    docstore: Arc<dyn DocumentStore>,
    handler: Arc<dyn PackageHandler>,
    options: RealtimeOptions,
    kill_switch: KillSwitch,
}

impl RealtimeObserver {
    pub fn new(
        registry: Arc<dyn PackageRegistry>,
        docstore: Arc<dyn DocumentStore>,
        handler: Arc<dyn PackageHandler>,
        options: RealtimeOptions,
        kill_switch: KillSwitch,
    ) -> Self {
        Self {
            registry,
            docstore,
            handler,
            options,
            kill_switch,
        }
    }

    /// Runs until the kill switch fires. Failed runs restart after a delay,
    /// re-entering from the last persisted sequence.
    pub async fn run(&self) -> anyhow::Result<()> {
        loop {
            if self.kill_switch.is_dead() {
                return Ok(());
            }
            match self.run_once().await {
                Ok(()) => return Ok(()),
                Err(run_error) => {
                    error!(err = %run_error, "realtime observer failed, restarting");
                    tokio::select! {
                        _ = self.kill_switch.killed() => return Ok(()),
                        _ = tokio::time::sleep(RESTART_DELAY) => {}
                    }
                }
            }
        }
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        let mut cursor = self.fetch_checkpoint_seq().await?;
        info!(seq = cursor, "realtime observer following changes");
        let mut buffer: Vec<Change> = Vec::new();
        let flush_threshold = self.options.concurrency * 10;
        let mut idle_deadline = Instant::now() + FLUSH_IDLE;
        loop {
            tokio::select! {
                _ = self.kill_switch.killed() => {
                    // An abandoned buffer is fine: the checkpoint was not
                    // advanced past it.
                    return Ok(());
                }
                _ = tokio::time::sleep_until(idle_deadline), if !buffer.is_empty() => {
                    self.flush(&mut buffer).await?;
                    idle_deadline = Instant::now() + FLUSH_IDLE;
                }
                changes_result = self.registry.changes(cursor, CHANGES_BATCH_LIMIT) => {
                    let batch = changes_result?;
                    if batch.changes.is_empty() {
                        tokio::select! {
                            _ = self.kill_switch.killed() => return Ok(()),
                            _ = tokio::time::sleep(POLL_COOL_DOWN) => {}
                        }
                        continue;
                    }
                    cursor = batch.last_seq;
                    buffer.extend(
                        batch
                            .changes
                            .into_iter()
                            // Design documents are not packages.
                            .filter(|change| !change.id.starts_with('_')),
                    );
                    idle_deadline = Instant::now() + FLUSH_IDLE;
                    if buffer.len() >= flush_threshold {
                        self.flush(&mut buffer).await?;
                        idle_deadline = Instant::now() + FLUSH_IDLE;
                    }
                }
            }
        }
    }

    async fn fetch_checkpoint_seq(&self) -> anyhow::Result<u64> {
        match self.docstore.get(REALTIME_SEQ_KEY).await {
            Ok(doc) => Ok(doc.value.get("seq").and_then(JsonValue::as_u64).unwrap_or(0)),
            Err(error) if error.is_not_found() => match self.options.default_seq {
                DefaultSeq::Now => Ok(self.registry.last_seq().await?),
                DefaultSeq::Seq(seq) => Ok(seq),
            },
            Err(error) => Err(error.into()),
        }
    }

    /// The follower is paused for the duration of a flush: nothing polls the
    /// feed until this returns.
    async fn flush(&self, buffer: &mut Vec<Change>) -> anyhow::Result<()> {
        let batch = std::mem::take(buffer);
        let Some(batch_seq) = batch.iter().map(|change| change.seq).max() else {
            return Ok(());
        };
        // Dedup names, keeping first-seen order.
        let mut names: Vec<String> = Vec::new();
        for change in &batch {
            if !names.contains(&change.id) {
                names.push(change.id.clone());
            }
        }
        debug!(num_changes = batch.len(), num_names = names.len(), seq = batch_seq, "flushing");

        // One bulk read on each side: upstream package docs and our
        // per-package checkpoints.
        let obs_keys: Vec<String> = names.iter().map(|name| obs_key(name)).collect();
        let (packages, obs_docs) = tokio::join!(
            self.registry.bulk_fetch_packages(&names),
            self.docstore.bulk_get(&obs_keys),
        );
        let packages = packages?;
        let obs_docs = obs_docs?;

        // Keep names whose upstream modification date moved (or is unknown
        // on either side).
        let mut to_notify: Vec<(String, Option<String>)> = Vec::new();
        for ((name, package), obs_doc) in names.iter().zip(&packages).zip(&obs_docs) {
            let upstream_modified = package
                .as_ref()
                .and_then(|package| package.pointer("/time/modified"))
                .and_then(JsonValue::as_str)
                .map(str::to_string);
            let stored_modified = obs_doc
                .as_ref()
                .and_then(|doc| doc.value.pointer("/realtime/modified_at"))
                .and_then(JsonValue::as_str)
                .map(str::to_string);
            let unchanged = upstream_modified.is_some()
                && stored_modified.is_some()
                && upstream_modified == stored_modified;
            if unchanged {
                debug!(name = %name, "unchanged since last flush, skipping");
                continue;
            }
            to_notify.push((name.clone(), upstream_modified));
        }

        // Notify with bounded parallelism; collect the successes.
        let mut notify_tasks: FuturesUnordered<_> = FuturesUnordered::new();
        let mut pending = to_notify.into_iter();
        let mut successes: Vec<(String, Option<String>)> = Vec::new();
        let mut in_flight = 0usize;
        loop {
            while in_flight < self.options.concurrency {
                let Some((name, modified)) = pending.next() else {
                    break;
                };
                let handler = self.handler.clone();
                notify_tasks.push(async move {
                    let result = handler.on_package(&name).await;
                    (name, modified, result)
                });
                in_flight += 1;
            }
            let Some((name, modified, result)) = notify_tasks.next().await else {
                break;
            };
            in_flight -= 1;
            match result {
                Ok(()) => successes.push((name, modified)),
                Err(notify_error) => {
                    warn!(err = %notify_error, name = %name, "failed to notify package");
                }
            }
        }

        // Checkpoint the successes, then the sequence.
        if !successes.is_empty() {
            let patch_keys: Vec<String> =
                successes.iter().map(|(name, _)| obs_key(name)).collect();
            let modified_by_key: std::collections::HashMap<String, Option<String>> = successes
                .iter()
                .map(|(name, modified)| (obs_key(name), modified.clone()))
                .collect();
            bulk_patch(&*self.docstore, &patch_keys, |key, current_doc| {
                let mut value = current_doc
                    .map(|doc| doc.value.clone())
                    .unwrap_or_else(|| json!({}));
                value["realtime"] = json!({
                    "modified_at": modified_by_key.get(key).cloned().flatten()
                });
                Some(value)
            })
            .await?;
        }
        self.persist_seq(batch_seq).await;
        Ok(())
    }

    /// Persists the sequence checkpoint. A conflict means another observer
    /// instance raced us: tolerated, the checkpoint is refetched next run.
    async fn persist_seq(&self, seq: u64) {
        let current = match self.docstore.get(REALTIME_SEQ_KEY).await {
            Ok(doc) => Some(doc),
            Err(error) if error.is_not_found() => None,
            Err(error) => {
                warn!(err = %error, "failed to read sequence checkpoint");
                return;
            }
        };
        let doc = Document {
            id: REALTIME_SEQ_KEY.to_string(),
            rev: current.and_then(|doc| doc.rev),
            value: json!({ "seq": seq }),
        };
        if let Err(persist_error) = self.docstore.put(&doc).await {
            warn!(err = %persist_error, seq = seq, "failed to persist sequence checkpoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use packscore_docstore::MemDocstore;
    use packscore_registry::{ChangeBatch, MemRegistry};

    use super::*;
    use crate::test_support::RecordingHandler;

    fn change(id: &str, seq: u64) -> Change {
        Change {
            id: id.to_string(),
            seq,
            deleted: false,
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn observer(
        registry: Arc<MemRegistry>,
        docstore: Arc<MemDocstore>,
        handler: Arc<RecordingHandler>,
        kill_switch: KillSwitch,
    ) -> RealtimeObserver {
        RealtimeObserver::new(
            registry,
            docstore,
            handler,
            RealtimeOptions::default(),
            kill_switch,
        )
    }

    #[tokio::test]
    async fn test_publish_flow_notifies_and_checkpoints() -> anyhow::Result<()> {
        let registry = Arc::new(MemRegistry::default());
        registry.insert_package(
            "pkg-a",
            serde_json::json!({"time": {"modified": "2024-01-02T00:00:00Z"}}),
        );
        registry.script_changes(ChangeBatch {
            changes: vec![change("pkg-a", 43)],
            last_seq: 43,
        });
        let docstore = Arc::new(MemDocstore::default());
        docstore
            .put(&Document::new(REALTIME_SEQ_KEY, serde_json::json!({"seq": 42})))
            .await?;
        docstore
            .put(&Document::new(
                "obs!pkg-a",
                serde_json::json!({"realtime": {"modified_at": "2024-01-01T00:00:00Z"}}),
            ))
            .await?;
        let handler = Arc::new(RecordingHandler::default());
        let kill_switch = KillSwitch::default();
        let observer = observer(registry, docstore.clone(), handler.clone(), kill_switch.clone());

        let observer_task = tokio::spawn(async move { observer.run().await });
        wait_for(|| {
            handler.notified.lock().unwrap().len() == 1
        })
        .await;
        let expected_docstore = docstore.clone();
        wait_for(move || {
            let docstore = expected_docstore.clone();
            futures::executor::block_on(async {
                let seq_ok = docstore
                    .get(REALTIME_SEQ_KEY)
                    .await
                    .map(|doc| doc.value["seq"] == 43)
                    .unwrap_or(false);
                let obs_ok = docstore
                    .get("obs!pkg-a")
                    .await
                    .map(|doc| {
                        doc.value["realtime"]["modified_at"] == "2024-01-02T00:00:00Z"
                    })
                    .unwrap_or(false);
                seq_ok && obs_ok
            })
        })
        .await;
        assert_eq!(handler.notified.lock().unwrap().as_slice(), ["pkg-a"]);
        kill_switch.kill();
        observer_task.await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_unchanged_package_is_deduped() -> anyhow::Result<()> {
        let registry = Arc::new(MemRegistry::default());
        registry.insert_package(
            "pkg-a",
            serde_json::json!({"time": {"modified": "2024-01-01T00:00:00Z"}}),
        );
        // The same name twice in one batch, unchanged upstream.
        registry.script_changes(ChangeBatch {
            changes: vec![change("pkg-a", 10), change("pkg-a", 11)],
            last_seq: 11,
        });
        let docstore = Arc::new(MemDocstore::default());
        docstore
            .put(&Document::new(
                "obs!pkg-a",
                serde_json::json!({"realtime": {"modified_at": "2024-01-01T00:00:00Z"}}),
            ))
            .await?;
        let handler = Arc::new(RecordingHandler::default());
        let kill_switch = KillSwitch::default();
        let observer = observer(registry, docstore.clone(), handler.clone(), kill_switch.clone());
        let observer_task = tokio::spawn(async move { observer.run().await });

        let docstore_probe = docstore.clone();
        wait_for(move || {
            let docstore = docstore_probe.clone();
            futures::executor::block_on(async {
                docstore
                    .get(REALTIME_SEQ_KEY)
                    .await
                    .map(|doc| doc.value["seq"] == 11)
                    .unwrap_or(false)
            })
        })
        .await;
        // The handler was never invoked, the sequence still advanced.
        assert!(handler.notified.lock().unwrap().is_empty());
        kill_switch.kill();
        observer_task.await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_design_docs_are_ignored() -> anyhow::Result<()> {
        let registry = Arc::new(MemRegistry::default());
        registry.script_changes(ChangeBatch {
            changes: vec![change("_design/app", 5)],
            last_seq: 5,
        });
        let docstore = Arc::new(MemDocstore::default());
        let handler = Arc::new(RecordingHandler::default());
        let kill_switch = KillSwitch::default();
        let observer = observer(registry, docstore, handler.clone(), kill_switch.clone());
        let observer_task = tokio::spawn(async move { observer.run().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handler.notified.lock().unwrap().is_empty());
        kill_switch.kill();
        observer_task.await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_checkpoint_seq_is_monotonic_across_flushes() -> anyhow::Result<()> {
        let registry = Arc::new(MemRegistry::default());
        registry.insert_package("pkg-a", serde_json::json!({"time": {"modified": "2024-01-01T00:00:00Z"}}));
        registry.insert_package("pkg-b", serde_json::json!({"time": {"modified": "2024-01-02T00:00:00Z"}}));
        registry.script_changes(ChangeBatch {
            changes: vec![change("pkg-a", 7)],
            last_seq: 7,
        });
        registry.script_changes(ChangeBatch {
            changes: vec![change("pkg-b", 9)],
            last_seq: 9,
        });
        let docstore = Arc::new(MemDocstore::default());
        let handler = Arc::new(RecordingHandler::default());
        let kill_switch = KillSwitch::default();
        let observer = observer(registry, docstore.clone(), handler.clone(), kill_switch.clone());
        let observer_task = tokio::spawn(async move { observer.run().await });

        let docstore_probe = docstore.clone();
        wait_for(move || {
            let docstore = docstore_probe.clone();
            futures::executor::block_on(async {
                docstore
                    .get(REALTIME_SEQ_KEY)
                    .await
                    .map(|doc| doc.value["seq"] == 9)
                    .unwrap_or(false)
            })
        })
        .await;
        assert_eq!(handler.notified.lock().unwrap().len(), 2);
        kill_switch.kill();
        observer_task.await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_notification_leaves_checkpoint_untouched() -> anyhow::Result<()> {
        let registry = Arc::new(MemRegistry::default());
        registry.insert_package(
            "pkg-a",
            serde_json::json!({"time": {"modified": "2024-01-02T00:00:00Z"}}),
        );
        registry.script_changes(ChangeBatch {
            changes: vec![change("pkg-a", 3)],
            last_seq: 3,
        });
        let docstore = Arc::new(MemDocstore::default());
        let handler = Arc::new(RecordingHandler {
            failing_names: vec!["pkg-a".to_string()],
            ..Default::default()
        });
        let kill_switch = KillSwitch::default();
        let observer = observer(registry, docstore.clone(), handler.clone(), kill_switch.clone());
        let observer_task = tokio::spawn(async move { observer.run().await });

        let docstore_probe = docstore.clone();
        wait_for(move || {
            let docstore = docstore_probe.clone();
            futures::executor::block_on(async {
                docstore.get(REALTIME_SEQ_KEY).await.is_ok()
            })
        })
        .await;
        // The push failed: no per-package checkpoint was written, so the
        // next pass reconsiders the package.
        assert!(docstore.get("obs!pkg-a").await.unwrap_err().is_not_found());
        kill_switch.kill();
        observer_task.await??;
        Ok(())
    }
}
