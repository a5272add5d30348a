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

//! One-shot maintenance tasks.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{arg, ArgMatches, Command};
use packscore_analyzer::collect::{metadata, Collected};
use packscore_analyzer::evaluate::evaluate;
use packscore_analyzer::manifest::manifest_from_package_data;
use packscore_analyzer::{analysis_key, name_from_analysis_key, ANALYSIS_KEY_PREFIX};
use packscore_docstore::{
    delete_with_retry, Document, DocumentStore, KeyRangePager, ViewParams,
};
use packscore_queue::{Enqueuer, PRIORITY_STALE};
use packscore_registry::PackageRegistry;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::checklist::run_checklist;
use crate::services::AppContext;

const TASK_PAGE_SIZE: usize = 500;
const BULK_CHUNK_SIZE: usize = 100;
const COMPACTION_POLL_INTERVAL: Duration =
    Duration::from_millis(if cfg!(test) { 10 } else { 5_000 });
/// Key prefixes of earlier generations of the analysis namespace.
const LEGACY_ANALYSIS_PREFIXES: [&str; 2] = ["module!", "package!"];

/// Enqueues every upstream package that has no analysis document yet.
pub async fn enqueue_missing(
    registry: &dyn PackageRegistry,
    docstore: &dyn DocumentStore,
    queue: &dyn Enqueuer,
    dry_run: bool,
) -> anyhow::Result<usize> {
    let mut start_after = String::new();
    let mut num_enqueued = 0;
    loop {
        let names = registry.list_packages(&start_after, TASK_PAGE_SIZE).await?;
        let Some(last_name) = names.last() else {
            return Ok(num_enqueued);
        };
        start_after = last_name.clone();
        let analysis_keys: Vec<String> = names.iter().map(|name| analysis_key(name)).collect();
        let analysis_docs = docstore.bulk_get(&analysis_keys).await?;
        for (name, analysis_doc) in names.iter().zip(&analysis_docs) {
            if analysis_doc.is_some() {
                continue;
            }
            num_enqueued += 1;
            if dry_run {
                info!(name = %name, "would enqueue (dry run)");
            } else {
                queue.push(name, PRIORITY_STALE).await?;
            }
        }
    }
}

/// Enqueues every name emitted by a view. Rows may carry the name as a
/// string key or fall back to their analysis document id.
pub async fn enqueue_view(
    docstore: &dyn DocumentStore,
    queue: &dyn Enqueuer,
    design: &str,
    view: &str,
    dry_run: bool,
) -> anyhow::Result<usize> {
    let mut skip = 0usize;
    let mut num_enqueued = 0;
    loop {
        let page = docstore
            .query_view(
                design,
                view,
                ViewParams {
                    limit: Some(TASK_PAGE_SIZE),
                    skip: Some(skip),
                    ..Default::default()
                },
            )
            .await?;
        if page.rows.is_empty() {
            return Ok(num_enqueued);
        }
        skip += page.rows.len();
        for row in &page.rows {
            let name = row
                .key
                .as_str()
                .map(str::to_string)
                .or_else(|| name_from_analysis_key(&row.id).map(str::to_string));
            let Some(name) = name else {
                warn!(row_id = %row.id, "view row has no usable name, skipping");
                continue;
            };
            num_enqueued += 1;
            if dry_run {
                info!(name = %name, "would enqueue (dry run)");
            } else {
                queue.push(&name, PRIORITY_STALE).await?;
            }
        }
        if page.rows.len() < TASK_PAGE_SIZE {
            return Ok(num_enqueued);
        }
    }
}

/// Deletes analyses whose upstream package no longer exists.
pub async fn clean_extraneous(
    registry: &dyn PackageRegistry,
    docstore: &dyn DocumentStore,
    dry_run: bool,
) -> anyhow::Result<usize> {
    // Snapshot the names first: deleting while paging would shift the scan.
    let mut names: Vec<String> = Vec::new();
    let mut pager = KeyRangePager::new(docstore, ANALYSIS_KEY_PREFIX, TASK_PAGE_SIZE);
    while let Some(page) = pager.next_page().await? {
        names.extend(page.into_iter().filter_map(|(_, doc)| {
            name_from_analysis_key(&doc.id).map(str::to_string)
        }));
    }
    let mut num_deleted = 0;
    for chunk in names.chunks(BULK_CHUNK_SIZE) {
        let packages = registry.bulk_fetch_packages(chunk).await?;
        for (name, package) in chunk.iter().zip(&packages) {
            if package.is_some() {
                continue;
            }
            num_deleted += 1;
            if dry_run {
                info!(name = %name, "would delete extraneous analysis (dry run)");
            } else {
                warn!(name = %name, "deleting extraneous analysis");
                delete_with_retry(docstore, &analysis_key(name)).await?;
            }
        }
    }
    Ok(num_deleted)
}

/// Recomputes the evaluation layer of every analysis from its stored
/// collected signals.
pub async fn re_evaluate(docstore: &dyn DocumentStore) -> anyhow::Result<usize> {
    let mut num_updated = 0;
    let mut pager = KeyRangePager::new(docstore, ANALYSIS_KEY_PREFIX, TASK_PAGE_SIZE);
    while let Some(page) = pager.next_page().await? {
        for (_, mut doc) in page {
            let Some(collected_value) = doc.value.get("collected") else {
                continue;
            };
            let collected: Collected = match serde_json::from_value(collected_value.clone()) {
                Ok(collected) => collected,
                Err(parse_error) => {
                    warn!(err = %parse_error, key = %doc.id, "unparseable collected layer, skipping");
                    continue;
                }
            };
            doc.value["evaluation"] = serde_json::to_value(evaluate(&collected))?;
            match docstore.put(&doc).await {
                Ok(_) => num_updated += 1,
                Err(put_error) if put_error.is_conflict() => {
                    warn!(key = %doc.id, "conflict while re-evaluating, skipping");
                }
                Err(put_error) => return Err(put_error.into()),
            }
        }
    }
    Ok(num_updated)
}

/// Refreshes the metadata layer of every analysis from the live registry
/// document.
pub async fn re_metadata(
    registry: &dyn PackageRegistry,
    docstore: &dyn DocumentStore,
) -> anyhow::Result<usize> {
    let mut num_updated = 0;
    let mut pager = KeyRangePager::new(docstore, ANALYSIS_KEY_PREFIX, TASK_PAGE_SIZE);
    while let Some(page) = pager.next_page().await? {
        let names: Vec<String> = page
            .iter()
            .filter_map(|(_, doc)| name_from_analysis_key(&doc.id).map(str::to_string))
            .collect();
        let packages = registry.bulk_fetch_packages(&names).await?;
        for ((_, mut doc), package) in page.into_iter().zip(packages) {
            let Some(package_data) = package else {
                continue;
            };
            let manifest = match manifest_from_package_data(&package_data) {
                Ok(manifest) => manifest,
                Err(manifest_error) => {
                    warn!(err = %manifest_error, key = %doc.id, "manifest extraction failed, skipping");
                    continue;
                }
            };
            let refreshed = metadata::collect(&package_data, &manifest)?;
            doc.value["collected"]["metadata"] = serde_json::to_value(&refreshed)?;
            match docstore.put(&doc).await {
                Ok(_) => num_updated += 1,
                Err(put_error) if put_error.is_conflict() => {
                    warn!(key = %doc.id, "conflict while refreshing metadata, skipping");
                }
                Err(put_error) => return Err(put_error.into()),
            }
        }
    }
    Ok(num_updated)
}

/// View cleanup, then compaction, waiting until the store reports it done.
pub async fn optimize_db(docstore: &dyn DocumentStore, compact: bool) -> anyhow::Result<()> {
    docstore.view_cleanup().await?;
    if !compact {
        return Ok(());
    }
    docstore.compact().await?;
    loop {
        tokio::time::sleep(COMPACTION_POLL_INTERVAL).await;
        if !docstore.compaction_running().await? {
            return Ok(());
        }
    }
}

/// One-shot schema migration: legacy key prefixes move under `analysis!`
/// and the old `dependencies_health` metric becomes `health`. Running it
/// again finds nothing to do.
pub async fn migrate(docstore: &dyn DocumentStore) -> anyhow::Result<usize> {
    let mut num_migrated = 0;
    for legacy_prefix in LEGACY_ANALYSIS_PREFIXES {
        // Snapshot before mutating the key range.
        let mut legacy_docs: Vec<Document> = Vec::new();
        let mut pager = KeyRangePager::new(docstore, legacy_prefix, TASK_PAGE_SIZE);
        while let Some(page) = pager.next_page().await? {
            legacy_docs.extend(page.into_iter().map(|(_, doc)| doc));
        }
        for legacy_doc in legacy_docs {
            let name = legacy_doc
                .id
                .strip_prefix(legacy_prefix)
                .expect("pager only yields keys under the prefix");
            let new_key = analysis_key(name);
            let already_migrated = match docstore.get(&new_key).await {
                Ok(_) => true,
                Err(get_error) if get_error.is_not_found() => false,
                Err(get_error) => return Err(get_error.into()),
            };
            if !already_migrated {
                let mut migrated_value = legacy_doc.value.clone();
                rename_health_metric(&mut migrated_value);
                docstore.put(&Document::new(new_key, migrated_value)).await?;
            }
            delete_with_retry(docstore, &legacy_doc.id).await?;
            num_migrated += 1;
        }
    }
    Ok(num_migrated)
}

fn rename_health_metric(value: &mut JsonValue) {
    let Some(quality) = value
        .pointer_mut("/evaluation/quality")
        .and_then(JsonValue::as_object_mut)
    else {
        return;
    };
    if let Some(health) = quality.remove("dependencies_health") {
        quality.entry("health").or_insert(health);
    }
}

#[derive(Debug, PartialEq)]
pub enum TasksCliCommand {
    EnqueueMissing { config_path: PathBuf, dry_run: bool },
    EnqueueView {
        config_path: PathBuf,
        view: String,
        dry_run: bool,
    },
    CleanExtraneous { config_path: PathBuf, dry_run: bool },
    ReEvaluate { config_path: PathBuf },
    ReMetadata { config_path: PathBuf },
    OptimizeDb {
        config_path: PathBuf,
        no_compact: bool,
    },
    ProcessPackage { config_path: PathBuf, name: String },
    Migrate { config_path: PathBuf },
}

impl TasksCliCommand {
    pub fn build_command() -> Command {
        Command::new("tasks")
            .about("One-shot maintenance tasks.")
            .subcommand(
                Command::new("enqueue-missing")
                    .about("Enqueues every upstream package without an analysis.")
                    .arg(arg!(--"dry-run" "Log instead of enqueueing.")),
            )
            .subcommand(
                Command::new("enqueue-view")
                    .about("Enqueues every name emitted by a view.")
                    .arg(arg!(<view> "View as `design/view`."))
                    .arg(arg!(--"dry-run" "Log instead of enqueueing.")),
            )
            .subcommand(
                Command::new("clean-extraneous")
                    .about("Deletes analyses whose upstream package no longer exists.")
                    .arg(arg!(--"dry-run" "Log instead of deleting.")),
            )
            .subcommand(
                Command::new("re-evaluate")
                    .about("Recomputes the evaluation layer of every analysis."),
            )
            .subcommand(
                Command::new("re-metadata")
                    .about("Refreshes the metadata layer of every analysis."),
            )
            .subcommand(
                Command::new("optimize-db")
                    .about("Runs view cleanup and database compaction.")
                    .arg(arg!(--"no-compact" "Skip compaction.")),
            )
            .subcommand(
                Command::new("process-package")
                    .about("Runs the full pipeline on a single package, synchronously.")
                    .arg(arg!(<name> "Package name.")),
            )
            .subcommand(
                Command::new("migrate")
                    .about("One-shot schema migration; running it twice is a no-op."),
            )
            .subcommand_required(true)
    }

    pub fn parse_cli_args(mut matches: ArgMatches) -> anyhow::Result<Self> {
        let config_path = matches
            .remove_one::<String>("config")
            .map(PathBuf::from)
            .expect("`config` has a default value");
        let (subcommand, mut submatches) = matches
            .remove_subcommand()
            .context("failed to parse tasks subcommand")?;
        let command = match subcommand.as_str() {
            "enqueue-missing" => TasksCliCommand::EnqueueMissing {
                config_path,
                dry_run: submatches.get_flag("dry-run"),
            },
            "enqueue-view" => TasksCliCommand::EnqueueView {
                config_path,
                view: submatches
                    .remove_one::<String>("view")
                    .expect("`view` is required"),
                dry_run: submatches.get_flag("dry-run"),
            },
            "clean-extraneous" => TasksCliCommand::CleanExtraneous {
                config_path,
                dry_run: submatches.get_flag("dry-run"),
            },
            "re-evaluate" => TasksCliCommand::ReEvaluate { config_path },
            "re-metadata" => TasksCliCommand::ReMetadata { config_path },
            "optimize-db" => TasksCliCommand::OptimizeDb {
                config_path,
                no_compact: submatches.get_flag("no-compact"),
            },
            "process-package" => TasksCliCommand::ProcessPackage {
                config_path,
                name: submatches
                    .remove_one::<String>("name")
                    .expect("`name` is required"),
            },
            "migrate" => TasksCliCommand::Migrate { config_path },
            _ => bail!("unknown tasks subcommand `{subcommand}`"),
        };
        Ok(command)
    }

    pub async fn execute(self) -> anyhow::Result<()> {
        match self {
            TasksCliCommand::EnqueueMissing {
                config_path,
                dry_run,
            } => {
                let app = AppContext::load(&config_path).await?;
                let registry = app.registry()?;
                let docstore = app.docstore()?;
                let queue = app.queue();
                let num_enqueued =
                    enqueue_missing(&*registry, &*docstore, &*queue, dry_run).await?;
                println!("{num_enqueued} packages enqueued");
            }
            TasksCliCommand::EnqueueView {
                config_path,
                view,
                dry_run,
            } => {
                let Some((design, view_name)) = view.split_once('/') else {
                    bail!("expected `design/view`, got `{view}`");
                };
                let app = AppContext::load(&config_path).await?;
                let docstore = app.docstore()?;
                let queue = app.queue();
                let num_enqueued =
                    enqueue_view(&*docstore, &*queue, design, view_name, dry_run).await?;
                println!("{num_enqueued} packages enqueued");
            }
            TasksCliCommand::CleanExtraneous {
                config_path,
                dry_run,
            } => {
                let app = AppContext::load(&config_path).await?;
                let registry = app.registry()?;
                let docstore = app.docstore()?;
                let num_deleted = clean_extraneous(&*registry, &*docstore, dry_run).await?;
                println!("{num_deleted} extraneous analyses deleted");
            }
            TasksCliCommand::ReEvaluate { config_path } => {
                let app = AppContext::load(&config_path).await?;
                let docstore = app.docstore()?;
                let num_updated = re_evaluate(&*docstore).await?;
                println!("{num_updated} analyses re-evaluated");
            }
            TasksCliCommand::ReMetadata { config_path } => {
                let app = AppContext::load(&config_path).await?;
                let registry = app.registry()?;
                let docstore = app.docstore()?;
                let num_updated = re_metadata(&*registry, &*docstore).await?;
                println!("{num_updated} analyses refreshed");
            }
            TasksCliCommand::OptimizeDb {
                config_path,
                no_compact,
            } => {
                let app = AppContext::load(&config_path).await?;
                let docstore = app.docstore()?;
                optimize_db(&*docstore, !no_compact).await?;
                println!("database optimized");
            }
            TasksCliCommand::ProcessPackage { config_path, name } => {
                let app = AppContext::load(&config_path).await?;
                let registry = app.registry()?;
                let docstore = app.docstore()?;
                run_checklist(vec![
                    ("registry", registry.is_up().await),
                    ("document store", docstore.is_up().await),
                ])?;
                let analyzer = app.analyzer(registry, docstore)?;
                let analysis = analyzer.analyze(&name).await?;
                println!("{}", serde_json::to_string_pretty(&analysis)?);
            }
            TasksCliCommand::Migrate { config_path } => {
                let app = AppContext::load(&config_path).await?;
                let docstore = app.docstore()?;
                let num_migrated = migrate(&*docstore).await?;
                println!("{num_migrated} documents migrated");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use packscore_docstore::MemDocstore;
    use packscore_queue::MemWorkQueue;
    use packscore_registry::MemRegistry;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_enqueue_missing_skips_analyzed_packages() -> anyhow::Result<()> {
        let registry = MemRegistry::default();
        registry.insert_package("pkg-a", json!({}));
        registry.insert_package("pkg-b", json!({}));
        let docstore = MemDocstore::default();
        docstore
            .put(&Document::new("analysis!pkg-a", json!({})))
            .await?;
        let queue = MemWorkQueue::default();

        let num_enqueued = enqueue_missing(&registry, &docstore, &queue, false).await?;
        assert_eq!(num_enqueued, 1);
        let pushed = queue.pushed();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].name, "pkg-b");
        assert_eq!(pushed[0].priority, PRIORITY_STALE);

        // A dry run enqueues nothing.
        let queue = MemWorkQueue::default();
        let num_dry = enqueue_missing(&registry, &docstore, &queue, true).await?;
        assert_eq!(num_dry, 1);
        assert!(queue.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_clean_extraneous_deletes_orphans() -> anyhow::Result<()> {
        let registry = MemRegistry::default();
        registry.insert_package("pkg-alive", json!({}));
        let docstore = MemDocstore::default();
        docstore
            .put(&Document::new("analysis!pkg-alive", json!({})))
            .await?;
        docstore
            .put(&Document::new("analysis!pkg-gone", json!({})))
            .await?;

        let num_deleted = clean_extraneous(&registry, &docstore, false).await?;
        assert_eq!(num_deleted, 1);
        assert!(docstore.get("analysis!pkg-alive").await.is_ok());
        assert!(docstore
            .get("analysis!pkg-gone")
            .await
            .unwrap_err()
            .is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_re_evaluate_rewrites_evaluation() -> anyhow::Result<()> {
        let docstore = MemDocstore::default();
        docstore
            .put(&Document::new(
                "analysis!pkg-a",
                json!({
                    "collected": {
                        "metadata": {"name": "pkg-a"},
                        "registry": {
                            "dependents_count": 7,
                            "stars_count": 0,
                            "releases_count": 1
                        }
                    },
                    "evaluation": {"popularity": {"dependents_count": 0.0}}
                }),
            ))
            .await?;
        let num_updated = re_evaluate(&docstore).await?;
        assert_eq!(num_updated, 1);
        let doc = docstore.get("analysis!pkg-a").await?;
        assert_eq!(doc.value["evaluation"]["popularity"]["dependents_count"], 7.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() -> anyhow::Result<()> {
        let docstore = MemDocstore::default();
        docstore
            .put(&Document::new(
                "module!old-pkg",
                json!({
                    "collected": {"metadata": {"name": "old-pkg"}},
                    "evaluation": {"quality": {"dependencies_health": 0.5}}
                }),
            ))
            .await?;
        docstore
            .put(&Document::new("package!mid-pkg", json!({"collected": {}})))
            .await?;
        docstore
            .put(&Document::new("analysis!new-pkg", json!({"collected": {}})))
            .await?;

        let num_migrated = migrate(&docstore).await?;
        assert_eq!(num_migrated, 2);
        let mut keys_after_first = docstore.keys();
        keys_after_first.sort();
        assert_eq!(
            keys_after_first,
            vec!["analysis!mid-pkg", "analysis!new-pkg", "analysis!old-pkg"]
        );
        let migrated = docstore.get("analysis!old-pkg").await?;
        assert_eq!(migrated.value["evaluation"]["quality"]["health"], 0.5);
        assert!(migrated.value["evaluation"]["quality"]
            .get("dependencies_health")
            .is_none());

        // Second run: nothing left to migrate, same document set.
        let num_migrated_again = migrate(&docstore).await?;
        assert_eq!(num_migrated_again, 0);
        let mut keys_after_second = docstore.keys();
        keys_after_second.sort();
        assert_eq!(keys_after_first, keys_after_second);
        Ok(())
    }

    #[tokio::test]
    async fn test_enqueue_view_reads_names_from_keys() -> anyhow::Result<()> {
        let docstore = MemDocstore::default();
        docstore.register_view("packscore", "needs-refresh", |doc| {
            doc.id
                .strip_prefix("analysis!")
                .map(|name| vec![(json!(name), json!(null))])
                .unwrap_or_default()
        });
        docstore
            .put(&Document::new("analysis!pkg-a", json!({})))
            .await?;
        let queue = MemWorkQueue::default();
        let num_enqueued =
            enqueue_view(&docstore, &queue, "packscore", "needs-refresh", false).await?;
        assert_eq!(num_enqueued, 1);
        assert_eq!(queue.pushed()[0].name, "pkg-a");
        Ok(())
    }

    #[tokio::test]
    async fn test_optimize_db_waits_for_compaction() -> anyhow::Result<()> {
        let docstore = MemDocstore::default();
        optimize_db(&docstore, true).await?;
        optimize_db(&docstore, false).await?;
        Ok(())
    }
}
