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

//! The scoring cycle: Prepare, Aggregate, Score, Finalize, Sleep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use packscore_docstore::{put_with_retry, DocumentStore, KeyRangePager};
use packscore_index::{resolve_alias, AliasAction, SearchIndex, CURRENT_ALIAS, NEW_ALIAS};
use serde_json::json;
use tracing::{error, info, warn};

use crate::aggregate::run_aggregation;
use crate::score::compute_score;
use crate::{score_index_schema, AGGREGATION_KEY, SCORE_INDEX_PREFIX};

const ANALYSIS_KEY_PREFIX: &str = "analysis!";
const SCORE_PAGE_SIZE: usize = 1_000;
const FAILURE_RETRY_DELAY: Duration = Duration::from_secs(if cfg!(test) { 1 } else { 600 });

#[derive(Debug, Clone)]
pub struct CycleOptions {
    pub cycle_delay: Duration,
}

impl Default for CycleOptions {
    fn default() -> Self {
        Self {
            cycle_delay: Duration::from_secs(3 * 3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The fresh index was populated and swapped into `current`.
    Swapped {
        index_name: String,
        num_docs: u64,
    },
    /// Zero evaluations: scoring skipped, the previous `current` untouched.
    Skipped,
}

pub struct ScoringCycle {
    docstore: Arc<dyn DocumentStore>,
    search_index: Arc<dyn SearchIndex>,
    options: CycleOptions,
    kill_switch: packscore_common::KillSwitch,
}

impl ScoringCycle {
    pub fn new(
        docstore: Arc<dyn DocumentStore>,
        search_index: Arc<dyn SearchIndex>,
        options: CycleOptions,
        kill_switch: packscore_common::KillSwitch,
    ) -> Self {
        Self {
            docstore,
            search_index,
            options,
            kill_switch,
        }
    }

    /// When the previous cycle (as witnessed by the persisted aggregation)
    /// finished less than a cycle ago, the remainder is honored before the
    /// first cycle of this process starts.
    async fn startup_delay(&self) -> Duration {
        let computed_at = match self.docstore.get(AGGREGATION_KEY).await {
            Ok(doc) => doc
                .value
                .get("computed_at")
                .and_then(|value| value.as_str())
                .and_then(|date| chrono::DateTime::parse_from_rfc3339(date).ok())
                .map(|date| date.with_timezone(&Utc)),
            Err(error) if error.is_not_found() => None,
            Err(error) => {
                warn!(err = %error, "failed to read the aggregation document");
                None
            }
        };
        let Some(computed_at) = computed_at else {
            return Duration::ZERO;
        };
        let next_cycle_at = computed_at
            + chrono::Duration::from_std(self.options.cycle_delay).unwrap_or_default();
        (next_cycle_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Runs cycles forever. The cycle delay is measured from cycle start;
    /// a failed cycle retries sooner.
    pub async fn run(&self) -> anyhow::Result<()> {
        let startup_delay = self.startup_delay().await;
        if !startup_delay.is_zero() {
            info!(delay_secs = startup_delay.as_secs(), "waiting out the previous cycle's delay");
            tokio::select! {
                _ = self.kill_switch.killed() => return Ok(()),
                _ = tokio::time::sleep(startup_delay) => {}
            }
        }
        loop {
            if self.kill_switch.is_dead() {
                return Ok(());
            }
            let cycle_started = tokio::time::Instant::now();
            let sleep_duration = match self.run_cycle().await {
                Ok(outcome) => {
                    info!(outcome = ?outcome, "scoring cycle completed");
                    self.options
                        .cycle_delay
                        .saturating_sub(cycle_started.elapsed())
                }
                Err(cycle_error) => {
                    error!(err = %cycle_error, "scoring cycle failed");
                    FAILURE_RETRY_DELAY
                }
            };
            tokio::select! {
                _ = self.kill_switch.killed() => return Ok(()),
                _ = tokio::time::sleep(sleep_duration) => {}
            }
        }
    }

    pub async fn run_cycle(&self) -> anyhow::Result<CycleOutcome> {
        // Prepare: fresh physical index, `new` alias on it, stray indices
        // removed.
        let existing_indices = self
            .search_index
            .list_indices(&format!("{SCORE_INDEX_PREFIX}*"))
            .await?;
        let current_targets = resolve_alias(&*self.search_index, CURRENT_ALIAS).await?;
        let previous_new_targets = resolve_alias(&*self.search_index, NEW_ALIAS).await?;

        let mut epoch_ms = Utc::now().timestamp_millis();
        while existing_indices.contains(&format!("{SCORE_INDEX_PREFIX}{epoch_ms}")) {
            epoch_ms += 1;
        }
        let new_index_name = format!("{SCORE_INDEX_PREFIX}{epoch_ms}");
        self.search_index
            .create_index(&new_index_name, &score_index_schema())
            .await?;
        let mut prepare_actions: Vec<AliasAction> = previous_new_targets
            .iter()
            .map(|index| AliasAction::Remove {
                index: index.clone(),
                alias: NEW_ALIAS.to_string(),
            })
            .collect();
        prepare_actions.push(AliasAction::Add {
            index: new_index_name.clone(),
            alias: NEW_ALIAS.to_string(),
        });
        self.search_index.update_aliases(&prepare_actions).await?;
        for index in &existing_indices {
            if !current_targets.contains(index) {
                info!(index = %index, "deleting index not referenced by `current`");
                if let Err(delete_error) = self.search_index.delete_index(index).await {
                    warn!(err = %delete_error, index = %index, "failed to delete stray index");
                }
            }
        }

        // Aggregate.
        let Some(aggregation) = run_aggregation(&*self.docstore).await? else {
            info!("no evaluations in the corpus, skipping scoring");
            self.search_index
                .update_aliases(&[AliasAction::Remove {
                    index: new_index_name.clone(),
                    alias: NEW_ALIAS.to_string(),
                }])
                .await?;
            self.search_index.delete_index(&new_index_name).await?;
            return Ok(CycleOutcome::Skipped);
        };
        let mut aggregation_value = serde_json::to_value(&aggregation)?;
        aggregation_value["computed_at"] = json!(Utc::now().to_rfc3339());
        put_with_retry(&*self.docstore, AGGREGATION_KEY, aggregation_value).await?;

        // Score every analysis into the fresh index.
        let mut num_docs = 0u64;
        let mut pager = KeyRangePager::new(&*self.docstore, ANALYSIS_KEY_PREFIX, SCORE_PAGE_SIZE);
        while let Some(page) = pager.next_page().await? {
            for (_, analysis_doc) in page {
                let Some(score_doc) = compute_score(&analysis_doc.value, &aggregation) else {
                    warn!(key = %analysis_doc.id, "analysis has no scoreable metadata, skipping");
                    continue;
                };
                self.search_index
                    .index_doc(
                        &new_index_name,
                        &score_doc.name,
                        &serde_json::to_value(&score_doc)?,
                    )
                    .await?;
                num_docs += 1;
            }
        }

        // Finalize: one atomic alias update swaps `current`, then the old
        // physical indices go.
        let mut finalize_actions = vec![AliasAction::Remove {
            index: new_index_name.clone(),
            alias: NEW_ALIAS.to_string(),
        }];
        for index in &current_targets {
            finalize_actions.push(AliasAction::Remove {
                index: index.clone(),
                alias: CURRENT_ALIAS.to_string(),
            });
        }
        finalize_actions.push(AliasAction::Add {
            index: new_index_name.clone(),
            alias: CURRENT_ALIAS.to_string(),
        });
        self.search_index.update_aliases(&finalize_actions).await?;
        for index in &current_targets {
            if let Err(delete_error) = self.search_index.delete_index(index).await {
                warn!(err = %delete_error, index = %index, "failed to delete previous index");
            }
        }
        Ok(CycleOutcome::Swapped {
            index_name: new_index_name,
            num_docs,
        })
    }
}

#[cfg(test)]
mod tests {
    use packscore_common::KillSwitch;
    use packscore_docstore::{Document, MemDocstore};
    use packscore_index::MemScoreIndex;

    use super::*;
    use crate::aggregate::register_evaluations_view;

    async fn insert_analysis(docstore: &MemDocstore, name: &str, downloads_count: f64) {
        docstore
            .put(&Document::new(
                format!("analysis!{name}"),
                json!({
                    "collected": {"metadata": {"name": name, "version": "1.0.0"}},
                    "evaluation": {"popularity": {"downloads_count": downloads_count}}
                }),
            ))
            .await
            .unwrap();
    }

    fn cycle(docstore: Arc<MemDocstore>, search_index: Arc<MemScoreIndex>) -> ScoringCycle {
        ScoringCycle::new(
            docstore,
            search_index,
            CycleOptions::default(),
            KillSwitch::default(),
        )
    }

    #[tokio::test]
    async fn test_cycle_scores_and_swaps_atomically() -> anyhow::Result<()> {
        let docstore = Arc::new(MemDocstore::default());
        register_evaluations_view(&docstore);
        for (name, downloads) in [("a", 10.0), ("b", 100.0), ("c", 60.0)] {
            insert_analysis(&docstore, name, downloads).await;
        }
        let search_index = Arc::new(MemScoreIndex::default());
        let scoring_cycle = cycle(docstore.clone(), search_index.clone());

        let outcome = scoring_cycle.run_cycle().await?;
        let CycleOutcome::Swapped {
            index_name,
            num_docs,
        } = outcome
        else {
            panic!("expected a swap");
        };
        assert_eq!(num_docs, 3);
        // `current` points at exactly the fresh index; `new` is gone.
        assert_eq!(
            resolve_alias(&*search_index, CURRENT_ALIAS).await?,
            vec![index_name.clone()]
        );
        assert!(resolve_alias(&*search_index, NEW_ALIAS).await?.is_empty());
        assert_eq!(search_index.count_docs(CURRENT_ALIAS).await?, 3);
        // The aggregation was persisted.
        let aggregation_doc = docstore.get(AGGREGATION_KEY).await?;
        assert!(aggregation_doc.value["popularity"]["downloads_count"]["mean"].is_number());
        Ok(())
    }

    #[tokio::test]
    async fn test_second_cycle_replaces_first_index() -> anyhow::Result<()> {
        let docstore = Arc::new(MemDocstore::default());
        register_evaluations_view(&docstore);
        insert_analysis(&docstore, "a", 10.0).await;
        let search_index = Arc::new(MemScoreIndex::default());
        let scoring_cycle = cycle(docstore.clone(), search_index.clone());

        let first_outcome = scoring_cycle.run_cycle().await?;
        let second_outcome = scoring_cycle.run_cycle().await?;
        let (CycleOutcome::Swapped { index_name: first_index, .. },
             CycleOutcome::Swapped { index_name: second_index, .. }) =
            (first_outcome, second_outcome)
        else {
            panic!("expected two swaps");
        };
        assert_ne!(first_index, second_index);
        // Exactly one physical index remains and `current` points at it.
        assert_eq!(
            search_index.list_indices("scores-*").await?,
            vec![second_index.clone()]
        );
        assert_eq!(
            resolve_alias(&*search_index, CURRENT_ALIAS).await?,
            vec![second_index]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_evaluations_skip_scoring_and_preserve_current() -> anyhow::Result<()> {
        let docstore = Arc::new(MemDocstore::default());
        register_evaluations_view(&docstore);
        insert_analysis(&docstore, "a", 10.0).await;
        let search_index = Arc::new(MemScoreIndex::default());
        let scoring_cycle = cycle(docstore.clone(), search_index.clone());
        let CycleOutcome::Swapped { index_name, .. } = scoring_cycle.run_cycle().await? else {
            panic!("expected a swap");
        };

        // Wipe the corpus: next cycle sees zero evaluations.
        let analysis_doc = docstore.get("analysis!a").await?;
        docstore
            .delete("analysis!a", analysis_doc.rev.as_deref().unwrap())
            .await?;
        let outcome = scoring_cycle.run_cycle().await?;
        assert_eq!(outcome, CycleOutcome::Skipped);
        // The previous `current` alias is untouched and `new` left nothing
        // behind.
        assert_eq!(
            resolve_alias(&*search_index, CURRENT_ALIAS).await?,
            vec![index_name]
        );
        assert!(resolve_alias(&*search_index, NEW_ALIAS).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_aggregation_doc_is_not_scored() -> anyhow::Result<()> {
        // The aggregation lives under `scoring!`, outside the analysis key
        // range, so a second cycle does not try to score it.
        let docstore = Arc::new(MemDocstore::default());
        register_evaluations_view(&docstore);
        insert_analysis(&docstore, "a", 10.0).await;
        let search_index = Arc::new(MemScoreIndex::default());
        let scoring_cycle = cycle(docstore.clone(), search_index.clone());
        scoring_cycle.run_cycle().await?;
        let CycleOutcome::Swapped { num_docs, .. } = scoring_cycle.run_cycle().await? else {
            panic!("expected a swap");
        };
        assert_eq!(num_docs, 1);
        Ok(())
    }
}
