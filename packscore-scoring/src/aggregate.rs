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

//! Population aggregation: per-metric distribution statistics over every
//! stored evaluation.

use std::collections::BTreeMap;

use futures::stream::{self, StreamExt, TryStreamExt};
use packscore_docstore::{DocumentStore, ViewParams};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

const EVALUATIONS_VIEW_DESIGN: &str = "packscore";
const EVALUATIONS_VIEW_NAME: &str = "evaluations";
/// Docs per view page.
const PAGE_SIZE: usize = 10_000;
/// Page reads in flight at once.
const MAX_PARALLEL_PAGES: usize = 100;
/// Fraction trimmed from each tail for the truncated mean.
const TRIM_FRACTION: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub truncated_mean: f64,
    pub median: f64,
}

/// Per-metric statistics, keyed `sub-vector -> metric`.
pub type Aggregation = BTreeMap<String, BTreeMap<String, MetricStats>>;

/// Computes distribution statistics over a sorted sample.
pub fn compute_stats(sorted_values: &[f64]) -> Option<MetricStats> {
    if sorted_values.is_empty() {
        return None;
    }
    let len = sorted_values.len();
    let mean = sorted_values.iter().sum::<f64>() / len as f64;
    let median = if len % 2 == 1 {
        sorted_values[len / 2]
    } else {
        (sorted_values[len / 2 - 1] + sorted_values[len / 2]) / 2.0
    };
    let trim = ((len as f64) * TRIM_FRACTION).floor() as usize;
    let trimmed = &sorted_values[trim..len - trim];
    let truncated_mean = trimmed.iter().sum::<f64>() / trimmed.len() as f64;
    Some(MetricStats {
        min: sorted_values[0],
        max: sorted_values[len - 1],
        mean,
        truncated_mean,
        median,
    })
}

/// Folds one evaluation object into the per-metric sample collection.
/// Negative values are measurement artifacts and are dropped.
fn accumulate(samples: &mut BTreeMap<(String, String), Vec<f64>>, evaluation: &JsonValue) {
    let Some(sub_vectors) = evaluation.as_object() else {
        return;
    };
    for (sub_vector_name, metrics) in sub_vectors {
        let Some(metrics) = metrics.as_object() else {
            continue;
        };
        for (metric_name, value) in metrics {
            let Some(value) = value.as_f64() else {
                continue;
            };
            if value < 0.0 {
                continue;
            }
            samples
                .entry((sub_vector_name.clone(), metric_name.clone()))
                .or_default()
                .push(value);
        }
    }
}

/// Iterates every stored evaluation through the `evaluations` view and
/// computes the aggregation. `None` when the corpus holds no evaluations.
pub async fn run_aggregation(
    docstore: &dyn DocumentStore,
) -> anyhow::Result<Option<Aggregation>> {
    let mut samples: BTreeMap<(String, String), Vec<f64>> = BTreeMap::new();
    let mut num_evaluations = 0usize;
    let mut wave = 0usize;
    'waves: loop {
        let page_skips: Vec<usize> = (0..MAX_PARALLEL_PAGES)
            .map(|page_in_wave| (wave * MAX_PARALLEL_PAGES + page_in_wave) * PAGE_SIZE)
            .collect();
        let pages: Vec<_> = stream::iter(page_skips)
            .map(|skip| async move {
                docstore
                    .query_view(
                        EVALUATIONS_VIEW_DESIGN,
                        EVALUATIONS_VIEW_NAME,
                        ViewParams {
                            limit: Some(PAGE_SIZE),
                            skip: Some(skip),
                            ..Default::default()
                        },
                    )
                    .await
            })
            .buffered(MAX_PARALLEL_PAGES)
            .try_collect()
            .await?;
        for page in &pages {
            for row in &page.rows {
                accumulate(&mut samples, &row.value);
                num_evaluations += 1;
            }
        }
        if pages.iter().any(|page| page.rows.len() < PAGE_SIZE) {
            break 'waves;
        }
        wave += 1;
    }
    if num_evaluations == 0 {
        return Ok(None);
    }
    info!(num_evaluations = num_evaluations, "aggregated evaluations");

    let mut aggregation: Aggregation = BTreeMap::new();
    for ((sub_vector_name, metric_name), mut values) in samples {
        values.sort_by(|left, right| left.partial_cmp(right).expect("samples are finite"));
        if let Some(stats) = compute_stats(&values) {
            aggregation
                .entry(sub_vector_name)
                .or_default()
                .insert(metric_name, stats);
        }
    }
    Ok(Some(aggregation))
}

/// Registers the production `evaluations` view shape on a test store.
#[cfg(test)]
pub(crate) fn register_evaluations_view(docstore: &packscore_docstore::MemDocstore) {
    use serde_json::json;
    docstore.register_view(EVALUATIONS_VIEW_DESIGN, EVALUATIONS_VIEW_NAME, |doc| {
        if !doc.id.starts_with("analysis!") {
            return Vec::new();
        }
        doc.value
            .get("evaluation")
            .map(|evaluation| vec![(json!(doc.id), evaluation.clone())])
            .unwrap_or_default()
    });
}

#[cfg(test)]
mod tests {
    use packscore_docstore::{Document, MemDocstore};
    use serde_json::json;

    use super::*;

    #[test]
    fn test_compute_stats() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        let stats = compute_stats(&values).unwrap();
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 100.0);
        assert_eq!(stats.mean, 50.5);
        assert_eq!(stats.median, 50.5);
        // 1% trimmed from each tail drops 1 and 100.
        assert_eq!(stats.truncated_mean, 50.5);

        let skewed = vec![0.0, 0.0, 0.0, 1000.0];
        let skewed_stats = compute_stats(&skewed).unwrap();
        assert_eq!(skewed_stats.median, 0.0);
        assert_eq!(skewed_stats.mean, 250.0);
    }

    #[test]
    fn test_compute_stats_empty_is_none() {
        assert!(compute_stats(&[]).is_none());
    }

    #[test]
    fn test_accumulate_filters_negatives() {
        let mut samples = BTreeMap::new();
        accumulate(
            &mut samples,
            &json!({"popularity": {"downloads_acceleration": -3.0, "downloads_count": 12.0}}),
        );
        assert!(!samples
            .contains_key(&("popularity".to_string(), "downloads_acceleration".to_string())));
        assert_eq!(
            samples[&("popularity".to_string(), "downloads_count".to_string())],
            vec![12.0]
        );
    }

    #[tokio::test]
    async fn test_aggregation_over_corpus() -> anyhow::Result<()> {
        let docstore = MemDocstore::default();
        register_evaluations_view(&docstore);
        for (name, downloads_count) in [("a", 10.0), ("b", 20.0), ("c", 60.0)] {
            docstore
                .put(&Document::new(
                    format!("analysis!{name}"),
                    json!({"evaluation": {"popularity": {"downloads_count": downloads_count}}}),
                ))
                .await?;
        }
        let aggregation = run_aggregation(&docstore).await?.unwrap();
        let stats = &aggregation["popularity"]["downloads_count"];
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 60.0);
        assert_eq!(stats.mean, 30.0);
        assert_eq!(stats.median, 20.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_aggregation_of_empty_corpus_is_none() -> anyhow::Result<()> {
        let docstore = MemDocstore::default();
        register_evaluations_view(&docstore);
        assert!(run_aggregation(&docstore).await?.is_none());
        Ok(())
    }
}
