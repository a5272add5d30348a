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

//! Per-package score computation against the population aggregation.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::aggregate::{Aggregation, MetricStats};

const QUALITY_WEIGHTS: [(&str, f64); 4] = [
    ("carefulness", 0.35),
    ("tests", 0.3),
    ("health", 0.2),
    ("branding", 0.15),
];
const POPULARITY_WEIGHTS: [(&str, f64); 4] = [
    ("community_interest", 0.25),
    ("downloads_count", 0.35),
    ("downloads_acceleration", 0.15),
    ("dependents_count", 0.25),
];
const MAINTENANCE_WEIGHTS: [(&str, f64); 4] = [
    ("releases_frequency", 0.3),
    ("commits_frequency", 0.3),
    ("open_issues", 0.2),
    ("issues_distribution", 0.2),
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreDetail {
    pub quality: f64,
    pub popularity: f64,
    pub maintenance: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Score {
    #[serde(rename = "final")]
    pub final_score: f64,
    pub detail: ScoreDetail,
}

/// What lands in the score index for one package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreDocument {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    pub score: Score,
}

/// Maps a raw metric into the unit interval relative to the population.
///
/// The saturation point is twice the truncated mean (clamped to the
/// observed max), so a package twice as good as the trimmed average earns
/// full marks and outliers cannot flatten everyone else.
fn normalize(value: f64, stats: &MetricStats) -> f64 {
    let saturation = (stats.truncated_mean * 2.0).min(stats.max);
    if saturation <= stats.min {
        return if value >= saturation { 1.0 } else { 0.0 };
    }
    ((value - stats.min) / (saturation - stats.min)).clamp(0.0, 1.0)
}

fn weighted_sub_score(
    evaluation: &JsonValue,
    aggregation: &Aggregation,
    sub_vector_name: &str,
    weights: &[(&str, f64)],
) -> f64 {
    let Some(metric_stats) = aggregation.get(sub_vector_name) else {
        return 0.0;
    };
    let mut score = 0.0;
    let mut total_weight = 0.0;
    for (metric_name, weight) in weights {
        let Some(stats) = metric_stats.get(*metric_name) else {
            continue;
        };
        let value = evaluation
            .pointer(&format!("/{sub_vector_name}/{metric_name}"))
            .and_then(JsonValue::as_f64)
            .unwrap_or(0.0);
        score += weight * normalize(value, stats);
        total_weight += weight;
    }
    if total_weight == 0.0 {
        return 0.0;
    }
    score / total_weight
}

/// Computes the score vector for one analysis document.
///
/// `analysis` is the persisted document (carrying `collected` and
/// `evaluation`); the aggregation is the population reference computed this
/// cycle.
pub fn compute_score(analysis: &JsonValue, aggregation: &Aggregation) -> Option<ScoreDocument> {
    let metadata = analysis.pointer("/collected/metadata")?;
    let name = metadata.get("name")?.as_str()?.to_string();
    let evaluation = analysis.get("evaluation")?;
    let quality = weighted_sub_score(evaluation, aggregation, "quality", &QUALITY_WEIGHTS);
    let popularity = weighted_sub_score(evaluation, aggregation, "popularity", &POPULARITY_WEIGHTS);
    let maintenance =
        weighted_sub_score(evaluation, aggregation, "maintenance", &MAINTENANCE_WEIGHTS);
    let final_score = 0.3 * quality + 0.35 * popularity + 0.35 * maintenance;
    Some(ScoreDocument {
        name,
        version: metadata
            .get("version")
            .and_then(JsonValue::as_str)
            .map(str::to_string),
        description: metadata
            .get("description")
            .and_then(JsonValue::as_str)
            .map(str::to_string),
        keywords: metadata
            .get("keywords")
            .and_then(JsonValue::as_array)
            .map(|keywords| {
                keywords
                    .iter()
                    .filter_map(JsonValue::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        score: Score {
            final_score,
            detail: ScoreDetail {
                quality,
                popularity,
                maintenance,
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;

    fn stats(min: f64, max: f64, truncated_mean: f64) -> MetricStats {
        MetricStats {
            min,
            max,
            mean: truncated_mean,
            truncated_mean,
            median: truncated_mean,
        }
    }

    fn aggregation_with_downloads() -> Aggregation {
        let mut aggregation = Aggregation::new();
        let mut popularity = BTreeMap::new();
        popularity.insert("downloads_count".to_string(), stats(0.0, 1_000_000.0, 100.0));
        aggregation.insert("popularity".to_string(), popularity);
        aggregation
    }

    fn analysis_with_downloads(name: &str, downloads_count: f64) -> JsonValue {
        json!({
            "collected": {"metadata": {"name": name, "version": "1.0.0"}},
            "evaluation": {"popularity": {"downloads_count": downloads_count}}
        })
    }

    #[test]
    fn test_normalize_saturates_at_twice_truncated_mean() {
        let metric_stats = stats(0.0, 1_000_000.0, 100.0);
        assert_eq!(normalize(0.0, &metric_stats), 0.0);
        assert_eq!(normalize(100.0, &metric_stats), 0.5);
        assert_eq!(normalize(200.0, &metric_stats), 1.0);
        assert_eq!(normalize(1_000_000.0, &metric_stats), 1.0);
    }

    #[test]
    fn test_degenerate_population_does_not_divide_by_zero() {
        // Every package identical: at-the-bar earns full marks, below earns
        // none, and nothing divides by zero.
        let metric_stats = stats(5.0, 5.0, 5.0);
        assert_eq!(normalize(5.0, &metric_stats), 1.0);
        assert_eq!(normalize(4.0, &metric_stats), 0.0);
    }

    #[test]
    fn test_score_is_population_relative_and_monotone() {
        let aggregation = aggregation_with_downloads();
        let low = compute_score(&analysis_with_downloads("low", 10.0), &aggregation).unwrap();
        let high = compute_score(&analysis_with_downloads("high", 150.0), &aggregation).unwrap();
        assert!(high.score.final_score > low.score.final_score);
        assert!(high.score.detail.popularity > low.score.detail.popularity);
        assert_eq!(high.name, "high");
        assert_eq!(high.version.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn test_score_of_document_without_metadata_is_none() {
        assert!(compute_score(&json!({"evaluation": {}}), &aggregation_with_downloads()).is_none());
    }
}
