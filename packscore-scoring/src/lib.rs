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

//! The scoring subsystem: population aggregation, per-package score
//! computation, and the cycle that swaps the fresh score index into the
//! `current` alias.

pub mod aggregate;
pub mod cycle;
pub mod score;

pub use aggregate::{run_aggregation, Aggregation, MetricStats};
pub use cycle::{CycleOptions, CycleOutcome, ScoringCycle};
pub use score::{compute_score, ScoreDocument};
use serde_json::{json, Value as JsonValue};

/// Singleton key of the aggregation document.
pub const AGGREGATION_KEY: &str = "scoring!aggregation";
/// Physical score indices are `scores-<epoch-ms>`.
pub const SCORE_INDEX_PREFIX: &str = "scores-";

/// The fixed mapping of a score index.
pub fn score_index_schema() -> JsonValue {
    json!({
        "settings": {
            "number_of_shards": 1,
            "analysis": {
                "analyzer": {
                    "identifier": {
                        "type": "custom",
                        "tokenizer": "standard",
                        "filter": ["lowercase"]
                    }
                }
            }
        },
        "mappings": {
            "properties": {
                "name": {"type": "text", "analyzer": "identifier"},
                "description": {"type": "text"},
                "keywords": {"type": "text", "analyzer": "identifier"},
                "version": {"type": "keyword"},
                "score": {
                    "properties": {
                        "final": {"type": "double"},
                        "detail": {
                            "properties": {
                                "quality": {"type": "double"},
                                "popularity": {"type": "double"},
                                "maintenance": {"type": "double"}
                            }
                        }
                    }
                }
            }
        }
    })
}
