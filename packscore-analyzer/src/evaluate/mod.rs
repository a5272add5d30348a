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

//! Evaluators: pure functions from collected signals to the three
//! sub-vectors. Every component is weakly monotone in its positive inputs;
//! population-relative normalization happens later, in the scoring cycle.

mod maintenance;
mod popularity;
mod quality;

pub use maintenance::{evaluate_maintenance, MaintenanceEvaluation};
pub use popularity::{evaluate_popularity, PopularityEvaluation};
pub use quality::{evaluate_quality, QualityEvaluation};
use serde::{Deserialize, Serialize};

use crate::collect::Collected;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub quality: QualityEvaluation,
    pub popularity: PopularityEvaluation,
    pub maintenance: MaintenanceEvaluation,
}

pub fn evaluate(collected: &Collected) -> Evaluation {
    Evaluation {
        quality: evaluate_quality(collected),
        popularity: evaluate_popularity(collected),
        maintenance: evaluate_maintenance(collected),
    }
}

/// Saturating linear ramp onto the unit interval.
pub(crate) fn unit(value: f64, saturation: f64) -> f64 {
    (value / saturation).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::{RegistryStats, SourceHostInfo};

    #[test]
    fn test_evaluation_of_empty_collected_is_flat() {
        let evaluation = evaluate(&Collected::default());
        assert_eq!(evaluation.popularity.community_interest, 0.0);
        assert_eq!(evaluation.popularity.downloads_count, 0.0);
        assert_eq!(evaluation.maintenance.releases_frequency, 0.0);
    }

    #[test]
    fn test_stars_weakly_increase_community_interest() {
        let mut collected = Collected {
            registry: Some(RegistryStats::default()),
            source_host: Some(SourceHostInfo::default()),
            ..Default::default()
        };
        let mut previous_interest = f64::MIN;
        for stars_count in [0u64, 1, 10, 100, 10_000] {
            collected.source_host.as_mut().unwrap().stars_count = stars_count;
            let interest = evaluate(&collected).popularity.community_interest;
            assert!(interest >= previous_interest);
            previous_interest = interest;
        }
    }
}
