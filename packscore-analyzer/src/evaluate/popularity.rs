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

use serde::{Deserialize, Serialize};

use crate::collect::metadata::CountRange;
use crate::collect::Collected;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PopularityEvaluation {
    pub community_interest: f64,
    pub downloads_count: f64,
    pub downloads_acceleration: f64,
    pub dependents_count: f64,
}

pub fn evaluate_popularity(collected: &Collected) -> PopularityEvaluation {
    let registry = collected.registry.as_ref();
    let source_host = collected.source_host.as_ref();

    let community_interest = source_host
        .map(|info| {
            (info.stars_count
                + info.forks_count
                + info.subscribers_count
                + info.contributors.len() as u64) as f64
        })
        .unwrap_or(0.0)
        + registry.map(|stats| stats.stars_count as f64).unwrap_or(0.0);

    let downloads = registry.map(|stats| stats.downloads.as_slice()).unwrap_or(&[]);
    // Monthly mean over the last quarter.
    let downloads_count = window_count(downloads, 90).map(|count| count / 3.0).unwrap_or(0.0);

    PopularityEvaluation {
        community_interest,
        downloads_count,
        downloads_acceleration: downloads_acceleration(downloads),
        dependents_count: registry
            .map(|stats| stats.dependents_count as f64)
            .unwrap_or(0.0),
    }
}

/// Velocity deltas between successive windows, weighing the recent ones
/// heavier. Positive when the package is being adopted, negative when it is
/// bleeding users.
fn downloads_acceleration(downloads: &[CountRange]) -> f64 {
    let daily = |days: i64| window_count(downloads, days).map(|count| count / days as f64);
    let (Some(daily_1), Some(daily_7), Some(daily_30), Some(daily_90)) =
        (daily(1), daily(7), daily(30), daily(90))
    else {
        return 0.0;
    };
    0.4 * (daily_1 - daily_7) + 0.35 * (daily_7 - daily_30) + 0.25 * (daily_30 - daily_90)
}

fn window_count(ranges: &[CountRange], days: i64) -> Option<f64> {
    ranges
        .iter()
        .find(|range| (range.to - range.from).num_days() == days)
        .map(|range| range.count as f64)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::collect::RegistryStats;
    use crate::collect::registry_stats::DOWNLOAD_RANGES_DAYS;

    fn ranges_with_counts(counts: [u64; 6]) -> Vec<CountRange> {
        let now = Utc::now();
        DOWNLOAD_RANGES_DAYS
            .iter()
            .zip(counts)
            .map(|(&days, count)| CountRange {
                from: now - Duration::days(days),
                to: now,
                count,
            })
            .collect()
    }

    #[test]
    fn test_downloads_count_is_monthly_mean_of_last_quarter() {
        let collected = Collected {
            registry: Some(RegistryStats {
                downloads: ranges_with_counts([10, 70, 300, 900, 1_800, 3_600]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let popularity = evaluate_popularity(&collected);
        assert_eq!(popularity.downloads_count, 300.0);
    }

    #[test]
    fn test_acceleration_positive_for_growth() {
        // Flat 10/day historically, 20/day today.
        let growing = Collected {
            registry: Some(RegistryStats {
                downloads: ranges_with_counts([20, 80, 310, 910, 1_810, 3_610]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(evaluate_popularity(&growing).downloads_acceleration > 0.0);

        let flat = Collected {
            registry: Some(RegistryStats {
                downloads: ranges_with_counts([10, 70, 300, 900, 1_800, 3_600]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(evaluate_popularity(&flat).downloads_acceleration.abs() < 1e-9);
    }

    #[test]
    fn test_dependents_count_passes_through() {
        let collected = Collected {
            registry: Some(RegistryStats {
                dependents_count: 42,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(evaluate_popularity(&collected).dependents_count, 42.0);
    }
}
