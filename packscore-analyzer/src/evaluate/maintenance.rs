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

/// Mean open time at which the issue-responsiveness score halves.
const ISSUE_OPEN_HALF_LIFE_SECS: f64 = 7.0 * 24.0 * 3_600.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceEvaluation {
    pub releases_frequency: f64,
    pub commits_frequency: f64,
    pub open_issues: f64,
    pub issues_distribution: f64,
}

pub fn evaluate_maintenance(collected: &Collected) -> MaintenanceEvaluation {
    let source_host = collected.source_host.as_ref();
    let issues = source_host.map(|info| &info.issues);

    let open_issues = match issues {
        Some(issues) if !issues.is_disabled => {
            let open_ratio = issues.open_count as f64 / (issues.count + 1) as f64;
            1.0 / (1.0 + 10.0 * open_ratio)
        }
        _ => 0.0,
    };
    let issues_distribution = match issues {
        Some(issues) if !issues.is_disabled && !issues.distribution.is_empty() => {
            let total: u64 = issues.distribution.values().sum();
            let weighted_open_secs: f64 = issues
                .distribution
                .iter()
                .map(|(&bucket_secs, &bucket_count)| bucket_secs as f64 * bucket_count as f64)
                .sum::<f64>()
                / total.max(1) as f64;
            1.0 / (1.0 + weighted_open_secs / ISSUE_OPEN_HALF_LIFE_SECS)
        }
        _ => 0.0,
    };

    MaintenanceEvaluation {
        releases_frequency: monthly_frequency(&collected.metadata.releases),
        commits_frequency: monthly_frequency(
            source_host.map(|info| info.commits.as_slice()).unwrap_or(&[]),
        ),
        open_issues,
        issues_distribution,
    }
}

/// Mean monthly event rate across the windows, each window contributing
/// equally so a recent burst cannot masquerade as sustained activity.
fn monthly_frequency(ranges: &[CountRange]) -> f64 {
    if ranges.is_empty() {
        return 0.0;
    }
    let monthly_rates: f64 = ranges
        .iter()
        .filter_map(|range| {
            let days = (range.to - range.from).num_days();
            if days <= 0 {
                return None;
            }
            Some(range.count as f64 / (days as f64 / 30.0))
        })
        .sum();
    monthly_rates / ranges.len() as f64
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::collect::source_host::IssuesInfo;
    use crate::collect::SourceHostInfo;

    fn range(days: i64, count: u64) -> CountRange {
        let now = Utc::now();
        CountRange {
            from: now - Duration::days(days),
            to: now,
            count,
        }
    }

    #[test]
    fn test_monthly_frequency() {
        // One release every month in both windows.
        let ranges = vec![range(30, 1), range(90, 3)];
        assert!((monthly_frequency(&ranges) - 1.0).abs() < 1e-9);
        assert_eq!(monthly_frequency(&[]), 0.0);
    }

    #[test]
    fn test_fewer_open_issues_score_higher() {
        let evaluate_with_open = |open_count: u64| {
            let collected = Collected {
                source_host: Some(SourceHostInfo {
                    issues: IssuesInfo {
                        count: 100,
                        open_count,
                        ..Default::default()
                    },
                    ..Default::default()
                }),
                ..Default::default()
            };
            evaluate_maintenance(&collected).open_issues
        };
        assert!(evaluate_with_open(5) > evaluate_with_open(60));
    }

    #[test]
    fn test_disabled_issues_score_zero() {
        let collected = Collected {
            source_host: Some(SourceHostInfo {
                issues: IssuesInfo {
                    count: 10,
                    open_count: 1,
                    is_disabled: true,
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        let maintenance = evaluate_maintenance(&collected);
        assert_eq!(maintenance.open_issues, 0.0);
        assert_eq!(maintenance.issues_distribution, 0.0);
    }

    #[test]
    fn test_fast_issue_turnaround_scores_higher() {
        let evaluate_with_bucket = |bucket_secs: u64| {
            let collected = Collected {
                source_host: Some(SourceHostInfo {
                    issues: IssuesInfo {
                        count: 10,
                        open_count: 0,
                        distribution: [(bucket_secs, 10u64)].into_iter().collect(),
                        ..Default::default()
                    },
                    ..Default::default()
                }),
                ..Default::default()
            };
            evaluate_maintenance(&collected).issues_distribution
        };
        assert!(evaluate_with_bucket(3_600) > evaluate_with_bucket(70_858_800));
    }
}
