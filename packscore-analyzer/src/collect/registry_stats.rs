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

//! Registry statistics collector: download counts, dependents, stars.

use chrono::{Duration, Utc};
use packscore_common::AnalyzerResult;
use packscore_docstore::{DocumentStore, ViewParams};
use packscore_registry::{DailyDownloads, PackageRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use super::metadata::CountRange;
use crate::manifest::Manifest;
use crate::{docstore_error, registry_error};

/// Download-count windows, in days.
pub const DOWNLOAD_RANGES_DAYS: [i64; 6] = [1, 7, 30, 90, 180, 365];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryStats {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub downloads: Vec<CountRange>,
    pub dependents_count: u64,
    pub stars_count: u64,
    pub releases_count: u64,
}

pub async fn collect(
    registry: &dyn PackageRegistry,
    docstore: &dyn DocumentStore,
    package_data: &JsonValue,
    manifest: &Manifest,
) -> AnalyzerResult<RegistryStats> {
    let today = Utc::now().date_naive();
    let one_year_ago = today - Duration::days(365);
    let daily_downloads = registry
        .fetch_daily_downloads(&manifest.name, one_year_ago, today)
        .await
        .map_err(registry_error)?;
    let dependents_count = dependents_count(docstore, &manifest.name).await?;
    Ok(RegistryStats {
        downloads: download_ranges(&daily_downloads, Utc::now()),
        dependents_count,
        stars_count: stars_count(package_data),
        releases_count: releases_count(package_data),
    })
}

/// Buckets the daily series into the fixed windows; every window produces
/// exactly one range.
pub fn download_ranges(
    daily_downloads: &[DailyDownloads],
    now: chrono::DateTime<Utc>,
) -> Vec<CountRange> {
    DOWNLOAD_RANGES_DAYS
        .iter()
        .map(|&days| {
            let from = now - Duration::days(days);
            let from_day = from.date_naive();
            let count = daily_downloads
                .iter()
                .filter(|daily| daily.day >= from_day)
                .map(|daily| daily.downloads)
                .sum();
            CountRange {
                from,
                to: now,
                count,
            }
        })
        .collect()
}

/// Dependents are counted through the `dependents` view, which emits one row
/// per (dependency, dependent) edge.
async fn dependents_count(docstore: &dyn DocumentStore, name: &str) -> AnalyzerResult<u64> {
    let response = docstore
        .query_view(
            "packscore",
            "dependents",
            ViewParams {
                start_key: Some(json!(name)),
                end_key: Some(json!(name)),
                ..Default::default()
            },
        )
        .await
        .map_err(docstore_error)?;
    Ok(response.rows.len() as u64)
}

/// The registry records stars as the `users` map on the package document.
fn stars_count(package_data: &JsonValue) -> u64 {
    package_data
        .get("users")
        .and_then(JsonValue::as_object)
        .map(|users| users.len() as u64)
        .unwrap_or(0)
}

fn releases_count(package_data: &JsonValue) -> u64 {
    package_data
        .get("versions")
        .and_then(JsonValue::as_object)
        .map(|versions| versions.len() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_ranges_cover_every_window_exactly() {
        let now = Utc::now();
        let today = now.date_naive();
        let daily_downloads = vec![
            DailyDownloads {
                day: today,
                downloads: 10,
            },
            DailyDownloads {
                day: today - Duration::days(5),
                downloads: 100,
            },
            DailyDownloads {
                day: today - Duration::days(200),
                downloads: 1_000,
            },
        ];
        let ranges = download_ranges(&daily_downloads, now);
        let window_days: Vec<i64> = ranges
            .iter()
            .map(|range| (range.to - range.from).num_days())
            .collect();
        assert_eq!(window_days, DOWNLOAD_RANGES_DAYS.to_vec());
        let counts: Vec<u64> = ranges.iter().map(|range| range.count).collect();
        assert_eq!(counts, vec![10, 110, 110, 110, 110, 1_110]);
    }

    #[test]
    fn test_stars_and_releases_from_package_data() {
        let package_data = serde_json::json!({
            "users": {"alice": true, "bob": true},
            "versions": {"1.0.0": {}, "1.1.0": {}, "2.0.0": {}}
        });
        assert_eq!(stars_count(&package_data), 2);
        assert_eq!(releases_count(&package_data), 3);
        assert_eq!(stars_count(&serde_json::json!({})), 0);
    }

    #[tokio::test]
    async fn test_dependents_counted_through_view() -> anyhow::Result<()> {
        use packscore_docstore::{Document, MemDocstore};
        let docstore = MemDocstore::default();
        docstore.register_view("packscore", "dependents", |doc| {
            doc.value["dependencies"]
                .as_object()
                .map(|dependencies| {
                    dependencies
                        .keys()
                        .map(|dependency| (json!(dependency), json!(null)))
                        .collect()
                })
                .unwrap_or_default()
        });
        docstore
            .put(&Document::new(
                "analysis!app-one",
                json!({"dependencies": {"pkg-a": "^1.0.0"}}),
            ))
            .await?;
        docstore
            .put(&Document::new(
                "analysis!app-two",
                json!({"dependencies": {"pkg-a": "^1.2.0", "pkg-b": "*"}}),
            ))
            .await?;
        assert_eq!(dependents_count(&docstore, "pkg-a").await.unwrap(), 2);
        assert_eq!(dependents_count(&docstore, "pkg-b").await.unwrap(), 1);
        assert_eq!(dependents_count(&docstore, "pkg-c").await.unwrap(), 0);
        Ok(())
    }

    #[test]
    fn test_empty_series_has_all_windows_at_zero() {
        let ranges = download_ranges(&[], Utc::now());
        assert_eq!(ranges.len(), DOWNLOAD_RANGES_DAYS.len());
        assert!(ranges.iter().all(|range| range.count == 0));
    }
}
