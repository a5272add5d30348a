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

//! Source-host collector: repository info, contributors, commit activity,
//! issue statistics.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::stream::{FuturesUnordered, TryStreamExt};
use packscore_common::{AnalyzerErrorKind, AnalyzerResult};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use super::metadata::CountRange;
use super::token_dealer::TokenDealer;
use crate::manifest::Manifest;

/// Commit-count windows, in days.
pub const COMMIT_RANGES_DAYS: [i64; 5] = [7, 30, 90, 180, 365];

/// Issue open-time buckets: 1 hour times powers of 3, ten buckets deep.
pub const ISSUE_DISTRIBUTION_RANGES_SECS: [u64; 10] = [
    3_600, 10_800, 32_400, 97_200, 291_600, 874_800, 2_624_400, 7_873_200, 23_619_600, 70_858_800,
];

/// Stats endpoints answer 202 while the source host computes them.
const STATS_NOT_READY_MAX_ATTEMPTS: usize = 5;
const STATS_NOT_READY_DELAY: StdDuration =
    StdDuration::from_millis(if cfg!(test) { 1 } else { 2_000 });

/// Pages of issues fetched, each of 100 rows, all in flight at once.
const ISSUE_PAGES: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contributor {
    pub username: String,
    pub commits_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssuesInfo {
    pub count: u64,
    pub open_count: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub distribution: BTreeMap<u64, u64>,
    #[serde(default, skip_serializing_if = "packscore_common::is_false")]
    pub is_disabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceHostInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    pub stars_count: u64,
    pub forks_count: u64,
    pub subscribers_count: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contributors: Vec<Contributor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commits: Vec<CountRange>,
    #[serde(default)]
    pub issues: IssuesInfo,
}

/// GitHub-style API client behind the token dealer.
pub struct GithubClient {
    client: reqwest::Client,
    api_base: String,
    token_dealer: Arc<TokenDealer>,
}

impl GithubClient {
    pub fn new(tokens: Vec<String>, wait_for_rate_limit_reset: bool) -> anyhow::Result<Self> {
        Self::with_api_base("https://api.github.com", tokens, wait_for_rate_limit_reset)
    }

    pub fn with_api_base(
        api_base: &str,
        tokens: Vec<String>,
        wait_for_rate_limit_reset: bool,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(30))
            .user_agent("packscore")
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token_dealer: Arc::new(TokenDealer::new(tokens, wait_for_rate_limit_reset)),
        })
    }

    pub async fn collect(&self, manifest: &Manifest) -> AnalyzerResult<Option<SourceHostInfo>> {
        let Some((owner, repo)) = manifest.source_host_slug() else {
            return Ok(None);
        };
        let repo_path = format!("repos/{owner}/{repo}");
        let contributors_path = format!("{repo_path}/contributors?per_page=100");
        let commit_activity_path = format!("{repo_path}/stats/commit_activity");
        let (repo_info, contributors, commit_activity, issue_pages) = tokio::join!(
            self.get_json(&repo_path),
            self.get_json(&contributors_path),
            self.get_json(&commit_activity_path),
            self.fetch_issue_pages(&repo_path),
        );
        // The repository itself being gone (or blocked) voids the whole
        // sub-record.
        let Some(repo_info) = repo_info? else {
            debug!(name = %manifest.name, owner = %owner, repo = %repo, "repository unavailable");
            return Ok(None);
        };
        let is_disabled = !repo_info
            .get("has_issues")
            .and_then(JsonValue::as_bool)
            .unwrap_or(true);
        let issues = issues_info(&issue_pages?, is_disabled, Utc::now());
        Ok(Some(SourceHostInfo {
            homepage: repo_info
                .get("homepage")
                .and_then(JsonValue::as_str)
                .filter(|homepage| !homepage.is_empty())
                .map(str::to_string),
            stars_count: u64_field(&repo_info, "stargazers_count"),
            forks_count: u64_field(&repo_info, "forks_count"),
            subscribers_count: u64_field(&repo_info, "subscribers_count"),
            contributors: parse_contributors(contributors?),
            commits: commit_ranges(&parse_commit_activity(commit_activity?), Utc::now()),
            issues,
        }))
    }

    async fn fetch_issue_pages(&self, repo_path: &str) -> AnalyzerResult<Vec<JsonValue>> {
        let page_paths: Vec<String> = (1..=ISSUE_PAGES)
            .map(|page| format!("{repo_path}/issues?state=all&per_page=100&page={page}"))
            .collect();
        let page_fetches: FuturesUnordered<_> = page_paths
            .iter()
            .map(|page_path| self.get_json(page_path))
            .collect();
        let pages: Vec<Option<JsonValue>> = page_fetches.try_collect().await?;
        let issues = pages
            .into_iter()
            .flatten()
            .filter_map(|page| match page {
                JsonValue::Array(rows) => Some(rows),
                _ => None,
            })
            .flatten()
            .collect();
        Ok(issues)
    }

    /// One GET against the API with token rotation, 202 retries, and the
    /// unavailability mapping: {400, 403, 404, 451} read as "resource gone"
    /// and yield `None`.
    async fn get_json(&self, path: &str) -> AnalyzerResult<Option<JsonValue>> {
        let url = format!("{}/{path}", self.api_base);
        let mut not_ready_attempts = 0;
        loop {
            let token = self.token_dealer.deal().await?;
            let mut request = self.client.get(&url);
            if let Some(token) = &token {
                request = request.bearer_auth(token);
            }
            let response = request.send().await.map_err(|transport_error| {
                AnalyzerErrorKind::Transient
                    .with_error(anyhow::Error::from(transport_error).context("source host request"))
            })?;
            let status = response.status();
            match status {
                StatusCode::ACCEPTED => {
                    // Stats are being computed server-side.
                    not_ready_attempts += 1;
                    if not_ready_attempts >= STATS_NOT_READY_MAX_ATTEMPTS {
                        return Ok(None);
                    }
                    tokio::time::sleep(STATS_NOT_READY_DELAY).await;
                }
                status if status.is_success() => {
                    let body = response.json().await.map_err(|body_error| {
                        AnalyzerErrorKind::Transient.with_error(anyhow::Error::from(body_error))
                    })?;
                    return Ok(Some(body));
                }
                StatusCode::FORBIDDEN if is_rate_limited(response.headers()) => {
                    if let Some(token) = token {
                        let reset_at = rate_limit_reset(response.headers())
                            .unwrap_or_else(|| Utc::now() + Duration::minutes(1));
                        self.token_dealer.exhaust(&token, reset_at);
                        continue;
                    }
                    return Err(AnalyzerErrorKind::Transient.with_error(anyhow::anyhow!(
                        "anonymous rate limit exhausted on {url}"
                    )));
                }
                StatusCode::BAD_REQUEST
                | StatusCode::FORBIDDEN
                | StatusCode::NOT_FOUND
                | StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS => {
                    return Ok(None);
                }
                _ => {
                    return Err(AnalyzerErrorKind::Transient.with_error(anyhow::anyhow!(
                        "source host returned {status} for {url}"
                    )));
                }
            }
        }
    }
}

fn is_rate_limited(headers: &HeaderMap) -> bool {
    headers
        .get("x-ratelimit-remaining")
        .and_then(|value| value.to_str().ok())
        .map(|remaining| remaining == "0")
        .unwrap_or(false)
}

fn rate_limit_reset(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let reset_epoch: i64 = headers
        .get("x-ratelimit-reset")
        .and_then(|value| value.to_str().ok())?
        .parse()
        .ok()?;
    Utc.timestamp_opt(reset_epoch, 0).single()
}

fn u64_field(value: &JsonValue, field: &str) -> u64 {
    value.get(field).and_then(JsonValue::as_u64).unwrap_or(0)
}

fn parse_contributors(contributors: Option<JsonValue>) -> Vec<Contributor> {
    let Some(JsonValue::Array(rows)) = contributors else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            Some(Contributor {
                username: row.get("login")?.as_str()?.to_string(),
                commits_count: u64_field(row, "contributions"),
            })
        })
        .collect()
}

/// `(week_start_epoch_secs, commit_count)` pairs from the commit-activity
/// stats payload.
fn parse_commit_activity(commit_activity: Option<JsonValue>) -> Vec<(i64, u64)> {
    let Some(JsonValue::Array(weeks)) = commit_activity else {
        return Vec::new();
    };
    weeks
        .iter()
        .filter_map(|week| {
            Some((
                week.get("week")?.as_i64()?,
                week.get("total")?.as_u64()?,
            ))
        })
        .collect()
}

/// Buckets weekly commit totals into the fixed windows. A week counts toward
/// a window when any part of it overlaps.
pub fn commit_ranges(weekly_commits: &[(i64, u64)], now: DateTime<Utc>) -> Vec<CountRange> {
    COMMIT_RANGES_DAYS
        .iter()
        .map(|&days| {
            let from = now - Duration::days(days);
            let count = weekly_commits
                .iter()
                .filter(|(week_start_epoch, _)| {
                    let week_end =
                        Utc.timestamp_opt(*week_start_epoch, 0).single().map(|week_start| {
                            week_start + Duration::days(7)
                        });
                    week_end.map(|week_end| week_end >= from).unwrap_or(false)
                })
                .map(|(_, commit_count)| commit_count)
                .sum();
            CountRange {
                from,
                to: now,
                count,
            }
        })
        .collect()
}

/// Issue statistics over the fetched sample; pull requests are not issues.
pub fn issues_info(issues: &[JsonValue], is_disabled: bool, now: DateTime<Utc>) -> IssuesInfo {
    let mut count = 0u64;
    let mut open_count = 0u64;
    let mut distribution: BTreeMap<u64, u64> = BTreeMap::new();
    for issue in issues {
        if issue.get("pull_request").is_some() {
            continue;
        }
        count += 1;
        let is_open = issue
            .get("state")
            .and_then(JsonValue::as_str)
            .map(|state| state == "open")
            .unwrap_or(false);
        if is_open {
            open_count += 1;
        }
        let Some(created_at) = issue
            .get("created_at")
            .and_then(JsonValue::as_str)
            .and_then(|date| DateTime::parse_from_rfc3339(date).ok())
        else {
            continue;
        };
        let closed_at = issue
            .get("closed_at")
            .and_then(JsonValue::as_str)
            .and_then(|date| DateTime::parse_from_rfc3339(date).ok())
            .map(|date| date.with_timezone(&Utc))
            .unwrap_or(now);
        let open_secs = (closed_at - created_at.with_timezone(&Utc))
            .num_seconds()
            .max(0) as u64;
        let bucket = ISSUE_DISTRIBUTION_RANGES_SECS
            .iter()
            .find(|&&range_secs| open_secs <= range_secs)
            .copied()
            .unwrap_or(*ISSUE_DISTRIBUTION_RANGES_SECS.last().unwrap());
        *distribution.entry(bucket).or_insert(0) += 1;
    }
    IssuesInfo {
        count,
        open_count,
        distribution,
        is_disabled,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_commit_ranges_cover_every_window_exactly() {
        let now = Utc::now();
        let weekly_commits = vec![
            ((now - Duration::days(3)).timestamp(), 5),
            ((now - Duration::days(50)).timestamp(), 7),
            ((now - Duration::days(300)).timestamp(), 11),
        ];
        let ranges = commit_ranges(&weekly_commits, now);
        let window_days: Vec<i64> = ranges
            .iter()
            .map(|range| (range.to - range.from).num_days())
            .collect();
        assert_eq!(window_days, COMMIT_RANGES_DAYS.to_vec());
        let counts: Vec<u64> = ranges.iter().map(|range| range.count).collect();
        assert_eq!(counts, vec![5, 5, 12, 12, 23]);
    }

    #[test]
    fn test_issues_info_excludes_pull_requests() {
        let now = Utc::now();
        let issues = vec![
            json!({
                "state": "open",
                "created_at": (now - Duration::hours(2)).to_rfc3339(),
            }),
            json!({
                "state": "closed",
                "created_at": (now - Duration::hours(10)).to_rfc3339(),
                "closed_at": (now - Duration::hours(9)).to_rfc3339(),
            }),
            json!({
                "state": "open",
                "created_at": now.to_rfc3339(),
                "pull_request": {"url": "https://api.github.com/..."},
            }),
        ];
        let info = issues_info(&issues, false, now);
        assert_eq!(info.count, 2);
        assert_eq!(info.open_count, 1);
        // 2h open lands in the 3h bucket, 1h-to-close lands in the 1h bucket.
        assert_eq!(info.distribution.get(&10_800), Some(&1));
        assert_eq!(info.distribution.get(&3_600), Some(&1));
    }

    #[test]
    fn test_rate_limit_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", "0".parse().unwrap());
        headers.insert("x-ratelimit-reset", "1700000000".parse().unwrap());
        assert!(is_rate_limited(&headers));
        assert_eq!(
            rate_limit_reset(&headers),
            Utc.timestamp_opt(1_700_000_000, 0).single()
        );
        headers.insert("x-ratelimit-remaining", "42".parse().unwrap());
        assert!(!is_rate_limited(&headers));
    }
}
