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

//! Upstream registry adapter: package documents, download counts, and the
//! change feed the realtime observer follows.

mod error;
mod http;
#[cfg(any(test, feature = "testsuite"))]
mod mem;

use async_trait::async_trait;
use chrono::NaiveDate;
pub use error::{RegistryError, RegistryErrorKind, RegistryResult};
pub use http::HttpRegistry;
#[cfg(any(test, feature = "testsuite"))]
pub use mem::MemRegistry;
use serde::Deserialize;
use serde_json::Value as JsonValue;

/// One row of the registry change feed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Change {
    pub id: String,
    pub seq: u64,
    #[serde(default)]
    pub deleted: bool,
}

/// A page of changes plus the sequence to resume from.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub changes: Vec<Change>,
    pub last_seq: u64,
}

/// Daily download count for one package.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DailyDownloads {
    pub day: NaiveDate,
    pub downloads: u64,
}

#[async_trait]
pub trait PackageRegistry: Send + Sync + 'static {
    /// Fetches the raw package document. A package that was never published
    /// or was unpublished is a typed [`RegistryErrorKind::NotFound`].
    async fn fetch_package(&self, name: &str) -> RegistryResult<JsonValue>;

    /// Multi-get of package documents, positionally aligned with `names`.
    async fn bulk_fetch_packages(&self, names: &[String])
        -> RegistryResult<Vec<Option<JsonValue>>>;

    /// One page of package names, key-ordered, strictly after `start_after`
    /// (empty string starts from the beginning). Design documents are not
    /// packages and are filtered out.
    async fn list_packages(&self, start_after: &str, limit: usize)
        -> RegistryResult<Vec<String>>;

    /// Daily download counts over `[start, end]`, oldest first.
    async fn fetch_daily_downloads(
        &self,
        name: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> RegistryResult<Vec<DailyDownloads>>;

    /// The registry tip, for `--default-seq now`.
    async fn last_seq(&self) -> RegistryResult<u64>;

    /// One long-poll round of the change feed, resuming from `since`.
    /// Returns an empty batch when the feed is idle.
    async fn changes(&self, since: u64, limit: usize) -> RegistryResult<ChangeBatch>;

    /// Readiness probe.
    async fn is_up(&self) -> bool;
}
