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

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::error::{RegistryErrorKind, RegistryResult};
use crate::{Change, ChangeBatch, DailyDownloads, PackageRegistry};

/// Long-poll window handed to the registry; the observer re-polls on empty
/// batches.
const CHANGES_LONGPOLL_TIMEOUT_MS: u64 = 30_000;

/// CouchDB-replicate-protocol implementation of [`PackageRegistry`].
pub struct HttpRegistry {
    registry_url: Url,
    downloads_url: Url,
    client: Client,
    longpoll_client: Client,
}

impl HttpRegistry {
    pub fn new(endpoint: &str, downloads_endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let registry_url = Url::parse(endpoint)?;
        let downloads_url = Url::parse(downloads_endpoint)?;
        let client = Client::builder().timeout(timeout).build()?;
        // The changes long-poll deliberately outlives the regular timeout.
        let longpoll_client = Client::builder()
            .timeout(Duration::from_millis(CHANGES_LONGPOLL_TIMEOUT_MS) + timeout)
            .build()?;
        Ok(Self {
            registry_url,
            downloads_url,
            client,
            longpoll_client,
        })
    }

    fn registry_path(&self, segments: &[&str]) -> Url {
        let mut url = self.registry_url.clone();
        {
            let mut path_segments = url.path_segments_mut().expect("endpoint is a base url");
            path_segments.pop_if_empty();
            for segment in segments {
                path_segments.push(segment);
            }
        }
        url
    }

    fn check_status(response: Response) -> RegistryResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let kind = match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => RegistryErrorKind::NotFound,
            StatusCode::TOO_MANY_REQUESTS => RegistryErrorKind::Transient,
            status if status.is_server_error() => RegistryErrorKind::Transient,
            _ => RegistryErrorKind::Fatal,
        };
        Err(kind.with_error(anyhow::anyhow!(
            "registry returned {status} for {}",
            response.url()
        )))
    }
}

#[derive(Deserialize)]
struct AllDocsRow {
    doc: Option<JsonValue>,
}

#[derive(Deserialize)]
struct AllDocsResponse {
    rows: Vec<AllDocsRow>,
}

#[derive(Deserialize)]
struct AllDocsKeyRow {
    id: String,
}

#[derive(Deserialize)]
struct AllDocsKeysResponse {
    rows: Vec<AllDocsKeyRow>,
}

#[derive(Deserialize)]
struct DownloadsResponse {
    #[serde(default)]
    downloads: Vec<DailyDownloads>,
}

#[derive(Deserialize)]
struct DbInfo {
    update_seq: u64,
}

#[derive(Deserialize)]
struct ChangesResponse {
    results: Vec<Change>,
    last_seq: u64,
}

#[async_trait]
impl PackageRegistry for HttpRegistry {
    async fn fetch_package(&self, name: &str) -> RegistryResult<JsonValue> {
        let response = self
            .client
            .get(self.registry_path(&[name]))
            .send()
            .await?;
        let package_data = Self::check_status(response)?.json().await?;
        Ok(package_data)
    }

    async fn bulk_fetch_packages(
        &self,
        names: &[String],
    ) -> RegistryResult<Vec<Option<JsonValue>>> {
        let response = self
            .client
            .post(self.registry_path(&["_all_docs"]))
            .query(&[("include_docs", "true")])
            .json(&json!({ "keys": names }))
            .send()
            .await?;
        let body: AllDocsResponse = Self::check_status(response)?.json().await?;
        Ok(body.rows.into_iter().map(|row| row.doc).collect())
    }

    async fn list_packages(
        &self,
        start_after: &str,
        limit: usize,
    ) -> RegistryResult<Vec<String>> {
        let start_key_json = serde_json::to_string(start_after)
            .expect("a string key is always serializable");
        let skip = usize::from(!start_after.is_empty());
        let response = self
            .client
            .get(self.registry_path(&["_all_docs"]))
            .query(&[
                ("startkey", start_key_json),
                ("limit", limit.to_string()),
                ("skip", skip.to_string()),
            ])
            .send()
            .await?;
        let body: AllDocsKeysResponse = Self::check_status(response)?.json().await?;
        Ok(body
            .rows
            .into_iter()
            .map(|row| row.id)
            .filter(|id| !id.starts_with('_'))
            .collect())
    }

    async fn fetch_daily_downloads(
        &self,
        name: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> RegistryResult<Vec<DailyDownloads>> {
        let range = format!("{start}:{end}");
        let mut url = self.downloads_url.clone();
        {
            let mut path_segments = url.path_segments_mut().expect("endpoint is a base url");
            path_segments
                .pop_if_empty()
                .push("downloads")
                .push("range")
                .push(&range);
            // Scoped names keep their `/` in the downloads API path.
            for name_segment in name.split('/') {
                path_segments.push(name_segment);
            }
        }
        let response = self.client.get(url).send().await?;
        let body: DownloadsResponse = match Self::check_status(response) {
            Ok(response) => response.json().await?,
            // No downloads recorded yet reads as an empty series.
            Err(error) if error.is_not_found() => DownloadsResponse { downloads: Vec::new() },
            Err(error) => return Err(error),
        };
        Ok(body.downloads)
    }

    async fn last_seq(&self) -> RegistryResult<u64> {
        let response = self.client.get(self.registry_url.clone()).send().await?;
        let info: DbInfo = Self::check_status(response)?.json().await?;
        Ok(info.update_seq)
    }

    async fn changes(&self, since: u64, limit: usize) -> RegistryResult<ChangeBatch> {
        let response = self
            .longpoll_client
            .get(self.registry_path(&["_changes"]))
            .query(&[
                ("feed", "longpoll".to_string()),
                ("since", since.to_string()),
                ("limit", limit.to_string()),
                ("timeout", CHANGES_LONGPOLL_TIMEOUT_MS.to_string()),
            ])
            .send()
            .await?;
        let body: ChangesResponse = Self::check_status(response)?.json().await?;
        Ok(ChangeBatch {
            changes: body.results,
            last_seq: body.last_seq,
        })
    }

    async fn is_up(&self) -> bool {
        match self.client.get(self.registry_url.clone()).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
