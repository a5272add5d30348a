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

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::error::{IndexErrorKind, IndexResult};
use crate::{AliasAction, SearchIndex};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Elasticsearch-compatible implementation of [`SearchIndex`].
pub struct ElasticScoreIndex {
    base_url: Url,
    client: Client,
}

impl ElasticScoreIndex {
    pub fn new(endpoint: &str) -> anyhow::Result<Self> {
        let base_url = Url::parse(endpoint)?;
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { base_url, client })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        {
            let mut path_segments = url
                .path_segments_mut()
                .expect("index endpoint is a base url");
            path_segments.pop_if_empty();
            for segment in segments {
                path_segments.push(segment);
            }
        }
        url
    }

    fn check_status(response: Response) -> IndexResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let kind = match status {
            StatusCode::NOT_FOUND => IndexErrorKind::NotFound,
            StatusCode::TOO_MANY_REQUESTS => IndexErrorKind::Transient,
            status if status.is_server_error() => IndexErrorKind::Transient,
            _ => IndexErrorKind::Fatal,
        };
        Err(kind.with_error(anyhow::anyhow!(
            "search index returned {status} for {}",
            response.url()
        )))
    }
}

#[derive(Deserialize)]
struct CatIndexRow {
    index: String,
}

#[derive(Deserialize)]
struct CountResponse {
    count: u64,
}

#[async_trait]
impl SearchIndex for ElasticScoreIndex {
    async fn list_indices(&self, pattern: &str) -> IndexResult<Vec<String>> {
        let response = self
            .client
            .get(self.url(&["_cat", "indices", pattern]))
            .query(&[("format", "json")])
            .send()
            .await?;
        let rows: Vec<CatIndexRow> = match Self::check_status(response) {
            Ok(response) => response.json().await?,
            Err(error) if error.is_not_found() => Vec::new(),
            Err(error) => return Err(error),
        };
        Ok(rows.into_iter().map(|row| row.index).collect())
    }

    async fn list_aliases(&self) -> IndexResult<BTreeMap<String, Vec<String>>> {
        let response = self.client.get(self.url(&["_alias"])).send().await?;
        let body: JsonValue = Self::check_status(response)?.json().await?;
        // Response shape: { "<index>": { "aliases": { "<alias>": {} } } }.
        let mut aliases: BTreeMap<String, Vec<String>> = BTreeMap::new();
        if let Some(indices) = body.as_object() {
            for (index_name, index_body) in indices {
                let Some(index_aliases) =
                    index_body.get("aliases").and_then(JsonValue::as_object)
                else {
                    continue;
                };
                for alias_name in index_aliases.keys() {
                    aliases
                        .entry(alias_name.clone())
                        .or_default()
                        .push(index_name.clone());
                }
            }
        }
        Ok(aliases)
    }

    async fn create_index(&self, name: &str, schema: &JsonValue) -> IndexResult<()> {
        debug!(index = %name, "creating index");
        let response = self
            .client
            .put(self.url(&[name]))
            .json(schema)
            .send()
            .await?;
        Self::check_status(response)?;
        Ok(())
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> IndexResult<()> {
        let action_bodies: Vec<JsonValue> = actions
            .iter()
            .map(|action| match action {
                AliasAction::Add { index, alias } => {
                    json!({"add": {"index": index, "alias": alias}})
                }
                AliasAction::Remove { index, alias } => {
                    json!({"remove": {"index": index, "alias": alias}})
                }
            })
            .collect();
        let response = self
            .client
            .post(self.url(&["_aliases"]))
            .json(&json!({ "actions": action_bodies }))
            .send()
            .await?;
        Self::check_status(response)?;
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> IndexResult<()> {
        debug!(index = %name, "deleting index");
        let response = self.client.delete(self.url(&[name])).send().await?;
        Self::check_status(response)?;
        Ok(())
    }

    async fn index_doc(&self, index: &str, doc_id: &str, doc: &JsonValue) -> IndexResult<()> {
        let response = self
            .client
            .put(self.url(&[index, "_doc", doc_id]))
            .json(doc)
            .send()
            .await?;
        Self::check_status(response)?;
        Ok(())
    }

    async fn count_docs(&self, index: &str) -> IndexResult<u64> {
        let response = self
            .client
            .get(self.url(&[index, "_count"]))
            .send()
            .await?;
        let count: CountResponse = Self::check_status(response)?.json().await?;
        Ok(count.count)
    }

    async fn is_up(&self) -> bool {
        let health_url = self.url(&["_cluster", "health"]);
        match self.client.get(health_url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building_keeps_base_path() {
        let index = ElasticScoreIndex::new("http://localhost:9200").unwrap();
        let url = index.url(&["scores-17", "_doc", "@types/node"]);
        // The slash must not split the path; `@` is a legal segment char.
        assert_eq!(
            url.as_str(),
            "http://localhost:9200/scores-17/_doc/@types%2Fnode"
        );
    }
}
