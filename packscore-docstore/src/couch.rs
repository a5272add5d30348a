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
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::error::{DocstoreError, DocstoreErrorKind, DocstoreResult};
use crate::{BulkRow, Document, DocumentStore, RangeQuery, ViewParams, ViewResponse, ViewRow};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// CouchDB-compatible implementation of [`DocumentStore`].
pub struct CouchDocstore {
    db_url: Url,
    client: Client,
}

impl CouchDocstore {
    pub fn new(endpoint: &str, database: &str) -> anyhow::Result<Self> {
        let base_url = Url::parse(endpoint)?;
        let mut db_url = base_url.clone();
        db_url
            .path_segments_mut()
            .map_err(|()| anyhow::anyhow!("cannot-be-a-base endpoint `{endpoint}`"))?
            .pop_if_empty()
            .push(database);
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { db_url, client })
    }

    /// Percent-encodes the document key into a single path segment. Keys can
    /// carry `/` (scoped package names), which must not split the path.
    fn doc_url(&self, key: &str) -> Url {
        let mut url = self.db_url.clone();
        url.path_segments_mut()
            .expect("db url is a base url")
            .push(key);
        url
    }

    fn db_path_url(&self, suffix: &str) -> Url {
        let mut url = self.db_url.clone();
        url.path_segments_mut()
            .expect("db url is a base url")
            .push(suffix);
        url
    }

    fn check_status(response: Response) -> DocstoreResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let kind = match status {
            StatusCode::NOT_FOUND => DocstoreErrorKind::NotFound,
            StatusCode::CONFLICT => DocstoreErrorKind::Conflict,
            StatusCode::TOO_MANY_REQUESTS => DocstoreErrorKind::Transient,
            status if status.is_server_error() => DocstoreErrorKind::Transient,
            _ => DocstoreErrorKind::Fatal,
        };
        Err(kind.with_error(anyhow::anyhow!(
            "document store returned {status} for {}",
            response.url()
        )))
    }

    fn document_from_body(mut body: JsonValue) -> Document {
        let id = body
            .get("_id")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        let rev = body
            .get("_rev")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        if let Some(object) = body.as_object_mut() {
            object.remove("_id");
            object.remove("_rev");
        }
        Document {
            id,
            rev,
            value: body,
        }
    }

    fn body_from_document(doc: &Document) -> JsonValue {
        let mut body = doc.value.clone();
        if let Some(object) = body.as_object_mut() {
            object.insert("_id".to_string(), json!(doc.id));
            if let Some(rev) = &doc.rev {
                object.insert("_rev".to_string(), json!(rev));
            }
        }
        body
    }
}

#[derive(Deserialize)]
struct WriteResponse {
    rev: String,
}

#[derive(Deserialize)]
struct BulkWriteRow {
    id: String,
    rev: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct AllDocsRow {
    doc: Option<JsonValue>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct AllDocsResponse {
    rows: Vec<AllDocsRow>,
}

#[derive(Deserialize)]
struct RawViewRow {
    id: Option<String>,
    key: JsonValue,
    value: JsonValue,
    doc: Option<JsonValue>,
}

#[derive(Deserialize)]
struct RawViewResponse {
    rows: Vec<RawViewRow>,
}

#[derive(Deserialize)]
struct DbInfo {
    compact_running: bool,
}

#[async_trait]
impl DocumentStore for CouchDocstore {
    async fn get(&self, key: &str) -> DocstoreResult<Document> {
        let response = self.client.get(self.doc_url(key)).send().await?;
        let body: JsonValue = Self::check_status(response)?.json().await?;
        Ok(Self::document_from_body(body))
    }

    async fn put(&self, doc: &Document) -> DocstoreResult<String> {
        let response = self
            .client
            .put(self.doc_url(&doc.id))
            .json(&Self::body_from_document(doc))
            .send()
            .await?;
        let write: WriteResponse = Self::check_status(response)?.json().await?;
        Ok(write.rev)
    }

    async fn delete(&self, key: &str, rev: &str) -> DocstoreResult<()> {
        let response = self
            .client
            .delete(self.doc_url(key))
            .query(&[("rev", rev)])
            .send()
            .await?;
        Self::check_status(response)?;
        Ok(())
    }

    async fn bulk_get(&self, keys: &[String]) -> DocstoreResult<Vec<Option<Document>>> {
        let response = self
            .client
            .post(self.db_path_url("_all_docs"))
            .query(&[("include_docs", "true")])
            .json(&json!({ "keys": keys }))
            .send()
            .await?;
        let body: AllDocsResponse = Self::check_status(response)?.json().await?;
        let docs = body
            .rows
            .into_iter()
            .map(|row| {
                if row.error.is_some() {
                    return None;
                }
                row.doc.map(Self::document_from_body)
            })
            .collect();
        Ok(docs)
    }

    async fn bulk_put(&self, docs: &[Document]) -> DocstoreResult<Vec<BulkRow>> {
        let bodies: Vec<JsonValue> = docs.iter().map(Self::body_from_document).collect();
        let response = self
            .client
            .post(self.db_path_url("_bulk_docs"))
            .json(&json!({ "docs": bodies }))
            .send()
            .await?;
        let rows: Vec<BulkWriteRow> = Self::check_status(response)?.json().await?;
        debug!(num_rows = rows.len(), "bulk write");
        let bulk_rows = rows
            .into_iter()
            .map(|row| BulkRow {
                id: row.id,
                rev: if row.error.is_some() { None } else { row.rev },
            })
            .collect();
        Ok(bulk_rows)
    }

    async fn list_range(&self, query: RangeQuery) -> DocstoreResult<Vec<Document>> {
        let start_key_json = serde_json::to_string(&query.start_key)
            .expect("a string key is always serializable");
        let end_key_json =
            serde_json::to_string(&query.end_key).expect("a string key is always serializable");
        let skip = usize::from(query.skip_first);
        let response = self
            .client
            .get(self.db_path_url("_all_docs"))
            .query(&[
                ("include_docs", "true".to_string()),
                ("startkey", start_key_json),
                ("endkey", end_key_json),
                ("limit", query.limit.to_string()),
                ("skip", skip.to_string()),
            ])
            .send()
            .await?;
        let body: AllDocsResponse = Self::check_status(response)?.json().await?;
        let docs = body
            .rows
            .into_iter()
            .filter_map(|row| row.doc.map(Self::document_from_body))
            .collect();
        Ok(docs)
    }

    async fn query_view(
        &self,
        design: &str,
        view: &str,
        params: ViewParams,
    ) -> DocstoreResult<ViewResponse> {
        let mut url = self.db_url.clone();
        url.path_segments_mut()
            .expect("db url is a base url")
            .push("_design")
            .push(design)
            .push("_view")
            .push(view);
        let mut query_params: Vec<(&str, String)> = Vec::new();
        if let Some(start_key) = &params.start_key {
            query_params.push(("startkey", start_key.to_string()));
        }
        if let Some(end_key) = &params.end_key {
            query_params.push(("endkey", end_key.to_string()));
        }
        if let Some(limit) = params.limit {
            query_params.push(("limit", limit.to_string()));
        }
        if let Some(skip) = params.skip {
            query_params.push(("skip", skip.to_string()));
        }
        if params.include_docs {
            query_params.push(("include_docs", "true".to_string()));
        }
        let response = self.client.get(url).query(&query_params).send().await?;
        let body: RawViewResponse = Self::check_status(response)?.json().await?;
        let rows = body
            .rows
            .into_iter()
            .map(|row| ViewRow {
                id: row.id.unwrap_or_default(),
                key: row.key,
                value: row.value,
                doc: row.doc.map(Self::document_from_body),
            })
            .collect();
        Ok(ViewResponse { rows })
    }

    async fn compact(&self) -> DocstoreResult<()> {
        let response = self
            .client
            .post(self.db_path_url("_compact"))
            .header("content-type", "application/json")
            .send()
            .await?;
        Self::check_status(response)?;
        Ok(())
    }

    async fn view_cleanup(&self) -> DocstoreResult<()> {
        let response = self
            .client
            .post(self.db_path_url("_view_cleanup"))
            .header("content-type", "application/json")
            .send()
            .await?;
        Self::check_status(response)?;
        Ok(())
    }

    async fn compaction_running(&self) -> DocstoreResult<bool> {
        let response = self.client.get(self.db_url.clone()).send().await?;
        let info: DbInfo = Self::check_status(response)?.json().await?;
        Ok(info.compact_running)
    }

    async fn is_up(&self) -> bool {
        match self.client.get(self.db_url.clone()).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_doc_url_encodes_scoped_names() {
        let store = CouchDocstore::new("http://localhost:5984", "packscore").unwrap();
        let url = store.doc_url("analysis!@types/node");
        // The slash must not split the path into two segments.
        assert!(url.as_str().ends_with("/packscore/analysis!@types%2Fnode"));
    }

    #[test]
    fn test_document_body_round_trip() {
        let doc = Document::with_rev(
            "analysis!lodash",
            "3-abc".to_string(),
            json!({"collected": {"metadata": {"name": "lodash"}}}),
        );
        let body = CouchDocstore::body_from_document(&doc);
        assert_eq!(body["_id"], "analysis!lodash");
        assert_eq!(body["_rev"], "3-abc");
        let round_tripped = CouchDocstore::document_from_body(body);
        assert_eq!(round_tripped, doc);
    }
}
