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

//! Document store adapter.
//!
//! The analysis corpus lives in a single logical database of a
//! CouchDB-compatible store. Documents are addressed by namespaced keys
//! (`analysis!<name>`, `obs!<name>`, ...) and guarded by revision tokens:
//! every write carries the revision it read, and a stale revision is a
//! first-class [`DocstoreErrorKind::Conflict`].

mod couch;
mod error;
#[cfg(any(test, feature = "testsuite"))]
mod mem;

use async_trait::async_trait;
pub use couch::CouchDocstore;
pub use error::{DocstoreError, DocstoreErrorKind, DocstoreResult};
#[cfg(any(test, feature = "testsuite"))]
pub use mem::MemDocstore;
use serde_json::Value as JsonValue;
use tracing::warn;

/// Upper bound of a key range sharing a prefix, per CouchDB collation.
pub const KEY_RANGE_SENTINEL: char = '\u{fff0}';

const MAX_PATCH_ATTEMPTS: usize = 3;

/// A stored document: namespaced key, revision token, JSON value.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub rev: Option<String>,
    pub value: JsonValue,
}

impl Document {
    pub fn new<S: Into<String>>(id: S, value: JsonValue) -> Self {
        Self {
            id: id.into(),
            rev: None,
            value,
        }
    }

    pub fn with_rev<S: Into<String>>(id: S, rev: String, value: JsonValue) -> Self {
        Self {
            id: id.into(),
            rev: Some(rev),
            value,
        }
    }
}

/// Outcome of one row of a bulk write.
#[derive(Debug, Clone)]
pub struct BulkRow {
    pub id: String,
    /// New revision on success, `None` when the row conflicted.
    pub rev: Option<String>,
}

impl BulkRow {
    pub fn is_conflict(&self) -> bool {
        self.rev.is_none()
    }
}

/// One page worth of a key-range scan.
#[derive(Debug, Clone)]
pub struct RangeQuery {
    pub start_key: String,
    pub end_key: String,
    pub limit: usize,
    /// Skip the first row; used to resume a scan after the last fetched key.
    pub skip_first: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ViewParams {
    pub start_key: Option<JsonValue>,
    pub end_key: Option<JsonValue>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
    pub include_docs: bool,
}

#[derive(Debug, Clone)]
pub struct ViewRow {
    pub id: String,
    pub key: JsonValue,
    pub value: JsonValue,
    pub doc: Option<Document>,
}

#[derive(Debug, Clone, Default)]
pub struct ViewResponse {
    pub rows: Vec<ViewRow>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Fetches a single document. Missing documents are a typed
    /// [`DocstoreErrorKind::NotFound`] so callers can branch.
    async fn get(&self, key: &str) -> DocstoreResult<Document>;

    /// Writes a document, returning the new revision. The document's `rev`
    /// must match the stored one (or be `None` for a fresh document).
    async fn put(&self, doc: &Document) -> DocstoreResult<String>;

    async fn delete(&self, key: &str, rev: &str) -> DocstoreResult<()>;

    /// Multi-get in one round-trip. The result is positionally aligned with
    /// `keys`; missing documents yield `None`.
    async fn bulk_get(&self, keys: &[String]) -> DocstoreResult<Vec<Option<Document>>>;

    /// Bulk write; conflicting rows are reported, not failed.
    async fn bulk_put(&self, docs: &[Document]) -> DocstoreResult<Vec<BulkRow>>;

    /// One page of documents whose keys fall in `[start_key, end_key]`.
    async fn list_range(&self, query: RangeQuery) -> DocstoreResult<Vec<Document>>;

    async fn query_view(
        &self,
        design: &str,
        view: &str,
        params: ViewParams,
    ) -> DocstoreResult<ViewResponse>;

    /// Triggers database compaction.
    async fn compact(&self) -> DocstoreResult<()>;

    /// Removes stale view index files.
    async fn view_cleanup(&self) -> DocstoreResult<()>;

    async fn compaction_running(&self) -> DocstoreResult<bool>;

    /// Readiness probe.
    async fn is_up(&self) -> bool;
}

/// Lazy restartable pager over a key prefix, yielding `(index, doc)` pairs
/// page by page.
pub struct KeyRangePager<'a> {
    store: &'a dyn DocumentStore,
    end_key: String,
    next_start_key: String,
    skip_first: bool,
    page_size: usize,
    next_index: u64,
    exhausted: bool,
}

impl<'a> KeyRangePager<'a> {
    pub fn new(store: &'a dyn DocumentStore, prefix: &str, page_size: usize) -> Self {
        Self {
            store,
            end_key: format!("{prefix}{KEY_RANGE_SENTINEL}"),
            next_start_key: prefix.to_string(),
            skip_first: false,
            page_size,
            next_index: 0,
            exhausted: false,
        }
    }

    /// Fetches the next page, or `None` once the range is exhausted.
    pub async fn next_page(&mut self) -> DocstoreResult<Option<Vec<(u64, Document)>>> {
        if self.exhausted {
            return Ok(None);
        }
        let docs = self
            .store
            .list_range(RangeQuery {
                start_key: self.next_start_key.clone(),
                end_key: self.end_key.clone(),
                limit: self.page_size,
                skip_first: self.skip_first,
            })
            .await?;
        if docs.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }
        if docs.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last_doc) = docs.last() {
            self.next_start_key = last_doc.id.clone();
            self.skip_first = true;
        }
        let page = docs
            .into_iter()
            .map(|doc| {
                let indexed = (self.next_index, doc);
                self.next_index += 1;
                indexed
            })
            .collect();
        Ok(Some(page))
    }
}

/// Read-modify-write over a set of keys in bulk.
///
/// `patch` receives each key with its current document (if any) and returns
/// the new value, or `None` to leave the document untouched. Rows that
/// conflict are refetched and re-patched a bounded number of times;
/// leftovers are logged and dropped. Returns the number of rows written.
pub async fn bulk_patch<P>(
    store: &dyn DocumentStore,
    keys: &[String],
    patch: P,
) -> DocstoreResult<usize>
where
    P: Fn(&str, Option<&Document>) -> Option<JsonValue>,
{
    let mut pending_keys: Vec<String> = keys.to_vec();
    let mut num_written = 0;
    for _attempt in 0..MAX_PATCH_ATTEMPTS {
        if pending_keys.is_empty() {
            break;
        }
        let current_docs = store.bulk_get(&pending_keys).await?;
        let mut patched_docs: Vec<Document> = Vec::new();
        for (key, current_doc) in pending_keys.iter().zip(current_docs.iter()) {
            if let Some(new_value) = patch(key, current_doc.as_ref()) {
                patched_docs.push(Document {
                    id: key.clone(),
                    rev: current_doc.as_ref().and_then(|doc| doc.rev.clone()),
                    value: new_value,
                });
            }
        }
        if patched_docs.is_empty() {
            return Ok(num_written);
        }
        let rows = store.bulk_put(&patched_docs).await?;
        let conflicted_keys: Vec<String> = rows
            .iter()
            .filter(|row| row.is_conflict())
            .map(|row| row.id.clone())
            .collect();
        num_written += rows.len() - conflicted_keys.len();
        pending_keys = conflicted_keys;
    }
    if !pending_keys.is_empty() {
        warn!(keys = ?pending_keys, "bulk patch left conflicting rows behind");
    }
    Ok(num_written)
}

/// Writes `value` under `key`, refetching the revision and retrying on
/// conflict.
pub async fn put_with_retry(
    store: &dyn DocumentStore,
    key: &str,
    value: JsonValue,
) -> DocstoreResult<String> {
    let mut last_error: Option<DocstoreError> = None;
    for _attempt in 0..MAX_PATCH_ATTEMPTS {
        let rev = match store.get(key).await {
            Ok(doc) => doc.rev,
            Err(error) if error.is_not_found() => None,
            Err(error) => return Err(error),
        };
        let doc = Document {
            id: key.to_string(),
            rev,
            value: value.clone(),
        };
        match store.put(&doc).await {
            Ok(new_rev) => return Ok(new_rev),
            Err(error) if error.is_conflict() => {
                last_error = Some(error);
            }
            Err(error) => return Err(error),
        }
    }
    Err(last_error.expect("conflict retry loop ran at least once"))
}

/// Deletes `key`, tolerating a missing document and refetching the revision
/// on conflict.
pub async fn delete_with_retry(store: &dyn DocumentStore, key: &str) -> DocstoreResult<()> {
    let mut last_error: Option<DocstoreError> = None;
    for _attempt in 0..MAX_PATCH_ATTEMPTS {
        let rev = match store.get(key).await {
            Ok(doc) => doc.rev,
            Err(error) if error.is_not_found() => return Ok(()),
            Err(error) => return Err(error),
        };
        let Some(rev) = rev else {
            return Ok(());
        };
        match store.delete(key, &rev).await {
            Ok(()) => return Ok(()),
            Err(error) if error.is_not_found() => return Ok(()),
            Err(error) if error.is_conflict() => {
                last_error = Some(error);
            }
            Err(error) => return Err(error),
        }
    }
    Err(last_error.expect("conflict retry loop ran at least once"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_put_with_retry_survives_conflict() -> anyhow::Result<()> {
        let store = MemDocstore::default();
        store
            .put(&Document::new("analysis!lodash", json!({"v": 1})))
            .await?;
        // A competing writer bumps the revision between our get and put.
        store.fail_next_put_with_conflict();
        let new_rev = put_with_retry(&store, "analysis!lodash", json!({"v": 2})).await?;
        assert!(new_rev.starts_with("2-") || new_rev.starts_with("3-"));
        let doc = store.get("analysis!lodash").await?;
        assert_eq!(doc.value, json!({"v": 2}));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_with_retry_tolerates_missing() -> anyhow::Result<()> {
        let store = MemDocstore::default();
        delete_with_retry(&store, "analysis!ghost").await?;
        store
            .put(&Document::new("analysis!lodash", json!({"v": 1})))
            .await?;
        delete_with_retry(&store, "analysis!lodash").await?;
        assert!(store.get("analysis!lodash").await.unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_key_range_pager_pages_through_prefix() -> anyhow::Result<()> {
        let store = MemDocstore::default();
        for i in 0..5 {
            store
                .put(&Document::new(format!("analysis!pkg-{i}"), json!({})))
                .await?;
        }
        store.put(&Document::new("obs!pkg-0", json!({}))).await?;

        let mut pager = KeyRangePager::new(&store, "analysis!", 2);
        let mut seen: Vec<(u64, String)> = Vec::new();
        while let Some(page) = pager.next_page().await? {
            assert!(page.len() <= 2);
            seen.extend(page.into_iter().map(|(index, doc)| (index, doc.id)));
        }
        let expected: Vec<(u64, String)> = (0..5)
            .map(|i| (i as u64, format!("analysis!pkg-{i}")))
            .collect();
        assert_eq!(seen, expected);
        Ok(())
    }

    #[tokio::test]
    async fn test_bulk_patch_applies_and_counts() -> anyhow::Result<()> {
        let store = MemDocstore::default();
        store
            .put(&Document::new("obs!a", json!({"stale": {}})))
            .await?;
        let keys = vec!["obs!a".to_string(), "obs!b".to_string()];
        let num_written = bulk_patch(&store, &keys, |_key, current_doc| {
            let mut value = current_doc
                .map(|doc| doc.value.clone())
                .unwrap_or_else(|| json!({}));
            value["stale"] = json!({"notified_at": "2024-01-01T00:00:00Z"});
            Some(value)
        })
        .await?;
        assert_eq!(num_written, 2);
        let doc_b = store.get("obs!b").await?;
        assert_eq!(doc_b.value["stale"]["notified_at"], "2024-01-01T00:00:00Z");
        Ok(())
    }
}
