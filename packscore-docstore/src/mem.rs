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

//! In-memory, rev-checked document store for tests.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::{DocstoreErrorKind, DocstoreResult};
use crate::{BulkRow, Document, DocumentStore, RangeQuery, ViewParams, ViewResponse, ViewRow};

type ViewFn = Box<dyn Fn(&Document) -> Vec<(JsonValue, JsonValue)> + Send + Sync>;

#[derive(Default)]
struct StoredDoc {
    rev_seq: u64,
    value: JsonValue,
}

/// Test double emulating the CouchDB semantics the production adapter relies
/// on: revision checks, bulk writes with per-row conflicts, key-ordered
/// range scans, and map-function views registered per test.
#[derive(Default)]
pub struct MemDocstore {
    docs: Mutex<BTreeMap<String, StoredDoc>>,
    views: Mutex<HashMap<(String, String), ViewFn>>,
    fail_next_put: AtomicBool,
}

impl MemDocstore {
    /// Registers the map function backing `design/view`.
    pub fn register_view<F>(&self, design: &str, view: &str, map_fn: F)
    where F: Fn(&Document) -> Vec<(JsonValue, JsonValue)> + Send + Sync + 'static {
        self.views
            .lock()
            .unwrap()
            .insert((design.to_string(), view.to_string()), Box::new(map_fn));
    }

    /// Makes the next `put` fail with a conflict, simulating a competing
    /// writer landing between a get and a put.
    pub fn fail_next_put_with_conflict(&self) {
        self.fail_next_put.store(true, AtomicOrdering::SeqCst);
    }

    pub fn num_docs(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.docs.lock().unwrap().keys().cloned().collect()
    }

    fn rev_string(rev_seq: u64) -> String {
        format!("{rev_seq}-mem")
    }

    fn rev_seq(rev: &str) -> u64 {
        rev.split('-')
            .next()
            .and_then(|seq| seq.parse().ok())
            .unwrap_or(0)
    }

    fn document(id: &str, stored: &StoredDoc) -> Document {
        Document {
            id: id.to_string(),
            rev: Some(Self::rev_string(stored.rev_seq)),
            value: stored.value.clone(),
        }
    }

    fn put_locked(
        docs: &mut BTreeMap<String, StoredDoc>,
        doc: &Document,
    ) -> Result<String, DocstoreErrorKind> {
        let current_rev_seq = docs.get(&doc.id).map(|stored| stored.rev_seq).unwrap_or(0);
        let given_rev_seq = doc.rev.as_deref().map(Self::rev_seq).unwrap_or(0);
        if given_rev_seq != current_rev_seq {
            return Err(DocstoreErrorKind::Conflict);
        }
        let new_rev_seq = current_rev_seq + 1;
        docs.insert(
            doc.id.clone(),
            StoredDoc {
                rev_seq: new_rev_seq,
                value: doc.value.clone(),
            },
        );
        Ok(Self::rev_string(new_rev_seq))
    }
}

/// CouchDB-flavored JSON collation, reduced to what the tests exercise:
/// null < bool < number < string < array < object, arrays element-wise.
pub fn cmp_json_keys(left: &JsonValue, right: &JsonValue) -> Ordering {
    fn type_rank(value: &JsonValue) -> u8 {
        match value {
            JsonValue::Null => 0,
            JsonValue::Bool(_) => 1,
            JsonValue::Number(_) => 2,
            JsonValue::String(_) => 3,
            JsonValue::Array(_) => 4,
            JsonValue::Object(_) => 5,
        }
    }
    let rank_ordering = type_rank(left).cmp(&type_rank(right));
    if rank_ordering != Ordering::Equal {
        return rank_ordering;
    }
    match (left, right) {
        (JsonValue::Bool(left), JsonValue::Bool(right)) => left.cmp(right),
        (JsonValue::Number(left), JsonValue::Number(right)) => left
            .as_f64()
            .partial_cmp(&right.as_f64())
            .unwrap_or(Ordering::Equal),
        (JsonValue::String(left), JsonValue::String(right)) => left.cmp(right),
        (JsonValue::Array(left), JsonValue::Array(right)) => {
            for (left_item, right_item) in left.iter().zip(right.iter()) {
                let item_ordering = cmp_json_keys(left_item, right_item);
                if item_ordering != Ordering::Equal {
                    return item_ordering;
                }
            }
            left.len().cmp(&right.len())
        }
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl DocumentStore for MemDocstore {
    async fn get(&self, key: &str) -> DocstoreResult<Document> {
        let docs = self.docs.lock().unwrap();
        docs.get(key)
            .map(|stored| Self::document(key, stored))
            .ok_or_else(|| {
                DocstoreErrorKind::NotFound.with_error(anyhow::anyhow!("no document `{key}`"))
            })
    }

    async fn put(&self, doc: &Document) -> DocstoreResult<String> {
        if self.fail_next_put.swap(false, AtomicOrdering::SeqCst) {
            return Err(DocstoreErrorKind::Conflict
                .with_error(anyhow::anyhow!("injected conflict on `{}`", doc.id)));
        }
        let mut docs = self.docs.lock().unwrap();
        Self::put_locked(&mut docs, doc).map_err(|kind| {
            kind.with_error(anyhow::anyhow!("stale revision for `{}`", doc.id))
        })
    }

    async fn delete(&self, key: &str, rev: &str) -> DocstoreResult<()> {
        let mut docs = self.docs.lock().unwrap();
        let Some(stored) = docs.get(key) else {
            return Err(
                DocstoreErrorKind::NotFound.with_error(anyhow::anyhow!("no document `{key}`"))
            );
        };
        if Self::rev_seq(rev) != stored.rev_seq {
            return Err(
                DocstoreErrorKind::Conflict.with_error(anyhow::anyhow!("stale revision for `{key}`"))
            );
        }
        docs.remove(key);
        Ok(())
    }

    async fn bulk_get(&self, keys: &[String]) -> DocstoreResult<Vec<Option<Document>>> {
        let docs = self.docs.lock().unwrap();
        let fetched = keys
            .iter()
            .map(|key| docs.get(key).map(|stored| Self::document(key, stored)))
            .collect();
        Ok(fetched)
    }

    async fn bulk_put(&self, docs_to_write: &[Document]) -> DocstoreResult<Vec<BulkRow>> {
        let mut docs = self.docs.lock().unwrap();
        let rows = docs_to_write
            .iter()
            .map(|doc| BulkRow {
                id: doc.id.clone(),
                rev: Self::put_locked(&mut docs, doc).ok(),
            })
            .collect();
        Ok(rows)
    }

    async fn list_range(&self, query: RangeQuery) -> DocstoreResult<Vec<Document>> {
        let docs = self.docs.lock().unwrap();
        let page = docs
            .range(query.start_key.clone()..=query.end_key.clone())
            .skip(usize::from(query.skip_first))
            .take(query.limit)
            .map(|(key, stored)| Self::document(key, stored))
            .collect();
        Ok(page)
    }

    async fn query_view(
        &self,
        design: &str,
        view: &str,
        params: ViewParams,
    ) -> DocstoreResult<ViewResponse> {
        let views = self.views.lock().unwrap();
        let map_fn = views
            .get(&(design.to_string(), view.to_string()))
            .ok_or_else(|| {
                DocstoreErrorKind::NotFound
                    .with_error(anyhow::anyhow!("no view `{design}/{view}` registered"))
            })?;
        let docs = self.docs.lock().unwrap();
        let mut rows: Vec<ViewRow> = Vec::new();
        for (key, stored) in docs.iter() {
            let doc = Self::document(key, stored);
            for (row_key, row_value) in map_fn(&doc) {
                rows.push(ViewRow {
                    id: doc.id.clone(),
                    key: row_key,
                    value: row_value,
                    doc: params.include_docs.then(|| doc.clone()),
                });
            }
        }
        rows.sort_by(|left, right| cmp_json_keys(&left.key, &right.key));
        if let Some(start_key) = &params.start_key {
            rows.retain(|row| cmp_json_keys(&row.key, start_key) != Ordering::Less);
        }
        if let Some(end_key) = &params.end_key {
            rows.retain(|row| cmp_json_keys(&row.key, end_key) != Ordering::Greater);
        }
        if let Some(skip) = params.skip {
            rows.drain(..skip.min(rows.len()));
        }
        if let Some(limit) = params.limit {
            rows.truncate(limit);
        }
        Ok(ViewResponse { rows })
    }

    async fn compact(&self) -> DocstoreResult<()> {
        Ok(())
    }

    async fn view_cleanup(&self) -> DocstoreResult<()> {
        Ok(())
    }

    async fn compaction_running(&self) -> DocstoreResult<bool> {
        Ok(false)
    }

    async fn is_up(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_rev_checked_put_and_delete() -> anyhow::Result<()> {
        let store = MemDocstore::default();
        let rev_1 = store.put(&Document::new("obs!a", json!({"n": 1}))).await?;
        assert_eq!(rev_1, "1-mem");

        // A put without the current rev conflicts.
        let conflict = store
            .put(&Document::new("obs!a", json!({"n": 2})))
            .await
            .unwrap_err();
        assert!(conflict.is_conflict());

        let rev_2 = store
            .put(&Document::with_rev("obs!a", rev_1, json!({"n": 2})))
            .await?;
        let stale_delete = store.delete("obs!a", "1-mem").await.unwrap_err();
        assert!(stale_delete.is_conflict());
        store.delete("obs!a", &rev_2).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_view_rows_are_key_ordered_and_bounded() -> anyhow::Result<()> {
        let store = MemDocstore::default();
        store.register_view("packscore", "by-n", |doc| {
            vec![(json!(["n", doc.value["n"].clone()]), json!(null))]
        });
        for n in [3, 1, 2] {
            store
                .put(&Document::new(format!("doc-{n}"), json!({"n": n})))
                .await?;
        }
        let response = store
            .query_view(
                "packscore",
                "by-n",
                ViewParams {
                    end_key: Some(json!(["n", 2])),
                    ..Default::default()
                },
            )
            .await?;
        let ids: Vec<&str> = response.rows.iter().map(|row| row.id.as_str()).collect();
        assert_eq!(ids, vec!["doc-1", "doc-2"]);
        Ok(())
    }
}
