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

//! In-memory search index for tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::{IndexErrorKind, IndexResult};
use crate::{AliasAction, SearchIndex};

#[derive(Default)]
struct Inner {
    indices: BTreeMap<String, BTreeMap<String, JsonValue>>,
    aliases: BTreeMap<String, Vec<String>>,
}

/// Test double holding indices and aliases under a single lock, so alias
/// updates are atomic the way the production `_aliases` call is.
#[derive(Default)]
pub struct MemScoreIndex {
    inner: Mutex<Inner>,
}

impl MemScoreIndex {
    pub fn docs(&self, index: &str) -> Vec<(String, JsonValue)> {
        let inner = self.inner.lock().unwrap();
        inner
            .indices
            .get(index)
            .map(|docs| {
                docs.iter()
                    .map(|(doc_id, doc)| (doc_id.clone(), doc.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl SearchIndex for MemScoreIndex {
    async fn list_indices(&self, pattern: &str) -> IndexResult<Vec<String>> {
        let prefix = pattern.trim_end_matches('*');
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .indices
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn list_aliases(&self) -> IndexResult<BTreeMap<String, Vec<String>>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.aliases.clone())
    }

    async fn create_index(&self, name: &str, _schema: &JsonValue) -> IndexResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.indices.contains_key(name) {
            return Err(IndexErrorKind::Fatal
                .with_error(anyhow::anyhow!("index `{name}` already exists")));
        }
        inner.indices.insert(name.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> IndexResult<()> {
        let mut inner = self.inner.lock().unwrap();
        // Validate every action before applying any, so the batch stays
        // all-or-nothing.
        for action in actions {
            let index = match action {
                AliasAction::Add { index, .. } | AliasAction::Remove { index, .. } => index,
            };
            if !inner.indices.contains_key(index) {
                return Err(IndexErrorKind::NotFound
                    .with_error(anyhow::anyhow!("no index `{index}`")));
            }
        }
        for action in actions {
            match action {
                AliasAction::Add { index, alias } => {
                    let indices = inner.aliases.entry(alias.clone()).or_default();
                    if !indices.contains(index) {
                        indices.push(index.clone());
                    }
                }
                AliasAction::Remove { index, alias } => {
                    if let Some(indices) = inner.aliases.get_mut(alias) {
                        indices.retain(|existing| existing != index);
                    }
                    let alias_is_empty = inner
                        .aliases
                        .get(alias)
                        .map(|indices| indices.is_empty())
                        .unwrap_or(false);
                    if alias_is_empty {
                        inner.aliases.remove(alias);
                    }
                }
            }
        }
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> IndexResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.indices.remove(name).is_none() {
            return Err(IndexErrorKind::NotFound.with_error(anyhow::anyhow!("no index `{name}`")));
        }
        for indices in inner.aliases.values_mut() {
            indices.retain(|existing| existing != name);
        }
        inner.aliases.retain(|_, indices| !indices.is_empty());
        Ok(())
    }

    async fn index_doc(&self, index: &str, doc_id: &str, doc: &JsonValue) -> IndexResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let physical_names: Vec<String> = match inner.aliases.get(index) {
            Some(resolved) => resolved.clone(),
            None => vec![index.to_string()],
        };
        for physical_name in physical_names {
            let docs = inner.indices.get_mut(&physical_name).ok_or_else(|| {
                IndexErrorKind::NotFound.with_error(anyhow::anyhow!("no index `{physical_name}`"))
            })?;
            docs.insert(doc_id.to_string(), doc.clone());
        }
        Ok(())
    }

    async fn count_docs(&self, index: &str) -> IndexResult<u64> {
        let inner = self.inner.lock().unwrap();
        let physical_names: Vec<String> = match inner.aliases.get(index) {
            Some(resolved) => resolved.clone(),
            None => vec![index.to_string()],
        };
        let mut num_docs = 0u64;
        for physical_name in physical_names {
            let docs = inner.indices.get(&physical_name).ok_or_else(|| {
                IndexErrorKind::NotFound.with_error(anyhow::anyhow!("no index `{physical_name}`"))
            })?;
            num_docs += docs.len() as u64;
        }
        Ok(num_docs)
    }

    async fn is_up(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{resolve_alias, CURRENT_ALIAS, NEW_ALIAS};

    #[tokio::test]
    async fn test_atomic_alias_swap() -> anyhow::Result<()> {
        let search_index = MemScoreIndex::default();
        search_index.create_index("scores-1", &json!({})).await?;
        search_index.create_index("scores-2", &json!({})).await?;
        search_index
            .update_aliases(&[AliasAction::Add {
                index: "scores-1".to_string(),
                alias: CURRENT_ALIAS.to_string(),
            }])
            .await?;
        search_index
            .update_aliases(&[
                AliasAction::Remove {
                    index: "scores-2".to_string(),
                    alias: NEW_ALIAS.to_string(),
                },
                AliasAction::Remove {
                    index: "scores-1".to_string(),
                    alias: CURRENT_ALIAS.to_string(),
                },
                AliasAction::Add {
                    index: "scores-2".to_string(),
                    alias: CURRENT_ALIAS.to_string(),
                },
            ])
            .await?;
        assert_eq!(
            resolve_alias(&search_index, CURRENT_ALIAS).await?,
            vec!["scores-2".to_string()]
        );
        assert!(resolve_alias(&search_index, NEW_ALIAS).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_index_doc_through_alias() -> anyhow::Result<()> {
        let search_index = MemScoreIndex::default();
        search_index.create_index("scores-1", &json!({})).await?;
        search_index
            .update_aliases(&[AliasAction::Add {
                index: "scores-1".to_string(),
                alias: NEW_ALIAS.to_string(),
            }])
            .await?;
        search_index
            .index_doc(NEW_ALIAS, "lodash", &json!({"score": {"final": 0.9}}))
            .await?;
        assert_eq!(search_index.count_docs("scores-1").await?, 1);
        Ok(())
    }
}
