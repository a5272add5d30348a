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

//! Search index adapter.
//!
//! Scores land in per-cycle physical indices (`scores-<epoch-ms>`) behind
//! two aliases: `current` (the snapshot readers see) and `new` (the index
//! the running cycle populates). The swap from `new` to `current` happens
//! in a single alias-actions call, so readers observe either the previous
//! snapshot or the new one, never a partial one.

mod elastic;
mod error;
#[cfg(any(test, feature = "testsuite"))]
mod mem;

use std::collections::BTreeMap;

use async_trait::async_trait;
pub use elastic::ElasticScoreIndex;
pub use error::{IndexError, IndexErrorKind, IndexResult};
#[cfg(any(test, feature = "testsuite"))]
pub use mem::MemScoreIndex;
use serde_json::Value as JsonValue;

/// The alias readers resolve.
pub const CURRENT_ALIAS: &str = "current";
/// The alias pointing at the index the in-progress cycle populates.
pub const NEW_ALIAS: &str = "new";

/// One step of an atomic alias update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasAction {
    Add { index: String, alias: String },
    Remove { index: String, alias: String },
}

#[async_trait]
pub trait SearchIndex: Send + Sync + 'static {
    /// Physical index names matching `pattern` (trailing `*` wildcard).
    async fn list_indices(&self, pattern: &str) -> IndexResult<Vec<String>>;

    /// All aliases, mapped to the physical indices they point at.
    async fn list_aliases(&self) -> IndexResult<BTreeMap<String, Vec<String>>>;

    async fn create_index(&self, name: &str, schema: &JsonValue) -> IndexResult<()>;

    /// Applies all `actions` in one atomic operation.
    async fn update_aliases(&self, actions: &[AliasAction]) -> IndexResult<()>;

    async fn delete_index(&self, name: &str) -> IndexResult<()>;

    async fn index_doc(&self, index: &str, doc_id: &str, doc: &JsonValue) -> IndexResult<()>;

    /// Number of documents in `index` (alias names resolve too).
    async fn count_docs(&self, index: &str) -> IndexResult<u64>;

    /// Readiness probe.
    async fn is_up(&self) -> bool;
}

/// Resolves the physical indices an alias points at, empty when the alias
/// does not exist.
pub async fn resolve_alias(
    search_index: &dyn SearchIndex,
    alias: &str,
) -> IndexResult<Vec<String>> {
    let aliases = search_index.list_aliases().await?;
    Ok(aliases.get(alias).cloned().unwrap_or_default())
}
