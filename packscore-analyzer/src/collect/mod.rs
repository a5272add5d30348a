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

//! Signal collection.
//!
//! Four collectors run in parallel with settled semantics: every collector
//! runs to completion regardless of the others, and the aggregate fails with
//! the first error in declaration order (metadata, registry, source-host,
//! source-code) only after all of them finished. A repository that does not
//! appear to belong to the publisher short-circuits the repository-derived
//! collectors, so a typosquat cannot inherit the legit project's signals.

pub mod metadata;
pub mod registry_stats;
pub mod source_code;
pub mod source_host;
pub mod token_dealer;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use packscore_common::AnalyzerResult;
use packscore_docstore::DocumentStore;
use packscore_registry::PackageRegistry;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

pub use self::metadata::Metadata;
pub use self::registry_stats::RegistryStats;
pub use self::source_code::SourceCodeInfo;
pub use self::source_host::{GithubClient, SourceHostInfo};

/// Everything the collectors gathered for one package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collected {
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_host: Option<SourceHostInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_code: Option<SourceCodeInfo>,
}

#[async_trait]
pub trait CollectorSet: Send + Sync + 'static {
    async fn collect(
        &self,
        package_data: &JsonValue,
        manifest: &crate::manifest::Manifest,
        workdir: &Path,
    ) -> AnalyzerResult<Collected>;
}

/// The production collector set.
pub struct DefaultCollectorSet {
    registry: Arc<dyn PackageRegistry>,
    docstore: Arc<dyn DocumentStore>,
    github: GithubClient,
}

impl DefaultCollectorSet {
    pub fn new(
        registry: Arc<dyn PackageRegistry>,
        docstore: Arc<dyn DocumentStore>,
        github: GithubClient,
    ) -> Self {
        Self {
            registry,
            docstore,
            github,
        }
    }
}

#[async_trait]
impl CollectorSet for DefaultCollectorSet {
    async fn collect(
        &self,
        package_data: &JsonValue,
        manifest: &crate::manifest::Manifest,
        workdir: &Path,
    ) -> AnalyzerResult<Collected> {
        let repository_trusted = repository_matches_publisher(manifest);
        if !repository_trusted {
            warn!(
                name = %manifest.name,
                repository = ?manifest.repository_url(),
                "repository does not appear to belong to the publisher, skipping repository collectors"
            );
        }
        let metadata_result = metadata::collect(package_data, manifest);
        let (registry_result, source_host_result, source_code_result) = tokio::join!(
            registry_stats::collect(&*self.registry, &*self.docstore, package_data, manifest),
            async {
                if repository_trusted {
                    self.github.collect(manifest).await
                } else {
                    Ok(None)
                }
            },
            async {
                if repository_trusted {
                    source_code::collect(manifest, workdir).await.map(Some)
                } else {
                    Ok(None)
                }
            },
        );
        Ok(Collected {
            metadata: metadata_result?,
            registry: Some(registry_result?),
            source_host: source_host_result?,
            source_code: source_code_result?,
        })
    }
}

/// Maintainer/email overlap check between the declared repository and the
/// package's publishers. A missing repository trivially passes; an unrelated
/// one does not.
pub fn repository_matches_publisher(manifest: &crate::manifest::Manifest) -> bool {
    let Some((owner, repo)) = manifest.source_host_slug() else {
        // Nothing repository-derived will be collected anyway.
        return true;
    };
    let owner_lower = owner.to_lowercase();
    let repo_lower = repo.to_lowercase();
    let package_name = manifest.name.to_lowercase();
    let bare_name = package_name
        .rsplit('/')
        .next()
        .unwrap_or(&package_name)
        .to_string();
    if repo_lower == bare_name || package_name.contains(&repo_lower) {
        return true;
    }
    if manifest
        .scope()
        .map(|scope| scope.to_lowercase() == owner_lower)
        .unwrap_or(false)
    {
        return true;
    }
    let maintainer_handles = maintainer_handles(manifest);
    maintainer_handles.iter().any(|handle| *handle == owner_lower)
}

fn maintainer_handles(manifest: &crate::manifest::Manifest) -> Vec<String> {
    let mut handles = Vec::new();
    let mut collect_person = |person: &JsonValue| {
        if let Some(name) = person.get("name").and_then(JsonValue::as_str) {
            handles.push(name.to_lowercase());
        }
        if let Some(email) = person.get("email").and_then(JsonValue::as_str) {
            if let Some(local_part) = email.split('@').next() {
                handles.push(local_part.to_lowercase());
            }
        }
    };
    if let Some(JsonValue::Array(maintainers)) = &manifest.maintainers {
        for maintainer in maintainers {
            collect_person(maintainer);
        }
    }
    if let Some(author) = &manifest.author {
        collect_person(author);
    }
    handles
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::manifest::Manifest;

    fn manifest_with(repository: &str, maintainers: JsonValue) -> Manifest {
        Manifest {
            name: "pkg-a".to_string(),
            repository: Some(json!(repository)),
            maintainers: Some(maintainers),
            ..Default::default()
        }
    }

    #[test]
    fn test_repo_named_after_package_is_trusted() {
        let manifest = manifest_with("https://github.com/whoever/pkg-a", json!([]));
        assert!(repository_matches_publisher(&manifest));
    }

    #[test]
    fn test_maintainer_owned_repo_is_trusted() {
        let manifest = manifest_with(
            "https://github.com/alice/utils",
            json!([{"name": "alice", "email": "alice@acme.io"}]),
        );
        assert!(repository_matches_publisher(&manifest));
    }

    #[test]
    fn test_unrelated_repo_is_suspicious() {
        let manifest = manifest_with(
            "https://github.com/lodash/lodash",
            json!([{"name": "mallory", "email": "mallory@evil.io"}]),
        );
        assert!(!repository_matches_publisher(&manifest));
    }

    #[test]
    fn test_scoped_package_matching_owner_is_trusted() {
        let manifest = Manifest {
            name: "@acme/toolbox".to_string(),
            repository: Some(json!("https://github.com/acme/monorepo")),
            ..Default::default()
        };
        assert!(repository_matches_publisher(&manifest));
    }

    #[test]
    fn test_no_repository_passes() {
        assert!(repository_matches_publisher(&Manifest::default()));
    }
}
