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

//! Package manifests.
//!
//! The registry package document carries one manifest per published version;
//! the downloaded sources carry another. The published one wins on
//! conflicting fields, the downloaded one fills the gaps.

use std::collections::BTreeMap;

use packscore_common::{AnalyzerErrorKind, AnalyzerResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

/// The subset of a package manifest the pipeline works with. Everything else
/// rides along in `extra` so the merged manifest can be written back whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    /// Raw license declaration: a string, `{type, url}` object, or an array
    /// of either. Normalization happens in the metadata collector.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<JsonValue>,
    /// Legacy plural form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub licenses: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bugs: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintainers: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<BTreeMap<String, String>>,
    #[serde(
        rename = "devDependencies",
        skip_serializing_if = "Option::is_none"
    )]
    pub dev_dependencies: Option<BTreeMap<String, String>>,
    #[serde(
        rename = "peerDependencies",
        skip_serializing_if = "Option::is_none"
    )]
    pub peer_dependencies: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scripts: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dist: Option<Dist>,
    #[serde(rename = "gitHead", skip_serializing_if = "Option::is_none")]
    pub git_head: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dist {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tarball: Option<String>,
    #[serde(rename = "unpackedSize", skip_serializing_if = "Option::is_none")]
    pub unpacked_size: Option<u64>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl Manifest {
    /// The package scope (`@types/node` -> `types`).
    pub fn scope(&self) -> Option<&str> {
        self.name
            .strip_prefix('@')
            .and_then(|scoped| scoped.split('/').next())
    }

    /// The repository URL in `https://` form, whatever shape the manifest
    /// declared it in.
    pub fn repository_url(&self) -> Option<String> {
        let raw_url = match self.repository.as_ref()? {
            JsonValue::String(url) => url.clone(),
            JsonValue::Object(object) => object.get("url")?.as_str()?.to_string(),
            _ => return None,
        };
        normalize_repository_url(&raw_url)
    }

    /// `(owner, repo)` when the repository lives on a supported source host.
    pub fn source_host_slug(&self) -> Option<(String, String)> {
        let repository_url = self.repository_url()?;
        let parsed = url::Url::parse(&repository_url).ok()?;
        if parsed.host_str() != Some("github.com") {
            return None;
        }
        let mut path_segments = parsed.path_segments()?;
        let owner = path_segments.next()?.to_string();
        let repo = path_segments.next()?.trim_end_matches(".git").to_string();
        if owner.is_empty() || repo.is_empty() {
            return None;
        }
        Some((owner, repo))
    }

    pub fn has_test_script(&self) -> bool {
        self.scripts
            .as_ref()
            .and_then(|scripts| scripts.get("test"))
            // The npm scaffold default is a placebo, not a test suite.
            .map(|test_script| !test_script.contains("no test specified"))
            .unwrap_or(false)
    }
}

/// Strips the `git+`/`git://` wrappers manifests carry and rewrites
/// ssh-style GitHub remotes to `https://`.
pub fn normalize_repository_url(raw_url: &str) -> Option<String> {
    let trimmed = raw_url.trim();
    if trimmed.is_empty() {
        return None;
    }
    let without_prefix = trimmed.strip_prefix("git+").unwrap_or(trimmed);
    if let Some(ssh_path) = without_prefix.strip_prefix("git@github.com:") {
        return Some(format!(
            "https://github.com/{}",
            ssh_path.trim_end_matches(".git")
        ));
    }
    let rewritten = without_prefix
        .replace("git://", "https://")
        .replace("ssh://git@", "https://");
    let rewritten = rewritten.trim_end_matches(".git").to_string();
    url::Url::parse(&rewritten).ok()?;
    Some(rewritten)
}

/// Extracts the manifest of the latest published version from the raw
/// registry package document.
pub fn manifest_from_package_data(package_data: &JsonValue) -> AnalyzerResult<Manifest> {
    let latest_version = package_data
        .pointer("/dist-tags/latest")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| {
            AnalyzerErrorKind::Unrecoverable
                .with_error(anyhow::anyhow!("package document has no latest dist-tag"))
        })?;
    let version_manifest = package_data
        .pointer(&format!("/versions/{latest_version}"))
        .ok_or_else(|| {
            AnalyzerErrorKind::Unrecoverable.with_error(anyhow::anyhow!(
                "package document has no manifest for version `{latest_version}`"
            ))
        })?;
    let mut manifest: Manifest =
        serde_json::from_value(version_manifest.clone()).map_err(|parse_error| {
            AnalyzerErrorKind::Unrecoverable
                .with_error(anyhow::Error::from(parse_error).context("malformed manifest"))
        })?;
    // Deprecation and maintainers often live only at the document root.
    if manifest.maintainers.is_none() {
        manifest.maintainers = package_data.get("maintainers").cloned();
    }
    Ok(manifest)
}

/// Merges the published manifest over the downloaded one: the published
/// value wins on every field it carries, the downloaded one fills the gaps.
pub fn merge_manifests(published: &Manifest, downloaded: &Manifest) -> Manifest {
    fn pick<T: Clone>(published: &Option<T>, downloaded: &Option<T>) -> Option<T> {
        published.clone().or_else(|| downloaded.clone())
    }
    let mut extra = downloaded.extra.clone();
    for (key, value) in &published.extra {
        extra.insert(key.clone(), value.clone());
    }
    Manifest {
        name: published.name.clone(),
        version: pick(&published.version, &downloaded.version),
        description: pick(&published.description, &downloaded.description),
        keywords: if published.keywords.is_empty() {
            downloaded.keywords.clone()
        } else {
            published.keywords.clone()
        },
        license: pick(&published.license, &downloaded.license),
        licenses: pick(&published.licenses, &downloaded.licenses),
        repository: pick(&published.repository, &downloaded.repository),
        homepage: pick(&published.homepage, &downloaded.homepage),
        bugs: pick(&published.bugs, &downloaded.bugs),
        author: pick(&published.author, &downloaded.author),
        maintainers: pick(&published.maintainers, &downloaded.maintainers),
        dependencies: pick(&published.dependencies, &downloaded.dependencies),
        dev_dependencies: pick(&published.dev_dependencies, &downloaded.dev_dependencies),
        peer_dependencies: pick(&published.peer_dependencies, &downloaded.peer_dependencies),
        scripts: pick(&published.scripts, &downloaded.scripts),
        deprecated: pick(&published.deprecated, &downloaded.deprecated),
        dist: pick(&published.dist, &downloaded.dist),
        git_head: pick(&published.git_head, &downloaded.git_head),
        extra,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn package_data() -> JsonValue {
        json!({
            "_id": "pkg-a",
            "name": "pkg-a",
            "dist-tags": {"latest": "1.2.0"},
            "versions": {
                "1.0.0": {"name": "pkg-a", "version": "1.0.0"},
                "1.2.0": {
                    "name": "pkg-a",
                    "version": "1.2.0",
                    "repository": {"type": "git", "url": "git+https://github.com/acme/pkg-a.git"},
                    "scripts": {"test": "mocha"}
                }
            },
            "maintainers": [{"name": "alice", "email": "alice@acme.io"}]
        })
    }

    #[test]
    fn test_manifest_from_package_data_picks_latest() {
        let manifest = manifest_from_package_data(&package_data()).unwrap();
        assert_eq!(manifest.name, "pkg-a");
        assert_eq!(manifest.version.as_deref(), Some("1.2.0"));
        assert!(manifest.has_test_script());
        assert_eq!(
            manifest.maintainers,
            Some(json!([{"name": "alice", "email": "alice@acme.io"}]))
        );
    }

    #[test]
    fn test_manifest_from_package_data_without_versions_is_unrecoverable() {
        let error = manifest_from_package_data(&json!({"name": "gone"})).unwrap_err();
        assert!(error.is_unrecoverable());
    }

    #[test]
    fn test_repository_url_normalization() {
        assert_eq!(
            normalize_repository_url("git+https://github.com/acme/pkg.git"),
            Some("https://github.com/acme/pkg".to_string())
        );
        assert_eq!(
            normalize_repository_url("git://github.com/acme/pkg.git"),
            Some("https://github.com/acme/pkg".to_string())
        );
        assert_eq!(
            normalize_repository_url("git@github.com:acme/pkg.git"),
            Some("https://github.com/acme/pkg".to_string())
        );
        assert_eq!(normalize_repository_url(""), None);
        assert_eq!(normalize_repository_url("not a url"), None);
    }

    #[test]
    fn test_source_host_slug() {
        let manifest = manifest_from_package_data(&package_data()).unwrap();
        assert_eq!(
            manifest.source_host_slug(),
            Some(("acme".to_string(), "pkg-a".to_string()))
        );

        let gitlab_manifest = Manifest {
            repository: Some(json!("https://gitlab.com/acme/pkg")),
            ..Default::default()
        };
        assert_eq!(gitlab_manifest.source_host_slug(), None);
    }

    #[test]
    fn test_scope() {
        let scoped = Manifest {
            name: "@types/node".to_string(),
            ..Default::default()
        };
        assert_eq!(scoped.scope(), Some("types"));
        let unscoped = Manifest {
            name: "lodash".to_string(),
            ..Default::default()
        };
        assert_eq!(unscoped.scope(), None);
    }

    #[test]
    fn test_merge_published_wins_downloaded_fills() {
        let published = Manifest {
            name: "pkg-a".to_string(),
            version: Some("1.2.0".to_string()),
            description: Some("published description".to_string()),
            ..Default::default()
        };
        let downloaded = Manifest {
            name: "pkg-a".to_string(),
            version: Some("0.0.0-development".to_string()),
            description: Some("downloaded description".to_string()),
            homepage: Some("https://acme.io/pkg-a".to_string()),
            ..Default::default()
        };
        let merged = merge_manifests(&published, &downloaded);
        assert_eq!(merged.version.as_deref(), Some("1.2.0"));
        assert_eq!(merged.description.as_deref(), Some("published description"));
        assert_eq!(merged.homepage.as_deref(), Some("https://acme.io/pkg-a"));
    }
}
