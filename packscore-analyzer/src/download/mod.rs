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

//! Source acquisition.
//!
//! Downloaders are tried in strict order: source-host tarball, plain git
//! clone, registry tarball. A candidate whose upstream resource is gone
//! (`Unavailable`) yields to the next one; an analysis can proceed on an
//! empty working directory when every candidate is gone. Size and file-count
//! limits are hard: exceeding either is `Unrecoverable`.

mod git;
mod registry_tarball;
mod source_host;
mod untar;

use std::path::Path;

use async_trait::async_trait;
use packscore_common::{AnalyzerError, AnalyzerErrorKind, AnalyzerResult};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
pub use untar::extract_tar_gz;

use crate::manifest::{merge_manifests, Manifest};

/// Hard caps on what a package is allowed to ship.
#[derive(Debug, Clone, Copy)]
pub struct DownloadLimits {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for DownloadLimits {
    fn default() -> Self {
        Self {
            max_bytes: 250 * 1024 * 1024,
            max_files: 32_000,
        }
    }
}

/// Acquires the package sources into a working directory and returns the
/// merged manifest (published over downloaded).
#[async_trait]
pub trait PackageDownloader: Send + Sync + 'static {
    async fn download(
        &self,
        package_data: &JsonValue,
        manifest: &Manifest,
        dest: &Path,
    ) -> AnalyzerResult<Manifest>;
}

/// The production downloader chain.
pub struct ChainDownloader {
    client: reqwest::Client,
    limits: DownloadLimits,
}

impl ChainDownloader {
    pub fn new(client: reqwest::Client, limits: DownloadLimits) -> Self {
        Self { client, limits }
    }

    async fn fetch_sources(&self, manifest: &Manifest, dest: &Path) -> AnalyzerResult<()> {
        let mut unavailable: Vec<&str> = Vec::new();
        if source_host::applicable(manifest) {
            match source_host::download(&self.client, manifest, dest, self.limits).await {
                Ok(()) => return Ok(()),
                Err(error) if error.kind() == AnalyzerErrorKind::Unavailable => {
                    debug!(name = %manifest.name, err = %error, "source-host tarball unavailable");
                    unavailable.push("source-host tarball");
                }
                Err(error) => return Err(error),
            }
        }
        if git::applicable(manifest) {
            match git::download(manifest, dest, self.limits).await {
                Ok(()) => return Ok(()),
                Err(error) if error.kind() == AnalyzerErrorKind::Unavailable => {
                    debug!(name = %manifest.name, err = %error, "git clone unavailable");
                    unavailable.push("git clone");
                }
                Err(error) => return Err(error),
            }
        }
        if registry_tarball::applicable(manifest) {
            match registry_tarball::download(&self.client, manifest, dest, self.limits).await {
                Ok(()) => return Ok(()),
                Err(error) if error.kind() == AnalyzerErrorKind::Unavailable => {
                    debug!(name = %manifest.name, err = %error, "registry tarball unavailable");
                    unavailable.push("registry tarball");
                }
                Err(error) => return Err(error),
            }
        }
        // Every candidate was gone upstream: analyze what the registry
        // document alone gives us.
        warn!(
            name = %manifest.name,
            attempted = ?unavailable,
            "no downloadable sources, proceeding with an empty working directory"
        );
        Ok(())
    }

    async fn read_downloaded_manifest(dest: &Path) -> AnalyzerResult<Option<Manifest>> {
        let manifest_path = dest.join("package.json");
        let manifest_bytes = match tokio::fs::read(&manifest_path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(AnalyzerErrorKind::Transient
                    .with_error(anyhow::Error::from(error).context("reading downloaded manifest")))
            }
        };
        let manifest = serde_json::from_slice(&manifest_bytes).map_err(|parse_error| {
            AnalyzerErrorKind::Unrecoverable.with_error(
                anyhow::Error::from(parse_error).context("downloaded manifest is not valid JSON"),
            )
        })?;
        Ok(Some(manifest))
    }
}

#[async_trait]
impl PackageDownloader for ChainDownloader {
    async fn download(
        &self,
        _package_data: &JsonValue,
        manifest: &Manifest,
        dest: &Path,
    ) -> AnalyzerResult<Manifest> {
        self.fetch_sources(manifest, dest).await?;
        let downloaded = Self::read_downloaded_manifest(dest).await?.unwrap_or_default();
        let merged = merge_manifests(manifest, &downloaded);
        let merged_json = serde_json::to_vec_pretty(&merged)
            .expect("a manifest is always serializable");
        tokio::fs::write(dest.join("package.json"), merged_json)
            .await
            .map_err(|write_error| {
                AnalyzerErrorKind::Transient
                    .with_error(anyhow::Error::from(write_error).context("writing merged manifest"))
            })?;
        debug!(name = %manifest.name, dest = %dest.display(), "sources ready");
        Ok(merged)
    }
}

pub(crate) fn oversize_error(what: &str, actual: u64, limit: u64) -> AnalyzerError {
    AnalyzerErrorKind::Unrecoverable.with_error(anyhow::anyhow!(
        "{what} is {} which exceeds the {} limit",
        bytesize::ByteSize(actual),
        bytesize::ByteSize(limit)
    ))
}

pub(crate) fn too_many_files_error(count: usize, limit: usize) -> AnalyzerError {
    AnalyzerErrorKind::Unrecoverable.with_error(anyhow::anyhow!(
        "archive carries more than {limit} files (saw {count})"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;

    #[tokio::test]
    async fn test_merged_manifest_written_back() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        tokio::fs::write(
            temp_dir.path().join("package.json"),
            r#"{"name": "pkg-a", "homepage": "https://acme.io"}"#,
        )
        .await?;
        let downloader =
            ChainDownloader::new(reqwest::Client::new(), DownloadLimits::default());
        let published = Manifest {
            name: "pkg-a".to_string(),
            version: Some("1.0.0".to_string()),
            ..Default::default()
        };
        // No repository and no dist tarball: nothing to fetch, the manifest
        // merge still runs.
        let merged = downloader
            .download(&serde_json::json!({}), &published, temp_dir.path())
            .await
            .unwrap();
        assert_eq!(merged.version.as_deref(), Some("1.0.0"));
        assert_eq!(merged.homepage.as_deref(), Some("https://acme.io"));
        let written = tokio::fs::read_to_string(temp_dir.path().join("package.json")).await?;
        assert!(written.contains("\"version\": \"1.0.0\""));
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_downloaded_manifest_is_unrecoverable() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        tokio::fs::write(temp_dir.path().join("package.json"), b"{not json").await?;
        let downloader =
            ChainDownloader::new(reqwest::Client::new(), DownloadLimits::default());
        let published = Manifest {
            name: "pkg-a".to_string(),
            ..Default::default()
        };
        let error = downloader
            .download(&serde_json::json!({}), &published, temp_dir.path())
            .await
            .unwrap_err();
        assert!(error.is_unrecoverable());
        Ok(())
    }
}
