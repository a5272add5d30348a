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

use std::path::Path;

use packscore_common::AnalyzerResult;
use tracing::debug;

use super::untar::fetch_and_extract;
use super::DownloadLimits;
use crate::manifest::Manifest;

/// Applicable when the manifest's repository points at a supported source
/// host.
pub fn applicable(manifest: &Manifest) -> bool {
    manifest.source_host_slug().is_some()
}

/// Downloads the repository tarball straight from the source host. Pinned to
/// the published `gitHead` when the manifest carries one, the default branch
/// otherwise.
pub async fn download(
    client: &reqwest::Client,
    manifest: &Manifest,
    dest: &Path,
    limits: DownloadLimits,
) -> AnalyzerResult<()> {
    let (owner, repo) = manifest
        .source_host_slug()
        .expect("caller checked applicability");
    let git_ref = manifest.git_head.as_deref().unwrap_or("");
    let tarball_url = format!("https://codeload.github.com/{owner}/{repo}/tar.gz/{git_ref}");
    debug!(name = %manifest.name, url = %tarball_url, "downloading source-host tarball");
    fetch_and_extract(client, &tarball_url, None, dest, limits).await
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_applicable_requires_supported_host() {
        let github_manifest = Manifest {
            repository: Some(json!({"url": "git+https://github.com/acme/pkg.git"})),
            ..Default::default()
        };
        assert!(applicable(&github_manifest));

        let no_repo_manifest = Manifest::default();
        assert!(!applicable(&no_repo_manifest));

        let foreign_manifest = Manifest {
            repository: Some(json!("https://bitbucket.org/acme/pkg")),
            ..Default::default()
        };
        assert!(!applicable(&foreign_manifest));
    }
}
