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

/// The fallback for packages without a usable repository: the published
/// tarball itself.
pub fn applicable(manifest: &Manifest) -> bool {
    manifest
        .dist
        .as_ref()
        .and_then(|dist| dist.tarball.as_ref())
        .is_some()
}

pub async fn download(
    client: &reqwest::Client,
    manifest: &Manifest,
    dest: &Path,
    limits: DownloadLimits,
) -> AnalyzerResult<()> {
    let tarball_url = manifest
        .dist
        .as_ref()
        .and_then(|dist| dist.tarball.clone())
        .expect("caller checked applicability");
    debug!(name = %manifest.name, url = %tarball_url, "downloading registry tarball");
    fetch_and_extract(client, &tarball_url, None, dest, limits).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Dist;

    #[test]
    fn test_applicable_requires_dist_tarball() {
        let manifest = Manifest {
            dist: Some(Dist {
                tarball: Some("https://registry.npmjs.org/pkg-a/-/pkg-a-1.0.0.tgz".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(applicable(&manifest));
        assert!(!applicable(&Manifest::default()));
    }
}
