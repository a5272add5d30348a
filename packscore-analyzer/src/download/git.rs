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
use std::time::Duration;

use packscore_common::exec::{Exec, ExecError};
use packscore_common::{fs as common_fs, AnalyzerErrorKind, AnalyzerResult};
use tracing::debug;

use super::{oversize_error, too_many_files_error, DownloadLimits};
use crate::manifest::Manifest;

const CLONE_TIMEOUT: Duration = Duration::from_secs(600);

/// Applicable for any repository the source-host tarball path did not cover.
pub fn applicable(manifest: &Manifest) -> bool {
    manifest.repository_url().is_some()
}

/// Shallow-clones the repository. The clone itself cannot enforce the
/// archive limits up front, so they are checked against the working tree
/// right after.
pub async fn download(
    manifest: &Manifest,
    dest: &Path,
    limits: DownloadLimits,
) -> AnalyzerResult<()> {
    let repository_url = manifest
        .repository_url()
        .expect("caller checked applicability");
    debug!(name = %manifest.name, url = %repository_url, "cloning repository");
    let clone_result = Exec::new("git")
        .args(["clone", "--quiet", "--depth", "1"])
        .arg(&repository_url)
        .arg(dest.to_string_lossy())
        .timeout(CLONE_TIMEOUT)
        .run()
        .await;
    match clone_result {
        Ok(_) => {}
        Err(ExecError::TimedOut { .. }) => {
            return Err(AnalyzerErrorKind::Transient
                .with_error(anyhow::anyhow!("git clone of {repository_url} timed out")));
        }
        // git exits non-zero for missing, private and empty repositories
        // alike.
        Err(ExecError::NonZeroExit { stderr, .. }) => {
            return Err(AnalyzerErrorKind::Unavailable
                .with_error(anyhow::anyhow!("git clone failed: {}", stderr.trim())));
        }
        Err(spawn_error) => {
            return Err(AnalyzerErrorKind::Transient.with_error(anyhow::Error::from(spawn_error)));
        }
    }
    common_fs::remove_dir_all_if_exists(dest.join(".git"))
        .await
        .map_err(|error| AnalyzerErrorKind::Transient.with_error(error))?;

    let dest_owned = dest.to_path_buf();
    let (num_files, total_bytes) = tokio::task::spawn_blocking(move || {
        let mut num_files = 0usize;
        let mut total_bytes = 0u64;
        for entry in walkdir_files(&dest_owned) {
            num_files += 1;
            total_bytes += entry;
        }
        (num_files, total_bytes)
    })
    .await
    .map_err(|join_error| AnalyzerErrorKind::Transient.with_error(anyhow::Error::from(join_error)))?;
    if num_files > limits.max_files {
        return Err(too_many_files_error(num_files, limits.max_files));
    }
    if total_bytes > limits.max_bytes {
        return Err(oversize_error("working tree", total_bytes, limits.max_bytes));
    }
    Ok(())
}

fn walkdir_files(root: &Path) -> impl Iterator<Item = u64> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok().map(|metadata| metadata.len()))
}
