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

/// Removes a directory and its contents, tolerating it already being gone.
pub async fn remove_dir_all_if_exists<P: AsRef<Path>>(path: P) -> anyhow::Result<()> {
    match tokio::fs::remove_dir_all(path.as_ref()).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}

/// Total size in bytes of the regular files under `path`, recursively.
///
/// Walks synchronously; callers on the async path wrap this in
/// `spawn_blocking`.
pub fn dir_size<P: AsRef<Path>>(path: P) -> anyhow::Result<u64> {
    let mut total_bytes = 0u64;
    for entry in walkdir::WalkDir::new(path.as_ref()) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total_bytes += entry.metadata()?.len();
        }
    }
    Ok(total_bytes)
}

/// Size in bytes of a single file, `None` when it does not exist.
pub async fn file_size_opt<P: AsRef<Path>>(path: P) -> Option<u64> {
    tokio::fs::metadata(path.as_ref())
        .await
        .ok()
        .filter(|metadata| metadata.is_file())
        .map(|metadata| metadata.len())
}
