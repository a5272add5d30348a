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

use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use futures::StreamExt;
use packscore_common::{AnalyzerErrorKind, AnalyzerResult};
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;

use super::{oversize_error, too_many_files_error, DownloadLimits};

/// Fetches `url` and extracts the gzipped tarball into `dest`.
///
/// The size limit is enforced twice: against the advertised content length
/// before the body is read, and against the actual byte count while
/// streaming (servers lie).
pub async fn fetch_and_extract(
    client: &reqwest::Client,
    url: &str,
    bearer_token: Option<&str>,
    dest: &Path,
    limits: DownloadLimits,
) -> AnalyzerResult<()> {
    let mut request = client.get(url);
    if let Some(token) = bearer_token {
        request = request.bearer_auth(token);
    }
    let response = request.send().await.map_err(|transport_error| {
        AnalyzerErrorKind::Transient
            .with_error(anyhow::Error::from(transport_error).context("fetching tarball"))
    })?;
    let status = response.status();
    match status {
        status if status.is_success() => {}
        StatusCode::BAD_REQUEST
        | StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND
        | StatusCode::GONE
        | StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS => {
            return Err(AnalyzerErrorKind::Unavailable
                .with_error(anyhow::anyhow!("tarball gone ({status}) at {url}")));
        }
        _ => {
            return Err(AnalyzerErrorKind::Transient
                .with_error(anyhow::anyhow!("tarball fetch failed ({status}) at {url}")));
        }
    }
    if let Some(content_length) = response.content_length() {
        if content_length > limits.max_bytes {
            return Err(oversize_error("tarball", content_length, limits.max_bytes));
        }
    }

    let tarball_path = dest.join(".download.tgz");
    let mut tarball_file = tokio::fs::File::create(&tarball_path)
        .await
        .map_err(io_transient)?;
    let mut body = response.bytes_stream();
    let mut downloaded_bytes = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|stream_error| {
            AnalyzerErrorKind::Transient
                .with_error(anyhow::Error::from(stream_error).context("streaming tarball"))
        })?;
        downloaded_bytes += chunk.len() as u64;
        if downloaded_bytes > limits.max_bytes {
            return Err(oversize_error("tarball", downloaded_bytes, limits.max_bytes));
        }
        tarball_file.write_all(&chunk).await.map_err(io_transient)?;
    }
    tarball_file.flush().await.map_err(io_transient)?;
    drop(tarball_file);

    let dest = dest.to_path_buf();
    let extract_result = tokio::task::spawn_blocking({
        let tarball_path = tarball_path.clone();
        move || extract_tar_gz(&tarball_path, &dest, limits)
    })
    .await
    .map_err(|join_error| {
        AnalyzerErrorKind::Transient
            .with_error(anyhow::Error::from(join_error).context("extraction task died"))
    })?;
    let _ = tokio::fs::remove_file(&tarball_path).await;
    extract_result
}

/// Extracts a `.tar.gz`, counting entries as it goes and aborting past the
/// file-count limit, stripping the archive's top-level directory.
pub fn extract_tar_gz(
    tarball_path: &Path,
    dest: &Path,
    limits: DownloadLimits,
) -> AnalyzerResult<()> {
    let tarball_file = File::open(tarball_path).map_err(io_transient)?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(tarball_file)));
    let mut num_entries = 0usize;
    let mut unpacked_bytes = 0u64;
    for entry in archive.entries().map_err(malformed_archive)? {
        let mut entry = entry.map_err(malformed_archive)?;
        num_entries += 1;
        if num_entries > limits.max_files {
            return Err(too_many_files_error(num_entries, limits.max_files));
        }
        unpacked_bytes += entry.size();
        if unpacked_bytes > limits.max_bytes {
            return Err(oversize_error("unpacked archive", unpacked_bytes, limits.max_bytes));
        }
        let Some(stripped_path) = strip_top_level(&entry.path().map_err(malformed_archive)?)
        else {
            continue;
        };
        entry
            .unpack(dest.join(stripped_path))
            .map_err(malformed_archive)?;
    }
    Ok(())
}

/// Drops the archive's top-level directory (`package/`, `owner-repo-sha/`)
/// and refuses entries that escape the destination.
fn strip_top_level(entry_path: &Path) -> Option<PathBuf> {
    let mut components = entry_path.components();
    components.next()?;
    let stripped: PathBuf = components.as_path().to_path_buf();
    if stripped.as_os_str().is_empty() {
        return None;
    }
    let is_escaping = stripped
        .components()
        .any(|component| !matches!(component, Component::Normal(_)));
    if is_escaping {
        return None;
    }
    Some(stripped)
}

fn io_transient(error: std::io::Error) -> packscore_common::AnalyzerError {
    AnalyzerErrorKind::Transient.with_error(anyhow::Error::from(error))
}

fn malformed_archive(error: std::io::Error) -> packscore_common::AnalyzerError {
    AnalyzerErrorKind::Unrecoverable
        .with_error(anyhow::Error::from(error).context("malformed archive"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::*;

    fn build_tarball(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut tar_builder = tar::Builder::new(Vec::new());
        for (path, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar_builder
                .append_data(&mut header, path, content.as_bytes())
                .unwrap();
        }
        let tar_bytes = tar_builder.into_inner().unwrap();
        let mut gz_encoder = GzEncoder::new(Vec::new(), Compression::default());
        gz_encoder.write_all(&tar_bytes).unwrap();
        gz_encoder.finish().unwrap()
    }

    fn write_tarball(dir: &Path, entries: &[(&str, &str)]) -> PathBuf {
        let tarball_path = dir.join("fixture.tgz");
        std::fs::write(&tarball_path, build_tarball(entries)).unwrap();
        tarball_path
    }

    #[test]
    fn test_extract_strips_top_level_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let tarball_path = write_tarball(
            temp_dir.path(),
            &[
                ("package/package.json", "{\"name\": \"pkg-a\"}"),
                ("package/lib/index.js", "module.exports = 1;"),
            ],
        );
        let dest = temp_dir.path().join("out");
        std::fs::create_dir(&dest).unwrap();
        extract_tar_gz(&tarball_path, &dest, DownloadLimits::default()).unwrap();
        assert!(dest.join("package.json").is_file());
        assert!(dest.join("lib/index.js").is_file());
        assert!(!dest.join("package").exists());
    }

    #[test]
    fn test_extract_aborts_past_max_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let tarball_path = write_tarball(
            temp_dir.path(),
            &[
                ("package/a", "a"),
                ("package/b", "b"),
                ("package/c", "c"),
            ],
        );
        let dest = temp_dir.path().join("out");
        std::fs::create_dir(&dest).unwrap();
        let limits = DownloadLimits {
            max_files: 2,
            ..Default::default()
        };
        let error = extract_tar_gz(&tarball_path, &dest, limits).unwrap_err();
        assert!(error.is_unrecoverable());
    }

    #[test]
    fn test_extract_aborts_past_max_bytes() {
        let temp_dir = tempfile::tempdir().unwrap();
        let big_content = "x".repeat(1024);
        let tarball_path =
            write_tarball(temp_dir.path(), &[("package/big", big_content.as_str())]);
        let dest = temp_dir.path().join("out");
        std::fs::create_dir(&dest).unwrap();
        let limits = DownloadLimits {
            max_bytes: 100,
            ..Default::default()
        };
        let error = extract_tar_gz(&tarball_path, &dest, limits).unwrap_err();
        assert!(error.is_unrecoverable());
    }

    #[test]
    fn test_strip_top_level_refuses_escapes() {
        assert_eq!(
            strip_top_level(Path::new("package/lib/a.js")),
            Some(PathBuf::from("lib/a.js"))
        );
        assert_eq!(strip_top_level(Path::new("package")), None);
        assert_eq!(strip_top_level(Path::new("package/../../etc/passwd")), None);
    }
}
