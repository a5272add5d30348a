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

//! Source-code collector: what the working directory itself tells us.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use packscore_common::exec::{Exec, ExecError, ExecOutput};
use packscore_common::retry::{retry, RetryParams};
use packscore_common::{fs as common_fs, AnalyzerErrorKind, AnalyzerResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::manifest::Manifest;

const TEST_DIR_NAMES: [&str; 4] = ["test", "tests", "spec", "__tests__"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceCodeInfo {
    pub readme_size: u64,
    pub test_size: u64,
    #[serde(default, skip_serializing_if = "packscore_common::is_false")]
    pub has_npm_ignore: bool,
    #[serde(default, skip_serializing_if = "packscore_common::is_false")]
    pub has_shrinkwrap: bool,
    #[serde(default, skip_serializing_if = "packscore_common::is_false")]
    pub has_changelog: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub linters: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub badges: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
    /// Vulnerability count, or `false` when the scanner is broken for this
    /// package.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vulnerabilities: Option<JsonValue>,
    /// Outdated-dependency count, or `false` (same contract).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outdated_dependencies: Option<JsonValue>,
}

pub async fn collect(manifest: &Manifest, workdir: &Path) -> AnalyzerResult<SourceCodeInfo> {
    let file_info = {
        let workdir = workdir.to_path_buf();
        tokio::task::spawn_blocking(move || inspect_files(&workdir))
            .await
            .map_err(|join_error| {
                AnalyzerErrorKind::Transient.with_error(anyhow::Error::from(join_error))
            })?
    };
    let readme_content = read_readme(workdir).await;
    let badges = parse_badges(readme_content.as_deref().unwrap_or_default());
    let coverage = coverage_from_badges(&badges);
    let (vulnerabilities, outdated_dependencies) = tokio::join!(
        run_scanner("npm", &["audit", "--json"], workdir, parse_audit),
        run_scanner("npm", &["outdated", "--json"], workdir, parse_outdated),
    );
    debug!(name = %manifest.name, "source-code inspection done");
    Ok(SourceCodeInfo {
        readme_size: readme_content.map(|content| content.len() as u64).unwrap_or(0),
        test_size: file_info.test_size,
        has_npm_ignore: file_info.has_npm_ignore,
        has_shrinkwrap: file_info.has_shrinkwrap,
        has_changelog: file_info.has_changelog,
        linters: detect_linters(&file_info.root_files, manifest),
        badges,
        coverage,
        vulnerabilities: Some(vulnerabilities?),
        outdated_dependencies: Some(outdated_dependencies?),
    })
}

#[derive(Debug, Default)]
struct FileInfo {
    test_size: u64,
    has_npm_ignore: bool,
    has_shrinkwrap: bool,
    has_changelog: bool,
    root_files: Vec<String>,
}

fn inspect_files(workdir: &Path) -> FileInfo {
    let mut info = FileInfo::default();
    let Ok(entries) = std::fs::read_dir(workdir) else {
        return info;
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name().to_string_lossy().to_string();
        let lowered = file_name.to_lowercase();
        match lowered.as_str() {
            ".npmignore" => info.has_npm_ignore = true,
            "npm-shrinkwrap.json" | "package-lock.json" => info.has_shrinkwrap = true,
            _ => {}
        }
        if lowered.starts_with("changelog") {
            info.has_changelog = true;
        }
        if TEST_DIR_NAMES.contains(&lowered.as_str())
            && entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false)
        {
            info.test_size += common_fs::dir_size(entry.path()).unwrap_or(0);
        }
        info.root_files.push(file_name);
    }
    info
}

async fn read_readme(workdir: &Path) -> Option<String> {
    let entries = std::fs::read_dir(workdir).ok()?;
    let readme_path: Option<PathBuf> = entries
        .flatten()
        .find(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .to_lowercase()
                .starts_with("readme")
        })
        .map(|entry| entry.path());
    tokio::fs::read_to_string(readme_path?).await.ok()
}

static LINTER_FILES: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    vec![
        (".eslintrc", "eslint"),
        (".eslintrc.js", "eslint"),
        (".eslintrc.json", "eslint"),
        (".eslintrc.yml", "eslint"),
        (".jshintrc", "jshint"),
        (".jscsrc", "jscs"),
        ("tslint.json", "tslint"),
    ]
});

const LINTER_DEPS: [&str; 5] = ["eslint", "jshint", "jscs", "tslint", "standard"];

pub fn detect_linters(root_files: &[String], manifest: &Manifest) -> Vec<String> {
    let mut linters: Vec<String> = Vec::new();
    for (file_name, linter) in LINTER_FILES.iter() {
        if root_files.iter().any(|root_file| root_file == file_name) {
            linters.push((*linter).to_string());
        }
    }
    if let Some(dev_dependencies) = &manifest.dev_dependencies {
        for linter in LINTER_DEPS {
            if dev_dependencies.contains_key(linter) {
                linters.push(linter.to_string());
            }
        }
    }
    linters.sort();
    linters.dedup();
    linters
}

static BADGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://(?:img\.shields\.io|badge\.fury\.io|badges\.gitter\.im|travis-ci\.(?:org|com)|coveralls\.io|codecov\.io|circleci\.com|api\.codeclimate\.com)[^\s)\]]*").unwrap());

pub fn parse_badges(readme_content: &str) -> Vec<String> {
    BADGE_RE
        .find_iter(readme_content)
        .map(|badge| badge.as_str().to_string())
        .collect()
}

static COVERAGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"coverage[-/](\d{1,3})%").unwrap());

/// Coverage as a fraction when a badge advertises it.
pub fn coverage_from_badges(badges: &[String]) -> Option<f64> {
    badges.iter().find_map(|badge| {
        let captures = COVERAGE_RE.captures(badge)?;
        let percentage: f64 = captures.get(1)?.as_str().parse().ok()?;
        Some((percentage / 100.0).min(1.0))
    })
}

/// Runs one scanner with retry on transient failures.
///
/// Scanners routinely exit non-zero *with* a valid report on stdout (that is
/// how they signal findings), so the exit status alone is not a failure. A
/// scanner that cannot run at all for this package is recorded as `false`.
async fn run_scanner(
    program: &str,
    args: &[&str],
    workdir: &Path,
    parse: fn(&str) -> Option<JsonValue>,
) -> AnalyzerResult<JsonValue> {
    let exec = Exec::new(program).args(args.iter().copied()).current_dir(workdir);
    let scan_result: Result<ExecOutput, ExecError> =
        retry(&RetryParams::for_collection(), || exec.run()).await;
    match scan_result {
        Ok(output) => Ok(parse(&output.stdout).unwrap_or(json!(false))),
        Err(ExecError::NonZeroExit { stdout, .. }) => {
            Ok(parse(&stdout).unwrap_or(json!(false)))
        }
        Err(ExecError::Spawn { .. }) => Ok(json!(false)),
        Err(timeout_error @ ExecError::TimedOut { .. }) => Err(AnalyzerErrorKind::Transient
            .with_error(anyhow::Error::from(timeout_error).context("scanner timed out"))),
    }
}

/// Total finding count from an `npm audit --json` report.
pub fn parse_audit(stdout: &str) -> Option<JsonValue> {
    let report: JsonValue = serde_json::from_str(stdout).ok()?;
    let vulnerabilities = report.pointer("/metadata/vulnerabilities")?.as_object()?;
    let total: u64 = vulnerabilities
        .values()
        .filter_map(JsonValue::as_u64)
        .sum();
    Some(json!(total))
}

/// Outdated-dependency count from an `npm outdated --json` report. An empty
/// report means everything is current.
pub fn parse_outdated(stdout: &str) -> Option<JsonValue> {
    if stdout.trim().is_empty() {
        return Some(json!(0));
    }
    let report: JsonValue = serde_json::from_str(stdout).ok()?;
    Some(json!(report.as_object()?.len() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_badges_and_coverage() {
        let readme_content = r#"
# pkg-a
[![Build](https://travis-ci.org/acme/pkg-a.svg)](https://travis-ci.org/acme/pkg-a)
![Coverage](https://img.shields.io/badge/coverage-93%25-green.svg)
plain link: https://example.com/not-a-badge
"#;
        // The percent sign arrives url-encoded in real readmes too.
        let decoded = readme_content.replace("%25", "%");
        let badges = parse_badges(&decoded);
        assert_eq!(badges.len(), 3);
        assert_eq!(coverage_from_badges(&badges), Some(0.93));
    }

    #[test]
    fn test_detect_linters_from_files_and_deps() {
        let manifest = Manifest {
            dev_dependencies: Some(
                [("eslint".to_string(), "^8.0.0".to_string())].into_iter().collect(),
            ),
            ..Default::default()
        };
        let root_files = vec![".eslintrc.json".to_string(), "tslint.json".to_string()];
        assert_eq!(detect_linters(&root_files, &manifest), vec!["eslint", "tslint"]);
    }

    #[test]
    fn test_parse_audit_report() {
        let stdout = r#"{"metadata": {"vulnerabilities": {"info": 0, "low": 2, "high": 1}}}"#;
        assert_eq!(parse_audit(stdout), Some(json!(3)));
        assert_eq!(parse_audit("not json"), None);
    }

    #[test]
    fn test_parse_outdated_report() {
        assert_eq!(parse_outdated(""), Some(json!(0)));
        assert_eq!(
            parse_outdated(r#"{"lodash": {"current": "4.0.0", "latest": "4.17.21"}}"#),
            Some(json!(1))
        );
    }

    #[tokio::test]
    async fn test_inspect_files() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        tokio::fs::write(temp_dir.path().join(".npmignore"), b"dist\n").await?;
        tokio::fs::write(temp_dir.path().join("CHANGELOG.md"), b"# 1.0.0\n").await?;
        let test_dir = temp_dir.path().join("test");
        tokio::fs::create_dir(&test_dir).await?;
        tokio::fs::write(test_dir.join("index.test.js"), vec![0u8; 128]).await?;

        let info = inspect_files(temp_dir.path());
        assert!(info.has_npm_ignore);
        assert!(info.has_changelog);
        assert!(!info.has_shrinkwrap);
        assert_eq!(info.test_size, 128);
        Ok(())
    }
}
