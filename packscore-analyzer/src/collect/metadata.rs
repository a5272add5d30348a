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

//! Metadata collector: everything derivable from the registry document and
//! the manifest alone.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use packscore_common::AnalyzerResult;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::manifest::Manifest;

/// Release-count windows, in days.
pub const RELEASE_RANGES_DAYS: [i64; 5] = [30, 90, 180, 365, 730];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Person {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Links {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub npm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bugs: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    /// Date of the latest release.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<Person>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub maintainers: Vec<Person>,
    #[serde(default)]
    pub links: Links,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_dependencies: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_dependencies: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub releases: Vec<CountRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<String>,
    #[serde(default, skip_serializing_if = "packscore_common::is_false")]
    pub has_test_script: bool,
    #[serde(default, skip_serializing_if = "packscore_common::is_false")]
    pub has_stable_version: bool,
}

pub fn collect(package_data: &JsonValue, manifest: &Manifest) -> AnalyzerResult<Metadata> {
    let release_dates = release_dates(package_data);
    let latest_release_date = release_dates.iter().max().copied();
    let has_stable_version = manifest
        .version
        .as_deref()
        .and_then(|version| semver::Version::parse(version).ok())
        .map(|version| version.major >= 1 && version.pre.is_empty())
        .unwrap_or(false);
    Ok(Metadata {
        name: manifest.name.clone(),
        scope: manifest.scope().map(str::to_string),
        version: manifest.version.clone(),
        description: manifest.description.clone(),
        keywords: manifest.keywords.clone(),
        date: latest_release_date,
        publisher: publisher(package_data, manifest),
        maintainers: maintainers(manifest),
        links: links(manifest),
        license: normalize_license(manifest),
        dependencies: manifest.dependencies.clone(),
        dev_dependencies: manifest.dev_dependencies.clone(),
        peer_dependencies: manifest.peer_dependencies.clone(),
        releases: release_ranges(&release_dates, Utc::now()),
        deprecated: manifest.deprecated.clone(),
        has_test_script: manifest.has_test_script(),
        has_stable_version,
    })
}

/// Release dates from the registry document's `time` map, ignoring the
/// `created`/`modified` bookkeeping entries.
fn release_dates(package_data: &JsonValue) -> Vec<DateTime<Utc>> {
    let Some(time_map) = package_data.get("time").and_then(JsonValue::as_object) else {
        return Vec::new();
    };
    time_map
        .iter()
        .filter(|(version, _)| *version != "created" && *version != "modified")
        .filter_map(|(_, date)| date.as_str())
        .filter_map(|date| DateTime::parse_from_rfc3339(date).ok())
        .map(|date| date.with_timezone(&Utc))
        .collect()
}

/// Buckets the release dates into the fixed windows. Every configured window
/// produces exactly one range, releases or not.
pub fn release_ranges(release_dates: &[DateTime<Utc>], now: DateTime<Utc>) -> Vec<CountRange> {
    RELEASE_RANGES_DAYS
        .iter()
        .map(|&days| {
            let from = now - Duration::days(days);
            let count = release_dates
                .iter()
                .filter(|&&date| date >= from && date <= now)
                .count() as u64;
            CountRange {
                from,
                to: now,
                count,
            }
        })
        .collect()
}

fn publisher(package_data: &JsonValue, manifest: &Manifest) -> Option<Person> {
    let latest_version = package_data
        .pointer("/dist-tags/latest")
        .and_then(JsonValue::as_str)?;
    let npm_user = package_data.pointer(&format!("/versions/{latest_version}/_npmUser"));
    match npm_user {
        Some(npm_user) => parse_person(npm_user),
        None => maintainers(manifest).into_iter().next(),
    }
}

fn maintainers(manifest: &Manifest) -> Vec<Person> {
    let Some(JsonValue::Array(raw_maintainers)) = &manifest.maintainers else {
        return Vec::new();
    };
    raw_maintainers.iter().filter_map(parse_person).collect()
}

/// Accepts both person shapes manifests use: `{name, email}` objects and
/// `"Name <email>"` strings.
fn parse_person(raw: &JsonValue) -> Option<Person> {
    match raw {
        JsonValue::Object(fields) => {
            let person = Person {
                name: fields.get("name").and_then(JsonValue::as_str).map(str::to_string),
                email: fields.get("email").and_then(JsonValue::as_str).map(str::to_string),
            };
            (person.name.is_some() || person.email.is_some()).then_some(person)
        }
        JsonValue::String(raw_string) => {
            static PERSON_RE: Lazy<Regex> =
                Lazy::new(|| Regex::new(r"^([^<(]+?)?\s*(?:<([^>]+)>)?\s*(?:\([^)]*\))?$").unwrap());
            let captures = PERSON_RE.captures(raw_string.trim())?;
            let person = Person {
                name: captures
                    .get(1)
                    .map(|name| name.as_str().trim().to_string())
                    .filter(|name| !name.is_empty()),
                email: captures.get(2).map(|email| email.as_str().trim().to_string()),
            };
            (person.name.is_some() || person.email.is_some()).then_some(person)
        }
        _ => None,
    }
}

fn links(manifest: &Manifest) -> Links {
    let repository = manifest.repository_url();
    let bugs = manifest
        .bugs
        .as_ref()
        .and_then(|bugs| match bugs {
            JsonValue::String(url) => Some(url.clone()),
            JsonValue::Object(fields) => fields
                .get("url")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            _ => None,
        })
        .or_else(|| {
            repository
                .as_ref()
                .filter(|url| url.contains("github.com"))
                .map(|url| format!("{url}/issues"))
        });
    Links {
        npm: Some(format!("https://www.npmjs.com/package/{}", manifest.name)),
        homepage: checked_link(manifest.homepage.clone()),
        repository,
        bugs: checked_link(bugs),
    }
}

/// Links that do not parse as URLs are broken and dropped.
fn checked_link(link: Option<String>) -> Option<String> {
    link.filter(|url| url::Url::parse(url).is_ok())
}

static SPDX_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9A-Za-z][0-9A-Za-z.+-]*$").unwrap());

/// Best-effort corrections for the license spellings found in the wild.
static LICENSE_CORRECTIONS: Lazy<BTreeMap<&'static str, &'static str>> = Lazy::new(|| {
    BTreeMap::from([
        ("mit/x11", "MIT"),
        ("mit license", "MIT"),
        ("the mit license", "MIT"),
        ("apache", "Apache-2.0"),
        ("apache 2", "Apache-2.0"),
        ("apache 2.0", "Apache-2.0"),
        ("apache-2", "Apache-2.0"),
        ("apache license", "Apache-2.0"),
        ("apache license 2.0", "Apache-2.0"),
        ("apache license, version 2.0", "Apache-2.0"),
        ("bsd", "BSD-2-Clause"),
        ("bsd-3", "BSD-3-Clause"),
        ("gpl", "GPL-3.0"),
        ("gpl3", "GPL-3.0"),
        ("gplv3", "GPL-3.0"),
        ("gpl-3", "GPL-3.0"),
        ("gpl2", "GPL-2.0"),
        ("gplv2", "GPL-2.0"),
        ("lgpl", "LGPL-3.0"),
        ("isc license", "ISC"),
        ("public domain", "Unlicense"),
        ("unlicense", "Unlicense"),
        ("wtfpl", "WTFPL"),
        ("mpl", "MPL-2.0"),
    ])
});

/// Normalizes whatever license declaration the manifest carries into an
/// SPDX-style identifier, or `None` when there is nothing usable.
pub fn normalize_license(manifest: &Manifest) -> Option<String> {
    let raw = manifest
        .license
        .clone()
        .or_else(|| manifest.licenses.clone())?;
    normalize_license_value(&raw)
}

fn normalize_license_value(raw: &JsonValue) -> Option<String> {
    match raw {
        JsonValue::String(license) => normalize_license_str(license),
        JsonValue::Object(fields) => fields
            .get("type")
            .or_else(|| fields.get("name"))
            .and_then(normalize_license_value),
        JsonValue::Array(licenses) => {
            let normalized: Vec<String> = licenses
                .iter()
                .filter_map(normalize_license_value)
                .collect();
            match normalized.len() {
                0 => None,
                1 => Some(normalized.into_iter().next().unwrap()),
                _ => Some(normalized.join(" OR ")),
            }
        }
        _ => None,
    }
}

fn normalize_license_str(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(corrected) = LICENSE_CORRECTIONS.get(trimmed.to_lowercase().as_str()) {
        return Some((*corrected).to_string());
    }
    if SPDX_ID_RE.is_match(trimmed) {
        return Some(trimmed.to_string());
    }
    // One more chance for spellings like `MIT License (see LICENSE)`.
    let without_suffix = trimmed
        .to_lowercase()
        .split(" (")
        .next()
        .unwrap_or_default()
        .to_string();
    LICENSE_CORRECTIONS
        .get(without_suffix.as_str())
        .map(|corrected| (*corrected).to_string())
}
