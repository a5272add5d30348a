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

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::unit;
use crate::collect::Collected;

/// Readme bytes at which documentation stops earning extra credit.
const README_SATURATION_BYTES: f64 = 1_000.0;
/// Test-directory bytes treated as a full test suite.
const TESTS_SATURATION_BYTES: f64 = 5_000.0;
const BADGES_SATURATION: f64 = 4.0;
/// A deprecated package keeps only this fraction of its carefulness.
const DEPRECATION_PENALTY: f64 = 0.3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityEvaluation {
    pub carefulness: f64,
    pub tests: f64,
    pub health: f64,
    pub branding: f64,
}

fn score_if(condition: bool) -> f64 {
    if condition {
        1.0
    } else {
        0.0
    }
}

pub fn evaluate_quality(collected: &Collected) -> QualityEvaluation {
    let metadata = &collected.metadata;
    let source_code = collected.source_code.as_ref();

    let license_score = score_if(metadata.license.is_some());
    let readme_score = unit(
        source_code.map(|info| info.readme_size as f64).unwrap_or(0.0),
        README_SATURATION_BYTES,
    );
    let lint_score = score_if(source_code.map(|info| !info.linters.is_empty()).unwrap_or(false));
    let ignore_score = score_if(
        source_code
            .map(|info| info.has_npm_ignore || info.has_shrinkwrap)
            .unwrap_or(false),
    );
    let mut carefulness =
        0.33 * license_score + 0.38 * readme_score + 0.13 * lint_score + 0.16 * ignore_score;
    if metadata.deprecated.is_some() {
        carefulness *= DEPRECATION_PENALTY;
    }

    let test_size_score = unit(
        source_code.map(|info| info.test_size as f64).unwrap_or(0.0),
        TESTS_SATURATION_BYTES,
    );
    let test_presence = if metadata.has_test_script {
        0.5 + 0.5 * test_size_score
    } else {
        0.5 * test_size_score
    };
    let coverage_score = source_code.and_then(|info| info.coverage).unwrap_or(0.0);
    let tests = 0.6 * test_presence + 0.4 * coverage_score;

    let health = source_code
        .map(|info| {
            0.6 * scanner_score(info.vulnerabilities.as_ref())
                + 0.4 * scanner_score(info.outdated_dependencies.as_ref())
        })
        .unwrap_or(0.0);

    let badges_score = unit(
        source_code.map(|info| info.badges.len() as f64).unwrap_or(0.0),
        BADGES_SATURATION,
    );
    let homepage_score = score_if(metadata.links.homepage.is_some());
    let branding = 0.5 * badges_score + 0.5 * homepage_score;

    QualityEvaluation {
        carefulness,
        tests,
        health,
        branding,
    }
}

/// Finding counts decay the score hyperbolically; a broken scanner (`false`)
/// earns nothing; an absent report is neutral.
fn scanner_score(report: Option<&JsonValue>) -> f64 {
    match report {
        None => 1.0,
        Some(JsonValue::Bool(false)) => 0.0,
        Some(report) => {
            let findings = report.as_u64().unwrap_or(0) as f64;
            1.0 / (1.0 + findings)
        }
        // Unreachable with the current collector, kept total on purpose.
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::collect::{Metadata, SourceCodeInfo};

    fn collected_with_source_code(source_code: SourceCodeInfo) -> Collected {
        Collected {
            metadata: Metadata {
                license: Some("MIT".to_string()),
                ..Default::default()
            },
            source_code: Some(source_code),
            ..Default::default()
        }
    }

    #[test]
    fn test_deprecation_penalizes_carefulness() {
        let mut collected = collected_with_source_code(SourceCodeInfo {
            readme_size: 5_000,
            ..Default::default()
        });
        let healthy_carefulness = evaluate_quality(&collected).carefulness;
        collected.metadata.deprecated = Some("use pkg-b instead".to_string());
        let deprecated_carefulness = evaluate_quality(&collected).carefulness;
        assert!(deprecated_carefulness < healthy_carefulness);
        assert!((deprecated_carefulness - healthy_carefulness * 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_vulnerabilities_decay_health() {
        let clean = collected_with_source_code(SourceCodeInfo {
            vulnerabilities: Some(json!(0)),
            outdated_dependencies: Some(json!(0)),
            ..Default::default()
        });
        let vulnerable = collected_with_source_code(SourceCodeInfo {
            vulnerabilities: Some(json!(12)),
            outdated_dependencies: Some(json!(0)),
            ..Default::default()
        });
        let broken_scanner = collected_with_source_code(SourceCodeInfo {
            vulnerabilities: Some(json!(false)),
            outdated_dependencies: Some(json!(0)),
            ..Default::default()
        });
        let clean_health = evaluate_quality(&clean).health;
        let vulnerable_health = evaluate_quality(&vulnerable).health;
        let broken_health = evaluate_quality(&broken_scanner).health;
        assert!(clean_health > vulnerable_health);
        assert!(vulnerable_health > broken_health);
    }

    #[test]
    fn test_tests_weakly_increase_with_test_size() {
        let mut previous_tests_score = f64::MIN;
        for test_size in [0u64, 100, 1_000, 10_000, 1_000_000] {
            let collected = collected_with_source_code(SourceCodeInfo {
                test_size,
                ..Default::default()
            });
            let tests_score = evaluate_quality(&collected).tests;
            assert!(tests_score >= previous_tests_score);
            previous_tests_score = tests_score;
        }
    }
}
