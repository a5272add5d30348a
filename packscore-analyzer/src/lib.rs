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

//! The analysis pipeline: manifest handling, downloader, collectors,
//! evaluators, and the per-package orchestrator.

pub mod analyze;
pub mod collect;
pub mod compact;
pub mod download;
pub mod evaluate;
pub mod manifest;
pub mod metrics;

pub use analyze::{AnalysisDocument, Analyzer, RecordedError};
use packscore_common::{AnalyzerError, AnalyzerErrorKind};
use packscore_docstore::{DocstoreError, DocstoreErrorKind};
use packscore_registry::{RegistryError, RegistryErrorKind};

/// Key namespace of analysis documents.
pub const ANALYSIS_KEY_PREFIX: &str = "analysis!";

pub fn analysis_key(name: &str) -> String {
    format!("{ANALYSIS_KEY_PREFIX}{name}")
}

/// The package name behind an analysis key, if it is one.
pub fn name_from_analysis_key(key: &str) -> Option<&str> {
    key.strip_prefix(ANALYSIS_KEY_PREFIX)
}

pub(crate) fn registry_error(error: RegistryError) -> AnalyzerError {
    let kind = match error.kind() {
        RegistryErrorKind::NotFound => AnalyzerErrorKind::Unavailable,
        RegistryErrorKind::Transient => AnalyzerErrorKind::Transient,
        RegistryErrorKind::Fatal => AnalyzerErrorKind::Unrecoverable,
    };
    kind.with_error(error)
}

pub(crate) fn docstore_error(error: DocstoreError) -> AnalyzerError {
    let kind = match error.kind() {
        DocstoreErrorKind::NotFound => AnalyzerErrorKind::Unavailable,
        DocstoreErrorKind::Conflict | DocstoreErrorKind::Transient => AnalyzerErrorKind::Transient,
        DocstoreErrorKind::Fatal => AnalyzerErrorKind::Unrecoverable,
    };
    kind.with_error(error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_key_round_trip() {
        assert_eq!(analysis_key("@types/node"), "analysis!@types/node");
        assert_eq!(
            name_from_analysis_key("analysis!@types/node"),
            Some("@types/node")
        );
        assert_eq!(name_from_analysis_key("obs!lodash"), None);
    }
}
