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

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::Retryable;

/// Analysis error kind.
///
/// This is the contract-level classification every component maps its own
/// failures into before they reach the orchestrator.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalyzerErrorKind {
    /// Network blip, HTTP 5xx/429, broker disconnect, store conflict.
    /// Retried with backoff, bounded attempts.
    Transient,
    /// The upstream resource is gone (404/400/403/451, store NotFound).
    /// Collectors surface this as an absent sub-record.
    Unavailable,
    /// Malformed manifest, download over limits, package missing upstream.
    /// Fails the analysis immediately and records a degraded document.
    Unrecoverable,
    /// Broker blocked the connection or cancelled the consumer. Destroys the
    /// component and raises to process level.
    Fatal,
}

impl AnalyzerErrorKind {
    /// Creates an AnalyzerError.
    pub fn with_error<E>(self, source: E) -> AnalyzerError
    where anyhow::Error: From<E> {
        AnalyzerError {
            kind: self,
            source: From::from(source),
        }
    }
}

/// Generic analysis error.
#[derive(Error, Debug)]
#[error("AnalyzerError(kind={kind:?}, source={source})")]
pub struct AnalyzerError {
    pub kind: AnalyzerErrorKind,
    #[source]
    source: anyhow::Error,
}

/// Generic Result type for pipeline operations.
pub type AnalyzerResult<T> = Result<T, AnalyzerError>;

impl AnalyzerError {
    /// Add some context to the wrapped error.
    pub fn add_context<C>(self, ctx: C) -> Self
    where C: fmt::Display + Send + Sync + 'static {
        AnalyzerError {
            kind: self.kind,
            source: self.source.context(ctx),
        }
    }

    /// Returns the corresponding `AnalyzerErrorKind` for this error.
    pub fn kind(&self) -> AnalyzerErrorKind {
        self.kind
    }

    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self.kind,
            AnalyzerErrorKind::Unrecoverable | AnalyzerErrorKind::Fatal
        )
    }

    /// Message suitable for persistence in a degraded analysis document.
    pub fn message(&self) -> String {
        self.source.to_string()
    }
}

impl Retryable for AnalyzerError {
    fn is_retryable(&self) -> bool {
        self.kind == AnalyzerErrorKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        let transient = AnalyzerErrorKind::Transient.with_error(anyhow::anyhow!("socket reset"));
        assert!(transient.is_retryable());
        assert!(!transient.is_unrecoverable());

        let unrecoverable =
            AnalyzerErrorKind::Unrecoverable.with_error(anyhow::anyhow!("download too large"));
        assert!(!unrecoverable.is_retryable());
        assert!(unrecoverable.is_unrecoverable());

        let fatal = AnalyzerErrorKind::Fatal.with_error(anyhow::anyhow!("consumer cancelled"));
        assert!(fatal.is_unrecoverable());
    }

    #[test]
    fn test_error_kind_serializes_as_screaming_snake_case() {
        let kind_json = serde_json::to_string(&AnalyzerErrorKind::Unrecoverable).unwrap();
        assert_eq!(kind_json, "\"UNRECOVERABLE\"");
    }

    #[test]
    fn test_error_context_preserves_kind() {
        let error = AnalyzerErrorKind::Transient
            .with_error(anyhow::anyhow!("timed out"))
            .add_context("fetching downloads");
        assert_eq!(error.kind(), AnalyzerErrorKind::Transient);
        assert!(error.message().contains("fetching downloads"));
    }
}
