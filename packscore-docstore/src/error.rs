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

use packscore_common::retry::Retryable;
use thiserror::Error;

/// Document store error kind.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DocstoreErrorKind {
    /// The requested document does not exist.
    NotFound,
    /// The write carried a stale revision.
    Conflict,
    /// Network blip or server-side 5xx/429.
    Transient,
    /// Any non-recoverable adapter error.
    Fatal,
}

impl DocstoreErrorKind {
    /// Creates a DocstoreError.
    pub fn with_error<E>(self, source: E) -> DocstoreError
    where anyhow::Error: From<E> {
        DocstoreError {
            kind: self,
            source: From::from(source),
        }
    }
}

/// Generic document store error.
#[derive(Error, Debug)]
#[error("DocstoreError(kind={kind:?}, source={source})")]
pub struct DocstoreError {
    pub kind: DocstoreErrorKind,
    #[source]
    source: anyhow::Error,
}

/// Generic Result type for document store operations.
pub type DocstoreResult<T> = Result<T, DocstoreError>;

impl DocstoreError {
    /// Add some context to the wrapped error.
    pub fn add_context<C>(self, ctx: C) -> Self
    where C: fmt::Display + Send + Sync + 'static {
        DocstoreError {
            kind: self.kind,
            source: self.source.context(ctx),
        }
    }

    /// Returns the corresponding `DocstoreErrorKind` for this error.
    pub fn kind(&self) -> DocstoreErrorKind {
        self.kind
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == DocstoreErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == DocstoreErrorKind::Conflict
    }
}

impl Retryable for DocstoreError {
    fn is_retryable(&self) -> bool {
        self.kind == DocstoreErrorKind::Transient
    }
}

impl From<reqwest::Error> for DocstoreError {
    fn from(error: reqwest::Error) -> DocstoreError {
        let kind = match error.status() {
            Some(status) if status.as_u16() == 404 => DocstoreErrorKind::NotFound,
            Some(status) if status.as_u16() == 409 => DocstoreErrorKind::Conflict,
            Some(status) if status.is_server_error() || status.as_u16() == 429 => {
                DocstoreErrorKind::Transient
            }
            Some(_) => DocstoreErrorKind::Fatal,
            // Connect/timeout errors carry no status.
            None => DocstoreErrorKind::Transient,
        };
        kind.with_error(error)
    }
}
