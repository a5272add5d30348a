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

/// Search index error kind.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum IndexErrorKind {
    /// The target index or alias does not exist.
    NotFound,
    /// Network blip or server-side 5xx/429.
    Transient,
    /// Any non-recoverable adapter error.
    Fatal,
}

impl IndexErrorKind {
    /// Creates an IndexError.
    pub fn with_error<E>(self, source: E) -> IndexError
    where anyhow::Error: From<E> {
        IndexError {
            kind: self,
            source: From::from(source),
        }
    }
}

/// Generic search index error.
#[derive(Error, Debug)]
#[error("IndexError(kind={kind:?}, source={source})")]
pub struct IndexError {
    pub kind: IndexErrorKind,
    #[source]
    source: anyhow::Error,
}

/// Generic Result type for search index operations.
pub type IndexResult<T> = Result<T, IndexError>;

impl IndexError {
    /// Add some context to the wrapped error.
    pub fn add_context<C>(self, ctx: C) -> Self
    where C: fmt::Display + Send + Sync + 'static {
        IndexError {
            kind: self.kind,
            source: self.source.context(ctx),
        }
    }

    /// Returns the corresponding `IndexErrorKind` for this error.
    pub fn kind(&self) -> IndexErrorKind {
        self.kind
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == IndexErrorKind::NotFound
    }
}

impl Retryable for IndexError {
    fn is_retryable(&self) -> bool {
        self.kind == IndexErrorKind::Transient
    }
}

impl From<reqwest::Error> for IndexError {
    fn from(error: reqwest::Error) -> IndexError {
        let kind = match error.status() {
            Some(status) if status.as_u16() == 404 => IndexErrorKind::NotFound,
            Some(status) if status.is_server_error() || status.as_u16() == 429 => {
                IndexErrorKind::Transient
            }
            Some(_) => IndexErrorKind::Fatal,
            None => IndexErrorKind::Transient,
        };
        kind.with_error(error)
    }
}
