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

/// Registry error kind.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RegistryErrorKind {
    /// The package does not exist upstream (never published, or
    /// unpublished).
    NotFound,
    /// Network blip or server-side 5xx/429.
    Transient,
    /// Any non-recoverable adapter error.
    Fatal,
}

impl RegistryErrorKind {
    /// Creates a RegistryError.
    pub fn with_error<E>(self, source: E) -> RegistryError
    where anyhow::Error: From<E> {
        RegistryError {
            kind: self,
            source: From::from(source),
        }
    }
}

/// Generic registry error.
#[derive(Error, Debug)]
#[error("RegistryError(kind={kind:?}, source={source})")]
pub struct RegistryError {
    pub kind: RegistryErrorKind,
    #[source]
    source: anyhow::Error,
}

/// Generic Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

impl RegistryError {
    /// Add some context to the wrapped error.
    pub fn add_context<C>(self, ctx: C) -> Self
    where C: fmt::Display + Send + Sync + 'static {
        RegistryError {
            kind: self.kind,
            source: self.source.context(ctx),
        }
    }

    /// Returns the corresponding `RegistryErrorKind` for this error.
    pub fn kind(&self) -> RegistryErrorKind {
        self.kind
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == RegistryErrorKind::NotFound
    }
}

impl Retryable for RegistryError {
    fn is_retryable(&self) -> bool {
        self.kind == RegistryErrorKind::Transient
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(error: reqwest::Error) -> RegistryError {
        let kind = match error.status() {
            // 410 is how registries answer for unpublished packages.
            Some(status) if status.as_u16() == 404 || status.as_u16() == 410 => {
                RegistryErrorKind::NotFound
            }
            Some(status) if status.is_server_error() || status.as_u16() == 429 => {
                RegistryErrorKind::Transient
            }
            Some(_) => RegistryErrorKind::Fatal,
            None => RegistryErrorKind::Transient,
        };
        kind.with_error(error)
    }
}
