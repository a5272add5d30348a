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

/// Work queue error kind.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum QueueErrorKind {
    /// Broker connection or channel hiccup; the supervisor reconnects.
    Transient,
    /// The broker blocked the connection or cancelled the consumer. The
    /// instance is dead and must not be reused.
    Fatal,
}

impl QueueErrorKind {
    /// Creates a QueueError.
    pub fn with_error<E>(self, source: E) -> QueueError
    where anyhow::Error: From<E> {
        QueueError {
            kind: self,
            source: From::from(source),
        }
    }
}

/// Generic work queue error.
#[derive(Error, Debug)]
#[error("QueueError(kind={kind:?}, source={source})")]
pub struct QueueError {
    pub kind: QueueErrorKind,
    #[source]
    source: anyhow::Error,
}

/// Generic Result type for work queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

impl QueueError {
    /// Add some context to the wrapped error.
    pub fn add_context<C>(self, ctx: C) -> Self
    where C: fmt::Display + Send + Sync + 'static {
        QueueError {
            kind: self.kind,
            source: self.source.context(ctx),
        }
    }

    /// Returns the corresponding `QueueErrorKind` for this error.
    pub fn kind(&self) -> QueueErrorKind {
        self.kind
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == QueueErrorKind::Fatal
    }
}

impl Retryable for QueueError {
    fn is_retryable(&self) -> bool {
        self.kind == QueueErrorKind::Transient
    }
}
