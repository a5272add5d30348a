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

//! Durable work queue.
//!
//! Observers push package names; analyzer workers consume them with
//! at-least-once delivery. Consumers must tolerate duplicates. Failed
//! deliveries are republished at the tail with an incremented retry count;
//! once the retry budget is spent the message is dead-lettered through a
//! callback that records a failed analysis.

mod amqp;
mod envelope;
mod error;
#[cfg(any(test, feature = "testsuite"))]
mod mem;

use std::sync::Arc;

pub use amqp::AmqpWorkQueue;
use async_trait::async_trait;
pub use envelope::{
    decide_retry, Envelope, RetryStep, MAX_PRIORITY, PRIORITY_REALTIME, PRIORITY_STALE,
};
pub use error::{QueueError, QueueErrorKind, QueueResult};
#[cfg(any(test, feature = "testsuite"))]
pub use mem::MemWorkQueue;

/// Producer side of the queue; all the observers need.
#[async_trait]
pub trait Enqueuer: Send + Sync + 'static {
    /// Publishes `name` for analysis. At-least-once: duplicates are
    /// possible, loss is not (the call returns after broker confirm).
    async fn push(&self, name: &str, priority: u8) -> QueueResult<()>;
}

/// Processes one delivery. Returning an error triggers the retry path.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()>;
}

/// Invoked exactly once per message whose retry budget is exhausted.
#[async_trait]
pub trait DeadLetterHandler: Send + Sync + 'static {
    async fn on_retries_exceeded(&self, envelope: &Envelope, error: &anyhow::Error);
}

#[derive(Clone)]
pub struct ConsumeOptions {
    /// Parallel handler invocations; also the broker prefetch.
    pub concurrency: usize,
    pub max_retries: u32,
    /// Observed on every supervised reconnection, with the attempt count.
    pub on_reconnect: Option<Arc<dyn Fn(u32) + Send + Sync>>,
}

impl ConsumeOptions {
    pub fn new(concurrency: usize, max_retries: u32) -> Self {
        Self {
            concurrency,
            max_retries,
            on_reconnect: None,
        }
    }
}
