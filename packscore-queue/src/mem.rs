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

//! In-memory queue for tests, reusing the production retry bookkeeping.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::envelope::{decide_retry, Envelope, RetryStep};
use crate::error::QueueResult;
use crate::{DeadLetterHandler, Enqueuer, MessageHandler};

#[derive(Default)]
pub struct MemWorkQueue {
    messages: Mutex<VecDeque<Envelope>>,
}

impl MemWorkQueue {
    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().unwrap().is_empty()
    }

    pub fn pushed(&self) -> Vec<Envelope> {
        self.messages.lock().unwrap().iter().cloned().collect()
    }

    /// Pops the next delivery: highest priority first, FIFO within a
    /// priority.
    fn pop_next(&self) -> Option<Envelope> {
        let mut messages = self.messages.lock().unwrap();
        let next_position = messages
            .iter()
            .enumerate()
            .max_by(|(left_position, left), (right_position, right)| {
                left.priority
                    .cmp(&right.priority)
                    // Earlier messages win ties.
                    .then(right_position.cmp(left_position))
            })
            .map(|(position, _)| position)?;
        messages.remove(next_position)
    }

    /// Single-consumer delivery loop draining the queue, applying the same
    /// retry/dead-letter bookkeeping as the production consumer. Returns the
    /// number of handler invocations.
    pub async fn drain(
        &self,
        handler: &dyn MessageHandler,
        dead_letter_handler: &dyn DeadLetterHandler,
        max_retries: u32,
    ) -> usize {
        let mut num_deliveries = 0;
        while let Some(envelope) = self.pop_next() {
            num_deliveries += 1;
            match handler.handle(&envelope).await {
                Ok(()) => {}
                Err(handler_error) => match decide_retry(&envelope, max_retries) {
                    RetryStep::Republish(requeued) => {
                        self.messages.lock().unwrap().push_back(requeued);
                    }
                    RetryStep::DeadLetter => {
                        dead_letter_handler
                            .on_retries_exceeded(&envelope, &handler_error)
                            .await;
                    }
                },
            }
        }
        num_deliveries
    }
}

#[async_trait]
impl Enqueuer for MemWorkQueue {
    async fn push(&self, name: &str, priority: u8) -> QueueResult<()> {
        self.messages
            .lock()
            .unwrap()
            .push_back(Envelope::new(name, priority));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::{PRIORITY_REALTIME, PRIORITY_STALE};

    #[derive(Default)]
    struct RecordingHandler {
        /// Fail the first `failures_left` deliveries of each name.
        failures_left: AtomicU32,
        handled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
            self.handled.lock().unwrap().push(envelope.name.clone());
            let failures_left = self.failures_left.load(Ordering::SeqCst);
            if failures_left > 0 {
                self.failures_left.store(failures_left - 1, Ordering::SeqCst);
                anyhow::bail!("simulated failure");
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingDeadLetter {
        dead_lettered: Mutex<Vec<Envelope>>,
    }

    #[async_trait]
    impl DeadLetterHandler for RecordingDeadLetter {
        async fn on_retries_exceeded(&self, envelope: &Envelope, _error: &anyhow::Error) {
            self.dead_lettered.lock().unwrap().push(envelope.clone());
        }
    }

    #[tokio::test]
    async fn test_priority_one_is_delivered_first() -> anyhow::Result<()> {
        let queue = MemWorkQueue::default();
        queue.push("stale-pkg", PRIORITY_STALE).await?;
        queue.push("realtime-pkg", PRIORITY_REALTIME).await?;

        let handler = RecordingHandler::default();
        let dead_letter = RecordingDeadLetter::default();
        queue.drain(&handler, &dead_letter, 5).await;

        let handled = handler.handled.lock().unwrap().clone();
        assert_eq!(handled, vec!["realtime-pkg", "stale-pkg"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_retries_then_success_is_one_clean_run() -> anyhow::Result<()> {
        let queue = MemWorkQueue::default();
        queue.push("flaky-pkg", PRIORITY_STALE).await?;

        let handler = RecordingHandler {
            failures_left: AtomicU32::new(3),
            ..Default::default()
        };
        let dead_letter = RecordingDeadLetter::default();
        let num_deliveries = queue.drain(&handler, &dead_letter, 5).await;

        // 3 failures + 1 success, no dead-letter, queue empty.
        assert_eq!(num_deliveries, 4);
        assert!(dead_letter.dead_lettered.lock().unwrap().is_empty());
        assert!(queue.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_retries_exceeded_dead_letters_exactly_once() -> anyhow::Result<()> {
        let queue = MemWorkQueue::default();
        queue.push("broken-pkg", PRIORITY_STALE).await?;

        let handler = RecordingHandler {
            failures_left: AtomicU32::new(u32::MAX),
            ..Default::default()
        };
        let dead_letter = RecordingDeadLetter::default();
        let num_deliveries = queue.drain(&handler, &dead_letter, 5).await;

        // Initial delivery + 5 retries, then exactly one dead-letter.
        assert_eq!(num_deliveries, 6);
        let dead_lettered = dead_letter.dead_lettered.lock().unwrap();
        assert_eq!(dead_lettered.len(), 1);
        assert_eq!(dead_lettered[0].name, "broken-pkg");
        assert_eq!(dead_lettered[0].retry_count, 5);
        Ok(())
    }
}
