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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message priority. Realtime work preempts stale re-analysis.
pub const PRIORITY_STALE: u8 = 0;
pub const PRIORITY_REALTIME: u8 = 1;
pub const MAX_PRIORITY: u8 = PRIORITY_REALTIME;

/// The JSON payload carried by every work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub name: String,
    pub pushed_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub priority: u8,
}

impl Envelope {
    pub fn new<S: Into<String>>(name: S, priority: u8) -> Self {
        Self {
            name: name.into(),
            pushed_at: Utc::now(),
            retry_count: 0,
            priority,
        }
    }
}

/// What the consumer does with a failed delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStep {
    /// Republish this updated envelope at the tail, then ack the original.
    /// Republish-before-ack keeps the message owned by the broker at every
    /// instant, so a crash in between duplicates instead of losing it.
    Republish(Envelope),
    /// Retries exhausted: invoke the dead-letter callback and
    /// nack-without-requeue.
    DeadLetter,
}

/// Decides the fate of a failed delivery.
///
/// Retrying republishes at the tail rather than nack-requeueing at the head,
/// so a package that keeps failing cannot hold up the rest of the queue.
pub fn decide_retry(envelope: &Envelope, max_retries: u32) -> RetryStep {
    if envelope.retry_count >= max_retries {
        return RetryStep::DeadLetter;
    }
    let mut requeued = envelope.clone();
    requeued.retry_count += 1;
    RetryStep::Republish(requeued)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decide_retry_increments_until_exhausted() {
        let envelope = Envelope::new("lodash", PRIORITY_REALTIME);
        let mut current = envelope.clone();
        for expected_retry_count in 1..=5u32 {
            match decide_retry(&current, 5) {
                RetryStep::Republish(requeued) => {
                    assert_eq!(requeued.retry_count, expected_retry_count);
                    assert_eq!(requeued.name, "lodash");
                    assert_eq!(requeued.priority, PRIORITY_REALTIME);
                    current = requeued;
                }
                RetryStep::DeadLetter => panic!("dead-lettered too early"),
            }
        }
        assert_eq!(decide_retry(&current, 5), RetryStep::DeadLetter);
    }

    #[test]
    fn test_zero_max_retries_dead_letters_immediately() {
        let envelope = Envelope::new("lodash", PRIORITY_STALE);
        assert_eq!(decide_retry(&envelope, 0), RetryStep::DeadLetter);
    }

    #[test]
    fn test_envelope_json_shape() {
        let envelope = Envelope::new("lodash", PRIORITY_REALTIME);
        let envelope_json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(envelope_json["name"], "lodash");
        assert_eq!(envelope_json["priority"], 1);
        assert_eq!(envelope_json["retry_count"], 0);
        assert!(envelope_json["pushed_at"].is_string());
    }
}
