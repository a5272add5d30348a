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

use std::sync::Arc;

use tokio::sync::watch;
use tracing::warn;

/// Cooperative cancellation token shared by the long-lived loops (observers,
/// consumer, scoring cycle).
///
/// A killed switch stays killed. Suspended operations observe cancellation
/// via [`KillSwitch::killed`] in a `tokio::select!` arm and return without
/// advancing their checkpoint.
#[derive(Clone)]
pub struct KillSwitch {
    alive_tx: Arc<watch::Sender<bool>>,
    alive_rx: watch::Receiver<bool>,
}

impl Default for KillSwitch {
    fn default() -> Self {
        let (alive_tx, alive_rx) = watch::channel(true);
        KillSwitch {
            alive_tx: Arc::new(alive_tx),
            alive_rx,
        }
    }
}

impl KillSwitch {
    pub fn kill(&self) {
        warn!("kill switch activated");
        let _ = self.alive_tx.send(false);
    }

    pub fn is_alive(&self) -> bool {
        *self.alive_rx.borrow()
    }

    pub fn is_dead(&self) -> bool {
        !self.is_alive()
    }

    /// Resolves once the switch is killed. Never resolves otherwise.
    pub async fn killed(&self) {
        let mut alive_rx = self.alive_rx.clone();
        while *alive_rx.borrow() {
            if alive_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::KillSwitch;

    #[test]
    fn test_kill_switch() {
        let kill_switch = KillSwitch::default();
        assert!(kill_switch.is_alive());
        assert!(!kill_switch.is_dead());
        kill_switch.kill();
        assert!(!kill_switch.is_alive());
        assert!(kill_switch.is_dead());
        kill_switch.kill();
        assert!(kill_switch.is_dead());
    }

    #[tokio::test]
    async fn test_killed_resolves_after_kill() {
        let kill_switch = KillSwitch::default();
        let waiter = kill_switch.clone();
        let join_handle = tokio::spawn(async move {
            waiter.killed().await;
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!join_handle.is_finished());
        kill_switch.kill();
        tokio::time::timeout(Duration::from_secs(1), join_handle)
            .await
            .unwrap()
            .unwrap();
    }
}
