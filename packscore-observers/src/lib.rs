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

//! Observers: the two feeders of the work queue.
//!
//! The realtime observer follows the registry change feed; the stale
//! observer periodically re-enqueues packages whose analysis aged past a
//! type-dependent threshold. Both checkpoint their progress in the document
//! store and both call a [`PackageHandler`] (in production: a queue push)
//! for every package they decide to notify.

pub mod realtime;
pub mod stale;

use async_trait::async_trait;

/// Key namespace of per-package observer checkpoints.
pub const OBS_KEY_PREFIX: &str = "obs!";
/// Singleton key of the realtime sequence checkpoint.
pub const REALTIME_SEQ_KEY: &str = "obs!realtime!last_followed_seq";

pub fn obs_key(name: &str) -> String {
    format!("{OBS_KEY_PREFIX}{name}")
}

/// What an observer does with a package it decided to notify. Returning an
/// error leaves the package's checkpoint untouched, so a later run retries.
#[async_trait]
pub trait PackageHandler: Send + Sync + 'static {
    async fn on_package(&self, name: &str) -> anyhow::Result<()>;
}

#[cfg(any(test, feature = "testsuite"))]
pub mod test_support {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::PackageHandler;

    /// Records every notified package; optionally fails a fixed set of
    /// names.
    #[derive(Default)]
    pub struct RecordingHandler {
        pub notified: Mutex<Vec<String>>,
        pub failing_names: Vec<String>,
    }

    #[async_trait]
    impl PackageHandler for RecordingHandler {
        async fn on_package(&self, name: &str) -> anyhow::Result<()> {
            self.notified.lock().unwrap().push(name.to_string());
            if self.failing_names.iter().any(|failing| failing == name) {
                anyhow::bail!("push failed for `{name}`");
            }
            Ok(())
        }
    }
}
