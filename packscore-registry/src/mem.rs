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

//! Scriptable in-memory registry for tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value as JsonValue;

use crate::error::{RegistryErrorKind, RegistryResult};
use crate::{ChangeBatch, DailyDownloads, PackageRegistry};

#[derive(Default)]
pub struct MemRegistry {
    packages: Mutex<BTreeMap<String, JsonValue>>,
    downloads: Mutex<HashMap<String, Vec<DailyDownloads>>>,
    scripted_batches: Mutex<VecDeque<ChangeBatch>>,
    tip_seq: Mutex<u64>,
}

impl MemRegistry {
    pub fn insert_package(&self, name: &str, package_data: JsonValue) {
        self.packages
            .lock()
            .unwrap()
            .insert(name.to_string(), package_data);
    }

    pub fn remove_package(&self, name: &str) {
        self.packages.lock().unwrap().remove(name);
    }

    pub fn insert_downloads(&self, name: &str, daily_downloads: Vec<DailyDownloads>) {
        self.downloads
            .lock()
            .unwrap()
            .insert(name.to_string(), daily_downloads);
    }

    /// Queues a batch for the change feed; batches are served in order, then
    /// the feed reads as idle.
    pub fn script_changes(&self, batch: ChangeBatch) {
        let mut tip_seq = self.tip_seq.lock().unwrap();
        *tip_seq = (*tip_seq).max(batch.last_seq);
        self.scripted_batches.lock().unwrap().push_back(batch);
    }

    pub fn set_tip_seq(&self, seq: u64) {
        *self.tip_seq.lock().unwrap() = seq;
    }
}

#[async_trait]
impl PackageRegistry for MemRegistry {
    async fn fetch_package(&self, name: &str) -> RegistryResult<JsonValue> {
        self.packages
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| {
                RegistryErrorKind::NotFound.with_error(anyhow::anyhow!("no package `{name}`"))
            })
    }

    async fn bulk_fetch_packages(
        &self,
        names: &[String],
    ) -> RegistryResult<Vec<Option<JsonValue>>> {
        let packages = self.packages.lock().unwrap();
        Ok(names.iter().map(|name| packages.get(name).cloned()).collect())
    }

    async fn list_packages(
        &self,
        start_after: &str,
        limit: usize,
    ) -> RegistryResult<Vec<String>> {
        let packages = self.packages.lock().unwrap();
        let start_bound = if start_after.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(start_after.to_string())
        };
        Ok(packages
            .range((start_bound, Bound::Unbounded))
            .map(|(name, _)| name.clone())
            .take(limit)
            .collect())
    }

    async fn fetch_daily_downloads(
        &self,
        name: &str,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> RegistryResult<Vec<DailyDownloads>> {
        Ok(self
            .downloads
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn last_seq(&self) -> RegistryResult<u64> {
        Ok(*self.tip_seq.lock().unwrap())
    }

    async fn changes(&self, since: u64, _limit: usize) -> RegistryResult<ChangeBatch> {
        let next_batch = self.scripted_batches.lock().unwrap().pop_front();
        Ok(next_batch.unwrap_or(ChangeBatch {
            changes: Vec::new(),
            last_seq: since,
        }))
    }

    async fn is_up(&self) -> bool {
        true
    }
}
