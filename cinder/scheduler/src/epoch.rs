// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Per-executor failure epochs gating late events.

use std::collections::HashMap;

/// Tracks, per executor, the epoch of the last processed loss event and the
/// epoch of the last processed shuffle-data loss.
///
/// Both maps are monotone: an event carrying an epoch at or below the stored
/// one is ignored. With an external shuffle service, an executor-only loss
/// updates the failure epoch but leaves the shuffle-file epoch alone,
/// deferring shuffle unregistration until a fetch failure proves the data is
/// actually gone. `shuffle_file_lost_epoch[e] >= executor_failure_epoch[e]`
/// whenever files were lost.
#[derive(Default)]
pub struct FailureEpochTracker {
    executor_failure_epoch: HashMap<String, u64>,
    shuffle_file_lost_epoch: HashMap<String, u64>,
}

impl FailureEpochTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an executor loss at `epoch`. Returns false when a loss at
    /// this epoch or later was already processed.
    pub fn record_executor_failure(&mut self, executor_id: &str, epoch: u64) -> bool {
        Self::advance(&mut self.executor_failure_epoch, executor_id, epoch)
    }

    /// Records loss of shuffle files served by the executor at `epoch`.
    /// Returns false when a loss at this epoch or later was already
    /// processed.
    pub fn record_shuffle_files_lost(&mut self, executor_id: &str, epoch: u64) -> bool {
        Self::advance(&mut self.shuffle_file_lost_epoch, executor_id, epoch)
    }

    fn advance(map: &mut HashMap<String, u64>, executor_id: &str, epoch: u64) -> bool {
        match map.get(executor_id) {
            Some(existing) if *existing >= epoch => false,
            _ => {
                map.insert(executor_id.to_owned(), epoch);
                true
            }
        }
    }

    /// Forgets failure state for an executor that re-registered. Returns
    /// whether any state was present.
    pub fn clear_executor(&mut self, executor_id: &str) -> bool {
        let had_failure = self.executor_failure_epoch.remove(executor_id).is_some();
        self.shuffle_file_lost_epoch.remove(executor_id);
        had_failure
    }

    /// Epoch of the last processed loss of this executor.
    pub fn executor_failure_epoch(&self, executor_id: &str) -> Option<u64> {
        self.executor_failure_epoch.get(executor_id).copied()
    }

    /// Epoch of the last processed shuffle-file loss on this executor.
    pub fn shuffle_file_lost_epoch(&self, executor_id: &str) -> Option<u64> {
        self.shuffle_file_lost_epoch.get(executor_id).copied()
    }

    /// Whether output produced at `task_epoch` by this executor may predate
    /// a processed loss and must be discarded.
    pub fn is_stale_output(&self, executor_id: &str, task_epoch: u64) -> bool {
        matches!(
            self.executor_failure_epoch.get(executor_id),
            Some(failure_epoch) if task_epoch <= *failure_epoch
        )
    }
}
