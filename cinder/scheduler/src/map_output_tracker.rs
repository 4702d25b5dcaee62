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

//! Driver-side registry of materialized shuffle map outputs.

use std::collections::HashMap;

use log::debug;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use cinder_core::dataset::ShuffleId;
use cinder_core::error::{CinderError, Result};
use cinder_core::metadata::BlockManagerId;

/// Location and sizes of one map task's output for a shuffle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapStatus {
    /// Block manager serving the map output.
    pub location: BlockManagerId,
    /// Output bytes per reduce partition.
    pub sizes: Vec<u64>,
}

impl MapStatus {
    /// Creates a map status.
    pub fn new(location: BlockManagerId, sizes: Vec<u64>) -> Self {
        Self { location, sizes }
    }
}

/// Aggregated output sizes of a completed shuffle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapOutputStatistics {
    /// The shuffle the statistics describe.
    pub shuffle_id: ShuffleId,
    /// Total bytes destined to each reduce partition.
    pub bytes_by_partition: Vec<u64>,
}

struct ShuffleState {
    num_reduce_partitions: usize,
    /// One slot per map partition; `None` until the partition's output is
    /// registered, and again after it is lost.
    statuses: Vec<Option<MapStatus>>,
}

/// The master tracker: registers shuffles, records where each map output
/// lives, and serves availability queries to the scheduler.
///
/// The epoch is a monotone counter bumped whenever outputs are lost (and
/// explicitly by the scheduler when a map stage completes). Tasks carry the
/// epoch they were launched under so completions predating a loss can be
/// discarded.
pub struct MapOutputTrackerMaster {
    shuffles: RwLock<HashMap<ShuffleId, ShuffleState>>,
    epoch: Mutex<u64>,
}

impl Default for MapOutputTrackerMaster {
    fn default() -> Self {
        Self::new()
    }
}

impl MapOutputTrackerMaster {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self {
            shuffles: RwLock::new(HashMap::new()),
            epoch: Mutex::new(0),
        }
    }

    /// Registers a shuffle with the given map and reduce partition counts.
    pub fn register_shuffle(
        &self,
        shuffle_id: ShuffleId,
        num_maps: usize,
        num_reduce_partitions: usize,
    ) -> Result<()> {
        let mut shuffles = self.shuffles.write();
        if shuffles.contains_key(&shuffle_id) {
            return Err(CinderError::Internal(format!(
                "Shuffle {shuffle_id} registered twice"
            )));
        }
        shuffles.insert(
            shuffle_id,
            ShuffleState {
                num_reduce_partitions,
                statuses: vec![None; num_maps],
            },
        );
        Ok(())
    }

    /// Whether the shuffle is known to the tracker.
    pub fn contains_shuffle(&self, shuffle_id: ShuffleId) -> bool {
        self.shuffles.read().contains_key(&shuffle_id)
    }

    /// Forgets a shuffle entirely.
    pub fn unregister_shuffle(&self, shuffle_id: ShuffleId) {
        self.shuffles.write().remove(&shuffle_id);
    }

    /// Records the output of one map partition.
    pub fn register_map_output(
        &self,
        shuffle_id: ShuffleId,
        map_id: usize,
        status: MapStatus,
    ) {
        if let Some(state) = self.shuffles.write().get_mut(&shuffle_id) {
            state.statuses[map_id] = Some(status);
        }
    }

    /// Discards the output of one map partition if it is still served by
    /// `location`.
    pub fn unregister_map_output(
        &self,
        shuffle_id: ShuffleId,
        map_id: usize,
        location: &BlockManagerId,
    ) {
        let mut removed = false;
        if let Some(state) = self.shuffles.write().get_mut(&shuffle_id) {
            if let Some(status) = &state.statuses[map_id] {
                if status.location == *location {
                    state.statuses[map_id] = None;
                    removed = true;
                }
            }
        }
        if removed {
            self.increment_epoch();
        }
    }

    /// Discards every output of a shuffle.
    pub fn unregister_all_map_outputs(&self, shuffle_id: ShuffleId) {
        if let Some(state) = self.shuffles.write().get_mut(&shuffle_id) {
            state.statuses.iter_mut().for_each(|status| *status = None);
        }
        self.increment_epoch();
    }

    /// Discards every output served from `host`, across all shuffles.
    /// Returns the number of outputs removed.
    pub fn remove_outputs_on_host(&self, host: &str) -> usize {
        self.remove_outputs_by_filter(|location| location.host == host)
    }

    /// Discards every output served by `executor_id`, across all shuffles.
    /// Returns the number of outputs removed.
    pub fn remove_outputs_on_executor(&self, executor_id: &str) -> usize {
        self.remove_outputs_by_filter(|location| location.executor_id == executor_id)
    }

    fn remove_outputs_by_filter(&self, lost: impl Fn(&BlockManagerId) -> bool) -> usize {
        let mut removed = 0;
        {
            let mut shuffles = self.shuffles.write();
            for state in shuffles.values_mut() {
                for status in state.statuses.iter_mut() {
                    if matches!(status, Some(s) if lost(&s.location)) {
                        *status = None;
                        removed += 1;
                    }
                }
            }
        }
        if removed > 0 {
            debug!("Removed {removed} map outputs");
            self.increment_epoch();
        }
        removed
    }

    /// Map partitions of the shuffle with no registered output. `None` when
    /// the shuffle is unknown.
    pub fn find_missing_partitions(&self, shuffle_id: ShuffleId) -> Option<Vec<usize>> {
        self.shuffles.read().get(&shuffle_id).map(|state| {
            state
                .statuses
                .iter()
                .enumerate()
                .filter_map(|(map_id, status)| status.is_none().then_some(map_id))
                .collect()
        })
    }

    /// Number of map partitions with registered output.
    pub fn num_available_outputs(&self, shuffle_id: ShuffleId) -> usize {
        self.shuffles
            .read()
            .get(&shuffle_id)
            .map(|state| state.statuses.iter().filter(|s| s.is_some()).count())
            .unwrap_or(0)
    }

    /// Per-reduce-partition byte totals of a shuffle's registered outputs.
    pub fn get_statistics(&self, shuffle_id: ShuffleId) -> Option<MapOutputStatistics> {
        self.shuffles.read().get(&shuffle_id).map(|state| {
            let mut bytes_by_partition = vec![0u64; state.num_reduce_partitions];
            for status in state.statuses.iter().flatten() {
                for (partition, size) in status.sizes.iter().enumerate() {
                    bytes_by_partition[partition] += size;
                }
            }
            MapOutputStatistics {
                shuffle_id,
                bytes_by_partition,
            }
        })
    }

    /// Bumps the epoch, invalidating executor-side cached shuffle metadata.
    pub fn increment_epoch(&self) -> u64 {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        *epoch
    }

    /// The current epoch.
    pub fn get_epoch(&self) -> u64 {
        *self.epoch.lock()
    }
}
