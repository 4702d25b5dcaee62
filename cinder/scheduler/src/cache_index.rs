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

//! Lazily populated table of cached partition locations.

use std::sync::Arc;

use dashmap::DashMap;

use cinder_core::dataset::{DatasetGraph, DatasetId};
use cinder_core::error::Result;
use cinder_core::metadata::{DatasetBlockId, TaskLocation};

use crate::block_manager::BlockManagerMaster;

/// Per-dataset table of candidate task locations, one entry per partition.
///
/// Entries are created on first lookup: a dataset without persistence gets
/// empty location lists without consulting the block manager; a persisted
/// dataset is resolved with one batched block manager query. The whole table
/// is cleared on executor loss, on job submission, and on major shuffle map
/// state changes.
///
/// Lookups may run concurrently from the event loop and from the
/// task-submission path.
pub struct CacheLocationIndex {
    block_manager: Arc<dyn BlockManagerMaster>,
    locs: DashMap<DatasetId, Vec<Vec<TaskLocation>>>,
}

impl CacheLocationIndex {
    /// Creates an index resolving persisted datasets through `block_manager`.
    pub fn new(block_manager: Arc<dyn BlockManagerMaster>) -> Self {
        Self {
            block_manager,
            locs: DashMap::new(),
        }
    }

    /// Candidate locations for every partition of `ds`.
    pub async fn get_cache_locs(
        &self,
        graph: &DatasetGraph,
        ds: DatasetId,
    ) -> Result<Vec<Vec<TaskLocation>>> {
        if let Some(cached) = self.locs.get(&ds) {
            return Ok(cached.clone());
        }
        let num_partitions = graph.num_partitions(ds);
        let computed = if !graph.storage_level(ds).is_persisted() {
            vec![vec![]; num_partitions]
        } else {
            let block_ids: Vec<DatasetBlockId> = (0..num_partitions)
                .map(|partition| DatasetBlockId {
                    dataset: ds,
                    partition,
                })
                .collect();
            self.block_manager
                .get_locations(&block_ids)
                .await?
                .into_iter()
                .map(|managers| managers.iter().map(TaskLocation::from).collect())
                .collect()
        };
        self.locs.insert(ds, computed.clone());
        Ok(computed)
    }

    /// Drops every entry; subsequent lookups repopulate from the block
    /// manager.
    pub fn clear(&self) {
        self.locs.clear();
    }
}
