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

//! Interface to the block manager master, the source of cached partition
//! locations.

use async_trait::async_trait;
use dashmap::DashMap;

use cinder_core::error::Result;
use cinder_core::metadata::{BlockManagerId, DatasetBlockId};

/// Driver-side view of block manager storage across the cluster.
#[async_trait]
pub trait BlockManagerMaster: Send + Sync {
    /// Locations of each requested block, in request order. Blocks with no
    /// replica resolve to an empty list.
    async fn get_locations(
        &self,
        blocks: &[DatasetBlockId],
    ) -> Result<Vec<Vec<BlockManagerId>>>;

    /// Drops an executor's block manager from the cluster view.
    async fn remove_executor(&self, executor_id: &str) -> Result<()>;
}

/// In-memory block manager master for single-process deployments and tests.
#[derive(Default)]
pub struct InMemoryBlockManagerMaster {
    blocks: DashMap<DatasetBlockId, Vec<BlockManagerId>>,
}

impl InMemoryBlockManagerMaster {
    /// Creates an empty master.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a replica of `block` at `location`.
    pub fn register_block(&self, block: DatasetBlockId, location: BlockManagerId) {
        self.blocks.entry(block).or_default().push(location);
    }
}

#[async_trait]
impl BlockManagerMaster for InMemoryBlockManagerMaster {
    async fn get_locations(
        &self,
        blocks: &[DatasetBlockId],
    ) -> Result<Vec<Vec<BlockManagerId>>> {
        Ok(blocks
            .iter()
            .map(|block| {
                self.blocks
                    .get(block)
                    .map(|locations| locations.clone())
                    .unwrap_or_default()
            })
            .collect())
    }

    async fn remove_executor(&self, executor_id: &str) -> Result<()> {
        for mut entry in self.blocks.iter_mut() {
            entry
                .value_mut()
                .retain(|location| location.executor_id != executor_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn removed_executor_no_longer_serves_blocks() -> Result<()> {
        let master = InMemoryBlockManagerMaster::new();
        let block = DatasetBlockId {
            dataset: cinder_core::dataset::DatasetId(0),
            partition: 0,
        };
        master.register_block(block, BlockManagerId::new("exec-a", "host-a", 7070));
        master.register_block(block, BlockManagerId::new("exec-b", "host-b", 7070));

        master.remove_executor("exec-a").await?;
        let locations = master.get_locations(&[block]).await?;
        assert_eq!(locations[0].len(), 1);
        assert_eq!(locations[0][0].executor_id, "exec-b");
        Ok(())
    }
}
