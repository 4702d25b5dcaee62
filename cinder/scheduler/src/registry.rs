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

//! The canonical stage set and its job membership relation.

use std::collections::{HashMap, HashSet};

use log::debug;

use cinder_core::dataset::ShuffleId;

use crate::job::JobId;
use crate::stage::{Stage, StageId};

/// Owns every live stage, the mapping from shuffle id to its producing
/// stage, and which jobs need which stages.
///
/// A shuffle id maps to at most one stage; stages are shared across jobs
/// and removed when their job set empties.
#[derive(Default)]
pub struct StageRegistry {
    stages: HashMap<StageId, Stage>,
    shuffle_to_map_stage: HashMap<ShuffleId, StageId>,
    job_to_stages: HashMap<JobId, HashSet<StageId>>,
    next_stage_id: usize,
}

impl StageRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next stage id.
    pub fn next_stage_id(&mut self) -> StageId {
        let id = StageId(self.next_stage_id);
        self.next_stage_id += 1;
        id
    }

    /// Inserts a stage, registering its shuffle mapping when it is a
    /// shuffle map stage.
    pub fn insert(&mut self, stage: Stage) {
        if let Some(map_stage) = stage.as_shuffle_map() {
            self.shuffle_to_map_stage
                .insert(map_stage.shuffle_dep.shuffle_id, stage.id());
        }
        self.stages.insert(stage.id(), stage);
    }

    /// Looks up a stage.
    pub fn get(&self, stage_id: StageId) -> Option<&Stage> {
        self.stages.get(&stage_id)
    }

    /// Mutable stage lookup.
    pub fn get_mut(&mut self, stage_id: StageId) -> Option<&mut Stage> {
        self.stages.get_mut(&stage_id)
    }

    /// Whether the stage is known.
    pub fn contains_stage(&self, stage_id: StageId) -> bool {
        self.stages.contains_key(&stage_id)
    }

    /// Whether a stage already produces this shuffle.
    pub fn contains_shuffle(&self, shuffle_id: ShuffleId) -> bool {
        self.shuffle_to_map_stage.contains_key(&shuffle_id)
    }

    /// The stage producing this shuffle, if registered.
    pub fn map_stage_for_shuffle(&self, shuffle_id: ShuffleId) -> Option<StageId> {
        self.shuffle_to_map_stage.get(&shuffle_id).copied()
    }

    /// Stages a job needs, empty if the job is unknown.
    pub fn stage_ids_for_job(&self, job_id: JobId) -> HashSet<StageId> {
        self.job_to_stages.get(&job_id).cloned().unwrap_or_default()
    }

    /// Ids of all registered stages.
    pub fn stage_ids(&self) -> Vec<StageId> {
        self.stages.keys().copied().collect()
    }

    /// Registers that `job_id` needs `stage_id` and, transitively, every
    /// ancestor of it.
    pub fn update_job_id_stage_id_maps(&mut self, job_id: JobId, stage_id: StageId) {
        let mut work = vec![stage_id];
        while let Some(id) = work.pop() {
            let Some(stage) = self.stages.get_mut(&id) else {
                continue;
            };
            if stage.job_ids_mut().insert(job_id) {
                self.job_to_stages.entry(job_id).or_default().insert(id);
                work.extend(stage.parents().iter().copied());
            }
        }
    }

    /// Drops `job` from every one of its stages. Stages whose job set
    /// becomes empty are removed along with their shuffle mapping; the map
    /// output tracker keeps the shuffle data metadata. Returns the ids of
    /// the removed stages.
    pub fn cleanup_for_job(&mut self, job_id: JobId) -> Vec<StageId> {
        let mut removed = vec![];
        let Some(stage_ids) = self.job_to_stages.remove(&job_id) else {
            return removed;
        };
        for stage_id in stage_ids {
            let Some(stage) = self.stages.get_mut(&stage_id) else {
                continue;
            };
            let job_ids = stage.job_ids_mut();
            if !job_ids.remove(&job_id) {
                debug!("Stage {stage_id} does not reference job {job_id}, skipping");
            }
            if job_ids.is_empty() {
                let stage = self.stages.remove(&stage_id).unwrap();
                if let Some(map_stage) = stage.as_shuffle_map() {
                    self.shuffle_to_map_stage
                        .remove(&map_stage.shuffle_dep.shuffle_id);
                }
                debug!("Removed stage {stage_id}, no jobs reference it anymore");
                removed.push(stage_id);
            }
        }
        removed
    }

    /// Number of registered stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the registry holds no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::dataset::{
        DatasetId, DeterminismLevel, Partitioner, ShuffleDependency,
    };
    use crate::stage::ShuffleMapStage;

    fn map_stage(registry: &mut StageRegistry, shuffle: usize, parents: Vec<StageId>) -> StageId {
        let id = registry.next_stage_id();
        registry.insert(Stage::ShuffleMap(ShuffleMapStage::new(
            id,
            DatasetId(shuffle),
            2,
            parents,
            JobId(0),
            "test".into(),
            ShuffleDependency {
                shuffle_id: ShuffleId(shuffle),
                parent: DatasetId(shuffle),
                partitioner: Partitioner::Hash { partitions: 2 },
            },
            false,
            DeterminismLevel::Determinate,
        )));
        id
    }

    #[test]
    fn job_membership_is_transitive() {
        let mut registry = StageRegistry::new();
        let s0 = map_stage(&mut registry, 0, vec![]);
        let s1 = map_stage(&mut registry, 1, vec![s0]);
        registry.update_job_id_stage_id_maps(JobId(7), s1);
        assert!(registry.get(s0).unwrap().job_ids().contains(&JobId(7)));
        assert!(registry.get(s1).unwrap().job_ids().contains(&JobId(7)));
        assert_eq!(registry.stage_ids_for_job(JobId(7)).len(), 2);
    }

    #[test]
    fn cleanup_keeps_shared_stages() {
        let mut registry = StageRegistry::new();
        let s0 = map_stage(&mut registry, 0, vec![]);
        let s1 = map_stage(&mut registry, 1, vec![s0]);
        registry.update_job_id_stage_id_maps(JobId(1), s1);
        registry.update_job_id_stage_id_maps(JobId(2), s0);

        let removed = registry.cleanup_for_job(JobId(1));
        assert_eq!(removed, vec![s1]);
        assert!(registry.contains_stage(s0));
        assert!(!registry.contains_stage(s1));
        assert!(registry.contains_shuffle(ShuffleId(0)));
        assert!(!registry.contains_shuffle(ShuffleId(1)));

        let removed = registry.cleanup_for_job(JobId(2));
        assert_eq!(removed, vec![s0]);
        assert!(registry.is_empty());
    }

    #[test]
    fn shuffle_mapping_is_unique() {
        let mut registry = StageRegistry::new();
        let s0 = map_stage(&mut registry, 0, vec![]);
        assert_eq!(registry.map_stage_for_shuffle(ShuffleId(0)), Some(s0));
        assert!(!registry.contains_shuffle(ShuffleId(1)));
    }
}
