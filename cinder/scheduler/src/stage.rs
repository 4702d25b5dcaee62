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

//! Stages: units of task-parallel work with no internal shuffle boundary.
//!
//! A stage is cut from the dataset graph at shuffle edges. Stages come in
//! two kinds:
//!
//! ```text
//!   ShuffleMapStage  -- writes map output for a shuffle, consumed by
//!                       downstream stages through the map output tracker
//!   ResultStage      -- computes the final partitions of a job and feeds
//!                       results to the job listener
//! ```
//!
//! Stages are created on first need for a given shuffle id (or final
//! dataset), are shared by every job that depends on them, and are removed
//! when no active job references them anymore.

use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use cinder_core::dataset::{DatasetId, DeterminismLevel, ShuffleDependency};
use cinder_core::metadata::TaskLocation;
use cinder_core::utils::timestamp_millis;

use crate::job::JobId;
use crate::task::ResultFunc;

/// Process-unique, monotonically increasing stage identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct StageId(pub usize);

impl Display for StageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Telemetry record of one stage attempt.
#[derive(Debug, Clone)]
pub struct StageInfo {
    /// The stage this attempt belongs to.
    pub stage_id: StageId,
    /// Attempt number, starting at zero.
    pub attempt_id: usize,
    /// Stage name for display: variant plus call site.
    pub name: String,
    /// Number of tasks in the attempt.
    pub num_tasks: usize,
    /// When the attempt was submitted, milliseconds since epoch.
    pub submission_time: Option<u64>,
    /// When the attempt finished, milliseconds since epoch.
    pub completion_time: Option<u64>,
    /// Why the attempt failed, when it did.
    pub failure_reason: Option<String>,
    /// Placement hints per task, in task order.
    pub task_locality_preferences: Vec<Vec<TaskLocation>>,
}

impl StageInfo {
    fn new(stage_id: StageId, attempt_id: usize, name: String, num_tasks: usize) -> Self {
        Self {
            stage_id,
            attempt_id,
            name,
            num_tasks,
            submission_time: None,
            completion_time: None,
            failure_reason: None,
            task_locality_preferences: vec![],
        }
    }

    /// Marks the attempt failed with the given reason.
    pub fn stage_failed(&mut self, reason: String) {
        self.failure_reason = Some(reason);
        self.completion_time = Some(timestamp_millis());
    }
}

/// A stage producing map output for a shuffle.
pub struct ShuffleMapStage {
    /// Stage identifier.
    pub id: StageId,
    /// Leaf dataset of the stage: the shuffle's map-side input.
    pub dataset: DatasetId,
    /// One task per partition of the leaf dataset.
    pub num_tasks: usize,
    /// Stages whose shuffle output this stage reads.
    pub parents: Vec<StageId>,
    /// The job this stage was first created for.
    pub first_job_id: JobId,
    /// Call site of the action that created the stage.
    pub call_site: String,
    /// Jobs that currently need this stage.
    pub job_ids: HashSet<JobId>,
    /// Attempt numbers that ended in a fetch failure.
    pub failed_attempt_ids: HashSet<usize>,
    /// The shuffle this stage writes.
    pub shuffle_dep: ShuffleDependency,
    /// Partitions of the current attempt that have not reported success.
    pub pending_partitions: HashSet<usize>,
    /// Map-stage jobs waiting for this shuffle to be fully available.
    pub map_stage_jobs: Vec<JobId>,
    /// Whether tasks must be gang-scheduled.
    pub barrier: bool,
    /// Determinism of recomputing the stage's output.
    pub determinism: DeterminismLevel,
    attempts: Vec<StageInfo>,
    next_attempt_id: usize,
}

/// The terminal stage of a job, computing the requested partitions of the
/// final dataset.
pub struct ResultStage {
    /// Stage identifier.
    pub id: StageId,
    /// The final dataset of the job.
    pub dataset: DatasetId,
    /// One task per requested partition.
    pub num_tasks: usize,
    /// Stages whose shuffle output this stage reads.
    pub parents: Vec<StageId>,
    /// The job this stage was first created for.
    pub first_job_id: JobId,
    /// Call site of the action that created the stage.
    pub call_site: String,
    /// Jobs that currently need this stage.
    pub job_ids: HashSet<JobId>,
    /// Attempt numbers that ended in a fetch failure.
    pub failed_attempt_ids: HashSet<usize>,
    /// The user function applied to computed partitions.
    pub func: Arc<dyn ResultFunc>,
    /// The dataset partitions to compute; index in this array is the job
    /// output id.
    pub partitions: Vec<usize>,
    /// The job currently executing this stage, if any.
    pub active_job: Option<JobId>,
    /// Whether tasks must be gang-scheduled.
    pub barrier: bool,
    attempts: Vec<StageInfo>,
    next_attempt_id: usize,
}

impl ShuffleMapStage {
    /// Creates a shuffle map stage for `shuffle_dep`.
    pub fn new(
        id: StageId,
        dataset: DatasetId,
        num_tasks: usize,
        parents: Vec<StageId>,
        first_job_id: JobId,
        call_site: String,
        shuffle_dep: ShuffleDependency,
        barrier: bool,
        determinism: DeterminismLevel,
    ) -> Self {
        let name = format!("ShuffleMapStage {id} ({call_site})");
        Self {
            id,
            dataset,
            num_tasks,
            parents,
            first_job_id,
            call_site,
            job_ids: HashSet::new(),
            failed_attempt_ids: HashSet::new(),
            shuffle_dep,
            pending_partitions: HashSet::new(),
            map_stage_jobs: vec![],
            barrier,
            determinism,
            attempts: vec![StageInfo::new(id, 0, name, num_tasks)],
            next_attempt_id: 0,
        }
    }
}

impl ResultStage {
    /// Creates the result stage of a job.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: StageId,
        dataset: DatasetId,
        partitions: Vec<usize>,
        parents: Vec<StageId>,
        first_job_id: JobId,
        call_site: String,
        func: Arc<dyn ResultFunc>,
        barrier: bool,
    ) -> Self {
        let num_tasks = partitions.len();
        let name = format!("ResultStage {id} ({call_site})");
        Self {
            id,
            dataset,
            num_tasks,
            parents,
            first_job_id,
            call_site,
            job_ids: HashSet::new(),
            failed_attempt_ids: HashSet::new(),
            func,
            partitions,
            active_job: None,
            barrier,
            attempts: vec![StageInfo::new(id, 0, name, num_tasks)],
            next_attempt_id: 0,
        }
    }
}

/// A stage in the scheduler's registry.
pub enum Stage {
    /// Produces shuffle map output.
    ShuffleMap(ShuffleMapStage),
    /// Produces the final result of a job.
    Result(ResultStage),
}

impl Stage {
    /// Get the name of the variant.
    pub fn variant_name(&self) -> &str {
        match self {
            Stage::ShuffleMap(_) => "ShuffleMapStage",
            Stage::Result(_) => "ResultStage",
        }
    }

    /// Stage identifier.
    pub fn id(&self) -> StageId {
        match self {
            Stage::ShuffleMap(stage) => stage.id,
            Stage::Result(stage) => stage.id,
        }
    }

    /// Leaf dataset of the stage.
    pub fn dataset(&self) -> DatasetId {
        match self {
            Stage::ShuffleMap(stage) => stage.dataset,
            Stage::Result(stage) => stage.dataset,
        }
    }

    /// Number of tasks a full attempt of this stage runs.
    pub fn num_tasks(&self) -> usize {
        match self {
            Stage::ShuffleMap(stage) => stage.num_tasks,
            Stage::Result(stage) => stage.num_tasks,
        }
    }

    /// Parent stages whose output this stage consumes.
    pub fn parents(&self) -> &[StageId] {
        match self {
            Stage::ShuffleMap(stage) => &stage.parents,
            Stage::Result(stage) => &stage.parents,
        }
    }

    /// The job the stage was first created for.
    pub fn first_job_id(&self) -> JobId {
        match self {
            Stage::ShuffleMap(stage) => stage.first_job_id,
            Stage::Result(stage) => stage.first_job_id,
        }
    }

    /// Call site recorded at stage creation.
    pub fn call_site(&self) -> &str {
        match self {
            Stage::ShuffleMap(stage) => &stage.call_site,
            Stage::Result(stage) => &stage.call_site,
        }
    }

    /// Jobs that currently need this stage.
    pub fn job_ids(&self) -> &HashSet<JobId> {
        match self {
            Stage::ShuffleMap(stage) => &stage.job_ids,
            Stage::Result(stage) => &stage.job_ids,
        }
    }

    /// Mutable access to the job membership set.
    pub fn job_ids_mut(&mut self) -> &mut HashSet<JobId> {
        match self {
            Stage::ShuffleMap(stage) => &mut stage.job_ids,
            Stage::Result(stage) => &mut stage.job_ids,
        }
    }

    /// Attempt numbers that failed with a fetch failure.
    pub fn failed_attempt_ids(&self) -> &HashSet<usize> {
        match self {
            Stage::ShuffleMap(stage) => &stage.failed_attempt_ids,
            Stage::Result(stage) => &stage.failed_attempt_ids,
        }
    }

    /// Mutable access to the failed attempt set.
    pub fn failed_attempt_ids_mut(&mut self) -> &mut HashSet<usize> {
        match self {
            Stage::ShuffleMap(stage) => &mut stage.failed_attempt_ids,
            Stage::Result(stage) => &mut stage.failed_attempt_ids,
        }
    }

    /// Telemetry record of the current attempt.
    pub fn latest_info(&self) -> &StageInfo {
        match self {
            Stage::ShuffleMap(stage) => stage.attempts.last().unwrap(),
            Stage::Result(stage) => stage.attempts.last().unwrap(),
        }
    }

    /// Mutable telemetry record of the current attempt.
    pub fn latest_info_mut(&mut self) -> &mut StageInfo {
        match self {
            Stage::ShuffleMap(stage) => stage.attempts.last_mut().unwrap(),
            Stage::Result(stage) => stage.attempts.last_mut().unwrap(),
        }
    }

    /// Starts a new attempt with the given number of tasks and placement
    /// hints, and stamps its submission time.
    pub fn make_new_stage_attempt(
        &mut self,
        num_tasks: usize,
        task_locality_preferences: Vec<Vec<TaskLocation>>,
    ) {
        let (id, name, attempts, next) = match self {
            Stage::ShuffleMap(stage) => (
                stage.id,
                stage.attempts[0].name.clone(),
                &mut stage.attempts,
                &mut stage.next_attempt_id,
            ),
            Stage::Result(stage) => (
                stage.id,
                stage.attempts[0].name.clone(),
                &mut stage.attempts,
                &mut stage.next_attempt_id,
            ),
        };
        let mut info = StageInfo::new(id, *next, name, num_tasks);
        info.submission_time = Some(timestamp_millis());
        info.task_locality_preferences = task_locality_preferences;
        *next += 1;
        attempts.push(info);
    }

    /// Whether tasks of this stage require gang scheduling.
    pub fn is_barrier(&self) -> bool {
        match self {
            Stage::ShuffleMap(stage) => stage.barrier,
            Stage::Result(stage) => stage.barrier,
        }
    }

    /// Whether recomputing this stage may produce different output.
    pub fn is_indeterminate(&self) -> bool {
        match self {
            Stage::ShuffleMap(stage) => {
                stage.determinism == DeterminismLevel::Indeterminate
            }
            Stage::Result(_) => false,
        }
    }

    /// Downcast to a shuffle map stage.
    pub fn as_shuffle_map(&self) -> Option<&ShuffleMapStage> {
        match self {
            Stage::ShuffleMap(stage) => Some(stage),
            Stage::Result(_) => None,
        }
    }

    /// Mutable downcast to a shuffle map stage.
    pub fn as_shuffle_map_mut(&mut self) -> Option<&mut ShuffleMapStage> {
        match self {
            Stage::ShuffleMap(stage) => Some(stage),
            Stage::Result(_) => None,
        }
    }

    /// Downcast to a result stage.
    pub fn as_result(&self) -> Option<&ResultStage> {
        match self {
            Stage::ShuffleMap(_) => None,
            Stage::Result(stage) => Some(stage),
        }
    }

    /// Mutable downcast to a result stage.
    pub fn as_result_mut(&mut self) -> Option<&mut ResultStage> {
        match self {
            Stage::ShuffleMap(_) => None,
            Stage::Result(stage) => Some(stage),
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.variant_name(), self.id())
    }
}
