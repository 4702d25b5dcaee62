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

//! Task records exchanged between the DAG scheduler and the task scheduler.

use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use cinder_core::dataset::{DatasetId, ShuffleDependency, ShuffleId};
use cinder_core::error::Result;
use cinder_core::metadata::{BlockManagerId, TaskLocation};

use crate::job::JobId;
use crate::map_output_tracker::{MapOutputStatistics, MapStatus};
use crate::stage::StageId;

/// The serialized task closure, broadcast once per stage attempt and shared
/// by every task of the attempt.
#[derive(Clone)]
pub struct TaskBinary {
    bytes: Arc<Vec<u8>>,
}

impl TaskBinary {
    /// Wraps encoded closure bytes for broadcast.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }

    /// The encoded closure.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Size of the encoded closure in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the encoded closure is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Debug for TaskBinary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskBinary({} bytes)", self.bytes.len())
    }
}

/// Closure descriptor shipped to executors for a shuffle map task.
#[derive(Debug, Serialize, Deserialize)]
pub struct ShuffleMapClosure {
    /// The dataset whose partitions are computed and written out.
    pub dataset: DatasetId,
    /// The shuffle the outputs belong to.
    pub shuffle_id: ShuffleId,
    /// Reduce-side partition count.
    pub num_output_partitions: usize,
}

/// Closure descriptor shipped to executors for a result task.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResultClosure {
    /// The dataset whose partitions are computed.
    pub dataset: DatasetId,
    /// The user function applied to each computed partition.
    pub func: Vec<u8>,
}

/// A user function applied to partitions of the final dataset of a job.
///
/// Execution happens on executors; the scheduler only needs a stable encoded
/// form to broadcast. Encoding failures abort the stage.
pub trait ResultFunc: Send + Sync {
    /// Encodes the function for shipping to executors.
    fn encode(&self) -> Result<Vec<u8>>;
}

/// Encodes the closure of a shuffle map stage attempt.
pub fn encode_shuffle_map_closure(dep: &ShuffleDependency) -> Result<Vec<u8>> {
    let closure = ShuffleMapClosure {
        dataset: dep.parent,
        shuffle_id: dep.shuffle_id,
        num_output_partitions: dep.num_output_partitions(),
    };
    Ok(bincode::serialize(&closure)?)
}

/// Encodes the closure of a result stage attempt.
pub fn encode_result_closure(dataset: DatasetId, func: &dyn ResultFunc) -> Result<Vec<u8>> {
    let closure = ResultClosure {
        dataset,
        func: func.encode()?,
    };
    Ok(bincode::serialize(&closure)?)
}

/// What a task produces when it completes.
#[derive(Debug, Clone)]
pub enum TaskValue {
    /// Opaque result bytes of a result task, delivered to the job listener.
    Bytes(Vec<u8>),
    /// Registered map output of a shuffle map task.
    MapStatus(MapStatus),
    /// Statistics handed to a map-stage job when its shuffle is complete.
    MapOutputStats(MapOutputStatistics),
}

/// Distinguishes the two kinds of tasks a stage produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Computes one partition of a shuffle map stage and writes map output.
    ShuffleMap {
        /// The shuffle the output is registered under.
        shuffle_id: ShuffleId,
    },
    /// Computes one partition of a result stage.
    Result {
        /// Index into the job's output array.
        output_id: usize,
    },
}

/// The unit of work handed to the task scheduler.
#[derive(Debug, Clone)]
pub struct Task {
    /// Stage the task belongs to.
    pub stage_id: StageId,
    /// Attempt of the stage this task was built for.
    pub stage_attempt_id: usize,
    /// The dataset partition this task computes.
    pub partition: usize,
    /// Shuffle map or result work.
    pub kind: TaskKind,
    /// Broadcast closure shared across the attempt.
    pub binary: TaskBinary,
    /// Placement hints, best candidates first.
    pub locality_hints: Vec<TaskLocation>,
    /// Map output tracker epoch at launch, used to detect stale completions.
    pub epoch: u64,
    /// Whether the task must be gang-scheduled with its siblings.
    pub barrier: bool,
    /// The job that triggered the submission of this stage attempt.
    pub job_id: JobId,
}

impl Display for Task {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            TaskKind::ShuffleMap { .. } => "ShuffleMapTask",
            TaskKind::Result { .. } => "ResultTask",
        };
        write!(
            f,
            "{kind}({}.{}, partition {})",
            self.stage_id, self.stage_attempt_id, self.partition
        )
    }
}

/// All tasks of one stage attempt, submitted to the task scheduler together.
#[derive(Debug, Clone)]
pub struct TaskSet {
    /// Stage the tasks belong to.
    pub stage_id: StageId,
    /// Stage attempt the tasks belong to.
    pub stage_attempt_id: usize,
    /// Scheduling priority: lower job ids run first.
    pub priority: JobId,
    /// Job properties propagated to the task scheduler.
    pub properties: std::collections::HashMap<String, String>,
    /// The tasks, one per missing partition.
    pub tasks: Vec<Task>,
}

impl TaskSet {
    /// Identifier used in logs, `"<stage>.<attempt>"`.
    pub fn id(&self) -> String {
        format!("{}.{}", self.stage_id, self.stage_attempt_id)
    }
}

/// Why a task finished, as reported by the task scheduler.
#[derive(Debug, Clone)]
pub enum TaskEndReason {
    /// The task completed and produced its output.
    Success,
    /// A previously successful task was resubmitted because its output was
    /// lost with its executor.
    Resubmitted,
    /// The task failed to fetch shuffle output of an upstream stage.
    FetchFailed {
        /// Block manager the fetch was attempted from, when known.
        address: Option<BlockManagerId>,
        /// The shuffle whose output was missing.
        shuffle_id: ShuffleId,
        /// The map output that could not be fetched; `None` means the
        /// failure could not be pinned to one map output.
        map_id: Option<usize>,
        /// The reduce partition doing the fetch.
        reduce_id: usize,
        /// Failure description from the executor.
        message: String,
    },
    /// User code or the runtime threw an exception on the executor.
    ExceptionFailure {
        /// Rendered exception message.
        description: String,
    },
    /// The task was killed intentionally.
    TaskKilled {
        /// Why the task was killed.
        reason: String,
    },
    /// The task finished but its result could not be retrieved.
    TaskResultLost,
    /// The commit coordinator refused the task's output commit.
    TaskCommitDenied {
        /// Job the denied task belonged to.
        job_id: JobId,
        /// Partition whose commit was denied.
        partition_id: usize,
        /// Attempt number that was denied.
        attempt_number: usize,
    },
    /// The executor running the task was lost.
    ExecutorLost {
        /// The lost executor.
        executor_id: String,
        /// Loss description.
        reason: String,
    },
    /// The task scheduler could not classify the failure.
    Unknown,
}

impl TaskEndReason {
    /// Short name for logs and telemetry.
    pub fn name(&self) -> &'static str {
        match self {
            TaskEndReason::Success => "Success",
            TaskEndReason::Resubmitted => "Resubmitted",
            TaskEndReason::FetchFailed { .. } => "FetchFailed",
            TaskEndReason::ExceptionFailure { .. } => "ExceptionFailure",
            TaskEndReason::TaskKilled { .. } => "TaskKilled",
            TaskEndReason::TaskResultLost => "TaskResultLost",
            TaskEndReason::TaskCommitDenied { .. } => "TaskCommitDenied",
            TaskEndReason::ExecutorLost { .. } => "ExecutorLost",
            TaskEndReason::Unknown => "Unknown",
        }
    }
}

/// A driver-side accumulator delta reported with a task completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccumUpdate {
    /// Accumulator identity.
    pub id: u64,
    /// Accumulator name, used in telemetry.
    pub name: String,
    /// Delta contributed by the task.
    pub delta: i64,
}

/// Information about one task attempt's execution, reported by the task
/// scheduler.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    /// Task identifier assigned by the task scheduler.
    pub task_id: u64,
    /// Attempt number of this task, starting at zero.
    pub attempt_number: usize,
    /// Executor the attempt ran on.
    pub executor_id: String,
    /// Host the attempt ran on.
    pub host: String,
    /// Launch timestamp in milliseconds.
    pub launch_time: u64,
    /// Finish timestamp in milliseconds, zero while running.
    pub finish_time: u64,
    /// Whether this attempt was launched speculatively.
    pub speculative: bool,
}

/// A task completion notification from the task scheduler.
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    /// The task that finished.
    pub task: Task,
    /// Why it finished.
    pub reason: TaskEndReason,
    /// The produced value on success.
    pub result: Option<TaskValue>,
    /// Driver-side accumulator deltas.
    pub accum_updates: Vec<AccumUpdate>,
    /// Execution details of the attempt.
    pub task_info: TaskInfo,
}
