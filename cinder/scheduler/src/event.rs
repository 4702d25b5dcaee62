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

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use cinder_core::dataset::{DatasetId, ShuffleDependency};

use crate::job::{JobId, JobListener};
use crate::stage::StageId;
use crate::task::{CompletionEvent, ResultFunc, Task, TaskInfo};

/// Why an executor was lost, as reported by the cluster manager.
#[derive(Clone, Debug)]
pub enum ExecutorLossReason {
    /// The executor was killed on request.
    ExecutorKilled,
    /// The executor process exited.
    ExecutorExited {
        /// Process exit code.
        exit_code: i32,
        /// Loss description.
        message: String,
    },
    /// The whole worker hosting the executor was lost, taking any shuffle
    /// files it served with it.
    WorkerLost {
        /// Loss description.
        message: String,
    },
}

impl ExecutorLossReason {
    /// Whether shuffle files served from the executor's host are gone too.
    pub fn worker_lost(&self) -> bool {
        matches!(self, ExecutorLossReason::WorkerLost { .. })
    }
}

/// Events drained by the DAG scheduler's event loop. All scheduler state
/// mutation happens in the handlers of these events.
pub enum DagEvent {
    /// A job over a dataset's partitions was submitted.
    JobSubmitted {
        /// Pre-allocated job id.
        job_id: JobId,
        /// Final dataset of the job.
        dataset: DatasetId,
        /// Function applied to computed partitions.
        func: Arc<dyn ResultFunc>,
        /// Dataset partitions to compute.
        partitions: Vec<usize>,
        /// Call site of the submitting action.
        call_site: String,
        /// Receives results and termination.
        listener: Arc<dyn JobListener>,
        /// Job properties.
        properties: HashMap<String, String>,
    },
    /// A job running just a shuffle map stage was submitted.
    MapStageSubmitted {
        /// Pre-allocated job id.
        job_id: JobId,
        /// The shuffle to materialize.
        dependency: ShuffleDependency,
        /// Call site of the submitting action.
        call_site: String,
        /// Receives the map output statistics and termination.
        listener: Arc<dyn JobListener>,
        /// Job properties.
        properties: HashMap<String, String>,
    },
    /// Cancellation of one stage and every job depending on it.
    StageCancelled {
        /// The stage to cancel.
        stage_id: StageId,
        /// Caller-provided reason.
        reason: Option<String>,
    },
    /// Cancellation of one job.
    JobCancelled {
        /// The job to cancel.
        job_id: JobId,
        /// Caller-provided reason.
        reason: Option<String>,
    },
    /// Cancellation of every job carrying the given group property.
    JobGroupCancelled {
        /// The job group to cancel.
        group_id: String,
    },
    /// Cancellation of every active job.
    AllJobsCancelled,
    /// An executor joined the cluster.
    ExecutorAdded {
        /// The new executor.
        executor_id: String,
        /// Host it runs on.
        host: String,
    },
    /// An executor was lost.
    ExecutorLost {
        /// The lost executor.
        executor_id: String,
        /// Why it was lost.
        reason: ExecutorLossReason,
    },
    /// A worker was removed; shuffle files on its host are gone.
    WorkerRemoved {
        /// The removed worker.
        worker_id: String,
        /// Host the worker ran on.
        host: String,
        /// Removal description.
        message: String,
    },
    /// A task began executing. Telemetry only.
    TaskStarted {
        /// The launched task.
        task: Task,
        /// Launch details.
        task_info: TaskInfo,
    },
    /// A task began fetching its remote result. Telemetry only.
    TaskGettingResult {
        /// Fetch details.
        task_info: TaskInfo,
    },
    /// A speculative copy of a task was requested. Telemetry only.
    SpeculativeTaskSubmitted {
        /// Stage of the speculated task.
        stage_id: StageId,
        /// Stage attempt of the speculated task.
        stage_attempt_id: usize,
    },
    /// A task finished; drives the completion state machine.
    TaskCompleted(Box<CompletionEvent>),
    /// The task scheduler gave up on a whole task set.
    TaskSetFailed {
        /// Stage whose task set failed.
        stage_id: StageId,
        /// Failure description.
        reason: String,
    },
    /// Debounced retry of stages that failed with fetch failures.
    ResubmitFailedStages,
}

impl DagEvent {
    /// Short name of the event kind, for logs and metrics.
    pub fn event_type(&self) -> &'static str {
        match self {
            DagEvent::JobSubmitted { .. } => "JobSubmitted",
            DagEvent::MapStageSubmitted { .. } => "MapStageSubmitted",
            DagEvent::StageCancelled { .. } => "StageCancelled",
            DagEvent::JobCancelled { .. } => "JobCancelled",
            DagEvent::JobGroupCancelled { .. } => "JobGroupCancelled",
            DagEvent::AllJobsCancelled => "AllJobsCancelled",
            DagEvent::ExecutorAdded { .. } => "ExecutorAdded",
            DagEvent::ExecutorLost { .. } => "ExecutorLost",
            DagEvent::WorkerRemoved { .. } => "WorkerRemoved",
            DagEvent::TaskStarted { .. } => "TaskStarted",
            DagEvent::TaskGettingResult { .. } => "TaskGettingResult",
            DagEvent::SpeculativeTaskSubmitted { .. } => "SpeculativeTaskSubmitted",
            DagEvent::TaskCompleted(_) => "TaskCompleted",
            DagEvent::TaskSetFailed { .. } => "TaskSetFailed",
            DagEvent::ResubmitFailedStages => "ResubmitFailedStages",
        }
    }
}

impl Debug for DagEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DagEvent::JobSubmitted { job_id, .. } => {
                write!(f, "JobSubmitted({job_id})")
            }
            DagEvent::MapStageSubmitted { job_id, .. } => {
                write!(f, "MapStageSubmitted({job_id})")
            }
            DagEvent::StageCancelled { stage_id, .. } => {
                write!(f, "StageCancelled({stage_id})")
            }
            DagEvent::JobCancelled { job_id, .. } => {
                write!(f, "JobCancelled({job_id})")
            }
            DagEvent::JobGroupCancelled { group_id } => {
                write!(f, "JobGroupCancelled({group_id})")
            }
            DagEvent::AllJobsCancelled => write!(f, "AllJobsCancelled"),
            DagEvent::ExecutorAdded { executor_id, .. } => {
                write!(f, "ExecutorAdded({executor_id})")
            }
            DagEvent::ExecutorLost { executor_id, .. } => {
                write!(f, "ExecutorLost({executor_id})")
            }
            DagEvent::WorkerRemoved { worker_id, .. } => {
                write!(f, "WorkerRemoved({worker_id})")
            }
            DagEvent::TaskStarted { task, .. } => write!(f, "TaskStarted({task})"),
            DagEvent::TaskGettingResult { task_info } => {
                write!(f, "TaskGettingResult({})", task_info.task_id)
            }
            DagEvent::SpeculativeTaskSubmitted { stage_id, .. } => {
                write!(f, "SpeculativeTaskSubmitted({stage_id})")
            }
            DagEvent::TaskCompleted(event) => {
                write!(f, "TaskCompleted({}, {})", event.task, event.reason.name())
            }
            DagEvent::TaskSetFailed { stage_id, .. } => {
                write!(f, "TaskSetFailed({stage_id})")
            }
            DagEvent::ResubmitFailedStages => write!(f, "ResubmitFailedStages"),
        }
    }
}
