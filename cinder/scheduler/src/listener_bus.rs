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

//! The telemetry sink: lifecycle events fanned out to registered listeners.

use std::collections::HashMap;
use std::sync::Arc;

use log::trace;
use parking_lot::RwLock;

use crate::job::JobId;
use crate::stage::{StageId, StageInfo};
use crate::task::{AccumUpdate, TaskInfo};

/// Terminal outcome of a job, as reported to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// The job delivered every output.
    Succeeded,
    /// The job was aborted or cancelled, with the failure message.
    Failed(String),
}

/// Scheduler lifecycle events delivered to listeners.
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    /// A job started executing.
    JobStart {
        /// The started job.
        job_id: JobId,
        /// Event time, milliseconds since epoch.
        time: u64,
        /// Current attempt info of every stage of the job.
        stage_infos: Vec<StageInfo>,
        /// Job properties.
        properties: HashMap<String, String>,
    },
    /// A job terminated.
    JobEnd {
        /// The terminated job.
        job_id: JobId,
        /// Event time, milliseconds since epoch.
        time: u64,
        /// How the job ended.
        result: JobResult,
    },
    /// A stage attempt was handed to the task scheduler.
    StageSubmitted {
        /// The submitted attempt.
        stage_info: StageInfo,
        /// Properties of the driving job.
        properties: HashMap<String, String>,
    },
    /// A stage attempt finished, successfully or not.
    StageCompleted {
        /// The finished attempt, with completion time and failure reason.
        stage_info: StageInfo,
    },
    /// A task attempt was launched.
    TaskStart {
        /// Stage of the task.
        stage_id: StageId,
        /// Stage attempt of the task.
        stage_attempt_id: usize,
        /// Launch details.
        task_info: TaskInfo,
    },
    /// A task attempt began fetching its remote result.
    TaskGettingResult {
        /// Fetch details.
        task_info: TaskInfo,
    },
    /// A task attempt finished.
    TaskEnd {
        /// Stage of the task.
        stage_id: StageId,
        /// Stage attempt of the task.
        stage_attempt_id: usize,
        /// Kind of task, `"ShuffleMapTask"` or `"ResultTask"`.
        task_type: &'static str,
        /// Completion reason name.
        reason: &'static str,
        /// Execution details.
        task_info: TaskInfo,
        /// Accumulator deltas reported with the completion.
        accum_updates: Vec<AccumUpdate>,
    },
    /// Periodic executor metrics forwarded from heartbeats.
    ExecutorMetricsUpdate {
        /// Reporting executor.
        executor_id: String,
        /// In-flight accumulator values.
        accum_updates: Vec<AccumUpdate>,
    },
    /// A speculative task copy was requested.
    SpeculativeTaskSubmitted {
        /// Stage of the speculated task.
        stage_id: StageId,
        /// Stage attempt of the speculated task.
        stage_attempt_id: usize,
    },
}

impl ListenerEvent {
    /// Short name of the event kind.
    pub fn event_type(&self) -> &'static str {
        match self {
            ListenerEvent::JobStart { .. } => "JobStart",
            ListenerEvent::JobEnd { .. } => "JobEnd",
            ListenerEvent::StageSubmitted { .. } => "StageSubmitted",
            ListenerEvent::StageCompleted { .. } => "StageCompleted",
            ListenerEvent::TaskStart { .. } => "TaskStart",
            ListenerEvent::TaskGettingResult { .. } => "TaskGettingResult",
            ListenerEvent::TaskEnd { .. } => "TaskEnd",
            ListenerEvent::ExecutorMetricsUpdate { .. } => "ExecutorMetricsUpdate",
            ListenerEvent::SpeculativeTaskSubmitted { .. } => "SpeculativeTaskSubmitted",
        }
    }
}

/// Interface for observing scheduler lifecycle events.
pub trait SchedulerListener: Send + Sync {
    /// Called for every posted event, in post order.
    fn on_event(&self, event: &ListenerEvent);
}

/// Fans lifecycle events out to registered listeners.
#[derive(Default)]
pub struct ListenerBus {
    listeners: RwLock<Vec<Arc<dyn SchedulerListener>>>,
}

impl ListenerBus {
    /// Creates a bus with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for all subsequent events.
    pub fn register(&self, listener: Arc<dyn SchedulerListener>) {
        self.listeners.write().push(listener);
    }

    /// Delivers an event to every registered listener.
    pub fn post(&self, event: ListenerEvent) {
        trace!("Posting {} to listener bus", event.event_type());
        for listener in self.listeners.read().iter() {
            listener.on_event(&event);
        }
    }
}
