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

//! Interface to the lower-level task scheduler that places tasks on
//! executors.

use async_trait::async_trait;

use cinder_core::error::Result;
use cinder_core::event_loop::EventSender;

use crate::event::DagEvent;
use crate::stage::StageId;
use crate::task::TaskSet;

/// The task scheduler consumes task sets of runnable stages, decides which
/// executor runs each task, and reports completions back to the DAG
/// scheduler by posting [`DagEvent`]s.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    /// Wires the task scheduler to the DAG scheduler's event queue. Called
    /// once during scheduler construction.
    fn set_dag_scheduler(&self, _events: EventSender<DagEvent>) {}

    /// Submits all tasks of one stage attempt.
    async fn submit_tasks(&self, task_set: TaskSet) -> Result<()>;

    /// Cancels the running task set of a stage. Returns an error when the
    /// backend cannot kill tasks; scheduler-side cleanup still proceeds.
    async fn cancel_tasks(&self, stage_id: StageId, interrupt_thread: bool) -> Result<()>;

    /// Kills every attempt of every task of a stage, without tearing down
    /// the task set, so the stage can be retried.
    async fn kill_all_task_attempts(
        &self,
        stage_id: StageId,
        interrupt_thread: bool,
        reason: &str,
    ) -> Result<()>;

    /// Kills a single task attempt. Returns whether the attempt was found.
    async fn kill_task_attempt(
        &self,
        task_id: u64,
        interrupt_thread: bool,
        reason: &str,
    ) -> Result<bool>;
}
