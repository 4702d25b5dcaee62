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

//! Test scaffolding: a recording mock task scheduler and a deterministic
//! harness that feeds events straight into the event processor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use cinder_core::dataset::{
    DatasetGraph, DatasetId, DatasetSpec, Partitioner, ShuffleDependency, ShuffleId,
};
use cinder_core::error::{CinderError, Result};
use cinder_core::event_loop::EventSender;
use cinder_core::metadata::BlockManagerId;
use cinder_core::utils::timestamp_millis;

use crate::block_manager::InMemoryBlockManagerMaster;
use crate::config::SchedulerConfig;
use crate::dag_scheduler::DagEventProcessor;
use crate::event::DagEvent;
use crate::job::{JobId, JobListener};
use crate::map_output_tracker::{MapOutputTrackerMaster, MapStatus};
use crate::stage::StageId;
use crate::task::{
    CompletionEvent, ResultFunc, ShuffleMapClosure, Task, TaskEndReason, TaskInfo,
    TaskSet, TaskValue,
};
use crate::task_scheduler::TaskScheduler;

/// Task scheduler stub recording everything the DAG scheduler hands it.
#[derive(Default)]
pub struct MockTaskScheduler {
    submitted: Mutex<Vec<TaskSet>>,
    cancelled: Mutex<Vec<StageId>>,
    killed: Mutex<Vec<StageId>>,
    fail_cancel: AtomicBool,
}

impl MockTaskScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Removes and returns every task set submitted since the last call.
    pub fn take_task_sets(&self) -> Vec<TaskSet> {
        std::mem::take(&mut *self.submitted.lock())
    }

    pub fn cancelled_stages(&self) -> Vec<StageId> {
        self.cancelled.lock().clone()
    }

    pub fn killed_stages(&self) -> Vec<StageId> {
        self.killed.lock().clone()
    }

    /// Makes subsequent `cancel_tasks` calls fail, as a backend without
    /// kill support would.
    pub fn fail_cancellation(&self) {
        self.fail_cancel.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskScheduler for MockTaskScheduler {
    async fn submit_tasks(&self, task_set: TaskSet) -> Result<()> {
        self.submitted.lock().push(task_set);
        Ok(())
    }

    async fn cancel_tasks(&self, stage_id: StageId, _interrupt_thread: bool) -> Result<()> {
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(CinderError::General(
                "task cancellation is not supported by this backend".to_owned(),
            ));
        }
        self.cancelled.lock().push(stage_id);
        Ok(())
    }

    async fn kill_all_task_attempts(
        &self,
        stage_id: StageId,
        _interrupt_thread: bool,
        _reason: &str,
    ) -> Result<()> {
        self.killed.lock().push(stage_id);
        Ok(())
    }

    async fn kill_task_attempt(
        &self,
        _task_id: u64,
        _interrupt_thread: bool,
        _reason: &str,
    ) -> Result<bool> {
        Ok(true)
    }
}

/// Job listener recording delivered outputs and the failure message.
#[derive(Default)]
pub struct TestJobListener {
    results: Mutex<Vec<(usize, TaskValue)>>,
    failure: Mutex<Option<String>>,
}

impl TestJobListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn results(&self) -> Vec<(usize, TaskValue)> {
        self.results.lock().clone()
    }

    pub fn num_results(&self) -> usize {
        self.results.lock().len()
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }
}

impl JobListener for TestJobListener {
    fn task_succeeded(&self, index: usize, result: &TaskValue) -> Result<()> {
        self.results.lock().push((index, result.clone()));
        Ok(())
    }

    fn job_failed(&self, error: &CinderError) {
        *self.failure.lock() = Some(error.to_string());
    }
}

/// A result function whose encoded form is a single marker byte.
pub struct NoopFunc;

impl ResultFunc for NoopFunc {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(vec![0])
    }
}

/// A result function that cannot be encoded, for serialization failure
/// paths.
pub struct UnserializableFunc;

impl ResultFunc for UnserializableFunc {
    fn encode(&self) -> Result<Vec<u8>> {
        Err(CinderError::General(
            "closure captures a non-serializable handle".to_owned(),
        ))
    }
}

/// Registers a chain of `num_shuffles` shuffles over a fresh source
/// dataset, each stage with `partitions` partitions. Returns the final
/// dataset and the shuffle dependencies, source side first.
pub fn shuffle_chain(
    graph: &DatasetGraph,
    num_shuffles: usize,
    partitions: usize,
) -> (DatasetId, Vec<ShuffleDependency>) {
    let mut dataset = graph.register(DatasetSpec::new("source", partitions));
    let mut deps = vec![];
    for i in 0..num_shuffles {
        let dep = graph.shuffle_dependency(dataset, Partitioner::Hash { partitions });
        deps.push(dep.clone());
        dataset = graph
            .register(DatasetSpec::new(format!("reduce-{i}"), partitions).with_shuffle(dep));
    }
    (dataset, deps)
}

/// Builds a successful completion for a shuffle map task, with the reduce
/// partition count recovered from the broadcast closure.
pub fn shuffle_success(task: &Task, executor: &str) -> CompletionEvent {
    let closure: ShuffleMapClosure =
        bincode::deserialize(task.binary.bytes()).expect("shuffle map closure");
    let status = MapStatus::new(
        BlockManagerId::new(executor, format!("host-{executor}"), 7070),
        vec![1; closure.num_output_partitions],
    );
    CompletionEvent {
        task: task.clone(),
        reason: TaskEndReason::Success,
        result: Some(TaskValue::MapStatus(status)),
        accum_updates: vec![],
        task_info: plain_task_info(executor),
    }
}

/// Builds a successful completion for a result task.
pub fn result_success(task: &Task, payload: Vec<u8>) -> CompletionEvent {
    CompletionEvent {
        task: task.clone(),
        reason: TaskEndReason::Success,
        result: Some(TaskValue::Bytes(payload)),
        accum_updates: vec![],
        task_info: plain_task_info("exec-result"),
    }
}

fn plain_task_info(executor: &str) -> TaskInfo {
    TaskInfo {
        task_id: 0,
        attempt_number: 0,
        executor_id: executor.to_owned(),
        host: format!("host-{executor}"),
        launch_time: timestamp_millis(),
        finish_time: timestamp_millis(),
        speculative: false,
    }
}

/// Deterministic wrapper around the event processor: events are handed to
/// the handler inline, while timer posts and reposted events surface on
/// `next_posted_event`.
pub struct SchedulerHarness {
    pub graph: Arc<DatasetGraph>,
    pub processor: Arc<DagEventProcessor>,
    pub task_scheduler: Arc<MockTaskScheduler>,
    pub block_manager: Arc<InMemoryBlockManagerMaster>,
    sender: EventSender<DagEvent>,
    events_rx: mpsc::UnboundedReceiver<DagEvent>,
    next_job_id: AtomicUsize,
    next_task_id: AtomicU64,
}

impl SchedulerHarness {
    pub fn new(graph: Arc<DatasetGraph>, config: SchedulerConfig) -> Self {
        let (tx, events_rx) = mpsc::unbounded_channel();
        let task_scheduler = MockTaskScheduler::new();
        let block_manager = Arc::new(InMemoryBlockManagerMaster::new());
        let processor = Arc::new(DagEventProcessor::new(
            graph.clone(),
            task_scheduler.clone(),
            block_manager.clone(),
            config,
        ));
        Self {
            graph,
            processor,
            task_scheduler,
            block_manager,
            sender: EventSender::new(tx),
            events_rx,
            next_job_id: AtomicUsize::new(0),
            next_task_id: AtomicU64::new(0),
        }
    }

    /// Runs one event through the processor.
    pub async fn process(&self, event: DagEvent) -> Result<()> {
        self.processor.process(event, &self.sender).await
    }

    /// Waits for an event posted back onto the queue by a handler or a
    /// timer, without processing it.
    pub async fn next_posted_event(&mut self, timeout: Duration) -> Option<DagEvent> {
        tokio::time::timeout(timeout, self.events_rx.recv())
            .await
            .ok()
            .flatten()
    }

    pub async fn submit(
        &self,
        dataset: DatasetId,
        partitions: &[usize],
    ) -> Result<(JobId, Arc<TestJobListener>)> {
        self.submit_with_properties(dataset, partitions, HashMap::new()).await
    }

    pub async fn submit_with_properties(
        &self,
        dataset: DatasetId,
        partitions: &[usize],
        properties: HashMap<String, String>,
    ) -> Result<(JobId, Arc<TestJobListener>)> {
        let job_id = JobId(self.next_job_id.fetch_add(1, Ordering::SeqCst));
        let listener = TestJobListener::new();
        self.process(DagEvent::JobSubmitted {
            job_id,
            dataset,
            func: Arc::new(NoopFunc),
            partitions: partitions.to_vec(),
            call_site: format!("collect at test:{job_id}"),
            listener: listener.clone(),
            properties,
        })
        .await?;
        Ok((job_id, listener))
    }

    pub fn take_task_sets(&self) -> Vec<TaskSet> {
        self.task_scheduler.take_task_sets()
    }

    /// One submitted task set, asserting there is exactly one.
    pub fn take_single_task_set(&self) -> TaskSet {
        let mut sets = self.take_task_sets();
        assert_eq!(sets.len(), 1, "expected exactly one submitted task set");
        sets.remove(0)
    }

    pub fn task_info(&self, executor: &str) -> TaskInfo {
        TaskInfo {
            task_id: self.next_task_id.fetch_add(1, Ordering::SeqCst),
            attempt_number: 0,
            executor_id: executor.to_owned(),
            host: format!("host-{executor}"),
            launch_time: timestamp_millis(),
            finish_time: timestamp_millis(),
            speculative: false,
        }
    }

    pub fn block_manager_id(executor: &str) -> BlockManagerId {
        BlockManagerId::new(executor, format!("host-{executor}"), 7070)
    }

    /// Reports a successful shuffle map task run on `executor`. The reduce
    /// partition count is recovered from the broadcast closure.
    pub async fn complete_shuffle_map_task(&self, task: &Task, executor: &str) -> Result<()> {
        let closure: ShuffleMapClosure =
            bincode::deserialize(task.binary.bytes()).expect("shuffle map closure");
        let status = MapStatus::new(
            Self::block_manager_id(executor),
            vec![1; closure.num_output_partitions],
        );
        self.process(DagEvent::TaskCompleted(Box::new(CompletionEvent {
            task: task.clone(),
            reason: TaskEndReason::Success,
            result: Some(TaskValue::MapStatus(status)),
            accum_updates: vec![],
            task_info: self.task_info(executor),
        })))
        .await
    }

    /// Completes every task of a shuffle map task set, each on its own
    /// executor (`exec-<stage>-<partition>`).
    pub async fn complete_shuffle_map_stage(&self, task_set: &TaskSet) -> Result<()> {
        for task in &task_set.tasks {
            self.complete_shuffle_map_task(
                task,
                &format!("exec-{}-{}", task_set.stage_id, task.partition),
            )
            .await?;
        }
        Ok(())
    }

    /// Reports a successful result task.
    pub async fn complete_result_task(&self, task: &Task, payload: Vec<u8>) -> Result<()> {
        self.process(DagEvent::TaskCompleted(Box::new(CompletionEvent {
            task: task.clone(),
            reason: TaskEndReason::Success,
            result: Some(TaskValue::Bytes(payload)),
            accum_updates: vec![],
            task_info: self.task_info("exec-result"),
        })))
        .await
    }

    /// Reports a fetch failure of `task` against one map output of
    /// `shuffle_id` served by `executor`.
    pub async fn fetch_fail_task(
        &self,
        task: &Task,
        shuffle_id: ShuffleId,
        map_id: Option<usize>,
        executor: &str,
    ) -> Result<()> {
        self.process(DagEvent::TaskCompleted(Box::new(CompletionEvent {
            task: task.clone(),
            reason: TaskEndReason::FetchFailed {
                address: Some(Self::block_manager_id(executor)),
                shuffle_id,
                map_id,
                reduce_id: task.partition,
                message: "connection reset by peer".to_owned(),
            },
            result: None,
            accum_updates: vec![],
            task_info: self.task_info(executor),
        })))
        .await
    }

    pub fn tracker(&self) -> Arc<MapOutputTrackerMaster> {
        self.processor.map_output_tracker.clone()
    }

    pub async fn active_job_count(&self) -> usize {
        self.processor.state.lock().await.active_jobs.len()
    }

    pub async fn is_job_active(&self, job_id: JobId) -> bool {
        self.processor.state.lock().await.active_jobs.contains_key(&job_id)
    }

    pub async fn registered_stage_count(&self) -> usize {
        self.processor.state.lock().await.registry.len()
    }

    pub async fn stage_parents(&self, stage_id: StageId) -> Vec<StageId> {
        self.processor
            .state
            .lock()
            .await
            .registry
            .get(stage_id)
            .map(|stage| stage.parents().to_vec())
            .unwrap_or_default()
    }

    pub async fn running_stages(&self) -> Vec<StageId> {
        let state = self.processor.state.lock().await;
        let mut running: Vec<StageId> = state.running_stages.iter().copied().collect();
        running.sort();
        running
    }

    pub async fn waiting_stages(&self) -> Vec<StageId> {
        let state = self.processor.state.lock().await;
        let mut waiting: Vec<StageId> = state.waiting_stages.iter().copied().collect();
        waiting.sort();
        waiting
    }

    pub async fn executor_failure_epoch(&self, executor: &str) -> Option<u64> {
        self.processor
            .state
            .lock()
            .await
            .epochs
            .executor_failure_epoch(executor)
    }

    pub async fn shuffle_file_lost_epoch(&self, executor: &str) -> Option<u64> {
        self.processor
            .state
            .lock()
            .await
            .epochs
            .shuffle_file_lost_epoch(executor)
    }
}
