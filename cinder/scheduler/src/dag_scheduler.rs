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

//! The stage-oriented DAG scheduler.
//!
//! Jobs arrive as lazy dataset lineage and are decomposed into stages at
//! shuffle boundaries. A stage moves through a small lifecycle, always on
//! the event loop:
//!
//! ```text
//!             none ──────────────▶ waiting
//!               ▲                     │ parents available
//!               │ removed             ▼
//!             failed ◀─────────── running ──▶ finished
//!                      fetch failure   (left when tasks complete
//!                                       or the stage is aborted)
//! ```
//!
//! A stage is in at most one of {waiting, running, failed}. Completions of
//! shuffle map tasks register map outputs with the map output tracker; when
//! a running shuffle map stage has no pending partitions left it either
//! unlocks its waiting children or, if some outputs were discarded as
//! stale, resubmits itself. Fetch failures mark the consumer stage and the
//! producer stage failed and schedule one debounced resubmission per burst.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_recursion::async_recursion;
use async_trait::async_trait;
use log::{debug, error, info, warn};

use cinder_core::dataset::{
    DatasetGraph, DatasetId, Dependency, ShuffleDependency,
};
use cinder_core::error::{CinderError, Result};
use cinder_core::event_loop::{EventAction, EventLoop, EventSender};
use cinder_core::metadata::TaskLocation;
use cinder_core::utils::timestamp_millis;

use crate::block_manager::BlockManagerMaster;
use crate::cache_index::CacheLocationIndex;
use crate::commit_coordinator::OutputCommitCoordinator;
use crate::config::{SchedulerConfig, JOB_GROUP_ID_KEY};
use crate::epoch::FailureEpochTracker;
use crate::event::{DagEvent, ExecutorLossReason};
use crate::job::{
    ActiveJob, ApproximateActionListener, ApproximateEvaluator, JobId, JobListener,
    JobWaiter, PartialResult,
};
use crate::listener_bus::{JobResult, ListenerBus, ListenerEvent};
use crate::map_output_tracker::{MapOutputStatistics, MapOutputTrackerMaster};
use crate::registry::StageRegistry;
use crate::stage::{ResultStage, ShuffleMapStage, Stage, StageId};
use crate::task::{
    encode_result_closure, encode_shuffle_map_closure, AccumUpdate, CompletionEvent,
    ResultFunc, Task, TaskBinary, TaskEndReason, TaskInfo, TaskKind, TaskSet, TaskValue,
};
use crate::task_scheduler::TaskScheduler;

/// Mutable scheduler state. Only the event loop task touches it, so every
/// invariant can be checked as a pre/post condition of one event handler.
pub(crate) struct SchedulerState {
    pub(crate) registry: StageRegistry,
    pub(crate) active_jobs: HashMap<JobId, ActiveJob>,
    pub(crate) waiting_stages: HashSet<StageId>,
    pub(crate) running_stages: HashSet<StageId>,
    pub(crate) failed_stages: HashSet<StageId>,
    pub(crate) epochs: FailureEpochTracker,
    barrier_check_failures: HashMap<JobId, usize>,
    accumulators: HashMap<u64, i64>,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            registry: StageRegistry::new(),
            active_jobs: HashMap::new(),
            waiting_stages: HashSet::new(),
            running_stages: HashSet::new(),
            failed_stages: HashSet::new(),
            epochs: FailureEpochTracker::new(),
            barrier_check_failures: HashMap::new(),
            accumulators: HashMap::new(),
        }
    }
}

enum StageWork {
    ShuffleMap {
        dep: ShuffleDependency,
    },
    Result {
        func: Arc<dyn ResultFunc>,
    },
}

/// Drains [`DagEvent`]s onto the scheduler state.
pub(crate) struct DagEventProcessor {
    graph: Arc<DatasetGraph>,
    config: SchedulerConfig,
    task_scheduler: Arc<dyn TaskScheduler>,
    block_manager: Arc<dyn BlockManagerMaster>,
    pub(crate) map_output_tracker: Arc<MapOutputTrackerMaster>,
    pub(crate) listener_bus: Arc<ListenerBus>,
    pub(crate) commit_coordinator: Arc<OutputCommitCoordinator>,
    pub(crate) cache_index: Arc<CacheLocationIndex>,
    pub(crate) state: tokio::sync::Mutex<SchedulerState>,
}

#[async_trait]
impl EventAction<DagEvent> for DagEventProcessor {
    fn on_start(&self) {
        info!("Starting the DAG scheduler event loop");
    }

    fn on_stop(&self) {
        info!("Stopping the DAG scheduler event loop");
    }

    async fn on_receive(
        &self,
        event: DagEvent,
        sender: &EventSender<DagEvent>,
    ) -> Result<()> {
        self.process(event, sender).await
    }

    fn on_error(&self, err: CinderError) {
        error!("Error received by the DAG scheduler event loop: {err}");
    }
}

impl DagEventProcessor {
    pub(crate) fn new(
        graph: Arc<DatasetGraph>,
        task_scheduler: Arc<dyn TaskScheduler>,
        block_manager: Arc<dyn BlockManagerMaster>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            graph,
            config,
            task_scheduler,
            block_manager: block_manager.clone(),
            map_output_tracker: Arc::new(MapOutputTrackerMaster::new()),
            listener_bus: Arc::new(ListenerBus::new()),
            commit_coordinator: Arc::new(OutputCommitCoordinator::new()),
            cache_index: Arc::new(CacheLocationIndex::new(block_manager)),
            state: tokio::sync::Mutex::new(SchedulerState::new()),
        }
    }

    pub(crate) async fn process(
        &self,
        event: DagEvent,
        sender: &EventSender<DagEvent>,
    ) -> Result<()> {
        debug!("Processing event {event:?}");
        let mut state = self.state.lock().await;
        let state = &mut *state;
        match event {
            DagEvent::JobSubmitted {
                job_id,
                dataset,
                func,
                partitions,
                call_site,
                listener,
                properties,
            } => {
                self.handle_job_submitted(
                    state, sender, job_id, dataset, func, partitions, call_site,
                    listener, properties,
                )
                .await?;
            }
            DagEvent::MapStageSubmitted {
                job_id,
                dependency,
                call_site,
                listener,
                properties,
            } => {
                self.handle_map_stage_submitted(
                    state, job_id, dependency, call_site, listener, properties,
                )
                .await?;
            }
            DagEvent::StageCancelled { stage_id, reason } => {
                self.handle_stage_cancellation(state, stage_id, reason).await?;
            }
            DagEvent::JobCancelled { job_id, reason } => {
                self.handle_job_cancellation(state, job_id, reason).await?;
            }
            DagEvent::JobGroupCancelled { group_id } => {
                self.handle_job_group_cancelled(state, &group_id).await?;
            }
            DagEvent::AllJobsCancelled => {
                let mut job_ids: Vec<JobId> = state.active_jobs.keys().copied().collect();
                job_ids.sort();
                for job_id in job_ids {
                    self.handle_job_cancellation(
                        state,
                        job_id,
                        Some("as part of cancellation of all jobs".to_owned()),
                    )
                    .await?;
                }
            }
            DagEvent::ExecutorAdded { executor_id, host } => {
                if state.epochs.clear_executor(&executor_id) {
                    info!(
                        "Executor {executor_id} on host {host} was in the lost list \
                    earlier, forgetting its failure epochs"
                    );
                }
            }
            DagEvent::ExecutorLost {
                executor_id,
                reason,
            } => {
                self.handle_executor_lost(state, &executor_id, &reason).await?;
            }
            DagEvent::WorkerRemoved {
                worker_id,
                host,
                message,
            } => {
                warn!("Worker {worker_id} on host {host} removed: {message}");
                self.map_output_tracker.remove_outputs_on_host(&host);
                self.cache_index.clear();
            }
            DagEvent::TaskStarted { task, task_info } => {
                self.listener_bus.post(ListenerEvent::TaskStart {
                    stage_id: task.stage_id,
                    stage_attempt_id: task.stage_attempt_id,
                    task_info,
                });
            }
            DagEvent::TaskGettingResult { task_info } => {
                self.listener_bus
                    .post(ListenerEvent::TaskGettingResult { task_info });
            }
            DagEvent::SpeculativeTaskSubmitted {
                stage_id,
                stage_attempt_id,
            } => {
                self.listener_bus.post(ListenerEvent::SpeculativeTaskSubmitted {
                    stage_id,
                    stage_attempt_id,
                });
            }
            DagEvent::TaskCompleted(completion) => {
                self.handle_task_completion(state, sender, *completion).await?;
            }
            DagEvent::TaskSetFailed { stage_id, reason } => {
                self.abort_stage(state, stage_id, &reason).await?;
            }
            DagEvent::ResubmitFailedStages => {
                self.resubmit_failed_stages(state).await?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Job submission
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn handle_job_submitted(
        &self,
        state: &mut SchedulerState,
        sender: &EventSender<DagEvent>,
        job_id: JobId,
        dataset: DatasetId,
        func: Arc<dyn ResultFunc>,
        partitions: Vec<usize>,
        call_site: String,
        listener: Arc<dyn JobListener>,
        properties: HashMap<String, String>,
    ) -> Result<()> {
        let final_stage = match self.create_result_stage(
            state,
            dataset,
            func.clone(),
            partitions.clone(),
            job_id,
            call_site.clone(),
        ) {
            Ok(stage_id) => stage_id,
            Err(CinderError::BarrierSlotsExceeded(required, available)) => {
                let failures = state.barrier_check_failures.entry(job_id).or_insert(0);
                *failures += 1;
                if *failures
                    <= self.config.barrier_max_concurrent_tasks_check_max_failures
                {
                    warn!(
                        "Barrier stage of job {job_id} requires {required} task slots \
                    but only {available} are available, retrying in {:?} (check {} of {})",
                        self.config.barrier_max_concurrent_tasks_check_interval,
                        failures,
                        self.config.barrier_max_concurrent_tasks_check_max_failures
                    );
                    schedule_event(
                        sender.clone(),
                        self.config.barrier_max_concurrent_tasks_check_interval,
                        DagEvent::JobSubmitted {
                            job_id,
                            dataset,
                            func,
                            partitions,
                            call_site,
                            listener,
                            properties,
                        },
                    );
                } else {
                    state.barrier_check_failures.remove(&job_id);
                    listener.job_failed(&CinderError::BarrierSlotsExceeded(
                        required, available,
                    ));
                }
                return Ok(());
            }
            Err(e) => {
                warn!("Creating the final stage for job {job_id} failed: {e}");
                listener.job_failed(&e);
                return Ok(());
            }
        };
        state.barrier_check_failures.remove(&job_id);

        info!(
            "Got job {job_id} ({call_site}) with {} output partitions",
            partitions.len()
        );
        let num_partitions = partitions.len();
        let job = ActiveJob::new(
            job_id,
            final_stage,
            call_site,
            listener,
            properties.clone(),
            num_partitions,
        );
        self.cache_index.clear();
        if let Some(result) = state
            .registry
            .get_mut(final_stage)
            .and_then(Stage::as_result_mut)
        {
            result.active_job = Some(job_id);
        }
        state.active_jobs.insert(job_id, job);
        state.registry.update_job_id_stage_id_maps(job_id, final_stage);

        self.post_job_start(state, job_id, properties);
        self.submit_stage(state, final_stage).await
    }

    async fn handle_map_stage_submitted(
        &self,
        state: &mut SchedulerState,
        job_id: JobId,
        dependency: ShuffleDependency,
        call_site: String,
        listener: Arc<dyn JobListener>,
        properties: HashMap<String, String>,
    ) -> Result<()> {
        let final_stage =
            match self.get_or_create_shuffle_map_stage(state, &dependency, job_id) {
                Ok(stage_id) => stage_id,
                Err(e) => {
                    warn!("Creating the map stage for job {job_id} failed: {e}");
                    listener.job_failed(&e);
                    return Ok(());
                }
            };

        info!(
            "Got map stage job {job_id} ({call_site}) with {} output partitions",
            self.graph.num_partitions(dependency.parent)
        );
        let job = ActiveJob::new(
            job_id,
            final_stage,
            call_site,
            listener,
            properties.clone(),
            self.graph.num_partitions(dependency.parent),
        );
        self.cache_index.clear();
        state.active_jobs.insert(job_id, job);
        state.registry.update_job_id_stage_id_maps(job_id, final_stage);
        if let Some(map_stage) = state
            .registry
            .get_mut(final_stage)
            .and_then(Stage::as_shuffle_map_mut)
        {
            map_stage.map_stage_jobs.push(job_id);
        }

        self.post_job_start(state, job_id, properties);

        // The shuffle may have been materialized by an earlier job.
        if self.is_map_stage_available(state, final_stage) {
            self.mark_map_stage_job_as_finished(state, job_id, dependency.shuffle_id);
            Ok(())
        } else {
            self.submit_stage(state, final_stage).await
        }
    }

    fn post_job_start(
        &self,
        state: &SchedulerState,
        job_id: JobId,
        properties: HashMap<String, String>,
    ) {
        let mut stage_ids: Vec<StageId> =
            state.registry.stage_ids_for_job(job_id).into_iter().collect();
        stage_ids.sort();
        let stage_infos = stage_ids
            .iter()
            .filter_map(|id| state.registry.get(*id))
            .map(|stage| stage.latest_info().clone())
            .collect();
        self.listener_bus.post(ListenerEvent::JobStart {
            job_id,
            time: timestamp_millis(),
            stage_infos,
            properties,
        });
    }

    // ------------------------------------------------------------------
    // Stage construction
    // ------------------------------------------------------------------

    fn create_result_stage(
        &self,
        state: &mut SchedulerState,
        dataset: DatasetId,
        func: Arc<dyn ResultFunc>,
        partitions: Vec<usize>,
        job_id: JobId,
        call_site: String,
    ) -> Result<StageId> {
        self.check_barrier_stage_with_dynamic_allocation(dataset)?;
        self.check_barrier_stage_with_num_slots(dataset, partitions.len())?;
        self.check_barrier_stage_chain_pattern(dataset)?;

        let parents = self.get_or_create_parent_stages(state, dataset, job_id)?;
        let stage_id = state.registry.next_stage_id();
        let barrier = self.graph.stage_contains_barrier(dataset);
        let stage = ResultStage::new(
            stage_id, dataset, partitions, parents, job_id, call_site, func, barrier,
        );
        state.registry.insert(Stage::Result(stage));
        debug!("Created ResultStage {stage_id} for dataset {dataset}");
        Ok(stage_id)
    }

    fn get_or_create_parent_stages(
        &self,
        state: &mut SchedulerState,
        dataset: DatasetId,
        first_job_id: JobId,
    ) -> Result<Vec<StageId>> {
        let mut parents = vec![];
        for dep in self.graph.immediate_shuffle_dependencies(dataset) {
            parents.push(self.get_or_create_shuffle_map_stage(state, &dep, first_job_id)?);
        }
        Ok(parents)
    }

    /// Returns the canonical shuffle map stage for the dependency's shuffle
    /// id, creating any missing ancestor stages first, deepest first.
    fn get_or_create_shuffle_map_stage(
        &self,
        state: &mut SchedulerState,
        dep: &ShuffleDependency,
        first_job_id: JobId,
    ) -> Result<StageId> {
        if let Some(stage_id) = state.registry.map_stage_for_shuffle(dep.shuffle_id) {
            return Ok(stage_id);
        }
        let missing = {
            let registry = &state.registry;
            self.graph
                .missing_ancestor_shuffles(dep.parent, &|id| registry.contains_shuffle(id))
        };
        for ancestor in missing {
            // An earlier iteration may have created this one as a parent.
            if !state.registry.contains_shuffle(ancestor.shuffle_id) {
                self.create_shuffle_map_stage(state, &ancestor, first_job_id)?;
            }
        }
        self.create_shuffle_map_stage(state, dep, first_job_id)
    }

    fn create_shuffle_map_stage(
        &self,
        state: &mut SchedulerState,
        dep: &ShuffleDependency,
        job_id: JobId,
    ) -> Result<StageId> {
        let dataset = dep.parent;
        let num_tasks = self.graph.num_partitions(dataset);
        self.check_barrier_stage_with_dynamic_allocation(dataset)?;
        self.check_barrier_stage_with_num_slots(dataset, num_tasks)?;
        self.check_barrier_stage_chain_pattern(dataset)?;

        let parents = self.get_or_create_parent_stages(state, dataset, job_id)?;
        let stage_id = state.registry.next_stage_id();
        let stage = ShuffleMapStage::new(
            stage_id,
            dataset,
            num_tasks,
            parents,
            job_id,
            self.graph.name(dataset),
            dep.clone(),
            self.graph.stage_contains_barrier(dataset),
            self.graph.determinism(dataset),
        );
        state.registry.insert(Stage::ShuffleMap(stage));
        if !self.map_output_tracker.contains_shuffle(dep.shuffle_id) {
            self.map_output_tracker.register_shuffle(
                dep.shuffle_id,
                num_tasks,
                dep.num_output_partitions(),
            )?;
        }
        debug!(
            "Created ShuffleMapStage {stage_id} for shuffle {} of dataset {dataset}",
            dep.shuffle_id
        );
        Ok(stage_id)
    }

    fn check_barrier_stage_with_dynamic_allocation(&self, dataset: DatasetId) -> Result<()> {
        if self.graph.stage_contains_barrier(dataset)
            && self.config.dynamic_allocation_enabled
        {
            return Err(CinderError::BarrierIncompatible(
                "barrier stages cannot run with dynamic resource allocation enabled; \
            disable dynamic allocation to run this stage"
                    .to_owned(),
            ));
        }
        Ok(())
    }

    fn check_barrier_stage_with_num_slots(
        &self,
        dataset: DatasetId,
        num_tasks: usize,
    ) -> Result<()> {
        if self.graph.stage_contains_barrier(dataset)
            && self.config.max_concurrent_task_slots > 0
            && num_tasks > self.config.max_concurrent_task_slots
        {
            return Err(CinderError::BarrierSlotsExceeded(
                num_tasks,
                self.config.max_concurrent_task_slots,
            ));
        }
        Ok(())
    }

    fn check_barrier_stage_chain_pattern(&self, dataset: DatasetId) -> Result<()> {
        if !self.graph.stage_contains_barrier(dataset) {
            return Ok(());
        }
        let expected = self.graph.num_partitions(dataset);
        if !self.graph.barrier_stage_pattern_supported(dataset, expected) {
            return Err(CinderError::BarrierIncompatible(
                "the lineage pattern of this barrier stage is not supported: every \
            dataset in the stage must have the same partition count and at most one \
            barrier shuffle parent"
                    .to_owned(),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stage submission
    // ------------------------------------------------------------------

    fn active_job_for_stage(
        &self,
        state: &SchedulerState,
        stage_id: StageId,
    ) -> Option<JobId> {
        let stage = state.registry.get(stage_id)?;
        stage
            .job_ids()
            .iter()
            .filter(|job_id| state.active_jobs.contains_key(job_id))
            .min()
            .copied()
    }

    /// Submits a stage, first recursively submitting any missing parents.
    #[async_recursion]
    async fn submit_stage(
        &self,
        state: &mut SchedulerState,
        stage_id: StageId,
    ) -> Result<()> {
        let mut work = vec![stage_id];
        while let Some(id) = work.pop() {
            let Some(job_id) = self.active_job_for_stage(state, id) else {
                self.abort_stage(state, id, &format!("No active job for stage {id}"))
                    .await?;
                continue;
            };
            if state.waiting_stages.contains(&id)
                || state.running_stages.contains(&id)
                || state.failed_stages.contains(&id)
            {
                continue;
            }
            debug!("submitStage({id})");
            let missing = self.get_missing_parent_stages(state, id).await?;
            if missing.is_empty() {
                self.submit_missing_tasks(state, id, job_id).await?;
            } else {
                debug!("Stage {id} is waiting for missing parents {missing:?}");
                state.waiting_stages.insert(id);
                // Parents are submitted in ascending stage id order.
                work.extend(missing.into_iter().rev());
            }
        }
        Ok(())
    }

    /// Parent stages of `stage_id` whose outputs are not yet available,
    /// sorted by stage id. Subgraphs whose partitions are all cached are
    /// not descended into.
    async fn get_missing_parent_stages(
        &self,
        state: &mut SchedulerState,
        stage_id: StageId,
    ) -> Result<Vec<StageId>> {
        let (dataset, first_job_id) = {
            let stage = state.registry.get(stage_id).ok_or_else(|| {
                CinderError::Internal(format!("Stage {stage_id} not registered"))
            })?;
            (stage.dataset(), stage.first_job_id())
        };
        let mut missing = HashSet::new();
        let mut visited = HashSet::new();
        let mut work = vec![dataset];
        while let Some(ds) = work.pop() {
            if !visited.insert(ds) {
                continue;
            }
            let cache_locs = self.cache_index.get_cache_locs(&self.graph, ds).await?;
            let fully_cached = !cache_locs.iter().any(|locs| locs.is_empty());
            if fully_cached {
                continue;
            }
            for dep in self.graph.dependencies(ds) {
                match dep {
                    Dependency::Narrow { parent, .. } => work.push(parent),
                    Dependency::Shuffle(shuffle) => {
                        let map_stage_id = self.get_or_create_shuffle_map_stage(
                            state,
                            &shuffle,
                            first_job_id,
                        )?;
                        if !self.is_map_stage_available(state, map_stage_id) {
                            missing.insert(map_stage_id);
                        }
                    }
                }
            }
        }
        let mut missing: Vec<StageId> = missing.into_iter().collect();
        missing.sort();
        Ok(missing)
    }

    fn is_map_stage_available(&self, state: &SchedulerState, stage_id: StageId) -> bool {
        match state.registry.get(stage_id).and_then(Stage::as_shuffle_map) {
            Some(map_stage) => {
                self.map_output_tracker
                    .num_available_outputs(map_stage.shuffle_dep.shuffle_id)
                    == map_stage.num_tasks
            }
            None => false,
        }
    }

    #[async_recursion]
    async fn submit_missing_tasks(
        &self,
        state: &mut SchedulerState,
        stage_id: StageId,
        job_id: JobId,
    ) -> Result<()> {
        debug!("submitMissingTasks({stage_id})");

        // Partitions of the stage with no output yet, with the task kind
        // each will carry.
        let (dataset, barrier, work, partitions_to_compute, max_partition_id) = {
            let stage = state.registry.get(stage_id).ok_or_else(|| {
                CinderError::Internal(format!("Stage {stage_id} not registered"))
            })?;
            match stage {
                Stage::ShuffleMap(map_stage) => {
                    let missing = self
                        .map_output_tracker
                        .find_missing_partitions(map_stage.shuffle_dep.shuffle_id)
                        .unwrap_or_else(|| (0..map_stage.num_tasks).collect());
                    let kinds: Vec<(usize, TaskKind)> = missing
                        .into_iter()
                        .map(|partition| {
                            (
                                partition,
                                TaskKind::ShuffleMap {
                                    shuffle_id: map_stage.shuffle_dep.shuffle_id,
                                },
                            )
                        })
                        .collect();
                    (
                        map_stage.dataset,
                        map_stage.barrier,
                        StageWork::ShuffleMap {
                            dep: map_stage.shuffle_dep.clone(),
                        },
                        kinds,
                        map_stage.num_tasks.saturating_sub(1),
                    )
                }
                Stage::Result(result_stage) => {
                    let finished = state
                        .active_jobs
                        .get(&job_id)
                        .map(|job| job.finished.clone())
                        .unwrap_or_default();
                    let kinds: Vec<(usize, TaskKind)> = result_stage
                        .partitions
                        .iter()
                        .enumerate()
                        .filter(|(output_id, _)| !finished.contains(*output_id))
                        .map(|(output_id, partition)| {
                            (*partition, TaskKind::Result { output_id })
                        })
                        .collect();
                    let max_partition_id =
                        result_stage.partitions.iter().copied().max().unwrap_or(0);
                    (
                        result_stage.dataset,
                        result_stage.barrier,
                        StageWork::Result {
                            func: result_stage.func.clone(),
                        },
                        kinds,
                        max_partition_id,
                    )
                }
            }
        };
        let properties = state
            .active_jobs
            .get(&job_id)
            .map(|job| job.properties.clone())
            .unwrap_or_default();

        state.running_stages.insert(stage_id);
        self.commit_coordinator.stage_start(stage_id, max_partition_id);

        // Placement hints before the attempt starts; a failure here is a
        // stage construction failure, not a task failure.
        let mut locality: Vec<Vec<TaskLocation>> = vec![];
        let mut locality_error = None;
        for (partition, _) in &partitions_to_compute {
            match self.preferred_locations(dataset, *partition).await {
                Ok(locs) => locality.push(locs),
                Err(e) => {
                    locality_error = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = locality_error {
            if let Some(stage) = state.registry.get_mut(stage_id) {
                stage.make_new_stage_attempt(partitions_to_compute.len(), vec![]);
                self.listener_bus.post(ListenerEvent::StageSubmitted {
                    stage_info: stage.latest_info().clone(),
                    properties,
                });
            }
            self.abort_stage(state, stage_id, &format!("Task creation failed: {e}"))
                .await?;
            state.running_stages.remove(&stage_id);
            return Ok(());
        }

        let stage_attempt_id = {
            let stage = state.registry.get_mut(stage_id).ok_or_else(|| {
                CinderError::Internal(format!("Stage {stage_id} not registered"))
            })?;
            stage.make_new_stage_attempt(partitions_to_compute.len(), locality.clone());
            self.listener_bus.post(ListenerEvent::StageSubmitted {
                stage_info: stage.latest_info().clone(),
                properties: properties.clone(),
            });
            stage.latest_info().attempt_id
        };

        // The closure is encoded exactly once per attempt and broadcast to
        // every task. The checkpoint lock keeps a concurrent checkpoint
        // from rewriting dependencies mid-encode.
        let encoded = {
            let _guard = self.graph.checkpoint_lock().lock();
            match &work {
                StageWork::ShuffleMap { dep } => encode_shuffle_map_closure(dep),
                StageWork::Result { func } => {
                    encode_result_closure(dataset, func.as_ref())
                }
            }
        };
        let binary = match encoded {
            Ok(bytes) => TaskBinary::new(bytes),
            Err(e) => {
                self.abort_stage(
                    state,
                    stage_id,
                    &format!("Failed to serialize the task closure: {e}"),
                )
                .await?;
                state.running_stages.remove(&stage_id);
                return Ok(());
            }
        };

        if let Some(map_stage) = state
            .registry
            .get_mut(stage_id)
            .and_then(Stage::as_shuffle_map_mut)
        {
            map_stage.pending_partitions.clear();
            map_stage
                .pending_partitions
                .extend(partitions_to_compute.iter().map(|(partition, _)| *partition));
        }

        let epoch = self.map_output_tracker.get_epoch();
        let tasks: Vec<Task> = partitions_to_compute
            .iter()
            .zip(locality)
            .map(|(&(partition, kind), locality_hints)| Task {
                stage_id,
                stage_attempt_id,
                partition,
                kind,
                binary: binary.clone(),
                locality_hints,
                epoch,
                barrier,
                job_id,
            })
            .collect();

        if !tasks.is_empty() {
            info!(
                "Submitting {} missing tasks from stage {stage_id} (attempt \
            {stage_attempt_id}, first job {job_id})",
                tasks.len()
            );
            let task_set = TaskSet {
                stage_id,
                stage_attempt_id,
                priority: job_id,
                properties,
                tasks,
            };
            self.task_scheduler.submit_tasks(task_set).await?;
        } else {
            // Every partition is already available.
            self.mark_stage_as_finished(state, stage_id, None, false);
            debug!("Stage {stage_id} finished immediately, no missing tasks");
            self.mark_map_stage_jobs_as_finished(state, stage_id);
            self.submit_waiting_child_stages(state, stage_id).await?;
        }
        Ok(())
    }

    /// Placement preferences for one partition, thread safe with respect to
    /// the event loop.
    pub(crate) async fn preferred_locations(
        &self,
        dataset: DatasetId,
        partition: usize,
    ) -> Result<Vec<TaskLocation>> {
        let mut visited = HashSet::new();
        self.preferred_locations_internal(dataset, partition, &mut visited)
            .await
    }

    #[async_recursion]
    async fn preferred_locations_internal(
        &self,
        dataset: DatasetId,
        partition: usize,
        visited: &mut HashSet<(DatasetId, usize)>,
    ) -> Result<Vec<TaskLocation>> {
        if !visited.insert((dataset, partition)) {
            return Ok(vec![]);
        }
        let cached = self.cache_index.get_cache_locs(&self.graph, dataset).await?;
        if let Some(locs) = cached.get(partition) {
            if !locs.is_empty() {
                return Ok(locs.clone());
            }
        }
        let declared = self.graph.preferred_locations(dataset, partition);
        if !declared.is_empty() {
            return Ok(declared);
        }
        // Descend the first narrow dependency and take the first parent
        // partition with a known placement.
        let first_narrow = self.graph.dependencies(dataset).iter().find_map(|dep| {
            match dep {
                Dependency::Narrow { parent, kind } => Some((*parent, *kind)),
                Dependency::Shuffle(_) => None,
            }
        });
        if let Some((parent, kind)) = first_narrow {
            for in_partition in kind.parents(partition) {
                let locs = self
                    .preferred_locations_internal(parent, in_partition, visited)
                    .await?;
                if !locs.is_empty() {
                    return Ok(locs);
                }
            }
        }
        Ok(vec![])
    }

    #[async_recursion]
    async fn submit_waiting_child_stages(
        &self,
        state: &mut SchedulerState,
        parent: StageId,
    ) -> Result<()> {
        let mut children: Vec<StageId> = vec![];
        for id in state.waiting_stages.iter() {
            let is_child = state
                .registry
                .get(*id)
                .map(|stage| stage.parents().contains(&parent))
                .unwrap_or(false);
            if is_child {
                children.push(*id);
            }
        }
        children.sort_by_key(|id| {
            state
                .registry
                .get(*id)
                .map(|stage| stage.first_job_id())
                .unwrap_or(JobId(usize::MAX))
        });
        for child in &children {
            state.waiting_stages.remove(child);
        }
        for child in children {
            self.submit_stage(state, child).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Completion handling
    // ------------------------------------------------------------------

    async fn handle_task_completion(
        &self,
        state: &mut SchedulerState,
        sender: &EventSender<DagEvent>,
        event: CompletionEvent,
    ) -> Result<()> {
        let task = &event.task;
        let stage_id = task.stage_id;
        self.commit_coordinator.task_completed(
            stage_id,
            task.stage_attempt_id,
            task.partition,
            event.task_info.attempt_number,
            &event.reason,
        );

        if !state.registry.contains_stage(stage_id) {
            // The stage was cleaned up while the task was in flight.
            self.post_task_end(&event);
            return Ok(());
        }

        match &event.reason {
            TaskEndReason::Success
            | TaskEndReason::ExceptionFailure { .. }
            | TaskEndReason::TaskKilled { .. } => {
                self.update_accumulators(state, &event);
            }
            _ => {}
        }
        self.post_task_end(&event);

        match event.reason.clone() {
            TaskEndReason::Success => match task.kind {
                TaskKind::Result { output_id } => {
                    self.handle_result_task_success(state, &event, output_id)
                }
                TaskKind::ShuffleMap { .. } => {
                    self.handle_shuffle_map_task_success(state, &event).await?
                }
            },
            TaskEndReason::Resubmitted => {
                info!("Resubmitted {task}, so marking it as still running");
                if let Some(map_stage) = state
                    .registry
                    .get_mut(stage_id)
                    .and_then(Stage::as_shuffle_map_mut)
                {
                    map_stage.pending_partitions.insert(task.partition);
                }
            }
            TaskEndReason::FetchFailed { .. } => {
                self.handle_fetch_failure(state, sender, &event).await?;
            }
            _ if task.barrier => {
                self.handle_barrier_task_failure(state, sender, &event).await?;
            }
            TaskEndReason::ExceptionFailure { .. }
            | TaskEndReason::TaskKilled { .. }
            | TaskEndReason::TaskResultLost
            | TaskEndReason::TaskCommitDenied { .. }
            | TaskEndReason::ExecutorLost { .. }
            | TaskEndReason::Unknown => {
                // Task-level retries are the task scheduler's business.
            }
        }
        Ok(())
    }

    fn post_task_end(&self, event: &CompletionEvent) {
        let task_type = match event.task.kind {
            TaskKind::ShuffleMap { .. } => "ShuffleMapTask",
            TaskKind::Result { .. } => "ResultTask",
        };
        self.listener_bus.post(ListenerEvent::TaskEnd {
            stage_id: event.task.stage_id,
            stage_attempt_id: event.task.stage_attempt_id,
            task_type,
            reason: event.reason.name(),
            task_info: event.task_info.clone(),
            accum_updates: event.accum_updates.clone(),
        });
    }

    fn update_accumulators(&self, state: &mut SchedulerState, event: &CompletionEvent) {
        for AccumUpdate { id, delta, .. } in &event.accum_updates {
            *state.accumulators.entry(*id).or_insert(0) += delta;
        }
    }

    fn handle_result_task_success(
        &self,
        state: &mut SchedulerState,
        event: &CompletionEvent,
        output_id: usize,
    ) {
        let stage_id = event.task.stage_id;
        let Some(job_id) = state
            .registry
            .get(stage_id)
            .and_then(Stage::as_result)
            .and_then(|stage| stage.active_job)
        else {
            info!(
                "Ignoring result from {} because its job has finished",
                event.task
            );
            return;
        };
        let Some(job) = state.active_jobs.get_mut(&job_id) else {
            return;
        };
        if job.finished.contains(output_id) {
            return;
        }
        job.finished.insert(output_id);
        job.num_finished += 1;
        let job_done = job.num_finished == job.num_partitions;
        let listener = job.listener.clone();
        if job_done {
            self.mark_stage_as_finished(state, stage_id, None, false);
            self.cleanup_state_for_job_and_independent_stages(state, job_id);
            self.listener_bus.post(ListenerEvent::JobEnd {
                job_id,
                time: timestamp_millis(),
                result: JobResult::Succeeded,
            });
        }
        let value = event
            .result
            .clone()
            .unwrap_or_else(|| TaskValue::Bytes(vec![]));
        if let Err(e) = listener.task_succeeded(output_id, &value) {
            // The result handler raised; surface the failure to the job.
            error!("Job {job_id} listener failed to consume output {output_id}: {e}");
            listener.job_failed(&CinderError::General(format!(
                "Job listener failed while consuming a result: {e}"
            )));
        }
    }

    async fn handle_shuffle_map_task_success(
        &self,
        state: &mut SchedulerState,
        event: &CompletionEvent,
    ) -> Result<()> {
        let task = &event.task;
        let stage_id = task.stage_id;
        let Some(TaskValue::MapStatus(status)) = &event.result else {
            warn!("Dropping shuffle map completion of {task} with no map status");
            return Ok(());
        };
        let executor_id = status.location.executor_id.clone();
        debug!("ShuffleMapTask finished on executor {executor_id}");

        let (shuffle_id, pending_empty) = {
            let Some(map_stage) = state
                .registry
                .get_mut(stage_id)
                .and_then(Stage::as_shuffle_map_mut)
            else {
                warn!("Shuffle map completion for non-map stage {stage_id}");
                return Ok(());
            };
            map_stage.pending_partitions.remove(&task.partition);
            (
                map_stage.shuffle_dep.shuffle_id,
                map_stage.pending_partitions.is_empty(),
            )
        };

        if state.epochs.is_stale_output(&executor_id, task.epoch) {
            info!(
                "Ignoring possibly bogus {task} completion from executor {executor_id}"
            );
        } else {
            self.map_output_tracker
                .register_map_output(shuffle_id, task.partition, status.clone());
        }

        if state.running_stages.contains(&stage_id) && pending_empty {
            self.mark_stage_as_finished(state, stage_id, None, false);
            self.map_output_tracker.increment_epoch();
            self.cache_index.clear();
            if !self.is_map_stage_available(state, stage_id) {
                let missing = self
                    .map_output_tracker
                    .find_missing_partitions(shuffle_id)
                    .unwrap_or_default();
                info!(
                    "Resubmitting stage {stage_id} because some of its outputs were \
                discarded: missing partitions {missing:?}"
                );
                self.submit_stage(state, stage_id).await?;
            } else {
                self.mark_map_stage_jobs_as_finished(state, stage_id);
                self.submit_waiting_child_stages(state, stage_id).await?;
            }
        }
        Ok(())
    }

    /// Completes every map-stage job attached to an available shuffle map
    /// stage, delivering the shuffle statistics to each.
    fn mark_map_stage_jobs_as_finished(&self, state: &mut SchedulerState, stage_id: StageId) {
        let Some(map_stage) = state.registry.get(stage_id).and_then(Stage::as_shuffle_map)
        else {
            return;
        };
        if !self.is_map_stage_available(state, stage_id) {
            return;
        }
        let shuffle_id = map_stage.shuffle_dep.shuffle_id;
        let jobs = map_stage.map_stage_jobs.clone();
        for job_id in jobs {
            if state.active_jobs.contains_key(&job_id) {
                self.mark_map_stage_job_as_finished(state, job_id, shuffle_id);
            }
        }
    }

    fn mark_map_stage_job_as_finished(
        &self,
        state: &mut SchedulerState,
        job_id: JobId,
        shuffle_id: cinder_core::dataset::ShuffleId,
    ) {
        let Some(stats) = self.map_output_tracker.get_statistics(shuffle_id) else {
            return;
        };
        let Some(job) = state.active_jobs.get_mut(&job_id) else {
            return;
        };
        // A map stage job has exactly one logical output: the statistics.
        if job.num_partitions > 0 {
            job.finished.insert(0);
        }
        job.num_finished = 1;
        let listener = job.listener.clone();
        if let Err(e) = listener.task_succeeded(0, &TaskValue::MapOutputStats(stats)) {
            error!("Map stage job {job_id} listener failed: {e}");
        }
        self.cleanup_state_for_job_and_independent_stages(state, job_id);
        self.listener_bus.post(ListenerEvent::JobEnd {
            job_id,
            time: timestamp_millis(),
            result: JobResult::Succeeded,
        });
        info!("Map stage job {job_id} finished");
    }

    async fn handle_fetch_failure(
        &self,
        state: &mut SchedulerState,
        sender: &EventSender<DagEvent>,
        event: &CompletionEvent,
    ) -> Result<()> {
        let task = &event.task;
        let TaskEndReason::FetchFailed {
            address,
            shuffle_id,
            map_id,
            reduce_id,
            message,
        } = &event.reason
        else {
            return Err(CinderError::Internal(
                "handle_fetch_failure called without a fetch failure".to_owned(),
            ));
        };
        let failed_stage_id = task.stage_id;
        let Some(map_stage_id) = state.registry.map_stage_for_shuffle(*shuffle_id) else {
            warn!("Fetch failure for unregistered shuffle {shuffle_id}, ignoring");
            return Ok(());
        };

        let current_attempt = match state.registry.get(failed_stage_id) {
            Some(stage) => stage.latest_info().attempt_id,
            None => return Ok(()),
        };
        if task.stage_attempt_id != current_attempt {
            info!(
                "Ignoring fetch failure from {task}: it belongs to attempt \
            {}, the current attempt of stage {failed_stage_id} is {current_attempt}",
                task.stage_attempt_id
            );
            return Ok(());
        }

        let should_abort = {
            let stage = state.registry.get_mut(failed_stage_id).unwrap();
            stage.failed_attempt_ids_mut().insert(task.stage_attempt_id);
            stage.failed_attempt_ids().len()
                >= self.config.max_consecutive_stage_attempts
                || self.config.test_no_stage_retry
        };
        // A barrier result stage never retries: some of its partitions may
        // already be committed.
        let failed_is_barrier_result = state
            .registry
            .get(failed_stage_id)
            .map(|stage| stage.is_barrier() && stage.as_result().is_some())
            .unwrap_or(false);
        let will_abort = should_abort || failed_is_barrier_result;

        info!(
            "Marking stage {failed_stage_id} as failed due to a fetch failure from \
        stage {map_stage_id} (shuffle {shuffle_id}, map {map_id:?}, reduce {reduce_id})"
        );
        self.mark_stage_as_finished(
            state,
            failed_stage_id,
            Some(&format!("Fetch failure: {message}")),
            !will_abort,
        );

        // Forget whatever output the failure proves lost.
        let map_stage_is_barrier = state
            .registry
            .get(map_stage_id)
            .map(Stage::is_barrier)
            .unwrap_or(false);
        if map_stage_is_barrier {
            // A barrier stage reruns whole, so no partial output survives.
            self.map_output_tracker.unregister_all_map_outputs(*shuffle_id);
        } else if let (Some(map_id), Some(address)) = (map_id, address) {
            self.map_output_tracker
                .unregister_map_output(*shuffle_id, *map_id, address);
        }

        if failed_is_barrier_result {
            self.abort_stage(
                state,
                failed_stage_id,
                "Could not recover from a failed barrier ResultStage: some of its \
            output partitions may already be committed",
            )
            .await?;
        } else if should_abort {
            let name = state
                .registry
                .get(failed_stage_id)
                .map(|stage| stage.to_string())
                .unwrap_or_else(|| format!("Stage {failed_stage_id}"));
            self.abort_stage(
                state,
                failed_stage_id,
                &format!(
                    "{name} has failed the maximum allowable number of times: {}. \
                Most recent failure reason: {message}",
                    self.config.max_consecutive_stage_attempts
                ),
            )
            .await?;
        } else {
            let no_resubmit_enqueued = !state.failed_stages.contains(&failed_stage_id)
                && !state.failed_stages.contains(&map_stage_id);
            state.failed_stages.insert(failed_stage_id);
            state.failed_stages.insert(map_stage_id);
            if no_resubmit_enqueued {
                let map_stage_indeterminate = state
                    .registry
                    .get(map_stage_id)
                    .map(Stage::is_indeterminate)
                    .unwrap_or(false);
                if map_stage_indeterminate {
                    self.abort_indeterminate_successors(state, map_stage_id).await?;
                }
                debug!(
                    "Scheduling resubmission of stage {map_stage_id} and stage \
                {failed_stage_id} in {:?}",
                    self.config.resubmit_timeout
                );
                schedule_event(
                    sender.clone(),
                    self.config.resubmit_timeout,
                    DagEvent::ResubmitFailedStages,
                );
            }
        }

        if let Some(address) = address {
            let host_to_unregister = (self
                .config
                .unregister_output_on_host_on_fetch_failure
                && self.config.external_shuffle_service_enabled)
                .then(|| address.host.clone());
            self.remove_executor_and_unregister_outputs(
                state,
                &address.executor_id,
                true,
                host_to_unregister,
                Some(task.epoch),
            )
            .await?;
        }
        Ok(())
    }

    /// When an indeterminate map stage must be recomputed, consumers that
    /// already produced partial output cannot be reproduced identically and
    /// are aborted; the map stage itself drops all outputs so a rerun
    /// recomputes every partition.
    async fn abort_indeterminate_successors(
        &self,
        state: &mut SchedulerState,
        map_stage_id: StageId,
    ) -> Result<()> {
        if let Some(map_stage) = state.registry.get(map_stage_id).and_then(Stage::as_shuffle_map)
        {
            warn!(
                "Shuffle map stage {map_stage_id} is indeterminate; discarding all \
            of its {} outputs before the rerun",
                map_stage.num_tasks
            );
            self.map_output_tracker
                .unregister_all_map_outputs(map_stage.shuffle_dep.shuffle_id);
        }
        let successors = self.collect_succeeding_stages(state, map_stage_id);
        for stage_id in successors {
            let Some((missing, total)) = self.missing_partition_count(state, stage_id)
            else {
                continue;
            };
            if missing < total {
                self.abort_stage(
                    state,
                    stage_id,
                    &format!(
                        "A shuffle map stage with indeterminate output was failed and \
                    retried. However, stage {stage_id} has already produced some output \
                    partitions, which cannot be reproduced identically, so it has to \
                    fail as well"
                    ),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Stages strictly downstream of `target`, reachable from the final
    /// stages of active jobs.
    fn collect_succeeding_stages(
        &self,
        state: &SchedulerState,
        target: StageId,
    ) -> Vec<StageId> {
        let mut reachable = HashSet::new();
        for job in state.active_jobs.values() {
            let mut work = vec![job.final_stage];
            while let Some(id) = work.pop() {
                if !reachable.insert(id) {
                    continue;
                }
                if let Some(stage) = state.registry.get(id) {
                    work.extend(stage.parents().iter().copied());
                }
            }
        }
        let mut successors: Vec<StageId> = reachable
            .into_iter()
            .filter(|id| *id != target && self.stage_depends_on(state, *id, target))
            .collect();
        successors.sort();
        successors
    }

    fn stage_depends_on(
        &self,
        state: &SchedulerState,
        stage_id: StageId,
        target: StageId,
    ) -> bool {
        if stage_id == target {
            return true;
        }
        let mut visited = HashSet::new();
        let mut work = vec![stage_id];
        while let Some(id) = work.pop() {
            if !visited.insert(id) {
                continue;
            }
            if let Some(stage) = state.registry.get(id) {
                for parent in stage.parents() {
                    if *parent == target {
                        return true;
                    }
                    work.push(*parent);
                }
            }
        }
        false
    }

    /// Missing and total partition counts of a stage, `None` when nothing
    /// meaningful can be said (for example a result stage with no active
    /// job).
    fn missing_partition_count(
        &self,
        state: &SchedulerState,
        stage_id: StageId,
    ) -> Option<(usize, usize)> {
        match state.registry.get(stage_id)? {
            Stage::ShuffleMap(map_stage) => {
                let missing = self
                    .map_output_tracker
                    .find_missing_partitions(map_stage.shuffle_dep.shuffle_id)
                    .map(|missing| missing.len())
                    .unwrap_or(map_stage.num_tasks);
                Some((missing, map_stage.num_tasks))
            }
            Stage::Result(result_stage) => {
                let job_id = result_stage.active_job?;
                let job = state.active_jobs.get(&job_id)?;
                Some((
                    result_stage.num_tasks - job.num_finished,
                    result_stage.num_tasks,
                ))
            }
        }
    }

    async fn handle_barrier_task_failure(
        &self,
        state: &mut SchedulerState,
        sender: &EventSender<DagEvent>,
        event: &CompletionEvent,
    ) -> Result<()> {
        let task = &event.task;
        let stage_id = task.stage_id;
        let current_attempt = match state.registry.get(stage_id) {
            Some(stage) => stage.latest_info().attempt_id,
            None => return Ok(()),
        };
        if task.stage_attempt_id != current_attempt {
            info!(
                "Ignoring barrier task failure from {task}: a more recent attempt \
            of stage {stage_id} is running"
            );
            return Ok(());
        }

        let should_abort = {
            let stage = state.registry.get_mut(stage_id).unwrap();
            stage.failed_attempt_ids_mut().insert(task.stage_attempt_id);
            stage.failed_attempt_ids().len()
                >= self.config.max_consecutive_stage_attempts
                || self.config.test_no_stage_retry
        };
        // A barrier result stage never retries: some of its partitions may
        // already be committed.
        let is_result = state
            .registry
            .get(stage_id)
            .map(|stage| stage.as_result().is_some())
            .unwrap_or(false);
        let will_abort = should_abort || is_result;

        let message = format!(
            "Stage failed because barrier {task} finished unsuccessfully ({})",
            event.reason.name()
        );
        info!("Marking stage {stage_id} as failed due to a barrier task failure");
        self.mark_stage_as_finished(state, stage_id, Some(&message), !will_abort);

        if let Err(e) = self
            .task_scheduler
            .kill_all_task_attempts(stage_id, false, "A barrier task failed")
            .await
        {
            self.abort_stage(
                state,
                stage_id,
                &format!("Could not kill all tasks of barrier stage {stage_id}: {e}"),
            )
            .await?;
            return Ok(());
        }

        if is_result {
            self.abort_stage(
                state,
                stage_id,
                "Could not recover from a failed barrier ResultStage: some of its \
            output partitions may already be committed",
            )
            .await?;
            return Ok(());
        }
        if let Some(map_stage) = state.registry.get(stage_id).and_then(Stage::as_shuffle_map)
        {
            self.map_output_tracker
                .unregister_all_map_outputs(map_stage.shuffle_dep.shuffle_id);
        }

        if should_abort {
            self.abort_stage(
                state,
                stage_id,
                &format!(
                    "Barrier stage {stage_id} has failed the maximum allowable number \
                of times: {}. Most recent failure reason: {message}",
                    self.config.max_consecutive_stage_attempts
                ),
            )
            .await?;
        } else {
            let no_resubmit_enqueued = !state.failed_stages.contains(&stage_id);
            state.failed_stages.insert(stage_id);
            if no_resubmit_enqueued {
                schedule_event(
                    sender.clone(),
                    self.config.resubmit_timeout,
                    DagEvent::ResubmitFailedStages,
                );
            }
        }
        Ok(())
    }

    async fn resubmit_failed_stages(&self, state: &mut SchedulerState) -> Result<()> {
        if state.failed_stages.is_empty() {
            return Ok(());
        }
        info!("Resubmitting failed stages");
        self.cache_index.clear();
        let mut failed: Vec<StageId> = state.failed_stages.drain().collect();
        // Resubmission order follows the age of the jobs that created the
        // stages, oldest first.
        failed.sort_by_key(|id| {
            state
                .registry
                .get(*id)
                .map(|stage| stage.first_job_id())
                .unwrap_or(JobId(usize::MAX))
        });
        for stage_id in failed {
            if state.registry.contains_stage(stage_id) {
                self.submit_stage(state, stage_id).await?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Executor and worker loss
    // ------------------------------------------------------------------

    async fn handle_executor_lost(
        &self,
        state: &mut SchedulerState,
        executor_id: &str,
        reason: &ExecutorLossReason,
    ) -> Result<()> {
        // Without an external shuffle service the executor's shuffle files
        // die with it; with one, only a worker-level loss takes them.
        let file_lost =
            reason.worker_lost() || !self.config.external_shuffle_service_enabled;
        self.remove_executor_and_unregister_outputs(
            state,
            executor_id,
            file_lost,
            None,
            None,
        )
        .await
    }

    async fn remove_executor_and_unregister_outputs(
        &self,
        state: &mut SchedulerState,
        executor_id: &str,
        file_lost: bool,
        host_to_unregister: Option<String>,
        maybe_epoch: Option<u64>,
    ) -> Result<()> {
        let current_epoch =
            maybe_epoch.unwrap_or_else(|| self.map_output_tracker.get_epoch());
        if !state.epochs.record_executor_failure(executor_id, current_epoch) {
            debug!(
                "Executor {executor_id} loss at epoch {current_epoch} already processed"
            );
            return Ok(());
        }
        info!("Executor lost: {executor_id} (epoch {current_epoch})");
        if let Err(e) = self.block_manager.remove_executor(executor_id).await {
            warn!("Failed to remove executor {executor_id} from the block manager: {e}");
        }
        self.cache_index.clear();
        if file_lost
            && state
                .epochs
                .record_shuffle_files_lost(executor_id, current_epoch)
        {
            match &host_to_unregister {
                Some(host) => {
                    info!("Shuffle files lost for host: {host} (epoch {current_epoch})");
                    self.map_output_tracker.remove_outputs_on_host(host);
                }
                None => {
                    info!(
                        "Shuffle files lost for executor: {executor_id} (epoch \
                    {current_epoch})"
                    );
                    self.map_output_tracker.remove_outputs_on_executor(executor_id);
                }
            }
            self.map_output_tracker.increment_epoch();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cancellation, abort, cleanup
    // ------------------------------------------------------------------

    async fn handle_stage_cancellation(
        &self,
        state: &mut SchedulerState,
        stage_id: StageId,
        reason: Option<String>,
    ) -> Result<()> {
        let Some(stage) = state.registry.get(stage_id) else {
            info!("No active jobs to kill for stage {stage_id}");
            return Ok(());
        };
        let mut job_ids: Vec<JobId> = stage.job_ids().iter().copied().collect();
        job_ids.sort();
        let suffix = reason
            .map(|reason| format!(" ({reason})"))
            .unwrap_or_default();
        for job_id in job_ids {
            self.handle_job_cancellation(
                state,
                job_id,
                Some(format!("because stage {stage_id} was cancelled{suffix}")),
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_job_cancellation(
        &self,
        state: &mut SchedulerState,
        job_id: JobId,
        reason: Option<String>,
    ) -> Result<()> {
        if !state.active_jobs.contains_key(&job_id) {
            warn!("Trying to cancel unregistered job {job_id}");
            return Ok(());
        }
        let error = CinderError::General(format!(
            "Job {job_id} cancelled {}",
            reason.unwrap_or_default()
        ));
        self.fail_job_and_independent_stages(state, job_id, error).await
    }

    async fn handle_job_group_cancelled(
        &self,
        state: &mut SchedulerState,
        group_id: &str,
    ) -> Result<()> {
        let mut job_ids: Vec<JobId> = state
            .active_jobs
            .values()
            .filter(|job| {
                job.properties.get(JOB_GROUP_ID_KEY).map(String::as_str) == Some(group_id)
            })
            .map(|job| job.job_id)
            .collect();
        job_ids.sort();
        info!("Cancelling job group {group_id} with {} active jobs", job_ids.len());
        for job_id in job_ids {
            self.handle_job_cancellation(
                state,
                job_id,
                Some(format!("part of cancelled job group {group_id}")),
            )
            .await?;
        }
        Ok(())
    }

    /// Aborts a stage and fails every job that depends on it.
    async fn abort_stage(
        &self,
        state: &mut SchedulerState,
        stage_id: StageId,
        reason: &str,
    ) -> Result<()> {
        if !state.registry.contains_stage(stage_id) {
            // The stage was cleaned up concurrently with the failure.
            return Ok(());
        }
        let final_stages: Vec<(JobId, StageId)> = state
            .active_jobs
            .values()
            .map(|job| (job.job_id, job.final_stage))
            .collect();
        let mut dependent_jobs: Vec<JobId> = final_stages
            .into_iter()
            .filter(|(_, final_stage)| {
                self.stage_depends_on(state, *final_stage, stage_id)
            })
            .map(|(job_id, _)| job_id)
            .collect();
        dependent_jobs.sort();
        if let Some(stage) = state.registry.get_mut(stage_id) {
            stage.latest_info_mut().stage_failed(reason.to_owned());
        }
        // An aborted stage never runs again.
        self.commit_coordinator.stage_end(stage_id);
        if dependent_jobs.is_empty() {
            info!(
                "Ignoring failure of stage {stage_id} because all jobs depending on \
            it are done"
            );
        }
        for job_id in dependent_jobs {
            self.fail_job_and_independent_stages(
                state,
                job_id,
                CinderError::General(format!(
                    "Job aborted due to stage failure: {reason}"
                )),
            )
            .await?;
        }
        Ok(())
    }

    /// Fails a job, cancelling the task sets of stages only this job needs,
    /// then notifies the listener and the bus.
    async fn fail_job_and_independent_stages(
        &self,
        state: &mut SchedulerState,
        job_id: JobId,
        error: CinderError,
    ) -> Result<()> {
        if !state.active_jobs.contains_key(&job_id) {
            return Ok(());
        }
        let interrupt_thread = state
            .active_jobs
            .get(&job_id)
            .and_then(|job| job.properties.get(crate::config::JOB_INTERRUPT_ON_CANCEL_KEY))
            .map(|value| value == "true")
            .unwrap_or(false);
        let mut stage_ids: Vec<StageId> =
            state.registry.stage_ids_for_job(job_id).into_iter().collect();
        stage_ids.sort();

        for stage_id in stage_ids {
            let independent = state
                .registry
                .get(stage_id)
                .map(|stage| {
                    stage.job_ids().contains(&job_id) && stage.job_ids().len() == 1
                })
                .unwrap_or(false);
            if !independent || !state.running_stages.contains(&stage_id) {
                continue;
            }
            if let Err(e) = self
                .task_scheduler
                .cancel_tasks(stage_id, interrupt_thread)
                .await
            {
                // Its tasks keep running on the cluster until they drain on
                // their own; scheduler state is cleaned up regardless.
                warn!(
                    "Could not cancel tasks for stage {stage_id}: {e}; proceeding \
                with state cleanup anyway"
                );
            }
            self.mark_stage_as_finished(state, stage_id, Some(&error.to_string()), false);
        }

        let listener = state
            .active_jobs
            .get(&job_id)
            .map(|job| job.listener.clone());
        self.cleanup_state_for_job_and_independent_stages(state, job_id);
        if let Some(listener) = listener {
            listener.job_failed(&error);
        }
        self.listener_bus.post(ListenerEvent::JobEnd {
            job_id,
            time: timestamp_millis(),
            result: JobResult::Failed(error.to_string()),
        });
        Ok(())
    }

    fn cleanup_state_for_job_and_independent_stages(
        &self,
        state: &mut SchedulerState,
        job_id: JobId,
    ) {
        let removed = state.registry.cleanup_for_job(job_id);
        for stage_id in &removed {
            state.waiting_stages.remove(stage_id);
            state.running_stages.remove(stage_id);
            state.failed_stages.remove(stage_id);
        }
        if let Some(job) = state.active_jobs.remove(&job_id) {
            if let Some(stage) = state.registry.get_mut(job.final_stage) {
                match stage {
                    Stage::Result(result_stage) => {
                        if result_stage.active_job == Some(job_id) {
                            result_stage.active_job = None;
                        }
                    }
                    Stage::ShuffleMap(map_stage) => {
                        map_stage.map_stage_jobs.retain(|id| *id != job_id);
                    }
                }
            }
        }
        state.barrier_check_failures.remove(&job_id);
        debug!("After removal of job {job_id}, {} stages remain", state.registry.len());
    }

    fn mark_stage_as_finished(
        &self,
        state: &mut SchedulerState,
        stage_id: StageId,
        error_message: Option<&str>,
        will_retry: bool,
    ) {
        let Some(stage) = state.registry.get_mut(stage_id) else {
            return;
        };
        match error_message {
            None => {
                info!("Stage {stage_id} ({}) finished", stage.call_site());
                stage.latest_info_mut().completion_time = Some(timestamp_millis());
            }
            Some(message) => {
                stage.latest_info_mut().stage_failed(message.to_owned());
                info!("Stage {stage_id} ({}) failed: {message}", stage.call_site());
            }
        }
        if !will_retry {
            self.commit_coordinator.stage_end(stage_id);
        }
        self.listener_bus.post(ListenerEvent::StageCompleted {
            stage_info: stage.latest_info().clone(),
        });
        state.running_stages.remove(&stage_id);
    }

    /// Fails every active job with a shutdown message. Called once when the
    /// scheduler stops.
    pub(crate) fn clean_up_after_scheduler_stop(&self, state: &mut SchedulerState) {
        let error =
            CinderError::General("Job cancelled because the scheduler was shut down".to_owned());
        let mut job_ids: Vec<JobId> = state.active_jobs.keys().copied().collect();
        job_ids.sort();
        let running: Vec<StageId> = state.running_stages.iter().copied().collect();
        for stage_id in running {
            self.mark_stage_as_finished(
                state,
                stage_id,
                Some("Stage cancelled because the scheduler was shut down"),
                false,
            );
        }
        for job_id in job_ids {
            if let Some(job) = state.active_jobs.get(&job_id) {
                job.listener.job_failed(&error);
            }
            self.listener_bus.post(ListenerEvent::JobEnd {
                job_id,
                time: timestamp_millis(),
                result: JobResult::Failed(error.to_string()),
            });
        }
        state.active_jobs.clear();
    }
}

/// Posts `event` onto the scheduler queue after `delay`, from a daemon
/// timer task. Used to debounce fetch failure bursts and to retry barrier
/// admission.
fn schedule_event(sender: EventSender<DagEvent>, delay: Duration, event: DagEvent) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(e) = sender.post_event(event) {
            warn!("Dropping delayed event, the scheduler has shut down: {e}");
        }
    });
}

/// The public handle of the DAG scheduler.
///
/// All mutating operations post events and return immediately; the event
/// loop owns the scheduler state. Construction wires the task scheduler to
/// the event queue so completion callbacks flow back in.
pub struct DagScheduler {
    graph: Arc<DatasetGraph>,
    processor: Arc<DagEventProcessor>,
    event_loop: EventLoop<DagEvent>,
    events: EventSender<DagEvent>,
    next_job_id: AtomicUsize,
    task_scheduler: Arc<dyn TaskScheduler>,
}

impl DagScheduler {
    /// Creates a scheduler over `graph` and starts its event loop.
    pub fn new(
        graph: Arc<DatasetGraph>,
        task_scheduler: Arc<dyn TaskScheduler>,
        block_manager: Arc<dyn BlockManagerMaster>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let processor = Arc::new(DagEventProcessor::new(
            graph.clone(),
            task_scheduler.clone(),
            block_manager,
            config,
        ));
        let action: Arc<dyn EventAction<DagEvent>> = processor.clone();
        let mut event_loop = EventLoop::new("dag-scheduler", action);
        event_loop.start()?;
        let events = event_loop.get_sender()?;
        task_scheduler.set_dag_scheduler(events.clone());
        Ok(Self {
            graph,
            processor,
            event_loop,
            events,
            next_job_id: AtomicUsize::new(0),
            task_scheduler,
        })
    }

    /// The telemetry bus this scheduler posts lifecycle events to.
    pub fn listener_bus(&self) -> Arc<ListenerBus> {
        self.processor.listener_bus.clone()
    }

    /// The shuffle output registry owned by this scheduler.
    pub fn map_output_tracker(&self) -> Arc<MapOutputTrackerMaster> {
        self.processor.map_output_tracker.clone()
    }

    /// The output commit coordinator owned by this scheduler.
    pub fn commit_coordinator(&self) -> Arc<OutputCommitCoordinator> {
        self.processor.commit_coordinator.clone()
    }

    /// A sender for posting events, handed to collaborators.
    pub fn event_sender(&self) -> EventSender<DagEvent> {
        self.events.clone()
    }

    /// Submits a job computing `partitions` of `dataset` and returns a
    /// waiter. `handler` receives each output as it arrives. Fails fast on
    /// out-of-range partition indices.
    pub fn submit_job(
        &self,
        dataset: DatasetId,
        func: Arc<dyn ResultFunc>,
        partitions: &[usize],
        call_site: &str,
        handler: Box<dyn Fn(usize, &TaskValue) + Send + Sync>,
        properties: HashMap<String, String>,
    ) -> Result<JobWaiter> {
        let max_partitions = self.graph.num_partitions(dataset);
        if let Some(bad) = partitions.iter().find(|p| **p >= max_partitions) {
            return Err(CinderError::General(format!(
                "Attempting to access a non-existent partition: {bad}. \
            Total number of partitions: {max_partitions}"
            )));
        }
        let job_id = JobId(self.next_job_id.fetch_add(1, Ordering::SeqCst));
        let (listener, waiter) =
            JobWaiter::new(job_id, partitions.len(), handler, self.events.clone());
        if partitions.is_empty() {
            // No work at all: the job succeeds trivially.
            let time = timestamp_millis();
            self.processor.listener_bus.post(ListenerEvent::JobStart {
                job_id,
                time,
                stage_infos: vec![],
                properties,
            });
            self.processor.listener_bus.post(ListenerEvent::JobEnd {
                job_id,
                time,
                result: JobResult::Succeeded,
            });
            return Ok(waiter);
        }
        self.events.post_event(DagEvent::JobSubmitted {
            job_id,
            dataset,
            func,
            partitions: partitions.to_vec(),
            call_site: call_site.to_owned(),
            listener,
            properties,
        })?;
        Ok(waiter)
    }

    /// Submits a job and blocks until it terminates.
    pub async fn run_job(
        &self,
        dataset: DatasetId,
        func: Arc<dyn ResultFunc>,
        partitions: &[usize],
        call_site: &str,
        handler: Box<dyn Fn(usize, &TaskValue) + Send + Sync>,
        properties: HashMap<String, String>,
    ) -> Result<()> {
        let start = Instant::now();
        let waiter =
            self.submit_job(dataset, func, partitions, call_site, handler, properties)?;
        let job_id = waiter.job_id();
        match waiter.completion().await {
            Ok(()) => {
                info!(
                    "Job {job_id} finished: {call_site}, took {:?}",
                    start.elapsed()
                );
                Ok(())
            }
            Err(e) => {
                info!(
                    "Job {job_id} failed: {call_site}, took {:?}",
                    start.elapsed()
                );
                Err(CinderError::General(format!("{e} (at {call_site})")))
            }
        }
    }

    /// Runs a job wired to an approximate evaluator; returns whatever the
    /// evaluator has after `timeout`, flagged partial if tasks were still
    /// outstanding.
    pub async fn run_approximate_job<E: ApproximateEvaluator>(
        &self,
        dataset: DatasetId,
        func: Arc<dyn ResultFunc>,
        evaluator: E,
        call_site: &str,
        properties: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<PartialResult<E::Output>> {
        let num_partitions = self.graph.num_partitions(dataset);
        let partitions: Vec<usize> = (0..num_partitions).collect();
        let (listener, mut done) =
            ApproximateActionListener::new(evaluator, num_partitions);
        if num_partitions == 0 {
            return Ok(PartialResult {
                value: listener.current_result(),
                is_final: true,
            });
        }
        let job_id = JobId(self.next_job_id.fetch_add(1, Ordering::SeqCst));
        self.events.post_event(DagEvent::JobSubmitted {
            job_id,
            dataset,
            func,
            partitions,
            call_site: call_site.to_owned(),
            listener: listener.clone(),
            properties,
        })?;

        let outcome = tokio::time::timeout(timeout, async {
            loop {
                let signal = done.borrow_and_update().clone();
                if let Some(signal) = signal {
                    return signal;
                }
                if done.changed().await.is_err() {
                    return Err("scheduler dropped the job".to_owned());
                }
            }
        })
        .await;
        match outcome {
            Ok(Ok(())) => Ok(PartialResult {
                value: listener.current_result(),
                is_final: true,
            }),
            Ok(Err(message)) => Err(CinderError::General(message)),
            Err(_elapsed) => {
                info!("Job {job_id} timed out after {timeout:?}, returning partial result");
                Ok(PartialResult {
                    value: listener.current_result(),
                    is_final: false,
                })
            }
        }
    }

    /// Submits a job that only materializes a shuffle map stage. The
    /// statistics callback fires when the shuffle is fully available.
    pub fn submit_map_stage<F>(
        &self,
        dependency: ShuffleDependency,
        call_site: &str,
        properties: HashMap<String, String>,
        stats_handler: F,
    ) -> Result<JobWaiter>
    where
        F: Fn(&MapOutputStatistics) + Send + Sync + 'static,
    {
        if self.graph.num_partitions(dependency.parent) == 0 {
            return Err(CinderError::General(
                "Cannot submit a map stage over a dataset with no partitions".to_owned(),
            ));
        }
        let job_id = JobId(self.next_job_id.fetch_add(1, Ordering::SeqCst));
        let handler = Box::new(move |_index: usize, value: &TaskValue| {
            if let TaskValue::MapOutputStats(stats) = value {
                stats_handler(stats);
            }
        });
        let (listener, waiter) = JobWaiter::new(job_id, 1, handler, self.events.clone());
        self.events.post_event(DagEvent::MapStageSubmitted {
            job_id,
            dependency,
            call_site: call_site.to_owned(),
            listener,
            properties,
        })?;
        Ok(waiter)
    }

    /// Requests cancellation of one job.
    pub fn cancel_job(&self, job_id: JobId, reason: Option<String>) -> Result<()> {
        info!("Asked to cancel job {job_id}");
        self.events.post_event(DagEvent::JobCancelled { job_id, reason })
    }

    /// Requests cancellation of every job in a group.
    pub fn cancel_job_group(&self, group_id: &str) -> Result<()> {
        info!("Asked to cancel job group {group_id}");
        self.events.post_event(DagEvent::JobGroupCancelled {
            group_id: group_id.to_owned(),
        })
    }

    /// Requests cancellation of all active jobs.
    pub fn cancel_all_jobs(&self) -> Result<()> {
        self.events.post_event(DagEvent::AllJobsCancelled)
    }

    /// Requests cancellation of a stage and every job depending on it.
    pub fn cancel_stage(&self, stage_id: StageId, reason: Option<String>) -> Result<()> {
        self.events.post_event(DagEvent::StageCancelled { stage_id, reason })
    }

    /// Kills one task attempt through the task scheduler.
    pub async fn kill_task_attempt(
        &self,
        task_id: u64,
        interrupt_thread: bool,
        reason: &str,
    ) -> Result<bool> {
        self.task_scheduler
            .kill_task_attempt(task_id, interrupt_thread, reason)
            .await
    }

    /// Notification that a task started executing.
    pub fn task_started(&self, task: Task, task_info: TaskInfo) -> Result<()> {
        self.events.post_event(DagEvent::TaskStarted { task, task_info })
    }

    /// Notification that a task is fetching its remote result.
    pub fn task_getting_result(&self, task_info: TaskInfo) -> Result<()> {
        self.events.post_event(DagEvent::TaskGettingResult { task_info })
    }

    /// Notification that a task finished.
    pub fn task_ended(&self, event: CompletionEvent) -> Result<()> {
        self.events.post_event(DagEvent::TaskCompleted(Box::new(event)))
    }

    /// Notification that a whole task set was given up on.
    pub fn task_set_failed(&self, stage_id: StageId, reason: String) -> Result<()> {
        self.events.post_event(DagEvent::TaskSetFailed { stage_id, reason })
    }

    /// Notification that a speculative task copy was requested.
    pub fn speculative_task_submitted(
        &self,
        stage_id: StageId,
        stage_attempt_id: usize,
    ) -> Result<()> {
        self.events.post_event(DagEvent::SpeculativeTaskSubmitted {
            stage_id,
            stage_attempt_id,
        })
    }

    /// Notification that an executor joined.
    pub fn executor_added(&self, executor_id: &str, host: &str) -> Result<()> {
        self.events.post_event(DagEvent::ExecutorAdded {
            executor_id: executor_id.to_owned(),
            host: host.to_owned(),
        })
    }

    /// Notification that an executor was lost.
    pub fn executor_lost(
        &self,
        executor_id: &str,
        reason: ExecutorLossReason,
    ) -> Result<()> {
        self.events.post_event(DagEvent::ExecutorLost {
            executor_id: executor_id.to_owned(),
            reason,
        })
    }

    /// Notification that a worker was removed.
    pub fn worker_removed(
        &self,
        worker_id: &str,
        host: &str,
        message: &str,
    ) -> Result<()> {
        self.events.post_event(DagEvent::WorkerRemoved {
            worker_id: worker_id.to_owned(),
            host: host.to_owned(),
            message: message.to_owned(),
        })
    }

    /// Forwards executor metrics to the listener bus. Returns whether the
    /// executor should be considered alive.
    pub fn executor_heartbeat_received(
        &self,
        executor_id: &str,
        accum_updates: Vec<AccumUpdate>,
    ) -> bool {
        self.processor
            .listener_bus
            .post(ListenerEvent::ExecutorMetricsUpdate {
                executor_id: executor_id.to_owned(),
                accum_updates,
            });
        true
    }

    /// Placement preferences for one partition of a dataset. Safe to call
    /// from the task-submission path.
    pub async fn get_preferred_locs(
        &self,
        dataset: DatasetId,
        partition: usize,
    ) -> Result<Vec<TaskLocation>> {
        self.processor.preferred_locations(dataset, partition).await
    }

    /// Fails every active job with a shutdown message and stops the event
    /// loop.
    pub async fn stop(&self) {
        {
            let mut state = self.processor.state.lock().await;
            self.processor.clean_up_after_scheduler_stop(&mut state);
        }
        self.event_loop.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        shuffle_chain, SchedulerHarness, TestJobListener, UnserializableFunc,
    };
    use cinder_core::dataset::{DatasetSpec, DeterminismLevel, Partitioner, StorageLevel};
    use cinder_core::metadata::DatasetBlockId;

    fn test_config() -> SchedulerConfig {
        SchedulerConfig::default().with_resubmit_timeout(Duration::from_millis(5))
    }

    fn new_harness(num_shuffles: usize, partitions: usize) -> (SchedulerHarness, DatasetId, Vec<ShuffleDependency>) {
        let graph = Arc::new(DatasetGraph::new());
        let (final_ds, deps) = shuffle_chain(&graph, num_shuffles, partitions);
        let harness = SchedulerHarness::new(graph, test_config());
        (harness, final_ds, deps)
    }

    #[tokio::test]
    async fn linear_three_stage_job_runs_to_completion() -> Result<()> {
        let (harness, final_ds, deps) = new_harness(2, 4);
        let (job_id, listener) = harness.submit(final_ds, &[0, 1, 2, 3]).await?;

        // Stages are numbered deepest first, parents chain 0 <- 1 <- 2.
        assert_eq!(harness.registered_stage_count().await, 3);
        assert_eq!(harness.stage_parents(StageId(0)).await, vec![]);
        assert_eq!(harness.stage_parents(StageId(1)).await, vec![StageId(0)]);
        assert_eq!(harness.stage_parents(StageId(2)).await, vec![StageId(1)]);

        // Only the source stage is runnable at first.
        let ts0 = harness.take_single_task_set();
        assert_eq!(ts0.stage_id, StageId(0));
        assert_eq!(ts0.tasks.len(), 4);
        assert_eq!(harness.waiting_stages().await, vec![StageId(1), StageId(2)]);
        harness.complete_shuffle_map_stage(&ts0).await?;

        let ts1 = harness.take_single_task_set();
        assert_eq!(ts1.stage_id, StageId(1));
        harness.complete_shuffle_map_stage(&ts1).await?;

        let ts2 = harness.take_single_task_set();
        assert_eq!(ts2.stage_id, StageId(2));
        assert!(ts2
            .tasks
            .iter()
            .all(|task| matches!(task.kind, TaskKind::Result { .. })));
        for task in &ts2.tasks {
            harness.complete_result_task(task, vec![task.partition as u8]).await?;
        }

        assert_eq!(listener.num_results(), 4);
        assert_eq!(listener.failure(), None);
        assert!(!harness.is_job_active(job_id).await);
        // Job cleanup dropped every stage; the tracker keeps the metadata.
        assert_eq!(harness.registered_stage_count().await, 0);
        assert_eq!(
            harness.tracker().num_available_outputs(deps[0].shuffle_id),
            4
        );
        Ok(())
    }

    #[tokio::test]
    async fn fetch_failure_resubmits_only_the_lost_partition() -> Result<()> {
        let (mut harness, final_ds, deps) = new_harness(2, 4);
        let (_job_id, listener) = harness.submit(final_ds, &[0, 1, 2, 3]).await?;
        let ts0 = harness.take_single_task_set();
        harness.complete_shuffle_map_stage(&ts0).await?;
        let ts1 = harness.take_single_task_set();
        harness.complete_shuffle_map_stage(&ts1).await?;
        let ts2 = harness.take_single_task_set();

        // The result stage cannot fetch map output 2 of the second shuffle.
        harness
            .fetch_fail_task(&ts2.tasks[0], deps[1].shuffle_id, Some(2), "exec-1-2")
            .await?;
        assert_eq!(
            harness.tracker().find_missing_partitions(deps[1].shuffle_id),
            Some(vec![2])
        );
        // The first shuffle is untouched.
        assert_eq!(
            harness.tracker().find_missing_partitions(deps[0].shuffle_id),
            Some(vec![])
        );

        // Nothing is resubmitted until the debounce fires.
        assert!(harness.take_task_sets().is_empty());
        let event = harness
            .next_posted_event(Duration::from_secs(2))
            .await
            .expect("resubmission should be scheduled");
        assert!(matches!(event, DagEvent::ResubmitFailedStages));
        harness.process(event).await?;

        // Only the lost partition of the map stage reruns.
        let ts1b = harness.take_single_task_set();
        assert_eq!(ts1b.stage_id, StageId(1));
        assert_eq!(
            ts1b.tasks.iter().map(|t| t.partition).collect::<Vec<_>>(),
            vec![2]
        );
        assert!(ts1b.stage_attempt_id > ts1.stage_attempt_id);
        harness.complete_shuffle_map_task(&ts1b.tasks[0], "exec-1-2").await?;

        // The result stage reruns in full and the job succeeds.
        let ts2b = harness.take_single_task_set();
        assert_eq!(ts2b.stage_id, StageId(2));
        assert_eq!(ts2b.tasks.len(), 4);
        for task in &ts2b.tasks {
            harness.complete_result_task(task, vec![]).await?;
        }
        assert_eq!(listener.num_results(), 4);
        assert_eq!(listener.failure(), None);
        Ok(())
    }

    #[tokio::test]
    async fn fetch_failure_bursts_coalesce_into_one_resubmission() -> Result<()> {
        let (mut harness, final_ds, deps) = new_harness(1, 4);
        harness.submit(final_ds, &[0, 1, 2, 3]).await?;
        let ts0 = harness.take_single_task_set();
        harness.complete_shuffle_map_stage(&ts0).await?;
        let ts1 = harness.take_single_task_set();

        harness
            .fetch_fail_task(&ts1.tasks[0], deps[0].shuffle_id, Some(1), "exec-0-1")
            .await?;
        harness
            .fetch_fail_task(&ts1.tasks[1], deps[0].shuffle_id, Some(3), "exec-0-3")
            .await?;

        let first = harness.next_posted_event(Duration::from_secs(2)).await;
        assert!(matches!(first, Some(DagEvent::ResubmitFailedStages)));
        let second = harness.next_posted_event(Duration::from_millis(100)).await;
        assert!(second.is_none(), "burst must coalesce into one resubmission");
        Ok(())
    }

    #[tokio::test]
    async fn repeated_fetch_failures_abort_the_stage() -> Result<()> {
        let (mut harness, final_ds, deps) = new_harness(2, 2);
        let (job_id, listener) = harness.submit(final_ds, &[0, 1]).await?;
        let ts0 = harness.take_single_task_set();
        harness.complete_shuffle_map_stage(&ts0).await?;
        let ts1 = harness.take_single_task_set();
        harness.complete_shuffle_map_stage(&ts1).await?;
        let mut result_set = harness.take_single_task_set();

        for round in 0..4 {
            harness
                .fetch_fail_task(
                    &result_set.tasks[0],
                    deps[1].shuffle_id,
                    Some(0),
                    "exec-1-0",
                )
                .await?;
            if round < 3 {
                let event = harness
                    .next_posted_event(Duration::from_secs(2))
                    .await
                    .expect("resubmission should be scheduled");
                harness.process(event).await?;
                // The map stage reruns its lost partition, then the result
                // stage gets a fresh attempt.
                let map_set = harness.take_single_task_set();
                assert_eq!(map_set.stage_id, StageId(1));
                harness
                    .complete_shuffle_map_task(&map_set.tasks[0], "exec-1-0")
                    .await?;
                result_set = harness.take_single_task_set();
                assert_eq!(result_set.stage_id, StageId(2));
            }
        }

        let failure = listener.failure().expect("job should have failed");
        assert!(
            failure.contains("maximum allowable number of times: 4"),
            "unexpected failure message: {failure}"
        );
        assert!(!harness.is_job_active(job_id).await);
        Ok(())
    }

    #[tokio::test]
    async fn indeterminate_map_stage_aborts_partially_complete_successors() -> Result<()> {
        let graph = Arc::new(DatasetGraph::new());
        let source = graph.register(
            DatasetSpec::new("random-sample", 4)
                .with_determinism(DeterminismLevel::Indeterminate),
        );
        let dep = graph.shuffle_dependency(source, Partitioner::Hash { partitions: 2 });
        let reduced =
            graph.register(DatasetSpec::new("reduce", 2).with_shuffle(dep.clone()));
        let harness = SchedulerHarness::new(graph, test_config());

        let (job_id, listener) = harness.submit(reduced, &[0, 1]).await?;
        let ts0 = harness.take_single_task_set();
        harness.complete_shuffle_map_stage(&ts0).await?;
        let ts1 = harness.take_single_task_set();

        // One output is already delivered when the fetch failure arrives.
        harness.complete_result_task(&ts1.tasks[0], vec![1]).await?;
        harness
            .fetch_fail_task(&ts1.tasks[1], dep.shuffle_id, Some(1), "exec-0-1")
            .await?;

        let failure = listener.failure().expect("job should have failed");
        assert!(
            failure.contains("indeterminate"),
            "unexpected failure message: {failure}"
        );
        assert!(!harness.is_job_active(job_id).await);
        // Every output of the indeterminate producer was discarded.
        assert_eq!(harness.tracker().num_available_outputs(dep.shuffle_id), 0);
        Ok(())
    }

    #[tokio::test]
    async fn executor_loss_without_external_shuffle_drops_its_outputs() -> Result<()> {
        let (harness, final_ds, deps) = new_harness(2, 4);
        harness.submit(final_ds, &[0, 1, 2, 3]).await?;
        let ts0 = harness.take_single_task_set();
        harness.complete_shuffle_map_stage(&ts0).await?;

        harness
            .process(DagEvent::ExecutorLost {
                executor_id: "exec-0-2".to_owned(),
                reason: ExecutorLossReason::ExecutorExited {
                    exit_code: 1,
                    message: "worker crashed".to_owned(),
                },
            })
            .await?;

        assert!(harness.executor_failure_epoch("exec-0-2").await.is_some());
        assert!(harness.shuffle_file_lost_epoch("exec-0-2").await.is_some());
        assert_eq!(
            harness.tracker().find_missing_partitions(deps[0].shuffle_id),
            Some(vec![2])
        );
        Ok(())
    }

    #[tokio::test]
    async fn stale_outputs_from_failed_executors_are_discarded() -> Result<()> {
        let (harness, final_ds, deps) = new_harness(1, 4);
        harness.submit(final_ds, &[0, 1, 2, 3]).await?;
        let ts0 = harness.take_single_task_set();

        harness.complete_shuffle_map_task(&ts0.tasks[0], "exec-0-0").await?;
        harness.complete_shuffle_map_task(&ts0.tasks[1], "exec-0-1").await?;

        // The executor that produced partition 0 dies mid-stage.
        harness
            .process(DagEvent::ExecutorLost {
                executor_id: "exec-0-0".to_owned(),
                reason: ExecutorLossReason::WorkerLost {
                    message: "heartbeat timeout".to_owned(),
                },
            })
            .await?;

        // A late completion from the dead executor is ignored, a late
        // completion from a live one is kept.
        harness.complete_shuffle_map_task(&ts0.tasks[2], "exec-0-0").await?;
        harness.complete_shuffle_map_task(&ts0.tasks[3], "exec-0-3").await?;

        // All tasks reported, but partitions 0 and 2 are gone, so the stage
        // resubmits exactly those.
        let retry = harness.take_single_task_set();
        assert_eq!(retry.stage_id, StageId(0));
        let mut partitions: Vec<usize> =
            retry.tasks.iter().map(|t| t.partition).collect();
        partitions.sort();
        assert_eq!(partitions, vec![0, 2]);
        assert_eq!(
            harness.tracker().num_available_outputs(deps[0].shuffle_id),
            2
        );
        Ok(())
    }

    #[tokio::test]
    async fn cancelling_a_job_group_spares_other_jobs() -> Result<()> {
        let graph = Arc::new(DatasetGraph::new());
        let (ds_a, _) = shuffle_chain(&graph, 1, 2);
        let (ds_b, _) = shuffle_chain(&graph, 1, 2);
        let (ds_c, _) = shuffle_chain(&graph, 1, 2);
        let harness = SchedulerHarness::new(graph, test_config());

        let mut grouped = HashMap::new();
        grouped.insert(JOB_GROUP_ID_KEY.to_owned(), "G".to_owned());
        let (job_a, listener_a) = harness
            .submit_with_properties(ds_a, &[0, 1], grouped.clone())
            .await?;
        let (job_b, listener_b) =
            harness.submit_with_properties(ds_b, &[0, 1], grouped).await?;
        let (job_c, listener_c) = harness.submit(ds_c, &[0, 1]).await?;

        harness
            .process(DagEvent::JobGroupCancelled {
                group_id: "G".to_owned(),
            })
            .await?;

        for (job_id, listener) in [(job_a, &listener_a), (job_b, &listener_b)] {
            let failure = listener.failure().expect("grouped job should fail");
            assert!(
                failure.contains("part of cancelled job group G"),
                "unexpected failure message: {failure}"
            );
            assert!(!harness.is_job_active(job_id).await);
        }
        assert_eq!(listener_c.failure(), None);
        assert!(harness.is_job_active(job_c).await);
        Ok(())
    }

    #[tokio::test]
    async fn cancelling_a_stage_fails_dependent_jobs() -> Result<()> {
        let (harness, final_ds, _deps) = new_harness(1, 2);
        let (job_id, listener) = harness.submit(final_ds, &[0, 1]).await?;
        let ts0 = harness.take_single_task_set();

        harness
            .process(DagEvent::StageCancelled {
                stage_id: ts0.stage_id,
                reason: Some("requested by the user".to_owned()),
            })
            .await?;

        let failure = listener.failure().expect("job should fail");
        assert!(failure.contains("because stage 0 was cancelled"));
        assert!(!harness.is_job_active(job_id).await);
        assert_eq!(harness.task_scheduler.cancelled_stages(), vec![StageId(0)]);
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_cleans_up_even_without_kill_support() -> Result<()> {
        let (harness, final_ds, _deps) = new_harness(1, 2);
        let (job_id, listener) = harness.submit(final_ds, &[0, 1]).await?;
        let _ts0 = harness.take_single_task_set();

        harness.task_scheduler.fail_cancellation();
        harness
            .process(DagEvent::JobCancelled {
                job_id,
                reason: None,
            })
            .await?;

        assert!(listener.failure().is_some());
        assert!(!harness.is_job_active(job_id).await);
        assert_eq!(harness.registered_stage_count().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn task_set_failure_aborts_the_stage() -> Result<()> {
        let (harness, final_ds, _deps) = new_harness(1, 2);
        let (job_id, listener) = harness.submit(final_ds, &[0, 1]).await?;
        let ts0 = harness.take_single_task_set();

        harness
            .process(DagEvent::TaskSetFailed {
                stage_id: ts0.stage_id,
                reason: "executor blacklisted".to_owned(),
            })
            .await?;

        let failure = listener.failure().expect("job should fail");
        assert!(failure.contains("executor blacklisted"));
        assert!(!harness.is_job_active(job_id).await);
        Ok(())
    }

    #[tokio::test]
    async fn unserializable_closure_fails_the_job() -> Result<()> {
        let graph = Arc::new(DatasetGraph::new());
        let dataset = graph.register(DatasetSpec::new("source", 2));
        let harness = SchedulerHarness::new(graph, test_config());
        let listener = TestJobListener::new();

        harness
            .process(DagEvent::JobSubmitted {
                job_id: JobId(0),
                dataset,
                func: Arc::new(UnserializableFunc),
                partitions: vec![0, 1],
                call_site: "collect at test:0".to_owned(),
                listener: listener.clone(),
                properties: HashMap::new(),
            })
            .await?;

        let failure = listener.failure().expect("job should fail");
        assert!(
            failure.contains("serialize"),
            "unexpected failure message: {failure}"
        );
        assert!(harness.take_task_sets().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn map_stage_jobs_reuse_materialized_shuffles() -> Result<()> {
        let graph = Arc::new(DatasetGraph::new());
        let source = graph.register(DatasetSpec::new("source", 3));
        let dep = graph.shuffle_dependency(source, Partitioner::Hash { partitions: 2 });
        // Register the reduce side so the shuffle has a consumer later.
        let _reduced =
            graph.register(DatasetSpec::new("reduce", 2).with_shuffle(dep.clone()));
        let harness = SchedulerHarness::new(graph, test_config());

        let listener = TestJobListener::new();
        harness
            .process(DagEvent::MapStageSubmitted {
                job_id: JobId(0),
                dependency: dep.clone(),
                call_site: "count at test:0".to_owned(),
                listener: listener.clone(),
                properties: HashMap::new(),
            })
            .await?;

        let ts0 = harness.take_single_task_set();
        assert_eq!(ts0.tasks.len(), 3);
        harness.complete_shuffle_map_stage(&ts0).await?;

        let results = listener.results();
        assert_eq!(results.len(), 1);
        let TaskValue::MapOutputStats(stats) = &results[0].1 else {
            panic!("map stage job should receive statistics");
        };
        assert_eq!(stats.bytes_by_partition, vec![3, 3]);

        // A second map stage job over the same shuffle finishes without
        // running any tasks.
        let listener2 = TestJobListener::new();
        harness
            .process(DagEvent::MapStageSubmitted {
                job_id: JobId(1),
                dependency: dep,
                call_site: "count at test:1".to_owned(),
                listener: listener2.clone(),
                properties: HashMap::new(),
            })
            .await?;
        assert!(harness.take_task_sets().is_empty());
        assert_eq!(listener2.num_results(), 1);
        assert!(!harness.is_job_active(JobId(1)).await);
        Ok(())
    }

    #[tokio::test]
    async fn barrier_stage_is_rejected_under_dynamic_allocation() -> Result<()> {
        let graph = Arc::new(DatasetGraph::new());
        let dataset = graph.register(DatasetSpec::new("barrier-train", 2).with_barrier(true));
        let harness = SchedulerHarness::new(
            graph,
            test_config().with_dynamic_allocation(true),
        );

        let (job_id, listener) = harness.submit(dataset, &[0, 1]).await?;
        let failure = listener.failure().expect("job should fail");
        assert!(failure.contains("dynamic resource allocation"));
        assert!(!harness.is_job_active(job_id).await);
        Ok(())
    }

    #[tokio::test]
    async fn barrier_slot_check_retries_then_fails() -> Result<()> {
        let graph = Arc::new(DatasetGraph::new());
        let dataset = graph.register(DatasetSpec::new("barrier-train", 4).with_barrier(true));
        let mut harness = SchedulerHarness::new(
            graph,
            test_config()
                .with_max_concurrent_task_slots(2)
                .with_barrier_check_interval(Duration::from_millis(1))
                .with_barrier_check_max_failures(2),
        );

        let (_job_id, listener) = harness.submit(dataset, &[0, 1, 2, 3]).await?;
        // Two retries are reposted before the job is failed.
        for _ in 0..2 {
            assert_eq!(listener.failure(), None);
            let event = harness
                .next_posted_event(Duration::from_secs(2))
                .await
                .expect("slot check retry should be scheduled");
            assert!(matches!(event, DagEvent::JobSubmitted { .. }));
            harness.process(event).await?;
        }
        let failure = listener.failure().expect("job should fail");
        assert!(
            failure.contains("task slots"),
            "unexpected failure message: {failure}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn barrier_task_failure_aborts_and_releases_commit_state() -> Result<()> {
        let graph = Arc::new(DatasetGraph::new());
        let source =
            graph.register(DatasetSpec::new("barrier-train", 2).with_barrier(true));
        let dep = graph.shuffle_dependency(source, Partitioner::Hash { partitions: 2 });
        let reduced = graph.register(DatasetSpec::new("reduce", 2).with_shuffle(dep));
        let harness =
            SchedulerHarness::new(graph, test_config().with_no_stage_retry(true));

        let (job_id, listener) = harness.submit(reduced, &[0, 1]).await?;
        let ts0 = harness.take_single_task_set();
        assert!(ts0.tasks[0].barrier);

        harness
            .process(DagEvent::TaskCompleted(Box::new(CompletionEvent {
                task: ts0.tasks[0].clone(),
                reason: TaskEndReason::ExceptionFailure {
                    description: "barrier sync failed".to_owned(),
                },
                result: None,
                accum_updates: vec![],
                task_info: harness.task_info("exec-0"),
            })))
            .await?;

        // The whole stage is killed and, with retries disabled, aborted.
        assert_eq!(harness.task_scheduler.killed_stages(), vec![StageId(0)]);
        assert!(listener.failure().is_some());
        assert!(!harness.is_job_active(job_id).await);
        // Commit tracking for the aborted stage is gone with it.
        assert!(!harness
            .processor
            .commit_coordinator
            .can_commit(StageId(0), ts0.stage_attempt_id, 0, 0));
        Ok(())
    }

    #[tokio::test]
    async fn preferred_locations_follow_cache_then_hints_then_lineage() -> Result<()> {
        let graph = Arc::new(DatasetGraph::new());
        let source = graph.register(
            DatasetSpec::new("hdfs-scan", 2).with_preferred_locations(|partition| {
                vec![TaskLocation::Host(format!("datanode-{partition}"))]
            }),
        );
        let mapped = graph.register(
            DatasetSpec::new("map", 2)
                .with_narrow_parent(source)
                .with_storage_level(StorageLevel::Memory),
        );
        let harness = SchedulerHarness::new(graph.clone(), test_config());

        // Nothing cached yet: the narrow descent reaches the scan's hints.
        let locs = harness.processor.preferred_locations(mapped, 1).await?;
        assert_eq!(locs, vec![TaskLocation::Host("datanode-1".to_owned())]);

        // A cached replica beats lineage placement.
        harness.block_manager.register_block(
            DatasetBlockId {
                dataset: mapped,
                partition: 1,
            },
            SchedulerHarness::block_manager_id("exec-9"),
        );
        harness.processor.cache_index.clear();
        let locs = harness.processor.preferred_locations(mapped, 1).await?;
        assert_eq!(
            locs,
            vec![TaskLocation::ExecutorCache {
                host: "host-exec-9".to_owned(),
                executor_id: "exec-9".to_owned(),
            }]
        );
        Ok(())
    }

    #[tokio::test]
    async fn end_to_end_job_runs_through_the_event_loop() -> Result<()> {
        use crate::test_utils::{result_success, shuffle_success, MockTaskScheduler, NoopFunc};
        use crate::block_manager::InMemoryBlockManagerMaster;

        let graph = Arc::new(DatasetGraph::new());
        let (final_ds, _deps) = shuffle_chain(&graph, 1, 2);
        let task_scheduler = MockTaskScheduler::new();
        let block_manager = Arc::new(InMemoryBlockManagerMaster::new());
        let scheduler = Arc::new(DagScheduler::new(
            graph,
            task_scheduler.clone(),
            block_manager,
            SchedulerConfig::default(),
        )?);

        // Play the executor side: complete whatever the scheduler submits.
        let driver = {
            let scheduler = scheduler.clone();
            let task_scheduler = task_scheduler.clone();
            tokio::spawn(async move {
                let mut completed_sets = 0;
                while completed_sets < 2 {
                    for set in task_scheduler.take_task_sets() {
                        for task in &set.tasks {
                            let event = match task.kind {
                                TaskKind::ShuffleMap { .. } => shuffle_success(
                                    task,
                                    &format!("exec-{}", task.partition),
                                ),
                                TaskKind::Result { .. } => {
                                    result_success(task, vec![task.partition as u8])
                                }
                            };
                            scheduler.task_ended(event).unwrap();
                        }
                        completed_sets += 1;
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
        };

        let delivered = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = delivered.clone();
        let waiter = scheduler.submit_job(
            final_ds,
            Arc::new(NoopFunc),
            &[0, 1],
            "collect at test:1",
            Box::new(move |index, _| seen.lock().push(index)),
            HashMap::new(),
        )?;
        waiter.completion().await?;
        driver.await?;

        let mut outputs = delivered.lock().clone();
        outputs.sort();
        assert_eq!(outputs, vec![0, 1]);
        scheduler.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn stopping_the_scheduler_fails_active_jobs() -> Result<()> {
        use crate::test_utils::{MockTaskScheduler, NoopFunc};
        use crate::block_manager::InMemoryBlockManagerMaster;

        let graph = Arc::new(DatasetGraph::new());
        let (final_ds, _deps) = shuffle_chain(&graph, 1, 2);
        let task_scheduler = MockTaskScheduler::new();
        let scheduler = DagScheduler::new(
            graph,
            task_scheduler.clone(),
            Arc::new(InMemoryBlockManagerMaster::new()),
            SchedulerConfig::default(),
        )?;

        let waiter = scheduler.submit_job(
            final_ds,
            Arc::new(NoopFunc),
            &[0, 1],
            "collect at test:1",
            Box::new(|_, _| {}),
            HashMap::new(),
        )?;
        // Wait until the job is registered (its first stage got submitted),
        // then shut down with the job still running.
        let registered =
            cinder_core::utils::await_condition(Duration::from_millis(5), 200, || {
                std::future::ready(Ok(!task_scheduler.take_task_sets().is_empty()))
            })
            .await?;
        assert!(registered);
        scheduler.stop().await;

        let err = waiter.completion().await.unwrap_err();
        assert!(err.to_string().contains("shut down"));
        Ok(())
    }

    #[tokio::test]
    async fn late_fetch_failures_from_old_attempts_are_ignored() -> Result<()> {
        let (mut harness, final_ds, deps) = new_harness(1, 2);
        harness.submit(final_ds, &[0, 1]).await?;
        let ts0 = harness.take_single_task_set();
        harness.complete_shuffle_map_stage(&ts0).await?;
        let ts1 = harness.take_single_task_set();

        harness
            .fetch_fail_task(&ts1.tasks[0], deps[0].shuffle_id, Some(0), "exec-0-0")
            .await?;
        let event = harness
            .next_posted_event(Duration::from_secs(2))
            .await
            .expect("resubmission should be scheduled");
        harness.process(event).await?;
        let map_retry = harness.take_single_task_set();
        harness
            .complete_shuffle_map_task(&map_retry.tasks[0], "exec-0-0b")
            .await?;
        let ts1b = harness.take_single_task_set();
        assert!(ts1b.stage_attempt_id > ts1.stage_attempt_id);

        // A straggler failure from the first attempt must not fail the new
        // attempt or enqueue another resubmission.
        harness
            .fetch_fail_task(&ts1.tasks[1], deps[0].shuffle_id, Some(1), "exec-0-1")
            .await?;
        assert!(harness
            .next_posted_event(Duration::from_millis(100))
            .await
            .is_none());
        assert_eq!(harness.running_stages().await, vec![ts1b.stage_id]);
        Ok(())
    }
}
