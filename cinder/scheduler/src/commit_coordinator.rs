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

//! Arbitration of output commits, so that exactly one attempt per partition
//! commits its output.

use std::collections::HashMap;

use log::{debug, info};
use parking_lot::Mutex;

use crate::stage::StageId;
use crate::task::TaskEndReason;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct TaskIdentifier {
    stage_attempt: usize,
    task_attempt: usize,
}

struct StageCommitState {
    /// Authorized committer per partition, `None` while nobody asked.
    authorized_committers: Vec<Option<TaskIdentifier>>,
}

/// Tracks which task attempt may commit output for each partition of each
/// running stage.
#[derive(Default)]
pub struct OutputCommitCoordinator {
    stages: Mutex<HashMap<StageId, StageCommitState>>,
}

impl OutputCommitCoordinator {
    /// Creates a coordinator with no tracked stages.
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins tracking a stage attempt covering partitions
    /// `0..=max_partition_id`. Authorizations of a previous attempt of the
    /// same stage are kept so its committed outputs stay committed.
    pub fn stage_start(&self, stage_id: StageId, max_partition_id: usize) {
        let mut stages = self.stages.lock();
        stages
            .entry(stage_id)
            .and_modify(|state| {
                state
                    .authorized_committers
                    .resize(max_partition_id + 1, None)
            })
            .or_insert_with(|| StageCommitState {
                authorized_committers: vec![None; max_partition_id + 1],
            });
    }

    /// Stops tracking a stage.
    pub fn stage_end(&self, stage_id: StageId) {
        self.stages.lock().remove(&stage_id);
    }

    /// Decides whether the given task attempt may commit its output for
    /// `partition`. The first attempt to ask wins; later attempts are
    /// denied until the winner is known to have failed.
    pub fn can_commit(
        &self,
        stage_id: StageId,
        stage_attempt: usize,
        partition: usize,
        task_attempt: usize,
    ) -> bool {
        let mut stages = self.stages.lock();
        let Some(state) = stages.get_mut(&stage_id) else {
            debug!(
                "Commit denied for stage {stage_id} partition {partition}: stage not running"
            );
            return false;
        };
        let candidate = TaskIdentifier {
            stage_attempt,
            task_attempt,
        };
        match &state.authorized_committers[partition] {
            None => {
                state.authorized_committers[partition] = Some(candidate);
                true
            }
            Some(existing) => *existing == candidate,
        }
    }

    /// Observes a task completion. A failed authorized committer loses its
    /// authorization so another attempt may commit.
    pub fn task_completed(
        &self,
        stage_id: StageId,
        stage_attempt: usize,
        partition: usize,
        task_attempt: usize,
        reason: &TaskEndReason,
    ) {
        match reason {
            TaskEndReason::Success => {}
            TaskEndReason::TaskCommitDenied { .. } => {
                info!(
                    "Task was denied committing, stage {stage_id}.{stage_attempt}, \
                partition {partition}, attempt {task_attempt}"
                );
            }
            _ => {
                let mut stages = self.stages.lock();
                if let Some(state) = stages.get_mut(&stage_id) {
                    if partition < state.authorized_committers.len()
                        && state.authorized_committers[partition]
                            == Some(TaskIdentifier {
                                stage_attempt,
                                task_attempt,
                            })
                    {
                        debug!(
                            "Authorized committer (stage {stage_id}.{stage_attempt}, \
                        partition {partition}, attempt {task_attempt}) failed"
                        );
                        state.authorized_committers[partition] = None;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_asker_wins() {
        let coordinator = OutputCommitCoordinator::new();
        coordinator.stage_start(StageId(1), 3);
        assert!(coordinator.can_commit(StageId(1), 0, 2, 0));
        assert!(!coordinator.can_commit(StageId(1), 0, 2, 1));
        // The winner may ask again.
        assert!(coordinator.can_commit(StageId(1), 0, 2, 0));
    }

    #[test]
    fn failed_committer_releases_authorization() {
        let coordinator = OutputCommitCoordinator::new();
        coordinator.stage_start(StageId(1), 0);
        assert!(coordinator.can_commit(StageId(1), 0, 0, 0));
        coordinator.task_completed(
            StageId(1),
            0,
            0,
            0,
            &TaskEndReason::ExceptionFailure {
                description: "oom".into(),
            },
        );
        assert!(coordinator.can_commit(StageId(1), 0, 0, 1));
    }

    #[test]
    fn finished_stage_denies_commits() {
        let coordinator = OutputCommitCoordinator::new();
        coordinator.stage_start(StageId(1), 0);
        coordinator.stage_end(StageId(1));
        assert!(!coordinator.can_commit(StageId(1), 0, 0, 0));
    }
}
