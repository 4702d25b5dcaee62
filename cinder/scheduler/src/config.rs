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
//

//! Cinder DAG scheduler specific configuration

use std::time::Duration;

/// Job property key carrying the job group a job belongs to. Jobs sharing a
/// group can be cancelled together.
pub const JOB_GROUP_ID_KEY: &str = "cinder.job.group.id";

/// Job property key requesting that task threads be interrupted when the
/// job is cancelled.
pub const JOB_INTERRUPT_ON_CANCEL_KEY: &str = "cinder.job.interrupt.on.cancel";

/// Configuration for the DAG scheduler of scheduling jobs and stages.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of consecutive attempts of a stage before the stage and its
    /// dependent jobs are aborted.
    pub max_consecutive_stage_attempts: usize,
    /// On a fetch failure with an external shuffle service in use, treat all
    /// shuffle outputs on the failed host as lost, not just the failed map
    /// output.
    pub unregister_output_on_host_on_fetch_failure: bool,
    /// Whether shuffle data is served by an external shuffle service that
    /// survives executor loss.
    pub external_shuffle_service_enabled: bool,
    /// Whether executors are acquired and released dynamically. Barrier
    /// stages cannot be scheduled under dynamic allocation.
    pub dynamic_allocation_enabled: bool,
    /// Maximum number of task slots the cluster can run simultaneously, used
    /// for barrier stage admission. Zero means unknown and disables the
    /// check.
    pub max_concurrent_task_slots: usize,
    /// Interval between retries of the barrier admission slot check.
    pub barrier_max_concurrent_tasks_check_interval: Duration,
    /// Number of barrier admission slot check failures tolerated before the
    /// job is failed.
    pub barrier_max_concurrent_tasks_check_max_failures: usize,
    /// Debounce window coalescing a burst of fetch failures into a single
    /// stage resubmission.
    pub resubmit_timeout: Duration,
    /// Disables stage retry so tests observe the first failure directly.
    pub test_no_stage_retry: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_stage_attempts: 4,
            unregister_output_on_host_on_fetch_failure: false,
            external_shuffle_service_enabled: false,
            dynamic_allocation_enabled: false,
            max_concurrent_task_slots: 0,
            barrier_max_concurrent_tasks_check_interval: Duration::from_secs(15),
            barrier_max_concurrent_tasks_check_max_failures: 40,
            resubmit_timeout: Duration::from_millis(200),
            test_no_stage_retry: false,
        }
    }
}

impl SchedulerConfig {
    /// Sets the consecutive stage attempt limit.
    pub fn with_max_consecutive_stage_attempts(mut self, attempts: usize) -> Self {
        self.max_consecutive_stage_attempts = attempts;
        self
    }

    /// Treat fetch failures as host-wide output loss when an external
    /// shuffle service is in use.
    pub fn with_unregister_output_on_host_on_fetch_failure(mut self, enabled: bool) -> Self {
        self.unregister_output_on_host_on_fetch_failure = enabled;
        self
    }

    /// Declares whether an external shuffle service serves shuffle data.
    pub fn with_external_shuffle_service(mut self, enabled: bool) -> Self {
        self.external_shuffle_service_enabled = enabled;
        self
    }

    /// Declares whether executors are dynamically allocated.
    pub fn with_dynamic_allocation(mut self, enabled: bool) -> Self {
        self.dynamic_allocation_enabled = enabled;
        self
    }

    /// Sets the cluster-wide simultaneous task slot bound used for barrier
    /// admission.
    pub fn with_max_concurrent_task_slots(mut self, slots: usize) -> Self {
        self.max_concurrent_task_slots = slots;
        self
    }

    /// Sets the barrier admission retry interval.
    pub fn with_barrier_check_interval(mut self, interval: Duration) -> Self {
        self.barrier_max_concurrent_tasks_check_interval = interval;
        self
    }

    /// Sets the barrier admission retry limit.
    pub fn with_barrier_check_max_failures(mut self, failures: usize) -> Self {
        self.barrier_max_concurrent_tasks_check_max_failures = failures;
        self
    }

    /// Sets the fetch failure resubmission debounce window.
    pub fn with_resubmit_timeout(mut self, timeout: Duration) -> Self {
        self.resubmit_timeout = timeout;
        self
    }

    /// Disables stage retry for deterministic tests.
    pub fn with_no_stage_retry(mut self, disabled: bool) -> Self {
        self.test_no_stage_retry = disabled;
        self
    }
}
