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

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Block manager master interface, the source of cached partition locations.
pub mod block_manager;
/// Lazily populated cache of partition locations.
pub mod cache_index;
/// Output commit arbitration.
pub mod commit_coordinator;
/// Scheduler configuration options.
pub mod config;
/// The DAG scheduler control plane.
pub mod dag_scheduler;
/// Per-executor failure epochs.
pub mod epoch;
/// Scheduler events.
pub mod event;
/// Active jobs, listeners and waiters.
pub mod job;
/// Lifecycle telemetry bus.
pub mod listener_bus;
/// Registry of materialized shuffle map outputs.
pub mod map_output_tracker;
/// The canonical stage set.
pub mod registry;
/// Stage records.
pub mod stage;
/// Task records exchanged with the task scheduler.
pub mod task;
/// Interface to the lower-level task scheduler.
pub mod task_scheduler;

#[cfg(test)]
pub(crate) mod test_utils;

pub use dag_scheduler::DagScheduler;
