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

//! Cluster metadata records shared between the scheduler and its
//! collaborators.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::dataset::DatasetId;

/// A placement hint pairing a task with a host or executor that already
/// holds its input data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskLocation {
    /// The input is expected to be reachable from this host.
    Host(String),
    /// The input is cached by a specific executor process.
    ExecutorCache {
        /// Host the executor runs on.
        host: String,
        /// Executor identifier.
        executor_id: String,
    },
}

impl TaskLocation {
    /// The host component of this location.
    pub fn host(&self) -> &str {
        match self {
            TaskLocation::Host(host) => host,
            TaskLocation::ExecutorCache { host, .. } => host,
        }
    }
}

impl Display for TaskLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskLocation::Host(host) => write!(f, "{host}"),
            TaskLocation::ExecutorCache { host, executor_id } => {
                write!(f, "executor_{host}_{executor_id}")
            }
        }
    }
}

/// Identity of a block manager instance: one per executor process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockManagerId {
    /// Executor the block manager belongs to.
    pub executor_id: String,
    /// Host the executor runs on.
    pub host: String,
    /// Port of the block transfer service.
    pub port: u16,
}

impl BlockManagerId {
    /// Creates a block manager id.
    pub fn new(
        executor_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            executor_id: executor_id.into(),
            host: host.into(),
            port,
        }
    }
}

impl Display for BlockManagerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockManagerId({}, {}:{})", self.executor_id, self.host, self.port)
    }
}

impl From<&BlockManagerId> for TaskLocation {
    fn from(id: &BlockManagerId) -> Self {
        TaskLocation::ExecutorCache {
            host: id.host.clone(),
            executor_id: id.executor_id.clone(),
        }
    }
}

/// Metadata describing an executor registered with the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorMetadata {
    /// Executor identifier.
    pub id: String,
    /// Host the executor runs on.
    pub host: String,
    /// Port of the executor service.
    pub port: u16,
}

/// Identifies a cached partition of a dataset in block manager storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetBlockId {
    /// The dataset the block belongs to.
    pub dataset: DatasetId,
    /// The partition index within the dataset.
    pub partition: usize,
}

impl Display for DatasetBlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "dataset_{}_{}", self.dataset, self.partition)
    }
}
