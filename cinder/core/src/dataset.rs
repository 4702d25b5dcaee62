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

//! The dataset lineage model.
//!
//! Datasets are stored in an arena addressed by [`DatasetId`]; parent edges
//! are id references, so arbitrarily deep graphs carry no owning cycles.
//! The traversals exposed here are pure functions over the arena and use
//! explicit work lists rather than call-stack recursion.

use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::metadata::TaskLocation;

/// Identifier of a dataset in the lineage arena.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DatasetId(pub usize);

impl Display for DatasetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique identifier of a shuffle boundary.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ShuffleId(pub usize);

impl Display for ShuffleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether recomputing a dataset partition yields the same output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeterminismLevel {
    /// Recomputation yields identical output in identical order.
    Determinate,
    /// Recomputation yields the same multiset, possibly reordered.
    Unordered,
    /// Recomputation may yield different data entirely.
    Indeterminate,
}

/// Where materialized partitions of a dataset are kept, if anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageLevel {
    /// Not persisted; recomputed from lineage on demand.
    None,
    /// Cached in executor memory.
    Memory,
    /// Spilled to executor-local disk.
    Disk,
    /// Cached in memory with disk overflow.
    MemoryAndDisk,
}

impl StorageLevel {
    /// Returns true if partitions of this dataset may be found in block
    /// manager storage.
    pub fn is_persisted(&self) -> bool {
        !matches!(self, StorageLevel::None)
    }
}

/// How records are routed to output partitions across a shuffle boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Partitioner {
    /// Hash of the record key modulo the partition count.
    Hash {
        /// Number of output partitions.
        partitions: usize,
    },
    /// Ordered key ranges, one per output partition.
    Range {
        /// Number of output partitions.
        partitions: usize,
    },
}

impl Partitioner {
    /// Number of output partitions this partitioner produces.
    pub fn num_partitions(&self) -> usize {
        match self {
            Partitioner::Hash { partitions } => *partitions,
            Partitioner::Range { partitions } => *partitions,
        }
    }
}

/// Shape of a narrow dependency: which parent partitions feed a child
/// partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NarrowKind {
    /// Child partition `i` reads parent partition `i`.
    OneToOne,
    /// A contiguous range of parent partitions maps onto a contiguous range
    /// of child partitions (as produced by unions).
    Range {
        /// First parent partition of the range.
        in_start: usize,
        /// First child partition of the range.
        out_start: usize,
        /// Number of partitions in the range.
        length: usize,
    },
}

impl NarrowKind {
    /// Parent partitions read by the given child partition.
    pub fn parents(&self, partition: usize) -> Vec<usize> {
        match self {
            NarrowKind::OneToOne => vec![partition],
            NarrowKind::Range {
                in_start,
                out_start,
                length,
            } => {
                if partition >= *out_start && partition < out_start + length {
                    vec![partition - out_start + in_start]
                } else {
                    vec![]
                }
            }
        }
    }
}

/// An all-to-all repartition of a parent dataset. Induces a stage boundary
/// and materialized map outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleDependency {
    /// Process-unique shuffle identifier.
    pub shuffle_id: ShuffleId,
    /// The dataset whose partitions are shuffled.
    pub parent: DatasetId,
    /// Routing of records to output partitions.
    pub partitioner: Partitioner,
}

impl ShuffleDependency {
    /// Number of reduce-side partitions.
    pub fn num_output_partitions(&self) -> usize {
        self.partitioner.num_partitions()
    }
}

/// A typed parent edge of a dataset.
#[derive(Debug, Clone)]
pub enum Dependency {
    /// A child partition reads a bounded number of parent partitions.
    Narrow {
        /// The parent dataset.
        parent: DatasetId,
        /// Partition mapping shape.
        kind: NarrowKind,
    },
    /// An all-to-all repartition across a stage boundary.
    Shuffle(ShuffleDependency),
}

impl Dependency {
    /// The parent dataset of this edge.
    pub fn parent(&self) -> DatasetId {
        match self {
            Dependency::Narrow { parent, .. } => *parent,
            Dependency::Shuffle(dep) => dep.parent,
        }
    }
}

/// Callback computing placement preferences for a partition.
pub type PreferredLocationsFn = dyn Fn(usize) -> Vec<TaskLocation> + Send + Sync;

/// A node in the dataset lineage arena.
pub struct Dataset {
    /// Arena identifier.
    pub id: DatasetId,
    /// Human-readable operator name, used in logs.
    pub name: String,
    /// Number of partitions.
    pub num_partitions: usize,
    /// Typed parent edges.
    pub dependencies: Vec<Dependency>,
    /// Persistence level, if any.
    pub storage_level: StorageLevel,
    /// Whether tasks computing this dataset must be gang-scheduled.
    pub barrier: bool,
    /// Whether recomputation reproduces the same output.
    pub determinism: DeterminismLevel,
    preferred: Option<Arc<PreferredLocationsFn>>,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("num_partitions", &self.num_partitions)
            .field("dependencies", &self.dependencies)
            .field("storage_level", &self.storage_level)
            .field("barrier", &self.barrier)
            .field("determinism", &self.determinism)
            .finish()
    }
}

/// Description of a dataset to be registered in a [`DatasetGraph`].
pub struct DatasetSpec {
    name: String,
    num_partitions: usize,
    dependencies: Vec<Dependency>,
    storage_level: StorageLevel,
    barrier: bool,
    determinism: DeterminismLevel,
    preferred: Option<Arc<PreferredLocationsFn>>,
}

impl DatasetSpec {
    /// A dataset with no parents.
    pub fn new(name: impl Into<String>, num_partitions: usize) -> Self {
        Self {
            name: name.into(),
            num_partitions,
            dependencies: vec![],
            storage_level: StorageLevel::None,
            barrier: false,
            determinism: DeterminismLevel::Determinate,
            preferred: None,
        }
    }

    /// Adds a one-to-one narrow parent.
    pub fn with_narrow_parent(self, parent: DatasetId) -> Self {
        self.with_narrow(parent, NarrowKind::OneToOne)
    }

    /// Adds a narrow parent with the given partition mapping.
    pub fn with_narrow(mut self, parent: DatasetId, kind: NarrowKind) -> Self {
        self.dependencies.push(Dependency::Narrow { parent, kind });
        self
    }

    /// Adds a shuffle parent.
    pub fn with_shuffle(mut self, dependency: ShuffleDependency) -> Self {
        self.dependencies.push(Dependency::Shuffle(dependency));
        self
    }

    /// Sets the persistence level.
    pub fn with_storage_level(mut self, level: StorageLevel) -> Self {
        self.storage_level = level;
        self
    }

    /// Marks tasks of this dataset as requiring gang scheduling.
    pub fn with_barrier(mut self, barrier: bool) -> Self {
        self.barrier = barrier;
        self
    }

    /// Declares the determinism of recomputation.
    pub fn with_determinism(mut self, determinism: DeterminismLevel) -> Self {
        self.determinism = determinism;
        self
    }

    /// Supplies a per-partition placement preference callback.
    pub fn with_preferred_locations<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) -> Vec<TaskLocation> + Send + Sync + 'static,
    {
        self.preferred = Some(Arc::new(f));
        self
    }
}

/// Arena of datasets plus the lineage traversals the scheduler needs.
///
/// The arena is append-only: datasets are registered as user programs build
/// lineage and are never removed. All traversal helpers take and release the
/// arena lock internally, so they may be called from any thread.
pub struct DatasetGraph {
    datasets: RwLock<Vec<Dataset>>,
    next_shuffle_id: AtomicUsize,
    // Serializes task closure encoding against dataset checkpointing, which
    // rewrites dependencies of checkpointed datasets.
    checkpoint_lock: Mutex<()>,
}

impl Default for DatasetGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DatasetGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self {
            datasets: RwLock::new(vec![]),
            next_shuffle_id: AtomicUsize::new(0),
            checkpoint_lock: Mutex::new(()),
        }
    }

    /// Registers a dataset and returns its id.
    pub fn register(&self, spec: DatasetSpec) -> DatasetId {
        let mut datasets = self.datasets.write();
        let id = DatasetId(datasets.len());
        datasets.push(Dataset {
            id,
            name: spec.name,
            num_partitions: spec.num_partitions,
            dependencies: spec.dependencies,
            storage_level: spec.storage_level,
            barrier: spec.barrier,
            determinism: spec.determinism,
            preferred: spec.preferred,
        });
        id
    }

    /// Allocates a shuffle dependency over `parent` with a fresh shuffle id.
    pub fn shuffle_dependency(
        &self,
        parent: DatasetId,
        partitioner: Partitioner,
    ) -> ShuffleDependency {
        ShuffleDependency {
            shuffle_id: ShuffleId(self.next_shuffle_id.fetch_add(1, Ordering::SeqCst)),
            parent,
            partitioner,
        }
    }

    /// The lock serializing closure encoding against checkpointing.
    pub fn checkpoint_lock(&self) -> &Mutex<()> {
        &self.checkpoint_lock
    }

    /// Number of partitions of a dataset.
    pub fn num_partitions(&self, ds: DatasetId) -> usize {
        self.datasets.read()[ds.0].num_partitions
    }

    /// Operator name of a dataset.
    pub fn name(&self, ds: DatasetId) -> String {
        self.datasets.read()[ds.0].name.clone()
    }

    /// Parent edges of a dataset.
    pub fn dependencies(&self, ds: DatasetId) -> Vec<Dependency> {
        self.datasets.read()[ds.0].dependencies.clone()
    }

    /// Persistence level of a dataset.
    pub fn storage_level(&self, ds: DatasetId) -> StorageLevel {
        self.datasets.read()[ds.0].storage_level
    }

    /// Determinism of recomputing a dataset.
    pub fn determinism(&self, ds: DatasetId) -> DeterminismLevel {
        self.datasets.read()[ds.0].determinism
    }

    /// Placement preferences declared by the dataset itself, if any.
    pub fn preferred_locations(&self, ds: DatasetId, partition: usize) -> Vec<TaskLocation> {
        let callback = self.datasets.read()[ds.0].preferred.clone();
        match callback {
            Some(f) => f(partition),
            None => vec![],
        }
    }

    /// Shuffle dependencies crossed when walking narrow edges from `ds`.
    /// Descent stops at each shuffle edge: these are the immediate parents
    /// of the stage whose leaf dataset is `ds`.
    pub fn immediate_shuffle_dependencies(&self, ds: DatasetId) -> Vec<ShuffleDependency> {
        let datasets = self.datasets.read();
        let mut found = vec![];
        let mut visited = HashSet::new();
        let mut work = vec![ds];
        while let Some(id) = work.pop() {
            if !visited.insert(id) {
                continue;
            }
            for dep in &datasets[id.0].dependencies {
                match dep {
                    Dependency::Narrow { parent, .. } => work.push(*parent),
                    Dependency::Shuffle(shuffle) => found.push(shuffle.clone()),
                }
            }
        }
        found
    }

    /// All shuffle dependencies transitively reachable from `ds` for which
    /// `registered` is false, ordered deepest first so that ancestors can be
    /// materialized before their children.
    pub fn missing_ancestor_shuffles(
        &self,
        ds: DatasetId,
        registered: &dyn Fn(ShuffleId) -> bool,
    ) -> Vec<ShuffleDependency> {
        let datasets = self.datasets.read();
        let mut missing = vec![];
        let mut visited = HashSet::new();
        let mut work = vec![ds];
        while let Some(id) = work.pop() {
            if !visited.insert(id) {
                continue;
            }
            for dep in &datasets[id.0].dependencies {
                match dep {
                    Dependency::Narrow { parent, .. } => work.push(*parent),
                    Dependency::Shuffle(shuffle) => {
                        if !registered(shuffle.shuffle_id) {
                            missing.push(shuffle.clone());
                        }
                        work.push(shuffle.parent);
                    }
                }
            }
        }
        // Discovery order walks from the leaf toward sources, so reversing
        // puts the deepest ancestors first.
        missing.reverse();
        missing
    }

    /// Returns true iff `predicate` holds for every dataset reachable from
    /// `ds` via narrow edges, including `ds` itself. Short-circuits on the
    /// first violation.
    pub fn within_stage_all(
        &self,
        ds: DatasetId,
        predicate: &dyn Fn(&Dataset) -> bool,
    ) -> bool {
        let datasets = self.datasets.read();
        let mut visited = HashSet::new();
        let mut work = vec![ds];
        while let Some(id) = work.pop() {
            if !visited.insert(id) {
                continue;
            }
            let dataset = &datasets[id.0];
            if !predicate(dataset) {
                return false;
            }
            for dep in &dataset.dependencies {
                if let Dependency::Narrow { parent, .. } = dep {
                    work.push(*parent);
                }
            }
        }
        true
    }

    /// Returns true if the stage rooted at `ds` contains a barrier dataset.
    pub fn stage_contains_barrier(&self, ds: DatasetId) -> bool {
        !self.within_stage_all(ds, &|dataset| !dataset.barrier)
    }

    /// Number of shuffle parents of `ds` whose producing subgraph contains a
    /// barrier dataset.
    pub fn barrier_shuffle_parent_count(&self, ds: DatasetId) -> usize {
        let shuffle_parents: Vec<DatasetId> = self.datasets.read()[ds.0]
            .dependencies
            .iter()
            .filter_map(|dep| match dep {
                Dependency::Shuffle(shuffle) => Some(shuffle.parent),
                _ => None,
            })
            .collect();
        shuffle_parents
            .into_iter()
            .filter(|parent| self.stage_contains_barrier(*parent))
            .count()
    }

    /// Whether the stage rooted at `ds` has a lineage shape a barrier stage
    /// can be gang-scheduled over: every narrow ancestor has
    /// `expected_partitions` partitions and fewer than two barrier shuffle
    /// parents.
    pub fn barrier_stage_pattern_supported(
        &self,
        ds: DatasetId,
        expected_partitions: usize,
    ) -> bool {
        let datasets = self.datasets.read();

        fn subtree_has_barrier(datasets: &[Dataset], root: DatasetId) -> bool {
            let mut visited = HashSet::new();
            let mut work = vec![root];
            while let Some(id) = work.pop() {
                if !visited.insert(id) {
                    continue;
                }
                let dataset = &datasets[id.0];
                if dataset.barrier {
                    return true;
                }
                for dep in &dataset.dependencies {
                    if let Dependency::Narrow { parent, .. } = dep {
                        work.push(*parent);
                    }
                }
            }
            false
        }

        let mut visited = HashSet::new();
        let mut work = vec![ds];
        while let Some(id) = work.pop() {
            if !visited.insert(id) {
                continue;
            }
            let dataset = &datasets[id.0];
            if dataset.num_partitions != expected_partitions {
                return false;
            }
            let barrier_shuffle_parents = dataset
                .dependencies
                .iter()
                .filter(|dep| match dep {
                    Dependency::Shuffle(shuffle) => {
                        subtree_has_barrier(&datasets, shuffle.parent)
                    }
                    _ => false,
                })
                .count();
            if barrier_shuffle_parents >= 2 {
                return false;
            }
            for dep in &dataset.dependencies {
                if let Dependency::Narrow { parent, .. } = dep {
                    work.push(*parent);
                }
            }
        }
        true
    }
}
