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

//! Active jobs and the listeners through which they observe completion.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fixedbitset::FixedBitSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};

use cinder_core::error::{CinderError, Result};
use cinder_core::event_loop::EventSender;

use crate::event::DagEvent;
use crate::stage::StageId;
use crate::task::TaskValue;

/// Process-unique, monotonically increasing job identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct JobId(pub usize);

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Interface for listening to job outcome notifications. Each output index
/// is reported at most once; termination is reported exactly once.
pub trait JobListener: Send + Sync {
    /// Called when the task computing output `index` succeeds. An error
    /// return fails the job.
    fn task_succeeded(&self, index: usize, result: &TaskValue) -> Result<()>;

    /// Called when the job fails or is cancelled.
    fn job_failed(&self, error: &CinderError);
}

/// A job that has been submitted and not yet terminated.
pub struct ActiveJob {
    /// Job identifier.
    pub job_id: JobId,
    /// The terminal stage computing this job's output.
    pub final_stage: StageId,
    /// Call site of the action that submitted the job.
    pub call_site: String,
    /// Receives per-output results and the termination notification.
    pub listener: Arc<dyn JobListener>,
    /// Job properties, such as the job group.
    pub properties: HashMap<String, String>,
    /// Number of output partitions the job waits for.
    pub num_partitions: usize,
    /// Which output indices have been delivered.
    pub finished: FixedBitSet,
    /// Count of delivered output indices.
    pub num_finished: usize,
}

impl ActiveJob {
    /// Creates an active job waiting for `num_partitions` outputs.
    pub fn new(
        job_id: JobId,
        final_stage: StageId,
        call_site: String,
        listener: Arc<dyn JobListener>,
        properties: HashMap<String, String>,
        num_partitions: usize,
    ) -> Self {
        Self {
            job_id,
            final_stage,
            call_site,
            listener,
            properties,
            num_partitions,
            finished: FixedBitSet::with_capacity(num_partitions),
            num_finished: 0,
        }
    }
}

pub(crate) type CompletionSignal = std::result::Result<(), String>;

/// The [`JobListener`] backing a [`JobWaiter`]: forwards each output to the
/// caller-supplied handler and resolves the completion channel once.
pub(crate) struct JobWaiterListener {
    job_id: JobId,
    total_tasks: usize,
    finished: AtomicUsize,
    handler: Box<dyn Fn(usize, &TaskValue) + Send + Sync>,
    completion: Mutex<Option<oneshot::Sender<CompletionSignal>>>,
}

impl JobWaiterListener {
    fn resolve(&self, signal: CompletionSignal) {
        if let Some(tx) = self.completion.lock().take() {
            // The waiter may have been dropped; nothing to do then.
            let _ = tx.send(signal);
        }
    }
}

impl JobListener for JobWaiterListener {
    fn task_succeeded(&self, index: usize, result: &TaskValue) -> Result<()> {
        (self.handler)(index, result);
        let finished = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
        if finished == self.total_tasks {
            self.resolve(Ok(()));
        }
        Ok(())
    }

    fn job_failed(&self, error: &CinderError) {
        self.resolve(Err(error.to_string()));
    }
}

/// Handle returned from job submission: exposes the completion future and
/// cancellation.
pub struct JobWaiter {
    job_id: JobId,
    rx: oneshot::Receiver<CompletionSignal>,
    events: EventSender<DagEvent>,
}

impl JobWaiter {
    /// Creates the waiter and its scheduler-side listener. When
    /// `total_tasks` is zero the waiter resolves immediately.
    pub(crate) fn new(
        job_id: JobId,
        total_tasks: usize,
        handler: Box<dyn Fn(usize, &TaskValue) + Send + Sync>,
        events: EventSender<DagEvent>,
    ) -> (Arc<JobWaiterListener>, JobWaiter) {
        let (tx, rx) = oneshot::channel();
        let listener = Arc::new(JobWaiterListener {
            job_id,
            total_tasks,
            finished: AtomicUsize::new(0),
            handler,
            completion: Mutex::new(Some(tx)),
        });
        if total_tasks == 0 {
            listener.resolve(Ok(()));
        }
        (listener.clone(), JobWaiter { job_id, rx, events })
    }

    /// The submitted job's id.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Requests cancellation of the job. Returns once the cancellation
    /// event is posted; the job fails asynchronously.
    pub fn cancel(&self) -> Result<()> {
        self.events.post_event(DagEvent::JobCancelled {
            job_id: self.job_id,
            reason: None,
        })
    }

    /// Waits for the job to terminate.
    pub async fn completion(self) -> Result<()> {
        match self.rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(CinderError::General(message)),
            Err(_) => Err(CinderError::General(format!(
                "Scheduler dropped job {} before completion",
                self.job_id
            ))),
        }
    }
}

/// Merges per-output results into an approximation that can be returned
/// before every task has finished.
pub trait ApproximateEvaluator: Send + 'static {
    /// The approximation produced.
    type Output: Send;

    /// Folds the output of one task into the approximation.
    fn merge(&mut self, output_id: usize, value: &TaskValue);

    /// The current approximation over the outputs merged so far.
    fn current_result(&self) -> Self::Output;
}

/// Result of an approximate job: the evaluator's answer plus whether every
/// task contributed to it.
#[derive(Debug, Clone)]
pub struct PartialResult<R> {
    /// The (possibly partial) answer.
    pub value: R,
    /// True when every output was merged before the deadline.
    pub is_final: bool,
}

/// Job listener wiring an [`ApproximateEvaluator`] to task completions.
pub(crate) struct ApproximateActionListener<E: ApproximateEvaluator> {
    evaluator: Mutex<E>,
    total_tasks: usize,
    finished: AtomicUsize,
    done: watch::Sender<Option<CompletionSignal>>,
}

impl<E: ApproximateEvaluator> ApproximateActionListener<E> {
    pub(crate) fn new(
        evaluator: E,
        total_tasks: usize,
    ) -> (Arc<Self>, watch::Receiver<Option<CompletionSignal>>) {
        let (tx, rx) = watch::channel(None);
        let listener = Arc::new(Self {
            evaluator: Mutex::new(evaluator),
            total_tasks,
            finished: AtomicUsize::new(0),
            done: tx,
        });
        if total_tasks == 0 {
            let _ = listener.done.send(Some(Ok(())));
        }
        (listener, rx)
    }

    /// The evaluator's current answer.
    pub(crate) fn current_result(&self) -> E::Output {
        self.evaluator.lock().current_result()
    }
}

impl<E: ApproximateEvaluator> JobListener for ApproximateActionListener<E> {
    fn task_succeeded(&self, index: usize, result: &TaskValue) -> Result<()> {
        self.evaluator.lock().merge(index, result);
        let finished = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
        if finished == self.total_tasks {
            let _ = self.done.send(Some(Ok(())));
        }
        Ok(())
    }

    fn job_failed(&self, error: &CinderError) {
        let _ = self.done.send(Some(Err(error.to_string())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn sender() -> EventSender<DagEvent> {
        let (tx, _rx) = mpsc::unbounded_channel();
        EventSender::new(tx)
    }

    #[tokio::test]
    async fn waiter_resolves_when_all_outputs_arrive() -> Result<()> {
        let delivered = Arc::new(Mutex::new(vec![]));
        let seen = delivered.clone();
        let (listener, waiter) = JobWaiter::new(
            JobId(1),
            2,
            Box::new(move |index, _| seen.lock().push(index)),
            sender(),
        );
        listener.task_succeeded(0, &TaskValue::Bytes(vec![]))?;
        listener.task_succeeded(1, &TaskValue::Bytes(vec![]))?;
        waiter.completion().await?;
        assert_eq!(*delivered.lock(), vec![0, 1]);
        Ok(())
    }

    #[tokio::test]
    async fn waiter_surfaces_job_failure() {
        let (listener, waiter) =
            JobWaiter::new(JobId(2), 1, Box::new(|_, _| {}), sender());
        listener.job_failed(&CinderError::General("stage aborted".into()));
        let err = waiter.completion().await.unwrap_err();
        assert!(err.to_string().contains("stage aborted"));
    }

    #[tokio::test]
    async fn empty_job_is_immediately_done() -> Result<()> {
        let (_listener, waiter) =
            JobWaiter::new(JobId(3), 0, Box::new(|_, _| {}), sender());
        waiter.completion().await
    }
}
