//! Region-aware job scheduler for projection updates and strokes.
//!
//! Jobs whose regions overlap never run at the same time and start in
//! submission order. Jobs of one stroke run strictly one after another.
//! A barrier lock drains running work and holds the queue while a caller
//! restructures the data the jobs read.

mod barrier;
mod config;
mod job;
mod pool;
mod queue;

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use model::{JobId, NodeId, Rect, StrokeId, UpdateFlags};
use parking_lot::{Condvar, Mutex};

pub use barrier::{BarrierLockable, BarrierLocker};
pub use config::{SchedulerConfig, SchedulerConfigError};
pub use job::{
    JobContext, JobError, JobState, JobSummary, ProjectionWalker, SchedulerEvent, SchedulerStatus,
    StrokeJob, StrokeStatus, StrokeStrategy,
};
pub use queue::{SchedulerError, SchedulerStats};

use pool::WorkerMessage;
use queue::SchedulerState;

pub(crate) struct Shared {
    config: SchedulerConfig,
    walker: Arc<dyn ProjectionWalker>,
    state: Mutex<SchedulerState>,
    changed: Condvar,
    dispatch_tx: Sender<WorkerMessage>,
    event_tx: Sender<SchedulerEvent>,
}

impl Shared {
    fn dispatch_locked(&self, state: &mut SchedulerState) {
        for dispatch in state.take_dispatchable() {
            tracing::trace!(job = dispatch.id.0, region = ?dispatch.context.region(), "dispatching job");
            if self.dispatch_tx.send(WorkerMessage::Run(dispatch)).is_err() {
                panic!("update worker pool disconnected");
            }
        }
    }

    pub(crate) fn finish(&self, id: JobId, failed: bool) {
        let mut state = self.state.lock();
        for event in state.finish(id, failed) {
            // The receiver may be gone; events are advisory.
            let _ = self.event_tx.send(event);
        }
        self.dispatch_locked(&mut state);
        drop(state);
        self.changed.notify_all();
    }

    fn enqueue_update(&self, node: NodeId, rect: Rect, flags: UpdateFlags) -> bool {
        if rect.is_empty() {
            return true;
        }
        let config = self.config;
        self.mutate(|state| {
            if state.is_shutting_down() {
                return false;
            }
            state.enqueue_update(node, rect, flags, &config);
            true
        })
    }

    fn mutate<R>(&self, edit: impl FnOnce(&mut SchedulerState) -> R) -> R {
        let mut state = self.state.lock();
        let result = edit(&mut state);
        self.dispatch_locked(&mut state);
        drop(state);
        self.changed.notify_all();
        result
    }
}

pub struct UpdateScheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    events: Receiver<SchedulerEvent>,
}

impl UpdateScheduler {
    pub fn new(
        config: SchedulerConfig,
        walker: Arc<dyn ProjectionWalker>,
    ) -> Result<Self, SchedulerConfigError> {
        config.validate()?;
        let (dispatch_tx, dispatch_rx) = crossbeam_channel::unbounded();
        let (event_tx, events) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            config,
            walker,
            state: Mutex::new(SchedulerState::new(config.worker_threads)),
            changed: Condvar::new(),
            dispatch_tx,
            event_tx,
        });
        let workers = pool::spawn_workers(&shared, &dispatch_rx, config.worker_threads);
        tracing::debug!(
            workers = config.worker_threads,
            patch_size = config.patch_size,
            "update scheduler started"
        );
        Ok(Self {
            shared,
            workers,
            events,
        })
    }

    pub fn config(&self) -> SchedulerConfig {
        self.shared.config
    }

    /// Queues a recomputation of `node`'s projection over `rect`.
    pub fn request_projection_update(&self, node: NodeId, rect: Rect, flags: UpdateFlags) {
        let _ = self.shared.enqueue_update(node, rect, flags);
    }

    /// Handle for queueing updates from inside running jobs.
    pub fn requester(&self) -> UpdateRequester {
        UpdateRequester {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn start_stroke(&self, strategy: Arc<dyn StrokeStrategy>) -> StrokeId {
        let name = strategy.name().to_owned();
        let stroke = self.shared.mutate(|state| state.start_stroke(strategy));
        tracing::debug!(stroke = stroke.0, name = %name, "stroke started");
        stroke
    }

    pub fn add_job(
        &self,
        stroke: StrokeId,
        job: Box<dyn StrokeJob>,
    ) -> Result<JobId, SchedulerError> {
        self.shared.mutate(|state| state.add_job(stroke, job))
    }

    pub fn end_stroke(&self, stroke: StrokeId) -> Result<(), SchedulerError> {
        self.shared.mutate(|state| state.end_stroke(stroke))
    }

    pub fn cancel_stroke(&self, stroke: StrokeId) -> Result<(), SchedulerError> {
        let skipped = self.shared.mutate(|state| state.cancel_stroke(stroke))?;
        tracing::debug!(stroke = stroke.0, skipped, "stroke cancelled");
        Ok(())
    }

    /// Keeps projection updates queued while stroke jobs continue. Nests.
    pub fn block_updates(&self) {
        self.shared.mutate(SchedulerState::block_updates);
    }

    pub fn unblock_updates(&self) {
        self.shared.mutate(SchedulerState::unblock_updates);
    }

    /// Blocks until every queued and running job has completed.
    ///
    /// # Panics
    ///
    /// Panics if the remaining jobs are held by a barrier lock or blocked
    /// updates, since nothing could ever finish them.
    pub fn wait_for_done(&self) {
        let mut state = self.shared.state.lock();
        while !state.is_idle() {
            if !state.has_running() && state.is_suspended() {
                panic!("wait_for_done would block forever: queued jobs are suspended");
            }
            self.shared.changed.wait(&mut state);
        }
    }

    pub fn is_idle(&self) -> bool {
        self.shared.state.lock().is_idle()
    }

    pub fn status(&self) -> SchedulerStatus {
        self.shared.state.lock().status()
    }

    /// Caps how many jobs run at once, between 1 and the pool size.
    pub fn set_thread_limit(&self, limit: usize) {
        let limit = limit.clamp(1, self.workers.len());
        self.shared.mutate(|state| state.set_thread_limit(limit));
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.state.lock().stats()
    }

    pub fn pending_jobs(&self) -> Vec<JobSummary> {
        self.shared.state.lock().pending_jobs()
    }

    /// Completion events in the order jobs finished.
    pub fn events(&self) -> Receiver<SchedulerEvent> {
        self.events.clone()
    }
}

/// Weak handle to a scheduler's queue. Jobs keep one instead of the
/// scheduler itself so that queued strategies never keep it alive.
#[derive(Clone)]
pub struct UpdateRequester {
    shared: Weak<Shared>,
}

impl UpdateRequester {
    /// Returns `false` once the scheduler has shut down.
    pub fn request_projection_update(&self, node: NodeId, rect: Rect, flags: UpdateFlags) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        shared.enqueue_update(node, rect, flags)
    }
}

impl std::fmt::Debug for UpdateRequester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateRequester")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl BarrierLockable for UpdateScheduler {
    /// # Panics
    ///
    /// Panics when the calling context already holds the barrier.
    fn barrier_lock(&self) {
        let mut state = self.shared.state.lock();
        state.acquire_barrier();
        while state.has_running() {
            self.shared.changed.wait(&mut state);
        }
        tracing::trace!("barrier lock acquired");
    }

    fn try_barrier_lock(&self) -> bool {
        self.shared.state.lock().try_acquire_barrier()
    }

    fn unlock(&self) {
        self.shared.mutate(SchedulerState::release_barrier);
        tracing::trace!("barrier lock released");
    }
}

impl Drop for UpdateScheduler {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            let dropped = state.begin_shutdown();
            if dropped > 0 {
                tracing::debug!(dropped, "dropping queued jobs on scheduler shutdown");
            }
            while state.has_running() {
                self.shared.changed.wait(&mut state);
            }
        }
        for _ in &self.workers {
            let _ = self.shared.dispatch_tx.send(WorkerMessage::Stop);
        }
        for worker in self.workers.drain(..) {
            worker.join().expect("join update worker thread");
        }
    }
}

impl std::fmt::Debug for UpdateScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateScheduler")
            .field("workers", &self.workers.len())
            .field("stats", &self.stats())
            .finish()
    }
}
