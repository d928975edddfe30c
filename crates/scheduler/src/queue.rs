use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use model::{JobId, NodeId, Rect, StrokeId, UpdateFlags};
use smallvec::SmallVec;

use crate::config::SchedulerConfig;
use crate::job::{
    JobContext, JobState, JobSummary, SchedulerEvent, SchedulerStatus, StrokeJob, StrokeStatus,
    StrokeStrategy, regions_overlap,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("unknown stroke {0:?}")]
    UnknownStroke(StrokeId),
    #[error("stroke {0:?} no longer accepts jobs")]
    StrokeEnded(StrokeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerStats {
    pub queued: usize,
    pub running: usize,
    pub active_strokes: usize,
    pub thread_limit: usize,
    pub completed: u64,
    pub failed: u64,
    /// Jobs of cancelled strokes dropped before they started.
    pub skipped: u64,
    /// Update patches folded into an already queued update.
    pub merged: u64,
}

pub(crate) enum Work {
    Update {
        node: NodeId,
        rect: Rect,
        flags: UpdateFlags,
    },
    Begin(Arc<dyn StrokeStrategy>),
    Step(Box<dyn StrokeJob>),
    End(Arc<dyn StrokeStrategy>),
    Cancel(Arc<dyn StrokeStrategy>),
}

pub(crate) struct Dispatch {
    pub(crate) id: JobId,
    pub(crate) work: Work,
    pub(crate) context: JobContext,
}

struct QueuedJob {
    id: JobId,
    stroke: Option<StrokeId>,
    region: Option<Rect>,
    exclusive: bool,
    cancelled: Arc<AtomicBool>,
    work: Work,
}

impl QueuedJob {
    /// Exclusive jobs conflict with everything.
    fn conflict_region(&self) -> Option<Rect> {
        if self.exclusive { None } else { self.region }
    }

    fn is_update(&self) -> bool {
        matches!(self.work, Work::Update { .. })
    }
}

enum Completion {
    Update { node: NodeId, rect: Rect },
    StrokeStep(StrokeId),
    StrokeEnd(StrokeId),
    StrokeCancel(StrokeId),
}

struct RunningJob {
    region: Option<Rect>,
    exclusive: bool,
    stroke: Option<StrokeId>,
    completion: Completion,
}

struct StrokeRecord {
    strategy: Arc<dyn StrokeStrategy>,
    ended: bool,
    cancelled: bool,
    step_running: bool,
    cancel_flag: Arc<AtomicBool>,
}

/// Queue, running set and stroke bookkeeping. Only touched under the
/// scheduler's mutex.
pub(crate) struct SchedulerState {
    queue: VecDeque<QueuedJob>,
    running: HashMap<JobId, RunningJob>,
    strokes: HashMap<StrokeId, StrokeRecord>,
    next_job_id: u64,
    next_stroke_id: u64,
    thread_limit: usize,
    barrier_held: bool,
    updates_blocked: usize,
    shutting_down: bool,
    stats: SchedulerStats,
}

impl SchedulerState {
    pub(crate) fn new(thread_limit: usize) -> Self {
        assert!(thread_limit > 0, "scheduler thread limit must be at least 1");
        Self {
            queue: VecDeque::new(),
            running: HashMap::new(),
            strokes: HashMap::new(),
            next_job_id: 1,
            next_stroke_id: 1,
            thread_limit,
            barrier_held: false,
            updates_blocked: 0,
            shutting_down: false,
            stats: SchedulerStats::default(),
        }
    }

    /// Splits `rect` into patches and queues each one unless it folds into
    /// an update already waiting in the queue.
    pub(crate) fn enqueue_update(
        &mut self,
        node: NodeId,
        rect: Rect,
        flags: UpdateFlags,
        config: &SchedulerConfig,
    ) {
        for patch in rect.split_into_patches(config.patch_size) {
            let job = self.new_job(
                None,
                Some(patch),
                false,
                Arc::new(AtomicBool::new(false)),
                Work::Update {
                    node,
                    rect: patch,
                    flags,
                },
            );
            if config.merge_updates && self.merge_update(node, patch, flags, config.max_merged_area())
            {
                self.stats.merged += 1;
                continue;
            }
            self.queue.push_back(job);
        }
    }

    /// Folds `rect` into the newest compatible queued update, unless a queued
    /// job between them overlaps `rect`.
    fn merge_update(&mut self, node: NodeId, rect: Rect, flags: UpdateFlags, max_area: i64) -> bool {
        for job in self.queue.iter_mut().rev() {
            if let Work::Update {
                node: queued_node,
                rect: queued_rect,
                flags: queued_flags,
            } = &mut job.work
            {
                let compatible = *queued_node == node && *queued_flags == flags;
                let touching = queued_rect.contains_rect(&rect)
                    || rect.contains_rect(queued_rect)
                    || queued_rect.is_adjacent_to(&rect);
                let union = queued_rect.united(&rect);
                if compatible && touching && union.area() <= max_area {
                    *queued_rect = union;
                    job.region = Some(union);
                    return true;
                }
            }
            if regions_overlap(job.conflict_region(), Some(rect)) {
                return false;
            }
        }
        false
    }

    pub(crate) fn start_stroke(&mut self, strategy: Arc<dyn StrokeStrategy>) -> StrokeId {
        let stroke = StrokeId(self.next_stroke_id);
        self.next_stroke_id = self
            .next_stroke_id
            .checked_add(1)
            .expect("stroke id overflow");
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let exclusive = strategy.is_exclusive();
        let region = strategy.region();
        self.strokes.insert(
            stroke,
            StrokeRecord {
                strategy: strategy.clone(),
                ended: false,
                cancelled: false,
                step_running: false,
                cancel_flag: cancel_flag.clone(),
            },
        );
        let job = self.new_job(
            Some(stroke),
            region,
            exclusive,
            cancel_flag,
            Work::Begin(strategy),
        );
        self.queue.push_back(job);
        stroke
    }

    pub(crate) fn add_job(
        &mut self,
        stroke: StrokeId,
        job: Box<dyn StrokeJob>,
    ) -> Result<JobId, SchedulerError> {
        let record = self.open_stroke(stroke)?;
        let exclusive = record.strategy.is_exclusive();
        let cancel_flag = record.cancel_flag.clone();
        let region = job.region();
        let job = self.new_job(Some(stroke), region, exclusive, cancel_flag, Work::Step(job));
        let id = job.id;
        self.queue.push_back(job);
        Ok(id)
    }

    pub(crate) fn end_stroke(&mut self, stroke: StrokeId) -> Result<(), SchedulerError> {
        let record = self.open_stroke(stroke)?;
        record.ended = true;
        let strategy = record.strategy.clone();
        let cancel_flag = record.cancel_flag.clone();
        let job = self.new_job(
            Some(stroke),
            strategy.region(),
            strategy.is_exclusive(),
            cancel_flag,
            Work::End(strategy),
        );
        self.queue.push_back(job);
        Ok(())
    }

    /// Drops the stroke's queued jobs, flags its running job and queues the
    /// strategy's rollback. Returns the number of jobs skipped.
    pub(crate) fn cancel_stroke(&mut self, stroke: StrokeId) -> Result<usize, SchedulerError> {
        let record = self
            .strokes
            .get_mut(&stroke)
            .ok_or(SchedulerError::UnknownStroke(stroke))?;
        if record.cancelled {
            return Ok(0);
        }
        record.cancelled = true;
        record.ended = true;
        record.cancel_flag.store(true, Ordering::Release);
        let strategy = record.strategy.clone();

        let before = self.queue.len();
        self.queue.retain(|job| job.stroke != Some(stroke));
        let skipped = before - self.queue.len();
        self.stats.skipped += skipped as u64;

        let job = self.new_job(
            Some(stroke),
            strategy.region(),
            strategy.is_exclusive(),
            Arc::new(AtomicBool::new(false)),
            Work::Cancel(strategy),
        );
        self.queue.push_back(job);
        Ok(skipped)
    }

    fn open_stroke(&mut self, stroke: StrokeId) -> Result<&mut StrokeRecord, SchedulerError> {
        let record = self
            .strokes
            .get_mut(&stroke)
            .ok_or(SchedulerError::UnknownStroke(stroke))?;
        if record.ended {
            return Err(SchedulerError::StrokeEnded(stroke));
        }
        Ok(record)
    }

    fn new_job(
        &mut self,
        stroke: Option<StrokeId>,
        region: Option<Rect>,
        exclusive: bool,
        cancelled: Arc<AtomicBool>,
        work: Work,
    ) -> QueuedJob {
        let id = JobId(self.next_job_id);
        self.next_job_id = self.next_job_id.checked_add(1).expect("job id overflow");
        QueuedJob {
            id,
            stroke,
            region,
            exclusive,
            cancelled,
            work,
        }
    }

    /// Moves every job that may start now from the queue to the running set.
    ///
    /// Scans in FIFO order. A job starts when it is the oldest queued job of
    /// its stroke and that stroke has nothing running, its region overlaps no
    /// running job and no older queued job, an exclusive job finds nothing
    /// running, and a worker is free. Blocked updates are passed over and
    /// never count as older queued jobs.
    pub(crate) fn take_dispatchable(&mut self) -> SmallVec<[Dispatch; 4]> {
        let mut started = SmallVec::new();
        if self.barrier_held || self.shutting_down {
            return started;
        }
        if self.running.values().any(|job| job.exclusive) {
            return started;
        }
        let mut skipped_regions: SmallVec<[Option<Rect>; 16]> = SmallVec::new();
        let mut seen_strokes = HashSet::new();
        let mut index = 0;
        while index < self.queue.len() && self.running.len() < self.thread_limit {
            let job = &self.queue[index];
            let region = job.conflict_region();
            if self.update_blocked(job) {
                index += 1;
                continue;
            }
            let oldest_of_stroke = job.stroke.is_none_or(|stroke| seen_strokes.insert(stroke));
            let runnable = oldest_of_stroke
                && !self.stroke_step_running(job.stroke)
                && (!job.exclusive || self.running.is_empty())
                && !self
                    .running
                    .values()
                    .any(|running| regions_overlap(running.region, region))
                && !skipped_regions
                    .iter()
                    .any(|skipped| regions_overlap(*skipped, region));
            if !runnable {
                skipped_regions.push(region);
                index += 1;
                continue;
            }
            let Some(job) = self.queue.remove(index) else {
                panic!("dispatchable job vanished from queue");
            };
            let exclusive = job.exclusive;
            started.push(self.start(job));
            if exclusive {
                break;
            }
        }
        if started.is_empty()
            && self.running.is_empty()
            && self.queue.iter().any(|job| !self.update_blocked(job))
        {
            panic!(
                "update scheduler stalled: {} queued jobs, none running and none dispatchable",
                self.queue.len()
            );
        }
        started
    }

    /// Blocked updates stay queued without holding back the jobs behind them.
    fn update_blocked(&self, job: &QueuedJob) -> bool {
        job.is_update() && self.updates_blocked > 0
    }

    fn stroke_step_running(&self, stroke: Option<StrokeId>) -> bool {
        stroke
            .and_then(|stroke| self.strokes.get(&stroke))
            .is_some_and(|record| record.step_running)
    }

    fn start(&mut self, job: QueuedJob) -> Dispatch {
        let completion = match &job.work {
            Work::Update { node, rect, .. } => Completion::Update {
                node: *node,
                rect: *rect,
            },
            Work::Begin(_) | Work::Step(_) => Completion::StrokeStep(self.stroke_of(&job)),
            Work::End(_) => Completion::StrokeEnd(self.stroke_of(&job)),
            Work::Cancel(_) => Completion::StrokeCancel(self.stroke_of(&job)),
        };
        if let Some(stroke) = job.stroke {
            let Some(record) = self.strokes.get_mut(&stroke) else {
                panic!("job {:?} belongs to unknown stroke {stroke:?}", job.id);
            };
            record.step_running = true;
        }
        self.running.insert(
            job.id,
            RunningJob {
                region: job.conflict_region(),
                exclusive: job.exclusive,
                stroke: job.stroke,
                completion,
            },
        );
        Dispatch {
            id: job.id,
            context: JobContext::new(job.id, job.region, job.cancelled),
            work: job.work,
        }
    }

    fn stroke_of(&self, job: &QueuedJob) -> StrokeId {
        let Some(stroke) = job.stroke else {
            panic!("stroke job {:?} has no stroke", job.id);
        };
        stroke
    }

    /// Retires a running job and returns the events it produced.
    pub(crate) fn finish(&mut self, id: JobId, failed: bool) -> SmallVec<[SchedulerEvent; 2]> {
        let Some(job) = self.running.remove(&id) else {
            panic!("finished job {id:?} is not running");
        };
        self.stats.completed += 1;
        if failed {
            self.stats.failed += 1;
        }
        if let Some(stroke) = job.stroke {
            if let Some(record) = self.strokes.get_mut(&stroke) {
                record.step_running = false;
            }
        }

        let mut events = SmallVec::new();
        match job.completion {
            Completion::Update { node, rect } => {
                events.push(SchedulerEvent::UpdateCompleted { node, rect });
            }
            Completion::StrokeStep(_) => {}
            Completion::StrokeEnd(stroke) => {
                let cancelled = self
                    .strokes
                    .get(&stroke)
                    .is_none_or(|record| record.cancelled);
                if !cancelled {
                    self.strokes.remove(&stroke);
                    events.push(SchedulerEvent::StrokeCompleted {
                        stroke,
                        status: StrokeStatus::Completed,
                    });
                }
            }
            Completion::StrokeCancel(stroke) => {
                self.strokes.remove(&stroke);
                events.push(SchedulerEvent::StrokeCompleted {
                    stroke,
                    status: StrokeStatus::Cancelled,
                });
            }
        }
        events
    }

    pub(crate) fn acquire_barrier(&mut self) {
        assert!(!self.barrier_held, "barrier lock is not reentrant");
        self.barrier_held = true;
    }

    pub(crate) fn try_acquire_barrier(&mut self) -> bool {
        assert!(!self.barrier_held, "barrier lock is not reentrant");
        if !self.is_idle() {
            return false;
        }
        self.barrier_held = true;
        true
    }

    pub(crate) fn release_barrier(&mut self) {
        assert!(self.barrier_held, "unlock without a held barrier lock");
        self.barrier_held = false;
    }

    pub(crate) fn block_updates(&mut self) {
        self.updates_blocked += 1;
    }

    pub(crate) fn unblock_updates(&mut self) {
        self.updates_blocked = self
            .updates_blocked
            .checked_sub(1)
            .expect("unblock_updates without matching block_updates");
    }

    pub(crate) fn set_thread_limit(&mut self, limit: usize) {
        assert!(limit > 0, "scheduler thread limit must be at least 1");
        self.thread_limit = limit;
    }

    pub(crate) fn begin_shutdown(&mut self) -> usize {
        self.shutting_down = true;
        let dropped = self.queue.len();
        self.queue.clear();
        self.strokes.clear();
        dropped
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub(crate) fn has_running(&self) -> bool {
        !self.running.is_empty()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.running.is_empty()
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.barrier_held || self.updates_blocked > 0
    }

    pub(crate) fn status(&self) -> SchedulerStatus {
        if self.is_suspended() {
            SchedulerStatus::Suspended
        } else if self.is_idle() {
            SchedulerStatus::Idle
        } else {
            SchedulerStatus::Processing
        }
    }

    pub(crate) fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queued: self.queue.len(),
            running: self.running.len(),
            active_strokes: self.strokes.len(),
            thread_limit: self.thread_limit,
            ..self.stats
        }
    }

    pub(crate) fn pending_jobs(&self) -> Vec<JobSummary> {
        let queued = self.queue.iter().map(|job| JobSummary {
            id: job.id,
            stroke: job.stroke,
            region: job.region,
            state: JobState::Queued,
        });
        let mut running = self
            .running
            .iter()
            .map(|(id, job)| JobSummary {
                id: *id,
                stroke: job.stroke,
                region: job.region,
                state: JobState::Running,
            })
            .collect::<Vec<_>>();
        running.sort_by_key(|summary| summary.id);
        running.into_iter().chain(queued).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn node() -> NodeId {
        let mut nodes = SlotMap::<NodeId, ()>::with_key();
        nodes.insert(())
    }

    fn config(patch_size: i32) -> SchedulerConfig {
        SchedulerConfig {
            worker_threads: 4,
            patch_size,
            merge_updates: true,
        }
    }

    fn queued_regions(state: &SchedulerState) -> Vec<Option<Rect>> {
        state.queue.iter().map(|job| job.region).collect()
    }

    #[test]
    fn adjacent_updates_merge_into_one_job() {
        let mut state = SchedulerState::new(4);
        state.acquire_barrier();
        let node = node();
        let config = config(512);
        state.enqueue_update(node, Rect::new(0, 0, 64, 64), UpdateFlags::empty(), &config);
        state.enqueue_update(node, Rect::new(64, 0, 64, 64), UpdateFlags::empty(), &config);
        state.enqueue_update(node, Rect::new(10, 10, 5, 5), UpdateFlags::empty(), &config);

        assert_eq!(queued_regions(&state), vec![Some(Rect::new(0, 0, 128, 64))]);
        assert_eq!(state.stats().merged, 2);
    }

    #[test]
    fn updates_with_different_flags_stay_apart() {
        let mut state = SchedulerState::new(4);
        state.acquire_barrier();
        let node = node();
        let config = config(512);
        state.enqueue_update(node, Rect::new(0, 0, 64, 64), UpdateFlags::empty(), &config);
        state.enqueue_update(node, Rect::new(0, 0, 64, 64), UpdateFlags::NO_FILTHY, &config);
        assert_eq!(state.stats().queued, 2);
    }

    #[test]
    fn merge_never_jumps_an_overlapping_job() {
        let mut state = SchedulerState::new(4);
        state.acquire_barrier();
        let node = node();
        let config = config(512);
        state.enqueue_update(node, Rect::new(0, 0, 64, 64), UpdateFlags::empty(), &config);
        state.enqueue_update(node, Rect::new(64, 0, 64, 64), UpdateFlags::NO_FILTHY, &config);
        state.enqueue_update(node, Rect::new(64, 0, 64, 64), UpdateFlags::empty(), &config);
        assert_eq!(state.stats().queued, 3);
        assert_eq!(state.stats().merged, 0);
    }

    #[test]
    fn merged_union_is_capped_at_one_patch() {
        let mut state = SchedulerState::new(4);
        state.acquire_barrier();
        let node = node();
        let config = config(64);
        state.enqueue_update(node, Rect::new(0, 0, 64, 64), UpdateFlags::empty(), &config);
        state.enqueue_update(node, Rect::new(64, 0, 64, 64), UpdateFlags::empty(), &config);
        assert_eq!(state.stats().queued, 2);
    }

    #[test]
    fn large_requests_are_split_into_patches() {
        let mut state = SchedulerState::new(4);
        state.acquire_barrier();
        let config = SchedulerConfig {
            merge_updates: false,
            ..config(512)
        };
        state.enqueue_update(node(), Rect::new(0, 0, 1024, 600), UpdateFlags::empty(), &config);
        assert_eq!(
            queued_regions(&state),
            vec![
                Some(Rect::new(0, 0, 512, 512)),
                Some(Rect::new(512, 0, 512, 512)),
                Some(Rect::new(0, 512, 512, 88)),
                Some(Rect::new(512, 512, 512, 88)),
            ]
        );
    }

    #[test]
    fn overlapping_jobs_wait_for_running_and_older_queued_jobs() {
        let mut state = SchedulerState::new(4);
        let node = node();
        let config = SchedulerConfig {
            merge_updates: false,
            ..config(512)
        };
        state.enqueue_update(node, Rect::new(0, 0, 10, 10), UpdateFlags::empty(), &config);
        let first = state.take_dispatchable();
        assert_eq!(first.len(), 1);

        state.enqueue_update(node, Rect::new(5, 5, 10, 10), UpdateFlags::empty(), &config);
        state.enqueue_update(node, Rect::new(12, 12, 10, 10), UpdateFlags::empty(), &config);
        state.enqueue_update(node, Rect::new(100, 100, 10, 10), UpdateFlags::empty(), &config);
        let second = state.take_dispatchable();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].context.region(), Some(Rect::new(100, 100, 10, 10)));

        let events = state.finish(first[0].id, false);
        assert_eq!(
            events.as_slice(),
            &[SchedulerEvent::UpdateCompleted {
                node,
                rect: Rect::new(0, 0, 10, 10)
            }]
        );
        let third = state.take_dispatchable();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].context.region(), Some(Rect::new(5, 5, 10, 10)));
    }

    #[test]
    fn thread_limit_caps_running_jobs() {
        let mut state = SchedulerState::new(2);
        let config = SchedulerConfig {
            merge_updates: false,
            ..config(512)
        };
        let node = node();
        for index in 0..5 {
            state.enqueue_update(
                node,
                Rect::new(index * 100, 0, 10, 10),
                UpdateFlags::empty(),
                &config,
            );
        }
        assert_eq!(state.take_dispatchable().len(), 2);
        assert_eq!(state.stats().running, 2);
        assert_eq!(state.take_dispatchable().len(), 0);
    }

    struct Region(Option<Rect>);

    impl StrokeStrategy for Region {
        fn name(&self) -> &str {
            "region"
        }

        fn region(&self) -> Option<Rect> {
            self.0
        }
    }

    #[test]
    fn blocked_updates_do_not_hold_back_overlapping_strokes() {
        let mut state = SchedulerState::new(4);
        state.block_updates();
        let rect = Rect::new(0, 0, 8, 8);
        state.enqueue_update(node(), rect, UpdateFlags::empty(), &config(512));
        let bounded = state.start_stroke(Arc::new(Region(Some(rect))));

        let started = state.take_dispatchable();
        assert_eq!(started.len(), 1);
        assert!(matches!(started[0].work, Work::Begin(_)));
        assert_eq!(state.running[&started[0].id].stroke, Some(bounded));
        assert!(state.finish(started[0].id, false).is_empty());

        let unbounded = state.start_stroke(Arc::new(Region(None)));
        let started = state.take_dispatchable();
        assert_eq!(started.len(), 1);
        assert_eq!(state.running[&started[0].id].stroke, Some(unbounded));
        state.finish(started[0].id, false);

        assert_eq!(state.take_dispatchable().len(), 0);
        assert_eq!(queued_regions(&state), vec![Some(rect)]);
        state.unblock_updates();
        let started = state.take_dispatchable();
        assert_eq!(started.len(), 1);
        assert!(matches!(started[0].work, Work::Update { .. }));
    }

    #[test]
    fn pending_jobs_report_queued_and_running_states() {
        let mut state = SchedulerState::new(1);
        let config = SchedulerConfig {
            merge_updates: false,
            ..config(512)
        };
        let node = node();
        state.enqueue_update(node, Rect::new(0, 0, 8, 8), UpdateFlags::empty(), &config);
        state.enqueue_update(node, Rect::new(100, 0, 8, 8), UpdateFlags::empty(), &config);
        assert_eq!(state.take_dispatchable().len(), 1);
        let states: Vec<_> = state
            .pending_jobs()
            .iter()
            .map(|summary| (summary.region, summary.state))
            .collect();
        assert_eq!(
            states,
            vec![
                (Some(Rect::new(0, 0, 8, 8)), JobState::Running),
                (Some(Rect::new(100, 0, 8, 8)), JobState::Queued),
            ]
        );
    }

    #[test]
    #[should_panic(expected = "update scheduler stalled")]
    fn stalled_queue_is_fatal() {
        let mut state = SchedulerState::new(1);
        state.enqueue_update(node(), Rect::new(0, 0, 8, 8), UpdateFlags::empty(), &config(512));
        state.thread_limit = 0;
        let _ = state.take_dispatchable();
    }
}
