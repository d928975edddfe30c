use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use model::{JobId, NodeId, Rect, StrokeId, UpdateFlags};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("job observed cancellation")]
    Cancelled,
    #[error("job failed: {0}")]
    Failed(String),
}

/// Handed to every running job. Long jobs poll [`JobContext::is_cancelled`]
/// and return early, leaving pixels in a state their stroke can roll back.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    region: Option<Rect>,
    cancelled: Arc<AtomicBool>,
}

impl JobContext {
    pub(crate) fn new(job_id: JobId, region: Option<Rect>, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            job_id,
            region,
            cancelled,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Declared region; `None` means the job may touch anything.
    pub fn region(&self) -> Option<Rect> {
        self.region
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Recomputes the composited projection of a node subtree.
pub trait ProjectionWalker: Send + Sync {
    fn recompute(
        &self,
        node: NodeId,
        rect: Rect,
        flags: UpdateFlags,
        context: &JobContext,
    ) -> Result<(), JobError>;
}

/// Describes one stroke: how its jobs are serialized and how it is
/// finalized or rolled back.
pub trait StrokeStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Exclusive strokes run every job alone, with nothing else in flight.
    fn is_exclusive(&self) -> bool {
        false
    }

    /// Region touched by `begin`, `end` and `cancel`. `None` is unbounded.
    fn region(&self) -> Option<Rect> {
        None
    }

    fn begin(&self, _context: &JobContext) -> Result<(), JobError> {
        Ok(())
    }

    fn end(&self, _context: &JobContext) -> Result<(), JobError> {
        Ok(())
    }

    /// Undoes whatever the stroke's jobs applied.
    fn cancel(&self, _context: &JobContext) -> Result<(), JobError> {
        Ok(())
    }
}

pub trait StrokeJob: Send {
    /// `None` serializes the job against every other job.
    fn region(&self) -> Option<Rect>;

    fn run(&mut self, context: &JobContext) -> Result<(), JobError>;
}

/// Where an unfinished job stands. Finished and cancelled work is reported
/// through [`SchedulerEvent`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrokeStatus {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    UpdateCompleted {
        node: NodeId,
        rect: Rect,
    },
    StrokeCompleted {
        stroke: StrokeId,
        status: StrokeStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStatus {
    Idle,
    Processing,
    /// Barrier lock held or updates blocked; queued work waits.
    Suspended,
}

/// Snapshot of one job that has not finished yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSummary {
    pub id: JobId,
    pub stroke: Option<StrokeId>,
    pub region: Option<Rect>,
    pub state: JobState,
}

pub(crate) fn regions_overlap(a: Option<Rect>, b: Option<Rect>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.intersects(&b),
        _ => true,
    }
}
