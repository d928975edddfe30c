use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;

use crate::Shared;
use crate::job::{JobContext, JobError};
use crate::queue::{Dispatch, Work};

pub(crate) enum WorkerMessage {
    Run(Dispatch),
    Stop,
}

pub(crate) fn spawn_workers(
    shared: &Arc<Shared>,
    receiver: &Receiver<WorkerMessage>,
    count: usize,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|index| {
            let shared = Arc::clone(shared);
            let receiver = receiver.clone();
            std::thread::Builder::new()
                .name(format!("update_worker_{index}"))
                .spawn(move || worker_loop(shared, receiver))
                .expect("spawn update worker thread")
        })
        .collect()
}

fn worker_loop(shared: Arc<Shared>, receiver: Receiver<WorkerMessage>) {
    for message in receiver.iter() {
        match message {
            WorkerMessage::Run(dispatch) => run(&shared, dispatch),
            WorkerMessage::Stop => break,
        }
    }
}

fn run(shared: &Shared, dispatch: Dispatch) {
    let Dispatch {
        id,
        mut work,
        context,
    } = dispatch;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| execute(shared, &mut work, &context)));
    let failed = match outcome {
        Ok(Ok(())) => false,
        Ok(Err(JobError::Cancelled)) => {
            tracing::debug!(job = id.0, "job stopped after cancellation");
            false
        }
        Ok(Err(error)) => {
            tracing::error!(job = id.0, %error, "job failed, treating it as completed");
            true
        }
        Err(payload) => {
            tracing::error!(
                job = id.0,
                panic = panic_message(payload.as_ref()),
                "job panicked, treating it as completed"
            );
            true
        }
    };
    drop(work);
    shared.finish(id, failed);
}

fn execute(shared: &Shared, work: &mut Work, context: &JobContext) -> Result<(), JobError> {
    match work {
        Work::Update { node, rect, flags } => shared.walker.recompute(*node, *rect, *flags, context),
        Work::Begin(strategy) => strategy.begin(context),
        Work::Step(job) => job.run(context),
        Work::End(strategy) => strategy.end(context),
        Work::Cancel(strategy) => strategy.cancel(context),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
