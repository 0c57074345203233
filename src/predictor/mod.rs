//! The predictor worker pool.

use tracing::{error, error_span, info, warn};
use tracing_futures::Instrument;

use crate::{
    common::{PredictTaskResult, TaskState, TaskType},
    coordinator::{
        drain::Watch,
        requests::{Origin, StartTaskError},
    },
    worker::{drive, Admission, Exchange, Job, Slots, WorkerContext},
};

/// Runs prediction tasks, at most `limit` at a time.
#[derive(Debug, Clone)]
pub(crate) struct PredictorPool {
    slots: Slots,
}

impl PredictorPool {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Slots::new(TaskType::Predict, limit),
        }
    }

    pub fn admit(&self, origin: &Origin) -> Result<Admission, StartTaskError> {
        self.slots.admit(origin)
    }

    pub fn available(&self) -> usize {
        self.slots.available()
    }

    /// Runs a task on its own tokio task.
    pub fn spawn(&self, job: Job, ctx: WorkerContext, watch: Watch) {
        let span = error_span!("predict_task", task_id = %job.task.id);
        tokio::spawn(
            async move {
                run(job, ctx).await;
                drop(watch);
            }
            .instrument(span),
        );
    }
}

async fn run(job: Job, ctx: WorkerContext) {
    let Job {
        task,
        origin,
        cancel,
        mut inbox,
        admission,
    } = job;

    let mut slot = None;
    let result = async {
        slot = Some(
            admission
                .acquire(&cancel)
                .await
                .ok_or_else(|| "the task was cancelled".to_string())?,
        );
        ctx.requests.set_state(&task.id, TaskState::Running);
        info!("prediction started with {} peers", task.hosts.len());

        let mut protocol = ctx
            .algorithms
            .predictor(&ctx.address, &task)
            .map_err(|err| err.to_string())?;
        let exchange = Exchange {
            task: &task,
            ctx: &ctx,
        };
        let outcomes = drive(protocol.as_mut(), exchange, &mut inbox, &cancel)
            .await
            .map_err(|err| err.to_string())?;
        Ok::<_, String>(PredictTaskResult::success(task.id.clone(), outcomes))
    }
    .await
    .unwrap_or_else(|err| {
        warn!("prediction failed: {}", err);
        PredictTaskResult::failure(task.id.clone(), err)
    });
    drop(slot);
    ctx.requests.finished(&task.id);

    match origin {
        Origin::External => {
            if result.success {
                info!("prediction succeeded");
            }
            if let Err(err) = ctx.holder.save_predict_out(result).await {
                error!("failed to save the prediction result: {:#}", err);
            }
        }
        Origin::EvalPredict(tag) => {
            let result = result.with_fold(Some(tag.clone()));
            ctx.evaluator.deliver(tag, result).await;
        }
        Origin::EvalTrain(_) => error!("prediction task started as a training fold"),
    }
}
