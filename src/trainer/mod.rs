//! The trainer worker pool.

use tracing::{error, error_span, info, warn};
use tracing_futures::Instrument;

use crate::{
    common::{TaskState, TaskType, TrainTaskResult},
    coordinator::{
        drain::Watch,
        requests::{Origin, StartTaskError},
    },
    evaluator,
    worker::{drive, Admission, Exchange, Job, Slots, WorkerContext},
};

/// Runs training tasks, at most `limit` at a time.
#[derive(Debug, Clone)]
pub(crate) struct TrainerPool {
    slots: Slots,
}

impl TrainerPool {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Slots::new(TaskType::Learn, limit),
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
        let span = error_span!("train_task", task_id = %job.task.id);
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
        info!("training started with {} peers", task.hosts.len());

        let evaluation = match (&origin, task.params.evaluation()) {
            (Origin::External, Some(params)) => Some(
                evaluator::prepare(&task, params)
                    .map_err(|err| format!("evaluation setup failed: {}", err))?,
            ),
            _ => None,
        };
        let training_task = evaluation
            .as_ref()
            .map_or(&task, |(training_task, _)| training_task);

        let mut protocol = ctx
            .algorithms
            .learner(&ctx.address, training_task)
            .map_err(|err| err.to_string())?;
        let exchange = Exchange {
            task: training_task,
            ctx: &ctx,
        };
        let model = drive(protocol.as_mut(), exchange, &mut inbox, &cancel)
            .await
            .map_err(|err| err.to_string())?;

        let mut result = TrainTaskResult::success(task.id.clone(), model.clone());
        if let Some((_, plan)) = evaluation {
            ctx.requests.set_state(&task.id, TaskState::Evaluating);
            result.eval_metric_scores = ctx
                .evaluator
                .evaluate(&task, plan, &model, &cancel)
                .await
                .map_err(|err| format!("evaluation failed: {}", err))?;
        }
        Ok::<_, String>(result)
    }
    .await
    .unwrap_or_else(|err| {
        warn!("training failed: {}", err);
        TrainTaskResult::failure(task.id.clone(), err)
    });
    // the slot is free once the task is gone from the registry
    drop(slot);
    ctx.requests.finished(&task.id);

    match origin {
        Origin::External => {
            if result.success {
                info!("training succeeded");
            }
            if let Err(err) = ctx.holder.save_model(result).await {
                error!("failed to save the training result: {:#}", err);
            }
        }
        Origin::EvalTrain(reply) => {
            if reply.send(result).is_err() {
                warn!("the evaluation is gone, dropping the fold model");
            }
        }
        Origin::EvalPredict(_) => error!("training task started as a prediction fold"),
    }
}
