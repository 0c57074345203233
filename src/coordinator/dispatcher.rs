//! The dispatch loop of a coordinator. It is the only writer of the task registry.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    drain::{Signal, Watch},
    registry::Registry,
    requests::{Origin, Request, RequestError, RequestReceiver, StartTaskError, StopTaskError},
};
use crate::{
    common::{Task, TaskType},
    predictor::PredictorPool,
    trainer::TrainerPool,
    worker::{Job, WorkerContext},
};

pub(super) struct Dispatcher {
    pub requests: RequestReceiver,
    pub registry: Registry,
    pub trainers: TrainerPool,
    pub predictors: PredictorPool,
    pub ctx: WorkerContext,
    /// The parent of the cancellation tokens of all tasks.
    pub root: CancellationToken,
    /// Cancelled to request the shutdown.
    pub stop: CancellationToken,
    /// Cancelled once the shutdown completed.
    pub done: CancellationToken,
    pub watch: Watch,
    pub signal: Signal,
}

impl Dispatcher {
    /// Handles requests until a shutdown is requested, then waits for all workers.
    pub async fn run(mut self) {
        info!("dispatching requests for {}", self.ctx.address);
        loop {
            tokio::select! {
                biased;

                _ = self.stop.cancelled() => break,
                next = self.requests.recv() => match next {
                    Some((req, span)) => {
                        let _span_guard = span.enter();
                        self.handle(req);
                    }
                    None => break,
                },
            }
        }
        self.shutdown().await;
    }

    fn handle(&mut self, req: Request) {
        match req {
            Request::Start {
                task,
                origin,
                parent,
                resp_tx,
            } => {
                let _ = resp_tx.send(self.start(task, origin, parent));
            }
            Request::Stop { task_id, resp_tx } => {
                let resp = self.registry.stop(&task_id);
                if resp.is_ok() {
                    info!("stopping task {}", task_id);
                }
                let _ = resp_tx.send(resp);
            }
            Request::Route {
                task_id,
                kind,
                algo,
                inbound,
            } => self.registry.route(&task_id, kind, algo, inbound),
            Request::SetState { task_id, state } => self.registry.set_state(&task_id, state),
            Request::Finished { task_id } => {
                if self.registry.remove(&task_id).is_some() {
                    debug!(
                        "task {} finished, {} tasks left",
                        task_id,
                        self.registry.len()
                    );
                }
            }
            Request::State { task_id, resp_tx } => {
                let _ = resp_tx.send(self.registry.state(&task_id));
            }
        }
    }

    fn start(
        &mut self,
        task: Task,
        origin: Origin,
        parent: Option<CancellationToken>,
    ) -> Result<(), StartTaskError> {
        if self.registry.contains(&task.id) {
            return Err(StartTaskError::DuplicateTask(task.id));
        }
        let kind = task.kind();
        let admission = match kind {
            TaskType::Learn => self.trainers.admit(&origin)?,
            TaskType::Predict => self.predictors.admit(&origin)?,
        };
        let cancel = parent.as_ref().unwrap_or(&self.root).child_token();
        let inbox = self
            .registry
            .insert(task.id.clone(), kind, task.algo(), cancel.clone());
        info!("{} task {} admitted", kind, task.id);

        let job = Job {
            task,
            origin,
            cancel,
            inbox,
            admission,
        };
        match kind {
            TaskType::Learn => {
                self.trainers.spawn(job, self.ctx.clone(), self.watch.clone());
                debug!("{} training slots left", self.trainers.available());
            }
            TaskType::Predict => {
                self.predictors
                    .spawn(job, self.ctx.clone(), self.watch.clone());
                debug!("{} prediction slots left", self.predictors.available());
            }
        }
        Ok(())
    }

    async fn shutdown(mut self) {
        info!("shutting down, cancelling {} tasks", self.registry.len());
        self.requests.close();
        self.root.cancel();
        while let Some((req, _)) = self.requests.recv().await {
            reject(req);
        }

        let Self {
            mut registry,
            watch,
            signal,
            done,
            ..
        } = self;
        drop(watch);
        signal.drain().await;
        registry.clear();
        info!("all workers stopped");
        done.cancel();
    }
}

/// Answers a request which arrived after the shutdown began.
fn reject(req: Request) {
    match req {
        Request::Start { resp_tx, .. } => {
            let _ = resp_tx.send(Err(StartTaskError::NotAccepting));
        }
        Request::Stop { resp_tx, .. } => {
            let _ = resp_tx.send(Err(StopTaskError::NotAccepting));
        }
        Request::Route { inbound, .. } => inbound.reply(Err(RequestError::NotAccepting)),
        Request::State { resp_tx, .. } => {
            let _ = resp_tx.send(None);
        }
        Request::SetState { .. } | Request::Finished { .. } => {}
    }
}
