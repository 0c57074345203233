//! The coordinator of a party.
//!
//! A coordinator admits tasks, runs them on its trainer and predictor pools and routes the round
//! messages of its peers to them. Every change to the set of live tasks goes through a single
//! dispatch loop. The operations of a running coordinator are available on its
//! [`CoordinatorHandle`].

mod dispatcher;
pub(crate) mod drain;
pub(crate) mod registry;
pub mod requests;

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{error_span, info};
use tracing_futures::Instrument;

use self::{
    dispatcher::Dispatcher,
    registry::Registry,
    requests::{Origin, RequestReceiver, RequestSender},
};
pub use self::requests::{RequestError, StartTaskError, StopTaskError};
use crate::{
    algorithms::{AlgorithmProvider, VerticalAlgorithms},
    common::{
        PredictRequest,
        PredictResponse,
        StartTaskRequest,
        StopTaskRequest,
        Task,
        TaskState,
        TaskType,
        TrainRequest,
        TrainResponse,
        ValidateRequest,
    },
    evaluator::{Evaluator, ValidateError},
    holder::ModelHolder,
    predictor::PredictorPool,
    rpc::{PeerTransport, RetryPolicy, StepClient, StepRpc},
    settings::Settings,
    trainer::TrainerPool,
    worker::WorkerContext,
};

/// The configuration of a coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// The address under which the peers reach this party.
    pub address: String,
    pub train_task_limit: usize,
    pub predict_task_limit: usize,
    /// The timeout of a single round exchange.
    pub rpc_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Config {
    /// The longest time a retried round exchange can take.
    pub fn step_budget(&self) -> Duration {
        self.retry.budget(self.rpc_timeout)
    }
}

impl From<&Settings> for Config {
    fn from(settings: &Settings) -> Self {
        Self {
            address: settings.coordinator.address.clone(),
            train_task_limit: settings.coordinator.train_task_limit,
            predict_task_limit: settings.coordinator.predict_task_limit,
            rpc_timeout: settings.rpc.timeout(),
            retry: RetryPolicy {
                times: settings.rpc.retry_times,
                interval: settings.rpc.retry_interval(),
            },
        }
    }
}

/// Builds and spawns a coordinator.
pub struct Coordinator {
    config: Config,
    holder: Arc<dyn ModelHolder>,
    rpc: Arc<dyn StepRpc>,
    algorithms: Arc<dyn AlgorithmProvider>,
}

impl Coordinator {
    /// Creates a coordinator which reaches its peers through `transport` and runs the built-in
    /// algorithms.
    pub fn new(
        config: Config,
        holder: Arc<dyn ModelHolder>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        let rpc = Arc::new(StepClient::new(transport, config.rpc_timeout));
        Self {
            config,
            holder,
            rpc,
            algorithms: Arc::new(VerticalAlgorithms),
        }
    }

    /// Creates a coordinator and spawns it right away.
    pub fn start(
        config: Config,
        holder: Arc<dyn ModelHolder>,
        transport: Arc<dyn PeerTransport>,
    ) -> CoordinatorHandle {
        Self::new(config, holder, transport).spawn()
    }

    /// Spawns the dispatch loop on the current tokio runtime.
    pub fn spawn(self) -> CoordinatorHandle {
        let Self {
            config,
            holder,
            rpc,
            algorithms,
        } = self;
        let (receiver, requests) = RequestReceiver::new();
        let step_budget = config.step_budget();
        let evaluator = Evaluator::new(rpc.clone(), config.retry, step_budget, requests.clone());
        let ctx = WorkerContext {
            address: config.address.clone(),
            rpc,
            retry: config.retry,
            linger: step_budget,
            algorithms,
            holder,
            requests: requests.clone(),
            evaluator: evaluator.clone(),
        };
        let (signal, watch) = drain::channel();
        let stop = CancellationToken::new();
        let done = CancellationToken::new();

        let dispatcher = Dispatcher {
            requests: receiver,
            registry: Registry::default(),
            trainers: TrainerPool::new(config.train_task_limit),
            predictors: PredictorPool::new(config.predict_task_limit),
            ctx,
            root: CancellationToken::new(),
            stop: stop.clone(),
            done: done.clone(),
            watch,
            signal,
        };
        let span = error_span!("coordinator", address = %config.address);
        tokio::spawn(dispatcher.run().instrument(span));

        CoordinatorHandle {
            address: config.address,
            requests,
            evaluator,
            stop,
            done,
        }
    }
}

/// A handle to a running coordinator.
///
/// `start_task`, `stop_task` and `stop` are the local operations. `train`, `predict` and
/// `validate` serve the requests of the peers and are meant to be wired to the transport.
#[derive(Clone)]
pub struct CoordinatorHandle {
    address: String,
    requests: RequestSender,
    evaluator: Evaluator,
    stop: CancellationToken,
    done: CancellationToken,
}

impl CoordinatorHandle {
    /// The address of the local party.
    pub fn address(&self) -> &str {
        &self.address
    }

    fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Starts a task.
    ///
    /// The task runs in the background. Its result is handed to the model holder.
    ///
    /// # Errors
    /// Fails if the request is invalid, a task with the same id is live, all worker slots of
    /// the task type are taken or the coordinator is stopping.
    pub async fn start_task(&self, req: StartTaskRequest) -> Result<(), StartTaskError> {
        if self.is_stopping() {
            return Err(StartTaskError::NotAccepting);
        }
        let task = Task::from_request(req)?;
        self.requests.start(task, Origin::External, None).await
    }

    /// Cancels a live task. The task fails once its current round is over.
    pub async fn stop_task(&self, req: StopTaskRequest) -> Result<(), StopTaskError> {
        if self.is_stopping() {
            return Err(StopTaskError::NotAccepting);
        }
        self.requests.stop(req.task_id).await
    }

    /// Cancels all tasks and waits until every worker has finished.
    ///
    /// Can be called more than once, every call waits for the shutdown to complete.
    pub async fn stop(&self) {
        if !self.is_stopping() {
            info!("stop requested for {}", self.address);
            self.stop.cancel();
        }
        self.done.cancelled().await;
    }

    /// Serves a training round message of a peer.
    pub async fn train(&self, req: TrainRequest) -> Result<TrainResponse, RequestError> {
        if self.is_stopping() {
            return Err(RequestError::NotAccepting);
        }
        let TrainRequest {
            task_id,
            algo,
            from,
            payload,
        } = req;
        let payload = self
            .requests
            .route(task_id.clone(), TaskType::Learn, algo, from, payload)
            .await?;
        Ok(TrainResponse { task_id, payload })
    }

    /// Serves a prediction round message of a peer.
    pub async fn predict(&self, req: PredictRequest) -> Result<PredictResponse, RequestError> {
        if self.is_stopping() {
            return Err(RequestError::NotAccepting);
        }
        let PredictRequest {
            task_id,
            algo,
            from,
            payload,
        } = req;
        let payload = self
            .requests
            .route(task_id.clone(), TaskType::Predict, algo, from, payload)
            .await?;
        Ok(PredictResponse { task_id, payload })
    }

    /// Accepts the evaluation report of a peer.
    pub async fn validate(&self, req: ValidateRequest) -> Result<(), ValidateError> {
        if self.is_stopping() {
            return Err(ValidateError::NotAccepting);
        }
        self.evaluator.validate(req).await
    }

    /// Returns the state of a live task, or `None` if no task with the id is live.
    pub async fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.requests.state(task_id.to_string()).await
    }
}
