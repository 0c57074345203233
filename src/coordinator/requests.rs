//! This module provides the `Request`, `RequestSender` and `RequestReceiver` types used to talk
//! to the dispatch loop of a coordinator.

use derive_more::From;
use displaydoc::Display;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::common::{
    Algorithm,
    FoldTag,
    InvalidTask,
    Task,
    TaskState,
    TaskType,
    TrainTaskResult,
};

/// Errors which can occur while starting a task.
#[derive(Debug, Display, Error, PartialEq)]
pub enum StartTaskError {
    /// Invalid task: {0}.
    Invalid(#[from] InvalidTask),
    /// A task with the id {0} is already running.
    DuplicateTask(String),
    /// The limit of {limit} concurrent {kind} tasks is reached.
    LimitExceeded { kind: TaskType, limit: usize },
    /// The coordinator is not accepting new tasks.
    NotAccepting,
}

/// Errors which can occur while stopping a task.
#[derive(Debug, Display, Error, PartialEq)]
pub enum StopTaskError {
    /// No task with the id {0} is running.
    TaskNotFound(String),
    /// The task {0} is already stopping.
    AlreadyStopping(String),
    /// The coordinator is not accepting requests.
    NotAccepting,
}

/// Errors which can occur while a round message of a peer is handled.
#[derive(Debug, Display, Error, PartialEq)]
pub enum RequestError {
    /// No task with the id {0} is running.
    TaskNotFound(String),
    /// The task runs {expected}, the message is for {got}.
    AlgorithmMismatch { expected: Algorithm, got: Algorithm },
    /// The message was rejected: {0}.
    Rejected(String),
    /// The task finished before the message could be answered.
    Dropped,
    /// The coordinator is not accepting requests.
    NotAccepting,
}

/// The answer to an [`Inbound`] round message.
pub(crate) type ReplySender = oneshot::Sender<Result<Vec<u8>, RequestError>>;

/// A round message of a peer, on its way to the worker of the task.
#[derive(Debug)]
pub(crate) struct Inbound {
    pub from: String,
    pub payload: Vec<u8>,
    pub resp_tx: ReplySender,
}

impl Inbound {
    pub fn reply(self, resp: Result<Vec<u8>, RequestError>) {
        // the peer may have given up already
        let _ = self.resp_tx.send(resp);
    }
}

/// Who receives the result of a task.
#[derive(Debug)]
pub(crate) enum Origin {
    /// A task started through the public API. Results go to the model holder.
    External,
    /// The training of an evaluation fold.
    EvalTrain(oneshot::Sender<TrainTaskResult>),
    /// The prediction of an evaluation fold.
    EvalPredict(FoldTag),
}

/// A request to the dispatch loop.
#[derive(Debug)]
pub(crate) enum Request {
    Start {
        task: Task,
        origin: Origin,
        /// Internal tasks are cancelled together with the task that started them.
        parent: Option<CancellationToken>,
        resp_tx: oneshot::Sender<Result<(), StartTaskError>>,
    },
    Stop {
        task_id: String,
        resp_tx: oneshot::Sender<Result<(), StopTaskError>>,
    },
    Route {
        task_id: String,
        kind: TaskType,
        algo: Algorithm,
        inbound: Inbound,
    },
    SetState {
        task_id: String,
        state: TaskState,
    },
    Finished {
        task_id: String,
    },
    State {
        task_id: String,
        resp_tx: oneshot::Sender<Option<TaskState>>,
    },
}

/// A handle to send requests to the dispatch loop.
#[derive(Clone, From, Debug)]
pub(crate) struct RequestSender(mpsc::UnboundedSender<(Request, Span)>);

impl RequestSender {
    fn send(&self, req: Request) -> Result<(), Request> {
        self.0
            .send((req, Span::current()))
            .map_err(|mpsc::error::SendError((req, _))| req)
    }

    /// Registers a task and hands it to a worker.
    ///
    /// # Errors
    /// Fails if the task was not admitted or the dispatch loop has shut down.
    pub async fn start(
        &self,
        task: Task,
        origin: Origin,
        parent: Option<CancellationToken>,
    ) -> Result<(), StartTaskError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.send(Request::Start {
            task,
            origin,
            parent,
            resp_tx,
        })
        .map_err(|_| StartTaskError::NotAccepting)?;
        resp_rx.await.map_err(|_| StartTaskError::NotAccepting)?
    }

    /// Requests the cancellation of a task.
    pub async fn stop(&self, task_id: String) -> Result<(), StopTaskError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.send(Request::Stop { task_id, resp_tx })
            .map_err(|_| StopTaskError::NotAccepting)?;
        resp_rx.await.map_err(|_| StopTaskError::NotAccepting)?
    }

    /// Routes a round message of a peer to the worker of the task and waits for its answer.
    pub async fn route(
        &self,
        task_id: String,
        kind: TaskType,
        algo: Algorithm,
        from: String,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RequestError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        let inbound = Inbound {
            from,
            payload,
            resp_tx,
        };
        self.send(Request::Route {
            task_id,
            kind,
            algo,
            inbound,
        })
        .map_err(|_| RequestError::NotAccepting)?;
        resp_rx.await.map_err(|_| RequestError::Dropped)?
    }

    /// Updates the lifecycle state of a task. Ignored during shutdown.
    pub fn set_state(&self, task_id: &str, state: TaskState) {
        let _ = self.send(Request::SetState {
            task_id: task_id.to_string(),
            state,
        });
    }

    /// Removes a task which reached a terminal state. Ignored during shutdown.
    pub fn finished(&self, task_id: &str) {
        let _ = self.send(Request::Finished {
            task_id: task_id.to_string(),
        });
    }

    /// Returns the lifecycle state of a registered task.
    pub async fn state(&self, task_id: String) -> Option<TaskState> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.send(Request::State { task_id, resp_tx }).ok()?;
        resp_rx.await.ok().flatten()
    }
}

/// The receiver half of the request channel, owned by the dispatch loop.
#[derive(From, Debug)]
pub(crate) struct RequestReceiver(mpsc::UnboundedReceiver<(Request, Span)>);

impl RequestReceiver {
    /// Creates a new request channel and returns the [`RequestReceiver`] as well as the
    /// [`RequestSender`] half.
    pub fn new() -> (Self, RequestSender) {
        let (tx, rx) = mpsc::unbounded_channel::<(Request, Span)>();
        (RequestReceiver::from(rx), RequestSender::from(tx))
    }

    /// Closes the request channel. Buffered requests can still be received.
    pub fn close(&mut self) {
        self.0.close()
    }

    /// Receives the next request.
    pub async fn recv(&mut self) -> Option<(Request, Span)> {
        self.0.recv().await
    }
}
