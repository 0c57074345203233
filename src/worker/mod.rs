//! The round loop shared by the trainer and predictor pools.
//!
//! A worker drives the local [`RoundProtocol`] of one task: it sends the payload of every round
//! to all peers, absorbs their answers and moves on to the next round. While waiting for the
//! peers it keeps answering their round messages, which arrive through the inbox of the task.

use std::{sync::Arc, time::Duration};

use displaydoc::Display;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    algorithms::{AlgorithmError, AlgorithmProvider, PeerReply, Round, RoundProtocol},
    common::{PredictRequest, Task, TaskType, TrainRequest},
    coordinator::{
        registry::Inbox,
        requests::{Inbound, Origin, RequestError, RequestSender, StartTaskError},
    },
    evaluator::Evaluator,
    holder::ModelHolder,
    rpc::{RetryPolicy, StepError, StepRpc},
};

/// Errors which end a task.
#[derive(Debug, Display, Error)]
pub enum WorkerError {
    /// The task was cancelled.
    Cancelled,
    /// {0}
    Step(#[from] StepError),
    /// {0}
    Algorithm(#[from] AlgorithmError),
}

/// Everything a worker needs besides its task.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    /// The address of the local party.
    pub address: String,
    pub rpc: Arc<dyn StepRpc>,
    pub retry: RetryPolicy,
    /// How long a worker keeps serving its peers after finishing.
    pub linger: Duration,
    pub algorithms: Arc<dyn AlgorithmProvider>,
    pub holder: Arc<dyn ModelHolder>,
    pub requests: RequestSender,
    pub evaluator: Evaluator,
}

/// Bounds the number of concurrently running tasks of a kind.
#[derive(Debug, Clone)]
pub(crate) struct Slots {
    semaphore: Arc<Semaphore>,
    kind: TaskType,
    limit: usize,
}

impl Slots {
    pub fn new(kind: TaskType, limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            kind,
            limit,
        }
    }

    /// Admits a task.
    ///
    /// Tasks started through the public API get a slot right away or are rejected. The training
    /// of an evaluation fold runs on the slot of the task being evaluated, which holds it until
    /// the evaluation is over. Fold predictions wait for the next free slot.
    ///
    /// # Errors
    /// Fails if an external task finds all slots taken.
    pub fn admit(&self, origin: &Origin) -> Result<Admission, StartTaskError> {
        match origin {
            Origin::EvalTrain(_) => Ok(Admission::Inherited),
            Origin::EvalPredict(_) => Ok(Admission::Queued(self.semaphore.clone())),
            Origin::External => self
                .semaphore
                .clone()
                .try_acquire_owned()
                .map(Admission::Granted)
                .map_err(|_| StartTaskError::LimitExceeded {
                    kind: self.kind,
                    limit: self.limit,
                }),
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// The worker slot of a task.
pub(crate) enum Admission {
    /// A slot was reserved when the task was admitted.
    Granted(OwnedSemaphorePermit),
    /// The task waits for the next free slot.
    Queued(Arc<Semaphore>),
    /// The task runs on the slot of the task which started it.
    Inherited,
}

impl Admission {
    /// Returns the held slot, or `None` if the task was cancelled while waiting.
    pub async fn acquire(self, cancel: &CancellationToken) -> Option<SlotGuard> {
        match self {
            Admission::Granted(permit) => Some(SlotGuard::owned(permit)),
            Admission::Queued(slots) => {
                debug!("waiting for a worker slot");
                tokio::select! {
                    permit = slots.acquire_owned() => permit.ok().map(SlotGuard::owned),
                    _ = cancel.cancelled() => None,
                }
            }
            Admission::Inherited => Some(SlotGuard { _permit: None }),
        }
    }
}

/// Occupies a worker slot until dropped.
#[derive(Debug)]
pub(crate) struct SlotGuard {
    _permit: Option<OwnedSemaphorePermit>,
}

impl SlotGuard {
    fn owned(permit: OwnedSemaphorePermit) -> Self {
        Self {
            _permit: Some(permit),
        }
    }
}

/// A task handed to a worker pool.
pub(crate) struct Job {
    pub task: Task,
    pub origin: Origin,
    pub cancel: CancellationToken,
    pub inbox: Inbox,
    pub admission: Admission,
}

/// Sends round payloads of a task to its peers.
pub(crate) struct Exchange<'a> {
    pub task: &'a Task,
    pub ctx: &'a WorkerContext,
}

impl Exchange<'_> {
    async fn call(&self, host: &str, payload: Vec<u8>) -> Result<Vec<u8>, StepError> {
        let RetryPolicy { times, interval } = self.ctx.retry;
        let rpc = &self.ctx.rpc;
        match self.task.kind() {
            TaskType::Learn => {
                let req = TrainRequest {
                    task_id: self.task.id.clone(),
                    algo: self.task.algo(),
                    from: self.ctx.address.clone(),
                    payload,
                };
                let resp = rpc.step_train_with_retry(req, host, times, interval).await?;
                Ok(resp.payload)
            }
            TaskType::Predict => {
                let req = PredictRequest {
                    task_id: self.task.id.clone(),
                    algo: self.task.algo(),
                    from: self.ctx.address.clone(),
                    payload,
                };
                let resp = rpc
                    .step_predict_with_retry(req, host, times, interval)
                    .await?;
                Ok(resp.payload)
            }
        }
    }
}

#[derive(Debug, Default)]
struct Counter {
    answered: u32,
    rejected: u32,
    parked: u32,
}

/// Answers the round messages of the peers.
struct Server {
    parked: Vec<Inbound>,
    counter: Counter,
}

impl Server {
    fn new() -> Self {
        Self {
            parked: Vec::new(),
            counter: Counter::default(),
        }
    }

    fn serve(&mut self, protocol: &mut dyn RoundProtocol, inbound: Inbound) {
        match protocol.handle_peer(&inbound.from, &inbound.payload) {
            Ok(PeerReply::Ready(resp)) => {
                self.counter.answered += 1;
                inbound.reply(Ok(resp));
            }
            Ok(PeerReply::NotYet) => {
                self.counter.parked += 1;
                self.parked.push(inbound);
            }
            Err(err) => {
                warn!("rejected round message of {}: {}", inbound.from, err);
                self.counter.rejected += 1;
                inbound.reply(Err(RequestError::Rejected(err.to_string())));
            }
        }
    }

    /// Offers the parked messages again after a local state change.
    fn retry_parked(&mut self, protocol: &mut dyn RoundProtocol) {
        for inbound in std::mem::take(&mut self.parked) {
            if inbound.resp_tx.is_closed() {
                debug!("{} gave up on a parked round message", inbound.from);
                continue;
            }
            self.serve(protocol, inbound);
        }
    }
}

/// Runs a round protocol to completion and returns its output.
///
/// Cancellation is observed between rounds, calls already sent to the peers are allowed to
/// complete. After the final round the worker keeps answering its peers until the protocol is
/// settled or `ctx.linger` elapsed.
///
/// # Errors
/// Fails if the task was cancelled, a peer could not be reached or the protocol failed.
pub(crate) async fn drive(
    protocol: &mut dyn RoundProtocol,
    exchange: Exchange<'_>,
    inbox: &mut Inbox,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, WorkerError> {
    let hosts = &exchange.task.hosts;
    let mut server = Server::new();
    let mut rounds = 0_u64;

    let output = loop {
        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }
        let payload = match protocol.next_round()? {
            Round::Send(payload) => payload,
            Round::Done(output) => break output,
        };
        server.retry_parked(protocol);

        let calls = join_all(
            hosts
                .iter()
                .map(|host| exchange.call(host, payload.clone())),
        );
        tokio::pin!(calls);
        let responses = loop {
            tokio::select! {
                responses = &mut calls => break responses,
                Some(inbound) = inbox.recv() => server.serve(protocol, inbound),
            }
        };
        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }

        for (host, resp) in hosts.iter().zip(responses) {
            protocol.absorb(host, &resp?)?;
            server.retry_parked(protocol);
        }
        rounds += 1;
    };
    debug!("finished after {} rounds", rounds);

    server.retry_parked(protocol);
    let linger = tokio::time::sleep(exchange.ctx.linger);
    tokio::pin!(linger);
    while !protocol.is_settled() {
        tokio::select! {
            _ = &mut linger => {
                warn!("not every peer collected the final round");
                break;
            }
            _ = cancel.cancelled() => break,
            Some(inbound) = inbox.recv() => {
                server.serve(protocol, inbound);
                server.retry_parked(protocol);
            }
        }
    }

    let Counter {
        answered,
        rejected,
        parked,
    } = server.counter;
    info!(
        "{} rounds, {} peer messages answered, {} rejected, {} parked",
        rounds, answered, rejected, parked
    );
    Ok(output)
}
