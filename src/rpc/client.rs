//! The step client, which bounds every round exchange with a timeout and retries failed ones.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::{PeerTransport, StepError, StepRpc, TransportError};
use crate::common::{
    PredictRequest,
    PredictResponse,
    TrainRequest,
    TrainResponse,
    ValidateRequest,
};

/// A [`StepRpc`] on top of a [`PeerTransport`].
#[derive(Clone)]
pub struct StepClient {
    transport: Arc<dyn PeerTransport>,
    timeout: Duration,
}

impl StepClient {
    /// Creates a client which bounds every attempt by `timeout`.
    pub fn new(transport: Arc<dyn PeerTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    async fn attempt<T, F>(&self, peer: &str, call: F) -> Result<T, StepError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        match timeout(self.timeout, call).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(err)) => Err(StepError::Transport {
                peer: peer.to_string(),
                reason: format!("{:#}", err),
            }),
            Err(_) => Err(StepError::Timeout {
                peer: peer.to_string(),
                timeout: self.timeout,
            }),
        }
    }
}

/// Runs `step` up to `times` times, pausing `interval` between two attempts.
async fn with_retry<T, F, Fut>(
    peer: &str,
    times: u32,
    interval: Duration,
    mut step: F,
) -> Result<T, StepError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StepError>>,
{
    let attempts = times.max(1);
    let mut attempt = 1;
    loop {
        match step().await {
            Ok(resp) => return Ok(resp),
            Err(err) if attempt < attempts => {
                debug!(
                    "attempt {}/{} with {} failed: {}",
                    attempt, attempts, peer, err
                );
                attempt += 1;
                sleep(interval).await;
            }
            Err(err) => {
                warn!("giving up on {} after {} attempts: {}", peer, attempts, err);
                return Err(StepError::Exhausted {
                    peer: peer.to_string(),
                    attempts,
                    last: Box::new(err),
                });
            }
        }
    }
}

#[async_trait]
impl StepRpc for StepClient {
    async fn step_train(&self, req: TrainRequest, peer: &str) -> Result<TrainResponse, StepError> {
        self.attempt(peer, self.transport.train(peer, req)).await
    }

    async fn step_train_with_retry(
        &self,
        req: TrainRequest,
        peer: &str,
        times: u32,
        interval: Duration,
    ) -> Result<TrainResponse, StepError> {
        with_retry(peer, times, interval, || self.step_train(req.clone(), peer)).await
    }

    async fn step_predict(
        &self,
        req: PredictRequest,
        peer: &str,
    ) -> Result<PredictResponse, StepError> {
        self.attempt(peer, self.transport.predict(peer, req)).await
    }

    async fn step_predict_with_retry(
        &self,
        req: PredictRequest,
        peer: &str,
        times: u32,
        interval: Duration,
    ) -> Result<PredictResponse, StepError> {
        with_retry(peer, times, interval, || self.step_predict(req.clone(), peer)).await
    }

    async fn validate_with_retry(
        &self,
        req: ValidateRequest,
        peer: &str,
        times: u32,
        interval: Duration,
    ) -> Result<(), StepError> {
        with_retry(peer, times, interval, || {
            self.attempt(peer, self.transport.validate(peer, req.clone()))
        })
        .await
    }
}
