//! Round exchange with the peers of a task.
//!
//! [`PeerTransport`] delivers the peer-facing requests to a host. [`StepRpc`] is the interface the
//! workers use to exchange one round with a peer. [`StepClient`] implements it on top of a
//! transport, adding a timeout per attempt and a retry policy.

pub mod client;
pub mod local;

use std::time::Duration;

use async_trait::async_trait;
use displaydoc::Display;
use thiserror::Error;

pub use self::{client::StepClient, local::LocalNetwork};
use crate::common::{
    PredictRequest,
    PredictResponse,
    TrainRequest,
    TrainResponse,
    ValidateRequest,
};

/// The error type of a transport. Transports are outside of the coordinator's domain, so any
/// error is accepted and treated as a failed attempt.
pub type TransportError = anyhow::Error;

#[async_trait]
/// Delivers requests to the coordinator of a peer.
pub trait PeerTransport: Send + Sync + 'static {
    /// Delivers a training round message to `host` and returns its answer.
    async fn train(&self, host: &str, req: TrainRequest) -> Result<TrainResponse, TransportError>;

    /// Delivers a prediction round message to `host` and returns its answer.
    async fn predict(
        &self,
        host: &str,
        req: PredictRequest,
    ) -> Result<PredictResponse, TransportError>;

    /// Delivers an evaluation report to `host`.
    async fn validate(&self, host: &str, req: ValidateRequest) -> Result<(), TransportError>;
}

/// Errors of a round exchange.
#[derive(Debug, Display, Error)]
pub enum StepError {
    /// Round exchange with {peer} timed out after {timeout:?}.
    Timeout { peer: String, timeout: Duration },
    /// Round exchange with {peer} failed: {reason}.
    Transport { peer: String, reason: String },
    /// Round exchange with {peer} failed after {attempts} attempts: {last}.
    Exhausted {
        peer: String,
        attempts: u32,
        last: Box<StepError>,
    },
}

/// How often and how fast a failed round exchange is repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The number of attempts, at least one is always made.
    pub times: u32,
    /// The pause between two attempts.
    pub interval: Duration,
}

impl RetryPolicy {
    /// The longest time a retried exchange can take if every attempt runs into `timeout`.
    pub fn budget(&self, timeout: Duration) -> Duration {
        (timeout + self.interval) * self.times.max(1)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
/// The round exchange used by the workers.
pub trait StepRpc: Send + Sync + 'static {
    /// Exchanges one training round with `peer`, bounded by the configured timeout.
    async fn step_train(&self, req: TrainRequest, peer: &str) -> Result<TrainResponse, StepError>;

    /// Exchanges one training round with `peer`.
    ///
    /// # Behavior
    ///
    /// - Makes up to `times` attempts, separated by `interval`.
    /// - Returns the first successful answer, or [`StepError::Exhausted`] wrapping the last error.
    async fn step_train_with_retry(
        &self,
        req: TrainRequest,
        peer: &str,
        times: u32,
        interval: Duration,
    ) -> Result<TrainResponse, StepError>;

    /// Exchanges one prediction round with `peer`, bounded by the configured timeout.
    async fn step_predict(
        &self,
        req: PredictRequest,
        peer: &str,
    ) -> Result<PredictResponse, StepError>;

    /// Exchanges one prediction round with `peer`. Retries like
    /// [`step_train_with_retry()`](StepRpc::step_train_with_retry).
    async fn step_predict_with_retry(
        &self,
        req: PredictRequest,
        peer: &str,
        times: u32,
        interval: Duration,
    ) -> Result<PredictResponse, StepError>;

    /// Delivers an evaluation report to `peer`. Retries like
    /// [`step_train_with_retry()`](StepRpc::step_train_with_retry).
    async fn validate_with_retry(
        &self,
        req: ValidateRequest,
        peer: &str,
        times: u32,
        interval: Duration,
    ) -> Result<(), StepError>;
}
