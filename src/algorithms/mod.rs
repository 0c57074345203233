//! Round algorithms.
//!
//! The orchestration layer drives a [`RoundProtocol`] without knowing what its payloads mean.
//! The built-in [`VerticalAlgorithms`] provide vertical linear and logistic regression trained by
//! gradient descent over the exchanged partial predictions of the parties.

pub mod dataset;
pub mod learner;
pub mod messages;
pub mod model;
pub mod predictor;

use displaydoc::Display;
use thiserror::Error;

pub use self::{
    learner::Learner,
    model::{PartyModel, Prediction},
    predictor::Predictor,
};
use crate::common::{Algorithm, Task};

/// Errors of a round algorithm.
#[derive(Debug, Display, Error, Clone, PartialEq)]
pub enum AlgorithmError {
    /// Invalid data: {0}.
    Dataset(String),
    /// Invalid model: {0}.
    Model(String),
    /// Protocol violation: {0}.
    Protocol(String),
    /// Invalid round message: {0}.
    Codec(String),
}

/// The next step of a local protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Round {
    /// Send the payload to every peer and absorb their answers.
    Send(Vec<u8>),
    /// The protocol is finished. Holds the serialized model or prediction outcome.
    Done(Vec<u8>),
}

/// The answer to a round message of a peer.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerReply {
    Ready(Vec<u8>),
    /// The message can't be answered in the current local state. It must be offered again after
    /// the next local state change.
    NotYet,
}

/// The local side of a multi-round protocol between the parties of a task.
///
/// Rounds are strictly sequential: [`next_round()`] is called again only after the answers of
/// all peers to the previous payload have been absorbed.
///
/// [`next_round()`]: RoundProtocol::next_round
pub trait RoundProtocol: Send {
    /// Completes the current round and starts the next one.
    fn next_round(&mut self) -> Result<Round, AlgorithmError>;

    /// Answers a round message sent by the peer `from`.
    fn handle_peer(&mut self, from: &str, payload: &[u8]) -> Result<PeerReply, AlgorithmError>;

    /// Absorbs the answer of the peer `from` to the payload of the current round.
    fn absorb(&mut self, from: &str, payload: &[u8]) -> Result<(), AlgorithmError>;

    /// Whether every peer has been answered for the final round.
    fn is_settled(&self) -> bool;
}

/// Creates the local protocols of tasks.
pub trait AlgorithmProvider: Send + Sync + 'static {
    /// Creates the training protocol of `task` for the party reachable at `address`.
    fn learner(&self, address: &str, task: &Task) -> Result<Box<dyn RoundProtocol>, AlgorithmError>;

    /// Creates the prediction protocol of `task` for the party reachable at `address`.
    fn predictor(
        &self,
        address: &str,
        task: &Task,
    ) -> Result<Box<dyn RoundProtocol>, AlgorithmError>;
}

/// The inverse link function of a generalized linear model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Identity,
    Logistic,
}

impl Link {
    pub fn of(algo: Algorithm) -> Self {
        match algo {
            Algorithm::LinearRegressionVl => Link::Identity,
            Algorithm::LogicRegressionVl => Link::Logistic,
        }
    }

    pub fn apply(self, z: f64) -> f64 {
        match self {
            Link::Identity => z,
            Link::Logistic => 1.0 / (1.0 + (-z).exp()),
        }
    }

    /// The mean loss of the predictions `p` for the labels `y`.
    pub fn loss(self, p: &[f64], y: &[f64]) -> f64 {
        let n = p.len().max(1) as f64;
        match self {
            Link::Identity => p.iter().zip(y).map(|(p, y)| (p - y).powi(2)).sum::<f64>() / (2.0 * n),
            Link::Logistic => {
                -p.iter()
                    .zip(y)
                    .map(|(p, y)| {
                        let p = p.max(1e-12).min(1.0 - 1e-12);
                        y * p.ln() + (1.0 - y) * (1.0 - p).ln()
                    })
                    .sum::<f64>()
                    / n
            }
        }
    }
}

/// Rejects round messages which don't come from a peer of the task.
fn check_peer(local: &str, hosts: &[String], from: &str) -> Result<(), AlgorithmError> {
    if from == local {
        return Err(AlgorithmError::Protocol(format!(
            "{} received a round message from itself",
            local
        )));
    }
    if !hosts.iter().any(|host| host == from) {
        return Err(AlgorithmError::Protocol(format!(
            "{} is not a host of the task",
            from
        )));
    }
    Ok(())
}

/// The built-in vertical regression algorithms.
#[derive(Debug, Default, Clone, Copy)]
pub struct VerticalAlgorithms;

impl AlgorithmProvider for VerticalAlgorithms {
    fn learner(&self, address: &str, task: &Task) -> Result<Box<dyn RoundProtocol>, AlgorithmError> {
        Ok(Box::new(Learner::new(address, task)?))
    }

    fn predictor(
        &self,
        address: &str,
        task: &Task,
    ) -> Result<Box<dyn RoundProtocol>, AlgorithmError> {
        Ok(Box::new(Predictor::new(address, task)?))
    }
}
