//! The round payloads the parties exchange, encoded with bincode.

use serde::{Deserialize, Serialize};

use super::AlgorithmError;

/// A round payload of the built-in algorithms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoundMessage {
    /// The partial linear predictions of a party for the samples of a round.
    Partial { round: u64, values: Vec<f64> },
    /// The prediction errors of a round, computed by the label holder.
    Residual {
        round: u64,
        values: Vec<f64>,
        converged: bool,
    },
}

impl RoundMessage {
    pub fn round(&self) -> u64 {
        match self {
            RoundMessage::Partial { round, .. } | RoundMessage::Residual { round, .. } => *round,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, AlgorithmError> {
        bincode::serialize(self).map_err(|err| AlgorithmError::Codec(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AlgorithmError> {
        bincode::deserialize(bytes).map_err(|err| AlgorithmError::Codec(err.to_string()))
    }
}
