//! Messages exchanged between the coordinators of the parties of a task.
//!
//! The round payloads are opaque to the orchestration layer. They are produced and consumed by
//! the [`RoundProtocol`] of the task.
//!
//! [`RoundProtocol`]: crate::algorithms::RoundProtocol

use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::task::{Algorithm, PredictTaskResult};

/// A round message of a training task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainRequest {
    pub task_id: String,
    pub algo: Algorithm,
    /// The address of the sending party.
    pub from: String,
    pub payload: Vec<u8>,
}

/// The answer to a [`TrainRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainResponse {
    pub task_id: String,
    pub payload: Vec<u8>,
}

/// A round message of a prediction task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictRequest {
    pub task_id: String,
    pub algo: Algorithm,
    /// The address of the sending party.
    pub from: String,
    pub payload: Vec<u8>,
}

/// The answer to a [`PredictRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    pub task_id: String,
    pub payload: Vec<u8>,
}

/// The role a party plays in an evaluation.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvaluatorRole {
    /// The label holder. Scores the folds and confirms them to the other parties.
    #[display(fmt = "Evaluator_NORMAL")]
    Normal,
    /// A predict-only participant.
    #[display(fmt = "Evaluator_LIVE")]
    Live,
}

/// Delivers the prediction outcome of an evaluation fold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidateRequest {
    /// The training task that owns the evaluation.
    pub task_id: String,
    pub from: EvaluatorRole,
    pub fold_idx: u32,
    pub predict_result: PredictTaskResult,
}
