//! Sinks for the terminal outcomes of tasks.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::common::{PredictTaskResult, TrainTaskResult};

/// The error type of the model holder. Persisting is outside of the coordinator's domain, so any
/// error is accepted.
pub type HolderError = anyhow::Error;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
/// Persists models and prediction outcomes.
///
/// Every task hands exactly one result to the holder, successful or not. Errors are logged by
/// the coordinator and never retried.
pub trait ModelHolder: Send + Sync + 'static {
    /// Saves the result of a training task.
    async fn save_model(&self, result: TrainTaskResult) -> Result<(), HolderError>;

    /// Saves the result of a prediction task.
    ///
    /// # Behavior
    ///
    /// Never called for predictions that were run on behalf of an evaluation.
    async fn save_predict_out(&self, result: PredictTaskResult) -> Result<(), HolderError>;
}

#[derive(Debug, Default)]
struct Saved {
    models: Vec<TrainTaskResult>,
    predictions: Vec<PredictTaskResult>,
}

/// A model holder which keeps all results in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryHolder {
    inner: Arc<Mutex<Saved>>,
}

impl InMemoryHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the saved training results in the order they arrived.
    pub async fn models(&self) -> Vec<TrainTaskResult> {
        self.inner.lock().await.models.clone()
    }

    /// Returns the saved prediction results in the order they arrived.
    pub async fn predictions(&self) -> Vec<PredictTaskResult> {
        self.inner.lock().await.predictions.clone()
    }
}

#[async_trait]
impl ModelHolder for InMemoryHolder {
    async fn save_model(&self, result: TrainTaskResult) -> Result<(), HolderError> {
        self.inner.lock().await.models.push(result);
        Ok(())
    }

    async fn save_predict_out(&self, result: PredictTaskResult) -> Result<(), HolderError> {
        self.inner.lock().await.predictions.push(result);
        Ok(())
    }
}
