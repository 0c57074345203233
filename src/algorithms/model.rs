//! The trained models, stored as JSON so a model holder can inspect them.

use serde::{Deserialize, Serialize};

use super::{dataset::Dataset, AlgorithmError};
use crate::common::Algorithm;

/// The local share of a trained vertical model.
///
/// Each party only holds the weights of its own features. The label holder additionally holds
/// the intercept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyModel {
    pub algo: Algorithm,
    pub id_name: String,
    /// Set on the label holder.
    pub label: Option<String>,
    pub features: Vec<String>,
    pub weights: Vec<f64>,
    pub intercept: f64,
    /// Standardization applied to the features before weighting.
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
    /// The number of rounds the model was trained for.
    pub rounds: u64,
}

impl PartyModel {
    pub fn to_bytes(&self) -> Result<Vec<u8>, AlgorithmError> {
        serde_json::to_vec(self).map_err(|err| AlgorithmError::Model(err.to_string()))
    }

    /// Decodes a model and checks its dimensions.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AlgorithmError> {
        let model: Self =
            serde_json::from_slice(bytes).map_err(|err| AlgorithmError::Model(err.to_string()))?;
        let dims = model.features.len();
        if model.weights.len() != dims || model.means.len() != dims || model.stds.len() != dims {
            return Err(AlgorithmError::Model("dimensions don't match the features".into()));
        }
        Ok(model)
    }

    /// The local partial linear predictions for standardized samples.
    pub fn partials(&self, data: &Dataset) -> Vec<f64> {
        data.rows
            .iter()
            .map(|row| {
                self.intercept
                    + row
                        .iter()
                        .zip(&self.weights)
                        .map(|(x, w)| x * w)
                        .sum::<f64>()
            })
            .collect()
    }
}

/// The outcome of a prediction task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub ids: Vec<String>,
    /// Predicted values for regressions, probabilities of the positive class for classifications.
    pub values: Vec<f64>,
}

impl Prediction {
    pub fn to_bytes(&self) -> Result<Vec<u8>, AlgorithmError> {
        serde_json::to_vec(self).map_err(|err| AlgorithmError::Model(err.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AlgorithmError> {
        let prediction: Self =
            serde_json::from_slice(bytes).map_err(|err| AlgorithmError::Model(err.to_string()))?;
        if prediction.ids.len() != prediction.values.len() {
            return Err(AlgorithmError::Model("ids and values don't match".into()));
        }
        Ok(prediction)
    }
}
