//! Scores of predictions against the true labels.

use std::collections::{BTreeMap, HashMap};

use crate::{
    algorithms::{AlgorithmError, Prediction},
    common::Algorithm,
};

/// The scores of a fold, keyed by metric name.
pub type Scores = BTreeMap<String, f64>;

/// Scores a prediction outcome against the labels of the label holder.
///
/// Regressions get `RMSE`, `MAE`, `MSE` and `R2`. Classifications get `Accuracy`, `Precision`,
/// `Recall` and `F1`, with probabilities from `0.5` counting as positive.
pub fn score(
    algo: Algorithm,
    outcomes: &[u8],
    labels: &HashMap<String, f64>,
) -> Result<Scores, AlgorithmError> {
    let prediction = Prediction::from_bytes(outcomes)?;
    if prediction.ids.is_empty() {
        return Err(AlgorithmError::Dataset("nothing was predicted".into()));
    }
    let actual = prediction
        .ids
        .iter()
        .map(|id| {
            labels
                .get(id)
                .copied()
                .ok_or_else(|| AlgorithmError::Dataset(format!("no label for sample {}", id)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(match algo {
        Algorithm::LinearRegressionVl => regression(&prediction.values, &actual),
        Algorithm::LogicRegressionVl => classification(&prediction.values, &actual),
    })
}

fn regression(predicted: &[f64], actual: &[f64]) -> Scores {
    let n = actual.len() as f64;
    let mse = predicted
        .iter()
        .zip(actual)
        .map(|(p, y)| (p - y).powi(2))
        .sum::<f64>()
        / n;
    let mae = predicted
        .iter()
        .zip(actual)
        .map(|(p, y)| (p - y).abs())
        .sum::<f64>()
        / n;
    let mean = actual.iter().sum::<f64>() / n;
    let total = actual.iter().map(|y| (y - mean).powi(2)).sum::<f64>();
    let r2 = if total > 0.0 {
        1.0 - mse * n / total
    } else {
        0.0
    };

    let mut scores = Scores::new();
    scores.insert("RMSE".into(), mse.sqrt());
    scores.insert("MAE".into(), mae);
    scores.insert("MSE".into(), mse);
    scores.insert("R2".into(), r2);
    scores
}

fn classification(probabilities: &[f64], actual: &[f64]) -> Scores {
    let (mut tp, mut fp, mut tn, mut fne) = (0.0, 0.0, 0.0, 0.0);
    for (p, y) in probabilities.iter().zip(actual) {
        match (*p >= 0.5, *y >= 0.5) {
            (true, true) => tp += 1.0,
            (true, false) => fp += 1.0,
            (false, false) => tn += 1.0,
            (false, true) => fne += 1.0,
        }
    }
    let ratio = |a: f64, b: f64| if b > 0.0 { a / b } else { 0.0 };
    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fne);

    let mut scores = Scores::new();
    scores.insert("Accuracy".into(), ratio(tp + tn, tp + tn + fp + fne));
    scores.insert("Precision".into(), precision);
    scores.insert("Recall".into(), recall);
    scores.insert("F1".into(), ratio(2.0 * precision * recall, precision + recall));
    scores
}
