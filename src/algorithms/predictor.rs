//! Vertical prediction.
//!
//! A single round: every party sends the partial linear predictions of its features to every
//! peer, then each party sums up all partials and applies the link function.

use std::collections::{HashMap, HashSet};

use super::{
    check_peer,
    dataset::{Dataset, Table},
    messages::RoundMessage,
    AlgorithmError,
    Link,
    PartyModel,
    PeerReply,
    Prediction,
    Round,
    RoundProtocol,
};
use crate::common::Task;

/// The prediction protocol of one party.
pub struct Predictor {
    local: String,
    hosts: Vec<String>,
    link: Link,
    ids: Vec<String>,
    partial: Vec<f64>,
    peers: HashMap<String, Vec<f64>>,
    served: HashSet<String>,
    sent: bool,
    outcome: Option<Vec<u8>>,
}

impl Predictor {
    pub fn new(local: &str, task: &Task) -> Result<Self, AlgorithmError> {
        let bytes = task
            .params
            .model
            .as_ref()
            .ok_or_else(|| AlgorithmError::Model("model missing".into()))?;
        let model = PartyModel::from_bytes(bytes)?;
        if model.algo != task.algo() {
            return Err(AlgorithmError::Model(format!(
                "the model was trained with {}",
                model.algo
            )));
        }

        let table = Table::parse(&task.file)?;
        let mut data = Dataset::from_table(&table, &model.id_name, None, Some(&model.features))?;
        data.standardize(&model.means, &model.stds);
        let partial = model.partials(&data);
        Ok(Self {
            local: local.to_string(),
            hosts: task.hosts.clone(),
            link: Link::of(model.algo),
            ids: data.ids,
            partial,
            peers: HashMap::new(),
            served: HashSet::new(),
            sent: false,
            outcome: None,
        })
    }

    fn record(&mut self, from: &str, msg: RoundMessage) -> Result<(), AlgorithmError> {
        match msg {
            RoundMessage::Partial { round: 0, values } if values.len() == self.partial.len() => {
                self.peers.insert(from.to_string(), values);
                Ok(())
            }
            RoundMessage::Partial { round: 0, values } => Err(AlgorithmError::Protocol(format!(
                "{} predicted {} samples, expected {}",
                from,
                values.len(),
                self.partial.len()
            ))),
            msg => Err(AlgorithmError::Protocol(format!(
                "unexpected message for round {} from {}",
                msg.round(),
                from
            ))),
        }
    }
}

impl RoundProtocol for Predictor {
    fn next_round(&mut self) -> Result<Round, AlgorithmError> {
        if let Some(outcome) = &self.outcome {
            return Ok(Round::Done(outcome.clone()));
        }
        if !self.sent {
            self.sent = true;
            let values = self.partial.clone();
            return Ok(Round::Send(RoundMessage::Partial { round: 0, values }.encode()?));
        }

        let peers = self
            .hosts
            .iter()
            .map(|host| {
                self.peers.get(host).ok_or_else(|| {
                    AlgorithmError::Protocol(format!("no partial received from {}", host))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let values = self
            .partial
            .iter()
            .enumerate()
            .map(|(i, own)| self.link.apply(own + peers.iter().map(|peer| peer[i]).sum::<f64>()))
            .collect();
        let outcome = Prediction {
            ids: self.ids.clone(),
            values,
        }
        .to_bytes()?;
        self.outcome = Some(outcome.clone());
        Ok(Round::Done(outcome))
    }

    fn handle_peer(&mut self, from: &str, payload: &[u8]) -> Result<PeerReply, AlgorithmError> {
        check_peer(&self.local, &self.hosts, from)?;
        self.record(from, RoundMessage::decode(payload)?)?;
        self.served.insert(from.to_string());
        let values = self.partial.clone();
        Ok(PeerReply::Ready(
            RoundMessage::Partial { round: 0, values }.encode()?,
        ))
    }

    fn absorb(&mut self, from: &str, payload: &[u8]) -> Result<(), AlgorithmError> {
        check_peer(&self.local, &self.hosts, from)?;
        self.record(from, RoundMessage::decode(payload)?)
    }

    fn is_settled(&self) -> bool {
        self.hosts.iter().all(|host| self.served.contains(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Algorithm, TaskParams, TaskType};

    fn model(algo: Algorithm) -> Vec<u8> {
        PartyModel {
            algo,
            id_name: "id".into(),
            label: None,
            features: vec!["x".into()],
            weights: vec![2.0],
            intercept: 0.0,
            means: vec![1.0],
            stds: vec![1.0],
            rounds: 1,
        }
        .to_bytes()
        .unwrap()
    }

    fn task(algo: Algorithm, model: Vec<u8>) -> Task {
        Task {
            id: "predict".into(),
            // extra columns like labels are ignored
            file: b"id,x,y\n2,3,0\n1,1,0\n".to_vec(),
            hosts: vec!["b".into()],
            params: TaskParams {
                algo,
                task_type: TaskType::Predict,
                train_params: None,
                model: Some(model),
                eval_params: None,
            },
        }
    }

    #[test]
    fn test_predict_sums_partials() {
        let mut a = Predictor::new("a", &task(Algorithm::LinearRegressionVl, model(Algorithm::LinearRegressionVl))).unwrap();
        assert!(matches!(a.next_round().unwrap(), Round::Send(_)));

        let peer = RoundMessage::Partial {
            round: 0,
            values: vec![0.5, -1.0],
        }
        .encode()
        .unwrap();
        assert!(!a.is_settled());
        assert!(matches!(a.handle_peer("b", &peer).unwrap(), PeerReply::Ready(_)));
        assert!(a.is_settled());
        a.absorb("b", &peer).unwrap();

        let outcome = match a.next_round().unwrap() {
            Round::Done(outcome) => Prediction::from_bytes(&outcome).unwrap(),
            Round::Send(_) => panic!("prediction takes a single round"),
        };
        assert_eq!(outcome.ids, vec!["1", "2"]);
        assert_eq!(outcome.values, vec![0.5, 3.0]);
    }

    #[test]
    fn test_missing_partial_fails() {
        let mut a = Predictor::new("a", &task(Algorithm::LinearRegressionVl, model(Algorithm::LinearRegressionVl))).unwrap();
        let _ = a.next_round().unwrap();
        assert!(a.next_round().is_err());
    }

    #[test]
    fn test_model_must_match_algorithm() {
        assert!(Predictor::new("a", &task(Algorithm::LogicRegressionVl, model(Algorithm::LinearRegressionVl))).is_err());
        assert!(Predictor::new("a", &task(Algorithm::LinearRegressionVl, b"{}".to_vec())).is_err());
    }
}
