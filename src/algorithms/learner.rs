//! Vertical training by gradient descent.
//!
//! In every round each party sends the partial linear predictions of its features for the
//! samples of the round to every peer. The label holder sums the partials up, answers the
//! other parties with the prediction errors (the residual) and decides when training has
//! converged. Every party then updates the weights of its own features with the residual.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use super::{
    check_peer,
    dataset::{Dataset, Table},
    messages::RoundMessage,
    AlgorithmError,
    Link,
    PartyModel,
    PeerReply,
    Round,
    RoundProtocol,
};
use crate::common::{RegMode, Task, TrainParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// The partial of the current round has not been sent yet.
    Idle,
    /// Waiting for the answers of the peers.
    Sent,
    Finished,
}

#[derive(Debug, Clone)]
struct Residual {
    values: Vec<f64>,
    converged: bool,
    /// Only known to the label holder.
    loss: Option<f64>,
}

#[derive(Debug)]
struct RoundState {
    batch: Vec<usize>,
    partial: Vec<f64>,
    /// The partials of the peers, collected by the label holder.
    peers: HashMap<String, Vec<f64>>,
    residual: Option<Residual>,
    /// The peers whose round message has been answered.
    served: HashSet<String>,
}

/// The training protocol of one party.
pub struct Learner {
    local: String,
    hosts: Vec<String>,
    link: Link,
    params: TrainParams,
    data: Dataset,
    model: PartyModel,
    round: u64,
    phase: Phase,
    /// The current and the previous round.
    rounds: BTreeMap<u64, RoundState>,
    prev_loss: Option<f64>,
    final_round: Option<u64>,
}

impl Learner {
    pub fn new(local: &str, task: &Task) -> Result<Self, AlgorithmError> {
        let params = task
            .params
            .train_params
            .clone()
            .ok_or_else(|| AlgorithmError::Model("training parameters missing".into()))?;
        let label = if params.is_tag_part {
            Some(params.label.clone())
        } else {
            None
        };

        let table = Table::parse(&task.file)?;
        let mut data = Dataset::from_table(&table, &params.id_name, label.as_deref(), None)?;
        let (means, stds) = data.moments();
        data.standardize(&means, &stds);

        let model = PartyModel {
            algo: task.algo(),
            id_name: params.id_name.clone(),
            label,
            features: data.features.clone(),
            weights: vec![0.0; data.features.len()],
            intercept: 0.0,
            means,
            stds,
            rounds: 0,
        };
        Ok(Self {
            local: local.to_string(),
            hosts: task.hosts.clone(),
            link: Link::of(task.algo()),
            params,
            data,
            model,
            round: 0,
            phase: Phase::Idle,
            rounds: BTreeMap::new(),
            prev_loss: None,
            final_round: None,
        })
    }

    fn is_label_holder(&self) -> bool {
        self.data.labels.is_some()
    }

    fn batch(&self, round: u64) -> Vec<usize> {
        let n = self.data.len();
        let size = self.params.batch_size;
        if size == 0 || size >= n {
            return (0..n).collect();
        }
        let start = (round as usize).wrapping_mul(size) % n;
        (0..size).map(|i| (start + i) % n).collect()
    }

    /// Computes the partial of the current round with the current weights.
    fn ensure_round(&mut self) {
        if self.rounds.contains_key(&self.round) {
            return;
        }
        let batch = self.batch(self.round);
        let samples = Dataset {
            ids: Vec::new(),
            features: Vec::new(),
            rows: batch.iter().map(|idx| self.data.rows[*idx].clone()).collect(),
            labels: None,
        };
        let partial = self.model.partials(&samples);
        self.rounds.insert(
            self.round,
            RoundState {
                batch,
                partial,
                peers: HashMap::new(),
                residual: None,
                served: HashSet::new(),
            },
        );
    }

    fn state(&mut self, round: u64) -> Result<&mut RoundState, AlgorithmError> {
        self.rounds
            .get_mut(&round)
            .ok_or_else(|| AlgorithmError::Protocol(format!("round {} is gone", round)))
    }

    /// Computes the residual of a round once the partials of all peers are known.
    fn try_residual(&mut self, round: u64) -> Result<(), AlgorithmError> {
        let (labels, link, max_rounds, amplitude, prev_loss) = match &self.data.labels {
            Some(labels) => (
                labels,
                self.link,
                self.params.max_rounds,
                self.params.amplitude,
                self.prev_loss,
            ),
            None => return Ok(()),
        };
        let hosts = &self.hosts;
        let state = self
            .rounds
            .get_mut(&round)
            .ok_or_else(|| AlgorithmError::Protocol(format!("round {} is gone", round)))?;
        if state.residual.is_some() || !hosts.iter().all(|host| state.peers.contains_key(host)) {
            return Ok(());
        }

        let predictions = state
            .partial
            .iter()
            .enumerate()
            .map(|(i, own)| {
                let z = own + state.peers.values().map(|peer| peer[i]).sum::<f64>();
                link.apply(z)
            })
            .collect::<Vec<_>>();
        let targets = state
            .batch
            .iter()
            .map(|idx| labels[*idx])
            .collect::<Vec<_>>();
        let loss = link.loss(&predictions, &targets);
        let converged = round + 1 >= max_rounds
            || prev_loss.map_or(false, |prev| (prev - loss).abs() < amplitude);
        debug!("round {}: loss {:.6}, converged: {}", round, loss, converged);

        state.residual = Some(Residual {
            values: predictions
                .iter()
                .zip(&targets)
                .map(|(p, y)| p - y)
                .collect(),
            converged,
            loss: Some(loss),
        });
        Ok(())
    }

    /// Applies the gradient step of the current round.
    fn finish_round(&mut self) -> Result<(), AlgorithmError> {
        let round = self.round;
        let label_holder = self.is_label_holder();
        let state = self.state(round)?;
        let residual = state.residual.clone().ok_or_else(|| {
            if label_holder {
                AlgorithmError::Protocol(format!("round {} lacks partials of the peers", round))
            } else {
                AlgorithmError::Protocol(format!("round {} got no residual from a label holder", round))
            }
        })?;
        let batch = state.batch.clone();

        let m = batch.len().max(1) as f64;
        let TrainParams {
            alpha,
            reg_mode,
            reg_param,
            ..
        } = self.params;
        let rows = &self.data.rows;
        for (j, weight) in self.model.weights.iter_mut().enumerate() {
            let gradient = batch
                .iter()
                .zip(&residual.values)
                .map(|(idx, d)| rows[*idx][j] * d)
                .sum::<f64>()
                / m;
            let penalty = match reg_mode {
                RegMode::None => 0.0,
                RegMode::L1 => reg_param * weight.signum(),
                RegMode::L2 => reg_param * *weight,
            };
            *weight -= alpha * (gradient + penalty);
        }
        if label_holder {
            self.model.intercept -= alpha * residual.values.iter().sum::<f64>() / m;
            self.prev_loss = residual.loss;
        }
        self.model.rounds = round + 1;

        if residual.converged {
            debug!("training finished after {} rounds", round + 1);
            self.phase = Phase::Finished;
            self.final_round = Some(round);
        } else {
            self.round += 1;
            self.phase = Phase::Idle;
            let keep_from = round;
            self.rounds.retain(|r, _| *r >= keep_from);
        }
        Ok(())
    }

    /// Answers a peer for a round whose partial is known.
    fn reply(&mut self, round: u64, from: &str) -> Result<PeerReply, AlgorithmError> {
        let label_holder = self.is_label_holder();
        let state = self.state(round)?;
        let msg = if label_holder {
            match &state.residual {
                Some(residual) => RoundMessage::Residual {
                    round,
                    values: residual.values.clone(),
                    converged: residual.converged,
                },
                None => return Ok(PeerReply::NotYet),
            }
        } else {
            RoundMessage::Partial {
                round,
                values: state.partial.clone(),
            }
        };
        state.served.insert(from.to_string());
        Ok(PeerReply::Ready(msg.encode()?))
    }
}

fn check_len(round: &RoundState, values: &[f64], from: &str) -> Result<(), AlgorithmError> {
    if values.len() == round.batch.len() {
        Ok(())
    } else {
        Err(AlgorithmError::Protocol(format!(
            "{} sent {} values for a batch of {} samples",
            from,
            values.len(),
            round.batch.len()
        )))
    }
}

impl RoundProtocol for Learner {
    fn next_round(&mut self) -> Result<Round, AlgorithmError> {
        if self.phase == Phase::Sent {
            self.finish_round()?;
        }
        if self.phase == Phase::Finished {
            return Ok(Round::Done(self.model.to_bytes()?));
        }

        self.ensure_round();
        self.phase = Phase::Sent;
        let round = self.round;
        let values = self.state(round)?.partial.clone();
        Ok(Round::Send(RoundMessage::Partial { round, values }.encode()?))
    }

    fn handle_peer(&mut self, from: &str, payload: &[u8]) -> Result<PeerReply, AlgorithmError> {
        check_peer(&self.local, &self.hosts, from)?;
        let (round, values) = match RoundMessage::decode(payload)? {
            RoundMessage::Partial { round, values } => (round, values),
            RoundMessage::Residual { .. } => {
                return Err(AlgorithmError::Protocol(format!(
                    "{} sent a residual as a request",
                    from
                )))
            }
        };

        if let Some(last) = self.final_round {
            if round > last {
                return Err(AlgorithmError::Protocol(format!(
                    "{} is in round {} but training finished in round {}",
                    from, round, last
                )));
            }
        }
        if round > self.round {
            return Ok(PeerReply::NotYet);
        }
        if round == self.round {
            self.ensure_round();
        }

        let label_holder = self.is_label_holder();
        let state = self.state(round)?;
        check_len(state, &values, from)?;
        if label_holder {
            state.peers.insert(from.to_string(), values);
            self.try_residual(round)?;
        }
        self.reply(round, from)
    }

    fn absorb(&mut self, from: &str, payload: &[u8]) -> Result<(), AlgorithmError> {
        check_peer(&self.local, &self.hosts, from)?;
        let msg = RoundMessage::decode(payload)?;
        if self.phase != Phase::Sent || msg.round() != self.round {
            return Err(AlgorithmError::Protocol(format!(
                "unexpected answer from {} for round {}",
                from,
                msg.round()
            )));
        }

        let round = self.round;
        let label_holder = self.is_label_holder();
        let state = self.state(round)?;
        match msg {
            RoundMessage::Partial { values, .. } => {
                check_len(state, &values, from)?;
                if label_holder {
                    state.peers.insert(from.to_string(), values);
                }
            }
            RoundMessage::Residual {
                values, converged, ..
            } => {
                if label_holder {
                    return Err(AlgorithmError::Protocol(format!(
                        "{} claims to hold labels as well",
                        from
                    )));
                }
                check_len(state, &values, from)?;
                state.residual = Some(Residual {
                    values,
                    converged,
                    loss: None,
                });
            }
        }
        self.try_residual(round)
    }

    fn is_settled(&self) -> bool {
        self.final_round
            .and_then(|round| self.rounds.get(&round))
            .map_or(false, |state| {
                self.hosts.iter().all(|host| state.served.contains(host))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        algorithms::{Prediction, Predictor},
        common::{Algorithm, TaskParams, TaskType},
    };

    fn params(is_tag_part: bool) -> TrainParams {
        TrainParams {
            label: if is_tag_part { "y".into() } else { String::new() },
            id_name: "id".into(),
            is_tag_part,
            alpha: 0.3,
            amplitude: 1e-9,
            max_rounds: 400,
            ..TrainParams::default()
        }
    }

    fn task(algo: Algorithm, file: String, host: &str, is_tag_part: bool) -> Task {
        Task {
            id: "task".into(),
            file: file.into_bytes(),
            hosts: vec![host.to_string()],
            params: TaskParams {
                algo,
                task_type: TaskType::Learn,
                train_params: Some(params(is_tag_part)),
                model: None,
                eval_params: None,
            },
        }
    }

    /// y = 2 * x1 - x2 + 1, x1 on the label holder and x2 on the peer.
    fn linear_files() -> (String, String) {
        let mut a = "id,x1,y\n".to_string();
        let mut b = "id,x2\n".to_string();
        for i in 0..20 {
            let x1 = (i % 7) as f64;
            let x2 = ((i * 3) % 5) as f64;
            a.push_str(&format!("{},{},{}\n", i, x1, 2.0 * x1 - x2 + 1.0));
            b.push_str(&format!("{},{}\n", i, x2));
        }
        (a, b)
    }

    /// Runs both parties in lockstep and returns their final outputs.
    fn train_pair(a: &mut dyn RoundProtocol, b: &mut dyn RoundProtocol) -> (Vec<u8>, Vec<u8>) {
        loop {
            match (a.next_round().unwrap(), b.next_round().unwrap()) {
                (Round::Send(pa), Round::Send(pb)) => {
                    match b.handle_peer("a", &pa).unwrap() {
                        PeerReply::Ready(resp) => a.absorb("b", &resp).unwrap(),
                        PeerReply::NotYet => panic!("b could not answer"),
                    }
                    match a.handle_peer("b", &pb).unwrap() {
                        PeerReply::Ready(resp) => b.absorb("a", &resp).unwrap(),
                        PeerReply::NotYet => panic!("a could not answer"),
                    }
                }
                (Round::Done(ma), Round::Done(mb)) => {
                    assert!(a.is_settled());
                    assert!(b.is_settled());
                    return (ma, mb);
                }
                _ => panic!("parties disagree about the end of training"),
            }
        }
    }

    #[test]
    fn test_linear_regression_converges() {
        let (file_a, file_b) = linear_files();
        let mut a = Learner::new("a", &task(Algorithm::LinearRegressionVl, file_a.clone(), "b", true)).unwrap();
        let mut b = Learner::new("b", &task(Algorithm::LinearRegressionVl, file_b.clone(), "a", false)).unwrap();
        let (ma, mb) = train_pair(&mut a, &mut b);

        let model_a = PartyModel::from_bytes(&ma).unwrap();
        let model_b = PartyModel::from_bytes(&mb).unwrap();
        assert_eq!(model_a.rounds, model_b.rounds);
        assert_eq!(model_a.label.as_deref(), Some("y"));
        assert_eq!(model_b.intercept, 0.0);

        let predict = |file: String, model: Vec<u8>, host: &str| Task {
            id: "predict".into(),
            file: file.into_bytes(),
            hosts: vec![host.to_string()],
            params: TaskParams {
                algo: Algorithm::LinearRegressionVl,
                task_type: TaskType::Predict,
                train_params: None,
                model: Some(model),
                eval_params: None,
            },
        };
        let mut pa = Predictor::new("a", &predict(file_a, ma, "b")).unwrap();
        let mut pb = Predictor::new("b", &predict(file_b, mb, "a")).unwrap();
        let (oa, ob) = train_pair(&mut pa, &mut pb);
        assert_eq!(oa, ob);

        let prediction = Prediction::from_bytes(&oa).unwrap();
        let table = Table::parse(&linear_files().0.into_bytes()).unwrap();
        let labels = table.numeric_by_id("id", "y").unwrap();
        for (id, value) in prediction.ids.iter().zip(&prediction.values) {
            assert!((labels[id] - value).abs() < 1e-2, "{}: {} vs {}", id, labels[id], value);
        }
    }

    #[test]
    fn test_max_rounds_bounds_training() {
        let (file_a, file_b) = linear_files();
        let mut task_a = task(Algorithm::LinearRegressionVl, file_a, "b", true);
        task_a.params.train_params.as_mut().unwrap().max_rounds = 3;
        let mut a = Learner::new("a", &task_a).unwrap();
        let mut b = Learner::new("b", &task(Algorithm::LinearRegressionVl, file_b, "a", false)).unwrap();
        let (ma, _) = train_pair(&mut a, &mut b);
        assert_eq!(PartyModel::from_bytes(&ma).unwrap().rounds, 3);
    }

    #[test]
    fn test_logistic_regression_separates() {
        let mut file_a = "id,x1,y\n".to_string();
        let mut file_b = "id,x2\n".to_string();
        for i in 0..40 {
            let x1 = (i % 10) as f64 - 4.5;
            let x2 = ((i * 7) % 11) as f64 - 5.0;
            let y = if x1 + 0.5 * x2 > 0.0 { 1 } else { 0 };
            file_a.push_str(&format!("{},{},{}\n", i, x1, y));
            file_b.push_str(&format!("{},{}\n", i, x2));
        }
        let mut a = Learner::new("a", &task(Algorithm::LogicRegressionVl, file_a, "b", true)).unwrap();
        let mut b = Learner::new("b", &task(Algorithm::LogicRegressionVl, file_b, "a", false)).unwrap();
        let (ma, mb) = train_pair(&mut a, &mut b);
        let model_a = PartyModel::from_bytes(&ma).unwrap();
        let model_b = PartyModel::from_bytes(&mb).unwrap();
        assert!(model_a.weights[0] > 0.0);
        assert!(model_b.weights[0] > 0.0);
    }

    #[test]
    fn test_early_round_messages_are_parked() {
        let (file_a, file_b) = linear_files();
        let mut a = Learner::new("a", &task(Algorithm::LinearRegressionVl, file_a, "b", true)).unwrap();
        let mut b = Learner::new("b", &task(Algorithm::LinearRegressionVl, file_b, "a", false)).unwrap();

        let early = RoundMessage::Partial {
            round: 1,
            values: vec![0.0; 20],
        }
        .encode()
        .unwrap();
        assert_eq!(a.handle_peer("b", &early).unwrap(), PeerReply::NotYet);

        // a residual can't be computed before the peer's partial is known
        let pa = match a.next_round().unwrap() {
            Round::Send(payload) => payload,
            Round::Done(_) => panic!("training finished early"),
        };
        assert!(!a.is_settled());
        let pb = match b.next_round().unwrap() {
            Round::Send(payload) => payload,
            Round::Done(_) => panic!("training finished early"),
        };
        let reply = a.handle_peer("b", &pb).unwrap();
        assert!(matches!(reply, PeerReply::Ready(_)));
        // repeated requests are answered again
        assert_eq!(a.handle_peer("b", &pb).unwrap(), reply);
        assert!(matches!(b.handle_peer("a", &pa).unwrap(), PeerReply::Ready(_)));
    }

    #[test]
    fn test_protocol_violations() {
        let (file_a, _) = linear_files();
        let mut a = Learner::new("a", &task(Algorithm::LinearRegressionVl, file_a.clone(), "b", true)).unwrap();
        let short = RoundMessage::Partial {
            round: 0,
            values: vec![0.0; 3],
        }
        .encode()
        .unwrap();
        assert!(a.handle_peer("b", &short).is_err());
        assert!(a.handle_peer("c", &short).is_err());
        assert!(a.handle_peer("a", &short).is_err());
        assert!(a.handle_peer("b", b"garbage").is_err());

        // a second label holder is detected by the residual it answers with
        let mut other = Learner::new("b", &task(Algorithm::LinearRegressionVl, file_a, "a", true)).unwrap();
        let _ = a.next_round().unwrap();
        let pb = match other.next_round().unwrap() {
            Round::Send(payload) => payload,
            Round::Done(_) => panic!("training finished early"),
        };
        let residual = match a.handle_peer("b", &pb).unwrap() {
            PeerReply::Ready(resp) => resp,
            PeerReply::NotYet => panic!("a could not answer"),
        };
        assert!(a.absorb("b", &residual).is_err());
    }
}
