//! Task descriptions, parameters and terminal results.

use std::collections::BTreeMap;

use derive_more::Display;
use displaydoc::Display as DisplayDoc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The vertical learning algorithms a task can run.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    #[display(fmt = "linear_regression_vl")]
    LinearRegressionVl,
    #[display(fmt = "logic_regression_vl")]
    LogicRegressionVl,
}

/// The kind of a task.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    #[display(fmt = "learn")]
    Learn,
    #[display(fmt = "predict")]
    Predict,
}

/// The lifecycle state of a registered task.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Registered, waiting for a worker slot.
    #[display(fmt = "pending")]
    Pending,
    /// The round protocol is running.
    #[display(fmt = "running")]
    Running,
    /// Training finished, evaluation sub-tasks are running.
    #[display(fmt = "evaluating")]
    Evaluating,
    /// Cancellation was requested.
    #[display(fmt = "stopping")]
    Stopping,
}

/// Regularization applied to the local weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegMode {
    None,
    L1,
    L2,
}

impl Default for RegMode {
    fn default() -> Self {
        RegMode::None
    }
}

/// Hyperparameters of a training task.
///
/// All parties of a task must agree on `alpha`, `amplitude`, `max_rounds`, `batch_size` and the
/// id column; `label` and `is_tag_part` are only meaningful on the party holding the labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainParams {
    /// Name of the label column (tag party only).
    pub label: String,
    /// Name of the sample id column.
    pub id_name: String,
    /// Whether this party holds the labels.
    pub is_tag_part: bool,
    pub reg_mode: RegMode,
    pub reg_param: f64,
    /// Learning rate.
    pub alpha: f64,
    /// Training stops once the loss changes by less than this between two rounds.
    pub amplitude: f64,
    /// Hard upper bound on the number of rounds.
    pub max_rounds: u64,
    /// Samples per round, `0` for full batch.
    pub batch_size: usize,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            label: String::new(),
            id_name: "id".into(),
            is_tag_part: false,
            reg_mode: RegMode::None,
            reg_param: 0.0,
            alpha: 0.1,
            amplitude: 1e-4,
            max_rounds: 100,
            batch_size: 0,
        }
    }
}

/// Evaluation strategies.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvaluationRule {
    #[display(fmt = "random_split")]
    RandomSplit,
    #[display(fmt = "cross_validation")]
    CrossVal,
    #[display(fmt = "leave_one_out")]
    LeaveOneOut,
}

/// Holdout settings for [`EvaluationRule::RandomSplit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomSplit {
    /// Percentage of samples left out of training.
    pub percent_lo: u32,
}

/// Fold settings for [`EvaluationRule::CrossVal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossValidation {
    pub folds: u32,
    pub shuffle: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationParams {
    pub enable: bool,
    pub rule: EvaluationRule,
    pub random_split: Option<RandomSplit>,
    pub cross_val: Option<CrossValidation>,
}

/// Parameters of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    pub algo: Algorithm,
    pub task_type: TaskType,
    /// Required for [`TaskType::Learn`].
    pub train_params: Option<TrainParams>,
    /// The serialized local model, required for [`TaskType::Predict`].
    pub model: Option<Vec<u8>>,
    pub eval_params: Option<EvaluationParams>,
}

impl TaskParams {
    /// Returns the evaluation parameters if evaluation is enabled.
    pub fn evaluation(&self) -> Option<&EvaluationParams> {
        self.eval_params.as_ref().filter(|eval| eval.enable)
    }
}

/// A request to start a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTaskRequest {
    pub task_id: String,
    /// The local feature slice, as CSV.
    pub file: Vec<u8>,
    /// The peers participating in the task.
    pub hosts: Vec<String>,
    pub params: TaskParams,
}

/// A request to stop a running task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopTaskRequest {
    pub task_id: String,
}

/// Errors for malformed tasks.
#[derive(Debug, DisplayDoc, Error, Clone, PartialEq, Eq)]
pub enum InvalidTask {
    /// The task id is empty.
    EmptyTaskId,
    /// The task has no peer hosts.
    NoHosts,
    /// The task lists itself or the same host twice.
    DuplicateHost,
    /// The data file is empty.
    EmptyFile,
    /// A learn task requires training parameters.
    MissingTrainParams,
    /// A predict task requires a model.
    MissingModel,
    /// Invalid training parameters: {0}.
    InvalidTrainParams(&'static str),
    /// Invalid evaluation parameters: {0}.
    InvalidEvaluation(&'static str),
}

/// A validated unit of orchestrated work.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub file: Vec<u8>,
    pub hosts: Vec<String>,
    pub params: TaskParams,
}

impl Task {
    /// Checks that the request is well formed and turns it into a task.
    ///
    /// # Errors
    /// Fails if a field required by the task type is missing or out of range.
    pub fn from_request(req: StartTaskRequest) -> Result<Self, InvalidTask> {
        let task = Self {
            id: req.task_id,
            file: req.file,
            hosts: req.hosts,
            params: req.params,
        };
        task.validate()?;
        Ok(task)
    }

    pub fn kind(&self) -> TaskType {
        self.params.task_type
    }

    pub fn algo(&self) -> Algorithm {
        self.params.algo
    }

    fn validate(&self) -> Result<(), InvalidTask> {
        if self.id.trim().is_empty() {
            return Err(InvalidTask::EmptyTaskId);
        }
        if self.hosts.is_empty() {
            return Err(InvalidTask::NoHosts);
        }
        let mut hosts = self.hosts.clone();
        hosts.sort();
        hosts.dedup();
        if hosts.len() != self.hosts.len() {
            return Err(InvalidTask::DuplicateHost);
        }
        if self.file.is_empty() {
            return Err(InvalidTask::EmptyFile);
        }

        match self.params.task_type {
            TaskType::Learn => {
                let params = self
                    .params
                    .train_params
                    .as_ref()
                    .ok_or(InvalidTask::MissingTrainParams)?;
                validate_train_params(params)?;
                if let Some(eval) = self.params.evaluation() {
                    validate_evaluation(eval)?;
                }
            }
            TaskType::Predict => {
                if self.params.model.as_ref().map_or(true, Vec::is_empty) {
                    return Err(InvalidTask::MissingModel);
                }
            }
        }
        Ok(())
    }
}

fn validate_train_params(params: &TrainParams) -> Result<(), InvalidTask> {
    if params.id_name.is_empty() {
        return Err(InvalidTask::InvalidTrainParams("id column name is empty"));
    }
    if params.is_tag_part && params.label.is_empty() {
        return Err(InvalidTask::InvalidTrainParams(
            "the tag party must name its label column",
        ));
    }
    if !(params.alpha > 0.0) {
        return Err(InvalidTask::InvalidTrainParams("alpha must be positive"));
    }
    if params.amplitude < 0.0 || params.reg_param < 0.0 {
        return Err(InvalidTask::InvalidTrainParams(
            "amplitude and reg_param must not be negative",
        ));
    }
    if params.max_rounds == 0 {
        return Err(InvalidTask::InvalidTrainParams("max_rounds must be at least 1"));
    }
    Ok(())
}

fn validate_evaluation(eval: &EvaluationParams) -> Result<(), InvalidTask> {
    match eval.rule {
        EvaluationRule::RandomSplit => {
            let split = eval
                .random_split
                .ok_or(InvalidTask::InvalidEvaluation("random split settings missing"))?;
            if split.percent_lo == 0 || split.percent_lo >= 100 {
                return Err(InvalidTask::InvalidEvaluation(
                    "percent_lo must be between 1 and 99",
                ));
            }
        }
        EvaluationRule::CrossVal => {
            let cv = eval
                .cross_val
                .ok_or(InvalidTask::InvalidEvaluation("cross validation settings missing"))?;
            if cv.folds < 2 {
                return Err(InvalidTask::InvalidEvaluation("folds must be at least 2"));
            }
        }
        EvaluationRule::LeaveOneOut => {}
    }
    Ok(())
}

/// Identifies the evaluation fold a prediction belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldTag {
    /// The training task that owns the evaluation.
    pub task_id: String,
    pub fold_idx: u32,
}

/// Scores of a single evaluation fold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldReport {
    pub fold_idx: u32,
    pub scores: BTreeMap<String, f64>,
    /// Set if the fold failed, in which case `scores` is empty.
    pub err_msg: Option<String>,
}

/// The aggregated outcome of an evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub rule: EvaluationRule,
    pub folds: Vec<FoldReport>,
    /// Mean of every metric over the successful folds.
    pub mean: BTreeMap<String, f64>,
}

impl EvaluationReport {
    /// Builds the report and averages the scores of the successful folds.
    pub fn new(rule: EvaluationRule, folds: Vec<FoldReport>) -> Self {
        let mut sums = BTreeMap::<String, (f64, u32)>::new();
        for fold in folds.iter().filter(|fold| fold.err_msg.is_none()) {
            for (metric, score) in &fold.scores {
                let entry = sums.entry(metric.clone()).or_insert((0.0, 0));
                entry.0 += score;
                entry.1 += 1;
            }
        }
        let mean = sums
            .into_iter()
            .map(|(metric, (sum, n))| (metric, sum / f64::from(n)))
            .collect();
        Self { rule, folds, mean }
    }

    pub fn failed_folds(&self) -> usize {
        self.folds.iter().filter(|f| f.err_msg.is_some()).count()
    }
}

/// The terminal outcome of a training task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainTaskResult {
    pub task_id: String,
    pub success: bool,
    /// The serialized local model, present iff `success`.
    pub model: Option<Vec<u8>>,
    /// Present iff evaluation was enabled, completed and this party is the scorer.
    pub eval_metric_scores: Option<EvaluationReport>,
    /// Present iff not `success`.
    pub err_msg: Option<String>,
}

impl TrainTaskResult {
    pub fn success(task_id: impl Into<String>, model: Vec<u8>) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            model: Some(model),
            eval_metric_scores: None,
            err_msg: None,
        }
    }

    pub fn failure(task_id: impl Into<String>, err_msg: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            model: None,
            eval_metric_scores: None,
            err_msg: Some(err_msg.into()),
        }
    }
}

/// The terminal outcome of a prediction task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictTaskResult {
    pub task_id: String,
    pub success: bool,
    pub outcomes: Vec<u8>,
    pub err_msg: Option<String>,
    /// Set for predictions run on behalf of an evaluation.
    pub fold: Option<FoldTag>,
}

impl PredictTaskResult {
    pub fn success(task_id: impl Into<String>, outcomes: Vec<u8>) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            outcomes,
            err_msg: None,
            fold: None,
        }
    }

    pub fn failure(task_id: impl Into<String>, err_msg: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            outcomes: Vec::new(),
            err_msg: Some(err_msg.into()),
            fold: None,
        }
    }

    pub fn with_fold(mut self, fold: Option<FoldTag>) -> Self {
        self.fold = fold;
        self
    }
}
