//! Evaluation of trained models.
//!
//! An evaluation runs on every party of a training task. The samples are partitioned into folds
//! (see [`split`]), and for every fold the parties jointly train a model on the training part
//! (cross validation and leave-one-out only) and predict the holdout part with sub-tasks that
//! run through the regular worker pools.
//!
//! The label holder plays the [`EvaluatorRole::Normal`] role: it scores the prediction of every
//! fold and confirms the fold to all other parties with a [`ValidateRequest`]. The other parties
//! play the [`EvaluatorRole::Live`] role: they take part in the sub-tasks and wait for the
//! confirmations, but never report scores.
//!
//! The local prediction of a fold reaches its evaluation through [`Evaluator::deliver`], which
//! is how the local party validates its own folds. [`Evaluator::validate`] only serves the
//! confirmations of the peers.

pub mod metrics;
pub mod split;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use displaydoc::Display;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::{
    metrics::Scores,
    split::{EvalPlan, SplitError},
};
use crate::{
    algorithms::{dataset::Table, AlgorithmError},
    common::{
        EvaluationParams,
        EvaluationReport,
        EvaluationRule,
        EvaluatorRole,
        FoldReport,
        FoldTag,
        PredictTaskResult,
        Task,
        TaskParams,
        TaskType,
        TrainParams,
        ValidateRequest,
    },
    coordinator::requests::{Origin, RequestSender, StartTaskError},
    rpc::{RetryPolicy, StepError, StepRpc},
};

/// Errors of a `validate` request.
#[derive(Debug, Display, Error, Clone, PartialEq)]
pub enum ValidateError {
    /// No evaluation of task {0} is running.
    UnknownEvaluation(String),
    /// Fold {fold_idx} is out of range, the evaluation has {folds} folds.
    FoldOutOfRange { fold_idx: u32, folds: u32 },
    /// Unsolicited {0} report.
    UnsolicitedReport(EvaluatorRole),
    /// Fold {0} has already been confirmed.
    DuplicateReport(u32),
    /// The coordinator is not accepting requests.
    NotAccepting,
}

/// Errors which abort an evaluation.
#[derive(Debug, Display, Error)]
pub enum EvaluationError {
    /// The evaluation was cancelled.
    Cancelled,
    /// {0}
    Split(#[from] SplitError),
    /// {0}
    Data(#[from] AlgorithmError),
    /// Task {0} is already being evaluated.
    AlreadyRunning(String),
}

/// Errors which fail a single fold.
#[derive(Debug, Display, Error)]
enum FoldError {
    /// Failed to start a sub-task: {0}.
    Start(#[from] StartTaskError),
    /// Sub-task {0} failed: {1}.
    SubTask(String, String),
    /// A sub-task ended without a result.
    Dropped,
    /// {0}
    Data(#[from] AlgorithmError),
    /// Failed to confirm the fold: {0}.
    Confirm(#[from] StepError),
    /// The label holder did not confirm the fold in time.
    NotConfirmed,
    /// The evaluation was cancelled.
    Cancelled,
}

#[derive(Debug)]
enum FoldEvent {
    /// The local prediction sub-task of a fold finished.
    Predicted(u32, PredictTaskResult),
    /// The label holder confirmed a fold.
    Confirmed(u32),
}

#[derive(Debug)]
struct Context {
    role: EvaluatorRole,
    folds: u32,
    confirmed: HashSet<u32>,
    events: mpsc::UnboundedSender<FoldEvent>,
}

/// Runs evaluations and accepts the fold reports of the peers.
#[derive(Clone)]
pub(crate) struct Evaluator {
    contexts: Arc<Mutex<HashMap<String, Context>>>,
    rpc: Arc<dyn StepRpc>,
    retry: RetryPolicy,
    /// How long a live party waits for the confirmation of a fold.
    confirm_wait: Duration,
    requests: RequestSender,
}

/// Partitions the samples of a training task.
///
/// Returns the task the main training runs on together with the folds. For a random split the
/// holdout samples are removed from the training task.
pub(crate) fn prepare(
    task: &Task,
    params: &EvaluationParams,
) -> Result<(Task, EvalPlan), EvaluationError> {
    let id_name = &train_params(task)?.id_name;
    let table = Table::parse(&task.file)?;
    let plan = split::plan(&task.id, table.ids(id_name)?, params)?;

    let training = match plan.rule {
        EvaluationRule::RandomSplit => Task {
            file: subset(&table, id_name, &plan.folds[0].train)?,
            ..task.clone()
        },
        EvaluationRule::CrossVal | EvaluationRule::LeaveOneOut => task.clone(),
    };
    Ok((training, plan))
}

fn train_params(task: &Task) -> Result<&TrainParams, AlgorithmError> {
    task.params
        .train_params
        .as_ref()
        .ok_or_else(|| AlgorithmError::Model("training parameters missing".into()))
}

fn subset(table: &Table, id_name: &str, ids: &[String]) -> Result<Vec<u8>, AlgorithmError> {
    let ids = ids.iter().cloned().collect::<HashSet<_>>();
    Ok(table.retain_ids(id_name, &ids)?.to_csv())
}

impl Evaluator {
    pub fn new(
        rpc: Arc<dyn StepRpc>,
        retry: RetryPolicy,
        confirm_wait: Duration,
        requests: RequestSender,
    ) -> Self {
        Self {
            contexts: Arc::new(Mutex::new(HashMap::new())),
            rpc,
            retry,
            confirm_wait,
            requests,
        }
    }

    /// Evaluates the model of a training task.
    ///
    /// Returns the report on the label holder and `None` on every other party. Failed folds are
    /// part of the report.
    ///
    /// # Errors
    /// Fails if the evaluation was cancelled or couldn't be set up.
    pub async fn evaluate(
        &self,
        task: &Task,
        plan: EvalPlan,
        model: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Option<EvaluationReport>, EvaluationError> {
        let params = train_params(task)?;
        let role = if params.is_tag_part {
            EvaluatorRole::Normal
        } else {
            EvaluatorRole::Live
        };
        let table = Table::parse(&task.file)?;
        let labels = match role {
            EvaluatorRole::Normal => table.numeric_by_id(&params.id_name, &params.label)?,
            EvaluatorRole::Live => HashMap::new(),
        };

        let (events_tx, events) = mpsc::unbounded_channel();
        {
            let mut contexts = self.contexts.lock().await;
            if contexts.contains_key(&task.id) {
                return Err(EvaluationError::AlreadyRunning(task.id.clone()));
            }
            contexts.insert(
                task.id.clone(),
                Context {
                    role,
                    folds: plan.folds(),
                    confirmed: HashSet::new(),
                    events: events_tx,
                },
            );
        }
        info!(
            "evaluating {} folds ({}) as {}",
            plan.folds(),
            plan.rule,
            role
        );

        let mut session = Session {
            evaluator: self,
            task,
            params,
            role,
            table: &table,
            labels: &labels,
            cancel,
            events,
            pending: HashMap::new(),
        };
        let mut reports = Vec::with_capacity(plan.folds.len());
        let mut cancelled = false;
        for (idx, fold) in plan.folds.iter().enumerate() {
            let fold_idx = idx as u32;
            let model = match plan.rule {
                EvaluationRule::RandomSplit => Ok(model.to_vec()),
                _ => session.train_fold(fold_idx, &fold.train).await,
            };
            let scores = match model {
                Ok(model) => session.evaluate_fold(fold_idx, &fold.holdout, model).await,
                Err(err) => Err(err),
            };
            match scores {
                Ok(scores) => {
                    debug!("fold {} done", fold_idx);
                    reports.push(FoldReport {
                        fold_idx,
                        scores,
                        err_msg: None,
                    });
                }
                Err(FoldError::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(err) => {
                    warn!("fold {} failed: {}", fold_idx, err);
                    reports.push(FoldReport {
                        fold_idx,
                        scores: BTreeMap::new(),
                        err_msg: Some(err.to_string()),
                    });
                }
            }
        }
        self.contexts.lock().await.remove(&task.id);
        if cancelled {
            return Err(EvaluationError::Cancelled);
        }

        let report = EvaluationReport::new(plan.rule, reports);
        match role {
            EvaluatorRole::Normal => {
                info!(
                    "evaluation finished, {} of {} folds failed, mean scores: {:?}",
                    report.failed_folds(),
                    report.folds.len(),
                    report.mean
                );
                Ok(Some(report))
            }
            EvaluatorRole::Live => Ok(None),
        }
    }

    /// Hands the local prediction result of a fold to its evaluation, which handles it in the
    /// local role.
    pub async fn deliver(&self, tag: FoldTag, result: PredictTaskResult) {
        let contexts = self.contexts.lock().await;
        match contexts.get(&tag.task_id) {
            Some(ctx) if tag.fold_idx < ctx.folds => {
                let _ = ctx.events.send(FoldEvent::Predicted(tag.fold_idx, result));
            }
            _ => warn!(
                "evaluation of {} is closed, dropping the result of fold {}",
                tag.task_id, tag.fold_idx
            ),
        }
    }

    /// Accepts the confirmation of a fold by the label holder.
    ///
    /// # Errors
    /// Fails if no evaluation of the task is running, the fold is out of range, the local party
    /// is the label holder itself, the report doesn't come from a label holder or the fold has
    /// already been confirmed.
    pub async fn validate(&self, req: ValidateRequest) -> Result<(), ValidateError> {
        let mut contexts = self.contexts.lock().await;
        let ctx = contexts
            .get_mut(&req.task_id)
            .ok_or_else(|| ValidateError::UnknownEvaluation(req.task_id.clone()))?;
        if req.fold_idx >= ctx.folds {
            return Err(ValidateError::FoldOutOfRange {
                fold_idx: req.fold_idx,
                folds: ctx.folds,
            });
        }
        if ctx.role == EvaluatorRole::Normal || req.from == EvaluatorRole::Live {
            return Err(ValidateError::UnsolicitedReport(req.from));
        }
        if !ctx.confirmed.insert(req.fold_idx) {
            return Err(ValidateError::DuplicateReport(req.fold_idx));
        }
        debug!("fold {} of {} confirmed", req.fold_idx, req.task_id);
        ctx.events
            .send(FoldEvent::Confirmed(req.fold_idx))
            .map_err(|_| ValidateError::UnknownEvaluation(req.task_id))
    }
}

#[derive(Debug, Default)]
struct PendingFold {
    predicted: Option<PredictTaskResult>,
    confirmed: bool,
}

/// The state of a running evaluation.
struct Session<'a> {
    evaluator: &'a Evaluator,
    task: &'a Task,
    params: &'a TrainParams,
    role: EvaluatorRole,
    table: &'a Table,
    labels: &'a HashMap<String, f64>,
    cancel: &'a CancellationToken,
    events: mpsc::UnboundedReceiver<FoldEvent>,
    /// Events which arrived before their fold was waited for.
    pending: HashMap<u32, PendingFold>,
}

impl Session<'_> {
    fn sub_task(&self, fold_idx: u32, kind: TaskType, ids: &[String]) -> Result<Task, FoldError> {
        let suffix = match kind {
            TaskType::Learn => "train",
            TaskType::Predict => "predict",
        };
        Ok(Task {
            id: format!("{}_{}_{}_Eva", self.task.id, fold_idx, suffix),
            file: subset(self.table, &self.params.id_name, ids)?,
            hosts: self.task.hosts.clone(),
            params: TaskParams {
                algo: self.task.algo(),
                task_type: kind,
                train_params: Some(self.params.clone()),
                model: None,
                eval_params: None,
            },
        })
    }

    /// Trains the model of a fold.
    async fn train_fold(&mut self, fold_idx: u32, ids: &[String]) -> Result<Vec<u8>, FoldError> {
        let task = self.sub_task(fold_idx, TaskType::Learn, ids)?;
        let task_id = task.id.clone();
        let (tx, rx) = oneshot::channel();
        self.evaluator
            .requests
            .start(task, Origin::EvalTrain(tx), Some(self.cancel.clone()))
            .await?;

        let result = tokio::select! {
            result = rx => result.map_err(|_| FoldError::Dropped)?,
            _ = self.cancel.cancelled() => return Err(FoldError::Cancelled),
        };
        match result.model {
            Some(model) if result.success => Ok(model),
            _ => Err(FoldError::SubTask(
                task_id,
                result.err_msg.unwrap_or_default(),
            )),
        }
    }

    /// Predicts the holdout of a fold, then scores and confirms it or waits for its
    /// confirmation.
    async fn evaluate_fold(
        &mut self,
        fold_idx: u32,
        ids: &[String],
        model: Vec<u8>,
    ) -> Result<Scores, FoldError> {
        let mut task = self.sub_task(fold_idx, TaskType::Predict, ids)?;
        task.params.train_params = None;
        task.params.model = Some(model);
        let task_id = task.id.clone();
        let tag = FoldTag {
            task_id: self.task.id.clone(),
            fold_idx,
        };
        self.evaluator
            .requests
            .start(task, Origin::EvalPredict(tag), Some(self.cancel.clone()))
            .await?;

        let result = self.predicted(fold_idx).await?;
        if !result.success {
            return Err(FoldError::SubTask(
                task_id,
                result.err_msg.unwrap_or_default(),
            ));
        }
        match self.role {
            EvaluatorRole::Normal => self.score(fold_idx, result).await,
            EvaluatorRole::Live => {
                self.confirmation(fold_idx).await?;
                Ok(Scores::new())
            }
        }
    }

    async fn score(
        &mut self,
        fold_idx: u32,
        result: PredictTaskResult,
    ) -> Result<Scores, FoldError> {
        let scores = metrics::score(self.task.algo(), &result.outcomes, self.labels)?;
        let req = ValidateRequest {
            task_id: self.task.id.clone(),
            from: EvaluatorRole::Normal,
            fold_idx,
            predict_result: result,
        };
        let RetryPolicy { times, interval } = self.evaluator.retry;
        let rpc = &self.evaluator.rpc;
        let acks = join_all(
            self.task
                .hosts
                .iter()
                .map(|host| rpc.validate_with_retry(req.clone(), host, times, interval)),
        )
        .await;
        for ack in acks {
            ack?;
        }
        Ok(scores)
    }

    async fn predicted(&mut self, fold_idx: u32) -> Result<PredictTaskResult, FoldError> {
        loop {
            if let Some(result) = self
                .pending
                .get_mut(&fold_idx)
                .and_then(|fold| fold.predicted.take())
            {
                return Ok(result);
            }
            self.next_event().await?;
        }
    }

    async fn confirmation(&mut self, fold_idx: u32) -> Result<(), FoldError> {
        let deadline = tokio::time::sleep(self.evaluator.confirm_wait);
        tokio::pin!(deadline);
        while !self
            .pending
            .get(&fold_idx)
            .map_or(false, |fold| fold.confirmed)
        {
            tokio::select! {
                _ = &mut deadline => return Err(FoldError::NotConfirmed),
                event = self.next_event() => event?,
            }
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Result<(), FoldError> {
        let event = tokio::select! {
            event = self.events.recv() => event.ok_or(FoldError::Dropped)?,
            _ = self.cancel.cancelled() => return Err(FoldError::Cancelled),
        };
        match event {
            FoldEvent::Predicted(fold_idx, result) => {
                self.pending.entry(fold_idx).or_default().predicted = Some(result);
            }
            FoldEvent::Confirmed(fold_idx) => {
                self.pending.entry(fold_idx).or_default().confirmed = true;
            }
        }
        Ok(())
    }
}
