use std::{sync::Arc, time::Duration};

use crate::{
    common::{
        CrossValidation,
        EvaluationParams,
        EvaluationRule,
        RandomSplit,
        StopTaskRequest,
        TaskState,
    },
    rpc::LocalNetwork,
    tests::utils::*,
};

fn eval_params(rule: EvaluationRule) -> EvaluationParams {
    EvaluationParams {
        enable: true,
        rule,
        random_split: Some(RandomSplit { percent_lo: 10 }),
        cross_val: Some(CrossValidation {
            folds: 3,
            shuffle: true,
        }),
    }
}

/// Trains with evaluation on both parties and returns their results.
async fn evaluate(
    rule: EvaluationRule,
    samples: usize,
    max_rounds: u64,
) -> (Party, Party) {
    enable_logging();
    let (_network, a, b) = two_parties(|config| config.train_task_limit = 1).await;
    start_training(&a, &b, rule, samples, max_rounds).await;
    wait_for_models(&a.holder, 1).await;
    wait_for_models(&b.holder, 1).await;
    (a, b)
}

/// Starts the task `train` with evaluation on both parties.
async fn start_training(
    a: &Party,
    b: &Party,
    rule: EvaluationRule,
    samples: usize,
    max_rounds: u64,
) {
    let (file_a, file_b) = linear_files(samples);
    let params = eval_params(rule);

    a.handle
        .start_task(learn_request(
            "train",
            file_a,
            B,
            train_params(true, max_rounds),
            Some(params.clone()),
        ))
        .await
        .unwrap();
    b.handle
        .start_task(learn_request(
            "train",
            file_b,
            A,
            train_params(false, max_rounds),
            Some(params),
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_random_split_evaluation() {
    let (a, b) = evaluate(EvaluationRule::RandomSplit, 40, 100).await;

    let result_a = a.holder.models().await.remove(0);
    assert!(result_a.success, "{:?}", result_a.err_msg);
    assert!(result_a.model.is_some());
    let report = result_a.eval_metric_scores.unwrap();
    assert_eq!(report.rule, EvaluationRule::RandomSplit);
    assert_eq!(report.folds.len(), 1);
    assert_eq!(report.failed_folds(), 0);
    assert!(report.mean["RMSE"] < 0.5, "{:?}", report.mean);

    // only the label holder reports scores
    let result_b = b.holder.models().await.remove(0);
    assert!(result_b.success, "{:?}", result_b.err_msg);
    assert!(result_b.eval_metric_scores.is_none());

    a.handle.stop().await;
    b.handle.stop().await;

    // every party gets exactly one result, fold predictions are not results of their own
    assert_eq!(a.holder.models().await.len(), 1);
    assert_eq!(b.holder.models().await.len(), 1);
    assert!(a.holder.predictions().await.is_empty());
    assert!(b.holder.predictions().await.is_empty());
}

#[tokio::test]
async fn test_cross_validation() {
    let (a, b) = evaluate(EvaluationRule::CrossVal, 30, 50).await;

    let result_a = a.holder.models().await.remove(0);
    assert!(result_a.success, "{:?}", result_a.err_msg);
    let report = result_a.eval_metric_scores.unwrap();
    assert_eq!(report.folds.len(), 3);
    for (idx, fold) in report.folds.iter().enumerate() {
        assert_eq!(fold.fold_idx, idx as u32);
        assert!(fold.err_msg.is_none(), "{:?}", fold.err_msg);
        assert!(fold.scores.contains_key("R2"));
    }

    let result_b = b.holder.models().await.remove(0);
    assert!(result_b.success, "{:?}", result_b.err_msg);
    assert!(result_b.eval_metric_scores.is_none());

    a.handle.stop().await;
    b.handle.stop().await;
}

#[tokio::test]
async fn test_leave_one_out() {
    let (a, b) = evaluate(EvaluationRule::LeaveOneOut, 6, 10).await;

    let report = a.holder.models().await.remove(0).eval_metric_scores.unwrap();
    assert_eq!(report.rule, EvaluationRule::LeaveOneOut);
    assert_eq!(report.folds.len(), 6);
    assert_eq!(report.failed_folds(), 0);

    a.handle.stop().await;
    b.handle.stop().await;
}

#[tokio::test]
async fn test_failed_fold_does_not_stop_the_evaluation() {
    enable_logging();
    let network = LocalNetwork::new();
    let transport = Arc::new(FaultyTransport::refusing(network.clone(), "train_1_train_Eva"));
    let a = spawn_party(&network, transport.clone(), config(A)).await;
    let b = spawn_party(&network, transport, config(B)).await;
    start_training(&a, &b, EvaluationRule::CrossVal, 30, 50).await;

    let result_a = wait_for_models(&a.holder, 1).await.remove(0);
    assert!(result_a.success, "{:?}", result_a.err_msg);
    let report = result_a.eval_metric_scores.unwrap();
    assert_eq!(report.folds.len(), 3);
    assert_eq!(report.failed_folds(), 1);
    let failed = report.folds[1].err_msg.as_deref().unwrap();
    assert!(failed.contains("train_1_train_Eva"), "{}", failed);
    assert!(report.folds[0].err_msg.is_none(), "{:?}", report.folds[0].err_msg);
    assert!(report.folds[2].err_msg.is_none(), "{:?}", report.folds[2].err_msg);
    assert!(report.mean.contains_key("R2"));

    let result_b = wait_for_models(&b.holder, 1).await.remove(0);
    assert!(result_b.success, "{:?}", result_b.err_msg);

    a.handle.stop().await;
    b.handle.stop().await;
}

#[tokio::test]
async fn test_stopped_evaluation_fails_the_task() {
    enable_logging();
    let network = LocalNetwork::new();
    let slow = FaultyTransport::delaying_predictions(network.clone(), Duration::from_millis(500));
    let a = spawn_party(&network, Arc::new(slow), config(A)).await;
    let b = spawn_party(&network, Arc::new(network.clone()), config(B)).await;
    start_training(&a, &b, EvaluationRule::RandomSplit, 40, 20).await;

    wait_for_state(&a.handle, "train", TaskState::Evaluating).await;
    a.handle
        .stop_task(StopTaskRequest {
            task_id: "train".into(),
        })
        .await
        .unwrap();

    let result = wait_for_models(&a.holder, 1).await.remove(0);
    assert!(!result.success);
    assert!(result.model.is_none());
    let err = result.err_msg.unwrap();
    assert!(err.contains("cancelled"), "{}", err);

    // the fold sub-tasks are cancelled with their task
    wait_until_gone(&a.handle, "train").await;
    wait_until_gone(&a.handle, "train_0_predict_Eva").await;

    a.handle.stop().await;
    b.handle.stop().await;
    assert_eq!(a.holder.models().await.len(), 1);
    assert!(a.holder.predictions().await.is_empty());
}
