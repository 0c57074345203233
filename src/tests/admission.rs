use std::{sync::Arc, time::Duration};

use futures::future::join_all;

use crate::{
    common::{
        EvaluationParams,
        EvaluationRule,
        InvalidTask,
        RandomSplit,
        StopTaskRequest,
        TaskState,
        TaskType,
    },
    coordinator::StartTaskError,
    rpc::LocalNetwork,
    tests::utils::*,
};

/// A party whose peer is never reachable, so its training tasks stay live for a few seconds.
async fn lonely_party(train_task_limit: usize) -> Party {
    let network = LocalNetwork::new();
    let mut config = config(A);
    config.train_task_limit = train_task_limit;
    config.retry.times = 200;
    spawn_party(&network, Arc::new(network.clone()), config).await
}

#[tokio::test]
async fn test_train_limit_rejects_exactly_the_excess() {
    enable_logging();
    let party = lonely_party(3).await;
    let (file, _) = linear_files(10);

    let starts = (0..4).map(|i| {
        let req = learn_request(&format!("task-{}", i), file.clone(), B, train_params(true, 10), None);
        party.handle.start_task(req)
    });
    let mut rejected = Vec::new();
    for (i, resp) in join_all(starts).await.into_iter().enumerate() {
        match resp {
            Ok(()) => {}
            Err(StartTaskError::LimitExceeded {
                kind: TaskType::Learn,
                limit: 3,
            }) => rejected.push(format!("task-{}", i)),
            Err(err) => panic!("unexpected error: {}", err),
        }
    }
    assert_eq!(rejected.len(), 1);
    assert!(party.handle.task_state(&rejected[0]).await.is_none());

    // predictions have their own slots
    party
        .handle
        .start_task(predict_request("predict-0", file.clone(), B, b"{}".to_vec()))
        .await
        .unwrap();

    // a released slot admits the next task
    let stopped = if rejected[0] == "task-0" { "task-1" } else { "task-0" };
    party
        .handle
        .stop_task(StopTaskRequest {
            task_id: stopped.into(),
        })
        .await
        .unwrap();
    wait_until_gone(&party.handle, stopped).await;
    party
        .handle
        .start_task(learn_request("task-4", file, B, train_params(true, 10), None))
        .await
        .unwrap();

    party.handle.stop().await;
}

#[tokio::test]
async fn test_duplicate_and_invalid_tasks() {
    enable_logging();
    let party = lonely_party(3).await;
    let (file, _) = linear_files(10);

    let req = learn_request("task", file.clone(), B, train_params(true, 10), None);
    let (first, second) = tokio::join!(
        party.handle.start_task(req.clone()),
        party.handle.start_task(req)
    );
    let mut resps = vec![first, second];
    resps.sort_by_key(Result::is_err);
    assert_eq!(
        resps,
        vec![Ok(()), Err(StartTaskError::DuplicateTask("task".into()))]
    );

    let mut req = learn_request("other", file, B, train_params(true, 10), None);
    req.hosts.clear();
    assert_eq!(
        party.handle.start_task(req).await,
        Err(StartTaskError::Invalid(InvalidTask::NoHosts))
    );

    let handle = &party.handle;
    eventually(|| async move {
        (handle.task_state("task").await == Some(TaskState::Running)).then(|| ())
    })
    .await;

    party.handle.stop().await;
}

#[tokio::test]
async fn test_evaluating_task_keeps_its_slot() {
    enable_logging();
    let network = LocalNetwork::new();
    let mut limited = config(A);
    limited.train_task_limit = 1;
    let slow = FaultyTransport::delaying_predictions(network.clone(), Duration::from_millis(500));
    let a = spawn_party(&network, Arc::new(slow), limited).await;
    let b = spawn_party(&network, Arc::new(network.clone()), config(B)).await;

    let (file_a, file_b) = linear_files(40);
    let params = EvaluationParams {
        enable: true,
        rule: EvaluationRule::RandomSplit,
        random_split: Some(RandomSplit { percent_lo: 10 }),
        cross_val: None,
    };
    a.handle
        .start_task(learn_request(
            "x",
            file_a.clone(),
            B,
            train_params(true, 20),
            Some(params.clone()),
        ))
        .await
        .unwrap();
    b.handle
        .start_task(learn_request(
            "x",
            file_b,
            A,
            train_params(false, 20),
            Some(params),
        ))
        .await
        .unwrap();

    wait_for_state(&a.handle, "x", TaskState::Evaluating).await;
    assert_eq!(
        a.handle
            .start_task(learn_request("y", file_a.clone(), B, train_params(true, 20), None))
            .await,
        Err(StartTaskError::LimitExceeded {
            kind: TaskType::Learn,
            limit: 1
        })
    );
    assert!(a.handle.task_state("y").await.is_none());

    // the slot is released with the result of the evaluated task
    let results = wait_for_models(&a.holder, 1).await;
    assert!(results[0].success, "{:?}", results[0].err_msg);
    assert!(results[0].eval_metric_scores.is_some());
    a.handle
        .start_task(learn_request("y", file_a, B, train_params(true, 20), None))
        .await
        .unwrap();

    a.handle.stop().await;
    b.handle.stop().await;
}
