use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::time::{sleep, timeout};
use tracing_subscriber::*;

use crate::{
    common::{
        Algorithm,
        EvaluationParams,
        PredictRequest,
        PredictResponse,
        PredictTaskResult,
        StartTaskRequest,
        TaskParams,
        TaskState,
        TaskType,
        TrainParams,
        TrainRequest,
        TrainResponse,
        TrainTaskResult,
        ValidateRequest,
    },
    coordinator::{Config, Coordinator, CoordinatorHandle},
    holder::InMemoryHolder,
    rpc::{LocalNetwork, PeerTransport, RetryPolicy, TransportError},
};

pub const A: &str = "party-a";
pub const B: &str = "party-b";

pub fn enable_logging() {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .try_init();
}

pub fn config(address: &str) -> Config {
    Config {
        address: address.to_string(),
        train_task_limit: 4,
        predict_task_limit: 4,
        rpc_timeout: Duration::from_secs(1),
        retry: RetryPolicy {
            times: 40,
            interval: Duration::from_millis(25),
        },
    }
}

/// y = 2 * x1 - x2 + 0.5 * x3 + 1, with x1 and the label on party A and x2, x3 on party B.
pub fn linear_files(samples: usize) -> (Vec<u8>, Vec<u8>) {
    let mut a = "id,x1,y\n".to_string();
    let mut b = "id,x2,x3\n".to_string();
    for i in 0..samples {
        let x1 = (i % 7) as f64;
        let x2 = ((i * 3) % 5) as f64;
        let x3 = ((i * 5) % 11) as f64 / 2.0;
        let y = 2.0 * x1 - x2 + 0.5 * x3 + 1.0;
        a.push_str(&format!("s{:03},{},{}\n", i, x1, y));
        b.push_str(&format!("s{:03},{},{}\n", i, x2, x3));
    }
    (a.into_bytes(), b.into_bytes())
}

/// The true labels of [`linear_files()`].
pub fn linear_labels(samples: usize) -> Vec<f64> {
    (0..samples)
        .map(|i| {
            let x1 = (i % 7) as f64;
            let x2 = ((i * 3) % 5) as f64;
            let x3 = ((i * 5) % 11) as f64 / 2.0;
            2.0 * x1 - x2 + 0.5 * x3 + 1.0
        })
        .collect()
}

pub fn train_params(is_tag_part: bool, max_rounds: u64) -> TrainParams {
    TrainParams {
        label: if is_tag_part { "y".into() } else { String::new() },
        is_tag_part,
        alpha: 0.3,
        amplitude: 1e-9,
        max_rounds,
        ..TrainParams::default()
    }
}

pub fn learn_request(
    task_id: &str,
    file: Vec<u8>,
    host: &str,
    params: TrainParams,
    eval_params: Option<EvaluationParams>,
) -> StartTaskRequest {
    StartTaskRequest {
        task_id: task_id.to_string(),
        file,
        hosts: vec![host.to_string()],
        params: TaskParams {
            algo: Algorithm::LinearRegressionVl,
            task_type: TaskType::Learn,
            train_params: Some(params),
            model: None,
            eval_params,
        },
    }
}

pub fn predict_request(task_id: &str, file: Vec<u8>, host: &str, model: Vec<u8>) -> StartTaskRequest {
    StartTaskRequest {
        task_id: task_id.to_string(),
        file,
        hosts: vec![host.to_string()],
        params: TaskParams {
            algo: Algorithm::LinearRegressionVl,
            task_type: TaskType::Predict,
            train_params: None,
            model: Some(model),
            eval_params: None,
        },
    }
}

pub struct Party {
    pub handle: CoordinatorHandle,
    pub holder: InMemoryHolder,
}

/// Spawns a coordinator which reaches its peers through `transport` and registers it on
/// `network`.
pub async fn spawn_party(
    network: &LocalNetwork,
    transport: Arc<dyn PeerTransport>,
    config: Config,
) -> Party {
    let holder = InMemoryHolder::new();
    let handle = Coordinator::start(config, Arc::new(holder.clone()), transport);
    network.register(handle.clone()).await;
    Party { handle, holder }
}

/// Spawns the parties A and B on a fresh network.
pub async fn two_parties(tweak: impl Fn(&mut Config)) -> (LocalNetwork, Party, Party) {
    let network = LocalNetwork::new();
    let mut parties = Vec::new();
    for address in &[A, B] {
        let mut config = config(address);
        tweak(&mut config);
        parties.push(spawn_party(&network, Arc::new(network.clone()), config).await);
    }
    let b = parties.pop().unwrap();
    let a = parties.pop().unwrap();
    (network, a, b)
}

/// Polls `check` until it returns a value.
pub async fn eventually<T, F, Fut>(check: F) -> T
where
    F: Fn() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    timeout(Duration::from_secs(60), async {
        loop {
            if let Some(value) = check().await {
                return value;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

pub async fn wait_for_models(holder: &InMemoryHolder, count: usize) -> Vec<TrainTaskResult> {
    eventually(|| async move {
        let models = holder.models().await;
        (models.len() >= count).then(|| models)
    })
    .await
}

pub async fn wait_for_predictions(holder: &InMemoryHolder, count: usize) -> Vec<PredictTaskResult> {
    eventually(|| async move {
        let predictions = holder.predictions().await;
        (predictions.len() >= count).then(|| predictions)
    })
    .await
}

/// A transport which counts the answered round messages per `(from, to)` pair.
#[derive(Clone)]
pub struct CountingTransport {
    inner: LocalNetwork,
    pub answered: Arc<Mutex<HashMap<(String, String), usize>>>,
}

impl CountingTransport {
    pub fn new(inner: LocalNetwork) -> Self {
        Self {
            inner,
            answered: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn count(&self, from: &str, to: &str) -> usize {
        self.answered
            .lock()
            .unwrap()
            .get(&(from.to_string(), to.to_string()))
            .copied()
            .unwrap_or_default()
    }

    fn record(&self, from: String, to: &str) {
        *self
            .answered
            .lock()
            .unwrap()
            .entry((from, to.to_string()))
            .or_default() += 1;
    }
}

#[async_trait]
impl PeerTransport for CountingTransport {
    async fn train(&self, host: &str, req: TrainRequest) -> Result<TrainResponse, TransportError> {
        let from = req.from.clone();
        let resp = self.inner.train(host, req).await?;
        self.record(from, host);
        Ok(resp)
    }

    async fn predict(
        &self,
        host: &str,
        req: PredictRequest,
    ) -> Result<PredictResponse, TransportError> {
        self.inner.predict(host, req).await
    }

    async fn validate(&self, host: &str, req: ValidateRequest) -> Result<(), TransportError> {
        self.inner.validate(host, req).await
    }
}

/// A transport which delays the prediction rounds it sends and refuses the training rounds of
/// one task.
#[derive(Clone)]
pub struct FaultyTransport {
    inner: LocalNetwork,
    predict_delay: Duration,
    refused_task: Option<String>,
}

impl FaultyTransport {
    pub fn delaying_predictions(inner: LocalNetwork, delay: Duration) -> Self {
        Self {
            inner,
            predict_delay: delay,
            refused_task: None,
        }
    }

    pub fn refusing(inner: LocalNetwork, task_id: &str) -> Self {
        Self {
            inner,
            predict_delay: Duration::from_secs(0),
            refused_task: Some(task_id.to_string()),
        }
    }
}

#[async_trait]
impl PeerTransport for FaultyTransport {
    async fn train(&self, host: &str, req: TrainRequest) -> Result<TrainResponse, TransportError> {
        if self.refused_task.as_deref() == Some(req.task_id.as_str()) {
            return Err(anyhow!("connection to {} reset", host));
        }
        self.inner.train(host, req).await
    }

    async fn predict(
        &self,
        host: &str,
        req: PredictRequest,
    ) -> Result<PredictResponse, TransportError> {
        sleep(self.predict_delay).await;
        self.inner.predict(host, req).await
    }

    async fn validate(&self, host: &str, req: ValidateRequest) -> Result<(), TransportError> {
        self.inner.validate(host, req).await
    }
}

/// Waits until the task is no longer live.
pub async fn wait_until_gone(handle: &CoordinatorHandle, task_id: &str) {
    eventually(|| async move { handle.task_state(task_id).await.is_none().then(|| ()) }).await
}

/// Waits until the task is live in the given state.
pub async fn wait_for_state(handle: &CoordinatorHandle, task_id: &str, state: TaskState) {
    eventually(|| async move { (handle.task_state(task_id).await == Some(state)).then(|| ()) })
        .await
}
