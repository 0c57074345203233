use std::{
    fs,
    path::{Path, PathBuf},
    process,
    sync::Arc,
    time::Duration,
};

use structopt::StructOpt;
use tracing::{error, info, warn};
use tracing_subscriber::*;
use vfl_coordinator::{
    common::{
        Algorithm,
        CrossValidation,
        EvaluationParams,
        EvaluationRule,
        RandomSplit,
        StartTaskRequest,
        TaskParams,
        TaskType,
        TrainParams,
    },
    settings::Settings,
    Config,
    Coordinator,
    CoordinatorHandle,
    InMemoryHolder,
    LocalNetwork,
};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "simulate",
    about = "Trains a model jointly on two in-process parties"
)]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,

    /// CSV file of the label holder
    #[structopt(long, parse(from_os_str))]
    tag_file: PathBuf,

    /// CSV file of the other party
    #[structopt(long, parse(from_os_str))]
    peer_file: PathBuf,

    /// Name of the label column
    #[structopt(long, default_value = "y")]
    label: String,

    /// Name of the sample id column
    #[structopt(long, default_value = "id")]
    id_name: String,

    /// Train a logistic instead of a linear regression
    #[structopt(long)]
    logistic: bool,

    #[structopt(long, default_value = "100")]
    max_rounds: u64,

    /// Evaluate with a random split holding out this percentage of the samples
    #[structopt(long, conflicts_with = "folds")]
    holdout_percent: Option<u32>,

    /// Evaluate with cross validation over this many folds
    #[structopt(long)]
    folds: Option<u32>,
}

impl Opt {
    fn evaluation(&self) -> Option<EvaluationParams> {
        let rule = match (self.holdout_percent, self.folds) {
            (Some(_), _) => EvaluationRule::RandomSplit,
            (None, Some(_)) => EvaluationRule::CrossVal,
            (None, None) => return None,
        };
        Some(EvaluationParams {
            enable: true,
            rule,
            random_split: self
                .holdout_percent
                .map(|percent_lo| RandomSplit { percent_lo }),
            cross_val: self.folds.map(|folds| CrossValidation {
                folds,
                shuffle: true,
            }),
        })
    }

    fn algo(&self) -> Algorithm {
        if self.logistic {
            Algorithm::LogicRegressionVl
        } else {
            Algorithm::LinearRegressionVl
        }
    }

    fn request(&self, file: Vec<u8>, host: &str, is_tag_part: bool) -> StartTaskRequest {
        StartTaskRequest {
            task_id: "simulation".into(),
            file,
            hosts: vec![host.to_string()],
            params: TaskParams {
                algo: self.algo(),
                task_type: TaskType::Learn,
                train_params: Some(TrainParams {
                    label: if is_tag_part {
                        self.label.clone()
                    } else {
                        String::new()
                    },
                    id_name: self.id_name.clone(),
                    is_tag_part,
                    max_rounds: self.max_rounds,
                    ..TrainParams::default()
                }),
                model: None,
                eval_params: self.evaluation(),
            },
        }
    }
}

fn read(path: &Path) -> Vec<u8> {
    fs::read(path).unwrap_or_else(|err| {
        eprintln!("failed to read {}: {}", path.display(), err);
        process::exit(1);
    })
}

async fn spawn_party(network: &LocalNetwork, config: Config) -> (CoordinatorHandle, InMemoryHolder) {
    let holder = InMemoryHolder::new();
    let handle = Coordinator::start(config, Arc::new(holder.clone()), Arc::new(network.clone()));
    network.register(handle.clone()).await;
    (handle, holder)
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(&opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let tag_config = Config::from(&settings);
    let Settings { log, .. } = settings;
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log.filter)
        .with_ansi(true)
        .try_init();

    let peer_config = Config {
        address: format!("{}-peer", tag_config.address),
        ..tag_config.clone()
    };
    let network = LocalNetwork::new();
    let (tag, tag_holder) = spawn_party(&network, tag_config).await;
    let (peer, peer_holder) = spawn_party(&network, peer_config).await;

    let requests = vec![
        (&tag, opt.request(read(&opt.tag_file), peer.address(), true)),
        (&peer, opt.request(read(&opt.peer_file), tag.address(), false)),
    ];
    for (party, req) in requests {
        if let Err(err) = party.start_task(req).await {
            error!("{} rejected the task: {}", party.address(), err);
            process::exit(1);
        }
    }

    let result = loop {
        if let Some(result) = tag_holder.models().await.pop() {
            break result;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    while peer_holder.models().await.is_empty() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    if result.success {
        info!("training succeeded");
        if let Some(report) = &result.eval_metric_scores {
            for fold in &report.folds {
                match &fold.err_msg {
                    Some(err) => warn!("fold {} failed: {}", fold.fold_idx, err),
                    None => info!("fold {}: {:?}", fold.fold_idx, fold.scores),
                }
            }
            info!("{} mean scores: {:?}", report.rule, report.mean);
        }
    } else {
        error!(
            "training failed: {}",
            result.err_msg.as_deref().unwrap_or("unknown error")
        );
    }

    tag.stop().await;
    peer.stop().await;
    if !result.success {
        process::exit(1);
    }
}
