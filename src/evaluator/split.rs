//! Partitioning of the samples into training and holdout sets.
//!
//! All parties of a task compute the same partition independently: the ids are sorted and
//! shuffled with a generator seeded from the task id.

use displaydoc::Display;
use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha20Rng;
use thiserror::Error;

use crate::common::{EvaluationParams, EvaluationRule};

/// Errors of the partitioning.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum SplitError {
    /// {samples} samples are too few for {rule}.
    TooFewSamples {
        rule: EvaluationRule,
        samples: usize,
    },
    /// Settings for {0} are missing.
    MissingSettings(EvaluationRule),
}

/// The samples of one evaluation fold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train: Vec<String>,
    pub holdout: Vec<String>,
}

/// The folds of an evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalPlan {
    pub rule: EvaluationRule,
    pub folds: Vec<Fold>,
}

impl EvalPlan {
    pub fn folds(&self) -> u32 {
        self.folds.len() as u32
    }
}

fn rng(task_id: &str) -> ChaCha20Rng {
    let mut seed = [0_u8; 32];
    for (i, byte) in task_id.bytes().enumerate() {
        seed[i % 32] ^= byte.rotate_left((i / 32) as u32);
    }
    ChaCha20Rng::from_seed(seed)
}

/// Partitions the sample ids for an evaluation.
pub fn plan(
    task_id: &str,
    mut ids: Vec<String>,
    params: &EvaluationParams,
) -> Result<EvalPlan, SplitError> {
    ids.sort();
    let n = ids.len();
    let too_few = || SplitError::TooFewSamples {
        rule: params.rule,
        samples: n,
    };

    let folds = match params.rule {
        EvaluationRule::RandomSplit => {
            let split = params
                .random_split
                .ok_or(SplitError::MissingSettings(params.rule))?;
            if n < 2 {
                return Err(too_few());
            }
            ids.shuffle(&mut rng(task_id));
            let holdout = (n * split.percent_lo as usize / 100).max(1).min(n - 1);
            let train = ids.split_off(holdout);
            vec![Fold {
                train,
                holdout: ids,
            }]
        }
        EvaluationRule::CrossVal => {
            let cv = params
                .cross_val
                .ok_or(SplitError::MissingSettings(params.rule))?;
            if cv.shuffle {
                ids.shuffle(&mut rng(task_id));
            }
            k_fold(&ids, cv.folds as usize).ok_or_else(too_few)?
        }
        EvaluationRule::LeaveOneOut => k_fold(&ids, n).ok_or_else(too_few)?,
    };
    Ok(EvalPlan {
        rule: params.rule,
        folds,
    })
}

/// Splits the ids into `k` contiguous folds whose sizes differ by at most one.
fn k_fold(ids: &[String], k: usize) -> Option<Vec<Fold>> {
    let n = ids.len();
    if k < 2 || k > n {
        return None;
    }
    let mut folds = Vec::with_capacity(k);
    let mut start = 0;
    for fold in 0..k {
        let size = n / k + usize::from(fold < n % k);
        let end = start + size;
        folds.push(Fold {
            train: ids[..start].iter().chain(&ids[end..]).cloned().collect(),
            holdout: ids[start..end].to_vec(),
        });
        start = end;
    }
    Some(folds)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::common::{CrossValidation, RandomSplit};

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("id{}", i)).collect()
    }

    fn params(rule: EvaluationRule) -> EvaluationParams {
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

    #[test]
    fn test_random_split() {
        let plan = plan("task", ids(50), &params(EvaluationRule::RandomSplit)).unwrap();
        assert_eq!(plan.folds(), 1);
        assert_eq!(plan.folds[0].holdout.len(), 5);
        assert_eq!(plan.folds[0].train.len(), 45);

        // at least one sample is held out and one is trained on
        let plan = super::plan("task", ids(3), &params(EvaluationRule::RandomSplit)).unwrap();
        assert_eq!(plan.folds[0].holdout.len(), 1);
        assert!(super::plan("task", ids(1), &params(EvaluationRule::RandomSplit)).is_err());
    }

    #[test]
    fn test_partition_is_deterministic() {
        let mut shuffled = ids(30);
        shuffled.reverse();
        let a = plan("task-1", ids(30), &params(EvaluationRule::CrossVal)).unwrap();
        let b = plan("task-1", shuffled, &params(EvaluationRule::CrossVal)).unwrap();
        assert_eq!(a, b);

        let c = plan("task-2", ids(30), &params(EvaluationRule::CrossVal)).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_cross_validation_folds() {
        let plan = plan("task", ids(10), &params(EvaluationRule::CrossVal)).unwrap();
        assert_eq!(plan.folds(), 3);
        let sizes = plan.folds.iter().map(|f| f.holdout.len()).collect::<Vec<_>>();
        assert_eq!(sizes, vec![4, 3, 3]);

        let mut seen = HashSet::new();
        for fold in &plan.folds {
            assert_eq!(fold.train.len() + fold.holdout.len(), 10);
            for id in &fold.holdout {
                assert!(seen.insert(id.clone()));
                assert!(!fold.train.contains(id));
            }
        }
        assert_eq!(seen.len(), 10);

        assert!(super::plan("task", ids(2), &params(EvaluationRule::CrossVal)).is_err());
    }

    #[test]
    fn test_leave_one_out() {
        let plan = plan("task", ids(4), &params(EvaluationRule::LeaveOneOut)).unwrap();
        assert_eq!(plan.folds(), 4);
        assert!(plan.folds.iter().all(|f| f.holdout.len() == 1 && f.train.len() == 3));
    }
}
