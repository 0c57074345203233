//! Types shared by the local task API and the peer-facing protocol entry points.

pub mod messages;
pub mod task;

pub use self::{
    messages::{
        EvaluatorRole,
        PredictRequest,
        PredictResponse,
        TrainRequest,
        TrainResponse,
        ValidateRequest,
    },
    task::{
        Algorithm,
        CrossValidation,
        EvaluationParams,
        EvaluationReport,
        EvaluationRule,
        FoldReport,
        FoldTag,
        InvalidTask,
        PredictTaskResult,
        RandomSplit,
        RegMode,
        StartTaskRequest,
        StopTaskRequest,
        Task,
        TaskParams,
        TaskState,
        TaskType,
        TrainParams,
        TrainTaskResult,
    },
};
