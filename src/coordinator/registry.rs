//! The live tasks of a coordinator. Only the dispatch loop touches the registry.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::requests::{Inbound, RequestError, StopTaskError};
use crate::common::{Algorithm, TaskState, TaskType};

/// The inbox of a worker.
pub(crate) type Inbox = mpsc::UnboundedReceiver<Inbound>;

#[derive(Debug)]
pub(crate) struct Entry {
    pub kind: TaskType,
    pub algo: Algorithm,
    pub state: TaskState,
    pub cancel: CancellationToken,
    pub inbox: mpsc::UnboundedSender<Inbound>,
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    tasks: HashMap<String, Entry>,
}

impl Registry {
    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Registers a task and returns the inbox of its worker.
    pub fn insert(
        &mut self,
        task_id: String,
        kind: TaskType,
        algo: Algorithm,
        cancel: CancellationToken,
    ) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tasks.insert(
            task_id,
            Entry {
                kind,
                algo,
                state: TaskState::Pending,
                cancel,
                inbox: tx,
            },
        );
        rx
    }

    pub fn remove(&mut self, task_id: &str) -> Option<Entry> {
        self.tasks.remove(task_id)
    }

    pub fn state(&self, task_id: &str) -> Option<TaskState> {
        self.tasks.get(task_id).map(|entry| entry.state)
    }

    /// Updates the state of a task unless it is stopping.
    pub fn set_state(&mut self, task_id: &str, state: TaskState) {
        if let Some(entry) = self.tasks.get_mut(task_id) {
            if entry.state != TaskState::Stopping {
                debug!("task {} is {}", task_id, state);
                entry.state = state;
            }
        }
    }

    /// Requests the cancellation of a task.
    pub fn stop(&mut self, task_id: &str) -> Result<(), StopTaskError> {
        let entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StopTaskError::TaskNotFound(task_id.to_string()))?;
        if entry.state == TaskState::Stopping {
            return Err(StopTaskError::AlreadyStopping(task_id.to_string()));
        }
        entry.state = TaskState::Stopping;
        entry.cancel.cancel();
        Ok(())
    }

    /// Hands a round message of a peer to the worker of the task.
    pub fn route(&self, task_id: &str, kind: TaskType, algo: Algorithm, inbound: Inbound) {
        let entry = match self.tasks.get(task_id) {
            Some(entry) if entry.kind == kind => entry,
            _ => {
                debug!("round message from {} for unknown task {}", inbound.from, task_id);
                return inbound.reply(Err(RequestError::TaskNotFound(task_id.to_string())));
            }
        };
        if entry.algo != algo {
            warn!("{} sent a {} message for task {}", inbound.from, algo, task_id);
            return inbound.reply(Err(RequestError::AlgorithmMismatch {
                expected: entry.algo,
                got: algo,
            }));
        }
        if let Err(mpsc::error::SendError(inbound)) = entry.inbox.send(inbound) {
            inbound.reply(Err(RequestError::TaskNotFound(task_id.to_string())));
        }
    }

    /// Removes all tasks.
    pub fn clear(&mut self) {
        self.tasks.clear();
    }
}
