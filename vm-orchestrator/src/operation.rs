use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Delete,
    Start,
    Stop,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Create => "create",
            OperationKind::Delete => "delete",
            OperationKind::Start => "start",
            OperationKind::Stop => "stop",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationTask {
    pub machine_id: Uuid,
    pub kind: OperationKind,
    pub started_at: DateTime<Utc>,
}

/// In-flight operations, at most one per machine.
///
/// Cloning shares the same table.
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    tasks: Arc<Mutex<HashMap<Uuid, OperationTask>>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, OperationTask>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `kind` for `machine_id` unless another operation is already
    /// registered. The task is removed when the returned guard is dropped.
    pub fn try_begin(&self, machine_id: Uuid, kind: OperationKind) -> Result<OperationGuard> {
        let mut tasks = self.lock();
        if let Some(active) = tasks.get(&machine_id) {
            return Err(OrchestratorError::OperationInProgress {
                machine_id,
                active: active.kind,
            });
        }
        tasks.insert(
            machine_id,
            OperationTask {
                machine_id,
                kind,
                started_at: Utc::now(),
            },
        );
        Ok(OperationGuard {
            registry: self.clone(),
            machine_id,
        })
    }

    pub fn active(&self, machine_id: Uuid) -> Option<OperationTask> {
        self.lock().get(&machine_id).copied()
    }

    pub fn is_busy(&self, machine_id: Uuid) -> bool {
        self.lock().contains_key(&machine_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[must_use = "the operation is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct OperationGuard {
    registry: OperationRegistry,
    machine_id: Uuid,
}

impl OperationGuard {
    pub fn machine_id(&self) -> Uuid {
        self.machine_id
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.machine_id);
    }
}
