//! Async-operation receipts for the start/destroy endpoints.
//!
//! A task is an in-memory status record handed back with a 202; callers poll
//! `GET /task/:id` for the outcome. Records are garbage-collected a fixed
//! interval after the last read or status change.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;

use opless_core::epoch_millis;

const TASK_TTL: Duration = Duration::from_secs(15 * 60);

/// Status of one async operation, tagged for the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status")]
pub enum TaskStatus {
    #[serde(rename = "PENDING")]
    Pending { started_at: i64 },

    #[serde(rename = "SUCCEEDED")]
    Succeeded {
        started_at: i64,
        finished_at: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },

    #[serde(rename = "FAILED")]
    Failed {
        started_at: i64,
        finished_at: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
}

impl TaskStatus {
    fn started_at(&self) -> i64 {
        match self {
            TaskStatus::Pending { started_at }
            | TaskStatus::Succeeded { started_at, .. }
            | TaskStatus::Failed { started_at, .. } => *started_at,
        }
    }
}

#[derive(Default)]
struct TaskMap {
    statuses: HashMap<String, TaskStatus>,
    cleanup: HashMap<String, JoinHandle<()>>,
}

/// Clonable in-memory task registry.
#[derive(Clone)]
pub struct TaskService {
    inner: Arc<Mutex<TaskMap>>,
    ttl: Duration,
}

impl Default for TaskService {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskService {
    pub fn new() -> Self {
        Self::with_ttl(TASK_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TaskMap::default())),
            ttl,
        }
    }

    /// Register a pending task.
    pub fn add(&self, id: &str) {
        let mut map = self.inner.lock().expect("task lock");
        map.statuses.insert(
            id.to_string(),
            TaskStatus::Pending {
                started_at: epoch_millis(),
            },
        );
        self.poke(&mut map, id);
    }

    pub fn succeeded(&self, id: &str, details: Option<serde_json::Value>) {
        self.finish(id, details, false);
    }

    pub fn failed(&self, id: &str, details: Option<serde_json::Value>) {
        self.finish(id, details, true);
    }

    /// Read a task's status; reading refreshes its GC timer.
    pub fn get(&self, id: &str) -> Option<TaskStatus> {
        let mut map = self.inner.lock().expect("task lock");
        let status = map.statuses.get(id).cloned()?;
        self.poke(&mut map, id);
        Some(status)
    }

    fn finish(&self, id: &str, details: Option<serde_json::Value>, failed: bool) {
        let mut map = self.inner.lock().expect("task lock");
        let started_at = map
            .statuses
            .get(id)
            .map(TaskStatus::started_at)
            .unwrap_or_else(epoch_millis);
        let finished_at = epoch_millis();

        let status = if failed {
            TaskStatus::Failed {
                started_at,
                finished_at,
                details,
            }
        } else {
            TaskStatus::Succeeded {
                started_at,
                finished_at,
                details,
            }
        };
        map.statuses.insert(id.to_string(), status);
        self.poke(&mut map, id);
    }

    /// Reset the GC timer for `id`.
    fn poke(&self, map: &mut TaskMap, id: &str) {
        if let Some(old) = map.cleanup.remove(id) {
            old.abort();
        }

        let inner = Arc::clone(&self.inner);
        let ttl = self.ttl;
        let id_owned = id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut map = inner.lock().expect("task lock");
            map.statuses.remove(&id_owned);
            map.cleanup.remove(&id_owned);
        });
        map.cleanup.insert(id.to_string(), handle);
    }
}
