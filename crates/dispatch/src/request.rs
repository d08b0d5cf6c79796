//! Task requests, handles and outcomes.

use chrono::Utc;
use eval::NamespaceSnapshot;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tasks::TaskDefinition;

/// Content-derived task id: the first 16 hex digits of a SHA-256 over the
/// script, the global preamble and the captured namespace.
pub fn task_id(script: &str, global_def: &str, namespace: &NamespaceSnapshot) -> String {
    let mut hasher = Sha256::new();
    hasher.update(script.as_bytes());
    hasher.update([0u8]);
    hasher.update(global_def.as_bytes());
    hasher.update([0u8]);
    hasher.update(serde_json::to_vec(namespace).unwrap_or_default());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_owned()
}

/// Immutable payload of one dispatched unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: String,
    /// Group index the task was created for.
    pub index: usize,
    pub script: String,
    pub global_def: String,
    pub namespace: NamespaceSnapshot,
    pub tags: Vec<String>,
    pub workdir: Option<String>,
}

impl TaskRequest {
    pub fn new(
        script: impl Into<String>,
        global_def: impl Into<String>,
        namespace: NamespaceSnapshot,
    ) -> Self {
        let script = script.into();
        let global_def = global_def.into();
        Self {
            id: task_id(&script, &global_def, &namespace),
            index: namespace.slots.index,
            script,
            global_def,
            namespace,
            tags: Vec::new(),
            workdir: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_workdir(mut self, workdir: Option<String>) -> Self {
        self.workdir = workdir;
        self
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            task_id: self.id.clone(),
            index: self.index,
        }
    }

    pub fn to_definition(&self) -> TaskDefinition {
        TaskDefinition {
            id: self.id.clone(),
            script: self.script.clone(),
            global_def: self.global_def.clone(),
            namespace: self.namespace.clone(),
            tags: self.tags.clone(),
            workdir: self.workdir.clone(),
            created_at: Utc::now(),
        }
    }

    pub fn from_definition(definition: TaskDefinition) -> Self {
        Self {
            id: definition.id,
            index: definition.namespace.slots.index,
            script: definition.script,
            global_def: definition.global_def,
            namespace: definition.namespace,
            tags: definition.tags,
            workdir: definition.workdir,
        }
    }
}

/// What a backend returns from `submit`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub task_id: String,
    pub index: usize,
}

/// Completion record of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub index: usize,
    pub ret_code: i32,
    /// `_output` as left by the task, when determined.
    pub output: Option<Vec<String>>,
    pub error: Option<String>,
    /// The task stopped itself with an abort.
    #[serde(default)]
    pub skipped: bool,
}

impl TaskOutcome {
    pub fn failure(handle: &TaskHandle, message: impl Into<String>) -> Self {
        Self {
            task_id: handle.task_id.clone(),
            index: handle.index,
            ret_code: -1,
            output: None,
            error: Some(message.into()),
            skipped: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.ret_code == 0
    }
}
