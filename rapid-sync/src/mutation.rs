//! Mutation coordinator.
//!
//! Plain writes (`mut`, `merge`, `del`) are fire-and-acknowledge and never
//! pass through here beyond validation. Optimistic executions run a
//! fetch → transform → conditional write cycle:
//!
//! ```text
//!  Fetch ──ack──► Transform(snapshot) ──Write(v) / Delete──► Write(etag condition)
//!    ▲                   │ Abort                                  │
//!    │                   ▼                                        │ Conflict (retries left)
//!    │              Complete(Aborted)                             │
//!    └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Executions on the same `collection/doc_id` are serialized: the next one
//! starts only when the previous one completed. The coordinator never runs
//! the transform itself; it hands it out as an [`ExecutionStep`] so the
//! client can call it without holding its lock.

use std::collections::{HashMap, VecDeque};

use tokio::sync::oneshot;

use crate::document::{DocumentSnapshot, JsonObject};
use crate::error::{RapidError, Result};
use crate::protocol::{Ack, EtagCondition, WriteOp};

/// What an optimistic transform decided.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Write(JsonObject),
    Delete,
    Abort,
}

/// Caller-supplied transform from the current snapshot to a new value.
pub type Transform = Box<dyn FnMut(Option<&DocumentSnapshot>) -> ExecutionResult + Send>;

/// Work the client performs on behalf of an execution.
pub enum ExecutionStep {
    Fetch {
        key: String,
        collection: String,
        doc_id: String,
    },
    Transform {
        key: String,
        transform: Transform,
        snapshot: Option<DocumentSnapshot>,
    },
    Write {
        key: String,
        op: WriteOp,
    },
    Complete {
        completion: oneshot::Sender<Result<Ack>>,
        result: Result<Ack>,
    },
    /// A finished execution's transform, to be dropped outside the lock
    Release(Transform),
}

impl std::fmt::Debug for ExecutionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetch { key, .. } => write!(f, "Fetch({key})"),
            Self::Transform { key, snapshot, .. } => {
                write!(f, "Transform({key}, exists: {})", snapshot.is_some())
            }
            Self::Write { key, op } => write!(f, "Write({key}, {:?})", op.kind),
            Self::Complete { result, .. } => write!(f, "Complete({result:?})"),
            Self::Release(_) => write!(f, "Release"),
        }
    }
}

struct Execution {
    collection: String,
    doc_id: String,
    transform: Option<Transform>,
    completion: Option<oneshot::Sender<Result<Ack>>>,
    attempts: u32,
    condition: EtagCondition,
}

pub struct MutationCoordinator {
    executions: HashMap<String, VecDeque<Execution>>,
    max_retries: u32,
}

impl MutationCoordinator {
    pub fn new(max_retries: u32) -> Self {
        Self {
            executions: HashMap::new(),
            max_retries,
        }
    }

    pub fn execution_key(collection: &str, doc_id: &str) -> String {
        format!("{collection}/{doc_id}")
    }

    /// Queue an execution; starts it at once if none runs for the document.
    pub fn execute(
        &mut self,
        collection: &str,
        doc_id: &str,
        transform: Transform,
        completion: oneshot::Sender<Result<Ack>>,
    ) -> Vec<ExecutionStep> {
        let key = Self::execution_key(collection, doc_id);
        let queue = self.executions.entry(key.clone()).or_default();
        queue.push_back(Execution {
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
            transform: Some(transform),
            completion: Some(completion),
            attempts: 0,
            condition: EtagCondition::Any,
        });
        if queue.len() == 1 {
            self.start(&key)
        } else {
            log::debug!("Execution on {key} waits behind {} others", queue.len() - 1);
            Vec::new()
        }
    }

    fn start(&mut self, key: &str) -> Vec<ExecutionStep> {
        let Some(execution) = self.executions.get_mut(key).and_then(VecDeque::front_mut) else {
            return Vec::new();
        };
        execution.attempts += 1;
        vec![ExecutionStep::Fetch {
            key: key.to_string(),
            collection: execution.collection.clone(),
            doc_id: execution.doc_id.clone(),
        }]
    }

    /// The fetch step finished.
    pub fn fetched(&mut self, key: &str, result: Result<Ack>) -> Vec<ExecutionStep> {
        let ack = match result {
            Ok(ack) => ack,
            Err(e) => return self.finish(key, Err(e)),
        };
        let Some(execution) = self.executions.get_mut(key).and_then(VecDeque::front_mut) else {
            return Vec::new();
        };
        let snapshot = ack
            .documents
            .into_iter()
            .filter(|d| d.id == execution.doc_id)
            .find_map(|d| d.into_snapshot(&execution.collection));
        execution.condition = match &snapshot {
            None => EtagCondition::Absent,
            Some(DocumentSnapshot { etag: Some(etag), .. }) => EtagCondition::Match(etag.clone()),
            Some(_) => EtagCondition::Any,
        };
        match execution.transform.take() {
            Some(transform) => vec![ExecutionStep::Transform {
                key: key.to_string(),
                transform,
                snapshot,
            }],
            None => Vec::new(),
        }
    }

    /// The transform ran and returned `outcome`.
    pub fn transformed(
        &mut self,
        key: &str,
        transform: Transform,
        outcome: ExecutionResult,
    ) -> Vec<ExecutionStep> {
        let Some(execution) = self.executions.get_mut(key).and_then(VecDeque::front_mut) else {
            return vec![ExecutionStep::Release(transform)];
        };
        execution.transform = Some(transform);
        let condition = execution.condition.clone();
        let op = match outcome {
            ExecutionResult::Write(value) => {
                WriteOp::mutate(&execution.collection, &execution.doc_id, value).with_etag(condition)
            }
            ExecutionResult::Delete => {
                WriteOp::delete(&execution.collection, &execution.doc_id).with_etag(condition)
            }
            ExecutionResult::Abort => return self.finish(key, Err(RapidError::Aborted)),
        };
        vec![ExecutionStep::Write {
            key: key.to_string(),
            op,
        }]
    }

    /// The conditional write finished.
    pub fn written(&mut self, key: &str, result: Result<Ack>) -> Vec<ExecutionStep> {
        match result {
            Err(RapidError::Conflict) => {
                let attempts = self
                    .executions
                    .get(key)
                    .and_then(VecDeque::front)
                    .map_or(0, |e| e.attempts);
                if attempts > self.max_retries {
                    log::warn!("Execution on {key} gave up after {attempts} conflicting attempts");
                    self.finish(key, Err(RapidError::Conflict))
                } else {
                    log::debug!("Execution on {key} conflicted, retrying (attempt {})", attempts + 1);
                    self.start(key)
                }
            }
            other => self.finish(key, other),
        }
    }

    fn finish(&mut self, key: &str, result: Result<Ack>) -> Vec<ExecutionStep> {
        let mut steps = Vec::new();
        let Some(queue) = self.executions.get_mut(key) else {
            return steps;
        };
        let mut released = None;
        if let Some(mut execution) = queue.pop_front() {
            if let Some(completion) = execution.completion.take() {
                steps.push(ExecutionStep::Complete { completion, result });
            }
            released = execution.transform.take();
        }
        if queue.is_empty() {
            self.executions.remove(key);
        } else {
            steps.extend(self.start(key));
        }
        steps.extend(released.map(ExecutionStep::Release));
        steps
    }

    /// Executions queued or running for a document.
    pub fn queued(&self, key: &str) -> usize {
        self.executions.get(key).map_or(0, VecDeque::len)
    }
}

/// Validate a plain write before it is queued.
pub fn plain_write(op: WriteOp) -> Result<WriteOp> {
    op.validate()?;
    Ok(op)
}
