//! Result-set diffing for subscriptions.
//!
//! ```text
//! previous [A, B, C] ──┐
//!                      ├── incorporate(query, change) ──► Diff { documents, added, updated, removed }
//! change (val | upd) ──┘
//! ```
//!
//! `added` and `updated` follow the new order, `removed` the previous one.
//! A document is `updated` when its value changed or when it moved relative
//! to the other documents present in both sets.

use std::collections::HashMap;

use crate::document::{DocumentChange, DocumentSnapshot};
use crate::query::Query;

/// A server change to a subscription's result set.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// `val`: the complete result set
    Full(Vec<DocumentChange>),
    /// `upd`: individual documents changed or removed
    Incremental(Vec<DocumentChange>),
}

impl Change {
    /// Fold a later change for the same subscription into this one.
    ///
    /// A later `val` replaces everything before it. Updates are applied in
    /// arrival order, so appending them keeps the last write for each id.
    pub fn absorb(self, later: Change) -> Change {
        match (self, later) {
            (_, full @ Change::Full(_)) => full,
            (Change::Full(mut changes), Change::Incremental(more)) => {
                changes.extend(more);
                Change::Full(changes)
            }
            (Change::Incremental(mut changes), Change::Incremental(more)) => {
                changes.extend(more);
                Change::Incremental(changes)
            }
        }
    }
}

/// Outcome of incorporating a change, delivered to every handle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Diff {
    pub documents: Vec<DocumentSnapshot>,
    pub added: Vec<DocumentSnapshot>,
    pub updated: Vec<DocumentSnapshot>,
    pub removed: Vec<DocumentSnapshot>,
}

impl Diff {
    /// Diff that introduces `documents` to a handle that has seen nothing.
    pub fn initial(documents: Vec<DocumentSnapshot>) -> Self {
        Self {
            added: documents.clone(),
            documents,
            updated: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty())
    }
}

/// Apply a change to the previous result set and compute the diff.
///
/// `previous` is `None` before the first server value.
pub fn incorporate(query: &Query, previous: Option<&[DocumentSnapshot]>, change: Change) -> Diff {
    let prior = previous.unwrap_or(&[]);
    let mut current: HashMap<String, DocumentSnapshot> = match &change {
        Change::Full(_) => HashMap::new(),
        Change::Incremental(_) => prior.iter().map(|d| (d.id.clone(), d.clone())).collect(),
    };

    let changes = match change {
        Change::Full(changes) | Change::Incremental(changes) => changes,
    };
    for change in changes {
        let id = change.id.clone();
        match change.into_snapshot(&query.collection) {
            Some(snapshot) if query.matches(&snapshot) => {
                current.insert(id, snapshot);
            }
            _ => {
                current.remove(&id);
            }
        }
    }

    let mut documents: Vec<DocumentSnapshot> = current.into_values().collect();
    query.arrange(&mut documents);
    compute(prior, documents)
}

/// Compare two ordered result sets.
pub fn compute(previous: &[DocumentSnapshot], documents: Vec<DocumentSnapshot>) -> Diff {
    let new_ids: HashMap<&str, usize> = documents
        .iter()
        .enumerate()
        .map(|(i, d)| (d.id.as_str(), i))
        .collect();

    // Rank of each surviving document among survivors, in both orders.
    let mut previous_rank: HashMap<&str, (usize, &DocumentSnapshot)> = HashMap::new();
    let mut removed = Vec::new();
    for doc in previous {
        if new_ids.contains_key(doc.id.as_str()) {
            let rank = previous_rank.len();
            previous_rank.insert(doc.id.as_str(), (rank, doc));
        } else {
            removed.push(doc.clone());
        }
    }

    let mut added = Vec::new();
    let mut updated = Vec::new();
    let mut survivor_rank = 0;
    for doc in &documents {
        match previous_rank.get(doc.id.as_str()) {
            None => added.push(doc.clone()),
            Some(&(rank, old)) => {
                if old.value != doc.value || rank != survivor_rank {
                    updated.push(doc.clone());
                }
                survivor_rank += 1;
            }
        }
    }

    Diff {
        documents,
        added,
        updated,
        removed,
    }
}
