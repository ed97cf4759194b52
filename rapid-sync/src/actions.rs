//! On-connect and on-disconnect actions.
//!
//! On-connect actions replay their write every time the connection comes
//! up, in registration order. One-shot actions are dropped after their first
//! successful acknowledgement. On-disconnect actions are registered with the
//! server as a last will, fire once when the connection goes down and are
//! discarded.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{RapidError, Result};
use crate::protocol::{Ack, WriteOp};

/// Lifecycle notifications for an action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionEvent {
    /// An on-connect write was acknowledged
    Executed,
    /// The connection went down and the on-disconnect action fired
    Fired,
    /// The server rejected the action's write or registration
    Failed(RapidError),
    /// The action was cancelled by the caller
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    OnConnect,
    OnDisconnect,
}

/// A registered action.
#[derive(Debug)]
pub struct Action {
    pub id: String,
    pub write: WriteOp,
    pub persistent: bool,
    notifier: mpsc::UnboundedSender<ActionEvent>,
}

/// Notification to send once the client lock is released.
#[derive(Debug)]
pub struct ActionNotice {
    pub notifier: mpsc::UnboundedSender<ActionEvent>,
    pub event: ActionEvent,
}

#[derive(Default)]
pub struct ActionRegistry {
    on_connect: Vec<Action>,
    on_disconnect: Vec<Action>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_on_connect(
        &mut self,
        write: WriteOp,
        persistent: bool,
        notifier: mpsc::UnboundedSender<ActionEvent>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        self.on_connect.push(Action {
            id: id.clone(),
            write,
            persistent,
            notifier,
        });
        id
    }

    pub fn register_on_disconnect(
        &mut self,
        write: WriteOp,
        notifier: mpsc::UnboundedSender<ActionEvent>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        self.on_disconnect.push(Action {
            id: id.clone(),
            write,
            persistent: false,
            notifier,
        });
        id
    }

    /// Writes to replay on connect, in registration order.
    pub fn on_connect_writes(&self) -> Vec<(String, WriteOp)> {
        self.on_connect
            .iter()
            .map(|a| (a.id.clone(), a.write.clone()))
            .collect()
    }

    #[cfg(test)]
    fn on_disconnect_write(&self, action_id: &str) -> Option<WriteOp> {
        self.on_disconnect
            .iter()
            .find(|a| a.id == action_id)
            .map(|a| a.write.clone())
    }

    /// Remove an action; the notice tells its owner.
    pub fn cancel(&mut self, action_id: &str) -> Option<(ActionKind, ActionNotice)> {
        let (kind, list) = if self.on_connect.iter().any(|a| a.id == action_id) {
            (ActionKind::OnConnect, &mut self.on_connect)
        } else {
            (ActionKind::OnDisconnect, &mut self.on_disconnect)
        };
        let index = list.iter().position(|a| a.id == action_id)?;
        let action = list.remove(index);
        Some((
            kind,
            ActionNotice {
                notifier: action.notifier,
                event: ActionEvent::Cancelled,
            },
        ))
    }

    /// Outcome of one replayed on-connect write.
    ///
    /// One-shot actions go away after success; any action goes away when
    /// the server denies permission, since replaying would fail again.
    pub fn on_connect_result(&mut self, action_id: &str, result: &Result<Ack>) -> Option<ActionNotice> {
        let index = self.on_connect.iter().position(|a| a.id == action_id)?;
        let remove = match result {
            Ok(_) => !self.on_connect[index].persistent,
            Err(RapidError::PermissionDenied(_)) => true,
            Err(_) => false,
        };
        let event = match result {
            Ok(_) => ActionEvent::Executed,
            Err(e) => ActionEvent::Failed(e.clone()),
        };
        let notifier = if remove {
            self.on_connect.remove(index).notifier
        } else {
            self.on_connect[index].notifier.clone()
        };
        Some(ActionNotice { notifier, event })
    }

    /// The server refused to register an on-disconnect action.
    pub fn on_disconnect_rejected(&mut self, action_id: &str, error: RapidError) -> Option<ActionNotice> {
        let index = self.on_disconnect.iter().position(|a| a.id == action_id)?;
        let action = self.on_disconnect.remove(index);
        log::warn!("On-disconnect action {action_id} rejected: {error}");
        Some(ActionNotice {
            notifier: action.notifier,
            event: ActionEvent::Failed(error),
        })
    }

    /// Fire every on-disconnect action once, in registration order, and
    /// forget them.
    pub fn fire_on_disconnect(&mut self) -> Vec<ActionNotice> {
        self.on_disconnect
            .drain(..)
            .map(|a| ActionNotice {
                notifier: a.notifier,
                event: ActionEvent::Fired,
            })
            .collect()
    }

    #[cfg(test)]
    fn on_connect_len(&self) -> usize {
        self.on_connect.len()
    }

    #[cfg(test)]
    fn on_disconnect_len(&self) -> usize {
        self.on_disconnect.len()
    }
}
