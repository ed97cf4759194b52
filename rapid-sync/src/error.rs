//! Error type shared by every layer of the client.
//!
//! Server-reported errors arrive as `{kind, message?}` objects inside `err`
//! frames; [`RapidError::from_wire`] and [`RapidError::to_wire`] map between
//! the two representations.

use serde::{Deserialize, Serialize};

/// Errors surfaced to callers of the sync client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RapidError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Write conflict: document changed since it was read")]
    Conflict,

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Server error: {0}")]
    Generic(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Optimistic execution aborted")]
    Aborted,

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, RapidError>;

impl From<serde_json::Error> for RapidError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

/// Error object carried in the `data` of an `err` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RapidError {
    /// Build an error from the wire representation.
    ///
    /// Unknown kinds degrade to [`RapidError::Generic`].
    pub fn from_wire(wire: WireError) -> Self {
        let message = wire.message.unwrap_or_default();
        match wire.kind.as_str() {
            "permission-denied" => Self::PermissionDenied(message),
            "timeout" => Self::Timeout,
            "conflict" => Self::Conflict,
            "invalid-query" => Self::InvalidQuery(message),
            "generic" => Self::Generic(message),
            other => {
                log::debug!("Unknown error kind '{other}' from server");
                Self::Generic(message)
            }
        }
    }

    /// Wire representation, used by the reference server.
    ///
    /// Client-local variants are reported as `generic`.
    pub fn to_wire(&self) -> WireError {
        let (kind, message) = match self {
            Self::PermissionDenied(m) => ("permission-denied", Some(m.clone())),
            Self::Timeout => ("timeout", None),
            Self::Conflict => ("conflict", None),
            Self::InvalidQuery(m) => ("invalid-query", Some(m.clone())),
            Self::Generic(m) => ("generic", Some(m.clone())),
            other => ("generic", Some(other.to_string())),
        };
        WireError {
            kind: kind.to_string(),
            message: message.filter(|m| !m.is_empty()),
        }
    }

    /// Whether an optimistic execution should retry after this error.
    pub fn is_retryable_conflict(&self) -> bool {
        matches!(self, Self::Conflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_kinds_map_to_variants() {
        let denied = RapidError::from_wire(WireError {
            kind: "permission-denied".into(),
            message: Some("rules".into()),
        });
        assert_eq!(denied, RapidError::PermissionDenied("rules".into()));

        let conflict = RapidError::from_wire(WireError { kind: "conflict".into(), message: None });
        assert_eq!(conflict, RapidError::Conflict);
    }

    #[test]
    fn test_unknown_kind_is_generic() {
        let err = RapidError::from_wire(WireError {
            kind: "quota".into(),
            message: Some("too many".into()),
        });
        assert_eq!(err, RapidError::Generic("too many".into()));
    }

    #[test]
    fn test_to_wire_keeps_message() {
        let wire = RapidError::InvalidQuery("limit".into()).to_wire();
        assert_eq!(wire.kind, "invalid-query");
        assert_eq!(wire.message.as_deref(), Some("limit"));

        let wire = RapidError::Timeout.to_wire();
        assert_eq!(wire.kind, "timeout");
        assert!(wire.message.is_none());
    }

    #[test]
    fn test_only_conflict_is_retryable() {
        assert!(RapidError::Conflict.is_retryable_conflict());
        assert!(!RapidError::Timeout.is_retryable_conflict());
        assert!(!RapidError::ConnectionLost.is_retryable_conflict());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(RapidError::Timeout.to_string(), "Request timed out");
        assert_eq!(
            RapidError::PermissionDenied("no".into()).to_string(),
            "Permission denied: no"
        );
    }
}
