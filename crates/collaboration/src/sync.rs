/// JSON messages exchanged between clients and a host wrapping the engine
use serde::{Deserialize, Serialize};

use crate::{
    ActiveUser, AppliedOperation, CollaborationError, ConnectResponse, DocumentId, Operation,
    PresenceData, SessionId, UserId,
};

/// Messages sent by clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Connect {
        user_id: UserId,
        document_id: DocumentId,
    },

    Operation {
        session_id: SessionId,
        document_id: DocumentId,
        operation: Operation,

        /// Document version the client had seen when it issued the edit.
        /// Absent means "rebase against the whole history".
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_version: Option<u64>,
    },

    SyncRequest {
        document_id: DocumentId,
        since: u64,
    },

    Presence {
        user_id: UserId,
        data: PresenceData,
    },

    ActiveUsers,

    Ping,
}

/// Messages sent by the host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        document_id: DocumentId,
        #[serde(flatten)]
        response: ConnectResponse,
    },

    /// Acknowledges the sender's own operation
    OperationApplied {
        document_id: DocumentId,
        #[serde(flatten)]
        applied: AppliedOperation,
    },

    /// An operation accepted from another client on the same document
    RemoteOperation {
        document_id: DocumentId,
        operation: Operation,
        version: u64,
    },

    SyncResponse {
        document_id: DocumentId,
        operations: Vec<Operation>,
        version: u64,
    },

    ActiveUsers {
        users: Vec<ActiveUser>,
    },

    Error {
        kind: String,
        message: String,
    },

    Pong,
}

impl ServerMessage {
    /// Map an engine error to a protocol error with a stable `kind`
    pub fn from_error(error: &CollaborationError) -> Self {
        let kind = match error {
            CollaborationError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            CollaborationError::PermissionDenied(_) => "permission_denied",
            CollaborationError::OutOfBoundsOperation { .. }
            | CollaborationError::PositionUnderflow { .. } => "out_of_bounds_operation",
            CollaborationError::InvalidOperation(_) => "invalid_operation",
            CollaborationError::UnknownVersion { .. } => "unknown_version",
            CollaborationError::DocumentNotFound(_) => "document_not_found",
            CollaborationError::InvalidConfig(_) => "invalid_config",
            CollaborationError::ShutDown => "shut_down",
        };

        ServerMessage::Error {
            kind: kind.to_string(),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_operation_message() {
        let session_id = SessionId::new();
        let json = format!(
            r#"{{
                "type": "operation",
                "session_id": "{}",
                "document_id": "doc1",
                "operation": {{ "kind": "delete", "position": 2, "content": "ab" }}
            }}"#,
            session_id
        );

        let msg: ClientMessage = serde_json::from_str(&json).unwrap();
        match msg {
            ClientMessage::Operation {
                session_id: parsed,
                document_id,
                operation,
                base_version,
            } => {
                assert_eq!(parsed, session_id);
                assert_eq!(document_id, DocumentId::from("doc1"));
                assert_eq!(operation, Operation::delete(2, "ab"));
                assert_eq!(base_version, None);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_operation_is_rejected_at_the_boundary() {
        let json = r#"{ "type": "operation", "session_id": "not-a-uuid",
                        "document_id": "doc1",
                        "operation": { "kind": "replace", "position": -1, "content": "" } }"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }

    #[test]
    fn test_error_kinds() {
        let msg = ServerMessage::from_error(&CollaborationError::PermissionDenied(
            "session may not edit doc1".to_string(),
        ));
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "permission_denied");

        let msg = ServerMessage::from_error(&CollaborationError::PositionUnderflow {
            position: 1,
            shift: 3,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "out_of_bounds_operation");
    }

    #[test]
    fn test_operation_applied_is_flat() {
        let msg = ServerMessage::OperationApplied {
            document_id: DocumentId::from("doc1"),
            applied: AppliedOperation {
                document: "Hello".to_string(),
                operation: Operation::insert(0, "Hello"),
                version: 1,
            },
        };
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "operation_applied");
        assert_eq!(json["document"], "Hello");
        assert_eq!(json["version"], 1);
        assert_eq!(json["operation"]["kind"], "insert");
    }
}
