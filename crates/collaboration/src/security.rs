/// Sessions and per-document capabilities
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::{CollaborationError, DocumentId, SessionId, UserId};

/// A named permission granted to a user on one document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    View,
    Comment,
    Edit,
    Admin,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::View => "view",
            Capability::Comment => "comment",
            Capability::Edit => "edit",
            Capability::Admin => "admin",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Capability {
    type Err = CollaborationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "view" => Ok(Capability::View),
            "comment" => Ok(Capability::Comment),
            "edit" => Ok(Capability::Edit),
            "admin" => Ok(Capability::Admin),
            other => Err(CollaborationError::PermissionDenied(format!(
                "unknown capability '{}'",
                other
            ))),
        }
    }
}

/// Binding asserted by a session token. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub document_id: DocumentId,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Issues session tokens and stores capability sets
#[derive(Debug, Clone, Default)]
pub struct SecurityManager {
    sessions: HashMap<SessionId, Session>,
    permissions: HashMap<(DocumentId, UserId), HashSet<Capability>>,
}

impl SecurityManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh token bound to `(user_id, document_id)`
    pub fn create_session(
        &mut self,
        user_id: UserId,
        document_id: DocumentId,
        now: chrono::DateTime<chrono::Utc>,
    ) -> SessionId {
        let id = SessionId::new();
        self.sessions.insert(
            id,
            Session {
                id,
                user_id,
                document_id,
                created_at: now,
            },
        );
        id
    }

    /// True iff the session exists and is bound to `document_id`
    pub fn validate_session(&self, session_id: &SessionId, document_id: &DocumentId) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|session| session.document_id == *document_id)
    }

    pub fn session(&self, session_id: &SessionId) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    /// Replace the capability set of `user_id` on `document_id`
    pub fn set_permissions<I>(&mut self, document_id: DocumentId, user_id: UserId, capabilities: I)
    where
        I: IntoIterator<Item = Capability>,
    {
        self.permissions
            .insert((document_id, user_id), capabilities.into_iter().collect());
    }

    pub fn permissions(&self, document_id: &DocumentId, user_id: &UserId) -> HashSet<Capability> {
        self.permissions
            .get(&(document_id.clone(), user_id.clone()))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether the session's user holds `action` on `document_id`.
    ///
    /// Unknown sessions, sessions bound to another document, and missing
    /// grants all answer `false`.
    pub fn check_permission(
        &self,
        session_id: &SessionId,
        document_id: &DocumentId,
        action: Capability,
    ) -> bool {
        let Some(session) = self.sessions.get(session_id) else {
            return false;
        };
        if session.document_id != *document_id {
            return false;
        }

        self.permissions
            .get(&(document_id.clone(), session.user_id.clone()))
            .is_some_and(|caps| caps.contains(&action))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
        self.permissions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sessions_are_bound_to_one_document() {
        let mut security = SecurityManager::new();
        let doc1 = DocumentId::from("doc1");
        let doc2 = DocumentId::from("doc2");

        let session = security.create_session(UserId::from("u1"), doc1.clone(), chrono::Utc::now());

        assert!(security.validate_session(&session, &doc1));
        assert!(!security.validate_session(&session, &doc2));
        assert!(!security.validate_session(&SessionId::new(), &doc1));
    }

    #[test]
    fn test_multiple_sessions_per_user() {
        let mut security = SecurityManager::new();
        let now = chrono::Utc::now();

        let a = security.create_session(UserId::from("u1"), DocumentId::from("doc1"), now);
        let b = security.create_session(UserId::from("u1"), DocumentId::from("doc1"), now);

        assert_ne!(a, b);
        assert_eq!(security.session_count(), 2);
    }

    #[test]
    fn test_check_permission() {
        let mut security = SecurityManager::new();
        let doc = DocumentId::from("doc1");
        let user = UserId::from("u1");
        let session = security.create_session(user.clone(), doc.clone(), chrono::Utc::now());

        assert!(!security.check_permission(&session, &doc, Capability::Edit));

        security.set_permissions(doc.clone(), user, [Capability::View, Capability::Edit]);
        assert!(security.check_permission(&session, &doc, Capability::Edit));
        assert!(security.check_permission(&session, &doc, Capability::Edit));
        assert!(!security.check_permission(&session, &doc, Capability::Admin));

        // Grant on the document does not leak to other documents
        assert!(!security.check_permission(&session, &DocumentId::from("doc2"), Capability::Edit));
        assert!(!security.check_permission(&SessionId::new(), &doc, Capability::Edit));
    }

    #[test]
    fn test_set_permissions_replaces() {
        let mut security = SecurityManager::new();
        let doc = DocumentId::from("doc1");
        let user = UserId::from("u1");

        security.set_permissions(doc.clone(), user.clone(), [Capability::Edit]);
        security.set_permissions(doc.clone(), user.clone(), [Capability::View]);

        let caps = security.permissions(&doc, &user);
        assert_eq!(caps.len(), 1);
        assert!(caps.contains(&Capability::View));
    }

    #[test]
    fn test_capability_strings() {
        assert_eq!("edit".parse::<Capability>().unwrap(), Capability::Edit);
        assert_eq!(Capability::View.to_string(), "view");
        assert!("sudo".parse::<Capability>().is_err());
    }
}
