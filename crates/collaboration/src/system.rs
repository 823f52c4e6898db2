/// Engine entry point used by the transport layer
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    ActiveUser, Capability, Clock, CollaborationError, ConflictResolver, DocumentId,
    EngineConfig, Operation, PresenceData, PresenceSystem, RateLimiter, Result,
    SecurityManager, SessionId, SystemClock, UserId,
};

/// Returned by [`CollaborationSystem::connect`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub session_id: SessionId,
    pub document: String,
    pub version: u64,
    pub active_users: Vec<ActiveUser>,
}

/// Returned by [`CollaborationSystem::apply_operation`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedOperation {
    /// Document text after the operation
    pub document: String,

    /// The operation as it was actually applied
    pub operation: Operation,

    /// Document version after the operation
    pub version: u64,
}

/// Point-in-time copy of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub content: String,
    pub version: u64,
}

/// Text and history of one document, always locked together
#[derive(Debug, Default)]
struct DocumentState {
    content: String,
    resolver: ConflictResolver,
}

/// Collaborative editing engine.
///
/// Every method takes `&self`; share it across connection tasks behind an
/// `Arc`. Edits to one document are serialized by that document's lock, so
/// rebase, bounds check, apply and append happen as one unit. Edits to
/// different documents proceed in parallel.
pub struct CollaborationSystem {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    rate_limiter: RateLimiter,
    presence: Mutex<PresenceSystem>,
    security: RwLock<SecurityManager>,
    documents: DashMap<DocumentId, Arc<Mutex<DocumentState>>>,
    shut_down: AtomicBool,
}

impl CollaborationSystem {
    /// Build an engine on the system clock. Fails with `InvalidConfig` when
    /// an interval is zero or out of range.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, clock))
    }

    fn build(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            rate_limiter: RateLimiter::new(config.rate_limit),
            presence: Mutex::new(PresenceSystem::new(config.heartbeat_interval())),
            security: RwLock::new(SecurityManager::new()),
            documents: DashMap::new(),
            shut_down: AtomicBool::new(false),
            clock,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open a session for `user_id` on `document_id`.
    ///
    /// Creates the document as an empty string the first time it is seen.
    pub fn connect(&self, user_id: UserId, document_id: DocumentId) -> Result<ConnectResponse> {
        self.ensure_running()?;
        let now = self.clock.now();
        self.admit(user_id.as_str(), now)?;

        let session_id =
            self.security
                .write()
                .create_session(user_id.clone(), document_id.clone(), now);

        let active_users = {
            let mut presence = self.presence.lock();
            presence.update_presence(user_id.clone(), PresenceData::online(document_id.clone()), now);
            presence.get_active_users(now)
        };

        let snapshot = {
            let document = self.document_entry(&document_id);
            let state = document.lock();
            DocumentSnapshot {
                content: state.content.clone(),
                version: state.resolver.version(),
            }
        };

        info!(
            "User {} connected to document {} (session {}, version {})",
            user_id, document_id, session_id, snapshot.version
        );

        Ok(ConnectResponse {
            session_id,
            document: snapshot.content,
            version: snapshot.version,
            active_users,
        })
    }

    /// Rebase `operation` against the document's entire history and apply it
    pub fn apply_operation(
        &self,
        session_id: SessionId,
        document_id: &DocumentId,
        operation: Operation,
    ) -> Result<AppliedOperation> {
        self.apply(session_id, document_id, operation, 0)
    }

    /// Rebase `operation` against the operations accepted after
    /// `known_version` and apply it
    pub fn apply_operation_since(
        &self,
        session_id: SessionId,
        document_id: &DocumentId,
        operation: Operation,
        known_version: u64,
    ) -> Result<AppliedOperation> {
        self.apply(session_id, document_id, operation, known_version)
    }

    /// Replace the capabilities of `user_id` on `document_id`
    pub fn set_permissions<I>(
        &self,
        document_id: DocumentId,
        user_id: UserId,
        capabilities: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = Capability>,
    {
        self.ensure_running()?;
        debug!("Setting permissions for {} on {}", user_id, document_id);
        self.security
            .write()
            .set_permissions(document_id, user_id, capabilities);
        Ok(())
    }

    /// Record a heartbeat from `user_id`
    pub fn update_presence(&self, user_id: UserId, data: PresenceData) -> Result<()> {
        self.ensure_running()?;
        let now = self.clock.now();
        self.presence.lock().update_presence(user_id, data, now);
        Ok(())
    }

    /// Users whose last heartbeat is within the liveness window
    pub fn get_active_users(&self) -> Result<Vec<ActiveUser>> {
        self.ensure_running()?;
        let now = self.clock.now();
        Ok(self.presence.lock().get_active_users(now))
    }

    /// Live users that have `document_id` open
    pub fn active_users_in(&self, document_id: &DocumentId) -> Result<Vec<ActiveUser>> {
        self.ensure_running()?;
        let now = self.clock.now();
        Ok(self.presence.lock().active_users_in(document_id, now))
    }

    pub fn document(&self, document_id: &DocumentId) -> Result<DocumentSnapshot> {
        self.ensure_running()?;
        let document = self.existing_document(document_id)?;
        let state = document.lock();
        Ok(DocumentSnapshot {
            content: state.content.clone(),
            version: state.resolver.version(),
        })
    }

    /// Operations accepted after `version`, for clients catching up
    pub fn operations_since(&self, document_id: &DocumentId, version: u64) -> Result<Vec<Operation>> {
        self.ensure_running()?;
        let document = self.existing_document(document_id)?;
        let state = document.lock();
        Ok(state.resolver.operations_since(version)?.to_vec())
    }

    /// Drop expired presence records and idle rate-limit windows
    pub fn purge_idle(&self) -> Result<()> {
        self.ensure_running()?;
        let now = self.clock.now();
        self.rate_limiter.cleanup(now);
        self.presence.lock().get_active_users(now);
        Ok(())
    }

    /// Release all engine state. Every later call fails with
    /// [`CollaborationError::ShutDown`].
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let documents = self.documents.len();
        self.documents.clear();
        self.security.write().clear();
        self.presence.lock().clear();
        self.rate_limiter.clear();

        info!("Collaboration engine shut down ({} documents released)", documents);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn apply(
        &self,
        session_id: SessionId,
        document_id: &DocumentId,
        operation: Operation,
        known_version: u64,
    ) -> Result<AppliedOperation> {
        self.ensure_running()?;
        let now = self.clock.now();
        self.admit(&session_id.to_string(), now)?;

        let user_id = {
            let security = self.security.read();
            if !security.check_permission(&session_id, document_id, Capability::Edit) {
                warn!("Session {} denied edit on {}", session_id, document_id);
                return Err(CollaborationError::PermissionDenied(format!(
                    "session {} may not edit {}",
                    session_id, document_id
                )));
            }
            security
                .session(&session_id)
                .map(|session| session.user_id.clone())
                .ok_or_else(|| {
                    CollaborationError::PermissionDenied(format!("unknown session {}", session_id))
                })?
        };

        operation.validate()?;

        let document = self.existing_document(document_id)?;
        let mut state = document.lock();

        let rebased = state.resolver.rebase(&operation, known_version)?;
        if let Err(e) = rebased.apply_to(&mut state.content) {
            warn!(
                "Rejected {:?} from {} on {}: {}",
                rebased.kind, user_id, document_id, e
            );
            return Err(e);
        }
        state.resolver.record(&user_id, rebased.clone());

        let version = state.resolver.version();
        debug!(
            "Applied {:?} at {} from {} on {} (version {})",
            rebased.kind, rebased.position, user_id, document_id, version
        );

        Ok(AppliedOperation {
            document: state.content.clone(),
            operation: rebased,
            version,
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(CollaborationError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn admit(&self, actor: &str, now: chrono::DateTime<chrono::Utc>) -> Result<()> {
        self.rate_limiter.check(actor, now).map_err(|retry_after| {
            warn!("Rate limit exceeded for {}", actor);
            CollaborationError::RateLimitExceeded {
                actor: actor.to_string(),
                retry_after_ms: retry_after.num_milliseconds().max(0) as u64,
            }
        })
    }

    fn document_entry(&self, document_id: &DocumentId) -> Arc<Mutex<DocumentState>> {
        self.documents
            .entry(document_id.clone())
            .or_insert_with(|| {
                debug!("Creating document {}", document_id);
                Arc::new(Mutex::new(DocumentState::default()))
            })
            .value()
            .clone()
    }

    fn existing_document(&self, document_id: &DocumentId) -> Result<Arc<Mutex<DocumentState>>> {
        self.documents
            .get(document_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CollaborationError::DocumentNotFound(document_id.clone()))
    }
}

impl Default for CollaborationSystem {
    fn default() -> Self {
        Self::build(EngineConfig::default(), Arc::new(SystemClock))
    }
}

impl Drop for CollaborationSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
