//! Server-centralized collaborative text editing.
//!
//! Concurrent edits from many clients are admitted one at a time per
//! document, rebased against the operations already accepted, and applied to
//! the authoritative document text. Sessions, capabilities, presence and
//! request-rate limits are enforced before any mutation is admitted.
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod operations;
pub use operations::*;

mod conflict;
pub use conflict::*;

mod presence;
pub use presence::*;

mod security;
pub use security::*;

mod rate_limit;
pub use rate_limit::*;

mod config;
pub use config::*;

mod system;
pub use system::*;

mod sync;
pub use sync::*;

#[derive(Debug, Error)]
pub enum CollaborationError {
    #[error("rate limit exceeded for {actor}, retry in {retry_after_ms}ms")]
    RateLimitExceeded { actor: String, retry_after_ms: u64 },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error(
        "operation out of bounds: position {position} with length {length} \
         does not fit a document of length {document_length}"
    )]
    OutOfBoundsOperation {
        position: usize,
        length: usize,
        document_length: usize,
    },

    #[error("rebased position {position} minus {shift} falls before the start of the document")]
    PositionUnderflow { position: usize, shift: usize },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("unknown version {requested}, document is at version {current}")]
    UnknownVersion { requested: u64, current: u64 },

    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("collaboration engine has been shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

/// User identifier, as authenticated by the upstream identity provider
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Opaque document identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Session token handed out by `connect`.
///
/// Backed by a v4 UUID drawn from the OS random source, so it cannot be
/// guessed from other tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of wall-clock time for presence and rate limiting
pub trait Clock: Send + Sync {
    fn now(&self) -> chrono::DateTime<chrono::Utc>;
}

/// Reads the system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }
}

/// Clock that only moves when told to. Used to drive expiry deterministically.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<chrono::DateTime<chrono::Utc>>,
}

impl ManualClock {
    pub fn new(start: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: chrono::DateTime<chrono::Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(chrono::Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        *self.now.lock()
    }
}
