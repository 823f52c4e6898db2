/// User presence tracking for collaborative editing
/// Liveness is derived from heartbeats; stale records are dropped when read
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::{DocumentId, UserId};

/// What a user reports about themselves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Idle,
    Away,
}

/// Presence payload sent with every heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceData {
    pub status: PresenceStatus,

    /// Document the user currently has open
    pub document_id: Option<DocumentId>,
}

impl PresenceData {
    pub fn online(document_id: DocumentId) -> Self {
        Self {
            status: PresenceStatus::Online,
            document_id: Some(document_id),
        }
    }
}

/// Color assigned to a user for cursor/selection highlighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl UserColor {
    /// Generate a color based on user ID (deterministic, FNV-1a)
    pub fn from_user_id(user_id: &UserId) -> Self {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in user_id.as_str().bytes() {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        let [r, g, b, _] = hash.to_le_bytes();
        Self { r, g, b }
    }

    /// Convert to hex color string
    pub fn to_hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Stored presence for one user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub data: PresenceData,
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

/// A user that is currently considered live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveUser {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub document_id: Option<DocumentId>,
    pub color: UserColor,
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

/// Tracks the last heartbeat of every user
#[derive(Debug, Clone)]
pub struct PresenceSystem {
    heartbeat_interval: chrono::Duration,
    users: HashMap<UserId, PresenceRecord>,
}

impl PresenceSystem {
    pub fn new(heartbeat_interval: chrono::Duration) -> Self {
        Self {
            heartbeat_interval,
            users: HashMap::new(),
        }
    }

    pub fn heartbeat_interval(&self) -> chrono::Duration {
        self.heartbeat_interval
    }

    /// Add or refresh a user's presence
    pub fn update_presence(
        &mut self,
        user_id: UserId,
        data: PresenceData,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        self.users.insert(
            user_id,
            PresenceRecord {
                data,
                last_seen: now,
            },
        );
    }

    /// All live users, sorted by id. Records older than the heartbeat
    /// interval are evicted as part of the read.
    pub fn get_active_users(&mut self, now: chrono::DateTime<chrono::Utc>) -> Vec<ActiveUser> {
        self.evict_stale(now);

        let mut active: Vec<ActiveUser> = self
            .users
            .iter()
            .map(|(user_id, record)| ActiveUser {
                user_id: user_id.clone(),
                status: record.data.status,
                document_id: record.data.document_id.clone(),
                color: UserColor::from_user_id(user_id),
                last_seen: record.last_seen,
            })
            .collect();
        active.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        active
    }

    /// Live users that have `document_id` open
    pub fn active_users_in(
        &mut self,
        document_id: &DocumentId,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Vec<ActiveUser> {
        self.get_active_users(now)
            .into_iter()
            .filter(|user| user.document_id.as_ref() == Some(document_id))
            .collect()
    }

    pub fn get_user(&self, user_id: &UserId) -> Option<&PresenceRecord> {
        self.users.get(user_id)
    }

    pub fn clear(&mut self) {
        self.users.clear();
    }

    /// Number of stored records, stale ones included
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    fn evict_stale(&mut self, now: chrono::DateTime<chrono::Utc>) {
        let interval = self.heartbeat_interval;
        self.users.retain(|user_id, record| {
            let live = now - record.last_seen <= interval;
            if !live {
                debug!("Presence expired for user {}", user_id);
            }
            live
        });
    }
}
