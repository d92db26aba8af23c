// Core coordination types shared across all Tandem crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MAX_OBJECT_TYPE_LEN: usize = 64;
pub const MAX_OBJECT_ID_LEN: usize = 128;

/// Addresses one business object inside a workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub object_type: String,
    pub object_id: String,
}

impl ObjectRef {
    pub fn new(object_type: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self { object_type: object_type.into(), object_id: object_id.into() }
    }

    /// Object types are lowercase identifiers (`organization`, `use_case`); ids are opaque
    /// but bounded and free of whitespace.
    pub fn validate(&self) -> Result<(), ObjectRefError> {
        let object_type = self.object_type.as_str();
        if object_type.is_empty() || object_type.len() > MAX_OBJECT_TYPE_LEN {
            return Err(ObjectRefError::InvalidObjectType(self.object_type.clone()));
        }
        if !object_type.chars().all(|ch| ch.is_ascii_lowercase() || ch == '_' || ch == '-') {
            return Err(ObjectRefError::InvalidObjectType(self.object_type.clone()));
        }

        let object_id = self.object_id.as_str();
        if object_id.is_empty()
            || object_id.len() > MAX_OBJECT_ID_LEN
            || object_id.chars().any(|ch| ch.is_whitespace() || ch.is_control())
        {
            return Err(ObjectRefError::InvalidObjectId(self.object_id.clone()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectRefError {
    #[error("objectType '{0}' must be 1-64 lowercase characters")]
    InvalidObjectType(String),
    #[error("objectId '{0}' must be 1-128 characters without whitespace")]
    InvalidObjectId(String),
}

/// An exclusive, TTL-bounded claim on one object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    pub workspace_id: Uuid,
    pub object_type: String,
    pub object_id: String,
    pub locked_by_user_id: Uuid,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_unlock_requested_by_user_id: Option<Uuid>,
}

impl Lock {
    pub fn object(&self) -> ObjectRef {
        ObjectRef::new(self.object_type.clone(), self.object_id.clone())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_held_by(&self, user_id: Uuid) -> bool {
        self.locked_by_user_id == user_id
    }
}

/// A heartbeat from one user viewing one object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub workspace_id: Uuid,
    pub object_type: String,
    pub object_id: String,
    pub user_id: Uuid,
    pub last_seen_at: DateTime<Utc>,
}
