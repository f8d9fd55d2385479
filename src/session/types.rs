use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

use super::SessionPhase;

/// Stable identifier of a publishing camera device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(String);

impl CameraId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CameraId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CameraId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a viewing endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewerId(String);

impl ViewerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ViewerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ViewerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of one publisher-viewer media relationship.
///
/// Generated at session creation and never reused for a different
/// (camera, viewer) pair while that session is live. Renegotiation
/// keeps the id and bumps the incarnation instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh session id.
    ///
    /// Short code taken from the tail segment of a v4 UUID, compact
    /// enough to serve as a relay path segment.
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4().to_string();
        let tail = uuid.rsplit('-').next().unwrap_or(uuid.as_str());
        Self(tail.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sender role on a session's signaling channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Publisher,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Viewer => "viewer",
        }
    }

    /// The role at the other end of the channel
    pub fn peer(&self) -> Role {
        match self {
            Role::Publisher => Role::Viewer,
            Role::Viewer => Role::Publisher,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A viewer's request to join a camera, as read from the relay intake path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub viewer: ViewerId,
    /// Display name shown in session listings, if the viewer provided one
    pub display_name: Option<String>,
    pub requested_at: DateTime<Utc>,
}

impl JoinRequest {
    pub fn new<V: Into<ViewerId>>(viewer: V) -> Self {
        Self {
            viewer: viewer.into(),
            display_name: None,
            requested_at: Utc::now(),
        }
    }

    pub fn with_display_name<S: Into<String>>(mut self, name: S) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// Point-in-time view of one session for status queries
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session: SessionId,
    pub camera: CameraId,
    pub viewer: ViewerId,
    pub phase: SessionPhase,
    pub incarnation: u64,
    pub reconnect_attempts: u32,
    pub created_at: SystemTime,
    pub last_activity: SystemTime,
}
