use crate::session::{CameraId, SessionId, SessionPhase, ViewerId};
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for the camcast system
#[derive(Error, Debug)]
pub enum CamcastError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl CamcastError {
    /// Create a system-level error
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    /// Create a component-scoped error
    pub fn component<C: Into<String>, M: Into<String>>(component: C, message: M) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the failed operation can succeed without
    /// tearing the session down
    pub fn is_recoverable(&self) -> bool {
        match self {
            CamcastError::Signaling(e) => e.is_recoverable(),
            CamcastError::Media(MediaError::Engine { .. }) => true,
            CamcastError::EventBus(EventBusError::PublishFailed { .. }) => true,
            _ => false,
        }
    }
}

/// Errors from the signaling transport and relay layer
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Signaling transport unavailable: {details}")]
    TransportUnavailable { details: String },

    #[error(
        "Stale message for session {session}: incarnation {incarnation} behind current {current}"
    )]
    StaleMessage {
        session: SessionId,
        incarnation: u64,
        current: u64,
    },

    #[error("Failed to encode signaling message: {details}")]
    Encode { details: String },

    #[error("Failed to decode signaling message at {path}: {details}")]
    Decode { path: String, details: String },

    #[error("Signaling subscription closed for session {session}")]
    SubscriptionClosed { session: SessionId },

    #[error("Signaling relay closed")]
    RelayClosed,
}

impl SignalingError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SignalingError::TransportUnavailable { .. }
                | SignalingError::SubscriptionClosed { .. }
        )
    }
}

/// Errors from session lifecycle management
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Negotiation for session {session} timed out after {timeout:?}")]
    NegotiationTimeout {
        session: SessionId,
        timeout: Duration,
    },

    #[error("Camera {camera} at capacity ({capacity}), rejecting viewer {viewer}")]
    CapacityExceeded {
        camera: CameraId,
        viewer: ViewerId,
        capacity: usize,
    },

    #[error("Session {session} exhausted {attempts} reconnect attempts")]
    ReconnectExhausted { session: SessionId, attempts: u32 },

    #[error("Session {session} is closed and accepts no further commands")]
    Terminal { session: SessionId },

    #[error("Illegal phase transition for session {session}: {from} -> {to}")]
    InvalidTransition {
        session: SessionId,
        from: SessionPhase,
        to: SessionPhase,
    },

    #[error("Worker task for session {session} is gone")]
    WorkerGone { session: SessionId },
}

/// Errors from the media engine boundary
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Media engine {operation} failed for session {session}: {details}")]
    Engine {
        session: SessionId,
        operation: &'static str,
        details: String,
    },

    #[error("Media engine has no session {session}")]
    UnknownSession { session: SessionId },
}

/// Errors from the broadcast event bus
#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Failed to publish event: {details}")]
    PublishFailed { details: String },

    #[error("Event bus channel closed")]
    ChannelClosed,
}

/// Result type alias for camcast operations
pub type Result<T> = std::result::Result<T, CamcastError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;

    #[test]
    fn test_error_display() {
        let session = SessionId::from("ab12cd34ef56");
        let err = SessionError::NegotiationTimeout {
            session: session.clone(),
            timeout: Duration::from_secs(15),
        };
        assert!(err.to_string().contains("timed out"));

        let err = SignalingError::StaleMessage {
            session,
            incarnation: 1,
            current: 2,
        };
        assert!(err.to_string().contains("incarnation 1"));
    }

    #[test]
    fn test_recoverability() {
        let transient: CamcastError = SignalingError::TransportUnavailable {
            details: "connection reset".to_string(),
        }
        .into();
        assert!(transient.is_recoverable());

        let fatal: CamcastError = SessionError::Terminal {
            session: SessionId::from("ab12cd34ef56"),
        }
        .into();
        assert!(!fatal.is_recoverable());
    }

    #[test]
    fn test_component_constructor() {
        let err = CamcastError::component("session_manager", "spawn failed");
        assert!(err.to_string().contains("session_manager"));
        assert!(!err.is_recoverable());
    }
}
