use super::{CameraId, Role, SessionId, SessionSnapshot, ViewerId};
use crate::error::SessionError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use tracing::debug;

/// Lifecycle phase of a session.
///
/// Closed is terminal. A session that reaches it never transitions
/// again; the manager evicts it after a grace period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Offering,
    AnsweringWait,
    Negotiating,
    Connected,
    Degraded,
    Reconnecting,
    Closed(CloseReason),
}

impl SessionPhase {
    /// Whether this phase admits no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Closed(_))
    }

    /// Whether media is (possibly degraded but) established
    pub fn is_live(&self) -> bool {
        matches!(self, SessionPhase::Connected | SessionPhase::Degraded)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Offering => "offering",
            SessionPhase::AnsweringWait => "answering_wait",
            SessionPhase::Negotiating => "negotiating",
            SessionPhase::Connected => "connected",
            SessionPhase::Degraded => "degraded",
            SessionPhase::Reconnecting => "reconnecting",
            SessionPhase::Closed(_) => "closed",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Closed(reason) => write!(f, "closed({})", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Why a session reached its terminal phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The remote endpoint sent Bye
    RemoteBye,
    /// The owning manager requested teardown (stop request, eviction,
    /// camera going offline)
    LocalTeardown,
    /// No Answer arrived within the negotiation timeout
    NegotiationTimeout,
    /// Renegotiation failed after the bounded number of attempts
    ReconnectExhausted,
    /// The signaling channel closed and could not be reacquired
    TransportLost,
    /// The media engine rejected the negotiated parameters
    MediaFailure,
    /// Process shutdown
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::RemoteBye => "remote_bye",
            CloseReason::LocalTeardown => "local_teardown",
            CloseReason::NegotiationTimeout => "negotiation_timeout",
            CloseReason::ReconnectExhausted => "reconnect_exhausted",
            CloseReason::TransportLost => "transport_lost",
            CloseReason::MediaFailure => "media_failure",
            CloseReason::Shutdown => "shutdown",
        };
        write!(f, "{}", s)
    }
}

/// Check whether a phase edge is legal.
///
/// Closing is allowed from every non-terminal phase. Everything else
/// follows the negotiation ladder, with the Degraded/Reconnecting
/// recovery loop on top of Connected.
pub fn can_transition(from: &SessionPhase, to: &SessionPhase) -> bool {
    use SessionPhase::*;

    if from.is_terminal() {
        return false;
    }

    match (from, to) {
        (_, Closed(_)) => true,
        (Idle, Offering) => true,
        (Offering, AnsweringWait) => true,
        (AnsweringWait, Negotiating) => true,
        (Negotiating, Connected) => true,
        (Connected, Degraded) => true,
        (Degraded, Connected) => true,
        (Degraded, Reconnecting) => true,
        (Reconnecting, Connected) => true,
        _ => false,
    }
}

/// Mutable state owned by a single session's worker task.
///
/// All mutation goes through that one task, so transitions for a
/// session are serialized by construction.
#[derive(Debug)]
pub struct SessionState {
    pub session: SessionId,
    pub camera: CameraId,
    pub viewer: ViewerId,
    pub role: Role,
    phase: SessionPhase,
    /// Negotiation lifetime of this session id; bumped on renegotiation
    incarnation: u64,
    /// Next outgoing sequence number; never reset, also not on renegotiation
    next_seq: u64,
    pub reconnect_attempts: u32,
    pub created_at: SystemTime,
    pub last_activity: SystemTime,
    /// Negotiated parameters once established (opaque to this layer)
    pub local_params: Option<Bytes>,
    pub remote_params: Option<Bytes>,
}

impl SessionState {
    pub fn new(session: SessionId, camera: CameraId, viewer: ViewerId, role: Role) -> Self {
        let now = SystemTime::now();
        Self {
            session,
            camera,
            viewer,
            role,
            phase: SessionPhase::Idle,
            incarnation: 1,
            next_seq: 0,
            reconnect_attempts: 0,
            created_at: now,
            last_activity: now,
            local_params: None,
            remote_params: None,
        }
    }

    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    /// Apply a phase transition, enforcing terminality and edge legality
    pub fn transition(&mut self, to: SessionPhase) -> Result<SessionPhase, SessionError> {
        if self.phase.is_terminal() {
            return Err(SessionError::Terminal {
                session: self.session.clone(),
            });
        }

        if !can_transition(&self.phase, &to) {
            return Err(SessionError::InvalidTransition {
                session: self.session.clone(),
                from: self.phase.clone(),
                to,
            });
        }

        let previous = std::mem::replace(&mut self.phase, to);
        self.touch();
        debug!(
            session = %self.session,
            from = %previous,
            to = %self.phase,
            "Session phase transition"
        );
        Ok(previous)
    }

    /// Assign the next outgoing sequence number (monotonic per session and role)
    pub fn assign_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Whether a message from the given negotiation lifetime applies to
    /// the current one
    pub fn accepts_incarnation(&self, incarnation: u64) -> bool {
        incarnation == self.incarnation
    }

    /// Start a fresh offer/answer cycle on the same session id.
    ///
    /// Bumps the incarnation so late messages from the previous cycle
    /// are recognizably stale. Sequence numbers keep counting.
    pub fn begin_renegotiation(&mut self) -> u64 {
        self.incarnation += 1;
        self.reconnect_attempts += 1;
        self.remote_params = None;
        self.touch();
        self.incarnation
    }

    /// Record activity for idle accounting
    pub fn touch(&mut self) {
        self.last_activity = SystemTime::now();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session: self.session.clone(),
            camera: self.camera.clone(),
            viewer: self.viewer.clone(),
            phase: self.phase.clone(),
            incarnation: self.incarnation,
            reconnect_attempts: self.reconnect_attempts,
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_state() -> SessionState {
        SessionState::new(
            SessionId::from("ab12cd34ef56"),
            CameraId::from("cam0"),
            ViewerId::from("viewer1"),
            Role::Publisher,
        )
    }

    #[test]
    fn test_negotiation_ladder() {
        let mut state = new_state();

        assert_eq!(*state.phase(), SessionPhase::Idle);
        state.transition(SessionPhase::Offering).unwrap();
        state.transition(SessionPhase::AnsweringWait).unwrap();
        state.transition(SessionPhase::Negotiating).unwrap();
        state.transition(SessionPhase::Connected).unwrap();
        assert!(state.phase().is_live());
    }

    #[test]
    fn test_recovery_loop() {
        let mut state = new_state();
        state.transition(SessionPhase::Offering).unwrap();
        state.transition(SessionPhase::AnsweringWait).unwrap();
        state.transition(SessionPhase::Negotiating).unwrap();
        state.transition(SessionPhase::Connected).unwrap();

        // Degrade and recover
        state.transition(SessionPhase::Degraded).unwrap();
        state.transition(SessionPhase::Connected).unwrap();

        // Degrade past the timeout into renegotiation
        state.transition(SessionPhase::Degraded).unwrap();
        state.transition(SessionPhase::Reconnecting).unwrap();
        state.transition(SessionPhase::Connected).unwrap();
    }

    #[test]
    fn test_terminality() {
        let mut state = new_state();
        state
            .transition(SessionPhase::Closed(CloseReason::RemoteBye))
            .unwrap();

        // No transition leaves Closed, not even to Closed again
        let err = state.transition(SessionPhase::Offering);
        assert!(matches!(err, Err(SessionError::Terminal { .. })));
        let err = state.transition(SessionPhase::Closed(CloseReason::Shutdown));
        assert!(matches!(err, Err(SessionError::Terminal { .. })));
    }

    #[test]
    fn test_illegal_edges_rejected() {
        let mut state = new_state();

        let err = state.transition(SessionPhase::Connected);
        assert!(matches!(err, Err(SessionError::InvalidTransition { .. })));
        // State is unchanged after a rejected transition
        assert_eq!(*state.phase(), SessionPhase::Idle);

        state.transition(SessionPhase::Offering).unwrap();
        let err = state.transition(SessionPhase::Degraded);
        assert!(matches!(err, Err(SessionError::InvalidTransition { .. })));
    }

    #[test]
    fn test_close_allowed_from_any_live_phase() {
        for target in [
            SessionPhase::Idle,
            SessionPhase::Offering,
            SessionPhase::AnsweringWait,
            SessionPhase::Negotiating,
            SessionPhase::Connected,
            SessionPhase::Degraded,
            SessionPhase::Reconnecting,
        ] {
            assert!(can_transition(
                &target,
                &SessionPhase::Closed(CloseReason::LocalTeardown)
            ));
        }
    }

    #[test]
    fn test_sequence_monotonic() {
        let mut state = new_state();
        let a = state.assign_seq();
        let b = state.assign_seq();
        let c = state.assign_seq();

        assert!(a < b && b < c);
    }

    #[test]
    fn test_renegotiation_bumps_incarnation_keeps_seq() {
        let mut state = new_state();
        let seq_before = state.assign_seq();
        assert_eq!(state.incarnation(), 1);
        assert!(state.accepts_incarnation(1));

        let incarnation = state.begin_renegotiation();

        assert_eq!(incarnation, 2);
        assert!(!state.accepts_incarnation(1));
        assert!(state.accepts_incarnation(2));
        assert_eq!(state.reconnect_attempts, 1);
        // Sequence numbering continues across incarnations
        assert!(state.assign_seq() > seq_before);
    }
}
