use crate::error::EventBusError;
use crate::session::{CloseReason, SessionId, SessionPhase, ViewerId};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Events that can occur in the camcast system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CamcastEvent {
    /// A session moved to a new lifecycle phase
    SessionPhaseChanged {
        session: SessionId,
        from: SessionPhase,
        to: SessionPhase,
        timestamp: SystemTime,
    },
    /// A session reached its terminal phase
    SessionClosed {
        session: SessionId,
        reason: CloseReason,
        timestamp: SystemTime,
    },
    /// A viewer join request was accepted and a session spawned
    ViewerJoined {
        session: SessionId,
        viewer: ViewerId,
        timestamp: SystemTime,
    },
    /// A viewer join request was rejected
    ViewerRejected {
        viewer: ViewerId,
        reason: String,
        timestamp: SystemTime,
    },
    /// The detection gate turned capture on
    StreamingStarted { timestamp: SystemTime },
    /// The detection gate turned capture off
    StreamingStopped { timestamp: SystemTime },
    /// A detector reported an observation above the reporting floor
    DetectionRaised {
        label: String,
        confidence: f64,
        timestamp: SystemTime,
    },
    /// An alert was pushed to connected viewers
    AlertSent {
        label: String,
        viewers: usize,
        timestamp: SystemTime,
    },
    /// A connected session missed a keepalive interval
    KeepaliveMissed {
        session: SessionId,
        misses: u32,
        timestamp: SystemTime,
    },
    /// A system error occurred in a component
    SystemError { component: String, error: String },
    /// System shutdown requested
    ShutdownRequested {
        timestamp: SystemTime,
        reason: String,
    },
}

impl CamcastEvent {
    /// Get the timestamp of the event
    pub fn timestamp(&self) -> SystemTime {
        match self {
            CamcastEvent::SessionPhaseChanged { timestamp, .. } => *timestamp,
            CamcastEvent::SessionClosed { timestamp, .. } => *timestamp,
            CamcastEvent::ViewerJoined { timestamp, .. } => *timestamp,
            CamcastEvent::ViewerRejected { timestamp, .. } => *timestamp,
            CamcastEvent::StreamingStarted { timestamp } => *timestamp,
            CamcastEvent::StreamingStopped { timestamp } => *timestamp,
            CamcastEvent::DetectionRaised { timestamp, .. } => *timestamp,
            CamcastEvent::AlertSent { timestamp, .. } => *timestamp,
            CamcastEvent::KeepaliveMissed { timestamp, .. } => *timestamp,
            CamcastEvent::SystemError { .. } => SystemTime::now(),
            CamcastEvent::ShutdownRequested { timestamp, .. } => *timestamp,
        }
    }

    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            CamcastEvent::SessionPhaseChanged {
                session, from, to, ..
            } => {
                format!("Session {} moved {} -> {}", session, from, to)
            }
            CamcastEvent::SessionClosed {
                session, reason, ..
            } => {
                format!("Session {} closed: {}", session, reason)
            }
            CamcastEvent::ViewerJoined { viewer, .. } => {
                format!("Viewer {} joined", viewer)
            }
            CamcastEvent::ViewerRejected { viewer, reason, .. } => {
                format!("Viewer {} rejected: {}", viewer, reason)
            }
            CamcastEvent::StreamingStarted { .. } => "Streaming started".to_string(),
            CamcastEvent::StreamingStopped { .. } => "Streaming stopped".to_string(),
            CamcastEvent::DetectionRaised {
                label, confidence, ..
            } => {
                format!("Detection: {} at {:.2}", label, confidence)
            }
            CamcastEvent::AlertSent { label, viewers, .. } => {
                format!("Alert '{}' sent to {} viewers", label, viewers)
            }
            CamcastEvent::KeepaliveMissed {
                session, misses, ..
            } => {
                format!("Session {} missed {} keepalives", session, misses)
            }
            CamcastEvent::SystemError { component, error } => {
                format!("Error in {}: {}", component, error)
            }
            CamcastEvent::ShutdownRequested { reason, .. } => {
                format!("Shutdown requested: {}", reason)
            }
        }
    }

    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            CamcastEvent::SessionPhaseChanged { .. } => "session_phase_changed",
            CamcastEvent::SessionClosed { .. } => "session_closed",
            CamcastEvent::ViewerJoined { .. } => "viewer_joined",
            CamcastEvent::ViewerRejected { .. } => "viewer_rejected",
            CamcastEvent::StreamingStarted { .. } => "streaming_started",
            CamcastEvent::StreamingStopped { .. } => "streaming_stopped",
            CamcastEvent::DetectionRaised { .. } => "detection_raised",
            CamcastEvent::AlertSent { .. } => "alert_sent",
            CamcastEvent::KeepaliveMissed { .. } => "keepalive_missed",
            CamcastEvent::SystemError { .. } => "system_error",
            CamcastEvent::ShutdownRequested { .. } => "shutdown_requested",
        }
    }

    /// Get the session this event concerns, if any
    pub fn session(&self) -> Option<&SessionId> {
        match self {
            CamcastEvent::SessionPhaseChanged { session, .. } => Some(session),
            CamcastEvent::SessionClosed { session, .. } => Some(session),
            CamcastEvent::ViewerJoined { session, .. } => Some(session),
            CamcastEvent::KeepaliveMissed { session, .. } => Some(session),
            _ => None,
        }
    }
}

/// Async event bus for component coordination using broadcast channels
pub struct EventBus {
    sender: broadcast::Sender<CamcastEvent>,
    debug_logging: bool,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            debug_logging: false,
        }
    }

    /// Create a new event bus with debug logging enabled
    pub fn with_debug_logging(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            debug_logging: true,
        }
    }

    /// Subscribe to events and get a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<CamcastEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers
    pub async fn publish(&self, event: CamcastEvent) -> Result<usize, EventBusError> {
        if self.debug_logging {
            debug!("Publishing event: {}", event.description());
        }

        // Log important events at appropriate levels
        match &event {
            CamcastEvent::SessionClosed {
                session, reason, ..
            } => {
                info!("Session {} closed: {}", session, reason);
            }
            CamcastEvent::ViewerRejected { viewer, reason, .. } => {
                warn!("Viewer {} rejected: {}", viewer, reason);
            }
            CamcastEvent::SystemError { component, error } => {
                error!("System error in {}: {}", component, error);
            }
            CamcastEvent::ShutdownRequested { reason, .. } => {
                info!("Shutdown requested: {}", reason);
            }
            _ => {
                if self.debug_logging {
                    debug!("Event: {}", event.description());
                }
            }
        }

        self.sender
            .send(event)
            .map_err(|e| EventBusError::PublishFailed {
                details: e.to_string(),
            })
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Check if there are any active subscribers
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            debug_logging: self.debug_logging,
        }
    }
}

/// Event filter for selective event handling
#[derive(Debug, Clone)]
pub enum EventFilter {
    /// Accept all events
    All,
    /// Accept only specific event types
    EventTypes(Vec<&'static str>),
    /// Accept only events concerning specific sessions
    Sessions(Vec<SessionId>),
    /// Custom filter function
    Custom(fn(&CamcastEvent) -> bool),
}

impl EventFilter {
    /// Check if an event passes this filter
    pub fn matches(&self, event: &CamcastEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::EventTypes(types) => types.contains(&event.event_type()),
            EventFilter::Sessions(sessions) => match event.session() {
                Some(session) => sessions.contains(session),
                None => false,
            },
            EventFilter::Custom(filter_fn) => filter_fn(event),
        }
    }
}

/// Event receiver with filtering
pub struct EventReceiver {
    receiver: broadcast::Receiver<CamcastEvent>,
    filter: EventFilter,
    name: String,
}

impl EventReceiver {
    /// Create a new event receiver with a filter
    pub fn new(
        receiver: broadcast::Receiver<CamcastEvent>,
        filter: EventFilter,
        name: String,
    ) -> Self {
        Self {
            receiver,
            filter,
            name,
        }
    }

    /// Receive the next filtered event
    pub async fn recv(&mut self) -> Result<CamcastEvent, EventBusError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        debug!(
                            "Receiver '{}' received event: {}",
                            self.name,
                            event.description()
                        );
                        return Ok(event);
                    }
                    // Continue loop to get next event if this one doesn't match filter
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, n);
                    return Err(EventBusError::PublishFailed {
                        details: format!("Receiver lagged behind by {} events", n),
                    });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed for receiver '{}'", self.name);
                    return Err(EventBusError::ChannelClosed);
                }
            }
        }
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<Option<CamcastEvent>, EventBusError> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Ok(Some(event));
                    }
                    // Continue loop to check next event
                }
                Err(broadcast::error::TryRecvError::Empty) => {
                    return Ok(None);
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, n);
                    return Err(EventBusError::PublishFailed {
                        details: format!("Receiver lagged behind by {} events", n),
                    });
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    debug!("Event bus closed for receiver '{}'", self.name);
                    return Err(EventBusError::ChannelClosed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn session() -> SessionId {
        SessionId::from("ab12cd34ef56")
    }

    #[tokio::test]
    async fn test_event_bus_basic_operations() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        let event = CamcastEvent::ViewerJoined {
            session: session(),
            viewer: ViewerId::from("viewer1"),
            timestamp: SystemTime::now(),
        };

        // Publish event
        let subscriber_count = event_bus.publish(event.clone()).await.unwrap();
        assert_eq!(subscriber_count, 1);

        // Receive event
        let received_event = receiver.recv().await.unwrap();
        match received_event {
            CamcastEvent::ViewerJoined { viewer, .. } => {
                assert_eq!(viewer, ViewerId::from("viewer1"));
            }
            _ => panic!("Unexpected event type"),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();

        assert_eq!(event_bus.subscriber_count(), 2);

        let event = CamcastEvent::StreamingStarted {
            timestamp: SystemTime::now(),
        };

        event_bus.publish(event).await.unwrap();

        // Both receivers should get the event
        let _ = timeout(Duration::from_millis(100), receiver1.recv())
            .await
            .unwrap()
            .unwrap();
        let _ = timeout(Duration::from_millis(100), receiver2.recv())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_event_filter() {
        let filter = EventFilter::EventTypes(vec!["detection_raised", "alert_sent"]);

        let detection_event = CamcastEvent::DetectionRaised {
            label: "person".to_string(),
            confidence: 0.9,
            timestamp: SystemTime::now(),
        };

        let streaming_event = CamcastEvent::StreamingStarted {
            timestamp: SystemTime::now(),
        };

        assert!(filter.matches(&detection_event));
        assert!(!filter.matches(&streaming_event));
    }

    #[tokio::test]
    async fn test_session_filter() {
        let target = session();
        let other = SessionId::from("ffeeddccbbaa");
        let filter = EventFilter::Sessions(vec![target.clone()]);

        let matching = CamcastEvent::KeepaliveMissed {
            session: target,
            misses: 1,
            timestamp: SystemTime::now(),
        };
        let non_matching = CamcastEvent::KeepaliveMissed {
            session: other,
            misses: 1,
            timestamp: SystemTime::now(),
        };

        assert!(filter.matches(&matching));
        assert!(!filter.matches(&non_matching));
    }

    #[tokio::test]
    async fn test_filtered_receiver() {
        let event_bus = EventBus::new(10);
        let receiver = event_bus.subscribe();
        let filter = EventFilter::EventTypes(vec!["detection_raised"]);
        let mut filtered_receiver = EventReceiver::new(receiver, filter, "test".to_string());

        // Publish events of different types
        event_bus
            .publish(CamcastEvent::StreamingStarted {
                timestamp: SystemTime::now(),
            })
            .await
            .unwrap();

        event_bus
            .publish(CamcastEvent::DetectionRaised {
                label: "person".to_string(),
                confidence: 0.8,
                timestamp: SystemTime::now(),
            })
            .await
            .unwrap();

        // Should only receive the detection event
        let received = timeout(Duration::from_millis(100), filtered_receiver.recv())
            .await
            .unwrap()
            .unwrap();
        match received {
            CamcastEvent::DetectionRaised { confidence, .. } => {
                assert_eq!(confidence, 0.8);
            }
            _ => panic!("Unexpected event type"),
        }
    }

    #[test]
    fn test_event_properties() {
        let event = CamcastEvent::DetectionRaised {
            label: "person".to_string(),
            confidence: 0.85,
            timestamp: SystemTime::now(),
        };

        assert_eq!(event.event_type(), "detection_raised");
        assert!(event.description().contains("0.85"));
        assert!(event.session().is_none());
    }
}
