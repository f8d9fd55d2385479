pub mod config;
pub mod detection;
pub mod directory;
pub mod error;
pub mod events;
pub mod manager;
pub mod media;
pub mod monitor;
pub mod orchestration;
pub mod session;
pub mod signaling;

pub use config::CamcastConfig;
pub use detection::{DetectionEvent, DetectionGate, DetectionKind, GateIntent};
pub use directory::{CameraPresence, PresenceDirectory};
pub use error::{CamcastError, Result};
pub use events::{CamcastEvent, EventBus, EventFilter, EventReceiver};
pub use manager::{
    CaptureHandle, CapturePipeline, CaptureStatus, JoinGrant, JoinIntake, SessionManager,
};
pub use media::{MediaEngine, MediaEvent, MediaEventKind, MockMediaEngine};
pub use monitor::{ConnectionMonitor, MonitorHandle};
pub use orchestration::{CamcastOrchestrator, ComponentState, ShutdownReason};
pub use session::{
    CameraId, CloseReason, JoinRequest, Role, SessionHandle, SessionId, SessionPhase,
    SessionSnapshot, ViewerId,
};
pub use signaling::{
    MemoryRelay, MessageKind, RelayRecord, RelayStore, RelayWatch, SignalingMessage,
    SignalingTransport,
};
