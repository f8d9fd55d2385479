mod machine;
mod state;
mod types;

#[cfg(test)]
mod tests;

pub use machine::{SessionCommand, SessionContext, SessionHandle};
pub use state::{CloseReason, SessionPhase, SessionState};
pub use types::{CameraId, JoinRequest, Role, SessionId, SessionSnapshot, ViewerId};
