mod capture;
mod intake;
mod sessions;

pub use capture::{CaptureHandle, CapturePipeline, CaptureStatus};
pub use intake::{JoinGrant, JoinIntake};
pub use sessions::SessionManager;
