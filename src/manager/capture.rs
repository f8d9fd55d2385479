use crate::error::CamcastError;
use crate::events::{CamcastEvent, EventBus};
use crate::session::{CameraId, SessionId};
use std::collections::HashSet;
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const CAPTURE_QUEUE_DEPTH: usize = 32;

#[derive(Debug)]
enum CaptureCommand {
    Attach {
        session: SessionId,
        reply: oneshot::Sender<()>,
    },
    Detach {
        session: SessionId,
        reply: oneshot::Sender<()>,
    },
    Hold {
        reply: oneshot::Sender<()>,
    },
    Release {
        reply: oneshot::Sender<()>,
    },
    Query {
        reply: oneshot::Sender<CaptureStatus>,
    },
}

/// Current run state of the publish pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStatus {
    pub running: bool,
    pub attached: usize,
    pub policy_hold: bool,
}

/// Client handle to the capture actor
#[derive(Clone)]
pub struct CaptureHandle {
    tx: mpsc::Sender<CaptureCommand>,
}

impl CaptureHandle {
    /// Attach a session's sink; brings the pipeline up if it was idle
    pub async fn attach(&self, session: SessionId) -> Result<(), CamcastError> {
        self.roundtrip(|reply| CaptureCommand::Attach { session, reply })
            .await
    }

    /// Detach a session's sink; pipeline goes down when nothing holds it
    pub async fn detach(&self, session: SessionId) -> Result<(), CamcastError> {
        self.roundtrip(|reply| CaptureCommand::Detach { session, reply })
            .await
    }

    /// Keep the pipeline up independently of attached sessions
    pub async fn hold(&self) -> Result<(), CamcastError> {
        self.roundtrip(|reply| CaptureCommand::Hold { reply }).await
    }

    /// Drop the policy hold
    pub async fn release(&self) -> Result<(), CamcastError> {
        self.roundtrip(|reply| CaptureCommand::Release { reply })
            .await
    }

    pub async fn status(&self) -> Result<CaptureStatus, CamcastError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CaptureCommand::Query { reply: tx })
            .await
            .map_err(|_| Self::gone())?;
        rx.await.map_err(|_| Self::gone())
    }

    async fn roundtrip<F>(&self, make: F) -> Result<(), CamcastError>
    where
        F: FnOnce(oneshot::Sender<()>) -> CaptureCommand,
    {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).await.map_err(|_| Self::gone())?;
        rx.await.map_err(|_| Self::gone())
    }

    fn gone() -> CamcastError {
        CamcastError::component("capture", "Capture actor is not running")
    }
}

/// Single owner of the camera's capture resource.
///
/// Everything that would reconfigure capture (sessions attaching and
/// detaching, detection policy turning the pipeline on and off) is
/// serialized through this actor's queue, so run-state edges are
/// observed exactly once.
pub struct CapturePipeline {
    camera: CameraId,
    events: EventBus,
}

impl CapturePipeline {
    pub fn new(camera: CameraId, events: EventBus) -> Self {
        Self { camera, events }
    }

    /// Start the actor loop. Runs until cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> (CaptureHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(CAPTURE_QUEUE_DEPTH);
        let handle = CaptureHandle { tx };
        let task = tokio::spawn(self.run(rx, cancel));
        (handle, task)
    }

    async fn run(self, mut rx: mpsc::Receiver<CaptureCommand>, cancel: CancellationToken) {
        let mut attached: HashSet<SessionId> = HashSet::new();
        let mut policy_hold = false;
        let mut running = false;

        info!(camera = %self.camera, "Capture pipeline ready");

        loop {
            let cmd = tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };

            match cmd {
                CaptureCommand::Attach { session, reply } => {
                    if attached.insert(session.clone()) {
                        debug!(camera = %self.camera, session = %session, "Session attached to capture");
                    }
                    self.settle(&attached, policy_hold, &mut running).await;
                    let _ = reply.send(());
                }
                CaptureCommand::Detach { session, reply } => {
                    if attached.remove(&session) {
                        debug!(camera = %self.camera, session = %session, "Session detached from capture");
                    }
                    self.settle(&attached, policy_hold, &mut running).await;
                    let _ = reply.send(());
                }
                CaptureCommand::Hold { reply } => {
                    policy_hold = true;
                    self.settle(&attached, policy_hold, &mut running).await;
                    let _ = reply.send(());
                }
                CaptureCommand::Release { reply } => {
                    policy_hold = false;
                    self.settle(&attached, policy_hold, &mut running).await;
                    let _ = reply.send(());
                }
                CaptureCommand::Query { reply } => {
                    let _ = reply.send(CaptureStatus {
                        running,
                        attached: attached.len(),
                        policy_hold,
                    });
                }
            }
        }

        if running {
            info!(camera = %self.camera, "Capture pipeline stopping");
            let _ = self
                .events
                .publish(CamcastEvent::StreamingStopped {
                    timestamp: SystemTime::now(),
                })
                .await;
        }
        info!(camera = %self.camera, "Capture pipeline finished");
    }

    /// Reconcile the run state with who wants the pipeline up
    async fn settle(&self, attached: &HashSet<SessionId>, policy_hold: bool, running: &mut bool) {
        let should_run = policy_hold || !attached.is_empty();
        if should_run == *running {
            return;
        }
        *running = should_run;

        if should_run {
            info!(
                camera = %self.camera,
                attached = attached.len(),
                policy_hold,
                "Capture pipeline started"
            );
            let _ = self
                .events
                .publish(CamcastEvent::StreamingStarted {
                    timestamp: SystemTime::now(),
                })
                .await;
        } else {
            info!(camera = %self.camera, "Capture pipeline stopped");
            let _ = self
                .events
                .publish(CamcastEvent::StreamingStopped {
                    timestamp: SystemTime::now(),
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> (CaptureHandle, CancellationToken, JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let (handle, task) =
            CapturePipeline::new(CameraId::from("cam0"), EventBus::new(16)).spawn(cancel.clone());
        (handle, cancel, task)
    }

    #[tokio::test]
    async fn test_first_attach_starts_last_detach_stops() {
        let (handle, cancel, task) = pipeline();
        let s1 = SessionId::from("ab12cd34ef56");
        let s2 = SessionId::from("ffeeddccbbaa");

        handle.attach(s1.clone()).await.unwrap();
        assert!(handle.status().await.unwrap().running);

        handle.attach(s2.clone()).await.unwrap();
        handle.detach(s1).await.unwrap();
        assert!(handle.status().await.unwrap().running);

        handle.detach(s2).await.unwrap();
        let status = handle.status().await.unwrap();
        assert!(!status.running);
        assert_eq!(status.attached, 0);

        cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_policy_hold_outlives_sessions() {
        let (handle, cancel, task) = pipeline();
        let s1 = SessionId::from("ab12cd34ef56");

        handle.hold().await.unwrap();
        assert!(handle.status().await.unwrap().running);

        handle.attach(s1.clone()).await.unwrap();
        handle.detach(s1).await.unwrap();
        // Hold still active; sessions gone
        assert!(handle.status().await.unwrap().running);

        handle.release().await.unwrap();
        assert!(!handle.status().await.unwrap().running);

        cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let (handle, cancel, task) = pipeline();
        let s1 = SessionId::from("ab12cd34ef56");

        handle.attach(s1.clone()).await.unwrap();
        handle.attach(s1.clone()).await.unwrap();
        assert_eq!(handle.status().await.unwrap().attached, 1);

        handle.detach(s1).await.unwrap();
        assert!(!handle.status().await.unwrap().running);

        cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_run_state_edges_publish_events() {
        let cancel = CancellationToken::new();
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let (handle, task) =
            CapturePipeline::new(CameraId::from("cam0"), events).spawn(cancel.clone());
        let s1 = SessionId::from("ab12cd34ef56");

        handle.attach(s1.clone()).await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            CamcastEvent::StreamingStarted { .. }
        ));

        handle.detach(s1).await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            CamcastEvent::StreamingStopped { .. }
        ));

        cancel.cancel();
        let _ = task.await;
    }
}
