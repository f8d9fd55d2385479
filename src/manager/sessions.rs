use super::capture::CaptureHandle;
use super::intake::{JoinGrant, JoinIntake};
use crate::config::{DetectionConfig, SessionConfig};
use crate::detection::{DetectionEvent, DetectionGate, DetectionKind, GateIntent};
use crate::error::{CamcastError, SessionError, SignalingError};
use crate::events::CamcastEvent;
use crate::media::MediaEvent;
use crate::session::{
    CameraId, CloseReason, JoinRequest, Role, SessionCommand, SessionContext, SessionHandle,
    SessionId, SessionSnapshot, ViewerId,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

enum Admission {
    Inserted,
    Existing(SessionId),
    Full,
}

/// Owns the set of live sessions for one camera.
///
/// Membership, capacity, and eviction are decided here, under a single
/// per-camera lock; each admitted session's lifecycle then runs in its
/// own worker task. The manager never mutates a session's phase
/// directly, it only feeds the worker's queue.
pub struct SessionManager {
    camera: CameraId,
    config: SessionConfig,
    detection: DetectionConfig,
    ctx: SessionContext,
    capture: CaptureHandle,
    intake: JoinIntake,
    sessions: Mutex<HashMap<ViewerId, SessionHandle>>,
    gate: Mutex<DetectionGate>,
}

impl SessionManager {
    pub fn new(
        camera: CameraId,
        config: SessionConfig,
        detection: DetectionConfig,
        ctx: SessionContext,
        capture: CaptureHandle,
        intake: JoinIntake,
    ) -> Arc<Self> {
        let gate = Mutex::new(DetectionGate::new(detection.clone()));
        Arc::new(Self {
            camera,
            config,
            detection,
            ctx,
            capture,
            intake,
            sessions: Mutex::new(HashMap::new()),
            gate,
        })
    }

    /// Spawn the manager's background loops: garbage collection, media
    /// event routing, and the join-request intake
    pub fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let manager = Arc::clone(self);
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move { manager.run_gc(token).await }));

        let manager = Arc::clone(self);
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            manager.run_media_router(token).await
        }));

        let manager = Arc::clone(self);
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move { manager.run_intake(token).await }));

        tasks
    }

    /// Create a session for the viewer, or return the live one.
    ///
    /// Fails with CapacityExceeded once the camera's concurrent-viewer
    /// limit is reached; the caller decides whether to queue or give up.
    pub async fn request_view(&self, viewer: ViewerId) -> Result<SessionId, CamcastError> {
        if let Some(existing) = self.live_session(&viewer) {
            debug!(
                camera = %self.camera,
                viewer = %viewer,
                session = %existing,
                "Viewer already has a live session"
            );
            return Ok(existing);
        }

        let session = SessionId::generate();
        let subscription = self
            .ctx
            .transport
            .subscribe(&session, Role::Publisher)
            .await?;
        let handle =
            self.ctx
                .spawn_publisher(session.clone(), self.camera.clone(), viewer.clone(), subscription);
        let commands = handle.commands();

        // Membership and capacity are decided under one lock so two
        // racing requests cannot both slip past the limit
        let mut replaced = None;
        let admission = {
            let mut sessions = self.sessions.lock();
            match sessions.get(&viewer) {
                Some(prior) if !prior.is_closed() => Admission::Existing(prior.session().clone()),
                _ => {
                    let live = sessions.values().filter(|h| !h.is_closed()).count();
                    if live >= self.config.viewer_capacity {
                        Admission::Full
                    } else {
                        // A closed predecessor displaced here leaves
                        // the set before GC can evict it, so its
                        // channel is released below instead
                        replaced = sessions.insert(viewer.clone(), handle);
                        Admission::Inserted
                    }
                }
            }
        };

        match admission {
            Admission::Existing(existing) => {
                let _ = commands
                    .send(SessionCommand::Teardown(CloseReason::LocalTeardown))
                    .await;
                Ok(existing)
            }
            Admission::Full => {
                let _ = commands
                    .send(SessionCommand::Teardown(CloseReason::LocalTeardown))
                    .await;
                let reason = format!("camera at capacity ({})", self.config.viewer_capacity);
                let _ = self
                    .ctx
                    .events
                    .publish(CamcastEvent::ViewerRejected {
                        viewer: viewer.clone(),
                        reason,
                        timestamp: SystemTime::now(),
                    })
                    .await;
                Err(SessionError::CapacityExceeded {
                    camera: self.camera.clone(),
                    viewer,
                    capacity: self.config.viewer_capacity,
                }
                .into())
            }
            Admission::Inserted => {
                if let Some(old) = replaced {
                    self.release_replaced(old).await;
                }
                if let Err(e) = self.capture.attach(session.clone()).await {
                    let _ = commands
                        .send(SessionCommand::Teardown(CloseReason::LocalTeardown))
                        .await;
                    return Err(e);
                }
                let _ = commands.send(SessionCommand::Start).await;
                let _ = self
                    .ctx
                    .events
                    .publish(CamcastEvent::ViewerJoined {
                        session: session.clone(),
                        viewer: viewer.clone(),
                        timestamp: SystemTime::now(),
                    })
                    .await;
                info!(
                    camera = %self.camera,
                    viewer = %viewer,
                    session = %session,
                    "Viewer session created"
                );
                Ok(session)
            }
        }
    }

    /// Tear down the viewer's session if one is live. No-op otherwise.
    pub async fn stop_view(&self, viewer: &ViewerId) -> Result<(), CamcastError> {
        let target = {
            let sessions = self.sessions.lock();
            sessions
                .get(viewer)
                .filter(|h| !h.is_closed())
                .map(|h| (h.session().clone(), h.commands()))
        };

        match target {
            Some((session, commands)) => {
                info!(camera = %self.camera, viewer = %viewer, session = %session, "Stopping view");
                // A worker that already finished counts as stopped
                let _ = commands
                    .send(SessionCommand::Teardown(CloseReason::LocalTeardown))
                    .await;
                Ok(())
            }
            None => {
                debug!(camera = %self.camera, viewer = %viewer, "No live session to stop");
                Ok(())
            }
        }
    }

    /// Fold a detector observation into the gate and act on the
    /// resulting intents per the configured policy
    pub async fn handle_detection(&self, event: DetectionEvent) -> Result<(), CamcastError> {
        let intents = { self.gate.lock().evaluate(&event, Instant::now()) };

        if event.kind != DetectionKind::Quiet && event.confidence >= self.detection.on_confidence {
            let _ = self
                .ctx
                .events
                .publish(CamcastEvent::DetectionRaised {
                    label: event.kind.as_str().to_string(),
                    confidence: event.confidence,
                    timestamp: SystemTime::now(),
                })
                .await;
        }

        for intent in intents {
            match intent {
                GateIntent::Start if self.detection.auto_start => {
                    info!(camera = %self.camera, "Detection starting publish pipeline");
                    self.capture.hold().await?;
                }
                GateIntent::Stop if self.detection.auto_stop => {
                    info!(camera = %self.camera, "Quiet period over, stopping publish pipeline");
                    self.capture.release().await?;
                }
                GateIntent::Alert => self.broadcast_alert(event.kind.as_str()).await?,
                intent => {
                    debug!(camera = %self.camera, ?intent, "Intent disabled by policy");
                }
            }
        }
        Ok(())
    }

    /// Number of sessions that have not reached their terminal phase
    pub fn live_count(&self) -> usize {
        let sessions = self.sessions.lock();
        sessions.values().filter(|h| !h.is_closed()).count()
    }

    /// Point-in-time view of every tracked session
    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        let handles: Vec<_> = {
            let sessions = self.sessions.lock();
            sessions
                .values()
                .map(|h| (h.session().clone(), h.commands()))
                .collect()
        };

        let mut out = Vec::with_capacity(handles.len());
        for (session, commands) in handles {
            let (tx, rx) = tokio::sync::oneshot::channel();
            if commands.send(SessionCommand::Query(tx)).await.is_err() {
                debug!(session = %session, "Session finished before snapshot");
                continue;
            }
            if let Ok(snapshot) = rx.await {
                out.push(snapshot);
            }
        }
        out
    }

    /// Evict Closed sessions whose grace period has elapsed, releasing
    /// their signaling channels
    pub async fn collect_garbage(&self) {
        let grace = self.config.closed_grace();
        let now = SystemTime::now();

        let (detach, evict) = {
            let mut sessions = self.sessions.lock();
            let mut detach = Vec::new();
            let mut evict = Vec::new();
            sessions.retain(|viewer, handle| match handle.closed_at() {
                None => true,
                Some(at) => {
                    detach.push(handle.session().clone());
                    if now.duration_since(at).unwrap_or_default() >= grace {
                        evict.push((viewer.clone(), handle.session().clone()));
                        false
                    } else {
                        true
                    }
                }
            });
            (detach, evict)
        };

        for session in detach {
            let _ = self.capture.detach(session).await;
        }
        for (viewer, session) in evict {
            info!(
                camera = %self.camera,
                viewer = %viewer,
                session = %session,
                "Evicting closed session"
            );
            if let Err(e) = self.ctx.transport.release(&session).await {
                warn!(session = %session, error = %e, "Failed to release session channel");
            }
        }
    }

    /// Tear down every session with a Bye and wait for the workers to
    /// drain, bounded per session
    pub async fn shutdown(&self) {
        info!(camera = %self.camera, sessions = self.live_count(), "Tearing down sessions");

        let targets: Vec<_> = {
            let sessions = self.sessions.lock();
            sessions.values().map(|h| h.commands()).collect()
        };
        for commands in targets {
            let _ = commands
                .send(SessionCommand::Teardown(CloseReason::Shutdown))
                .await;
        }

        let handles: Vec<SessionHandle> = {
            let mut sessions = self.sessions.lock();
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let session = handle.session().clone();
            if timeout(SESSION_DRAIN_TIMEOUT, handle.wait_closed())
                .await
                .is_err()
            {
                warn!(session = %session, "Session worker did not finish in time");
            }
            let _ = self.capture.detach(session.clone()).await;
            if let Err(e) = self.ctx.transport.release(&session).await {
                warn!(session = %session, error = %e, "Failed to release session channel");
            }
        }
    }

    /// Publish the alert record and pull in any always-alert viewers
    /// that are not already watching
    async fn broadcast_alert(&self, label: &str) -> Result<(), CamcastError> {
        for viewer in &self.detection.alert_viewers {
            let viewer = ViewerId::from(viewer.as_str());
            if let Err(e) = self.request_view(viewer.clone()).await {
                warn!(
                    camera = %self.camera,
                    viewer = %viewer,
                    error = %e,
                    "Could not admit alert viewer"
                );
            }
        }

        let viewers = self.live_count();
        let path = format!(
            "{}/cameras/{}/alerts/latest",
            self.ctx.transport.namespace(),
            self.camera
        );
        let alert = serde_json::json!({
            "camera": self.camera.as_str(),
            "label": label,
            "at": chrono::Utc::now().to_rfc3339(),
        });
        let raw = serde_json::to_vec(&alert).map_err(|e| SignalingError::Encode {
            details: e.to_string(),
        })?;
        self.ctx.transport.relay().put(&path, Bytes::from(raw)).await?;

        let _ = self
            .ctx
            .events
            .publish(CamcastEvent::AlertSent {
                label: label.to_string(),
                viewers,
                timestamp: SystemTime::now(),
            })
            .await;
        info!(camera = %self.camera, label, viewers, "Alert pushed");
        Ok(())
    }

    /// Detach and release a closed session a returning viewer displaced
    /// from the set, the same cleanup collect_garbage performs on evict
    async fn release_replaced(&self, handle: SessionHandle) {
        let session = handle.session().clone();
        debug!(camera = %self.camera, session = %session, "Releasing replaced closed session");
        let _ = self.capture.detach(session.clone()).await;
        if let Err(e) = self.ctx.transport.release(&session).await {
            warn!(session = %session, error = %e, "Failed to release session channel");
        }
    }

    fn live_session(&self, viewer: &ViewerId) -> Option<SessionId> {
        let sessions = self.sessions.lock();
        sessions
            .get(viewer)
            .filter(|h| !h.is_closed())
            .map(|h| h.session().clone())
    }

    async fn run_gc(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.gc_interval());
        ticker.tick().await; // Skip first immediate tick
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.collect_garbage().await;
        }
    }

    /// Forward engine callbacks into the owning session's queue
    async fn run_media_router(&self, cancel: CancellationToken) {
        let mut events = self.ctx.engine.events();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Media event stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            self.route_media_event(event).await;
        }
    }

    async fn route_media_event(&self, event: MediaEvent) {
        let commands = {
            let sessions = self.sessions.lock();
            sessions
                .values()
                .find(|h| h.session() == &event.session)
                .map(|h| h.commands())
        };
        match commands {
            Some(commands) => {
                let _ = commands.send(SessionCommand::Media(event.kind)).await;
            }
            None => {
                debug!(session = %event.session, "Media event for unknown session");
            }
        }
    }

    async fn run_intake(&self, cancel: CancellationToken) {
        let mut watch = match self.intake.watch().await {
            Ok(watch) => watch,
            Err(e) => {
                error!(camera = %self.camera, error = %e, "Join intake unavailable");
                return;
            }
        };

        loop {
            let record = tokio::select! {
                _ = cancel.cancelled() => break,
                record = watch.recv() => match record {
                    Some(record) => record,
                    None => {
                        warn!(
                            camera = %self.camera,
                            error = %SignalingError::RelayClosed,
                            "Join intake watch ended"
                        );
                        break;
                    }
                },
            };
            let request = match JoinIntake::decode_request(&record) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed join request");
                    continue;
                }
            };
            self.process_join(request).await;
        }
    }

    /// Decide one join request and record the grant the viewer reads
    /// back. Duplicate deliveries land on the same decision because
    /// request_view returns the existing live session.
    async fn process_join(&self, request: JoinRequest) {
        let viewer = request.viewer.clone();
        let grant = match self.request_view(viewer.clone()).await {
            Ok(session) => JoinGrant::granted(viewer, session),
            Err(e) => JoinGrant::rejected(viewer, e.to_string()),
        };
        if let Err(e) = self.intake.record(&grant).await {
            warn!(camera = %self.camera, error = %e, "Failed to record join decision");
        }
    }
}
