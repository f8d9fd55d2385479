use super::{
    CameraId, CloseReason, Role, SessionId, SessionPhase, SessionSnapshot, SessionState, ViewerId,
};
use crate::config::SessionConfig;
use crate::error::{CamcastError, SessionError, SignalingError};
use crate::events::{CamcastEvent, EventBus};
use crate::media::{MediaEngine, MediaEventKind};
use crate::monitor::MonitorHandle;
use crate::signaling::{MessageKind, SessionSubscription, SignalingMessage, SignalingTransport};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, info, warn};

const COMMAND_QUEUE_DEPTH: usize = 32;

/// Commands accepted by a session's worker task
#[derive(Debug)]
pub enum SessionCommand {
    /// Begin the offer/answer cycle (publisher side)
    Start,
    /// Close the session, sending a Bye to the peer
    Teardown(CloseReason),
    /// Emit a keepalive if the session is live
    SendKeepalive,
    /// Liveness verdict from the connection monitor
    LivenessChanged { healthy: bool, misses: u32 },
    /// Engine callback routed to this session
    Media(MediaEventKind),
    /// Snapshot request
    Query(oneshot::Sender<SessionSnapshot>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeadlineKind {
    /// Bound on reaching Connected from the offer in flight
    Negotiation,
    /// Time allowed in Degraded before renegotiating
    Degrade,
    /// Wait before the next renegotiation attempt
    Backoff,
}

/// Shared dependencies for spawning session workers under one manager
#[derive(Clone)]
pub struct SessionContext {
    pub config: SessionConfig,
    pub transport: Arc<SignalingTransport>,
    pub engine: Arc<dyn MediaEngine>,
    pub events: EventBus,
    pub monitor: MonitorHandle,
}

impl SessionContext {
    /// Spawn the publisher-side worker for one viewer session.
    ///
    /// The worker owns all state for the session; everything else talks
    /// to it through the returned handle. It exits on reaching Closed.
    pub fn spawn_publisher(
        &self,
        session: SessionId,
        camera: CameraId,
        viewer: ViewerId,
        subscription: SessionSubscription,
    ) -> SessionHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let closed_at = Arc::new(Mutex::new(None));

        let worker = SessionWorker {
            state: SessionState::new(
                session.clone(),
                camera,
                viewer.clone(),
                Role::Publisher,
            ),
            config: self.config.clone(),
            transport: Arc::clone(&self.transport),
            engine: Arc::clone(&self.engine),
            events: self.events.clone(),
            monitor: self.monitor.clone(),
            commands: cmd_rx,
            cmd_tx: cmd_tx.clone(),
            subscription,
            deadline: None,
            closed_at: Arc::clone(&closed_at),
            monitor_registered: false,
        };
        let task = tokio::spawn(worker.run());

        SessionHandle {
            session,
            viewer,
            commands: cmd_tx,
            closed_at,
            task,
        }
    }
}

/// Client handle to a running session worker
pub struct SessionHandle {
    session: SessionId,
    viewer: ViewerId,
    commands: mpsc::Sender<SessionCommand>,
    closed_at: Arc<Mutex<Option<SystemTime>>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn viewer(&self) -> &ViewerId {
        &self.viewer
    }

    /// Sender for routing external signals (monitor, media events) into
    /// this session's queue
    pub fn commands(&self) -> mpsc::Sender<SessionCommand> {
        self.commands.clone()
    }

    pub async fn start(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Start).await
    }

    pub async fn teardown(&self, reason: CloseReason) -> Result<(), SessionError> {
        self.send(SessionCommand::Teardown(reason)).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Query(tx)).await?;
        rx.await.map_err(|_| SessionError::WorkerGone {
            session: self.session.clone(),
        })
    }

    /// Whether the worker has reached Closed and finished
    pub fn is_closed(&self) -> bool {
        self.closed_at.lock().is_some()
    }

    pub fn closed_at(&self) -> Option<SystemTime> {
        *self.closed_at.lock()
    }

    /// Wait for the worker task to finish
    pub async fn wait_closed(self) {
        let _ = self.task.await;
    }

    async fn send(&self, cmd: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| SessionError::WorkerGone {
                session: self.session.clone(),
            })
    }
}

/// Single-writer task owning one session.
///
/// All transitions for the session run here, serialized by the command
/// queue and the subscription stream. At most one deadline is armed at
/// a time; which one depends on the phase.
struct SessionWorker {
    state: SessionState,
    config: SessionConfig,
    transport: Arc<SignalingTransport>,
    engine: Arc<dyn MediaEngine>,
    events: EventBus,
    monitor: MonitorHandle,
    commands: mpsc::Receiver<SessionCommand>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    subscription: SessionSubscription,
    deadline: Option<(Instant, DeadlineKind)>,
    closed_at: Arc<Mutex<Option<SystemTime>>>,
    monitor_registered: bool,
}

impl SessionWorker {
    async fn run(mut self) {
        info!(
            session = %self.state.session,
            camera = %self.state.camera,
            viewer = %self.state.viewer,
            "Session worker started"
        );

        loop {
            let armed = self.deadline;
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => self.close(CloseReason::LocalTeardown).await,
                },
                msg = self.subscription.recv() => match msg {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg).await {
                            debug!(session = %self.state.session, error = %e, "Dropping signaling message");
                        }
                    }
                    Err(e) => {
                        warn!(session = %self.state.session, error = %e, "Signaling channel ended");
                        self.close(CloseReason::TransportLost).await;
                    }
                },
                _ = sleep_until(armed.map(|(at, _)| at).unwrap_or_else(Instant::now)),
                    if armed.is_some() =>
                {
                    if let Some((_, kind)) = self.deadline.take() {
                        self.handle_deadline(kind).await;
                    }
                }
            }

            if self.state.phase().is_terminal() {
                break;
            }
        }

        self.finalize().await;
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Start => {
                if *self.state.phase() != SessionPhase::Idle {
                    debug!(
                        session = %self.state.session,
                        phase = %self.state.phase(),
                        "Ignoring Start outside Idle"
                    );
                    return;
                }
                if let Err(e) = self.begin_offer().await {
                    error!(session = %self.state.session, error = %e, "Initial offer failed");
                    let reason = match e {
                        CamcastError::Media(_) => CloseReason::MediaFailure,
                        _ => CloseReason::TransportLost,
                    };
                    let _ = self
                        .events
                        .publish(CamcastEvent::SystemError {
                            component: "session".to_string(),
                            error: e.to_string(),
                        })
                        .await;
                    self.close(reason).await;
                }
            }
            SessionCommand::Teardown(reason) => {
                self.send_bye().await;
                self.close(reason).await;
            }
            SessionCommand::SendKeepalive => {
                if !self.state.phase().is_live() {
                    return;
                }
                let msg = SignalingMessage::keepalive(
                    self.state.session.clone(),
                    self.state.role,
                    self.state.assign_seq(),
                    self.state.incarnation(),
                );
                if let Err(e) = self.transport.send(&msg).await {
                    warn!(session = %self.state.session, error = %e, "Keepalive send failed");
                }
            }
            SessionCommand::LivenessChanged { healthy, misses } => {
                self.handle_liveness(healthy, misses).await;
            }
            SessionCommand::Media(kind) => {
                self.handle_media_event(kind).await;
            }
            SessionCommand::Query(reply) => {
                let _ = reply.send(self.state.snapshot());
            }
        }
    }

    async fn handle_liveness(&mut self, healthy: bool, misses: u32) {
        if healthy {
            if *self.state.phase() == SessionPhase::Degraded {
                info!(session = %self.state.session, "Keepalive resumed, session recovered");
                self.clear_deadline();
                self.apply_transition(SessionPhase::Connected).await;
            }
            return;
        }

        // Degrading applies to Connected only; a session already
        // degraded or reconnecting keeps its current recovery schedule
        if *self.state.phase() != SessionPhase::Connected {
            debug!(
                session = %self.state.session,
                phase = %self.state.phase(),
                "Ignoring liveness failure outside Connected"
            );
            return;
        }

        warn!(
            session = %self.state.session,
            misses,
            "Missed keepalive threshold reached, session degraded"
        );
        if self.apply_transition(SessionPhase::Degraded).await {
            self.arm_deadline(DeadlineKind::Degrade, self.config.degrade_timeout());
        }
    }

    async fn handle_media_event(&mut self, kind: MediaEventKind) {
        match kind {
            MediaEventKind::Connected => match self.state.phase() {
                SessionPhase::Negotiating | SessionPhase::Reconnecting => {
                    self.clear_deadline();
                    self.state.reconnect_attempts = 0;
                    if self.apply_transition(SessionPhase::Connected).await {
                        self.register_with_monitor();
                        info!(session = %self.state.session, "Media established");
                    }
                }
                SessionPhase::Connected | SessionPhase::Degraded => {
                    self.monitor.activity_seen(&self.state.session);
                }
                phase => {
                    debug!(
                        session = %self.state.session,
                        phase = %phase,
                        "Ignoring engine Connected in this phase"
                    );
                }
            },
            MediaEventKind::Disconnected => {
                if *self.state.phase() == SessionPhase::Connected {
                    warn!(session = %self.state.session, "Engine reported media drop");
                    if self.apply_transition(SessionPhase::Degraded).await {
                        self.arm_deadline(DeadlineKind::Degrade, self.config.degrade_timeout());
                    }
                } else {
                    debug!(
                        session = %self.state.session,
                        phase = %self.state.phase(),
                        "Ignoring engine Disconnected in this phase"
                    );
                }
            }
            MediaEventKind::Candidate(candidate) => {
                if self.state.phase().is_terminal() || *self.state.phase() == SessionPhase::Idle {
                    return;
                }
                let msg = SignalingMessage::candidate(
                    self.state.session.clone(),
                    self.state.role,
                    self.state.assign_seq(),
                    self.state.incarnation(),
                    candidate,
                );
                if let Err(e) = self.transport.send(&msg).await {
                    warn!(session = %self.state.session, error = %e, "Candidate send failed");
                }
            }
        }
    }

    async fn handle_message(&mut self, msg: SignalingMessage) -> Result<(), SignalingError> {
        if msg.incarnation < self.state.incarnation() {
            // Late arrival from a finished negotiation cycle
            return Err(SignalingError::StaleMessage {
                session: self.state.session.clone(),
                incarnation: msg.incarnation,
                current: self.state.incarnation(),
            });
        }
        if msg.incarnation > self.state.incarnation() {
            warn!(
                session = %self.state.session,
                incarnation = msg.incarnation,
                current = self.state.incarnation(),
                "Message from a future incarnation, dropping"
            );
            return Ok(());
        }

        match msg.kind {
            MessageKind::Answer => self.handle_answer(msg).await,
            MessageKind::Candidate => {
                // The engine buffers candidates that land before the
                // remote description, so AnsweringWait is fine too
                match self.state.phase() {
                    SessionPhase::AnsweringWait
                    | SessionPhase::Negotiating
                    | SessionPhase::Connected
                    | SessionPhase::Degraded
                    | SessionPhase::Reconnecting => {
                        if let Err(e) = self
                            .engine
                            .add_candidate(&self.state.session, msg.payload_str())
                            .await
                        {
                            warn!(session = %self.state.session, error = %e, "Candidate rejected");
                        }
                        self.state.touch();
                    }
                    phase => {
                        debug!(
                            session = %self.state.session,
                            phase = %phase,
                            "Dropping candidate in this phase"
                        );
                    }
                }
            }
            MessageKind::Bye => {
                info!(session = %self.state.session, "Peer sent Bye");
                self.close(CloseReason::RemoteBye).await;
            }
            MessageKind::Keepalive => {
                self.state.touch();
                self.monitor.keepalive_seen(&self.state.session);
            }
            MessageKind::Offer => {
                warn!(
                    session = %self.state.session,
                    "Publisher received an Offer, dropping"
                );
            }
        }
        Ok(())
    }

    async fn handle_answer(&mut self, msg: SignalingMessage) {
        let renegotiating = *self.state.phase() == SessionPhase::Reconnecting;
        if *self.state.phase() != SessionPhase::AnsweringWait && !renegotiating {
            debug!(
                session = %self.state.session,
                phase = %self.state.phase(),
                "Dropping answer in this phase"
            );
            return;
        }

        if let Err(e) = self
            .engine
            .apply_remote_description(&self.state.session, msg.payload_str())
            .await
        {
            error!(session = %self.state.session, error = %e, "Answer rejected by engine");
            if renegotiating {
                self.attempt_failed().await;
            } else {
                self.close(CloseReason::MediaFailure).await;
            }
            return;
        }

        self.state.remote_params = Some(Bytes::from(msg.payload_str().as_bytes().to_vec()));
        self.state.touch();
        if !renegotiating {
            self.apply_transition(SessionPhase::Negotiating).await;
        }
        // The negotiation deadline stays armed until media connects
    }

    async fn handle_deadline(&mut self, kind: DeadlineKind) {
        match (kind, self.state.phase().clone()) {
            (
                DeadlineKind::Negotiation,
                SessionPhase::Offering | SessionPhase::AnsweringWait | SessionPhase::Negotiating,
            ) => {
                let err = SessionError::NegotiationTimeout {
                    session: self.state.session.clone(),
                    timeout: self.config.negotiation_timeout(),
                };
                warn!(session = %self.state.session, error = %err, "Negotiation timed out");
                self.close(CloseReason::NegotiationTimeout).await;
            }
            (DeadlineKind::Negotiation, SessionPhase::Reconnecting) => {
                self.attempt_failed().await;
            }
            (DeadlineKind::Degrade, SessionPhase::Degraded) => {
                warn!(
                    session = %self.state.session,
                    "Degrade timeout elapsed, renegotiating"
                );
                if self.apply_transition(SessionPhase::Reconnecting).await {
                    self.schedule_attempt();
                }
            }
            (DeadlineKind::Backoff, SessionPhase::Reconnecting) => {
                let incarnation = self.state.begin_renegotiation();
                info!(
                    session = %self.state.session,
                    attempt = self.state.reconnect_attempts,
                    incarnation,
                    "Starting renegotiation attempt"
                );
                if self.begin_offer().await.is_err() {
                    self.attempt_failed().await;
                }
            }
            (kind, phase) => {
                debug!(
                    session = %self.state.session,
                    ?kind,
                    %phase,
                    "Deadline fired in an unrelated phase, ignoring"
                );
            }
        }
    }

    /// Mint and send an offer for the current incarnation. From Idle
    /// this advances to Offering then AnsweringWait; from Reconnecting
    /// the phase stays put and only the channel traffic repeats.
    async fn begin_offer(&mut self) -> Result<(), CamcastError> {
        let payload = self.engine.create_offer(&self.state.session).await?;
        self.state.local_params = Some(Bytes::from(payload.clone().into_bytes()));

        if *self.state.phase() == SessionPhase::Idle {
            self.apply_transition(SessionPhase::Offering).await;
        }

        let msg = SignalingMessage::offer(
            self.state.session.clone(),
            self.state.role,
            self.state.assign_seq(),
            self.state.incarnation(),
            payload,
        );
        self.transport.send(&msg).await?;

        if *self.state.phase() == SessionPhase::Offering {
            self.apply_transition(SessionPhase::AnsweringWait).await;
        }
        self.arm_deadline(DeadlineKind::Negotiation, self.config.negotiation_timeout());
        Ok(())
    }

    /// One renegotiation attempt failed; back off or give up
    async fn attempt_failed(&mut self) {
        let attempts = self.state.reconnect_attempts;
        if attempts >= self.config.reconnect_max_attempts {
            let err = SessionError::ReconnectExhausted {
                session: self.state.session.clone(),
                attempts,
            };
            error!(session = %self.state.session, error = %err, "Renegotiation attempts exhausted");
            self.close(CloseReason::ReconnectExhausted).await;
            return;
        }
        self.schedule_attempt();
    }

    /// Arm the backoff before the next renegotiation attempt
    fn schedule_attempt(&mut self) {
        let attempts = self.state.reconnect_attempts;
        let delay = self.config.reconnect_backoff_base() * 2u32.pow(attempts);
        debug!(
            session = %self.state.session,
            next_attempt = attempts + 1,
            delay_ms = delay.as_millis() as u64,
            "Scheduling renegotiation attempt"
        );
        self.arm_deadline(DeadlineKind::Backoff, delay);
    }

    /// Best-effort Bye; the transport already retries with backoff, so
    /// a failure here means the teardown stays local and unreconciled
    async fn send_bye(&mut self) {
        if self.state.phase().is_terminal() || *self.state.phase() == SessionPhase::Idle {
            return;
        }
        let msg = SignalingMessage::bye(
            self.state.session.clone(),
            self.state.role,
            self.state.assign_seq(),
            self.state.incarnation(),
        );
        if let Err(e) = self.transport.send(&msg).await {
            error!(
                session = %self.state.session,
                error = %e,
                "Bye delivery failed, closing locally for later reconciliation"
            );
        }
    }

    async fn close(&mut self, reason: CloseReason) {
        if self.state.phase().is_terminal() {
            return;
        }
        self.clear_deadline();
        self.apply_transition(SessionPhase::Closed(reason)).await;
    }

    async fn apply_transition(&mut self, to: SessionPhase) -> bool {
        let logged = to.clone();
        match self.state.transition(to) {
            Ok(from) => {
                let _ = self
                    .events
                    .publish(CamcastEvent::SessionPhaseChanged {
                        session: self.state.session.clone(),
                        from,
                        to: logged,
                        timestamp: SystemTime::now(),
                    })
                    .await;
                true
            }
            Err(e) => {
                warn!(session = %self.state.session, error = %e, "Transition rejected");
                false
            }
        }
    }

    fn register_with_monitor(&mut self) {
        if self.monitor_registered {
            self.monitor.activity_seen(&self.state.session);
            return;
        }
        self.monitor
            .register(self.state.session.clone(), self.cmd_tx.clone());
        self.monitor_registered = true;
    }

    fn arm_deadline(&mut self, kind: DeadlineKind, after: Duration) {
        self.deadline = Some((Instant::now() + after, kind));
    }

    fn clear_deadline(&mut self) {
        self.deadline = None;
    }

    async fn finalize(&mut self) {
        if self.monitor_registered {
            self.monitor.unregister(&self.state.session);
        }
        if let Err(e) = self.engine.close_session(&self.state.session).await {
            warn!(session = %self.state.session, error = %e, "Engine close failed");
        }

        let reason = match self.state.phase() {
            SessionPhase::Closed(reason) => *reason,
            _ => CloseReason::LocalTeardown,
        };
        *self.closed_at.lock() = Some(SystemTime::now());
        let _ = self
            .events
            .publish(CamcastEvent::SessionClosed {
                session: self.state.session.clone(),
                reason,
                timestamp: SystemTime::now(),
            })
            .await;
        info!(
            session = %self.state.session,
            reason = %reason,
            "Session worker finished"
        );
        // Dropping the worker drops the subscription, releasing the
        // relay watch
    }
}
