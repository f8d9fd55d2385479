use crate::error::MediaError;
use crate::session::SessionId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

/// Callback event from the media engine, routed into the owning
/// session's command queue
#[derive(Debug, Clone, PartialEq)]
pub struct MediaEvent {
    pub session: SessionId,
    pub kind: MediaEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaEventKind {
    /// Media transport established
    Connected,
    /// Media transport dropped
    Disconnected,
    /// Locally gathered transport candidate to forward to the peer
    Candidate(String),
}

/// Boundary to the media stack that actually moves video.
///
/// Descriptions and candidates are opaque here; minting a description
/// also installs it as the local one for that session. Everything else
/// about negotiation (pacing, timeouts, retries, ordering) lives in the
/// session layer, not behind this trait.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Mint a local description for a fresh negotiation cycle
    async fn create_offer(&self, session: &SessionId) -> Result<String, MediaError>;

    /// Mint an answering description for a received offer
    async fn create_answer(
        &self,
        session: &SessionId,
        remote_offer: &str,
    ) -> Result<String, MediaError>;

    /// Install the peer's description
    async fn apply_remote_description(
        &self,
        session: &SessionId,
        description: &str,
    ) -> Result<(), MediaError>;

    /// Feed a peer candidate into the transport
    async fn add_candidate(&self, session: &SessionId, candidate: &str)
        -> Result<(), MediaError>;

    /// Tear down engine-side state for the session; idempotent
    async fn close_session(&self, session: &SessionId) -> Result<(), MediaError>;

    /// Subscribe to engine callbacks
    fn events(&self) -> broadcast::Receiver<MediaEvent>;
}

#[derive(Debug, Default)]
struct MockSession {
    local: Option<String>,
    remote: Option<String>,
    candidates: Vec<String>,
    connected: bool,
    offers_minted: u32,
}

/// Scripted in-process engine.
///
/// In auto-connect mode a session reports Connected as soon as both
/// descriptions are installed, after emitting one local candidate, so
/// the full negotiation ladder runs without real media. Manual mode
/// emits nothing on its own; tests drive callbacks through `fire`.
pub struct MockMediaEngine {
    sessions: Mutex<HashMap<SessionId, MockSession>>,
    events_tx: broadcast::Sender<MediaEvent>,
    auto_connect: bool,
    fail_offers: AtomicU32,
}

impl MockMediaEngine {
    pub fn new() -> Self {
        Self::with_auto_connect(true)
    }

    /// Engine that never progresses on its own
    pub fn manual() -> Self {
        Self::with_auto_connect(false)
    }

    fn with_auto_connect(auto_connect: bool) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            sessions: Mutex::new(HashMap::new()),
            events_tx,
            auto_connect,
            fail_offers: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` create_offer calls with an engine error
    pub fn fail_next_offers(&self, n: u32) {
        self.fail_offers.store(n, Ordering::SeqCst);
    }

    /// Inject an engine callback, as the real engine would raise it
    pub fn fire(&self, session: &SessionId, kind: MediaEventKind) {
        if let MediaEventKind::Connected | MediaEventKind::Disconnected = kind {
            if let Some(entry) = self.sessions.lock().get_mut(session) {
                entry.connected = kind == MediaEventKind::Connected;
            }
        }
        let _ = self.events_tx.send(MediaEvent {
            session: session.clone(),
            kind,
        });
    }

    /// Whether the engine currently considers the session established
    pub fn session_connected(&self, session: &SessionId) -> bool {
        self.sessions
            .lock()
            .get(session)
            .map(|s| s.connected)
            .unwrap_or(false)
    }

    /// How many negotiation cycles the session has started
    pub fn offers_minted(&self, session: &SessionId) -> u32 {
        self.sessions
            .lock()
            .get(session)
            .map(|s| s.offers_minted)
            .unwrap_or(0)
    }

    pub fn candidates_received(&self, session: &SessionId) -> usize {
        self.sessions
            .lock()
            .get(session)
            .map(|s| s.candidates.len())
            .unwrap_or(0)
    }

    fn maybe_auto_connect(&self, session: &SessionId) {
        if !self.auto_connect {
            return;
        }
        let ready = {
            let sessions = self.sessions.lock();
            sessions
                .get(session)
                .map(|s| s.local.is_some() && s.remote.is_some() && !s.connected)
                .unwrap_or(false)
        };
        if ready {
            self.fire(
                session,
                MediaEventKind::Candidate(format!("mock-candidate:{}", session)),
            );
            self.fire(session, MediaEventKind::Connected);
        }
    }
}

impl Default for MockMediaEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn create_offer(&self, session: &SessionId) -> Result<String, MediaError> {
        if self
            .fail_offers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(MediaError::Engine {
                session: session.clone(),
                operation: "create_offer",
                details: "injected offer failure".to_string(),
            });
        }

        let mut sessions = self.sessions.lock();
        let entry = sessions.entry(session.clone()).or_default();
        entry.offers_minted += 1;
        // A fresh cycle invalidates the previous negotiation result
        entry.remote = None;
        entry.connected = false;
        let description = format!("mock-offer:{}:{}", session, entry.offers_minted);
        entry.local = Some(description.clone());
        debug!(session = %session, cycle = entry.offers_minted, "Minted offer");
        Ok(description)
    }

    async fn create_answer(
        &self,
        session: &SessionId,
        remote_offer: &str,
    ) -> Result<String, MediaError> {
        let description = {
            let mut sessions = self.sessions.lock();
            let entry = sessions.entry(session.clone()).or_default();
            entry.remote = Some(remote_offer.to_string());
            let description = format!("mock-answer:{}", session);
            entry.local = Some(description.clone());
            description
        };
        self.maybe_auto_connect(session);
        Ok(description)
    }

    async fn apply_remote_description(
        &self,
        session: &SessionId,
        description: &str,
    ) -> Result<(), MediaError> {
        {
            let mut sessions = self.sessions.lock();
            let entry =
                sessions
                    .get_mut(session)
                    .ok_or_else(|| MediaError::UnknownSession {
                        session: session.clone(),
                    })?;
            entry.remote = Some(description.to_string());
        }
        self.maybe_auto_connect(session);
        Ok(())
    }

    async fn add_candidate(
        &self,
        session: &SessionId,
        candidate: &str,
    ) -> Result<(), MediaError> {
        let mut sessions = self.sessions.lock();
        let entry = sessions
            .get_mut(session)
            .ok_or_else(|| MediaError::UnknownSession {
                session: session.clone(),
            })?;
        entry.candidates.push(candidate.to_string());
        Ok(())
    }

    async fn close_session(&self, session: &SessionId) -> Result<(), MediaError> {
        self.sessions.lock().remove(session);
        debug!(session = %session, "Engine session closed");
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<MediaEvent> {
        self.events_tx.subscribe()
    }
}
