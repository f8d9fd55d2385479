use super::{RelayStore, ReorderBuffer, SignalingMessage};
use crate::config::SignalingConfig;
use crate::error::SignalingError;
use crate::session::{Role, SessionId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Per-session signaling channel over the shared relay.
///
/// Each session has one ordered log on the relay that both endpoints
/// append to. Sending retries transient relay failures with exponential
/// backoff; subscribing yields only the peer's half of the log, deduped
/// and released in sequence order.
pub struct SignalingTransport {
    relay: Arc<dyn RelayStore>,
    config: SignalingConfig,
}

impl SignalingTransport {
    pub fn new(relay: Arc<dyn RelayStore>, config: SignalingConfig) -> Self {
        Self { relay, config }
    }

    /// The shared relay handle, for components that address paths
    /// outside session channels (presence, join intake)
    pub fn relay(&self) -> Arc<dyn RelayStore> {
        Arc::clone(&self.relay)
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Root path of everything belonging to one session
    pub fn session_prefix(&self, session: &SessionId) -> String {
        format!("{}/sessions/{}", self.config.namespace, session)
    }

    /// Append a message to its session's log, retrying transient
    /// failures with exponential backoff up to the configured bound
    pub async fn send(&self, msg: &SignalingMessage) -> Result<(), SignalingError> {
        let raw = msg.encode()?;
        let path = self.log_path(&msg.session);

        let mut attempt: u32 = 0;
        loop {
            match self.relay.append(&path, raw.clone()).await {
                Ok(()) => {
                    trace!(
                        session = %msg.session,
                        kind = msg.kind.as_str(),
                        seq = msg.seq,
                        "Signaling message sent"
                    );
                    return Ok(());
                }
                Err(SignalingError::TransportUnavailable { details })
                    if attempt < self.config.send_retry_limit =>
                {
                    let delay = self.config.send_retry_base() * 2u32.pow(attempt);
                    warn!(
                        session = %msg.session,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        details,
                        "Relay unavailable, retrying send"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Subscribe to the peer's half of a session's channel.
    ///
    /// The returned subscription delivers messages in non-decreasing
    /// sequence order with relay duplicates collapsed. Dropping it
    /// releases the watch.
    pub async fn subscribe(
        &self,
        session: &SessionId,
        local_role: Role,
    ) -> Result<SessionSubscription, SignalingError> {
        let path = self.log_path(session);
        let mut watch = self.relay.watch_prefix(&path).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let limit = self.config.reorder_buffer_limit;
        let session = session.clone();
        let pump_session = session.clone();

        let task = tokio::spawn(async move {
            let mut reorder = ReorderBuffer::new(limit);
            while let Some(record) = watch.recv().await {
                let msg = match SignalingMessage::decode(&record.path, &record.data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(error = %e, "Skipping undecodable relay record");
                        continue;
                    }
                };
                if msg.sender == local_role {
                    continue;
                }
                if msg.session != pump_session {
                    warn!(
                        expected = %pump_session,
                        got = %msg.session,
                        "Mismatched session id in channel log, skipping"
                    );
                    continue;
                }
                for released in reorder.accept(msg) {
                    if tx.send(released).is_err() {
                        return;
                    }
                }
            }
            debug!(session = %pump_session, "Relay watch ended");
        });

        Ok(SessionSubscription {
            session,
            receiver: rx,
            task,
        })
    }

    /// Delete a session's channel storage. Called once the session is
    /// evicted after its grace period.
    pub async fn release(&self, session: &SessionId) -> Result<(), SignalingError> {
        self.relay.remove_prefix(&self.session_prefix(session)).await
    }

    fn log_path(&self, session: &SessionId) -> String {
        format!("{}/log", self.session_prefix(session))
    }
}

/// Receiving half of one session's signaling channel
pub struct SessionSubscription {
    session: SessionId,
    receiver: mpsc::UnboundedReceiver<SignalingMessage>,
    task: JoinHandle<()>,
}

impl SessionSubscription {
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Next peer message in sequence order. Errs with
    /// SubscriptionClosed once the relay watch has ended and no further
    /// messages can arrive.
    pub async fn recv(&mut self) -> Result<SignalingMessage, SignalingError> {
        self.receiver
            .recv()
            .await
            .ok_or_else(|| SignalingError::SubscriptionClosed {
                session: self.session.clone(),
            })
    }
}

impl Drop for SessionSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
