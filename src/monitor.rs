use crate::config::KeepaliveConfig;
use crate::events::{CamcastEvent, EventBus};
use crate::session::{SessionCommand, SessionId};
use std::collections::HashMap;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Signals into the monitor loop
#[derive(Debug)]
pub enum MonitorSignal {
    /// Track a session that just established media
    Register {
        session: SessionId,
        commands: mpsc::Sender<SessionCommand>,
    },
    /// Stop tracking a closing session
    Unregister { session: SessionId },
    /// A keepalive arrived from the peer
    KeepaliveSeen { session: SessionId },
    /// Media-level activity counts as liveness evidence too
    ActivitySeen { session: SessionId },
}

/// Cheap cloneable reporting handle into the monitor.
///
/// All methods are fire-and-forget; a monitor that is shutting down
/// simply drops the signal.
#[derive(Clone)]
pub struct MonitorHandle {
    tx: mpsc::UnboundedSender<MonitorSignal>,
}

impl MonitorHandle {
    pub fn register(&self, session: SessionId, commands: mpsc::Sender<SessionCommand>) {
        let _ = self.tx.send(MonitorSignal::Register { session, commands });
    }

    pub fn unregister(&self, session: &SessionId) {
        let _ = self.tx.send(MonitorSignal::Unregister {
            session: session.clone(),
        });
    }

    pub fn keepalive_seen(&self, session: &SessionId) {
        let _ = self.tx.send(MonitorSignal::KeepaliveSeen {
            session: session.clone(),
        });
    }

    pub fn activity_seen(&self, session: &SessionId) {
        let _ = self.tx.send(MonitorSignal::ActivitySeen {
            session: session.clone(),
        });
    }

    /// Handle wired to nothing, for components built before the monitor
    /// loop starts (and for tests that do not care about liveness)
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }
}

struct TrackedSession {
    commands: mpsc::Sender<SessionCommand>,
    last_seen: Instant,
    misses: u32,
    degraded_reported: bool,
}

/// Watches keepalive cadence for live sessions.
///
/// The monitor observes and reports; it never changes session state
/// itself. Verdicts go into each session's command queue and the
/// worker decides what they mean in its current phase.
pub struct ConnectionMonitor {
    config: KeepaliveConfig,
    events: EventBus,
}

impl ConnectionMonitor {
    pub fn new(config: KeepaliveConfig, events: EventBus) -> Self {
        Self { config, events }
    }

    /// Start the monitor loop. Runs until cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> (MonitorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = MonitorHandle { tx };
        let task = tokio::spawn(self.run(rx, cancel));
        (handle, task)
    }

    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<MonitorSignal>,
        cancel: CancellationToken,
    ) {
        let mut tracked: HashMap<SessionId, TrackedSession> = HashMap::new();
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // Skip first immediate tick

        info!(
            interval_ms = self.config.interval_ms,
            miss_threshold = self.config.miss_threshold,
            "Connection monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                signal = rx.recv() => match signal {
                    Some(signal) => self.handle_signal(&mut tracked, signal),
                    None => break,
                },
                _ = ticker.tick() => self.sweep(&mut tracked).await,
            }
        }

        info!("Connection monitor stopped");
    }

    fn handle_signal(&self, tracked: &mut HashMap<SessionId, TrackedSession>, signal: MonitorSignal) {
        match signal {
            MonitorSignal::Register { session, commands } => {
                debug!(session = %session, "Monitoring session liveness");
                tracked.insert(
                    session,
                    TrackedSession {
                        commands,
                        last_seen: Instant::now(),
                        misses: 0,
                        degraded_reported: false,
                    },
                );
            }
            MonitorSignal::Unregister { session } => {
                if tracked.remove(&session).is_some() {
                    debug!(session = %session, "Stopped monitoring session");
                }
            }
            MonitorSignal::KeepaliveSeen { session } | MonitorSignal::ActivitySeen { session } => {
                if let Some(entry) = tracked.get_mut(&session) {
                    entry.last_seen = Instant::now();
                    entry.misses = 0;
                    if entry.degraded_reported {
                        entry.degraded_reported = false;
                        let _ = entry.commands.try_send(SessionCommand::LivenessChanged {
                            healthy: true,
                            misses: 0,
                        });
                    }
                }
            }
        }
    }

    /// One pass over every tracked session: probe the peer and account
    /// for silence since the last evidence of life
    async fn sweep(&self, tracked: &mut HashMap<SessionId, TrackedSession>) {
        let interval = self.config.interval();
        let mut dead = Vec::new();

        for (session, entry) in tracked.iter_mut() {
            if entry.commands.is_closed() {
                dead.push(session.clone());
                continue;
            }

            // A full queue just means the worker is busy; skipping one
            // probe is harmless
            let _ = entry.commands.try_send(SessionCommand::SendKeepalive);

            let elapsed = entry.last_seen.elapsed();
            let misses = (elapsed.as_millis() / interval.as_millis().max(1)) as u32;
            if misses > entry.misses {
                entry.misses = misses;
                debug!(session = %session, misses, "Keepalive missed");
                let _ = self
                    .events
                    .publish(CamcastEvent::KeepaliveMissed {
                        session: session.clone(),
                        misses,
                        timestamp: SystemTime::now(),
                    })
                    .await;
            }

            if entry.misses >= self.config.miss_threshold && !entry.degraded_reported {
                warn!(
                    session = %session,
                    misses = entry.misses,
                    threshold = self.config.miss_threshold,
                    "Session went silent"
                );
                entry.degraded_reported = true;
                let _ = entry.commands.try_send(SessionCommand::LivenessChanged {
                    healthy: false,
                    misses: entry.misses,
                });
            }
        }

        for session in dead {
            tracked.remove(&session);
            debug!(session = %session, "Dropped monitor entry for finished session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use tokio::time::{timeout, Duration};

    fn fast_config() -> KeepaliveConfig {
        KeepaliveConfig {
            interval_ms: 20,
            miss_threshold: 3,
        }
    }

    fn session() -> SessionId {
        SessionId::from("ab12cd34ef56")
    }

    /// Drain commands until a liveness verdict shows up, or time out
    async fn next_verdict(
        rx: &mut mpsc::Receiver<SessionCommand>,
        wait: Duration,
    ) -> Option<(bool, u32)> {
        timeout(wait, async {
            while let Some(cmd) = rx.recv().await {
                if let SessionCommand::LivenessChanged { healthy, misses } = cmd {
                    return Some((healthy, misses));
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    #[tokio::test]
    async fn test_silence_reports_unhealthy_after_threshold() {
        let monitor = ConnectionMonitor::new(fast_config(), EventBus::new(16));
        let cancel = CancellationToken::new();
        let (handle, task) = monitor.spawn(cancel.clone());

        let (cmd_tx, mut cmd_rx) = mpsc::channel(64);
        handle.register(session(), cmd_tx);

        // Never report a keepalive; three misses at 20ms each
        let (healthy, misses) = next_verdict(&mut cmd_rx, Duration::from_millis(500))
            .await
            .expect("expected a liveness verdict");
        assert!(!healthy);
        assert!(misses >= 3);

        cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_keepalives_keep_session_healthy() {
        let monitor = ConnectionMonitor::new(fast_config(), EventBus::new(16));
        let cancel = CancellationToken::new();
        let (handle, task) = monitor.spawn(cancel.clone());

        let (cmd_tx, mut cmd_rx) = mpsc::channel(64);
        handle.register(session(), cmd_tx);

        // Feed keepalives faster than the interval for a while
        for _ in 0..10 {
            handle.keepalive_seen(&session());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let verdict = next_verdict(&mut cmd_rx, Duration::from_millis(30)).await;
        assert_eq!(verdict, None);

        cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_recovery_reports_healthy_once() {
        let monitor = ConnectionMonitor::new(fast_config(), EventBus::new(16));
        let cancel = CancellationToken::new();
        let (handle, task) = monitor.spawn(cancel.clone());

        let (cmd_tx, mut cmd_rx) = mpsc::channel(64);
        handle.register(session(), cmd_tx);

        let (healthy, _) = next_verdict(&mut cmd_rx, Duration::from_millis(500))
            .await
            .expect("expected a liveness verdict");
        assert!(!healthy);

        // Peer comes back
        handle.keepalive_seen(&session());
        let verdict = next_verdict(&mut cmd_rx, Duration::from_millis(200)).await;
        assert_eq!(verdict, Some((true, 0)));

        cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_probes_sent_each_sweep() {
        let monitor = ConnectionMonitor::new(fast_config(), EventBus::new(16));
        let cancel = CancellationToken::new();
        let (handle, task) = monitor.spawn(cancel.clone());

        let (cmd_tx, mut cmd_rx) = mpsc::channel(64);
        handle.register(session(), cmd_tx);
        handle.keepalive_seen(&session());

        let mut probes = 0;
        let _ = timeout(Duration::from_millis(120), async {
            while let Some(cmd) = cmd_rx.recv().await {
                if matches!(cmd, SessionCommand::SendKeepalive) {
                    probes += 1;
                }
            }
        })
        .await;
        assert!(probes >= 2, "expected repeated probes, saw {}", probes);

        cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_finished_sessions_pruned() {
        let monitor = ConnectionMonitor::new(fast_config(), EventBus::new(16));
        let cancel = CancellationToken::new();
        let (handle, task) = monitor.spawn(cancel.clone());

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        handle.register(session(), cmd_tx);
        drop(cmd_rx);

        // The next sweeps notice the closed queue and drop the entry;
        // nothing to assert beyond the loop not panicking
        tokio::time::sleep(Duration::from_millis(80)).await;

        cancel.cancel();
        let _ = task.await;
    }
}
