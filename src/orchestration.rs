use crate::config::CamcastConfig;
use crate::directory::PresenceDirectory;
use crate::error::{CamcastError, Result};
use crate::events::{CamcastEvent, EventBus};
use crate::manager::{CaptureHandle, CapturePipeline, JoinIntake, SessionManager};
use crate::media::{MediaEngine, MockMediaEngine};
use crate::monitor::ConnectionMonitor;
use crate::session::{CameraId, SessionContext};
use crate::signaling::{MemoryRelay, RelayStore, SignalingTransport};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Component lifecycle states
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// System shutdown reason
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    Signal(String),
    Error(String),
    UserRequest,
}

/// Main application coordinator that wires and manages all components.
///
/// Construction builds the full component graph: relay transport,
/// media engine boundary, the per-camera session manager with its
/// capture actor and join intake, the connection monitor, and the
/// presence directory. `run` then blocks until a shutdown reason
/// arrives and tears the graph down in reverse order.
pub struct CamcastOrchestrator {
    config: CamcastConfig,
    camera: CameraId,
    event_bus: EventBus,
    transport: Arc<SignalingTransport>,
    manager: Arc<SessionManager>,
    capture: CaptureHandle,
    directory: Arc<PresenceDirectory>,

    // Lifecycle management
    tasks: Vec<JoinHandle<()>>,
    component_states: Arc<Mutex<HashMap<String, ComponentState>>>,
    shutdown_sender: Option<oneshot::Sender<ShutdownReason>>,
    shutdown_receiver: Option<oneshot::Receiver<ShutdownReason>>,
    cancellation_token: CancellationToken,
}

impl CamcastOrchestrator {
    /// Create an orchestrator backed by the in-process relay and media
    /// engine. Deployments that talk to the cloud relay and a real
    /// media stack supply their own backends via `with_backends`.
    pub async fn new(config: CamcastConfig) -> Result<Self> {
        Self::with_backends(config, MemoryRelay::shared(), Arc::new(MockMediaEngine::new())).await
    }

    /// Create an orchestrator over the given relay and media engine
    pub async fn with_backends(
        config: CamcastConfig,
        relay: Arc<dyn RelayStore>,
        engine: Arc<dyn MediaEngine>,
    ) -> Result<Self> {
        let event_bus = EventBus::new(config.system.event_bus_capacity);
        let camera = CameraId::from(config.system.camera_id.clone());
        let transport = Arc::new(SignalingTransport::new(relay, config.signaling.clone()));
        let cancellation_token = CancellationToken::new();
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();

        // Monitor and capture actors live for the whole process; they
        // idle until sessions register with them
        let monitor = ConnectionMonitor::new(config.keepalive.clone(), event_bus.clone());
        let (monitor_handle, monitor_task) = monitor.spawn(cancellation_token.clone());

        let capture_pipeline = CapturePipeline::new(camera.clone(), event_bus.clone());
        let (capture, capture_task) = capture_pipeline.spawn(cancellation_token.clone());

        let ctx = SessionContext {
            config: config.session.clone(),
            transport: Arc::clone(&transport),
            engine,
            events: event_bus.clone(),
            monitor: monitor_handle,
        };

        let intake = JoinIntake::new(camera.clone(), Arc::clone(&transport));
        let manager = SessionManager::new(
            camera.clone(),
            config.session.clone(),
            config.detection.clone(),
            ctx,
            capture.clone(),
            intake,
        );

        let directory = Arc::new(PresenceDirectory::new(
            camera.clone(),
            config.system.display_name.clone(),
            config.session.viewer_capacity,
            Arc::clone(&transport),
        ));

        Ok(Self {
            config,
            camera,
            event_bus,
            transport,
            manager,
            capture,
            directory,
            tasks: vec![monitor_task, capture_task],
            component_states: Arc::new(Mutex::new(HashMap::new())),
            shutdown_sender: Some(shutdown_sender),
            shutdown_receiver: Some(shutdown_receiver),
            cancellation_token,
        })
    }

    /// The per-camera session manager, for embedders that feed viewer
    /// requests or detection events directly
    pub fn manager(&self) -> Arc<SessionManager> {
        Arc::clone(&self.manager)
    }

    /// The shared signaling transport, for viewer-side helpers in the
    /// same process (join intake, presence reads)
    pub fn transport(&self) -> Arc<SignalingTransport> {
        Arc::clone(&self.transport)
    }

    pub fn events(&self) -> EventBus {
        self.event_bus.clone()
    }

    /// Initialize component state tracking
    pub async fn initialize(&mut self) -> Result<()> {
        info!(camera = %self.camera, "Initializing camcast components");

        let mut states = self.component_states.lock().await;
        states.insert("monitor".to_string(), ComponentState::Stopped);
        states.insert("capture".to_string(), ComponentState::Stopped);
        states.insert("manager".to_string(), ComponentState::Stopped);
        states.insert("directory".to_string(), ComponentState::Stopped);
        drop(states);

        info!("All components initialized");
        Ok(())
    }

    /// Start all components
    pub async fn start(&mut self) -> Result<()> {
        info!(camera = %self.camera, "Starting camcast system");

        // Monitor and capture actors were spawned at construction
        self.set_component_state("monitor", ComponentState::Running)
            .await;
        self.set_component_state("capture", ComponentState::Running)
            .await;

        self.set_component_state("manager", ComponentState::Starting)
            .await;
        self.tasks
            .extend(self.manager.start(&self.cancellation_token));
        self.set_component_state("manager", ComponentState::Running)
            .await;
        info!(
            capacity = self.config.session.viewer_capacity,
            "Session manager started"
        );

        self.set_component_state("directory", ComponentState::Starting)
            .await;
        self.directory.publish(false, 0).await.map_err(|e| {
            error!(error = %e, "Failed to publish initial presence record");
            e
        })?;
        let updater = self.spawn_presence_updater();
        self.tasks.push(updater);
        self.set_component_state("directory", ComponentState::Running)
            .await;
        info!(
            short_code = self.directory.short_code(),
            "Presence directory started"
        );

        info!("Camcast system started");
        Ok(())
    }

    /// Run the main loop with signal handling, returning the exit code
    pub async fn run(&mut self) -> Result<i32> {
        info!(camera = %self.camera, "Camcast system is running");

        let shutdown_sender = self
            .shutdown_sender
            .take()
            .ok_or_else(|| CamcastError::system("Shutdown sender already taken"))?;
        let shutdown_receiver = self
            .shutdown_receiver
            .take()
            .ok_or_else(|| CamcastError::system("Shutdown receiver already taken"))?;

        self.setup_signal_handlers(shutdown_sender).await;

        let shutdown_reason = shutdown_receiver
            .await
            .map_err(|_| CamcastError::system("Shutdown channel closed unexpectedly"))?;

        info!("Shutdown initiated: {:?}", shutdown_reason);
        let _ = self
            .event_bus
            .publish(CamcastEvent::ShutdownRequested {
                timestamp: SystemTime::now(),
                reason: format!("{:?}", shutdown_reason),
            })
            .await;

        let exit_code = self.shutdown().await?;
        info!("Camcast system shutdown complete");
        Ok(exit_code)
    }

    /// Presence follows the session set and the capture run state: any
    /// event that can change either refreshes the directory record
    fn spawn_presence_updater(&self) -> JoinHandle<()> {
        let mut rx = self.event_bus.subscribe();
        let directory = Arc::clone(&self.directory);
        let manager = Arc::clone(&self.manager);
        let capture = self.capture.clone();
        let cancel = self.cancellation_token.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Presence updater lagged, resyncing");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                if !matches!(
                    event,
                    CamcastEvent::ViewerJoined { .. }
                        | CamcastEvent::SessionClosed { .. }
                        | CamcastEvent::StreamingStarted { .. }
                        | CamcastEvent::StreamingStopped { .. }
                ) {
                    continue;
                }

                let live = match capture.status().await {
                    Ok(status) => status.running,
                    Err(_) => break,
                };
                let viewers = manager.live_count();
                if let Err(e) = directory.publish(live, viewers).await {
                    warn!(error = %e, "Presence update failed");
                }
            }
            debug!("Presence updater finished");
        })
    }

    /// Set up signal handlers for graceful shutdown
    async fn setup_signal_handlers(&self, shutdown_sender: oneshot::Sender<ShutdownReason>) {
        let shutdown_sender = Arc::new(Mutex::new(Some(shutdown_sender)));

        // SIGTERM (service stop) - Unix only
        #[cfg(unix)]
        {
            let sender = Arc::clone(&shutdown_sender);
            tokio::spawn(async move {
                if let Some(()) =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("Failed to register SIGTERM handler")
                        .recv()
                        .await
                {
                    info!("Received SIGTERM signal");
                    if let Some(sender) = sender.lock().await.take() {
                        let _ = sender.send(ShutdownReason::Signal("SIGTERM".to_string()));
                    }
                }
            });
        }

        // SIGINT (Ctrl+C) - cross-platform
        let sender = Arc::clone(&shutdown_sender);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received SIGINT signal (Ctrl+C)");
                if let Some(sender) = sender.lock().await.take() {
                    let _ = sender.send(ShutdownReason::Signal("SIGINT".to_string()));
                }
            }
        });
    }

    /// Tear down in reverse order: sessions first so Byes go out while
    /// the transport is still up, then presence, then the background
    /// loops
    async fn shutdown(&mut self) -> Result<i32> {
        info!("Beginning graceful shutdown");
        let mut exit_code = 0;

        self.set_component_state("manager", ComponentState::Stopping)
            .await;
        self.manager.shutdown().await;
        self.set_component_state("manager", ComponentState::Stopped)
            .await;

        self.set_component_state("directory", ComponentState::Stopping)
            .await;
        if let Err(e) = self.directory.mark_offline().await {
            error!(error = %e, "Failed to mark camera offline");
            self.set_component_state("directory", ComponentState::Failed)
                .await;
            exit_code = 1;
        } else {
            self.set_component_state("directory", ComponentState::Stopped)
                .await;
        }

        self.set_component_state("monitor", ComponentState::Stopping)
            .await;
        self.set_component_state("capture", ComponentState::Stopping)
            .await;
        self.cancellation_token.cancel();

        let tasks = std::mem::take(&mut self.tasks);
        if timeout(TASK_DRAIN_TIMEOUT, join_all(tasks)).await.is_err() {
            error!("Background tasks did not finish within the stop timeout");
            exit_code = 1;
        }
        self.set_component_state("monitor", ComponentState::Stopped)
            .await;
        self.set_component_state("capture", ComponentState::Stopped)
            .await;

        info!("Graceful shutdown completed with exit code: {}", exit_code);
        Ok(exit_code)
    }

    /// Update component state
    async fn set_component_state(&self, component: &str, state: ComponentState) {
        let mut states = self.component_states.lock().await;
        states.insert(component.to_string(), state.clone());
        debug!("Component '{}' state changed to: {:?}", component, state);
    }

    /// Get component state
    pub async fn get_component_state(&self, component: &str) -> Option<ComponentState> {
        let states = self.component_states.lock().await;
        states.get(component).cloned()
    }

    /// Get all component states
    pub async fn get_all_component_states(&self) -> HashMap<String, ComponentState> {
        let states = self.component_states.lock().await;
        states.clone()
    }
}
