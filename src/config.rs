use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CamcastConfig {
    pub system: SystemConfig,
    pub session: SessionConfig,
    pub keepalive: KeepaliveConfig,
    pub signaling: SignalingConfig,
    pub detection: DetectionConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    /// Identifier this camera publishes under (unique per device)
    #[serde(default = "default_camera_id")]
    pub camera_id: String,

    /// Human-readable name shown to viewers in the presence directory
    #[serde(default = "default_display_name")]
    pub display_name: String,

    /// Event bus capacity
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionConfig {
    /// Maximum number of concurrent viewer sessions per camera
    #[serde(default = "default_viewer_capacity")]
    pub viewer_capacity: usize,

    /// Time allowed from Offer sent to media connected before the
    /// session fails with a negotiation timeout
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,

    /// Time a session may stay Degraded before a reconnect is attempted
    #[serde(default = "default_degrade_timeout_ms")]
    pub degrade_timeout_ms: u64,

    /// Maximum reconnect attempts before the session is closed
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,

    /// Base delay for exponential reconnect backoff
    #[serde(default = "default_reconnect_backoff_base_ms")]
    pub reconnect_backoff_base_ms: u64,

    /// How long a Closed session is retained for late-message absorption
    /// before the sweeper evicts it
    #[serde(default = "default_closed_grace_ms")]
    pub closed_grace_ms: u64,

    /// Interval between sweeps for evictable Closed sessions
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct KeepaliveConfig {
    /// Interval between keepalives on a connected session
    #[serde(default = "default_keepalive_interval_ms")]
    pub interval_ms: u64,

    /// Consecutive missed intervals before a session is marked Degraded
    #[serde(default = "default_keepalive_miss_threshold")]
    pub miss_threshold: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SignalingConfig {
    /// Root path segment under which all relay paths are written
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Send retries after a transient relay failure before giving up
    #[serde(default = "default_send_retry_limit")]
    pub send_retry_limit: u32,

    /// Base delay for exponential send-retry backoff
    #[serde(default = "default_send_retry_base_ms")]
    pub send_retry_base_ms: u64,

    /// Maximum out-of-order messages buffered per session before the
    /// buffer is force-drained
    #[serde(default = "default_reorder_buffer_limit")]
    pub reorder_buffer_limit: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DetectionConfig {
    /// Confidence at or above which the gate turns on
    #[serde(default = "default_on_confidence")]
    pub on_confidence: f64,

    /// Confidence at or below which the gate may turn off
    #[serde(default = "default_off_confidence")]
    pub off_confidence: f64,

    /// Time confidence must stay at or below off_confidence before the
    /// gate turns off
    #[serde(default = "default_detection_debounce_ms")]
    pub debounce_ms: u64,

    /// Activate the capture pipeline when the gate turns on
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,

    /// Deactivate the capture pipeline when the gate turns off
    #[serde(default = "default_auto_stop")]
    pub auto_stop: bool,

    /// Broadcast an alert to connected viewers when a person is detected
    #[serde(default = "default_alert_on_person")]
    pub alert_on_person: bool,

    /// Minimum spacing between person alerts
    #[serde(default = "default_alert_cooldown_ms")]
    pub alert_cooldown_ms: u64,

    /// Viewers to pull in automatically whenever an alert fires
    #[serde(default)]
    pub alert_viewers: Vec<String>,
}

impl CamcastConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("camcast.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            // Start with default values
            .set_default("system.camera_id", default_camera_id())?
            .set_default("system.display_name", default_display_name())?
            .set_default(
                "system.event_bus_capacity",
                default_event_bus_capacity() as i64,
            )?
            .set_default(
                "session.viewer_capacity",
                default_viewer_capacity() as i64,
            )?
            .set_default(
                "session.negotiation_timeout_ms",
                default_negotiation_timeout_ms(),
            )?
            .set_default("session.degrade_timeout_ms", default_degrade_timeout_ms())?
            .set_default(
                "session.reconnect_max_attempts",
                default_reconnect_max_attempts(),
            )?
            .set_default(
                "session.reconnect_backoff_base_ms",
                default_reconnect_backoff_base_ms(),
            )?
            .set_default("session.closed_grace_ms", default_closed_grace_ms())?
            .set_default("session.gc_interval_ms", default_gc_interval_ms())?
            .set_default("keepalive.interval_ms", default_keepalive_interval_ms())?
            .set_default(
                "keepalive.miss_threshold",
                default_keepalive_miss_threshold(),
            )?
            .set_default("signaling.namespace", default_namespace())?
            .set_default("signaling.send_retry_limit", default_send_retry_limit())?
            .set_default(
                "signaling.send_retry_base_ms",
                default_send_retry_base_ms(),
            )?
            .set_default(
                "signaling.reorder_buffer_limit",
                default_reorder_buffer_limit() as i64,
            )?
            .set_default("detection.on_confidence", default_on_confidence())?
            .set_default("detection.off_confidence", default_off_confidence())?
            .set_default(
                "detection.debounce_ms",
                default_detection_debounce_ms(),
            )?
            .set_default("detection.auto_start", default_auto_start())?
            .set_default("detection.auto_stop", default_auto_stop())?
            .set_default("detection.alert_on_person", default_alert_on_person())?
            .set_default(
                "detection.alert_cooldown_ms",
                default_alert_cooldown_ms(),
            )?
            .set_default("detection.alert_viewers", Vec::<String>::new())?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with CAMCAST_ prefix
            .add_source(Environment::with_prefix("CAMCAST").separator("_"))
            .build()?;

        let config: CamcastConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate identity
        if self.system.camera_id.is_empty() {
            return Err(ConfigError::Message(
                "System camera_id must not be empty".to_string(),
            ));
        }

        if self.system.event_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "Event bus capacity must be greater than 0".to_string(),
            ));
        }

        // Validate session settings
        if self.session.viewer_capacity == 0 {
            return Err(ConfigError::Message(
                "Session viewer_capacity must be greater than 0".to_string(),
            ));
        }

        if self.session.negotiation_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "Session negotiation_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.session.gc_interval_ms == 0 {
            return Err(ConfigError::Message(
                "Session gc_interval_ms must be greater than 0".to_string(),
            ));
        }

        // Validate keepalive settings
        if self.keepalive.interval_ms == 0 {
            return Err(ConfigError::Message(
                "Keepalive interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.keepalive.miss_threshold == 0 {
            return Err(ConfigError::Message(
                "Keepalive miss_threshold must be greater than 0".to_string(),
            ));
        }

        // Validate signaling settings
        if self.signaling.namespace.is_empty() {
            return Err(ConfigError::Message(
                "Signaling namespace must not be empty".to_string(),
            ));
        }

        if self.signaling.reorder_buffer_limit == 0 {
            return Err(ConfigError::Message(
                "Signaling reorder_buffer_limit must be greater than 0".to_string(),
            ));
        }

        // Validate detection thresholds
        if !(0.0..=1.0).contains(&self.detection.on_confidence)
            || !(0.0..=1.0).contains(&self.detection.off_confidence)
        {
            return Err(ConfigError::Message(
                "Detection confidences must be within 0.0..=1.0".to_string(),
            ));
        }

        if self.detection.off_confidence >= self.detection.on_confidence {
            return Err(ConfigError::Message(
                "Detection off_confidence must be below on_confidence".to_string(),
            ));
        }

        Ok(())
    }
}

impl SessionConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn degrade_timeout(&self) -> Duration {
        Duration::from_millis(self.degrade_timeout_ms)
    }

    pub fn reconnect_backoff_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_base_ms)
    }

    pub fn closed_grace(&self) -> Duration {
        Duration::from_millis(self.closed_grace_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }
}

impl KeepaliveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl SignalingConfig {
    pub fn send_retry_base(&self) -> Duration {
        Duration::from_millis(self.send_retry_base_ms)
    }
}

impl DetectionConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_millis(self.alert_cooldown_ms)
    }
}

impl Default for CamcastConfig {
    fn default() -> Self {
        Self {
            system: SystemConfig::default(),
            session: SessionConfig::default(),
            keepalive: KeepaliveConfig::default(),
            signaling: SignalingConfig::default(),
            detection: DetectionConfig::default(),
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            camera_id: default_camera_id(),
            display_name: default_display_name(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            viewer_capacity: default_viewer_capacity(),
            negotiation_timeout_ms: default_negotiation_timeout_ms(),
            degrade_timeout_ms: default_degrade_timeout_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            reconnect_backoff_base_ms: default_reconnect_backoff_base_ms(),
            closed_grace_ms: default_closed_grace_ms(),
            gc_interval_ms: default_gc_interval_ms(),
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_keepalive_interval_ms(),
            miss_threshold: default_keepalive_miss_threshold(),
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            send_retry_limit: default_send_retry_limit(),
            send_retry_base_ms: default_send_retry_base_ms(),
            reorder_buffer_limit: default_reorder_buffer_limit(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            on_confidence: default_on_confidence(),
            off_confidence: default_off_confidence(),
            debounce_ms: default_detection_debounce_ms(),
            auto_start: default_auto_start(),
            auto_stop: default_auto_stop(),
            alert_on_person: default_alert_on_person(),
            alert_cooldown_ms: default_alert_cooldown_ms(),
            alert_viewers: Vec::new(),
        }
    }
}

// Default value functions
fn default_camera_id() -> String {
    "cam0".to_string()
}
fn default_display_name() -> String {
    "Camcast Camera".to_string()
}
fn default_event_bus_capacity() -> usize {
    100
}

fn default_viewer_capacity() -> usize {
    8
}
fn default_negotiation_timeout_ms() -> u64 {
    15_000
}
fn default_degrade_timeout_ms() -> u64 {
    10_000
}
fn default_reconnect_max_attempts() -> u32 {
    3
}
fn default_reconnect_backoff_base_ms() -> u64 {
    1_000
}
fn default_closed_grace_ms() -> u64 {
    30_000
}
fn default_gc_interval_ms() -> u64 {
    5_000
}

fn default_keepalive_interval_ms() -> u64 {
    5_000
}
fn default_keepalive_miss_threshold() -> u32 {
    3
}

fn default_namespace() -> String {
    "camcast".to_string()
}
fn default_send_retry_limit() -> u32 {
    3
}
fn default_send_retry_base_ms() -> u64 {
    200
}
fn default_reorder_buffer_limit() -> usize {
    64
}

fn default_on_confidence() -> f64 {
    0.7
}
fn default_off_confidence() -> f64 {
    0.3
}
fn default_detection_debounce_ms() -> u64 {
    10_000
}
fn default_auto_start() -> bool {
    true
}
fn default_auto_stop() -> bool {
    true
}
fn default_alert_on_person() -> bool {
    true
}
fn default_alert_cooldown_ms() -> u64 {
    60_000
}
