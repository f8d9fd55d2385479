use crate::config::DetectionConfig;
use crate::session::CameraId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

/// What the detector saw in a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionKind {
    Motion,
    Person,
    /// Nothing in frame
    #[serde(rename = "none")]
    Quiet,
}

impl DetectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionKind::Motion => "motion",
            DetectionKind::Person => "person",
            DetectionKind::Quiet => "none",
        }
    }
}

/// One observation from the black-box detector. Ephemeral; routed but
/// never persisted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub camera: CameraId,
    pub kind: DetectionKind,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl DetectionEvent {
    pub fn new(camera: CameraId, kind: DetectionKind, confidence: f64) -> Self {
        Self {
            camera,
            kind,
            confidence,
            timestamp: Utc::now(),
        }
    }
}

/// What the gate wants done about an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateIntent {
    /// Bring the publish pipeline up
    Start,
    /// Quiet long enough; take the pipeline down
    Stop,
    /// Notify watching viewers
    Alert,
}

/// Hysteresis gate between raw detector output and capture policy.
///
/// Turning on requires confidence at or above the on threshold; turning
/// off requires staying below the lower off threshold for the whole
/// debounce window. Confidence between the two maintains the current
/// state, so borderline frames never flap the pipeline.
///
/// The caller supplies the clock, which keeps the window logic
/// deterministic and free of timers.
pub struct DetectionGate {
    config: DetectionConfig,
    active: bool,
    quiet_since: Option<Instant>,
    last_alert: Option<Instant>,
}

impl DetectionGate {
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            config,
            active: false,
            quiet_since: None,
            last_alert: None,
        }
    }

    /// Whether the gate currently wants the pipeline up
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Fold one observation into the gate and return the intents it
    /// triggers, possibly none
    pub fn evaluate(&mut self, event: &DetectionEvent, now: Instant) -> Vec<GateIntent> {
        let mut intents = Vec::new();
        // A "none" verdict is silence whatever its confidence says
        let silent = event.kind == DetectionKind::Quiet
            || event.confidence < self.config.off_confidence;

        if !silent {
            self.quiet_since = None;
        }

        if event.kind != DetectionKind::Quiet && event.confidence >= self.config.on_confidence {
            if !self.active {
                self.active = true;
                info!(
                    kind = event.kind.as_str(),
                    confidence = event.confidence,
                    "Detection gate on"
                );
                intents.push(GateIntent::Start);
            }
            if event.kind == DetectionKind::Person
                && self.config.alert_on_person
                && self.cooldown_elapsed(now)
            {
                self.last_alert = Some(now);
                intents.push(GateIntent::Alert);
            }
        } else if silent && self.active {
            let since = *self.quiet_since.get_or_insert(now);
            if now.duration_since(since) >= self.config.debounce() {
                self.active = false;
                self.quiet_since = None;
                info!("Detection gate off");
                intents.push(GateIntent::Stop);
            } else {
                debug!(
                    quiet_ms = now.duration_since(since).as_millis() as u64,
                    "Quiet window running"
                );
            }
        }

        intents
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        match self.last_alert {
            Some(at) => now.duration_since(at) >= self.config.alert_cooldown(),
            None => true,
        }
    }
}
