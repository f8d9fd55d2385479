use crate::error::{CamcastError, SignalingError};
use crate::session::{CameraId, JoinRequest, SessionId, ViewerId};
use crate::signaling::{RelayRecord, RelayWatch, SignalingTransport};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Decision recorded for a viewer's join request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinGrant {
    pub viewer: ViewerId,
    pub accepted: bool,
    /// Session channel the viewer should subscribe to, when accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub granted_at: DateTime<Utc>,
}

impl JoinGrant {
    pub fn granted(viewer: ViewerId, session: SessionId) -> Self {
        Self {
            viewer,
            accepted: true,
            session: Some(session),
            reason: None,
            granted_at: Utc::now(),
        }
    }

    pub fn rejected(viewer: ViewerId, reason: impl Into<String>) -> Self {
        Self {
            viewer,
            accepted: false,
            session: None,
            reason: Some(reason.into()),
            granted_at: Utc::now(),
        }
    }
}

/// Join-request mailbox for one camera on the relay.
///
/// Viewers place request documents under the camera's path; the
/// publisher watches the prefix, decides, and records a grant document
/// the viewer reads back. Delivery is at-least-once, so processing a
/// request twice must land on the same decision.
pub struct JoinIntake {
    camera: CameraId,
    transport: Arc<SignalingTransport>,
}

impl JoinIntake {
    pub fn new(camera: CameraId, transport: Arc<SignalingTransport>) -> Self {
        Self { camera, transport }
    }

    pub fn requests_prefix(&self) -> String {
        format!(
            "{}/cameras/{}/join_requests",
            self.transport.namespace(),
            self.camera
        )
    }

    fn request_path(&self, viewer: &ViewerId) -> String {
        format!("{}/{}", self.requests_prefix(), viewer)
    }

    fn grant_path(&self, viewer: &ViewerId) -> String {
        format!(
            "{}/cameras/{}/grants/{}",
            self.transport.namespace(),
            self.camera,
            viewer
        )
    }

    /// Viewer side: ask to view this camera
    pub async fn submit(&self, request: &JoinRequest) -> Result<(), CamcastError> {
        let raw = serde_json::to_vec(request).map_err(|e| SignalingError::Encode {
            details: e.to_string(),
        })?;
        self.transport
            .relay()
            .put(&self.request_path(&request.viewer), Bytes::from(raw))
            .await?;
        debug!(camera = %self.camera, viewer = %request.viewer, "Join request submitted");
        Ok(())
    }

    /// Viewer side: read the publisher's decision, if recorded yet
    pub async fn decision(&self, viewer: &ViewerId) -> Result<Option<JoinGrant>, CamcastError> {
        let path = self.grant_path(viewer);
        match self.transport.relay().get(&path).await? {
            Some(raw) => {
                let grant =
                    serde_json::from_slice(&raw).map_err(|e| SignalingError::Decode {
                        path,
                        details: e.to_string(),
                    })?;
                Ok(Some(grant))
            }
            None => Ok(None),
        }
    }

    /// Publisher side: record the decision and clear the request
    pub async fn record(&self, grant: &JoinGrant) -> Result<(), CamcastError> {
        let raw = serde_json::to_vec(grant).map_err(|e| SignalingError::Encode {
            details: e.to_string(),
        })?;
        let relay = self.transport.relay();
        relay
            .put(&self.grant_path(&grant.viewer), Bytes::from(raw))
            .await?;
        relay.remove_prefix(&self.request_path(&grant.viewer)).await?;
        debug!(
            camera = %self.camera,
            viewer = %grant.viewer,
            accepted = grant.accepted,
            "Join decision recorded"
        );
        Ok(())
    }

    /// Publisher side: stream of pending and future requests
    pub async fn watch(&self) -> Result<RelayWatch, CamcastError> {
        Ok(self
            .transport
            .relay()
            .watch_prefix(&self.requests_prefix())
            .await?)
    }

    /// Decode a watched record back into a request
    pub fn decode_request(record: &RelayRecord) -> Result<JoinRequest, SignalingError> {
        serde_json::from_slice(&record.data).map_err(|e| SignalingError::Decode {
            path: record.path.clone(),
            details: e.to_string(),
        })
    }
}
