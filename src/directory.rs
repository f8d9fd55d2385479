use crate::error::{CamcastError, SignalingError};
use crate::session::CameraId;
use crate::signaling::SignalingTransport;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// What a camera advertises about itself on the relay.
///
/// Viewers list these records to discover cameras and read back the
/// short code shown in pairing UIs. The record is overwritten in place
/// whenever the camera's state changes; there is no history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraPresence {
    pub camera: CameraId,
    pub display_name: String,
    /// Whether the publish pipeline is currently running
    pub live: bool,
    /// Non-terminal viewer sessions at the time of the update
    pub viewers: usize,
    pub capacity: usize,
    /// Human-friendly pairing code for this live epoch
    pub short_code: String,
    pub updated_at: DateTime<Utc>,
}

/// Writer for one camera's presence record.
///
/// The short code is minted once per process start, so a camera that
/// restarts presents a fresh code; records from a previous epoch are
/// simply overwritten.
pub struct PresenceDirectory {
    camera: CameraId,
    display_name: String,
    capacity: usize,
    short_code: String,
    transport: Arc<SignalingTransport>,
}

impl PresenceDirectory {
    pub fn new(
        camera: CameraId,
        display_name: String,
        capacity: usize,
        transport: Arc<SignalingTransport>,
    ) -> Self {
        let epoch = Uuid::new_v4().to_string();
        let short_code = epoch[epoch.len() - 6..].to_string();
        Self {
            camera,
            display_name,
            capacity,
            short_code,
            transport,
        }
    }

    pub fn short_code(&self) -> &str {
        &self.short_code
    }

    fn path(&self) -> String {
        Self::record_path(self.transport.namespace(), &self.camera)
    }

    fn record_path(namespace: &str, camera: &CameraId) -> String {
        format!("{}/directory/{}", namespace, camera)
    }

    /// Overwrite the presence record with the current state
    pub async fn publish(&self, live: bool, viewers: usize) -> Result<(), CamcastError> {
        let record = CameraPresence {
            camera: self.camera.clone(),
            display_name: self.display_name.clone(),
            live,
            viewers,
            capacity: self.capacity,
            short_code: self.short_code.clone(),
            updated_at: Utc::now(),
        };
        let raw = serde_json::to_vec(&record).map_err(|e| SignalingError::Encode {
            details: e.to_string(),
        })?;
        self.transport
            .relay()
            .put(&self.path(), Bytes::from(raw))
            .await?;
        debug!(
            camera = %self.camera,
            live,
            viewers,
            "Presence record updated"
        );
        Ok(())
    }

    /// Flip the record offline. Called on shutdown so viewers stop
    /// offering a camera that is gone.
    pub async fn mark_offline(&self) -> Result<(), CamcastError> {
        info!(camera = %self.camera, "Marking camera offline in directory");
        self.publish(false, 0).await
    }

    /// Viewer side: read a camera's presence record, if one exists
    pub async fn read(
        transport: &SignalingTransport,
        camera: &CameraId,
    ) -> Result<Option<CameraPresence>, CamcastError> {
        let path = Self::record_path(transport.namespace(), camera);
        match transport.relay().get(&path).await? {
            Some(raw) => {
                let record =
                    serde_json::from_slice(&raw).map_err(|e| SignalingError::Decode {
                        path,
                        details: e.to_string(),
                    })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalingConfig;
    use crate::signaling::MemoryRelay;

    fn directory() -> (PresenceDirectory, Arc<SignalingTransport>) {
        let config = SignalingConfig {
            namespace: "camcast".to_string(),
            send_retry_limit: 3,
            send_retry_base_ms: 1,
            reorder_buffer_limit: 8,
        };
        let transport = Arc::new(SignalingTransport::new(MemoryRelay::shared(), config));
        let directory = PresenceDirectory::new(
            CameraId::from("cam0"),
            "Front Door".to_string(),
            8,
            Arc::clone(&transport),
        );
        (directory, transport)
    }

    #[tokio::test]
    async fn test_publish_then_read_back() {
        let (directory, transport) = directory();
        directory.publish(true, 3).await.unwrap();

        let record = PresenceDirectory::read(&transport, &CameraId::from("cam0"))
            .await
            .unwrap()
            .unwrap();

        assert!(record.live);
        assert_eq!(record.viewers, 3);
        assert_eq!(record.capacity, 8);
        assert_eq!(record.display_name, "Front Door");
        assert_eq!(record.short_code, directory.short_code());
    }

    #[tokio::test]
    async fn test_updates_overwrite_in_place() {
        let (directory, transport) = directory();
        directory.publish(true, 1).await.unwrap();
        directory.publish(true, 2).await.unwrap();

        let records = transport
            .relay()
            .list_prefix("camcast/directory")
            .await
            .unwrap();
        assert_eq!(records.len(), 1);

        let record = PresenceDirectory::read(&transport, &CameraId::from("cam0"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.viewers, 2);
    }

    #[tokio::test]
    async fn test_mark_offline() {
        let (directory, transport) = directory();
        directory.publish(true, 4).await.unwrap();
        directory.mark_offline().await.unwrap();

        let record = PresenceDirectory::read(&transport, &CameraId::from("cam0"))
            .await
            .unwrap()
            .unwrap();
        assert!(!record.live);
        assert_eq!(record.viewers, 0);
    }

    #[tokio::test]
    async fn test_unknown_camera_reads_none() {
        let (_, transport) = directory();
        let record = PresenceDirectory::read(&transport, &CameraId::from("ghost"))
            .await
            .unwrap();
        assert!(record.is_none());
    }

    #[test]
    fn test_short_code_shape() {
        let (directory, _) = directory();
        assert_eq!(directory.short_code().len(), 6);
        assert!(directory
            .short_code()
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
    }
}
