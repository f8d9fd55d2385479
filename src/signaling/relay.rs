use crate::error::SignalingError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// One record read from the relay
#[derive(Debug, Clone, PartialEq)]
pub struct RelayRecord {
    pub path: String,
    pub data: Bytes,
}

/// Live feed of records under a watched path prefix.
///
/// Existing records are replayed first, in order, then changes stream
/// as they land. The feed ends when the relay drops the watcher.
#[derive(Debug)]
pub struct RelayWatch {
    receiver: mpsc::UnboundedReceiver<RelayRecord>,
}

impl RelayWatch {
    pub async fn recv(&mut self) -> Option<RelayRecord> {
        self.receiver.recv().await
    }
}

/// Path-addressed, ordered message store shared with the remote side.
///
/// Two addressing modes: `append` grows an ordered log at a path
/// (signaling channels), `put` overwrites a single keyed document
/// (presence entries, join requests). Both feed `watch_prefix`.
/// Delivery to watchers is at-least-once; consumers dedup by content
/// keys, never by delivery count.
#[async_trait]
pub trait RelayStore: Send + Sync + 'static {
    /// Ordered append to the log at `path`
    async fn append(&self, path: &str, record: Bytes) -> Result<(), SignalingError>;

    /// Write or overwrite the document at `path`
    async fn put(&self, path: &str, record: Bytes) -> Result<(), SignalingError>;

    /// Read the document at `path`
    async fn get(&self, path: &str) -> Result<Option<Bytes>, SignalingError>;

    /// Snapshot of everything currently stored under `prefix`
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<RelayRecord>, SignalingError>;

    /// Delete everything under `prefix`, releasing its storage
    async fn remove_prefix(&self, prefix: &str) -> Result<(), SignalingError>;

    /// Watch `prefix` for existing and future records
    async fn watch_prefix(&self, prefix: &str) -> Result<RelayWatch, SignalingError>;
}

/// Prefix match on '/'-separated paths. `cam1` must not match `cam10`.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

struct Watcher {
    prefix: String,
    sender: mpsc::UnboundedSender<RelayRecord>,
}

#[derive(Default)]
struct MemoryRelayInner {
    /// Ordered append logs keyed by exact path
    logs: BTreeMap<String, Vec<Bytes>>,
    /// Single keyed documents
    docs: BTreeMap<String, Bytes>,
    watchers: Vec<Watcher>,
}

impl MemoryRelayInner {
    fn notify(&mut self, record: &RelayRecord, copies: usize) {
        self.watchers.retain(|w| {
            if !prefix_matches(&w.prefix, &record.path) {
                return true;
            }
            for _ in 0..copies {
                if w.sender.send(record.clone()).is_err() {
                    return false;
                }
            }
            true
        });
    }

    fn snapshot(&self, prefix: &str) -> Vec<RelayRecord> {
        let mut records = Vec::new();
        for (path, entries) in &self.logs {
            if prefix_matches(prefix, path) {
                for data in entries {
                    records.push(RelayRecord {
                        path: path.clone(),
                        data: data.clone(),
                    });
                }
            }
        }
        for (path, data) in &self.docs {
            if prefix_matches(prefix, path) {
                records.push(RelayRecord {
                    path: path.clone(),
                    data: data.clone(),
                });
            }
        }
        records
    }
}

/// In-process relay backend.
///
/// The deployment target swaps this for the cloud-hosted store; tests
/// and the single-process binary run against it directly. Knobs below
/// reproduce the failure modes the cloud relay exhibits: transient
/// unavailability and duplicate delivery.
pub struct MemoryRelay {
    inner: Mutex<MemoryRelayInner>,
    offline: AtomicBool,
    fail_appends: AtomicU32,
    duplicate_appends: AtomicU32,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryRelayInner::default()),
            offline: AtomicBool::new(false),
            fail_appends: AtomicU32::new(0),
            duplicate_appends: AtomicU32::new(0),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate total relay unreachability until cleared
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `n` append calls with TransportUnavailable
    pub fn fail_next_appends(&self, n: u32) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    /// Deliver the next `n` appended records to watchers twice
    pub fn duplicate_next_appends(&self, n: u32) {
        self.duplicate_appends.store(n, Ordering::SeqCst);
    }

    /// Number of records in the log at `path`
    pub fn log_len(&self, path: &str) -> usize {
        self.inner
            .lock()
            .logs
            .get(path)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    fn check_online(&self) -> Result<(), SignalingError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SignalingError::TransportUnavailable {
                details: "relay offline".to_string(),
            });
        }
        Ok(())
    }

    fn take_budget(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayStore for MemoryRelay {
    async fn append(&self, path: &str, record: Bytes) -> Result<(), SignalingError> {
        self.check_online()?;
        if Self::take_budget(&self.fail_appends) {
            return Err(SignalingError::TransportUnavailable {
                details: "injected append failure".to_string(),
            });
        }

        let copies = if Self::take_budget(&self.duplicate_appends) {
            2
        } else {
            1
        };

        let mut inner = self.inner.lock();
        inner
            .logs
            .entry(path.to_string())
            .or_default()
            .push(record.clone());
        trace!(path, copies, "Relay append");
        inner.notify(
            &RelayRecord {
                path: path.to_string(),
                data: record,
            },
            copies,
        );
        Ok(())
    }

    async fn put(&self, path: &str, record: Bytes) -> Result<(), SignalingError> {
        self.check_online()?;

        let mut inner = self.inner.lock();
        inner.docs.insert(path.to_string(), record.clone());
        trace!(path, "Relay put");
        inner.notify(
            &RelayRecord {
                path: path.to_string(),
                data: record,
            },
            1,
        );
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Bytes>, SignalingError> {
        self.check_online()?;
        Ok(self.inner.lock().docs.get(path).cloned())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<RelayRecord>, SignalingError> {
        self.check_online()?;
        Ok(self.inner.lock().snapshot(prefix))
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<(), SignalingError> {
        self.check_online()?;

        let mut inner = self.inner.lock();
        inner.logs.retain(|path, _| !prefix_matches(prefix, path));
        inner.docs.retain(|path, _| !prefix_matches(prefix, path));
        // Watchers scoped at or under the removed prefix end with it;
        // watchers on a broader prefix keep streaming
        inner.watchers.retain(|w| !prefix_matches(prefix, &w.prefix));
        debug!(prefix, "Relay prefix removed");
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<RelayWatch, SignalingError> {
        self.check_online()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        // Replay and registration under one lock so no record lands in
        // the gap between them
        let mut inner = self.inner.lock();
        for record in inner.snapshot(prefix) {
            // Receiver is still in scope, send cannot fail here
            let _ = sender.send(record);
        }
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            sender,
        });
        debug!(prefix, "Relay watch registered");
        Ok(RelayWatch { receiver })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_replay_then_live() {
        let relay = MemoryRelay::new();
        relay
            .append("ns/sessions/s1/log", Bytes::from_static(b"a"))
            .await
            .unwrap();

        let mut watch = relay.watch_prefix("ns/sessions/s1/log").await.unwrap();
        // Existing record replays first
        assert_eq!(watch.recv().await.unwrap().data, Bytes::from_static(b"a"));

        relay
            .append("ns/sessions/s1/log", Bytes::from_static(b"b"))
            .await
            .unwrap();
        assert_eq!(watch.recv().await.unwrap().data, Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn test_prefix_boundary() {
        assert!(prefix_matches("ns/cam1", "ns/cam1/presence"));
        assert!(prefix_matches("ns/cam1", "ns/cam1"));
        assert!(!prefix_matches("ns/cam1", "ns/cam10/presence"));

        let relay = MemoryRelay::new();
        relay
            .put("ns/cam10/doc", Bytes::from_static(b"x"))
            .await
            .unwrap();
        let records = relay.list_prefix("ns/cam1").await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let relay = MemoryRelay::new();
        relay
            .put("ns/directory/cam0", Bytes::from_static(b"v1"))
            .await
            .unwrap();
        relay
            .put("ns/directory/cam0", Bytes::from_static(b"v2"))
            .await
            .unwrap();

        let doc = relay.get("ns/directory/cam0").await.unwrap();
        assert_eq!(doc, Some(Bytes::from_static(b"v2")));
        assert_eq!(relay.list_prefix("ns/directory").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_append_failures() {
        let relay = MemoryRelay::new();
        relay.fail_next_appends(2);

        for _ in 0..2 {
            let err = relay.append("p", Bytes::from_static(b"x")).await;
            assert!(matches!(
                err,
                Err(SignalingError::TransportUnavailable { .. })
            ));
        }
        // Budget spent, appends work again
        relay.append("p", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(relay.log_len("p"), 1);
    }

    #[tokio::test]
    async fn test_duplicate_delivery() {
        let relay = MemoryRelay::new();
        let mut watch = relay.watch_prefix("p").await.unwrap();

        relay.duplicate_next_appends(1);
        relay.append("p", Bytes::from_static(b"x")).await.unwrap();

        // Watcher sees the record twice; the log holds it once
        assert_eq!(watch.recv().await.unwrap().data, Bytes::from_static(b"x"));
        assert_eq!(watch.recv().await.unwrap().data, Bytes::from_static(b"x"));
        assert_eq!(relay.log_len("p"), 1);
    }

    #[tokio::test]
    async fn test_remove_prefix_releases_records() {
        let relay = MemoryRelay::new();
        relay
            .append("ns/sessions/s1/log", Bytes::from_static(b"a"))
            .await
            .unwrap();
        relay
            .put("ns/sessions/s1/meta", Bytes::from_static(b"m"))
            .await
            .unwrap();

        relay.remove_prefix("ns/sessions/s1").await.unwrap();

        assert!(relay.list_prefix("ns/sessions/s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_prefix_ends_scoped_watchers() {
        let relay = MemoryRelay::new();
        let mut scoped = relay.watch_prefix("ns/sessions/s1").await.unwrap();
        let mut broad = relay.watch_prefix("ns/sessions").await.unwrap();

        relay.remove_prefix("ns/sessions/s1").await.unwrap();

        // The scoped watcher's feed ends with its prefix
        assert!(scoped.recv().await.is_none());

        // The broader watcher is untouched
        relay
            .append("ns/sessions/s2/log", Bytes::from_static(b"a"))
            .await
            .unwrap();
        assert_eq!(broad.recv().await.unwrap().data, Bytes::from_static(b"a"));
    }

    #[tokio::test]
    async fn test_offline_fails_everything() {
        let relay = MemoryRelay::new();
        relay.set_offline(true);

        assert!(relay.append("p", Bytes::from_static(b"x")).await.is_err());
        assert!(relay.get("p").await.is_err());
        assert!(relay.watch_prefix("p").await.is_err());

        relay.set_offline(false);
        assert!(relay.append("p", Bytes::from_static(b"x")).await.is_ok());
    }
}
