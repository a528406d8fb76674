//! Live client connections of this process.
//!
//! At most one connection per identity. A newer connection for the same
//! identity supersedes (and closes) the older one. Entries are sharded so
//! unrelated identities never contend.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use fleetline_core::Identity;
use fleetline_events::OutboundFrame;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// No live connection for the identity in this process.
    #[error("no connection for {0}")]
    NotFound(String),

    /// The write to the live connection failed; the connection is stale.
    #[error("write to connection {connection_id} of {identity} failed: {reason}")]
    Transport {
        identity: String,
        connection_id: Uuid,
        reason: String,
    },
}

/// A live bidirectional client connection.
///
/// Writes are non-blocking hand-offs to the connection's writer.
pub trait Connection: Send + Sync + fmt::Debug {
    /// Unique per connection, distinguishes successive connections of one identity.
    fn id(&self) -> Uuid;

    fn identity(&self) -> &str;

    fn send(&self, frame: &OutboundFrame) -> Result<(), ConnectionError>;

    /// Ask the connection to close. Idempotent.
    fn close(&self);
}

/// What the socket writer is asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Connection backed by a WebSocket session task.
///
/// The session task owns the socket and drains the receiver returned by
/// [`WsConnection::open`].
#[derive(Debug)]
pub struct WsConnection {
    id: Uuid,
    identity: Identity,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl WsConnection {
    pub fn open(identity: Identity) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id: Uuid::now_v7(),
            identity,
            tx,
        });
        (conn, rx)
    }

    fn transport_error(&self, reason: impl Into<String>) -> ConnectionError {
        ConnectionError::Transport {
            identity: self.identity.to_string(),
            connection_id: self.id,
            reason: reason.into(),
        }
    }
}

impl Connection for WsConnection {
    fn id(&self) -> Uuid {
        self.id
    }

    fn identity(&self) -> &str {
        self.identity.as_str()
    }

    fn send(&self, frame: &OutboundFrame) -> Result<(), ConnectionError> {
        let text = frame
            .to_text()
            .map_err(|e| self.transport_error(format!("frame not serializable: {e}")))?;
        self.tx
            .send(Outbound::Text(text))
            .map_err(|_| self.transport_error("connection closed"))
    }

    fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// Identity → live connection map of this process.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<String, Arc<dyn Connection>>>,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `connection`, closing and returning the one it supersedes.
    pub fn add(&self, connection: Arc<dyn Connection>) -> Option<Arc<dyn Connection>> {
        let identity = connection.identity().to_string();
        let superseded = self.connections.insert(identity.clone(), connection);
        if let Some(old) = &superseded {
            info!(identity = %identity, connection_id = %old.id(), "closing superseded connection");
            old.close();
        }
        superseded
    }

    /// Remove whatever connection is registered for `identity`.
    pub fn remove(&self, identity: &str) -> Option<Arc<dyn Connection>> {
        self.connections.remove(identity).map(|(_, conn)| conn)
    }

    /// Remove the mapping only if it still points at `connection_id`.
    ///
    /// Returns `true` if that connection was the current one.
    pub fn remove_connection(&self, identity: &str, connection_id: Uuid) -> bool {
        self.connections
            .remove_if(identity, |_, conn| conn.id() == connection_id)
            .is_some()
    }

    pub fn get(&self, identity: &str) -> Option<Arc<dyn Connection>> {
        self.connections.get(identity).map(|entry| Arc::clone(entry.value()))
    }

    pub fn send(&self, identity: &str, frame: &OutboundFrame) -> Result<(), ConnectionError> {
        // Clone out so the shard lock is not held during the write.
        let conn = self
            .get(identity)
            .ok_or_else(|| ConnectionError::NotFound(identity.to_string()))?;
        conn.send(frame)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close and forget every connection.
    pub fn close_all(&self) {
        let identities: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        for identity in identities {
            if let Some((_, conn)) = self.connections.remove(&identity) {
                conn.close();
            }
        }
        debug!("all connections closed");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    /// Connection double recording every write.
    #[derive(Debug)]
    pub struct RecordingConnection {
        id: Uuid,
        identity: String,
        pub frames: Mutex<Vec<OutboundFrame>>,
        pub closed: AtomicBool,
        pub fail_writes: AtomicBool,
    }

    impl RecordingConnection {
        pub fn new(identity: &str) -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::now_v7(),
                identity: identity.to_string(),
                frames: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
            })
        }

        pub fn writes(&self) -> Vec<OutboundFrame> {
            self.frames.lock().unwrap().clone()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl Connection for RecordingConnection {
        fn id(&self) -> Uuid {
            self.id
        }

        fn identity(&self) -> &str {
            &self.identity
        }

        fn send(&self, frame: &OutboundFrame) -> Result<(), ConnectionError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(ConnectionError::Transport {
                    identity: self.identity.clone(),
                    connection_id: self.id,
                    reason: "broken pipe".into(),
                });
            }
            self.frames.lock().unwrap().push(frame.clone());
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::testing::RecordingConnection;
    use super::*;

    #[test]
    fn send_without_connection_is_not_found() {
        let registry = ConnectionRegistry::new();
        let frame = OutboundFrame::new("trip.event.no_drivers_found", json!(null));

        assert_eq!(
            registry.send("nobody", &frame),
            Err(ConnectionError::NotFound("nobody".into()))
        );
    }

    #[test]
    fn send_writes_exactly_once() {
        let registry = ConnectionRegistry::new();
        let conn = RecordingConnection::new("d1");
        registry.add(conn.clone());

        let frame = OutboundFrame::new("driver.cmd.trip_request", json!({ "trip": { "id": "t1" } }));
        registry.send("d1", &frame).unwrap();

        assert_eq!(conn.writes(), vec![frame]);
    }

    #[test]
    fn newer_connection_supersedes_and_closes_older() {
        let registry = ConnectionRegistry::new();
        let first = RecordingConnection::new("d1");
        let second = RecordingConnection::new("d1");

        assert!(registry.add(first.clone()).is_none());
        let superseded = registry.add(second.clone()).unwrap();
        assert_eq!(superseded.id(), first.id());
        assert!(first.is_closed());

        registry
            .send("d1", &OutboundFrame::new("x", json!(1)))
            .unwrap();
        assert!(first.writes().is_empty());
        assert_eq!(second.writes().len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stale_connection_cannot_remove_its_replacement() {
        let registry = ConnectionRegistry::new();
        let first = RecordingConnection::new("d1");
        let second = RecordingConnection::new("d1");
        registry.add(first.clone());
        registry.add(second.clone());

        assert!(!registry.remove_connection("d1", first.id()));
        assert_eq!(registry.get("d1").map(|c| c.id()), Some(second.id()));

        assert!(registry.remove_connection("d1", second.id()));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        registry.add(RecordingConnection::new("r1"));

        assert!(registry.remove("r1").is_some());
        assert!(registry.remove("r1").is_none());
    }

    #[test]
    fn failed_write_reports_transport_error() {
        let registry = ConnectionRegistry::new();
        let conn = RecordingConnection::new("d1");
        conn.fail_writes.store(true, std::sync::atomic::Ordering::SeqCst);
        registry.add(conn.clone());

        let err = registry
            .send("d1", &OutboundFrame::new("x", json!(1)))
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Transport { connection_id, .. } if connection_id == conn.id()
        ));
    }

    #[tokio::test]
    async fn ws_connection_hands_frames_to_writer() {
        let (conn, mut rx) = WsConnection::open(Identity::parse("r1").unwrap());
        let registry = ConnectionRegistry::new();
        registry.add(conn.clone());

        registry
            .send("r1", &OutboundFrame::new("payment.event.success", json!({ "ok": true })))
            .unwrap();
        registry.close_all();

        let Some(Outbound::Text(text)) = rx.recv().await else {
            panic!("expected a text frame");
        };
        assert!(text.contains("payment.event.success"));
        assert_eq!(rx.recv().await, Some(Outbound::Close));
        assert!(registry.is_empty());

        drop(rx);
        assert!(matches!(
            conn.send(&OutboundFrame::new("x", json!(1))),
            Err(ConnectionError::Transport { .. })
        ));
    }
}
