use crate::error::{Error, Result};
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};

pub type SessionId = u64;

/// Outbound side of one live session: encoded frames queued for its writer.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub peer: SocketAddr,
    tx: mpsc::Sender<Bytes>,
}

impl SessionHandle {
    pub fn new(peer: SocketAddr, tx: mpsc::Sender<Bytes>) -> Self {
        Self { peer, tx }
    }

    /// Queue an already framed message.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.tx.send(frame).await.map_err(|_| {
            Error::Connection(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("session writer for {} has closed", self.peer),
            ))
        })
    }

    /// Queue a frame only if there is room right now.
    pub fn offer(&self, frame: Bytes) -> Result<()> {
        self.tx.try_send(frame).map_err(|err| {
            let (kind, reason) = match err {
                TrySendError::Full(_) => (std::io::ErrorKind::WouldBlock, "is not keeping up"),
                TrySendError::Closed(_) => (std::io::ErrorKind::BrokenPipe, "has closed"),
            };
            Error::Connection(std::io::Error::new(
                kind,
                format!("session writer for {} {}", self.peer, reason),
            ))
        })
    }
}

/// Set of live sessions. Sessions enter and leave only through `register`
/// and `deregister`; the map itself is never handed out.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: DashMap<SessionId, SessionHandle>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn register(&self, handle: SessionHandle) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::info!(session = id, peer = %handle.peer, "session registered");
        self.sessions.insert(id, handle);
        id
    }

    pub fn deregister(&self, id: SessionId) -> bool {
        let removed = self.sessions.remove(&id).is_some();
        if removed {
            tracing::info!(session = id, "session deregistered");
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Offer `frame` to every session registered when the call starts.
    ///
    /// Deliveries are independent and never wait: a session that is gone, or
    /// whose queue is full because its peer stopped reading, misses this frame
    /// and nobody else notices. Returns how many sessions accepted it.
    pub fn broadcast(&self, frame: Bytes) -> usize {
        let targets: Vec<(SessionId, SessionHandle)> = self
            .sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let delivered = targets
            .iter()
            .filter(|(id, handle)| match handle.offer(frame.clone()) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(session = id, peer = %handle.peer, %err, "broadcast delivery failed");
                    false
                }
            })
            .count();

        tracing::debug!(delivered, total = targets.len(), "broadcast");
        delivered
    }
}
