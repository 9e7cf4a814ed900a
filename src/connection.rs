//! Connection lifecycle state machines and the live connection table.
//!
//! Listener: `Idle → Starting → Ready → Failed | Cancelled`.
//! Peer connection: `Discovered → Connecting → Ready → Failed | Cancelled`.
//!
//! `Failed` and `Cancelled` are terminal. The table removes a connection in
//! the same critical section that moves it to a terminal state, so a lookup
//! never observes a torn-down connection.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

use crate::models::Address;
use crate::types::{ChatError, Result, CHALLENGE_SIZE};
use crate::wire::Frame;

/// Identifier of one direct connection, unique per manager.
pub type ConnectionId = u64;

/// Lifecycle of the local listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Starting,
    Ready,
    Failed(String),
    Cancelled,
}

impl ListenerState {
    pub fn label(&self) -> &'static str {
        match self {
            ListenerState::Idle => "Idle",
            ListenerState::Starting => "Starting",
            ListenerState::Ready => "Ready",
            ListenerState::Failed(_) => "Failed",
            ListenerState::Cancelled => "Cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ListenerState::Failed(_) | ListenerState::Cancelled)
    }

    pub fn can_transition_to(&self, next: &ListenerState) -> bool {
        use ListenerState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Idle, Cancelled)
                | (Starting, Ready)
                | (Starting, Failed(_))
                | (Starting, Cancelled)
                | (Ready, Failed(_))
                | (Ready, Cancelled)
        )
    }

    /// Returns the next state if the move is legal.
    pub fn transition(&self, next: ListenerState) -> Result<ListenerState> {
        if self.can_transition_to(&next) {
            Ok(next)
        } else {
            Err(ChatError::InvalidTransition {
                from: self.label(),
                to: next.label(),
            })
        }
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerState::Failed(reason) => write!(f, "Failed: {}", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// Lifecycle of one peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Ready,
    Failed(String),
    Cancelled,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Discovered => "Discovered",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Ready => "Ready",
            ConnectionState::Failed(_) => "Failed",
            ConnectionState::Cancelled => "Cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed(_) | ConnectionState::Cancelled)
    }

    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Discovered, Connecting) | (Connecting, Ready) => true,
            (current, Failed(_) | Cancelled) => !current.is_terminal(),
            _ => false,
        }
    }

    /// Returns the next state if the move is legal.
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState> {
        if self.can_transition_to(&next) {
            Ok(next)
        } else {
            Err(ChatError::InvalidTransition {
                from: self.label(),
                to: next.label(),
            })
        }
    }
}

/// Snapshot published to observers on every listener or connection transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Human readable listener state, e.g. `Ready` or `Failed: ...`.
    pub state: String,
    /// Whether direct delivery is possible at all.
    pub is_ready: bool,
    /// Number of connections bound to a verified address.
    pub live_peers: usize,
}

impl ConnectionStatus {
    pub fn new(listener: &ListenerState, live_peers: usize) -> Self {
        Self {
            state: listener.to_string(),
            is_ready: *listener == ListenerState::Ready,
            live_peers,
        }
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new(&ListenerState::Idle, 0)
    }
}

/// A frame queued for a connection's writer task.
pub(crate) struct OutboundFrame {
    pub line: String,
    pub ack: oneshot::Sender<Result<()>>,
}

/// Cloneable send handle for one direct connection.
#[derive(Clone)]
pub struct PeerLink {
    id: ConnectionId,
    tx: mpsc::Sender<OutboundFrame>,
}

impl PeerLink {
    pub(crate) fn channel(id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a frame and waits for the writer to report the outcome.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        let line = frame.encode()?;
        let (ack, done) = oneshot::channel();
        self.tx
            .send(OutboundFrame { line, ack })
            .await
            .map_err(|_| ChatError::PeerSendFailed(format!("connection {} closed", self.id)))?;
        done.await
            .map_err(|_| ChatError::PeerSendFailed(format!("connection {} dropped the frame", self.id)))?
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink").field("id", &self.id).finish()
    }
}

/// Public view of a tracked connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub endpoint: SocketAddr,
    pub peer: Option<Address>,
    pub state: ConnectionState,
}

pub(crate) struct Connection {
    endpoint: SocketAddr,
    /// Nonce the other side must sign to bind this connection.
    challenge: String,
    peer: Option<Address>,
    state: ConnectionState,
    link: PeerLink,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct ConnectionTable {
    connections: HashMap<ConnectionId, Connection>,
    by_peer: HashMap<Address, ConnectionId>,
}

/// The table of tracked connections.
///
/// Reads are open to everyone; every mutation is `pub(crate)` and only the
/// discovery manager performs them.
#[derive(Clone, Default)]
pub struct LiveConnections {
    inner: Arc<RwLock<ConnectionTable>>,
}

impl LiveConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the link bound to `address` if that connection is `Ready`.
    pub async fn resolve(&self, address: &Address) -> Option<PeerLink> {
        let table = self.inner.read().await;
        let id = table.by_peer.get(address)?;
        let connection = table.connections.get(id)?;
        (connection.state == ConnectionState::Ready).then(|| connection.link.clone())
    }

    /// Id of the live connection bound to `address`.
    pub async fn connection_id(&self, address: &Address) -> Option<ConnectionId> {
        self.resolve(address).await.map(|link| link.id())
    }

    /// Number of `Ready` connections bound to an address.
    pub async fn live_peers(&self) -> usize {
        let table = self.inner.read().await;
        table
            .by_peer
            .values()
            .filter(|id| {
                table
                    .connections
                    .get(id)
                    .is_some_and(|c| c.state == ConnectionState::Ready)
            })
            .count()
    }

    pub async fn snapshot(&self) -> Vec<ConnectionInfo> {
        let table = self.inner.read().await;
        let mut infos: Vec<_> = table
            .connections
            .iter()
            .map(|(id, c)| ConnectionInfo {
                id: *id,
                endpoint: c.endpoint,
                peer: c.peer.clone(),
                state: c.state.clone(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Starts tracking a freshly discovered endpoint under a new challenge.
    pub(crate) async fn insert(&self, endpoint: SocketAddr, link: PeerLink) {
        let challenge = hex::encode(rand::random::<[u8; CHALLENGE_SIZE]>());
        let mut table = self.inner.write().await;
        table.connections.insert(
            link.id(),
            Connection {
                endpoint,
                challenge,
                peer: None,
                state: ConnectionState::Discovered,
                link,
                tasks: Vec::new(),
            },
        );
    }

    pub(crate) async fn attach_tasks(&self, id: ConnectionId, tasks: Vec<JoinHandle<()>>) {
        let mut table = self.inner.write().await;
        match table.connections.get_mut(&id) {
            Some(connection) => connection.tasks.extend(tasks),
            None => tasks.iter().for_each(JoinHandle::abort),
        }
    }

    /// Moves a connection to `next`.
    ///
    /// Terminal states remove the entry and its address binding under the
    /// same write lock. The removed tasks are returned so the caller decides
    /// whether to abort them.
    pub(crate) async fn transition(
        &self,
        id: ConnectionId,
        next: ConnectionState,
    ) -> Result<Vec<JoinHandle<()>>> {
        let mut table = self.inner.write().await;
        let connection = table
            .connections
            .get_mut(&id)
            .ok_or_else(|| ChatError::PeerSendFailed(format!("unknown connection {}", id)))?;
        connection.state = connection.state.transition(next)?;

        if !connection.state.is_terminal() {
            return Ok(Vec::new());
        }

        let removed = table.connections.remove(&id);
        let mut tasks = Vec::new();
        if let Some(connection) = removed {
            if let Some(peer) = connection.peer {
                if table.by_peer.get(&peer) == Some(&id) {
                    table.by_peer.remove(&peer);
                }
            }
            tasks = connection.tasks;
        }
        Ok(tasks)
    }

    /// Challenge issued for a tracked connection. `None` once it is gone.
    pub(crate) async fn challenge(&self, id: ConnectionId) -> Option<String> {
        let table = self.inner.read().await;
        table.connections.get(&id).map(|c| c.challenge.clone())
    }

    /// Send handle of a tracked connection in any live state.
    pub(crate) async fn link(&self, id: ConnectionId) -> Option<PeerLink> {
        let table = self.inner.read().await;
        table.connections.get(&id).map(|c| c.link.clone())
    }

    /// Binds a `Ready` connection to an address proven on that connection.
    ///
    /// A connection is bound at most once. The address moves to the most
    /// recently bound connection. Returns `true` when the binding changed.
    pub(crate) async fn bind_peer(&self, id: ConnectionId, address: &Address) -> Result<bool> {
        let mut table = self.inner.write().await;
        let connection = table
            .connections
            .get_mut(&id)
            .ok_or_else(|| ChatError::PeerSendFailed(format!("unknown connection {}", id)))?;
        if connection.state != ConnectionState::Ready {
            return Err(ChatError::InvalidTransition {
                from: connection.state.label(),
                to: "Bound",
            });
        }
        if let Some(bound) = &connection.peer {
            if bound == address {
                return Ok(false);
            }
            return Err(ChatError::ConnectionAlreadyBound {
                bound: bound.to_string(),
                claimed: address.to_string(),
            });
        }
        connection.peer = Some(address.clone());

        table.by_peer.insert(address.clone(), id);
        Ok(true)
    }

    pub(crate) async fn ids(&self) -> Vec<ConnectionId> {
        let table = self.inner.read().await;
        table.connections.keys().copied().collect()
    }
}
