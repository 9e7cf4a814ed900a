//! LAN discovery and direct TCP connections.
//!
//! Presence is announced as a small JSON datagram on an administratively
//! scoped IPv4 multicast group. Peers that hear a new instance open a TCP
//! connection (only the side with the smaller instance id dials). Each
//! connection carries newline-delimited [`Frame`]s. Each side opens with a
//! random `challenge`; the other side answers it with a signed `hello`, which
//! lets the challenger bind the connection to a verified address.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{
    ConnectionId, ConnectionState, ConnectionStatus, ListenerState, LiveConnections,
    OutboundFrame, PeerLink,
};
use crate::keys::LocalIdentity;
use crate::models::Address;
use crate::types::{ChatError, Result, SERVICE_ID};
use crate::wire::{Frame, PresenceProof};

const OUTBOUND_QUEUE: usize = 32;
const INBOUND_QUEUE: usize = 256;
const MAX_DATAGRAM: usize = 2048;
const MAX_CHALLENGE_LEN: usize = 128;
const RECEIVE_RETRY_BASE: Duration = Duration::from_millis(100);

/// Pause before the next multicast receive after `failures` errors in a row.
fn receive_backoff(failures: u32) -> Duration {
    RECEIVE_RETRY_BASE * 2u32.pow(failures.min(6))
}

/// Configuration for discovery and direct connections.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// When false the listener goes straight to `Failed` and every message
    /// travels over the relay.
    pub enabled: bool,
    /// Announce and browse on the multicast group. Without it only inbound
    /// connections and explicit [`DiscoveryManager::dial`] calls are used.
    pub multicast: bool,
    pub service_id: String,
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    /// Address the TCP listener binds to.
    pub bind_addr: IpAddr,
    /// Port to listen on (0 for random)
    pub listen_port: u16,
    pub announce_interval: Duration,
    /// How long an instance may stay silent before it counts as new again.
    pub peer_expiry: Duration,
    pub connect_timeout: Duration,
    /// Longest accepted frame, in bytes, excluding the newline.
    pub max_frame_len: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            multicast: true,
            service_id: SERVICE_ID.to_string(),
            multicast_group: Ipv4Addr::new(239, 71, 80, 67),
            multicast_port: 47474,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 0,
            announce_interval: Duration::from_secs(2),
            peer_expiry: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            max_frame_len: 256 * 1024,
        }
    }
}

impl DiscoveryConfig {
    /// Offline preset: no listener, relay only.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Loopback listener without multicast, for local testing.
    pub fn local_only() -> Self {
        Self {
            multicast: false,
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Self::default()
        }
    }
}

/// A decoded frame together with the connection it arrived on.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub connection: ConnectionId,
    pub frame: Frame,
}

#[derive(Debug, Serialize, Deserialize)]
struct Announcement {
    service: String,
    instance: u64,
    port: u16,
}

struct Shared {
    config: DiscoveryConfig,
    identity: Arc<LocalIdentity>,
    instance: u64,
    connections: LiveConnections,
    listener: Mutex<ListenerState>,
    local_endpoint: Mutex<Option<SocketAddr>>,
    status: watch::Sender<ConnectionStatus>,
    inbound: mpsc::Sender<InboundFrame>,
    next_id: AtomicU64,
    seen: Mutex<HashMap<u64, Instant>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Owns the listener, the discovery loops and every direct connection.
///
/// The manager is the only writer of the [`LiveConnections`] table it is
/// given. Decoded frames are handed out on the receiver returned by
/// [`DiscoveryManager::new`]; the consumer decides which address a
/// connection belongs to and reports it back with
/// [`DiscoveryManager::bind_peer`].
#[derive(Clone)]
pub struct DiscoveryManager {
    shared: Arc<Shared>,
}

impl DiscoveryManager {
    pub fn new(
        config: DiscoveryConfig,
        identity: Arc<LocalIdentity>,
        connections: LiveConnections,
    ) -> (Self, mpsc::Receiver<InboundFrame>) {
        let (inbound, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (status, _) = watch::channel(ConnectionStatus::default());
        let shared = Shared {
            config,
            identity,
            instance: rand::random(),
            connections,
            listener: Mutex::new(ListenerState::Idle),
            local_endpoint: Mutex::new(None),
            status,
            inbound,
            next_id: AtomicU64::new(1),
            seen: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            inbound_rx,
        )
    }

    /// Starts the listener and, if configured, multicast discovery.
    ///
    /// Lack of local networking is not an error: the listener ends up
    /// `Failed` and the status says so. Only calling `start` twice fails.
    pub async fn start(&self) -> Result<()> {
        self.set_listener(ListenerState::Starting).await?;
        let config = &self.shared.config;

        if !config.enabled {
            return self.fail_listener("discovery disabled").await;
        }

        let listener = match TcpListener::bind((config.bind_addr, config.listen_port)).await {
            Ok(listener) => listener,
            Err(e) => return self.fail_listener(format!("cannot bind listener: {}", e)).await,
        };
        let local = match listener.local_addr() {
            Ok(local) => local,
            Err(e) => return self.fail_listener(format!("listener has no address: {}", e)).await,
        };
        *self.shared.local_endpoint.lock().await = Some(local);

        let mut tasks = vec![tokio::spawn(self.clone().accept_loop(listener))];

        if config.multicast {
            match self.bind_multicast().await {
                Ok((browse, announce)) => {
                    tasks.push(tokio::spawn(self.clone().browse_loop(browse)));
                    tasks.push(tokio::spawn(self.clone().announce_loop(announce, local.port())));
                }
                Err(e) => {
                    tasks.iter().for_each(JoinHandle::abort);
                    return self.fail_listener(format!("cannot join multicast group: {}", e)).await;
                }
            }
        }

        self.shared.tasks.lock().await.extend(tasks);
        if let Err(e) = self.set_listener(ListenerState::Ready).await {
            // Shut down while starting.
            self.abort_tasks().await;
            return Err(e);
        }

        info!(
            endpoint = %local,
            instance = self.shared.instance,
            multicast = config.multicast,
            "listener ready"
        );
        Ok(())
    }

    /// Address the TCP listener is bound to, once started.
    pub async fn local_endpoint(&self) -> Option<SocketAddr> {
        *self.shared.local_endpoint.lock().await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Read access to the connection table.
    pub fn connections(&self) -> &LiveConnections {
        &self.shared.connections
    }

    /// Opens a direct connection to `endpoint`.
    pub async fn dial(&self, endpoint: SocketAddr) -> Result<ConnectionId> {
        if *self.shared.listener.lock().await != ListenerState::Ready {
            return Err(ChatError::TransportUnavailable(
                "listener is not ready".to_string(),
            ));
        }

        let (id, link, rx) = self.track(endpoint).await;
        self.transition(id, ConnectionState::Connecting).await?;

        let connect = TcpStream::connect(endpoint);
        let stream = match tokio::time::timeout(self.shared.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.fail(id, format!("connect failed: {}", e)).await;
                return Err(ChatError::Network(format!("cannot reach {}: {}", endpoint, e)));
            }
            Err(_) => {
                self.fail(id, "connect timed out").await;
                return Err(ChatError::Timeout(format!("connecting to {}", endpoint)));
            }
        };

        debug!(connection = id, %endpoint, "dialed peer");
        self.establish(id, stream, link, rx).await?;
        Ok(id)
    }

    /// Cancels a connection. It stops resolving immediately and frames still
    /// queued from it are discarded.
    pub async fn cancel(&self, id: ConnectionId) -> Result<()> {
        let tasks = self
            .shared
            .connections
            .transition(id, ConnectionState::Cancelled)
            .await?;
        tasks.iter().for_each(JoinHandle::abort);
        info!(connection = id, "connection cancelled");
        self.publish_status().await;
        Ok(())
    }

    /// Binds a `Ready` connection to an address proven by a hello that
    /// answered this connection's challenge.
    pub async fn bind_peer(&self, id: ConnectionId, address: &Address) -> Result<bool> {
        let changed = self.shared.connections.bind_peer(id, address).await?;
        if changed {
            info!(connection = id, peer = %address, "connection bound to peer");
            self.publish_status().await;
        }
        Ok(changed)
    }

    /// Stops discovery and cancels every connection.
    pub async fn shutdown(&self) {
        self.abort_tasks().await;

        {
            let mut listener = self.shared.listener.lock().await;
            if listener.can_transition_to(&ListenerState::Cancelled) {
                *listener = ListenerState::Cancelled;
                info!("listener cancelled");
            }
        }

        for id in self.shared.connections.ids().await {
            if let Err(e) = self.cancel(id).await {
                debug!(connection = id, error = %e, "connection already gone");
            }
        }
        self.publish_status().await;
    }

    // ------------------------------------------------------------------
    // Listener
    // ------------------------------------------------------------------

    async fn set_listener(&self, next: ListenerState) -> Result<()> {
        let mut listener = self.shared.listener.lock().await;
        *listener = listener.transition(next)?;
        debug!(state = %listener, "listener state changed");
        let live_peers = self.shared.connections.live_peers().await;
        self.shared
            .status
            .send_replace(ConnectionStatus::new(&listener, live_peers));
        Ok(())
    }

    async fn fail_listener(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        warn!(%reason, "direct connections unavailable, relay only");
        self.set_listener(ListenerState::Failed(reason)).await
    }

    async fn publish_status(&self) {
        let listener = self.shared.listener.lock().await;
        let live_peers = self.shared.connections.live_peers().await;
        self.shared
            .status
            .send_replace(ConnectionStatus::new(&listener, live_peers));
    }

    async fn abort_tasks(&self) {
        let mut tasks = self.shared.tasks.lock().await;
        tasks.drain(..).for_each(|task| task.abort());
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    debug!(%remote, "accepted connection");
                    let manager = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = manager.adopt(stream, remote).await {
                            warn!(%remote, error = %e, "inbound connection failed");
                        }
                    });
                }
                Err(e) => {
                    if let Err(err) = self.fail_listener(format!("accept failed: {}", e)).await {
                        debug!(error = %err, "listener already stopped");
                    }
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Multicast discovery
    // ------------------------------------------------------------------

    async fn bind_multicast(&self) -> std::io::Result<(UdpSocket, UdpSocket)> {
        let config = &self.shared.config;
        let browse = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.multicast_port)).await?;
        browse.join_multicast_v4(config.multicast_group, Ipv4Addr::UNSPECIFIED)?;

        let announce = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        announce.set_multicast_loop_v4(true)?;
        Ok((browse, announce))
    }

    async fn announce_loop(self, socket: UdpSocket, port: u16) {
        let config = &self.shared.config;
        let announcement = Announcement {
            service: config.service_id.clone(),
            instance: self.shared.instance,
            port,
        };
        let payload = match serde_json::to_vec(&announcement) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "cannot encode announcement");
                return;
            }
        };
        let target = SocketAddr::from((config.multicast_group, config.multicast_port));

        let mut ticker = tokio::time::interval(config.announce_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = socket.send_to(&payload, target).await {
                debug!(error = %e, "announcement not sent");
            }
        }
    }

    async fn browse_loop(self, socket: UdpSocket) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut failures = 0u32;
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    let delay = receive_backoff(failures);
                    debug!(error = %e, ?delay, "multicast receive failed");
                    failures = failures.saturating_add(1);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            failures = 0;

            let Ok(announcement) = serde_json::from_slice::<Announcement>(&buf[..len]) else {
                continue;
            };
            if announcement.service != self.shared.config.service_id
                || announcement.instance == self.shared.instance
            {
                continue;
            }
            if !self.note_instance(announcement.instance).await {
                continue;
            }

            let endpoint = SocketAddr::new(from.ip(), announcement.port);
            if self.shared.instance > announcement.instance {
                debug!(%endpoint, instance = announcement.instance, "discovered peer, waiting for it to dial");
                continue;
            }

            info!(%endpoint, instance = announcement.instance, "discovered peer");
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.dial(endpoint).await {
                    warn!(%endpoint, error = %e, "could not connect to discovered peer");
                }
            });
        }
    }

    /// Records an announcement; true when the instance is new or had expired.
    async fn note_instance(&self, instance: u64) -> bool {
        let now = Instant::now();
        let mut seen = self.shared.seen.lock().await;
        let expiry = self.shared.config.peer_expiry;
        let fresh = seen
            .insert(instance, now)
            .map_or(true, |last| now.duration_since(last) > expiry);
        seen.retain(|_, last| now.duration_since(*last) <= expiry);
        fresh
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    async fn track(&self, endpoint: SocketAddr) -> (ConnectionId, PeerLink, mpsc::Receiver<OutboundFrame>) {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (link, rx) = PeerLink::channel(id, OUTBOUND_QUEUE);
        self.shared.connections.insert(endpoint, link.clone()).await;
        debug!(connection = id, %endpoint, "connection discovered");
        self.publish_status().await;
        (id, link, rx)
    }

    async fn adopt(&self, stream: TcpStream, remote: SocketAddr) -> Result<()> {
        let (id, link, rx) = self.track(remote).await;
        self.transition(id, ConnectionState::Connecting).await?;
        self.establish(id, stream, link, rx).await
    }

    async fn establish(
        &self,
        id: ConnectionId,
        stream: TcpStream,
        link: PeerLink,
        rx: mpsc::Receiver<OutboundFrame>,
    ) -> Result<()> {
        let (reader, writer) = stream.into_split();
        let tasks = vec![
            tokio::spawn(self.clone().write_loop(id, writer, rx)),
            tokio::spawn(self.clone().read_loop(id, reader)),
        ];
        self.shared.connections.attach_tasks(id, tasks).await;
        self.transition(id, ConnectionState::Ready).await?;
        info!(connection = id, "connection ready");

        let nonce = self
            .shared
            .connections
            .challenge(id)
            .await
            .ok_or_else(|| ChatError::PeerSendFailed(format!("connection {} closed", id)))?;
        if let Err(e) = link.send(&Frame::Challenge { nonce }).await {
            self.fail(id, format!("challenge not sent: {}", e)).await;
            return Err(e);
        }
        Ok(())
    }

    /// Answers the other side's challenge with a signed hello.
    async fn answer_challenge(&self, id: ConnectionId, nonce: &str) -> Result<()> {
        if nonce.is_empty() || nonce.len() > MAX_CHALLENGE_LEN {
            return Err(ChatError::MalformedWireMessage(format!(
                "challenge of {} bytes",
                nonce.len()
            )));
        }
        let link = self
            .shared
            .connections
            .link(id)
            .await
            .ok_or_else(|| ChatError::PeerSendFailed(format!("connection {} closed", id)))?;
        let hello = Frame::Hello(PresenceProof::create(&self.shared.identity, nonce));
        link.send(&hello).await?;
        debug!(connection = id, "answered challenge");
        Ok(())
    }

    async fn transition(&self, id: ConnectionId, next: ConnectionState) -> Result<()> {
        let label = next.label();
        self.shared.connections.transition(id, next).await?;
        debug!(connection = id, state = label, "connection state changed");
        self.publish_status().await;
        Ok(())
    }

    /// Moves a connection to `Failed`. Its tasks wind down on their own.
    async fn fail(&self, id: ConnectionId, reason: impl Into<String>) {
        let reason = reason.into();
        match self
            .shared
            .connections
            .transition(id, ConnectionState::Failed(reason.clone()))
            .await
        {
            Ok(_detached) => {
                warn!(connection = id, %reason, "connection failed");
                self.publish_status().await;
            }
            Err(e) => debug!(connection = id, error = %e, "connection already gone"),
        }
    }

    async fn write_loop(
        self,
        id: ConnectionId,
        mut writer: OwnedWriteHalf,
        mut rx: mpsc::Receiver<OutboundFrame>,
    ) {
        while let Some(frame) = rx.recv().await {
            let mut bytes = frame.line.into_bytes();
            bytes.push(b'\n');
            let written = match writer.write_all(&bytes).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            };

            match written {
                Ok(()) => {
                    // The sender may have given up waiting.
                    let _ = frame.ack.send(Ok(()));
                }
                Err(e) => {
                    let reason = format!("write failed: {}", e);
                    let _ = frame.ack.send(Err(ChatError::PeerSendFailed(reason.clone())));
                    self.fail(id, reason).await;
                    return;
                }
            }
        }
    }

    async fn read_loop(self, id: ConnectionId, reader: OwnedReadHalf) {
        let limit = self.shared.config.max_frame_len;
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        let reason = loop {
            buf.clear();
            let read = (&mut reader)
                .take(limit as u64 + 1)
                .read_until(b'\n', &mut buf)
                .await;
            let n = match read {
                Ok(0) => break "peer closed the connection".to_string(),
                Ok(n) => n,
                Err(e) => break format!("read failed: {}", e),
            };
            if buf.last() != Some(&b'\n') {
                if n > limit {
                    break format!("frame exceeds {} bytes", limit);
                }
                break "connection closed mid-frame".to_string();
            }

            let Ok(line) = std::str::from_utf8(&buf) else {
                warn!(connection = id, "dropping frame that is not UTF-8");
                continue;
            };
            if line.trim().is_empty() {
                continue;
            }

            match Frame::decode(line) {
                Ok(Frame::Challenge { nonce }) => {
                    if let Err(e) = self.answer_challenge(id, &nonce).await {
                        break format!("challenge not answered: {}", e);
                    }
                }
                Ok(frame) => {
                    let inbound = InboundFrame {
                        connection: id,
                        frame,
                    };
                    if self.shared.inbound.send(inbound).await.is_err() {
                        break "dispatcher stopped".to_string();
                    }
                }
                Err(e) => warn!(connection = id, error = %e, "dropping malformed frame"),
            }
        };

        self.fail(id, reason).await;
    }
}
