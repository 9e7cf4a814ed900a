//! Main PeerChat client.
//!
//! [`PeerChat`] wires the components together: one directory, one router,
//! one discovery manager and one conversation store per local identity.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::blockchain::{IdentityService, RelayTransport};
use crate::connection::{ConnectionStatus, LiveConnections};
use crate::contacts::ContactBook;
use crate::conversation::ConversationStore;
use crate::directory::PeerDirectory;
use crate::discovery::{DiscoveryConfig, DiscoveryManager, InboundFrame};
use crate::keys::{LocalIdentity, PeerPublicKey};
use crate::models::{Address, Contact, ConversationSummary, Message};
use crate::router::MessageRouter;
use crate::signature::fingerprint;
use crate::storage::{ContactStore, PublicKeyCache, SigningKeyStore};
use crate::types::{ChatError, Result};
use crate::wire::Frame;

/// Configuration for the PeerChat client.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// The local blockchain address.
    pub local_address: Address,
    /// Discovery and direct connection settings.
    pub discovery: DiscoveryConfig,
    /// Upper bound for identity service calls.
    pub lookup_timeout: Duration,
    /// Upper bound for relay submissions and fetches.
    pub relay_timeout: Duration,
    /// How long resolved public keys stay cached.
    pub key_cache_ttl: Duration,
}

impl ChatConfig {
    /// Creates a configuration with LAN discovery enabled.
    pub fn new(local_address: Address) -> Self {
        Self {
            local_address,
            discovery: DiscoveryConfig::default(),
            lookup_timeout: Duration::from_secs(10),
            relay_timeout: Duration::from_secs(30),
            key_cache_ttl: Duration::from_secs(86400),
        }
    }

    /// Creates a relay-only configuration.
    pub fn offline(local_address: Address) -> Self {
        Self {
            discovery: DiscoveryConfig::disabled(),
            ..Self::new(local_address)
        }
    }
}

/// The PeerChat client.
pub struct PeerChat {
    identity: Arc<LocalIdentity>,
    router: Arc<MessageRouter>,
    discovery: DiscoveryManager,
    contacts: ContactBook,
    conversations: Arc<ConversationStore>,
    inbound: Mutex<Option<mpsc::Receiver<InboundFrame>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl PeerChat {
    /// Creates a client for the identity held by `key_store`.
    ///
    /// Saved contacts are loaded immediately. Networking begins with
    /// [`PeerChat::start`].
    pub async fn new(
        config: ChatConfig,
        key_store: Arc<dyn SigningKeyStore>,
        identity_service: Arc<dyn IdentityService>,
        relay: Arc<dyn RelayTransport>,
        contact_store: Arc<dyn ContactStore>,
    ) -> Result<Self> {
        let seed = key_store
            .load_local_private_key()
            .await?
            .ok_or(ChatError::PrivateKeyAbsent)?;
        let identity = Arc::new(LocalIdentity::from_seed(config.local_address, &seed)?);

        let connections = LiveConnections::new();
        let directory = Arc::new(PeerDirectory::new(
            identity_service,
            connections.clone(),
            PublicKeyCache::new(config.key_cache_ttl),
            config.lookup_timeout,
        ));
        let conversations = Arc::new(ConversationStore::new());
        let router = Arc::new(MessageRouter::new(
            identity.clone(),
            directory.clone(),
            relay,
            conversations.clone(),
            config.relay_timeout,
        ));

        let contacts = ContactBook::new(contact_store, directory);
        contacts.load().await?;

        let (discovery, inbound) =
            DiscoveryManager::new(config.discovery, identity.clone(), connections);

        info!(
            address = %identity.address(),
            fingerprint = %fingerprint(identity.public_key().verifying_bytes()),
            "client ready"
        );

        Ok(Self {
            identity,
            router,
            discovery,
            contacts,
            conversations,
            inbound: Mutex::new(Some(inbound)),
            dispatcher: Mutex::new(None),
        })
    }

    /// Starts discovery and inbound dispatch.
    ///
    /// Without local networking the client still works over the relay; the
    /// connection status reports `Failed`.
    pub async fn start(&self) -> Result<()> {
        self.discovery.start().await?;

        if let Some(inbound) = self.inbound.lock().await.take() {
            let task = tokio::spawn(dispatch(
                inbound,
                self.router.clone(),
                self.discovery.clone(),
            ));
            *self.dispatcher.lock().await = Some(task);
        }
        Ok(())
    }

    /// Stops discovery, closes every connection and stops dispatch.
    pub async fn shutdown(&self) {
        self.discovery.shutdown().await;
        if let Some(task) = self.dispatcher.lock().await.take() {
            task.abort();
        }
        info!(address = %self.identity.address(), "client shut down");
    }

    pub fn address(&self) -> &Address {
        self.identity.address()
    }

    pub fn public_key(&self) -> PeerPublicKey {
        self.identity.public_key()
    }

    /// Short fingerprint of the local signing key, for out-of-band comparison.
    pub fn fingerprint(&self) -> String {
        fingerprint(self.identity.public_key().verifying_bytes())
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.discovery.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.discovery.subscribe_status()
    }

    /// The discovery manager, e.g. to dial a known endpoint.
    pub fn discovery(&self) -> &DiscoveryManager {
        &self.discovery
    }

    /// Every conversation, most recent activity first.
    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        self.conversations.summaries().await
    }

    pub fn subscribe_conversations(&self) -> watch::Receiver<Vec<ConversationSummary>> {
        self.conversations.subscribe()
    }

    /// Messages exchanged with `peer`, in arrival order.
    pub async fn messages(&self, peer: &Address) -> Vec<Message> {
        self.conversations.get(peer).await
    }

    /// Sends an encrypted, signed message to `recipient`.
    pub async fn send_message(&self, recipient: &Address, plaintext: &str) -> Result<Message> {
        self.router.send(recipient, plaintext).await
    }

    /// Fetches and processes messages waiting on the relay.
    pub async fn sync_relay(&self) -> Result<Vec<Message>> {
        self.router.sync_relay().await
    }

    pub async fn add_contact(&self, address: &str, display_name: &str) -> Result<Contact> {
        self.contacts.add_contact(address, display_name).await
    }

    pub async fn contacts(&self) -> Vec<Contact> {
        self.contacts.contacts().await
    }
}

/// Runs inbound frames through the router, one at a time, in arrival order.
///
/// Only a hello that answers the connection's own challenge binds it. A
/// connection whose hello fails verification is closed.
async fn dispatch(
    mut inbound: mpsc::Receiver<InboundFrame>,
    router: Arc<MessageRouter>,
    discovery: DiscoveryManager,
) {
    while let Some(InboundFrame { connection, frame }) = inbound.recv().await {
        let Some(challenge) = discovery.connections().challenge(connection).await else {
            debug!(connection, "discarding frame from closed connection");
            continue;
        };

        let is_hello = matches!(frame, Frame::Hello(_));
        match router.handle_frame(frame, &challenge).await {
            Ok(Some(peer)) => {
                if let Err(e) = discovery.bind_peer(connection, &peer).await {
                    warn!(connection, %peer, error = %e, "connection not bound");
                }
            }
            Ok(None) => {}
            Err(e) if is_hello => {
                warn!(connection, error = %e, "presence proof rejected, closing connection");
                if let Err(e) = discovery.cancel(connection).await {
                    debug!(connection, error = %e, "connection already gone");
                }
            }
            Err(e) => warn!(connection, error = %e, "rejected inbound frame"),
        }
    }
}
