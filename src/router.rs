//! Outbound delivery and inbound verification.
//!
//! Outbound: resolve key, encrypt, sign, then deliver over a live direct
//! connection if one exists or through the relay otherwise. Inbound: check
//! addressing, verify the signature, decrypt, append. Nothing reaches the
//! conversation store until it has passed every step.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::blockchain::RelayTransport;
use crate::conversation::ConversationStore;
use crate::crypto::{decrypt, encrypt};
use crate::directory::PeerDirectory;
use crate::keys::LocalIdentity;
use crate::models::{unix_secs, Address, Message, TransportKind};
use crate::signature::{sign_message, verify_message};
use crate::types::{ChatError, Result};
use crate::wire::{Frame, PresenceProof, WireMessage};

/// Largest accepted clock difference for presence proofs, in seconds.
const HELLO_MAX_AGE_SECS: u64 = 300;

pub struct MessageRouter {
    identity: Arc<LocalIdentity>,
    directory: Arc<PeerDirectory>,
    relay: Arc<dyn RelayTransport>,
    conversations: Arc<ConversationStore>,
    relay_timeout: Duration,
}

impl MessageRouter {
    pub fn new(
        identity: Arc<LocalIdentity>,
        directory: Arc<PeerDirectory>,
        relay: Arc<dyn RelayTransport>,
        conversations: Arc<ConversationStore>,
        relay_timeout: Duration,
    ) -> Self {
        Self {
            identity,
            directory,
            relay,
            conversations,
            relay_timeout,
        }
    }

    /// Encrypts, signs and delivers `plaintext` to `recipient`.
    ///
    /// With a live connection the message goes direct and a failure there is
    /// final. Without one the relay is called exactly once. The message is
    /// appended to the conversation only after delivery succeeded.
    pub async fn send(&self, recipient: &Address, plaintext: &str) -> Result<Message> {
        let public_key = self.directory.resolve_public_key(recipient).await?;
        let ciphertext = encrypt(plaintext, &public_key.encryption_key())?;

        let link = self.directory.resolve_connection(recipient).await;
        let transport = match link {
            Some(_) => TransportKind::P2p,
            None => TransportKind::BlockchainRelay,
        };

        let mut message = Message::outgoing(
            self.identity.address().clone(),
            recipient.clone(),
            ciphertext,
            plaintext,
            transport,
        );
        sign_message(&mut message, self.identity.signing_key())?;
        let wire = WireMessage::from_message(&message)?;

        match link {
            Some(link) => {
                link.send(&Frame::Message(wire)).await.map_err(|e| {
                    warn!(%recipient, connection = link.id(), error = %e, "direct send failed");
                    match e {
                        ChatError::PeerSendFailed(_) => e,
                        other => ChatError::PeerSendFailed(other.to_string()),
                    }
                })?;
            }
            None => self.relay_send(recipient, &wire).await?,
        }

        info!(%recipient, id = %message.id, %transport, "message sent");
        self.conversations.append(recipient, message.clone()).await;
        Ok(message)
    }

    async fn relay_send(&self, recipient: &Address, wire: &WireMessage) -> Result<()> {
        let document = wire.encode()?;
        let submit = self
            .relay
            .relay_send(recipient, &document, TransportKind::BlockchainRelay);

        match tokio::time::timeout(self.relay_timeout, submit).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(%recipient, error = %e, "relay rejected message");
                Err(match e {
                    ChatError::TransportUnavailable(_) => e,
                    other => ChatError::TransportUnavailable(other.to_string()),
                })
            }
            Err(_) => {
                warn!(%recipient, "relay timed out");
                Err(ChatError::TransportUnavailable(format!(
                    "relay did not confirm within {:?}",
                    self.relay_timeout
                )))
            }
        }
    }

    /// Verifies, decrypts and stores one inbound message.
    ///
    /// `transport` is the channel it actually arrived on. Returns `None` for
    /// a message that is already in the conversation.
    pub async fn handle_inbound(
        &self,
        wire: WireMessage,
        transport: TransportKind,
    ) -> Result<Option<Message>> {
        let local = self.identity.address();
        if &wire.recipient != local {
            return Err(ChatError::MisdirectedMessage {
                recipient: wire.recipient.to_string(),
                local: local.to_string(),
            });
        }

        let mut message = wire.to_message()?;
        if !message.is_signed() {
            return Err(ChatError::SignatureInvalid(format!(
                "message {} is unsigned",
                message.id
            )));
        }

        let sender_key = self.directory.resolve_public_key(&message.sender).await?;
        if !verify_message(&message, &sender_key.verifying_key()?) {
            return Err(ChatError::SignatureInvalid(format!(
                "message {} from {}",
                message.id, message.sender
            )));
        }

        message.content = decrypt(&message.ciphertext, self.identity.encryption_private_key())?;
        message.transport = transport;

        let sender = message.sender.clone();
        if !self.conversations.append_if_absent(&sender, message.clone()).await {
            debug!(peer = %sender, id = %message.id, "duplicate message ignored");
            return Ok(None);
        }

        info!(peer = %sender, id = %message.id, %transport, "message received");
        Ok(Some(message))
    }

    /// Handles one frame from a direct connection.
    ///
    /// `challenge` is the nonce this side issued for that connection. Returns
    /// the address a hello proves the connection belongs to. Chat messages
    /// are delivered but never bind a connection.
    pub async fn handle_frame(&self, frame: Frame, challenge: &str) -> Result<Option<Address>> {
        match frame {
            Frame::Hello(proof) => {
                self.verify_presence(&proof, challenge).await?;
                Ok(Some(proof.address))
            }
            Frame::Message(wire) => {
                self.handle_inbound(wire, TransportKind::P2p).await?;
                Ok(None)
            }
            Frame::Challenge { .. } => Ok(None),
        }
    }

    async fn verify_presence(&self, proof: &PresenceProof, challenge: &str) -> Result<()> {
        if proof.challenge != challenge {
            return Err(ChatError::SignatureInvalid(format!(
                "presence proof from {} answers another connection",
                proof.address
            )));
        }

        let now = unix_secs(SystemTime::now());
        if now.abs_diff(proof.timestamp) > HELLO_MAX_AGE_SECS {
            return Err(ChatError::SignatureInvalid(format!(
                "stale presence proof from {}",
                proof.address
            )));
        }

        let key = self.directory.resolve_public_key(&proof.address).await?;
        if !proof.verify(&key.verifying_key()?)? {
            return Err(ChatError::SignatureInvalid(format!(
                "presence proof from {}",
                proof.address
            )));
        }
        Ok(())
    }

    /// Pulls pending relay documents and runs each through the inbound path.
    ///
    /// A bad document is logged and skipped. Returns the new messages.
    pub async fn sync_relay(&self) -> Result<Vec<Message>> {
        let local = self.identity.address();
        let fetch = self.relay.fetch_pending(local);
        let documents = tokio::time::timeout(self.relay_timeout, fetch)
            .await
            .map_err(|_| ChatError::TransportUnavailable("relay fetch timed out".to_string()))??;

        let mut received = Vec::new();
        for document in documents {
            let outcome = match WireMessage::decode(&document) {
                Ok(wire) => self.handle_inbound(wire, TransportKind::BlockchainRelay).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(Some(message)) => received.push(message),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "rejected relay document"),
            }
        }
        debug!(count = received.len(), "relay sync finished");
        Ok(received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{InMemoryIdentityService, InMemoryRelay};
    use crate::connection::{ConnectionState, LiveConnections, PeerLink};
    use crate::signature::{hello_payload, sign};
    use crate::storage::PublicKeyCache;
    use crate::types::SIGNATURE_SIZE;
    use async_trait::async_trait;

    const ALICE_SEED: [u8; 32] = [1u8; 32];
    const BOB_SEED: [u8; 32] = [2u8; 32];
    const EVE_SEED: [u8; 32] = [3u8; 32];

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    fn identity(name: &str, seed: [u8; 32]) -> Arc<LocalIdentity> {
        Arc::new(LocalIdentity::from_seed(addr(name), &seed).unwrap())
    }

    struct Node {
        router: MessageRouter,
        conversations: Arc<ConversationStore>,
        connections: LiveConnections,
    }

    fn node(
        identity: Arc<LocalIdentity>,
        registry: &InMemoryIdentityService,
        relay: Arc<dyn RelayTransport>,
    ) -> Node {
        let connections = LiveConnections::new();
        let directory = Arc::new(PeerDirectory::new(
            Arc::new(registry.clone()),
            connections.clone(),
            PublicKeyCache::default(),
            Duration::from_secs(1),
        ));
        let conversations = Arc::new(ConversationStore::new());
        Node {
            router: MessageRouter::new(
                identity,
                directory,
                relay,
                conversations.clone(),
                Duration::from_millis(200),
            ),
            conversations,
            connections,
        }
    }

    async fn registry() -> InMemoryIdentityService {
        let registry = InMemoryIdentityService::new();
        for (name, seed) in [("TLS_A", ALICE_SEED), ("TLS_B", BOB_SEED), ("TLS_E", EVE_SEED)] {
            registry.register(addr(name), identity(name, seed).public_key()).await;
        }
        registry
    }

    struct FailingRelay;

    #[async_trait]
    impl RelayTransport for FailingRelay {
        async fn relay_send(&self, _: &Address, _: &str, _: TransportKind) -> Result<()> {
            Err(ChatError::Network("ledger unreachable".to_string()))
        }

        async fn fetch_pending(&self, _: &Address) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    struct SlowRelay;

    #[async_trait]
    impl RelayTransport for SlowRelay {
        async fn relay_send(&self, _: &Address, _: &str, _: TransportKind) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        async fn fetch_pending(&self, _: &Address) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_relay_roundtrip() {
        let registry = registry().await;
        let relay = InMemoryRelay::new();
        let alice = node(identity("TLS_A", ALICE_SEED), &registry, Arc::new(relay.clone()));
        let bob = node(identity("TLS_B", BOB_SEED), &registry, Arc::new(relay.clone()));

        let sent = alice.router.send(&addr("TLS_B"), "hi bob").await.unwrap();
        assert_eq!(sent.transport, TransportKind::BlockchainRelay);
        assert_eq!(relay.sent().await, vec![(addr("TLS_B"), TransportKind::BlockchainRelay)]);
        assert_eq!(alice.conversations.get(&addr("TLS_B")).await, vec![sent.clone()]);

        let received = bob.router.sync_relay().await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, sent.id);
        assert_eq!(received[0].content, "hi bob");
        assert_eq!(received[0].transport, TransportKind::BlockchainRelay);
        assert_eq!(bob.conversations.get(&addr("TLS_A")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_recipient_sends_nothing() {
        let registry = registry().await;
        let relay = InMemoryRelay::new();
        let alice = node(identity("TLS_A", ALICE_SEED), &registry, Arc::new(relay.clone()));

        let result = alice.router.send(&addr("TLS_X"), "hello?").await;
        assert!(matches!(result, Err(ChatError::UnknownRecipient(_))));
        assert!(relay.sent().await.is_empty());
        assert!(alice.conversations.summaries().await.is_empty());
    }

    #[tokio::test]
    async fn test_relay_failure_not_appended() {
        let registry = registry().await;
        let alice = node(identity("TLS_A", ALICE_SEED), &registry, Arc::new(FailingRelay));

        let result = alice.router.send(&addr("TLS_B"), "hi").await;
        assert!(matches!(result, Err(ChatError::TransportUnavailable(_))));
        assert!(alice.conversations.get(&addr("TLS_B")).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_direct_send_is_final() {
        let registry = registry().await;
        let relay = InMemoryRelay::new();
        let alice = node(identity("TLS_A", ALICE_SEED), &registry, Arc::new(relay.clone()));

        // A ready connection to Bob whose writer has gone away.
        let (link, writer) = PeerLink::channel(1, 4);
        alice.connections.insert("127.0.0.1:4000".parse().unwrap(), link).await;
        alice.connections.transition(1, ConnectionState::Connecting).await.unwrap();
        alice.connections.transition(1, ConnectionState::Ready).await.unwrap();
        alice.connections.bind_peer(1, &addr("TLS_B")).await.unwrap();
        drop(writer);

        let result = alice.router.send(&addr("TLS_B"), "direct only").await;
        assert!(matches!(result, Err(ChatError::PeerSendFailed(_))));
        assert!(relay.sent().await.is_empty());
        assert!(alice.conversations.get(&addr("TLS_B")).await.is_empty());
    }

    #[tokio::test]
    async fn test_relay_timeout() {
        let registry = registry().await;
        let alice = node(identity("TLS_A", ALICE_SEED), &registry, Arc::new(SlowRelay));

        let result = alice.router.send(&addr("TLS_B"), "hi").await;
        assert!(matches!(result, Err(ChatError::TransportUnavailable(_))));
        assert!(alice.conversations.get(&addr("TLS_B")).await.is_empty());
    }

    #[tokio::test]
    async fn test_forged_signature_rejected() {
        let registry = registry().await;
        let relay = InMemoryRelay::new();
        let alice = node(identity("TLS_A", ALICE_SEED), &registry, Arc::new(relay.clone()));
        let bob = node(identity("TLS_B", BOB_SEED), &registry, Arc::new(relay.clone()));
        alice.router.send(&addr("TLS_B"), "original").await.unwrap();

        // Eve swaps in her own ciphertext but keeps Alice's signature.
        let mut wire = WireMessage::decode(&relay.fetch_pending(&addr("TLS_B")).await.unwrap()[0]).unwrap();
        let bob_key = identity("TLS_B", BOB_SEED).public_key();
        wire.ciphertext = encrypt("forged", &bob_key.encryption_key()).unwrap();

        let result = bob.router.handle_inbound(wire, TransportKind::BlockchainRelay).await;
        assert!(matches!(result, Err(ChatError::SignatureInvalid(_))));
        assert!(bob.conversations.summaries().await.is_empty());
    }

    #[tokio::test]
    async fn test_impersonation_rejected() {
        let registry = registry().await;
        let relay = InMemoryRelay::new();
        let eve = identity("TLS_E", EVE_SEED);
        let bob = node(identity("TLS_B", BOB_SEED), &registry, Arc::new(relay));

        // Signed by Eve, claims to come from Alice.
        let bob_key = identity("TLS_B", BOB_SEED).public_key();
        let ciphertext = encrypt("trust me", &bob_key.encryption_key()).unwrap();
        let mut message = Message::outgoing(addr("TLS_A"), addr("TLS_B"), ciphertext, "", TransportKind::P2p);
        sign_message(&mut message, eve.signing_key()).unwrap();
        let wire = WireMessage::from_message(&message).unwrap();

        let result = bob.router.handle_frame(Frame::Message(wire), "c1").await;
        assert!(matches!(result, Err(ChatError::SignatureInvalid(_))));
        assert!(bob.conversations.summaries().await.is_empty());
    }

    #[tokio::test]
    async fn test_misdirected_and_unsigned() {
        let registry = registry().await;
        let relay = InMemoryRelay::new();
        let alice = node(identity("TLS_A", ALICE_SEED), &registry, Arc::new(relay.clone()));
        let bob = node(identity("TLS_B", BOB_SEED), &registry, Arc::new(relay.clone()));
        let eve = node(identity("TLS_E", EVE_SEED), &registry, Arc::new(relay.clone()));

        alice.router.send(&addr("TLS_B"), "for bob").await.unwrap();
        let mut wire = WireMessage::decode(&relay.fetch_pending(&addr("TLS_B")).await.unwrap()[0]).unwrap();

        let result = eve.router.handle_inbound(wire.clone(), TransportKind::BlockchainRelay).await;
        assert!(matches!(result, Err(ChatError::MisdirectedMessage { .. })));

        wire.signature = None;
        let result = bob.router.handle_inbound(wire, TransportKind::BlockchainRelay).await;
        assert!(matches!(result, Err(ChatError::SignatureInvalid(_))));
        assert!(bob.conversations.summaries().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_ignored() {
        let registry = registry().await;
        let relay = InMemoryRelay::new();
        let alice = node(identity("TLS_A", ALICE_SEED), &registry, Arc::new(relay.clone()));
        let bob = node(identity("TLS_B", BOB_SEED), &registry, Arc::new(relay.clone()));

        alice.router.send(&addr("TLS_B"), "once").await.unwrap();
        let wire = WireMessage::decode(&relay.fetch_pending(&addr("TLS_B")).await.unwrap()[0]).unwrap();

        assert!(bob.router.handle_inbound(wire.clone(), TransportKind::BlockchainRelay).await.unwrap().is_some());
        assert!(bob.router.handle_inbound(wire, TransportKind::BlockchainRelay).await.unwrap().is_none());
        assert_eq!(bob.conversations.get(&addr("TLS_A")).await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_duplicates_stored_once() {
        let registry = registry().await;
        let relay = InMemoryRelay::new();
        let alice = node(identity("TLS_A", ALICE_SEED), &registry, Arc::new(relay.clone()));
        let bob = Arc::new(node(identity("TLS_B", BOB_SEED), &registry, Arc::new(relay.clone())));

        alice.router.send(&addr("TLS_B"), "once").await.unwrap();
        let wire = WireMessage::decode(&relay.fetch_pending(&addr("TLS_B")).await.unwrap()[0]).unwrap();

        // The same message arriving directly and through the relay at once.
        let handlers: Vec<_> = [TransportKind::P2p, TransportKind::BlockchainRelay]
            .into_iter()
            .map(|transport| {
                let bob = bob.clone();
                let wire = wire.clone();
                tokio::spawn(async move { bob.router.handle_inbound(wire, transport).await })
            })
            .collect();

        let mut stored = 0;
        for handler in handlers {
            if handler.await.unwrap().unwrap().is_some() {
                stored += 1;
            }
        }
        assert_eq!(stored, 1);
        assert_eq!(bob.conversations.get(&addr("TLS_A")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_timestamp_rejected() {
        let registry = registry().await;
        let relay = InMemoryRelay::new();
        let alice = node(identity("TLS_A", ALICE_SEED), &registry, Arc::new(relay.clone()));
        let bob = node(identity("TLS_B", BOB_SEED), &registry, Arc::new(relay.clone()));

        let wire = WireMessage {
            id: "far-future".to_string(),
            sender: addr("TLS_X"),
            recipient: addr("TLS_B"),
            ciphertext: "AAAA".to_string(),
            timestamp: u64::MAX,
            transport: TransportKind::P2p,
            signature: Some(hex::encode([0u8; SIGNATURE_SIZE])),
        };
        let result = bob.router.handle_frame(Frame::Message(wire.clone()), "c1").await;
        assert!(matches!(result, Err(ChatError::MalformedWireMessage(_))));

        // Relay sync skips it and keeps going.
        relay
            .relay_send(&addr("TLS_B"), &wire.encode().unwrap(), TransportKind::BlockchainRelay)
            .await
            .unwrap();
        alice.router.send(&addr("TLS_B"), "still here").await.unwrap();
        let received = bob.router.sync_relay().await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].content, "still here");
    }

    #[tokio::test]
    async fn test_sync_skips_bad_documents() {
        let registry = registry().await;
        let relay = InMemoryRelay::new();
        let alice = node(identity("TLS_A", ALICE_SEED), &registry, Arc::new(relay.clone()));
        let bob = node(identity("TLS_B", BOB_SEED), &registry, Arc::new(relay.clone()));

        relay
            .relay_send(&addr("TLS_B"), "not json", TransportKind::BlockchainRelay)
            .await
            .unwrap();
        alice.router.send(&addr("TLS_B"), "good").await.unwrap();

        let received = bob.router.sync_relay().await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].content, "good");
    }

    #[tokio::test]
    async fn test_presence_proofs() {
        let registry = registry().await;
        let bob = node(identity("TLS_B", BOB_SEED), &registry, Arc::new(InMemoryRelay::new()));
        let alice = identity("TLS_A", ALICE_SEED);

        let proof = PresenceProof::create(&alice, "c1");
        let bound = bob.router.handle_frame(Frame::Hello(proof.clone()), "c1").await.unwrap();
        assert_eq!(bound, Some(addr("TLS_A")));

        // The same proof replayed on a connection with another challenge.
        assert!(matches!(
            bob.router.handle_frame(Frame::Hello(proof.clone()), "c2").await,
            Err(ChatError::SignatureInvalid(_))
        ));

        // Eve claims to be Alice.
        let eve = identity("TLS_E", EVE_SEED);
        let mut forged = PresenceProof::create(&eve, "c1");
        forged.address = addr("TLS_A");
        assert!(bob.router.handle_frame(Frame::Hello(forged), "c1").await.is_err());

        // A correctly signed but stale proof.
        let timestamp = proof.timestamp - 2 * HELLO_MAX_AGE_SECS;
        let payload = hello_payload(alice.address(), "c1", timestamp);
        let stale = PresenceProof {
            address: addr("TLS_A"),
            challenge: "c1".to_string(),
            timestamp,
            signature: hex::encode(sign(&payload, alice.signing_key())),
        };
        assert!(matches!(
            bob.router.handle_frame(Frame::Hello(stale), "c1").await,
            Err(ChatError::SignatureInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_message_frames_never_bind() {
        let registry = registry().await;
        let relay = InMemoryRelay::new();
        let alice = node(identity("TLS_A", ALICE_SEED), &registry, Arc::new(relay.clone()));
        let bob = node(identity("TLS_B", BOB_SEED), &registry, Arc::new(relay.clone()));

        alice.router.send(&addr("TLS_B"), "direct").await.unwrap();
        let wire = WireMessage::decode(&relay.fetch_pending(&addr("TLS_B")).await.unwrap()[0]).unwrap();

        let outcome = bob.router.handle_frame(Frame::Message(wire), "c1").await.unwrap();
        assert_eq!(outcome, None);
        let received = bob.conversations.get(&addr("TLS_A")).await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].transport, TransportKind::P2p);
    }
}
