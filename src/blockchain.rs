//! Blockchain collaborator interfaces.
//!
//! The identity service and the relay transport are provided by the
//! embedding application. Implementations can use any chain SDK.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::keys::PeerPublicKey;
use crate::models::{Address, TransportKind};
use crate::types::{ChatError, Result};

/// Trait for resolving blockchain identities.
#[async_trait::async_trait]
pub trait IdentityService: Send + Sync {
    /// Look up the published key material for an address.
    async fn lookup_public_key(&self, address: &Address) -> Result<Option<PeerPublicKey>>;

    /// Check whether the address exists on chain.
    async fn verify_address_exists(&self, address: &Address) -> Result<bool>;
}

/// Trait for the fallback delivery channel.
#[async_trait::async_trait]
pub trait RelayTransport: Send + Sync {
    /// Submit an encoded wire document for a recipient.
    async fn relay_send(&self, recipient: &Address, blob: &str, kind: TransportKind) -> Result<()>;

    /// Fetch encoded wire documents waiting for an address.
    async fn fetch_pending(&self, address: &Address) -> Result<Vec<String>>;
}

/// In-memory identity registry (for testing and local demos).
#[derive(Default, Clone)]
pub struct InMemoryIdentityService {
    keys: Arc<RwLock<HashMap<Address, PeerPublicKey>>>,
}

impl InMemoryIdentityService {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a key for an address.
    pub async fn register(&self, address: Address, key: PeerPublicKey) {
        let mut keys = self.keys.write().await;
        keys.insert(address, key);
    }
}

#[async_trait::async_trait]
impl IdentityService for InMemoryIdentityService {
    async fn lookup_public_key(&self, address: &Address) -> Result<Option<PeerPublicKey>> {
        let keys = self.keys.read().await;
        Ok(keys.get(address).copied())
    }

    async fn verify_address_exists(&self, address: &Address) -> Result<bool> {
        let keys = self.keys.read().await;
        Ok(keys.contains_key(address))
    }
}

/// In-memory relay mailbox shared by every participant that clones it.
#[derive(Default, Clone)]
pub struct InMemoryRelay {
    mailboxes: Arc<RwLock<HashMap<Address, Vec<String>>>>,
    sent: Arc<RwLock<Vec<(Address, TransportKind)>>>,
}

impl InMemoryRelay {
    /// Creates an empty relay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `relay_send` call so far, in order.
    pub async fn sent(&self) -> Vec<(Address, TransportKind)> {
        self.sent.read().await.clone()
    }
}

#[async_trait::async_trait]
impl RelayTransport for InMemoryRelay {
    async fn relay_send(&self, recipient: &Address, blob: &str, kind: TransportKind) -> Result<()> {
        if kind != TransportKind::BlockchainRelay {
            return Err(ChatError::TransportUnavailable(format!(
                "Relay cannot carry {} messages",
                kind
            )));
        }
        self.sent.write().await.push((recipient.clone(), kind));
        let mut mailboxes = self.mailboxes.write().await;
        mailboxes
            .entry(recipient.clone())
            .or_default()
            .push(blob.to_string());
        Ok(())
    }

    async fn fetch_pending(&self, address: &Address) -> Result<Vec<String>> {
        let mut mailboxes = self.mailboxes.write().await;
        Ok(mailboxes.remove(address).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::LocalIdentity;

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_identity_registry() {
        let service = InMemoryIdentityService::new();
        let identity = LocalIdentity::from_seed(addr("TLS_A"), &[7u8; 32]).unwrap();

        assert!(!service.verify_address_exists(&addr("TLS_A")).await.unwrap());
        service.register(addr("TLS_A"), identity.public_key()).await;

        assert!(service.verify_address_exists(&addr("TLS_A")).await.unwrap());
        assert_eq!(
            service.lookup_public_key(&addr("TLS_A")).await.unwrap(),
            Some(identity.public_key())
        );
        assert_eq!(service.lookup_public_key(&addr("TLS_X")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_relay_mailbox() {
        let relay = InMemoryRelay::new();
        relay
            .relay_send(&addr("TLS_B"), "doc1", TransportKind::BlockchainRelay)
            .await
            .unwrap();

        assert_eq!(relay.fetch_pending(&addr("TLS_B")).await.unwrap(), vec!["doc1"]);
        assert!(relay.fetch_pending(&addr("TLS_B")).await.unwrap().is_empty());
        assert_eq!(relay.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn test_relay_rejects_p2p_kind() {
        let relay = InMemoryRelay::new();
        let result = relay.relay_send(&addr("TLS_B"), "doc", TransportKind::P2p).await;
        assert!(matches!(result, Err(ChatError::TransportUnavailable(_))));
    }
}
