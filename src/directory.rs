//! Address resolution: public keys and live connections.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::blockchain::IdentityService;
use crate::connection::{ConnectionId, LiveConnections, PeerLink};
use crate::keys::PeerPublicKey;
use crate::models::Address;
use crate::storage::PublicKeyCache;
use crate::types::{ChatError, Result};

/// What the directory knows about one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub address: Address,
    pub public_key: PeerPublicKey,
    /// Id of the live connection, if one is bound. Not a liveness guarantee.
    pub connection: Option<ConnectionId>,
}

/// Resolves addresses to keys (identity service, cached) and to live
/// direct connections (connection table, never blocking on the network).
pub struct PeerDirectory {
    identity: Arc<dyn IdentityService>,
    cache: PublicKeyCache,
    connections: LiveConnections,
    lookup_timeout: Duration,
}

impl PeerDirectory {
    pub fn new(
        identity: Arc<dyn IdentityService>,
        connections: LiveConnections,
        cache: PublicKeyCache,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            identity,
            cache,
            connections,
            lookup_timeout,
        }
    }

    /// Resolves the key for `address`, consulting the cache first.
    pub async fn resolve_public_key(&self, address: &Address) -> Result<PeerPublicKey> {
        if let Some(key) = self.cache.retrieve(address).await {
            return Ok(key);
        }

        let lookup = self.identity.lookup_public_key(address);
        let found = tokio::time::timeout(self.lookup_timeout, lookup)
            .await
            .map_err(|_| {
                warn!(%address, "public key lookup timed out");
                ChatError::Timeout(format!("public key lookup for {}", address))
            })??;

        match found {
            Some(key) => {
                self.cache.prune_expired().await;
                self.cache.store(address, key).await;
                let cached = self.cache.len().await;
                debug!(%address, cached, "resolved public key");
                Ok(key)
            }
            None => Err(ChatError::UnknownRecipient(address.to_string())),
        }
    }

    /// Returns the live `Ready` connection bound to `address`, if any.
    pub async fn resolve_connection(&self, address: &Address) -> Option<PeerLink> {
        self.connections.resolve(address).await
    }

    pub async fn peer_record(&self, address: &Address) -> Result<PeerRecord> {
        let public_key = self.resolve_public_key(address).await?;
        Ok(PeerRecord {
            address: address.clone(),
            public_key,
            connection: self.connections.connection_id(address).await,
        })
    }

    /// Asks the identity service whether `address` exists.
    pub async fn address_exists(&self, address: &Address) -> Result<bool> {
        let check = self.identity.verify_address_exists(address);
        tokio::time::timeout(self.lookup_timeout, check)
            .await
            .map_err(|_| ChatError::Timeout(format!("address check for {}", address)))?
    }

    /// Seeds the cache with an already trusted key, e.g. from a saved contact.
    pub async fn remember(&self, address: &Address, key: PeerPublicKey) {
        self.cache.store(address, key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::InMemoryIdentityService;
    use crate::keys::LocalIdentity;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    fn key(seed: u8) -> PeerPublicKey {
        LocalIdentity::from_seed(addr("TLS_K"), &[seed; 32])
            .unwrap()
            .public_key()
    }

    struct CountingIdentity {
        inner: InMemoryIdentityService,
        lookups: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl IdentityService for CountingIdentity {
        async fn lookup_public_key(&self, address: &Address) -> Result<Option<PeerPublicKey>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.lookup_public_key(address).await
        }

        async fn verify_address_exists(&self, address: &Address) -> Result<bool> {
            self.inner.verify_address_exists(address).await
        }
    }

    struct StalledIdentity;

    #[async_trait::async_trait]
    impl IdentityService for StalledIdentity {
        async fn lookup_public_key(&self, _address: &Address) -> Result<Option<PeerPublicKey>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }

        async fn verify_address_exists(&self, _address: &Address) -> Result<bool> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(true)
        }
    }

    fn directory(identity: Arc<dyn IdentityService>) -> PeerDirectory {
        PeerDirectory::new(
            identity,
            LiveConnections::new(),
            PublicKeyCache::default(),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_resolves_and_caches() {
        let registry = InMemoryIdentityService::new();
        registry.register(addr("TLS_B"), key(2)).await;
        let identity = Arc::new(CountingIdentity {
            inner: registry,
            lookups: AtomicUsize::new(0),
        });
        let directory = directory(identity.clone());

        assert_eq!(directory.resolve_public_key(&addr("TLS_B")).await.unwrap(), key(2));
        assert_eq!(directory.resolve_public_key(&addr("TLS_B")).await.unwrap(), key(2));
        assert_eq!(identity.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_recipient() {
        let directory = directory(Arc::new(InMemoryIdentityService::new()));
        let result = directory.resolve_public_key(&addr("TLS_X")).await;
        assert!(matches!(result, Err(ChatError::UnknownRecipient(_))));
    }

    #[tokio::test]
    async fn test_lookup_timeout() {
        let directory = directory(Arc::new(StalledIdentity));
        let result = directory.resolve_public_key(&addr("TLS_B")).await;
        assert!(matches!(result, Err(ChatError::Timeout(_))));

        let result = directory.address_exists(&addr("TLS_B")).await;
        assert!(matches!(result, Err(ChatError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_remembered_key_skips_lookup() {
        let directory = directory(Arc::new(StalledIdentity));
        directory.remember(&addr("TLS_B"), key(2)).await;

        let record = directory.peer_record(&addr("TLS_B")).await.unwrap();
        assert_eq!(record.public_key, key(2));
        assert_eq!(record.connection, None);
        assert!(directory.resolve_connection(&addr("TLS_B")).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_keys_pruned_on_lookup() {
        let registry = InMemoryIdentityService::new();
        registry.register(addr("TLS_B"), key(2)).await;
        registry.register(addr("TLS_C"), key(3)).await;
        let directory = PeerDirectory::new(
            Arc::new(registry),
            LiveConnections::new(),
            PublicKeyCache::new(Duration::from_millis(50)),
            Duration::from_millis(50),
        );

        directory.resolve_public_key(&addr("TLS_B")).await.unwrap();
        assert_eq!(directory.cache.len().await, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        directory.resolve_public_key(&addr("TLS_C")).await.unwrap();
        assert_eq!(directory.cache.len().await, 1);
        assert_eq!(directory.cache.retrieve(&addr("TLS_C")).await, Some(key(3)));
    }
}
