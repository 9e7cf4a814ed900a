//! Storage interfaces and implementations for PeerChat.
//!
//! This module provides traits and in-memory implementations for persisting
//! contacts and loading the local private key, plus the public key cache used
//! by the peer directory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::keys::PeerPublicKey;
use crate::models::{Address, Contact};
use crate::types::{ChatError, Result};

// ============================================================================
// Contact Store
// ============================================================================

/// Trait for persisting contacts.
#[async_trait::async_trait]
pub trait ContactStore: Send + Sync {
    /// Persist a contact.
    async fn save(&self, contact: &Contact) -> Result<()>;

    /// Load every persisted contact.
    async fn load_all(&self) -> Result<Vec<Contact>>;
}

/// In-memory implementation of ContactStore.
#[derive(Default, Clone)]
pub struct InMemoryContactStore {
    contacts: Arc<RwLock<Vec<Contact>>>,
}

impl InMemoryContactStore {
    /// Creates a new in-memory contact store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ContactStore for InMemoryContactStore {
    async fn save(&self, contact: &Contact) -> Result<()> {
        let mut contacts = self.contacts.write().await;
        if contacts.iter().any(|c| c.address == contact.address) {
            return Err(ChatError::ContactExists(contact.address.to_string()));
        }
        contacts.push(contact.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Contact>> {
        let contacts = self.contacts.read().await;
        Ok(contacts.clone())
    }
}

// ============================================================================
// Public Key Cache
// ============================================================================

/// Entry in the public key cache with expiration.
struct CacheEntry {
    key: PeerPublicKey,
    expires_at: Instant,
}

/// In-memory cache for public keys with TTL expiration.
pub struct PublicKeyCache {
    cache: Arc<RwLock<HashMap<Address, CacheEntry>>>,
    ttl: Duration,
}

impl PublicKeyCache {
    /// Creates a new public key cache with the given TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Creates a cache with default TTL (24 hours).
    pub fn with_default_ttl() -> Self {
        Self::new(Duration::from_secs(86400))
    }

    /// Store a public key for an address.
    pub async fn store(&self, address: &Address, key: PeerPublicKey) {
        let mut cache = self.cache.write().await;
        cache.insert(
            address.clone(),
            CacheEntry {
                key,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Retrieve a public key for an address (returns None if expired).
    pub async fn retrieve(&self, address: &Address) -> Option<PeerPublicKey> {
        let cache = self.cache.read().await;
        cache.get(address).and_then(|entry| {
            if entry.expires_at > Instant::now() {
                Some(entry.key)
            } else {
                None
            }
        })
    }

    /// Remove all expired entries.
    pub async fn prune_expired(&self) {
        let mut cache = self.cache.write().await;
        let now = Instant::now();
        cache.retain(|_, entry| entry.expires_at > now);
    }

    /// Number of entries, expired ones included until pruned.
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }
}

impl Default for PublicKeyCache {
    fn default() -> Self {
        Self::with_default_ttl()
    }
}

// ============================================================================
// Signing Key Store
// ============================================================================

/// Trait for loading the local private key seed.
///
/// Implementations backed by secure hardware should hand the seed out only
/// for the duration of a signing or decryption call.
#[async_trait::async_trait]
pub trait SigningKeyStore: Send + Sync {
    /// Load the 32-byte seed of the local identity, if one is stored.
    async fn load_local_private_key(&self) -> Result<Option<[u8; 32]>>;
}

/// In-memory implementation of SigningKeyStore (for testing).
///
/// WARNING: This is NOT secure for production use. Keys are stored in memory
/// without encryption and are lost when the process exits.
#[derive(Default)]
pub struct InMemoryKeyStorage {
    seed: RwLock<Option<[u8; 32]>>,
}

impl InMemoryKeyStorage {
    /// Creates an empty key storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a key storage holding the given seed.
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self {
            seed: RwLock::new(Some(seed)),
        }
    }

    pub async fn store(&self, seed: [u8; 32]) {
        *self.seed.write().await = Some(seed);
    }
}

#[async_trait::async_trait]
impl SigningKeyStore for InMemoryKeyStorage {
    async fn load_local_private_key(&self) -> Result<Option<[u8; 32]>> {
        Ok(*self.seed.read().await)
    }
}
