//! Key derivation and management for PeerChat.

use std::fmt;

use ed25519_dalek::{SigningKey, VerifyingKey};
use hkdf::Hkdf;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::models::Address;
use crate::types::{ChatError, Result, IDENTITY_KEY_INFO, IDENTITY_KEY_SALT, PUBLIC_KEY_SIZE};

/// Derive X25519 key pair from a 32-byte seed using HKDF-SHA256.
///
/// # Arguments
/// * `seed` - 32-byte seed loaded from the signing key store
///
/// # Returns
/// Tuple of (private_key, public_key)
pub fn derive_keys_from_seed(seed: &[u8]) -> Result<(StaticSecret, PublicKey)> {
    if seed.len() != 32 {
        return Err(ChatError::InvalidSeedLength(seed.len()));
    }

    let hkdf = Hkdf::<Sha256>::new(Some(IDENTITY_KEY_SALT), seed);
    let mut derived_key = [0u8; 32];
    hkdf.expand(IDENTITY_KEY_INFO, &mut derived_key)
        .map_err(|e| ChatError::CryptoFailure(format!("HKDF expand failed: {}", e)))?;

    let private_key = StaticSecret::from(derived_key);
    let public_key = PublicKey::from(&private_key);

    Ok((private_key, public_key))
}

/// Generate a random ephemeral X25519 key pair for one message.
pub fn generate_ephemeral_keypair() -> (StaticSecret, PublicKey) {
    let private_key = StaticSecret::random_from_rng(rand::thread_rng());
    let public_key = PublicKey::from(&private_key);
    (private_key, public_key)
}

/// Perform X25519 ECDH key exchange, returning the 32-byte shared secret.
pub fn x25519_ecdh(private_key: &StaticSecret, public_key: &PublicKey) -> [u8; 32] {
    private_key.diffie_hellman(public_key).to_bytes()
}

/// Public key material published for an address.
///
/// Text form is 128 hex characters: the X25519 encryption key followed by
/// the Ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerPublicKey {
    encryption: [u8; PUBLIC_KEY_SIZE],
    verifying: [u8; PUBLIC_KEY_SIZE],
}

impl PeerPublicKey {
    /// Builds a key bundle, rejecting a verifying key that is not a valid curve point.
    pub fn new(encryption: [u8; 32], verifying: [u8; 32]) -> Result<Self> {
        VerifyingKey::from_bytes(&verifying)
            .map_err(|e| ChatError::InvalidPublicKey(format!("Invalid Ed25519 key: {}", e)))?;
        Ok(Self {
            encryption,
            verifying,
        })
    }

    /// The X25519 key messages are encrypted to.
    pub fn encryption_key(&self) -> PublicKey {
        PublicKey::from(self.encryption)
    }

    /// The Ed25519 key signatures are checked against.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.verifying)
            .map_err(|e| ChatError::InvalidPublicKey(format!("Invalid Ed25519 key: {}", e)))
    }

    pub fn encryption_bytes(&self) -> &[u8; 32] {
        &self.encryption
    }

    pub fn verifying_bytes(&self) -> &[u8; 32] {
        &self.verifying
    }

    pub fn to_hex(&self) -> String {
        let mut out = hex::encode(self.encryption);
        out.push_str(&hex::encode(self.verifying));
        out
    }

    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| ChatError::InvalidPublicKey(format!("Not hex: {}", e)))?;
        if bytes.len() != 2 * PUBLIC_KEY_SIZE {
            return Err(ChatError::InvalidPublicKey(format!(
                "Expected {} bytes, got {}",
                2 * PUBLIC_KEY_SIZE,
                bytes.len()
            )));
        }

        let mut encryption = [0u8; 32];
        encryption.copy_from_slice(&bytes[..PUBLIC_KEY_SIZE]);
        let mut verifying = [0u8; 32];
        verifying.copy_from_slice(&bytes[PUBLIC_KEY_SIZE..]);
        Self::new(encryption, verifying)
    }
}

impl fmt::Debug for PeerPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerPublicKey").field(&self.to_hex()).finish()
    }
}

impl Serialize for PeerPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        PeerPublicKey::from_hex(&text).map_err(de::Error::custom)
    }
}

/// The local participant: address plus the keys derived from its seed.
///
/// The Ed25519 signing key is the seed itself; the X25519 key comes from
/// [`derive_keys_from_seed`].
pub struct LocalIdentity {
    address: Address,
    signing_key: SigningKey,
    encryption_private_key: StaticSecret,
    encryption_public_key: PublicKey,
}

impl LocalIdentity {
    /// Creates the local identity from a 32-byte seed.
    pub fn from_seed(address: Address, seed: &[u8]) -> Result<Self> {
        let (encryption_private_key, encryption_public_key) = derive_keys_from_seed(seed)?;

        let mut seed_bytes = [0u8; 32];
        seed_bytes.copy_from_slice(seed);
        let signing_key = SigningKey::from_bytes(&seed_bytes);

        Ok(Self {
            address,
            signing_key,
            encryption_private_key,
            encryption_public_key,
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The key bundle other parties resolve for this address.
    pub fn public_key(&self) -> PeerPublicKey {
        PeerPublicKey {
            encryption: *self.encryption_public_key.as_bytes(),
            verifying: self.signing_key.verifying_key().to_bytes(),
        }
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub(crate) fn encryption_private_key(&self) -> &StaticSecret {
        &self.encryption_private_key
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("address", &self.address)
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}
