//! Type definitions and protocol constants for PeerChat.

use thiserror::Error;

/// Size of an X25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of the AEAD nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of the AEAD authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Smallest decoded ciphertext blob: ephemeral key, nonce and an empty sealed box.
pub const MIN_BLOB_SIZE: usize = PUBLIC_KEY_SIZE + NONCE_SIZE + TAG_SIZE;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Maximum plaintext size in bytes.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// HKDF salt for per-message encryption keys.
pub const MESSAGE_KEY_SALT: &[u8] = b"PeerChat-v1-message";

/// HKDF salt for deriving the X25519 identity key from a seed.
pub const IDENTITY_KEY_SALT: &[u8] = b"PeerChat-v1-identity";

/// HKDF info for deriving the X25519 identity key from a seed.
pub const IDENTITY_KEY_INFO: &[u8] = b"x25519-key";

/// Separator placed between canonical signature fields.
pub const FIELD_SEPARATOR: u8 = 0x1f;

/// Domain tag of connection presence proofs.
pub const HELLO_DOMAIN: &[u8] = b"peerchat-hello";

/// Size of the random challenge issued on each direct connection.
pub const CHALLENGE_SIZE: usize = 16;

/// Service identifier advertised on the local network.
pub const SERVICE_ID: &str = "_peerchat._tcp";

/// Errors that can occur during PeerChat operations.
#[derive(Error, Debug)]
pub enum ChatError {
    // Addressing
    /// Address string is not usable as an identity.
    #[error("Invalid address: {0:?}")]
    InvalidAddress(String),

    /// The identity service does not know the address.
    #[error("Address not found: {0}")]
    AddressNotFound(String),

    /// No public key could be resolved for the recipient.
    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),

    /// A contact with this address already exists.
    #[error("Contact already exists: {0}")]
    ContactExists(String),

    // Keys
    /// The key store holds no local private key.
    #[error("Local private key is absent")]
    PrivateKeyAbsent,

    /// Invalid seed length.
    #[error("Invalid seed length: expected 32 bytes, got {0}")]
    InvalidSeedLength(usize),

    /// Invalid public key format.
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    // Crypto
    /// Message too large.
    #[error("Message too large: {0} bytes (max {MAX_PAYLOAD_SIZE})")]
    MessageTooLarge(usize),

    /// Key agreement or AEAD failure.
    #[error("Crypto failure: {0}")]
    CryptoFailure(String),

    /// Missing or invalid signature.
    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),

    /// A signature may be attached only once.
    #[error("Message {0} is already signed")]
    SignatureAlreadySet(String),

    // Wire
    /// Inbound bytes could not be parsed.
    #[error("Malformed wire message: {0}")]
    MalformedWireMessage(String),

    /// Inbound message addressed to someone else.
    #[error("Message for {recipient} delivered to {local}")]
    MisdirectedMessage { recipient: String, local: String },

    // Transport
    /// No live connection and the relay failed.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A direct send was attempted and failed.
    #[error("Peer send failed: {0}")]
    PeerSendFailed(String),

    /// A connection already proven to belong to one address was claimed
    /// by another.
    #[error("Connection bound to {bound} claimed by {claimed}")]
    ConnectionAlreadyBound { bound: String, claimed: String },

    /// Illegal lifecycle transition.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    /// An external call did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Socket level failure.
    #[error("Network error: {0}")]
    Network(String),

    // Storage
    /// Storage operation failed.
    #[error("Storage failed: {0}")]
    StorageFailed(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;

impl From<std::io::Error> for ChatError {
    fn from(e: std::io::Error) -> Self {
        ChatError::Network(e.to_string())
    }
}
