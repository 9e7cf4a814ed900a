//! Data models for PeerChat.
//!
//! This module defines the core types for addresses, messages, conversations
//! and contacts used throughout the library.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::keys::PeerPublicKey;
use crate::types::{ChatError, Result, SIGNATURE_SIZE};

/// A participant's blockchain address.
///
/// Opaque to this crate: the only requirement is a non-empty string
/// without whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Result<Self> {
        let address = address.into();
        if address.is_empty() || address.chars().any(char::is_whitespace) {
            return Err(ChatError::InvalidAddress(address));
        }
        Ok(Self(address))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Address {
    type Error = ChatError;

    fn try_from(value: String) -> Result<Self> {
        Address::new(value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl std::str::FromStr for Address {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self> {
        Address::new(s)
    }
}

/// Channel a message travelled over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Direct connection on the local network.
    #[serde(rename = "p2p")]
    P2p,
    /// Fallback delivery through the blockchain relay.
    #[serde(rename = "blockchain-relay")]
    BlockchainRelay,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::P2p => "p2p",
            TransportKind::BlockchainRelay => "blockchain-relay",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a message relative to the current user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageDirection {
    /// Message was sent by the current user.
    Sent,
    /// Message was received by the current user.
    Received,
}

/// A chat message between two addresses.
///
/// `content` and `direction` are local only and never leave the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Unique identifier.
    pub id: String,
    /// Sender's address.
    pub sender: Address,
    /// Recipient's address.
    pub recipient: Address,
    /// Base64 ciphertext blob as produced by [`crate::crypto::encrypt`].
    pub ciphertext: String,
    /// Creation time, whole seconds.
    pub timestamp: SystemTime,
    /// Channel the message travelled over.
    pub transport: TransportKind,
    /// Decrypted text.
    pub content: String,
    /// Message direction relative to the current user.
    pub direction: MessageDirection,
    signature: Option<[u8; SIGNATURE_SIZE]>,
}

impl Message {
    /// Creates a new message.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        sender: Address,
        recipient: Address,
        ciphertext: impl Into<String>,
        timestamp: SystemTime,
        transport: TransportKind,
        content: impl Into<String>,
        direction: MessageDirection,
    ) -> Self {
        Self {
            id: id.into(),
            sender,
            recipient,
            ciphertext: ciphertext.into(),
            timestamp: truncate_to_secs(timestamp),
            transport,
            content: content.into(),
            direction,
            signature: None,
        }
    }

    /// Creates an unsigned outgoing message with a fresh id, stamped now.
    pub fn outgoing(
        sender: Address,
        recipient: Address,
        ciphertext: impl Into<String>,
        content: impl Into<String>,
        transport: TransportKind,
    ) -> Self {
        Self::new(
            uuid_v4(),
            sender,
            recipient,
            ciphertext,
            SystemTime::now(),
            transport,
            content,
            MessageDirection::Sent,
        )
    }

    /// Attaches the signature. Fails if one is already present.
    pub fn attach_signature(&mut self, signature: [u8; SIGNATURE_SIZE]) -> Result<()> {
        if self.signature.is_some() {
            return Err(ChatError::SignatureAlreadySet(self.id.clone()));
        }
        self.signature = Some(signature);
        Ok(())
    }

    pub fn signature(&self) -> Option<&[u8; SIGNATURE_SIZE]> {
        self.signature.as_ref()
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Returns the Unix timestamp in seconds.
    pub fn unix_timestamp(&self) -> u64 {
        unix_secs(self.timestamp)
    }

    /// The other party, seen from the local user.
    pub fn peer(&self) -> &Address {
        match self.direction {
            MessageDirection::Sent => &self.recipient,
            MessageDirection::Received => &self.sender,
        }
    }
}

/// A conversation with one peer address.
///
/// Messages are kept in append order. Summary fields are always computed
/// from the sequence.
#[derive(Debug, Clone)]
pub struct Conversation {
    /// The other party's address.
    pub peer: Address,
    messages: Vec<Message>,
}

impl Conversation {
    /// Creates a new, empty conversation.
    pub fn new(peer: Address) -> Self {
        Self {
            peer,
            messages: Vec::new(),
        }
    }

    /// Returns all messages in the conversation.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Returns the most recently appended message.
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Timestamp of the most recently appended message.
    pub fn last_message_time(&self) -> Option<SystemTime> {
        self.last_message().map(|m| m.timestamp)
    }

    /// Returns the number of messages.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Whether the conversation has any messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    /// Appends a message at the end, regardless of its timestamp.
    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn summary(&self) -> ConversationSummary {
        let last = self.last_message();
        ConversationSummary {
            peer: self.peer.clone(),
            last_message: last.map(|m| m.content.clone()),
            last_message_time: last.map(|m| m.timestamp),
            message_count: self.messages.len(),
        }
    }
}

/// Derived view of a conversation for list displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub peer: Address,
    pub last_message: Option<String>,
    pub last_message_time: Option<SystemTime>,
    pub message_count: usize,
}

/// A saved contact. Immutable once added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub address: Address,
    pub display_name: String,
    pub public_key: PeerPublicKey,
}

impl Contact {
    /// Creates a contact. A blank display name falls back to the address.
    pub fn new(address: Address, display_name: &str, public_key: PeerPublicKey) -> Self {
        let display_name = match display_name.trim() {
            "" => address.to_string(),
            name => name.to_string(),
        };
        Self {
            address,
            display_name,
            public_key,
        }
    }
}

pub(crate) fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

pub(crate) fn from_unix_secs(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn truncate_to_secs(time: SystemTime) -> SystemTime {
    from_unix_secs(unix_secs(time))
}

/// Generate a simple UUID v4 (for message IDs).
fn uuid_v4() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();

    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        u16::from_be_bytes([bytes[4], bytes[5]]),
        (u16::from_be_bytes([bytes[6], bytes[7]]) & 0x0fff) | 0x4000,
        (u16::from_be_bytes([bytes[8], bytes[9]]) & 0x3fff) | 0x8000,
        u64::from_be_bytes([
            0, 0, bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
        ])
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    fn message(id: &str, secs: u64, direction: MessageDirection) -> Message {
        Message::new(
            id,
            addr("TLS_A"),
            addr("TLS_B"),
            "blob",
            from_unix_secs(secs),
            TransportKind::P2p,
            format!("text {}", id),
            direction,
        )
    }

    #[test]
    fn test_address_validation() {
        assert!(Address::new("TLS_A").is_ok());
        assert!(matches!(Address::new(""), Err(ChatError::InvalidAddress(_))));
        assert!(matches!(Address::new("TLS A"), Err(ChatError::InvalidAddress(_))));
    }

    #[test]
    fn test_address_serde() {
        let json = serde_json::to_string(&addr("TLS_A")).unwrap();
        assert_eq!(json, "\"TLS_A\"");
        assert!(serde_json::from_str::<Address>("\"\"").is_err());
    }

    #[test]
    fn test_transport_kind_labels() {
        assert_eq!(serde_json::to_string(&TransportKind::P2p).unwrap(), "\"p2p\"");
        assert_eq!(
            serde_json::to_string(&TransportKind::BlockchainRelay).unwrap(),
            "\"blockchain-relay\""
        );
    }

    #[test]
    fn test_signature_attached_once() {
        let mut msg = message("m1", 10, MessageDirection::Sent);
        assert!(!msg.is_signed());

        msg.attach_signature([1u8; 64]).unwrap();
        let again = msg.attach_signature([2u8; 64]);
        assert!(matches!(again, Err(ChatError::SignatureAlreadySet(_))));
        assert_eq!(msg.signature(), Some(&[1u8; 64]));
    }

    #[test]
    fn test_conversation_keeps_append_order() {
        let mut conv = Conversation::new(addr("TLS_B"));
        assert!(conv.is_empty());

        conv.append(message("late", 300, MessageDirection::Received));
        conv.append(message("early", 100, MessageDirection::Sent));

        let ids: Vec<_> = conv.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["late", "early"]);

        let summary = conv.summary();
        assert_eq!(summary.last_message.as_deref(), Some("text early"));
        assert_eq!(summary.last_message_time, Some(from_unix_secs(100)));
        assert_eq!(conv.message_count(), 2);
    }

    #[test]
    fn test_timestamp_truncated() {
        let msg = Message::outgoing(addr("TLS_A"), addr("TLS_B"), "blob", "hi", TransportKind::P2p);
        assert_eq!(msg.timestamp, from_unix_secs(msg.unix_timestamp()));
        assert_eq!(msg.peer(), &addr("TLS_B"));
    }

    #[test]
    fn test_uuid_generation() {
        let id1 = uuid_v4();
        let id2 = uuid_v4();
        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 36);
    }
}
