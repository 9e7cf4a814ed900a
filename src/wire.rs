//! Wire format for PeerChat.
//!
//! A [`WireMessage`] is a JSON document with stable field names. Receivers
//! ignore fields they do not know. Direct connections carry [`Frame`]s, one
//! JSON document per line, tagged by `type`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::keys::LocalIdentity;
use crate::models::{unix_secs, Address, Message, MessageDirection, TransportKind};
use crate::signature::{hello_payload, sign, verify};
use crate::types::{ChatError, Result, SIGNATURE_SIZE};
use ed25519_dalek::VerifyingKey;

/// A signed, encrypted message as it travels between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: String,
    pub sender: Address,
    pub recipient: Address,
    /// Base64 ciphertext blob.
    pub ciphertext: String,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    pub transport: TransportKind,
    /// Hex Ed25519 signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl WireMessage {
    /// Builds the wire form of a signed outgoing message.
    pub fn from_message(message: &Message) -> Result<Self> {
        let signature = message
            .signature()
            .ok_or_else(|| ChatError::SignatureInvalid(format!("Message {} is unsigned", message.id)))?;

        Ok(Self {
            id: message.id.clone(),
            sender: message.sender.clone(),
            recipient: message.recipient.clone(),
            ciphertext: message.ciphertext.clone(),
            timestamp: message.unix_timestamp(),
            transport: message.transport,
            signature: Some(hex::encode(signature)),
        })
    }

    /// Rebuilds a received message, still without decrypted content.
    pub fn to_message(&self) -> Result<Message> {
        let timestamp = UNIX_EPOCH
            .checked_add(Duration::from_secs(self.timestamp))
            .ok_or_else(|| {
                ChatError::MalformedWireMessage(format!("Timestamp {} out of range", self.timestamp))
            })?;
        let mut message = Message::new(
            self.id.clone(),
            self.sender.clone(),
            self.recipient.clone(),
            self.ciphertext.clone(),
            timestamp,
            self.transport,
            String::new(),
            MessageDirection::Received,
        );

        if let Some(signature) = &self.signature {
            message.attach_signature(decode_signature(signature)?)?;
        }
        Ok(message)
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ChatError::MalformedWireMessage(e.to_string()))
    }

    pub fn decode(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(|e| ChatError::MalformedWireMessage(e.to_string()))
    }
}

/// Signed claim that a direct connection belongs to an address.
///
/// The proof answers the challenge the other side issued for that one
/// connection, so it cannot be replayed on another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceProof {
    pub address: Address,
    pub challenge: String,
    pub timestamp: u64,
    pub signature: String,
}

impl PresenceProof {
    pub fn create(identity: &LocalIdentity, challenge: &str) -> Self {
        let timestamp = unix_secs(SystemTime::now());
        let payload = hello_payload(identity.address(), challenge, timestamp);
        Self {
            address: identity.address().clone(),
            challenge: challenge.to_string(),
            timestamp,
            signature: hex::encode(sign(&payload, identity.signing_key())),
        }
    }

    pub fn verify(&self, verifying_key: &VerifyingKey) -> Result<bool> {
        let signature = decode_signature(&self.signature)?;
        verify(
            &hello_payload(&self.address, &self.challenge, self.timestamp),
            &signature,
            verifying_key,
        )
    }
}

/// One line on a direct connection.
///
/// Each side opens with a `challenge`; the other answers it with a `hello`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Challenge { nonce: String },
    Hello(PresenceProof),
    Message(WireMessage),
}

impl Frame {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ChatError::MalformedWireMessage(e.to_string()))
    }

    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim()).map_err(|e| ChatError::MalformedWireMessage(e.to_string()))
    }
}

fn decode_signature(text: &str) -> Result<[u8; SIGNATURE_SIZE]> {
    let bytes = hex::decode(text)
        .map_err(|e| ChatError::MalformedWireMessage(format!("Signature is not hex: {}", e)))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        ChatError::MalformedWireMessage(format!(
            "Signature must be {} bytes, got {}",
            SIGNATURE_SIZE,
            b.len()
        ))
    })
}
