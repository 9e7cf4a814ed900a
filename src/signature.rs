//! Message signing and verification.
//!
//! The signed payload binds sender, recipient, ciphertext blob and timestamp.
//! It never includes the plaintext, so anyone holding the sender's public key
//! can check authenticity without being able to decrypt.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::models::{Address, Message};
use crate::types::{ChatError, Result, FIELD_SEPARATOR, HELLO_DOMAIN, SIGNATURE_SIZE};

/// Builds the canonical payload for a chat message.
///
/// Layout: `sender 0x1f recipient 0x1f ciphertext 0x1f timestamp`, with the
/// timestamp in decimal seconds since the Unix epoch.
pub fn canonical_payload(
    sender: &Address,
    recipient: &Address,
    ciphertext: &str,
    timestamp_secs: u64,
) -> Vec<u8> {
    join_fields(&[
        sender.as_str().as_bytes(),
        recipient.as_str().as_bytes(),
        ciphertext.as_bytes(),
        timestamp_secs.to_string().as_bytes(),
    ])
}

/// Builds the canonical payload for a connection presence proof.
///
/// Layout: `domain 0x1f address 0x1f challenge 0x1f timestamp`.
pub fn hello_payload(address: &Address, challenge: &str, timestamp_secs: u64) -> Vec<u8> {
    join_fields(&[
        HELLO_DOMAIN,
        address.as_str().as_bytes(),
        challenge.as_bytes(),
        timestamp_secs.to_string().as_bytes(),
    ])
}

fn join_fields(fields: &[&[u8]]) -> Vec<u8> {
    let len = fields.iter().map(|f| f.len() + 1).sum();
    let mut out = Vec::with_capacity(len);
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(FIELD_SEPARATOR);
        }
        out.extend_from_slice(field);
    }
    out
}

/// Signs a canonical payload.
pub fn sign(payload: &[u8], signing_key: &SigningKey) -> [u8; SIGNATURE_SIZE] {
    signing_key.sign(payload).to_bytes()
}

/// Signs a message's canonical fields and attaches the signature.
pub fn sign_message(message: &mut Message, signing_key: &SigningKey) -> Result<()> {
    let payload = canonical_payload(
        &message.sender,
        &message.recipient,
        &message.ciphertext,
        message.unix_timestamp(),
    );
    message.attach_signature(sign(&payload, signing_key))
}

/// Verifies a signature over a canonical payload.
///
/// # Returns
/// `true` if the signature is valid
pub fn verify(payload: &[u8], signature: &[u8], verifying_key: &VerifyingKey) -> Result<bool> {
    let signature_bytes: [u8; SIGNATURE_SIZE] = signature.try_into().map_err(|_| {
        ChatError::SignatureInvalid(format!(
            "Signature must be {} bytes, got {}",
            SIGNATURE_SIZE,
            signature.len()
        ))
    })?;

    let signature = Signature::from_bytes(&signature_bytes);
    Ok(verifying_key.verify(payload, &signature).is_ok())
}

/// Verifies a message against the sender's key.
///
/// An unsigned message is never valid.
pub fn verify_message(message: &Message, verifying_key: &VerifyingKey) -> bool {
    let Some(signature) = message.signature() else {
        return false;
    };
    let payload = canonical_payload(
        &message.sender,
        &message.recipient,
        &message.ciphertext,
        message.unix_timestamp(),
    );
    verify(&payload, signature, verifying_key).unwrap_or(false)
}

/// Generates a human-readable fingerprint for a public key.
///
/// # Returns
/// A fingerprint string like "A7B3 C9D1 E5F2 8A4B"
pub fn fingerprint(public_key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    let hash = hasher.finalize();

    hash.iter()
        .take(8)
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .chunks(2)
        .map(|chunk| chunk.join(""))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageDirection, TransportKind};
    use crate::models::from_unix_secs;
    use rand::rngs::OsRng;

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    fn message(blob: &str, secs: u64) -> Message {
        Message::new(
            "m1",
            addr("TLS_A"),
            addr("TLS_B"),
            blob,
            from_unix_secs(secs),
            TransportKind::P2p,
            "",
            MessageDirection::Sent,
        )
    }

    #[test]
    fn test_sign_and_verify() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let mut msg = message("blobX", 1_700_000_000);

        sign_message(&mut msg, &signing_key).unwrap();
        assert!(verify_message(&msg, &signing_key.verifying_key()));
    }

    #[test]
    fn test_signature_bound_to_timestamp() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let payload = canonical_payload(&addr("TLS_A"), &addr("TLS_B"), "blobX", 100);
        let signature = sign(&payload, &signing_key);

        let shifted = canonical_payload(&addr("TLS_A"), &addr("TLS_B"), "blobX", 101);
        assert!(!verify(&shifted, &signature, &signing_key.verifying_key()).unwrap());
    }

    #[test]
    fn test_signature_bound_to_ciphertext() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let mut signed = message("blobX", 100);
        sign_message(&mut signed, &signing_key).unwrap();

        let mut forged = message("blobY", 100);
        forged.attach_signature(*signed.signature().unwrap()).unwrap();
        assert!(!verify_message(&forged, &signing_key.verifying_key()));
    }

    #[test]
    fn test_verify_wrong_key() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let wrong_key = SigningKey::generate(&mut OsRng).verifying_key();

        let mut msg = message("blobX", 100);
        sign_message(&mut msg, &signing_key).unwrap();
        assert!(!verify_message(&msg, &wrong_key));
    }

    #[test]
    fn test_unsigned_message_rejected() {
        let key = SigningKey::generate(&mut OsRng).verifying_key();
        assert!(!verify_message(&message("blobX", 100), &key));
    }

    #[test]
    fn test_field_boundaries_unambiguous() {
        let a = canonical_payload(&addr("TLS_A"), &addr("BTLS_B"), "x", 1);
        let b = canonical_payload(&addr("TLS_AB"), &addr("TLS_B"), "x", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_signature_length() {
        let key = SigningKey::generate(&mut OsRng).verifying_key();
        let result = verify(b"payload", &[0u8; 32], &key);
        assert!(matches!(result, Err(ChatError::SignatureInvalid(_))));
    }

    #[test]
    fn test_fingerprint() {
        let fp = fingerprint(&[0u8; 32]);
        assert_eq!(fp.len(), 19); // "XXXX XXXX XXXX XXXX"
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() || c == ' '));
    }
}
