//! Encryption and decryption for PeerChat messages.
//!
//! Every message gets a fresh ephemeral X25519 key. The blob is
//! `ephemeral public key (32) || nonce (12) || ciphertext + tag`, base64
//! encoded for transport as text.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::keys::{generate_ephemeral_keypair, x25519_ecdh};
use crate::types::{
    ChatError, Result, MAX_PAYLOAD_SIZE, MESSAGE_KEY_SALT, MIN_BLOB_SIZE, NONCE_SIZE,
    PUBLIC_KEY_SIZE,
};

/// Encrypt a message for a recipient.
///
/// # Arguments
/// * `plaintext` - Message to encrypt
/// * `recipient_public_key` - Recipient's long-term X25519 public key
///
/// # Returns
/// Base64 ciphertext blob
pub fn encrypt(plaintext: &str, recipient_public_key: &PublicKey) -> Result<String> {
    let message_bytes = plaintext.as_bytes();

    if message_bytes.len() > MAX_PAYLOAD_SIZE {
        return Err(ChatError::MessageTooLarge(message_bytes.len()));
    }

    // Generate ephemeral key pair for this message
    let (ephemeral_private, ephemeral_public) = generate_ephemeral_keypair();
    let shared_secret = x25519_ecdh(&ephemeral_private, recipient_public_key);
    let symmetric_key = derive_message_key(
        &shared_secret,
        ephemeral_public.as_bytes(),
        recipient_public_key.as_bytes(),
    )?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = ChaCha20Poly1305::new_from_slice(&symmetric_key)
        .map_err(|e| ChatError::CryptoFailure(format!("Cipher init failed: {}", e)))?;
    let ciphertext = cipher
        .encrypt(nonce, message_bytes)
        .map_err(|e| ChatError::CryptoFailure(format!("Encryption failed: {}", e)))?;

    let mut blob = Vec::with_capacity(PUBLIC_KEY_SIZE + NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(ephemeral_public.as_bytes());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);

    Ok(STANDARD.encode(blob))
}

/// Decrypt a blob produced by [`encrypt`] with the local private key.
///
/// Any malformed input or authentication failure is a
/// [`ChatError::CryptoFailure`]; nothing is returned partially.
pub fn decrypt(blob: &str, local_private_key: &StaticSecret) -> Result<String> {
    let data = STANDARD
        .decode(blob.trim())
        .map_err(|e| ChatError::CryptoFailure(format!("Invalid base64: {}", e)))?;

    if data.len() < MIN_BLOB_SIZE {
        return Err(ChatError::CryptoFailure(format!(
            "Blob too short: {} bytes (minimum {})",
            data.len(),
            MIN_BLOB_SIZE
        )));
    }

    let mut ephemeral_bytes = [0u8; PUBLIC_KEY_SIZE];
    ephemeral_bytes.copy_from_slice(&data[..PUBLIC_KEY_SIZE]);
    let nonce_bytes = &data[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NONCE_SIZE];
    let ciphertext = &data[PUBLIC_KEY_SIZE + NONCE_SIZE..];

    let ephemeral_public = PublicKey::from(ephemeral_bytes);
    let local_public = PublicKey::from(local_private_key);

    let shared_secret = x25519_ecdh(local_private_key, &ephemeral_public);
    // Low-order points collapse the shared secret to zero.
    if shared_secret.iter().all(|b| *b == 0) {
        return Err(ChatError::CryptoFailure(
            "Malformed ephemeral public key".to_string(),
        ));
    }

    let symmetric_key =
        derive_message_key(&shared_secret, &ephemeral_bytes, local_public.as_bytes())?;

    let cipher = ChaCha20Poly1305::new_from_slice(&symmetric_key)
        .map_err(|e| ChatError::CryptoFailure(format!("Cipher init failed: {}", e)))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| ChatError::CryptoFailure(format!("Decryption failed: {}", e)))?;

    String::from_utf8(plaintext)
        .map_err(|e| ChatError::CryptoFailure(format!("Invalid UTF-8: {}", e)))
}

fn derive_message_key(
    shared_secret: &[u8; 32],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> Result<[u8; 32]> {
    // Info: ephemeral pubkey + recipient pubkey
    let mut info = Vec::with_capacity(2 * PUBLIC_KEY_SIZE);
    info.extend_from_slice(ephemeral_public);
    info.extend_from_slice(recipient_public);

    let hkdf = Hkdf::<Sha256>::new(Some(MESSAGE_KEY_SALT), shared_secret);
    let mut symmetric_key = [0u8; 32];
    hkdf.expand(&info, &mut symmetric_key)
        .map_err(|e| ChatError::CryptoFailure(format!("HKDF expand failed: {}", e)))?;
    Ok(symmetric_key)
}
